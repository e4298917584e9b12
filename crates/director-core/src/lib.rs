pub mod config;
pub mod digest;

pub use config::DirectorConfig;
pub use digest::content_sha;
