//! director-state — persisted instance records for the Director.
//!
//! Backed by [redb](https://docs.rs/redb), stores deployments, VMs,
//! instances, persistent disks and rendered templates archives, and keeps
//! the instance invariants (unique job/index slot per deployment, unique
//! VM assignment) inside the same write transaction that commits a record.
//!
//! # Architecture
//!
//! Records are JSON-serialized into `u64`-keyed tables. Secondary tables
//! hold the unique slot and VM indexes and the `(instance_id, child_id)`
//! ownership links used to scan an instance's disks and archives.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across threads.

pub mod error;
pub mod instance;
pub mod store;
pub mod tables;
pub mod types;
pub mod validation;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
pub use validation::{InstanceIndex, ValidationError, ValidationErrors, ValidationRule};
