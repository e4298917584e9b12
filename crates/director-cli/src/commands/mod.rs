pub mod instances;
pub mod prune;
pub mod show;

use director_core::DirectorConfig;
use director_state::StateStore;
use tracing::warn;

pub fn open_store(config: &DirectorConfig) -> anyhow::Result<StateStore> {
    match &config.store.path {
        Some(path) => Ok(StateStore::open(path)?),
        None => {
            warn!("no store path configured, using an empty in-memory store");
            Ok(StateStore::open_in_memory()?)
        }
    }
}
