use director_state::StateStore;
use tracing::info;

pub fn prune_archives(store: &StateStore, instance_id: u64, dry_run: bool) -> anyhow::Result<()> {
    let archives = if dry_run {
        store.stale_rendered_templates_archives(instance_id)?
    } else {
        store.prune_stale_rendered_templates_archives(instance_id)?
    };

    for archive in &archives {
        println!("{}  {}  {}", archive.id, archive.blobstore_id, archive.created_at);
    }
    info!(instance_id, count = archives.len(), dry_run, "stale rendered templates archives");
    Ok(())
}
