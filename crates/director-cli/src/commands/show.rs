use anyhow::Context;
use director_state::{Instance, RenderedTemplatesArchive, StateStore};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct InstanceReport {
    pub instance: Instance,
    pub persistent_disk_cid: Option<String>,
    pub latest_rendered_templates_archive: Option<RenderedTemplatesArchive>,
    pub stale_rendered_templates_archives: usize,
}

pub fn report(store: &StateStore, instance_id: u64) -> anyhow::Result<InstanceReport> {
    let instance = store
        .get_instance(instance_id)?
        .with_context(|| format!("instance {instance_id} not found"))?;
    Ok(InstanceReport {
        persistent_disk_cid: store.persistent_disk_cid(instance.id)?,
        latest_rendered_templates_archive: store.latest_rendered_templates_archive(instance.id)?,
        stale_rendered_templates_archives: store.stale_rendered_templates_archives(instance.id)?.len(),
        instance,
    })
}

pub fn show(store: &StateStore, instance_id: u64) -> anyhow::Result<()> {
    let report = report(store, instance_id)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
