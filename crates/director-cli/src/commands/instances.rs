use anyhow::Context;
use director_state::StateStore;

pub fn list(store: &StateStore, deployment: &str) -> anyhow::Result<()> {
    let deployment = store
        .find_deployment_by_name(deployment)?
        .with_context(|| format!("deployment {deployment} not found"))?;

    for instance in store.list_instances_for_deployment(deployment.id)? {
        let disk = store.persistent_disk_cid(instance.id)?;
        println!(
            "{:>6}  {}/{}  {:<8}  vm={}  disk={}",
            instance.id,
            instance.job,
            instance.index,
            instance.state,
            instance.vm_id.map_or_else(|| "-".to_string(), |id| id.to_string()),
            disk.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}
