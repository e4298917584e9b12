//! StateStore — redb-backed persistence for Director records.
//!
//! Provides typed operations over deployments, VMs, instances, persistent
//! disks and rendered templates archives. Instance validation and the
//! uniqueness checks it performs run inside the write transaction that
//! commits the record; redb admits one writer at a time, so two callers can
//! never both pass validation for the same slot or VM.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadTransaction, ReadableDatabase, ReadableTable, Table, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;
use crate::validation::{InstanceIndex, ValidationErrors, ValidationRule};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        self.write(|txn| {
            // Opening a table in a write transaction creates it if absent.
            txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
            txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            txn.open_table(DEPLOYMENT_NAMES).map_err(map_err!(Table))?;
            txn.open_table(VMS).map_err(map_err!(Table))?;
            txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            txn.open_table(INSTANCE_SLOTS).map_err(map_err!(Table))?;
            txn.open_table(INSTANCE_VMS).map_err(map_err!(Table))?;
            txn.open_table(PERSISTENT_DISKS).map_err(map_err!(Table))?;
            txn.open_table(INSTANCE_DISKS).map_err(map_err!(Table))?;
            txn.open_table(RENDERED_TEMPLATES_ARCHIVES).map_err(map_err!(Table))?;
            txn.open_table(INSTANCE_ARCHIVES).map_err(map_err!(Table))?;
            Ok(())
        })
    }

    /// Run `f` in a write transaction, committing on success and aborting
    /// on error.
    fn write<T>(&self, f: impl FnOnce(&WriteTransaction) -> StateResult<T>) -> StateResult<T> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        match f(&txn) {
            Ok(value) => {
                txn.commit().map_err(map_err!(Transaction))?;
                Ok(value)
            }
            Err(e) => {
                txn.abort().map_err(map_err!(Transaction))?;
                Err(e)
            }
        }
    }

    fn read<T>(&self, f: impl FnOnce(&ReadTransaction) -> StateResult<T>) -> StateResult<T> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        f(&txn)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Create a deployment. Names are unique.
    pub fn create_deployment(&self, name: &str, manifest: Option<&str>) -> StateResult<Deployment> {
        let deployment = self.write(|txn| {
            let mut names = txn.open_table(DEPLOYMENT_NAMES).map_err(map_err!(Table))?;
            if names.get(name).map_err(map_err!(Read))?.is_some() {
                return Err(ValidationErrors::single(
                    "name",
                    ValidationRule::UniquenessViolation,
                    format!("deployment {name} already exists"),
                )
                .into());
            }
            let deployment = Deployment {
                id: next_id(txn, "deployments")?,
                name: name.to_string(),
                manifest: manifest.map(str::to_string),
            };
            names.insert(name, deployment.id).map_err(map_err!(Write))?;
            let mut deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            put_json(&mut deployments, deployment.id, &deployment)?;
            Ok(deployment)
        })?;
        debug!(id = deployment.id, name, "deployment stored");
        Ok(deployment)
    }

    pub fn get_deployment(&self, id: RecordId) -> StateResult<Option<Deployment>> {
        self.read(|txn| {
            let deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            get_json(&deployments, id)
        })
    }

    pub fn find_deployment_by_name(&self, name: &str) -> StateResult<Option<Deployment>> {
        self.read(|txn| {
            let names = txn.open_table(DEPLOYMENT_NAMES).map_err(map_err!(Table))?;
            let Some(id) = names.get(name).map_err(map_err!(Read))?.map(|g| g.value()) else {
                return Ok(None);
            };
            let deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            get_json(&deployments, id)
        })
    }

    /// List all deployments, ordered by id.
    pub fn list_deployments(&self) -> StateResult<Vec<Deployment>> {
        self.read(|txn| {
            let deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let mut results = Vec::new();
            for entry in deployments.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let deployment: Deployment =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(deployment);
            }
            Ok(results)
        })
    }

    // ── VMs ────────────────────────────────────────────────────────

    pub fn create_vm(&self, deployment_id: RecordId, agent_id: &str, cid: Option<&str>) -> StateResult<Vm> {
        let vm = self.write(|txn| {
            let deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            if deployments.get(deployment_id).map_err(map_err!(Read))?.is_none() {
                return Err(StateError::MissingReference(format!("deployment {deployment_id}")));
            }
            let vm = Vm {
                id: next_id(txn, "vms")?,
                deployment_id,
                agent_id: agent_id.to_string(),
                cid: cid.map(str::to_string),
            };
            let mut vms = txn.open_table(VMS).map_err(map_err!(Table))?;
            put_json(&mut vms, vm.id, &vm)?;
            Ok(vm)
        })?;
        debug!(id = vm.id, deployment_id, agent_id, "vm stored");
        Ok(vm)
    }

    pub fn get_vm(&self, id: RecordId) -> StateResult<Option<Vm>> {
        self.read(|txn| {
            let vms = txn.open_table(VMS).map_err(map_err!(Table))?;
            get_json(&vms, id)
        })
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Validate `draft` and store it as a new instance.
    pub fn create_instance(&self, draft: &InstanceDraft) -> StateResult<Instance> {
        let instance = self.write(|txn| {
            let id = next_id(txn, "instances")?;
            let mut slots = txn.open_table(INSTANCE_SLOTS).map_err(map_err!(Table))?;
            let mut vm_index = txn.open_table(INSTANCE_VMS).map_err(map_err!(Table))?;
            let instance = draft.validate(id, &TableIndex { slots: &slots, vms: &vm_index })?;
            check_references(txn, &instance)?;

            slots
                .insert(instance.slot_key().as_str(), id)
                .map_err(map_err!(Write))?;
            if let Some(vm_id) = instance.vm_id {
                vm_index.insert(vm_id, id).map_err(map_err!(Write))?;
            }
            let mut instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            put_json(&mut instances, id, &instance)?;
            Ok(instance)
        })?;
        debug!(
            id = instance.id,
            deployment_id = instance.deployment_id,
            job = %instance.job,
            index = instance.index,
            "instance stored"
        );
        Ok(instance)
    }

    /// Validate `draft` and replace the attributes of instance `id`.
    pub fn update_instance(&self, id: RecordId, draft: &InstanceDraft) -> StateResult<Instance> {
        let instance = self.write(|txn| {
            let mut instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let current: Instance = get_json(&instances, id)?
                .ok_or_else(|| StateError::NotFound(format!("instance {id}")))?;

            let mut slots = txn.open_table(INSTANCE_SLOTS).map_err(map_err!(Table))?;
            let mut vm_index = txn.open_table(INSTANCE_VMS).map_err(map_err!(Table))?;
            let updated = draft.validate(id, &TableIndex { slots: &slots, vms: &vm_index })?;
            check_references(txn, &updated)?;

            let (old_slot, new_slot) = (current.slot_key(), updated.slot_key());
            if old_slot != new_slot {
                slots.remove(old_slot.as_str()).map_err(map_err!(Write))?;
                slots.insert(new_slot.as_str(), id).map_err(map_err!(Write))?;
            }
            if current.vm_id != updated.vm_id {
                if let Some(old_vm) = current.vm_id {
                    vm_index.remove(old_vm).map_err(map_err!(Write))?;
                }
                if let Some(new_vm) = updated.vm_id {
                    vm_index.insert(new_vm, id).map_err(map_err!(Write))?;
                }
            }
            put_json(&mut instances, id, &updated)?;
            Ok(updated)
        })?;
        debug!(id, state = %instance.state, vm_id = ?instance.vm_id, "instance updated");
        Ok(instance)
    }

    /// Persist the attributes of an already stored instance.
    pub fn save_instance(&self, instance: &Instance) -> StateResult<Instance> {
        self.update_instance(instance.id, &InstanceDraft::from(instance))
    }

    pub fn get_instance(&self, id: RecordId) -> StateResult<Option<Instance>> {
        self.read(|txn| {
            let instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            get_json(&instances, id)
        })
    }

    /// The instance occupying `job`/`index` in a deployment.
    pub fn find_instance_by_slot(
        &self,
        deployment_id: RecordId,
        job: &str,
        index: u32,
    ) -> StateResult<Option<Instance>> {
        let key = slot_key(deployment_id, job, index);
        self.read(|txn| {
            let slots = txn.open_table(INSTANCE_SLOTS).map_err(map_err!(Table))?;
            let Some(id) = slots.get(key.as_str()).map_err(map_err!(Read))?.map(|g| g.value()) else {
                return Ok(None);
            };
            let instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            get_json(&instances, id)
        })
    }

    /// The instance assigned to a VM.
    pub fn find_instance_by_vm(&self, vm_id: RecordId) -> StateResult<Option<Instance>> {
        self.read(|txn| {
            let vm_index = txn.open_table(INSTANCE_VMS).map_err(map_err!(Table))?;
            let Some(id) = vm_index.get(vm_id).map_err(map_err!(Read))?.map(|g| g.value()) else {
                return Ok(None);
            };
            let instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            get_json(&instances, id)
        })
    }

    /// List all instances of a deployment, ordered by job then index.
    pub fn list_instances_for_deployment(&self, deployment_id: RecordId) -> StateResult<Vec<Instance>> {
        let prefix = format!("{deployment_id}/");
        let mut results: Vec<Instance> = self.read(|txn| {
            let slots = txn.open_table(INSTANCE_SLOTS).map_err(map_err!(Table))?;
            let instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let mut results = Vec::new();
            for entry in slots.range(prefix.as_str()..).map_err(map_err!(Read))? {
                let (key, id) = entry.map_err(map_err!(Read))?;
                if !key.value().starts_with(&prefix) {
                    break;
                }
                if let Some(instance) = get_json(&instances, id.value())? {
                    results.push(instance);
                }
            }
            Ok(results)
        })?;
        results.sort_by(|a, b| (a.job.as_str(), a.index).cmp(&(b.job.as_str(), b.index)));
        Ok(results)
    }

    /// Delete an instance together with its disks and archives, releasing
    /// its slot and VM. Returns true if it existed.
    pub fn delete_instance(&self, id: RecordId) -> StateResult<bool> {
        let existed = self.write(|txn| {
            let mut instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let Some(instance) = get_json::<Instance>(&instances, id)? else {
                return Ok(false);
            };
            instances.remove(id).map_err(map_err!(Write))?;

            let mut slots = txn.open_table(INSTANCE_SLOTS).map_err(map_err!(Table))?;
            slots.remove(instance.slot_key().as_str()).map_err(map_err!(Write))?;
            if let Some(vm_id) = instance.vm_id {
                let mut vm_index = txn.open_table(INSTANCE_VMS).map_err(map_err!(Table))?;
                vm_index.remove(vm_id).map_err(map_err!(Write))?;
            }

            let mut disk_links = txn.open_table(INSTANCE_DISKS).map_err(map_err!(Table))?;
            let mut disks = txn.open_table(PERSISTENT_DISKS).map_err(map_err!(Table))?;
            for disk_id in linked_ids(&disk_links, id)? {
                disk_links.remove((id, disk_id)).map_err(map_err!(Write))?;
                disks.remove(disk_id).map_err(map_err!(Write))?;
            }

            let mut archive_links = txn.open_table(INSTANCE_ARCHIVES).map_err(map_err!(Table))?;
            let mut archives = txn.open_table(RENDERED_TEMPLATES_ARCHIVES).map_err(map_err!(Table))?;
            for archive_id in linked_ids(&archive_links, id)? {
                archive_links.remove((id, archive_id)).map_err(map_err!(Write))?;
                archives.remove(archive_id).map_err(map_err!(Write))?;
            }
            Ok(true)
        })?;
        debug!(id, existed, "instance deleted");
        Ok(existed)
    }

    // ── Persistent disks ───────────────────────────────────────────

    /// Attach a disk record to an instance.
    pub fn add_persistent_disk(
        &self,
        instance_id: RecordId,
        disk: &NewPersistentDisk,
    ) -> StateResult<PersistentDisk> {
        let disk = self.write(|txn| {
            require_instance(txn, instance_id)?;
            let disk = PersistentDisk {
                id: next_id(txn, "persistent_disks")?,
                instance_id,
                disk_cid: disk.disk_cid.clone(),
                size: disk.size,
                active: disk.active,
            };
            let mut disks = txn.open_table(PERSISTENT_DISKS).map_err(map_err!(Table))?;
            put_json(&mut disks, disk.id, &disk)?;
            let mut links = txn.open_table(INSTANCE_DISKS).map_err(map_err!(Table))?;
            links.insert((instance_id, disk.id), ()).map_err(map_err!(Write))?;
            Ok(disk)
        })?;
        debug!(id = disk.id, instance_id, disk_cid = %disk.disk_cid, active = disk.active, "persistent disk stored");
        Ok(disk)
    }

    /// All disks of an instance, ordered by id.
    pub fn find_disks_by_instance(&self, instance_id: RecordId) -> StateResult<Vec<PersistentDisk>> {
        self.read(|txn| {
            let links = txn.open_table(INSTANCE_DISKS).map_err(map_err!(Table))?;
            let disks = txn.open_table(PERSISTENT_DISKS).map_err(map_err!(Table))?;
            load_linked(&links, &disks, instance_id)
        })
    }

    /// Make `disk_id` the instance's only active disk, deactivating the rest
    /// in the same transaction.
    pub fn activate_persistent_disk(
        &self,
        instance_id: RecordId,
        disk_id: RecordId,
    ) -> StateResult<PersistentDisk> {
        let activated = self.write(|txn| {
            let links = txn.open_table(INSTANCE_DISKS).map_err(map_err!(Table))?;
            let mut table = txn.open_table(PERSISTENT_DISKS).map_err(map_err!(Table))?;
            let disks: Vec<PersistentDisk> = load_linked(&links, &table, instance_id)?;
            if !disks.iter().any(|disk| disk.id == disk_id) {
                return Err(StateError::NotFound(format!(
                    "persistent disk {disk_id} of instance {instance_id}"
                )));
            }

            let mut activated = None;
            for mut disk in disks {
                let active = disk.id == disk_id;
                if disk.active != active {
                    disk.active = active;
                    put_json(&mut table, disk.id, &disk)?;
                }
                if active {
                    activated = Some(disk);
                }
            }
            activated.ok_or_else(|| StateError::NotFound(format!("persistent disk {disk_id}")))
        })?;
        debug!(instance_id, disk_id, disk_cid = %activated.disk_cid, "persistent disk activated");
        Ok(activated)
    }

    /// The instance's active disk.
    pub fn persistent_disk(&self, instance_id: RecordId) -> StateResult<Option<PersistentDisk>> {
        self.read(|txn| {
            let instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let Some(instance) = get_json::<Instance>(&instances, instance_id)? else {
                return Ok(None);
            };
            let links = txn.open_table(INSTANCE_DISKS).map_err(map_err!(Table))?;
            let table = txn.open_table(PERSISTENT_DISKS).map_err(map_err!(Table))?;
            let disks: Vec<PersistentDisk> = load_linked(&links, &table, instance_id)?;
            Ok(instance.persistent_disk(&disks).cloned())
        })
    }

    /// Cloud id of the instance's active disk.
    pub fn persistent_disk_cid(&self, instance_id: RecordId) -> StateResult<Option<String>> {
        Ok(self.persistent_disk(instance_id)?.map(|disk| disk.disk_cid))
    }

    // ── Rendered templates archives ────────────────────────────────

    pub fn add_rendered_templates_archive(
        &self,
        instance_id: RecordId,
        archive: &NewRenderedTemplatesArchive,
    ) -> StateResult<RenderedTemplatesArchive> {
        let archive = self.write(|txn| {
            require_instance(txn, instance_id)?;
            let archive = RenderedTemplatesArchive {
                id: next_id(txn, "rendered_templates_archives")?,
                instance_id,
                blobstore_id: archive.blobstore_id.clone(),
                sha1: archive.sha1.clone(),
                content_sha1: archive.content_sha1.clone(),
                created_at: archive.created_at,
            };
            let mut archives = txn.open_table(RENDERED_TEMPLATES_ARCHIVES).map_err(map_err!(Table))?;
            put_json(&mut archives, archive.id, &archive)?;
            let mut links = txn.open_table(INSTANCE_ARCHIVES).map_err(map_err!(Table))?;
            links.insert((instance_id, archive.id), ()).map_err(map_err!(Write))?;
            Ok(archive)
        })?;
        debug!(id = archive.id, instance_id, blobstore_id = %archive.blobstore_id, "rendered templates archive stored");
        Ok(archive)
    }

    /// All archives of an instance, ordered by id.
    pub fn find_archives_by_instance(&self, instance_id: RecordId) -> StateResult<Vec<RenderedTemplatesArchive>> {
        self.read(|txn| {
            let links = txn.open_table(INSTANCE_ARCHIVES).map_err(map_err!(Table))?;
            let archives = txn.open_table(RENDERED_TEMPLATES_ARCHIVES).map_err(map_err!(Table))?;
            load_linked(&links, &archives, instance_id)
        })
    }

    pub fn latest_rendered_templates_archive(
        &self,
        instance_id: RecordId,
    ) -> StateResult<Option<RenderedTemplatesArchive>> {
        let Some((instance, archives)) = self.instance_with_archives(instance_id)? else {
            return Ok(None);
        };
        Ok(instance.latest_rendered_templates_archive(&archives).cloned())
    }

    pub fn stale_rendered_templates_archives(
        &self,
        instance_id: RecordId,
    ) -> StateResult<Vec<RenderedTemplatesArchive>> {
        let Some((instance, archives)) = self.instance_with_archives(instance_id)? else {
            return Ok(Vec::new());
        };
        Ok(instance
            .stale_rendered_templates_archives(&archives)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Delete every archive of the instance except the latest. Returns the
    /// removed records so their blobs can be deleted from the blobstore.
    pub fn prune_stale_rendered_templates_archives(
        &self,
        instance_id: RecordId,
    ) -> StateResult<Vec<RenderedTemplatesArchive>> {
        let removed = self.write(|txn| {
            let instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let Some(instance) = get_json::<Instance>(&instances, instance_id)? else {
                return Ok(Vec::new());
            };
            let mut links = txn.open_table(INSTANCE_ARCHIVES).map_err(map_err!(Table))?;
            let mut table = txn.open_table(RENDERED_TEMPLATES_ARCHIVES).map_err(map_err!(Table))?;
            let archives: Vec<RenderedTemplatesArchive> = load_linked(&links, &table, instance_id)?;
            let stale: Vec<RenderedTemplatesArchive> = instance
                .stale_rendered_templates_archives(&archives)
                .into_iter()
                .cloned()
                .collect();
            for archive in &stale {
                links.remove((instance_id, archive.id)).map_err(map_err!(Write))?;
                table.remove(archive.id).map_err(map_err!(Write))?;
            }
            Ok(stale)
        })?;
        debug!(instance_id, removed = removed.len(), "stale rendered templates archives pruned");
        Ok(removed)
    }

    fn instance_with_archives(
        &self,
        instance_id: RecordId,
    ) -> StateResult<Option<(Instance, Vec<RenderedTemplatesArchive>)>> {
        self.read(|txn| {
            let instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let Some(instance) = get_json::<Instance>(&instances, instance_id)? else {
                return Ok(None);
            };
            let links = txn.open_table(INSTANCE_ARCHIVES).map_err(map_err!(Table))?;
            let table = txn.open_table(RENDERED_TEMPLATES_ARCHIVES).map_err(map_err!(Table))?;
            let archives = load_linked(&links, &table, instance_id)?;
            Ok(Some((instance, archives)))
        })
    }
}

/// Uniqueness lookups over the slot and VM index tables of a transaction.
struct TableIndex<'a, S, V> {
    slots: &'a S,
    vms: &'a V,
}

impl<S, V> InstanceIndex for TableIndex<'_, S, V>
where
    S: ReadableTable<&'static str, u64>,
    V: ReadableTable<u64, u64>,
{
    fn slot_holder(&self, deployment_id: RecordId, job: &str, index: u32) -> StateResult<Option<RecordId>> {
        let key = slot_key(deployment_id, job, index);
        Ok(self.slots.get(key.as_str()).map_err(map_err!(Read))?.map(|g| g.value()))
    }

    fn vm_holder(&self, vm_id: RecordId) -> StateResult<Option<RecordId>> {
        Ok(self.vms.get(vm_id).map_err(map_err!(Read))?.map(|g| g.value()))
    }
}

/// Allocate the next surrogate id of a sequence.
fn next_id(txn: &WriteTransaction, sequence: &str) -> StateResult<RecordId> {
    let mut table = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
    let next = table
        .get(sequence)
        .map_err(map_err!(Read))?
        .map(|g| g.value())
        .unwrap_or(0)
        + 1;
    table.insert(sequence, next).map_err(map_err!(Write))?;
    Ok(next)
}

fn check_references(txn: &WriteTransaction, instance: &Instance) -> StateResult<()> {
    let deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
    if deployments
        .get(instance.deployment_id)
        .map_err(map_err!(Read))?
        .is_none()
    {
        return Err(StateError::MissingReference(format!(
            "deployment {}",
            instance.deployment_id
        )));
    }
    if let Some(vm_id) = instance.vm_id {
        let vms = txn.open_table(VMS).map_err(map_err!(Table))?;
        if vms.get(vm_id).map_err(map_err!(Read))?.is_none() {
            return Err(StateError::MissingReference(format!("vm {vm_id}")));
        }
    }
    Ok(())
}

fn require_instance(txn: &WriteTransaction, instance_id: RecordId) -> StateResult<()> {
    let instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
    if instances.get(instance_id).map_err(map_err!(Read))?.is_none() {
        return Err(StateError::MissingReference(format!("instance {instance_id}")));
    }
    Ok(())
}

fn get_json<T: DeserializeOwned>(
    table: &impl ReadableTable<u64, &'static [u8]>,
    id: RecordId,
) -> StateResult<Option<T>> {
    match table.get(id).map_err(map_err!(Read))? {
        Some(guard) => {
            let record: T = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

fn put_json<T: Serialize>(
    table: &mut Table<'_, u64, &'static [u8]>,
    id: RecordId,
    record: &T,
) -> StateResult<()> {
    let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
    table.insert(id, value.as_slice()).map_err(map_err!(Write))?;
    Ok(())
}

/// Child ids linked to `parent`, in ascending order.
fn linked_ids(
    links: &impl ReadableTable<(u64, u64), ()>,
    parent: RecordId,
) -> StateResult<Vec<RecordId>> {
    let mut ids = Vec::new();
    for entry in links
        .range((parent, 0)..=(parent, u64::MAX))
        .map_err(map_err!(Read))?
    {
        let (key, _) = entry.map_err(map_err!(Read))?;
        ids.push(key.value().1);
    }
    Ok(ids)
}

fn load_linked<T: DeserializeOwned>(
    links: &impl ReadableTable<(u64, u64), ()>,
    records: &impl ReadableTable<u64, &'static [u8]>,
    parent: RecordId,
) -> StateResult<Vec<T>> {
    let mut results = Vec::new();
    for id in linked_ids(links, parent)? {
        if let Some(record) = get_json(records, id)? {
            results.push(record);
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_deployment() -> (StateStore, Deployment) {
        let store = StateStore::open_in_memory().unwrap();
        let deployment = store.create_deployment("cf", None).unwrap();
        (store, deployment)
    }

    fn archive(created_at: u64) -> NewRenderedTemplatesArchive {
        NewRenderedTemplatesArchive {
            blobstore_id: format!("blob-{created_at}"),
            sha1: format!("sha-{created_at}"),
            content_sha1: format!("content-{created_at}"),
            created_at,
        }
    }

    fn disk(cid: &str, active: bool) -> NewPersistentDisk {
        NewPersistentDisk {
            disk_cid: cid.to_string(),
            size: 2048,
            active,
        }
    }

    // ── Deployments ────────────────────────────────────────────────

    #[test]
    fn deployment_create_and_get() {
        let (store, deployment) = store_with_deployment();

        assert_eq!(store.get_deployment(deployment.id).unwrap(), Some(deployment.clone()));
        assert_eq!(store.find_deployment_by_name("cf").unwrap(), Some(deployment));
        assert_eq!(store.list_deployments().unwrap().len(), 1);
    }

    #[test]
    fn deployment_names_are_unique() {
        let (store, _) = store_with_deployment();
        let err = store.create_deployment("cf", None).unwrap_err();
        assert!(err.violations().unwrap().contains("name", ValidationRule::UniquenessViolation));
    }

    #[test]
    fn vm_requires_deployment() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.create_vm(42, "agent-1", None).unwrap_err();
        assert!(matches!(err, StateError::MissingReference(_)));
    }

    // ── Instances ──────────────────────────────────────────────────

    #[test]
    fn instance_ids_are_sequential() {
        let (store, d) = store_with_deployment();
        let a = store
            .create_instance(&InstanceDraft::new(d.id, "web", 0, InstanceState::Started))
            .unwrap();
        let b = store
            .create_instance(&InstanceDraft::new(d.id, "web", 1, InstanceState::Started))
            .unwrap();
        assert_eq!(b.id, a.id + 1);
    }

    #[test]
    fn failed_validation_does_not_consume_an_id() {
        let (store, d) = store_with_deployment();
        assert!(store.create_instance(&InstanceDraft::default()).is_err());
        let instance = store
            .create_instance(&InstanceDraft::new(d.id, "web", 0, InstanceState::Started))
            .unwrap();
        assert_eq!(instance.id, 1);
    }

    #[test]
    fn instance_requires_existing_deployment_and_vm() {
        let (store, d) = store_with_deployment();

        let err = store
            .create_instance(&InstanceDraft::new(99, "web", 0, InstanceState::Started))
            .unwrap_err();
        assert!(matches!(err, StateError::MissingReference(_)));

        let err = store
            .create_instance(&InstanceDraft::new(d.id, "web", 0, InstanceState::Started).with_vm(7))
            .unwrap_err();
        assert!(matches!(err, StateError::MissingReference(_)));
    }

    #[test]
    fn update_moves_slot_and_vm() {
        let (store, d) = store_with_deployment();
        let vm1 = store.create_vm(d.id, "agent-1", None).unwrap();
        let vm2 = store.create_vm(d.id, "agent-2", None).unwrap();
        let mut instance = store
            .create_instance(&InstanceDraft::new(d.id, "web", 0, InstanceState::Started).with_vm(vm1.id))
            .unwrap();

        instance.index = 3;
        instance.vm_id = Some(vm2.id);
        store.save_instance(&instance).unwrap();

        assert!(store.find_instance_by_slot(d.id, "web", 0).unwrap().is_none());
        assert_eq!(store.find_instance_by_slot(d.id, "web", 3).unwrap(), Some(instance.clone()));
        assert!(store.find_instance_by_vm(vm1.id).unwrap().is_none());
        assert_eq!(store.find_instance_by_vm(vm2.id).unwrap(), Some(instance));
    }

    #[test]
    fn update_unknown_instance_is_not_found() {
        let (store, d) = store_with_deployment();
        let err = store
            .update_instance(5, &InstanceDraft::new(d.id, "web", 0, InstanceState::Started))
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn list_instances_is_scoped_and_ordered() {
        let store = StateStore::open_in_memory().unwrap();
        let d1 = store.create_deployment("one", None).unwrap();
        let d2 = store.create_deployment("two", None).unwrap();
        for (job, index) in [("web", 10), ("api", 0), ("web", 2)] {
            store
                .create_instance(&InstanceDraft::new(d1.id, job, index, InstanceState::Started))
                .unwrap();
        }
        store
            .create_instance(&InstanceDraft::new(d2.id, "web", 0, InstanceState::Started))
            .unwrap();

        let slots: Vec<(String, u32)> = store
            .list_instances_for_deployment(d1.id)
            .unwrap()
            .into_iter()
            .map(|i| (i.job, i.index))
            .collect();
        assert_eq!(
            slots,
            vec![("api".to_string(), 0), ("web".to_string(), 2), ("web".to_string(), 10)]
        );
        assert_eq!(store.list_instances_for_deployment(d2.id).unwrap().len(), 1);
    }

    #[test]
    fn delete_cascades_and_frees_slot() {
        let (store, d) = store_with_deployment();
        let vm = store.create_vm(d.id, "agent-1", None).unwrap();
        let instance = store
            .create_instance(&InstanceDraft::new(d.id, "db", 0, InstanceState::Started).with_vm(vm.id))
            .unwrap();
        store.add_persistent_disk(instance.id, &disk("disk-a", true)).unwrap();
        store.add_rendered_templates_archive(instance.id, &archive(100)).unwrap();

        assert!(store.delete_instance(instance.id).unwrap());
        assert!(!store.delete_instance(instance.id).unwrap());
        assert!(store.find_disks_by_instance(instance.id).unwrap().is_empty());
        assert!(store.find_archives_by_instance(instance.id).unwrap().is_empty());

        store
            .create_instance(&InstanceDraft::new(d.id, "db", 0, InstanceState::Started).with_vm(vm.id))
            .unwrap();
    }

    // ── Disks ──────────────────────────────────────────────────────

    #[test]
    fn disk_requires_instance() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.add_persistent_disk(1, &disk("disk-a", true)).unwrap_err();
        assert!(matches!(err, StateError::MissingReference(_)));
    }

    #[test]
    fn activate_leaves_exactly_one_active_disk() {
        let (store, d) = store_with_deployment();
        let instance = store
            .create_instance(&InstanceDraft::new(d.id, "db", 0, InstanceState::Started))
            .unwrap();
        store.add_persistent_disk(instance.id, &disk("disk-old", true)).unwrap();
        let new = store.add_persistent_disk(instance.id, &disk("disk-new", false)).unwrap();

        let activated = store.activate_persistent_disk(instance.id, new.id).unwrap();
        assert!(activated.active);

        let disks = store.find_disks_by_instance(instance.id).unwrap();
        assert_eq!(disks.iter().filter(|disk| disk.active).count(), 1);
        assert_eq!(store.persistent_disk_cid(instance.id).unwrap().as_deref(), Some("disk-new"));
    }

    #[test]
    fn activate_foreign_disk_is_not_found() {
        let (store, d) = store_with_deployment();
        let a = store
            .create_instance(&InstanceDraft::new(d.id, "db", 0, InstanceState::Started))
            .unwrap();
        let b = store
            .create_instance(&InstanceDraft::new(d.id, "db", 1, InstanceState::Started))
            .unwrap();
        let disk_b = store.add_persistent_disk(b.id, &disk("disk-b", false)).unwrap();

        let err = store.activate_persistent_disk(a.id, disk_b.id).unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn queries_on_unknown_instance_are_empty() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.persistent_disk(9).unwrap().is_none());
        assert!(store.persistent_disk_cid(9).unwrap().is_none());
        assert!(store.latest_rendered_templates_archive(9).unwrap().is_none());
        assert!(store.stale_rendered_templates_archives(9).unwrap().is_empty());
        assert!(store.prune_stale_rendered_templates_archives(9).unwrap().is_empty());
    }

    // ── Archives ───────────────────────────────────────────────────

    #[test]
    fn prune_keeps_latest_archive() {
        let (store, d) = store_with_deployment();
        let instance = store
            .create_instance(&InstanceDraft::new(d.id, "web", 0, InstanceState::Started))
            .unwrap();
        for created_at in [300, 100, 200] {
            store.add_rendered_templates_archive(instance.id, &archive(created_at)).unwrap();
        }

        let removed: Vec<u64> = store
            .prune_stale_rendered_templates_archives(instance.id)
            .unwrap()
            .iter()
            .map(|a| a.created_at)
            .collect();
        assert_eq!(removed, vec![100, 200]);

        let remaining = store.find_archives_by_instance(instance.id).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].created_at, 300);
        assert!(store.prune_stale_rendered_templates_archives(instance.id).unwrap().is_empty());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("state.redb");

        let instance = {
            let store = StateStore::open(&db_path).unwrap();
            let d = store.create_deployment("prod", None).unwrap();
            store
                .create_instance(&InstanceDraft::new(d.id, "web", 0, InstanceState::Started))
                .unwrap()
        };

        // Reopen the same database file; sequences continue where they stopped.
        let store = StateStore::open(&db_path).unwrap();
        assert_eq!(store.get_instance(instance.id).unwrap(), Some(instance.clone()));
        let next = store
            .create_instance(&InstanceDraft::new(instance.deployment_id, "web", 1, InstanceState::Started))
            .unwrap();
        assert_eq!(next.id, instance.id + 1);
    }
}
