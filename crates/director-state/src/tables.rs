//! redb table definitions for the Director state store.
//!
//! Record tables use `u64` surrogate ids as keys and `&[u8]` values
//! (JSON-serialized domain types). Index tables map unique attributes back
//! to the owning record id; link tables key `(parent_id, child_id)` pairs so
//! an instance's children can be range-scanned.

use redb::TableDefinition;

/// Next surrogate id per record table, keyed by table name.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

/// Deployments keyed by id.
pub const DEPLOYMENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("deployments");

/// Deployment name → deployment id.
pub const DEPLOYMENT_NAMES: TableDefinition<&str, u64> = TableDefinition::new("deployment_names");

/// VMs keyed by id.
pub const VMS: TableDefinition<u64, &[u8]> = TableDefinition::new("vms");

/// Instances keyed by id.
pub const INSTANCES: TableDefinition<u64, &[u8]> = TableDefinition::new("instances");

/// `{deployment_id}/{job}/{index}` → instance id.
pub const INSTANCE_SLOTS: TableDefinition<&str, u64> = TableDefinition::new("instance_slots");

/// VM id → instance id.
pub const INSTANCE_VMS: TableDefinition<u64, u64> = TableDefinition::new("instance_vms");

/// Persistent disks keyed by id.
pub const PERSISTENT_DISKS: TableDefinition<u64, &[u8]> = TableDefinition::new("persistent_disks");

/// `(instance_id, disk_id)` ownership links.
pub const INSTANCE_DISKS: TableDefinition<(u64, u64), ()> = TableDefinition::new("instance_disks");

/// Rendered templates archives keyed by id.
pub const RENDERED_TEMPLATES_ARCHIVES: TableDefinition<u64, &[u8]> =
    TableDefinition::new("rendered_templates_archives");

/// `(instance_id, archive_id)` ownership links.
pub const INSTANCE_ARCHIVES: TableDefinition<(u64, u64), ()> =
    TableDefinition::new("instance_archives");
