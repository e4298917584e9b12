//! Domain types for the Director state store.
//!
//! These types represent the persisted state of deployments, VMs, instances,
//! persistent disks and rendered templates archives. All types are
//! serializable to/from JSON for storage in redb tables.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Storage-assigned surrogate id shared by every record table.
pub type RecordId = u64;

// ── Deployment ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: RecordId,
    /// Unique deployment name.
    pub name: String,
    /// Raw deployment manifest, if one has been uploaded.
    pub manifest: Option<String>,
}

// ── VM ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vm {
    pub id: RecordId,
    pub deployment_id: RecordId,
    /// Id of the agent running on the VM.
    pub agent_id: String,
    /// Cloud id, set once the IaaS has created the VM.
    pub cid: Option<String>,
}

// ── Instance ──────────────────────────────────────────────────────

/// Desired state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Started,
    Stopped,
    Detached,
}

impl InstanceState {
    pub const ALL: [InstanceState; 3] = [
        InstanceState::Started,
        InstanceState::Stopped,
        InstanceState::Detached,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Started => "started",
            InstanceState::Stopped => "stopped",
            InstanceState::Detached => "detached",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing a string that names no [`InstanceState`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown instance state: {0}")]
pub struct UnknownInstanceState(pub String);

impl FromStr for InstanceState {
    type Err = UnknownInstanceState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InstanceState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownInstanceState(s.to_string()))
    }
}

/// A validated, persisted instance of a deployment job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: RecordId,
    pub deployment_id: RecordId,
    /// Job (instance group) name.
    pub job: String,
    /// Position within the job.
    pub index: u32,
    pub state: InstanceState,
    /// VM currently hosting the instance.
    pub vm_id: Option<RecordId>,
}

/// Unvalidated instance attributes as submitted by a caller.
///
/// Every attribute is optional and `index` is loosely typed so that
/// validation can report missing and mistyped values instead of rejecting
/// the payload at deserialization time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstanceDraft {
    pub deployment_id: Option<RecordId>,
    pub job: Option<String>,
    pub index: Option<serde_json::Value>,
    pub state: Option<String>,
    pub vm_id: Option<RecordId>,
}

impl InstanceDraft {
    /// Draft with every required attribute set.
    pub fn new(deployment_id: RecordId, job: &str, index: u32, state: InstanceState) -> Self {
        Self {
            deployment_id: Some(deployment_id),
            job: Some(job.to_string()),
            index: Some(index.into()),
            state: Some(state.to_string()),
            vm_id: None,
        }
    }

    pub fn with_vm(mut self, vm_id: RecordId) -> Self {
        self.vm_id = Some(vm_id);
        self
    }
}

impl From<&Instance> for InstanceDraft {
    fn from(instance: &Instance) -> Self {
        Self {
            deployment_id: Some(instance.deployment_id),
            job: Some(instance.job.clone()),
            index: Some(instance.index.into()),
            state: Some(instance.state.to_string()),
            vm_id: instance.vm_id,
        }
    }
}

// ── Persistent disk ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistentDisk {
    pub id: RecordId,
    pub instance_id: RecordId,
    /// Cloud id of the disk.
    pub disk_cid: String,
    /// Size in MiB.
    pub size: u64,
    /// Whether this is the disk currently attached for the instance.
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewPersistentDisk {
    pub disk_cid: String,
    pub size: u64,
    pub active: bool,
}

// ── Rendered templates archive ────────────────────────────────────

/// A stored snapshot of the job templates rendered for an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderedTemplatesArchive {
    pub id: RecordId,
    pub instance_id: RecordId,
    /// Blobstore object holding the archive.
    pub blobstore_id: String,
    /// Checksum of the archive blob.
    pub sha1: String,
    /// Digest of the rendered content, independent of archive packing.
    pub content_sha1: String,
    /// Unix timestamp (seconds) when the archive was stored.
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewRenderedTemplatesArchive {
    pub blobstore_id: String,
    pub sha1: String,
    pub content_sha1: String,
    pub created_at: u64,
}

impl NewRenderedTemplatesArchive {
    /// Describe an uploaded archive of the given rendered files, deriving
    /// `content_sha1` from the file contents.
    pub fn from_rendered<'a, I>(blobstore_id: &str, sha1: &str, files: I, created_at: u64) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a [u8])>,
    {
        Self {
            blobstore_id: blobstore_id.to_string(),
            sha1: sha1.to_string(),
            content_sha1: director_core::digest::rendered_files_sha(files),
            created_at,
        }
    }
}

impl Instance {
    /// Build the unique slot key for the instance slots index.
    pub fn slot_key(&self) -> String {
        slot_key(self.deployment_id, &self.job, self.index)
    }
}

/// `{deployment_id}/{job}/{index}`. The leading id and trailing index never
/// contain `/`, so the job name is recovered unambiguously.
pub fn slot_key(deployment_id: RecordId, job: &str, index: u32) -> String {
    format!("{deployment_id}/{job}/{index}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_parses_known_values() {
        for state in InstanceState::ALL {
            assert_eq!(state.as_str().parse::<InstanceState>().unwrap(), state);
        }
    }

    #[test]
    fn state_rejects_running() {
        let err = "running".parse::<InstanceState>().unwrap_err();
        assert_eq!(err, UnknownInstanceState("running".to_string()));
    }

    #[test]
    fn state_serializes_snake_case() {
        let json = serde_json::to_string(&InstanceState::Detached).unwrap();
        assert_eq!(json, "\"detached\"");
    }

    #[test]
    fn draft_from_instance_keeps_attributes() {
        let instance = Instance {
            id: 7,
            deployment_id: 1,
            job: "router".to_string(),
            index: 2,
            state: InstanceState::Stopped,
            vm_id: Some(9),
        };
        let draft = InstanceDraft::from(&instance);
        assert_eq!(draft, InstanceDraft::new(1, "router", 2, InstanceState::Stopped).with_vm(9));
    }

    #[test]
    fn archive_content_digest_ignores_file_order() {
        let a = NewRenderedTemplatesArchive::from_rendered(
            "blob-1",
            "sha",
            [("bin/ctl", &b"start"[..]), ("config.yml", &b"port: 1"[..])],
            10,
        );
        let b = NewRenderedTemplatesArchive::from_rendered(
            "blob-2",
            "sha",
            [("config.yml", &b"port: 1"[..]), ("bin/ctl", &b"start"[..])],
            20,
        );
        assert_eq!(a.content_sha1, b.content_sha1);
        assert_eq!(a.content_sha1.len(), 64);
    }

    #[test]
    fn slot_key_layout() {
        assert_eq!(slot_key(3, "nats", 0), "3/nats/0");
    }
}
