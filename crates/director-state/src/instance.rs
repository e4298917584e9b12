//! Derived queries over an instance's disks and rendered templates archives.
//!
//! These take the related records as slices and ignore any record not owned
//! by the instance, so they never fail: absent data is an empty result.

use tracing::warn;

use crate::types::{Instance, PersistentDisk, RenderedTemplatesArchive};

impl Instance {
    /// The active persistent disk.
    ///
    /// Only one disk per instance is expected to be active. If several are,
    /// the one with the lowest id is returned.
    pub fn persistent_disk<'a>(&self, disks: &'a [PersistentDisk]) -> Option<&'a PersistentDisk> {
        let mut active: Vec<&PersistentDisk> = disks
            .iter()
            .filter(|disk| disk.instance_id == self.id && disk.active)
            .collect();
        if active.len() > 1 {
            warn!(instance_id = self.id, count = active.len(), "multiple active persistent disks");
        }
        active.sort_by_key(|disk| disk.id);
        active.first().copied()
    }

    /// Cloud id of the active persistent disk.
    pub fn persistent_disk_cid<'a>(&self, disks: &'a [PersistentDisk]) -> Option<&'a str> {
        self.persistent_disk(disks).map(|disk| disk.disk_cid.as_str())
    }

    /// The most recently created archive. Equal timestamps go to the higher id.
    pub fn latest_rendered_templates_archive<'a>(
        &self,
        archives: &'a [RenderedTemplatesArchive],
    ) -> Option<&'a RenderedTemplatesArchive> {
        archives
            .iter()
            .filter(|archive| archive.instance_id == self.id)
            .max_by_key(|archive| (archive.created_at, archive.id))
    }

    /// Every archive except the latest, oldest first. Empty when the
    /// instance has no archives.
    pub fn stale_rendered_templates_archives<'a>(
        &self,
        archives: &'a [RenderedTemplatesArchive],
    ) -> Vec<&'a RenderedTemplatesArchive> {
        let Some(latest) = self.latest_rendered_templates_archive(archives) else {
            return Vec::new();
        };
        let mut stale: Vec<_> = archives
            .iter()
            .filter(|archive| archive.instance_id == self.id && archive.id != latest.id)
            .collect();
        stale.sort_by_key(|archive| (archive.created_at, archive.id));
        stale
    }
}
