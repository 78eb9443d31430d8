// dbsnapshot/src/backup/retention.rs
//! Count-based retention for uploaded dump artifacts.
//!
//! Enforcement happens *before* the new artifact is uploaded. One slot is kept
//! free for it, so once the upload lands the bucket holds exactly
//! `max_count` artifacts.

use crate::backup::store::Artifact;
use crate::errors::BackupError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    max_count: usize,
}

impl RetentionPolicy {
    pub fn new(max_count: usize) -> Result<Self, BackupError> {
        if max_count == 0 {
            return Err(BackupError::Config(
                "backup.max_backups must be at least 1".to_string(),
            ));
        }
        Ok(Self { max_count })
    }

    pub fn max_count(&self) -> usize {
        self.max_count
    }

    /// Picks the artifacts to delete ahead of uploading `incoming_key`.
    ///
    /// Artifacts are ranked newest first by `last_modified` (ties broken by key,
    /// descending, so the choice is deterministic). Everything at rank
    /// `max_count - 1` or beyond is excess. `incoming_key` is never selected,
    /// even if an object with that key is already listed.
    pub fn select_excess(&self, artifacts: &[Artifact], incoming_key: &str) -> Vec<String> {
        let mut ranked: Vec<&Artifact> = artifacts
            .iter()
            .filter(|a| a.key != incoming_key)
            .collect();
        ranked.sort_by(|a, b| {
            b.last_modified
                .cmp(&a.last_modified)
                .then_with(|| b.key.cmp(&a.key))
        });

        let keep = self.max_count - 1;
        ranked
            .into_iter()
            .skip(keep)
            .map(|a| a.key.clone())
            .collect()
    }
}
