// dbsnapshot/src/backup/logic.rs
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::backup::db_dump::{DumpProducer, LocalDumpFile};
use crate::backup::retention::RetentionPolicy;
use crate::backup::store::{Artifact, ObjectStore};
use crate::config::{BackupConfig, SpacesConfig};
use crate::errors::{BackupError, Result};

/// Where and how artifacts are kept.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub bucket: String,
    pub region: String,
    pub key_prefix: Option<String>,
    pub retention: RetentionPolicy,
    pub continue_on_delete_error: bool,
    pub store_timeout: Duration,
    /// Uploads move the whole dump, so they get their own, longer budget.
    pub upload_timeout: Duration,
}

impl PipelineSettings {
    pub fn from_config(backup: &BackupConfig, spaces: &SpacesConfig) -> Self {
        Self {
            bucket: spaces.bucket_name.clone(),
            region: spaces.region.clone(),
            key_prefix: spaces.folder_prefix.clone(),
            retention: backup.retention,
            continue_on_delete_error: backup.continue_on_delete_error,
            store_timeout: backup.store_timeout,
            upload_timeout: backup.upload_timeout,
        }
    }

    pub fn artifact_key(&self, file_name: &str) -> String {
        match &self.key_prefix {
            Some(prefix) => format!("{}/{}", prefix, file_name),
            None => file_name.to_string(),
        }
    }
}

/// Outcome of one successful cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub key: String,
    pub size: u64,
    pub deleted: Vec<String>,
    pub cleanup_warning: Option<String>,
}

/// dump -> ensure bucket -> list -> select excess -> delete -> upload -> local cleanup.
pub struct BackupPipeline {
    producer: Arc<dyn DumpProducer>,
    store: Arc<dyn ObjectStore>,
    settings: PipelineSettings,
}

impl BackupPipeline {
    pub fn new(
        producer: Arc<dyn DumpProducer>,
        store: Arc<dyn ObjectStore>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            producer,
            store,
            settings,
        }
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        bounded_by(self.settings.store_timeout, operation, fut).await
    }

    /// Runs one full cycle. Nothing touches the store if the dump fails.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let dump = self.producer.produce().await?;
        let key = self.settings.artifact_key(&dump.file_name);
        tracing::debug!(key = %key, created_at = %dump.created_at, "Dump ready for upload");

        let shipped = self.ship(&dump, &key).await;

        // The dump file belongs to this run and is removed whatever happened above.
        let cleanup_warning = match remove_local_dump(&dump.path).await {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!(path = %dump.path.display(), error = %e, "Failed to delete local dump");
                Some(e.to_string())
            }
        };

        let (uploaded, deleted) = shipped?;
        Ok(CycleReport {
            key: uploaded.key,
            size: uploaded.size,
            deleted,
            cleanup_warning,
        })
    }

    async fn ship(&self, dump: &LocalDumpFile, key: &str) -> Result<(Artifact, Vec<String>)> {
        let bucket = self.settings.bucket.as_str();
        let store = &self.store;

        self.bounded(
            "ensure_bucket",
            store.ensure_bucket(bucket, &self.settings.region),
        )
        .await?;

        let prefix = self.settings.key_prefix.as_deref();
        let existing = self
            .bounded("list", store.list_artifacts(bucket, prefix))
            .await?;

        // Retention runs before the upload: the listing cannot contain the new
        // artifact, and one slot is reserved for it.
        let excess = self.settings.retention.select_excess(&existing, key);
        let deleted = self.delete_excess(&excess).await?;

        let uploaded = bounded_by(
            self.settings.upload_timeout,
            "upload",
            store.upload(bucket, key, &dump.path),
        )
        .await?;
        tracing::info!(key = %uploaded.key, size = uploaded.size, "Successfully uploaded backup");

        Ok((uploaded, deleted))
    }

    async fn delete_excess(&self, excess: &[String]) -> Result<Vec<String>> {
        let bucket = self.settings.bucket.as_str();
        let mut deleted = Vec::with_capacity(excess.len());

        for old_key in excess {
            match self.bounded("delete", self.store.delete(bucket, old_key)).await {
                Ok(()) => {
                    tracing::info!(key = %old_key, "Deleted old backup");
                    deleted.push(old_key.clone());
                }
                Err(e) if self.settings.continue_on_delete_error => {
                    tracing::warn!(key = %old_key, error = %e, "Failed to delete old backup, continuing");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }
}

async fn bounded_by<T>(
    limit: Duration,
    operation: &'static str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| BackupError::Timeout {
            operation,
            after: limit,
        })?
}

async fn remove_local_dump(path: &Path) -> Result<()> {
    tokio::fs::remove_file(path)
        .await
        .map_err(|source| BackupError::LocalCleanup {
            path: path.to_path_buf(),
            source,
        })
}
