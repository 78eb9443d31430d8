// dbsnapshot/src/backup/memory_store.rs
//! In-memory `ObjectStore` used by pipeline tests. Records every call.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use crate::backup::store::{Artifact, ObjectStore};
use crate::errors::{BackupError, Result};

#[derive(Default)]
struct State {
    buckets: HashSet<String>,
    objects: BTreeMap<(String, String), Artifact>,
    calls: Vec<String>,
    tick: i64,
    fail_upload: bool,
    fail_delete: HashSet<String>,
    upload_delay: Option<std::time::Duration>,
}

#[derive(Default)]
pub(crate) struct MemoryObjectStore {
    state: Mutex<State>,
}

fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

impl MemoryObjectStore {
    /// Pre-populates `bucket` with `key`, modified `secs` after the test epoch.
    pub(crate) fn seed(&self, bucket: &str, key: &str, secs: i64) {
        let mut state = self.state.lock().unwrap();
        state.buckets.insert(bucket.to_string());
        state.tick = state.tick.max(secs);
        state.objects.insert(
            (bucket.to_string(), key.to_string()),
            Artifact {
                key: key.to_string(),
                last_modified: epoch() + Duration::seconds(secs),
                size: 100,
            },
        );
    }

    pub(crate) fn fail_uploads(&self) {
        self.state.lock().unwrap().fail_upload = true;
    }

    pub(crate) fn delay_uploads(&self, delay: std::time::Duration) {
        self.state.lock().unwrap().upload_delay = Some(delay);
    }

    pub(crate) fn fail_delete_of(&self, key: &str) {
        self.state.lock().unwrap().fail_delete.insert(key.to_string());
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub(crate) fn keys(&self, bucket: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    pub(crate) fn bucket_count(&self) -> usize {
        self.state.lock().unwrap().buckets.len()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn ensure_bucket(&self, bucket: &str, _region: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("ensure_bucket:{}", bucket));
        state.buckets.insert(bucket.to_string());
        Ok(())
    }

    async fn list_artifacts(&self, bucket: &str, prefix: Option<&str>) -> Result<Vec<Artifact>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("list:{}", bucket));
        let wanted = prefix.map(|p| format!("{}/", p));
        // Reverse key order: callers must not rely on listing order.
        Ok(state
            .objects
            .iter()
            .rev()
            .filter(|((b, k), _)| {
                b == bucket && wanted.as_deref().is_none_or(|p| k.starts_with(p))
            })
            .map(|(_, a)| a.clone())
            .collect())
    }

    async fn upload(&self, bucket: &str, key: &str, local_path: &Path) -> Result<Artifact> {
        let size = tokio::fs::metadata(local_path).await?.len();
        let delay = self.state.lock().unwrap().upload_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("upload:{}", key));
        if state.fail_upload {
            return Err(BackupError::store("upload", "simulated upload failure"));
        }
        state.tick += 1;
        let artifact = Artifact {
            key: key.to_string(),
            last_modified: epoch() + Duration::seconds(state.tick),
            size,
        };
        state
            .objects
            .insert((bucket.to_string(), key.to_string()), artifact.clone());
        Ok(artifact)
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("delete:{}", key));
        if state.fail_delete.contains(key) {
            return Err(BackupError::store("delete", format!("simulated failure for {}", key)));
        }
        state.objects.remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}
