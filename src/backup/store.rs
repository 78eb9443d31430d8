// dbsnapshot/src/backup/store.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use chrono::{DateTime, Utc};
use s3::config::Region;
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use std::path::Path;

use crate::config::SpacesConfig;
use crate::errors::{BackupError, Result};

const DEFAULT_S3_REGION: &str = "us-east-1";
const ARTIFACT_CONTENT_TYPE: &str = "application/octet-stream";

/// One uploaded backup object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub key: String,
    pub last_modified: DateTime<Utc>,
    pub size: u64,
}

/// Operations the backup cycle needs from an object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Creates `bucket` if absent. Succeeds when the bucket already exists.
    async fn ensure_bucket(&self, bucket: &str, region: &str) -> Result<()>;

    /// Every artifact under `prefix`, in whatever order the store returns them.
    async fn list_artifacts(&self, bucket: &str, prefix: Option<&str>) -> Result<Vec<Artifact>>;

    async fn upload(&self, bucket: &str, key: &str, local_path: &Path) -> Result<Artifact>;

    /// Deleting a key that does not exist is not an error.
    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;
}

/// S3-compatible store (AWS, MinIO, DigitalOcean Spaces).
pub struct S3ObjectStore {
    client: s3::Client,
}

impl S3ObjectStore {
    pub async fn connect(spaces_config: &SpacesConfig) -> Self {
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&spaces_config.endpoint_url)
            .region(Region::new(spaces_config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &spaces_config.access_key_id,
                &spaces_config.secret_access_key,
                None, // session_token
                None, // expiry
                "Static", // provider_name
            ))
            .load()
            .await;

        // MinIO does not resolve virtual-hosted bucket names by default.
        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();

        Self {
            client: s3::Client::from_conf(s3_config),
        }
    }
}

fn to_chrono(ts: &s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts.secs(), ts.subsec_nanos())
}

/// What a CreateBucket call came back with.
#[derive(Debug)]
enum CreateOutcome {
    Created,
    AlreadyOwned,
    Failed(String),
}

/// The two calls bucket provisioning is built from.
#[async_trait]
trait BucketCalls: Send + Sync {
    async fn create_bucket(&self, bucket: &str, region: &str) -> CreateOutcome;

    async fn head_bucket(&self, bucket: &str) -> std::result::Result<(), String>;
}

/// `us-east-1` is the default location and must not be sent as a constraint.
fn bucket_configuration(region: &str) -> Option<CreateBucketConfiguration> {
    (region != DEFAULT_S3_REGION).then(|| {
        CreateBucketConfiguration::builder()
            .location_constraint(BucketLocationConstraint::from(region))
            .build()
    })
}

async fn provision_bucket(calls: &impl BucketCalls, bucket: &str, region: &str) -> Result<()> {
    let create_err = match calls.create_bucket(bucket, region).await {
        CreateOutcome::Created => {
            tracing::info!(bucket, region, "Created bucket");
            return Ok(());
        }
        CreateOutcome::AlreadyOwned => {
            tracing::debug!(bucket, "Bucket already exists");
            return Ok(());
        }
        CreateOutcome::Failed(e) => e,
    };

    // Some S3-compatible servers answer CreateBucket on an existing bucket
    // with a generic error; confirm existence before giving up.
    match calls.head_bucket(bucket).await {
        Ok(()) => {
            tracing::debug!(bucket, "Bucket confirmed via HeadBucket");
            Ok(())
        }
        Err(head_err) => Err(BackupError::store(
            "ensure_bucket",
            format!(
                "could not create bucket {} ({}) nor confirm it exists ({})",
                bucket, create_err, head_err
            ),
        )),
    }
}

#[async_trait]
impl BucketCalls for S3ObjectStore {
    async fn create_bucket(&self, bucket: &str, region: &str) -> CreateOutcome {
        let request = self
            .client
            .create_bucket()
            .bucket(bucket)
            .set_create_bucket_configuration(bucket_configuration(region));

        match request.send().await {
            Ok(_) => CreateOutcome::Created,
            Err(e) => match e.as_service_error() {
                Some(service_err)
                    if service_err.is_bucket_already_owned_by_you()
                        || service_err.is_bucket_already_exists() =>
                {
                    CreateOutcome::AlreadyOwned
                }
                _ => CreateOutcome::Failed(DisplayErrorContext(&e).to_string()),
            },
        }
    }

    async fn head_bucket(&self, bucket: &str) -> std::result::Result<(), String> {
        self.client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| DisplayErrorContext(&e).to_string())
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn ensure_bucket(&self, bucket: &str, region: &str) -> Result<()> {
        provision_bucket(self, bucket, region).await
    }

    async fn list_artifacts(&self, bucket: &str, prefix: Option<&str>) -> Result<Vec<Artifact>> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .set_prefix(prefix.map(|p| format!("{}/", p)))
            .into_paginator()
            .send();

        let mut artifacts = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| {
                BackupError::store("list", format!("{}: {}", bucket, DisplayErrorContext(&e)))
            })?;
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                let Some(last_modified) = object.last_modified().and_then(to_chrono) else {
                    tracing::warn!(key, "Skipping object without last-modified time");
                    continue;
                };
                artifacts.push(Artifact {
                    key: key.to_string(),
                    last_modified,
                    size: object.size().unwrap_or(0).max(0) as u64,
                });
            }
        }

        tracing::debug!(bucket, count = artifacts.len(), "Listed artifacts");
        Ok(artifacts)
    }

    async fn upload(&self, bucket: &str, key: &str, local_path: &Path) -> Result<Artifact> {
        tracing::info!(bucket, key, path = %local_path.display(), "Uploading artifact");

        let body = ByteStream::from_path(local_path).await.map_err(|e| {
            BackupError::store(
                "upload",
                format!("failed to read {}: {}", local_path.display(), e),
            )
        })?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(ARTIFACT_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                BackupError::store("upload", format!("{}/{}: {}", bucket, key, DisplayErrorContext(&e)))
            })?;

        let head = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                BackupError::store("upload", format!("{}/{} not visible after put: {}", bucket, key, DisplayErrorContext(&e)))
            })?;

        Ok(Artifact {
            key: key.to_string(),
            last_modified: head
                .last_modified()
                .and_then(to_chrono)
                .unwrap_or_else(Utc::now),
            size: head.content_length().unwrap_or(0).max(0) as u64,
        })
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .bypass_governance_retention(true)
            .send()
            .await
            .map_err(|e| {
                BackupError::store("delete", format!("{}/{}: {}", bucket, key, DisplayErrorContext(&e)))
            })?;
        Ok(())
    }
}
