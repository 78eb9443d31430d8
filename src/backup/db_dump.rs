// dbsnapshot/src/backup/db_dump.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::process::Command;
use which::which;

use crate::config::{BackupConfig, DatabaseConfig};
use crate::errors::{BackupError, Result};

/// pg_dump output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpFormat {
    Custom,
    Tar,
    Plain,
}

impl DumpFormat {
    fn flag(self) -> &'static str {
        match self {
            DumpFormat::Custom => "-Fc",
            DumpFormat::Tar => "-Ft",
            DumpFormat::Plain => "-Fp",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            DumpFormat::Custom => "dump",
            DumpFormat::Tar => "tar",
            DumpFormat::Plain => "sql",
        }
    }

    // pg_dump rejects -Z for the tar format.
    fn supports_compression(self) -> bool {
        !matches!(self, DumpFormat::Tar)
    }
}

impl FromStr for DumpFormat {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "c" | "custom" => Ok(DumpFormat::Custom),
            "t" | "tar" => Ok(DumpFormat::Tar),
            "p" | "plain" => Ok(DumpFormat::Plain),
            other => Err(BackupError::Config(format!(
                "unsupported dump_format '{}', expected custom, tar or plain",
                other
            ))),
        }
    }
}

/// A dump written to local staging, owned by the cycle that produced it.
#[derive(Debug, Clone)]
pub struct LocalDumpFile {
    pub path: PathBuf,
    pub file_name: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait DumpProducer: Send + Sync {
    async fn produce(&self) -> Result<LocalDumpFile>;
}

static LAST_STAMP: AtomicI64 = AtomicI64::new(0);

/// Millisecond stamp that is strictly increasing within this process, so two
/// dumps started in the same millisecond still get distinct names.
fn next_stamp(now_millis: i64) -> i64 {
    let mut last = LAST_STAMP.load(Ordering::Relaxed);
    loop {
        let next = now_millis.max(last + 1);
        match LAST_STAMP.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

pub fn dump_file_name(base_name: &str, stamp_millis: i64, format: DumpFormat) -> String {
    format!("{}_{}.{}", base_name, stamp_millis, format.extension())
}

/// Runs the `pg_dump` client against one database.
pub struct PgDumpProducer {
    pg_dump_path: PathBuf,
    database: DatabaseConfig,
    staging_dir: PathBuf,
    base_name: String,
    format: DumpFormat,
    compression_level: u8,
    timeout: Duration,
}

// Helper function to find pg_dump executable
fn find_pg_dump_executable() -> Result<PathBuf> {
    which("pg_dump").map_err(|e| {
        BackupError::Config(format!(
            "pg_dump executable not found in PATH ({}). Install the PostgreSQL client tools or set backup.pg_dump_path.",
            e
        ))
    })
}

impl PgDumpProducer {
    pub fn new(database: DatabaseConfig, backup: &BackupConfig) -> Result<Self> {
        let pg_dump_path = match &backup.pg_dump_path {
            Some(path) => path.clone(),
            None => find_pg_dump_executable()?,
        };
        tracing::debug!(path = %pg_dump_path.display(), "Using pg_dump executable");

        Ok(Self {
            pg_dump_path,
            database,
            staging_dir: backup.staging_dir.clone(),
            base_name: backup.file_base_name.clone(),
            format: backup.dump_format,
            compression_level: backup.compression_level,
            timeout: backup.dump_timeout,
        })
    }

    fn dump_args(&self, output: &Path) -> Vec<String> {
        let mut args = vec![self.format.flag().to_string()];
        if self.format.supports_compression() {
            args.push("-Z".to_string());
            args.push(self.compression_level.to_string());
        }
        args.push(format!("--dbname={}", self.database.name));
        args.push(format!("--host={}", self.database.host));
        args.push(format!("--port={}", self.database.port));
        args.push(format!("--username={}", self.database.username));
        args.push("--no-password".to_string());
        args.push(format!("--file={}", output.display()));
        args
    }
}

async fn discard_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial dump");
        }
    }
}

#[async_trait]
impl DumpProducer for PgDumpProducer {
    async fn produce(&self) -> Result<LocalDumpFile> {
        tokio::fs::create_dir_all(&self.staging_dir).await?;

        let created_at = Utc::now();
        let stamp = next_stamp(created_at.timestamp_millis());
        let file_name = dump_file_name(&self.base_name, stamp, self.format);
        let path = self.staging_dir.join(&file_name);

        tracing::info!(
            database = %self.database.name,
            host = %self.database.host,
            path = %path.display(),
            "Starting pg_dump"
        );

        let mut cmd = Command::new(&self.pg_dump_path);
        cmd.args(self.dump_args(&path))
            .env("PGPASSWORD", &self.database.password)
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                discard_partial(&path).await;
                return Err(BackupError::Dump {
                    status: "not started".to_string(),
                    stderr: format!("failed to execute {}: {}", self.pg_dump_path.display(), e),
                });
            }
            Err(_) => {
                discard_partial(&path).await;
                return Err(BackupError::Timeout {
                    operation: "pg_dump",
                    after: self.timeout,
                });
            }
        };

        if !output.status.success() {
            discard_partial(&path).await;
            return Err(BackupError::Dump {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        if tokio::fs::metadata(&path).await.is_err() {
            return Err(BackupError::Dump {
                status: output.status.to_string(),
                stderr: format!("pg_dump reported success but {} does not exist", path.display()),
            });
        }

        tracing::info!(path = %path.display(), "✓ pg_dump finished");
        Ok(LocalDumpFile {
            path,
            file_name,
            created_at,
        })
    }
}
