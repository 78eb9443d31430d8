// dbsnapshot/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::backup::db_dump::DumpFormat;
use crate::backup::retention::RetentionPolicy;
use crate::errors::BackupError;

const DEFAULT_DB_HOST: &str = "localhost";
const DEFAULT_DB_PORT: u16 = 5432;
const DEFAULT_DB_NAME: &str = "postgres";
const DEFAULT_DB_USER: &str = "postgres";
const DEFAULT_MAX_BACKUPS: usize = 10;
const DEFAULT_COMPRESSION_LEVEL: u8 = 9;
const DEFAULT_DUMP_TIMEOUT_SECS: u64 = 60 * 60;
const DEFAULT_STORE_TIMEOUT_SECS: u64 = 5 * 60;
const DEFAULT_UPLOAD_TIMEOUT_SECS: u64 = 6 * 60 * 60;
/// One year. Longer cadences are almost certainly a unit mistake.
pub const MAX_INTERVAL_MINUTES: u64 = 365 * 24 * 60;

pub const DB_PASSWORD_ENV: &str = "DB_PASSWORD";
pub const S3_ACCESS_KEY_ID_ENV: &str = "S3_ACCESS_KEY_ID";
pub const S3_SECRET_ACCESS_KEY_ENV: &str = "S3_SECRET_ACCESS_KEY";

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonDatabaseConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub name: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonBackupOptions {
    pub file_base_name: Option<String>,
    pub local_staging_dir: Option<PathBuf>,
    pub max_backups: Option<usize>,
    pub dump_format: Option<String>,
    pub compression_level: Option<u8>,
    pub pg_dump_path: Option<PathBuf>,
    pub continue_on_delete_error: Option<bool>,
    pub dump_timeout_secs: Option<u64>,
    pub store_timeout_secs: Option<u64>,
    pub upload_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonS3StorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub folder_prefix: Option<String>,
    pub allow_insecure_endpoint: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonTaskToggle {
    pub enabled: Option<bool>,
    pub interval_minutes: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonTasks {
    pub db_backup: Option<JsonTaskToggle>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawJsonConfig {
    pub database: Option<JsonDatabaseConfig>,
    pub backup: Option<JsonBackupOptions>,
    pub s3_storage: Option<JsonS3StorageConfig>,
    pub tasks: Option<JsonTasks>,
}

// Application's internal configuration structs
#[derive(Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub file_base_name: String,
    pub staging_dir: PathBuf,
    pub retention: RetentionPolicy,
    pub dump_format: DumpFormat,
    pub compression_level: u8,
    pub pg_dump_path: Option<PathBuf>,
    pub continue_on_delete_error: bool,
    pub dump_timeout: Duration,
    pub store_timeout: Duration,
    pub upload_timeout: Duration,
}

#[derive(Clone)]
pub struct SpacesConfig {
    pub endpoint_url: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub folder_prefix: Option<String>,
}

impl fmt::Debug for SpacesConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpacesConfig")
            .field("endpoint_url", &self.endpoint_url)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("bucket_name", &self.bucket_name)
            .field("folder_prefix", &self.folder_prefix)
            .finish()
    }
}

/// Feature toggle plus cadence for one schedulable operation.
/// An interval of zero means "run once at startup".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskToggle {
    pub enabled: bool,
    pub interval_minutes: u64,
}

impl TaskToggle {
    /// `None` for "run once", and for minute counts too large to express in
    /// seconds. Loaded configs never carry those.
    pub fn interval(&self) -> Option<Duration> {
        if self.interval_minutes == 0 {
            return None;
        }
        self.interval_minutes.checked_mul(60).map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TasksConfig {
    pub db_backup: TaskToggle,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub backup: BackupConfig,
    pub spaces: SpacesConfig,
    pub tasks: TasksConfig,
}

impl AppConfig {
    /// Reads `config_path` and validates it. Secrets missing from the file are
    /// looked up through `env`.
    pub fn load_from_json(
        config_path: &Path,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;

        Self::from_raw(raw_json_config, env)
    }

    pub fn from_raw(raw: RawJsonConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database = load_database_config(raw.database.unwrap_or_default(), &env)?;
        let backup = load_backup_config(raw.backup.unwrap_or_default())?;
        let spaces = load_spaces_config(
            raw.s3_storage
                .ok_or_else(|| config_error("s3_storage must be set in config.json"))?,
            &env,
        )?;
        let tasks = load_tasks_config(raw.tasks.unwrap_or_default())?;

        Ok(AppConfig {
            database,
            backup,
            spaces,
            tasks,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

fn config_error(message: impl Into<String>) -> anyhow::Error {
    BackupError::Config(message.into()).into()
}

fn load_database_config(
    raw: JsonDatabaseConfig,
    env: &impl Fn(&str) -> Option<String>,
) -> Result<DatabaseConfig> {
    let password = non_empty(raw.password)
        .or_else(|| non_empty(env(DB_PASSWORD_ENV)))
        .ok_or_else(|| {
            config_error(format!(
                "database.password must be set in config.json or via {}",
                DB_PASSWORD_ENV
            ))
        })?;

    Ok(DatabaseConfig {
        host: non_empty(raw.host).unwrap_or_else(|| DEFAULT_DB_HOST.to_string()),
        port: raw.port.unwrap_or(DEFAULT_DB_PORT),
        name: non_empty(raw.name).unwrap_or_else(|| DEFAULT_DB_NAME.to_string()),
        username: non_empty(raw.username).unwrap_or_else(|| DEFAULT_DB_USER.to_string()),
        password,
    })
}

fn load_backup_config(raw: JsonBackupOptions) -> Result<BackupConfig> {
    let file_base_name = non_empty(raw.file_base_name)
        .ok_or_else(|| config_error("backup.file_base_name must be set in config.json"))?;
    if file_base_name.contains(['/', '\\']) {
        return Err(config_error(format!(
            "backup.file_base_name must not contain path separators: {}",
            file_base_name
        )));
    }

    let staging_dir = raw
        .local_staging_dir
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(std::env::temp_dir);

    let retention = RetentionPolicy::new(raw.max_backups.unwrap_or(DEFAULT_MAX_BACKUPS))?;

    let dump_format = match non_empty(raw.dump_format) {
        Some(f) => f.parse::<DumpFormat>()?,
        None => DumpFormat::Custom,
    };

    let compression_level = raw.compression_level.unwrap_or(DEFAULT_COMPRESSION_LEVEL);
    if compression_level > 9 {
        return Err(config_error(format!(
            "backup.compression_level must be between 0 and 9, got {}",
            compression_level
        )));
    }

    let dump_timeout_secs = raw.dump_timeout_secs.unwrap_or(DEFAULT_DUMP_TIMEOUT_SECS);
    let store_timeout_secs = raw.store_timeout_secs.unwrap_or(DEFAULT_STORE_TIMEOUT_SECS);
    let upload_timeout_secs = raw.upload_timeout_secs.unwrap_or(DEFAULT_UPLOAD_TIMEOUT_SECS);
    if dump_timeout_secs == 0 || store_timeout_secs == 0 || upload_timeout_secs == 0 {
        return Err(config_error("backup timeouts must be greater than zero"));
    }

    Ok(BackupConfig {
        file_base_name,
        staging_dir,
        retention,
        dump_format,
        compression_level,
        pg_dump_path: raw.pg_dump_path,
        continue_on_delete_error: raw.continue_on_delete_error.unwrap_or(false),
        dump_timeout: Duration::from_secs(dump_timeout_secs),
        store_timeout: Duration::from_secs(store_timeout_secs),
        upload_timeout: Duration::from_secs(upload_timeout_secs),
    })
}

fn load_spaces_config(
    raw: JsonS3StorageConfig,
    env: &impl Fn(&str) -> Option<String>,
) -> Result<SpacesConfig> {
    let bucket_name = non_empty(raw.bucket_name)
        .ok_or_else(|| config_error("s3_storage.bucket_name must be set in config.json"))?;
    let region = non_empty(raw.region)
        .ok_or_else(|| config_error("s3_storage.region must be set in config.json"))?;
    let endpoint_url = non_empty(raw.endpoint_url)
        .ok_or_else(|| config_error("s3_storage.endpoint_url must be set in config.json"))?;
    let access_key_id = non_empty(raw.access_key_id)
        .or_else(|| non_empty(env(S3_ACCESS_KEY_ID_ENV)))
        .ok_or_else(|| {
            config_error(format!(
                "s3_storage.access_key_id must be set in config.json or via {}",
                S3_ACCESS_KEY_ID_ENV
            ))
        })?;
    let secret_access_key = non_empty(raw.secret_access_key)
        .or_else(|| non_empty(env(S3_SECRET_ACCESS_KEY_ENV)))
        .ok_or_else(|| {
            config_error(format!(
                "s3_storage.secret_access_key must be set in config.json or via {}",
                S3_SECRET_ACCESS_KEY_ENV
            ))
        })?;

    let parsed = Url::parse(&endpoint_url)
        .with_context(|| format!("Invalid s3_storage.endpoint_url: {}", endpoint_url))?;
    if parsed.scheme() != "https" && !raw.allow_insecure_endpoint.unwrap_or(false) {
        return Err(config_error(format!(
            "s3_storage.endpoint_url must use https (set allow_insecure_endpoint to override): {}",
            endpoint_url
        )));
    }

    let folder_prefix = non_empty(raw.folder_prefix)
        .map(|p| p.trim_matches('/').to_string())
        .filter(|p| !p.is_empty());

    Ok(SpacesConfig {
        endpoint_url,
        region,
        access_key_id,
        secret_access_key,
        bucket_name,
        folder_prefix,
    })
}

fn load_tasks_config(raw: JsonTasks) -> Result<TasksConfig> {
    let db_backup = match raw.db_backup {
        Some(t) => load_task_toggle("db_backup", t)?,
        None => TaskToggle::default(),
    };
    Ok(TasksConfig { db_backup })
}

fn load_task_toggle(name: &str, raw: JsonTaskToggle) -> Result<TaskToggle> {
    let interval_minutes = raw.interval_minutes.unwrap_or(0);
    if interval_minutes > MAX_INTERVAL_MINUTES || interval_minutes.checked_mul(60).is_none() {
        return Err(config_error(format!(
            "tasks.{}.interval_minutes must be at most {} (one year), got {}",
            name, MAX_INTERVAL_MINUTES, interval_minutes
        )));
    }

    Ok(TaskToggle {
        enabled: raw.enabled.unwrap_or(false),
        interval_minutes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn minimal() -> serde_json::Value {
        json!({
            "database": { "password": "secret" },
            "backup": { "file_base_name": "nightly" },
            "s3_storage": {
                "bucket_name": "db-backups",
                "region": "eu-west-1",
                "access_key_id": "AKIA",
                "secret_access_key": "shh",
                "endpoint_url": "https://minio.internal:9000"
            }
        })
    }

    fn parse(value: serde_json::Value) -> Result<AppConfig> {
        let raw: RawJsonConfig = serde_json::from_value(value)?;
        AppConfig::from_raw(raw, no_env)
    }

    #[test]
    fn test_defaults_applied() -> anyhow::Result<()> {
        let cfg = parse(minimal())?;

        assert_eq!(cfg.database.host, "localhost");
        assert_eq!(cfg.database.port, 5432);
        assert_eq!(cfg.database.name, "postgres");
        assert_eq!(cfg.database.username, "postgres");
        assert_eq!(cfg.backup.retention.max_count(), 10);
        assert_eq!(cfg.backup.dump_format, DumpFormat::Custom);
        assert_eq!(cfg.backup.compression_level, 9);
        assert!(!cfg.backup.continue_on_delete_error);
        assert_eq!(cfg.backup.staging_dir, std::env::temp_dir());
        assert_eq!(cfg.tasks.db_backup, TaskToggle::default());
        assert_eq!(cfg.tasks.db_backup.interval(), None);
        assert_eq!(cfg.backup.store_timeout, Duration::from_secs(300));
        assert_eq!(cfg.backup.upload_timeout, Duration::from_secs(6 * 60 * 60));
        Ok(())
    }

    #[test]
    fn test_password_falls_back_to_env() -> anyhow::Result<()> {
        let mut value = minimal();
        value["database"] = json!({});
        let raw: RawJsonConfig = serde_json::from_value(value)?;
        let env: HashMap<&str, &str> = [(DB_PASSWORD_ENV, "from-env")].into_iter().collect();

        let cfg = AppConfig::from_raw(raw, |k| env.get(k).map(|v| v.to_string()))?;
        assert_eq!(cfg.database.password, "from-env");
        Ok(())
    }

    #[test]
    fn test_missing_password_is_config_error() {
        let mut value = minimal();
        value["database"] = json!({});
        let err = parse(value).unwrap_err();
        let backup_err = err.downcast_ref::<BackupError>().expect("config error");
        assert_eq!(backup_err.kind(), "config");
    }

    #[test]
    fn test_zero_max_backups_rejected() {
        let mut value = minimal();
        value["backup"]["max_backups"] = json!(0);
        assert!(parse(value).is_err());
    }

    #[test]
    fn test_plain_http_endpoint_requires_opt_in() -> anyhow::Result<()> {
        let mut value = minimal();
        value["s3_storage"]["endpoint_url"] = json!("http://localhost:9000");
        assert!(parse(value.clone()).is_err());

        value["s3_storage"]["allow_insecure_endpoint"] = json!(true);
        let cfg = parse(value)?;
        assert_eq!(cfg.spaces.endpoint_url, "http://localhost:9000");
        Ok(())
    }

    #[test]
    fn test_task_toggle_and_prefix() -> anyhow::Result<()> {
        let mut value = minimal();
        value["tasks"] = json!({ "db_backup": { "enabled": true, "interval_minutes": 30 } });
        value["s3_storage"]["folder_prefix"] = json!("/prod/pg/");
        value["backup"]["dump_format"] = json!("tar");
        let cfg = parse(value)?;

        assert!(cfg.tasks.db_backup.enabled);
        assert_eq!(cfg.tasks.db_backup.interval(), Some(Duration::from_secs(1800)));
        assert_eq!(cfg.spaces.folder_prefix.as_deref(), Some("prod/pg"));
        assert_eq!(cfg.backup.dump_format, DumpFormat::Tar);
        Ok(())
    }

    #[test]
    fn test_debug_redacts_secrets() -> anyhow::Result<()> {
        let cfg = parse(minimal())?;
        let rendered = format!("{:?}", cfg);
        assert!(!rendered.contains("secret\""));
        assert!(!rendered.contains("shh"));
        assert!(rendered.contains("<redacted>"));
        Ok(())
    }

    #[test]
    fn test_base_name_with_separator_rejected() {
        let mut value = minimal();
        value["backup"]["file_base_name"] = json!("../escape");
        assert!(parse(value).is_err());
    }

    #[test]
    fn test_oversized_interval_rejected() -> anyhow::Result<()> {
        for minutes in [u64::MAX / 10, u64::MAX, MAX_INTERVAL_MINUTES + 1] {
            let mut value = minimal();
            value["tasks"] = json!({ "db_backup": { "enabled": true, "interval_minutes": minutes } });
            let err = parse(value).unwrap_err();
            let backup_err = err.downcast_ref::<BackupError>().expect("config error");
            assert_eq!(backup_err.kind(), "config");
            assert!(err.to_string().contains("interval_minutes"));
        }

        let mut value = minimal();
        value["tasks"] = json!({ "db_backup": { "enabled": true, "interval_minutes": MAX_INTERVAL_MINUTES } });
        let cfg = parse(value)?;
        assert_eq!(
            cfg.tasks.db_backup.interval(),
            Some(Duration::from_secs(MAX_INTERVAL_MINUTES * 60))
        );
        Ok(())
    }

    #[test]
    fn test_interval_never_overflows() {
        let toggle = TaskToggle {
            enabled: true,
            interval_minutes: u64::MAX / 10,
        };
        assert_eq!(toggle.interval(), None);
    }

    #[test]
    fn test_zero_upload_timeout_rejected() {
        let mut value = minimal();
        value["backup"]["upload_timeout_secs"] = json!(0);
        assert!(parse(value).is_err());
    }
}
