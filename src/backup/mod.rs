pub(crate) mod db_dump;
pub(crate) mod logic;
pub(crate) mod retention;
pub(crate) mod store;

#[cfg(test)]
pub(crate) mod memory_store;

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::config::AppConfig;
use db_dump::PgDumpProducer;
use logic::{BackupPipeline, CycleReport, PipelineSettings};
use store::{ObjectStore, S3ObjectStore};

/// Wires the pg_dump producer and the S3 store into a pipeline.
pub async fn build_pipeline(app_config: &AppConfig) -> Result<BackupPipeline> {
    let producer = PgDumpProducer::new(app_config.database.clone(), &app_config.backup)
        .context("Failed to set up pg_dump")?;
    let store = S3ObjectStore::connect(&app_config.spaces).await;
    let settings = PipelineSettings::from_config(&app_config.backup, &app_config.spaces);

    Ok(BackupPipeline::new(
        Arc::new(producer),
        Arc::new(store),
        settings,
    ))
}

/// Runs one cycle and logs a success. Failures are returned, not logged: the
/// caller (the scheduler or `main`) reports them once.
pub async fn run_backup_cycle(pipeline: &BackupPipeline) -> Result<CycleReport> {
    let report = pipeline.run_cycle().await.map_err(|e| {
        let kind = e.kind();
        anyhow::Error::new(e).context(format!("Backup cycle failed ({})", kind))
    })?;

    tracing::info!(
        key = %report.key,
        size = report.size,
        deleted = report.deleted.len(),
        cleanup_warning = report.cleanup_warning.as_deref().unwrap_or(""),
        "Backup cycle succeeded"
    );
    Ok(report)
}

/// Prints the stored artifacts, newest first.
pub async fn run_list_flow(app_config: &AppConfig) -> Result<()> {
    let store = S3ObjectStore::connect(&app_config.spaces).await;
    let mut artifacts = store
        .list_artifacts(
            &app_config.spaces.bucket_name,
            app_config.spaces.folder_prefix.as_deref(),
        )
        .await
        .with_context(|| format!("Failed to list bucket {}", app_config.spaces.bucket_name))?;
    artifacts.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));

    println!(
        "{} artifact(s) in {} (retention keeps {})",
        artifacts.len(),
        app_config.spaces.bucket_name,
        app_config.backup.retention.max_count()
    );
    for artifact in &artifacts {
        println!(
            "{}  {:>12}  {}",
            artifact.last_modified.format("%Y-%m-%d %H:%M:%S"),
            artifact.size,
            artifact.key
        );
    }
    Ok(())
}
