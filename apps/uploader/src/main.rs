//! `directup`: uploads local files straight to object storage.
//!
//! Files are registered with the records API, authorized, streamed to
//! presigned URLs and finalized. Interrupted batches can be resumed.

mod config;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use directup_backend::{HttpBackend, HttpTransport};
use directup_protocol::{UploadEvent, UploadStatus};
use directup_upload::{
    BatchHandle, Collaborators, DestinationMetadata, FileSnapshotStore, UploadBatch,
    UploadCoordinator, UploadFile,
};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use config::CliConfig;

#[derive(Debug, Parser)]
#[command(name = "directup", version, about = "Upload files straight to object storage")]
struct Cli {
    /// Configuration file [default: ~/.config/directup/uploader.toml]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Upload files as one batch.
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Destination metadata applied to every file (repeatable).
        #[arg(short, long = "meta", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        metadata: Vec<(String, String)>,

        /// Parallel transfers; derived from the batch when omitted.
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// List interrupted batches that can still be resumed.
    Pending,
    /// Resume an interrupted batch.
    Resume { batch_id: String },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{s}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in `{s}`"));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "directup starting");

    let (mut config, config_file) = CliConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Upload {
            files,
            metadata,
            concurrency,
        } => {
            if concurrency.is_some() {
                config.upload.concurrency = concurrency;
            }
            let coordinator = Arc::new(build_coordinator(&config, &config_file)?);

            let mut upload_files = Vec::with_capacity(files.len());
            for path in files {
                let file = UploadFile::from_path(&path)
                    .await
                    .with_context(|| format!("cannot upload {}", path.display()))?;
                upload_files.push(file);
            }
            let destination = metadata
                .into_iter()
                .fold(DestinationMetadata::new(), |dest, (k, v)| dest.with(k, v));

            let handle = coordinator.submit(upload_files, &destination).await?;
            run_batch(&coordinator, handle).await
        }
        Command::Pending => {
            let coordinator = build_coordinator(&config, &config_file)?;
            let pending = coordinator.recoverable_batches()?;
            if pending.is_empty() {
                println!("no interrupted batches");
            }
            for snapshot in pending {
                println!(
                    "{}  saved {}  {}/{} files completed",
                    snapshot.batch_id,
                    snapshot.saved_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    snapshot.completed_files(),
                    snapshot.entries.len()
                );
            }
            Ok(())
        }
        Command::Resume { batch_id } => {
            let coordinator = Arc::new(build_coordinator(&config, &config_file)?);
            let handle = coordinator.resume(&batch_id).await?;
            run_batch(&coordinator, handle).await
        }
    }
}

fn build_coordinator(
    config: &CliConfig,
    config_file: &std::path::Path,
) -> anyhow::Result<UploadCoordinator> {
    let backend = Arc::new(
        HttpBackend::new(&config.backend_url, config.api_token())?
            .with_expiration_hours(config.upload.authorization_expiration_hours)
            .with_required_fields(config.required_fields.clone()),
    );
    let transport = Arc::new(HttpTransport::new()?);
    let snapshots = Arc::new(FileSnapshotStore::new(config.snapshot_dir(config_file))?);

    let collaborators = Collaborators {
        records: backend.clone(),
        authorizer: backend.clone(),
        finalizer: backend,
        transport,
    };
    Ok(UploadCoordinator::new(config.upload.clone(), collaborators)?
        .with_hasher(config.hasher.build())
        .with_snapshot_store(snapshots))
}

/// Runs a prepared batch to completion; Ctrl-C cancels it.
async fn run_batch(
    coordinator: &Arc<UploadCoordinator>,
    handle: BatchHandle,
) -> anyhow::Result<()> {
    let reporter = tokio::spawn(report_events(coordinator.subscribe()));

    let interrupt = {
        let coordinator = Arc::clone(coordinator);
        let batch_id = handle.batch_id().to_string();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!(batch = %batch_id, "interrupted, cancelling uploads");
                coordinator.cancel(&batch_id);
            }
        })
    };

    let result = coordinator.run(&handle).await;
    interrupt.abort();
    coordinator.close();
    let _ = reporter.await;

    let batch = result?;
    summarize(&batch);
    if batch.failed_files > 0 {
        anyhow::bail!(
            "{} of {} files did not upload; retry with `directup resume {}`",
            batch.failed_files,
            batch.total_files,
            batch.batch_id
        );
    }
    Ok(())
}

/// Logs status changes and stalls; byte progress goes to debug.
async fn report_events(mut events: mpsc::Receiver<UploadEvent>) {
    let mut last: HashMap<String, (UploadStatus, bool)> = HashMap::new();

    while let Some(event) = events.recv().await {
        let UploadEvent::File { progress, .. } = event else {
            continue;
        };
        let state = (progress.status, progress.is_stalled);
        if last.insert(progress.file_name.clone(), state) == Some(state) {
            tracing::debug!(
                file = %progress.file_name,
                percent = (progress.percentage() * 10.0).round() / 10.0,
                speed_bps = progress.upload_speed_bps as u64,
                eta_seconds = progress.eta_seconds.map(|s| s.round() as u64),
                "progress"
            );
            continue;
        }

        match progress.status {
            UploadStatus::Failed => tracing::warn!(
                file = %progress.file_name,
                error = progress.error.as_deref().unwrap_or("unknown"),
                "upload failed"
            ),
            UploadStatus::Retrying => tracing::info!(
                file = %progress.file_name,
                retry = progress.retry_count,
                error = progress.error.as_deref().unwrap_or(""),
                "retrying"
            ),
            _ if progress.is_stalled => {
                tracing::warn!(file = %progress.file_name, "transfer stalled")
            }
            status => tracing::info!(file = %progress.file_name, status = ?status, "status"),
        }
    }
}

fn summarize(batch: &UploadBatch) {
    let elapsed = batch
        .end_time
        .map(|end| (end - batch.start_time).num_milliseconds() as f64 / 1000.0)
        .unwrap_or_default();
    tracing::info!(
        batch = %batch.batch_id,
        completed = batch.completed_files,
        failed = batch.failed_files - batch.aborted_files(),
        aborted = batch.aborted_files(),
        elapsed_seconds = elapsed,
        "batch finished"
    );
}
