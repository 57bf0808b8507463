//! Van Sales back office core.
//!
//! Day-close and settlement reconciliation over the local SQLite store, and
//! local-first master-data sync against the remote REST backend. The
//! `van-sales-syncd` binary runs the outbox loop via [`run`].

use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod config;
mod data_helpers;
pub mod day_close;
pub mod db;
pub mod error;
pub mod invoices;
pub mod master;
pub mod settlement;
pub mod sync;

pub use data_helpers::MONEY_SCALE;
pub use error::{Error, Result};

const LOG_FILE_PREFIX: &str = "vansales";
/// Daily log files kept on disk.
pub const MAX_LOG_FILES: usize = 10;

/// Install the global subscriber: console plus a daily-rolling file in
/// `log_dir`. Keep the returned guard alive; dropping it flushes the file.
pub fn init_logging(log_dir: &Path) -> WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,van_sales_lib=debug"));

    fs::create_dir_all(log_dir).ok();
    prune_old_logs(log_dir);

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    guard
}

/// Keep only the newest `MAX_LOG_FILES` daily logs.
fn prune_old_logs(log_dir: &Path) -> usize {
    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX));
            if path.is_file() && is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        if fs::remove_file(path).is_ok() {
            removed += 1;
        }
    }
    removed
}

/// Daemon entry point: open the store, pull master data, then drain the
/// outbox on an interval until Ctrl-C.
pub async fn run() -> anyhow::Result<()> {
    let data_dir = config::data_dir_from_env();
    let _log_guard = init_logging(&data_dir.join("logs"));

    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        "Starting van-sales-syncd"
    );

    let db = Arc::new(db::init(&data_dir).context("failed to initialize database")?);
    let sync_config = config::SyncConfig::resolve(&db).context("sync is not configured")?;
    sync_config
        .persist(&db)
        .context("failed to store sync configuration")?;

    let api = Arc::new(api::HttpMasterApi::new(&sync_config)?);
    let coordinator = sync::MasterSync::new(
        db.clone(),
        api.clone(),
        sync_config.clone(),
        config::Session::new("van-sales-syncd"),
    );
    for kind in master::MasterKind::ALL {
        match coordinator.refresh_from_remote(kind).await {
            Ok(report) => info!(
                kind = kind.as_str(),
                inserted = report.inserted,
                updated = report.updated,
                conflicts = report.conflicts.len(),
                "Startup refresh done"
            ),
            Err(e) => warn!(kind = kind.as_str(), "Startup refresh failed: {e}"),
        }
    }

    let sync_state = Arc::new(sync::SyncState::new());
    let cancel = CancellationToken::new();
    let handle = sync::start_sync_loop(
        db.clone(),
        api,
        sync_state.clone(),
        sync_config.sync_interval_secs,
        cancel.clone(),
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    cancel.cancel();
    handle.await.context("sync loop panicked")?;

    let status = sync::get_sync_status(&db, &sync_state)?;
    info!(
        pending = status.pending,
        failed = status.failed,
        conflicts = status.conflicts,
        "Stopped"
    );
    Ok(())
}
