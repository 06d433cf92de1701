//! uploadbench -- multi-connection upload throughput benchmark.
//!
//! This crate provides the client side of a network speed test: it opens a
//! number of concurrent connections to one server, streams synthetic payload
//! over each, and aggregates connection delay, upload duration and total
//! bytes transferred.

pub mod config;
pub mod upload;

use anyhow::Result;
use tracing::info;

use crate::upload::report::UploadReport;
use crate::upload::{ConnectionSettings, Status, UploadRun};

/// Run one upload benchmark to completion and return its report.
///
/// Status transitions are logged as they happen.
pub async fn run_upload(
    server: &str,
    settings: ConnectionSettings,
    threads: usize,
) -> Result<UploadReport> {
    let timeout = settings.timeout;
    let mut engine = UploadRun::new(settings);
    let mut status_rx = engine.watch();

    engine.start(server, timeout, threads)?;

    let progress = tokio::spawn(async move {
        let mut last = Status::Idle;
        while status_rx.changed().await.is_ok() {
            let snap = status_rx.borrow_and_update().clone();
            if snap.status != last {
                info!(
                    status = %snap.status,
                    bytes = snap.total_bytes,
                    live = snap.live_connections,
                    "upload status changed"
                );
                last = snap.status;
            }
            if snap.is_finished() {
                break;
            }
        }
    });

    let snapshot = engine.wait_finished().await;
    progress.abort();
    engine.shutdown().await;

    Ok(UploadReport::from(&snapshot))
}
