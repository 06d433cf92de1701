//! Upload result formatting.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::{RunSnapshot, Status};

/// Serializable summary of a finished (or abandoned) run.
#[derive(Debug, Clone, Serialize)]
pub struct UploadReport {
    pub run_id: Uuid,
    pub server: String,
    pub threads: usize,
    pub status: Status,
    pub delay_ms: Option<u64>,
    pub upload_ms: Option<u64>,
    pub upload_bytes: u64,
    pub throughput_mbps: Option<f64>,
    pub timed_out_connections: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl From<&RunSnapshot> for UploadReport {
    fn from(snap: &RunSnapshot) -> Self {
        Self {
            run_id: snap.run_id,
            server: snap
                .target
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
            threads: snap.thread_count,
            status: snap.status,
            delay_ms: snap.delay_ms(),
            upload_ms: snap.upload_ms(),
            upload_bytes: snap.total_bytes,
            throughput_mbps: snap.throughput_mbps(),
            timed_out_connections: snap.timed_out_connections,
            error: (!snap.error.is_empty()).then(|| snap.error.clone()),
            timestamp: snap.started_wall,
        }
    }
}

/// Format a report as a one-line human-readable summary.
pub fn format_summary(report: &UploadReport) -> String {
    let speed = match report.throughput_mbps {
        Some(mbps) if mbps >= 1000.0 => format!("{:.2} Gbps", mbps / 1000.0),
        Some(mbps) => format!("{:.1} Mbps", mbps),
        None => "n/a".to_string(),
    };

    let ms = |v: Option<u64>| v.map_or_else(|| "n/a".to_string(), |v| format!("{}ms", v));

    let mut summary = format!(
        "upload to {}: {} ({} bytes, {} connection{}, delay {}, upload {}, {})",
        report.server,
        speed,
        report.upload_bytes,
        report.threads,
        if report.threads == 1 { "" } else { "s" },
        ms(report.delay_ms),
        ms(report.upload_ms),
        report.status,
    );

    if report.timed_out_connections > 0 {
        summary.push_str(&format!(", timed out: {}", report.timed_out_connections));
    }
    if let Some(err) = &report.error {
        summary.push_str(&format!(", last error: {}", err));
    }

    summary
}
