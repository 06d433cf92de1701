//! Upload benchmark engine: N concurrent connections streaming filler data to
//! one server, aggregated into delay / duration / byte metrics.

pub mod connection;
pub mod payload;
pub mod report;
pub mod run;
pub mod state;
pub mod target;
pub mod transport;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use connection::{ConnectionEvent, ConnectionSettings, EventKind, TimeoutPolicy};
pub use payload::PayloadSource;
pub use run::{RunNotification, UploadRun};
pub use state::{Change, RunSnapshot, RunState};
pub use target::ServerTarget;
pub use transport::{BoxedStream, Connector, TcpConnector};

/// Write granularity for payload chunks (16 KiB).
pub const UPLOAD_PACKET: usize = 16 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("Invalid server '{input}': {reason}")]
    InvalidServer { input: String, reason: String },

    #[error("{message}")]
    Transport { message: String },
}

impl UploadError {
    pub(crate) fn transport(err: &std::io::Error) -> Self {
        UploadError::Transport {
            message: err.to_string(),
        }
    }
}

/// Run-level status. Ordering is the ratchet order: a run only ever moves
/// towards `Finished`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Idle,
    Connecting,
    Requesting,
    Uploading,
    Finished,
}

impl Status {
    /// Move to `next` if it ranks strictly higher. Returns whether the status changed.
    pub fn advance(&mut self, next: Status) -> bool {
        if *self >= next {
            return false;
        }
        *self = next;
        true
    }

    pub fn rank(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Idle => write!(f, "idle"),
            Status::Connecting => write!(f, "connecting"),
            Status::Requesting => write!(f, "requesting"),
            Status::Uploading => write!(f, "uploading"),
            Status::Finished => write!(f, "finished"),
        }
    }
}
