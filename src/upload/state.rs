//! Run aggregate: the single owner of a run's status and metrics.
//!
//! `RunState` is plain synchronous data. The run's aggregator task feeds it
//! connection events one at a time, so every update is atomic per event.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use uuid::Uuid;

use super::connection::{ConnectionEvent, EventKind};
use super::{ServerTarget, Status};

/// An observable field that changed while applying an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Status(Status),
    DelayTime,
    UploadTime,
    UploadBytes,
    Error,
    /// Live or timed-out connection counts moved.
    Connections,
    Finished,
}

/// Read-only view of one run.
#[derive(Debug, Clone)]
pub struct RunSnapshot {
    pub generation: u64,
    pub run_id: Uuid,
    pub status: Status,
    pub target: Option<ServerTarget>,
    pub thread_count: usize,
    pub started_at: Instant,
    pub started_wall: DateTime<Utc>,
    /// First successful connection. `None` until one succeeds.
    pub ready_at: Option<Instant>,
    /// Most recent flush across all connections. `None` until the first flush.
    pub finished_at: Option<Instant>,
    pub total_bytes: u64,
    pub error: String,
    pub live_connections: usize,
    pub timed_out_connections: usize,
    /// Set when the run was torn down before it finished.
    pub cancelled: bool,
}

impl RunSnapshot {
    /// Snapshot of an engine that has never run.
    pub fn idle() -> Self {
        Self {
            generation: 0,
            run_id: Uuid::nil(),
            status: Status::Idle,
            target: None,
            thread_count: 0,
            started_at: Instant::now(),
            started_wall: Utc::now(),
            ready_at: None,
            finished_at: None,
            total_bytes: 0,
            error: String::new(),
            live_connections: 0,
            timed_out_connections: 0,
            cancelled: false,
        }
    }

    /// Time from `start` to the first established connection.
    pub fn delay_time(&self) -> Option<Duration> {
        self.ready_at.map(|ready| ready - self.started_at)
    }

    /// Time from the first established connection to the latest flush.
    pub fn upload_time(&self) -> Option<Duration> {
        let ready = self.ready_at?;
        self.finished_at.map(|finish| finish - ready)
    }

    pub fn delay_ms(&self) -> Option<u64> {
        self.delay_time().map(|d| d.as_millis() as u64)
    }

    pub fn upload_ms(&self) -> Option<u64> {
        self.upload_time().map(|d| d.as_millis() as u64)
    }

    pub fn upload_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Average upload rate over `upload_time`, in megabits per second.
    pub fn throughput_mbps(&self) -> Option<f64> {
        let secs = self.upload_time()?.as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        Some(self.total_bytes as f64 * 8.0 / secs / 1_000_000.0)
    }

    pub fn is_finished(&self) -> bool {
        self.status == Status::Finished
    }
}

impl Default for RunSnapshot {
    fn default() -> Self {
        Self::idle()
    }
}

#[derive(Debug)]
pub struct RunState {
    snapshot: RunSnapshot,
    live: HashSet<usize>,
}

impl RunState {
    /// Start a fresh run at `now` with connections `0..thread_count` live.
    ///
    /// Returns the state and the changes to announce. A run with no
    /// connections has nothing to wait for and finishes immediately.
    pub fn begin(
        generation: u64,
        run_id: Uuid,
        target: ServerTarget,
        thread_count: usize,
        now: Instant,
    ) -> (Self, Vec<Change>) {
        let mut state = Self {
            snapshot: RunSnapshot {
                generation,
                run_id,
                status: Status::Idle,
                target: Some(target),
                thread_count,
                started_at: now,
                started_wall: Utc::now(),
                ready_at: None,
                finished_at: None,
                total_bytes: 0,
                error: String::new(),
                live_connections: thread_count,
                timed_out_connections: 0,
                cancelled: false,
            },
            live: (0..thread_count).collect(),
        };

        let mut changes = Vec::new();
        state.advance(Status::Connecting, &mut changes);
        changes.extend([Change::DelayTime, Change::UploadTime, Change::UploadBytes]);
        if thread_count == 0 {
            state.finish(&mut changes);
        }
        (state, changes)
    }

    pub fn generation(&self) -> u64 {
        self.snapshot.generation
    }

    pub fn snapshot(&self) -> &RunSnapshot {
        &self.snapshot
    }

    pub fn is_finished(&self) -> bool {
        self.snapshot.is_finished()
    }

    /// Adopt an error message written to the published snapshot from outside
    /// the aggregator (a rejected `start`), so the next publish keeps it.
    pub fn sync_error(&mut self, current: &str) {
        if self.snapshot.error != current {
            self.snapshot.error = current.to_string();
        }
    }

    /// Fold one connection event into the run. Events from another
    /// generation or from a connection that already terminated are ignored.
    pub fn apply(&mut self, event: ConnectionEvent, now: Instant) -> Vec<Change> {
        let mut changes = Vec::new();
        if event.generation != self.snapshot.generation || !self.live.contains(&event.connection_id)
        {
            return changes;
        }

        match event.kind {
            EventKind::Connected => {
                if self.snapshot.ready_at.is_none() {
                    self.snapshot.ready_at = Some(now);
                    changes.push(Change::DelayTime);
                }
                self.advance(Status::Requesting, &mut changes);
            }
            EventKind::Flushed(bytes) => {
                self.snapshot.total_bytes += bytes;
                self.snapshot.finished_at = Some(now);
                self.advance(Status::Uploading, &mut changes);
                changes.extend([Change::UploadTime, Change::UploadBytes]);
            }
            EventKind::Terminated { error, timed_out } => {
                if let Some(message) = error {
                    self.set_error(message, &mut changes);
                }
                if timed_out {
                    self.snapshot.timed_out_connections += 1;
                }
                self.live.remove(&event.connection_id);
                self.snapshot.live_connections = self.live.len();
                changes.push(Change::Connections);
                if self.live.is_empty() {
                    self.finish(&mut changes);
                }
            }
        }
        changes
    }

    fn set_error(&mut self, message: String, changes: &mut Vec<Change>) {
        if self.snapshot.error == message {
            return;
        }
        self.snapshot.error = message;
        changes.push(Change::Error);
    }

    fn advance(&mut self, next: Status, changes: &mut Vec<Change>) {
        if self.snapshot.status.advance(next) {
            changes.push(Change::Status(next));
        }
    }

    fn finish(&mut self, changes: &mut Vec<Change>) {
        if self.snapshot.status.advance(Status::Finished) {
            changes.push(Change::Status(Status::Finished));
            changes.push(Change::Finished);
        }
    }
}
