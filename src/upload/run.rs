//! `UploadRun`: the public face of the benchmark engine.
//!
//! `start` spawns one task per connection plus one aggregator task per run.
//! Connections report into a per-run mailbox; the aggregator folds events
//! into a [`RunState`] and publishes the result through a `watch` channel
//! (current snapshot) and a `broadcast` channel (change notifications).
//!
//! Each run carries a generation number. The aggregator only publishes while
//! the watched snapshot still belongs to its generation, and it checks that
//! under the watch lock, so a replaced or cancelled run can never touch the
//! state of the run that follows it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connection::{self, ConnectionEvent, ConnectionHandle, ConnectionSettings};
use super::state::{Change, RunSnapshot, RunState};
use super::transport::{Connector, TcpConnector};
use super::{ServerTarget, Status, UploadError};

const NOTIFICATION_CAPACITY: usize = 1024;

/// A change notification, tagged with the run it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunNotification {
    pub generation: u64,
    pub change: Change,
}

struct ActiveRun {
    run_id: Uuid,
    cancel: CancellationToken,
    connections: Vec<ConnectionHandle>,
    aggregator: JoinHandle<()>,
}

impl ActiveRun {
    fn cancel(&self) {
        self.cancel.cancel();
        for conn in &self.connections {
            conn.cancel();
        }
        self.aggregator.abort();
    }
}

/// Upload benchmark engine. One run at a time; starting a new run discards
/// the previous one.
pub struct UploadRun {
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
    generation: u64,
    snapshot_tx: Arc<watch::Sender<RunSnapshot>>,
    notify_tx: broadcast::Sender<RunNotification>,
    active: Option<ActiveRun>,
}

impl UploadRun {
    /// Engine that uploads over plain TCP.
    pub fn new(settings: ConnectionSettings) -> Self {
        Self::with_connector(settings, Arc::new(TcpConnector::new()))
    }

    pub fn with_connector(settings: ConnectionSettings, connector: Arc<dyn Connector>) -> Self {
        let (snapshot_tx, _) = watch::channel(RunSnapshot::idle());
        let (notify_tx, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            connector,
            settings,
            generation: 0,
            snapshot_tx: Arc::new(snapshot_tx),
            notify_tx,
            active: None,
        }
    }

    /// Begin a run of `thread_count` connections against `server` (`host:port`).
    ///
    /// Returns immediately with the new run's generation. A malformed `server`
    /// records the error, spawns nothing and leaves any current run alone.
    /// A successful start clears `error` along with the rest of the previous
    /// run's state.
    /// Must be called from within a tokio runtime.
    pub fn start(
        &mut self,
        server: &str,
        timeout: Duration,
        thread_count: usize,
    ) -> Result<u64, UploadError> {
        let target = match ServerTarget::parse(server) {
            Ok(target) => target,
            Err(err) => {
                warn!(server, error = %err, "rejecting upload run");
                self.record_error(err.to_string());
                return Err(err);
            }
        };

        self.retire();

        self.generation += 1;
        let generation = self.generation;
        let run_id = Uuid::new_v4();
        let (state, changes) =
            RunState::begin(generation, run_id, target.clone(), thread_count, Instant::now());

        info!(
            %run_id,
            generation,
            server = %target,
            threads = thread_count,
            timeout_ms = timeout.as_millis() as u64,
            "starting upload run"
        );

        let notify_tx = self.notify_tx.clone();
        self.snapshot_tx.send_modify(|snap| {
            *snap = state.snapshot().clone();
            publish(&notify_tx, generation, &changes);
        });

        if state.is_finished() {
            info!(%run_id, "no connections requested; run finished");
            return Ok(generation);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let settings = ConnectionSettings {
            timeout,
            ..self.settings.clone()
        };

        let aggregator = tokio::spawn(aggregate(
            state,
            events_rx,
            Arc::clone(&self.snapshot_tx),
            notify_tx,
        ));

        let connections = (0..thread_count)
            .map(|id| {
                connection::spawn(
                    id,
                    generation,
                    target.clone(),
                    Arc::clone(&self.connector),
                    settings.clone(),
                    events_tx.clone(),
                    cancel.child_token(),
                )
            })
            .collect();

        self.active = Some(ActiveRun {
            run_id,
            cancel,
            connections,
            aggregator,
        });
        Ok(generation)
    }

    /// Tear down the current run, if any. Idempotent. Status is left where it
    /// was and no `Finished` notification is sent.
    pub fn cancel(&mut self) {
        self.retire();
    }

    /// Cancel the current run and wait for all of its tasks to exit.
    pub async fn shutdown(&mut self) {
        if let Some(active) = self.retire() {
            futures::future::join_all(active.connections.into_iter().map(ConnectionHandle::join))
                .await;
            let _ = active.aggregator.await;
        }
    }

    /// Wait until the current run finishes, is cancelled, or is replaced.
    pub async fn wait_finished(&self) -> RunSnapshot {
        let generation = self.generation;
        let mut rx = self.snapshot_tx.subscribe();
        let done = rx
            .wait_for(|snap| {
                snap.generation != generation
                    || snap.cancelled
                    || matches!(snap.status, Status::Idle | Status::Finished)
            })
            .await
            .map(|snap| snap.clone());
        done.unwrap_or_else(|_| self.snapshot())
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn status(&self) -> Status {
        self.snapshot_tx.borrow().status
    }

    /// `None` until a connection of the current run has been established.
    pub fn delay_time(&self) -> Option<Duration> {
        self.snapshot_tx.borrow().delay_time()
    }

    /// `None` until a chunk of the current run has been flushed.
    pub fn upload_time(&self) -> Option<Duration> {
        self.snapshot_tx.borrow().upload_time()
    }

    pub fn upload_bytes(&self) -> u64 {
        self.snapshot_tx.borrow().upload_bytes()
    }

    pub fn error(&self) -> String {
        self.snapshot_tx.borrow().error.clone()
    }

    /// Receiver for the current snapshot; changes on every published update.
    pub fn watch(&self) -> watch::Receiver<RunSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Receiver for change notifications. Slow receivers may observe
    /// `RecvError::Lagged` during heavy uploads.
    pub fn subscribe(&self) -> broadcast::Receiver<RunNotification> {
        self.notify_tx.subscribe()
    }

    fn record_error(&self, message: String) {
        let generation = self.generation;
        let notify_tx = &self.notify_tx;
        self.snapshot_tx.send_if_modified(|snap| {
            if snap.error == message {
                return false;
            }
            snap.error = message;
            publish(notify_tx, generation, &[Change::Error]);
            true
        });
    }

    fn retire(&mut self) -> Option<ActiveRun> {
        let active = self.active.take()?;
        active.cancel();
        let generation = self.generation;
        self.snapshot_tx.send_if_modified(|snap| {
            if snap.generation != generation || snap.is_finished() {
                return false;
            }
            snap.cancelled = true;
            true
        });
        debug!(run_id = %active.run_id, generation, "upload run cancelled");
        Some(active)
    }
}

impl Drop for UploadRun {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel();
        }
    }
}

fn publish(tx: &broadcast::Sender<RunNotification>, generation: u64, changes: &[Change]) {
    for &change in changes {
        // No subscribers is fine.
        let _ = tx.send(RunNotification { generation, change });
    }
}

async fn aggregate(
    mut state: RunState,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    snapshot_tx: Arc<watch::Sender<RunSnapshot>>,
    notify_tx: broadcast::Sender<RunNotification>,
) {
    let generation = state.generation();

    while let Some(event) = events.recv().await {
        let now = Instant::now();
        let mut stale = false;

        snapshot_tx.send_if_modified(|snap| {
            if snap.generation != generation || snap.cancelled {
                stale = true;
                return false;
            }
            state.sync_error(&snap.error);
            let changes = state.apply(event, now);
            if changes.is_empty() {
                return false;
            }
            *snap = state.snapshot().clone();
            publish(&notify_tx, generation, &changes);
            true
        });

        if stale {
            debug!(generation, "run replaced; aggregator exiting");
            return;
        }

        if state.is_finished() {
            let snap = state.snapshot();
            info!(
                run_id = %snap.run_id,
                generation,
                bytes = snap.total_bytes,
                delay_ms = ?snap.delay_ms(),
                upload_ms = ?snap.upload_ms(),
                timed_out = snap.timed_out_connections,
                "upload run finished"
            );
            return;
        }
    }
}
