//! One upload connection: connect under a deadline, send the request line,
//! then stream payload chunks until the peer closes, an error occurs, or the
//! deadline fires.
//!
//! A connection never touches run state. Everything it observes is reported
//! as a [`ConnectionEvent`] on the run's mailbox.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::payload::{PayloadSource, DEFAULT_PAYLOAD_SIZE};
use super::transport::{BoxedStream, Connector};
use super::{ServerTarget, UploadError, UPLOAD_PACKET};

/// What the per-connection deadline guards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// The deadline bounds connection establishment. Afterwards each chunk
    /// write gets the same budget as a stall guard.
    #[default]
    ConnectAndStall,
    /// A single deadline bounds the whole life of the connection.
    Lifetime,
}

/// Per-connection tunables.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub timeout: Duration,
    pub chunk_size: usize,
    pub payload_size: u64,
    pub policy: TimeoutPolicy,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            chunk_size: UPLOAD_PACKET,
            payload_size: DEFAULT_PAYLOAD_SIZE,
            policy: TimeoutPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Connected,
    Flushed(u64),
    Terminated {
        error: Option<String>,
        timed_out: bool,
    },
}

/// A message from a connection to the run that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub generation: u64,
    pub connection_id: usize,
    pub kind: EventKind,
}

/// Owner-side handle to a spawned connection task.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: usize,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Tear the connection down. Idempotent; a cancelled connection reports nothing.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.task.abort();
    }

    /// Wait for the task to exit (after completion or cancellation).
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

#[derive(Debug)]
enum Outcome {
    Closed,
    TimedOut,
    Failed(String),
}

struct Reporter {
    generation: u64,
    id: usize,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Reporter {
    fn send(&self, kind: EventKind) {
        // A closed mailbox means the run was replaced; nothing to report to.
        let _ = self.events.send(ConnectionEvent {
            generation: self.generation,
            connection_id: self.id,
            kind,
        });
    }

    fn terminated(&self, outcome: Outcome) {
        let kind = match outcome {
            Outcome::Closed => {
                debug!(connection = self.id, "connection closed");
                EventKind::Terminated {
                    error: None,
                    timed_out: false,
                }
            }
            Outcome::TimedOut => {
                debug!(connection = self.id, "connection deadline expired");
                EventKind::Terminated {
                    error: None,
                    timed_out: true,
                }
            }
            Outcome::Failed(message) => {
                warn!(connection = self.id, error = %message, "connection failed");
                EventKind::Terminated {
                    error: Some(message),
                    timed_out: false,
                }
            }
        };
        self.send(kind);
    }
}

/// Spawn one connection task for run `generation`.
///
/// `cancel` is usually a child of the run's token so the whole run can be
/// torn down at once.
pub fn spawn(
    id: usize,
    generation: u64,
    target: ServerTarget,
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    cancel: CancellationToken,
) -> ConnectionHandle {
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        let reporter = Reporter {
            generation,
            id,
            events,
        };
        tokio::select! {
            biased;

            _ = token.cancelled() => {
                debug!(connection = id, generation, "connection cancelled");
            }

            outcome = drive(&target, connector.as_ref(), &settings, &reporter) => {
                reporter.terminated(outcome);
            }
        }
    });

    ConnectionHandle { id, cancel, task }
}

async fn drive(
    target: &ServerTarget,
    connector: &dyn Connector,
    settings: &ConnectionSettings,
    reporter: &Reporter,
) -> Outcome {
    let deadline = Instant::now() + settings.timeout;

    let stream = match tokio::time::timeout_at(deadline, connector.connect(target)).await {
        Err(_) => return Outcome::TimedOut,
        Ok(Err(e)) => return Outcome::Failed(UploadError::transport(&e).to_string()),
        Ok(Ok(stream)) => stream,
    };

    info!(connection = reporter.id, server = %target, "connection established");
    reporter.send(EventKind::Connected);

    let lifetime = match settings.policy {
        TimeoutPolicy::Lifetime => Some(deadline),
        TimeoutPolicy::ConnectAndStall => None,
    };

    match stream_payload(stream, settings, lifetime, reporter).await {
        Ok(outcome) => outcome,
        Err(e) => Outcome::Failed(UploadError::transport(&e).to_string()),
    }
}

async fn stream_payload(
    stream: BoxedStream,
    settings: &ConnectionSettings,
    lifetime: Option<Instant>,
    reporter: &Reporter,
) -> io::Result<Outcome> {
    let (reader, mut writer) = tokio::io::split(stream);

    let remote_closed = drain(reader);
    tokio::pin!(remote_closed);

    let expiry = async move {
        match lifetime {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(expiry);

    let stall = match settings.policy {
        TimeoutPolicy::ConnectAndStall => Some(settings.timeout),
        TimeoutPolicy::Lifetime => None,
    };

    let mut payload = PayloadSource::new(settings.payload_size);
    // The request line goes out first, even for an empty payload,
    // and is not counted as uploaded bytes.
    let mut request = Some(Bytes::from(format!("UPLOAD {}\n", settings.payload_size)));

    loop {
        let (data, counted) = match request.take() {
            Some(line) => (line, 0),
            None => {
                let chunk = payload.read(settings.chunk_size);
                if chunk.is_empty() {
                    writer.shutdown().await?;
                    return Ok(Outcome::Closed);
                }
                let len = chunk.len() as u64;
                (chunk, len)
            }
        };
        let write = write_chunk(&mut writer, &data, stall);

        tokio::select! {
            biased;

            closed = &mut remote_closed => return closed,

            _ = &mut expiry => return Ok(Outcome::TimedOut),

            written = write => match written {
                None => return Ok(Outcome::TimedOut),
                Some(Err(e)) => return Err(e),
                Some(Ok(())) if counted > 0 => reporter.send(EventKind::Flushed(counted)),
                Some(Ok(())) => {}
            },
        }
    }
}

/// Write one buffer and flush it. `None` means the stall guard expired first.
async fn write_chunk<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
    stall: Option<Duration>,
) -> Option<io::Result<()>> {
    let write = async {
        writer.write_all(data).await?;
        writer.flush().await
    };
    match stall {
        Some(limit) => tokio::time::timeout(limit, write).await.ok(),
        None => Some(write.await),
    }
}

/// Discard anything the server sends; resolve when it closes.
async fn drain<R: AsyncRead + Unpin>(mut reader: R) -> io::Result<Outcome> {
    let mut buf = vec![0u8; 4096];
    loop {
        if reader.read(&mut buf).await? == 0 {
            return Ok(Outcome::Closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::DuplexStream;

    struct DuplexConnector(Mutex<Option<DuplexStream>>);

    #[async_trait::async_trait]
    impl Connector for DuplexConnector {
        async fn connect(&self, _target: &ServerTarget) -> io::Result<BoxedStream> {
            let stream = self.0.lock().unwrap().take().expect("single use");
            Ok(Box::new(stream))
        }
    }

    struct RefusingConnector;

    #[async_trait::async_trait]
    impl Connector for RefusingConnector {
        async fn connect(&self, _target: &ServerTarget) -> io::Result<BoxedStream> {
            Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))
        }
    }

    struct HangingConnector;

    #[async_trait::async_trait]
    impl Connector for HangingConnector {
        async fn connect(&self, _target: &ServerTarget) -> io::Result<BoxedStream> {
            std::future::pending().await
        }
    }

    fn target() -> ServerTarget {
        ServerTarget {
            host: "example.test".into(),
            port: 9000,
        }
    }

    fn settings(payload_size: u64, policy: TimeoutPolicy) -> ConnectionSettings {
        ConnectionSettings {
            timeout: Duration::from_millis(500),
            chunk_size: UPLOAD_PACKET,
            payload_size,
            policy,
        }
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<ConnectionEvent>) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        while let Some(ev) = rx.recv().await {
            assert_eq!(ev.generation, 7);
            assert_eq!(ev.connection_id, 3);
            kinds.push(ev.kind);
        }
        kinds
    }

    #[tokio::test]
    async fn test_streams_until_payload_exhausted() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let connector = Arc::new(DuplexConnector(Mutex::new(Some(client))));
        let (tx, rx) = mpsc::unbounded_channel();

        let server_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            server.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let _handle = spawn(
            3,
            7,
            target(),
            connector,
            settings(40_000, TimeoutPolicy::ConnectAndStall),
            tx,
            CancellationToken::new(),
        );

        let kinds = collect(rx).await;
        assert_eq!(
            kinds,
            vec![
                EventKind::Connected,
                EventKind::Flushed(16_384),
                EventKind::Flushed(16_384),
                EventKind::Flushed(40_000 - 2 * 16_384),
                EventKind::Terminated {
                    error: None,
                    timed_out: false
                },
            ]
        );

        let received = server_task.await.unwrap();
        let header = b"UPLOAD 40000\n";
        assert!(received.starts_with(header));
        assert_eq!(received.len(), header.len() + 40_000);
    }

    #[tokio::test]
    async fn test_empty_payload_still_sends_request_line() {
        let (client, mut server) = tokio::io::duplex(UPLOAD_PACKET);
        let connector = Arc::new(DuplexConnector(Mutex::new(Some(client))));
        let (tx, rx) = mpsc::unbounded_channel();

        let server_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            server.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let _handle = spawn(
            3,
            7,
            target(),
            connector,
            settings(0, TimeoutPolicy::ConnectAndStall),
            tx,
            CancellationToken::new(),
        );

        let kinds = collect(rx).await;
        assert_eq!(
            kinds,
            vec![
                EventKind::Connected,
                EventKind::Terminated {
                    error: None,
                    timed_out: false
                },
            ]
        );
        assert_eq!(server_task.await.unwrap(), b"UPLOAD 0\n");
    }

    #[tokio::test]
    async fn test_remote_close_terminates_once() {
        let (client, mut server) = tokio::io::duplex(UPLOAD_PACKET);
        let connector = Arc::new(DuplexConnector(Mutex::new(Some(client))));
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut line = vec![0u8; b"UPLOAD 1000000000\n".len()];
            server.read_exact(&mut line).await.unwrap();
            assert_eq!(&line, b"UPLOAD 1000000000\n");
            let mut body = vec![0u8; 2 * UPLOAD_PACKET];
            server.read_exact(&mut body).await.unwrap();
            // Dropping the server half closes the stream.
        });

        let _handle = spawn(
            3,
            7,
            target(),
            connector,
            settings(DEFAULT_PAYLOAD_SIZE, TimeoutPolicy::ConnectAndStall),
            tx,
            CancellationToken::new(),
        );

        let kinds = collect(rx).await;
        assert_eq!(kinds.first(), Some(&EventKind::Connected));
        let flushed = kinds
            .iter()
            .filter(|k| matches!(k, EventKind::Flushed(_)))
            .count();
        assert!(flushed >= 2);
        let terminated: Vec<_> = kinds
            .iter()
            .filter(|k| matches!(k, EventKind::Terminated { .. }))
            .collect();
        assert_eq!(terminated.len(), 1);
        assert!(matches!(
            kinds.last(),
            Some(EventKind::Terminated {
                timed_out: false,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_connect_error_reported() {
        let (tx, rx) = mpsc::unbounded_channel();
        let _handle = spawn(
            3,
            7,
            target(),
            Arc::new(RefusingConnector),
            settings(DEFAULT_PAYLOAD_SIZE, TimeoutPolicy::ConnectAndStall),
            tx,
            CancellationToken::new(),
        );

        let kinds = collect(rx).await;
        assert_eq!(
            kinds,
            vec![EventKind::Terminated {
                error: Some("connection refused".into()),
                timed_out: false
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_deadline_is_silent() {
        let (tx, rx) = mpsc::unbounded_channel();
        let _handle = spawn(
            3,
            7,
            target(),
            Arc::new(HangingConnector),
            settings(DEFAULT_PAYLOAD_SIZE, TimeoutPolicy::ConnectAndStall),
            tx,
            CancellationToken::new(),
        );

        let kinds = collect(rx).await;
        assert_eq!(
            kinds,
            vec![EventKind::Terminated {
                error: None,
                timed_out: true
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_peer_times_out() {
        for policy in [TimeoutPolicy::ConnectAndStall, TimeoutPolicy::Lifetime] {
            // Server half is kept alive but never read, so writes stall once
            // the pipe buffer fills.
            let (client, _server) = tokio::io::duplex(UPLOAD_PACKET);
            let connector = Arc::new(DuplexConnector(Mutex::new(Some(client))));
            let (tx, rx) = mpsc::unbounded_channel();

            let _handle = spawn(
                3,
                7,
                target(),
                connector,
                settings(DEFAULT_PAYLOAD_SIZE, policy),
                tx,
                CancellationToken::new(),
            );

            let kinds = collect(rx).await;
            assert_eq!(kinds.first(), Some(&EventKind::Connected));
            assert_eq!(
                kinds.last(),
                Some(&EventKind::Terminated {
                    error: None,
                    timed_out: true
                }),
                "policy {:?}",
                policy
            );
        }
    }

    #[tokio::test]
    async fn test_cancel_reports_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn(
            3,
            7,
            target(),
            Arc::new(HangingConnector),
            settings(DEFAULT_PAYLOAD_SIZE, TimeoutPolicy::ConnectAndStall),
            tx,
            CancellationToken::new(),
        );

        handle.cancel();
        handle.cancel();
        assert_eq!(handle.id(), 3);
        handle.join().await;

        assert!(rx.recv().await.is_none());
    }
}
