//! Per-connection session: from accept to a glued pipe.
//!
//! A session starts connecting upstream as soon as the inbound connection is
//! accepted. Anything the client sends before the upstream is ready is kept
//! as an ordered list of chunks and written upstream, in arrival order, the
//! moment the connection resolves. After that the session hands both
//! connections to a [`Pipe`] and is no longer on the data path.
//!
//! Inbound reads pause once the buffered bytes reach the session's pending
//! limit; the rest waits in the socket. A client that half-closes while
//! connecting still has everything it sent delivered upstream, followed by
//! a shutdown of the upstream write side.
//!
//! ```text
//!              connect ok                glue ok
//! Connecting ------------> Connected -------------> (retired into Pipe)
//!     |                        |
//!     | connect err / close    | connect err (never expected)
//!     v                        v
//!   Failed <-------------------+
//! ```

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::listener::{DEFAULT_MAX_MESSAGES_PER_READ, DEFAULT_MAX_PENDING_BYTES};
use super::pipe::{Pipe, PipeStats, Side, RELAY_BUFFER_SIZE};
use super::transport::{BoxConnection, Connection, Connector, Target};
use crate::error::ForwardError;

/// Session state. Each variant carries only what is valid in that state.
#[derive(Debug)]
pub enum SessionState<U> {
    /// Upstream connect in flight; inbound chunks in arrival order.
    Connecting { pending: VecDeque<Bytes> },
    /// Upstream connection established.
    Connected { upstream: U },
    /// Terminal failure.
    Failed { error: ForwardError },
}

/// What happened to an inbound chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    /// Held until the upstream connects.
    Buffered,
    /// Upstream is ready; write this chunk to it now.
    Forward(Bytes),
    /// The session has failed; the chunk was dropped.
    Discarded,
}

/// Result of an upstream connect succeeding.
#[derive(Debug)]
pub enum ConnectResolution<U> {
    /// The session now holds the upstream. Flush these chunks to it, in order.
    Established { pending: Vec<Bytes> },
    /// The session had already resolved. Both handles must be closed.
    Stray { stray: U, existing: Option<U> },
}

/// Per-connection limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Relay reads serviced before the connection yields.
    pub max_messages_per_read: u32,
    /// Bytes held while connecting before inbound reads pause.
    pub max_pending_bytes: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_messages_per_read: DEFAULT_MAX_MESSAGES_PER_READ,
            max_pending_bytes: DEFAULT_MAX_PENDING_BYTES,
        }
    }
}

/// State machine for one accepted connection.
#[derive(Debug)]
pub struct Session<U> {
    target: Target,
    state: SessionState<U>,
}

impl<U> Session<U> {
    /// Create a session that is connecting to `target`.
    pub fn new(target: Target) -> Self {
        Self {
            target,
            state: SessionState::Connecting {
                pending: VecDeque::new(),
            },
        }
    }

    /// Upstream target of this session.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Current state.
    pub fn state(&self) -> &SessionState<U> {
        &self.state
    }

    /// Bytes currently held while connecting.
    pub fn pending_bytes(&self) -> usize {
        match &self.state {
            SessionState::Connecting { pending } => pending.iter().map(Bytes::len).sum(),
            _ => 0,
        }
    }

    /// Handle a chunk read from the inbound connection.
    pub fn on_inbound(&mut self, chunk: Bytes) -> Inbound {
        match &mut self.state {
            SessionState::Connecting { pending } => {
                pending.push_back(chunk);
                Inbound::Buffered
            }
            SessionState::Connected { .. } => Inbound::Forward(chunk),
            SessionState::Failed { .. } => Inbound::Discarded,
        }
    }

    /// Handle the upstream connect succeeding.
    pub fn on_connect_success(&mut self, upstream: U) -> ConnectResolution<U> {
        match std::mem::replace(
            &mut self.state,
            SessionState::Failed {
                error: ForwardError::InvariantViolation("upstream connect resolved twice"),
            },
        ) {
            SessionState::Connecting { pending } => {
                self.state = SessionState::Connected { upstream };
                ConnectResolution::Established {
                    pending: pending.into(),
                }
            }
            SessionState::Connected { upstream: existing } => {
                warn!(target = %self.target, "Upstream connected on an already connected session");
                ConnectResolution::Stray {
                    stray: upstream,
                    existing: Some(existing),
                }
            }
            SessionState::Failed { error } => {
                warn!(target = %self.target, "Upstream connected on a failed session");
                self.state = SessionState::Failed { error };
                ConnectResolution::Stray {
                    stray: upstream,
                    existing: None,
                }
            }
        }
    }

    /// Handle the upstream connect failing.
    ///
    /// Returns the existing upstream if the session was (unexpectedly)
    /// connected; the caller closes it before the inbound connection.
    pub fn on_connect_failure(&mut self, error: ForwardError) -> Option<U> {
        if matches!(self.state, SessionState::Connected { .. }) {
            warn!(target = %self.target, "Upstream connect failed on an already connected session");
        }
        self.fail(error)
    }

    /// Move to `Failed`, releasing any buffered chunks.
    ///
    /// Returns the upstream connection if one was held.
    pub fn fail(&mut self, error: ForwardError) -> Option<U> {
        match std::mem::replace(&mut self.state, SessionState::Failed { error }) {
            SessionState::Connected { upstream } => Some(upstream),
            SessionState::Connecting { .. } | SessionState::Failed { .. } => None,
        }
    }

    /// Mutable access to the upstream while connected.
    pub fn upstream_mut(&mut self) -> Option<&mut U> {
        match &mut self.state {
            SessionState::Connected { upstream } => Some(upstream),
            _ => None,
        }
    }

    /// Retire the session, handing over the upstream connection.
    pub fn into_upstream(self) -> Option<U> {
        match self.state {
            SessionState::Connected { upstream } => Some(upstream),
            _ => None,
        }
    }

    /// Retire a failed session, handing over its error.
    pub fn into_error(self) -> ForwardError {
        match self.state {
            SessionState::Failed { error } => error,
            _ => ForwardError::InvariantViolation("session has not failed"),
        }
    }
}

/// Run one accepted connection: connect upstream, buffer, flush, glue, relay.
///
/// Dropping the returned future cancels the session and frees anything it
/// buffered.
pub async fn run_session<I>(
    mut inbound: I,
    target: Target,
    connector: Arc<dyn Connector>,
    limits: SessionLimits,
) -> Result<PipeStats, ForwardError>
where
    I: Connection,
{
    let mut session: Session<BoxConnection> = Session::new(target.clone());
    let connect = connector.connect(&target);
    tokio::pin!(connect);

    let mut chunk = vec![0u8; RELAY_BUFFER_SIZE];
    let mut inbound_eof = false;

    let pending = loop {
        let room = limits
            .max_pending_bytes
            .saturating_sub(session.pending_bytes())
            .min(RELAY_BUFFER_SIZE);

        tokio::select! {
            result = &mut connect => match result {
                Ok(upstream) => match session.on_connect_success(upstream) {
                    ConnectResolution::Established { pending } => break pending,
                    ConnectResolution::Stray { mut stray, existing } => {
                        let _ = stray.shutdown().await;
                        if let Some(mut existing) = existing {
                            let _ = existing.shutdown().await;
                        }
                        let _ = inbound.shutdown().await;
                        return Err(session.into_error());
                    }
                },
                Err(source) => {
                    let error = ForwardError::Connect {
                        target: target.clone(),
                        source,
                    };
                    if let Some(mut existing) = session.on_connect_failure(error) {
                        let _ = existing.shutdown().await;
                    }
                    let _ = inbound.shutdown().await;
                    return Err(session.into_error());
                }
            },
            // Paused after EOF and while the buffer is full.
            read = inbound.read(&mut chunk[..room]), if !inbound_eof && room > 0 => match read {
                Ok(0) => {
                    debug!(
                        buffered_bytes = session.pending_bytes(),
                        "Inbound finished sending while connecting"
                    );
                    inbound_eof = true;
                }
                Ok(n) => {
                    session.on_inbound(Bytes::copy_from_slice(&chunk[..n]));
                }
                Err(e) => {
                    debug!(error = %e, "Inbound read failed while connecting");
                    let buffered_bytes = session.pending_bytes();
                    session.fail(ForwardError::ClosedWhileConnecting { buffered_bytes });
                    return Err(session.into_error());
                }
            },
        }
    };

    let buffered_bytes: usize = pending.iter().map(Bytes::len).sum();
    debug!(
        target = %target,
        buffered_chunks = pending.len(),
        buffered_bytes,
        "Upstream connected"
    );

    let flushed = match session.upstream_mut() {
        Some(upstream) => flush_pending(upstream, pending).await,
        None => Err(io::Error::other("upstream missing after connect")),
    };
    if let Err(e) = flushed {
        if let Some(mut upstream) = session.fail(ForwardError::Io(e)) {
            let _ = upstream.shutdown().await;
        }
        let _ = inbound.shutdown().await;
        return Err(session.into_error());
    }

    let Some(mut upstream) = session.into_upstream() else {
        let _ = inbound.shutdown().await;
        return Err(ForwardError::InvariantViolation("session lost its upstream"));
    };

    if inbound_eof {
        // Everything the client sent is upstream; close both sides.
        let _ = upstream.shutdown().await;
        let _ = inbound.shutdown().await;
        debug!(target = %target, "Inbound closed before connect, buffered bytes delivered");
        return Ok(PipeStats {
            to_upstream: buffered_bytes as u64,
            to_inbound: 0,
            closed_by: Side::Inbound,
            errored: false,
        });
    }

    let pipe = Pipe::glue(inbound, upstream, limits.max_messages_per_read).await?;
    debug!(target = %target, "Session retired, pipe installed");

    let mut stats = pipe.run().await;
    stats.to_upstream += buffered_bytes as u64;
    Ok(stats)
}

/// Write buffered chunks upstream in arrival order.
async fn flush_pending<U>(upstream: &mut U, pending: Vec<Bytes>) -> io::Result<()>
where
    U: AsyncWrite + Unpin + ?Sized,
{
    for chunk in pending {
        upstream.write_all(&chunk).await?;
    }
    upstream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    /// Connector handing out one pre-made duplex stream once released.
    struct GatedConnector {
        release: Mutex<Option<oneshot::Receiver<io::Result<DuplexStream>>>>,
    }

    impl GatedConnector {
        fn new() -> (Arc<Self>, oneshot::Sender<io::Result<DuplexStream>>) {
            let (tx, rx) = oneshot::channel();
            (
                Arc::new(Self {
                    release: Mutex::new(Some(rx)),
                }),
                tx,
            )
        }
    }

    #[async_trait]
    impl Connector for GatedConnector {
        async fn connect(&self, _target: &Target) -> io::Result<BoxConnection> {
            let rx = self.release.lock().unwrap().take();
            let rx = rx.ok_or_else(|| io::Error::other("connector used twice"))?;
            let stream = rx.await.map_err(|_| io::Error::other("gate dropped"))??;
            Ok(Box::new(stream))
        }
    }

    fn target() -> Target {
        Target::new("upstream.test", 80)
    }

    #[test]
    fn test_buffers_in_arrival_order() {
        let mut session: Session<()> = Session::new(target());

        assert_eq!(session.on_inbound(Bytes::from_static(b"one ")), Inbound::Buffered);
        assert_eq!(session.on_inbound(Bytes::from_static(b"two ")), Inbound::Buffered);
        assert_eq!(session.on_inbound(Bytes::from_static(b"three")), Inbound::Buffered);
        assert_eq!(session.pending_bytes(), 13);

        match session.on_connect_success(()) {
            ConnectResolution::Established { pending } => {
                assert_eq!(pending.concat(), b"one two three");
                assert_eq!(pending.len(), 3);
            }
            other => panic!("Expected Established, got {:?}", other),
        }
        assert!(matches!(session.state(), SessionState::Connected { .. }));
        assert_eq!(session.pending_bytes(), 0);
    }

    #[test]
    fn test_connected_forwards_immediately() {
        let mut session: Session<()> = Session::new(target());
        session.on_connect_success(());

        assert_eq!(
            session.on_inbound(Bytes::from_static(b"live")),
            Inbound::Forward(Bytes::from_static(b"live"))
        );
        assert!(session.into_upstream().is_some());
    }

    #[test]
    fn test_connect_failure_marks_failed_and_discards() {
        let mut session: Session<()> = Session::new(target());
        session.on_inbound(Bytes::from_static(b"lost"));

        let existing = session.on_connect_failure(ForwardError::Connect {
            target: target(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        });
        assert!(existing.is_none());
        assert_eq!(session.pending_bytes(), 0);
        assert_eq!(
            session.on_inbound(Bytes::from_static(b"late")),
            Inbound::Discarded
        );
        assert_eq!(session.into_error().reason_code(), "connect_failed");
    }

    #[test]
    fn test_close_while_connecting_releases_buffer() {
        let mut session: Session<()> = Session::new(target());
        session.on_inbound(Bytes::from(vec![0u8; 4096]));

        assert!(session.fail(ForwardError::ClosedWhileConnecting { buffered_bytes: 4096 }).is_none());
        assert!(matches!(session.state(), SessionState::Failed { .. }));
        assert_eq!(session.pending_bytes(), 0);
    }

    // The following transitions should never occur: a connect attempt resolves
    // exactly once. They are checked only to confirm nothing leaks if they do.

    #[test]
    fn test_should_never_occur_second_connect_success() {
        let mut session: Session<&'static str> = Session::new(target());
        session.on_connect_success("first");

        match session.on_connect_success("second") {
            ConnectResolution::Stray { stray, existing } => {
                assert_eq!(stray, "second");
                assert_eq!(existing, Some("first"));
            }
            other => panic!("Expected Stray, got {:?}", other),
        }
        assert_eq!(session.into_error().reason_code(), "invariant_violation");
    }

    #[test]
    fn test_should_never_occur_success_after_failure() {
        let mut session: Session<&'static str> = Session::new(target());
        session.fail(ForwardError::ClosedWhileConnecting { buffered_bytes: 0 });

        match session.on_connect_success("stray") {
            ConnectResolution::Stray { stray, existing } => {
                assert_eq!(stray, "stray");
                assert!(existing.is_none());
            }
            other => panic!("Expected Stray, got {:?}", other),
        }
        assert_eq!(session.into_error().reason_code(), "closed_while_connecting");
    }

    #[test]
    fn test_should_never_occur_failure_after_connect() {
        let mut session: Session<&'static str> = Session::new(target());
        session.on_connect_success("live");

        let existing = session.on_connect_failure(ForwardError::Connect {
            target: target(),
            source: io::Error::from(io::ErrorKind::TimedOut),
        });
        assert_eq!(existing, Some("live"));
        assert!(matches!(session.state(), SessionState::Failed { .. }));
    }

    #[tokio::test]
    async fn test_run_session_flushes_pre_connect_bytes_in_order() {
        let (connector, gate) = GatedConnector::new();
        let (mut client, inbound) = duplex(1024);

        let handle = tokio::spawn(run_session(inbound, target(), connector, SessionLimits::default()));

        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(b"Host: upstream.test\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(b"\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (upstream, mut server) = duplex(1024);
        gate.send(Ok(upstream)).unwrap();

        let expected = b"GET / HTTP/1.1\r\nHost: upstream.test\r\n\r\n";
        let mut received = vec![0u8; expected.len()];
        timeout(Duration::from_secs(1), server.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&received, expected);

        // Live traffic after the handoff goes through the pipe.
        client.write_all(b"more").await.unwrap();
        let mut more = [0u8; 4];
        server.read_exact(&mut more).await.unwrap();
        assert_eq!(&more, b"more");

        server.write_all(b"reply").await.unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"reply");

        drop(server);
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.to_inbound, 5);
        // Buffered request plus the live bytes.
        assert_eq!(stats.to_upstream, expected.len() as u64 + 4);
    }

    #[tokio::test]
    async fn test_run_session_connect_failure_closes_inbound() {
        let (connector, gate) = GatedConnector::new();
        let (mut client, inbound) = duplex(1024);

        let handle = tokio::spawn(run_session(inbound, target(), connector, SessionLimits::default()));
        client.write_all(b"hello").await.unwrap();
        gate.send(Err(io::Error::from(io::ErrorKind::ConnectionRefused)))
            .unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.reason_code(), "connect_failed");

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_session_half_close_before_connect_delivers_bytes() {
        let (connector, gate) = GatedConnector::new();
        let (mut client, inbound) = duplex(1024);

        let handle = tokio::spawn(run_session(
            inbound,
            target(),
            connector,
            SessionLimits::default(),
        ));
        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        // EOF alone does not end the session.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        let (upstream, mut server) = duplex(1024);
        gate.send(Ok(upstream)).unwrap();

        let mut received = Vec::new();
        timeout(Duration::from_secs(1), server.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"request");

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.to_upstream, 7);
        assert_eq!(stats.closed_by, Side::Inbound);

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_session_pauses_reads_at_pending_limit() {
        let (connector, gate) = GatedConnector::new();
        let (mut client, inbound) = duplex(64);
        let limits = SessionLimits {
            max_pending_bytes: 16,
            ..SessionLimits::default()
        };

        let handle = tokio::spawn(run_session(inbound, target(), connector, limits));

        let payload: Vec<u8> = (0..=255u8).collect();
        let sent = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&sent).await.unwrap();
            client
        });

        // 16 buffered plus 64 in the socket is less than the payload.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished());
        assert!(!handle.is_finished());

        let (upstream, mut server) = duplex(1024);
        gate.send(Ok(upstream)).unwrap();

        let mut received = vec![0u8; payload.len()];
        timeout(Duration::from_secs(1), server.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, payload);

        drop(writer.await.unwrap());
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.to_upstream, 256);
    }

    #[tokio::test]
    async fn test_run_session_cancel_while_connecting_drops_connect() {
        let (connector, gate) = GatedConnector::new();
        let (mut client, inbound) = duplex(1024);

        let handle = tokio::spawn(run_session(
            inbound,
            target(),
            connector,
            SessionLimits::default(),
        ));
        client.write_all(b"abc").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        // The connect was dropped with the session.
        let (upstream, _server) = duplex(1024);
        assert!(gate.send(Ok(upstream)).is_err());
    }
}
