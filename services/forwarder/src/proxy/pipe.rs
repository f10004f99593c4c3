//! Bidirectional byte relay between two established connections.
//!
//! Once a session has its upstream connection, both connections are moved
//! into a [`Pipe`]. The pipe forwards bytes in both directions without
//! looking at them until either side closes or fails, then shuts both down.
//!
//! Flow control is per direction: a chunk is fully written to the
//! destination before the next read from the source, so a slow reader on
//! one side stalls the opposite source instead of growing a buffer.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::transport::Connection;
use crate::error::GlueError;

/// Size of the per-direction relay buffer.
pub const RELAY_BUFFER_SIZE: usize = 8192;

/// Which side of the pipe ended it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The accepted client connection.
    Inbound,
    /// The connection to the upstream target.
    Upstream,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Inbound => f.write_str("inbound"),
            Side::Upstream => f.write_str("upstream"),
        }
    }
}

/// Summary of a finished pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeStats {
    /// Bytes relayed from the inbound connection to upstream.
    pub to_upstream: u64,
    /// Bytes relayed from upstream to the inbound connection.
    pub to_inbound: u64,
    /// Side whose close or error ended the pipe.
    pub closed_by: Side,
    /// True if the pipe ended on an IO error rather than a clean close.
    pub errored: bool,
}

/// A glued pair of connections.
pub struct Pipe<A, B> {
    inbound: A,
    upstream: B,
    max_messages_per_read: usize,
}

impl<A, B> Pipe<A, B>
where
    A: Connection,
    B: Connection,
{
    /// Glue `inbound` and `upstream` together.
    ///
    /// Both connections are prepared before anything is relayed. If either
    /// preparation fails both connections are shut down and nothing is left
    /// running.
    pub async fn glue(
        mut inbound: A,
        mut upstream: B,
        max_messages_per_read: u32,
    ) -> Result<Self, GlueError> {
        let prepared = inbound
            .prepare_for_relay()
            .map_err(|source| GlueError {
                side: "inbound",
                source,
            })
            .and_then(|_| {
                upstream.prepare_for_relay().map_err(|source| GlueError {
                    side: "upstream",
                    source,
                })
            });

        if let Err(e) = prepared {
            let _ = upstream.shutdown().await;
            let _ = inbound.shutdown().await;
            return Err(e);
        }

        Ok(Self {
            inbound,
            upstream,
            max_messages_per_read: max_messages_per_read.max(1) as usize,
        })
    }

    /// Relay until either side closes, then close both.
    pub async fn run(self) -> PipeStats {
        let to_upstream = AtomicU64::new(0);
        let to_inbound = AtomicU64::new(0);

        let (mut inbound_read, mut inbound_write) = split(self.inbound);
        let (mut upstream_read, mut upstream_write) = split(self.upstream);

        let budget = self.max_messages_per_read;
        let result = tokio::select! {
            r = relay(&mut inbound_read, &mut upstream_write, Side::Inbound, Side::Upstream, budget, &to_upstream) => {
                r.map(|()| Side::Inbound)
            }
            r = relay(&mut upstream_read, &mut inbound_write, Side::Upstream, Side::Inbound, budget, &to_inbound) => {
                r.map(|()| Side::Upstream)
            }
        };

        let (closed_by, errored) = match result {
            Ok(side) => (side, false),
            Err(e) => {
                debug!(side = %e.side, error = %e.source, "Relay error");
                (e.side, true)
            }
        };

        // Full duplex teardown: the surviving direction is dropped with the select.
        let _ = upstream_write.shutdown().await;
        let _ = inbound_write.shutdown().await;

        PipeStats {
            to_upstream: to_upstream.load(Ordering::Relaxed),
            to_inbound: to_inbound.load(Ordering::Relaxed),
            closed_by,
            errored,
        }
    }
}

/// IO failure in one relay direction, attributed to the side it happened on.
struct RelayError {
    side: Side,
    source: io::Error,
}

/// Copy from `src` to `dst` until `src` reaches EOF.
///
/// Yields to the scheduler after `budget` consecutive chunks so one busy
/// connection cannot monopolize its worker.
async fn relay<R, W>(
    src: &mut R,
    dst: &mut W,
    from: Side,
    to: Side,
    budget: usize,
    counter: &AtomicU64,
) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut turns = 0usize;
    let read_failed = |source| RelayError { side: from, source };
    let write_failed = |source| RelayError { side: to, source };

    loop {
        let n = src.read(&mut buf).await.map_err(read_failed)?;
        if n == 0 {
            return Ok(());
        }

        dst.write_all(&buf[..n]).await.map_err(write_failed)?;
        dst.flush().await.map_err(write_failed)?;
        counter.fetch_add(n as u64, Ordering::Relaxed);

        turns += 1;
        if turns >= budget {
            turns = 0;
            tokio::task::yield_now().await;
        }
    }
}
