//! Transport seam over tokio sockets.
//!
//! The proxy core only needs a handful of capabilities from the socket
//! layer: bind a listening socket, open an outbound connection, and move
//! bytes over a stream. They are collected here behind two small traits so
//! sessions and pipes can run over TCP in production and over in-memory
//! duplex streams in tests.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::debug;

/// Default address listeners bind to when none is given (all interfaces).
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 1024;

/// Upstream endpoint a listener forwards to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    /// Upstream host name or IP literal.
    pub host: String,
    /// Upstream port.
    pub port: u16,
}

impl Target {
    /// Create a new target.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A target string that is not of the form `host:port`.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid target {0:?}: expected host:port")]
pub struct InvalidTarget(pub String);

impl FromStr for Target {
    type Err = InvalidTarget;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidTarget(s.to_string());

        let (host, port) = s.trim().rsplit_once(':').ok_or_else(invalid)?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        let port: u16 = port.parse().map_err(|_| invalid())?;

        if host.is_empty() || port == 0 {
            return Err(invalid());
        }

        Ok(Self::new(host, port))
    }
}

/// A byte stream the proxy can relay.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Configure the connection for relaying.
    ///
    /// Fails if the connection is no longer usable.
    fn prepare_for_relay(&self) -> io::Result<()> {
        Ok(())
    }
}

impl Connection for TcpStream {
    fn prepare_for_relay(&self) -> io::Result<()> {
        // Fails with NotConnected once the peer has reset.
        self.peer_addr()?;
        self.set_nodelay(true)
    }
}

/// In-memory connections (loopback wiring and tests).
impl Connection for DuplexStream {}

/// Type-erased connection returned by a [`Connector`].
pub type BoxConnection = Box<dyn Connection>;

impl Connection for BoxConnection {
    fn prepare_for_relay(&self) -> io::Result<()> {
        (**self).prepare_for_relay()
    }
}

/// Opens outbound connections to upstream targets.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connect to `target`.
    async fn connect(&self, target: &Target) -> io::Result<BoxConnection>;
}

/// Connector over plain TCP.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    /// Optional connect timeout. None waits for the OS to resolve the attempt.
    connect_timeout: Option<Duration>,
}

impl TcpConnector {
    /// Create a connector without a connect timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a connector with a connect timeout.
    pub fn with_timeout(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout: Some(connect_timeout),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, target: &Target) -> io::Result<BoxConnection> {
        debug!(target = %target, "Connecting to upstream");

        let attempt = TcpStream::connect((target.host.as_str(), target.port));
        let stream = match self.connect_timeout {
            Some(limit) => match timeout(limit, attempt).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "connect timeout",
                    ))
                }
            },
            None => attempt.await?,
        };

        Ok(Box::new(stream))
    }
}

/// Bind a listening socket on `address:port` with the given backlog.
pub async fn bind_listener(address: &str, port: u16, backlog: u32) -> io::Result<TcpListener> {
    let addr = resolve_bind_addr(address, port).await?;

    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    // Lets a replaced listener rebind while old connections sit in TIME_WAIT.
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

async fn resolve_bind_addr(address: &str, port: u16) -> io::Result<SocketAddr> {
    let host = address
        .strip_prefix('[')
        .and_then(|a| a.strip_suffix(']'))
        .unwrap_or(address);

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    lookup_host((host, port)).await?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no addresses found for {address}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_target_parse() {
        assert_eq!(
            "example.com:443".parse::<Target>().unwrap(),
            Target::new("example.com", 443)
        );
        assert_eq!(
            "[::1]:8080".parse::<Target>().unwrap(),
            Target::new("::1", 8080)
        );
        assert!("example.com".parse::<Target>().is_err());
        assert!("example.com:http".parse::<Target>().is_err());
        assert!(":80".parse::<Target>().is_err());
        assert!("internal:0".parse::<Target>().is_err());
    }

    #[test]
    fn test_target_display() {
        assert_eq!(Target::new("internal", 80).to_string(), "internal:80");
        assert_eq!(Target::new("fd00::1", 80).to_string(), "[fd00::1]:80");
    }

    #[tokio::test]
    async fn test_bind_listener_ephemeral() {
        let listener = bind_listener("127.0.0.1", 0, 16).await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_listener_port_in_use() {
        let held = bind_listener("127.0.0.1", 0, 16).await.unwrap();
        let port = held.local_addr().unwrap().port();

        let err = bind_listener("127.0.0.1", port, 16).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[tokio::test]
    async fn test_bind_listener_invalid_address() {
        assert!(bind_listener("not an address", 0, 16).await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_connector() {
        let listener = bind_listener("127.0.0.1", 0, 16).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut conn = TcpConnector::new()
            .connect(&Target::new("127.0.0.1", port))
            .await
            .unwrap();
        conn.prepare_for_relay().unwrap();
        conn.write_all(b"ping").await.unwrap();

        assert_eq!(&server.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_tcp_connector_refused() {
        let port = {
            let listener = bind_listener("127.0.0.1", 0, 16).await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let result = TcpConnector::with_timeout(Duration::from_secs(2))
            .connect(&Target::new("127.0.0.1", port))
            .await;
        assert!(result.is_err());
    }
}
