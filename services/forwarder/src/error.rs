//! Error types for the forwarder.

use std::io;

use thiserror::Error;

use crate::proxy::Target;

/// Errors returned by listener registry operations.
///
/// A failed operation never leaves a partial entry behind.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A listener is already bound for this address and port.
    #[error("already_listening: {address}:{port}")]
    AlreadyListening { address: String, port: u16 },

    /// The listening socket could not be bound.
    ///
    /// `replaced` is set when an update had already stopped the previous
    /// listener on this key, which leaves the key without a listener.
    #[error("bind_failed: {address}:{port}{}: {source}", replaced_note(.replaced))]
    Bind {
        address: String,
        port: u16,
        replaced: bool,
        #[source]
        source: io::Error,
    },

    /// A reconciliation pass produced an inconsistent classification.
    #[error("reconcile_failed: {0}")]
    Reconcile(#[from] portway_reconcile::ReconcileError),
}

impl RegistryError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RegistryError::AlreadyListening { .. } => "already_listening",
            RegistryError::Bind { .. } => "bind_failed",
            RegistryError::Reconcile(_) => "reconcile_failed",
        }
    }

    /// Check whether the failed operation stopped a listener it could not
    /// bring back.
    pub fn listener_lost(&self) -> bool {
        matches!(self, RegistryError::Bind { replaced: true, .. })
    }
}

fn replaced_note(replaced: &bool) -> &'static str {
    if *replaced {
        " (previous listener stopped)"
    } else {
        ""
    }
}

/// Failure to install the bidirectional relay.
#[derive(Debug, Error)]
#[error("glue_failed: {side} connection: {source}")]
pub struct GlueError {
    pub side: &'static str,
    #[source]
    pub source: io::Error,
}

/// Errors that end a single forwarded connection.
///
/// These are contained to the connection that produced them.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The upstream target could not be reached.
    #[error("connect_failed: {target}: {source}")]
    Connect {
        target: Target,
        #[source]
        source: io::Error,
    },

    /// The relay could not be installed.
    #[error(transparent)]
    Glue(#[from] GlueError),

    /// A connect resolution arrived for a session that had already resolved.
    #[error("invariant_violation: {0}")]
    InvariantViolation(&'static str),

    /// The inbound side went away before the upstream connected.
    #[error("closed_while_connecting: {buffered_bytes} buffered bytes released")]
    ClosedWhileConnecting { buffered_bytes: usize },

    /// IO error while flushing buffered data upstream.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ForwardError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ForwardError::Connect { .. } => "connect_failed",
            ForwardError::Glue(_) => "glue_failed",
            ForwardError::InvariantViolation(_) => "invariant_violation",
            ForwardError::ClosedWhileConnecting { .. } => "closed_while_connecting",
            ForwardError::Io(_) => "io_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        let err = RegistryError::AlreadyListening {
            address: "0.0.0.0".to_string(),
            port: 4321,
        };
        assert_eq!(err.reason_code(), "already_listening");
        assert_eq!(err.to_string(), "already_listening: 0.0.0.0:4321");

        let err = ForwardError::Connect {
            target: Target::new("internal", 80),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert_eq!(err.reason_code(), "connect_failed");
        assert!(err.to_string().starts_with("connect_failed: internal:80"));
    }

    #[test]
    fn test_bind_error_reports_lost_listener() {
        let err = RegistryError::Bind {
            address: "127.0.0.1".to_string(),
            port: 1234,
            replaced: true,
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        assert_eq!(err.reason_code(), "bind_failed");
        assert!(err.listener_lost());
        assert!(err
            .to_string()
            .starts_with("bind_failed: 127.0.0.1:1234 (previous listener stopped): "));

        let err = RegistryError::Bind {
            address: "127.0.0.1".to_string(),
            port: 1234,
            replaced: false,
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        assert!(!err.listener_lost());
        assert!(!err.to_string().contains("previous listener"));
    }

    #[test]
    fn test_glue_error_converts() {
        let glue = GlueError {
            side: "upstream",
            source: io::Error::from(io::ErrorKind::NotConnected),
        };
        let err: ForwardError = glue.into();
        assert_eq!(err.reason_code(), "glue_failed");
    }
}
