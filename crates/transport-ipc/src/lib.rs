//! Local stream transport between a benchmark controller and its worker.
//!
//! A [`Session`] owns one connected stream (Unix socket, loopback TCP, or an
//! in-memory pipe in tests) and moves fixed-width command tokens over it,
//! checking each one against the shared [`SessionPhase`] machine.

mod endpoint;
mod listener;
mod session;

pub use endpoint::Endpoint;
pub use listener::{connect, Listener};
pub use session::{Session, SessionStream};

pub use harness_proto::{Command, ProtocolError, Role, SessionPhase};

use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not reach {endpoint} within {timeout:?}: {source}")]
    Connect {
        endpoint: String,
        timeout: Duration,
        #[source]
        source: io::Error,
    },
    #[error("no peer connected to {endpoint} within {timeout:?}")]
    AcceptTimeout { endpoint: String, timeout: Duration },
    #[error("invalid endpoint `{0}`")]
    InvalidEndpoint(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("no command received within {0:?}")]
    Timeout(Duration),
    #[error("session already torn down")]
    Closed,
    #[error("transport io error: {0}")]
    Io(#[from] io::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;

impl TransportError {
    /// True when the peer went away underneath us rather than misbehaving.
    pub fn is_disconnect(&self) -> bool {
        match self {
            TransportError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
