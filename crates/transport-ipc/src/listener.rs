use std::io;
use std::time::Duration;

use harness_proto::Role;
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::{Endpoint, Session, TransportError, TransportResult};

const CONNECT_BACKOFF_START: Duration = Duration::from_millis(10);
const CONNECT_BACKOFF_MAX: Duration = Duration::from_millis(250);

/// Controller-side listening endpoint. A Unix socket file is removed when
/// the listener is dropped.
pub struct Listener {
    endpoint: Endpoint,
    inner: ListenerInner,
}

enum ListenerInner {
    #[cfg(unix)]
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl Listener {
    pub async fn bind(endpoint: &Endpoint) -> TransportResult<Self> {
        match endpoint {
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                if path.exists() {
                    warn!(path = %path.display(), "removing stale socket file");
                    std::fs::remove_file(path)?;
                }
                let listener = UnixListener::bind(path)?;
                info!(endpoint = %endpoint, "listening for worker");
                Ok(Self {
                    endpoint: endpoint.clone(),
                    inner: ListenerInner::Unix(listener),
                })
            }
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await?;
                // Port 0 resolves here; workers need the real one.
                let bound = Endpoint::Tcp(listener.local_addr()?);
                info!(endpoint = %bound, "listening for worker");
                Ok(Self {
                    endpoint: bound,
                    inner: ListenerInner::Tcp(listener),
                })
            }
        }
    }

    /// The address a worker should be given, with any OS-assigned port filled in.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Waits for exactly one worker to connect.
    pub async fn accept(&self, role: Role, timeout: Duration) -> TransportResult<Session> {
        let accepted = tokio::time::timeout(timeout, self.accept_stream(role)).await;
        match accepted {
            Ok(session) => session,
            Err(_) => Err(TransportError::AcceptTimeout {
                endpoint: self.endpoint.to_string(),
                timeout,
            }),
        }
    }

    async fn accept_stream(&self, role: Role) -> TransportResult<Session> {
        match &self.inner {
            #[cfg(unix)]
            ListenerInner::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                debug!(endpoint = %self.endpoint, "worker connected");
                Ok(Session::new(role, self.endpoint.to_string(), stream))
            }
            ListenerInner::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                debug!(endpoint = %self.endpoint, %peer, "worker connected");
                Ok(Session::new(role, peer.to_string(), stream))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Endpoint::Unix(path) = &self.endpoint {
            if let Err(err) = std::fs::remove_file(path) {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "failed to remove socket file");
                }
            }
        }
    }
}

/// Connects to a listening controller, retrying with capped backoff until
/// `timeout` elapses.
pub async fn connect(endpoint: &Endpoint, role: Role, timeout: Duration) -> TransportResult<Session> {
    let deadline = Instant::now() + timeout;
    let mut backoff = CONNECT_BACKOFF_START;
    loop {
        match open_stream(endpoint, role).await {
            Ok(session) => return Ok(session),
            Err(err) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(TransportError::Connect {
                        endpoint: endpoint.to_string(),
                        timeout,
                        source: err,
                    });
                }
                debug!(endpoint = %endpoint, error = %err, retry_in = ?backoff, "controller not reachable yet");
                sleep(backoff.min(deadline - now)).await;
                backoff = (backoff * 2).min(CONNECT_BACKOFF_MAX);
            }
        }
    }
}

async fn open_stream(endpoint: &Endpoint, role: Role) -> io::Result<Session> {
    match endpoint {
        #[cfg(unix)]
        Endpoint::Unix(path) => {
            let stream = UnixStream::connect(path).await?;
            Ok(Session::new(role, endpoint.to_string(), stream))
        }
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(Session::new(role, endpoint.to_string(), stream))
        }
    }
}
