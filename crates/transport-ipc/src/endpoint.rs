use std::fmt;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;
use std::str::FromStr;

use crate::TransportError;

const TCP_SCHEME: &str = "tcp://";
#[cfg(unix)]
const UNIX_SCHEME: &str = "unix://";

/// Address handed to a worker as its sole required argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    #[cfg(unix)]
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl Endpoint {
    /// Loopback TCP endpoint with an OS-assigned port.
    pub fn tcp_loopback() -> Self {
        Endpoint::Tcp(SocketAddr::from(([127, 0, 0, 1], 0)))
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(TransportError::InvalidEndpoint(raw.to_string()));
        }
        if let Some(addr) = raw.strip_prefix(TCP_SCHEME) {
            return addr
                .parse()
                .map(Endpoint::Tcp)
                .map_err(|_| TransportError::InvalidEndpoint(raw.to_string()));
        }
        #[cfg(unix)]
        {
            let path = raw.strip_prefix(UNIX_SCHEME).unwrap_or(raw);
            if path.is_empty() {
                return Err(TransportError::InvalidEndpoint(raw.to_string()));
            }
            Ok(Endpoint::Unix(PathBuf::from(path)))
        }
        #[cfg(not(unix))]
        {
            Err(TransportError::InvalidEndpoint(raw.to_string()))
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => write!(f, "{UNIX_SCHEME}{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "{TCP_SCHEME}{addr}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp() {
        let endpoint: Endpoint = "tcp://127.0.0.1:4100".parse().expect("tcp endpoint");
        assert_eq!(endpoint, Endpoint::Tcp("127.0.0.1:4100".parse().unwrap()));
        assert_eq!(endpoint.to_string(), "tcp://127.0.0.1:4100");
    }

    #[cfg(unix)]
    #[test]
    fn bare_path_is_unix_socket() {
        let endpoint: Endpoint = "/tmp/bench.sock".parse().expect("unix endpoint");
        assert_eq!(endpoint, Endpoint::Unix(PathBuf::from("/tmp/bench.sock")));
        assert_eq!(endpoint.to_string(), "unix:///tmp/bench.sock");
        let reparsed: Endpoint = endpoint.to_string().parse().expect("round trip");
        assert_eq!(reparsed, endpoint);
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<Endpoint>().is_err());
        assert!("tcp://not-an-addr".parse::<Endpoint>().is_err());
    }
}
