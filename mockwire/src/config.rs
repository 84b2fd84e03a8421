//! Server configuration and the discovery credentials handed to clients.
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Tunables for [`crate::MockServer::bind`].
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to listen on.  Port 0 picks an ephemeral port.
    pub bind_addr: SocketAddr,

    /// Shared secret clients must present to `auth`.  Generated at bind
    /// time when absent.
    pub token: Option<String>,

    /// How long an unauthenticated connection may live before the deadline
    /// closes it.
    pub auth_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            token: None,
            auth_grace: Duration::from_millis(250),
        }
    }
}

/// Everything a client needs to reach and authenticate against a running
/// server.
///
/// Returned by the bind operation; propagating it into the client under
/// test is the caller's concern, not ambient process state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub host: IpAddr,
    pub port: u16,
    pub token: String,
}

impl std::fmt::Display for Credentials {
    /// The conventional single-line form, `host:port/token`.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.token)
    }
}
