//! Core domain types

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use crate::error::ConfigError;

/// Remote workload a forward points at
///
/// The resource layer resolves this into something the negotiator can
/// upgrade; the tunnel only carries it around.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    /// Namespace-equivalent scope
    pub namespace: String,
    /// Resource collection, e.g. `pods`
    pub resource: String,
    /// Resource name
    pub name: String,
}

impl Target {
    /// Target a pod by name
    pub fn pod(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            resource: "pods".to_string(),
            name: name.into(),
        }
    }

    /// Target a service; forwarding goes to one of its ready pods
    pub fn service(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            resource: "services".to_string(),
            name: name.into(),
        }
    }

    /// Whether the target names a pod directly
    pub fn is_pod(&self) -> bool {
        self.resource == "pods"
    }

    /// API path of the target, relative to the server root
    pub fn api_path(&self) -> String {
        format!(
            "/api/v1/namespaces/{}/{}/{}",
            self.namespace, self.resource, self.name
        )
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.resource, self.name, self.namespace)
    }
}

/// Immutable description of one port-forward request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    remote_port: u16,
    local_port: u16,
    addresses: Vec<IpAddr>,
    target: Target,
}

impl ForwardSpec {
    /// Forward `remote_port` of `target` to an ephemeral port on localhost
    pub fn new(target: Target, remote_port: u16) -> Self {
        Self {
            remote_port,
            local_port: 0,
            addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            target,
        }
    }

    /// Use an explicit local port (0 = ephemeral)
    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }

    /// Replace the local bind addresses
    ///
    /// An empty list keeps the current addresses.
    pub fn with_addresses(mut self, addresses: Vec<IpAddr>) -> Self {
        if !addresses.is_empty() {
            self.addresses = addresses;
        }
        self
    }

    /// Port inside the remote workload
    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// Requested local port (0 = ephemeral)
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Local addresses to bind
    pub fn addresses(&self) -> &[IpAddr] {
        &self.addresses
    }

    /// Remote workload
    pub fn target(&self) -> &Target {
        &self.target
    }
}

/// A `LOCAL:REMOTE` port mapping as written on a command line
///
/// `8080:80` binds 8080, `:80` binds an ephemeral port and `80`
/// uses the same port on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub local: u16,
    pub remote: u16,
}

impl FromStr for PortMapping {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |p: &str| {
            p.parse::<u16>()
                .map_err(|_| ConfigError::Invalid(format!("invalid port '{}' in '{}'", p, s)))
        };

        let (local, remote) = match s.split_once(':') {
            Some(("", remote)) => (0, parse(remote)?),
            Some((local, remote)) => (parse(local)?, parse(remote)?),
            None => {
                let port = parse(s)?;
                (port, port)
            }
        };

        if remote == 0 {
            return Err(ConfigError::Invalid(format!("remote port cannot be 0 in '{}'", s)));
        }

        Ok(Self { local, remote })
    }
}

/// Identifier of one accepted local connection within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Create a new connection ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Tunnel session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Constructed, nothing bound yet
    Ready,
    /// Negotiating the transport and binding sockets
    Starting,
    /// Accepting and forwarding connections
    Running,
    /// Tearing down
    Stopping,
    /// Torn down
    Stopped,
    /// Start or the underlying transport failed
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Ready => write!(f, "ready"),
            SessionState::Starting => write!(f, "starting"),
            SessionState::Running => write!(f, "running"),
            SessionState::Stopping => write!(f, "stopping"),
            SessionState::Stopped => write!(f, "stopped"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

/// State of one forwarded connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Both directions flowing
    Open,
    /// Local peer finished sending
    LocalClosed,
    /// Remote side finished sending
    RemoteClosed,
    /// Both directions done or torn down
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::LocalClosed => write!(f, "local-closed"),
            ConnectionState::RemoteClosed => write!(f, "remote-closed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}
