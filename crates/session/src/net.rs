use std::{
    fmt, io,
    net::{IpAddr, SocketAddr},
};

use bytes::Bytes;
use thiserror::Error;
use url::Url;

/// Upper bounds for DTLS key material read from the data model.
pub const MAX_PK_OR_IDENTITY_SIZE: usize = 2048;
pub const MAX_SERVER_PK_OR_IDENTITY_SIZE: usize = 2048;
pub const MAX_SECRET_KEY_SIZE: usize = 256;

/// URI scheme of an LwM2M server endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Coap,
    Coaps,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Coap => "coap",
            Self::Coaps => "coaps",
        }
    }

    fn default_port(self) -> u16 {
        match self {
            Self::Coap => 5683,
            Self::Coaps => 5684,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum UriError {
    #[error("unsupported scheme: {0}")]
    Scheme(String),
    #[error("missing host")]
    Host,
    #[error(transparent)]
    Parse(#[from] url::ParseError),
}

/// Parsed server URI; only `coap`/`coaps` over UDP are understood.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUri {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl ServerUri {
    pub fn parse(raw: &str) -> Result<Self, UriError> {
        let url = Url::parse(raw)?;
        let scheme = match url.scheme() {
            "coap" => Scheme::Coap,
            "coaps" => Scheme::Coaps,
            other => return Err(UriError::Scheme(other.to_string())),
        };
        let host = url.host_str().ok_or(UriError::Host)?.to_string();
        let port = url.port().unwrap_or_else(|| scheme.default_port());
        Ok(Self { scheme, host, port })
    }
}

impl fmt::Display for ServerUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// UDP Security Mode resource values (LwM2M Security object, resource 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpSecurityMode {
    Psk,
    Rpk,
    Certificate,
    NoSec,
}

impl UdpSecurityMode {
    /// Decode the raw resource value. `Rpk` decodes but is rejected later
    /// as unsupported.
    pub fn from_resource_value(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Psk),
            1 => Some(Self::Rpk),
            2 => Some(Self::Certificate),
            3 => Some(Self::NoSec),
            _ => None,
        }
    }
}

/// DTLS key material read from the Security object instance.
#[derive(Debug, Clone, Default)]
pub struct DtlsKeys {
    pub pk_or_identity: Bytes,
    pub server_pk_or_identity: Bytes,
    pub secret_key: Bytes,
}

/// Security parameters handed to the socket backend.
#[derive(Debug, Clone)]
pub enum SecurityInfo {
    NoSec,
    Psk {
        identity: Bytes,
        key: Bytes,
    },
    Certificates {
        client_cert: Bytes,
        /// Server certificate; absent means no server validation.
        server_cert: Option<Bytes>,
        private_key: Bytes,
    },
}

/// (D)TLS protocol version requested from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DtlsVersion {
    #[default]
    Auto,
    Dtls1,
    Dtls1_2,
}

/// Everything the backend needs to create one connected socket.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub uri: ServerUri,
    pub security: SecurityInfo,
    pub version: DtlsVersion,
    pub session_resumption: bool,
    /// Requested local port; `None` asks for an ephemeral one.
    pub local_port: Option<u16>,
    pub reuse_addr: bool,
    /// Previously used remote address, to stabilize reconnects when the
    /// hostname resolves to several addresses.
    pub preferred_endpoint: Option<SocketAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Closed,
    Bound,
    Connected,
}

/// Transport-layer failure, classified as far as the socket layer can tell.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection timed out")]
    TimedOut,
    #[error("protocol error")]
    Protocol,
    #[error(transparent)]
    Io(io::Error),
}

impl NetError {
    /// Positive errno for the integer failure-code contract.
    pub fn errno(&self) -> i32 {
        match self {
            Self::ConnectionRefused => libc::ECONNREFUSED,
            Self::TimedOut => libc::ETIMEDOUT,
            Self::Protocol => libc::EPROTO,
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::TimedOut,
            _ => match err.raw_os_error() {
                Some(code) if code == libc::ECONNREFUSED => Self::ConnectionRefused,
                Some(code) if code == libc::ETIMEDOUT => Self::TimedOut,
                Some(code) if code == libc::EPROTO => Self::Protocol,
                _ => Self::Io(err),
            },
        }
    }
}

/// One connected (or connectable) socket towards a server.
///
/// `close` retains enough state (remote endpoint, session cache) for a
/// later `bind`/`connect` round to resume the DTLS session.
pub trait NetSocket {
    fn state(&self) -> SocketState;

    /// Bind to a local port before reconnecting. `local_addr` selects the
    /// wildcard address family; `None` leaves the choice to the OS.
    fn bind(&mut self, local_addr: Option<IpAddr>, port: u16) -> Result<(), NetError>;

    fn connect(&mut self, host: &str, port: u16) -> Result<(), NetError>;

    /// Close the socket, keeping the object reconnectable.
    fn close(&mut self);

    /// DTLS session-resumption status of the last `connect`; `None` for
    /// sockets without a session concept.
    fn session_resumed(&self) -> Option<bool>;

    fn local_port(&self) -> Option<u16>;

    fn remote_host(&self) -> Option<String>;

    /// `None` marks port-less pseudo-sockets (SMS-style transports).
    fn remote_port(&self) -> Option<u16>;

    /// Resolved remote address, used as the preferred endpoint on the next
    /// reconnect.
    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// Factory for connected sockets; implemented by the embedder's network
/// backend.
pub trait NetBackend {
    fn create_connected_socket(
        &mut self,
        config: &SocketConfig,
    ) -> Result<Box<dyn NetSocket>, NetError>;
}
