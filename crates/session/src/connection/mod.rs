pub mod info;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;

use crate::{
    Handlers, Ssid,
    binding::{ConnectionMode, binding_mode_from_connection_modes},
    net::{DtlsVersion, NetError, NetSocket, SocketConfig, SocketState},
    registry::ActiveServer,
};

use self::info::InfoError;

/// Transport carrying a server connection.
///
/// The order of the variants is the order in which transports are probed
/// when picking a registration connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnType {
    UDP,
    SMS,
}

impl ConnType {
    pub const ALL: [ConnType; 2] = [ConnType::UDP, ConnType::SMS];
}

/// Value-type reference to one transport of one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnRef {
    pub ssid: Ssid,
    pub conn_type: ConnType,
}

/// Connection defaults taken from the client configuration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NetOpts {
    pub udp_listen_port: Option<u16>,
    pub dtls_version: DtlsVersion,
}

/// Outcome of refreshing one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefreshState {
    Disabled,
    Resumed,
    NewConnection,
}

impl RefreshState {
    fn is_connected(self) -> bool {
        matches!(self, Self::Resumed | Self::NewConnection)
    }
}

/// Failure of a connection refresh.
///
/// The integer rendering keeps the documented convention: positive errno
/// for a primary (UDP) socket error, negative for everything else.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("transport error: {0}")]
    Transport(#[from] NetError),
    #[error("connection setup failed: {0}")]
    Config(#[from] InfoError),
    #[error("no transport is usable")]
    NoTransport,
}

impl RefreshError {
    pub fn code(&self) -> i32 {
        match self {
            Self::Transport(err) => err.errno(),
            Self::Config(_) | Self::NoTransport => -1,
        }
    }
}

/// One socket slot of an active server.
///
/// The socket is owned exclusively; `suspend` closes it while keeping the
/// object reconnectable, `clean_socket` destroys it together with the
/// cached endpoint data.
#[derive(Default)]
pub struct ServerConnection {
    socket: Option<Box<dyn NetSocket>>,
    preferred_endpoint: Option<SocketAddr>,
    last_local_port: Option<u16>,
    pub queue_mode: bool,
    pub needs_reconnect: bool,
}

impl ServerConnection {
    pub fn socket(&self) -> Option<&dyn NetSocket> {
        self.socket.as_deref()
    }

    /// Destroy the socket and the private data cached alongside it.
    pub fn clean_socket(&mut self) {
        self.socket = None;
        self.preferred_endpoint = None;
        self.last_local_port = None;
    }

    pub fn is_online(&self) -> bool {
        self.socket
            .as_ref()
            .is_some_and(|socket| socket.state() == SocketState::Connected)
    }

    /// Close the socket but retain it for a later `bring_online`.
    pub fn suspend(&mut self) {
        if let Some(socket) = self.socket.as_mut() {
            socket.close();
        }
    }

    /// Effective mode: `Disabled` without a socket, otherwise per the
    /// queue-mode flag.
    pub fn current_mode(&self) -> ConnectionMode {
        if self.socket.is_none() {
            ConnectionMode::Disabled
        } else if self.queue_mode {
            ConnectionMode::Queue
        } else {
            ConnectionMode::Online
        }
    }

    /// Reconnect a suspended socket: bind to the previously used local
    /// port (when known) and connect to the remembered peer.
    ///
    /// Returns the DTLS session-resumption status. Non-DTLS sockets count
    /// as resumed iff the peer has no port; that is the SMS-pseudo-socket
    /// proxy.
    pub fn bring_online(&mut self) -> Result<bool, NetError> {
        let Some(socket) = self.socket.as_mut() else {
            return Err(NetError::Protocol);
        };
        debug_assert!(socket.state() != SocketState::Connected);

        let Some(remote_host) = socket.remote_host() else {
            log::error!("could not get peer address of a suspended connection");
            return Err(NetError::Protocol);
        };
        let remote_port = socket.remote_port();

        // Skipping bind is fine: connect() binds to an ephemeral port.
        if let Some(port) = self.last_local_port {
            // Pick the wildcard family matching the remote literal, so that
            // platforms with IPv4-mapped-IPv6 disabled can still rebind a
            // recently used port.
            let local_addr = if remote_host.contains(':') {
                Some(IpAddr::V6(Ipv6Addr::UNSPECIFIED))
            } else if remote_host.contains('.') {
                Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
            } else {
                None
            };

            if let Err(err) = socket.bind(local_addr, port) {
                log::error!("could not bind socket to port {}: {}", port, err);
                socket.close();
                return Err(err);
            }
        }

        if let Err(err) = socket.connect(&remote_host, remote_port.unwrap_or(0)) {
            log::error!(
                "could not connect to {}:{}: {}",
                remote_host,
                remote_port.unwrap_or(0),
                err
            );
            socket.close();
            return Err(err);
        }

        let session_resumed = socket
            .session_resumed()
            .unwrap_or_else(|| remote_port.is_none());
        log::info!(
            "{} to {}:{}",
            if session_resumed {
                "resumed connection"
            } else {
                "reconnected"
            },
            remote_host,
            remote_port.unwrap_or(0)
        );
        Ok(session_resumed)
    }
}

fn recreate_socket<H: Handlers>(
    handlers: &mut H,
    opts: NetOpts,
    server_uri: &crate::net::ServerUri,
    security_iid: crate::dm::Iid,
    connection: &mut ServerConnection,
) -> Result<(), RefreshError> {
    let udp_info = info::udp_connection_info(
        handlers,
        security_iid,
        Some(server_uri),
        connection.socket().and_then(|socket| socket.local_port()),
        opts.udp_listen_port,
    )?;
    let preferred_endpoint = connection.preferred_endpoint;
    connection.clean_socket();

    let config = SocketConfig {
        uri: server_uri.clone(),
        security: udp_info.security,
        version: opts.dtls_version,
        session_resumption: true,
        local_port: udp_info.local_port,
        reuse_addr: true,
        preferred_endpoint,
    };
    match handlers.create_connected_socket(&config) {
        Ok(socket) => {
            log::info!("connected to {}:{}", server_uri.host, server_uri.port);
            connection.last_local_port = socket.local_port();
            connection.preferred_endpoint = socket.peer_addr();
            connection.socket = Some(socket);
            Ok(())
        }
        Err(err) => {
            log::error!("could not create CoAP socket: {}", err);
            Err(RefreshError::Transport(err))
        }
    }
}

fn ensure_socket_connected<H: Handlers>(
    handlers: &mut H,
    opts: NetOpts,
    server_uri: &crate::net::ServerUri,
    security_iid: crate::dm::Iid,
    connection: &mut ServerConnection,
    reconnect: bool,
) -> Result<RefreshState, RefreshError> {
    if connection.socket.is_none() {
        recreate_socket(handlers, opts, server_uri, security_iid, connection)?;
        return Ok(RefreshState::NewConnection);
    }

    if reconnect {
        if let Some(socket) = connection.socket.as_mut() {
            socket.close();
        }
    }
    if connection.is_online() {
        return Ok(RefreshState::Resumed);
    }
    let session_resumed = connection.bring_online()?;
    Ok(if session_resumed {
        RefreshState::Resumed
    } else {
        RefreshState::NewConnection
    })
}

/// Refresh one transport of a server: tear down when the binding disables
/// it, otherwise make sure a connected socket exists.
fn refresh_connection<H: Handlers>(
    handlers: &mut H,
    opts: NetOpts,
    server_uri: &crate::net::ServerUri,
    security_iid: crate::dm::Iid,
    mode: ConnectionMode,
    connection: &mut ServerConnection,
    force_reconnect: bool,
) -> Result<RefreshState, RefreshError> {
    let result = if mode == ConnectionMode::Disabled {
        connection.clean_socket();
        Ok(RefreshState::Disabled)
    } else {
        ensure_socket_connected(
            handlers,
            opts,
            server_uri,
            security_iid,
            connection,
            force_reconnect || connection.needs_reconnect,
        )
    };
    connection.needs_reconnect = false;
    connection.queue_mode = mode == ConnectionMode::Queue;
    result
}

/// Refresh every enabled transport of the server.
///
/// When this ends up replacing the connection that carries the current
/// registration, the registration transport is reset so the caller goes
/// through re-Register.
pub(crate) fn refresh_server<H: Handlers>(
    handlers: &mut H,
    opts: NetOpts,
    server: &mut ActiveServer,
    force_reconnect: bool,
) -> Result<(), RefreshError> {
    log::trace!(
        "refreshing SSID {}, force_reconnect == {}",
        server.ssid,
        force_reconnect
    );

    let common = info::common_connection_info(handlers, server.ssid)?;

    let udp_result = refresh_connection(
        handlers,
        opts,
        &server.uri,
        common.security_iid,
        common.udp_mode,
        &mut server.connections.udp,
        force_reconnect,
    );
    // No SMS router: the secondary transport never comes up on its own.
    let sms_result = RefreshState::Disabled;

    let udp_state = match udp_result {
        Ok(state) => state,
        Err(err) => {
            if !sms_result.is_connected() {
                return Err(err);
            }
            RefreshState::Disabled
        }
    };

    if !udp_state.is_connected() && !sms_result.is_connected() {
        return Err(RefreshError::NoTransport);
    }

    if (server.registration_info.conn_type == Some(ConnType::UDP)
        && udp_state == RefreshState::NewConnection)
        || (server.registration_info.conn_type == Some(ConnType::SMS)
            && sms_result == RefreshState::NewConnection)
    {
        // The registration ran over a connection that no longer exists;
        // forces re-register.
        server.registration_info.conn_type = None;
    }

    Ok(())
}

/// Close the sockets of one transport, or of all of them when `conn_type`
/// is `None`.
pub(crate) fn suspend_server(server: &mut ActiveServer, conn_type: Option<ConnType>) {
    match conn_type {
        Some(conn_type) => server.connections.get_mut(conn_type).suspend(),
        None => {
            for conn_type in ConnType::ALL {
                server.connections.get_mut(conn_type).suspend();
            }
        }
    }
}

/// Derive the binding mode a server is effectively using from the state of
/// its live connections.
pub fn cached_binding_mode(server: &ActiveServer) -> crate::binding::BindingMode {
    binding_mode_from_connection_modes(
        server.connections.get(ConnType::UDP).current_mode(),
        server.connections.get(ConnType::SMS).current_mode(),
    )
}
