use std::{
    io::{self, Read, Write},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket},
    time::Duration,
};

use openssl::{
    error::ErrorStack,
    pkey::PKey,
    ssl::{
        Ssl, SslContext, SslMethod, SslSession, SslSessionCacheMode, SslStream, SslVerifyMode,
        SslVersion,
    },
    x509::{X509, store::X509StoreBuilder},
};
use socket2::{Domain, Protocol, Socket, Type};

use session::net::{
    DtlsVersion, NetBackend, NetError, NetSocket, SecurityInfo, SocketConfig, SocketState,
};

/// Upper bound on a blocking DTLS handshake; a peer that answers slower
/// than this counts as timed out.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Connected-UDP channel a DTLS stream runs over.
struct UdpChannel {
    socket: UdpSocket,
}

impl Read for UdpChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf)
    }
}

impl Write for UdpChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum Stream {
    Plain(UdpSocket),
    Dtls(SslStream<UdpChannel>),
}

/// Blocking connected-UDP socket, optionally wrapped in DTLS.
///
/// `close` keeps the remote endpoint and the DTLS session around, so a
/// later `bind` + `connect` round reconnects and attempts session
/// resumption.
pub struct UdpNetSocket {
    stream: Option<Stream>,
    context: Option<SslContext>,
    session: Option<SslSession>,
    resumed: Option<bool>,
    state: SocketState,
    local_port: Option<u16>,
    pending_bind: Option<(Option<IpAddr>, u16)>,
    remote: Option<(String, u16)>,
    peer: Option<SocketAddr>,
    reuse_addr: bool,
    preferred_endpoint: Option<SocketAddr>,
}

fn resolve(
    host: &str,
    port: u16,
    preferred: Option<SocketAddr>,
) -> Result<SocketAddr, NetError> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    if let Some(preferred) = preferred {
        if addrs.contains(&preferred) {
            return Ok(preferred);
        }
    }
    addrs
        .into_iter()
        .next()
        .ok_or_else(|| NetError::Io(io::Error::new(io::ErrorKind::NotFound, "host not found")))
}

fn wildcard_for(addr: SocketAddr) -> IpAddr {
    if addr.is_ipv6() {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }
}

fn build_ssl_context(
    security: &SecurityInfo,
    version: DtlsVersion,
    session_resumption: bool,
) -> Result<SslContext, ErrorStack> {
    let mut builder = SslContext::builder(SslMethod::dtls())?;
    match version {
        DtlsVersion::Auto => {}
        DtlsVersion::Dtls1 => builder.set_min_proto_version(Some(SslVersion::DTLS1))?,
        DtlsVersion::Dtls1_2 => builder.set_min_proto_version(Some(SslVersion::DTLS1_2))?,
    }
    if session_resumption {
        builder.set_session_cache_mode(SslSessionCacheMode::CLIENT);
    }

    match security {
        SecurityInfo::NoSec => {}
        SecurityInfo::Psk { identity, key } => {
            let identity = identity.to_vec();
            let key = key.to_vec();
            builder.set_psk_client_callback(move |_, _, identity_out, psk_out| {
                if identity.len() + 1 > identity_out.len() || key.len() > psk_out.len() {
                    return Ok(0);
                }
                identity_out[..identity.len()].copy_from_slice(&identity);
                identity_out[identity.len()] = 0;
                psk_out[..key.len()].copy_from_slice(&key);
                Ok(key.len())
            });
            builder.set_cipher_list("PSK")?;
        }
        SecurityInfo::Certificates {
            client_cert,
            server_cert,
            private_key,
        } => {
            let cert = X509::from_der(client_cert).or_else(|_| X509::from_pem(client_cert))?;
            builder.set_certificate(&cert)?;
            let key = PKey::private_key_from_der(private_key)
                .or_else(|_| PKey::private_key_from_pem(private_key))?;
            builder.set_private_key(&key)?;
            builder.check_private_key()?;
            match server_cert {
                Some(server_cert) => {
                    let ca =
                        X509::from_der(server_cert).or_else(|_| X509::from_pem(server_cert))?;
                    let mut store = X509StoreBuilder::new()?;
                    store.add_cert(ca)?;
                    builder.set_verify_cert_store(store.build())?;
                    builder.set_verify(SslVerifyMode::PEER);
                }
                None => builder.set_verify(SslVerifyMode::NONE),
            }
        }
    }
    Ok(builder.build())
}

fn handshake_error(err: openssl::ssl::Error) -> NetError {
    match err.into_io_error() {
        Ok(io_err) => NetError::from(io_err),
        Err(_) => NetError::Protocol,
    }
}

impl UdpNetSocket {
    /// Borrow the underlying datagram socket, e.g. to hand it to a CoAP
    /// message engine.
    pub fn raw_socket(&self) -> Option<&UdpSocket> {
        match self.stream.as_ref()? {
            Stream::Plain(socket) => Some(socket),
            Stream::Dtls(stream) => Some(&stream.get_ref().socket),
        }
    }
}

impl NetSocket for UdpNetSocket {
    fn state(&self) -> SocketState {
        self.state
    }

    fn bind(&mut self, local_addr: Option<IpAddr>, port: u16) -> Result<(), NetError> {
        self.pending_bind = Some((local_addr, port));
        self.state = SocketState::Bound;
        Ok(())
    }

    fn connect(&mut self, host: &str, port: u16) -> Result<(), NetError> {
        let addr = resolve(host, port, self.preferred_endpoint)?;

        let domain = if addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let raw = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        if self.reuse_addr {
            raw.set_reuse_address(true)?;
        }
        let (bind_addr, bind_port) = match self.pending_bind.take() {
            Some((Some(ip), bind_port)) => (ip, bind_port),
            Some((None, bind_port)) => (wildcard_for(addr), bind_port),
            None => (wildcard_for(addr), 0),
        };
        raw.bind(&SocketAddr::new(bind_addr, bind_port).into())?;

        let socket: UdpSocket = raw.into();
        socket.connect(addr)?;
        socket.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;

        self.local_port = socket.local_addr().ok().map(|local| local.port());
        self.peer = Some(addr);
        self.remote = Some((host.to_string(), port));

        match &self.context {
            None => {
                self.stream = Some(Stream::Plain(socket));
                self.resumed = None;
            }
            Some(context) => {
                let mut ssl = Ssl::new(context).map_err(|_| NetError::Protocol)?;
                if let Some(session) = &self.session {
                    unsafe { ssl.set_session(session) }.map_err(|_| NetError::Protocol)?;
                }
                let mut stream = SslStream::new(ssl, UdpChannel { socket })
                    .map_err(|_| NetError::Protocol)?;
                if let Err(err) = stream.connect() {
                    self.state = SocketState::Closed;
                    return Err(handshake_error(err));
                }
                self.resumed = Some(stream.ssl().session_reused());
                self.session = stream.ssl().session().map(|session| session.to_owned());
                self.stream = Some(Stream::Dtls(stream));
            }
        }
        self.state = SocketState::Connected;
        Ok(())
    }

    fn close(&mut self) {
        match self.stream.take() {
            Some(Stream::Dtls(mut stream)) => {
                // Keep the session for resumption on the next connect.
                self.session = stream.ssl().session().map(|session| session.to_owned());
                let _ = stream.shutdown();
            }
            Some(Stream::Plain(_)) | None => {}
        }
        self.state = SocketState::Closed;
    }

    fn session_resumed(&self) -> Option<bool> {
        self.resumed
    }

    fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    fn remote_host(&self) -> Option<String> {
        self.remote.as_ref().map(|(host, _)| host.clone())
    }

    fn remote_port(&self) -> Option<u16> {
        self.remote.as_ref().map(|(_, port)| *port)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// Socket factory over the std UDP stack with openssl DTLS.
#[derive(Debug, Default)]
pub struct UdpBackend;

impl NetBackend for UdpBackend {
    fn create_connected_socket(
        &mut self,
        config: &SocketConfig,
    ) -> Result<Box<dyn NetSocket>, NetError> {
        let context = match &config.security {
            SecurityInfo::NoSec => None,
            security => Some(
                build_ssl_context(security, config.version, config.session_resumption)
                    .map_err(|_| NetError::Protocol)?,
            ),
        };
        let mut socket = UdpNetSocket {
            stream: None,
            context,
            session: None,
            resumed: None,
            state: SocketState::Closed,
            local_port: None,
            pending_bind: config.local_port.map(|port| (None, port)),
            remote: None,
            peer: None,
            reuse_addr: config.reuse_addr,
            preferred_endpoint: config.preferred_endpoint,
        };
        socket.connect(&config.uri.host, config.uri.port)?;
        Ok(Box::new(socket))
    }
}
