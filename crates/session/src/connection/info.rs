use bytes::Bytes;
use thiserror::Error;

use crate::{
    SSID_BOOTSTRAP, Ssid,
    binding::{BindingMode, ConnectionMode},
    dm::{
        self, DataModel, Iid, RID_SECURITY_MODE, RID_SECURITY_PK_OR_IDENTITY,
        RID_SECURITY_SECRET_KEY, RID_SECURITY_SERVER_PK_OR_IDENTITY, RID_SERVER_BINDING,
        ResourcePath,
    },
    net::{
        DtlsKeys, MAX_PK_OR_IDENTITY_SIZE, MAX_SECRET_KEY_SIZE, MAX_SERVER_PK_OR_IDENTITY_SIZE,
        SecurityInfo, ServerUri, UdpSecurityMode,
    },
};

/// Configuration problem that makes a connection impossible to set up.
#[derive(Debug, Error)]
pub enum InfoError {
    #[error("could not find server Security IID")]
    MissingSecurityInstance,
    #[error("could not read binding mode")]
    BadBindingMode,
    #[error("could not read LwM2M server security mode")]
    MissingSecurityMode,
    #[error("unsupported security mode: {0}")]
    UnsupportedSecurityMode(i64),
    #[error("invalid security mode: {0}")]
    InvalidSecurityMode(i64),
    #[error("URI protocol does not match security mode")]
    UriProtocolMismatch,
    #[error("read {0} failed")]
    MissingKey(ResourcePath),
    #[error("resource {0} exceeds the allowed size")]
    OversizedKey(ResourcePath),
    #[error("transport not supported")]
    UnsupportedTransport,
}

/// Transport-independent part of the connection info.
pub(crate) struct CommonConnectionInfo {
    pub security_iid: Iid,
    pub udp_mode: ConnectionMode,
    #[allow(dead_code)]
    pub sms_mode: ConnectionMode,
}

/// UDP-specific part, produced only when a socket actually needs to be
/// (re)created.
pub(crate) struct UdpConnectionInfo {
    pub security: SecurityInfo,
    pub local_port: Option<u16>,
}

fn read_binding_mode<D: DataModel + ?Sized>(dm: &D, ssid: Ssid) -> BindingMode {
    if let Some(iid) = dm.server_iid(ssid) {
        if let Some(value) = dm.read_string(ResourcePath::new(dm::OID_SERVER, iid, RID_SERVER_BINDING))
        {
            return BindingMode::parse(&value);
        }
    }
    log::warn!("could not read binding mode for LwM2M server {}", ssid);
    BindingMode::None
}

/// `(udp_mode, sms_mode)` for the server. The Bootstrap Server has no
/// Server object instance and always talks online over UDP.
fn connection_modes<D: DataModel + ?Sized>(
    dm: &D,
    ssid: Ssid,
) -> Result<(ConnectionMode, ConnectionMode), InfoError> {
    if ssid == SSID_BOOTSTRAP {
        return Ok((ConnectionMode::Online, ConnectionMode::Disabled));
    }
    read_binding_mode(dm, ssid)
        .connection_modes()
        .ok_or(InfoError::BadBindingMode)
}

pub(crate) fn common_connection_info<D: DataModel + ?Sized>(
    dm: &D,
    ssid: Ssid,
) -> Result<CommonConnectionInfo, InfoError> {
    let security_iid = dm.security_iid(ssid).ok_or_else(|| {
        log::error!("could not find server Security IID");
        InfoError::MissingSecurityInstance
    })?;
    let (udp_mode, sms_mode) = connection_modes(dm, ssid)?;
    Ok(CommonConnectionInfo {
        security_iid,
        udp_mode,
        sms_mode,
    })
}

fn udp_security_mode<D: DataModel + ?Sized>(
    dm: &D,
    security_iid: Iid,
) -> Result<UdpSecurityMode, InfoError> {
    let path = ResourcePath::new(dm::OID_SECURITY, security_iid, RID_SECURITY_MODE);
    let value = dm.read_i64(path).ok_or(InfoError::MissingSecurityMode)?;
    match UdpSecurityMode::from_resource_value(value) {
        Some(UdpSecurityMode::Rpk) => {
            log::error!("unsupported security mode: {}", value);
            Err(InfoError::UnsupportedSecurityMode(value))
        }
        Some(mode) => Ok(mode),
        None => {
            log::error!("invalid security mode: {}", value);
            Err(InfoError::InvalidSecurityMode(value))
        }
    }
}

fn uri_protocol_matching(security_mode: UdpSecurityMode, uri: &ServerUri) -> bool {
    let expected = if security_mode == UdpSecurityMode::NoSec {
        "coap"
    } else {
        "coaps"
    };
    if uri.scheme.as_str() != expected {
        log::warn!(
            "URI protocol mismatch: security mode {:?} requires '{}', but '{}' was configured",
            security_mode,
            expected,
            uri.scheme
        );
        return false;
    }
    true
}

fn read_key<D: DataModel + ?Sized>(
    dm: &D,
    path: ResourcePath,
    required: bool,
    capacity: usize,
) -> Result<Bytes, InfoError> {
    match dm.read_bytes(path) {
        Some(bytes) if bytes.len() > capacity => Err(InfoError::OversizedKey(path)),
        Some(bytes) => Ok(bytes),
        None if required => {
            log::warn!("read {} failed", path);
            Err(InfoError::MissingKey(path))
        }
        None => Ok(Bytes::new()),
    }
}

fn udp_dtls_keys<D: DataModel + ?Sized>(
    dm: &D,
    security_iid: Iid,
    security_mode: UdpSecurityMode,
) -> Result<DtlsKeys, InfoError> {
    if security_mode == UdpSecurityMode::NoSec {
        return Ok(DtlsKeys::default());
    }

    Ok(DtlsKeys {
        pk_or_identity: read_key(
            dm,
            ResourcePath::new(dm::OID_SECURITY, security_iid, RID_SECURITY_PK_OR_IDENTITY),
            true,
            MAX_PK_OR_IDENTITY_SIZE,
        )?,
        server_pk_or_identity: read_key(
            dm,
            ResourcePath::new(
                dm::OID_SECURITY,
                security_iid,
                RID_SECURITY_SERVER_PK_OR_IDENTITY,
            ),
            security_mode != UdpSecurityMode::Psk,
            MAX_SERVER_PK_OR_IDENTITY_SIZE,
        )?,
        secret_key: read_key(
            dm,
            ResourcePath::new(dm::OID_SECURITY, security_iid, RID_SECURITY_SECRET_KEY),
            true,
            MAX_SECRET_KEY_SIZE,
        )?,
    })
}

fn security_info(
    security_mode: UdpSecurityMode,
    keys: DtlsKeys,
) -> Result<SecurityInfo, InfoError> {
    match security_mode {
        UdpSecurityMode::NoSec => Ok(SecurityInfo::NoSec),
        UdpSecurityMode::Psk => Ok(SecurityInfo::Psk {
            identity: keys.pk_or_identity,
            key: keys.secret_key,
        }),
        UdpSecurityMode::Certificate => Ok(SecurityInfo::Certificates {
            client_cert: keys.pk_or_identity,
            server_cert: (!keys.server_pk_or_identity.is_empty())
                .then_some(keys.server_pk_or_identity),
            private_key: keys.secret_key,
        }),
        UdpSecurityMode::Rpk => Err(InfoError::UnsupportedSecurityMode(1)),
    }
}

/// Local port requested for the new socket: the old socket's port when one
/// exists, then the configured listen port, then ephemeral.
fn requested_local_port(
    existing_local_port: Option<u16>,
    udp_listen_port: Option<u16>,
) -> Option<u16> {
    existing_local_port.or(udp_listen_port)
}

/// Assemble everything needed to (re)create the UDP socket. Pure given the
/// data-model snapshot and the prior socket.
pub(crate) fn udp_connection_info<D: DataModel + ?Sized>(
    dm: &D,
    security_iid: Iid,
    uri: Option<&ServerUri>,
    existing_local_port: Option<u16>,
    udp_listen_port: Option<u16>,
) -> Result<UdpConnectionInfo, InfoError> {
    let security_mode = udp_security_mode(dm, security_iid)?;
    if let Some(uri) = uri {
        if !uri_protocol_matching(security_mode, uri) {
            return Err(InfoError::UriProtocolMismatch);
        }
    }
    let keys = udp_dtls_keys(dm, security_iid, security_mode)?;
    let local_port = requested_local_port(existing_local_port, udp_listen_port);
    log::debug!(
        "server /{}/{}: local port {:?}, UDP security mode = {:?}",
        dm::OID_SECURITY,
        security_iid,
        local_port,
        security_mode
    );
    Ok(UdpConnectionInfo {
        security: security_info(security_mode, keys)?,
        local_port,
    })
}

/// Resolve the security parameters for a transport without touching any
/// live connection; used by the bootstrap subsystem to open its own
/// socket.
pub fn get_security_info<D: DataModel + ?Sized>(
    dm: &D,
    security_iid: Iid,
    conn_type: super::ConnType,
) -> Result<SecurityInfo, InfoError> {
    match conn_type {
        super::ConnType::UDP => {
            udp_connection_info(dm, security_iid, None, None, None).map(|info| info.security)
        }
        super::ConnType::SMS => Err(InfoError::UnsupportedTransport),
    }
}
