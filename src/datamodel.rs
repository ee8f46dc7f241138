use std::fs;

use anyhow::Context;
use bytes::Bytes;
use session::{
    SSID_BOOTSTRAP, Ssid,
    dm::{
        self, DataModel, Iid, RID_SECURITY_MODE, RID_SECURITY_PK_OR_IDENTITY,
        RID_SECURITY_SECRET_KEY, RID_SECURITY_SERVER_PK_OR_IDENTITY, RID_SECURITY_SERVER_URI,
        RID_SERVER_BINDING, RID_SERVER_LIFETIME, ResourcePath,
    },
};

use crate::config::{Config, Security, Server};

struct SecurityInstance {
    iid: Iid,
    ssid: Ssid,
    uri: String,
    mode: i64,
    pk_or_identity: Bytes,
    server_pk_or_identity: Bytes,
    secret_key: Bytes,
}

struct ServerInstance {
    iid: Iid,
    ssid: Ssid,
    lifetime: i64,
    binding: String,
}

/// Security/Server object store populated from the configuration file.
///
/// Instance IDs are assigned in configuration order. The Bootstrap Server
/// account gets a Security instance only, like any bootstrapped data
/// model.
pub struct ConfigDataModel {
    security: Vec<SecurityInstance>,
    servers: Vec<ServerInstance>,
}

fn read_credential(path: &str) -> anyhow::Result<Bytes> {
    let data = fs::read(path).with_context(|| format!("could not read credential file {}", path))?;
    Ok(Bytes::from(data))
}

impl ConfigDataModel {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut security = Vec::new();
        let mut servers = Vec::new();

        for (index, entry) in config.servers.iter().enumerate() {
            let iid = index as Iid;
            let ssid = if entry.bootstrap {
                SSID_BOOTSTRAP
            } else {
                entry.ssid
            };
            security.push(Self::security_instance(iid, ssid, entry)?);
            if !entry.bootstrap {
                servers.push(ServerInstance {
                    iid,
                    ssid,
                    lifetime: entry.lifetime,
                    binding: entry.binding.clone(),
                });
            }
        }

        Ok(Self { security, servers })
    }

    fn security_instance(iid: Iid, ssid: Ssid, entry: &Server) -> anyhow::Result<SecurityInstance> {
        // LwM2M Security Mode resource values: 0 PSK, 2 Certificate,
        // 3 NoSec.
        let (mode, pk_or_identity, server_pk_or_identity, secret_key) = match &entry.security {
            Security::Nosec => (3, Bytes::new(), Bytes::new(), Bytes::new()),
            Security::Psk { identity, key } => (
                0,
                Bytes::copy_from_slice(identity.as_bytes()),
                Bytes::new(),
                Bytes::copy_from_slice(key.as_bytes()),
            ),
            Security::Certificate {
                client_cert,
                server_cert,
                private_key,
            } => (
                2,
                read_credential(client_cert)?,
                server_cert
                    .as_deref()
                    .map(read_credential)
                    .transpose()?
                    .unwrap_or_default(),
                read_credential(private_key)?,
            ),
        };
        Ok(SecurityInstance {
            iid,
            ssid,
            uri: entry.uri.clone(),
            mode,
            pk_or_identity,
            server_pk_or_identity,
            secret_key,
        })
    }

    fn security_instance_by_iid(&self, iid: Iid) -> Option<&SecurityInstance> {
        self.security.iter().find(|instance| instance.iid == iid)
    }

    fn server_instance_by_iid(&self, iid: Iid) -> Option<&ServerInstance> {
        self.servers.iter().find(|instance| instance.iid == iid)
    }
}

impl DataModel for ConfigDataModel {
    fn security_iid(&self, ssid: Ssid) -> Option<Iid> {
        self.security
            .iter()
            .find(|instance| instance.ssid == ssid)
            .map(|instance| instance.iid)
    }

    fn server_iid(&self, ssid: Ssid) -> Option<Iid> {
        self.servers
            .iter()
            .find(|instance| instance.ssid == ssid)
            .map(|instance| instance.iid)
    }

    fn read_i64(&self, path: ResourcePath) -> Option<i64> {
        match (path.oid, path.rid) {
            (dm::OID_SECURITY, RID_SECURITY_MODE) => {
                self.security_instance_by_iid(path.iid).map(|i| i.mode)
            }
            (dm::OID_SERVER, RID_SERVER_LIFETIME) => {
                self.server_instance_by_iid(path.iid).map(|i| i.lifetime)
            }
            _ => None,
        }
    }

    fn read_string(&self, path: ResourcePath) -> Option<String> {
        match (path.oid, path.rid) {
            (dm::OID_SECURITY, RID_SECURITY_SERVER_URI) => {
                self.security_instance_by_iid(path.iid).map(|i| i.uri.clone())
            }
            (dm::OID_SERVER, RID_SERVER_BINDING) => self
                .server_instance_by_iid(path.iid)
                .map(|i| i.binding.clone()),
            _ => None,
        }
    }

    fn read_bytes(&self, path: ResourcePath) -> Option<Bytes> {
        if path.oid != dm::OID_SECURITY {
            return None;
        }
        let instance = self.security_instance_by_iid(path.iid)?;
        let bytes = match path.rid {
            RID_SECURITY_PK_OR_IDENTITY => &instance.pk_or_identity,
            RID_SECURITY_SERVER_PK_OR_IDENTITY => &instance.server_pk_or_identity,
            RID_SECURITY_SECRET_KEY => &instance.secret_key,
            _ => return None,
        };
        if bytes.is_empty() {
            return None;
        }
        Some(bytes.clone())
    }

    fn ssid_exists(&self, ssid: Ssid) -> bool {
        self.security.iter().any(|instance| instance.ssid == ssid)
    }
}
