use std::fmt;

use bytes::Bytes;

use crate::Ssid;

/// Object Instance ID.
pub type Iid = u16;

pub const OID_SECURITY: u16 = 0;
pub const OID_SERVER: u16 = 1;

pub const RID_SECURITY_SERVER_URI: u16 = 0;
pub const RID_SECURITY_MODE: u16 = 2;
pub const RID_SECURITY_PK_OR_IDENTITY: u16 = 3;
pub const RID_SECURITY_SERVER_PK_OR_IDENTITY: u16 = 4;
pub const RID_SECURITY_SECRET_KEY: u16 = 5;

pub const RID_SERVER_LIFETIME: u16 = 1;
pub const RID_SERVER_BINDING: u16 = 7;

/// Path of a single resource in the data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourcePath {
    pub oid: u16,
    pub iid: Iid,
    pub rid: u16,
}

impl ResourcePath {
    pub const fn new(oid: u16, iid: Iid, rid: u16) -> Self {
        Self { oid, iid, rid }
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}/{}", self.oid, self.iid, self.rid)
    }
}

/// Read access to the Security and Server object stores.
///
/// The store itself lives outside this crate; the session core only ever
/// reads, and treats every answer as a snapshot.
pub trait DataModel {
    /// Security object instance describing the given server.
    fn security_iid(&self, ssid: Ssid) -> Option<Iid>;

    /// Server object instance for the given server; Bootstrap Server
    /// accounts have none.
    fn server_iid(&self, ssid: Ssid) -> Option<Iid>;

    fn read_i64(&self, path: ResourcePath) -> Option<i64>;

    fn read_string(&self, path: ResourcePath) -> Option<String>;

    fn read_bytes(&self, path: ResourcePath) -> Option<Bytes>;

    /// Whether any Security instance references the given SSID.
    fn ssid_exists(&self, ssid: Ssid) -> bool;
}
