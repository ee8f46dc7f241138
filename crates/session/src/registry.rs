use std::time::{Duration, Instant};

use crate::{
    Job, Ssid,
    connection::{ConnType, ServerConnection},
    net::ServerUri,
    sched::{Scheduler, TaskHandle},
};

/// State of the registration held with one server.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistrationInfo {
    /// Transport carrying the registration; `None` means no valid
    /// registration connection (forces re-Register).
    pub conn_type: Option<ConnType>,
    /// Lifetime most recently acknowledged by the server.
    pub lifetime: Duration,
    /// Absolute deadline of the current registration.
    pub expires_at: Option<Instant>,
}

impl RegistrationInfo {
    /// Time left until the registration expires; zero once past the
    /// deadline or when no registration exists yet.
    pub fn time_remaining(&self, now: Instant) -> Duration {
        self.expires_at
            .map(|expires_at| expires_at.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    pub fn expired(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(expires_at) => now > expires_at,
            None => true,
        }
    }
}

/// Per-transport connection slots of an active server.
#[derive(Default)]
pub struct Connections {
    pub udp: ServerConnection,
    pub sms: ServerConnection,
}

impl Connections {
    pub fn get(&self, conn_type: ConnType) -> &ServerConnection {
        match conn_type {
            ConnType::UDP => &self.udp,
            ConnType::SMS => &self.sms,
        }
    }

    pub fn get_mut(&mut self, conn_type: ConnType) -> &mut ServerConnection {
        match conn_type {
            ConnType::UDP => &mut self.udp,
            ConnType::SMS => &mut self.sms,
        }
    }
}

/// A server with a live transport.
pub struct ActiveServer {
    pub ssid: Ssid,
    pub uri: ServerUri,
    pub connections: Connections,
    pub registration_info: RegistrationInfo,
    pub sched_update_handle: Option<TaskHandle>,
}

impl ActiveServer {
    pub fn new(ssid: Ssid, uri: ServerUri) -> Self {
        Self {
            ssid,
            uri,
            connections: Connections::default(),
            registration_info: RegistrationInfo::default(),
            sched_update_handle: None,
        }
    }

    /// Cancel owned jobs and destroy the sockets.
    pub(crate) fn cleanup(&mut self, sched: &mut Scheduler<Job>) {
        sched.cancel(&mut self.sched_update_handle);
        for conn_type in ConnType::ALL {
            self.connections.get_mut(conn_type).clean_socket();
        }
    }
}

/// A server awaiting reactivation.
pub struct InactiveServer {
    pub ssid: Ssid,
    pub reactivate_failed: bool,
    pub num_icmp_failures: u32,
    pub sched_reactivate_handle: Option<TaskHandle>,
}

impl InactiveServer {
    pub fn new(ssid: Ssid) -> Self {
        Self {
            ssid,
            reactivate_failed: false,
            num_icmp_failures: 0,
            sched_reactivate_handle: None,
        }
    }
}

/// The two server pools, each sorted by ascending SSID and disjoint from
/// the other. An SSID is *known* while a record for it exists in either.
#[derive(Default)]
pub struct Servers {
    active: Vec<ActiveServer>,
    inactive: Vec<InactiveServer>,
}

impl Servers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> &[ActiveServer] {
        &self.active
    }

    pub fn inactive(&self) -> &[InactiveServer] {
        &self.inactive
    }

    pub fn active_mut(&mut self) -> &mut [ActiveServer] {
        &mut self.active
    }

    pub fn inactive_mut(&mut self) -> &mut [InactiveServer] {
        &mut self.inactive
    }

    pub fn find_active(&self, ssid: Ssid) -> Option<&ActiveServer> {
        self.active
            .binary_search_by_key(&ssid, |server| server.ssid)
            .ok()
            .map(|index| &self.active[index])
    }

    pub fn find_active_mut(&mut self, ssid: Ssid) -> Option<&mut ActiveServer> {
        self.active
            .binary_search_by_key(&ssid, |server| server.ssid)
            .ok()
            .map(|index| &mut self.active[index])
    }

    pub fn find_inactive(&self, ssid: Ssid) -> Option<&InactiveServer> {
        self.inactive
            .binary_search_by_key(&ssid, |server| server.ssid)
            .ok()
            .map(|index| &self.inactive[index])
    }

    pub fn find_inactive_mut(&mut self, ssid: Ssid) -> Option<&mut InactiveServer> {
        self.inactive
            .binary_search_by_key(&ssid, |server| server.ssid)
            .ok()
            .map(|index| &mut self.inactive[index])
    }

    /// Splice an active record in, keeping the list sorted.
    ///
    /// Inserting an SSID already known to either pool is a programming
    /// error.
    pub fn add_active(&mut self, server: ActiveServer) {
        assert!(
            self.find_inactive(server.ssid).is_none(),
            "attempting to insert an active server while an inactive one with the same SSID \
             already exists"
        );
        let index = match self
            .active
            .binary_search_by_key(&server.ssid, |entry| entry.ssid)
        {
            Err(index) => index,
            Ok(_) => panic!("attempting to insert a duplicate of an existing active server entry"),
        };
        self.active.insert(index, server);
    }

    /// Splice an inactive record in, keeping the list sorted.
    pub fn add_inactive(&mut self, server: InactiveServer) {
        assert!(
            self.find_active(server.ssid).is_none(),
            "attempting to insert an inactive server while an active one with the same SSID \
             already exists"
        );
        let index = match self
            .inactive
            .binary_search_by_key(&server.ssid, |entry| entry.ssid)
        {
            Err(index) => index,
            Ok(_) => {
                panic!("attempting to insert a duplicate of an existing inactive server entry")
            }
        };
        self.inactive.insert(index, server);
    }

    pub fn remove_active(&mut self, ssid: Ssid) -> Option<ActiveServer> {
        self.active
            .binary_search_by_key(&ssid, |server| server.ssid)
            .ok()
            .map(|index| self.active.remove(index))
    }

    pub fn remove_inactive(&mut self, ssid: Ssid) -> Option<InactiveServer> {
        self.inactive
            .binary_search_by_key(&ssid, |server| server.ssid)
            .ok()
            .map(|index| self.inactive.remove(index))
    }

    /// Destroy both pools: cancel every owned scheduler handle and close
    /// every socket.
    pub fn cleanup_all(&mut self, sched: &mut Scheduler<Job>) {
        for server in &mut self.active {
            server.cleanup(sched);
        }
        self.active.clear();
        for server in &mut self.inactive {
            sched.cancel(&mut server.sched_reactivate_handle);
        }
        self.inactive.clear();
    }
}
