pub mod binding;
pub mod clock;
pub mod coap;
pub mod connection;
pub mod dm;
pub mod net;
pub mod registry;
pub mod sched;

mod activate;
mod register;

pub use activate::ActivateError;
pub use coap::{CoapContext, CoapError, REGISTRATION_UPDATE_REJECTED, UpdateParams};
pub use connection::{ConnRef, ConnType, RefreshError};
pub use dm::DataModel;
pub use net::{NetBackend, NetError};

use std::time::{Duration, Instant};

use thiserror::Error;

use crate::{
    clock::{Clock, SystemClock},
    connection::NetOpts,
    net::DtlsVersion,
    registry::{InactiveServer, Servers},
    sched::{JobOutcome, Scheduler},
};

/// Short Server ID.
pub type Ssid = u16;

/// Reserved "any server" value; never a concrete server identity.
pub const SSID_ANY: Ssid = 0;

/// Reserved identity of the Bootstrap Server account.
pub const SSID_BOOTSTRAP: Ssid = u16::MAX;

/// Update messages are sent every `lifetime / UPDATE_INTERVAL_MARGIN_FACTOR`
/// seconds, unless MAX_TRANSMIT_WAIT allows scheduling them later.
pub const UPDATE_INTERVAL_MARGIN_FACTOR: u32 = 2;

/// Update messages are never sent more often than this, to avoid flooding
/// the network when a very small lifetime is configured.
pub const MIN_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

pub const DEFAULT_MAX_ICMP_FAILURES: u32 = 7;

/// Entry points of the bootstrap subsystem.
pub trait Bootstrap {
    /// Start (or restart) a bootstrap exchange.
    fn account_prepare(&mut self) -> Result<(), CoapError>;

    /// Abort any further bootstrap retries and drop bootstrap state.
    fn cleanup(&mut self);

    /// A regular (non-bootstrap) server connection has just become usable.
    fn notify_regular_connection_available(&mut self);

    /// The bootstrap connection has been refreshed after a reconnect
    /// request.
    fn update_reconnected(&mut self) -> Result<(), CoapError>;

    fn in_progress(&self) -> bool;
}

/// Entry point of the observe/notify subsystem.
pub trait Observe {
    /// Flush notifications pending on the currently bound connection.
    fn sched_flush_current_connection(&mut self);
}

/// Aggregate bound for the one value holding every external collaborator.
pub trait Handlers: DataModel + CoapContext + Bootstrap + Observe + NetBackend {}

impl<T: DataModel + CoapContext + Bootstrap + Observe + NetBackend> Handlers for T {}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("the client is offline")]
    Offline,
    #[error("SSID {0} is not a known server")]
    UnknownServer(Ssid),
    #[error("SSID {0} is already a known server")]
    DuplicateServer(Ssid),
}

/// Scheduler payload: every job carries the SSID and re-looks the server
/// up when it fires, so nothing dangles across deactivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Job {
    Activate(Ssid),
    /// Packed `(ssid, socket_needs)`, see `register::send_update_args_encode`.
    SendUpdate(u32),
}

/// Borrowed view of the client handed to job bodies; keeps the registry
/// borrowable separately.
pub(crate) struct JobCtx<'a, H> {
    pub handlers: &'a mut H,
    pub sched: &'a mut Scheduler<Job>,
    pub now: Instant,
    pub net_opts: NetOpts,
    pub offline: bool,
    pub max_icmp_failures: u32,
}

pub struct ClientOptions {
    pub max_icmp_failures: u32,
    /// Local port to request for fresh UDP sockets; `None` binds
    /// ephemerally.
    pub udp_listen_port: Option<u16>,
    pub dtls_version: DtlsVersion,
    pub clock: Box<dyn Clock>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            max_icmp_failures: DEFAULT_MAX_ICMP_FAILURES,
            udp_listen_port: None,
            dtls_version: DtlsVersion::default(),
            clock: Box::new(SystemClock),
        }
    }
}

/// The client core: server pools, scheduler, offline flag and the
/// collaborator seams, driven cooperatively from a single thread.
pub struct Client<H> {
    pub(crate) handlers: H,
    pub(crate) servers: Servers,
    pub(crate) sched: Scheduler<Job>,
    pub(crate) clock: Box<dyn Clock>,
    pub(crate) offline: bool,
    pub(crate) max_icmp_failures: u32,
    pub(crate) net_opts: NetOpts,
}

impl<H: Handlers> Client<H> {
    pub fn new(handlers: H, options: ClientOptions) -> Self {
        Self {
            handlers,
            servers: Servers::new(),
            sched: Scheduler::new(),
            clock: options.clock,
            offline: false,
            max_icmp_failures: options.max_icmp_failures,
            net_opts: NetOpts {
                udp_listen_port: options.udp_listen_port,
                dtls_version: options.dtls_version,
            },
        }
    }

    pub fn handlers(&self) -> &H {
        &self.handlers
    }

    pub fn handlers_mut(&mut self) -> &mut H {
        &mut self.handlers
    }

    pub fn servers(&self) -> &Servers {
        &self.servers
    }

    pub fn is_offline(&self) -> bool {
        self.offline
    }

    /// Stop all communication: every connection is suspended and no job
    /// will bring one up until `schedule_reconnect`.
    pub fn enter_offline(&mut self) {
        self.offline = true;
        for server in self.servers.active_mut() {
            connection::suspend_server(server, None);
        }
    }

    /// True iff no server is active and every inactive one has exhausted
    /// its failure budget.
    pub fn all_connections_failed(&self) -> bool {
        activate::all_connections_failed(&self.servers, self.max_icmp_failures)
    }

    /// Make an SSID known, in the inactive pool. Activation is scheduled
    /// separately via `sched_activate_server`.
    pub fn add_server(&mut self, ssid: Ssid) -> Result<(), ClientError> {
        debug_assert!(ssid != SSID_ANY);
        if self.servers.find_active(ssid).is_some() || self.servers.find_inactive(ssid).is_some() {
            return Err(ClientError::DuplicateServer(ssid));
        }
        self.servers.add_inactive(InactiveServer::new(ssid));
        Ok(())
    }

    /// Deadline of the earliest pending job.
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.sched.next_deadline()
    }

    /// Run every job whose deadline has passed; returns how many ran.
    ///
    /// Jobs run to completion on the calling thread; blocking I/O inside a
    /// job blocks the whole subsystem.
    pub fn handle_scheduled(&mut self) -> usize {
        let now = self.clock.now();
        let mut handled = 0;
        while let Some(job) = self.sched.pop_due(now) {
            handled += 1;
            let outcome = {
                let mut ctx = JobCtx {
                    handlers: &mut self.handlers,
                    sched: &mut self.sched,
                    now,
                    net_opts: self.net_opts,
                    offline: self.offline,
                    max_icmp_failures: self.max_icmp_failures,
                };
                match job.payload {
                    Job::Activate(ssid) => {
                        activate::activate_server_job(&mut ctx, &mut self.servers, ssid)
                    }
                    Job::SendUpdate(packed) => {
                        register::send_update_sched_job(&mut ctx, &mut self.servers, packed)
                    }
                }
            };
            if outcome == JobOutcome::Retry {
                self.sched.requeue_retry(now, job);
            }
        }
        handled
    }

    /// Tear everything down: cancel every job, close every socket, forget
    /// every server.
    pub fn cleanup(&mut self) {
        self.servers.cleanup_all(&mut self.sched);
        self.sched.clear();
    }
}
