use std::{
    cell::RefCell,
    collections::VecDeque,
    net::{IpAddr, SocketAddr},
    rc::Rc,
    time::Duration,
};

use bytes::Bytes;
use lwm2m_client_session::{
    Bootstrap, Client, ClientError, ClientOptions, CoapContext, CoapError, ConnRef, ConnType,
    DataModel, MIN_UPDATE_INTERVAL, NetBackend, NetError, Observe, SSID_BOOTSTRAP, Ssid,
    UpdateParams,
    clock::{Clock, ManualClock},
    dm::{
        self, Iid, RID_SECURITY_MODE, RID_SECURITY_PK_OR_IDENTITY, RID_SECURITY_SECRET_KEY,
        RID_SECURITY_SERVER_URI, RID_SERVER_BINDING, ResourcePath,
    },
    net::{NetSocket, SocketConfig, SocketState},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketBehavior {
    Connect,
    RefuseConnection,
    TimeOut,
}

struct DmEntry {
    ssid: Ssid,
    iid: Iid,
    uri: String,
    binding: String,
}

struct SockState {
    state: SocketState,
    resumed: Option<bool>,
}

struct Shared {
    entries: Vec<DmEntry>,
    socket_behavior: SocketBehavior,
    sockets: Vec<Rc<RefCell<SockState>>>,
    register_results: VecDeque<Result<UpdateParams, CoapError>>,
    update_results: VecDeque<Result<UpdateParams, CoapError>>,
    register_calls: u32,
    update_calls: u32,
    deregister_calls: u32,
    flush_calls: u32,
    bootstrap_prepare_calls: u32,
    bootstrap_cleanup_calls: u32,
    bootstrap_reconnected_calls: u32,
    bootstrap_in_progress: bool,
    notify_regular_calls: u32,
    bound: Option<ConnRef>,
    lifetime: Duration,
    max_transmit_wait: Duration,
}

impl Shared {
    fn new() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            entries: Vec::new(),
            socket_behavior: SocketBehavior::Connect,
            sockets: Vec::new(),
            register_results: VecDeque::new(),
            update_results: VecDeque::new(),
            register_calls: 0,
            update_calls: 0,
            deregister_calls: 0,
            flush_calls: 0,
            bootstrap_prepare_calls: 0,
            bootstrap_cleanup_calls: 0,
            bootstrap_reconnected_calls: 0,
            bootstrap_in_progress: false,
            notify_regular_calls: 0,
            bound: None,
            lifetime: Duration::from_secs(3600),
            max_transmit_wait: Duration::from_secs(7200),
        }))
    }
}

struct MockSocket {
    shared: Rc<RefCell<Shared>>,
    state: Rc<RefCell<SockState>>,
    host: String,
    port: u16,
    local_port: u16,
}

impl NetSocket for MockSocket {
    fn state(&self) -> SocketState {
        self.state.borrow().state
    }

    fn bind(&mut self, _local_addr: Option<IpAddr>, _port: u16) -> Result<(), NetError> {
        self.state.borrow_mut().state = SocketState::Bound;
        Ok(())
    }

    fn connect(&mut self, _host: &str, _port: u16) -> Result<(), NetError> {
        let behavior = self.shared.borrow().socket_behavior;
        match behavior {
            SocketBehavior::Connect => {
                let mut state = self.state.borrow_mut();
                state.state = SocketState::Connected;
                state.resumed = Some(true);
                Ok(())
            }
            SocketBehavior::RefuseConnection => Err(NetError::ConnectionRefused),
            SocketBehavior::TimeOut => Err(NetError::TimedOut),
        }
    }

    fn close(&mut self) {
        self.state.borrow_mut().state = SocketState::Closed;
    }

    fn session_resumed(&self) -> Option<bool> {
        self.state.borrow().resumed
    }

    fn local_port(&self) -> Option<u16> {
        Some(self.local_port)
    }

    fn remote_host(&self) -> Option<String> {
        Some(self.host.clone())
    }

    fn remote_port(&self) -> Option<u16> {
        Some(self.port)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl Drop for MockSocket {
    fn drop(&mut self) {
        self.state.borrow_mut().state = SocketState::Closed;
    }
}

struct MockHandlers {
    shared: Rc<RefCell<Shared>>,
}

impl DataModel for MockHandlers {
    fn security_iid(&self, ssid: Ssid) -> Option<Iid> {
        self.shared
            .borrow()
            .entries
            .iter()
            .find(|entry| entry.ssid == ssid)
            .map(|entry| entry.iid)
    }

    fn server_iid(&self, ssid: Ssid) -> Option<Iid> {
        if ssid == SSID_BOOTSTRAP {
            return None;
        }
        self.security_iid(ssid)
    }

    fn read_i64(&self, path: ResourcePath) -> Option<i64> {
        match (path.oid, path.rid) {
            // Every mock account uses PSK.
            (dm::OID_SECURITY, RID_SECURITY_MODE) => Some(0),
            _ => None,
        }
    }

    fn read_string(&self, path: ResourcePath) -> Option<String> {
        let shared = self.shared.borrow();
        let entry = shared.entries.iter().find(|entry| entry.iid == path.iid)?;
        match (path.oid, path.rid) {
            (dm::OID_SECURITY, RID_SECURITY_SERVER_URI) => Some(entry.uri.clone()),
            (dm::OID_SERVER, RID_SERVER_BINDING) => Some(entry.binding.clone()),
            _ => None,
        }
    }

    fn read_bytes(&self, path: ResourcePath) -> Option<Bytes> {
        match (path.oid, path.rid) {
            (dm::OID_SECURITY, RID_SECURITY_PK_OR_IDENTITY) => {
                Some(Bytes::from_static(b"device"))
            }
            (dm::OID_SECURITY, RID_SECURITY_SECRET_KEY) => Some(Bytes::from_static(b"sesame")),
            _ => None,
        }
    }

    fn ssid_exists(&self, ssid: Ssid) -> bool {
        self.shared
            .borrow()
            .entries
            .iter()
            .any(|entry| entry.ssid == ssid)
    }
}

impl CoapContext for MockHandlers {
    fn bind_server_stream(&mut self, conn: ConnRef) -> Result<(), CoapError> {
        self.shared.borrow_mut().bound = Some(conn);
        Ok(())
    }

    fn release_server_stream(&mut self) {
        self.shared.borrow_mut().bound = None;
    }

    fn release_server_stream_without_queue(&mut self) {
        self.shared.borrow_mut().bound = None;
    }

    fn register(&mut self) -> Result<UpdateParams, CoapError> {
        let mut shared = self.shared.borrow_mut();
        shared.register_calls += 1;
        let lifetime = shared.lifetime;
        shared
            .register_results
            .pop_front()
            .unwrap_or(Ok(UpdateParams { lifetime }))
    }

    fn update_registration(&mut self) -> Result<UpdateParams, CoapError> {
        let mut shared = self.shared.borrow_mut();
        shared.update_calls += 1;
        let lifetime = shared.lifetime;
        shared
            .update_results
            .pop_front()
            .unwrap_or(Ok(UpdateParams { lifetime }))
    }

    fn deregister(&mut self) -> Result<(), CoapError> {
        self.shared.borrow_mut().deregister_calls += 1;
        Ok(())
    }

    fn max_transmit_wait(&self, _conn_type: ConnType) -> Duration {
        self.shared.borrow().max_transmit_wait
    }
}

impl Bootstrap for MockHandlers {
    fn account_prepare(&mut self) -> Result<(), CoapError> {
        self.shared.borrow_mut().bootstrap_prepare_calls += 1;
        Ok(())
    }

    fn cleanup(&mut self) {
        self.shared.borrow_mut().bootstrap_cleanup_calls += 1;
    }

    fn notify_regular_connection_available(&mut self) {
        self.shared.borrow_mut().notify_regular_calls += 1;
    }

    fn update_reconnected(&mut self) -> Result<(), CoapError> {
        self.shared.borrow_mut().bootstrap_reconnected_calls += 1;
        Ok(())
    }

    fn in_progress(&self) -> bool {
        self.shared.borrow().bootstrap_in_progress
    }
}

impl Observe for MockHandlers {
    fn sched_flush_current_connection(&mut self) {
        self.shared.borrow_mut().flush_calls += 1;
    }
}

impl NetBackend for MockHandlers {
    fn create_connected_socket(
        &mut self,
        config: &SocketConfig,
    ) -> Result<Box<dyn NetSocket>, NetError> {
        let behavior = self.shared.borrow().socket_behavior;
        match behavior {
            SocketBehavior::Connect => {}
            SocketBehavior::RefuseConnection => return Err(NetError::ConnectionRefused),
            SocketBehavior::TimeOut => return Err(NetError::TimedOut),
        }
        let state = Rc::new(RefCell::new(SockState {
            state: SocketState::Connected,
            resumed: Some(false),
        }));
        let mut shared = self.shared.borrow_mut();
        shared.sockets.push(state.clone());
        let local_port = 40000 + shared.sockets.len() as u16;
        Ok(Box::new(MockSocket {
            shared: self.shared.clone(),
            state,
            host: config.uri.host.clone(),
            port: config.uri.port,
            local_port: config.local_port.unwrap_or(local_port),
        }))
    }
}

struct Fixture {
    client: Client<MockHandlers>,
    shared: Rc<RefCell<Shared>>,
    clock: ManualClock,
}

impl Fixture {
    fn new() -> Self {
        Self::with_max_icmp_failures(7)
    }

    fn with_max_icmp_failures(max_icmp_failures: u32) -> Self {
        let shared = Shared::new();
        let clock = ManualClock::new();
        let client = Client::new(
            MockHandlers {
                shared: shared.clone(),
            },
            ClientOptions {
                max_icmp_failures,
                clock: Box::new(clock.clone()),
                ..ClientOptions::default()
            },
        );
        Self {
            client,
            shared,
            clock,
        }
    }

    fn add_dm_entry(&self, ssid: Ssid, uri: &str) {
        let mut shared = self.shared.borrow_mut();
        let iid = shared.entries.len() as Iid;
        shared.entries.push(DmEntry {
            ssid,
            iid,
            uri: uri.to_string(),
            binding: "U".to_string(),
        });
    }

    /// Advance to the next scheduled deadline and run everything due.
    fn run_next(&mut self) -> usize {
        let wakeup = self.client.next_wakeup().expect("nothing scheduled");
        let now = self.clock.now();
        if wakeup > now {
            self.clock.advance(wakeup - now);
        }
        self.client.handle_scheduled()
    }

    fn activate_now(&mut self, ssid: Ssid) {
        self.client.add_server(ssid).unwrap();
        self.client
            .sched_activate_server(ssid, Duration::ZERO)
            .unwrap();
        self.run_next();
    }

    fn active_ssids(&self) -> Vec<Ssid> {
        self.client
            .servers()
            .active()
            .iter()
            .map(|server| server.ssid)
            .collect()
    }

    fn inactive_ssids(&self) -> Vec<Ssid> {
        self.client
            .servers()
            .inactive()
            .iter()
            .map(|server| server.ssid)
            .collect()
    }
}

#[test]
fn happy_register_moves_server_to_active() {
    let mut fx = Fixture::new();
    fx.add_dm_entry(3, "coaps://lwm2m.example.com:5684");

    let t0 = fx.clock.now();
    fx.activate_now(3);

    assert_eq!(fx.active_ssids(), vec![3]);
    assert!(fx.inactive_ssids().is_empty());
    assert_eq!(fx.shared.borrow().register_calls, 1);
    assert_eq!(fx.shared.borrow().flush_calls, 1);
    assert_eq!(fx.shared.borrow().notify_regular_calls, 1);
    // The server stream was released after the exchange.
    assert!(fx.shared.borrow().bound.is_none());

    let server = fx.client.servers().find_active(3).unwrap();
    assert_eq!(server.registration_info.conn_type, Some(ConnType::UDP));
    assert_eq!(server.registration_info.lifetime, Duration::from_secs(3600));

    // lifetime 3600 and a generous MAX_TRANSMIT_WAIT: the Update goes out
    // at the half-lifetime mark.
    assert_eq!(
        fx.client.next_wakeup(),
        Some(t0 + Duration::from_secs(1800))
    );
}

#[test]
fn rejected_update_triggers_re_register_on_the_same_connection() {
    let mut fx = Fixture::new();
    fx.add_dm_entry(3, "coaps://lwm2m.example.com:5684");
    fx.activate_now(3);

    fx.shared
        .borrow_mut()
        .update_results
        .push_back(Err(CoapError::Rejected));
    fx.run_next();

    let shared = fx.shared.borrow();
    assert_eq!(shared.update_calls, 1);
    assert_eq!(shared.register_calls, 2);
    drop(shared);

    let server = fx.client.servers().find_active(3).unwrap();
    assert_eq!(server.registration_info.conn_type, Some(ConnType::UDP));
    // A fresh Update is on the calendar.
    assert_eq!(
        fx.client.next_wakeup(),
        Some(fx.clock.now() + Duration::from_secs(1800))
    );
}

#[test]
fn network_error_during_update_suspends_and_backs_off() {
    let mut fx = Fixture::new();
    fx.add_dm_entry(3, "coaps://lwm2m.example.com:5684");
    fx.activate_now(3);

    fx.shared
        .borrow_mut()
        .update_results
        .push_back(Err(CoapError::Network));
    fx.run_next();

    // The socket was suspended, not destroyed, and the server stays
    // active.
    assert_eq!(fx.active_ssids(), vec![3]);
    assert_eq!(
        fx.shared.borrow().sockets[0].borrow().state,
        SocketState::Closed
    );
    // Backoff, not an immediate reconnect loop.
    assert_eq!(
        fx.client.next_wakeup(),
        Some(fx.clock.now() + Duration::from_secs(1))
    );

    // The retried job reconnects through refresh and the Update goes out.
    fx.run_next();
    let shared = fx.shared.borrow();
    assert_eq!(shared.update_calls, 2);
    assert_eq!(shared.register_calls, 1);
    assert_eq!(
        shared.sockets[0].borrow().state,
        SocketState::Connected
    );
}

#[test]
fn saturated_normal_server_falls_back_to_bootstrap() {
    let mut fx = Fixture::new();
    fx.add_dm_entry(3, "coaps://lwm2m.example.com:5684");
    fx.add_dm_entry(SSID_BOOTSTRAP, "coaps://bootstrap.example.com:5684");

    fx.client.add_server(3).unwrap();
    fx.client.add_server(SSID_BOOTSTRAP).unwrap();
    fx.client
        .sched_activate_server(3, Duration::ZERO)
        .unwrap();

    fx.shared.borrow_mut().socket_behavior = SocketBehavior::RefuseConnection;
    for expected in 1..=6 {
        fx.run_next();
        assert_eq!(
            fx.client.servers().find_inactive(3).unwrap().num_icmp_failures,
            expected
        );
    }
    assert!(fx.client.next_wakeup().is_some());

    // A definitive error saturates the counter at once and kicks off the
    // bootstrap fallback.
    fx.shared.borrow_mut().socket_behavior = SocketBehavior::TimeOut;
    fx.run_next();

    let inactive = fx.client.servers().find_inactive(3).unwrap();
    assert_eq!(inactive.num_icmp_failures, 7);
    assert_eq!(fx.shared.borrow().bootstrap_prepare_calls, 1);
    // The job is dead; nothing remains scheduled.
    assert_eq!(fx.client.next_wakeup(), None);
}

#[test]
fn graceful_deactivate_deregisters_and_schedules_reactivation() {
    let mut fx = Fixture::new();
    fx.add_dm_entry(3, "coaps://lwm2m.example.com:5684");
    fx.activate_now(3);

    fx.client
        .deactivate_server(3, Some(Duration::from_secs(60)))
        .unwrap();

    assert!(fx.active_ssids().is_empty());
    assert_eq!(fx.inactive_ssids(), vec![3]);
    assert_eq!(fx.shared.borrow().deregister_calls, 1);
    assert_eq!(
        fx.shared.borrow().sockets[0].borrow().state,
        SocketState::Closed
    );
    assert_eq!(
        fx.client.next_wakeup(),
        Some(fx.clock.now() + Duration::from_secs(60))
    );
}

#[test]
fn global_reconnect_revives_everything_and_clears_offline() {
    let mut fx = Fixture::new();
    fx.add_dm_entry(3, "coaps://a.example.com:5684");
    fx.add_dm_entry(4, "coaps://b.example.com:5684");
    fx.add_dm_entry(SSID_BOOTSTRAP, "coaps://bootstrap.example.com:5684");
    fx.activate_now(3);
    fx.activate_now(4);

    // Exhaust the Bootstrap Server so it parks in the inactive pool.
    fx.client.add_server(SSID_BOOTSTRAP).unwrap();
    fx.client
        .sched_activate_server(SSID_BOOTSTRAP, Duration::ZERO)
        .unwrap();
    fx.shared.borrow_mut().socket_behavior = SocketBehavior::TimeOut;
    fx.run_next();
    assert_eq!(fx.shared.borrow().bootstrap_cleanup_calls, 1);
    assert_eq!(fx.inactive_ssids(), vec![SSID_BOOTSTRAP]);

    fx.shared.borrow_mut().socket_behavior = SocketBehavior::Connect;
    fx.client.enter_offline();
    assert!(fx.client.is_offline());

    fx.client.schedule_reconnect().unwrap();
    assert!(!fx.client.is_offline());
    // Everything is due immediately.
    assert_eq!(fx.client.next_wakeup(), Some(fx.clock.now()));

    fx.client.handle_scheduled();
    assert_eq!(fx.active_ssids(), vec![3, 4, SSID_BOOTSTRAP]);
    assert!(fx.inactive_ssids().is_empty());
    let shared = fx.shared.borrow();
    assert_eq!(shared.update_calls, 2);
    assert_eq!(shared.bootstrap_prepare_calls, 1);
}

#[test]
fn tiny_lifetime_clamps_update_interval_to_the_minimum() {
    let mut fx = Fixture::new();
    fx.shared.borrow_mut().lifetime = Duration::from_secs(1);
    fx.add_dm_entry(3, "coaps://lwm2m.example.com:5684");

    let t0 = fx.clock.now();
    fx.activate_now(3);
    assert_eq!(fx.client.next_wakeup(), Some(t0 + MIN_UPDATE_INTERVAL));
}

#[test]
fn connection_refused_counts_up_to_the_limit() {
    let mut fx = Fixture::with_max_icmp_failures(3);
    fx.add_dm_entry(3, "coaps://lwm2m.example.com:5684");
    fx.client.add_server(3).unwrap();
    fx.client
        .sched_activate_server(3, Duration::ZERO)
        .unwrap();

    fx.shared.borrow_mut().socket_behavior = SocketBehavior::RefuseConnection;
    fx.run_next();
    fx.run_next();
    {
        let inactive = fx.client.servers().find_inactive(3).unwrap();
        assert_eq!(inactive.num_icmp_failures, 2);
        assert!(inactive.reactivate_failed);
    }
    assert!(fx.client.next_wakeup().is_some());
    assert!(!fx.client.all_connections_failed());

    fx.run_next();
    assert_eq!(
        fx.client.servers().find_inactive(3).unwrap().num_icmp_failures,
        3
    );
    assert_eq!(fx.client.next_wakeup(), None);
    // No Bootstrap Server is configured, so nothing more can happen.
    assert!(fx.client.all_connections_failed());
    assert_eq!(fx.shared.borrow().bootstrap_prepare_calls, 0);
}

#[test]
fn timeout_saturates_the_failure_counter_immediately() {
    let mut fx = Fixture::new();
    fx.add_dm_entry(3, "coaps://lwm2m.example.com:5684");
    fx.client.add_server(3).unwrap();
    fx.client
        .sched_activate_server(3, Duration::ZERO)
        .unwrap();

    fx.shared.borrow_mut().socket_behavior = SocketBehavior::TimeOut;
    fx.run_next();

    assert_eq!(
        fx.client.servers().find_inactive(3).unwrap().num_icmp_failures,
        7
    );
    assert!(fx.client.all_connections_failed());
}

#[test]
fn deactivate_then_activate_resets_the_failure_state() {
    let mut fx = Fixture::new();
    fx.add_dm_entry(3, "coaps://lwm2m.example.com:5684");
    fx.activate_now(3);

    fx.client
        .deactivate_server(3, Some(Duration::ZERO))
        .unwrap();
    {
        let inactive = fx.client.servers().find_inactive(3).unwrap();
        assert!(!inactive.reactivate_failed);
        assert_eq!(inactive.num_icmp_failures, 0);
    }

    fx.run_next();
    assert_eq!(fx.active_ssids(), vec![3]);
    assert_eq!(fx.shared.borrow().register_calls, 2);
    let server = fx.client.servers().find_active(3).unwrap();
    assert_eq!(server.registration_info.conn_type, Some(ConnType::UDP));
}

#[test]
fn activation_while_offline_keeps_retrying_without_counting_failures() {
    let mut fx = Fixture::new();
    fx.add_dm_entry(3, "coaps://lwm2m.example.com:5684");
    fx.client.enter_offline();

    fx.client.add_server(3).unwrap();
    fx.client
        .sched_activate_server(3, Duration::ZERO)
        .unwrap();
    fx.run_next();

    let inactive = fx.client.servers().find_inactive(3).unwrap();
    assert!(inactive.reactivate_failed);
    assert_eq!(inactive.num_icmp_failures, 0);
    assert_eq!(fx.shared.borrow().register_calls, 0);

    // Updates cannot be scheduled while offline either.
    assert!(matches!(
        fx.client.schedule_registration_update(3),
        Err(ClientError::Offline)
    ));

    fx.client.schedule_reconnect().unwrap();
    fx.run_next();
    assert_eq!(fx.active_ssids(), vec![3]);
}

#[test]
fn bootstrap_update_job_only_acts_after_a_reconnect() {
    let mut fx = Fixture::new();
    fx.add_dm_entry(SSID_BOOTSTRAP, "coaps://bootstrap.example.com:5684");
    fx.activate_now(SSID_BOOTSTRAP);

    assert_eq!(fx.active_ssids(), vec![SSID_BOOTSTRAP]);
    let shared = fx.shared.borrow();
    // The Bootstrap Server is not Registered to.
    assert_eq!(shared.register_calls, 0);
    assert_eq!(shared.bootstrap_prepare_calls, 1);
    drop(shared);

    fx.client.schedule_reconnect().unwrap();
    fx.client.handle_scheduled();
    assert_eq!(fx.shared.borrow().bootstrap_reconnected_calls, 1);
}
