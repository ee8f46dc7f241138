use std::time::Duration;

use crate::{
    Client, ClientError, Handlers, Job, JobCtx, MIN_UPDATE_INTERVAL, SSID_ANY, SSID_BOOTSTRAP,
    Ssid, UPDATE_INTERVAL_MARGIN_FACTOR, activate,
    coap::{CoapError, UpdateParams},
    connection::{self, ConnRef, ConnType},
    registry::{ActiveServer, Servers},
    sched::{JobOutcome, SERVER_RETRYABLE_BACKOFF},
};

/// What the scheduled Update worker must do to the socket before talking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SocketNeeds {
    Nothing = 0,
    Reconnect = 1,
}

pub(crate) const SOCKET_NEEDS_LIMIT: u32 = 2;

const SOCKET_NEEDS_SHIFT: u32 = 16;

/// Pack `(ssid, socket_needs)` into one job argument: SSID in the low 16
/// bits, the socket needs above them.
pub(crate) fn send_update_args_encode(ssid: Ssid, socket_needs: SocketNeeds) -> u32 {
    ((socket_needs as u32) << SOCKET_NEEDS_SHIFT) | u32::from(ssid)
}

pub(crate) fn send_update_args_decode(value: u32) -> (Ssid, SocketNeeds) {
    debug_assert!((value >> SOCKET_NEEDS_SHIFT) < SOCKET_NEEDS_LIMIT);
    let ssid = (value & u32::from(u16::MAX)) as Ssid;
    let socket_needs = match value >> SOCKET_NEEDS_SHIFT {
        0 => SocketNeeds::Nothing,
        1 => SocketNeeds::Reconnect,
        other => unreachable!("socket needs out of range: {}", other),
    };
    (ssid, socket_needs)
}

/// Adopt the first transport with an online connection as the registration
/// connection.
pub(crate) fn setup_registration_connection(server: &mut ActiveServer) -> Option<ConnType> {
    server.registration_info.conn_type = None;
    for conn_type in ConnType::ALL {
        if server.connections.get(conn_type).is_online() {
            server.registration_info.conn_type = Some(conn_type);
            return Some(conn_type);
        }
    }
    log::error!("no suitable connection found for SSID = {}", server.ssid);
    None
}

pub(crate) fn registration_connection_valid(server: &ActiveServer) -> bool {
    server
        .registration_info
        .conn_type
        .is_some_and(|conn_type| server.connections.get(conn_type).is_online())
}

/// Compute the margin reserved before the lifetime expires for performing
/// the Update.
fn update_interval_margin<H: Handlers>(
    handlers: &H,
    server: &ActiveServer,
    conn_type: ConnType,
) -> Duration {
    let half_lifetime = server.registration_info.lifetime / UPDATE_INTERVAL_MARGIN_FACTOR;
    let max_transmit_wait = handlers.max_transmit_wait(conn_type);
    half_lifetime.min(max_transmit_wait)
}

fn schedule_update<H: Handlers>(
    ctx: &mut JobCtx<'_, H>,
    server: &mut ActiveServer,
    delay: Duration,
    socket_needs: SocketNeeds,
) {
    log::debug!(
        "scheduling update for SSID {} after {:?}",
        server.ssid,
        delay
    );
    server.sched_update_handle = Some(ctx.sched.schedule_retryable(
        ctx.now,
        delay,
        SERVER_RETRYABLE_BACKOFF,
        Job::SendUpdate(send_update_args_encode(server.ssid, socket_needs)),
    ));
}

fn schedule_next_update<H: Handlers>(ctx: &mut JobCtx<'_, H>, server: &mut ActiveServer) {
    let Some(conn_type) = server.registration_info.conn_type else {
        log::error!(
            "no registration connection for SSID {}, not scheduling Update",
            server.ssid
        );
        return;
    };
    let remaining = server.registration_info.time_remaining(ctx.now);
    let margin = update_interval_margin(&*ctx.handlers, server, conn_type);
    let mut delay = remaining.saturating_sub(margin);
    if delay < MIN_UPDATE_INTERVAL {
        delay = MIN_UPDATE_INTERVAL;
    }
    schedule_update(ctx, server, delay, SocketNeeds::Nothing);
}

/// Cancel the pending Update and plan the next one from the current
/// registration expiry.
pub(crate) fn reschedule_update_job<H: Handlers>(
    ctx: &mut JobCtx<'_, H>,
    server: &mut ActiveServer,
) {
    ctx.sched.cancel(&mut server.sched_update_handle);
    schedule_next_update(ctx, server);
}

fn reschedule_update_for_server<H: Handlers>(
    ctx: &mut JobCtx<'_, H>,
    server: &mut ActiveServer,
    socket_needs: SocketNeeds,
) {
    ctx.sched.cancel(&mut server.sched_update_handle);
    schedule_update(ctx, server, Duration::ZERO, socket_needs);
}

/// Send Register over the registration connection; on success record the
/// acknowledged lifetime and plan the first Update.
pub(crate) fn server_register<H: Handlers>(
    ctx: &mut JobCtx<'_, H>,
    server: &mut ActiveServer,
) -> Result<(), CoapError> {
    let Some(conn_type) = setup_registration_connection(server) else {
        return Err(CoapError::Failed);
    };
    ctx.handlers.bind_server_stream(ConnRef {
        ssid: server.ssid,
        conn_type,
    })?;

    let result = ctx.handlers.register();
    if let Ok(params) = result {
        apply_update_params(ctx, server, params);
        ctx.sched.cancel(&mut server.sched_update_handle);
        schedule_next_update(ctx, server);
        ctx.handlers.sched_flush_current_connection();
        ctx.handlers.notify_regular_connection_available();
    }
    ctx.handlers.release_server_stream();
    result.map(|_| ())
}

fn apply_update_params<H: Handlers>(
    ctx: &JobCtx<'_, H>,
    server: &mut ActiveServer,
    params: UpdateParams,
) {
    server.registration_info.lifetime = params.lifetime;
    server.registration_info.expires_at = Some(ctx.now + params.lifetime);
}

fn send_update<H: Handlers>(
    handlers: &mut H,
    server: &ActiveServer,
) -> Result<UpdateParams, CoapError> {
    let Some(conn_type) = server.registration_info.conn_type else {
        return Err(CoapError::Failed);
    };
    if handlers
        .bind_server_stream(ConnRef {
            ssid: server.ssid,
            conn_type,
        })
        .is_err()
    {
        log::error!("could not get stream for server {}", server.ssid);
        return Err(CoapError::Failed);
    }

    let result = handlers.update_registration();
    handlers.release_server_stream();

    match result {
        Err(CoapError::Rejected) => {
            log::debug!(
                "update rejected for SSID = {}; needs re-registering",
                server.ssid
            );
        }
        Err(err) => log::error!("could not send registration update: {}", err),
        Ok(_) => {}
    }
    result
}

/// Best-effort De-Register: failures are logged and otherwise ignored.
/// Skipped entirely when no registration connection is designated.
pub(crate) fn deregister<H: Handlers>(handlers: &mut H, server: &ActiveServer) {
    let Some(conn_type) = server.registration_info.conn_type else {
        log::error!("could not get stream for server {}, skipping", server.ssid);
        return;
    };
    if handlers
        .bind_server_stream(ConnRef {
            ssid: server.ssid,
            conn_type,
        })
        .is_err()
    {
        log::error!("could not get stream for server {}, skipping", server.ssid);
        return;
    }

    if let Err(err) = handlers.deregister() {
        log::error!("could not send De-Register request: {}", err);
    }
    handlers.release_server_stream_without_queue();
}

enum UpdateFlow {
    Finished(JobOutcome),
    ConnectionFailure,
}

fn update_flow<H: Handlers>(
    ctx: &mut JobCtx<'_, H>,
    server: &mut ActiveServer,
    socket_needs: SocketNeeds,
) -> UpdateFlow {
    if connection::refresh_server(
        ctx.handlers,
        ctx.net_opts,
        server,
        socket_needs == SocketNeeds::Reconnect,
    )
    .is_err()
    {
        if server.registration_info.expired(ctx.now) {
            log::debug!(
                "registration lifetime expired for SSID = {}, forcing re-register",
                server.ssid
            );
            // Re-Register is unavoidable now, so retrying the Update makes
            // no sense.
            return UpdateFlow::ConnectionFailure;
        }
        return UpdateFlow::Finished(JobOutcome::Retry);
    }

    if server.ssid == SSID_BOOTSTRAP {
        if socket_needs == SocketNeeds::Nothing {
            return UpdateFlow::Finished(JobOutcome::Done);
        }
        return UpdateFlow::Finished(match ctx.handlers.update_reconnected() {
            Ok(()) => JobOutcome::Done,
            Err(_) => JobOutcome::Retry,
        });
    }

    let mut needs_reregister = true;
    if registration_connection_valid(server) {
        if !server.registration_info.expired(ctx.now) {
            match send_update(ctx.handlers, server) {
                Ok(params) => {
                    apply_update_params(ctx, server, params);
                    needs_reregister = false;
                }
                Err(CoapError::Rejected) => {
                    // Re-register below instead of retransmitting.
                }
                Err(CoapError::Network) => {
                    log::error!(
                        "network communication error while updating registration for SSID == {}",
                        server.ssid
                    );
                    // Reconnecting right away would loop without backoff if
                    // the server is down. Close the socket instead and let
                    // the retried job reconnect through refresh.
                    let conn_type = server.registration_info.conn_type;
                    connection::suspend_server(server, conn_type);
                    return UpdateFlow::Finished(JobOutcome::Retry);
                }
                Err(_) => return UpdateFlow::Finished(JobOutcome::Retry),
            }
        }
    } else {
        log::info!(
            "no valid existing connection to Registration Interface for SSID = {}, re-registering",
            server.ssid
        );
        if setup_registration_connection(server).is_none() {
            return UpdateFlow::ConnectionFailure;
        }
    }

    if needs_reregister && server_register(ctx, server).is_err() {
        log::debug!("re-registration failed");
        return UpdateFlow::ConnectionFailure;
    }

    // Failure to flush notifications is not fatal.
    ctx.handlers.sched_flush_current_connection();

    // Updates are retryable; only reschedule after success.
    reschedule_update_job(ctx, server);
    UpdateFlow::Finished(JobOutcome::Done)
}

/// The scheduled Update worker.
pub(crate) fn send_update_sched_job<H: Handlers>(
    ctx: &mut JobCtx<'_, H>,
    servers: &mut Servers,
    packed_args: u32,
) -> JobOutcome {
    let (ssid, socket_needs) = send_update_args_decode(packed_args);
    debug_assert!(ssid != SSID_ANY);

    let flow = {
        let Some(server) = servers.find_active_mut(ssid) else {
            return JobOutcome::Done;
        };
        update_flow(ctx, server, socket_needs)
    };

    match flow {
        UpdateFlow::Finished(outcome) => outcome,
        UpdateFlow::ConnectionFailure => {
            // Mark the registration connection invalid first; prevents a
            // superfluous De-Register on teardown.
            if let Some(server) = servers.find_active_mut(ssid) {
                server.registration_info.conn_type = None;
            }
            let _ = activate::deactivate(ctx, servers, ssid, Some(Duration::ZERO));
            JobOutcome::Done
        }
    }
}

impl<H: Handlers> Client<H> {
    pub(crate) fn job_ctx(&mut self) -> (JobCtx<'_, H>, &mut Servers) {
        let now = self.clock.now();
        (
            JobCtx {
                handlers: &mut self.handlers,
                sched: &mut self.sched,
                now,
                net_opts: self.net_opts,
                offline: self.offline,
                max_icmp_failures: self.max_icmp_failures,
            },
            &mut self.servers,
        )
    }

    /// Reschedule the Update for one active server, or for every one when
    /// `ssid` is `SSID_ANY`. Fails while offline.
    pub fn schedule_registration_update(&mut self, ssid: Ssid) -> Result<(), ClientError> {
        if self.offline {
            log::error!("cannot schedule registration update while being offline");
            return Err(ClientError::Offline);
        }
        let (mut ctx, servers) = self.job_ctx();
        if ssid == SSID_ANY {
            for server in servers.active_mut() {
                reschedule_update_for_server(&mut ctx, server, SocketNeeds::Nothing);
            }
            return Ok(());
        }
        match servers.find_active_mut(ssid) {
            Some(server) => {
                reschedule_update_for_server(&mut ctx, server, SocketNeeds::Nothing);
                Ok(())
            }
            None => {
                log::error!("no active server with SSID = {}", ssid);
                Err(ClientError::UnknownServer(ssid))
            }
        }
    }

    /// Force every active server through a reconnect, revive every server
    /// that has given up, and clear the offline flag.
    pub fn schedule_reconnect(&mut self) -> Result<(), ClientError> {
        {
            let (mut ctx, servers) = self.job_ctx();
            for server in servers.active_mut() {
                reschedule_update_for_server(&mut ctx, server, SocketNeeds::Reconnect);
            }
            activate::reactivate_all_given_up(
                ctx.sched,
                ctx.now,
                servers,
                ctx.max_icmp_failures,
            );
        }
        self.offline = false;
        Ok(())
    }

    /// Reconnect a single active server.
    pub fn schedule_server_reconnect(&mut self, ssid: Ssid) -> Result<(), ClientError> {
        let (mut ctx, servers) = self.job_ctx();
        match servers.find_active_mut(ssid) {
            Some(server) => {
                reschedule_update_for_server(&mut ctx, server, SocketNeeds::Reconnect);
                Ok(())
            }
            None => Err(ClientError::UnknownServer(ssid)),
        }
    }
}
