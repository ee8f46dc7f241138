use std::time::{Duration, Instant};

use thiserror::Error;

use crate::{
    Client, ClientError, CoapError, Handlers, Job, JobCtx, SSID_BOOTSTRAP, Ssid,
    connection::{self, RefreshError},
    dm::{self, ResourcePath},
    net::{NetError, ServerUri, UriError},
    registry::{ActiveServer, InactiveServer, Servers},
    register,
    sched::{JobOutcome, SERVER_RETRYABLE_BACKOFF, Scheduler},
};

/// Why an activation attempt failed; drives the retry-counter update.
#[derive(Debug, Error)]
pub enum ActivateError {
    #[error("the client is offline")]
    Offline,
    #[error("could not find server Security IID")]
    MissingSecurityInstance,
    #[error("could not read server URI")]
    MissingUri,
    #[error("invalid server URI: {0}")]
    InvalidUri(#[from] UriError),
    #[error(transparent)]
    Refresh(#[from] RefreshError),
    #[error("could not register: {0}")]
    Register(CoapError),
    #[error("could not prepare bootstrap account: {0}")]
    Bootstrap(CoapError),
}

enum FailureKind {
    /// Count one more ICMP-style failure.
    Count,
    /// Saturate the counter; retrying cannot help.
    Saturate,
    /// Leave the counter untouched; the job is still retryable.
    Keep,
}

fn failure_kind(err: &ActivateError) -> FailureKind {
    match err {
        ActivateError::Refresh(RefreshError::Transport(NetError::ConnectionRefused)) => {
            FailureKind::Count
        }
        ActivateError::Refresh(RefreshError::Transport(
            NetError::TimedOut | NetError::Protocol,
        )) => FailureKind::Saturate,
        ActivateError::Register(CoapError::Forbidden | CoapError::TimedOut) => {
            FailureKind::Saturate
        }
        _ => FailureKind::Keep,
    }
}

fn server_uri<H: Handlers>(handlers: &H, security_iid: dm::Iid) -> Result<ServerUri, ActivateError> {
    let raw = handlers
        .read_string(ResourcePath::new(
            dm::OID_SECURITY,
            security_iid,
            dm::RID_SECURITY_SERVER_URI,
        ))
        .ok_or(ActivateError::MissingUri)?;
    Ok(ServerUri::parse(&raw)?)
}

fn initialize_active_server<H: Handlers>(
    ctx: &mut JobCtx<'_, H>,
    ssid: Ssid,
) -> Result<ActiveServer, ActivateError> {
    if ctx.offline {
        log::trace!("client is offline, not initializing server SSID {}", ssid);
        return Err(ActivateError::Offline);
    }

    let security_iid = ctx.handlers.security_iid(ssid).ok_or_else(|| {
        log::error!("could not find server Security IID");
        ActivateError::MissingSecurityInstance
    })?;
    let uri = server_uri(&*ctx.handlers, security_iid)?;

    let mut server = ActiveServer::new(ssid, uri);
    if let Err(err) = connection::refresh_server(ctx.handlers, ctx.net_opts, &mut server, false) {
        log::trace!("could not initialize sockets for SSID {}", ssid);
        return Err(err.into());
    }

    if ssid != SSID_BOOTSTRAP {
        if let Err(err) = register::server_register(ctx, &mut server) {
            log::error!("could not register to server SSID {}", ssid);
            return Err(ActivateError::Register(err));
        }
    } else if let Err(err) = ctx.handlers.account_prepare() {
        log::error!("could not prepare bootstrap account for SSID {}", ssid);
        return Err(ActivateError::Bootstrap(err));
    }

    Ok(server)
}

/// True iff some inactive non-bootstrap server still has a chance of
/// connecting.
pub(crate) fn can_retry_with_normal_server(servers: &Servers, max_icmp_failures: u32) -> bool {
    servers.inactive().iter().any(|server| {
        server.ssid != SSID_BOOTSTRAP
            && (!server.reactivate_failed || server.num_icmp_failures < max_icmp_failures)
    })
}

fn should_retry_bootstrap<H: Handlers>(
    handlers: &H,
    servers: &Servers,
    max_icmp_failures: u32,
) -> bool {
    if handlers.in_progress() {
        // Bootstrap already in progress, no need to retry.
        return false;
    }
    !can_retry_with_normal_server(servers, max_icmp_failures)
}

pub(crate) fn all_connections_failed(servers: &Servers, max_icmp_failures: u32) -> bool {
    if !servers.active().is_empty() || servers.inactive().is_empty() {
        return false;
    }
    servers
        .inactive()
        .iter()
        .all(|server| server.num_icmp_failures >= max_icmp_failures)
}

/// The reactivation job. Retryable: `Retry` re-enqueues it under the
/// server backoff, `Done` dismisses it.
pub(crate) fn activate_server_job<H: Handlers>(
    ctx: &mut JobCtx<'_, H>,
    servers: &mut Servers,
    ssid: Ssid,
) -> JobOutcome {
    if servers.find_inactive(ssid).is_none() {
        log::trace!("not an inactive server: SSID = {}", ssid);
        return JobOutcome::Done;
    }

    match initialize_active_server(ctx, ssid) {
        Ok(new_server) => {
            // Might have been removed by a bootstrap start in the meantime.
            servers.remove_inactive(ssid);
            servers.add_active(new_server);
            JobOutcome::Done
        }
        Err(err) => {
            let max_icmp_failures = ctx.max_icmp_failures;
            let num_icmp_failures = {
                let Some(server) = servers.find_inactive_mut(ssid) else {
                    return JobOutcome::Done;
                };
                server.reactivate_failed = true;
                match failure_kind(&err) {
                    FailureKind::Count => server.num_icmp_failures += 1,
                    FailureKind::Saturate => server.num_icmp_failures = max_icmp_failures,
                    FailureKind::Keep => {}
                }
                server.num_icmp_failures
            };

            if num_icmp_failures >= max_icmp_failures {
                if ssid == SSID_BOOTSTRAP {
                    log::debug!(
                        "Bootstrap Server could not be reached. Disabling all communication."
                    );
                    ctx.handlers.cleanup();
                } else if ctx.handlers.ssid_exists(SSID_BOOTSTRAP) {
                    if should_retry_bootstrap(&*ctx.handlers, servers, max_icmp_failures) {
                        let _ = ctx.handlers.account_prepare();
                    }
                } else {
                    log::debug!("Non-Bootstrap Server {} could not be reached.", ssid);
                }
                // The job dies here; only schedule_reconnect revives the
                // server.
                return JobOutcome::Done;
            }
            JobOutcome::Retry
        }
    }
}

/// Restart the reactivation procedure from a clean slate: counters reset,
/// previous job cancelled, a fresh retryable activation installed.
pub(crate) fn sched_reactivate_server(
    sched: &mut Scheduler<Job>,
    now: Instant,
    server: &mut InactiveServer,
    delay: Duration,
) {
    server.reactivate_failed = false;
    server.num_icmp_failures = 0;
    sched.cancel(&mut server.sched_reactivate_handle);
    server.sched_reactivate_handle = Some(sched.schedule_retryable(
        now,
        delay,
        SERVER_RETRYABLE_BACKOFF,
        Job::Activate(server.ssid),
    ));
}

/// Reactivate, at once, every server that has given up entirely.
pub(crate) fn reactivate_all_given_up(
    sched: &mut Scheduler<Job>,
    now: Instant,
    servers: &mut Servers,
    max_icmp_failures: u32,
) {
    for server in servers.inactive_mut() {
        if !server.reactivate_failed || server.num_icmp_failures < max_icmp_failures {
            continue;
        }
        sched_reactivate_server(sched, now, server, Duration::ZERO);
    }
}

/// Move a server out of the active pool.
///
/// The inactive replacement is created before anything is torn down, so a
/// scheduling problem leaves the active record untouched. De-Register is
/// best-effort; sockets close before the active record is destroyed.
pub(crate) fn deactivate<H: Handlers>(
    ctx: &mut JobCtx<'_, H>,
    servers: &mut Servers,
    ssid: Ssid,
    reactivate_delay: Option<Duration>,
) -> Result<(), ClientError> {
    if servers.find_active(ssid).is_some() {
        let mut replacement = InactiveServer::new(ssid);
        if let Some(delay) = reactivate_delay {
            sched_reactivate_server(ctx.sched, ctx.now, &mut replacement, delay);
        }

        let mut active = match servers.remove_active(ssid) {
            Some(active) => active,
            None => return Err(ClientError::UnknownServer(ssid)),
        };
        register::deregister(ctx.handlers, &mut active);
        active.cleanup(ctx.sched);

        servers.add_inactive(replacement);
        return Ok(());
    }

    if let Some(inactive) = servers.find_inactive_mut(ssid) {
        // Either reschedule the reactivation, or cancel it when the caller
        // asked for an indefinite deactivation.
        match reactivate_delay {
            Some(delay) => sched_reactivate_server(ctx.sched, ctx.now, inactive, delay),
            None => ctx.sched.cancel(&mut inactive.sched_reactivate_handle),
        }
        return Ok(());
    }

    log::error!("SSID {} is not a known server", ssid);
    Err(ClientError::UnknownServer(ssid))
}

impl<H: Handlers> Client<H> {
    /// Schedule reactivation of an inactive server after `delay`.
    pub fn sched_activate_server(&mut self, ssid: Ssid, delay: Duration) -> Result<(), ClientError> {
        let now = self.clock.now();
        match self.servers.find_inactive_mut(ssid) {
            Some(server) => {
                sched_reactivate_server(&mut self.sched, now, server, delay);
                Ok(())
            }
            None => {
                log::trace!("not an inactive server: SSID = {}", ssid);
                Err(ClientError::UnknownServer(ssid))
            }
        }
    }

    /// Deactivate a server; `reactivate_delay` of `None` parks it
    /// indefinitely, `Some(Duration::ZERO)` reactivates as soon as
    /// possible.
    pub fn deactivate_server(
        &mut self,
        ssid: Ssid,
        reactivate_delay: Option<Duration>,
    ) -> Result<(), ClientError> {
        let (mut ctx, servers) = self.job_ctx();
        deactivate(&mut ctx, servers, ssid, reactivate_delay)
    }
}
