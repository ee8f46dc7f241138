use std::time::Duration;

use thiserror::Error;

use crate::connection::{ConnRef, ConnType};

/// Positive sentinel returned when the server answered an Update with a
/// 4.xx code: the registration must be redone, not retransmitted.
pub const REGISTRATION_UPDATE_REJECTED: i32 = 1;

/// Parameters acknowledged by the server on a successful Register or
/// Update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateParams {
    pub lifetime: Duration,
}

/// Failure of a CoAP exchange, as far as the request engine can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CoapError {
    /// Update answered with 4.xx; re-register instead of retransmitting.
    #[error("update rejected by server")]
    Rejected,
    /// 4.03 Forbidden; the server will not accept this client.
    #[error("forbidden by server")]
    Forbidden,
    /// The exchange failed at the network layer.
    #[error("network communication error")]
    Network,
    #[error("exchange timed out")]
    TimedOut,
    #[error("exchange failed")]
    Failed,
}

impl CoapError {
    /// Integer form of the result contract: `REGISTRATION_UPDATE_REJECTED`
    /// is the only positive value, everything else is negative.
    pub fn code(self) -> i32 {
        match self {
            Self::Rejected => REGISTRATION_UPDATE_REJECTED,
            Self::Forbidden => -403,
            Self::Network => -libc::EIO,
            Self::TimedOut => -libc::ETIMEDOUT,
            Self::Failed => -1,
        }
    }
}

/// The CoAP message engine the registration lifecycle drives.
///
/// A stream is bound to exactly one connection at a time; `register`,
/// `update_registration` and `deregister` operate on the currently bound
/// stream.
pub trait CoapContext {
    fn bind_server_stream(&mut self, conn: ConnRef) -> Result<(), CoapError>;

    fn release_server_stream(&mut self);

    /// Release without scheduling queue-mode departure; used after
    /// De-Register when the connection is going away anyway.
    fn release_server_stream_without_queue(&mut self);

    fn register(&mut self) -> Result<UpdateParams, CoapError>;

    fn update_registration(&mut self) -> Result<UpdateParams, CoapError>;

    fn deregister(&mut self) -> Result<(), CoapError>;

    /// MAX_TRANSMIT_WAIT of the transmission parameters used on the given
    /// transport.
    fn max_transmit_wait(&self, conn_type: ConnType) -> Duration;
}
