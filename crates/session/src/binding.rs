use std::fmt;

/// LwM2M Binding Mode resource value.
///
/// The textual codes combine the enabled transports (`U` for UDP, `S` for
/// SMS) with the queue-mode suffix (`Q`). Only the combinations in the
/// fixed table below are legal; anything else parses as `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindingMode {
    #[default]
    None,
    U,
    UQ,
    S,
    SQ,
    US,
    UQS,
}

/// Effective mode of a single transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    Disabled,
    Online,
    Queue,
}

/// Fixed translation between a binding mode and the per-transport
/// (UDP, SMS) connection modes.
const BINDING_TO_CONNECTIONS: [(BindingMode, ConnectionMode, ConnectionMode); 6] = [
    (BindingMode::U, ConnectionMode::Online, ConnectionMode::Disabled),
    (BindingMode::UQ, ConnectionMode::Queue, ConnectionMode::Disabled),
    (BindingMode::S, ConnectionMode::Disabled, ConnectionMode::Online),
    (BindingMode::SQ, ConnectionMode::Disabled, ConnectionMode::Queue),
    (BindingMode::US, ConnectionMode::Online, ConnectionMode::Online),
    (BindingMode::UQS, ConnectionMode::Queue, ConnectionMode::Online),
];

impl BindingMode {
    /// Parse the textual resource value. Unknown strings map to `None`.
    pub fn parse(value: &str) -> Self {
        match value {
            "U" => Self::U,
            "UQ" => Self::UQ,
            "S" => Self::S,
            "SQ" => Self::SQ,
            "US" => Self::US,
            "UQS" => Self::UQS,
            _ => Self::None,
        }
    }

    /// Translate to `(udp_mode, sms_mode)`. `None` has no translation.
    pub fn connection_modes(self) -> Option<(ConnectionMode, ConnectionMode)> {
        BINDING_TO_CONNECTIONS
            .iter()
            .find(|(binding, _, _)| *binding == self)
            .map(|(_, udp, sms)| (*udp, *sms))
    }
}

/// Reverse lookup of the binding table; combinations outside of it map to
/// `BindingMode::None`.
pub fn binding_mode_from_connection_modes(
    udp_mode: ConnectionMode,
    sms_mode: ConnectionMode,
) -> BindingMode {
    BINDING_TO_CONNECTIONS
        .iter()
        .find(|(_, udp, sms)| *udp == udp_mode && *sms == sms_mode)
        .map(|(binding, _, _)| *binding)
        .unwrap_or(BindingMode::None)
}

impl fmt::Display for BindingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "",
            Self::U => "U",
            Self::UQ => "UQ",
            Self::S => "S",
            Self::SQ => "SQ",
            Self::US => "US",
            Self::UQS => "UQS",
        })
    }
}
