use std::fs::read_to_string;

use clap::Parser;
use serde::Deserialize;
use session::net::DtlsVersion;

/// Verbosity threshold of the client log, from quietest to noisiest.
///
/// `info` keeps one line per lifecycle transition (connect, Register,
/// Update); `debug` adds scheduling decisions; `trace` follows every
/// refresh.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Log {
    /// log level
    ///
    /// threshold below which client log output is discarded.
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DtlsVersionCfg {
    #[default]
    Auto,
    Dtls1,
    Dtls1_2,
}

impl DtlsVersionCfg {
    pub fn as_version(self) -> DtlsVersion {
        match self {
            Self::Auto => DtlsVersion::Auto,
            Self::Dtls1 => DtlsVersion::Dtls1,
            Self::Dtls1_2 => DtlsVersion::Dtls1_2,
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct Lwm2m {
    /// endpoint client name
    ///
    /// identifies this device towards every LwM2M server; usually a URN.
    #[serde(default = "Lwm2m::endpoint_name")]
    pub endpoint_name: String,

    /// local UDP port
    ///
    /// fixed local port requested for fresh server sockets. leaving it
    /// unset lets the system pick an ephemeral port, which is the right
    /// choice unless a firewall pins the client to a known port.
    #[serde(default)]
    pub udp_listen_port: Option<u16>,

    /// connection failure budget
    ///
    /// how many refused connections a server may accumulate before the
    /// client gives up on it and considers the bootstrap fallback.
    #[serde(default = "Lwm2m::max_icmp_failures")]
    pub max_icmp_failures: u32,

    /// DTLS protocol version
    ///
    /// minimum version negotiated for coaps servers.
    #[serde(default)]
    pub dtls_version: DtlsVersionCfg,
}

impl Lwm2m {
    fn endpoint_name() -> String {
        "urn:dev:os:lwm2m-client".to_string()
    }

    fn max_icmp_failures() -> u32 {
        7
    }
}

impl Default for Lwm2m {
    fn default() -> Self {
        Self {
            endpoint_name: Self::endpoint_name(),
            udp_listen_port: None,
            max_icmp_failures: Self::max_icmp_failures(),
            dtls_version: DtlsVersionCfg::default(),
        }
    }
}

/// Credentials of one server account.
#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Security {
    Nosec,
    Psk {
        identity: String,
        key: String,
    },
    Certificate {
        /// client certificate file (PEM or DER)
        client_cert: String,
        /// server certificate file; omitting it disables server
        /// validation.
        server_cert: Option<String>,
        /// private key file matching the client certificate
        private_key: String,
    },
}

#[derive(Deserialize, Debug, Clone)]
pub struct Server {
    pub ssid: u16,

    /// server URI
    ///
    /// `coap://` for nosec accounts, `coaps://` otherwise; the scheme must
    /// match the security mode.
    pub uri: String,

    /// binding mode
    ///
    /// textual LwM2M binding code; only UDP variants are currently
    /// usable.
    #[serde(default = "Server::binding")]
    pub binding: String,

    /// registration lifetime in seconds
    #[serde(default = "Server::lifetime")]
    pub lifetime: i64,

    /// marks the Bootstrap Server account
    #[serde(default)]
    pub bootstrap: bool,

    pub security: Security,
}

impl Server {
    fn binding() -> String {
        "U".to_string()
    }

    fn lifetime() -> i64 {
        86400
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub lwm2m: Lwm2m,
    #[serde(default)]
    pub servers: Vec<Server>,
}

#[derive(Parser)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// specify the configuration file path.
    #[arg(long)]
    config: Option<String>,
}

impl Config {
    /// Load command line parameters; if a configuration file path is
    /// specified the configuration is read from it, otherwise the default
    /// configuration is used.
    pub fn load() -> anyhow::Result<Self> {
        let source = Cli::parse()
            .config
            .map(read_to_string)
            .transpose()?
            .unwrap_or_default();
        Self::parse(&source)
    }

    pub fn parse(source: &str) -> anyhow::Result<Self> {
        if source.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json5::from_str(source)?)
    }
}
