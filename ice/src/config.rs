use std::fs::read_to_string;
use std::net::IpAddr;

use clap::Parser;
use serde::Deserialize;

use crate::error::{Error, Result};

/// how the worker waits between deadlines.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyMode {
    /// sleep exactly to the nearest deadline and wake on readiness.
    #[default]
    #[serde(alias = "event-fd")]
    Event,
    /// cap every wait at a 50 ms tick.
    Poll,
}

/// local port range; `{0, 0}` means ephemeral.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortRange {
    pub begin: u16,
    pub end: u16,
}

impl PortRange {
    pub fn is_ephemeral(self) -> bool {
        self.begin == 0 && self.end == 0
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct TurnServerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// long-term credential realm hint; the server's 401 wins.
    #[serde(default)]
    pub realm: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// STUN server for server-reflexive discovery, `host:port`.
    pub stun_server: Option<String>,

    /// TURN servers to allocate relayed candidates on.
    pub turn_servers: Vec<TurnServerConfig>,

    /// local port range the socket binds within.
    pub port_range: Option<PortRange>,

    /// alternative form of `port_range`.
    pub local_port_range_begin: Option<u16>,
    pub local_port_range_end: Option<u16>,

    /// force a specific interface address; also the only offered host
    /// candidate.
    pub bind_address: Option<IpAddr>,

    pub concurrency_mode: ConcurrencyMode,

    /// set USE-CANDIDATE on every outgoing check instead of running a
    /// separate nominating check.
    pub aggressive_nomination: bool,

    /// offer loopback host candidates; debugging only.
    pub allow_loopback: bool,
}

/// config model.
#[derive(Parser, Debug)]
#[clap(
    name = "ice",
    version = env!("CARGO_PKG_VERSION"),
    about = "ICE agent with STUN/TURN client support"
)]
struct Args {
    /// config file path (TOML); command line flags override it.
    #[clap(long, env = "ICE_CONFIG")]
    config: Option<String>,

    /// STUN server, host:port.
    #[clap(long, env = "ICE_STUN_SERVER")]
    stun_server: Option<String>,

    /// interface address to bind.
    #[clap(long, env = "ICE_BIND_ADDRESS")]
    bind_address: Option<IpAddr>,

    /// first local port to bind within.
    #[clap(long, env = "ICE_PORT_RANGE_BEGIN")]
    port_range_begin: Option<u16>,

    /// last local port to bind within.
    #[clap(long, env = "ICE_PORT_RANGE_END")]
    port_range_end: Option<u16>,

    /// offer loopback host candidates.
    #[clap(long)]
    loopback: bool,

    /// aggressive nomination.
    #[clap(long)]
    aggressive: bool,
}

impl Config {
    /// the effective port range, folding in the alternative form.
    pub fn port_range(&self) -> PortRange {
        self.port_range.unwrap_or(PortRange {
            begin: self.local_port_range_begin.unwrap_or(0),
            end: self.local_port_range_end.unwrap_or(0),
        })
    }

    pub fn validate(&self) -> Result<()> {
        let range = self.port_range();
        if !range.is_ephemeral() && range.begin > range.end {
            return Err(Error::Invalid(format!(
                "port range [{}, {}] is inverted",
                range.begin, range.end
            )));
        }

        Ok(())
    }

    /// load from an optional TOML file with command line overrides.
    pub fn load() -> Result<Self> {
        let args = Args::parse();
        let mut config = match &args.config {
            Some(path) => {
                let text = read_to_string(path)
                    .map_err(|e| Error::Invalid(format!("config file {path}: {e}")))?;
                toml::from_str::<Config>(&text)
                    .map_err(|e| Error::Invalid(format!("config file {path}: {e}")))?
            }
            None => Config::default(),
        };

        if args.stun_server.is_some() {
            config.stun_server = args.stun_server;
        }

        if args.bind_address.is_some() {
            config.bind_address = args.bind_address;
        }

        if let (Some(begin), Some(end)) = (args.port_range_begin, args.port_range_end) {
            config.port_range = Some(PortRange { begin, end });
        }

        config.allow_loopback |= args.loopback;
        config.aggressive_nomination |= args.aggressive;
        config.validate()?;
        Ok(config)
    }
}
