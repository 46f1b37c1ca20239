//! Runtime configuration.
//!
//! Settings come from three layers: built-in defaults, an optional YAML
//! overlay file, and command-line flags. A flag given explicitly on the
//! command line wins over the YAML value; otherwise the YAML value wins
//! over the default.

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Default SOCKS5 listen address for the frontend.
pub const DEFAULT_SOCKS_ADDR: &str = "127.0.0.1:1080";

/// Default port the frontend listens on for the direct-mode tunnel, and the
/// default relay listen port.
pub const DEFAULT_TUNNEL_PORT: u16 = 9000;

/// Default cap on consecutive failed agent redials.
pub const DEFAULT_MAX_RETRIES: i32 = 10;

/// Which role this process runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// SOCKS5 listener plus tunnel terminator (a.k.a. proxy).
    Frontend,
    /// NAT-side dialer that originates target connections.
    Agent,
    /// Stateless broker pairing one registered frontend with one agent.
    Relay,
}

/// Command-line options.
///
/// Every value-carrying flag is optional here so that the merge in
/// [`Config::resolve`] can tell "explicitly set" apart from "defaulted".
#[derive(Debug, Parser, Default)]
#[command(name = "burrow", version, about = "Reverse SOCKS5 proxy tunnel")]
pub struct Cli {
    /// Component mode: proxy, agent, or relay (overrides inference)
    #[arg(long, value_name = "MODE")]
    pub mode: Option<String>,

    /// SOCKS5 listen address [default: 127.0.0.1:1080]
    #[arg(long, value_name = "ADDR")]
    pub proxy_listen_addr: Option<String>,

    /// Tunnel listen port when in proxy mode [default: 9000]
    #[arg(long, value_name = "PORT")]
    pub tunnel_listen_port: Option<u16>,

    /// Tunnel address (host:port) to dial (agent mode)
    #[arg(long, value_name = "ADDR")]
    pub tunnel_addr: Option<String>,

    /// Port for proxy registrations and agent tunnels (relay mode) [default: 9000]
    #[arg(long, value_name = "PORT")]
    pub relay_listen_port: Option<u16>,

    /// Relay server address (host:port) for registration or agent dialing
    #[arg(long, value_name = "ADDR")]
    pub relay_addr: Option<String>,

    /// Proxy registers its availability with the relay instead of listening
    #[arg(long)]
    pub register: bool,

    /// Shared secret for tunnel authentication and encryption
    #[arg(long, value_name = "SECRET")]
    pub secret: Option<String>,

    /// Cap on consecutive failed agent redials; 0 or negative means unbounded [default: 10]
    #[arg(long, value_name = "N")]
    pub retry: Option<i32>,

    /// YAML config file path
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

/// YAML overlay file. All keys optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub socks_listen_addr: Option<String>,
    pub tunnel_listen_port: Option<u16>,
    pub tunnel_addr: Option<String>,
    pub secret: Option<String>,
    pub relay_listen_port: Option<u16>,
    pub relay_addr: Option<String>,
    pub max_retries: Option<i32>,
}

impl FileConfig {
    /// Parse a YAML overlay from a string.
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| Error::config(format!("bad config file: {e}")))
    }

    /// Read and parse a YAML overlay from disk.
    pub fn load(path: &PathBuf) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_yaml(&text)
    }
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub socks_listen_addr: String,
    pub tunnel_listen_port: u16,
    pub tunnel_addr: Option<String>,
    pub relay_listen_port: u16,
    pub relay_addr: Option<String>,
    pub register: bool,
    pub secret: String,
    pub max_retries: i32,
    pub debug: bool,
}

impl Config {
    /// Merge CLI flags over a YAML overlay over defaults, infer the role,
    /// and validate.
    pub fn resolve(cli: Cli, file: FileConfig) -> Result<Self> {
        let socks_listen_addr = cli
            .proxy_listen_addr
            .or(file.socks_listen_addr)
            .unwrap_or_else(|| DEFAULT_SOCKS_ADDR.to_string());
        let tunnel_listen_port = cli
            .tunnel_listen_port
            .or(file.tunnel_listen_port)
            .unwrap_or(DEFAULT_TUNNEL_PORT);
        let tunnel_addr = cli.tunnel_addr.or(file.tunnel_addr).filter(|s| !s.is_empty());
        let relay_listen_port = cli
            .relay_listen_port
            .or(file.relay_listen_port)
            .unwrap_or(DEFAULT_TUNNEL_PORT);
        let relay_addr = cli.relay_addr.or(file.relay_addr).filter(|s| !s.is_empty());
        let secret = cli
            .secret
            .or(file.secret)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::config("shared secret required: use --secret or config"))?;
        let max_retries = cli.retry.or(file.max_retries).unwrap_or(DEFAULT_MAX_RETRIES);

        if let Some(addr) = &tunnel_addr {
            validate_host_port(addr)
                .map_err(|e| Error::config(format!("invalid tunnel-addr: {e}")))?;
        }
        if let Some(addr) = &relay_addr {
            validate_host_port(addr)
                .map_err(|e| Error::config(format!("invalid relay-addr: {e}")))?;
        }

        let role = match cli.mode.as_deref() {
            Some("proxy") => Role::Frontend,
            Some("agent") => Role::Agent,
            Some("relay") => Role::Relay,
            Some(other) => {
                return Err(Error::config(format!(
                    "unknown mode {other:?} (expected proxy, agent, or relay)"
                )))
            }
            None if tunnel_addr.is_some() => Role::Agent,
            None if cli.register => Role::Frontend,
            None if relay_addr.is_some() => Role::Agent,
            None => Role::Frontend,
        };

        if role == Role::Agent && tunnel_addr.is_none() && relay_addr.is_none() {
            return Err(Error::config(
                "agent mode needs --tunnel-addr or --relay-addr",
            ));
        }
        if cli.register && relay_addr.is_none() {
            return Err(Error::config("--register needs --relay-addr"));
        }

        Ok(Self {
            role,
            socks_listen_addr,
            tunnel_listen_port,
            tunnel_addr,
            relay_listen_port,
            relay_addr,
            register: cli.register,
            secret,
            max_retries,
            debug: cli.debug,
        })
    }
}

/// Check that `addr` looks like `host:port` with a valid port. The host may
/// be a DNS name, so no resolution is attempted.
fn validate_host_port(addr: &str) -> std::result::Result<(), String> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| format!("{addr:?} is not host:port"))?;
    if host.is_empty() {
        return Err(format!("{addr:?} has an empty host"));
    }
    port.parse::<u16>()
        .map_err(|_| format!("{addr:?} has an invalid port"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> Cli {
        Cli {
            secret: Some("s".into()),
            ..Cli::default()
        }
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::resolve(base_cli(), FileConfig::default()).unwrap();
        assert_eq!(cfg.role, Role::Frontend);
        assert_eq!(cfg.socks_listen_addr, DEFAULT_SOCKS_ADDR);
        assert_eq!(cfg.tunnel_listen_port, DEFAULT_TUNNEL_PORT);
        assert_eq!(cfg.max_retries, DEFAULT_MAX_RETRIES);
        assert!(cfg.tunnel_addr.is_none());
    }

    #[test]
    fn test_cli_wins_over_yaml() {
        let mut cli = base_cli();
        cli.tunnel_listen_port = Some(7000);
        let file = FileConfig {
            tunnel_listen_port: Some(8000),
            socks_listen_addr: Some("0.0.0.0:1081".into()),
            ..FileConfig::default()
        };
        let cfg = Config::resolve(cli, file).unwrap();
        assert_eq!(cfg.tunnel_listen_port, 7000);
        // Unset on the CLI, so YAML overrides the default.
        assert_eq!(cfg.socks_listen_addr, "0.0.0.0:1081");
    }

    #[test]
    fn test_yaml_parse() {
        let file = FileConfig::from_yaml(
            "socks_listen_addr: 127.0.0.1:2080\ntunnel_addr: example.net:9000\nmax_retries: 0\n",
        )
        .unwrap();
        assert_eq!(file.socks_listen_addr.as_deref(), Some("127.0.0.1:2080"));
        assert_eq!(file.tunnel_addr.as_deref(), Some("example.net:9000"));
        assert_eq!(file.max_retries, Some(0));
    }

    #[test]
    fn test_yaml_secret_satisfies_requirement() {
        let cli = Cli::default();
        let file = FileConfig {
            secret: Some("from-file".into()),
            ..FileConfig::default()
        };
        let cfg = Config::resolve(cli, file).unwrap();
        assert_eq!(cfg.secret, "from-file");
    }

    #[test]
    fn test_missing_secret_is_fatal() {
        let err = Config::resolve(Cli::default(), FileConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_role_inference() {
        let mut cli = base_cli();
        cli.tunnel_addr = Some("10.0.0.2:9000".into());
        assert_eq!(
            Config::resolve(cli, FileConfig::default()).unwrap().role,
            Role::Agent
        );

        let mut cli = base_cli();
        cli.relay_addr = Some("relay.example:9000".into());
        assert_eq!(
            Config::resolve(cli, FileConfig::default()).unwrap().role,
            Role::Agent
        );

        let mut cli = base_cli();
        cli.register = true;
        cli.relay_addr = Some("relay.example:9000".into());
        let cfg = Config::resolve(cli, FileConfig::default()).unwrap();
        assert_eq!(cfg.role, Role::Frontend);
        assert!(cfg.register);
    }

    #[test]
    fn test_explicit_mode_overrides_inference() {
        let mut cli = base_cli();
        cli.mode = Some("relay".into());
        cli.tunnel_addr = Some("10.0.0.2:9000".into());
        assert_eq!(
            Config::resolve(cli, FileConfig::default()).unwrap().role,
            Role::Relay
        );
    }

    #[test]
    fn test_bad_addresses_rejected() {
        let mut cli = base_cli();
        cli.tunnel_addr = Some("no-port-here".into());
        assert!(Config::resolve(cli, FileConfig::default()).is_err());

        let mut cli = base_cli();
        cli.relay_addr = Some(":9000".into());
        assert!(Config::resolve(cli, FileConfig::default()).is_err());

        assert!(validate_host_port("host:70000").is_err());
        assert!(validate_host_port("host:80").is_ok());
        assert!(validate_host_port("[::1]:80").is_ok());
    }
}
