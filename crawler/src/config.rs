//! Command-line arguments and resolved crawl settings.

use bitcoin::Network;
use chrono::Utc;
use clap::Parser;
use log::LevelFilter;
use peer_census_connection::{TimeoutProfile, Timeouts, UserAgent, UserAgentError};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Crawl the bitcoin p2p network and record reachable nodes.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Bootstrap address (host:port), repeatable.
    #[arg(long = "seed", value_name = "ADDR")]
    pub seeds: Vec<String>,

    /// File with one bootstrap address per line ('#' starts a comment).
    #[arg(long, value_name = "PATH")]
    pub seed_file: Option<PathBuf>,

    /// Query the well-known DNS seeds for bootstrap addresses.
    #[arg(long, default_value_t = false)]
    pub dns_seeds: bool,

    /// Number of crawler workers.
    #[arg(long, default_value_t = 64)]
    pub num_workers: usize,

    /// Share of reachable nodes whose advertised addresses are recorded.
    #[arg(long, default_value_t = 1.0)]
    pub node_share: f64,

    /// Seed for the reproducible node-share sampling decision.
    #[arg(long, default_value_t = 0)]
    pub sample_seed: u64,

    /// Connect and handshake attempts per node.
    #[arg(long, default_value_t = 3)]
    pub handshake_attempts: u32,

    /// Collection windows to try against a node that returns no addresses.
    #[arg(long, default_value_t = 2)]
    pub getaddr_attempts: u32,

    /// Seconds of grace before the first connection, so Tor and I2P
    /// routers can warm up.
    #[arg(long, default_value_t = 10)]
    pub delay_start: u64,

    /// Record advertised addresses to their own result file.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub record_addr_data: bool,

    /// Age limit in seconds for advertised addresses to enter the frontier.
    #[arg(long, default_value_t = 2 * 24 * 60 * 60)]
    pub addr_age_limit: u64,

    /// Network to crawl (bitcoin, testnet, signet, regtest).
    #[arg(long, default_value = "bitcoin")]
    pub network: String,

    /// SOCKS5 proxy host for Tor.
    #[arg(long, default_value = "127.0.0.1")]
    pub tor_proxy_host: String,

    /// SOCKS5 proxy port for Tor.
    #[arg(long, default_value_t = 9050)]
    pub tor_proxy_port: u16,

    /// SAM router host for I2P.
    #[arg(long, default_value = "127.0.0.1")]
    pub i2p_sam_host: String,

    /// SAM router port for I2P.
    #[arg(long, default_value_t = 7656)]
    pub i2p_sam_port: u16,

    /// Custom user agent advertised to peers (/name:version/).
    #[arg(long)]
    pub user_agent: Option<String>,

    /// Timeout for establishing connections to IP peers.
    #[arg(long, default_value_t = 3)]
    pub ip_connect_timeout: u64,

    /// Timeout for message replies from IP peers.
    #[arg(long, default_value_t = 30)]
    pub ip_message_timeout: u64,

    /// Max. time to receive addr messages from IP peers.
    #[arg(long, default_value_t = 70)]
    pub ip_getaddr_timeout: u64,

    /// Timeout for establishing connections via Tor.
    #[arg(long, default_value_t = 100)]
    pub tor_connect_timeout: u64,

    /// Timeout for message replies via Tor.
    #[arg(long, default_value_t = 40)]
    pub tor_message_timeout: u64,

    /// Max. time to receive addr messages via Tor.
    #[arg(long, default_value_t = 90)]
    pub tor_getaddr_timeout: u64,

    /// Timeout for establishing connections via I2P.
    #[arg(long, default_value_t = 30)]
    pub i2p_connect_timeout: u64,

    /// Timeout for message replies via I2P.
    #[arg(long, default_value_t = 80)]
    pub i2p_message_timeout: u64,

    /// Max. time to receive addr messages via I2P.
    #[arg(long, default_value_t = 170)]
    pub i2p_getaddr_timeout: u64,

    /// Timeout for establishing connections to CJDNS peers.
    #[arg(long, default_value_t = 10)]
    pub cjdns_connect_timeout: u64,

    /// Timeout for message replies from CJDNS peers.
    #[arg(long, default_value_t = 30)]
    pub cjdns_message_timeout: u64,

    /// Max. time to receive addr messages from CJDNS peers.
    #[arg(long, default_value_t = 70)]
    pub cjdns_getaddr_timeout: u64,

    /// Directory receiving one subdirectory per crawl.
    #[arg(long, default_value = "results")]
    pub result_path: PathBuf,

    /// Override the crawl's nominal start time (names the result directory).
    #[arg(long)]
    pub timestamp: Option<String>,

    /// Write a debug log into the result directory.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub store_debug_log: bool,

    /// Logging verbosity (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Errors found while resolving [`Args`] into [`Settings`].
#[derive(Debug)]
pub enum ConfigError {
    UnknownNetwork(String),
    InvalidEndpoint(String),
    InvalidUserAgent(UserAgentError),
    NodeShareOutOfRange(f64),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::UnknownNetwork(name) => {
                write!(f, "unknown network '{name}' (use bitcoin, testnet, signet or regtest)")
            }
            ConfigError::InvalidEndpoint(endpoint) => {
                write!(f, "invalid proxy/router endpoint: {endpoint}")
            }
            ConfigError::InvalidUserAgent(e) => write!(f, "invalid user agent: {e}"),
            ConfigError::NodeShareOutOfRange(share) => {
                write!(f, "node share {share} is outside 0.0..=1.0")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidUserAgent(e) => Some(e),
            _ => None,
        }
    }
}

/// Resolved configuration for one crawl.
#[derive(Debug, Clone)]
pub struct Settings {
    pub network: Network,
    pub num_workers: usize,
    pub node_share: f64,
    pub sample_seed: u64,
    pub handshake_attempts: u32,
    pub getaddr_attempts: u32,
    pub delay_start: Duration,
    pub record_addr_data: bool,
    pub addr_age_limit: Duration,
    pub timeouts: Timeouts,
    pub tor_proxy: SocketAddr,
    pub i2p_sam: SocketAddr,
    pub user_agent: Option<UserAgent>,
    /// Nominal start time of the crawl, naming the result directory.
    pub timestamp: String,
    /// `<result-path>/<timestamp>`, created recursively on startup.
    pub result_dir: PathBuf,
    pub store_debug_log: bool,
    pub log_level: LevelFilter,
}

impl Settings {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let network = match args.network.to_lowercase().as_str() {
            "bitcoin" | "mainnet" => Network::Bitcoin,
            "testnet" => Network::Testnet,
            "signet" => Network::Signet,
            "regtest" => Network::Regtest,
            other => return Err(ConfigError::UnknownNetwork(other.to_string())),
        };

        if !(0.0..=1.0).contains(&args.node_share) {
            return Err(ConfigError::NodeShareOutOfRange(args.node_share));
        }

        let tor_proxy = endpoint(&args.tor_proxy_host, args.tor_proxy_port)?;
        let i2p_sam = endpoint(&args.i2p_sam_host, args.i2p_sam_port)?;

        let user_agent = args
            .user_agent
            .clone()
            .map(UserAgent::new)
            .transpose()
            .map_err(ConfigError::InvalidUserAgent)?;

        let timeouts = Timeouts {
            ip: TimeoutProfile::from_secs(
                args.ip_connect_timeout,
                args.ip_message_timeout,
                args.ip_getaddr_timeout,
            ),
            tor: TimeoutProfile::from_secs(
                args.tor_connect_timeout,
                args.tor_message_timeout,
                args.tor_getaddr_timeout,
            ),
            i2p: TimeoutProfile::from_secs(
                args.i2p_connect_timeout,
                args.i2p_message_timeout,
                args.i2p_getaddr_timeout,
            ),
            cjdns: TimeoutProfile::from_secs(
                args.cjdns_connect_timeout,
                args.cjdns_message_timeout,
                args.cjdns_getaddr_timeout,
            ),
        };

        let timestamp = args
            .timestamp
            .clone()
            .unwrap_or_else(|| Utc::now().format("%Y-%m-%dT%H-%M-%SZ").to_string());
        let result_dir = args.result_path.join(&timestamp);

        let log_level = match args.log_level.to_lowercase().as_str() {
            "error" => LevelFilter::Error,
            "warn" => LevelFilter::Warn,
            "info" => LevelFilter::Info,
            "debug" => LevelFilter::Debug,
            "trace" => LevelFilter::Trace,
            _ => LevelFilter::Info,
        };

        Ok(Settings {
            network,
            num_workers: args.num_workers,
            node_share: args.node_share,
            sample_seed: args.sample_seed,
            handshake_attempts: args.handshake_attempts,
            getaddr_attempts: args.getaddr_attempts,
            delay_start: Duration::from_secs(args.delay_start),
            record_addr_data: args.record_addr_data,
            addr_age_limit: Duration::from_secs(args.addr_age_limit),
            timeouts,
            tor_proxy,
            i2p_sam,
            user_agent,
            timestamp,
            result_dir,
            store_debug_log: args.store_debug_log,
            log_level,
        })
    }

    /// Path of the debug log inside the result directory.
    pub fn debug_log_path(&self) -> PathBuf {
        self.result_dir.join("debug.log")
    }

    /// Default p2p port of the configured network.
    pub fn default_port(&self) -> u16 {
        match self.network {
            Network::Bitcoin => 8333,
            Network::Testnet => 18333,
            Network::Signet => 38333,
            Network::Regtest => 18444,
            _ => 8333,
        }
    }
}

fn endpoint(host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    let candidate = if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    candidate
        .parse()
        .map_err(|_| ConfigError::InvalidEndpoint(candidate))
}
