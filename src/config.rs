use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use ipnet::IpNet;
use serde::Deserialize;

/// Minimum level emitted by the tracing subscriber (6, Configuration contract).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warning => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// The operator-settable values every component reads from (6, Configuration contract).
///
/// `SERVER_IP`/`SERVER_PORT` require a process restart to take effect; every
/// other field is hot-applied by publishing a new [`Config`] through
/// [`ConfigSnapshot::publish`].
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server_ip: String,
    pub server_port: u16,
    #[serde(default)]
    pub advertised_host: Option<String>,
    #[serde(default)]
    pub users: HashMap<String, String>,
    #[serde(default)]
    pub local_networks: Vec<String>,
    #[serde(default)]
    pub force_local_addr: bool,
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
    #[serde(default = "default_true")]
    pub cdr_merge_mode: bool,
    #[serde(default = "default_registration_expires")]
    pub registration_expires: u32,
    #[serde(default = "default_max_forwards")]
    pub max_forwards: u8,
    #[serde(default = "default_cdr_dir")]
    pub cdr_dir: String,
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}
fn default_true() -> bool {
    true
}
fn default_registration_expires() -> u32 {
    3600
}
fn default_max_forwards() -> u8 {
    70
}
fn default_cdr_dir() -> String {
    "CDR".to_string()
}

impl Config {
    /// Load configuration from a TOML file, with `SIPCORE_*` environment
    /// overrides layered on top — the same config+toml composition the
    /// pack's `infra-common` crate uses.
    pub fn load(path: &str) -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("SIPCORE").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn bind_addr(&self) -> crate::Result<SocketAddr> {
        format!("{}:{}", self.server_ip, self.server_port)
            .parse()
            .map_err(|e| crate::Error::ConfigError(format!("invalid bind address: {e}")))
    }

    pub fn advertised_host(&self) -> String {
        self.advertised_host
            .clone()
            .unwrap_or_else(|| self.server_ip.clone())
    }

    pub fn local_nets(&self) -> Vec<IpNet> {
        self.local_networks
            .iter()
            .filter_map(|s| s.parse::<IpNet>().ok().or_else(|| {
                s.parse::<std::net::IpAddr>()
                    .ok()
                    .map(|ip| IpNet::new(ip, if ip.is_ipv4() { 32 } else { 128 }).unwrap())
            }))
            .collect()
    }

    /// Does `peer` count as "local" for NAT-rewrite purposes (4.5)?
    ///
    /// `force_local_addr` is a blanket testing override checked first: it
    /// collapses every peer to local regardless of `LOCAL_NETWORKS`
    /// (Open Question #2, resolved in DESIGN.md).
    pub fn is_local_peer(&self, peer_ip: std::net::IpAddr) -> bool {
        if self.force_local_addr {
            return true;
        }
        self.local_nets().iter().any(|net| net.contains(&peer_ip))
    }

    pub fn registration_max_expires(&self) -> u32 {
        self.registration_expires
    }
}

#[cfg(test)]
impl Default for Config {
    fn default() -> Self {
        Config {
            server_ip: "127.0.0.1".to_string(),
            server_port: 5060,
            advertised_host: None,
            users: HashMap::new(),
            local_networks: vec![],
            force_local_addr: false,
            log_level: LogLevel::Info,
            cdr_merge_mode: true,
            registration_expires: 3600,
            max_forwards: 70,
            cdr_dir: "CDR".to_string(),
        }
    }
}

/// Atomically-replaceable view of [`Config`] (3, Configuration Snapshot).
///
/// Request handlers clone the `Arc<Config>` once at the top of the handler
/// and use that single reference for the whole request; a reload publishes
/// a brand new `Arc` that only later requests observe.
pub struct ConfigSnapshot {
    inner: ArcSwap<Config>,
}

impl ConfigSnapshot {
    pub fn new(config: Config) -> Self {
        Self {
            inner: ArcSwap::from_pointee(config),
        }
    }

    pub fn current(&self) -> Arc<Config> {
        self.inner.load_full()
    }

    pub fn publish(&self, config: Config) {
        self.inner.store(Arc::new(config));
    }
}
