//! Exporter configuration: defaults, optional file, then environment.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Source(#[from] config::ConfigError),
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Raw key/value view as `config` deserializes it. Keys are the lowercased
/// environment variable names.
#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    bitcoin_rpc_scheme: String,
    bitcoin_rpc_host: String,
    bitcoin_rpc_port: u16,
    bitcoin_rpc_user: Option<String>,
    bitcoin_rpc_password: Option<String>,
    bitcoin_conf: Option<String>,
    smartfee_blocks: String,
    refresh_seconds: f64,
    metrics_port: u16,
    retries: u32,
    timeout: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExporterConfig {
    pub rpc_scheme: String,
    pub rpc_host: String,
    pub rpc_port: u16,
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
    /// Node config file; preferred over the discrete RPC settings when it exists.
    pub node_conf: Option<PathBuf>,
    pub smart_fee_targets: Vec<u16>,
    pub refresh_interval: Duration,
    pub metrics_port: u16,
    /// Informational; the retry budget below is what bounds a call.
    pub retries: u32,
    pub retry_budget: Duration,
}

impl ExporterConfig {
    /// Load from `CHAINWATCH_CONFIG_FILE` (if set) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let file = std::env::var("CHAINWATCH_CONFIG_FILE").ok();
        Self::build(file, None)
    }

    /// Load from an explicit key/value map instead of the process environment.
    pub fn from_env_map(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::build(None, Some(vars))
    }

    fn build(file: Option<String>, vars: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("bitcoin_rpc_scheme", "http")?
            .set_default("bitcoin_rpc_host", "localhost")?
            .set_default("bitcoin_rpc_port", 8332)?
            .set_default("smartfee_blocks", "2,3,5,20")?
            .set_default("refresh_seconds", 300.0)?
            .set_default("metrics_port", 8334)?
            .set_default("retries", 5)?
            .set_default("timeout", 30)?;
        if let Some(file) = file {
            builder = builder.add_source(config::File::with_name(&file).required(false));
        }
        builder = builder.add_source(config::Environment::default().source(vars));
        let raw: RawConfig = builder.build()?.try_deserialize()?;
        raw.validate()
    }

    pub fn metrics_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.metrics_port))
    }

    /// Node config file location: explicit setting, else `~/.bitcoin/bitcoin.conf`.
    pub fn node_conf_path(&self) -> Option<PathBuf> {
        self.node_conf
            .clone()
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".bitcoin").join("bitcoin.conf")))
    }
}

impl RawConfig {
    fn validate(self) -> Result<ExporterConfig, ConfigError> {
        if !(self.refresh_seconds.is_finite() && self.refresh_seconds > 0.0) {
            return Err(ConfigError::Invalid { key: "REFRESH_SECONDS", reason: format!("{} is not a positive number", self.refresh_seconds) });
        }
        let refresh_interval = Duration::try_from_secs_f64(self.refresh_seconds)
            .map_err(|e| ConfigError::Invalid { key: "REFRESH_SECONDS", reason: format!("{}: {e}", self.refresh_seconds) })?;
        if self.timeout == 0 {
            return Err(ConfigError::Invalid { key: "TIMEOUT", reason: "must be at least one second".into() });
        }
        Ok(ExporterConfig {
            rpc_scheme: self.bitcoin_rpc_scheme,
            rpc_host: self.bitcoin_rpc_host,
            rpc_port: self.bitcoin_rpc_port,
            rpc_user: non_empty(self.bitcoin_rpc_user),
            rpc_password: non_empty(self.bitcoin_rpc_password),
            node_conf: non_empty(self.bitcoin_conf).map(PathBuf::from),
            smart_fee_targets: parse_targets(&self.smartfee_blocks)?,
            refresh_interval,
            metrics_port: self.metrics_port,
            retries: self.retries,
            retry_budget: Duration::from_secs(self.timeout),
        })
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.is_empty())
}

/// Confirmation targets the node's fee estimator accepts.
pub const SMART_FEE_TARGET_RANGE: std::ops::RangeInclusive<u16> = 1..=1008;

pub fn parse_targets(list: &str) -> Result<Vec<u16>, ConfigError> {
    let mut targets = Vec::new();
    for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let n: u16 = item
            .parse()
            .map_err(|e| ConfigError::Invalid { key: "SMARTFEE_BLOCKS", reason: format!("{item:?}: {e}") })?;
        if !SMART_FEE_TARGET_RANGE.contains(&n) {
            return Err(ConfigError::Invalid {
                key: "SMARTFEE_BLOCKS",
                reason: format!("{n} outside {}..={}", SMART_FEE_TARGET_RANGE.start(), SMART_FEE_TARGET_RANGE.end()),
            });
        }
        if !targets.contains(&n) {
            targets.push(n);
        }
    }
    Ok(targets)
}
