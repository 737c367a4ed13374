//! JSON-RPC client for the node's administrative interface.
//!
//! The connection target is resolved on every call: the node's own config
//! file is preferred when it exists (its credentials or auth cookie may change
//! across node restarts), otherwise the discrete host/port/credential settings
//! are used. The HTTP client itself is shared.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chainwatch_resilience::Classify;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::ExporterConfig;

/// RPC error code the node returns while loading the block index, verifying
/// blocks and similar startup work.
pub const RPC_IN_WARMUP: i64 = -28;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RpcError {
    #[error("connection to {endpoint} failed: {message}")]
    Connection { endpoint: String, message: String },
    #[error("node is warming up: {message}")]
    NotReady { message: String },
    #[error("auth cookie {} unavailable: {message}", .path.display())]
    CookieUnavailable { path: PathBuf, message: String },
    #[error("protocol failure: {0}")]
    Protocol(String),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("misconfigured rpc endpoint: {0}")]
    Misconfigured(String),
}

impl RpcError {
    /// Failures that indicate misconfiguration rather than a transient condition.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RpcError::Protocol(_) | RpcError::Misconfigured(_))
    }
}

impl Classify for RpcError {
    fn is_retryable(&self) -> bool {
        matches!(self, RpcError::Connection { .. } | RpcError::NotReady { .. } | RpcError::CookieUnavailable { .. })
    }

    fn kind(&self) -> &'static str {
        match self {
            RpcError::Connection { .. } => "connection",
            RpcError::NotReady { .. } => "not_ready",
            RpcError::CookieUnavailable { .. } => "cookie_unavailable",
            RpcError::Protocol(_) => "protocol",
            RpcError::Rpc { .. } => "rpc",
            RpcError::Transport(_) => "transport",
            RpcError::Misconfigured(_) => "misconfigured",
        }
    }
}

/// One remote procedure call against the node.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn call(&self, method: &str, params: &[Value]) -> Result<Value, RpcError>;
}

#[async_trait]
impl<T: RpcTransport + ?Sized> RpcTransport for std::sync::Arc<T> {
    async fn call(&self, method: &str, params: &[Value]) -> Result<Value, RpcError> {
        (**self).call(method, params).await
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").field("user", &self.user).field("password", &"<redacted>").finish()
    }
}

/// A resolved connection target. `url` never carries credentials.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcEndpoint {
    pub url: Url,
    pub credentials: Option<Credentials>,
}

impl RpcEndpoint {
    pub fn new(scheme: &str, host: &str, port: u16, credentials: Option<Credentials>) -> Result<Self, RpcError> {
        let url = Url::parse(&format!("{scheme}://{host}:{port}/"))
            .map_err(|e| RpcError::Misconfigured(format!("{scheme}://{host}:{port}: {e}")))?;
        Ok(Self { url, credentials })
    }

    /// The connection descriptor with percent-encoded credentials embedded.
    pub fn service_url(&self) -> String {
        let mut url = self.url.clone();
        if let Some(c) = &self.credentials {
            // only fails for cannot-be-a-base URLs, which `new` never builds
            let _ = url.set_username(&c.user);
            let _ = url.set_password(Some(&c.password));
        }
        url.to_string()
    }
}

impl fmt::Display for RpcEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

#[derive(Debug, Clone)]
pub enum EndpointSource {
    /// Use the node config file whenever it exists at call time, else `fallback`.
    NodeConfig { path: PathBuf, fallback: RpcEndpoint },
    Direct(RpcEndpoint),
}

impl EndpointSource {
    pub fn from_config(cfg: &ExporterConfig) -> Result<Self, RpcError> {
        let credentials = match (&cfg.rpc_user, &cfg.rpc_password) {
            (Some(user), Some(password)) => Some(Credentials { user: user.clone(), password: password.clone() }),
            _ => None,
        };
        let direct = RpcEndpoint::new(&cfg.rpc_scheme, &cfg.rpc_host, cfg.rpc_port, credentials)?;
        Ok(match cfg.node_conf_path() {
            Some(path) => EndpointSource::NodeConfig { path, fallback: direct },
            None => EndpointSource::Direct(direct),
        })
    }

    pub async fn resolve(&self) -> Result<RpcEndpoint, RpcError> {
        match self {
            EndpointSource::Direct(endpoint) => Ok(endpoint.clone()),
            EndpointSource::NodeConfig { path, fallback } => {
                let is_file = tokio::fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false);
                if !is_file {
                    return Ok(fallback.clone());
                }
                let text = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| RpcError::Misconfigured(format!("reading {}: {e}", path.display())))?;
                let conf = NodeConf::parse(&text);
                let cookie = match conf.cookie_path(path) {
                    Some(cookie_path) if conf.credentials().is_none() => {
                        let text = tokio::fs::read_to_string(&cookie_path)
                            .await
                            .map_err(|e| RpcError::CookieUnavailable { path: cookie_path.clone(), message: e.to_string() })?;
                        Some(parse_cookie(&text).ok_or_else(|| RpcError::CookieUnavailable {
                            path: cookie_path,
                            message: "expected user:password".into(),
                        })?)
                    }
                    _ => None,
                };
                conf.endpoint(cookie)
            }
        }
    }
}

/// Parsed `bitcoin.conf`: flat `key=value` pairs, later keys win.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct NodeConf {
    values: HashMap<String, String>,
}

impl NodeConf {
    pub fn parse(text: &str) -> Self {
        let mut values = HashMap::new();
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() || line.starts_with('[') {
                continue;
            }
            if let Some((k, v)) = line.split_once('=') {
                values.insert(k.trim().to_string(), v.trim().to_string());
            }
        }
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn flag(&self, key: &str) -> bool {
        self.get(key).map(|v| v == "1").unwrap_or(false)
    }

    /// Network subdirectory of the data dir; `None` on mainnet.
    fn network_dir(&self) -> Option<&'static str> {
        match self.get("chain") {
            Some("test") => return Some("testnet3"),
            Some("testnet4") => return Some("testnet4"),
            Some("regtest") => return Some("regtest"),
            Some("signet") => return Some("signet"),
            Some("main") => return None,
            _ => {}
        }
        if self.flag("testnet") {
            Some("testnet3")
        } else if self.flag("regtest") {
            Some("regtest")
        } else if self.flag("signet") {
            Some("signet")
        } else {
            None
        }
    }

    pub fn port(&self) -> Result<u16, RpcError> {
        if let Some(p) = self.get("rpcport") {
            return p.parse().map_err(|e| RpcError::Misconfigured(format!("rpcport {p:?}: {e}")));
        }
        Ok(match self.network_dir() {
            Some("testnet3") => 18332,
            Some("testnet4") => 48332,
            Some("regtest") => 18443,
            Some("signet") => 38332,
            _ => 8332,
        })
    }

    pub fn credentials(&self) -> Option<Credentials> {
        match (self.get("rpcuser"), self.get("rpcpassword")) {
            (Some(user), Some(password)) => Some(Credentials { user: user.to_string(), password: password.to_string() }),
            _ => None,
        }
    }

    /// Cookie location: `<datadir>/[<network>/].cookie`, where the data dir
    /// defaults to the directory holding the config file.
    pub fn cookie_path(&self, conf_path: &Path) -> Option<PathBuf> {
        let datadir = match self.get("datadir") {
            Some(d) => PathBuf::from(d),
            None => conf_path.parent()?.to_path_buf(),
        };
        let dir = match self.network_dir() {
            Some(net) => datadir.join(net),
            None => datadir,
        };
        Some(dir.join(".cookie"))
    }

    pub fn endpoint(&self, cookie: Option<Credentials>) -> Result<RpcEndpoint, RpcError> {
        let host = self.get("rpcconnect").unwrap_or("localhost");
        RpcEndpoint::new("http", host, self.port()?, self.credentials().or(cookie))
    }
}

fn parse_cookie(text: &str) -> Option<Credentials> {
    let (user, password) = text.trim().split_once(':')?;
    Some(Credentials { user: user.to_string(), password: password.to_string() })
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    #[serde(default)]
    message: String,
}

/// Decode a JSON-RPC response body. The node answers RPC-level errors with a
/// non-2xx status and a JSON body, so the status is only used for context.
pub fn decode_response(status: StatusCode, body: &str) -> Result<Value, RpcError> {
    let resp: RpcResponse = serde_json::from_str(body)
        .map_err(|e| RpcError::Protocol(format!("{status} response is not JSON (bad credentials?): {e}")))?;
    match resp.error {
        Some(err) if err.code == RPC_IN_WARMUP => Err(RpcError::NotReady { message: err.message }),
        Some(err) => Err(RpcError::Rpc { code: err.code, message: err.message }),
        None => Ok(resp.result),
    }
}

pub struct RpcClient {
    http: reqwest::Client,
    source: EndpointSource,
    next_id: AtomicU64,
}

impl RpcClient {
    /// `request_timeout` bounds one HTTP exchange.
    pub fn new(source: EndpointSource, request_timeout: Duration) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| RpcError::Misconfigured(format!("http client: {e}")))?;
        Ok(Self { http, source, next_id: AtomicU64::new(0) })
    }

    pub fn source(&self) -> &EndpointSource {
        &self.source
    }
}

#[async_trait]
impl RpcTransport for RpcClient {
    async fn call(&self, method: &str, params: &[Value]) -> Result<Value, RpcError> {
        let endpoint = self.source.resolve().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "1.0", "id": id, "method": method, "params": params });
        let mut req = self.http.post(endpoint.url.clone()).json(&body);
        if let Some(c) = &endpoint.credentials {
            req = req.basic_auth(&c.user, Some(&c.password));
        }
        let resp = req.send().await.map_err(|e| {
            if e.is_connect() {
                RpcError::Connection { endpoint: endpoint.to_string(), message: e.to_string() }
            } else {
                RpcError::Transport(e.to_string())
            }
        })?;
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RpcError::Protocol(format!("{status} from {endpoint}: credentials rejected")));
        }
        let text = resp.text().await.map_err(|e| RpcError::Transport(e.to_string()))?;
        decode_response(status, &text)
    }
}
