//! In-memory stand-in for a bitcoind node.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcoind_exporter::{NodeMetrics, RetryingCaller, RpcError, RpcTransport, SnapshotCollector};
use chainwatch_core::MetricRegistry;
use chainwatch_resilience::RetryPolicy;
use parking_lot::Mutex;
use serde_json::{json, Value};

pub const BEST_HASH: &str = "0000000000000000000215a5e4a8cbd3b5fbd56e25da4ed9e2a71b9d2c7f4d63";

pub struct FakeNode {
    responses: Mutex<HashMap<String, Value>>,
    failures: Mutex<HashMap<String, RpcError>>,
    calls: Mutex<Vec<String>>,
}

impl FakeNode {
    pub fn healthy() -> Arc<Self> {
        let mut responses = HashMap::new();
        responses.insert("uptime".to_string(), json!(86400));
        responses.insert(
            "getmemoryinfo".to_string(),
            json!({ "locked": { "used": 65536, "free": 196608, "total": 262144, "locked": 262144, "chunks_used": 2, "chunks_free": 1 } }),
        );
        responses.insert(
            "getblockchaininfo".to_string(),
            json!({ "chain": "main", "blocks": 800000, "difficulty": 53911173001054.59, "size_on_disk": 575000000000u64, "bestblockhash": BEST_HASH }),
        );
        responses.insert(
            "getnetworkinfo".to_string(),
            json!({ "version": 250000, "protocolversion": 70016, "connections": 10, "warnings": "" }),
        );
        responses.insert("getchaintips".to_string(), json!([{ "height": 800000, "status": "active" }, { "height": 799000, "status": "valid-fork" }]));
        responses.insert("getmempoolinfo".to_string(), json!({ "size": 4200, "bytes": 2100000, "usage": 9000000 }));
        responses.insert("getnettotals".to_string(), json!({ "totalbytesrecv": 123456789, "totalbytessent": 987654321 }));
        responses.insert("getnetworkhashps".to_string(), json!(4.2e20));
        responses.insert(
            "listbanned".to_string(),
            json!([
                { "address": "10.0.0.1/32", "ban_reason": "manually added", "ban_created": 1700000000, "banned_until": 1700086400 },
                { "address": "10.0.0.1/32", "ban_reason": "node misbehaving", "ban_created": 1700000500, "banned_until": 1700086900 }
            ]),
        );
        responses.insert("getblock".to_string(), block());
        Arc::new(Self { responses: Mutex::new(responses), failures: Mutex::new(HashMap::new()), calls: Mutex::new(Vec::new()) })
    }

    pub fn respond(&self, method: &str, value: Value) {
        self.responses.lock().insert(method.to_string(), value);
    }

    /// Make every call to `method` fail until [`FakeNode::heal`].
    pub fn fail(&self, method: &str, err: RpcError) {
        self.failures.lock().insert(method.to_string(), err);
    }

    pub fn heal(&self, method: &str) {
        self.failures.lock().remove(method);
    }

    pub fn calls_to(&self, method: &str) -> usize {
        self.calls.lock().iter().filter(|m| m.as_str() == method).count()
    }
}

#[async_trait]
impl RpcTransport for FakeNode {
    async fn call(&self, method: &str, params: &[Value]) -> Result<Value, RpcError> {
        self.calls.lock().push(method.to_string());
        if let Some(err) = self.failures.lock().get(method) {
            return Err(err.clone());
        }
        if method == "estimatesmartfee" {
            let target = params.first().and_then(Value::as_u64).unwrap_or(0);
            return Ok(json!({ "feerate": 0.0001 * target as f64, "blocks": target }));
        }
        self.responses
            .lock()
            .get(method)
            .cloned()
            .ok_or_else(|| RpcError::Rpc { code: -32601, message: format!("Method not found: {method}") })
    }
}

/// Three transactions with (inputs, outputs, output value) of
/// (2, 1, 5.0), (1, 2, 3.0 + 1.0) and (3, 1, 10.0).
pub fn block() -> Value {
    json!({
        "hash": BEST_HASH,
        "size": 1543218,
        "nTx": 3,
        "height": 800000,
        "weight": 3993264,
        "tx": [
            { "txid": "a", "vin": [{ "coinbase": "03" }, { "txid": "x", "vout": 0 }], "vout": [{ "value": 5.0, "n": 0 }] },
            { "txid": "b", "vin": [{ "txid": "y", "vout": 1 }], "vout": [{ "value": 3.0, "n": 0 }, { "value": 1.0, "n": 1 }] },
            { "txid": "c", "vin": [{}, {}, {}], "vout": [{ "value": 10.0, "n": 0 }] }
        ]
    })
}

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy::with_budget(Duration::from_secs(2))
}

pub fn collector(node: Arc<FakeNode>, registry: Arc<MetricRegistry>) -> SnapshotCollector<Arc<FakeNode>> {
    let metrics = NodeMetrics::register(registry).expect("register metrics");
    let caller = RetryingCaller::new(node, fast_policy(), metrics.errors.clone());
    SnapshotCollector::new(caller, metrics, vec![2, 3, 5, 20])
}
