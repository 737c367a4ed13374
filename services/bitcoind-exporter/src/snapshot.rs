//! Pure derivation of numeric facts from raw RPC response documents.
//!
//! Fields are looked up by JSON pointer and may be absent; an absent field
//! becomes `None` and the matching instrument is left untouched.

use serde_json::Value;

/// Raw responses gathered during one cycle.
#[derive(Debug, Clone, Default)]
pub struct NodeDocuments {
    pub uptime: Value,
    pub memory_info: Value,
    pub blockchain_info: Value,
    pub network_info: Value,
    pub chain_tips: Value,
    pub mempool_info: Value,
    pub net_totals: Value,
    pub hashps_120: Value,
    pub hashps_since_retarget: Value,
    pub hashps_last_block: Value,
    pub banned: Value,
    /// `(target, estimatesmartfee response)` in configured order.
    pub smart_fees: Vec<(u16, Value)>,
    /// `None` when the latest block could not be fetched this cycle.
    pub latest_block: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryStats {
    pub used: Option<f64>,
    pub free: Option<f64>,
    pub total: Option<f64>,
    pub locked: Option<f64>,
    pub chunks_used: Option<f64>,
    pub chunks_free: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MempoolStats {
    pub bytes: Option<f64>,
    pub size: Option<f64>,
    pub usage: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BannedPeer {
    pub address: String,
    pub reason: String,
    pub created: Option<f64>,
    pub banned_until: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockSummary {
    pub size: Option<f64>,
    pub txs: Option<f64>,
    pub height: Option<f64>,
    pub weight: Option<f64>,
    pub inputs: u64,
    pub outputs: u64,
    /// Sum of every output value across every transaction, in BTC.
    pub value: f64,
}

impl BlockSummary {
    /// Summarize a `getblock <hash> 2` document. Requires the decoded
    /// transaction list; returns `None` if it is missing.
    pub fn from_block(block: &Value) -> Option<Self> {
        let txs = block.get("tx")?.as_array()?;
        let mut summary = BlockSummary {
            size: num(block, "/size"),
            txs: num(block, "/nTx"),
            height: num(block, "/height"),
            weight: num(block, "/weight"),
            ..Default::default()
        };
        for tx in txs {
            summary.inputs += len(tx, "/vin").unwrap_or(0) as u64;
            if let Some(vout) = tx.get("vout").and_then(Value::as_array) {
                summary.outputs += vout.len() as u64;
                summary.value += vout.iter().filter_map(|o| o.get("value").and_then(Value::as_f64)).sum::<f64>();
            }
        }
        Some(summary)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeSnapshot {
    pub uptime: Option<f64>,
    pub blocks: Option<f64>,
    pub peers: Option<f64>,
    pub difficulty: Option<f64>,
    pub hashps_120: Option<f64>,
    pub hashps_since_retarget: Option<f64>,
    pub hashps_last_block: Option<f64>,
    pub server_version: Option<f64>,
    pub protocol_version: Option<f64>,
    pub size_on_disk: Option<f64>,
    pub smart_fees: Vec<(u16, f64)>,
    pub bans: Vec<BannedPeer>,
    pub has_warnings: bool,
    pub chain_tips: Option<f64>,
    pub memory: MemoryStats,
    pub mempool: MempoolStats,
    pub bytes_recv: Option<f64>,
    pub bytes_sent: Option<f64>,
    pub latest_block: Option<BlockSummary>,
}

impl NodeSnapshot {
    pub fn derive(docs: &NodeDocuments) -> Self {
        let mem = &docs.memory_info;
        NodeSnapshot {
            uptime: docs.uptime.as_f64(),
            blocks: num(&docs.blockchain_info, "/blocks"),
            peers: num(&docs.network_info, "/connections"),
            difficulty: num(&docs.blockchain_info, "/difficulty"),
            hashps_120: docs.hashps_120.as_f64(),
            hashps_since_retarget: docs.hashps_since_retarget.as_f64(),
            hashps_last_block: docs.hashps_last_block.as_f64(),
            server_version: num(&docs.network_info, "/version"),
            protocol_version: num(&docs.network_info, "/protocolversion"),
            size_on_disk: num(&docs.blockchain_info, "/size_on_disk"),
            smart_fees: docs
                .smart_fees
                .iter()
                .filter_map(|(target, resp)| num(resp, "/feerate").map(|rate| (*target, rate)))
                .collect(),
            bans: banned_peers(&docs.banned),
            has_warnings: docs.network_info.get("warnings").map(truthy).unwrap_or(false),
            chain_tips: docs.chain_tips.as_array().map(|a| a.len() as f64),
            memory: MemoryStats {
                used: num(mem, "/locked/used"),
                free: num(mem, "/locked/free"),
                total: num(mem, "/locked/total"),
                locked: num(mem, "/locked/locked"),
                chunks_used: num(mem, "/locked/chunks_used"),
                chunks_free: num(mem, "/locked/chunks_free"),
            },
            mempool: MempoolStats {
                bytes: num(&docs.mempool_info, "/bytes"),
                size: num(&docs.mempool_info, "/size"),
                usage: num(&docs.mempool_info, "/usage"),
            },
            bytes_recv: num(&docs.net_totals, "/totalbytesrecv"),
            bytes_sent: num(&docs.net_totals, "/totalbytessent"),
            latest_block: docs.latest_block.as_ref().and_then(BlockSummary::from_block),
        }
    }
}

/// Best block hash as reported by `getblockchaininfo`.
pub fn best_block_hash(blockchain_info: &Value) -> Option<&str> {
    blockchain_info.get("bestblockhash").and_then(Value::as_str)
}

fn banned_peers(list: &Value) -> Vec<BannedPeer> {
    let Some(entries) = list.as_array() else { return Vec::new() };
    entries
        .iter()
        .filter_map(|ban| {
            let address = ban.get("address")?.as_str()?.to_string();
            // recent nodes dropped the reason field
            let reason = ban.get("ban_reason").and_then(Value::as_str).unwrap_or("").to_string();
            Some(BannedPeer { address, reason, created: num(ban, "/ban_created"), banned_until: num(ban, "/banned_until") })
        })
        .collect()
}

/// Non-empty string, array or object, `true`, or a non-zero number.
fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn num(doc: &Value, pointer: &str) -> Option<f64> {
    doc.pointer(pointer).and_then(Value::as_f64)
}

fn len(doc: &Value, pointer: &str) -> Option<usize> {
    doc.pointer(pointer).and_then(Value::as_array).map(Vec::len)
}
