//! One refresh cycle: poll the node, derive facts, publish them.

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::ExporterError;
use crate::metrics::NodeMetrics;
use crate::retrying::RetryingCaller;
use crate::rpc::RpcTransport;
use crate::snapshot::{best_block_hash, NodeDocuments, NodeSnapshot};

pub struct SnapshotCollector<T> {
    caller: RetryingCaller<T>,
    metrics: NodeMetrics,
    smart_fee_targets: Vec<u16>,
}

impl<T: RpcTransport> SnapshotCollector<T> {
    pub fn new(caller: RetryingCaller<T>, metrics: NodeMetrics, smart_fee_targets: Vec<u16>) -> Self {
        Self { caller, metrics, smart_fee_targets }
    }

    pub fn metrics(&self) -> &NodeMetrics {
        &self.metrics
    }

    pub fn caller(&self) -> &RetryingCaller<T> {
        &self.caller
    }

    /// Run one cycle. Every call finishes before any instrument is written,
    /// so a failing cycle leaves all instruments at their last values.
    pub async fn collect_and_publish(&mut self) -> Result<(), ExporterError> {
        let docs = self.fetch().await?;
        let snapshot = NodeSnapshot::derive(&docs);
        if docs.latest_block.is_some() && snapshot.latest_block.is_none() {
            warn!("latest block response carries no transaction list");
            self.metrics.count_error("partial_aggregate");
        }
        self.metrics.publish(&snapshot)?;
        debug!(blocks = ?snapshot.blocks, peers = ?snapshot.peers, bans = snapshot.bans.len(), "metrics published");
        Ok(())
    }

    pub async fn fetch(&self) -> Result<NodeDocuments, ExporterError> {
        let uptime = self.call("uptime", &[]).await?;
        let memory_info = self.call("getmemoryinfo", &[json!("stats")]).await?;
        let blockchain_info = self.call("getblockchaininfo", &[]).await?;
        let network_info = self.call("getnetworkinfo", &[]).await?;
        let chain_tips = self.call("getchaintips", &[]).await?;
        let mempool_info = self.call("getmempoolinfo", &[]).await?;
        let net_totals = self.call("getnettotals", &[]).await?;
        let latest_block = self.latest_block(&blockchain_info).await;
        let hashps_120 = self.call("getnetworkhashps", &[json!(120)]).await?;
        let hashps_since_retarget = self.call("getnetworkhashps", &[json!(-1)]).await?;
        let hashps_last_block = self.call("getnetworkhashps", &[json!(1)]).await?;
        let banned = self.call("listbanned", &[]).await?;

        let mut smart_fees = Vec::with_capacity(self.smart_fee_targets.len());
        for &target in &self.smart_fee_targets {
            smart_fees.push((target, self.call("estimatesmartfee", &[json!(target)]).await?));
        }

        Ok(NodeDocuments {
            uptime,
            memory_info,
            blockchain_info,
            network_info,
            chain_tips,
            mempool_info,
            net_totals,
            hashps_120,
            hashps_since_retarget,
            hashps_last_block,
            banned,
            smart_fees,
            latest_block,
        })
    }

    async fn call(&self, method: &str, params: &[Value]) -> Result<Value, ExporterError> {
        self.caller.call(method, params).await
    }

    /// Fetch the best block with full transactions. Any failure here only
    /// costs the block-derived facts for this cycle.
    async fn latest_block(&self, blockchain_info: &Value) -> Option<Value> {
        let Some(hash) = best_block_hash(blockchain_info) else {
            warn!("getblockchaininfo carries no bestblockhash");
            self.metrics.count_error("partial_aggregate");
            return None;
        };
        match self.call("getblock", &[json!(hash), json!(2)]).await {
            Ok(block) => Some(block),
            Err(e) => {
                let err = ExporterError::PartialAggregate { fact: "latest block", source: Box::new(e) };
                warn!(block = hash, error = %err, "can't retrieve block from node");
                self.metrics.count_error(err.kind());
                None
            }
        }
    }
}
