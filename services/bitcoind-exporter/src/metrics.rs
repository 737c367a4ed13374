//! The exporter's instrument set.

use std::collections::HashMap;
use std::sync::Arc;

use chainwatch_core::{MetricRegistry, RegistryError};
use prometheus::{Counter, CounterVec, Gauge, GaugeVec};

use crate::snapshot::NodeSnapshot;

/// Lazily created `bitcoin_est_smart_fee_<n>` gauges, one per target.
pub struct SmartFeeGauges {
    registry: Arc<MetricRegistry>,
    gauges: HashMap<u16, Gauge>,
}

impl SmartFeeGauges {
    pub fn new(registry: Arc<MetricRegistry>) -> Self {
        Self { registry, gauges: HashMap::new() }
    }

    pub fn gauge(&mut self, target: u16) -> Result<&Gauge, RegistryError> {
        if !self.gauges.contains_key(&target) {
            let gauge = self.registry.define_gauge(
                &format!("bitcoin_est_smart_fee_{target}"),
                &format!("Estimated smart fee per kilobyte for confirmation in {target} blocks"),
            )?;
            self.gauges.insert(target, gauge);
        }
        // inserted above when missing
        Ok(&self.gauges[&target])
    }

    pub fn len(&self) -> usize {
        self.gauges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gauges.is_empty()
    }
}

pub struct MemoryGauges {
    pub used: Gauge,
    pub free: Gauge,
    pub total: Gauge,
    pub locked: Gauge,
    pub chunks_used: Gauge,
    pub chunks_free: Gauge,
}

pub struct LatestBlockGauges {
    pub height: Gauge,
    pub weight: Gauge,
    pub size: Gauge,
    pub txs: Gauge,
    pub inputs: Gauge,
    pub outputs: Gauge,
    pub value: Gauge,
}

pub struct NodeMetrics {
    pub blocks: Gauge,
    pub difficulty: Gauge,
    pub peers: Gauge,
    pub hashps_since_retarget: Gauge,
    pub hashps_last_block: Gauge,
    pub hashps: Gauge,
    pub warnings: Counter,
    pub uptime: Gauge,
    pub memory: MemoryGauges,
    pub mempool_bytes: Gauge,
    pub mempool_size: Gauge,
    pub mempool_usage: Gauge,
    pub latest_block: LatestBlockGauges,
    pub num_chaintips: Gauge,
    pub total_bytes_recv: Gauge,
    pub total_bytes_sent: Gauge,
    pub ban_created: GaugeVec,
    pub banned_until: GaugeVec,
    pub server_version: Gauge,
    pub protocol_version: Gauge,
    pub size_on_disk: Gauge,
    pub smart_fees: SmartFeeGauges,
    pub errors: CounterVec,
    pub process_time: Counter,
}

impl NodeMetrics {
    pub fn register(registry: Arc<MetricRegistry>) -> Result<Self, RegistryError> {
        let r = &registry;
        let ban_labels = ["address", "reason"];
        Ok(Self {
            blocks: r.define_gauge("bitcoin_blocks", "Block height")?,
            difficulty: r.define_gauge("bitcoin_difficulty", "Difficulty")?,
            peers: r.define_gauge("bitcoin_peers", "Number of peers")?,
            hashps_since_retarget: r.define_gauge(
                "bitcoin_hashps_neg1",
                "Estimated network hash rate per second since the last difficulty change",
            )?,
            hashps_last_block: r.define_gauge("bitcoin_hashps_1", "Estimated network hash rate per second for the last block")?,
            hashps: r.define_gauge("bitcoin_hashps", "Estimated network hash rate per second for the last 120 blocks")?,
            warnings: r.define_counter("bitcoin_warnings", "Number of network or blockchain warnings detected")?,
            uptime: r.define_gauge("bitcoin_uptime", "Number of seconds the Bitcoin daemon has been running")?,
            memory: MemoryGauges {
                used: r.define_gauge("bitcoin_meminfo_used", "Number of bytes used")?,
                free: r.define_gauge("bitcoin_meminfo_free", "Number of bytes available")?,
                total: r.define_gauge("bitcoin_meminfo_total", "Number of bytes managed")?,
                locked: r.define_gauge("bitcoin_meminfo_locked", "Number of bytes locked")?,
                chunks_used: r.define_gauge("bitcoin_meminfo_chunks_used", "Number of allocated chunks")?,
                chunks_free: r.define_gauge("bitcoin_meminfo_chunks_free", "Number of unused chunks")?,
            },
            mempool_bytes: r.define_gauge("bitcoin_mempool_bytes", "Size of mempool in bytes")?,
            mempool_size: r.define_gauge("bitcoin_mempool_size", "Number of unconfirmed transactions in mempool")?,
            mempool_usage: r.define_gauge("bitcoin_mempool_usage", "Total memory usage for the mempool")?,
            latest_block: LatestBlockGauges {
                height: r.define_gauge("bitcoin_latest_block_height", "Height or index of latest block")?,
                weight: r.define_gauge("bitcoin_latest_block_weight", "Weight of latest block according to BIP 141")?,
                size: r.define_gauge("bitcoin_latest_block_size", "Size of latest block in bytes")?,
                txs: r.define_gauge("bitcoin_latest_block_txs", "Number of transactions in latest block")?,
                inputs: r.define_gauge("bitcoin_latest_block_inputs", "Number of inputs in transactions of latest block")?,
                outputs: r.define_gauge("bitcoin_latest_block_outputs", "Number of outputs in transactions of latest block")?,
                value: r.define_gauge("bitcoin_latest_block_value", "Bitcoin value of all transactions in the latest block")?,
            },
            num_chaintips: r.define_gauge("bitcoin_num_chaintips", "Number of known blockchain branches")?,
            total_bytes_recv: r.define_gauge("bitcoin_total_bytes_recv", "Total bytes received")?,
            total_bytes_sent: r.define_gauge("bitcoin_total_bytes_sent", "Total bytes sent")?,
            ban_created: r.define_labeled_gauge("bitcoin_ban_created", "Time the ban was created", &ban_labels)?,
            banned_until: r.define_labeled_gauge("bitcoin_banned_until", "Time the ban expires", &ban_labels)?,
            server_version: r.define_gauge("bitcoin_server_version", "The server version")?,
            protocol_version: r.define_gauge("bitcoin_protocol_version", "The protocol version of the server")?,
            size_on_disk: r.define_gauge("bitcoin_size_on_disk", "Estimated size of the block and undo files")?,
            errors: r.define_labeled_counter(
                "bitcoin_exporter_errors",
                "Number of errors encountered by the exporter",
                &["type"],
            )?,
            process_time: r.define_counter(
                "bitcoin_exporter_process_time",
                "Time spent processing metrics from bitcoin node",
            )?,
            smart_fees: SmartFeeGauges::new(registry.clone()),
        })
    }

    pub fn count_error(&self, kind: &str) {
        self.errors.with_label_values(&[kind]).inc();
    }

    /// Write every fact present in `snap`. Absent facts leave their
    /// instruments at the previous value.
    pub fn publish(&mut self, snap: &NodeSnapshot) -> Result<(), RegistryError> {
        set(&self.uptime, snap.uptime);
        set(&self.blocks, snap.blocks);
        set(&self.peers, snap.peers);
        set(&self.difficulty, snap.difficulty);
        set(&self.hashps, snap.hashps_120);
        set(&self.hashps_since_retarget, snap.hashps_since_retarget);
        set(&self.hashps_last_block, snap.hashps_last_block);
        set(&self.server_version, snap.server_version);
        set(&self.protocol_version, snap.protocol_version);
        set(&self.size_on_disk, snap.size_on_disk);

        for (target, rate) in &snap.smart_fees {
            self.smart_fees.gauge(*target)?.set(*rate);
        }

        for ban in &snap.bans {
            let labels = [ban.address.as_str(), ban.reason.as_str()];
            set(&self.ban_created.with_label_values(&labels), ban.created);
            set(&self.banned_until.with_label_values(&labels), ban.banned_until);
        }

        if snap.has_warnings {
            self.warnings.inc();
        }

        set(&self.num_chaintips, snap.chain_tips);

        let m = &self.memory;
        set(&m.used, snap.memory.used);
        set(&m.free, snap.memory.free);
        set(&m.total, snap.memory.total);
        set(&m.locked, snap.memory.locked);
        set(&m.chunks_used, snap.memory.chunks_used);
        set(&m.chunks_free, snap.memory.chunks_free);

        set(&self.mempool_bytes, snap.mempool.bytes);
        set(&self.mempool_size, snap.mempool.size);
        set(&self.mempool_usage, snap.mempool.usage);

        set(&self.total_bytes_recv, snap.bytes_recv);
        set(&self.total_bytes_sent, snap.bytes_sent);

        if let Some(block) = &snap.latest_block {
            let b = &self.latest_block;
            set(&b.size, block.size);
            set(&b.txs, block.txs);
            set(&b.height, block.height);
            set(&b.weight, block.weight);
            b.inputs.set(block.inputs as f64);
            b.outputs.set(block.outputs as f64);
            b.value.set(block.value);
        }
        Ok(())
    }
}

fn set(gauge: &Gauge, value: Option<f64>) {
    if let Some(v) = value {
        gauge.set(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{BannedPeer, BlockSummary};

    fn metrics() -> (Arc<MetricRegistry>, NodeMetrics) {
        let registry = Arc::new(MetricRegistry::new());
        let metrics = NodeMetrics::register(registry.clone()).unwrap();
        (registry, metrics)
    }

    #[test]
    fn registering_twice_reuses_instruments() {
        let (registry, first) = metrics();
        let count = registry.len();
        let second = NodeMetrics::register(registry.clone()).unwrap();
        assert_eq!(registry.len(), count);
        first.blocks.set(5.0);
        assert_eq!(second.blocks.get(), 5.0);
    }

    #[test]
    fn fee_gauges_created_once_per_target() {
        let (registry, mut m) = metrics();
        let before = registry.len();
        for _ in 0..10 {
            m.publish(&NodeSnapshot { smart_fees: vec![(2, 0.0001), (20, 0.00002)], ..Default::default() }).unwrap();
        }
        assert_eq!(m.smart_fees.len(), 2);
        assert_eq!(registry.len(), before + 2);
        assert!(registry.contains("bitcoin_est_smart_fee_2"));
        assert!(registry.contains("bitcoin_est_smart_fee_20"));
        assert_eq!(m.smart_fees.gauge(2).unwrap().get(), 0.0001);
        assert_eq!(m.smart_fees.gauge(20).unwrap().get(), 0.00002);
    }

    #[test]
    fn absent_facts_keep_previous_values() {
        let (_registry, mut m) = metrics();
        m.publish(&NodeSnapshot {
            blocks: Some(10.0),
            latest_block: Some(BlockSummary { height: Some(10.0), inputs: 6, outputs: 4, value: 19.0, ..Default::default() }),
            ..Default::default()
        })
        .unwrap();
        m.publish(&NodeSnapshot { blocks: Some(11.0), latest_block: None, ..Default::default() }).unwrap();
        assert_eq!(m.blocks.get(), 11.0);
        assert_eq!(m.latest_block.height.get(), 10.0);
        assert_eq!(m.latest_block.inputs.get(), 6.0);
        assert_eq!(m.latest_block.value.get(), 19.0);
    }

    #[test]
    fn warnings_counted_once_per_cycle() {
        let (_registry, mut m) = metrics();
        m.publish(&NodeSnapshot { has_warnings: true, ..Default::default() }).unwrap();
        m.publish(&NodeSnapshot { has_warnings: false, ..Default::default() }).unwrap();
        m.publish(&NodeSnapshot { has_warnings: true, ..Default::default() }).unwrap();
        assert_eq!(m.warnings.get(), 2.0);
    }

    #[test]
    fn bans_keyed_by_address_and_reason() {
        let (_registry, mut m) = metrics();
        let ban = |reason: &str, created| BannedPeer {
            address: "10.0.0.1/32".into(),
            reason: reason.into(),
            created: Some(created),
            banned_until: Some(created + 100.0),
        };
        m.publish(&NodeSnapshot { bans: vec![ban("manually added", 1.0), ban("node misbehaving", 2.0)], ..Default::default() })
            .unwrap();
        assert_eq!(m.ban_created.with_label_values(&["10.0.0.1/32", "manually added"]).get(), 1.0);
        assert_eq!(m.banned_until.with_label_values(&["10.0.0.1/32", "node misbehaving"]).get(), 102.0);
    }
}
