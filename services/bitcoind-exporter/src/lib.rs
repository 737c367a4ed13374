//! Prometheus exporter for a bitcoind node.
//!
//! A single loop polls the node's RPC interface every refresh interval and
//! republishes what it finds as gauges and counters; the metrics endpoint is
//! served concurrently from the same registry.

pub mod collector;
pub mod config;
pub mod error;
pub mod metrics;
pub mod retrying;
pub mod rpc;
pub mod scheduler;
pub mod snapshot;

pub use collector::SnapshotCollector;
pub use config::{ConfigError, ExporterConfig};
pub use error::ExporterError;
pub use metrics::NodeMetrics;
pub use retrying::RetryingCaller;
pub use rpc::{EndpointSource, RpcClient, RpcError, RpcTransport};
pub use scheduler::{termination_signal, Exit, LoopState, SchedulerLoop};
