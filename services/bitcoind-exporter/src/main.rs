use std::sync::Arc;

use anyhow::{Context, Result};
use bitcoind_exporter::{
    termination_signal, EndpointSource, Exit, ExporterConfig, NodeMetrics, RetryingCaller, RpcClient, SchedulerLoop,
    SnapshotCollector,
};
use chainwatch_core::{init_tracing, start_metrics_server, MetricRegistry};
use chainwatch_resilience::RetryPolicy;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("bitcoind-exporter")?;
    let cfg = ExporterConfig::load().context("loading configuration")?;

    let registry = Arc::new(MetricRegistry::new());
    let metrics = NodeMetrics::register(registry.clone())?;
    let server = start_metrics_server(registry, cfg.metrics_addr()).await?;

    let source = EndpointSource::from_config(&cfg)?;
    let rpc_target = match &source {
        EndpointSource::NodeConfig { path, fallback } => format!("node config {} (else {fallback})", path.display()),
        EndpointSource::Direct(endpoint) => endpoint.to_string(),
    };
    info!(
        %rpc_target,
        metrics_addr = %server.local_addr,
        refresh_secs = cfg.refresh_interval.as_secs_f64(),
        retry_budget_secs = cfg.retry_budget.as_secs(),
        retries_hint = cfg.retries,
        smart_fee_targets = ?cfg.smart_fee_targets,
        "bitcoind-exporter starting"
    );
    let client = RpcClient::new(source, cfg.retry_budget)?;
    let caller = RetryingCaller::new(client, RetryPolicy::with_budget(cfg.retry_budget), metrics.errors.clone());
    let collector = SnapshotCollector::new(caller, metrics, cfg.smart_fee_targets.clone());
    let mut scheduler = SchedulerLoop::new(collector, cfg.refresh_interval);

    match scheduler.run(termination_signal()).await {
        Exit::Shutdown => Ok(()),
        Exit::Fatal(e) => Err(anyhow::Error::new(e).context("rpc call did not return usable JSON, bad credentials?")),
    }
}
