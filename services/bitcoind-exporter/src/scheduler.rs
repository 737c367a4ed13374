//! Fixed-interval driver for the collector.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::collector::SnapshotCollector;
use crate::error::ExporterError;
use crate::rpc::RpcTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    ShuttingDown,
    Terminated,
}

/// Why the loop stopped.
#[derive(Debug)]
pub enum Exit {
    /// Termination signal received.
    Shutdown,
    /// A failure that retrying cannot fix, such as rejected credentials.
    Fatal(ExporterError),
}

impl Exit {
    pub fn code(&self) -> i32 {
        match self {
            Exit::Shutdown => 0,
            Exit::Fatal(_) => 1,
        }
    }
}

pub struct SchedulerLoop<T> {
    collector: SnapshotCollector<T>,
    interval: Duration,
    state: LoopState,
    cycles: u64,
}

impl<T: RpcTransport> SchedulerLoop<T> {
    pub fn new(collector: SnapshotCollector<T>, interval: Duration) -> Self {
        Self { collector, interval, state: LoopState::Running, cycles: 0 }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Completed cycles, successful or not.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn collector(&self) -> &SnapshotCollector<T> {
        &self.collector
    }

    /// Cycle and sleep until `shutdown` resolves or a fatal failure occurs.
    /// A signal interrupts an in-flight cycle as well as the sleep.
    pub async fn run<S: Future<Output = ()>>(&mut self, shutdown: S) -> Exit {
        tokio::pin!(shutdown);
        self.state = LoopState::Running;
        loop {
            let outcome = tokio::select! {
                _ = &mut shutdown => None,
                res = self.cycle() => Some(res),
            };
            match outcome {
                None => return self.shut_down(),
                Some(Err(e)) => {
                    self.state = LoopState::Terminated;
                    return Exit::Fatal(e);
                }
                Some(Ok(())) => {}
            }
            tokio::select! {
                _ = &mut shutdown => return self.shut_down(),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// One timed cycle. Only fatal failures are returned; everything else is
    /// logged, counted and left for the next cycle.
    async fn cycle(&mut self) -> Result<(), ExporterError> {
        let started = Instant::now();
        let res = self.collector.collect_and_publish().await;
        let elapsed = started.elapsed();
        let metrics = self.collector.metrics();
        metrics.process_time.inc_by(elapsed.as_secs_f64());
        self.cycles += 1;
        match res {
            Ok(()) => {
                info!(cycle = self.cycles, elapsed_ms = elapsed.as_millis() as u64, "refresh complete");
                Ok(())
            }
            Err(e) => {
                metrics.count_error(e.kind());
                if e.is_fatal() {
                    error!(cycle = self.cycles, error = %e, "unrecoverable failure talking to node (bad credentials? non-JSON response?)");
                    Err(e)
                } else {
                    warn!(cycle = self.cycles, kind = e.kind(), error = %e, "refresh failed");
                    Ok(())
                }
            }
        }
    }

    fn shut_down(&mut self) -> Exit {
        self.state = LoopState::ShuttingDown;
        info!(cycles = self.cycles, "termination signal received, exiting");
        Exit::Shutdown
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
pub async fn termination_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = ?e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let term = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = ?e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let term = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {}
        _ = term => {}
    }
}
