use std::time::Duration;

use chainwatch_core::RegistryError;
use chainwatch_resilience::Classify;
use thiserror::Error;

use crate::rpc::RpcError;

#[derive(Debug, Error)]
pub enum ExporterError {
    /// Retryable failures kept happening until the time budget ran out.
    /// Ends the current cycle only.
    #[error("{method}: retry budget exceeded after {attempts} attempts in {elapsed:?}: {last}")]
    RetryBudgetExceeded {
        method: String,
        attempts: u32,
        elapsed: Duration,
        #[source]
        last: RpcError,
    },
    #[error("{method}: {source}")]
    Call {
        method: String,
        #[source]
        source: RpcError,
    },
    /// One optional derived fact could not be produced; the rest of the cycle
    /// is unaffected.
    #[error("{fact} unavailable: {source}")]
    PartialAggregate {
        fact: &'static str,
        #[source]
        source: Box<ExporterError>,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ExporterError {
    pub fn kind(&self) -> &'static str {
        match self {
            ExporterError::RetryBudgetExceeded { .. } => "retry_budget_exceeded",
            ExporterError::Call { source, .. } => source.kind(),
            ExporterError::PartialAggregate { .. } => "partial_aggregate",
            ExporterError::Registry(_) => "registry",
        }
    }

    /// Whether the process should stop: misconfiguration, not a transient fault.
    pub fn is_fatal(&self) -> bool {
        match self {
            ExporterError::Call { source, .. } => source.is_fatal(),
            ExporterError::Registry(_) => true,
            ExporterError::RetryBudgetExceeded { .. } | ExporterError::PartialAggregate { .. } => false,
        }
    }
}
