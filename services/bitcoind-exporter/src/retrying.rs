//! RPC calls wrapped in the time-budgeted retry loop.

use std::time::Duration;

use chainwatch_resilience::{retry_with_budget, Classify, RetryError, RetryObserver, RetryPolicy};
use prometheus::CounterVec;
use serde_json::Value;
use tracing::warn;

use crate::error::ExporterError;
use crate::rpc::{RpcError, RpcTransport};

pub struct RetryingCaller<T> {
    transport: T,
    policy: RetryPolicy,
    errors: CounterVec,
}

/// Counts each scheduled retry under the failure kind that caused it.
struct ErrorCounting<'a> {
    method: &'a str,
    errors: &'a CounterVec,
}

impl RetryObserver<RpcError> for ErrorCounting<'_> {
    fn on_retry(&self, err: &RpcError, attempt: u32, delay: Duration) {
        self.errors.with_label_values(&[err.kind()]).inc();
        warn!(method = self.method, attempt, delay_ms = delay.as_millis() as u64, error = %err, "rpc call failed, retrying");
    }
}

impl<T: RpcTransport> RetryingCaller<T> {
    /// `errors` is the exporter's error counter, labeled by `type`.
    pub fn new(transport: T, policy: RetryPolicy, errors: CounterVec) -> Self {
        Self { transport, policy, errors }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn call(&self, method: &str, params: &[Value]) -> Result<Value, ExporterError> {
        let observer = ErrorCounting { method, errors: &self.errors };
        retry_with_budget(&self.policy, &observer, |_| self.transport.call(method, params))
            .await
            .map_err(|e| match e {
                RetryError::BudgetExceeded { last, attempts, elapsed, .. } => {
                    ExporterError::RetryBudgetExceeded { method: method.to_string(), attempts, elapsed, last }
                }
                RetryError::Terminal(source) => ExporterError::Call { method: method.to_string(), source },
            })
    }
}
