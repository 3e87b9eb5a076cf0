use std::time::Duration;

use http::{Method, StatusCode};

use crate::core::function::FunctionIdentity;

/// One finished invocation, as handed to the metrics sink.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub function: FunctionIdentity,
    /// Trigger prefix or relative URL the request matched
    pub path: String,
    pub method: Method,
    pub status: StatusCode,
    pub duration: Duration,
}

/// Sink for per-invocation metrics.
pub trait FunctionMetrics: Send + Sync + 'static {
    fn record_call(&self, call: &FunctionCall);
}
