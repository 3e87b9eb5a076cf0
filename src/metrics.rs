//! Lightweight metrics helpers for fnagent.
//!
//! Thin wrappers around the `metrics` crate macros. No exporter is embedded; the
//! hosting process installs whatever recorder it scrapes with. Until one is
//! installed every call here is a no-op.
//!
//! Provided metrics:
//! * `fnagent_function_calls_total` (counter; namespace, name, path, method, code)
//! * `fnagent_function_errors_total` (counter; same labels, only codes >= 400)
//! * `fnagent_function_overhead_seconds` (histogram; same labels)
//! * `fnagent_forward_retries_total` (counter; reason)
//! * `fnagent_address_cache_events_total` (counter; event)
//! * `fnagent_rendezvous_deliveries_total` (counter; outcome)
use std::time::Duration;

use metrics::{Unit, counter, describe_counter, describe_histogram, histogram};
use once_cell::sync::Lazy;

use crate::ports::function_metrics::{FunctionCall, FunctionMetrics};

pub const FNAGENT_FUNCTION_CALLS_TOTAL: &str = "fnagent_function_calls_total";
pub const FNAGENT_FUNCTION_ERRORS_TOTAL: &str = "fnagent_function_errors_total";
pub const FNAGENT_FUNCTION_OVERHEAD_SECONDS: &str = "fnagent_function_overhead_seconds";
pub const FNAGENT_FORWARD_RETRIES_TOTAL: &str = "fnagent_forward_retries_total"; // labels: reason
pub const FNAGENT_ADDRESS_CACHE_EVENTS_TOTAL: &str = "fnagent_address_cache_events_total"; // labels: event
pub const FNAGENT_RENDEZVOUS_DELIVERIES_TOTAL: &str = "fnagent_rendezvous_deliveries_total"; // labels: outcome

static DESCRIPTIONS: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        FNAGENT_FUNCTION_CALLS_TOTAL,
        Unit::Count,
        "Total number of function invocations handled by the agent."
    );
    describe_counter!(
        FNAGENT_FUNCTION_ERRORS_TOTAL,
        Unit::Count,
        "Function invocations answered with a 4xx/5xx status."
    );
    describe_histogram!(
        FNAGENT_FUNCTION_OVERHEAD_SECONDS,
        Unit::Seconds,
        "Wall-clock time spent serving a function invocation."
    );
    describe_counter!(
        FNAGENT_FORWARD_RETRIES_TOTAL,
        Unit::Count,
        "Forwarding rounds retried after a dial failure or a not-ready backend."
    );
    describe_counter!(
        FNAGENT_ADDRESS_CACHE_EVENTS_TOTAL,
        Unit::Count,
        "Service address cache hits, misses, resolutions and invalidations."
    );
    describe_counter!(
        FNAGENT_RENDEZVOUS_DELIVERIES_TOTAL,
        Unit::Count,
        "Completion callbacks by delivery outcome."
    );
});

/// Record a finished function invocation.
pub fn record_function_call(call: &FunctionCall) {
    let labels = [
        ("namespace", call.function.namespace.clone()),
        ("name", call.function.name.clone()),
        ("path", call.path.clone()),
        ("method", call.method.to_string()),
        ("code", call.status.as_u16().to_string()),
    ];

    counter!(FNAGENT_FUNCTION_CALLS_TOTAL, &labels).increment(1);
    if call.status.as_u16() >= 400 {
        counter!(FNAGENT_FUNCTION_ERRORS_TOTAL, &labels).increment(1);
    }
    histogram!(FNAGENT_FUNCTION_OVERHEAD_SECONDS, &labels).record(call.duration.as_secs_f64());
}

pub fn increment_forward_retry(reason: &'static str) {
    counter!(FNAGENT_FORWARD_RETRIES_TOTAL, "reason" => reason).increment(1);
}

pub fn record_address_cache_event(event: &'static str) {
    counter!(FNAGENT_ADDRESS_CACHE_EVENTS_TOTAL, "event" => event).increment(1);
}

pub fn record_rendezvous_delivery(outcome: &'static str) {
    counter!(FNAGENT_RENDEZVOUS_DELIVERIES_TOTAL, "outcome" => outcome).increment(1);
}

/// [`FunctionMetrics`] sink backed by the global `metrics` recorder.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecorderFunctionMetrics;

impl FunctionMetrics for RecorderFunctionMetrics {
    fn record_call(&self, call: &FunctionCall) {
        record_function_call(call);
    }
}

/// Fractional milliseconds, as logged by the access log.
pub fn as_millis_f64(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Initialize metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    tracing::info!("Initializing fnagent metrics");
    Lazy::force(&DESCRIPTIONS);
    Ok(())
}

#[cfg(test)]
mod tests {
    use http::{Method, StatusCode};

    use super::*;
    use crate::core::function::FunctionIdentity;

    #[test]
    fn test_init_metrics() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_record_without_recorder_is_noop() {
        let call = FunctionCall {
            function: FunctionIdentity::new("hello", "default", "1", "uid"),
            path: "/hello".to_string(),
            method: Method::GET,
            status: StatusCode::BAD_GATEWAY,
            duration: Duration::from_millis(12),
        };
        RecorderFunctionMetrics.record_call(&call);
        increment_forward_retry("dial");
        record_address_cache_event("hit");
        record_rendezvous_delivery("delivered");
    }

    #[test]
    fn test_as_millis() {
        assert_eq!(as_millis_f64(Duration::from_millis(250)), 250.0);
    }
}
