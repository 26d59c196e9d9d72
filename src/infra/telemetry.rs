use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "quire_cache_hit_total",
            Unit::Count,
            "Total number of cache reads served from the backend."
        );
        describe_counter!(
            "quire_cache_miss_total",
            Unit::Count,
            "Total number of cache reads that found no usable entry."
        );
        describe_counter!(
            "quire_cache_backend_error_total",
            Unit::Count,
            "Total number of failed or timed out backend calls, by operation."
        );
        describe_counter!(
            "quire_cache_lock_acquired_total",
            Unit::Count,
            "Total number of computation leases won."
        );
        describe_counter!(
            "quire_cache_lock_wait_total",
            Unit::Count,
            "Total number of callers that waited on another computation."
        );
        describe_counter!(
            "quire_cache_lock_fallback_total",
            Unit::Count,
            "Total number of callers that computed without a lease, by reason (wait_budget, backend_error)."
        );
        describe_histogram!(
            "quire_cache_compute_ms",
            Unit::Milliseconds,
            "Latency of leader computations in milliseconds."
        );
        describe_counter!(
            "quire_cache_invalidation_total",
            Unit::Count,
            "Total number of invalidation runs, by result and scope."
        );
        describe_histogram!(
            "quire_cache_warm_ms",
            Unit::Milliseconds,
            "Cache warm-up latency in milliseconds."
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describing_metrics_twice_is_harmless() {
        describe_metrics();
        describe_metrics();
        assert!(METRIC_DESCRIPTIONS.is_completed());
    }
}
