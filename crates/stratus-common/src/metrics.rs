//! OpenTelemetry instruments for reconcile observability

use std::time::Duration;

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{global, KeyValue};

static METER: Lazy<Meter> = Lazy::new(|| global::meter("stratus"));

/// Histogram of reconcile pass duration
///
/// Labels:
/// - `kind`: cluster, machine, vpc, firewall, bucket, key
/// - `result`: done, requeue, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("stratus_reconcile_duration_seconds")
        .with_description("Duration of reconcile passes in seconds")
        .with_unit("s")
        .build()
});

/// Counter of reconcile errors
///
/// Labels:
/// - `kind`
/// - `reason`: the error's failure reason
/// - `class`: transient, terminal
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("stratus_reconcile_errors_total")
        .with_description("Total number of reconcile errors")
        .with_unit("{errors}")
        .build()
});

/// Counter of stage executions
///
/// Labels:
/// - `kind`
/// - `stage`: condition type of the stage
/// - `outcome`: success, retry, terminal
pub static STAGE_OUTCOMES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("stratus_stage_outcomes_total")
        .with_description("Stage executions by outcome")
        .with_unit("{stages}")
        .build()
});

/// Counter of instance creations deferred by the admission limiter
pub static ADMISSION_REFUSALS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("stratus_admission_refusals_total")
        .with_description("Instance creations deferred by the client-side rate limiter")
        .with_unit("{refusals}")
        .build()
});

/// Record the duration and result of one pass
pub fn record_reconcile(kind: &'static str, result: &'static str, elapsed: Duration) {
    RECONCILE_DURATION.record(
        elapsed.as_secs_f64(),
        &[KeyValue::new("kind", kind), KeyValue::new("result", result)],
    );
}

/// Record a failed pass
pub fn record_error(kind: &'static str, reason: &'static str, retryable: bool) {
    let class = if retryable { "transient" } else { "terminal" };
    RECONCILE_ERRORS.add(
        1,
        &[
            KeyValue::new("kind", kind),
            KeyValue::new("reason", reason),
            KeyValue::new("class", class),
        ],
    );
}

/// Record one stage execution
pub fn record_stage(kind: &'static str, stage: &'static str, outcome: &'static str) {
    STAGE_OUTCOMES.add(
        1,
        &[
            KeyValue::new("kind", kind),
            KeyValue::new("stage", stage),
            KeyValue::new("outcome", outcome),
        ],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_a_provider_is_a_noop() {
        record_reconcile("machine", "done", Duration::from_millis(12));
        record_error("machine", "CloudApiError", true);
        record_stage("machine", "InstanceCreated", "success");
        ADMISSION_REFUSALS.add(1, &[]);
    }
}
