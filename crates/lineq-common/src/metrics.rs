//! Metrics registry for lineq observability
//!
//! Provides OpenTelemetry metrics for:
//! - The reconcile queue (depth, retries, drops)
//! - Reconciliation (duration, created Ingresses)
//! - Leader election (leadership state, transitions)
//!
//! Instruments are no-ops until a meter provider is installed by
//! [`crate::telemetry::init_telemetry`].

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

/// Global meter for lineq metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("lineq"));

// ============================================================================
// Queue Metrics
// ============================================================================

/// Gauge tracking items waiting in the reconcile queue
pub static QUEUE_DEPTH: Lazy<Gauge<u64>> = Lazy::new(|| {
    METER
        .u64_gauge("lineq_queue_depth")
        .with_description("Number of events waiting in the reconcile queue")
        .with_unit("{events}")
        .build()
});

/// Counter of requeued events
///
/// Labels:
/// - `attempt`: attempt number the event was requeued with
pub static QUEUE_RETRIES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("lineq_queue_retries_total")
        .with_description("Total number of events requeued after a failed reconcile")
        .with_unit("{events}")
        .build()
});

/// Counter of events dropped without success
///
/// Labels:
/// - `reason`: retries_exhausted, permanent_error
pub static QUEUE_DROPS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("lineq_queue_drops_total")
        .with_description("Total number of events dropped without a successful reconcile")
        .with_unit("{events}")
        .build()
});

// ============================================================================
// Reconcile Metrics
// ============================================================================

/// Histogram of reconcile duration
///
/// Labels:
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("lineq_reconcile_duration_seconds")
        .with_description("Duration of waiting room reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of Ingresses created
pub static INGRESSES_CREATED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("lineq_ingresses_created_total")
        .with_description("Total number of Ingresses created for waiting rooms")
        .with_unit("{ingresses}")
        .build()
});

// ============================================================================
// Leader Election Metrics
// ============================================================================

/// Gauge set to 1 while this replica leads, 0 otherwise
pub static IS_LEADER: Lazy<Gauge<u64>> = Lazy::new(|| {
    METER
        .u64_gauge("lineq_leader")
        .with_description("Whether this replica currently holds the leader lease")
        .build()
});

/// Counter of leadership changes observed by this replica
///
/// Labels:
/// - `event`: acquired, lost
pub static LEADERSHIP_TRANSITIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("lineq_leadership_transitions_total")
        .with_description("Total number of leadership acquisitions and losses")
        .with_unit("{transitions}")
        .build()
});

/// Result label for reconcile metrics
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileResult {
    /// Reconcile returned Ok
    Success,
    /// Reconcile returned an error
    Error,
}

impl ReconcileResult {
    fn as_str(self) -> &'static str {
        match self {
            ReconcileResult::Success => "success",
            ReconcileResult::Error => "error",
        }
    }
}

/// Record the outcome and duration of one reconcile
pub fn record_reconcile(result: ReconcileResult, duration_secs: f64) {
    RECONCILE_DURATION.record(duration_secs, &[KeyValue::new("result", result.as_str())]);
}

/// Record a queue drop with its reason
pub fn record_drop(reason: &'static str) {
    QUEUE_DROPS.add(1, &[KeyValue::new("reason", reason)]);
}

/// Record a leadership change
pub fn record_leadership(leading: bool) {
    IS_LEADER.record(u64::from(leading), &[]);
    let event = if leading { "acquired" } else { "lost" };
    LEADERSHIP_TRANSITIONS.add(1, &[KeyValue::new("event", event)]);
}
