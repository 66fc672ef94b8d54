//! OpenTelemetry instruments for the Dex controllers
//!
//! Instruments are created lazily against the global meter, so they are
//! no-ops until `telemetry::init_telemetry` installs an exporting provider.

use std::time::Instant;

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("dex-operator"));

/// Histogram of reconciliation duration
///
/// Labels:
/// - `controller`: dex, dexclient
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("dex_reconcile_duration_seconds")
        .with_description("Duration of reconciliation passes in seconds")
        .with_unit("s")
        .build()
});

/// Counter of reconciliation failures
///
/// Labels:
/// - `controller`: dex, dexclient
/// - `error_kind`: kube, validation, dependency, registrar, serialization, internal
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("dex_reconcile_errors_total")
        .with_description("Total number of failed reconciliation passes")
        .with_unit("{errors}")
        .build()
});

/// Counter of registrar outcomes
///
/// Labels:
/// - `op`: created, updated, deleted, none
pub static CLIENT_REGISTRATIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("dex_client_registrations_total")
        .with_description("Total number of client registration outcomes by operation")
        .with_unit("{registrations}")
        .build()
});

/// Times one reconciliation pass and records the result when finished
pub struct ReconcileTimer {
    controller: &'static str,
    start: Instant,
}

impl ReconcileTimer {
    /// Start timing a pass for `controller`
    pub fn start(controller: &'static str) -> Self {
        Self {
            controller,
            start: Instant::now(),
        }
    }

    /// Record a successful pass
    pub fn success(self) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("controller", self.controller),
                KeyValue::new("result", "success"),
            ],
        );
    }

    /// Record a failed pass
    pub fn error(self, error_kind: &'static str) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("controller", self.controller),
                KeyValue::new("result", "error"),
            ],
        );
        RECONCILE_ERRORS.add(
            1,
            &[
                KeyValue::new("controller", self.controller),
                KeyValue::new("error_kind", error_kind),
            ],
        );
    }
}

/// Count one registrar outcome
pub fn record_registration(op: &'static str) {
    CLIENT_REGISTRATIONS.add(1, &[KeyValue::new("op", op)]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_record_without_a_provider() {
        ReconcileTimer::start("dex").success();
        ReconcileTimer::start("dexclient").error("registrar");
        record_registration("created");
    }
}
