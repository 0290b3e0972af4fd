use std::fmt;
use std::time::Duration;

use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::{global, KeyValue};

/// Instruments shared by the workers.
///
/// Built from the global meter provider, so they are no-ops unless
/// `setup_tracing` installed an exporter first.
#[derive(Clone)]
pub struct Metrics {
    appended: Counter<u64>,
    acknowledged: Counter<u64>,
    claimed: Counter<u64>,
    retry_failures: Counter<u64>,
    recovery_ms: Histogram<f64>,
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let meter = global::meter(env!("CARGO_PKG_NAME"));
        Self {
            appended: meter
                .u64_counter("streamclaim.entries.appended")
                .with_description("entries appended by the publisher")
                .init(),
            acknowledged: meter
                .u64_counter("streamclaim.entries.acknowledged")
                .with_description("entries newly acknowledged, by worker")
                .init(),
            claimed: meter
                .u64_counter("streamclaim.entries.claimed")
                .with_description("stale entries claimed by the reclaimer")
                .init(),
            retry_failures: meter
                .u64_counter("streamclaim.retry.failures")
                .with_description("failed attempts, by operation")
                .init(),
            recovery_ms: meter
                .f64_histogram("streamclaim.retry.recovery")
                .with_description("milliseconds from first failed attempt to success")
                .init(),
        }
    }

    pub fn entry_appended(&self) {
        self.appended.add(1, &[]);
    }

    pub fn entry_acknowledged(&self, worker: &'static str) {
        self.acknowledged.add(1, &[KeyValue::new("worker", worker)]);
    }

    pub fn entries_claimed(&self, count: u64) {
        self.claimed.add(count, &[]);
    }

    pub fn retry_failed(&self, operation: &'static str) {
        self.retry_failures
            .add(1, &[KeyValue::new("operation", operation)]);
    }

    pub fn retry_recovered(&self, operation: &'static str, latency: Duration) {
        self.recovery_ms.record(
            latency.as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", operation)],
        );
    }
}
