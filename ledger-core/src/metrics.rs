//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the ledger.
//!
//! # Metrics
//!
//! - `voucher_payments_total` - Completed payments
//! - `voucher_payments_replayed_total` - Idempotent replays answered with the original transaction
//! - `voucher_payment_failures_total{kind}` - Rejected or failed payments by error kind
//! - `voucher_payment_duration_seconds` - End-to-end payment latency
//! - `voucher_conflict_retries_total` - Persistence conflicts retried
//! - `voucher_subsidies_issued_total` - Subsidy programmes issued
//! - `voucher_vouchers_issued_total` - Vouchers created by issuance
//! - `voucher_audit_entries_total` - Audit entries appended
//! - `voucher_audit_write_duration_seconds` - Audit append plus fsync latency
//! - `voucher_outbox_delivered_total` - Notifications delivered to all sinks
//! - `voucher_outbox_pending` - Undelivered settlement notifications
//! - `voucher_ledger_halted` - 1 while commits are refused

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::Arc;

/// Metrics collector
///
/// Each collector owns its registry so several engines can live in one process.
#[derive(Clone)]
pub struct Metrics {
    /// Completed payments
    pub payments_total: IntCounter,

    /// Replayed payments
    pub payments_replayed: IntCounter,

    /// Failed payments by error kind
    pub payment_failures: IntCounterVec,

    /// Payment latency
    pub payment_duration: Histogram,

    /// Conflict retries
    pub conflict_retries: IntCounter,

    /// Subsidies issued
    pub subsidies_issued: IntCounter,

    /// Vouchers issued
    pub vouchers_issued: IntCounter,

    /// Audit entries appended
    pub audit_entries: IntCounter,

    /// Audit append latency
    pub audit_write_duration: Histogram,

    /// Delivered outbox entries
    pub outbox_delivered: IntCounter,

    /// Pending outbox entries
    pub outbox_pending: IntGauge,

    /// Halt flag
    pub halted: IntGauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("payments_total", &self.payments_total.get())
            .field("halted", &self.halted.get())
            .finish()
    }
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let payments_total =
            IntCounter::new("voucher_payments_total", "Total number of completed payments")?;
        registry.register(Box::new(payments_total.clone()))?;

        let payments_replayed = IntCounter::new(
            "voucher_payments_replayed_total",
            "Total number of idempotent payment replays",
        )?;
        registry.register(Box::new(payments_replayed.clone()))?;

        let payment_failures = IntCounterVec::new(
            Opts::new(
                "voucher_payment_failures_total",
                "Total number of failed payments by error kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(payment_failures.clone()))?;

        let payment_duration = Histogram::with_opts(
            HistogramOpts::new(
                "voucher_payment_duration_seconds",
                "Histogram of payment latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(payment_duration.clone()))?;

        let conflict_retries = IntCounter::new(
            "voucher_conflict_retries_total",
            "Total number of persistence conflicts retried",
        )?;
        registry.register(Box::new(conflict_retries.clone()))?;

        let subsidies_issued = IntCounter::new(
            "voucher_subsidies_issued_total",
            "Total number of subsidy programmes issued",
        )?;
        registry.register(Box::new(subsidies_issued.clone()))?;

        let vouchers_issued = IntCounter::new(
            "voucher_vouchers_issued_total",
            "Total number of vouchers created by issuance",
        )?;
        registry.register(Box::new(vouchers_issued.clone()))?;

        let audit_entries = IntCounter::new(
            "voucher_audit_entries_total",
            "Total number of audit entries appended",
        )?;
        registry.register(Box::new(audit_entries.clone()))?;

        let audit_write_duration = Histogram::with_opts(
            HistogramOpts::new(
                "voucher_audit_write_duration_seconds",
                "Histogram of durable audit append latencies",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.300, 1.0]),
        )?;
        registry.register(Box::new(audit_write_duration.clone()))?;

        let outbox_delivered = IntCounter::new(
            "voucher_outbox_delivered_total",
            "Total number of notifications delivered to all sinks",
        )?;
        registry.register(Box::new(outbox_delivered.clone()))?;

        let outbox_pending = IntGauge::new(
            "voucher_outbox_pending",
            "Undelivered settlement notifications",
        )?;
        registry.register(Box::new(outbox_pending.clone()))?;

        let halted = IntGauge::new("voucher_ledger_halted", "1 while the ledger refuses commits")?;
        registry.register(Box::new(halted.clone()))?;

        Ok(Self {
            payments_total,
            payments_replayed,
            payment_failures,
            payment_duration,
            conflict_retries,
            subsidies_issued,
            vouchers_issued,
            audit_entries,
            audit_write_duration,
            outbox_delivered,
            outbox_pending,
            halted,
            registry,
        })
    }

    /// Record a completed payment
    pub fn record_payment(&self, duration_seconds: f64) {
        self.payments_total.inc();
        self.payment_duration.observe(duration_seconds);
    }

    /// Record an idempotent replay
    pub fn record_payment_replay(&self) {
        self.payments_replayed.inc();
    }

    /// Record a failed payment
    pub fn record_payment_failure(&self, kind: &str) {
        self.payment_failures.with_label_values(&[kind]).inc();
    }

    /// Record a retried conflict
    pub fn record_conflict_retry(&self) {
        self.conflict_retries.inc();
    }

    /// Record one issuance and the vouchers it created
    pub fn record_issuance(&self, vouchers: u64) {
        self.subsidies_issued.inc();
        self.vouchers_issued.inc_by(vouchers);
    }

    /// Record an audit append and how long the durable write took
    pub fn record_audit_entry(&self, duration_seconds: f64) {
        self.audit_entries.inc();
        self.audit_write_duration.observe(duration_seconds);
    }

    /// Record a delivered notification
    pub fn record_delivery(&self) {
        self.outbox_delivered.inc();
    }

    /// Update pending outbox gauge
    pub fn update_outbox_pending(&self, pending: usize) {
        self.outbox_pending.set(pending as i64);
    }

    /// Update halt flag
    pub fn set_halted(&self, halted: bool) {
        self.halted.set(i64::from(halted));
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text format
    pub fn render(&self) -> String {
        use prometheus::Encoder;

        let mut buffer = Vec::new();
        let encoder = prometheus::TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        metrics.record_payment(0.002);
        metrics.record_payment_failure("insufficient_balance");
        assert_eq!(metrics.payments_total.get(), 1);
        assert_eq!(
            metrics
                .payment_failures
                .with_label_values(&["insufficient_balance"])
                .get(),
            1
        );
    }

    #[test]
    fn test_independent_registries() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.record_issuance(3);
        assert_eq!(a.vouchers_issued.get(), 3);
        assert_eq!(b.vouchers_issued.get(), 0);
    }

    #[test]
    fn test_render_contains_halt_gauge() {
        let metrics = Metrics::new().unwrap();
        metrics.set_halted(true);
        let text = metrics.render();
        assert!(text.contains("voucher_ledger_halted 1"));
    }
}
