//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `shard_transfers_total{outcome}` - Transfers by outcome (`committed`, `rejected`, `failed`)
//! - `shard_cross_shard_total{decision}` - Cross-shard transfers by decision (`commit`, `abort`)
//! - `shard_recovered_total` - In-flight transfers resolved by recovery
//! - `shard_applied_slots_total` - Decided slots applied to the ledger
//! - `shard_transfer_duration_seconds` - Histogram of transfer latencies

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct ShardMetrics {
    /// Transfers by outcome
    pub transfers: IntCounterVec,

    /// Cross-shard decisions
    pub cross_shard: IntCounterVec,

    /// Recovered in-flight transfers
    pub recovered: IntCounter,

    /// Applied slots
    pub applied_slots: IntCounter,

    /// Transfer duration histogram
    pub transfer_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for ShardMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardMetrics")
            .field("recovered", &self.recovered.get())
            .field("applied_slots", &self.applied_slots.get())
            .finish()
    }
}

impl ShardMetrics {
    /// Create a collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let transfers = IntCounterVec::new(
            Opts::new("shard_transfers_total", "Transfers by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(transfers.clone()))?;

        let cross_shard = IntCounterVec::new(
            Opts::new("shard_cross_shard_total", "Cross-shard transfers by decision"),
            &["decision"],
        )?;
        registry.register(Box::new(cross_shard.clone()))?;

        let recovered = IntCounter::new(
            "shard_recovered_total",
            "In-flight transfers resolved by recovery",
        )?;
        registry.register(Box::new(recovered.clone()))?;

        let applied_slots = IntCounter::new(
            "shard_applied_slots_total",
            "Decided slots applied to the ledger",
        )?;
        registry.register(Box::new(applied_slots.clone()))?;

        let transfer_duration = Histogram::with_opts(
            HistogramOpts::new("shard_transfer_duration_seconds", "Histogram of transfer latencies")
                .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(transfer_duration.clone()))?;

        Ok(Self {
            transfers,
            cross_shard,
            recovered,
            applied_slots,
            transfer_duration,
            registry,
        })
    }

    /// Record a transfer result
    pub fn record_transfer(&self, committed: bool) {
        let outcome = if committed { "committed" } else { "rejected" };
        self.transfers.with_label_values(&[outcome]).inc();
    }

    /// Record a transfer that ended in an error
    pub fn record_failure(&self) {
        self.transfers.with_label_values(&["failed"]).inc();
    }

    /// Record a cross-shard decision
    pub fn record_cross_shard(&self, committed: bool) {
        let decision = if committed { "commit" } else { "abort" };
        self.cross_shard.with_label_values(&[decision]).inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of every metric
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
