//! Prometheus metrics for the Quill node.
//!
//! Covers the block-processing pipeline and consensus activity. The
//! [`NodeMetrics`] struct owns a dedicated [`Registry`] that callers
//! can encode into the Prometheus text exposition format.

use prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Histogram,
    HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

/// Central collection of all node-level Prometheus metrics.
pub struct NodeMetrics {
    /// The Prometheus registry that owns every metric below.
    pub registry: Registry,

    // ── Counters ────────────────────────────────────────────────────────
    /// Blocks that went through the processor, labelled by result.
    pub blocks_processed: IntCounterVec,
    /// Blocks confirmed (cemented) by an election reaching quorum.
    pub blocks_confirmed: IntCounter,
    /// Votes received, live and cached combined.
    pub votes_received: IntCounter,
    /// Blocks dropped at ingress because the processor queue was full.
    pub processor_overfill: IntCounter,
    /// Elections started by the hinted scheduler.
    pub hinted_elections: IntCounter,

    // ── Gauges ──────────────────────────────────────────────────────────
    /// Blocks currently queued in the block processor.
    pub processor_queue: IntGauge,
    /// Currently running elections.
    pub election_count: IntGauge,
    /// Entries currently held in the vote cache.
    pub vote_cache_size: IntGauge,
    /// Blocks parked in the unchecked map awaiting dependencies.
    pub unchecked_count: IntGauge,

    // ── Histograms ──────────────────────────────────────────────────────
    /// Time from election start to confirmation, in milliseconds.
    pub confirmation_latency_ms: Histogram,
}

impl NodeMetrics {
    /// Create a fresh set of metrics, all registered under a new
    /// [`Registry`].
    pub fn new() -> Self {
        let registry = Registry::new();

        let blocks_processed = register_int_counter_vec_with_registry!(
            Opts::new(
                "quill_blocks_processed_total",
                "Total blocks processed, by commit result"
            ),
            &["result"],
            registry
        )
        .expect("failed to register blocks_processed counter");

        let blocks_confirmed = register_int_counter_with_registry!(
            Opts::new(
                "quill_blocks_confirmed_total",
                "Total blocks confirmed via consensus"
            ),
            registry
        )
        .expect("failed to register blocks_confirmed counter");

        let votes_received = register_int_counter_with_registry!(
            Opts::new("quill_votes_received_total", "Total consensus votes received"),
            registry
        )
        .expect("failed to register votes_received counter");

        let processor_overfill = register_int_counter_with_registry!(
            Opts::new(
                "quill_processor_overfill_total",
                "Blocks dropped because the processor queue was full"
            ),
            registry
        )
        .expect("failed to register processor_overfill counter");

        let hinted_elections = register_int_counter_with_registry!(
            Opts::new(
                "quill_hinted_elections_total",
                "Elections started from vote-cache hints"
            ),
            registry
        )
        .expect("failed to register hinted_elections counter");

        let processor_queue = register_int_gauge_with_registry!(
            Opts::new(
                "quill_processor_queue",
                "Blocks currently queued in the block processor"
            ),
            registry
        )
        .expect("failed to register processor_queue gauge");

        let election_count = register_int_gauge_with_registry!(
            Opts::new("quill_election_count", "Currently running elections"),
            registry
        )
        .expect("failed to register election_count gauge");

        let vote_cache_size = register_int_gauge_with_registry!(
            Opts::new("quill_vote_cache_size", "Entries held in the vote cache"),
            registry
        )
        .expect("failed to register vote_cache_size gauge");

        let unchecked_count = register_int_gauge_with_registry!(
            Opts::new(
                "quill_unchecked_count",
                "Blocks awaiting dependencies in the unchecked map"
            ),
            registry
        )
        .expect("failed to register unchecked_count gauge");

        // Exponential buckets covering 1 ms → ~16 s.
        let confirmation_latency_ms = register_histogram_with_registry!(
            HistogramOpts::new(
                "quill_confirmation_latency_ms",
                "Election confirmation latency in milliseconds"
            )
            .buckets(prometheus::exponential_buckets(1.0, 2.0, 15).unwrap()),
            registry
        )
        .expect("failed to register confirmation_latency_ms histogram");

        Self {
            registry,
            blocks_processed,
            blocks_confirmed,
            votes_received,
            processor_overfill,
            hinted_elections,
            processor_queue,
            election_count,
            vote_cache_size,
            unchecked_count,
            confirmation_latency_ms,
        }
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_and_gather() {
        let metrics = NodeMetrics::new();
        metrics.blocks_processed.with_label_values(&["progress"]).inc();
        metrics.blocks_confirmed.inc();
        metrics.election_count.set(3);

        let families = metrics.registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "quill_blocks_processed_total"));
        assert!(families.iter().any(|f| f.get_name() == "quill_election_count"));
    }

    #[test]
    fn registries_are_isolated() {
        let a = NodeMetrics::new();
        let b = NodeMetrics::new();
        a.blocks_confirmed.inc();
        assert_eq!(b.blocks_confirmed.get(), 0);
    }
}
