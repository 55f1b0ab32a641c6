//! Node metrics, kept in a registry owned by the node rather than the
//! process-wide default one.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use ln_light::RetrievalOutcome;

pub struct NodeMetrics {
    registry: Registry,
    pub odr_requests: IntCounter,
    pub odr_timeouts: IntCounter,
    pub odr_cancellations: IntCounter,
    pub bloom_retrievals: IntGauge,
    pub mined_blocks: IntCounter,
    pub mining_sessions: IntCounter,
    pub pool_rejections: IntCounterVec,
}

impl NodeMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("ln".into()), None)?;
        let odr_requests = IntCounter::new("odr_requests_total", "On-demand retrievals issued")?;
        let odr_timeouts = IntCounter::new("odr_timeouts_total", "On-demand retrievals that timed out")?;
        let odr_cancellations =
            IntCounter::new("odr_cancellations_total", "On-demand retrievals cancelled by the caller")?;
        let bloom_retrievals =
            IntGauge::new("bloom_retrievals_served", "Filter sessions served by the bloom workers")?;
        let mined_blocks = IntCounter::new("mined_blocks_total", "Locally sealed blocks")?;
        let mining_sessions = IntCounter::new("mining_sessions_total", "Times mining was started")?;
        let pool_rejections = IntCounterVec::new(
            Opts::new("txpool_rejections_total", "Transactions refused by the pool"),
            &["reason"],
        )?;

        registry.register(Box::new(odr_requests.clone()))?;
        registry.register(Box::new(odr_timeouts.clone()))?;
        registry.register(Box::new(odr_cancellations.clone()))?;
        registry.register(Box::new(bloom_retrievals.clone()))?;
        registry.register(Box::new(mined_blocks.clone()))?;
        registry.register(Box::new(mining_sessions.clone()))?;
        registry.register(Box::new(pool_rejections.clone()))?;

        Ok(Self {
            registry,
            odr_requests,
            odr_timeouts,
            odr_cancellations,
            bloom_retrievals,
            mined_blocks,
            mining_sessions,
            pool_rejections,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record the outcome of one on-demand retrieval.
    pub fn observe_retrieval(&self, outcome: RetrievalOutcome) {
        self.odr_requests.inc();
        match outcome {
            RetrievalOutcome::TimedOut => self.odr_timeouts.inc(),
            RetrievalOutcome::Cancelled => self.odr_cancellations.inc(),
            RetrievalOutcome::Served | RetrievalOutcome::Failed => {}
        }
    }

    pub fn reject_tx(&self, reason: &str) {
        self.pool_rejections.with_label_values(&[reason]).inc();
    }

    /// Text exposition of every metric.
    pub fn render(&self) -> String {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retrieval_outcomes_are_counted() {
        let metrics = NodeMetrics::new().unwrap();
        metrics.observe_retrieval(RetrievalOutcome::Served);
        metrics.observe_retrieval(RetrievalOutcome::TimedOut);
        metrics.observe_retrieval(RetrievalOutcome::Cancelled);
        assert_eq!(metrics.odr_requests.get(), 3);
        assert_eq!(metrics.odr_timeouts.get(), 1);
        assert_eq!(metrics.odr_cancellations.get(), 1);
    }

    #[test]
    fn registries_are_independent() {
        let a = NodeMetrics::new().unwrap();
        let b = NodeMetrics::new().unwrap();
        a.mined_blocks.inc();
        assert_eq!(b.mined_blocks.get(), 0);
        a.reject_tx("underpriced");
        assert!(a.render().contains("ln_txpool_rejections_total"));
    }
}
