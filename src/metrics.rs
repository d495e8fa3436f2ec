//! Prometheus instrumentation for both engine passes.

use prometheus::{IntCounterVec, Opts, Registry};

#[derive(Clone)]
pub struct EngineMetrics {
    /// Queue pass outcomes, labeled by chain and outcome kind.
    queue_items_processed: IntCounterVec,
    /// Broadcasts, labeled by chain and kind (`real` / `void` / `payment`).
    transactions_broadcasted: IntCounterVec,
    /// Fee-bump re-broadcasts, labeled by chain.
    fee_escalations: IntCounterVec,
    /// Payment-account top-ups, labeled by chain.
    payment_top_ups: IntCounterVec,
    /// Pending re-check outcomes, labeled by chain and result.
    pending_checked: IntCounterVec,
    /// Per-item errors survived by a pass, labeled by error kind and action.
    item_errors: IntCounterVec,
}

impl EngineMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let queue_items_processed = IntCounterVec::new(
            Opts::new(
                "timebolt_queue_items_processed",
                "Scheduled queue entries handled per pass, by outcome",
            ),
            &["chain", "outcome"],
        )?;
        let transactions_broadcasted = IntCounterVec::new(
            Opts::new(
                "timebolt_transactions_broadcasted",
                "Signed transactions submitted to a node",
            ),
            &["chain", "kind"],
        )?;
        let fee_escalations = IntCounterVec::new(
            Opts::new(
                "timebolt_fee_escalations",
                "Same-nonce re-broadcasts at a higher fee tier",
            ),
            &["chain"],
        )?;
        let payment_top_ups = IntCounterVec::new(
            Opts::new(
                "timebolt_payment_top_ups",
                "Fee shortfalls covered by the payment account",
            ),
            &["chain"],
        )?;
        let pending_checked = IntCounterVec::new(
            Opts::new(
                "timebolt_pending_checked",
                "Pending transaction re-checks, by result",
            ),
            &["chain", "result"],
        )?;
        let item_errors = IntCounterVec::new(
            Opts::new(
                "timebolt_item_errors",
                "Per-item errors that did not abort a pass",
            ),
            &["error", "action"],
        )?;

        for collector in [
            &queue_items_processed,
            &transactions_broadcasted,
            &fee_escalations,
            &payment_top_ups,
            &pending_checked,
            &item_errors,
        ] {
            registry.register(Box::new(collector.clone()))?;
        }

        Ok(Self {
            queue_items_processed,
            transactions_broadcasted,
            fee_escalations,
            payment_top_ups,
            pending_checked,
            item_errors,
        })
    }

    /// Unregistered instance for tests and tooling.
    pub fn dummy_instance() -> Self {
        Self::new(&Registry::new()).expect("metrics creation on a fresh registry cannot fail")
    }

    pub fn record_queue_item(&self, chain: &str, outcome: &str) {
        self.queue_items_processed
            .with_label_values(&[chain, outcome])
            .inc();
    }

    pub fn record_broadcast(&self, chain: &str, kind: &str) {
        self.transactions_broadcasted
            .with_label_values(&[chain, kind])
            .inc();
    }

    pub fn record_fee_escalation(&self, chain: &str) {
        self.fee_escalations.with_label_values(&[chain]).inc();
    }

    pub fn record_payment_top_up(&self, chain: &str) {
        self.payment_top_ups.with_label_values(&[chain]).inc();
    }

    pub fn record_pending_check(&self, chain: &str, result: &str) {
        self.pending_checked
            .with_label_values(&[chain, result])
            .inc();
    }

    pub fn record_item_error(&self, error: &str, action: &str) {
        self.item_errors.with_label_values(&[error, action]).inc();
    }
}
