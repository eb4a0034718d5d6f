use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Counters
    pub payments_confirmed_total: IntCounterVec,
    pub webhooks_received_total: IntCounterVec,
    pub signature_failures_total: IntCounterVec,
    pub idempotent_replays_total: IntCounterVec,
    pub refunds_total: IntCounterVec,
    pub event_publish_fail_total: IntCounterVec,
    pub intents_expired_total: IntCounterVec,

    // Histograms
    pub confirm_duration_seconds: HistogramVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let payments_confirmed_total = IntCounterVec::new(
            Opts::new("payments_confirmed_total", "Confirmation outcomes"),
            &["gateway", "result"], // result: confirmed|declined
        )
        .expect("metric");

        let webhooks_received_total = IntCounterVec::new(
            Opts::new("payments_webhooks_received_total", "Webhook deliveries"),
            &["gateway", "outcome"], // processed|duplicate|rejected
        )
        .expect("metric");

        let signature_failures_total = IntCounterVec::new(
            Opts::new(
                "payments_signature_failures_total",
                "Webhook/proof signature verification failures",
            ),
            &["gateway"],
        )
        .expect("metric");

        let idempotent_replays_total = IntCounterVec::new(
            Opts::new(
                "payments_idempotent_replays_total",
                "Confirmations answered from the idempotency snapshot",
            ),
            &["gateway"],
        )
        .expect("metric");

        let refunds_total = IntCounterVec::new(
            Opts::new("payments_refunds_total", "Refund attempts"),
            &["result"], // completed|failed|rejected
        )
        .expect("metric");

        let event_publish_fail_total = IntCounterVec::new(
            Opts::new("payments_event_publish_fail_total", "Event publish failures"),
            &["event_type"],
        )
        .expect("metric");

        let intents_expired_total = IntCounterVec::new(
            Opts::new("payments_intents_expired_total", "Intents expired by the sweeper"),
            &["gateway"],
        )
        .expect("metric");

        let confirm_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "payments_confirm_duration_seconds",
                "End-to-end confirmation duration seconds",
            ),
            &["gateway"],
        )
        .expect("metric");

        registry
            .register(Box::new(payments_confirmed_total.clone()))
            .unwrap();
        registry
            .register(Box::new(webhooks_received_total.clone()))
            .unwrap();
        registry
            .register(Box::new(signature_failures_total.clone()))
            .unwrap();
        registry
            .register(Box::new(idempotent_replays_total.clone()))
            .unwrap();
        registry.register(Box::new(refunds_total.clone())).unwrap();
        registry
            .register(Box::new(event_publish_fail_total.clone()))
            .unwrap();
        registry
            .register(Box::new(intents_expired_total.clone()))
            .unwrap();
        registry
            .register(Box::new(confirm_duration_seconds.clone()))
            .unwrap();

        Self {
            registry,
            payments_confirmed_total,
            webhooks_received_total,
            signature_failures_total,
            idempotent_replays_total,
            refunds_total,
            event_publish_fail_total,
            intents_expired_total,
            confirm_duration_seconds,
        }
    }

    pub fn render(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&mf, &mut buf).map_err(|e| e.to_string())?;
        String::from_utf8(buf).map_err(|e| e.to_string())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
