use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub dispatch_attempts_total: IntCounterVec,
    pub dispatch_latency_seconds: HistogramVec,
    pub claim_conflicts_total: IntCounter,
    pub state_transitions_total: IntCounterVec,
    pub sla_breaches_total: IntCounterVec,
    pub subscriber_failures_total: IntCounterVec,
    pub drivers_by_state: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let dispatch_attempts_total = IntCounterVec::new(
            Opts::new("dispatch_attempts_total", "Dispatch calls by outcome"),
            &["outcome"],
        )
        .expect("valid dispatch_attempts_total metric");

        let dispatch_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "dispatch_latency_seconds",
                "Latency of order dispatch in seconds",
            ),
            &["outcome"],
        )
        .expect("valid dispatch_latency_seconds metric");

        let claim_conflicts_total = IntCounter::new(
            "claim_conflicts_total",
            "Candidates lost to a concurrent claim",
        )
        .expect("valid claim_conflicts_total metric");

        let state_transitions_total = IntCounterVec::new(
            Opts::new("state_transitions_total", "Committed driver state transitions"),
            &["from", "to"],
        )
        .expect("valid state_transitions_total metric");

        let sla_breaches_total = IntCounterVec::new(
            Opts::new("sla_breaches_total", "SLA violations by severity"),
            &["severity"],
        )
        .expect("valid sla_breaches_total metric");

        let subscriber_failures_total = IntCounterVec::new(
            Opts::new("subscriber_failures_total", "Event handlers that failed"),
            &["event"],
        )
        .expect("valid subscriber_failures_total metric");

        let drivers_by_state = IntGaugeVec::new(
            Opts::new("drivers_by_state", "Drivers per operational state"),
            &["state"],
        )
        .expect("valid drivers_by_state metric");

        registry
            .register(Box::new(dispatch_attempts_total.clone()))
            .expect("register dispatch_attempts_total");
        registry
            .register(Box::new(dispatch_latency_seconds.clone()))
            .expect("register dispatch_latency_seconds");
        registry
            .register(Box::new(claim_conflicts_total.clone()))
            .expect("register claim_conflicts_total");
        registry
            .register(Box::new(state_transitions_total.clone()))
            .expect("register state_transitions_total");
        registry
            .register(Box::new(sla_breaches_total.clone()))
            .expect("register sla_breaches_total");
        registry
            .register(Box::new(subscriber_failures_total.clone()))
            .expect("register subscriber_failures_total");
        registry
            .register(Box::new(drivers_by_state.clone()))
            .expect("register drivers_by_state");

        Self {
            registry,
            dispatch_attempts_total,
            dispatch_latency_seconds,
            claim_conflicts_total,
            state_transitions_total,
            sla_breaches_total,
            subscriber_failures_total,
            drivers_by_state,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
