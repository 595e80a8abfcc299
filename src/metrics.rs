use std::sync::OnceLock;

use opentelemetry::{global, metrics::Counter};
use prometheus::{IntCounterVec, IntGauge, Opts};

pub struct Metrics {
    pub reconciles: Counter<u64>,
    pub reconcile_failures: Counter<u64>,
    pub apply_failures: Counter<u64>,
    pub plan_actions: IntCounterVec,
    pub cache_objects: IntGauge,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn init(registry: &prometheus::Registry) -> Result<(), anyhow::Error> {
    let meter = global::meter("circlerr");

    let plan_actions = IntCounterVec::new(
        Opts::new(
            "circlerr_plan_actions_total",
            "Plan actions computed, by action",
        ),
        &["action"],
    )?;
    registry.register(Box::new(plan_actions.clone()))?;

    let cache_objects = IntGauge::new(
        "circlerr_cache_objects",
        "Objects currently mirrored in the cluster-state cache",
    )?;
    registry.register(Box::new(cache_objects.clone()))?;

    let metrics = Metrics {
        reconciles: meter.u64_counter("circlerr_reconciles_total").init(),
        reconcile_failures: meter.u64_counter("circlerr_reconcile_failures_total").init(),
        apply_failures: meter.u64_counter("circlerr_apply_failures_total").init(),
        plan_actions,
        cache_objects,
    };

    METRICS
        .set(metrics)
        .map_err(|_| anyhow::anyhow!("Metrics already initialized"))?;

    Ok(())
}

#[allow(clippy::expect_used)]
pub fn get() -> &'static Metrics {
    METRICS
        .get()
        .expect("Metrics not initialized - call metrics::init() first")
}
