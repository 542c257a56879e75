//! Process-wide counters exposed in Prometheus text format.
//!
//! The collector set is owned by the action engine and passed explicitly;
//! nothing registers into a global registry.

use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::scheduler::ActionKind;

pub struct Metrics {
    registry: Registry,
    pub cycles: IntCounter,
    pub actions: IntCounterVec,
    pub rollbacks: IntCounter,
    pub last_cycle_duration: Gauge,
    pub monitored: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let cycles = IntCounter::new("guerite_cycles_total", "Action cycles executed")
            .expect("valid metric definition");
        let actions = IntCounterVec::new(
            Opts::new("guerite_actions_total", "Actions by kind and outcome"),
            &["kind", "outcome"],
        )
        .expect("valid metric definition");
        let rollbacks = IntCounter::new("guerite_rollbacks_total", "Swaps rolled back")
            .expect("valid metric definition");
        let last_cycle_duration = Gauge::new(
            "guerite_last_cycle_duration_seconds",
            "Wall time of the most recent cycle",
        )
        .expect("valid metric definition");
        let monitored = IntGauge::new(
            "guerite_monitored_containers",
            "Containers currently monitored",
        )
        .expect("valid metric definition");

        for collector in [
            Box::new(cycles.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(actions.clone()),
            Box::new(rollbacks.clone()),
            Box::new(last_cycle_duration.clone()),
            Box::new(monitored.clone()),
        ] {
            registry
                .register(collector)
                .expect("collector registers once");
        }

        Self {
            registry,
            cycles,
            actions,
            rollbacks,
            last_cycle_duration,
            monitored,
        }
    }

    pub fn observe_action(&self, kind: ActionKind, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.actions
            .with_label_values(&[kind.as_ref(), outcome])
            .inc();
    }

    pub fn render(&self) -> String {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&families, &mut buffer) {
            log::warn!("Failed to encode metrics: {e}");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
