use std::sync::Arc;

use prometheus::{Encoder, Registry, TextEncoder};

use beacon_duty_watch_core::prometheus_metrics::{Metrics, Registar};

pub struct AppState {
    pub registry: Registry,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(metrics: Arc<Metrics>) -> anyhow::Result<Self> {
        let registry = Registry::new();
        metrics.register_on(&registry)?;
        Ok(Self { registry, metrics })
    }

    pub fn report_metrics(&self) -> anyhow::Result<(Vec<u8>, String)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((buffer, encoder.format_type().to_owned()))
    }
}
