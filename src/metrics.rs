//! Prometheus metrics for inference requests, variant loads and setup runs.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

use crate::cache::variant::VariantId;

/// Service-wide metric handles. Cheap to clone.
#[derive(Clone)]
pub struct ServiceMetrics {
    registry: Registry,
    inference_requests: IntCounterVec,
    inference_duration: HistogramVec,
    variant_loads: IntCounterVec,
    pipeline_runs: IntCounterVec,
}

impl ServiceMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let inference_requests = IntCounterVec::new(
            Opts::new("inference_requests_total", "Inference requests by outcome"),
            &["model_type", "outcome"],
        )?;
        let inference_duration = HistogramVec::new(
            HistogramOpts::new(
                "inference_duration_seconds",
                "Wall-clock time from variant resolution to completion",
            )
            .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
            &["model_type"],
        )?;
        let variant_loads = IntCounterVec::new(
            Opts::new("variant_loads_total", "Variant load attempts by outcome"),
            &["model_type", "outcome"],
        )?;
        let pipeline_runs = IntCounterVec::new(
            Opts::new("pipeline_runs_total", "Setup pipeline runs by outcome"),
            &["outcome"],
        )?;

        registry.register(Box::new(inference_requests.clone()))?;
        registry.register(Box::new(inference_duration.clone()))?;
        registry.register(Box::new(variant_loads.clone()))?;
        registry.register(Box::new(pipeline_runs.clone()))?;

        Ok(Self {
            registry,
            inference_requests,
            inference_duration,
            variant_loads,
            pipeline_runs,
        })
    }

    /// Count one inference request; `outcome` is "ok" or an error kind.
    pub fn record_request(&self, model_type: &str, outcome: &str) {
        self.inference_requests
            .with_label_values(&[model_type, outcome])
            .inc();
    }

    pub fn observe_duration(&self, variant: VariantId, seconds: f64) {
        self.inference_duration
            .with_label_values(&[variant.as_str()])
            .observe(seconds);
    }

    pub fn record_load(&self, variant: VariantId, ok: bool) {
        self.variant_loads
            .with_label_values(&[variant.as_str(), outcome(ok)])
            .inc();
    }

    pub fn record_pipeline_run(&self, ok: bool) {
        self.pipeline_runs.with_label_values(&[outcome(ok)]).inc();
    }

    /// Render all metrics in the text exposition format.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::warn!("Failed to encode metrics: {e}");
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}

fn outcome(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "error"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_counters() {
        let metrics = ServiceMetrics::new().unwrap();
        metrics.record_request("4bit", "ok");
        metrics.record_load(VariantId::EightBit, false);
        metrics.record_pipeline_run(true);

        let text = metrics.render();
        assert!(text.contains("inference_requests_total{model_type=\"4bit\",outcome=\"ok\"} 1"));
        assert!(text.contains("variant_loads_total{model_type=\"8bit\",outcome=\"error\"} 1"));
        assert!(text.contains("pipeline_runs_total{outcome=\"ok\"} 1"));
    }
}
