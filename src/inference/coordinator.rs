//! Inference request coordinator.
//!
//! Validates a request, makes sure the requested variant is resident, drives
//! one chat completion on the loaned handle and reports timing.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::cache::registry::{CacheError, VariantCache};
use crate::cache::variant::VariantId;
use crate::config::SamplingConfig;
use crate::inference::llama_ffi::{ChatMessage, ChatModel, SamplingParams};
use crate::inference::prompt::{AnalysisPayload, SYSTEM_ROLE};
use crate::metrics::ServiceMetrics;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("{0}")]
    Validation(String),

    #[error("Unsupported model type: {0}")]
    UnknownVariant(String),

    #[error("{0}")]
    ModelUnavailable(String),

    #[error("Inference failed: {0}")]
    Inference(String),
}

impl CoordinatorError {
    /// HTTP-equivalent status code.
    pub fn status_code(&self) -> u16 {
        match self {
            CoordinatorError::Validation(_) | CoordinatorError::UnknownVariant(_) => 400,
            CoordinatorError::ModelUnavailable(_) => 503,
            CoordinatorError::Inference(_) => 500,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            CoordinatorError::Validation(_) => "validation",
            CoordinatorError::UnknownVariant(_) => "unknown_variant",
            CoordinatorError::ModelUnavailable(_) => "model_unavailable",
            CoordinatorError::Inference(_) => "inference",
        }
    }
}

impl From<CacheError> for CoordinatorError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::UnknownVariant(u) => CoordinatorError::UnknownVariant(u.0),
            CacheError::Unavailable { reason, .. } => CoordinatorError::ModelUnavailable(reason),
        }
    }
}

/// Result of one generation.
#[derive(Debug, Clone, Serialize)]
pub struct InferenceResult {
    pub response: String,
    /// Seconds, rounded to two decimals.
    pub processing_time: f64,
    /// Whitespace-delimited words in `response`; an approximation of tokens.
    pub tokens_generated: usize,
    pub tokens_per_second: f64,
    pub model_type: VariantId,
}

/// What `describe` reports about a resident variant.
#[derive(Debug, Clone, Serialize)]
pub struct ModelDescription {
    pub model_path: PathBuf,
    pub threads: u32,
    pub model_type: VariantId,
}

/// Approximate throughput of one generation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationStats {
    pub processing_time: f64,
    pub tokens_generated: usize,
    pub tokens_per_second: f64,
}

impl GenerationStats {
    /// Count whitespace-delimited words in `text` over `elapsed`.
    ///
    /// `tokens_per_second` is zero when the elapsed time rounds to zero.
    pub fn measure(text: &str, elapsed: Duration) -> Self {
        let tokens_generated = text.split_whitespace().count();
        let secs = elapsed.as_secs_f64();
        let processing_time = round2(secs);
        let tokens_per_second = if processing_time > 0.0 {
            round2(tokens_generated as f64 / secs)
        } else {
            0.0
        };
        Self {
            processing_time,
            tokens_generated,
            tokens_per_second,
        }
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Generations allowed to run at once unless configured otherwise.
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

/// The coordinator. Holds the injected cache by reference count.
pub struct InferenceCoordinator {
    cache: Arc<VariantCache>,
    sampling: SamplingConfig,
    metrics: Option<ServiceMetrics>,
    /// Bounds running completions, including ones whose caller went away.
    generation_permits: Arc<Semaphore>,
}

impl InferenceCoordinator {
    pub fn new(cache: Arc<VariantCache>, sampling: SamplingConfig) -> Self {
        Self {
            cache,
            sampling,
            metrics: None,
            generation_permits: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT)),
        }
    }

    /// Allow at most `max` completions to run at once.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.generation_permits = Arc::new(Semaphore::new(max.max(1)));
        self
    }

    pub fn with_metrics(mut self, metrics: ServiceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn cache(&self) -> &Arc<VariantCache> {
        &self.cache
    }

    /// Generate an analysis for `payload` on `variant`.
    pub async fn generate(
        &self,
        payload: serde_json::Value,
        variant: &str,
        max_tokens: usize,
    ) -> Result<InferenceResult, CoordinatorError> {
        let result = self.generate_inner(payload, variant, max_tokens).await;
        if let Some(metrics) = &self.metrics {
            let label = variant
                .parse::<VariantId>()
                .map(VariantId::as_str)
                .unwrap_or("unknown");
            match &result {
                Ok(r) => {
                    metrics.record_request(label, "ok");
                    metrics.observe_duration(r.model_type, r.processing_time);
                }
                Err(e) => metrics.record_request(label, e.kind()),
            }
        }
        result
    }

    async fn generate_inner(
        &self,
        payload: serde_json::Value,
        variant: &str,
        max_tokens: usize,
    ) -> Result<InferenceResult, CoordinatorError> {
        let payload = AnalysisPayload::from_value(payload)
            .map_err(|e| CoordinatorError::Validation(e.to_string()))?;
        self.check_max_tokens(max_tokens)?;
        let id: VariantId = variant
            .parse()
            .map_err(|_| CoordinatorError::UnknownVariant(variant.to_string()))?;

        let prompt = payload.render_prompt();
        debug!(variant = %id, company = ?payload.company_name(), prompt_len = prompt.len(), "Rendered prompt");

        let started = Instant::now();
        let model = self.cache.resolve_id(id).await?;

        let messages = vec![ChatMessage::system(SYSTEM_ROLE), ChatMessage::user(prompt)];
        let params = SamplingParams {
            max_tokens,
            temperature: self.sampling.temperature,
            top_p: self.sampling.top_p,
        };

        let permit = self
            .generation_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| CoordinatorError::Inference(e.to_string()))?;

        // Generation is committed once started: a dropped caller does not stop
        // it, and the permit is released only when the completion returns.
        let completion = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            model.create_chat_completion(&messages, &params)
        })
        .await
        .map_err(|e| CoordinatorError::Inference(e.to_string()))?
        .map_err(|e| CoordinatorError::Inference(e.to_string()))?;

        let stats = GenerationStats::measure(&completion.content, started.elapsed());

        info!(
            variant = %id,
            processing_time = stats.processing_time,
            tokens_generated = stats.tokens_generated,
            tokens_per_second = stats.tokens_per_second,
            "Generation complete"
        );

        Ok(InferenceResult {
            response: completion.content,
            processing_time: stats.processing_time,
            tokens_generated: stats.tokens_generated,
            tokens_per_second: stats.tokens_per_second,
            model_type: id,
        })
    }

    /// Load `variant` if needed and describe it.
    pub async fn describe(&self, variant: &str) -> Result<ModelDescription, CoordinatorError> {
        let id: VariantId = variant
            .parse()
            .map_err(|_| CoordinatorError::UnknownVariant(variant.to_string()))?;
        let model = self.cache.resolve_id(id).await?;
        Ok(ModelDescription {
            model_path: model.path().to_path_buf(),
            threads: model.n_threads(),
            model_type: id,
        })
    }

    fn check_max_tokens(&self, max_tokens: usize) -> Result<(), CoordinatorError> {
        if max_tokens == 0 {
            return Err(CoordinatorError::Validation(
                "max_tokens must be a positive integer".to_string(),
            ));
        }
        if max_tokens > self.sampling.max_tokens_limit {
            return Err(CoordinatorError::Validation(format!(
                "max_tokens must not exceed {}",
                self.sampling.max_tokens_limit
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measure_counts_words() {
        let stats = GenerationStats::measure("one two  three\nfour", Duration::from_secs(2));
        assert_eq!(stats.tokens_generated, 4);
        assert_eq!(stats.processing_time, 2.0);
        assert_eq!(stats.tokens_per_second, 2.0);
    }

    #[test]
    fn test_measure_rounds_to_two_decimals() {
        let stats = GenerationStats::measure("a b c", Duration::from_millis(1500));
        assert_eq!(stats.processing_time, 1.5);
        assert_eq!(stats.tokens_per_second, 2.0);

        let stats = GenerationStats::measure("a b", Duration::from_millis(3000));
        assert_eq!(stats.tokens_per_second, 0.67);
    }

    #[test]
    fn test_measure_zero_elapsed() {
        let stats = GenerationStats::measure("a b c", Duration::from_millis(4));
        assert_eq!(stats.processing_time, 0.0);
        assert_eq!(stats.tokens_per_second, 0.0);
        assert_eq!(stats.tokens_generated, 3);
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(CoordinatorError::Validation("x".into()).status_code(), 400);
        assert_eq!(CoordinatorError::UnknownVariant("x".into()).status_code(), 400);
        assert_eq!(CoordinatorError::ModelUnavailable("x".into()).status_code(), 503);
        assert_eq!(CoordinatorError::Inference("x".into()).status_code(), 500);
    }
}
