//! Variant cache: lazily loads, holds and serves one handle per variant.
//!
//! The cache is the only owner of loaded handles. Each variant has its own
//! record and its own lock, so requests for different variants never contend.
//!
//! Loads run on a detached task. The first `resolve` on a cold variant starts
//! the task and parks a shared future in the record; later callers await a
//! clone of that future. Dropping a waiter never cancels the load, and a
//! variant never has two loads in flight.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::record::{InFlightLoad, LoadOutcome, SharedModel, Slot, VariantRecord, VariantStatus};
use crate::cache::variant::{UnknownVariant, VariantId};
use crate::config::Config;
use crate::inference::llama_ffi::{ExecutionProfile, ModelLoader};
use crate::metrics::ServiceMetrics;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error(transparent)]
    UnknownVariant(#[from] UnknownVariant),

    /// The load attempt failed; `reason` is reported verbatim.
    #[error("{reason}")]
    Unavailable { variant: VariantId, reason: String },
}

/// The variant cache.
pub struct VariantCache {
    records: HashMap<VariantId, Arc<VariantRecord>>,
    loader: Arc<dyn ModelLoader>,
    profile: ExecutionProfile,
    metrics: Option<ServiceMetrics>,
}

impl VariantCache {
    /// Create a cache with one `Unloaded` record per known variant.
    pub fn new(config: &Config, loader: Arc<dyn ModelLoader>) -> Self {
        let records = VariantId::ALL
            .iter()
            .map(|&id| (id, VariantRecord::new(id, config.variant_path(id))))
            .collect();

        Self {
            records,
            loader,
            profile: ExecutionProfile::from(&config.runtime),
            metrics: None,
        }
    }

    /// Record load outcomes in the given metrics registry.
    pub fn with_metrics(mut self, metrics: ServiceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Execution profile handles are constructed with.
    pub fn profile(&self) -> &ExecutionProfile {
        &self.profile
    }

    /// Resolve a variant by name, loading it if needed.
    ///
    /// Unknown names fail before any state is touched.
    pub async fn resolve(&self, variant: &str) -> Result<SharedModel, CacheError> {
        let id: VariantId = variant.parse()?;
        self.resolve_id(id).await
    }

    /// Resolve a variant, loading it if needed.
    pub async fn resolve_id(&self, id: VariantId) -> Result<SharedModel, CacheError> {
        let record = self.record(id)?;

        let in_flight = {
            let mut slot = record.slot.lock().await;
            match &*slot {
                Slot::Ready(model) => return Ok(model.clone()),
                Slot::Loading(load) => {
                    debug!(variant = %id, "Waiting on in-flight load");
                    load.clone()
                }
                Slot::Unloaded | Slot::Failed(_) => {
                    let load = self.start_load(record.clone());
                    *slot = Slot::Loading(load.clone());
                    load
                }
            }
        };

        in_flight
            .await
            .map_err(|reason| CacheError::Unavailable { variant: id, reason })
    }

    /// Snapshot the status of one variant. Never waits on a load.
    pub async fn status(&self, variant: &str) -> Result<VariantStatus, CacheError> {
        let id: VariantId = variant.parse()?;
        Ok(self.record(id)?.snapshot().await)
    }

    /// Snapshot every variant, in quantization order.
    pub async fn statuses(&self) -> Vec<VariantStatus> {
        let mut out = Vec::with_capacity(VariantId::ALL.len());
        for id in VariantId::ALL {
            if let Some(record) = self.records.get(&id) {
                out.push(record.snapshot().await);
            }
        }
        out
    }

    fn record(&self, id: VariantId) -> Result<&Arc<VariantRecord>, CacheError> {
        self.records
            .get(&id)
            .ok_or_else(|| CacheError::UnknownVariant(UnknownVariant(id.to_string())))
    }

    /// Spawn the load task for `record`. Caller holds the record's slot lock.
    fn start_load(&self, record: Arc<VariantRecord>) -> InFlightLoad {
        let loader = self.loader.clone();
        let profile = self.profile.clone();
        let metrics = self.metrics.clone();
        let attempt = record.note_attempt();

        info!(
            variant = %record.id,
            path = %record.path.display(),
            attempt,
            "Loading variant"
        );

        let task = tokio::spawn(async move {
            let started = Instant::now();
            let path = record.path.clone();

            let outcome: LoadOutcome =
                tokio::task::spawn_blocking(move || load_blocking(loader.as_ref(), &path, &profile))
                    .await
                    .unwrap_or_else(|e| Err(format!("Error loading model: {e}")));

            let mut slot = record.slot.lock().await;
            match &outcome {
                Ok(model) => {
                    *slot = Slot::Ready(model.clone());
                    info!(
                        variant = %record.id,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Variant ready"
                    );
                }
                Err(reason) => {
                    *slot = Slot::Failed(reason.clone());
                    warn!(variant = %record.id, reason = %reason, "Variant load failed");
                }
            }
            drop(slot);

            if let Some(metrics) = metrics {
                metrics.record_load(record.id, outcome.is_ok());
            }
            outcome
        });

        async move {
            task.await
                .unwrap_or_else(|e| Err(format!("Error loading model: {e}")))
        }
        .boxed()
        .shared()
    }
}

fn load_blocking(loader: &dyn ModelLoader, path: &Path, profile: &ExecutionProfile) -> LoadOutcome {
    if !path.exists() {
        return Err(format!("Model file not found at path: {}", path.display()));
    }
    loader
        .load(path, profile)
        .map_err(|e| format!("Error loading model: {e}"))
}
