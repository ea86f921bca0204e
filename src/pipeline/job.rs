//! Single-flight wrapper around [`SetupPipeline`] for the HTTP surface.
//!
//! At most one run is active at a time. The report of the most recent run is
//! kept in memory so it can be polled.

use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{error, info};

use crate::metrics::ServiceMetrics;
use crate::pipeline::cancel::CancellationToken;
use crate::pipeline::orchestrator::{PipelineRun, SetupPipeline};

pub struct SetupJob {
    pipeline: Arc<SetupPipeline>,
    gate: Arc<Mutex<()>>,
    last: Arc<RwLock<Option<PipelineRun>>>,
    current: Arc<RwLock<Option<CancellationToken>>>,
    metrics: Option<ServiceMetrics>,
}

impl SetupJob {
    pub fn new(pipeline: SetupPipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            gate: Arc::new(Mutex::new(())),
            last: Arc::new(RwLock::new(None)),
            current: Arc::new(RwLock::new(None)),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ServiceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Start a run in the background.
    ///
    /// Returns `false` without starting anything when a run is already active.
    pub async fn try_start(&self) -> bool {
        let Ok(guard) = self.gate.clone().try_lock_owned() else {
            return false;
        };

        let token = CancellationToken::new();
        *self.current.write().await = Some(token.clone());

        let pipeline = self.pipeline.clone();
        let last = self.last.clone();
        let current = self.current.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            let run = pipeline.run_setup(&token).await;
            let ok = run.succeeded();
            if let Some(metrics) = &metrics {
                metrics.record_pipeline_run(ok);
            }
            match &run.error {
                Some(e) => error!(run_id = %run.run_id, "{e}"),
                None if run.cancelled => info!(run_id = %run.run_id, "Setup run cancelled"),
                None => {}
            }
            *last.write().await = Some(run);
            *current.write().await = None;
            drop(guard);
        });
        true
    }

    /// Run in the foreground and return the report.
    pub async fn run_now(&self) -> Option<PipelineRun> {
        let _guard = self.gate.try_lock().ok()?;
        let token = CancellationToken::new();
        *self.current.write().await = Some(token.clone());
        let run = self.pipeline.run_setup(&token).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_pipeline_run(run.succeeded());
        }
        *self.last.write().await = Some(run.clone());
        *self.current.write().await = None;
        Some(run)
    }

    pub fn is_running(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    pub async fn last_run(&self) -> Option<PipelineRun> {
        self.last.read().await.clone()
    }

    /// Request cancellation of the active run. Takes effect at the next
    /// stage boundary. Returns `false` when nothing is running.
    pub async fn cancel(&self) -> bool {
        match self.current.read().await.as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}
