//! Setup pipeline: produces every variant's artifact from the source model.
//!
//! Stages run strictly in order and the run stops at the first failure:
//!
//! 1. Prepare           create the variant directory tree
//! 2. Fetch             download the source snapshot
//! 3. Build toolchain   `cmake -B build`, then `cmake --build build --config Release`
//! 4. Convert           snapshot → full-precision GGUF
//! 5. Quantize          one invocation per target, 4bit then 8bit
//!
//! Nothing is rolled back on failure and nothing is resumed: a new run starts
//! from stage 1. Prepare and Fetch are idempotent; the tool stages re-run.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::{Serialize, Serializer};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::variant::VariantId;
use crate::config::Config;
use crate::pipeline::cancel::CancellationToken;
use crate::pipeline::fetcher::ArtifactFetcher;
use crate::pipeline::runner::{CommandRunner, CommandSpec};

/// One ordered step of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Prepare,
    Fetch,
    BuildToolchain,
    Convert,
    Quantize(VariantId),
}

impl Stage {
    /// Position in the fixed stage order, starting at 1.
    pub fn number(self) -> usize {
        match self {
            Stage::Prepare => 1,
            Stage::Fetch => 2,
            Stage::BuildToolchain => 3,
            Stage::Convert => 4,
            Stage::Quantize(_) => 5,
        }
    }

    /// Every stage of a run over `targets`, in execution order.
    pub fn plan(targets: &[VariantId]) -> Vec<Stage> {
        let mut stages = vec![
            Stage::Prepare,
            Stage::Fetch,
            Stage::BuildToolchain,
            Stage::Convert,
        ];
        stages.extend(targets.iter().map(|&t| Stage::Quantize(t)));
        stages
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Prepare => f.write_str("prepare"),
            Stage::Fetch => f.write_str("fetch"),
            Stage::BuildToolchain => f.write_str("build_toolchain"),
            Stage::Convert => f.write_str("convert"),
            Stage::Quantize(v) => write!(f, "quantize:{v}"),
        }
    }
}

impl Serialize for Stage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Outcome of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum StageOutcome {
    Pending,
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub outcome: StageOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// A failed stage and the diagnostic text captured from it.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("setup stage `{stage}` failed: {message}")]
pub struct PipelineStageError {
    pub stage: Stage,
    pub message: String,
}

/// Report of one setup invocation. Not persisted.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub stages: Vec<StageRecord>,
    pub model_dir: PathBuf,
    pub snapshot_dir: PathBuf,
    pub toolchain_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intermediate: Option<PathBuf>,
    pub artifacts: BTreeMap<VariantId, PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PipelineStageError>,
    pub cancelled: bool,
}

impl PipelineRun {
    fn planned(config: &Config, targets: &[VariantId]) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            stages: Stage::plan(targets)
                .into_iter()
                .map(|stage| StageRecord {
                    stage,
                    outcome: StageOutcome::Pending,
                    duration_ms: None,
                })
                .collect(),
            model_dir: config.model.model_dir.clone(),
            snapshot_dir: config.pipeline.snapshot_dir.clone(),
            toolchain_dir: config.pipeline.toolchain_dir.clone(),
            intermediate: None,
            artifacts: BTreeMap::new(),
            error: None,
            cancelled: false,
        }
    }

    /// True when every stage succeeded.
    pub fn succeeded(&self) -> bool {
        self.stages
            .iter()
            .all(|s| s.outcome == StageOutcome::Succeeded)
    }

    pub fn outcome(&self, stage: Stage) -> Option<&StageOutcome> {
        self.stages
            .iter()
            .find(|s| s.stage == stage)
            .map(|s| &s.outcome)
    }

    pub fn failed_stage(&self) -> Option<Stage> {
        self.error.as_ref().map(|e| e.stage)
    }

    /// `Ok(self)` on full success, the stage error otherwise.
    ///
    /// A run with stages that never executed is an error naming the first
    /// of them, whether it was cancelled or never started.
    pub fn into_result(self) -> Result<Self, PipelineStageError> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        match self
            .stages
            .iter()
            .find(|s| s.outcome == StageOutcome::Pending)
        {
            Some(pending) => Err(PipelineStageError {
                stage: pending.stage,
                message: if self.cancelled {
                    "setup cancelled".to_string()
                } else {
                    "stage never ran".to_string()
                },
            }),
            None => Ok(self),
        }
    }
}

/// Drives the stage sequence. Owns no long-lived state.
pub struct SetupPipeline {
    config: Arc<Config>,
    runner: Arc<dyn CommandRunner>,
    fetcher: Arc<dyn ArtifactFetcher>,
    targets: Vec<VariantId>,
}

impl SetupPipeline {
    pub fn new(
        config: Arc<Config>,
        runner: Arc<dyn CommandRunner>,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> Self {
        Self {
            config,
            runner,
            fetcher,
            targets: VariantId::ALL.to_vec(),
        }
    }

    /// Restrict quantization to `targets`, kept in the given order.
    pub fn with_targets(mut self, targets: Vec<VariantId>) -> Self {
        self.targets = targets;
        self
    }

    /// Run every stage in order, stopping at the first failure.
    ///
    /// `cancel` is only observed between stages.
    pub async fn run_setup(&self, cancel: &CancellationToken) -> PipelineRun {
        let mut run = PipelineRun::planned(&self.config, &self.targets);
        info!(run_id = %run.run_id, stages = run.stages.len(), "Setup started");

        for idx in 0..run.stages.len() {
            if cancel.check().is_err() {
                warn!(run_id = %run.run_id, next = %run.stages[idx].stage, "Setup cancelled");
                run.cancelled = true;
                break;
            }

            let stage = run.stages[idx].stage;
            info!(run_id = %run.run_id, stage = %stage, step = stage.number(), "Stage started");
            let started = Instant::now();

            let result = self.execute(stage, &mut run).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            run.stages[idx].duration_ms = Some(elapsed_ms);

            match result {
                Ok(()) => {
                    run.stages[idx].outcome = StageOutcome::Succeeded;
                    info!(run_id = %run.run_id, stage = %stage, elapsed_ms, "Stage succeeded");
                }
                Err(message) => {
                    warn!(run_id = %run.run_id, stage = %stage, error = %message, "Stage failed");
                    run.stages[idx].outcome = StageOutcome::Failed(message.clone());
                    run.error = Some(PipelineStageError { stage, message });
                    break;
                }
            }
        }

        if run.succeeded() {
            info!(run_id = %run.run_id, artifacts = run.artifacts.len(), "Model setup completed successfully");
        }
        run
    }

    async fn execute(&self, stage: Stage, run: &mut PipelineRun) -> Result<(), String> {
        match stage {
            Stage::Prepare => self.prepare().await,
            Stage::Fetch => self.fetch().await,
            Stage::BuildToolchain => self.build_toolchain().await,
            Stage::Convert => {
                let out = self.convert().await?;
                run.intermediate = Some(out);
                Ok(())
            }
            Stage::Quantize(target) => {
                let out = self.quantize(target).await?;
                run.artifacts.insert(target, out);
                Ok(())
            }
        }
    }

    async fn prepare(&self) -> Result<(), String> {
        let mut dirs = vec![self.config.model.model_dir.clone()];
        dirs.extend(self.targets.iter().map(|&t| self.config.variant_dir(t)));
        for dir in dirs {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| format!("creating {}: {e}", dir.display()))?;
        }
        Ok(())
    }

    async fn fetch(&self) -> Result<(), String> {
        let model = &self.config.model;
        self.fetcher
            .fetch(
                &model.source_repo,
                &model.revision,
                &self.config.pipeline.snapshot_dir,
            )
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    async fn build_toolchain(&self) -> Result<(), String> {
        let dir = &self.config.pipeline.toolchain_dir;
        self.invoke(CommandSpec::new("cmake").arg("-B").arg("build").current_dir(dir))
            .await?;
        self.invoke(
            CommandSpec::new("cmake")
                .arg("--build")
                .arg("build")
                .arg("--config")
                .arg("Release")
                .current_dir(dir),
        )
        .await
    }

    async fn convert(&self) -> Result<PathBuf, String> {
        let p = &self.config.pipeline;
        let out = absolute(&self.config.intermediate_path());
        self.invoke(
            CommandSpec::new(p.python.clone())
                .arg(p.convert_script.clone())
                .path_arg(&absolute(&p.snapshot_dir))
                .arg("--outtype")
                .arg(p.outtype.clone())
                .arg("--outfile")
                .path_arg(&out)
                .current_dir(&p.toolchain_dir),
        )
        .await?;
        Ok(out)
    }

    async fn quantize(&self, target: VariantId) -> Result<PathBuf, String> {
        let p = &self.config.pipeline;
        let binary = absolute(&p.toolchain_dir.join(&p.quantize_binary));
        let input = absolute(&self.config.intermediate_path());
        let output = absolute(&self.config.variant_path(target));

        self.invoke(
            CommandSpec::new(binary.to_string_lossy().into_owned())
                .path_arg(&input)
                .path_arg(&output)
                .arg(target.quant_tag())
                .current_dir(&p.toolchain_dir),
        )
        .await?;
        Ok(output)
    }

    /// Run one tool; a non-zero exit becomes its captured diagnostic.
    async fn invoke(&self, cmd: CommandSpec) -> Result<(), String> {
        let output = self
            .runner
            .run(&cmd)
            .await
            .map_err(|e| format!("failed to run `{cmd}`: {e}"))?;
        if output.success() {
            Ok(())
        } else {
            Err(output.diagnostic())
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_order() {
        let plan = Stage::plan(&VariantId::ALL);
        assert_eq!(
            plan,
            vec![
                Stage::Prepare,
                Stage::Fetch,
                Stage::BuildToolchain,
                Stage::Convert,
                Stage::Quantize(VariantId::FourBit),
                Stage::Quantize(VariantId::EightBit),
            ]
        );
        assert_eq!(Stage::BuildToolchain.number(), 3);
        assert_eq!(Stage::Quantize(VariantId::EightBit).to_string(), "quantize:8bit");
    }

    #[test]
    fn test_stage_error_serialization() {
        let err = PipelineStageError {
            stage: Stage::Convert,
            message: "no such file".to_string(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["stage"], "convert");
        assert_eq!(err.to_string(), "setup stage `convert` failed: no such file");
    }

    #[test]
    fn test_planned_run_is_all_pending() {
        let run = PipelineRun::planned(&Config::default(), &VariantId::ALL);
        assert!(run.stages.iter().all(|s| s.outcome == StageOutcome::Pending));
        assert!(!run.succeeded());

        let err = run.into_result().unwrap_err();
        assert_eq!(err.stage, Stage::Prepare);
        assert_eq!(err.message, "stage never ran");
    }
}
