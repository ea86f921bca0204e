//! Integration tests for the setup pipeline, driven by scripted tools.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use quant_variant_server::cache::VariantId;
use quant_variant_server::config::Config;
use quant_variant_server::pipeline::{
    ArtifactFetcher, CancellationToken, CommandOutput, CommandRunner, CommandSpec, FetchError,
    SetupJob, SetupPipeline, Stage, StageOutcome,
};

/// Records every invocation; fails the first one matching `fail_on`.
#[derive(Default)]
struct ScriptedRunner {
    calls: Mutex<Vec<CommandSpec>>,
    fail_on: Option<(&'static str, &'static str)>,
    cancel_after_build: Option<CancellationToken>,
}

impl ScriptedRunner {
    fn failing_on(program_suffix: &'static str, arg: &'static str) -> Self {
        Self {
            fail_on: Some((program_suffix, arg)),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, cmd: &CommandSpec) -> std::io::Result<CommandOutput> {
        self.calls.lock().unwrap().push(cmd.clone());

        if let Some((program, arg)) = self.fail_on {
            if cmd.program.ends_with(program) && cmd.args.iter().any(|a| a == arg) {
                return Ok(CommandOutput {
                    code: Some(2),
                    stdout: "[ 10%] Building C object".to_string(),
                    stderr: format!("error: {arg} failed\n"),
                });
            }
        }

        if let Some(token) = &self.cancel_after_build {
            if cmd.args.iter().any(|a| a == "Release") {
                token.cancel();
            }
        }

        Ok(CommandOutput {
            code: Some(0),
            ..Default::default()
        })
    }
}

#[derive(Default)]
struct MockFetcher {
    fetched: Mutex<Vec<(String, String, PathBuf)>>,
    fail: bool,
}

#[async_trait]
impl ArtifactFetcher for MockFetcher {
    async fn fetch(&self, repo: &str, revision: &str, dest: &Path) -> Result<PathBuf, FetchError> {
        self.fetched
            .lock()
            .unwrap()
            .push((repo.to_string(), revision.to_string(), dest.to_path_buf()));
        if self.fail {
            return Err(FetchError::Hub(format!("{repo}@{revision}: 401 Unauthorized")));
        }
        std::fs::create_dir_all(dest)?;
        Ok(dest.to_path_buf())
    }
}

fn config_in(dir: &Path) -> Arc<Config> {
    let mut config = Config::default();
    config.model.model_dir = dir.join("llm_models");
    config.pipeline.snapshot_dir = dir.join("Qwen/Qwen3-8B");
    config.pipeline.toolchain_dir = dir.join("llama.cpp");
    Arc::new(config)
}

fn pipeline(
    config: &Arc<Config>,
    runner: &Arc<ScriptedRunner>,
    fetcher: &Arc<MockFetcher>,
) -> SetupPipeline {
    SetupPipeline::new(config.clone(), runner.clone(), fetcher.clone())
}

#[tokio::test]
async fn test_successful_run_invokes_tools_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let runner = Arc::new(ScriptedRunner::default());
    let fetcher = Arc::new(MockFetcher::default());

    let run = pipeline(&config, &runner, &fetcher)
        .run_setup(&CancellationToken::new())
        .await;

    assert!(run.succeeded(), "{:?}", run.error);
    assert!(run.error.is_none());
    assert!(run.stages.iter().all(|s| s.duration_ms.is_some()));

    // Prepare created the tree.
    assert!(config.variant_dir(VariantId::FourBit).is_dir());
    assert!(config.variant_dir(VariantId::EightBit).is_dir());

    let fetched = fetcher.fetched.lock().unwrap().clone();
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].0, "Qwen/Qwen3-8B");
    assert_eq!(fetched[0].1, "main");

    let calls = runner.calls();
    assert_eq!(calls.len(), 5);
    assert_eq!(calls[0].program, "cmake");
    assert_eq!(calls[0].args, vec!["-B", "build"]);
    assert_eq!(calls[1].args, vec!["--build", "build", "--config", "Release"]);
    assert_eq!(calls[0].cwd.as_deref(), Some(config.pipeline.toolchain_dir.as_path()));

    assert_eq!(calls[2].program, "python");
    assert_eq!(calls[2].args[0], "convert_hf_to_gguf.py");
    assert!(calls[2].args.contains(&"--outtype".to_string()));
    assert!(calls[2].args.last().unwrap().ends_with("Qwen3-8B_FP16.gguf"));

    assert!(calls[3].program.ends_with("llama-quantize"));
    assert_eq!(calls[3].args[2], "Q4_K_M");
    assert!(calls[3].args[1].ends_with("4bit/Qwen3-8B_FP16_Q4_K_M.gguf"));
    assert_eq!(calls[4].args[2], "Q8_0");
    assert!(calls[4].args[1].ends_with("8bit/Qwen3-8B_FP16_Q8_0.gguf"));

    assert_eq!(run.artifacts.len(), 2);
    assert!(run.artifacts[&VariantId::EightBit].ends_with("8bit/Qwen3-8B_FP16_Q8_0.gguf"));
    assert!(run.into_result().is_ok());
}

#[tokio::test]
async fn test_build_failure_stops_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let runner = Arc::new(ScriptedRunner::failing_on("cmake", "--build"));
    let fetcher = Arc::new(MockFetcher::default());

    let run = pipeline(&config, &runner, &fetcher)
        .run_setup(&CancellationToken::new())
        .await;

    assert!(!run.succeeded());
    assert_eq!(run.failed_stage(), Some(Stage::BuildToolchain));
    assert_eq!(run.outcome(Stage::Prepare), Some(&StageOutcome::Succeeded));
    assert_eq!(run.outcome(Stage::Fetch), Some(&StageOutcome::Succeeded));
    assert_eq!(run.outcome(Stage::Convert), Some(&StageOutcome::Pending));
    assert_eq!(
        run.outcome(Stage::Quantize(VariantId::FourBit)),
        Some(&StageOutcome::Pending)
    );

    // Only the two cmake invocations ran.
    let calls = runner.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|c| c.program == "cmake"));

    let err = run.into_result().unwrap_err();
    assert_eq!(err.stage, Stage::BuildToolchain);
    assert_eq!(err.message, "error: --build failed");
    assert!(err.to_string().contains("build_toolchain"));
}

#[tokio::test]
async fn test_fetch_failure_runs_no_tools() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let runner = Arc::new(ScriptedRunner::default());
    let fetcher = Arc::new(MockFetcher {
        fail: true,
        ..Default::default()
    });

    let run = pipeline(&config, &runner, &fetcher)
        .run_setup(&CancellationToken::new())
        .await;

    assert_eq!(run.failed_stage(), Some(Stage::Fetch));
    assert!(run.error.as_ref().unwrap().message.contains("401 Unauthorized"));
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn test_quantize_failure_skips_later_targets() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let runner = Arc::new(ScriptedRunner::failing_on("llama-quantize", "Q4_K_M"));
    let fetcher = Arc::new(MockFetcher::default());

    let run = pipeline(&config, &runner, &fetcher)
        .run_setup(&CancellationToken::new())
        .await;

    assert_eq!(run.failed_stage(), Some(Stage::Quantize(VariantId::FourBit)));
    assert_eq!(
        run.outcome(Stage::Quantize(VariantId::EightBit)),
        Some(&StageOutcome::Pending)
    );
    assert!(run.intermediate.is_some());
    assert!(run.artifacts.is_empty());
    assert_eq!(runner.calls().len(), 4);
}

#[tokio::test]
async fn test_cancellation_takes_effect_between_stages() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let token = CancellationToken::new();
    let runner = Arc::new(ScriptedRunner {
        cancel_after_build: Some(token.clone()),
        ..Default::default()
    });
    let fetcher = Arc::new(MockFetcher::default());

    let run = pipeline(&config, &runner, &fetcher).run_setup(&token).await;

    assert!(run.cancelled);
    assert!(run.error.is_none());
    // The stage in progress finishes; the next one never starts.
    assert_eq!(run.outcome(Stage::BuildToolchain), Some(&StageOutcome::Succeeded));
    assert_eq!(run.outcome(Stage::Convert), Some(&StageOutcome::Pending));
    assert_eq!(runner.calls().len(), 2);

    let err = run.into_result().unwrap_err();
    assert_eq!(err.stage, Stage::Convert);
}

#[tokio::test]
async fn test_setup_job_publishes_reports() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let runner = Arc::new(ScriptedRunner::default());
    let fetcher = Arc::new(MockFetcher::default());
    let job = SetupJob::new(pipeline(&config, &runner, &fetcher));

    assert!(job.last_run().await.is_none());
    assert!(!job.cancel().await);

    let run = job.run_now().await.unwrap();
    assert!(run.succeeded());
    assert!(!job.is_running());
    assert_eq!(job.last_run().await.unwrap().run_id, run.run_id);

    assert!(job.try_start().await);
    // Poll until the background run publishes its report.
    for _ in 0..100 {
        if !job.is_running() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let latest = job.last_run().await.unwrap();
    assert_ne!(latest.run_id, run.run_id);
    assert!(latest.succeeded());
}

/// Blocks the first tool invocation until released.
#[derive(Default)]
struct GatedRunner {
    entered: Notify,
    release: Notify,
    calls: Mutex<Vec<CommandSpec>>,
}

#[async_trait]
impl CommandRunner for GatedRunner {
    async fn run(&self, cmd: &CommandSpec) -> std::io::Result<CommandOutput> {
        let first = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(cmd.clone());
            calls.len() == 1
        };
        if first {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(CommandOutput {
            code: Some(0),
            ..Default::default()
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_setup_job_rejects_second_run_while_active() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let runner = Arc::new(GatedRunner::default());
    let fetcher = Arc::new(MockFetcher::default());
    let job = SetupJob::new(SetupPipeline::new(config, runner.clone(), fetcher));

    assert!(job.try_start().await);
    runner.entered.notified().await;

    assert!(job.is_running());
    assert!(!job.try_start().await);
    assert!(job.run_now().await.is_none());
    assert!(job.cancel().await);

    runner.release.notify_one();
    for _ in 0..100 {
        if !job.is_running() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(!job.is_running());

    let run = job.last_run().await.unwrap();
    assert!(run.cancelled);
    // The held stage finished; nothing after it started.
    assert_eq!(run.outcome(Stage::BuildToolchain), Some(&StageOutcome::Succeeded));
    assert_eq!(run.outcome(Stage::Convert), Some(&StageOutcome::Pending));
    assert_eq!(runner.calls.lock().unwrap().len(), 2);

    assert!(!job.cancel().await);
    assert!(job.try_start().await);
}
