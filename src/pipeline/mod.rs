pub mod cancel;
pub mod fetcher;
pub mod job;
pub mod orchestrator;
pub mod runner;

pub use cancel::CancellationToken;
pub use fetcher::{ArtifactFetcher, FetchError, HfHubFetcher};
pub use job::SetupJob;
pub use orchestrator::{PipelineRun, PipelineStageError, SetupPipeline, Stage, StageOutcome};
pub use runner::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner};
