//! Runtime configuration for quant-variant-server.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Every path the server and the setup pipeline touch is derived from here,
//! so the canonical on-disk layout has exactly one definition.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::cache::variant::VariantId;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "quant-variant-server",
    about = "Quantized LLM variant server and setup pipeline"
)]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, global = true, default_value = "config.json")]
    pub config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the HTTP server (default).
    Serve {
        /// HTTP listen address; overrides `server.listen`.
        #[arg(long)]
        listen: Option<String>,
    },

    /// Fetch, build, convert and quantize every variant, then exit.
    Setup,

    /// Load one variant and print its description.
    Describe {
        /// Variant identifier ("4bit" or "8bit").
        #[arg(long, default_value = "4bit")]
        model_type: String,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Model identity and on-disk layout.
    pub model: ModelConfig,

    /// Fixed execution profile every handle is constructed with.
    pub runtime: RuntimeConfig,

    /// Sampling defaults for completions.
    pub sampling: SamplingConfig,

    /// External toolchain used by the setup pipeline.
    pub pipeline: PipelineConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8000").
    pub listen: String,

    /// Maximum concurrent requests.
    pub max_concurrent_requests: usize,

    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8000".to_string(),
            max_concurrent_requests: 4,
            request_timeout_secs: 300,
        }
    }
}

/// Model identity and on-disk layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Root directory holding one subdirectory per quantization target.
    pub model_dir: PathBuf,

    /// Hugging Face repository of the source model.
    pub source_repo: String,

    /// Repository revision to fetch.
    pub revision: String,

    /// Base name used for every produced artifact.
    pub model_name: String,

    /// Variant used when a request does not name one.
    pub default_variant: VariantId,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("llm_models"),
            source_repo: "Qwen/Qwen3-8B".to_string(),
            revision: "main".to_string(),
            model_name: "Qwen3-8B".to_string(),
            default_variant: VariantId::FourBit,
        }
    }
}

/// Execution profile for loaded handles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of CPU threads for computation.
    pub threads: u32,

    /// Context size in tokens.
    pub context_size: u32,

    /// Batch size for prompt processing.
    pub batch_size: u32,

    /// Number of layers offloaded to a GPU (0 = CPU only).
    pub n_gpu_layers: i32,

    /// Lock model memory to prevent swapping.
    pub use_mlock: bool,

    /// Memory-map the model file.
    pub use_mmap: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            threads: 48,
            context_size: 4096,
            batch_size: 512,
            n_gpu_layers: 0,
            use_mlock: true,
            use_mmap: true,
        }
    }
}

/// Sampling defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub temperature: f64,
    pub top_p: f64,

    /// Used when a request omits `max_tokens`.
    pub default_max_tokens: usize,

    /// Upper bound accepted for `max_tokens`.
    pub max_tokens_limit: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            top_p: 0.9,
            default_max_tokens: 500,
            max_tokens_limit: 5000,
        }
    }
}

/// External toolchain settings for the setup pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Checkout of the quantization toolchain (llama.cpp).
    pub toolchain_dir: PathBuf,

    /// Where the source snapshot is materialized.
    pub snapshot_dir: PathBuf,

    /// Python interpreter used for the conversion script.
    pub python: String,

    /// Conversion script, relative to `toolchain_dir`.
    pub convert_script: String,

    /// Quantize binary, relative to `toolchain_dir`.
    pub quantize_binary: PathBuf,

    /// Precision of the intermediate artifact.
    pub outtype: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            toolchain_dir: PathBuf::from("llama.cpp"),
            snapshot_dir: PathBuf::from("Qwen/Qwen3-8B"),
            python: "python".to_string(),
            convert_script: "convert_hf_to_gguf.py".to_string(),
            quantize_binary: PathBuf::from("build/bin/llama-quantize"),
            outtype: "f16".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Directory holding the artifact of one variant.
    pub fn variant_dir(&self, variant: VariantId) -> PathBuf {
        self.model.model_dir.join(variant.as_str())
    }

    /// Canonical artifact path of one variant, e.g.
    /// `llm_models/4bit/Qwen3-8B_FP16_Q4_K_M.gguf`.
    pub fn variant_path(&self, variant: VariantId) -> PathBuf {
        self.variant_dir(variant).join(format!(
            "{}_FP16_{}.gguf",
            self.model.model_name,
            variant.quant_tag()
        ))
    }

    /// Full-precision artifact produced by the conversion stage.
    pub fn intermediate_path(&self) -> PathBuf {
        self.model
            .model_dir
            .join(format!("{}_FP16.gguf", self.model.model_name))
    }
}
