//! Bindings to the llama.cpp inference engine.
//!
//! The rest of the crate only sees the [`ChatModel`] and [`ModelLoader`]
//! traits. [`LlamaLoader`] is the production loader; it validates the GGUF
//! artifact and hands out a [`LlamaModel`].
//!
//! The model and context types are a stub that mimics llama.cpp's calling
//! sequence (tokenize, decode, sample, detokenize) without linking the C
//! library, so the server runs end to end on any host.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::config::RuntimeConfig;
use crate::inference::model_loader::{self, ModelMetadata};

#[derive(Error, Debug)]
pub enum LlamaError {
    #[error("Failed to load model: {0}")]
    ModelLoadFailed(String),

    #[error("Tokenization failed: {0}")]
    TokenizeFailed(String),

    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    #[error("Context creation failed: {0}")]
    ContextFailed(String),
}

/// Token ID type.
pub type TokenId = i32;

/// Model parameters (mirrors llama_model_params).
#[derive(Debug, Clone, PartialEq)]
pub struct ModelParams {
    /// Number of GPU layers to offload.
    pub n_gpu_layers: i32,

    /// Use memory mapping for the model file.
    pub use_mmap: bool,

    /// Use memory locking.
    pub use_mlock: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            n_gpu_layers: 0,
            use_mmap: true,
            use_mlock: true,
        }
    }
}

/// Context parameters (mirrors llama_context_params).
#[derive(Debug, Clone, PartialEq)]
pub struct ContextParams {
    /// Context size in tokens.
    pub n_ctx: u32,

    /// Batch size for prompt processing.
    pub n_batch: u32,

    /// Number of threads for computation.
    pub n_threads: u32,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 4096,
            n_batch: 512,
            n_threads: 48,
        }
    }
}

/// The fixed profile every handle is constructed with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionProfile {
    pub model: ModelParams,
    pub context: ContextParams,
}

impl From<&RuntimeConfig> for ExecutionProfile {
    fn from(rt: &RuntimeConfig) -> Self {
        Self {
            model: ModelParams {
                n_gpu_layers: rt.n_gpu_layers,
                use_mmap: rt.use_mmap,
                use_mlock: rt.use_mlock,
            },
            context: ContextParams {
                n_ctx: rt.context_size,
                n_batch: rt.batch_size,
                n_threads: rt.threads,
            },
        }
    }
}

/// One chat turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Sampling parameters for one completion.
#[derive(Debug, Clone)]
pub struct SamplingParams {
    pub max_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
}

/// Output of one chat completion.
#[derive(Debug, Clone)]
pub struct ChatCompletion {
    /// Assistant message content.
    pub content: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// A loaded, ready-to-run model variant.
pub trait ChatModel: Send + Sync {
    /// File the handle was constructed from.
    fn path(&self) -> &Path;

    /// Thread count the handle runs with.
    fn n_threads(&self) -> u32;

    /// Run a chat completion. Blocks for the duration of generation.
    fn create_chat_completion(
        &self,
        messages: &[ChatMessage],
        params: &SamplingParams,
    ) -> Result<ChatCompletion, LlamaError>;
}

/// Constructs handles. Called at most once per in-flight load.
pub trait ModelLoader: Send + Sync {
    /// Construct a handle from an artifact on disk. Blocking.
    fn load(&self, path: &Path, profile: &ExecutionProfile)
        -> Result<Arc<dyn ChatModel>, LlamaError>;
}

/// Production loader backed by [`LlamaModel`].
#[derive(Debug, Default, Clone)]
pub struct LlamaLoader;

impl ModelLoader for LlamaLoader {
    fn load(
        &self,
        path: &Path,
        profile: &ExecutionProfile,
    ) -> Result<Arc<dyn ChatModel>, LlamaError> {
        let model = LlamaModel::load(path, profile.clone())?;
        Ok(Arc::new(model))
    }
}

/// Stub model handle.
///
/// In a real implementation, this would wrap `*mut llama_model` from the C library.
pub struct LlamaModel {
    /// Model file path.
    path: PathBuf,

    /// Header metadata of the artifact.
    pub metadata: ModelMetadata,

    /// Profile the model was loaded with.
    pub profile: ExecutionProfile,
}

/// Stub context handle.
///
/// In a real implementation, this would wrap `*mut llama_context`.
pub struct LlamaContext {
    /// Context size.
    pub n_ctx: u32,

    /// Current token position.
    pub pos: usize,
}

impl LlamaModel {
    /// Load a model from a GGUF file (stub).
    pub fn load(path: &Path, profile: ExecutionProfile) -> Result<Self, LlamaError> {
        let metadata = model_loader::load_metadata(path)
            .map_err(|e| LlamaError::ModelLoadFailed(e.to_string()))?;

        debug!(
            path = %path.display(),
            mmap = profile.model.use_mmap,
            mlock = profile.model.use_mlock,
            threads = profile.context.n_threads,
            "Model constructed"
        );

        Ok(Self {
            path: path.to_path_buf(),
            metadata,
            profile,
        })
    }

    /// Create a new context for this model (stub).
    pub fn new_context(&self) -> Result<LlamaContext, LlamaError> {
        if self.profile.context.n_ctx == 0 {
            return Err(LlamaError::ContextFailed("n_ctx must be positive".to_string()));
        }
        Ok(LlamaContext {
            n_ctx: self.profile.context.n_ctx,
            pos: 0,
        })
    }

    /// Tokenize a string into token IDs (stub).
    pub fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, LlamaError> {
        if text.is_empty() {
            return Err(LlamaError::TokenizeFailed("empty input".to_string()));
        }
        // Stub: produce approximately 1 token per 4 characters.
        let n_tokens = (text.len() / 4).max(1);
        let mut tokens: Vec<TokenId> = (0..n_tokens as i32).collect();
        if add_bos {
            tokens.insert(0, 1); // BOS token
        }
        Ok(tokens)
    }

    /// Decode one token back to text (stub).
    pub fn token_to_piece(&self, token: TokenId) -> String {
        format!("token_{token}")
    }

    /// Render messages with a ChatML-style template.
    fn apply_chat_template(messages: &[ChatMessage]) -> String {
        let mut prompt = String::new();
        for m in messages {
            prompt.push_str("<|im_start|>");
            prompt.push_str(&m.role);
            prompt.push('\n');
            prompt.push_str(&m.content);
            prompt.push_str("<|im_end|>\n");
        }
        prompt.push_str("<|im_start|>assistant\n");
        prompt
    }
}

impl ChatModel for LlamaModel {
    fn path(&self) -> &Path {
        &self.path
    }

    fn n_threads(&self) -> u32 {
        self.profile.context.n_threads
    }

    fn create_chat_completion(
        &self,
        messages: &[ChatMessage],
        params: &SamplingParams,
    ) -> Result<ChatCompletion, LlamaError> {
        let prompt = Self::apply_chat_template(messages);
        let prompt_tokens = self.tokenize(&prompt, true)?;

        let mut ctx = self.new_context()?;
        ctx.decode(&prompt_tokens)?;

        let mut pieces = Vec::with_capacity(params.max_tokens);
        while pieces.len() < params.max_tokens && ctx.kv_cache_used() < ctx.n_ctx as usize {
            let token = ctx.sample()?;
            ctx.decode(&[token])?;
            pieces.push(self.token_to_piece(token));
        }

        Ok(ChatCompletion {
            content: pieces.join(" "),
            prompt_tokens: prompt_tokens.len(),
            completion_tokens: pieces.len(),
        })
    }
}

impl LlamaContext {
    /// Process a batch of tokens (stub).
    ///
    /// In a real implementation, this calls llama_decode and fills the KV cache.
    pub fn decode(&mut self, tokens: &[TokenId]) -> Result<(), LlamaError> {
        if self.pos + tokens.len() > self.n_ctx as usize {
            return Err(LlamaError::DecodeFailed(format!(
                "context overflow: {} + {} > {}",
                self.pos,
                tokens.len(),
                self.n_ctx
            )));
        }
        self.pos += tokens.len();
        Ok(())
    }

    /// Sample the next token (stub).
    pub fn sample(&self) -> Result<TokenId, LlamaError> {
        Ok((self.pos % 100) as TokenId)
    }

    /// Get the current KV cache usage in tokens.
    pub fn kv_cache_used(&self) -> usize {
        self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::model_loader::write_test_gguf;

    fn small_profile() -> ExecutionProfile {
        ExecutionProfile {
            model: ModelParams::default(),
            context: ContextParams {
                n_ctx: 256,
                n_batch: 32,
                n_threads: 2,
            },
        }
    }

    #[test]
    fn test_profile_from_runtime_config() {
        let profile = ExecutionProfile::from(&RuntimeConfig::default());
        assert_eq!(profile.context.n_threads, 48);
        assert_eq!(profile.context.n_ctx, 4096);
        assert_eq!(profile.context.n_batch, 512);
        assert!(profile.model.use_mlock);
        assert!(profile.model.use_mmap);
    }

    #[test]
    fn test_model_load_rejects_missing_file() {
        let err = LlamaModel::load(Path::new("/nonexistent/model.gguf"), small_profile())
            .err()
            .unwrap();
        assert!(matches!(err, LlamaError::ModelLoadFailed(_)));
    }

    #[test]
    fn test_chat_completion_respects_budget() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.gguf");
        write_test_gguf(&path);

        let model = LlamaModel::load(&path, small_profile()).unwrap();
        assert_eq!(model.n_threads(), 2);

        let out = model
            .create_chat_completion(
                &[ChatMessage::system("sys"), ChatMessage::user("hello")],
                &SamplingParams {
                    max_tokens: 7,
                    temperature: 0.2,
                    top_p: 0.9,
                },
            )
            .unwrap();
        assert_eq!(out.completion_tokens, 7);
        assert_eq!(out.content.split_whitespace().count(), 7);
    }

    #[test]
    fn test_tokenize_rejects_empty_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.gguf");
        write_test_gguf(&path);

        let model = LlamaModel::load(&path, small_profile()).unwrap();
        let err = model.tokenize("", true).unwrap_err();
        assert!(matches!(err, LlamaError::TokenizeFailed(_)));
        assert_eq!(model.tokenize("abcdefgh", false).unwrap().len(), 2);
    }

    #[test]
    fn test_context_decode_overflow() {
        let mut ctx = LlamaContext { n_ctx: 4, pos: 0 };
        ctx.decode(&[1, 2, 3]).unwrap();
        assert_eq!(ctx.kv_cache_used(), 3);
        assert!(ctx.decode(&[4, 5]).is_err());
    }
}
