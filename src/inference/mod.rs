//! LLM inference.
//!
//! - [`coordinator`]: request validation, generation and timing
//! - [`llama_ffi`]: llama.cpp-facing model and loader traits
//! - [`model_loader`]: GGUF artifact inspection
//! - [`prompt`]: payload validation and prompt rendering

pub mod coordinator;
pub mod llama_ffi;
pub mod model_loader;
pub mod prompt;
