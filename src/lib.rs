//! quant-variant-server: serves quantized variants of one LLM.
//!
//! Each variant is loaded lazily into a per-variant cache on first use. A
//! setup pipeline fetches the source model, builds the llama.cpp toolchain,
//! converts to GGUF and quantizes every variant.

pub mod cache;
pub mod config;
pub mod inference;
pub mod metrics;
pub mod pipeline;
pub mod server;
