//! Per-variant model cache.
//!
//! - [`variant`]: the closed set of variant identifiers
//! - [`record`]: per-variant load state and status snapshots
//! - [`registry`]: the cache itself, with single-flight loading

pub mod record;
pub mod registry;
pub mod variant;

pub use record::{LoadState, SharedModel, VariantStatus};
pub use registry::{CacheError, VariantCache};
pub use variant::{UnknownVariant, VariantId};
