//! HTTP surface over the coordinator and the setup job.
//!
//! - [`api`]: routes and handlers
//! - [`envelope`]: the response wrapper

pub mod api;
pub mod envelope;

pub use api::{build_router, AppState};
pub use envelope::Envelope;
