//! Per-variant cache records and their lifecycle.
//!
//! ```text
//! Unloaded ──► Loading ──► Ready
//!                 │
//!                 └──────► Failed ──(next resolve)──► Loading
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::cache::variant::VariantId;
use crate::inference::llama_ffi::ChatModel;

/// A loaded handle. Owned by the cache; callers hold a clone only for the
/// duration of one completion call.
pub type SharedModel = Arc<dyn ChatModel>;

/// Result of one load attempt. The error is the human-readable reason.
pub type LoadOutcome = Result<SharedModel, String>;

/// The single in-flight load for a variant; every waiter polls a clone.
pub type InFlightLoad = Shared<BoxFuture<'static, LoadOutcome>>;

pub(crate) enum Slot {
    Unloaded,
    Loading(InFlightLoad),
    Ready(SharedModel),
    Failed(String),
}

/// Snapshot of a record's lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LoadState {
    Unloaded,
    Loading,
    Ready,
    Failed { reason: String },
}

impl LoadState {
    pub fn is_ready(&self) -> bool {
        matches!(self, LoadState::Ready)
    }
}

/// Non-blocking status report for one variant.
#[derive(Debug, Clone, Serialize)]
pub struct VariantStatus {
    pub model_type: VariantId,
    pub model_path: PathBuf,
    #[serde(flatten)]
    pub state: LoadState,
    /// Thread count of the loaded handle (only when ready).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads: Option<u32>,
    /// Number of load attempts started so far.
    pub load_attempts: u64,
}

/// Cache entry for one variant. The slot mutex is scoped to this variant
/// alone and is never held across a load.
pub struct VariantRecord {
    pub(crate) id: VariantId,
    pub(crate) path: PathBuf,
    pub(crate) slot: Mutex<Slot>,
    load_attempts: AtomicU64,
}

impl VariantRecord {
    pub(crate) fn new(id: VariantId, path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            id,
            path,
            slot: Mutex::new(Slot::Unloaded),
            load_attempts: AtomicU64::new(0),
        })
    }

    pub(crate) fn note_attempt(&self) -> u64 {
        self.load_attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn attempts(&self) -> u64 {
        self.load_attempts.load(Ordering::SeqCst)
    }

    pub(crate) async fn snapshot(&self) -> VariantStatus {
        let slot = self.slot.lock().await;
        let (state, threads) = match &*slot {
            Slot::Unloaded => (LoadState::Unloaded, None),
            Slot::Loading(_) => (LoadState::Loading, None),
            Slot::Ready(model) => (LoadState::Ready, Some(model.n_threads())),
            Slot::Failed(reason) => (
                LoadState::Failed {
                    reason: reason.clone(),
                },
                None,
            ),
        };
        VariantStatus {
            model_type: self.id,
            model_path: self.path.clone(),
            state,
            threads,
            load_attempts: self.attempts(),
        }
    }
}
