//! Load-state machine for the active backend

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;

use super::backend::{Backend, BackendKind};

/// The backend chosen at load time
pub struct ActiveBackend {
    pub backend: Arc<dyn Backend>,
    pub kind: BackendKind,
    pub load_time: Duration,
    /// Why the high-performance backend is not the one running, if it isn't
    pub fallback_reason: Option<String>,
}

impl std::fmt::Debug for ActiveBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveBackend")
            .field("kind", &self.kind)
            .field("load_time", &self.load_time)
            .field("fallback_reason", &self.fallback_reason)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    Unloaded,
    Loading,
    Ready,
    Failed,
}

#[derive(Debug)]
enum EngineState {
    Unloaded,
    Loading,
    Ready(Arc<ActiveBackend>),
    Failed(String),
}

/// `Unloaded -> Loading -> Ready | Failed`, one attempt only
#[derive(Debug)]
pub struct EngineHandle {
    state: RwLock<EngineState>,
}

impl Default for EngineHandle {
    fn default() -> Self {
        Self {
            state: RwLock::new(EngineState::Unloaded),
        }
    }
}

impl EngineHandle {
    /// Claim the single load attempt
    pub(crate) fn begin_load(&self) -> bool {
        let mut state = self.state.write();
        match *state {
            EngineState::Unloaded => {
                *state = EngineState::Loading;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn set_ready(&self, active: ActiveBackend) -> Arc<ActiveBackend> {
        let active = Arc::new(active);
        let mut state = self.state.write();
        debug_assert!(matches!(*state, EngineState::Loading));
        *state = EngineState::Ready(Arc::clone(&active));
        active
    }

    pub(crate) fn set_failed(&self, reason: String) {
        *self.state.write() = EngineState::Failed(reason);
    }

    pub fn status(&self) -> EngineStatus {
        match *self.state.read() {
            EngineState::Unloaded => EngineStatus::Unloaded,
            EngineState::Loading => EngineStatus::Loading,
            EngineState::Ready(_) => EngineStatus::Ready,
            EngineState::Failed(_) => EngineStatus::Failed,
        }
    }

    pub fn active(&self) -> Option<Arc<ActiveBackend>> {
        match &*self.state.read() {
            EngineState::Ready(active) => Some(Arc::clone(active)),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<String> {
        match &*self.state.read() {
            EngineState::Failed(reason) => Some(reason.clone()),
            _ => None,
        }
    }
}
