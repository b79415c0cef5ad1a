use std::collections::HashMap;

use parking_lot::Mutex;
use relay_protocol::{RunId, RunTracker, SessionId};
use tracing::debug;

/// Process-local record of the run currently executing per session.
#[derive(Debug, Default)]
pub struct InMemoryRunTracker {
    active: Mutex<HashMap<SessionId, RunId>>,
}

impl InMemoryRunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_active_run(&self, session_id: SessionId, run_id: RunId) {
        debug!(session_id = %session_id, run_id = %run_id, "active run set");
        self.active.lock().insert(session_id, run_id);
    }

    /// Clear the session's active run if it is still `run_id`.
    pub fn clear_active_run(&self, session_id: &SessionId, run_id: &RunId) -> bool {
        let mut active = self.active.lock();
        if active.get(session_id) == Some(run_id) {
            active.remove(session_id);
            return true;
        }
        false
    }
}

impl RunTracker for InMemoryRunTracker {
    fn active_run_id(&self, session_id: &SessionId) -> Option<RunId> {
        self.active.lock().get(session_id).cloned()
    }
}
