use relay_cache::BoundedLru;
use relay_protocol::{AgentEvent, EventId, RunId};

/// Per-connection duplicate and ordering guard.
///
/// An event with a non-zero seq and a run id is dropped unless its seq is
/// above the last one delivered for that run. Independently, an event whose
/// id was already delivered is dropped.
#[derive(Debug)]
pub struct DeliveryGuard {
    seen_event_ids: BoundedLru<EventId, ()>,
    last_seq_by_run: BoundedLru<RunId, u64>,
}

impl DeliveryGuard {
    pub fn new(seen_event_capacity: usize, run_seq_capacity: usize) -> Self {
        Self {
            seen_event_ids: BoundedLru::new(seen_event_capacity),
            last_seq_by_run: BoundedLru::new(run_seq_capacity),
        }
    }

    /// Record `event` and report whether it should be delivered.
    pub fn admit(&mut self, event: &AgentEvent) -> bool {
        let base = event.base();
        let seq = base.seq();
        let run_id = base.run_id();
        if seq > 0 && !run_id.is_empty() {
            if self
                .last_seq_by_run
                .get(run_id)
                .is_some_and(|last| seq <= *last)
            {
                return false;
            }
            self.last_seq_by_run.put(run_id.clone(), seq);
        }

        let event_id = base.event_id();
        if !event_id.is_empty() {
            if self.seen_event_ids.contains(event_id) {
                return false;
            }
            self.seen_event_ids.put(event_id.clone(), ());
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::{EventMeta, WorkflowEventEnvelope, event_types};

    fn event(run: &str, seq: u64, id: &str) -> AgentEvent {
        WorkflowEventEnvelope::new(
            event_types::NODE_STARTED,
            EventMeta::new("s1").with_run(run).with_seq(seq).with_event_id(id),
        )
        .into()
    }

    #[test]
    fn duplicate_event_ids_are_dropped() {
        let mut guard = DeliveryGuard::new(16, 16);
        assert!(guard.admit(&event("", 0, "e1")));
        assert!(!guard.admit(&event("", 0, "e1")));
        assert!(guard.admit(&event("", 0, "e2")));
    }

    #[test]
    fn seq_never_regresses_within_a_run() {
        let mut guard = DeliveryGuard::new(16, 16);
        assert!(guard.admit(&event("r1", 1, "a")));
        assert!(guard.admit(&event("r1", 3, "b")));
        assert!(!guard.admit(&event("r1", 2, "c")));
        assert!(!guard.admit(&event("r1", 3, "d")));

        // Other runs keep their own counters.
        assert!(guard.admit(&event("r2", 1, "e")));
    }

    #[test]
    fn unset_ids_bypass_the_guard() {
        let mut guard = DeliveryGuard::new(16, 16);
        assert!(guard.admit(&event("r1", 0, "")));
        assert!(guard.admit(&event("r1", 0, "")));
        assert!(guard.admit(&event("", 5, "")));
        assert!(guard.admit(&event("", 5, "")));
    }
}
