//! Event admission for streaming connections.
//!
//! Applied to every event, replayed or live, before the dedup guards.

use relay_protocol::event_types::*;
use relay_protocol::{AgentEvent, PayloadMap};

/// Types streamed to every connection.
const STREAM_ALLOWLIST: &[&str] = &[
    INPUT_RECEIVED,
    NODE_STARTED,
    NODE_COMPLETED,
    NODE_FAILED,
    NODE_OUTPUT_DELTA,
    NODE_OUTPUT_SUMMARY,
    TOOL_STARTED,
    TOOL_PROGRESS,
    TOOL_COMPLETED,
    SUBFLOW_PROGRESS,
    SUBFLOW_COMPLETED,
    RESULT_FINAL,
    RESULT_CANCELLED,
    ARTIFACT_MANIFEST,
    REPLAN_REQUESTED,
    EXECUTOR_USER_MESSAGE,
    STREAM_DROPPED,
];

/// Additional types streamed when the connection asked for debug output.
const DEBUG_ALLOWLIST: &[&str] = &[
    DIAGNOSTIC_CONTEXT_COMPRESSION,
    DIAGNOSTIC_TOOL_FILTERING,
    DIAGNOSTIC_BROWSER_INFO,
    DIAGNOSTIC_ENVIRONMENT_SNAPSHOT,
    DIAGNOSTIC_CONTEXT_CHECKPOINT,
    DIAGNOSTIC_PREANALYSIS_EMOJI,
    EXECUTOR_UPDATE,
];

// Internal scaffolding nodes hidden outside debug mode.
const BLOCKED_NODE_IDS: &[&str] = &["react:context", "react:planner", "react:summary"];
const BLOCKED_NODE_PREFIXES: &[&str] = &["react:context:", "internal:"];

const DELEGATION_TOOL: &str = "subagent";
const DELEGATION_NODE_PREFIX: &str = "subagent:";

/// Decide whether `event` may be written to a connection.
pub fn should_stream(event: &AgentEvent, debug: bool) -> bool {
    let base = event.base();
    let event_type = base.event_type();

    if event_type == DIAGNOSTIC_CONTEXT_SNAPSHOT {
        return false;
    }
    let allowed = STREAM_ALLOWLIST.contains(&event_type)
        || (debug && DEBUG_ALLOWLIST.contains(&event_type));
    if !allowed {
        return false;
    }

    match base {
        AgentEvent::Envelope(envelope) => {
            if !debug && is_blocked_node(&envelope.node_id) {
                return false;
            }
        }
        AgentEvent::InputReceived(_) => {}
        AgentEvent::Lifecycle { .. } | AgentEvent::Subtask(_) => return false,
    }

    // Delegated subflows emit their own events; only the anchors of the
    // delegating tool call pass.
    if is_delegation_tool_event(event) {
        return matches!(event_type, TOOL_STARTED | TOOL_COMPLETED);
    }
    true
}

fn is_blocked_node(node_id: &str) -> bool {
    BLOCKED_NODE_IDS.contains(&node_id)
        || BLOCKED_NODE_PREFIXES
            .iter()
            .any(|prefix| node_id.starts_with(prefix))
}

/// True for tool lifecycle events of a subagent delegation call.
pub fn is_delegation_tool_event(event: &AgentEvent) -> bool {
    let Some(envelope) = event.as_envelope() else {
        return false;
    };
    if !matches!(
        envelope.event.as_str(),
        TOOL_STARTED | TOOL_PROGRESS | TOOL_COMPLETED
    ) {
        return false;
    }
    match normalized_tool_name(&envelope.payload) {
        Some(name) => name == DELEGATION_TOOL,
        None => envelope
            .node_id
            .to_ascii_lowercase()
            .starts_with(DELEGATION_NODE_PREFIX),
    }
}

fn normalized_tool_name(payload: &PayloadMap) -> Option<String> {
    ["tool_name", "tool"].iter().find_map(|key| {
        let name = payload.get(*key)?.as_str()?.trim().to_lowercase();
        (!name.is_empty()).then_some(name)
    })
}
