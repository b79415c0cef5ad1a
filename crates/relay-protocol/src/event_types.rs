//! Dotted event-type vocabulary shared by producers and the stream filter.

pub const INPUT_RECEIVED: &str = "workflow.input.received";

pub const NODE_STARTED: &str = "workflow.node.started";
pub const NODE_COMPLETED: &str = "workflow.node.completed";
pub const NODE_FAILED: &str = "workflow.node.failed";
pub const NODE_OUTPUT_DELTA: &str = "workflow.node.output.delta";
pub const NODE_OUTPUT_SUMMARY: &str = "workflow.node.output.summary";

pub const TOOL_STARTED: &str = "workflow.tool.started";
pub const TOOL_PROGRESS: &str = "workflow.tool.progress";
pub const TOOL_COMPLETED: &str = "workflow.tool.completed";

pub const SUBFLOW_PROGRESS: &str = "workflow.subflow.progress";
pub const SUBFLOW_COMPLETED: &str = "workflow.subflow.completed";

pub const RESULT_FINAL: &str = "workflow.result.final";
pub const RESULT_CANCELLED: &str = "workflow.result.cancelled";

pub const ARTIFACT_MANIFEST: &str = "workflow.artifact.manifest";
pub const REPLAN_REQUESTED: &str = "workflow.replan.requested";

pub const EXECUTOR_UPDATE: &str = "workflow.executor.update";
pub const EXECUTOR_USER_MESSAGE: &str = "workflow.executor.user_message";

pub const DIAGNOSTIC_CONTEXT_SNAPSHOT: &str = "workflow.diagnostic.context_snapshot";
pub const DIAGNOSTIC_CONTEXT_COMPRESSION: &str = "workflow.diagnostic.context_compression";
pub const DIAGNOSTIC_TOOL_FILTERING: &str = "workflow.diagnostic.tool_filtering";
pub const DIAGNOSTIC_BROWSER_INFO: &str = "workflow.diagnostic.browser_info";
pub const DIAGNOSTIC_ENVIRONMENT_SNAPSHOT: &str = "workflow.diagnostic.environment_snapshot";
pub const DIAGNOSTIC_CONTEXT_CHECKPOINT: &str = "workflow.diagnostic.context_checkpoint";
pub const DIAGNOSTIC_PREANALYSIS_EMOJI: &str = "workflow.diagnostic.preanalysis_emoji";

/// Synthesized by the broadcaster after a subscriber missed events.
pub const STREAM_DROPPED: &str = "workflow.stream.dropped";

/// Name of the connection-acknowledgement frame.
pub const CONNECTED: &str = "connected";
