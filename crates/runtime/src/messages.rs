//! Envelope body payloads for the message types named in spec §6's topic
//! table. Each is the `T` a `rockbot_pipeline::TypeRegistry` handler decodes
//! `Envelope::body_as::<T>()` into. Grounded on the teacher's habit (in
//! `aigent-llm`'s chat types) of plain serde structs with no behavior beyond
//! construction.

use serde::{Deserialize, Serialize};

/// Body of a `user.request` envelope. `session_id` is renamed to `sessionId`
/// on the wire so `rockbot_pipeline::extract_session_id`'s best-effort peek
/// picks it up and serializes same-session dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessage {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub content: String,
}

/// Body of a `user.response` envelope — the agent's reply to a user-sourced
/// session. `is_final` distinguishes a terminal reply from a progress bubble
/// (spec §4.11/§4.12's non-final relays).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReply {
    pub session_id: String,
    pub content: String,
    pub is_final: bool,
}

/// Body of a `agent.task` envelope fired by the Scheduler (spec §4.9/§4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTaskMessage {
    pub task_name: String,
    pub description: String,
}

/// Body of a `subagent.progress` envelope (spec §4.11).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentProgressMessage {
    pub task_id: String,
    pub content: String,
}

/// Body of a `subagent.result` envelope (spec §4.11). Exactly one is
/// published per spawned subagent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentResultMessage {
    pub task_id: String,
    pub primary_session_id: String,
    pub is_success: bool,
    pub output: String,
    pub error: Option<String>,
}

/// State carried by an `agent.task.status` envelope (spec §4.12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskState {
    Working,
    Completed,
    Failed,
    Cancelled,
}

/// Body of an `agent.task` envelope sent to request cross-agent work (spec
/// §4.12's outbound A2A contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTaskRequest {
    pub task_id: String,
    pub skill: String,
    pub message: String,
}

/// Body of an `agent.task.status` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTaskStatusUpdate {
    pub task_id: String,
    pub state: TaskState,
    pub detail: Option<String>,
}

/// Body of the `{resultTopic}.{self}` success reply (spec §4.12).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTaskResult {
    pub task_id: String,
    pub target_agent: String,
    pub output: String,
}

/// Error codes an inbound task handler may report (spec §4.12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskErrorCode {
    ExecutionFailed,
    TaskNotCancelable,
    Timeout,
}

/// Body of the `{resultTopic}.{self}` failure reply (spec §4.12).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTaskError {
    pub task_id: String,
    pub target_agent: String,
    pub code: TaskErrorCode,
    pub message: String,
}

/// Request to cancel an in-flight inbound A2A task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTaskCancel {
    pub task_id: String,
}

/// Body of a `discovery.announce` envelope (spec §4.13).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCard {
    pub agent_name: String,
    pub skills: Vec<String>,
    pub description: String,
}
