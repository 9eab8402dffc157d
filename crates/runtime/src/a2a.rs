//! A2A Coordinator (spec §4.12): dispatches delegated work to another agent
//! over the bus, tracks the correlated reply with a per-task timeout, and
//! folds the eventual result back into the primary session. Also answers
//! inbound `AgentTaskRequest`s this agent receives as a target.
//!
//! Grounded on `rockbot-exec::McpToolExecutor`'s pending-reply-by-id
//! correlation table, generalized from a single in-process bridge into a
//! cross-agent request/reply exchange with its own per-task timeout and
//! three distinct reply shapes (status/result/error) instead of MCP's single
//! success reply.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rockbot_tools::{ToolExecutor, ToolInvocation, ToolInvocationResult};
use rockbot_transport::Transport;
use rockbot_types::{reserved, ContentTrust, Envelope};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::messages::{
    AgentTaskCancel, AgentTaskError, AgentTaskRequest, AgentTaskResult, AgentTaskStatusUpdate, TaskErrorCode, TaskState,
};
use crate::primary_turn::RuntimeHandles;

pub const TOPIC_AGENT_TASK: &str = "agent.task";
pub const TOPIC_AGENT_TASK_CANCEL: &str = "agent.task.cancel";
pub const TOPIC_AGENT_TASK_STATUS: &str = "agent.task.status";

/// `{resultTopic}.{self}` — where our own outbound invocations ask for
/// replies, and where we listen for them.
pub fn response_topic(agent_name: &str) -> String {
    format!("agent.response.{agent_name}")
}

/// `{taskId, targetAgent, primarySessionId, startedAt, cancel}` (spec §3).
struct PendingA2ATask {
    target_agent: String,
    primary_session_id: String,
    started_at: DateTime<Utc>,
    /// Fires once a terminal reply (result/error) arrives, to stop the
    /// timeout watcher from firing a redundant cleanup.
    settled: CancellationToken,
}

/// Outbound correlation table plus the tool that lets the loop runner spawn
/// a delegated task.
pub struct A2ACoordinator {
    transport: Arc<dyn Transport>,
    source: String,
    pending: Mutex<HashMap<String, PendingA2ATask>>,
}

impl A2ACoordinator {
    pub fn new(transport: Arc<dyn Transport>, source: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { transport, source: source.into(), pending: Mutex::new(HashMap::new()) })
    }

    /// Outbound contract step 1-3: creates a `PendingA2ATask`, arms a
    /// timeout-cancel, publishes the request, and returns the task id
    /// synchronously. The caller (the `invoke_agent` tool) never blocks for
    /// the reply — that arrives later through the inbound handlers.
    pub async fn invoke(
        self: &Arc<Self>,
        target_agent: String,
        skill: String,
        message: String,
        primary_session_id: String,
        timeout_minutes: u64,
    ) -> Result<String> {
        let task_id = Uuid::new_v4().to_string();
        let settled = CancellationToken::new();

        self.pending.lock().await.insert(
            task_id.clone(),
            PendingA2ATask { target_agent: target_agent.clone(), primary_session_id, started_at: Utc::now(), settled: settled.clone() },
        );

        let coordinator = self.clone();
        let timeout_task_id = task_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(timeout_minutes * 60)) => {
                    if coordinator.pending.lock().await.remove(&timeout_task_id).is_some() {
                        info!(task_id = %timeout_task_id, "a2a task timed out before a reply, tracker removed");
                    }
                }
                _ = settled.cancelled() => {}
            }
        });

        let envelope = Envelope::builder("AgentTaskRequest", &self.source)
            .correlation_id(Uuid::parse_str(&task_id).expect("task_id is a freshly generated uuid"))
            .reply_to(response_topic(&self.source))
            .destination(target_agent)
            .header(reserved::CONTENT_TRUST, ContentTrust::ToolRequest.to_string())
            .json_body(&AgentTaskRequest { task_id: task_id.clone(), skill, message })?
            .build();
        self.transport.publish(TOPIC_AGENT_TASK, envelope).await?;

        Ok(task_id)
    }

    /// Removes and returns the tracked entry for `task_id`, cancelling its
    /// timeout watcher. `None` if untracked — the caller must ignore the
    /// reply (spec: "ignore messages whose correlationId is not tracked").
    async fn take(&self, task_id: &str) -> Option<(String, String)> {
        let entry = self.pending.lock().await.remove(task_id)?;
        entry.settled.cancel();
        Some((entry.target_agent, entry.primary_session_id))
    }

    /// Looks up the primary session for a still-pending task without
    /// removing it — used for the non-final `Working` relay, which must not
    /// cancel the timeout or fold anything into history.
    async fn peek(&self, task_id: &str) -> Option<String> {
        self.pending.lock().await.get(task_id).map(|e| e.primary_session_id.clone())
    }

    pub async fn active_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// The `invoke_agent(agent_name, skill, message, timeout_minutes?)` tool
/// (spec §4.12 outbound contract).
pub struct InvokeAgentTool {
    pub coordinator: Arc<A2ACoordinator>,
    pub default_timeout_minutes: u64,
}

#[derive(Deserialize)]
struct InvokeAgentArgs {
    agent_name: String,
    skill: String,
    message: String,
    #[serde(default)]
    timeout_minutes: Option<u64>,
}

#[async_trait]
impl ToolExecutor for InvokeAgentTool {
    async fn invoke(&self, invocation: ToolInvocation) -> ToolInvocationResult {
        let args: InvokeAgentArgs = match serde_json::from_str(&invocation.arguments) {
            Ok(args) => args,
            Err(err) => return ToolInvocationResult::error(&invocation, format!("invalid arguments: {err}")),
        };
        let Some(session_id) = invocation.session_id.clone() else {
            return ToolInvocationResult::error(&invocation, "invoke_agent requires an active session");
        };
        let timeout_minutes = args.timeout_minutes.unwrap_or(self.default_timeout_minutes);

        match self.coordinator.invoke(args.agent_name, args.skill, args.message, session_id, timeout_minutes).await {
            Ok(task_id) => ToolInvocationResult::ok(&invocation, serde_json::json!({ "taskId": task_id }).to_string()),
            Err(err) => ToolInvocationResult::error(&invocation, err.to_string()),
        }
    }
}

/// Inbound contract on `{statusTopic}` (spec §4.12): a `Working` update
/// relays a non-final progress bubble without touching conversation memory
/// or invoking the LLM; any other state folds into the session as a
/// synthetic user turn and runs the primary loop.
pub async fn handle_task_status_update(update: &AgentTaskStatusUpdate, handles: &RuntimeHandles, coordinator: &Arc<A2ACoordinator>) -> Result<()> {
    if update.state == TaskState::Working {
        let Some(session_id) = coordinator.peek(&update.task_id).await else {
            return Ok(());
        };
        let content = update.detail.clone().unwrap_or_else(|| "working on it...".to_string());
        return handles.publish_progress(&session_id, &update.task_id, content).await;
    }

    let Some((_target, session_id)) = coordinator.take(&update.task_id).await else {
        return Ok(());
    };
    let detail = update.detail.clone().unwrap_or_default();
    let synthetic = format!("[A2A task {} reported {:?}]: {}", update.task_id, update.state, detail);
    let content = handles.run_primary_turn(&session_id, &synthetic).await?;
    handles.publish_reply(&session_id, content, true).await
}

/// Inbound contract: `AgentTaskResult` (spec §4.12). Always persists the raw
/// text to working memory, purging prior same-agent entries first; publishes
/// a truncated preview bubble; injects a synthetic pointer-key turn; runs
/// the primary loop once.
pub async fn handle_task_result(result: &AgentTaskResult, handles: &RuntimeHandles, coordinator: &Arc<A2ACoordinator>) -> Result<()> {
    let Some((target_agent, session_id)) = coordinator.take(&result.task_id).await else {
        warn!(task_id = %result.task_id, "ignoring untracked a2a result");
        return Ok(());
    };

    let namespace = format!("session/{session_id}/a2a/{target_agent}");
    let prefix = format!("{namespace}/");
    for entry in handles.working_memory.list().await? {
        if entry.key.starts_with(&prefix) {
            handles.working_memory.delete(&entry.key).await?;
        }
    }
    let key = format!("{namespace}/{}/result", result.task_id);
    handles
        .working_memory
        .set(key.clone(), result.output.clone(), None, Some("a2a-result".to_string()), vec!["a2a".to_string()])
        .await?;

    const PREVIEW_LEN: usize = 280;
    let preview: String = result.output.chars().take(PREVIEW_LEN).collect();
    let preview = if result.output.chars().count() > PREVIEW_LEN { format!("{preview}...") } else { preview };
    handles.publish_progress(&session_id, &target_agent, preview).await?;

    let synthetic = format!("[A2A task {} from {target_agent} completed]: see working memory key `{key}` for the full result.", result.task_id);
    let content = handles.run_primary_turn(&session_id, &synthetic).await?;
    handles.publish_reply(&session_id, content, true).await
}

/// Inbound contract: `AgentTaskError` (spec §4.12).
pub async fn handle_task_error(error: &AgentTaskError, handles: &RuntimeHandles, coordinator: &Arc<A2ACoordinator>) -> Result<()> {
    let Some((target_agent, session_id)) = coordinator.take(&error.task_id).await else {
        warn!(task_id = %error.task_id, "ignoring untracked a2a error");
        return Ok(());
    };

    let synthetic = format!("[A2A task {} from {target_agent} failed, code={:?}]: {}", error.task_id, error.code, error.message);
    let content = handles.run_primary_turn(&session_id, &synthetic).await?;
    handles.publish_reply(&session_id, content, true).await
}

/// Inbound task handler (server side, spec §4.12): what this agent does
/// when it is the *target* of someone else's `invoke_agent` call. Publishes
/// a `Working` status, runs the user-supplied handler, then publishes
/// exactly one of `AgentTaskResult`/`AgentTaskError`.
#[async_trait]
pub trait AgentTaskHandler: Send + Sync {
    async fn handle(&self, skill: &str, message: &str) -> Result<String>;
}

struct ActiveInboundTask {
    cancel: CancellationToken,
}

/// Tracks inbound tasks this agent is currently executing on behalf of a
/// requester, so `AgentTaskCancel` has something to act on.
#[derive(Default)]
pub struct InboundTaskServer {
    active: Mutex<HashMap<String, ActiveInboundTask>>,
}

impl InboundTaskServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn serve(
        self: &Arc<Self>,
        request: &AgentTaskRequest,
        requester_reply_to: &str,
        handler: &dyn AgentTaskHandler,
        transport: &dyn Transport,
        source: &str,
    ) -> Result<()> {
        let cancel = CancellationToken::new();
        self.active.lock().await.insert(request.task_id.clone(), ActiveInboundTask { cancel: cancel.clone() });

        let working = Envelope::builder("AgentTaskStatusUpdate", source)
            .correlation_id(Uuid::parse_str(&request.task_id).unwrap_or_else(|_| Uuid::new_v4()))
            .json_body(&AgentTaskStatusUpdate { task_id: request.task_id.clone(), state: TaskState::Working, detail: None })?
            .build();
        transport.publish(requester_reply_to, working).await?;

        let outcome = tokio::select! {
            result = handler.handle(&request.skill, &request.message) => result,
            _ = cancel.cancelled() => {
                self.active.lock().await.remove(&request.task_id);
                return Ok(());
            }
        };

        self.active.lock().await.remove(&request.task_id);

        let reply = match outcome {
            Ok(output) => Envelope::builder("AgentTaskResult", source)
                .correlation_id(Uuid::parse_str(&request.task_id).unwrap_or_else(|_| Uuid::new_v4()))
                .json_body(&AgentTaskResult { task_id: request.task_id.clone(), target_agent: source.to_string(), output })?
                .build(),
            Err(err) => Envelope::builder("AgentTaskError", source)
                .correlation_id(Uuid::parse_str(&request.task_id).unwrap_or_else(|_| Uuid::new_v4()))
                .json_body(&AgentTaskError {
                    task_id: request.task_id.clone(),
                    target_agent: source.to_string(),
                    code: TaskErrorCode::ExecutionFailed,
                    message: err.to_string(),
                })?
                .build(),
        };
        transport.publish(requester_reply_to, reply).await
    }

    /// `AgentTaskCancel` handling: cancels a tracked inbound task, or
    /// reports `TaskNotCancelable` for one that either never existed or has
    /// already completed.
    pub async fn cancel(&self, request: &AgentTaskCancel, transport: &dyn Transport, source: &str, reply_topic: &str) -> Result<()> {
        let Some(task) = self.active.lock().await.remove(&request.task_id) else {
            let reply = Envelope::builder("AgentTaskError", source)
                .json_body(&AgentTaskError {
                    task_id: request.task_id.clone(),
                    target_agent: source.to_string(),
                    code: TaskErrorCode::TaskNotCancelable,
                    message: "task is not active on this agent".to_string(),
                })?
                .build();
            return transport.publish(reply_topic, reply).await;
        };
        task.cancel.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rockbot_transport::{DispatchFn, Subscription};
    use std::sync::Mutex as StdMutex;

    use super::*;

    struct RecordingTransport {
        published: StdMutex<Vec<(String, Envelope)>>,
    }

    impl RecordingTransport {
        fn new() -> Self {
            Self { published: StdMutex::new(Vec::new()) }
        }
    }

    #[async_trait::async_trait]
    impl Transport for RecordingTransport {
        async fn publish(&self, topic: &str, envelope: Envelope) -> Result<()> {
            self.published.lock().unwrap().push((topic.to_string(), envelope));
            Ok(())
        }
        async fn subscribe(
            &self,
            _topic_pattern: &str,
            queue_name: &str,
            _prefetch: usize,
            _handler: DispatchFn,
            shutdown: CancellationToken,
        ) -> Result<Subscription> {
            Ok(Subscription { queue_name: queue_name.to_string(), shutdown })
        }
        async fn dead_letters(&self, _topic: &str) -> Vec<Envelope> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn invoke_tracks_pending_and_publishes_request() {
        let transport = Arc::new(RecordingTransport::new());
        let coordinator = A2ACoordinator::new(transport.clone(), "rockbot");

        let task_id = coordinator
            .invoke("other-agent".to_string(), "summarize".to_string(), "do it".to_string(), "s1".to_string(), 5)
            .await
            .unwrap();

        assert_eq!(coordinator.active_count().await, 1);
        let published = transport.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, TOPIC_AGENT_TASK);
        let request: AgentTaskRequest = published[0].1.body_as().unwrap();
        assert_eq!(request.task_id, task_id);
        assert_eq!(published[0].1.destination.as_deref(), Some("other-agent"));
    }

    #[tokio::test]
    async fn timeout_removes_pending_entry_without_a_reply() {
        let transport = Arc::new(RecordingTransport::new());
        let coordinator = A2ACoordinator::new(transport, "rockbot");

        // timeout_minutes=0 means the sleep resolves immediately.
        let _task_id = coordinator
            .invoke("other-agent".to_string(), "summarize".to_string(), "do it".to_string(), "s1".to_string(), 0)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coordinator.active_count().await, 0);
    }

    #[tokio::test]
    async fn take_on_unknown_task_returns_none() {
        let transport = Arc::new(RecordingTransport::new());
        let coordinator = A2ACoordinator::new(transport, "rockbot");
        assert!(coordinator.take("never-invoked").await.is_none());
    }

    struct EchoHandler;

    #[async_trait]
    impl AgentTaskHandler for EchoHandler {
        async fn handle(&self, skill: &str, message: &str) -> Result<String> {
            Ok(format!("{skill}: {message}"))
        }
    }

    #[tokio::test]
    async fn serve_publishes_working_then_result() {
        let transport = RecordingTransport::new();
        let server = InboundTaskServer::new();
        let request = AgentTaskRequest { task_id: Uuid::new_v4().to_string(), skill: "summarize".to_string(), message: "hi".to_string() };

        server.serve(&request, "agent.response.caller", &EchoHandler, &transport, "callee").await.unwrap();

        let published = transport.published.lock().unwrap();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].1.message_type, "AgentTaskStatusUpdate");
        assert_eq!(published[1].1.message_type, "AgentTaskResult");
    }

    #[tokio::test]
    async fn cancel_of_untracked_task_reports_not_cancelable() {
        let transport = RecordingTransport::new();
        let server = InboundTaskServer::new();
        server
            .cancel(&AgentTaskCancel { task_id: "ghost".to_string() }, &transport, "callee", "agent.response.caller")
            .await
            .unwrap();

        let published = transport.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        let error: AgentTaskError = published[0].1.body_as().unwrap();
        assert_eq!(error.code, TaskErrorCode::TaskNotCancelable);
    }
}
