//! Subagent Manager (spec §4.11): spawns a short-lived, restricted-tool loop
//! runner to carry out a delegated task, relaying progress and exactly one
//! terminal result back to the primary session. Grounded on the teacher's
//! background-task spawn pattern in `aigent-runtime::server` generalized
//! from its single hard-coded background job into named, concurrent,
//! cancellable subagent runs with their own scoped tool registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rockbot_exec::{ApprovalMode, ExecutionPolicy, PolicyGate};
use rockbot_llm::{ChatMessage, LlmRouter, Provider};
use rockbot_memory::{FeedbackLog, LongTermMemory, WorkingMemory};
use rockbot_tools::{ToolDescriptor, ToolExecutor, ToolInvocation, ToolInvocationResult, ToolRegistry};
use rockbot_transport::Transport;
use rockbot_types::Envelope;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::loop_runner::{self, LoopConfig};
use crate::messages::{SubagentProgressMessage, SubagentResultMessage};
use crate::primary_turn::RuntimeHandles;

pub const TOPIC_SUBAGENT_PROGRESS: &str = "subagent.progress";
pub const TOPIC_SUBAGENT_RESULT: &str = "subagent.result";

/// Everything a spawned subagent needs to become an independent loop run.
#[derive(Clone)]
pub struct SubagentRuntime {
    pub tool_registry: Arc<ToolRegistry>,
    pub working_memory: Arc<WorkingMemory>,
    pub long_term: Arc<LongTermMemory>,
    pub feedback: Arc<FeedbackLog>,
    pub llm: Arc<LlmRouter>,
    pub primary: Provider,
    pub ollama_model: String,
    pub openrouter_model: String,
    pub loop_config: LoopConfig,
}

struct ActiveSubagent {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct SubagentManager {
    transport: Arc<dyn Transport>,
    source: String,
    max_concurrent: usize,
    runtime: SubagentRuntime,
    active: Mutex<HashMap<String, ActiveSubagent>>,
    /// `taskId` -> the primary session that spawned it, so a later progress
    /// relay (which only carries `taskId`) knows which session to bubble
    /// into. Cleared alongside the `active` entry.
    primary_sessions: Mutex<HashMap<String, String>>,
}

impl SubagentManager {
    pub fn new(transport: Arc<dyn Transport>, source: impl Into<String>, max_concurrent: usize, runtime: SubagentRuntime) -> Self {
        Self {
            transport,
            source: source.into(),
            max_concurrent,
            runtime,
            active: Mutex::new(HashMap::new()),
            primary_sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    pub async fn list_active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Looks up which primary session spawned `task_id`, for relaying a
    /// `SubagentProgressMessage` (which doesn't itself carry the session).
    pub async fn primary_session_id(&self, task_id: &str) -> Option<String> {
        self.primary_sessions.lock().await.get(task_id).cloned()
    }

    /// Spawns a subagent. Rejects with an error string (never drops the
    /// request silently) when `activeCount >= maxConcurrentSubagents`.
    pub async fn spawn(
        self: &Arc<Self>,
        description: String,
        context: Option<String>,
        timeout_minutes: Option<u64>,
        primary_session_id: String,
        allowed_tools: HashSet<String>,
    ) -> Result<String, String> {
        {
            let active = self.active.lock().await;
            if active.len() >= self.max_concurrent {
                return Err(format!(
                    "cannot spawn subagent: {} already active (max {})",
                    active.len(),
                    self.max_concurrent
                ));
            }
        }

        let task_id = Uuid::new_v4().simple().to_string()[..12].to_string();
        let cancel = CancellationToken::new();

        self.primary_sessions.lock().await.insert(task_id.clone(), primary_session_id.clone());

        let manager = self.clone();
        let runtime = self.runtime.clone();
        let transport = self.transport.clone();
        let source = self.source.clone();
        let task_id_for_run = task_id.clone();
        let run_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            let outcome = run_subagent(
                &task_id_for_run,
                description,
                context,
                timeout_minutes,
                &runtime,
                transport.clone(),
                &source,
                run_cancel,
                &allowed_tools,
            )
            .await;

            let (is_success, output, error) = match outcome {
                Ok(text) => (true, text, None),
                Err(err) => (false, String::new(), Some(err.to_string())),
            };

            let envelope = Envelope::builder("SubagentResultMessage", &source)
                .json_body(&SubagentResultMessage {
                    task_id: task_id_for_run.clone(),
                    primary_session_id,
                    is_success,
                    output,
                    error,
                })
                .expect("SubagentResultMessage always serializes");
            if let Err(err) = transport.publish(TOPIC_SUBAGENT_RESULT, envelope.build()).await {
                warn!(task_id = %task_id_for_run, error = %err, "failed to publish subagent result");
            }

            manager.active.lock().await.remove(&task_id_for_run);
            manager.primary_sessions.lock().await.remove(&task_id_for_run);
        });

        self.active.lock().await.insert(task_id.clone(), ActiveSubagent { cancel, handle });
        Ok(task_id)
    }

    /// Cancels the task's token and waits briefly for it to finish
    /// publishing its (failure) result.
    pub async fn cancel(&self, task_id: &str) -> bool {
        let Some(entry) = self.active.lock().await.remove(task_id) else { return false };
        entry.cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), entry.handle).await;
        self.primary_sessions.lock().await.remove(task_id);
        true
    }
}

async fn run_subagent(
    task_id: &str,
    description: String,
    context: Option<String>,
    timeout_minutes: Option<u64>,
    runtime: &SubagentRuntime,
    transport: Arc<dyn Transport>,
    source: &str,
    cancel: CancellationToken,
    allowed_tools: &HashSet<String>,
) -> Result<String> {
    let scoped_registry =
        build_scoped_registry(task_id, &runtime.tool_registry, &runtime.long_term, transport.clone(), source.to_string(), allowed_tools);
    let policy = ExecutionPolicy::new(ApprovalMode::Autonomous);
    let tool_gate = PolicyGate::new(Arc::new(scoped_registry), policy);

    let mut messages = vec![ChatMessage::system(
        "You are a subagent handed a single focused task by a primary agent. \
         Complete it and reply with a concise final result. Use report_progress \
         to narrate meaningful milestones and write_whiteboard to leave notes for \
         the primary agent to read afterward.",
    )];
    if let Some(context) = context {
        messages.push(ChatMessage::system(context));
    }
    messages.push(ChatMessage::user(description));

    let namespace = format!("subagent/{task_id}");

    let run = loop_runner::run_loop(
        &runtime.llm,
        runtime.primary,
        &runtime.ollama_model,
        &runtime.openrouter_model,
        &mut messages,
        &tool_gate,
        &runtime.working_memory,
        &namespace,
        &runtime.feedback,
        task_id,
        &runtime.loop_config,
        cancel.clone(),
    );

    let result = match timeout_minutes {
        Some(minutes) => {
            tokio::select! {
                result = run => result,
                _ = tokio::time::sleep(Duration::from_secs(minutes * 60)) => {
                    cancel.cancel();
                    anyhow::bail!("subagent timed out after {minutes} minute(s)");
                }
            }
        }
        None => run.await,
    };

    Ok(result?.content)
}

fn build_scoped_registry(
    task_id: &str,
    base: &Arc<ToolRegistry>,
    long_term: &Arc<LongTermMemory>,
    transport: Arc<dyn Transport>,
    source: String,
    allowed_tools: &HashSet<String>,
) -> ToolRegistry {
    let registry = ToolRegistry::new();
    // An empty `allowed_tools` means the caller didn't ask for a restriction
    // — fall back to the full base registry. A non-empty set narrows it to
    // exactly the named tools (spec §4.11: "a restricted tool set").
    let descriptors = if allowed_tools.is_empty() { base.descriptors() } else { base.restricted(allowed_tools) };
    for descriptor in descriptors {
        if let Some(executor) = base.executor_for(&descriptor.name) {
            registry.register(descriptor, executor);
        }
    }

    registry.register(
        ToolDescriptor {
            name: "report_progress".to_string(),
            description: "Report a progress update for this subagent task back to the primary agent.".to_string(),
            parameters_schema: r#"{"type":"object","properties":{"content":{"type":"string"}},"required":["content"]}"#.to_string(),
            source: "subagent-manager".to_string(),
        },
        Arc::new(ReportProgressTool { task_id: task_id.to_string(), transport, source }),
    );

    registry.register(
        ToolDescriptor {
            name: "write_whiteboard".to_string(),
            description: "Leave a durable note under this task's whiteboard for the primary agent to read after completion.".to_string(),
            parameters_schema: r#"{"type":"object","properties":{"content":{"type":"string"}},"required":["content"]}"#.to_string(),
            source: "subagent-manager".to_string(),
        },
        Arc::new(WriteWhiteboardTool { task_id: task_id.to_string(), long_term: long_term.clone() }),
    );

    registry
}

/// Category long-term whiteboard entries for one subagent task live under,
/// cleaned up by the primary after it processes the result (spec §4.11).
pub fn whiteboard_category(task_id: &str) -> String {
    format!("subagent-whiteboards/{task_id}")
}

struct ReportProgressTool {
    task_id: String,
    transport: Arc<dyn Transport>,
    source: String,
}

#[async_trait]
impl ToolExecutor for ReportProgressTool {
    async fn invoke(&self, invocation: ToolInvocation) -> ToolInvocationResult {
        #[derive(serde::Deserialize)]
        struct Args {
            content: String,
        }
        let args: Args = match serde_json::from_str(&invocation.arguments) {
            Ok(args) => args,
            Err(err) => return ToolInvocationResult::error(&invocation, format!("invalid arguments: {err}")),
        };

        let envelope = match Envelope::builder("SubagentProgressMessage", &self.source)
            .json_body(&SubagentProgressMessage { task_id: self.task_id.clone(), content: args.content })
        {
            Ok(builder) => builder.build(),
            Err(err) => return ToolInvocationResult::error(&invocation, format!("failed to build progress envelope: {err}")),
        };

        match self.transport.publish(TOPIC_SUBAGENT_PROGRESS, envelope).await {
            Ok(()) => {
                info!(task_id = %self.task_id, "subagent reported progress");
                ToolInvocationResult::ok(&invocation, "progress reported")
            }
            Err(err) => ToolInvocationResult::error(&invocation, format!("failed to publish progress: {err}")),
        }
    }
}

struct WriteWhiteboardTool {
    task_id: String,
    long_term: Arc<LongTermMemory>,
}

#[async_trait]
impl ToolExecutor for WriteWhiteboardTool {
    async fn invoke(&self, invocation: ToolInvocation) -> ToolInvocationResult {
        #[derive(serde::Deserialize)]
        struct Args {
            content: String,
        }
        let args: Args = match serde_json::from_str(&invocation.arguments) {
            Ok(args) => args,
            Err(err) => return ToolInvocationResult::error(&invocation, format!("invalid arguments: {err}")),
        };
        match self
            .long_term
            .save(args.content, Some(whiteboard_category(&self.task_id)), Vec::new(), None)
            .await
        {
            Ok(_) => ToolInvocationResult::ok(&invocation, "noted"),
            Err(err) => ToolInvocationResult::error(&invocation, format!("failed to save note: {err}")),
        }
    }
}

/// Primary-loop facing tool that delegates a task to a fresh subagent run
/// (spec §4.11). The LLM calls this from the primary session; the actual
/// work happens out of band and folds back in via `handle_subagent_result`.
pub struct SpawnSubagentTool {
    pub manager: Arc<SubagentManager>,
    pub default_timeout_minutes: u64,
}

#[derive(Deserialize)]
struct SpawnSubagentArgs {
    description: String,
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    timeout_minutes: Option<u64>,
    #[serde(default)]
    allowed_tools: Vec<String>,
}

#[async_trait]
impl ToolExecutor for SpawnSubagentTool {
    async fn invoke(&self, invocation: ToolInvocation) -> ToolInvocationResult {
        let args: SpawnSubagentArgs = match serde_json::from_str(&invocation.arguments) {
            Ok(args) => args,
            Err(err) => return ToolInvocationResult::error(&invocation, format!("invalid arguments: {err}")),
        };
        let Some(session_id) = invocation.session_id.clone() else {
            return ToolInvocationResult::error(&invocation, "spawn_subagent requires an active session");
        };
        let timeout_minutes = Some(args.timeout_minutes.unwrap_or(self.default_timeout_minutes));
        let allowed_tools: HashSet<String> = args.allowed_tools.into_iter().collect();

        match self
            .manager
            .spawn(args.description, args.context, timeout_minutes, session_id, allowed_tools)
            .await
        {
            Ok(task_id) => ToolInvocationResult::ok(&invocation, serde_json::json!({ "taskId": task_id }).to_string()),
            Err(err) => ToolInvocationResult::error(&invocation, err),
        }
    }
}

/// Primary-side progress relay (spec §4.11): a non-final `AgentReply` under
/// `subagent-{taskId}`, published verbatim with no LLM re-invocation and no
/// conversation append.
pub async fn handle_subagent_progress(message: &SubagentProgressMessage, primary_session_id: &str, handles: &RuntimeHandles) -> Result<()> {
    handles
        .publish_progress(primary_session_id, &format!("subagent-{}", message.task_id), message.content.clone())
        .await
}

/// Primary-side result folding (spec §4.11): injects a synthetic user turn
/// pointing at the outcome, runs the primary loop once, publishes the final
/// reply, then deletes any whiteboard notes the subagent left behind.
pub async fn handle_subagent_result(message: &SubagentResultMessage, handles: &RuntimeHandles, long_term: &LongTermMemory) -> Result<()> {
    let synthetic = if message.is_success {
        format!("[Subagent task {} completed]: {}", message.task_id, message.output)
    } else {
        format!(
            "[Subagent task {} failed]: {}",
            message.task_id,
            message.error.as_deref().unwrap_or("no error detail was reported")
        )
    };

    let content = handles.run_primary_turn(&message.primary_session_id, &synthetic).await?;
    handles.publish_reply(&message.primary_session_id, content, true).await?;

    let category = whiteboard_category(&message.task_id);
    for entry in long_term.search(&rockbot_memory::SearchCriteria { category_prefix: Some(category), ..Default::default() }).await? {
        long_term.delete(entry.id).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use rockbot_memory::Bm25Params;
    use rockbot_transport::{DispatchFn, Subscription};
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    use super::*;

    struct RecordingTransport {
        published: StdMutex<Vec<Envelope>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn publish(&self, _topic: &str, envelope: Envelope) -> Result<()> {
            self.published.lock().unwrap().push(envelope);
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

    fn runtime(dir: &std::path::Path) -> SubagentRuntime {
        SubagentRuntime {
            tool_registry: Arc::new(ToolRegistry::new()),
            working_memory: Arc::new(
                WorkingMemory::open(dir.join("working"), dir.join("working.redb"), 3600, 1000, 20, Bm25Params::default()).unwrap(),
            ),
            long_term: Arc::new(LongTermMemory::open(dir.join("memory"), dir.join("memory.redb"), 20, Bm25Params::default()).unwrap()),
            feedback: Arc::new(FeedbackLog::new(dir.join("feedback"))),
            llm: Arc::new(LlmRouter::default()),
            primary: Provider::Ollama,
            ollama_model: "llama3".to_string(),
            openrouter_model: "openrouter/model".to_string(),
            loop_config: LoopConfig::default(),
        }
    }

    #[tokio::test]
    async fn spawn_rejects_once_at_capacity() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(RecordingTransport { published: StdMutex::new(Vec::new()) });
        let manager = Arc::new(SubagentManager::new(transport, "rockbot", 0, runtime(dir.path())));

        let result = manager.spawn("do something".to_string(), None, None, "primary-1".to_string(), HashSet::new()).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("already active"));
    }

    #[tokio::test]
    async fn cancel_of_unknown_task_returns_false() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(RecordingTransport { published: StdMutex::new(Vec::new()) });
        let manager = SubagentManager::new(transport, "rockbot", 4, runtime(dir.path()));
        assert!(!manager.cancel("never-spawned").await);
    }

    #[test]
    fn whiteboard_category_is_namespaced_by_task() {
        assert_eq!(whiteboard_category("abc123"), "subagent-whiteboards/abc123");
    }

    struct EchoExecutor;

    #[async_trait]
    impl ToolExecutor for EchoExecutor {
        async fn invoke(&self, invocation: ToolInvocation) -> ToolInvocationResult {
            ToolInvocationResult::ok(&invocation, invocation.arguments.clone())
        }
    }

    fn descriptor(name: &str) -> ToolDescriptor {
        ToolDescriptor { name: name.to_string(), description: name.to_string(), parameters_schema: "{}".to_string(), source: "test".to_string() }
    }

    #[test]
    fn scoped_registry_honors_allowed_tools() {
        let dir = tempdir().unwrap();
        let base = Arc::new(ToolRegistry::new());
        base.register(descriptor("read_file"), Arc::new(EchoExecutor));
        base.register(descriptor("send_email"), Arc::new(EchoExecutor));
        let transport = Arc::new(RecordingTransport { published: StdMutex::new(Vec::new()) });
        let long_term = Arc::new(LongTermMemory::open(dir.path().join("memory"), dir.path().join("memory.redb"), 20, Bm25Params::default()).unwrap());

        let allowed = HashSet::from(["read_file".to_string()]);
        let scoped = build_scoped_registry("abc123", &base, &long_term, transport, "rockbot".to_string(), &allowed);

        let names = scoped.names();
        assert!(names.contains("read_file"));
        assert!(!names.contains("send_email"));
        assert!(names.contains("report_progress"));
        assert!(names.contains("write_whiteboard"));
    }

    #[test]
    fn scoped_registry_is_unrestricted_when_allowed_tools_is_empty() {
        let base = Arc::new(ToolRegistry::new());
        base.register(descriptor("read_file"), Arc::new(EchoExecutor));
        base.register(descriptor("send_email"), Arc::new(EchoExecutor));
        let transport = Arc::new(RecordingTransport { published: StdMutex::new(Vec::new()) });
        let dir = tempdir().unwrap();

        let scoped = build_scoped_registry(
            "abc123",
            &base,
            &Arc::new(LongTermMemory::open(dir.path().join("memory"), dir.path().join("memory.redb"), 20, Bm25Params::default()).unwrap()),
            transport,
            "rockbot".to_string(),
            &HashSet::new(),
        );

        let names = scoped.names();
        assert!(names.contains("read_file"));
        assert!(names.contains("send_email"));
    }

    #[tokio::test]
    async fn cancel_clears_the_primary_session_lookup() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(RecordingTransport { published: StdMutex::new(Vec::new()) });
        let manager = Arc::new(SubagentManager::new(transport, "rockbot", 4, runtime(dir.path())));

        let task_id = manager
            .spawn("do something slow".to_string(), None, None, "primary-1".to_string(), HashSet::new())
            .await
            .unwrap();
        assert_eq!(manager.primary_session_id(&task_id).await.as_deref(), Some("primary-1"));

        manager.cancel(&task_id).await;
        assert!(manager.primary_session_id(&task_id).await.is_none());
    }

    #[tokio::test]
    async fn progress_relay_publishes_under_task_scoped_topic_without_touching_memory() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(RecordingTransport { published: StdMutex::new(Vec::new()) });
        let working_memory = Arc::new(
            WorkingMemory::open(dir.join("working"), dir.join("working.redb"), 3600, 1000, 20, Bm25Params::default()).unwrap(),
        );
        let handles = crate::primary_turn::RuntimeHandles {
            agent_name: "rockbot".to_string(),
            profile: Arc::new(rockbot_profile::AgentProfile {
                soul: Default::default(),
                directives: Default::default(),
                style: None,
                memory_rules: None,
            }),
            timezone: chrono_tz::UTC,
            conversation: Arc::new(rockbot_memory::ConversationMemory::new(40, 3600)),
            long_term: Arc::new(LongTermMemory::open(dir.join("memory"), dir.join("memory.redb"), 20, Bm25Params::default()).unwrap()),
            recall_tracker: Arc::new(rockbot_memory::RecallSessionTracker::default()),
            skills: Arc::new(rockbot_memory::SkillStore::open(dir.join("skills"), dir.join("skills.redb"), Bm25Params::default()).unwrap()),
            skill_tracker: Arc::new(rockbot_memory::SkillSessionTracker::default()),
            working_memory: working_memory.clone(),
            context_config: crate::context_builder::ContextBuilderConfig {
                recall_top_k: 5,
                recall_score_floor: 0.1,
                skill_top_k: 3,
                skill_score_floor: 0.1,
                max_turns_per_session: 40,
            },
            tool_gate: Arc::new(PolicyGate::new(Arc::new(ToolRegistry::new()), ExecutionPolicy::new(ApprovalMode::Autonomous))),
            llm: Arc::new(LlmRouter::default()),
            primary_provider: Provider::Ollama,
            ollama_model: "llama3".to_string(),
            openrouter_model: "openrouter/model".to_string(),
            loop_config: LoopConfig::default(),
            work_serializer: crate::work_serializer::WorkSerializer::new(CancellationToken::new()),
            transport: transport.clone(),
            user_response_topic: "user.response".to_string(),
        };

        let message = SubagentProgressMessage { task_id: "abc123".to_string(), content: "halfway there".to_string() };
        handle_subagent_progress(&message, "primary-1", &handles).await.unwrap();

        let published = transport.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].message_type, "AgentReply");
        let reply: crate::messages::AgentReply = published[0].body_as().unwrap();
        assert!(!reply.is_final);
        assert_eq!(reply.content, "halfway there");
        assert!(working_memory.list().await.unwrap().is_empty());
    }
}
