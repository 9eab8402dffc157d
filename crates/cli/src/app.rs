//! Builds every collaborator named in the runtime's component table and
//! wires them onto one `Pipeline` + `InProcessBus` pair. Grounded on the
//! teacher's `server.rs` startup sequence (load config, load profile, stand
//! up memory stores, arm the scheduler, announce presence) generalized from
//! a single hard-coded daemon into the full multi-component graph this
//! workspace's crates now expose.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Timelike;
use rockbot_config::AppConfig;
use rockbot_exec::{ApprovalMode, ExecutionPolicy, PolicyGate};
use rockbot_llm::{LlmRouter, Provider};
use rockbot_memory::{Bm25Params, ConversationMemory, FeedbackLog, LongTermMemory, RecallSessionTracker, SkillSessionTracker, SkillStore, WorkingMemory};
use rockbot_pipeline::{LoggingMiddleware, MessageContext, Pipeline, RetryCountMiddleware};
use rockbot_profile::AgentProfile;
use rockbot_runtime::{
    a2a, discovery::TOPIC_DISCOVERY_ANNOUNCE, scheduler::TOPIC_SCHEDULED_TASK, subagent, A2ACoordinator, ContextBuilderConfig,
    Discovery, DreamConfig, DreamDriver, InboundTaskServer, LoopConfig, Scheduler, SubagentManager, SubagentRuntime,
    UserActivityMonitor, WorkSerializer,
};
use rockbot_runtime::messages::{
    AgentCard, AgentTaskCancel, AgentTaskError, AgentTaskRequest, AgentTaskResult, AgentTaskStatusUpdate, ScheduledTaskMessage,
    SubagentProgressMessage, SubagentResultMessage, UserMessage,
};
use rockbot_runtime::primary_turn::RuntimeHandles;
use rockbot_runtime::{AgentTaskHandler, InvokeAgentTool, SpawnSubagentTool};
use rockbot_tools::{ToolDescriptor, ToolRegistry};
use rockbot_transport::{InProcessBus, Transport};
use rockbot_types::{AgentIdentity, Envelope};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

pub const TOPIC_USER_REQUEST: &str = "user.request";

/// Every standing collaborator a running agent needs, plus the shutdown
/// token that tears the whole thing down.
pub struct App {
    pub config: AppConfig,
    pub transport: Arc<dyn Transport>,
    pub pipeline: Arc<Pipeline>,
    pub handles: Arc<RuntimeHandles>,
    pub scheduler: Arc<Scheduler>,
    pub subagents: Arc<SubagentManager>,
    pub a2a: Arc<A2ACoordinator>,
    pub discovery: Arc<Discovery>,
    pub activity: Arc<UserActivityMonitor>,
    pub dream: Arc<DreamDriver>,
    pub shutdown: CancellationToken,
}

fn workspace_dir(config: &AppConfig) -> PathBuf {
    PathBuf::from(&config.agent.workspace_path)
}

fn load_profile(base: &Path) -> Result<AgentProfile> {
    AgentProfile::load_from(base)
        .with_context(|| format!("loading agent profile from {} — expected at least soul.md and directives.md", base.display()))
}

/// Builds the full collaborator graph. Does not start any background
/// subscriptions — call `bind::wire` afterward to hook the pipeline and
/// inbound A2A/discovery listeners onto the transport.
pub async fn build(config: AppConfig) -> Result<App> {
    let workspace = workspace_dir(&config);
    tokio::fs::create_dir_all(&workspace).await.ok();

    let profile = load_profile(config.profile_base())?;
    let bm25 = Bm25Params { k1: config.memory.bm25_k1, b: config.memory.bm25_b };

    let conversation = Arc::new(ConversationMemory::new(config.memory.max_turns_per_session, config.memory.session_idle_timeout_secs));
    let long_term = Arc::new(LongTermMemory::open(
        workspace.join("memory"),
        workspace.join("memory.redb"),
        config.memory.long_term_max_results,
        bm25,
    )?);
    let skills = Arc::new(SkillStore::open(workspace.join("skills"), workspace.join("skills.redb"), bm25)?);
    let skill_tracker = Arc::new(SkillSessionTracker::default());
    let recall_tracker = Arc::new(RecallSessionTracker::default());
    let working_memory = Arc::new(WorkingMemory::open(
        workspace.join("working-memory"),
        workspace.join("working-memory.redb"),
        config.memory.working_memory_default_ttl_secs as i64,
        config.memory.working_memory_max_entries_per_namespace,
        config.memory.long_term_max_results,
        bm25,
    )?);
    let feedback = Arc::new(FeedbackLog::new(workspace.join("feedback")));

    let tool_registry = Arc::new(ToolRegistry::new());
    let approval_mode: ApprovalMode = config.safety.approval_mode.parse().unwrap_or_else(|err| {
        warn!(error = %err, "unrecognized approval mode, falling back to balanced");
        ApprovalMode::Balanced
    });
    let tool_gate = Arc::new(PolicyGate::new(tool_registry.clone(), ExecutionPolicy::new(approval_mode)));

    let llm = Arc::new(LlmRouter::default());
    let primary_provider = if config.llm.provider.eq_ignore_ascii_case("openrouter") { Provider::OpenRouter } else { Provider::Ollama };

    let loop_config = LoopConfig {
        tool_result_chunk_threshold: config.memory.tool_result_chunk_threshold,
        ..LoopConfig::default()
    };
    let context_config = ContextBuilderConfig {
        recall_top_k: config.memory.context_recall_top_k,
        recall_score_floor: config.memory.context_recall_score_floor,
        skill_top_k: config.memory.context_skill_top_k,
        skill_score_floor: config.memory.context_skill_score_floor,
        max_turns_per_session: config.memory.max_turns_per_session,
    };

    let shutdown = CancellationToken::new();
    let work_serializer = WorkSerializer::new(shutdown.child_token());
    let transport: Arc<dyn Transport> = Arc::new(InProcessBus::new());

    let handles = Arc::new(RuntimeHandles {
        agent_name: config.agent.name.clone(),
        profile: Arc::new(profile),
        timezone: config.scheduler.timezone.parse().unwrap_or_else(|_| {
            warn!(timezone = %config.scheduler.timezone, "unrecognized agent timezone, falling back to UTC");
            chrono_tz::UTC
        }),
        conversation,
        long_term: long_term.clone(),
        recall_tracker,
        skills,
        skill_tracker,
        working_memory: working_memory.clone(),
        feedback: feedback.clone(),
        context_config,
        tool_gate,
        llm: llm.clone(),
        primary_provider,
        ollama_model: config.llm.model.clone(),
        openrouter_model: config.llm.model.clone(),
        loop_config: loop_config.clone(),
        work_serializer,
        transport: transport.clone(),
        user_response_topic: "user.response".to_string(),
    });

    let scheduler = Arc::new(Scheduler::new(
        transport.clone(),
        config.agent.name.clone(),
        &config.scheduler.timezone,
        workspace.join("scheduled-tasks.json"),
        shutdown.child_token(),
    ));
    scheduler.load().await.context("loading persisted scheduled tasks")?;

    let subagent_runtime = SubagentRuntime {
        tool_registry: tool_registry.clone(),
        working_memory,
        long_term,
        feedback: handles.feedback.clone(),
        llm,
        primary: primary_provider,
        ollama_model: config.llm.model.clone(),
        openrouter_model: config.llm.model.clone(),
        loop_config,
    };
    let subagents = Arc::new(SubagentManager::new(
        transport.clone(),
        config.agent.name.clone(),
        config.coordination.max_concurrent_subagents,
        subagent_runtime,
    ));

    let a2a = A2ACoordinator::new(transport.clone(), config.agent.name.clone());
    let discovery = Arc::new(Discovery::new());
    discovery
        .seed_well_known(
            config
                .discovery
                .well_known_agents
                .iter()
                .map(|a| AgentCard { agent_name: a.agent_name.clone(), skills: a.skills.clone(), description: a.description.clone() })
                .collect(),
        )
        .await;
    let activity = Arc::new(UserActivityMonitor::new());
    let dream = Arc::new(DreamDriver::new(
        handles.long_term.clone(),
        feedback,
        handles.work_serializer.clone(),
        handles.llm.clone(),
        primary_provider,
        config.llm.model.clone(),
        config.llm.model.clone(),
        DreamConfig { max_entries_considered: 200, min_interval_secs: config.memory.auto_sleep_minutes as i64 * 60 },
    ));

    tool_registry.register(
        ToolDescriptor {
            name: "invoke_agent".to_string(),
            description: "Delegate a skill to a peer agent over A2A and await its reply asynchronously.".to_string(),
            parameters_schema: r#"{"type":"object","properties":{"agent_name":{"type":"string"},"skill":{"type":"string"},"message":{"type":"string"},"timeout_minutes":{"type":"integer"}},"required":["agent_name","skill","message"]}"#.to_string(),
            source: "a2a-coordinator".to_string(),
        },
        Arc::new(InvokeAgentTool { coordinator: a2a.clone(), default_timeout_minutes: config.coordination.a2a_default_timeout_minutes }),
    );
    tool_registry.register(
        ToolDescriptor {
            name: "spawn_subagent".to_string(),
            description: "Delegate a focused task to a short-lived subagent; its progress and result fold back into this session.".to_string(),
            parameters_schema: r#"{"type":"object","properties":{"description":{"type":"string"},"context":{"type":"string"},"timeout_minutes":{"type":"integer"},"allowed_tools":{"type":"array","items":{"type":"string"}}},"required":["description"]}"#.to_string(),
            source: "subagent-manager".to_string(),
        },
        Arc::new(SpawnSubagentTool { manager: subagents.clone(), default_timeout_minutes: config.coordination.subagent_default_timeout_minutes }),
    );

    let profile_base = config.profile_base().to_path_buf();
    let pipeline = Arc::new(build_pipeline(handles.clone(), subagents.clone(), a2a.clone(), discovery.clone(), activity.clone(), profile_base));

    Ok(App { config, transport, pipeline, handles, scheduler, subagents, a2a, discovery, activity, dream, shutdown })
}

fn build_pipeline(
    handles: Arc<RuntimeHandles>,
    subagents: Arc<SubagentManager>,
    a2a: Arc<A2ACoordinator>,
    discovery: Arc<Discovery>,
    activity: Arc<UserActivityMonitor>,
    profile_base: PathBuf,
) -> Pipeline {
    let h = handles.clone();
    let a = activity.clone();
    let user_handler = move |payload: UserMessage, _ctx: &mut MessageContext| {
        let handles = h.clone();
        a.touch();
        async move { rockbot_runtime::primary_turn::handle_user_message(&payload, &handles).await }
    };

    let h = handles.clone();
    let pb = profile_base.clone();
    let scheduled_handler = move |payload: ScheduledTaskMessage, _ctx: &mut MessageContext| {
        let handles = h.clone();
        let profile_base = pb.clone();
        async move { run_scheduled_task(&payload, &handles, &profile_base).await }
    };

    let h = handles.clone();
    let sm = subagents.clone();
    let progress_handler = move |payload: SubagentProgressMessage, _ctx: &mut MessageContext| {
        let handles = h.clone();
        let subagents = sm.clone();
        async move {
            let Some(primary_session_id) = subagents.primary_session_id(&payload.task_id).await else {
                return Ok(());
            };
            subagent::handle_subagent_progress(&payload, &primary_session_id, &handles).await
        }
    };

    let h = handles.clone();
    let result_handler = move |payload: SubagentResultMessage, _ctx: &mut MessageContext| {
        let handles = h.clone();
        async move { subagent::handle_subagent_result(&payload, &handles, &handles.long_term).await }
    };

    let h = handles.clone();
    let co = a2a.clone();
    let status_handler = move |payload: AgentTaskStatusUpdate, _ctx: &mut MessageContext| {
        let handles = h.clone();
        let coordinator = co.clone();
        async move { a2a::handle_task_status_update(&payload, &handles, &coordinator).await }
    };

    let h = handles.clone();
    let co = a2a.clone();
    let result2_handler = move |payload: AgentTaskResult, _ctx: &mut MessageContext| {
        let handles = h.clone();
        let coordinator = co.clone();
        async move { a2a::handle_task_result(&payload, &handles, &coordinator).await }
    };

    let h = handles.clone();
    let co = a2a.clone();
    let error_handler = move |payload: AgentTaskError, _ctx: &mut MessageContext| {
        let handles = h.clone();
        let coordinator = co.clone();
        async move { a2a::handle_task_error(&payload, &handles, &coordinator).await }
    };

    let d = discovery.clone();
    let discovery_handler = move |payload: AgentCard, _ctx: &mut MessageContext| {
        let discovery = d.clone();
        async move {
            discovery.upsert(payload).await;
            Ok(())
        }
    };

    Pipeline::builder()
        .with_middleware(LoggingMiddleware)
        .with_middleware(RetryCountMiddleware::new(5))
        .with_handler::<UserMessage, _>("UserMessage", user_handler)
        .with_handler::<ScheduledTaskMessage, _>("ScheduledTaskMessage", scheduled_handler)
        .with_handler::<SubagentProgressMessage, _>("SubagentProgressMessage", progress_handler)
        .with_handler::<SubagentResultMessage, _>("SubagentResultMessage", result_handler)
        .with_handler::<AgentTaskStatusUpdate, _>("AgentTaskStatusUpdate", status_handler)
        .with_handler::<AgentTaskResult, _>("AgentTaskResult", result2_handler)
        .with_handler::<AgentTaskError, _>("AgentTaskError", error_handler)
        .with_handler::<AgentCard, _>("AgentCard", discovery_handler)
        .build()
}

async fn run_scheduled_task(message: &ScheduledTaskMessage, handles: &RuntimeHandles, profile_base: &Path) -> Result<()> {
    use rockbot_runtime::context_builder::ContextBuilder;

    let builder = ContextBuilder {
        agent_name: &handles.agent_name,
        profile: &handles.profile,
        timezone: handles.timezone,
        conversation: &handles.conversation,
        long_term: &handles.long_term,
        recall_tracker: &handles.recall_tracker,
        skills: &handles.skills,
        skill_tracker: &handles.skill_tracker,
        working_memory: &handles.working_memory,
        config: handles.context_config.clone(),
    };

    rockbot_runtime::handle_scheduled_task(
        message,
        &builder,
        profile_base,
        &handles.work_serializer,
        &handles.llm,
        handles.primary_provider,
        &handles.ollama_model,
        &handles.openrouter_model,
        &handles.tool_gate,
        &handles.working_memory,
        &handles.feedback,
        &handles.loop_config,
        handles.transport.as_ref(),
        &handles.agent_name,
        &handles.user_response_topic,
    )
    .await
}

/// Minimal local implementation of the inbound A2A contract (spec §4.12):
/// folds a request straight into a one-off primary turn under a task-scoped
/// session id, the same shape `run_primary_turn` already exposes.
pub struct PrimaryLoopTaskHandler {
    pub handles: Arc<RuntimeHandles>,
}

#[async_trait::async_trait]
impl AgentTaskHandler for PrimaryLoopTaskHandler {
    async fn handle(&self, skill: &str, message: &str) -> Result<String> {
        let session_id = format!("a2a-inbound/{skill}/{}", Uuid::new_v4());
        self.handles.run_primary_turn(&session_id, message).await
    }
}

/// Subscribes the transport to every inbound topic this agent serves
/// (pipeline dispatch, inbound A2A task requests/cancellations, discovery
/// announces) and fires the one outbound discovery announce. Returns once
/// every subscription is live; subscriptions themselves run until
/// `app.shutdown` is cancelled.
pub async fn wire(app: &App, skills: Vec<String>, description: String) -> Result<()> {
    let identity = AgentIdentity::new(app.config.agent.name.clone());
    let dispatch = bind_pipeline(app.pipeline.clone(), identity);
    app.transport
        .subscribe(TOPIC_USER_REQUEST, "rockbot.user-request", app.config.transport.prefetch, dispatch.clone(), app.shutdown.child_token())
        .await?;
    app.transport
        .subscribe(TOPIC_SCHEDULED_TASK, "rockbot.scheduled", app.config.transport.prefetch, dispatch.clone(), app.shutdown.child_token())
        .await?;
    app.transport
        .subscribe(subagent::TOPIC_SUBAGENT_PROGRESS, "rockbot.subagent-progress", app.config.transport.prefetch, dispatch.clone(), app.shutdown.child_token())
        .await?;
    app.transport
        .subscribe(subagent::TOPIC_SUBAGENT_RESULT, "rockbot.subagent-result", app.config.transport.prefetch, dispatch.clone(), app.shutdown.child_token())
        .await?;
    app.transport
        .subscribe(&a2a::response_topic(&app.config.agent.name), "rockbot.a2a-response", app.config.transport.prefetch, dispatch.clone(), app.shutdown.child_token())
        .await?;
    app.transport
        .subscribe(TOPIC_DISCOVERY_ANNOUNCE, "rockbot.discovery", app.config.transport.prefetch, dispatch, app.shutdown.child_token())
        .await?;

    let inbound = InboundTaskServer::new();
    let handler: Arc<dyn AgentTaskHandler> = Arc::new(PrimaryLoopTaskHandler { handles: app.handles.clone() });
    let transport = app.transport.clone();
    let source = app.config.agent.name.clone();
    let inbound_for_requests = inbound.clone();
    let request_handler: rockbot_transport::DispatchFn = Arc::new(move |envelope: Envelope, _ct| {
        let inbound = inbound_for_requests.clone();
        let handler = handler.clone();
        let transport = transport.clone();
        let source = source.clone();
        Box::pin(async move {
            if envelope.destination.as_deref() != Some(source.as_str()) {
                return rockbot_types::DispatchOutcome::Ack;
            }
            let Ok(request) = envelope.body_as::<AgentTaskRequest>() else {
                return rockbot_types::DispatchOutcome::DeadLetter { reason: "malformed AgentTaskRequest".to_string() };
            };
            let Some(reply_to) = envelope.reply_to.clone() else {
                return rockbot_types::DispatchOutcome::DeadLetter { reason: "AgentTaskRequest missing replyTo".to_string() };
            };
            tokio::spawn(async move {
                if let Err(err) = inbound.serve(&request, &reply_to, handler.as_ref(), transport.as_ref(), &source).await {
                    warn!(error = %err, task_id = %request.task_id, "inbound A2A task failed");
                }
            });
            rockbot_types::DispatchOutcome::Ack
        })
    });
    app.transport
        .subscribe(a2a::TOPIC_AGENT_TASK, "rockbot.a2a-task", app.config.transport.prefetch, request_handler, app.shutdown.child_token())
        .await?;

    let transport = app.transport.clone();
    let source = app.config.agent.name.clone();
    let cancel_handler: rockbot_transport::DispatchFn = Arc::new(move |envelope: Envelope, _ct| {
        let inbound = inbound.clone();
        let transport = transport.clone();
        let source = source.clone();
        Box::pin(async move {
            let Ok(request) = envelope.body_as::<AgentTaskCancel>() else {
                return rockbot_types::DispatchOutcome::DeadLetter { reason: "malformed AgentTaskCancel".to_string() };
            };
            let Some(reply_to) = envelope.reply_to.clone() else {
                return rockbot_types::DispatchOutcome::Ack;
            };
            match inbound.cancel(&request, transport.as_ref(), &source, &reply_to).await {
                Ok(()) => rockbot_types::DispatchOutcome::Ack,
                Err(err) => {
                    warn!(error = %err, "failed to process AgentTaskCancel");
                    rockbot_types::DispatchOutcome::Retry
                }
            }
        })
    });
    app.transport
        .subscribe(a2a::TOPIC_AGENT_TASK_CANCEL, "rockbot.a2a-cancel", app.config.transport.prefetch, cancel_handler, app.shutdown.child_token())
        .await?;

    app.discovery
        .announce(app.transport.as_ref(), &app.config.agent.name, &AgentCard { agent_name: app.config.agent.name.clone(), skills, description })
        .await?;

    spawn_dream_driver(app);

    Ok(())
}

/// Background Dream Driver poll, grounded on the teacher's `server/mod.rs`
/// "Task A" passive-distillation loop: wake on a fixed poll interval rather
/// than a precise timer, and only actually attempt a pass once the user has
/// been idle long enough and the agent's configured night-sleep window has
/// started. `DreamDriver::run` itself is idempotent against both the work
/// serializer and its own minimum-interval guard, so an extra wakeup here is
/// harmless.
fn spawn_dream_driver(app: &App) {
    const POLL_INTERVAL_SECS: u64 = 5 * 60;
    let idle_trigger = chrono::Duration::minutes(app.config.memory.auto_sleep_minutes as i64);
    let night_start = app.config.memory.night_sleep_start_hour;
    let night_end = app.config.memory.night_sleep_end_hour;
    let timezone = app.handles.timezone;
    let dream = app.dream.clone();
    let activity = app.activity.clone();
    let shutdown = app.shutdown.child_token();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(POLL_INTERVAL_SECS)) => {}
                _ = shutdown.cancelled() => break,
            }

            if activity.idle_for() < idle_trigger {
                continue;
            }
            if !in_night_window(chrono::Utc::now().with_timezone(&timezone).hour(), night_start, night_end) {
                continue;
            }

            match dream.run().await {
                Ok(outcome) if outcome.ran => {
                    tracing::info!(merged = outcome.merged_groups, deleted = outcome.deleted, "dream consolidation pass complete");
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(error = %err, "dream consolidation pass failed"),
            }
        }
    });
}

/// Night-sleep window check, wrapping past midnight when `start > end`
/// (e.g. the default `22..6`).
fn in_night_window(hour: u32, start: u8, end: u8) -> bool {
    let (start, end) = (start as u32, end as u32);
    if start <= end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

/// Bridges `Pipeline::dispatch`'s `Result<DispatchOutcome>` into the bare
/// `DispatchOutcome`-returning closure `Transport::subscribe` requires.
/// A dispatch error only ever surfaces here on cancellation (the type
/// registry already folds handler errors into `Retry`/`DeadLetter`), so the
/// fallback simply redelivers.
pub fn bind_pipeline(pipeline: Arc<Pipeline>, identity: AgentIdentity) -> rockbot_transport::DispatchFn {
    Arc::new(move |envelope, cancellation| {
        let pipeline = pipeline.clone();
        let identity = identity.clone();
        Box::pin(async move {
            match pipeline.dispatch(envelope, identity, cancellation).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(error = %err, "pipeline dispatch did not complete");
                    rockbot_types::DispatchOutcome::Retry
                }
            }
        })
    })
}

