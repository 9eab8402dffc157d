//! Bundles the collaborators a primary (user-facing) session turn needs —
//! context assembly, the user work-serializer slot, the loop runner, and
//! conversation persistence — behind one call so every entry point that
//! re-enters the primary loop (a plain user message, a folded-in subagent
//! result, a folded-in A2A result/error) drives it identically. Spec §2
//! calls this out explicitly: "Scheduled ticks and subagent results re-enter
//! the pipeline as synthetic messages, giving one uniform dispatch path."
//!
//! New to this workspace — the teacher's single-process TUI loop never had
//! more than one re-entry point into `respond_and_remember_stream`, so it
//! never needed this bundling; the shape here generalizes that call's
//! argument list into an owned, `Arc`-cloneable handle every handler in this
//! crate can hold.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use chrono_tz::Tz;
use rockbot_exec::PolicyGate;
use rockbot_llm::{ChatMessage, LlmRouter, Provider};
use rockbot_memory::{
    ConversationMemory, ConversationRole, ConversationTurn, FeedbackLog, LongTermMemory, RecallSessionTracker, SkillSessionTracker, SkillStore,
    WorkingMemory,
};
use rockbot_profile::AgentProfile;
use rockbot_transport::Transport;
use rockbot_types::Envelope;

use crate::context_builder::{ContextBuilder, ContextBuilderConfig};
use crate::loop_runner::{self, LoopConfig};
use crate::messages::AgentReply;
use crate::work_serializer::WorkSerializer;

/// Every primary-turn collaborator, owned so a handler can hold one `Arc`
/// rather than thread a dozen parameters through the pipeline's service map.
pub struct RuntimeHandles {
    pub agent_name: String,
    pub profile: Arc<AgentProfile>,
    pub timezone: Tz,
    pub conversation: Arc<ConversationMemory>,
    pub long_term: Arc<LongTermMemory>,
    pub recall_tracker: Arc<RecallSessionTracker>,
    pub skills: Arc<SkillStore>,
    pub skill_tracker: Arc<SkillSessionTracker>,
    pub working_memory: Arc<WorkingMemory>,
    pub feedback: Arc<FeedbackLog>,
    pub context_config: ContextBuilderConfig,
    pub tool_gate: Arc<PolicyGate>,
    pub llm: Arc<LlmRouter>,
    pub primary_provider: Provider,
    pub ollama_model: String,
    pub openrouter_model: String,
    pub loop_config: LoopConfig,
    pub work_serializer: Arc<WorkSerializer>,
    pub transport: Arc<dyn Transport>,
    pub user_response_topic: String,
}

impl RuntimeHandles {
    /// Runs one full primary turn: builds context from current history plus
    /// `latest_content`, acquires the user slot (preempting any background
    /// loop holding it), runs the tool-calling loop, then records both the
    /// user and assistant turns. Returns the terminal assistant text.
    pub async fn run_primary_turn(&self, session_id: &str, latest_content: &str) -> Result<String> {
        let builder = ContextBuilder {
            agent_name: &self.agent_name,
            profile: &self.profile,
            timezone: self.timezone,
            conversation: &self.conversation,
            long_term: &self.long_term,
            recall_tracker: &self.recall_tracker,
            skills: &self.skills,
            skill_tracker: &self.skill_tracker,
            working_memory: &self.working_memory,
            config: self.context_config.clone(),
        };
        let mut messages = builder.build(session_id, latest_content).await?;

        let slot = self.work_serializer.acquire_for_user().await;
        let namespace = format!("session/{session_id}");
        let outcome = loop_runner::run_loop(
            &self.llm,
            self.primary_provider,
            &self.ollama_model,
            &self.openrouter_model,
            &mut messages,
            &self.tool_gate,
            &self.working_memory,
            &namespace,
            &self.feedback,
            session_id,
            &self.loop_config,
            slot.token.clone(),
        )
        .await;
        drop(slot);
        let outcome = outcome?;

        let now = Utc::now();
        self.conversation
            .append(session_id, ConversationTurn { role: ConversationRole::User, content: latest_content.to_string(), timestamp: now })
            .await;
        self.conversation
            .append(session_id, ConversationTurn { role: ConversationRole::Assistant, content: outcome.content.clone(), timestamp: now })
            .await;

        Ok(outcome.content)
    }

    /// Publishes an `AgentReply` on the configured user-response topic.
    pub async fn publish_reply(&self, session_id: &str, content: String, is_final: bool) -> Result<()> {
        let envelope = Envelope::builder("AgentReply", &self.agent_name)
            .json_body(&AgentReply { session_id: session_id.to_string(), content, is_final })?
            .build();
        self.transport.publish(&self.user_response_topic, envelope).await
    }

    /// Publishes a non-final progress bubble under a topic suffixed with
    /// `suffix` (e.g. `subagent-{taskId}`, a target agent's name) — the
    /// relay path used by the Subagent Manager and A2A Coordinator's
    /// "Working" status updates, which never re-invoke the LLM.
    pub async fn publish_progress(&self, session_id: &str, topic_suffix: &str, content: String) -> Result<()> {
        let envelope = Envelope::builder("AgentReply", &self.agent_name)
            .json_body(&AgentReply { session_id: session_id.to_string(), content, is_final: false })?
            .build();
        self.transport.publish(&format!("{}.{}", self.user_response_topic, topic_suffix), envelope).await
    }

    pub fn system(&self, content: impl Into<String>) -> ChatMessage {
        ChatMessage::system(content)
    }
}

/// Body of a `user.request` envelope's handler (spec S1): runs one primary
/// turn and publishes exactly one final `AgentReply`.
pub async fn handle_user_message(message: &crate::messages::UserMessage, handles: &RuntimeHandles) -> Result<()> {
    let content = handles.run_primary_turn(&message.session_id, &message.content).await?;
    handles.publish_reply(&message.session_id, content, true).await
}
