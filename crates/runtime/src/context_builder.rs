//! Agent Context Builder (spec §4.8): assembles the chat message list for
//! one turn in the eight-section order the spec mandates. Grounded on
//! `runtime/prompt_builder.rs` and `runtime.rs::respond_and_remember_stream`'s
//! block-assembly style (named string sections joined in order), generalized
//! from the teacher's single environment/conversation/memory triad into the
//! full section list.

use anyhow::Result;
use chrono::Utc;
use chrono_tz::Tz;
use rockbot_llm::ChatMessage;
use rockbot_memory::{ConversationMemory, LongTermMemory, RecallSessionTracker, SearchCriteria, SkillSessionTracker, SkillStore, WorkingSearchCriteria, WorkingMemory};
use rockbot_profile::AgentProfile;

/// The `modelBehavior` knobs named in spec §4.8 — how many recalls/skills to
/// pull and the score floor below which a match isn't worth surfacing.
#[derive(Debug, Clone)]
pub struct ContextBuilderConfig {
    pub recall_top_k: usize,
    pub recall_score_floor: f32,
    pub skill_top_k: usize,
    pub skill_score_floor: f32,
    pub max_turns_per_session: usize,
}

pub struct ContextBuilder<'a> {
    pub agent_name: &'a str,
    pub profile: &'a AgentProfile,
    pub timezone: Tz,
    pub conversation: &'a ConversationMemory,
    pub long_term: &'a LongTermMemory,
    pub recall_tracker: &'a RecallSessionTracker,
    pub skills: &'a SkillStore,
    pub skill_tracker: &'a SkillSessionTracker,
    pub working_memory: &'a WorkingMemory,
    pub config: ContextBuilderConfig,
}

impl<'a> ContextBuilder<'a> {
    /// Builds the message list for `sessionId`'s next turn given
    /// `latestUserContent`, following the eight-section order of spec §4.8.
    pub async fn build(&self, session_id: &str, latest_user_content: &str) -> Result<Vec<ChatMessage>> {
        let mut messages = Vec::new();

        // 1. System: composed agent profile prompt, time/timezone spliced in.
        messages.push(ChatMessage::system(self.profile.compose_system_prompt(self.agent_name, Utc::now(), self.timezone)));

        // 2. System (conditional): active rules, one bullet per directive section.
        let bullets = self.profile.directive_bullets();
        if !bullets.is_empty() {
            messages.push(ChatMessage::system(format!("Active rules:\n{}", bullets.join("\n"))));
        }

        // 3. System (first turn of session): the full skill index.
        if self.skill_tracker.take_index_injection(session_id).await {
            let all_skills = self.skills.list().await?;
            if !all_skills.is_empty() {
                let index = all_skills.iter().map(|s| format!("- {}: {}", s.name, s.summary)).collect::<Vec<_>>().join("\n");
                messages.push(ChatMessage::system(format!("Skill index:\n{index}")));
            }
        }

        // 4. System: BM25 top-K long-term recalls above the score floor,
        // minus entries already injected earlier this session.
        let recalls = self
            .long_term
            .search_scored(&SearchCriteria { query: latest_user_content.to_string(), max_results: Some(self.config.recall_top_k), ..Default::default() })
            .await?;
        let recalls: Vec<_> = recalls.into_iter().filter(|(_, score)| *score >= self.config.recall_score_floor).collect();
        let recalls = self.recall_tracker.take_new_recalls(session_id, recalls).await;
        if !recalls.is_empty() {
            let text = recalls.iter().map(|(entry, _)| format!("- {}", entry.content)).collect::<Vec<_>>().join("\n");
            messages.push(ChatMessage::system(format!("Relevant memories:\n{text}")));
        }

        // 5. System: BM25 top-K new skills, minus ones already delivered this session.
        let skill_candidates = self.skills.search_scored(latest_user_content, self.config.skill_top_k).await?;
        let skill_candidates: Vec<_> =
            skill_candidates.into_iter().filter(|(_, score)| *score >= self.config.skill_score_floor).map(|(skill, _)| skill).collect();
        let fresh_skills = self.skill_tracker.take_new_recalls(session_id, skill_candidates).await;
        if !fresh_skills.is_empty() {
            let text = fresh_skills.iter().map(|s| format!("- {}: {}", s.name, s.summary)).collect::<Vec<_>>().join("\n");
            messages.push(ChatMessage::system(format!("Available skills:\n{text}")));
        }

        // 6. System (if non-empty): live patrol entries under `patrol/*`.
        let patrol_entries = self
            .working_memory
            .search(&WorkingSearchCriteria { category_prefix: Some("patrol".to_string()), ..Default::default() })
            .await?;
        if !patrol_entries.is_empty() {
            let text = patrol_entries.iter().map(|e| format!("- {}: {}", e.key, e.value)).collect::<Vec<_>>().join("\n");
            messages.push(ChatMessage::system(format!("Active patrols:\n{text}")));
        }

        // 7. Prior conversation turns, chronological, capped at maxTurnsPerSession.
        let turns = self.conversation.turns(session_id).await;
        let start = turns.len().saturating_sub(self.config.max_turns_per_session);
        for turn in &turns[start..] {
            messages.push(match turn.role {
                rockbot_memory::ConversationRole::User => ChatMessage::user(turn.content.clone()),
                rockbot_memory::ConversationRole::Assistant => ChatMessage::assistant(turn.content.clone()),
                rockbot_memory::ConversationRole::System => ChatMessage::system(turn.content.clone()),
            });
        }

        // 8. User: the new content.
        messages.push(ChatMessage::user(latest_user_content.to_string()));

        Ok(messages)
    }
}
