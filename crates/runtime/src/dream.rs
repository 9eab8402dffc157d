//! Dream / Consolidation Driver (§4.15, new): periodically asks the LLM to
//! identify redundant, stale, or mergeable long-term memory entries and
//! applies the result. Runs on the same scheduler/work-serializer
//! infrastructure as any scheduled task rather than a bespoke subsystem —
//! generalized from the teacher's `runtime/sleep.rs` +
//! `memory::sleep::AgenticSleepInsights`/`parse_agentic_insights` prompt
//! shape, scaled down to one LLM call per run instead of the teacher's
//! multi-pass reflective/procedural/core sleep stages.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use rockbot_llm::{ChatMessage, LlmRouter, Provider};
use rockbot_memory::{FeedbackLog, FeedbackSignalType, LongTermMemory, SearchCriteria};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::work_serializer::WorkSerializer;

#[derive(Debug, Clone)]
pub struct DreamConfig {
    pub max_entries_considered: usize,
    /// Minimum spacing between two runs, even if both windows were idle.
    pub min_interval_secs: i64,
}

impl Default for DreamConfig {
    fn default() -> Self {
        Self { max_entries_considered: 200, min_interval_secs: 6 * 3600 }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ConsolidationInsights {
    #[serde(default)]
    merge_groups: Vec<MergeGroup>,
    #[serde(default)]
    delete_ids: Vec<Uuid>,
    #[serde(default)]
    summary: String,
}

#[derive(Debug, Deserialize)]
struct MergeGroup {
    ids: Vec<Uuid>,
    merged_content: String,
}

pub struct DreamDriver {
    long_term: Arc<LongTermMemory>,
    feedback: Arc<FeedbackLog>,
    work_serializer: Arc<WorkSerializer>,
    llm: Arc<LlmRouter>,
    primary: Provider,
    ollama_model: String,
    openrouter_model: String,
    config: DreamConfig,
    last_run_at: AtomicI64,
}

/// What one consolidation pass accomplished, for logging/tests.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DreamOutcome {
    pub merged_groups: usize,
    pub deleted: usize,
    pub ran: bool,
}

impl DreamDriver {
    pub fn new(
        long_term: Arc<LongTermMemory>,
        feedback: Arc<FeedbackLog>,
        work_serializer: Arc<WorkSerializer>,
        llm: Arc<LlmRouter>,
        primary: Provider,
        ollama_model: impl Into<String>,
        openrouter_model: impl Into<String>,
        config: DreamConfig,
    ) -> Self {
        Self {
            long_term,
            feedback,
            work_serializer,
            llm,
            primary,
            ollama_model: ollama_model.into(),
            openrouter_model: openrouter_model.into(),
            config,
            last_run_at: AtomicI64::new(0),
        }
    }

    /// Attempts a consolidation pass. Returns `ran: false` without touching
    /// anything if the background slot is held, or if the minimum interval
    /// since the last run hasn't elapsed yet.
    pub async fn run(&self) -> Result<DreamOutcome> {
        let now = Utc::now().timestamp();
        let last = self.last_run_at.load(Ordering::SeqCst);
        if now - last < self.config.min_interval_secs {
            return Ok(DreamOutcome::default());
        }

        let Some(_slot) = self.work_serializer.try_acquire_for_scheduled() else {
            info!("dream driver skipped — user active");
            return Ok(DreamOutcome::default());
        };

        self.last_run_at.store(now, Ordering::SeqCst);

        let entries = self
            .long_term
            .search(&SearchCriteria { max_results: Some(self.config.max_entries_considered), ..Default::default() })
            .await?;
        if entries.is_empty() {
            return Ok(DreamOutcome { ran: true, ..Default::default() });
        }

        let corpus = entries
            .iter()
            .map(|e| format!("- id={} category={:?} tags={:?}: {}", e.id, e.category, e.tags, e.content))
            .collect::<Vec<_>>()
            .join("\n");

        let messages = vec![
            ChatMessage::system(
                "You consolidate an agent's long-term memory. Identify entries that are \
                 redundant, stale, or that should be merged. Respond with strict JSON: \
                 {\"mergeGroups\":[{\"ids\":[...],\"mergedContent\":\"...\"}],\"deleteIds\":[...],\"summary\":\"...\"}. \
                 Use empty arrays and an empty summary if nothing needs to change.",
            ),
            ChatMessage::user(format!("Entries:\n{corpus}")),
        ];

        let response = self
            .llm
            .chat_messages(self.primary, &self.ollama_model, &self.openrouter_model, &messages, None)
            .await?;

        let insights: ConsolidationInsights = match serde_json::from_str(&response.content) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(error = %err, "dream driver could not parse consolidation insights, skipping this run");
                return Ok(DreamOutcome { ran: true, ..Default::default() });
            }
        };

        let mut merged_groups = 0;
        for group in &insights.merge_groups {
            if group.ids.is_empty() {
                continue;
            }
            for id in &group.ids {
                self.long_term.backup(*id).await?;
            }
            let first = entries.iter().find(|e| e.id == group.ids[0]);
            let category = first.and_then(|e| e.category.clone());
            let tags = first.map(|e| e.tags.clone()).unwrap_or_default();
            self.long_term.save(group.merged_content.clone(), category, tags, None).await?;
            for id in &group.ids {
                self.long_term.delete(*id).await?;
            }
            merged_groups += 1;
        }

        let mut deleted = 0;
        for id in &insights.delete_ids {
            self.long_term.backup(*id).await?;
            if self.long_term.delete(*id).await? {
                deleted += 1;
            }
        }

        if !insights.summary.trim().is_empty() {
            self.feedback.record("dream", FeedbackSignalType::SessionSummary, insights.summary).await?;
        }

        Ok(DreamOutcome { merged_groups, deleted, ran: true })
    }
}

#[cfg(test)]
mod tests {
    use rockbot_memory::Bm25Params;
    use tempfile::tempdir;

    use super::*;

    fn long_term(dir: &std::path::Path) -> Arc<LongTermMemory> {
        Arc::new(LongTermMemory::open(dir.join("memory"), dir.join("memory.redb"), 20, Bm25Params::default()).unwrap())
    }

    #[tokio::test]
    async fn skips_when_background_slot_is_held() {
        let dir = tempdir().unwrap();
        let long_term = long_term(dir.path());
        let feedback = Arc::new(FeedbackLog::new(dir.path().join("feedback")));
        let work_serializer = WorkSerializer::new(tokio_util::sync::CancellationToken::new());
        let _held = work_serializer.try_acquire_for_scheduled().unwrap();

        let driver = DreamDriver::new(
            long_term,
            feedback,
            work_serializer,
            Arc::new(LlmRouter::default()),
            Provider::Ollama,
            "llama3",
            "openrouter/model",
            DreamConfig::default(),
        );

        let outcome = driver.run().await.unwrap();
        assert!(!outcome.ran);
    }

    #[tokio::test]
    async fn respects_minimum_interval_between_runs() {
        let dir = tempdir().unwrap();
        let long_term = long_term(dir.path());
        let feedback = Arc::new(FeedbackLog::new(dir.path().join("feedback")));
        let work_serializer = WorkSerializer::new(tokio_util::sync::CancellationToken::new());

        let driver = DreamDriver::new(
            long_term,
            feedback,
            work_serializer,
            Arc::new(LlmRouter::default()),
            Provider::Ollama,
            "llama3",
            "openrouter/model",
            DreamConfig { max_entries_considered: 50, min_interval_secs: 3600 },
        );
        driver.last_run_at.store(Utc::now().timestamp(), Ordering::SeqCst);

        let outcome = driver.run().await.unwrap();
        assert!(!outcome.ran);
    }
}
