//! Scheduler (spec §4.9) and Scheduled Task Handler (spec §4.10). Grounded
//! on the teacher's `server.rs` timezone-aware cron loop (parsing
//! `config.scheduler.timezone` into a `Tz` with a UTC fallback-and-warn), one
//! timer task per entry, generalized from the teacher's single hard-coded
//! "proactive check" interval into named, persisted, arbitrarily-many cron
//! entries fired as `ScheduledTaskMessage`s through the bus rather than
//! invoked as direct function calls.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context as _, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use rockbot_exec::PolicyGate;
use rockbot_llm::{ChatMessage, LlmRouter, Provider};
use rockbot_memory::{EventLog, FeedbackLog, ScheduledTask, WorkingMemory};
use rockbot_transport::Transport;
use rockbot_types::Envelope;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context_builder::ContextBuilder;
use crate::loop_runner::{self, LoopConfig};
use crate::messages::{AgentReply, ScheduledTaskMessage};
use crate::work_serializer::WorkSerializer;

/// Topic a scheduled fire is published to; the Scheduled Task Handler (in
/// this same module) is registered against it in the pipeline.
pub const TOPIC_SCHEDULED_TASK: &str = "agent.task.scheduled";

/// Turns a cron expression into a `cron::Schedule`. Accepts both the
/// standard 5-field `min hour dom mon dow` form and a 6-field seconds-leading
/// form (`sec min hour dom mon dow`) — see DESIGN.md's Open Question
/// decision. A bare 5-field expression is normalized by synthesizing a
/// leading `0` seconds field before parsing.
fn parse_cron(expr: &str) -> Result<Schedule> {
    let field_count = expr.split_whitespace().count();
    let normalized = match field_count {
        5 => format!("0 {expr}"),
        _ => expr.to_string(),
    };
    Schedule::from_str(&normalized).with_context(|| format!("invalid cron expression: {expr}"))
}

struct ArmedEntry {
    task: ScheduledTask,
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Owns every armed timer and the durable snapshot of scheduled tasks
/// (spec §6 file layout: `{base}/scheduled-tasks.json`).
pub struct Scheduler {
    transport: Arc<dyn Transport>,
    source: String,
    timezone: Tz,
    log: EventLog<ScheduledTask>,
    entries: Mutex<HashMap<String, ArmedEntry>>,
    shutdown: CancellationToken,
}

impl Scheduler {
    /// `timezone_name` follows `config.scheduler.timezone`; an unparseable
    /// name falls back to UTC with a warning, matching the teacher's
    /// daemon-startup timezone handling.
    pub fn new(
        transport: Arc<dyn Transport>,
        source: impl Into<String>,
        timezone_name: &str,
        tasks_path: impl Into<PathBuf>,
        shutdown: CancellationToken,
    ) -> Self {
        let timezone = timezone_name.parse::<Tz>().unwrap_or_else(|_| {
            warn!(timezone = timezone_name, "unrecognized scheduler timezone, falling back to UTC");
            chrono_tz::UTC
        });
        Self {
            transport,
            source: source.into(),
            timezone,
            log: EventLog::new(tasks_path.into()),
            entries: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Loads the persisted snapshot and arms a timer for every entry.
    /// Missed firings while the process was down are not backfilled — the
    /// first fire after restart is simply the next occurrence from now.
    pub async fn load(self: &Arc<Self>) -> Result<usize> {
        let tasks = self.log.load()?;
        let mut armed = 0;
        for task in tasks {
            if let Err(err) = self.arm(task.clone()).await {
                warn!(task = task.name, error = %err, "failed to arm persisted scheduled task, dropping it");
                continue;
            }
            armed += 1;
        }
        Ok(armed)
    }

    /// Upserts and arms `task`. Re-scheduling an existing name cancels its
    /// old timer before arming the new one, so exactly one timer is ever
    /// armed per name (spec testable property: "schedule(name=A); schedule
    /// (name=A) leaves exactly one timer armed").
    pub async fn schedule(self: &Arc<Self>, task: ScheduledTask) -> Result<()> {
        parse_cron(&task.cron_expression)?;
        self.arm(task).await?;
        self.persist().await
    }

    async fn arm(self: &Arc<Self>, task: ScheduledTask) -> Result<()> {
        let schedule = parse_cron(&task.cron_expression)?;
        let mut entries = self.entries.lock().await;
        if let Some(old) = entries.remove(&task.name) {
            old.cancel.cancel();
            old.handle.abort();
        }

        let cancel = self.shutdown.child_token();
        let scheduler = self.clone();
        let name = task.name.clone();
        let timezone = self.timezone;
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            scheduler.fire_loop(name, schedule, timezone, loop_cancel).await;
        });

        entries.insert(task.name.clone(), ArmedEntry { task, handle, cancel });
        Ok(())
    }

    async fn fire_loop(self: Arc<Self>, name: String, schedule: Schedule, timezone: Tz, cancel: CancellationToken) {
        loop {
            let now = Utc::now().with_timezone(&timezone);
            let Some(next) = schedule.after(&now).next() else {
                warn!(task = name, "cron schedule produced no further occurrences");
                return;
            };
            let delay = (next.with_timezone(&Utc) - Utc::now()).to_std().unwrap_or_default();

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return,
            }

            let Some(description) = self.task_description(&name).await else { return };
            let envelope = Envelope::builder("ScheduledTaskMessage", &self.source)
                .json_body(&ScheduledTaskMessage { task_name: name.clone(), description })
                .expect("ScheduledTaskMessage always serializes");
            if let Err(err) = self.transport.publish(TOPIC_SCHEDULED_TASK, envelope.build()).await {
                warn!(task = name, error = %err, "failed to publish scheduled task fire");
            }
            self.record_fire(&name, Utc::now()).await;
        }
    }

    async fn task_description(&self, name: &str) -> Option<String> {
        self.entries.lock().await.get(name).map(|e| e.task.description.clone())
    }

    async fn record_fire(&self, name: &str, at: DateTime<Utc>) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(name) {
            entry.task.last_fired_at = Some(at);
        }
        drop(entries);
        let _ = self.persist().await;
    }

    pub async fn cancel(&self, name: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.remove(name) else { return Ok(false) };
        entry.cancel.cancel();
        entry.handle.abort();
        drop(entries);
        self.persist().await?;
        Ok(true)
    }

    pub async fn list(&self) -> Vec<ScheduledTask> {
        let mut tasks: Vec<_> = self.entries.lock().await.values().map(|e| e.task.clone()).collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        tasks
    }

    pub fn next_occurrence(&self, task: &ScheduledTask) -> Result<DateTime<Utc>> {
        let schedule = parse_cron(&task.cron_expression)?;
        let now = Utc::now().with_timezone(&self.timezone);
        schedule
            .after(&now)
            .next()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| anyhow!("cron schedule produced no further occurrences"))
    }

    async fn persist(&self) -> Result<()> {
        let tasks: Vec<ScheduledTask> = self.entries.lock().await.values().map(|e| e.task.clone()).collect();
        self.log.overwrite(&tasks).await
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Scheduled Task Handler (spec §4.10): runs on every `ScheduledTaskMessage`
/// fire. Builds an ephemeral `patrol-{name}` turn, runs it under the work
/// serializer's background slot, and publishes a reply only if the loop
/// produced non-blank output and wasn't preempted.
#[allow(clippy::too_many_arguments)]
pub async fn handle_scheduled_task(
    message: &ScheduledTaskMessage,
    context_builder: &ContextBuilder<'_>,
    profile_base: &Path,
    work_serializer: &Arc<WorkSerializer>,
    llm: &LlmRouter,
    primary: Provider,
    ollama_model: &str,
    openrouter_model: &str,
    tool_gate: &PolicyGate,
    working_memory: &WorkingMemory,
    feedback: &FeedbackLog,
    loop_config: &LoopConfig,
    transport: &dyn Transport,
    source: &str,
    reply_topic: &str,
) -> Result<()> {
    let session_id = format!("patrol-{}", message.task_name);
    let mut messages = context_builder.build(&session_id, &message.description).await?;

    let patrol_profile = profile_base.join(format!("{}.md", message.task_name));
    if let Ok(extra) = tokio::fs::read_to_string(&patrol_profile).await {
        // Immediately after the base prompt, i.e. index 1 (index 0 is the
        // composed agent profile message built first by the context builder).
        messages.insert(1, ChatMessage::system(extra));
    }

    let Some(slot) = work_serializer.try_acquire_for_scheduled() else {
        info!(task = %message.task_name, "skipped — user active");
        return Ok(());
    };

    let namespace = format!("session/{session_id}");
    let outcome = loop_runner::run_loop(
        llm,
        primary,
        ollama_model,
        openrouter_model,
        &mut messages,
        tool_gate,
        working_memory,
        &namespace,
        feedback,
        &session_id,
        loop_config,
        slot.token.clone(),
    )
    .await;

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(_) if slot.token.is_cancelled() => return Ok(()),
        Err(err) => return Err(err),
    };

    if outcome.content.trim().is_empty() {
        return Ok(());
    }

    let envelope = Envelope::builder("AgentReply", source)
        .json_body(&AgentReply { session_id, content: outcome.content, is_final: true })?
        .build();
    transport.publish(reply_topic, envelope).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use rockbot_transport::{DispatchFn, Subscription};
    use rockbot_types::DispatchOutcome;
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

    fn task(name: &str, cron_expr: &str) -> ScheduledTask {
        ScheduledTask {
            name: name.to_string(),
            cron_expression: cron_expr.to_string(),
            description: "say hi".to_string(),
            created_at: Utc::now(),
            last_fired_at: None,
        }
    }

    #[test]
    fn five_field_expression_is_normalized_to_six() {
        assert!(parse_cron("* * * * *").is_ok());
        assert!(parse_cron("0 * * * * *").is_ok());
    }

    #[tokio::test]
    async fn rescheduling_same_name_leaves_exactly_one_entry_armed() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(RecordingTransport { published: StdMutex::new(Vec::new()) });
        let scheduler = Arc::new(Scheduler::new(
            transport,
            "rockbot",
            "UTC",
            dir.path().join("scheduled-tasks.json"),
            CancellationToken::new(),
        ));

        scheduler.schedule(task("daily-standup", "0 9 * * *")).await.unwrap();
        scheduler.schedule(task("daily-standup", "0 10 * * *")).await.unwrap();

        let tasks = scheduler.list().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].cron_expression, "0 10 * * *");
    }

    #[tokio::test]
    async fn cancel_removes_the_armed_entry() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(RecordingTransport { published: StdMutex::new(Vec::new()) });
        let scheduler = Arc::new(Scheduler::new(
            transport,
            "rockbot",
            "UTC",
            dir.path().join("scheduled-tasks.json"),
            CancellationToken::new(),
        ));

        scheduler.schedule(task("nightly-sleep", "0 2 * * *")).await.unwrap();
        assert!(scheduler.cancel("nightly-sleep").await.unwrap());
        assert!(scheduler.list().await.is_empty());
        assert!(!scheduler.cancel("nightly-sleep").await.unwrap());
    }

    #[tokio::test]
    async fn unknown_timezone_falls_back_to_utc() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(RecordingTransport { published: StdMutex::new(Vec::new()) });
        let scheduler = Scheduler::new(
            transport,
            "rockbot",
            "Not/A_Timezone",
            dir.path().join("scheduled-tasks.json"),
            CancellationToken::new(),
        );
        assert_eq!(scheduler.timezone, chrono_tz::UTC);
    }

    #[tokio::test]
    async fn persisted_tasks_are_reloaded_and_rearmed() {
        let dir = tempdir().unwrap();
        let tasks_path = dir.path().join("scheduled-tasks.json");
        let transport = Arc::new(RecordingTransport { published: StdMutex::new(Vec::new()) });
        {
            let scheduler =
                Arc::new(Scheduler::new(transport.clone(), "rockbot", "UTC", &tasks_path, CancellationToken::new()));
            scheduler.schedule(task("weekly-report", "0 8 * * 1")).await.unwrap();
        }

        let reloaded =
            Arc::new(Scheduler::new(transport, "rockbot", "UTC", &tasks_path, CancellationToken::new()));
        let armed = reloaded.load().await.unwrap();
        assert_eq!(armed, 1);
        assert_eq!(reloaded.list().await.len(), 1);
    }
}
