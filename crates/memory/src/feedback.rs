//! Feedback capture (spec §4.16): one JSONL append per signal, keyed by
//! session, using the same `EventLog` machinery as the rest of the memory
//! tiers (`crate::event_log`). Written to by `record_correction`/`thumbs_up`/
//! `thumbs_down` tool calls, the loop runner on a tool failure, and the Dream
//! Driver at the end of a consolidation run.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Utc;

use crate::event_log::EventLog;
use crate::schema::{FeedbackEntry, FeedbackSignalType};

pub struct FeedbackLog {
    base: PathBuf,
}

impl FeedbackLog {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn log_for(&self, session_id: &str) -> EventLog<FeedbackEntry> {
        EventLog::new(self.base.join(format!("{session_id}.jsonl")))
    }

    pub async fn record(&self, session_id: &str, signal_type: FeedbackSignalType, content: impl Into<String>) -> Result<()> {
        let entry = FeedbackEntry {
            session_id: session_id.to_string(),
            signal_type,
            content: content.into(),
            created_at: Utc::now(),
        };
        self.log_for(session_id).append(&entry).await
    }

    pub fn load(&self, session_id: &str) -> Result<Vec<FeedbackEntry>> {
        self.log_for(session_id).load()
    }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.base.join(format!("{session_id}.jsonl"))
    }

    pub fn base(&self) -> &Path {
        &self.base
    }
}
