//! Skill Store & Recall (spec §4.7): durable named procedure documents, one
//! file per skill under `{skillsBase}`, BM25-recalled with two per-session
//! trackers gating injection so the same skill index/skill isn't repeated
//! into the context every turn. Storage follows the same one-file-per-entry
//! + `MemoryIndex` pattern as `crate::long_term` and `crate::working`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::bm25::{score_corpus, Bm25Params};
use crate::index::{IndexedMeta, MemoryIndex};
use crate::schema::{LongTermEntry, Skill};

pub struct SkillStore {
    base: PathBuf,
    index: Mutex<MemoryIndex>,
    bm25: Bm25Params,
}

impl SkillStore {
    pub fn open(base: impl Into<PathBuf>, index_path: impl AsRef<Path>, bm25: Bm25Params) -> Result<Self> {
        let base = base.into();
        std::fs::create_dir_all(&base)?;
        let mut index = MemoryIndex::open(index_path)?;
        if index.is_empty()? {
            let metas = scan_directory(&base)?;
            index.rebuild_from(metas)?;
        }
        Ok(Self { base, index: Mutex::new(index), bm25 })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.base.join(format!("{name}.md.json"))
    }

    /// Upserts a skill. `summary` may be empty; the caller (the loop
    /// runner's background job hook) re-saves with a populated summary once
    /// the LLM backfill completes. Skills participate in BM25 search
    /// immediately, pending or not — see DESIGN.md's Open Question decision.
    pub async fn save(&self, name: impl Into<String>, summary: String, content: impl Into<String>) -> Result<Skill> {
        let name = name.into();
        let now = Utc::now();
        let existing = self.get(&name).await?;
        let skill = Skill {
            name: name.clone(),
            summary,
            content: content.into(),
            created_at: existing.map(|s| s.created_at).unwrap_or(now),
            updated_at: now,
        };
        self.write(&skill).await?;
        Ok(skill)
    }

    async fn write(&self, skill: &Skill) -> Result<()> {
        let path = self.path_for(&skill.name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, serde_json::to_vec_pretty(skill)?).await?;
        self.index.lock().await.insert(&IndexedMeta {
            id: skill.name.clone(),
            category: None,
            tags: Vec::new(),
            created_at: skill.created_at,
            updated_at: Some(skill.updated_at),
            expires_at: None,
        })?;
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<Option<Skill>> {
        let path = self.path_for(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete(&self, name: &str) -> Result<bool> {
        let existed = self.get(name).await?.is_some();
        let _ = tokio::fs::remove_file(self.path_for(name)).await;
        self.index.lock().await.remove(name)?;
        Ok(existed)
    }

    pub async fn list(&self) -> Result<Vec<Skill>> {
        let metas = self.index.lock().await.all()?;
        let mut skills = Vec::with_capacity(metas.len());
        for meta in metas {
            if let Some(skill) = self.get(&meta.id).await? {
                skills.push(skill);
            }
        }
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(skills)
    }

    /// BM25 recall over skill content + name, returning up to `max_results`.
    pub async fn search(&self, query: &str, max_results: usize) -> Result<Vec<Skill>> {
        Ok(self.search_scored(query, max_results).await?.into_iter().map(|(skill, _)| skill).collect())
    }

    /// Same ranking as `search`, but keeps the BM25 score alongside each
    /// skill — used by the Agent Context Builder's score floor (spec §4.8).
    pub async fn search_scored(&self, query: &str, max_results: usize) -> Result<Vec<(Skill, f32)>> {
        let all = self.list().await?;
        let corpus: Vec<String> = all.iter().map(|s| format!("{} {}", s.name, s.content)).collect();
        let corpus_refs: Vec<&str> = corpus.iter().map(|s| s.as_str()).collect();
        let mut scored = score_corpus(query, &corpus_refs, &self.bm25);
        scored.retain(|(_, score)| *score > 0.0);
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        Ok(scored.into_iter().take(max_results).map(|(i, score)| (all[i].clone(), score)).collect())
    }
}

fn scan_directory(base: &Path) -> Result<Vec<IndexedMeta>> {
    let mut metas = Vec::new();
    if !base.exists() {
        return Ok(metas);
    }
    for entry in std::fs::read_dir(base)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() {
            if let Ok(bytes) = std::fs::read(&path) {
                if let Ok(loaded) = serde_json::from_slice::<Skill>(&bytes) {
                    metas.push(IndexedMeta {
                        id: loaded.name,
                        category: None,
                        tags: Vec::new(),
                        created_at: loaded.created_at,
                        updated_at: Some(loaded.updated_at),
                        expires_at: None,
                    });
                }
            }
        }
    }
    Ok(metas)
}

/// Per-session "already shown" trackers gating context-builder injection
/// (spec §4.7). `SkillSessionTracker` is shared across all sessions one
/// agent host process is serving; callers key calls by `sessionId`.
#[derive(Default)]
pub struct SkillSessionTracker {
    /// Sessions that have already received the full skill index once.
    index_shown: Mutex<HashSet<String>>,
    /// Per-session set of skill names already delivered via recall.
    recalled: Mutex<HashMap<String, HashSet<String>>>,
}

impl SkillSessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` exactly once per session: the first time this is
    /// called for a given `sessionId`, marking the index as shown.
    pub async fn take_index_injection(&self, session_id: &str) -> bool {
        let mut shown = self.index_shown.lock().await;
        shown.insert(session_id.to_string())
    }

    /// Filters `candidates` down to names not yet recalled this session,
    /// then marks them recalled.
    pub async fn take_new_recalls(&self, session_id: &str, candidates: Vec<Skill>) -> Vec<Skill> {
        let mut recalled = self.recalled.lock().await;
        let seen = recalled.entry(session_id.to_string()).or_default();
        let mut fresh = Vec::new();
        for skill in candidates {
            if seen.insert(skill.name.clone()) {
                fresh.push(skill);
            }
        }
        fresh
    }

    pub async fn forget_session(&self, session_id: &str) {
        self.index_shown.lock().await.remove(session_id);
        self.recalled.lock().await.remove(session_id);
    }
}

/// Per-session "already injected" tracker for long-term memory recalls
/// (spec §4.8 step 4), the same shape as `SkillSessionTracker::recalled` but
/// keyed by entry id instead of skill name.
#[derive(Default)]
pub struct RecallSessionTracker {
    recalled: Mutex<HashMap<String, HashSet<Uuid>>>,
}

impl RecallSessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filters `candidates` down to entries not yet injected this session,
    /// then marks them injected.
    pub async fn take_new_recalls(&self, session_id: &str, candidates: Vec<(LongTermEntry, f32)>) -> Vec<(LongTermEntry, f32)> {
        let mut recalled = self.recalled.lock().await;
        let seen = recalled.entry(session_id.to_string()).or_default();
        let mut fresh = Vec::new();
        for candidate in candidates {
            if seen.insert(candidate.0.id) {
                fresh.push(candidate);
            }
        }
        fresh
    }

    pub async fn forget_session(&self, session_id: &str) {
        self.recalled.lock().await.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn store(dir: &Path) -> SkillStore {
        SkillStore::open(dir.join("skills"), dir.join("skills.redb"), Bm25Params::default()).unwrap()
    }

    #[tokio::test]
    async fn save_then_get_round_trips_with_pending_summary() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let skill = store.save("deploy/rollback", String::new(), "## Steps\n1. revert\n2. verify").await.unwrap();
        assert!(skill.summary.is_empty());

        let fetched = store.get("deploy/rollback").await.unwrap().unwrap();
        assert_eq!(fetched.content, "## Steps\n1. revert\n2. verify");
    }

    #[tokio::test]
    async fn pending_summary_skill_is_still_searchable() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.save("deploy/rollback", String::new(), "revert a broken deploy safely").await.unwrap();

        let results = store.search("revert deploy", 10).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn index_injection_tracker_fires_once_per_session() {
        let tracker = SkillSessionTracker::new();
        assert!(tracker.take_index_injection("s1").await);
        assert!(!tracker.take_index_injection("s1").await);
        assert!(tracker.take_index_injection("s2").await);
    }

    #[tokio::test]
    async fn recall_tracker_only_returns_new_skills() {
        let tracker = SkillSessionTracker::new();
        let a = Skill { name: "a".into(), summary: String::new(), content: String::new(), created_at: Utc::now(), updated_at: Utc::now() };
        let b = Skill { name: "b".into(), summary: String::new(), content: String::new(), created_at: Utc::now(), updated_at: Utc::now() };

        let first = tracker.take_new_recalls("s1", vec![a.clone(), b.clone()]).await;
        assert_eq!(first.len(), 2);

        let second = tracker.take_new_recalls("s1", vec![a, b]).await;
        assert!(second.is_empty());
    }

    fn entry(content: &str) -> LongTermEntry {
        LongTermEntry {
            id: Uuid::new_v4(),
            content: content.to_string(),
            category: None,
            tags: Vec::new(),
            created_at: Utc::now(),
            updated_at: None,
            provenance_hash: String::new(),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn recall_session_tracker_only_returns_new_entries() {
        let tracker = RecallSessionTracker::new();
        let a = entry("user prefers dark mode");
        let b = entry("weather in paris is mild");

        let first = tracker.take_new_recalls("s1", vec![(a.clone(), 1.0), (b.clone(), 0.5)]).await;
        assert_eq!(first.len(), 2);

        let second = tracker.take_new_recalls("s1", vec![(a.clone(), 1.0), (b.clone(), 0.5)]).await;
        assert!(second.is_empty());

        // A fresh session still sees both.
        let third = tracker.take_new_recalls("s2", vec![(a, 1.0), (b, 0.5)]).await;
        assert_eq!(third.len(), 2);
    }

    #[tokio::test]
    async fn recall_session_tracker_forget_session_resets_injected_set() {
        let tracker = RecallSessionTracker::new();
        let a = entry("durable fact");

        tracker.take_new_recalls("s1", vec![(a.clone(), 1.0)]).await;
        tracker.forget_session("s1").await;

        let after_forget = tracker.take_new_recalls("s1", vec![(a, 1.0)]).await;
        assert_eq!(after_forget.len(), 1);
    }
}
