//! Long-Term Memory (spec §4.5): durable, id-addressed entries stored one
//! file per entry under `{base}/{category path}/{id}.json`, searched with
//! BM25 over category-prefix/tag/time-filtered candidates.
//!
//! One-file-per-entry JSON storage generalizes the teacher's vault
//! YAML-summary-file-per-tier idea (`vault.rs`'s `KV_CORE`, `KV_REFLECTIVE`,
//! ... each being one file) into one file per entry with directory-as-
//! category, since the spec requires per-entry files rather than per-tier
//! summaries. The `MemoryIndex` (see `crate::index`) avoids a directory scan
//! on every search.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::bm25::{score_corpus, Bm25Params};
use crate::index::{IndexedMeta, MemoryIndex};
use crate::schema::{normalize_tags, provenance_hash, sanitize_category, LongTermEntry};

#[derive(Debug, Clone, Default)]
pub struct SearchCriteria {
    pub query: String,
    pub category_prefix: Option<String>,
    pub tags: Vec<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub max_results: Option<usize>,
}

pub struct LongTermMemory {
    base: PathBuf,
    index: Mutex<MemoryIndex>,
    default_max_results: usize,
    bm25: Bm25Params,
}

impl LongTermMemory {
    pub fn open(base: impl Into<PathBuf>, index_path: impl AsRef<Path>, default_max_results: usize, bm25: Bm25Params) -> Result<Self> {
        let base = base.into();
        std::fs::create_dir_all(&base)?;
        let mut index = MemoryIndex::open(index_path)?;
        if index.is_empty()? {
            let metas = scan_directory(&base)?;
            index.rebuild_from(metas)?;
        }
        Ok(Self { base, index: Mutex::new(index), default_max_results, bm25 })
    }

    fn entry_path(&self, id: Uuid, category: Option<&str>) -> PathBuf {
        match category {
            Some(category) => self.base.join(category).join(format!("{id}.json")),
            None => self.base.join(format!("{id}.json")),
        }
    }

    pub async fn save(
        &self,
        content: impl Into<String>,
        category: Option<String>,
        tags: Vec<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<LongTermEntry> {
        let category = category.and_then(|c| sanitize_category(&c));
        let content = content.into();
        let entry = LongTermEntry {
            id: Uuid::new_v4(),
            provenance_hash: provenance_hash(&content),
            content,
            category,
            tags: normalize_tags(tags),
            created_at: Utc::now(),
            updated_at: None,
            metadata,
        };
        self.write_entry(&entry).await?;
        Ok(entry)
    }

    pub async fn update(
        &self,
        id: Uuid,
        content: Option<String>,
        tags: Option<Vec<String>>,
        metadata: Option<serde_json::Value>,
    ) -> Result<LongTermEntry> {
        let mut entry =
            self.get(id).await?.ok_or_else(|| anyhow!("long-term entry not found: {id}"))?;
        if let Some(content) = content {
            entry.provenance_hash = provenance_hash(&content);
            entry.content = content;
        }
        if let Some(tags) = tags {
            entry.tags = normalize_tags(tags);
        }
        if metadata.is_some() {
            entry.metadata = metadata;
        }
        entry.updated_at = Some(Utc::now());
        self.write_entry(&entry).await?;
        Ok(entry)
    }

    async fn write_entry(&self, entry: &LongTermEntry) -> Result<()> {
        let path = self.entry_path(entry.id, entry.category.as_deref());
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, serde_json::to_vec_pretty(entry)?).await?;

        self.index.lock().await.insert(&IndexedMeta {
            id: entry.id.to_string(),
            category: entry.category.clone(),
            tags: entry.tags.clone(),
            created_at: entry.created_at,
            updated_at: entry.updated_at,
            expires_at: None,
        })?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<LongTermEntry>> {
        let meta = self.index.lock().await.get(&id.to_string())?;
        let Some(meta) = meta else { return Ok(None) };
        let path = self.entry_path(id, meta.category.as_deref());
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        let Some(meta) = self.index.lock().await.get(&id.to_string())? else { return Ok(false) };
        let path = self.entry_path(id, meta.category.as_deref());
        let _ = tokio::fs::remove_file(&path).await;
        self.index.lock().await.remove(&id.to_string())?;
        Ok(true)
    }

    pub async fn search(&self, criteria: &SearchCriteria) -> Result<Vec<LongTermEntry>> {
        Ok(self.search_scored(criteria).await?.into_iter().map(|(entry, _)| entry).collect())
    }

    /// Same ranking as `search`, but keeps the BM25 score alongside each
    /// entry — used by the Agent Context Builder (spec §4.8) to apply a
    /// score floor on top of the top-K cut.
    pub async fn search_scored(&self, criteria: &SearchCriteria) -> Result<Vec<(LongTermEntry, f32)>> {
        let metas = self.index.lock().await.all()?;
        let wanted_tags: Vec<String> = normalize_tags(criteria.tags.clone());

        let mut candidates: Vec<IndexedMeta> = metas
            .into_iter()
            .filter(|m| match &criteria.category_prefix {
                Some(prefix) => m.category.as_deref().map(|c| c.starts_with(prefix.as_str())).unwrap_or(false),
                None => true,
            })
            .filter(|m| wanted_tags.is_empty() || wanted_tags.iter().any(|t| m.tags.contains(t)))
            .filter(|m| criteria.created_after.map(|after| m.created_at >= after).unwrap_or(true))
            .filter(|m| criteria.created_before.map(|before| m.created_at <= before).unwrap_or(true))
            .collect();

        // Stable pre-sort so the BM25 tiebreaker (updatedAt desc, createdAt
        // desc, id asc) holds for equal-scoring entries.
        candidates.sort_by(|a, b| {
            let a_key = (a.updated_at.unwrap_or(a.created_at), a.created_at);
            let b_key = (b.updated_at.unwrap_or(b.created_at), b.created_at);
            b_key.cmp(&a_key).then_with(|| a.id.cmp(&b.id))
        });

        let mut entries = Vec::with_capacity(candidates.len());
        for meta in &candidates {
            let id = Uuid::parse_str(&meta.id)?;
            if let Some(entry) = self.get(id).await? {
                entries.push(entry);
            }
        }

        let contents: Vec<&str> = entries.iter().map(|e| e.content.as_str()).collect();
        let mut scored = score_corpus(&criteria.query, &contents, &self.bm25);
        // Stable sort keeps the pre-sorted tiebreaker order for equal scores.
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        let limit = criteria.max_results.unwrap_or(self.default_max_results);
        Ok(scored.into_iter().take(limit).map(|(i, score)| (entries[i].clone(), score)).collect())
    }

    /// Snapshots an entry's file to a `.bak` sibling before a destructive
    /// consolidation pass touches it (spec §4.15's backup-before-merge
    /// rule), mirroring `EventLog::backup`'s convention for the
    /// one-file-per-entry layout. No-op if the entry doesn't exist.
    pub async fn backup(&self, id: Uuid) -> Result<()> {
        let Some(meta) = self.index.lock().await.get(&id.to_string())? else { return Ok(()) };
        let path = self.entry_path(id, meta.category.as_deref());
        if !path.exists() {
            return Ok(());
        }
        let bak_path = path.with_extension("json.bak");
        tokio::fs::copy(&path, &bak_path).await?;
        Ok(())
    }

    pub async fn rebuild_index(&self) -> Result<usize> {
        let metas = scan_directory(&self.base)?;
        self.index.lock().await.rebuild_from(metas)
    }
}

fn scan_directory(base: &Path) -> Result<Vec<IndexedMeta>> {
    let mut metas = Vec::new();
    scan_dir_recursive(base, base, &mut metas)?;
    Ok(metas)
}

fn scan_dir_recursive(base: &Path, dir: &Path, out: &mut Vec<IndexedMeta>) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            scan_dir_recursive(base, &path, out)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
            if let Ok(bytes) = std::fs::read(&path) {
                if let Ok(loaded) = serde_json::from_slice::<LongTermEntry>(&bytes) {
                    out.push(IndexedMeta {
                        id: loaded.id.to_string(),
                        category: loaded.category,
                        tags: loaded.tags,
                        created_at: loaded.created_at,
                        updated_at: loaded.updated_at,
                        expires_at: None,
                    });
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn store(dir: &Path) -> LongTermMemory {
        LongTermMemory::open(
            dir.join("memory"),
            dir.join("memory.redb"),
            20,
            Bm25Params::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let entry = store
            .save("user prefers dark mode", Some("user-preferences/ui".into()), vec!["Pets".into()], None)
            .await
            .unwrap();

        let fetched = store.get(entry.id).await.unwrap().unwrap();
        assert_eq!(fetched.content, "user prefers dark mode");
        assert_eq!(fetched.tags, vec!["pets"]);
    }

    #[tokio::test]
    async fn search_filters_by_category_prefix_and_ranks_by_bm25() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.save("user likes dark mode themes", Some("user-preferences/ui".into()), vec![], None).await.unwrap();
        store.save("weather in paris is mild", Some("world-facts/weather".into()), vec![], None).await.unwrap();

        let results = store
            .search(&SearchCriteria {
                query: "dark mode".to_string(),
                category_prefix: Some("user-preferences".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert!(results[0].content.contains("dark mode"));
    }

    #[tokio::test]
    async fn delete_removes_entry_and_index_record() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let entry = store.save("temp fact", None, vec![], None).await.unwrap();

        assert!(store.delete(entry.id).await.unwrap());
        assert!(store.get(entry.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rebuild_index_recovers_from_directory_scan() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let entry = store.save("durable fact", Some("notes".into()), vec![], None).await.unwrap();

        // Simulate a lost/corrupt index by resetting it, then rebuild from disk.
        {
            let mut index = store.index.lock().await;
            *index = MemoryIndex::reset(index.path()).unwrap();
        }
        assert!(store.get(entry.id).await.unwrap().is_none());

        let rebuilt = store.rebuild_index().await.unwrap();
        assert_eq!(rebuilt, 1);
        assert!(store.get(entry.id).await.unwrap().is_some());
    }
}
