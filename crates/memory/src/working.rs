//! Working Memory (spec §4.6): a TTL-scoped, path-keyed scratch space that
//! mirrors the Long-Term Memory contract shape (`crate::long_term`) but is
//! keyed rather than id'd, and where a value's visibility is gated by
//! `now < expires_at` rather than by deletion. Storage is one file per key
//! under `{base}/{key}.json` (the key's own path segments become the
//! on-disk directory structure), indexed the same way long-term memory is
//! indexed — see `crate::index::MemoryIndex` — with an `expires_at` column
//! live-pruned before every list/search.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::bm25::{score_corpus, Bm25Params};
use crate::index::{IndexedMeta, MemoryIndex};
use crate::schema::{normalize_tags, sanitize_category, WorkingMemoryEntry};

#[derive(Debug, Clone, Default)]
pub struct WorkingSearchCriteria {
    pub query: String,
    pub category_prefix: Option<String>,
    pub tags: Vec<String>,
    pub max_results: Option<usize>,
}

pub struct WorkingMemory {
    base: PathBuf,
    index: Mutex<MemoryIndex>,
    default_ttl: chrono::Duration,
    max_entries: usize,
    default_max_results: usize,
    bm25: Bm25Params,
}

impl WorkingMemory {
    pub fn open(
        base: impl Into<PathBuf>,
        index_path: impl AsRef<Path>,
        default_ttl_secs: i64,
        max_entries: usize,
        default_max_results: usize,
        bm25: Bm25Params,
    ) -> Result<Self> {
        let base = base.into();
        std::fs::create_dir_all(&base)?;
        let mut index = MemoryIndex::open(index_path)?;
        if index.is_empty()? {
            let metas = scan_directory(&base)?;
            index.rebuild_from(metas)?;
        }
        Ok(Self {
            base,
            index: Mutex::new(index),
            default_ttl: chrono::Duration::seconds(default_ttl_secs),
            max_entries,
            default_max_results,
            bm25,
        })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.base.join(format!("{key}.json"))
    }

    /// Sets `key` to `value`, replacing any prior value. `ttl` defaults to
    /// the store's configured default when `None`. If setting this entry
    /// would exceed `maxEntries`, the entry nearest expiry (across the
    /// whole namespace this store instance covers) is evicted first.
    pub async fn set(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
        ttl: Option<chrono::Duration>,
        category: Option<String>,
        tags: Vec<String>,
    ) -> Result<WorkingMemoryEntry> {
        let key = key.into();
        let now = Utc::now();
        let entry = WorkingMemoryEntry {
            key: key.clone(),
            value: value.into(),
            stored_at: now,
            expires_at: now + ttl.unwrap_or(self.default_ttl),
            category: category.and_then(|c| sanitize_category(&c)),
            tags: normalize_tags(tags),
        };

        self.evict_if_over_capacity(&key).await?;
        self.write_entry(&entry).await?;
        Ok(entry)
    }

    async fn write_entry(&self, entry: &WorkingMemoryEntry) -> Result<()> {
        let path = self.key_path(&entry.key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, serde_json::to_vec_pretty(entry)?).await?;

        self.index.lock().await.insert(&IndexedMeta {
            id: entry.key.clone(),
            category: entry.category.clone(),
            tags: entry.tags.clone(),
            created_at: entry.stored_at,
            updated_at: None,
            expires_at: Some(entry.expires_at),
        })?;
        Ok(())
    }

    async fn evict_if_over_capacity(&self, incoming_key: &str) -> Result<()> {
        let metas = self.index.lock().await.all()?;
        let others: Vec<&IndexedMeta> = metas.iter().filter(|m| m.id != incoming_key).collect();
        if others.len() + 1 <= self.max_entries {
            return Ok(());
        }
        if let Some(nearest) = others.iter().min_by_key(|m| m.expires_at.unwrap_or(DateTime::<Utc>::MAX_UTC)) {
            self.delete(&nearest.id).await?;
        }
        Ok(())
    }

    /// Returns the value iff `now < expiresAt`; otherwise behaves as if the
    /// key were absent (the file is left for the background sweep, not
    /// deleted eagerly, so a racing write to the same key doesn't clobber
    /// a just-set value — see `sweep_expired`).
    pub async fn get(&self, key: &str) -> Result<Option<WorkingMemoryEntry>> {
        let meta = self.index.lock().await.get(key)?;
        let Some(meta) = meta else { return Ok(None) };
        if meta.expires_at.map(|exp| Utc::now() >= exp).unwrap_or(false) {
            return Ok(None);
        }
        let path = self.key_path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let Some(_) = self.index.lock().await.get(key)? else { return Ok(false) };
        let _ = tokio::fs::remove_file(self.key_path(key)).await;
        self.index.lock().await.remove(key)?;
        Ok(true)
    }

    pub async fn clear(&self) -> Result<()> {
        let metas = self.index.lock().await.all()?;
        for meta in metas {
            self.delete(&meta.id).await?;
        }
        Ok(())
    }

    /// Drops expired entries from disk and index. Called before list/search
    /// per spec §4.6's "live pruning happens before list/search".
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let metas = self.index.lock().await.all()?;
        let expired: Vec<String> =
            metas.into_iter().filter(|m| m.expires_at.map(|e| now >= e).unwrap_or(false)).map(|m| m.id).collect();
        for key in &expired {
            self.delete(key).await?;
        }
        Ok(expired.len())
    }

    pub async fn list(&self) -> Result<Vec<WorkingMemoryEntry>> {
        self.sweep_expired().await?;
        let metas = self.index.lock().await.all()?;
        let mut entries = Vec::with_capacity(metas.len());
        for meta in metas {
            if let Some(entry) = self.get(&meta.id).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub async fn search(&self, criteria: &WorkingSearchCriteria) -> Result<Vec<WorkingMemoryEntry>> {
        self.sweep_expired().await?;
        let wanted_tags = normalize_tags(criteria.tags.clone());
        let metas = self.index.lock().await.all()?;

        let mut candidates: Vec<IndexedMeta> = metas
            .into_iter()
            .filter(|m| match &criteria.category_prefix {
                Some(prefix) => m.category.as_deref().map(|c| c.starts_with(prefix.as_str())).unwrap_or(false),
                None => true,
            })
            .filter(|m| wanted_tags.is_empty() || wanted_tags.iter().any(|t| m.tags.contains(t)))
            .collect();

        candidates.sort_by(|a, b| a.id.cmp(&b.id));

        let mut entries = Vec::with_capacity(candidates.len());
        for meta in &candidates {
            if let Some(entry) = self.get(&meta.id).await? {
                entries.push(entry);
            }
        }

        let contents: Vec<&str> = entries.iter().map(|e| e.value.as_str()).collect();
        let mut scored = score_corpus(&criteria.query, &contents, &self.bm25);
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        let limit = criteria.max_results.unwrap_or(self.default_max_results);
        Ok(scored.into_iter().take(limit).map(|(i, _)| entries[i].clone()).collect())
    }

    /// Replays unexpired entries from disk into the index on process
    /// restart (spec: "Live restoration on process restart replays
    /// unexpired entries from disk").
    pub async fn restore(&self) -> Result<usize> {
        let metas = scan_directory(&self.base)?;
        let live: Vec<IndexedMeta> =
            metas.into_iter().filter(|m| m.expires_at.map(|e| Utc::now() < e).unwrap_or(false)).collect();
        let count = live.len();
        self.index.lock().await.rebuild_from(live)?;
        Ok(count)
    }
}

fn scan_directory(base: &Path) -> Result<Vec<IndexedMeta>> {
    let mut metas = Vec::new();
    scan_dir_recursive(base, &mut metas)?;
    Ok(metas)
}

fn scan_dir_recursive(dir: &Path, out: &mut Vec<IndexedMeta>) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            scan_dir_recursive(&path, out)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
            if let Ok(bytes) = std::fs::read(&path) {
                if let Ok(loaded) = serde_json::from_slice::<WorkingMemoryEntry>(&bytes) {
                    out.push(IndexedMeta {
                        id: loaded.key,
                        category: loaded.category,
                        tags: loaded.tags,
                        created_at: loaded.stored_at,
                        updated_at: None,
                        expires_at: Some(loaded.expires_at),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Synthesizes the chunked-tool-result key form `{namespace}/tool/{callId}`
/// used by the loop runner's chunking policy (spec §4.2 step 4, §4.6).
pub fn chunked_tool_result_key(namespace: &str, call_id: &str) -> String {
    format!("{namespace}/tool/{call_id}")
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn store(dir: &Path, max_entries: usize) -> WorkingMemory {
        WorkingMemory::open(dir.join("wm"), dir.join("wm.redb"), 3600, max_entries, 20, Bm25Params::default())
            .unwrap()
    }

    #[tokio::test]
    async fn ttl_gates_visibility() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 100);
        store.set("session/s1/k", "v", Some(chrono::Duration::milliseconds(200)), None, vec![]).await.unwrap();

        assert!(store.get("session/s1/k").await.unwrap().is_some());
        tokio::time::sleep(std::time::Duration::from_millis(350)).await;
        assert!(store.get("session/s1/k").await.unwrap().is_none());

        let listed = store.list().await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn eviction_drops_nearest_expiry_first_over_capacity() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 2);
        store.set("a", "v", Some(chrono::Duration::seconds(10)), None, vec![]).await.unwrap();
        store.set("b", "v", Some(chrono::Duration::seconds(1)), None, vec![]).await.unwrap();
        store.set("c", "v", Some(chrono::Duration::seconds(10)), None, vec![]).await.unwrap();

        assert!(store.get("b").await.unwrap().is_none());
        assert!(store.get("a").await.unwrap().is_some());
        assert!(store.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn search_is_category_prefixed_and_bm25_ranked() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 100);
        store
            .set(
                "patrol/morning/notes",
                "weather is sunny and mild",
                Some(chrono::Duration::seconds(300)),
                Some("patrol/morning".into()),
                vec![],
            )
            .await
            .unwrap();
        store
            .set(
                "session/s1/scratch",
                "the server logs show a crash",
                Some(chrono::Duration::seconds(300)),
                Some("session/s1".into()),
                vec![],
            )
            .await
            .unwrap();

        let results = store
            .search(&WorkingSearchCriteria {
                query: "sunny weather".into(),
                category_prefix: Some("patrol".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].value.contains("sunny"));
    }
}
