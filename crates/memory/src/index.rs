//! Secondary index backed by [`redb`] with an LRU front cache, generalized
//! from the teacher's single "entries" table (keyed by UUID, one tier-slug
//! lookup table) into one index per store (long-term memory, working
//! memory) with an `expires_at` column for working memory's TTL sweep.
//!
//! The directory of one-file-per-entry JSON documents remains canonical;
//! this index exists so category/tag/TTL filtering doesn't require a full
//! directory scan on every search. It is rebuilt transparently from that
//! directory if the index file is missing or corrupt — zero data loss.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use lru::LruCache;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};

const ENTRIES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");

#[derive(Debug, Clone, Default)]
pub struct IndexCacheStats {
    pub capacity: usize,
    pub len: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate_pct: f32,
}

/// Compact metadata kept in the index for one entry (long-term or working
/// memory). `expires_at` is `None` for long-term entries, which have no TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedMeta {
    pub id: String,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

const LRU_CAPACITY: usize = 256;

pub struct MemoryIndex {
    db: Database,
    path: PathBuf,
    cache: LruCache<String, String>,
    cache_hits: u64,
    cache_misses: u64,
}

impl MemoryIndex {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(&path)
            .with_context(|| format!("opening redb index at {}", path.display()))?;

        {
            let tx = db.begin_write()?;
            tx.open_table(ENTRIES_TABLE)?;
            tx.commit()?;
        }

        Ok(Self {
            db,
            path,
            cache: LruCache::new(NonZeroUsize::new(LRU_CAPACITY).unwrap()),
            cache_hits: 0,
            cache_misses: 0,
        })
    }

    pub fn reset(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Self::open(path)
    }

    pub fn insert(&mut self, meta: &IndexedMeta) -> Result<()> {
        let bytes = serde_json::to_vec(meta)?;
        let tx = self.db.begin_write()?;
        {
            let mut tbl = tx.open_table(ENTRIES_TABLE)?;
            tbl.insert(meta.id.as_str(), bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Result<()> {
        let tx = self.db.begin_write()?;
        {
            let mut tbl = tx.open_table(ENTRIES_TABLE)?;
            tbl.remove(id)?;
        }
        tx.commit()?;
        self.cache.pop(id);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<IndexedMeta>> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(ENTRIES_TABLE)?;
        match tbl.get(id)? {
            None => Ok(None),
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
        }
    }

    /// All indexed metadata records, for category/tag/TTL filtering.
    pub fn all(&self) -> Result<Vec<IndexedMeta>> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(ENTRIES_TABLE)?;
        let mut out = Vec::new();
        for row in tbl.iter()? {
            let (_, v) = row?;
            out.push(serde_json::from_slice(v.value())?);
        }
        Ok(out)
    }

    pub fn cache_get(&mut self, id: &str) -> Option<&str> {
        match self.cache.get(id) {
            Some(v) => {
                self.cache_hits += 1;
                Some(v.as_str())
            }
            None => {
                self.cache_misses += 1;
                None
            }
        }
    }

    pub fn cache_put(&mut self, id: String, content: String) {
        self.cache.put(id, content);
    }

    /// Wipe and repopulate from an external source of truth (a directory
    /// scan, typically), for startup recovery when the index is missing or
    /// stale relative to the on-disk files.
    pub fn rebuild_from(&mut self, metas: impl IntoIterator<Item = IndexedMeta>) -> Result<usize> {
        {
            let tx = self.db.begin_write()?;
            {
                let mut tbl = tx.open_table(ENTRIES_TABLE)?;
                let keys: Vec<String> =
                    tbl.iter()?.filter_map(|r| r.ok().map(|(k, _)| k.value().to_string())).collect();
                for k in &keys {
                    tbl.remove(k.as_str())?;
                }
            }
            tx.commit()?;
        }
        self.cache.clear();

        let mut count = 0;
        for meta in metas {
            self.insert(&meta)?;
            count += 1;
        }
        tracing::info!(entries = count, path = %self.path.display(), "memory index rebuilt");
        Ok(count)
    }

    pub fn cache_stats(&self) -> IndexCacheStats {
        IndexCacheStats {
            capacity: LRU_CAPACITY,
            len: self.cache.len(),
            hits: self.cache_hits,
            misses: self.cache_misses,
            hit_rate_pct: if self.cache_hits + self.cache_misses == 0 {
                0.0
            } else {
                (self.cache_hits as f32 / (self.cache_hits + self.cache_misses) as f32) * 100.0
            },
        }
    }

    pub fn len(&self) -> Result<usize> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(ENTRIES_TABLE)?;
        Ok(tbl.len()? as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn meta(id: &str, category: Option<&str>) -> IndexedMeta {
        IndexedMeta {
            id: id.to_string(),
            category: category.map(str::to_string),
            tags: Vec::new(),
            created_at: Utc::now(),
            updated_at: None,
            expires_at: None,
        }
    }

    #[test]
    fn insert_and_get_round_trip() {
        let dir = tempdir().unwrap();
        let mut index = MemoryIndex::open(dir.path().join("idx.redb")).unwrap();
        index.insert(&meta("a", Some("user-preferences/pets"))).unwrap();

        let fetched = index.get("a").unwrap().unwrap();
        assert_eq!(fetched.category.as_deref(), Some("user-preferences/pets"));
    }

    #[test]
    fn rebuild_replaces_prior_contents() {
        let dir = tempdir().unwrap();
        let mut index = MemoryIndex::open(dir.path().join("idx.redb")).unwrap();
        index.insert(&meta("stale", None)).unwrap();

        index.rebuild_from(vec![meta("fresh", None)]).unwrap();
        assert!(index.get("stale").unwrap().is_none());
        assert!(index.get("fresh").unwrap().is_some());
    }
}
