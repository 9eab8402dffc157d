//! Append-only JSONL event log, generic over the record type so the same
//! machinery backs long-term memory, skill-usage, feedback, and the
//! conversation log (spec §6 file layout) — exactly as the teacher uses one
//! event log format for its memory journal.

use std::fs;
use std::io::{BufRead, BufReader};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone)]
pub struct EventLog<T> {
    path: PathBuf,
    _marker: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> EventLog<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), _marker: PhantomData }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, event: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file =
            tokio::fs::OpenOptions::new().create(true).append(true).open(&self.path).await?;
        let line = serde_json::to_string(event)?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Atomically replace the log: write to a `.tmp` sibling, fsync, rename
    /// over the original. A crash before the rename leaves the original
    /// untouched; a crash after leaves a consistent new file.
    pub async fn overwrite(&self, events: &[T]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = {
            let filename =
                self.path.file_name().map(|f| f.to_string_lossy().to_string()).unwrap_or_default();
            self.path.with_file_name(format!("{filename}.tmp"))
        };

        let write_result: Result<()> = async {
            let mut file =
                tokio::fs::OpenOptions::new().create(true).write(true).truncate(true).open(&tmp_path).await?;
            for event in events {
                let line = serde_json::to_string(event)?;
                file.write_all(line.as_bytes()).await?;
                file.write_all(b"\n").await?;
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;

        if let Err(err) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        if let Err(err) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }

        Ok(())
    }

    /// Snapshot the live log to a `.bak` sibling before a destructive pass
    /// (e.g. consolidation). No-op if the source doesn't exist yet.
    pub fn backup(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let filename =
            self.path.file_name().map(|f| f.to_string_lossy().to_string()).unwrap_or_default();
        let bak_path = self.path.with_file_name(format!("{filename}.bak"));
        fs::copy(&self.path, &bak_path)?;
        Ok(())
    }

    pub fn load(&self) -> Result<Vec<T>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = fs::OpenOptions::new().read(true).open(&self.path)?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut corrupt_count = 0usize;

        for (line_idx, line_result) in reader.lines().enumerate() {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(&line) {
                Ok(event) => events.push(event),
                Err(err) => {
                    corrupt_count += 1;
                    tracing::warn!(
                        line = line_idx + 1,
                        error = %err,
                        path = %self.path.display(),
                        "corrupt JSONL record — skipping line (original preserved in .corrupt file)"
                    );
                    let corrupt_path = self.path.with_extension("jsonl.corrupt");
                    if let Ok(mut bad) =
                        fs::OpenOptions::new().create(true).append(true).open(&corrupt_path)
                    {
                        use std::io::Write as _;
                        let _ = writeln!(bad, "{line}");
                    }
                }
            }
        }

        if corrupt_count > 0 {
            tracing::warn!(
                corrupt_lines = corrupt_count,
                path = %self.path.display(),
                "event log loaded with skipped corrupt lines — inspect .corrupt sidecar"
            );
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use tempfile::tempdir;

    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Sample {
        n: u32,
    }

    #[tokio::test]
    async fn append_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let log = EventLog::<Sample>::new(dir.path().join("events.jsonl"));
        log.append(&Sample { n: 1 }).await.unwrap();
        log.append(&Sample { n: 2 }).await.unwrap();

        let loaded = log.load().unwrap();
        assert_eq!(loaded, vec![Sample { n: 1 }, Sample { n: 2 }]);
    }

    #[tokio::test]
    async fn corrupt_line_is_skipped_and_sidecar_written() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        tokio::fs::write(&path, b"{\"n\":1}\nnot json\n{\"n\":2}\n").await.unwrap();

        let log = EventLog::<Sample>::new(&path);
        let loaded = log.load().unwrap();
        assert_eq!(loaded, vec![Sample { n: 1 }, Sample { n: 2 }]);
        assert!(path.with_extension("jsonl.corrupt").exists());
    }

    #[tokio::test]
    async fn overwrite_replaces_contents_atomically() {
        let dir = tempdir().unwrap();
        let log = EventLog::<Sample>::new(dir.path().join("events.jsonl"));
        log.append(&Sample { n: 1 }).await.unwrap();
        log.overwrite(&[Sample { n: 9 }]).await.unwrap();

        assert_eq!(log.load().unwrap(), vec![Sample { n: 9 }]);
    }
}
