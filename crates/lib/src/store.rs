//! Atomic JSON and JSONL file I/O for the state directory.
//!
//! Every persistent store (sessions, paired nodes, cron jobs) writes through
//! here: serialize to a temp file in the same directory, then rename over the
//! target so readers never observe a torn write. Appends (session transcripts)
//! go to JSONL files, one JSON object per line.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Serialized writer for one JSON file. Concurrent writers queue on the
/// internal lock so read-modify-write cycles never interleave.
pub struct JsonFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and deserialize the file. Missing file yields `None`.
    pub async fn read<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(s) => {
                let v = serde_json::from_str(&s)
                    .with_context(|| format!("parsing {}", self.path.display()))?;
                Ok(Some(v))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", self.path.display())),
        }
    }

    /// Serialize and atomically replace the file (temp + rename).
    pub async fn write<T: Serialize>(&self, value: &T) -> Result<()> {
        let _g = self.lock.lock().await;
        self.write_locked(value).await
    }

    /// Read-modify-write under the file lock. `f` receives the current on-disk
    /// value (or `None`) and returns the value to persist.
    pub async fn update<T, F>(&self, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Clone,
        F: FnOnce(Option<T>) -> T,
    {
        let _g = self.lock.lock().await;
        let current = match tokio::fs::read_to_string(&self.path).await {
            Ok(s) => serde_json::from_str(&s).ok(),
            Err(_) => None,
        };
        let next = f(current);
        self.write_locked(&next).await?;
        Ok(next)
    }

    async fn write_locked<T: Serialize>(&self, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value).context("serializing store")?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json.as_bytes())
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("renaming into {}", self.path.display()))?;
        Ok(())
    }
}

/// Append one JSON object as a line to a JSONL file, creating parents as needed.
pub async fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut line = serde_json::to_string(value).context("serializing jsonl record")?;
    line.push('\n');
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    file.write_all(line.as_bytes())
        .await
        .with_context(|| format!("appending to {}", path.display()))?;
    Ok(())
}

/// Read all records from a JSONL file. Missing file yields an empty list;
/// unparseable lines are skipped.
pub async fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let s = match tokio::fs::read_to_string(path).await {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    Ok(s.lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Rec {
        name: String,
        n: u32,
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let file = JsonFile::new(dir.path().join("rec.json"));
        let rec = Rec {
            name: "a".into(),
            n: 7,
        };
        file.write(&rec).await.unwrap();
        let back: Option<Rec> = file.read().await.unwrap();
        assert_eq!(back, Some(rec));
    }

    #[tokio::test]
    async fn update_sees_on_disk_value() {
        let dir = tempfile::tempdir().unwrap();
        let file = JsonFile::new(dir.path().join("rec.json"));
        file.write(&Rec {
            name: "a".into(),
            n: 1,
        })
        .await
        .unwrap();
        let next = file
            .update(|cur: Option<Rec>| {
                let mut v = cur.unwrap();
                v.n += 1;
                v
            })
            .await
            .unwrap();
        assert_eq!(next.n, 2);
    }

    #[tokio::test]
    async fn jsonl_appends_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        for n in 0..3 {
            append_jsonl(
                &path,
                &Rec {
                    name: "x".into(),
                    n,
                },
            )
            .await
            .unwrap();
        }
        let recs: Vec<Rec> = read_jsonl(&path).await.unwrap();
        assert_eq!(recs.iter().map(|r| r.n).collect::<Vec<_>>(), vec![0, 1, 2]);
    }
}
