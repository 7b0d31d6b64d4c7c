//! Filesystem persistence primitives shared by every stateful subsystem.
//!
//! Single-file JSON state goes through [`write_json_atomic`] (tmp, fsync,
//! rename). Append-only feeds go through [`append_jsonl`] under an advisory
//! file lock. Multi-step read-modify-write sequences on one JSON file are
//! serialized by [`PathLocks`], a per-path mutex map.

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

/// Read and deserialize a JSON file. A missing file is `Ok(None)`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    };
    let value = serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to parse JSON in {}", path.display()))?;
    Ok(Some(value))
}

/// Write a JSON file atomically: serialize to `<path>.tmp`, fsync, rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value).context("Failed to serialize state")?;
    write_atomic_bytes(path, &json)
}

/// Atomic byte-level rewrite, same tmp/fsync/rename discipline as
/// [`write_json_atomic`]. Used for non-JSON documents (progress.md).
pub fn write_atomic_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        file.write_all(bytes)?;
        file.sync_all()
            .with_context(|| format!("Failed to fsync {}", tmp.display()))?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to rename {} into place", tmp.display()))?;
    Ok(())
}

/// Append one record as a single JSON line. The write holds an exclusive
/// advisory lock so interleaved appends from other handles stay whole-line.
pub fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(record).context("Failed to serialize record")?;
    line.push('\n');
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.lock_exclusive()
        .with_context(|| format!("Failed to lock {}", path.display()))?;
    let result = (&file)
        .write_all(line.as_bytes())
        .with_context(|| format!("Failed to append to {}", path.display()));
    let _ = fs2::FileExt::unlock(&file);
    result
}

/// Fold every parseable record of a JSONL file through `accept`, line order.
/// Individual bad lines log a warning and are skipped; a missing file is a
/// no-op.
pub fn read_jsonl_fold<T, F>(path: &Path, mut accept: F) -> Result<()>
where
    T: DeserializeOwned,
    F: FnMut(T),
{
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to open {}", path.display()));
        }
    };
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(&line) {
            Ok(record) => accept(record),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    line = lineno + 1,
                    error = %e,
                    "skipping unparseable ledger line"
                );
            }
        }
    }
    Ok(())
}

/// Per-path async mutex map enforcing the single-writer invariant on JSON
/// state files. Callers hold the guard across their read-modify-write.
#[derive(Default)]
pub struct PathLocks {
    locks: std::sync::Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or create) the lock guarding `path`.
    pub fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("path lock table poisoned");
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Probe {
        id: String,
        n: u32,
    }

    #[test]
    fn read_json_missing_file_is_none() {
        let dir = tempdir().unwrap();
        let got: Option<Probe> = read_json(&dir.path().join("absent.json")).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn write_then_read_json_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/state.json");
        let value = Probe {
            id: "a".into(),
            n: 3,
        };
        write_json_atomic(&path, &value).unwrap();
        let got: Option<Probe> = read_json(&path).unwrap();
        assert_eq!(got, Some(value));
        // No tmp file left behind
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn write_json_atomic_replaces_existing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_json_atomic(&path, &Probe { id: "a".into(), n: 1 }).unwrap();
        write_json_atomic(&path, &Probe { id: "a".into(), n: 2 }).unwrap();
        let got: Probe = read_json(&path).unwrap().unwrap();
        assert_eq!(got.n, 2);
    }

    #[test]
    fn append_jsonl_accumulates_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("feed.jsonl");
        for n in 0..3 {
            append_jsonl(&path, &Probe { id: "x".into(), n }).unwrap();
        }
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 3);
    }

    #[test]
    fn read_jsonl_fold_skips_bad_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("feed.jsonl");
        append_jsonl(&path, &Probe { id: "a".into(), n: 1 }).unwrap();
        {
            use std::io::Write as _;
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(file, "{{not json").unwrap();
        }
        append_jsonl(&path, &Probe { id: "b".into(), n: 2 }).unwrap();

        let mut seen = Vec::new();
        read_jsonl_fold::<Probe, _>(&path, |p| seen.push(p.id)).unwrap();
        assert_eq!(seen, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn read_jsonl_fold_missing_file_is_noop() {
        let dir = tempdir().unwrap();
        let mut count = 0;
        read_jsonl_fold::<Probe, _>(&dir.path().join("absent.jsonl"), |_| count += 1).unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn path_locks_returns_same_lock_per_path() {
        let locks = PathLocks::new();
        let a1 = locks.lock_for(Path::new("/tmp/a.json"));
        let a2 = locks.lock_for(Path::new("/tmp/a.json"));
        let b = locks.lock_for(Path::new("/tmp/b.json"));
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));

        // Holding a1 blocks a2 until released
        let guard = a1.lock().await;
        assert!(a2.try_lock().is_err());
        drop(guard);
        assert!(a2.try_lock().is_ok());
    }
}
