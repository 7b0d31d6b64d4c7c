//! Process-wide (project, task) index used for spawn deduplication.
//!
//! Backed by a single JSON file with a short in-memory TTL cache. The
//! registry never owns a task; it only answers "is something already running
//! or finished for this key" so concurrent dispatch paths cannot double-spawn.

use crate::store;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

/// TTL for the in-memory snapshot before rereading the file.
const CACHE_TTL_MS: u128 = 5_000;

/// Status of a registered (project, task) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RegistryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One registry entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub status: RegistryStatus,
    pub run_id: String,
    pub phase_number: u32,
    pub worker_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Ledger work item tracking this spawn, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_id: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Answer to a [`TaskRegistry::can_spawn`] query.
#[derive(Debug, Clone)]
pub struct SpawnCheck {
    pub can_spawn: bool,
    pub reason: Option<String>,
    pub existing: Option<RegistryEntry>,
}

/// A candidate that was filtered out, with the reason.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedTask {
    pub task_id: String,
    pub reason: String,
}

/// The on-disk shape: flat `project:task` key map.
type RegistryFile = HashMap<String, RegistryEntry>;

/// JSON-file-backed dedup index with a 5-second read cache.
pub struct TaskRegistry {
    path: PathBuf,
    cache: Option<(Instant, RegistryFile)>,
}

fn key(project: &str, task_id: &str) -> String {
    format!("{project}:{task_id}")
}

impl TaskRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: None,
        }
    }

    fn load(&mut self) -> Result<RegistryFile> {
        if let Some((at, entries)) = &self.cache
            && at.elapsed().as_millis() < CACHE_TTL_MS
        {
            return Ok(entries.clone());
        }
        let entries: RegistryFile = store::read_json(&self.path)?.unwrap_or_default();
        self.cache = Some((Instant::now(), entries.clone()));
        Ok(entries)
    }

    fn save(&mut self, entries: RegistryFile) -> Result<()> {
        store::write_json_atomic(&self.path, &entries)?;
        self.cache = Some((Instant::now(), entries));
        Ok(())
    }

    /// False iff an existing entry is `running` or `completed`. A failed or
    /// cancelled entry (or none at all) may spawn again.
    pub fn can_spawn(&mut self, project: &str, task_id: &str) -> Result<SpawnCheck> {
        let entries = self.load()?;
        match entries.get(&key(project, task_id)) {
            Some(entry) if matches!(entry.status, RegistryStatus::Running) => Ok(SpawnCheck {
                can_spawn: false,
                reason: Some(format!(
                    "already running in run {} (worker {})",
                    entry.run_id, entry.worker_id
                )),
                existing: Some(entry.clone()),
            }),
            Some(entry) if matches!(entry.status, RegistryStatus::Completed) => Ok(SpawnCheck {
                can_spawn: false,
                reason: Some("already completed".to_string()),
                existing: Some(entry.clone()),
            }),
            other => Ok(SpawnCheck {
                can_spawn: true,
                reason: None,
                existing: other.cloned(),
            }),
        }
    }

    /// Register a task as running. Callers hold the registry path lock across
    /// `can_spawn` + `register` so racing dispatchers serialize here.
    pub fn register(
        &mut self,
        project: &str,
        task_id: &str,
        run_id: &str,
        phase_number: u32,
        worker_id: &str,
        branch: Option<String>,
        work_id: Option<String>,
    ) -> Result<()> {
        let mut entries = self.load()?;
        entries.insert(
            key(project, task_id),
            RegistryEntry {
                status: RegistryStatus::Running,
                run_id: run_id.to_string(),
                phase_number,
                worker_id: worker_id.to_string(),
                branch,
                work_id,
                started_at: Utc::now(),
                completed_at: None,
                error: None,
            },
        );
        self.save(entries)
    }

    pub fn update_status(
        &mut self,
        project: &str,
        task_id: &str,
        status: RegistryStatus,
        error: Option<String>,
    ) -> Result<()> {
        let mut entries = self.load()?;
        if let Some(entry) = entries.get_mut(&key(project, task_id)) {
            entry.status = status;
            entry.error = error;
            if matches!(
                status,
                RegistryStatus::Completed | RegistryStatus::Failed | RegistryStatus::Cancelled
            ) {
                entry.completed_at = Some(Utc::now());
            }
            self.save(entries)?;
        }
        Ok(())
    }

    pub fn get(&mut self, project: &str, task_id: &str) -> Result<Option<RegistryEntry>> {
        Ok(self.load()?.get(&key(project, task_id)).cloned())
    }

    /// Entries for one run, keyed by task id.
    pub fn by_run(&mut self, run_id: &str) -> Result<Vec<(String, RegistryEntry)>> {
        let entries = self.load()?;
        Ok(entries
            .into_iter()
            .filter(|(_, e)| e.run_id == run_id)
            .map(|(k, e)| {
                let task_id = k.split_once(':').map(|(_, t)| t.to_string()).unwrap_or(k);
                (task_id, e)
            })
            .collect())
    }

    /// Sweep entries stuck in `running` past `max_age` and mark them failed.
    /// Returns the affected task keys.
    pub fn clear_stale(&mut self, max_age: Duration) -> Result<Vec<String>> {
        let mut entries = self.load()?;
        let cutoff = Utc::now() - max_age;
        let mut swept = Vec::new();
        for (k, entry) in entries.iter_mut() {
            if entry.status == RegistryStatus::Running && entry.started_at < cutoff {
                entry.status = RegistryStatus::Failed;
                entry.completed_at = Some(Utc::now());
                entry.error = Some("stale: no completion within deadline".to_string());
                swept.push(k.clone());
            }
        }
        if !swept.is_empty() {
            self.save(entries)?;
        }
        Ok(swept)
    }

    /// Batch form of [`can_spawn`]: partition candidates into spawnable task
    /// ids and skipped ones with reasons.
    pub fn filter_spawnable(
        &mut self,
        project: &str,
        candidates: &[String],
    ) -> Result<(Vec<String>, Vec<SkippedTask>)> {
        let mut spawnable = Vec::new();
        let mut skipped = Vec::new();
        for task_id in candidates {
            let check = self.can_spawn(project, task_id)?;
            if check.can_spawn {
                spawnable.push(task_id.clone());
            } else {
                skipped.push(SkippedTask {
                    task_id: task_id.clone(),
                    reason: check.reason.unwrap_or_else(|| "not spawnable".to_string()),
                });
            }
        }
        Ok((spawnable, skipped))
    }

    /// Drop the read cache so the next query rereads the file.
    pub fn invalidate(&mut self) {
        self.cache = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn registry(dir: &std::path::Path) -> TaskRegistry {
        TaskRegistry::new(dir.join("task-registry.json"))
    }

    #[test]
    fn absent_entry_can_spawn() {
        let dir = tempdir().unwrap();
        let mut reg = registry(dir.path());
        let check = reg.can_spawn("proj", "t1").unwrap();
        assert!(check.can_spawn);
        assert!(check.existing.is_none());
    }

    #[test]
    fn running_entry_blocks_respawn() {
        let dir = tempdir().unwrap();
        let mut reg = registry(dir.path());
        reg.register("proj", "t1", "run-1", 1, "w1", Some("swarmops/run-1/w1".into()), None)
            .unwrap();

        let check = reg.can_spawn("proj", "t1").unwrap();
        assert!(!check.can_spawn);
        assert!(check.reason.unwrap().contains("already running"));

        // Other project keys do not collide
        assert!(reg.can_spawn("other", "t1").unwrap().can_spawn);
    }

    #[test]
    fn completed_blocks_failed_allows() {
        let dir = tempdir().unwrap();
        let mut reg = registry(dir.path());
        reg.register("proj", "t1", "run-1", 1, "w1", None, None).unwrap();
        reg.update_status("proj", "t1", RegistryStatus::Completed, None)
            .unwrap();
        assert!(!reg.can_spawn("proj", "t1").unwrap().can_spawn);

        reg.register("proj", "t2", "run-1", 1, "w2", None, None).unwrap();
        reg.update_status("proj", "t2", RegistryStatus::Failed, Some("spawn refused".into()))
            .unwrap();
        assert!(reg.can_spawn("proj", "t2").unwrap().can_spawn);
    }

    #[test]
    fn filter_spawnable_partitions() {
        let dir = tempdir().unwrap();
        let mut reg = registry(dir.path());
        reg.register("proj", "busy", "run-1", 1, "w1", None, None).unwrap();

        let (spawnable, skipped) = reg
            .filter_spawnable(
                "proj",
                &["busy".to_string(), "fresh".to_string()],
            )
            .unwrap();
        assert_eq!(spawnable, vec!["fresh".to_string()]);
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].task_id, "busy");
    }

    #[test]
    fn clear_stale_sweeps_old_running_entries() {
        let dir = tempdir().unwrap();
        let mut reg = registry(dir.path());
        reg.register("proj", "t1", "run-1", 1, "w1", None, None).unwrap();

        // Nothing is stale yet
        assert!(reg.clear_stale(Duration::minutes(10)).unwrap().is_empty());

        // Everything is stale with a zero deadline
        let swept = reg.clear_stale(Duration::zero()).unwrap();
        assert_eq!(swept, vec!["proj:t1".to_string()]);
        let entry = reg.get("proj", "t1").unwrap().unwrap();
        assert_eq!(entry.status, RegistryStatus::Failed);
        assert!(reg.can_spawn("proj", "t1").unwrap().can_spawn);
    }

    #[test]
    fn state_survives_reload() {
        let dir = tempdir().unwrap();
        {
            let mut reg = registry(dir.path());
            reg.register("proj", "t1", "run-1", 2, "w1", None, None).unwrap();
        }
        let mut reg = registry(dir.path());
        let entry = reg.get("proj", "t1").unwrap().unwrap();
        assert_eq!(entry.phase_number, 2);
        assert_eq!(entry.status, RegistryStatus::Running);
    }

    #[test]
    fn by_run_strips_project_prefix() {
        let dir = tempdir().unwrap();
        let mut reg = registry(dir.path());
        reg.register("proj", "t1", "run-1", 1, "w1", None, None).unwrap();
        reg.register("proj", "t2", "run-2", 1, "w2", None, None).unwrap();
        let entries = reg.by_run("run-1").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "t1");
    }
}
