//! Human-visible queue of failures that exhausted their automated budget.
//!
//! Escalations only terminate by operator action (resolve or dismiss), with
//! one exception: when a previously failed task later completes, its open
//! escalations auto-close through [`EscalationStore::resolve_by_task`].

use crate::errors::WorkError;
use crate::store;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    Open,
    Resolved,
    Dismissed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationNote {
    pub at: DateTime<Utc>,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub id: String,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    pub phase_number: u32,
    pub step_order: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub message: String,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub severity: Severity,
    pub status: EscalationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default)]
    pub notes: Vec<EscalationNote>,
}

/// Parameters for [`EscalationStore::create`].
#[derive(Debug, Clone, Default)]
pub struct EscalationParams {
    pub run_id: String,
    pub pipeline: Option<String>,
    pub phase_number: u32,
    pub step_order: u64,
    pub role_id: Option<String>,
    pub task_id: Option<String>,
    pub message: String,
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// When `None`, severity is derived from the attempt counts.
    pub severity: Option<Severity>,
}

/// Aggregate counts for the dashboard.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EscalationStats {
    pub total: usize,
    pub open: usize,
    pub resolved: usize,
    pub dismissed: usize,
    pub by_severity: HashMap<String, usize>,
}

/// Fully exhausted budgets rank high; anything that failed more than once is
/// at least medium.
fn derive_severity(attempt_count: u32, max_attempts: u32) -> Severity {
    if attempt_count >= max_attempts && max_attempts >= 3 {
        Severity::High
    } else if attempt_count > 1 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Single-JSON-file escalation queue.
pub struct EscalationStore {
    path: PathBuf,
    entries: Vec<Escalation>,
    loaded: bool,
}

impl EscalationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Vec::new(),
            loaded: false,
        }
    }

    fn load(&mut self) -> Result<()> {
        if self.loaded {
            return Ok(());
        }
        self.entries = store::read_json(&self.path)?.unwrap_or_default();
        self.loaded = true;
        Ok(())
    }

    fn save(&self) -> Result<()> {
        store::write_json_atomic(&self.path, &self.entries)
    }

    pub fn create(&mut self, params: EscalationParams) -> Result<Escalation> {
        self.load()?;
        let now = Utc::now();
        let severity = params
            .severity
            .unwrap_or_else(|| derive_severity(params.attempt_count, params.max_attempts));
        let escalation = Escalation {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: params.run_id,
            pipeline: params.pipeline,
            phase_number: params.phase_number,
            step_order: params.step_order,
            role_id: params.role_id,
            task_id: params.task_id,
            message: params.message,
            attempt_count: params.attempt_count,
            max_attempts: params.max_attempts,
            severity,
            status: EscalationStatus::Open,
            created_at: now,
            updated_at: now,
            resolved_at: None,
            resolution: None,
            resolved_by: None,
            notes: Vec::new(),
        };
        self.entries.push(escalation.clone());
        self.save()?;
        Ok(escalation)
    }

    pub fn get(&mut self, id: &str) -> Result<Option<Escalation>> {
        self.load()?;
        Ok(self.entries.iter().find(|e| e.id == id).cloned())
    }

    pub fn list_open(&mut self) -> Result<Vec<Escalation>> {
        self.load()?;
        Ok(self
            .entries
            .iter()
            .filter(|e| e.status == EscalationStatus::Open)
            .cloned()
            .collect())
    }

    pub fn by_run(&mut self, run_id: &str) -> Result<Vec<Escalation>> {
        self.load()?;
        Ok(self
            .entries
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect())
    }

    pub fn by_pipeline(&mut self, pipeline: &str) -> Result<Vec<Escalation>> {
        self.load()?;
        Ok(self
            .entries
            .iter()
            .filter(|e| e.pipeline.as_deref() == Some(pipeline))
            .cloned()
            .collect())
    }

    /// An open escalation already covering (run, task)?
    pub fn open_for_task(&mut self, run_id: &str, task_id: &str) -> Result<Option<Escalation>> {
        self.load()?;
        Ok(self
            .entries
            .iter()
            .find(|e| {
                e.status == EscalationStatus::Open
                    && e.run_id == run_id
                    && e.task_id.as_deref() == Some(task_id)
            })
            .cloned())
    }

    pub fn resolve(
        &mut self,
        id: &str,
        resolution: &str,
        by: Option<&str>,
    ) -> Result<(), WorkError> {
        self.close(id, EscalationStatus::Resolved, resolution, by)
    }

    pub fn dismiss(&mut self, id: &str, reason: Option<&str>) -> Result<(), WorkError> {
        self.close(
            id,
            EscalationStatus::Dismissed,
            reason.unwrap_or("dismissed"),
            None,
        )
    }

    fn close(
        &mut self,
        id: &str,
        status: EscalationStatus,
        resolution: &str,
        by: Option<&str>,
    ) -> Result<(), WorkError> {
        self.load().map_err(WorkError::Other)?;
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| WorkError::EscalationNotFound(id.to_string()))?;
        let now = Utc::now();
        entry.status = status;
        entry.resolution = Some(resolution.to_string());
        entry.resolved_by = by.map(str::to_string);
        entry.resolved_at = Some(now);
        entry.updated_at = now;
        self.save().map_err(WorkError::Other)
    }

    pub fn add_note(&mut self, id: &str, text: &str) -> Result<(), WorkError> {
        self.load().map_err(WorkError::Other)?;
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| WorkError::EscalationNotFound(id.to_string()))?;
        entry.notes.push(EscalationNote {
            at: Utc::now(),
            text: text.to_string(),
        });
        entry.updated_at = Utc::now();
        self.save().map_err(WorkError::Other)
    }

    pub fn set_severity(&mut self, id: &str, severity: Severity) -> Result<(), WorkError> {
        self.load().map_err(WorkError::Other)?;
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| WorkError::EscalationNotFound(id.to_string()))?;
        entry.severity = severity;
        entry.updated_at = Utc::now();
        self.save().map_err(WorkError::Other)
    }

    /// Auto-close every open escalation for a task that has since succeeded.
    /// Returns the ids that were closed.
    pub fn resolve_by_task(
        &mut self,
        task_id: &str,
        reason: &str,
        by: Option<&str>,
    ) -> Result<Vec<String>> {
        self.load()?;
        let now = Utc::now();
        let mut closed = Vec::new();
        for entry in &mut self.entries {
            if entry.status == EscalationStatus::Open && entry.task_id.as_deref() == Some(task_id)
            {
                entry.status = EscalationStatus::Resolved;
                entry.resolution = Some(reason.to_string());
                entry.resolved_by = by.map(str::to_string);
                entry.resolved_at = Some(now);
                entry.updated_at = now;
                closed.push(entry.id.clone());
            }
        }
        if !closed.is_empty() {
            self.save()?;
        }
        Ok(closed)
    }

    pub fn stats(&mut self) -> Result<EscalationStats> {
        self.load()?;
        let mut stats = EscalationStats {
            total: self.entries.len(),
            ..Default::default()
        };
        for entry in &self.entries {
            match entry.status {
                EscalationStatus::Open => stats.open += 1,
                EscalationStatus::Resolved => stats.resolved += 1,
                EscalationStatus::Dismissed => stats.dismissed += 1,
            }
            *stats
                .by_severity
                .entry(entry.severity.as_str().to_string())
                .or_default() += 1;
        }
        Ok(stats)
    }

    /// Drop closed escalations older than `keep_days`. Open entries are never
    /// pruned. Returns how many were dropped.
    pub fn prune(&mut self, keep_days: i64) -> Result<usize> {
        self.load()?;
        let cutoff = Utc::now() - Duration::days(keep_days);
        let before = self.entries.len();
        self.entries
            .retain(|e| e.status == EscalationStatus::Open || e.updated_at >= cutoff);
        let dropped = before - self.entries.len();
        if dropped > 0 {
            self.save()?;
        }
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &std::path::Path) -> EscalationStore {
        EscalationStore::new(dir.join("escalations.json"))
    }

    fn params(run: &str, task: &str, attempts: u32, max: u32) -> EscalationParams {
        EscalationParams {
            run_id: run.to_string(),
            pipeline: Some("demo".to_string()),
            phase_number: 1,
            step_order: 100_001,
            role_id: Some("builder".to_string()),
            task_id: Some(task.to_string()),
            message: "spawn failed repeatedly".to_string(),
            attempt_count: attempts,
            max_attempts: max,
            severity: None,
        }
    }

    #[test]
    fn severity_derivation() {
        assert_eq!(derive_severity(3, 3), Severity::High);
        assert_eq!(derive_severity(5, 3), Severity::High);
        assert_eq!(derive_severity(2, 5), Severity::Medium);
        assert_eq!(derive_severity(1, 2), Severity::Low);
        // max below 3 never auto-assigns high
        assert_eq!(derive_severity(2, 2), Severity::Medium);
    }

    #[test]
    fn explicit_severity_wins() {
        let dir = tempdir().unwrap();
        let mut esc = store(dir.path());
        let mut p = params("run-1", "t1", 3, 3);
        p.severity = Some(Severity::Critical);
        let created = esc.create(p).unwrap();
        assert_eq!(created.severity, Severity::Critical);
    }

    #[test]
    fn create_list_resolve_lifecycle() {
        let dir = tempdir().unwrap();
        let mut esc = store(dir.path());
        let created = esc.create(params("run-1", "t1", 3, 3)).unwrap();
        assert_eq!(created.status, EscalationStatus::Open);
        assert_eq!(created.severity, Severity::High);
        assert_eq!(esc.list_open().unwrap().len(), 1);

        esc.resolve(&created.id, "re-ran by hand", Some("operator"))
            .unwrap();
        assert!(esc.list_open().unwrap().is_empty());
        let got = esc.get(&created.id).unwrap().unwrap();
        assert_eq!(got.status, EscalationStatus::Resolved);
        assert_eq!(got.resolved_by.as_deref(), Some("operator"));
        assert!(got.resolved_at.is_some());
    }

    #[test]
    fn dismiss_and_notes() {
        let dir = tempdir().unwrap();
        let mut esc = store(dir.path());
        let created = esc.create(params("run-1", "t1", 1, 3)).unwrap();
        esc.add_note(&created.id, "looks like a quota issue").unwrap();
        esc.dismiss(&created.id, Some("stale")).unwrap();
        let got = esc.get(&created.id).unwrap().unwrap();
        assert_eq!(got.status, EscalationStatus::Dismissed);
        assert_eq!(got.notes.len(), 1);
    }

    #[test]
    fn unknown_id_errors() {
        let dir = tempdir().unwrap();
        let mut esc = store(dir.path());
        let err = esc.resolve("ghost", "x", None).unwrap_err();
        assert!(matches!(err, WorkError::EscalationNotFound(_)));
    }

    #[test]
    fn resolve_by_task_closes_all_open_for_task() {
        let dir = tempdir().unwrap();
        let mut esc = store(dir.path());
        esc.create(params("run-1", "t1", 3, 3)).unwrap();
        esc.create(params("run-2", "t1", 3, 3)).unwrap();
        esc.create(params("run-1", "t2", 3, 3)).unwrap();

        let closed = esc
            .resolve_by_task("t1", "task completed on retry", None)
            .unwrap();
        assert_eq!(closed.len(), 2);
        let open = esc.list_open().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].task_id.as_deref(), Some("t2"));
    }

    #[test]
    fn by_run_and_by_pipeline() {
        let dir = tempdir().unwrap();
        let mut esc = store(dir.path());
        esc.create(params("run-1", "t1", 1, 3)).unwrap();
        esc.create(params("run-2", "t2", 1, 3)).unwrap();
        assert_eq!(esc.by_run("run-1").unwrap().len(), 1);
        assert_eq!(esc.by_pipeline("demo").unwrap().len(), 2);
        assert!(esc.by_pipeline("other").unwrap().is_empty());
    }

    #[test]
    fn open_escalations_never_pruned() {
        let dir = tempdir().unwrap();
        let mut esc = store(dir.path());
        let open = esc.create(params("run-1", "t1", 1, 3)).unwrap();
        let closed = esc.create(params("run-1", "t2", 1, 3)).unwrap();
        esc.dismiss(&closed.id, None).unwrap();

        // keep_days = 0 prunes everything closed, nothing open
        let dropped = esc.prune(0).unwrap();
        assert_eq!(dropped, 1);
        assert!(esc.get(&open.id).unwrap().is_some());
        assert!(esc.get(&closed.id).unwrap().is_none());
    }

    #[test]
    fn stats_counts() {
        let dir = tempdir().unwrap();
        let mut esc = store(dir.path());
        let a = esc.create(params("run-1", "t1", 3, 3)).unwrap();
        esc.create(params("run-1", "t2", 1, 3)).unwrap();
        esc.resolve(&a.id, "done", None).unwrap();

        let stats = esc.stats().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.open, 1);
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.by_severity.get("high"), Some(&1));
        assert_eq!(stats.by_severity.get("low"), Some(&1));
    }
}
