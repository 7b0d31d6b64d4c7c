//! Per-run and per-project state files with resume-on-restart.
//!
//! Every state transition rewrites `runs/<run_id>.json` atomically, so the
//! worst a crash can lose is the step in flight — and replaying that step is
//! safe because the task registry deduplicates spawns.

use crate::store;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Merging,
    Reviewing,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Merging => "merging",
            Self::Reviewing => "reviewing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    Skipped,
}

/// Outcome of one dispatch unit within the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// The task id behind the step.
    pub step_id: String,
    pub step_order: u64,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_id: Option<String>,
}

/// Completion record for one phase of the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPhase {
    pub number: u32,
    pub name: String,
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// `runs/<run_id>.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub project_name: String,
    pub pipeline_name: String,
    pub status: RunStatus,
    pub current_phase_number: u32,
    pub phases: Vec<RunPhase>,
    #[serde(default)]
    pub step_results: Vec<StepResult>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub project_dir: PathBuf,
    pub repo_dir: PathBuf,
    pub base_branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_task_id: Option<String>,
}

impl RunState {
    /// Time-ordered unique run id.
    pub fn new_run_id() -> String {
        format!(
            "run-{}-{}",
            Utc::now().format("%Y%m%d%H%M%S"),
            &uuid::Uuid::new_v4().to_string()[..8]
        )
    }

    pub fn new(
        project_name: &str,
        pipeline_name: &str,
        project_dir: PathBuf,
        repo_dir: PathBuf,
        base_branch: &str,
        phases: Vec<RunPhase>,
    ) -> Self {
        let first_phase = phases.first().map_or(1, |p| p.number);
        Self {
            run_id: Self::new_run_id(),
            project_name: project_name.to_string(),
            pipeline_name: pipeline_name.to_string(),
            status: RunStatus::Running,
            current_phase_number: first_phase,
            phases,
            step_results: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            project_dir,
            repo_dir,
            base_branch: base_branch.to_string(),
            active_session_key: None,
            active_task_id: None,
        }
    }

    /// Record a step result idempotently: a second result for the same
    /// step_order is dropped.
    pub fn record_step(&mut self, result: StepResult) -> bool {
        if self
            .step_results
            .iter()
            .any(|r| r.step_order == result.step_order)
        {
            return false;
        }
        self.step_results.push(result);
        true
    }

    pub fn step_result(&self, step_order: u64) -> Option<&StepResult> {
        self.step_results
            .iter()
            .find(|r| r.step_order == step_order)
    }

    /// Task ids whose steps were skipped (retry budget exhausted). These
    /// count as satisfied dependencies so downstream work can proceed.
    pub fn skipped_task_ids(&self) -> HashSet<String> {
        self.step_results
            .iter()
            .filter(|r| r.status == StepStatus::Skipped)
            .map(|r| r.step_id.clone())
            .collect()
    }

    pub fn mark_phase_complete(&mut self, number: u32) {
        if let Some(phase) = self.phases.iter_mut().find(|p| p.number == number)
            && !phase.completed
        {
            phase.completed = true;
            phase.completed_at = Some(Utc::now());
        }
    }

    /// Next phase after the current one, in declared order.
    pub fn next_phase(&self) -> Option<u32> {
        self.phases
            .iter()
            .filter(|p| p.number > self.current_phase_number)
            .map(|p| p.number)
            .min()
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }
}

/// Loader/saver for run files and the project → active-run mapping.
pub struct RunStateManager {
    runs_dir: PathBuf,
    project_runs_dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProjectRun {
    run_id: String,
}

impl RunStateManager {
    pub fn new(runs_dir: impl Into<PathBuf>, project_runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
            project_runs_dir: project_runs_dir.into(),
        }
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(format!("{run_id}.json"))
    }

    fn project_path(&self, project: &str) -> PathBuf {
        self.project_runs_dir.join(format!("{project}.json"))
    }

    pub fn save(&self, run: &RunState) -> Result<()> {
        store::write_json_atomic(&self.run_path(&run.run_id), run)
    }

    pub fn load(&self, run_id: &str) -> Result<Option<RunState>> {
        store::read_json(&self.run_path(run_id))
    }

    /// Bind the project to its single active run. Fails closed at the caller
    /// level: [`active_run_for`] must be checked first.
    pub fn set_active_run(&self, project: &str, run_id: &str) -> Result<()> {
        store::write_json_atomic(
            &self.project_path(project),
            &ProjectRun {
                run_id: run_id.to_string(),
            },
        )
    }

    pub fn clear_active_run(&self, project: &str) -> Result<()> {
        let path = self.project_path(project);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// The project's active run, if its run file still shows a non-terminal
    /// status.
    pub fn active_run_for(&self, project: &str) -> Result<Option<RunState>> {
        let Some(mapping): Option<ProjectRun> = store::read_json(&self.project_path(project))?
        else {
            return Ok(None);
        };
        match self.load(&mapping.run_id)? {
            Some(run) if !run.status.is_terminal() => Ok(Some(run)),
            _ => Ok(None),
        }
    }

    /// Every persisted run, any status.
    pub fn list(&self) -> Result<Vec<RunState>> {
        let mut runs = Vec::new();
        if !self.runs_dir.exists() {
            return Ok(runs);
        }
        for entry in std::fs::read_dir(&self.runs_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "json")
                && let Some(run) = store::read_json::<RunState>(&path)?
            {
                runs.push(run);
            }
        }
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(runs)
    }

    /// Runs that were in flight when the process died and must be re-entered
    /// into the active map on startup.
    pub fn resumable(&self) -> Result<Vec<RunState>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| !r.status.is_terminal())
            .collect())
    }
}

/// Shared helper for watchers: most recent mtime of a set of files.
pub fn latest_mtime(paths: &[&Path]) -> Option<std::time::SystemTime> {
    paths
        .iter()
        .filter_map(|p| std::fs::metadata(p).ok())
        .filter_map(|m| m.modified().ok())
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(dir: &Path) -> RunStateManager {
        RunStateManager::new(dir.join("runs"), dir.join("project-runs"))
    }

    fn run(project: &str) -> RunState {
        RunState::new(
            project,
            "default",
            PathBuf::from("/projects/demo"),
            PathBuf::from("/projects/demo/repo"),
            "main",
            vec![
                RunPhase {
                    number: 1,
                    name: "Core".to_string(),
                    completed: false,
                    completed_at: None,
                },
                RunPhase {
                    number: 2,
                    name: "Polish".to_string(),
                    completed: false,
                    completed_at: None,
                },
            ],
        )
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let state = run("demo");
        mgr.save(&state).unwrap();
        let loaded = mgr.load(&state.run_id).unwrap().unwrap();
        assert_eq!(loaded.project_name, "demo");
        assert_eq!(loaded.current_phase_number, 1);
        assert_eq!(loaded.phases.len(), 2);
    }

    #[test]
    fn record_step_is_idempotent() {
        let mut state = run("demo");
        let result = StepResult {
            step_id: "t1".to_string(),
            step_order: 100_001,
            status: StepStatus::Completed,
            output: None,
            error: None,
            completed_at: Utc::now(),
            escalation_id: None,
        };
        assert!(state.record_step(result.clone()));
        assert!(!state.record_step(result));
        assert_eq!(state.step_results.len(), 1);
    }

    #[test]
    fn skipped_task_ids_collects_only_skips() {
        let mut state = run("demo");
        state.record_step(StepResult {
            step_id: "t1".to_string(),
            step_order: 100_001,
            status: StepStatus::Completed,
            output: None,
            error: None,
            completed_at: Utc::now(),
            escalation_id: None,
        });
        state.record_step(StepResult {
            step_id: "t2".to_string(),
            step_order: 100_002,
            status: StepStatus::Skipped,
            output: None,
            error: Some("spawn retries exhausted".to_string()),
            completed_at: Utc::now(),
            escalation_id: Some("esc-1".to_string()),
        });

        let skipped = state.skipped_task_ids();
        assert_eq!(skipped.len(), 1);
        assert!(skipped.contains("t2"));
    }

    #[test]
    fn phase_completion_and_next() {
        let mut state = run("demo");
        assert_eq!(state.next_phase(), Some(2));
        state.mark_phase_complete(1);
        assert!(state.phases[0].completed);
        state.current_phase_number = 2;
        assert_eq!(state.next_phase(), None);
    }

    #[test]
    fn active_run_mapping_respects_terminal_status() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let mut state = run("demo");
        mgr.save(&state).unwrap();
        mgr.set_active_run("demo", &state.run_id).unwrap();

        assert!(mgr.active_run_for("demo").unwrap().is_some());

        state.finish(RunStatus::Completed);
        mgr.save(&state).unwrap();
        // Terminal run no longer counts as active even with a stale mapping
        assert!(mgr.active_run_for("demo").unwrap().is_none());
    }

    #[test]
    fn resumable_filters_terminal_runs() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let alive = run("a");
        mgr.save(&alive).unwrap();
        let mut dead = run("b");
        dead.finish(RunStatus::Failed);
        mgr.save(&dead).unwrap();

        let resumable = mgr.resumable().unwrap();
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].run_id, alive.run_id);
    }

    #[test]
    fn run_ids_are_time_ordered_and_unique() {
        let a = RunState::new_run_id();
        let b = RunState::new_run_id();
        assert_ne!(a, b);
        assert!(a.starts_with("run-"));
    }
}
