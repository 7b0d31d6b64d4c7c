//! Per-phase worker completion tracking and branch collection.
//!
//! One JSON file per (run, phase) under the phases directory. Workers are
//! fixed at init time; webhooks flip their records to a terminal status, and
//! once every record is non-running the phase is complete — a monotone fact
//! that later (duplicate) webhooks cannot undo.

use crate::errors::GitError;
use crate::gitops::{self, WorktreeManager};
use crate::store;
use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkerStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub task_id: String,
    pub branch: String,
    pub status: WorkerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Phase lifecycle. Advances strictly forward; `Failed` is a terminal sink
/// reachable from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Collecting,
    Merging,
    Reviewing,
    Completed,
    Failed,
}

impl PhaseStatus {
    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Collecting => 2,
            Self::Merging => 3,
            Self::Reviewing => 4,
            Self::Completed => 5,
            Self::Failed => 6,
        }
    }
}

/// `phases/<run>-phase-<N>.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseState {
    pub run_id: String,
    pub phase_number: u32,
    pub repo_dir: PathBuf,
    pub base_branch: String,
    pub project_name: String,
    pub project_dir: PathBuf,
    pub status: PhaseStatus,
    pub workers: Vec<WorkerRecord>,
}

impl PhaseState {
    pub fn phase_complete(&self) -> bool {
        !self.workers.is_empty() && self.workers.iter().all(|w| w.status.is_terminal())
    }

    pub fn all_succeeded(&self) -> bool {
        !self.workers.is_empty()
            && self
                .workers
                .iter()
                .all(|w| w.status == WorkerStatus::Completed)
    }

    pub fn worker_by_task(&self, task_id: &str) -> Option<&WorkerRecord> {
        self.workers.iter().find(|w| w.task_id == task_id)
    }
}

/// Parameters for [`PhaseCollector::init_phase`].
#[derive(Debug, Clone)]
pub struct InitPhase {
    pub run_id: String,
    pub phase_number: u32,
    pub repo_dir: PathBuf,
    pub base_branch: String,
    pub project_name: String,
    pub project_dir: PathBuf,
    /// `(worker_id, task_id)` pairs; branch names are derived.
    pub workers: Vec<(String, String)>,
}

/// Answer from [`PhaseCollector::on_worker_complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionCheck {
    pub phase_complete: bool,
    pub all_succeeded: bool,
}

/// What branch collection produced.
#[derive(Debug, Clone)]
pub struct CollectedBranches {
    pub phase_branch: String,
    /// Worker branches with commits, in worker order.
    pub branches: Vec<String>,
    /// True when no worker produced commits and the phase short-circuits.
    pub empty: bool,
}

/// The collector: in-memory map over the per-phase files.
pub struct PhaseCollector {
    phases_dir: PathBuf,
    active: HashMap<(String, u32), PhaseState>,
}

impl PhaseCollector {
    pub fn new(phases_dir: impl Into<PathBuf>) -> Self {
        Self {
            phases_dir: phases_dir.into(),
            active: HashMap::new(),
        }
    }

    fn path(&self, run_id: &str, phase: u32) -> PathBuf {
        self.phases_dir.join(format!("{run_id}-phase-{phase}.json"))
    }

    fn persist(&self, state: &PhaseState) -> Result<()> {
        store::write_json_atomic(&self.path(&state.run_id, state.phase_number), state)
    }

    pub fn init_phase(&mut self, params: InitPhase) -> Result<PhaseState> {
        let workers = params
            .workers
            .iter()
            .map(|(worker_id, task_id)| WorkerRecord {
                worker_id: worker_id.clone(),
                task_id: task_id.clone(),
                branch: gitops::worker_branch(&params.run_id, worker_id),
                status: WorkerStatus::Running,
                output: None,
                error: None,
            })
            .collect();
        let state = PhaseState {
            run_id: params.run_id.clone(),
            phase_number: params.phase_number,
            repo_dir: params.repo_dir,
            base_branch: params.base_branch,
            project_name: params.project_name,
            project_dir: params.project_dir,
            status: PhaseStatus::Running,
            workers,
        };
        self.persist(&state)?;
        self.active
            .insert((params.run_id, params.phase_number), state.clone());
        Ok(state)
    }

    /// Create the phase record if absent. Unlike [`init_phase`], an existing
    /// record (including its worker statuses) is left untouched, so the
    /// dispatcher can call this once per spawn wave.
    pub fn ensure_phase(&mut self, params: InitPhase) -> Result<PhaseState> {
        if let Some(existing) = self.get(&params.run_id, params.phase_number)? {
            return Ok(existing);
        }
        self.init_phase(params)
    }

    /// Add one worker to an existing phase record, status running. Idempotent
    /// by worker id; re-adding resets a terminal record back to running (the
    /// retry path respawning the same worker).
    pub fn add_worker(
        &mut self,
        run_id: &str,
        phase: u32,
        worker_id: &str,
        task_id: &str,
    ) -> Result<()> {
        let Some(mut state) = self.get(run_id, phase)? else {
            bail!("no phase state for {run_id} phase {phase}");
        };
        match state.workers.iter_mut().find(|w| w.worker_id == worker_id) {
            Some(worker) => {
                worker.status = WorkerStatus::Running;
                worker.output = None;
                worker.error = None;
            }
            None => state.workers.push(WorkerRecord {
                worker_id: worker_id.to_string(),
                task_id: task_id.to_string(),
                branch: gitops::worker_branch(run_id, worker_id),
                status: WorkerStatus::Running,
                output: None,
                error: None,
            }),
        }
        self.persist(&state)?;
        self.active.insert((run_id.to_string(), phase), state);
        Ok(())
    }

    /// Fetch from the map, falling back to disk (resume path).
    pub fn get(&mut self, run_id: &str, phase: u32) -> Result<Option<PhaseState>> {
        let key = (run_id.to_string(), phase);
        if let Some(state) = self.active.get(&key) {
            return Ok(Some(state.clone()));
        }
        let loaded: Option<PhaseState> = store::read_json(&self.path(run_id, phase))?;
        if let Some(state) = &loaded {
            self.active.insert(key, state.clone());
        }
        Ok(loaded)
    }

    /// Record a worker's terminal status. Idempotent by worker id: once a
    /// record is terminal, later reports are ignored, so a replayed webhook
    /// cannot flip `phase_complete` back or alter the outcome.
    pub fn on_worker_complete(
        &mut self,
        run_id: &str,
        phase: u32,
        worker_id: &str,
        status: WorkerStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<CompletionCheck> {
        let Some(mut state) = self.get(run_id, phase)? else {
            bail!("no phase state for {run_id} phase {phase}");
        };

        let Some(worker) = state.workers.iter_mut().find(|w| w.worker_id == worker_id) else {
            warn!(run_id, phase, worker_id, "worker completion for unknown worker, ignoring");
            return Ok(CompletionCheck {
                phase_complete: state.phase_complete(),
                all_succeeded: state.all_succeeded(),
            });
        };

        if worker.status.is_terminal() {
            info!(run_id, phase, worker_id, "duplicate worker completion, ignoring");
        } else {
            worker.status = status;
            worker.output = output;
            worker.error = error;
            self.persist(&state)?;
        }
        let check = CompletionCheck {
            phase_complete: state.phase_complete(),
            all_succeeded: state.all_succeeded(),
        };
        self.active.insert((run_id.to_string(), phase), state);
        Ok(check)
    }

    /// Forward-only status transition. `Failed` is reachable from any state.
    pub fn advance_status(&mut self, run_id: &str, phase: u32, to: PhaseStatus) -> Result<()> {
        let Some(mut state) = self.get(run_id, phase)? else {
            bail!("no phase state for {run_id} phase {phase}");
        };
        if to != PhaseStatus::Failed && to.rank() <= state.status.rank() {
            bail!(
                "phase status may not move {:?} -> {:?}",
                state.status,
                to
            );
        }
        state.status = to;
        self.persist(&state)?;
        self.active.insert((run_id.to_string(), phase), state);
        Ok(())
    }

    /// Gather the worker branches that actually carry commits and (re)create
    /// the phase branch off base as the merge target.
    ///
    /// Fails if any worker failed. When no branch has commits the phase
    /// short-circuits with `empty = true` and no phase branch is created.
    pub async fn collect_phase_branches(
        &mut self,
        run_id: &str,
        phase: u32,
        worktrees: &WorktreeManager,
    ) -> Result<CollectedBranches> {
        let Some(state) = self.get(run_id, phase)? else {
            bail!("no phase state for {run_id} phase {phase}");
        };
        if !state.phase_complete() {
            bail!("phase {phase} of {run_id} still has running workers");
        }
        if state
            .workers
            .iter()
            .any(|w| w.status == WorkerStatus::Failed)
        {
            let failed: Vec<&str> = state
                .workers
                .iter()
                .filter(|w| w.status == WorkerStatus::Failed)
                .map(|w| w.task_id.as_str())
                .collect();
            bail!("cannot collect: workers failed for tasks {}", failed.join(", "));
        }

        self.advance_status(run_id, phase, PhaseStatus::Collecting)?;

        let mut branches = Vec::new();
        for worker in &state.workers {
            if worker.status != WorkerStatus::Completed {
                continue;
            }
            match worktrees.commits_ahead(&state.repo_dir, &state.base_branch, &worker.branch) {
                Ok(0) => {
                    info!(branch = %worker.branch, "no commits beyond base, skipping");
                }
                Ok(_) => branches.push(worker.branch.clone()),
                Err(GitError::BranchNotFound(_)) => {
                    warn!(branch = %worker.branch, "worker branch missing, skipping");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let phase_branch = gitops::phase_branch(run_id, phase);
        if branches.is_empty() {
            return Ok(CollectedBranches {
                phase_branch,
                branches,
                empty: true,
            });
        }

        worktrees
            .create_branch(&state.repo_dir, &phase_branch, &state.base_branch)
            .await?;
        Ok(CollectedBranches {
            phase_branch,
            branches,
            empty: false,
        })
    }

    /// Terminal transitions drop the phase from the in-memory map.
    pub fn complete_phase(&mut self, run_id: &str, phase: u32) -> Result<()> {
        self.finish(run_id, phase, PhaseStatus::Completed)
    }

    pub fn fail_phase(&mut self, run_id: &str, phase: u32) -> Result<()> {
        self.finish(run_id, phase, PhaseStatus::Failed)
    }

    fn finish(&mut self, run_id: &str, phase: u32, status: PhaseStatus) -> Result<()> {
        let Some(mut state) = self.get(run_id, phase)? else {
            bail!("no phase state for {run_id} phase {phase}");
        };
        state.status = status;
        self.persist(&state)?;
        self.active.remove(&(run_id.to_string(), phase));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn init(collector: &mut PhaseCollector, run: &str) -> PhaseState {
        collector
            .init_phase(InitPhase {
                run_id: run.to_string(),
                phase_number: 1,
                repo_dir: PathBuf::from("/repo"),
                base_branch: "main".to_string(),
                project_name: "demo".to_string(),
                project_dir: PathBuf::from("/projects/demo"),
                workers: vec![
                    ("w1".to_string(), "t1".to_string()),
                    ("w2".to_string(), "t2".to_string()),
                ],
            })
            .unwrap()
    }

    #[test]
    fn init_sets_workers_running_with_derived_branches() {
        let dir = tempdir().unwrap();
        let mut collector = PhaseCollector::new(dir.path());
        let state = init(&mut collector, "run-1");
        assert_eq!(state.status, PhaseStatus::Running);
        assert_eq!(state.workers.len(), 2);
        assert_eq!(state.workers[0].branch, "swarmops/run-1/w1");
        assert!(state.workers.iter().all(|w| w.status == WorkerStatus::Running));
        assert!(!state.phase_complete());
    }

    #[test]
    fn completion_is_monotone_and_idempotent() {
        let dir = tempdir().unwrap();
        let mut collector = PhaseCollector::new(dir.path());
        init(&mut collector, "run-1");

        let check = collector
            .on_worker_complete("run-1", 1, "w1", WorkerStatus::Completed, None, None)
            .unwrap();
        assert!(!check.phase_complete);

        let check = collector
            .on_worker_complete("run-1", 1, "w2", WorkerStatus::Completed, None, None)
            .unwrap();
        assert!(check.phase_complete);
        assert!(check.all_succeeded);

        // A replayed webhook with a different status changes nothing
        let replay = collector
            .on_worker_complete(
                "run-1",
                1,
                "w2",
                WorkerStatus::Failed,
                None,
                Some("late duplicate".into()),
            )
            .unwrap();
        assert!(replay.phase_complete);
        assert!(replay.all_succeeded);
    }

    #[test]
    fn failed_worker_blocks_all_succeeded() {
        let dir = tempdir().unwrap();
        let mut collector = PhaseCollector::new(dir.path());
        init(&mut collector, "run-1");
        collector
            .on_worker_complete("run-1", 1, "w1", WorkerStatus::Completed, None, None)
            .unwrap();
        let check = collector
            .on_worker_complete(
                "run-1",
                1,
                "w2",
                WorkerStatus::Failed,
                None,
                Some("boom".into()),
            )
            .unwrap();
        assert!(check.phase_complete);
        assert!(!check.all_succeeded);
    }

    #[test]
    fn unknown_worker_is_ignored() {
        let dir = tempdir().unwrap();
        let mut collector = PhaseCollector::new(dir.path());
        init(&mut collector, "run-1");
        let check = collector
            .on_worker_complete("run-1", 1, "ghost", WorkerStatus::Completed, None, None)
            .unwrap();
        assert!(!check.phase_complete);
    }

    #[test]
    fn status_only_advances_forward() {
        let dir = tempdir().unwrap();
        let mut collector = PhaseCollector::new(dir.path());
        init(&mut collector, "run-1");
        collector
            .advance_status("run-1", 1, PhaseStatus::Collecting)
            .unwrap();
        collector
            .advance_status("run-1", 1, PhaseStatus::Merging)
            .unwrap();
        assert!(
            collector
                .advance_status("run-1", 1, PhaseStatus::Collecting)
                .is_err()
        );
        // Failed is reachable from anywhere
        collector
            .advance_status("run-1", 1, PhaseStatus::Failed)
            .unwrap();
    }

    #[test]
    fn state_survives_process_restart() {
        let dir = tempdir().unwrap();
        {
            let mut collector = PhaseCollector::new(dir.path());
            init(&mut collector, "run-1");
            collector
                .on_worker_complete("run-1", 1, "w1", WorkerStatus::Completed, None, None)
                .unwrap();
        }
        // New collector instance reads the persisted file
        let mut collector = PhaseCollector::new(dir.path());
        let state = collector.get("run-1", 1).unwrap().unwrap();
        assert_eq!(state.workers[0].status, WorkerStatus::Completed);
        assert_eq!(state.workers[1].status, WorkerStatus::Running);
    }

    #[test]
    fn terminal_transitions_drop_from_map() {
        let dir = tempdir().unwrap();
        let mut collector = PhaseCollector::new(dir.path());
        init(&mut collector, "run-1");
        collector.complete_phase("run-1", 1).unwrap();
        assert!(collector.active.is_empty());
        // Still loadable from disk
        let state = collector.get("run-1", 1).unwrap().unwrap();
        assert_eq!(state.status, PhaseStatus::Completed);
    }
}
