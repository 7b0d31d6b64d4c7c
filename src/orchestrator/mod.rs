//! The composition root: one `Orchestrator` value owns every subsystem.
//!
//! All process-wide mutable state (active runs, pending retry timers, the
//! trigger-cooldown map) lives here as fields, instantiated once at startup;
//! every entry point — HTTP webhook handlers, poller ticks, CLI commands —
//! receives an `Arc<Orchestrator>`.
//!
//! ## Event flow ownership
//!
//! | Submodule      | Drives                                                   |
//! |----------------|----------------------------------------------------------|
//! | `dispatch.rs`  | Ready tasks → spawned workers (dedup, stagger, retries)  |
//! | `pipeline.rs`  | Phase completion → merge loop → review chain → advance   |
//! | `webhooks.rs`  | Inbound webhook payloads → subsystem transitions         |

pub mod dispatch;
pub mod pipeline;
pub mod webhooks;

use crate::collector::PhaseCollector;
use crate::config::SwarmConfig;
use crate::escalation::EscalationStore;
use crate::gateway::SessionGateway;
use crate::gitops::WorktreeManager;
use crate::ledger::Ledger;
use crate::registry::{RegistryStatus, TaskRegistry};
use crate::resolver::ResolverStore;
use crate::retry::RetryController;
use crate::review::ReviewStore;
use crate::roles::RoleStore;
use crate::runstate::{RunStateManager, RunPhase, RunState};
use crate::store::PathLocks;
use crate::{activity, ledger, progress};
use anyhow::{Context, Result, bail};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Timer key for a pending retry: (run_id, task_id).
pub(crate) type TimerKey = (String, String);

/// Cooldown key for the watcher: (project, phase name).
pub(crate) type CooldownKey = (String, String);

pub struct Orchestrator {
    pub config: SwarmConfig,
    pub gateway: Arc<dyn SessionGateway>,
    pub augmenter: Box<dyn crate::prompts::PromptAugmenter>,
    pub worktrees: WorktreeManager,
    pub roles: RoleStore,
    pub reviews: ReviewStore,
    pub resolvers: ResolverStore,
    pub runs: RunStateManager,
    pub(crate) ledger: Mutex<Ledger>,
    pub(crate) registry: Mutex<TaskRegistry>,
    pub(crate) retries: Mutex<RetryController>,
    pub(crate) escalations: Mutex<EscalationStore>,
    pub(crate) collector: Mutex<PhaseCollector>,
    pub(crate) locks: PathLocks,
    pub(crate) retry_timers: std::sync::Mutex<HashMap<TimerKey, JoinHandle<()>>>,
    pub(crate) cooldowns: std::sync::Mutex<HashMap<CooldownKey, Instant>>,
    pub(crate) watchdog_counts: std::sync::Mutex<HashMap<CooldownKey, u32>>,
    /// Back-reference to the owning `Arc`, for background timers that must
    /// outlive the current call.
    self_handle: Weak<Orchestrator>,
}

impl Orchestrator {
    pub fn new(config: SwarmConfig, gateway: Arc<dyn SessionGateway>) -> Result<Arc<Self>> {
        Self::with_augmenter(
            config,
            gateway,
            Box::new(crate::prompts::WebVisualsAugmenter::default()),
        )
    }

    pub fn with_augmenter(
        config: SwarmConfig,
        gateway: Arc<dyn SessionGateway>,
        augmenter: Box<dyn crate::prompts::PromptAugmenter>,
    ) -> Result<Arc<Self>> {
        config.ensure_directories()?;
        Ok(Arc::new_cyclic(|self_handle| Self {
            augmenter,
            worktrees: WorktreeManager::new(&config.worktree_root),
            roles: RoleStore::new(config.roles_path(), config.prompts_dir()),
            reviews: ReviewStore::new(config.reviews_dir()),
            resolvers: ResolverStore::new(config.resolvers_dir()),
            runs: RunStateManager::new(config.runs_dir(), config.project_runs_dir()),
            ledger: Mutex::new(Ledger::new(config.work_dir())),
            registry: Mutex::new(TaskRegistry::new(config.registry_path())),
            retries: Mutex::new(RetryController::new(config.retry_path())),
            escalations: Mutex::new(EscalationStore::new(config.escalations_path())),
            collector: Mutex::new(PhaseCollector::new(config.phases_dir())),
            locks: PathLocks::new(),
            retry_timers: std::sync::Mutex::new(HashMap::new()),
            cooldowns: std::sync::Mutex::new(HashMap::new()),
            watchdog_counts: std::sync::Mutex::new(HashMap::new()),
            self_handle: self_handle.clone(),
            gateway,
            config,
        }))
    }

    /// The owning `Arc`, for handing to spawned background tasks.
    pub(crate) fn arc(&self) -> Arc<Self> {
        self.self_handle
            .upgrade()
            .expect("orchestrator outlived its Arc")
    }

    /// Start a pipeline run for a project. Idempotent: an existing active run
    /// is returned as-is instead of starting a second one.
    pub async fn start_project(&self, project: &str) -> Result<RunState> {
        if let Some(existing) = self.runs.active_run_for(project)? {
            info!(project, run_id = %existing.run_id, "project already has an active run");
            return Ok(existing);
        }

        let project_dir = self.config.project_dir(project);
        let progress_file = activity::progress_path(&project_dir);
        let graph = progress::parse_file(&progress_file)
            .with_context(|| format!("Failed to parse progress for {project}"))?;
        if graph.is_empty() {
            bail!("project {project} has no annotated tasks in progress.md");
        }

        let repo_dir = project_dir.clone();
        let base_branch = self
            .worktrees
            .current_branch(&repo_dir)
            .with_context(|| format!("project {project} is not a git repository"))?;

        let phases: Vec<RunPhase> = graph
            .phases()
            .iter()
            .map(|p| RunPhase {
                number: p.number,
                name: p.name.clone(),
                completed: false,
                completed_at: None,
            })
            .collect();

        let run = RunState::new(
            project,
            "default",
            project_dir.clone(),
            repo_dir,
            &base_branch,
            phases,
        );
        self.runs.save(&run)?;
        self.runs.set_active_run(project, &run.run_id)?;
        activity::log_event(
            &project_dir,
            "run-started",
            serde_json::json!({"runId": run.run_id, "phase": run.current_phase_number}),
        )?;
        info!(project, run_id = %run.run_id, "pipeline run started");

        self.check_current_phase(&run.run_id).await?;
        self.runs
            .load(&run.run_id)?
            .ok_or_else(|| anyhow::anyhow!("run file vanished after dispatch"))
    }

    /// Crash recovery: re-enter all non-terminal runs and re-examine them.
    /// The registry absorbs any duplicate spawn the replay might attempt.
    pub async fn resume_on_start(&self) -> Result<usize> {
        let resumable = self.runs.resumable()?;
        let count = resumable.len();
        for run in &resumable {
            info!(run_id = %run.run_id, status = run.status.as_str(), "resuming run");
        }
        let results = futures::future::join_all(
            resumable
                .iter()
                .map(|run| self.check_current_phase(&run.run_id)),
        )
        .await;
        for (run, result) in resumable.iter().zip(results) {
            if let Err(e) = result {
                warn!(run_id = %run.run_id, error = %e, "resume dispatch failed");
            }
        }
        Ok(count)
    }

    /// Union of skipped task ids across every run of a project. Used by the
    /// watcher's settlement predicates: a project that skipped steps can
    /// still leave `build` even though those boxes stay unchecked.
    pub(crate) fn project_skipped_tasks(
        &self,
        project: &str,
    ) -> Result<std::collections::HashSet<String>> {
        let mut skipped = std::collections::HashSet::new();
        for run in self.runs.list()? {
            if run.project_name == project {
                skipped.extend(run.skipped_task_ids());
            }
        }
        Ok(skipped)
    }

    /// Cancel a run: running workers become cancelled in registry and ledger,
    /// pending retry timers are dropped. Agents already running at the
    /// gateway are left to finish; their webhooks will be treated as orphans.
    pub async fn cancel_run(&self, run_id: &str, reason: &str) -> Result<()> {
        let Some(mut run) = self.runs.load(run_id)? else {
            bail!("run {run_id} not found");
        };
        if run.status.is_terminal() {
            return Ok(());
        }

        {
            let mut timers = self.retry_timers.lock().expect("timer table poisoned");
            timers.retain(|(timer_run, _), handle| {
                if timer_run == run_id {
                    handle.abort();
                    false
                } else {
                    true
                }
            });
        }

        let entries = {
            let mut registry = self.registry.lock().await;
            registry.by_run(run_id)?
        };
        for (task_id, entry) in entries {
            if entry.status == RegistryStatus::Running {
                let mut registry = self.registry.lock().await;
                registry.update_status(
                    &run.project_name,
                    &task_id,
                    RegistryStatus::Cancelled,
                    Some(reason.to_string()),
                )?;
                if let Some(work_id) = &entry.work_id {
                    let mut ledger = self.ledger.lock().await;
                    if let Err(e) = ledger.cancel(work_id, Some(reason)) {
                        warn!(work_id = %work_id, error = %e, "ledger cancel failed");
                    }
                }
            }
        }

        run.finish(crate::runstate::RunStatus::Failed);
        self.runs.save(&run)?;
        self.runs.clear_active_run(&run.project_name)?;
        activity::log_event(
            &run.project_dir,
            "run-cancelled",
            serde_json::json!({"runId": run_id, "reason": reason}),
        )?;
        Ok(())
    }

    /// Load a run, apply `mutate`, save — under the run file's path lock so
    /// interleaved webhook handlers serialize their read-modify-writes.
    pub(crate) async fn with_run<F, T>(&self, run_id: &str, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut RunState) -> Result<T>,
    {
        let path = self.config.runs_dir().join(format!("{run_id}.json"));
        let lock = self.locks.lock_for(&path);
        let _guard = lock.lock().await;
        let mut run = self
            .runs
            .load(run_id)?
            .ok_or_else(|| anyhow::anyhow!("run {run_id} not found"))?;
        let out = mutate(&mut run)?;
        self.runs.save(&run)?;
        Ok(out)
    }

    /// Record a ledger work item creation for a spawned worker session.
    pub(crate) async fn ledger_create_task(
        &self,
        title: &str,
        work_type: &str,
        role_id: Option<String>,
        run_id: &str,
        phase: u32,
    ) -> Result<ledger::WorkItem> {
        let mut ledger = self.ledger.lock().await;
        ledger.create(ledger::WorkInput {
            title: title.to_string(),
            work_type: work_type.to_string(),
            role_id,
            parent_id: Some(run_id.to_string()),
            tags: vec![format!("phase-{phase}")],
        })
    }

    /// Ledger status update that tolerates replayed transitions: an invalid
    /// transition on a replay is logged, not surfaced.
    pub(crate) async fn ledger_status_lenient(
        &self,
        work_id: &str,
        status: ledger::WorkStatus,
        error: Option<String>,
    ) {
        let mut ledger = self.ledger.lock().await;
        match ledger.update_status(work_id, status, error) {
            Ok(()) => {}
            Err(crate::errors::WorkError::InvalidTransition { from, to, .. }) => {
                info!(work_id, %from, %to, "ignoring replayed ledger transition");
            }
            Err(e) => warn!(work_id, error = %e, "ledger status update failed"),
        }
    }

    /// Absolute path of a project's directory by name.
    pub fn project_dir(&self, project: &str) -> PathBuf {
        self.config.project_dir(project)
    }

    // Subsystem handles for the CLI and integration tests.

    pub fn escalations_handle(&self) -> &Mutex<EscalationStore> {
        &self.escalations
    }

    pub fn registry_handle(&self) -> &Mutex<TaskRegistry> {
        &self.registry
    }

    pub fn retries_handle(&self) -> &Mutex<RetryController> {
        &self.retries
    }

    pub fn ledger_handle(&self) -> &Mutex<Ledger> {
        &self.ledger
    }

    pub fn collector_handle(&self) -> &Mutex<PhaseCollector> {
        &self.collector
    }
}
