//! Worker dispatch: ready tasks → spawned gateway sessions.
//!
//! The sequence per task is fixed: worktree, registry entry (before the
//! gateway call, so a crash can only leave a dedup-visible record), prompt,
//! spawn, activity event. Spawn failures feed the retry controller; the
//! dispatcher owns the cancellable timers that re-enter dispatch.

use super::Orchestrator;
use crate::collector::InitPhase;
use crate::errors::GatewayError;
use crate::escalation::EscalationParams;
use crate::gateway::SpawnRequest;
use crate::ledger::WorkStatus;
use crate::progress::Task;
use crate::registry::{RegistryStatus, SkippedTask};
use crate::retry::{self, AttemptOutcome, RetryStatus};
use crate::runstate::{StepResult, StepStatus};
use crate::{activity, progress, prompts};
use anyhow::Result;
use chrono::Utc;
use std::path::PathBuf;
use tracing::{info, warn};

/// What one dispatch wave did.
#[derive(Debug, Default)]
pub struct DispatchSummary {
    pub spawned: Vec<String>,
    pub skipped: Vec<SkippedTask>,
    pub exhausted: Vec<String>,
    /// Tasks whose spawn errored this wave (retrying or newly exhausted).
    pub failed: Vec<String>,
}

impl Orchestrator {
    /// Dispatch the ready tasks of a run's current phase.
    ///
    /// Safe to call repeatedly (webhooks, watcher recovery, retry timers):
    /// the registry filters out everything already running or completed.
    pub async fn dispatch_current_phase(
        &self,
        run_id: &str,
    ) -> Result<DispatchSummary> {
        let Some(run) = self.runs.load(run_id)? else {
            warn!(run_id, "dispatch for unknown run");
            return Ok(DispatchSummary::default());
        };
        if run.status.is_terminal() {
            return Ok(DispatchSummary::default());
        }
        let phase = run.current_phase_number;

        // The phase record exists from the first dispatch on, even if
        // nothing ever spawns — settling an all-skipped phase needs it.
        {
            let mut collector = self.collector.lock().await;
            collector.ensure_phase(InitPhase {
                run_id: run_id.to_string(),
                phase_number: phase,
                repo_dir: run.repo_dir.clone(),
                base_branch: run.base_branch.clone(),
                project_name: run.project_name.clone(),
                project_dir: run.project_dir.clone(),
                workers: Vec::new(),
            })?;
        }

        let graph = progress::parse_file(&activity::progress_path(&run.project_dir))?;
        let skipped_steps = run.skipped_task_ids();
        let ready: Vec<Task> = graph
            .ready_tasks_in_phase_with(phase, &skipped_steps)
            .into_iter()
            .cloned()
            .collect();
        if ready.is_empty() {
            info!(run_id, phase, "no ready tasks to dispatch");
            return Ok(DispatchSummary::default());
        }

        let candidate_ids: Vec<String> = ready.iter().map(|t| t.id.clone()).collect();
        let (spawnable_ids, skipped) = {
            let mut registry = self.registry.lock().await;
            registry.filter_spawnable(&run.project_name, &candidate_ids)?
        };
        for skip in &skipped {
            info!(run_id, task = %skip.task_id, reason = %skip.reason, "skipping task");
        }

        let mut summary = DispatchSummary {
            skipped,
            ..Default::default()
        };

        // Exhausted retry budgets need a human, not another spawn; a task
        // with a pending retry timer is left to that timer so dispatch
        // cannot bypass the backoff.
        let mut spawnable: Vec<Task> = Vec::new();
        for task in ready {
            if !spawnable_ids.contains(&task.id) {
                continue;
            }
            let step = retry::step_order(phase, &task.id);
            let state = {
                let mut retries = self.retries.lock().await;
                retries.get(run_id, step)?
            };
            match state {
                Some(s) if s.status == RetryStatus::Exhausted => {
                    let escalation_id = self
                        .ensure_exhausted_escalation(&run.project_name, run_id, phase, &task)
                        .await?;
                    self.record_skipped_step(run_id, phase, &task, &escalation_id, None)
                        .await?;
                    summary.exhausted.push(task.id.clone());
                }
                Some(s) if s.next_retry_at.is_some_and(|at| at > Utc::now()) => {
                    summary.skipped.push(SkippedTask {
                        task_id: task.id.clone(),
                        reason: "retry timer pending".to_string(),
                    });
                }
                _ => spawnable.push(task),
            }
        }

        // Staggered parallelism: the gap protects the gateway from a burst;
        // it is not a retry backoff.
        for (idx, task) in spawnable.iter().enumerate() {
            if idx > 0 && !self.config.spawn_delay.is_zero() {
                tokio::time::sleep(self.config.spawn_delay).await;
            }
            match self.spawn_worker(&run.project_name, run_id, phase, task).await {
                Ok(true) => summary.spawned.push(task.id.clone()),
                Ok(false) => {}
                Err(e) => {
                    warn!(run_id, task = %task.id, error = %e, "spawn failed");
                    summary.failed.push(task.id.clone());
                    self.handle_spawn_failure(&run.project_name, run_id, phase, task, &e)
                        .await?;
                }
            }
        }
        Ok(summary)
    }

    /// Spawn one worker for one task. Returns false when a concurrent
    /// dispatch (a retry timer firing mid-wave) got there first.
    async fn spawn_worker(
        &self,
        project: &str,
        run_id: &str,
        phase: u32,
        task: &Task,
    ) -> Result<bool, GatewayError> {
        let run = self
            .runs
            .load(run_id)
            .ok()
            .flatten()
            .ok_or_else(|| GatewayError::Transport(format!("run {run_id} not found")))?;
        let worker_id = format!("w-{}", task.id);
        let step = retry::step_order(phase, &task.id);

        // Isolation is best-effort: a broken worktree falls back to the
        // shared repo dir with a warning.
        let (work_path, branch): (PathBuf, String) = match self
            .worktrees
            .create_worktree(&run.repo_dir, run_id, &worker_id, &run.base_branch)
            .await
        {
            Ok(handle) => (handle.path, handle.branch),
            Err(e) => {
                warn!(run_id, task = %task.id, error = %e, "worktree creation failed, using shared repo dir");
                (run.repo_dir.clone(), run.base_branch.clone())
            }
        };

        // can_spawn and register happen under one registry lock: of two
        // racing dispatches for the same task, exactly one registers. The
        // entry lands before the gateway call, so a failed call flips it to
        // failed and the retry cycle can reclaim the task.
        let work_item = {
            let mut registry = self.registry.lock().await;
            let check = registry
                .can_spawn(project, &task.id)
                .map_err(|e| GatewayError::Transport(e.to_string()))?;
            if !check.can_spawn {
                info!(
                    run_id,
                    task = %task.id,
                    reason = check.reason.as_deref().unwrap_or("unknown"),
                    "concurrent dispatch already claimed task"
                );
                return Ok(false);
            }
            let work_item = self
                .ledger_create_task(&task.title, "task", task.role.clone(), run_id, phase)
                .await
                .map_err(|e| GatewayError::Transport(e.to_string()))?;
            registry
                .register(
                    project,
                    &task.id,
                    run_id,
                    phase,
                    &worker_id,
                    Some(branch.clone()),
                    Some(work_item.id.clone()),
                )
                .map_err(|e| GatewayError::Transport(e.to_string()))?;
            work_item
        };
        {
            let mut retries = self.retries.lock().await;
            retries
                .init_state(run_id, step, self.config.retry_policy)
                .map_err(|e| GatewayError::Transport(e.to_string()))?;
        }

        let role_id = task.role.as_deref().unwrap_or("builder");
        let role = self
            .roles
            .get(role_id)
            .ok()
            .flatten()
            .unwrap_or_else(|| crate::roles::Role {
                id: role_id.to_string(),
                name: role_id.to_string(),
                model: "default".to_string(),
                thinking: Default::default(),
                instructions: None,
                prompt_file: None,
            });
        let instructions = self
            .roles
            .instructions_for(&role)
            .unwrap_or_default();
        let skill = self.augmenter.augment(role_id, task);
        let webhook_url = format!("{}/worker-complete", self.config.public_base_url);
        let prompt = prompts::build_worker_prompt(
            &instructions,
            task,
            run_id,
            step,
            &work_path,
            &branch,
            &webhook_url,
            skill.as_deref(),
        );

        let response = self
            .gateway
            .spawn(SpawnRequest {
                task: prompt,
                label: format!("{run_id}/{worker_id}"),
                model: role.model.clone(),
                thinking: role.thinking,
                cleanup: true,
                run_timeout_seconds: Some(self.config.run_timeout.as_secs()),
                skip_verify: None,
            })
            .await;

        match response {
            Ok(resp) => {
                self.ledger_status_lenient(&work_item.id, WorkStatus::Running, None)
                    .await;
                {
                    let mut collector = self.collector.lock().await;
                    collector
                        .add_worker(run_id, phase, &worker_id, &task.id)
                        .map_err(|e| GatewayError::Transport(e.to_string()))?;
                }
                activity::log_event(
                    &run.project_dir,
                    "spawn",
                    serde_json::json!({
                        "runId": run_id,
                        "phaseNumber": phase,
                        "taskId": task.id,
                        "workerId": worker_id,
                        "branch": branch,
                        "path": work_path,
                        "sessionKey": resp.child_session_key,
                        "verified": resp.verified,
                    }),
                )
                .map_err(|e| GatewayError::Transport(e.to_string()))?;
                {
                    // A successful spawn closes out a retried step; a fresh
                    // spawn leaves the attempt history empty for the worker
                    // itself.
                    let mut retries = self.retries.lock().await;
                    let retried = retries
                        .get(run_id, step)
                        .ok()
                        .flatten()
                        .is_some_and(|s| !s.attempts.is_empty());
                    if retried {
                        let _ = retries.record_attempt(run_id, step, true, None, None);
                    }
                }
                info!(run_id, task = %task.id, worker = %worker_id, session = %resp.child_session_key, "worker spawned");
                Ok(true)
            }
            Err(e) => {
                let mut registry = self.registry.lock().await;
                let _ = registry.update_status(
                    project,
                    &task.id,
                    RegistryStatus::Failed,
                    Some(e.to_string()),
                );
                drop(registry);
                self.ledger_status_lenient(
                    &work_item.id,
                    WorkStatus::Running,
                    None,
                )
                .await;
                self.ledger_status_lenient(
                    &work_item.id,
                    WorkStatus::Failed,
                    Some(e.to_string()),
                )
                .await;
                Err(e)
            }
        }
    }

    /// Feed a spawn failure through the retry controller: schedule a delayed
    /// re-dispatch, or escalate when the budget is spent.
    async fn handle_spawn_failure(
        &self,
        project: &str,
        run_id: &str,
        phase: u32,
        task: &Task,
        error: &GatewayError,
    ) -> Result<()> {
        let step = retry::step_order(phase, &task.id);
        let outcome = {
            let mut retries = self.retries.lock().await;
            retries.record_attempt(run_id, step, false, Some(error.to_string()), None)?
        };
        match outcome {
            AttemptOutcome::Retrying { delay_ms } => {
                info!(run_id, task = %task.id, delay_ms, "scheduling spawn retry");
                self.schedule_retry(run_id, &task.id, delay_ms);
            }
            AttemptOutcome::Exhausted => {
                warn!(run_id, task = %task.id, "spawn retries exhausted, escalating");
                let escalation_id = self
                    .ensure_exhausted_escalation(project, run_id, phase, task)
                    .await?;
                self.record_skipped_step(
                    run_id,
                    phase,
                    task,
                    &escalation_id,
                    Some(error.to_string()),
                )
                .await?;
            }
            AttemptOutcome::Succeeded => unreachable!("failed attempt cannot succeed"),
        }
        Ok(())
    }

    /// Persist the skip for a task whose retry budget is spent, so the step
    /// counts as settled and its dependents unblock. Idempotent by step
    /// order: a second recording keeps the first result.
    pub(crate) async fn record_skipped_step(
        &self,
        run_id: &str,
        phase: u32,
        task: &Task,
        escalation_id: &str,
        error: Option<String>,
    ) -> Result<()> {
        let step = retry::step_order(phase, &task.id);
        let escalation_id = escalation_id.to_string();
        self.with_run(run_id, |run| {
            run.record_step(StepResult {
                step_id: task.id.clone(),
                step_order: step,
                status: StepStatus::Skipped,
                output: None,
                error,
                completed_at: Utc::now(),
                escalation_id: Some(escalation_id),
            });
            Ok(())
        })
        .await
    }

    /// One open escalation per exhausted (run, task). Returns its id.
    async fn ensure_exhausted_escalation(
        &self,
        project: &str,
        run_id: &str,
        phase: u32,
        task: &Task,
    ) -> Result<String> {
        let step = retry::step_order(phase, &task.id);
        let mut escalations = self.escalations.lock().await;
        if let Some(open) = escalations.open_for_task(run_id, &task.id)? {
            return Ok(open.id);
        }
        let attempts = {
            let mut retries = self.retries.lock().await;
            retries
                .get(run_id, step)?
                .map(|s| s.attempts.len() as u32)
                .unwrap_or(0)
        };
        let policy = self.config.retry_policy;
        let created = escalations.create(EscalationParams {
            run_id: run_id.to_string(),
            pipeline: Some(project.to_string()),
            phase_number: phase,
            step_order: step,
            role_id: task.role.clone(),
            task_id: Some(task.id.clone()),
            message: format!(
                "Task '{}' exhausted {} spawn attempts and needs human attention",
                task.title, attempts
            ),
            attempt_count: attempts,
            max_attempts: policy.max_attempts,
            severity: None,
        })?;
        Ok(created.id)
    }

    /// Schedule a cancellable re-dispatch for (run, task). A newer failure
    /// for the same key replaces any pending timer. The timer re-enters the
    /// full phase check, so an exhaustion that ends the wave still unblocks
    /// dependents and can settle the phase.
    pub(crate) fn schedule_retry(&self, run_id: &str, task_id: &str, delay_ms: u64) {
        let key = (run_id.to_string(), task_id.to_string());
        let orch = self.arc();
        let run_id = run_id.to_string();
        let task_id = task_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            {
                let mut timers = orch.retry_timers.lock().expect("timer table poisoned");
                timers.remove(&(run_id.clone(), task_id.clone()));
            }
            if let Err(e) = orch.check_current_phase(&run_id).await {
                warn!(run_id = %run_id, task = %task_id, error = %e, "retry dispatch failed");
            }
        });

        let mut timers = self.retry_timers.lock().expect("timer table poisoned");
        if let Some(previous) = timers.insert(key, handle) {
            previous.abort();
        }
    }
}
