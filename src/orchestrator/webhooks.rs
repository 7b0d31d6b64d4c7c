//! Webhook payload handling.
//!
//! Every handler is idempotent: replaying a payload produces no side effect
//! beyond the first delivery. Orphan payloads (unknown run, no registry
//! entry) are logged at warn and acknowledged — the sender is an agent that
//! cannot do anything useful with an error.

use super::Orchestrator;
use crate::activity::{self, ProjectPhase};
use crate::collector::{InitPhase, WorkerStatus};
use crate::escalation::EscalationParams;
use crate::ledger::WorkStatus;
use crate::progress::{self, Task, TaskGraph};
use crate::registry::RegistryStatus;
use crate::retry::{self, AttemptOutcome};
use crate::review::{Finding, ReviewAction, ReviewVerdict};
use crate::runstate::{StepResult, StepStatus};
use serde::{Deserialize, Serialize};
use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

/// Structured webhook reply; the HTTP layer serializes it as-is.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookReply {
    pub status: &'static str,
    pub message: String,
}

impl WebhookReply {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: "ok",
            message: message.into(),
        }
    }

    pub fn ignored(message: impl Into<String>) -> Self {
        Self {
            status: "ignored",
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCompletePayload {
    pub run_id: String,
    #[serde(default)]
    pub step_order: Option<u64>,
    #[serde(default)]
    pub task_id: Option<String>,
    pub status: String,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompletePayload {
    pub task_id: String,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub phase_number: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewResultPayload {
    pub status: String,
    pub run_id: String,
    pub phase_number: u32,
    /// Role id of the reviewer posting this verdict. When present it is
    /// checked against the chain position so a replayed verdict cannot
    /// advance the chain a second time.
    #[serde(default)]
    pub reviewer: Option<String>,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixCompletePayload {
    #[serde(default)]
    pub issues_fixed: Option<u32>,
    pub run_id: String,
    pub phase_number: u32,
    #[serde(default)]
    pub success: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecCompletePayload {
    pub project: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratePayload {
    pub action: String,
    pub project: String,
}

/// Resolve the task a payload refers to, by explicit id or by matching the
/// step order over the phase's task set.
fn resolve_task(graph: &TaskGraph, payload: &WorkerCompletePayload) -> Option<Task> {
    if let Some(task_id) = &payload.task_id {
        return graph.get(task_id).cloned();
    }
    let step = payload.step_order?;
    let phase = (step / 100_000) as u32;
    graph
        .tasks()
        .find(|t| t.phase == phase && retry::step_order(phase, &t.id) == step)
        .cloned()
}

impl Orchestrator {
    /// `POST /worker-complete`
    pub async fn handle_worker_complete(
        &self,
        payload: WorkerCompletePayload,
    ) -> Result<WebhookReply> {
        let Some(run) = self.runs.load(&payload.run_id)? else {
            warn!(run_id = %payload.run_id, "worker completion for unknown run, ignoring");
            return Ok(WebhookReply::ignored("unknown run"));
        };
        if run.status.is_terminal() {
            info!(run_id = %payload.run_id, "worker completion for terminal run, ignoring");
            return Ok(WebhookReply::ignored("run already terminal"));
        }

        let graph = progress::parse_file(&activity::progress_path(&run.project_dir))?;
        let Some(task) = resolve_task(&graph, &payload) else {
            // No task behind this payload: it may be a conflict resolver
            // reporting back.
            return self.handle_resolver_webhook(&payload).await;
        };
        let phase = task.phase;
        let step = retry::step_order(phase, &task.id);

        let entry = {
            let mut registry = self.registry.lock().await;
            registry.get(&run.project_name, &task.id)?
        };
        let Some(entry) = entry else {
            warn!(run_id = %payload.run_id, task = %task.id, "orphan worker completion (no registry entry)");
            return Ok(WebhookReply::ignored("orphan: no registry entry"));
        };

        if run.step_result(step).is_some() {
            info!(run_id = %payload.run_id, task = %task.id, "duplicate worker completion, ignoring");
            return Ok(WebhookReply::ignored("already recorded"));
        }

        // Cancel any pending retry timer for this task.
        {
            let mut timers = self.retry_timers.lock().expect("timer table poisoned");
            if let Some(handle) = timers.remove(&(payload.run_id.clone(), task.id.clone())) {
                handle.abort();
            }
        }

        match payload.status.as_str() {
            "completed" => {
                self.worker_succeeded(&run.project_name, &payload, &task, &entry.worker_id, step)
                    .await?;
            }
            "failed" => {
                if entry.status != RegistryStatus::Running {
                    info!(run_id = %payload.run_id, task = %task.id, "stale failure report, ignoring");
                    return Ok(WebhookReply::ignored("stale failure"));
                }
                self.worker_failed(&run.project_name, &payload, &task, &entry.worker_id, step)
                    .await?;
            }
            other => {
                warn!(status = other, "unrecognized worker status");
                return Ok(WebhookReply::ignored(format!("unknown status {other}")));
            }
        }

        self.check_phase_completion(&payload.run_id, phase).await?;
        Ok(WebhookReply::ok("recorded"))
    }

    async fn worker_succeeded(
        &self,
        project: &str,
        payload: &WorkerCompletePayload,
        task: &Task,
        worker_id: &str,
        step: u64,
    ) -> Result<()> {
        let run_id = &payload.run_id;
        {
            let mut retries = self.retries.lock().await;
            let _ = retries.record_attempt(run_id, step, true, None, None);
            retries.clear_state(run_id, step)?;
        }
        let work_id = {
            let mut registry = self.registry.lock().await;
            registry.update_status(project, &task.id, RegistryStatus::Completed, None)?;
            registry.get(project, &task.id)?.and_then(|e| e.work_id)
        };
        if let Some(work_id) = work_id {
            if let Some(output) = &payload.output {
                let mut ledger = self.ledger.lock().await;
                let _ = ledger.set_output(&work_id, output.clone());
            }
            self.ledger_status_lenient(&work_id, WorkStatus::Complete, None)
                .await;
        }

        let run = self.runs.load(run_id)?.expect("run checked above");
        let progress_file = activity::progress_path(&run.project_dir);
        {
            let lock = self.locks.lock_for(&progress_file);
            let _guard = lock.lock().await;
            progress::mark_task_done(&progress_file, &task.id)?;
        }

        // A task succeeding closes any escalation it opened earlier.
        let closed = {
            let mut escalations = self.escalations.lock().await;
            escalations.resolve_by_task(
                &task.id,
                "task completed after escalation",
                Some("orchestrator"),
            )?
        };
        if !closed.is_empty() {
            info!(task = %task.id, count = closed.len(), "auto-resolved escalations");
        }

        self.with_run(run_id, |run| {
            run.record_step(StepResult {
                step_id: task.id.clone(),
                step_order: step,
                status: StepStatus::Completed,
                output: payload.output.clone(),
                error: None,
                completed_at: Utc::now(),
                escalation_id: None,
            });
            Ok(())
        })
        .await?;

        {
            let mut collector = self.collector.lock().await;
            collector.on_worker_complete(
                run_id,
                task.phase,
                worker_id,
                WorkerStatus::Completed,
                payload.output.clone(),
                None,
            )?;
        }

        activity::log_event(
            &run.project_dir,
            "task-completed",
            serde_json::json!({"runId": run_id, "taskId": task.id, "workerId": worker_id}),
        )?;
        Ok(())
    }

    async fn worker_failed(
        &self,
        project: &str,
        payload: &WorkerCompletePayload,
        task: &Task,
        worker_id: &str,
        step: u64,
    ) -> Result<()> {
        let run_id = &payload.run_id;
        let error = payload
            .error
            .clone()
            .unwrap_or_else(|| "worker reported failure".to_string());

        let work_id = {
            let mut registry = self.registry.lock().await;
            registry.update_status(
                project,
                &task.id,
                RegistryStatus::Failed,
                Some(error.clone()),
            )?;
            registry.get(project, &task.id)?.and_then(|e| e.work_id)
        };
        if let Some(work_id) = &work_id {
            self.ledger_status_lenient(work_id, WorkStatus::Failed, Some(error.clone()))
                .await;
        }

        let outcome = {
            let mut retries = self.retries.lock().await;
            retries.record_attempt(run_id, step, false, Some(error.clone()), None)?
        };
        let run = self.runs.load(run_id)?.expect("run checked above");

        match outcome {
            AttemptOutcome::Retrying { delay_ms } => {
                info!(run_id = %run_id, task = %task.id, delay_ms, "worker failed, scheduling retry");
                activity::log_event(
                    &run.project_dir,
                    "task-retry",
                    serde_json::json!({"runId": run_id, "taskId": task.id, "delayMs": delay_ms, "error": error}),
                )?;
                // The collector record stays running; the retry respawns the
                // same worker id and the phase stays open meanwhile.
                self.schedule_retry(run_id, &task.id, delay_ms);
            }
            AttemptOutcome::Exhausted => {
                warn!(run_id = %run_id, task = %task.id, "worker retries exhausted, skipping task");
                let attempts = {
                    let mut retries = self.retries.lock().await;
                    retries
                        .get(run_id, step)?
                        .map(|s| s.attempts.len() as u32)
                        .unwrap_or(0)
                };
                let escalation_id = {
                    let mut escalations = self.escalations.lock().await;
                    match escalations.open_for_task(run_id, &task.id)? {
                        Some(open) => open.id,
                        None => {
                            escalations
                                .create(EscalationParams {
                                    run_id: run_id.to_string(),
                                    pipeline: Some(project.to_string()),
                                    phase_number: task.phase,
                                    step_order: step,
                                    role_id: task.role.clone(),
                                    task_id: Some(task.id.clone()),
                                    message: format!(
                                        "Task '{}' failed {attempts} times: {error}",
                                        task.title
                                    ),
                                    attempt_count: attempts,
                                    max_attempts: self.config.retry_policy.max_attempts,
                                    severity: None,
                                })?
                                .id
                        }
                    }
                };
                self.record_skipped_step(run_id, task.phase, task, &escalation_id, Some(error.clone()))
                    .await?;
                // Skip-and-continue: the worker leaves the phase as
                // cancelled, not failed, so collection can proceed.
                let mut collector = self.collector.lock().await;
                collector.on_worker_complete(
                    run_id,
                    task.phase,
                    worker_id,
                    WorkerStatus::Cancelled,
                    None,
                    Some(error.clone()),
                )?;
            }
            AttemptOutcome::Succeeded => unreachable!("failed attempt cannot succeed"),
        }
        Ok(())
    }

    /// Re-examine a run's current phase: dispatch whatever is ready and
    /// close the phase if it settled. The entry point for retry timers,
    /// resume, and the pollers, which don't know the phase number.
    pub(crate) async fn check_current_phase(&self, run_id: &str) -> Result<()> {
        let Some(run) = self.runs.load(run_id)? else {
            return Ok(());
        };
        self.check_phase_completion(run_id, run.current_phase_number)
            .await
    }

    /// Close the phase when nothing remains to run: the collector reports
    /// every spawned worker terminal and the graph offers no further ready
    /// task in the phase. Skipped steps count as settled dependencies, so
    /// work blocked behind them proceeds instead of vanishing.
    pub(crate) async fn check_phase_completion(
        &self,
        run_id: &str,
        phase: u32,
    ) -> Result<()> {
        let Some(run) = self.runs.load(run_id)? else {
            return Ok(());
        };
        // Only a run still in its dispatch stage can close a phase; once the
        // merge pipeline owns it (merging/reviewing), re-entry would
        // double-drive the collection.
        if run.status != crate::runstate::RunStatus::Running
            || run.current_phase_number != phase
        {
            return Ok(());
        }

        // Dispatch until the wave settles. A failing wave can exhaust a
        // task's budget and thereby unblock its dependents, which must get
        // their chance in the same pass; each failing wave burns retry
        // budget, so the loop terminates.
        loop {
            let summary = self.dispatch_current_phase(run_id).await?;
            if !summary.spawned.is_empty() {
                // Workers in flight; their webhooks re-enter this check.
                return Ok(());
            }
            if summary.failed.is_empty() {
                break;
            }
        }

        let run = self.runs.load(run_id)?.expect("run loaded above");
        let skipped = run.skipped_task_ids();
        let graph = progress::parse_file(&activity::progress_path(&run.project_dir))?;
        // Any remaining ready task keeps the phase open (including tasks
        // whose retry timer is still pending).
        if !graph.ready_tasks_in_phase_with(phase, &skipped).is_empty() {
            return Ok(());
        }

        let state = {
            let mut collector = self.collector.lock().await;
            collector.get(run_id, phase)?
        };
        match state {
            Some(state) if !state.workers.is_empty() => {
                if !state.phase_complete() {
                    return Ok(());
                }
                info!(run_id, phase, "phase complete, starting merge pipeline");
                self.on_phase_complete(run_id, phase).await
            }
            _ => {
                // Nothing was ever spawned here. A fully settled phase
                // (every member done or skipped) closes as empty.
                if !graph.phase_settled(phase, &skipped) {
                    return Ok(());
                }
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
                info!(run_id, phase, "phase settled with no spawned workers, completing empty");
                self.complete_phase_and_advance(run_id, phase).await
            }
        }
    }

    /// Resolver agents post to `/worker-complete` without a task id; route
    /// by the run's active resolver context.
    async fn handle_resolver_webhook(
        &self,
        payload: &WorkerCompletePayload,
    ) -> Result<WebhookReply> {
        let Some(mut ctx) = self.resolvers.active_for_run(&payload.run_id)? else {
            warn!(run_id = %payload.run_id, "worker completion resolves to no task and no resolver, ignoring");
            return Ok(WebhookReply::ignored("orphan: no task, no resolver"));
        };

        match payload.status.as_str() {
            "completed" => {
                self.resolvers.mark_completed(&mut ctx)?;
                self.resume_after_resolver(&ctx).await?;
                Ok(WebhookReply::ok("resolver completed, merge resumed"))
            }
            _ => {
                self.resolvers.mark_failed(&mut ctx)?;
                {
                    let run = self.runs.load(&payload.run_id)?;
                    let mut escalations = self.escalations.lock().await;
                    escalations.create(EscalationParams {
                        run_id: payload.run_id.clone(),
                        pipeline: run.map(|r| r.project_name),
                        phase_number: ctx.phase_number,
                        step_order: 0,
                        role_id: Some("conflict-resolver".to_string()),
                        task_id: None,
                        message: format!(
                            "Conflict resolver failed for {} ({:?}): {}",
                            ctx.source_branch,
                            ctx.conflict_files,
                            payload.error.as_deref().unwrap_or("no error given")
                        ),
                        attempt_count: 1,
                        max_attempts: 1,
                        severity: None,
                    })?;
                }
                self.fail_phase(
                    &payload.run_id,
                    ctx.phase_number,
                    "conflict resolution failed",
                )
                .await?;
                Ok(WebhookReply::ok("resolver failure recorded"))
            }
        }
    }

    /// `POST /task-complete` — an agent marking a task done directly.
    pub async fn handle_task_complete(
        &self,
        payload: TaskCompletePayload,
    ) -> Result<WebhookReply> {
        // Find the project: explicit run id, or scan active runs.
        let run = match &payload.run_id {
            Some(run_id) => self.runs.load(run_id)?,
            None => self
                .runs
                .resumable()?
                .into_iter()
                .find(|r| {
                    progress::parse_file(&activity::progress_path(&r.project_dir))
                        .map(|g| g.get(&payload.task_id).is_some())
                        .unwrap_or(false)
                }),
        };
        let Some(run) = run else {
            warn!(task = %payload.task_id, "task completion matches no active run, ignoring");
            return Ok(WebhookReply::ignored("no matching run"));
        };

        let progress_file = activity::progress_path(&run.project_dir);
        let changed = {
            let lock = self.locks.lock_for(&progress_file);
            let _guard = lock.lock().await;
            progress::mark_task_done(&progress_file, &payload.task_id)?
        };
        if !changed {
            return Ok(WebhookReply::ignored("task already done"));
        }

        {
            let mut registry = self.registry.lock().await;
            if registry.get(&run.project_name, &payload.task_id)?.is_some() {
                registry.update_status(
                    &run.project_name,
                    &payload.task_id,
                    RegistryStatus::Completed,
                    None,
                )?;
            }
        }
        {
            let mut escalations = self.escalations.lock().await;
            escalations.resolve_by_task(&payload.task_id, "task completed", None)?;
        }
        activity::log_event(
            &run.project_dir,
            "task-completed",
            serde_json::json!({"runId": run.run_id, "taskId": payload.task_id, "via": "task-complete"}),
        )?;

        // Newly unlocked work may be dispatchable right away, and the mark
        // may have settled the phase.
        self.check_current_phase(&run.run_id).await?;
        Ok(WebhookReply::ok("task marked done"))
    }

    /// `POST /review-result`
    pub async fn handle_review_result(
        &self,
        payload: ReviewResultPayload,
    ) -> Result<WebhookReply> {
        let run_id = &payload.run_id;
        let phase = payload.phase_number;
        let Some(mut cycle) = self.reviews.load(run_id, phase)? else {
            warn!(run_id = %run_id, phase, "review result with no review cycle, ignoring");
            return Ok(WebhookReply::ignored("no review cycle"));
        };
        if cycle.status != crate::review::ReviewCycleStatus::Pending {
            info!(run_id = %run_id, phase, status = ?cycle.status, "review result in non-pending cycle, ignoring");
            return Ok(WebhookReply::ignored("cycle not awaiting review"));
        }
        if let Some(reviewer) = &payload.reviewer
            && self.config.review_chain.get(cycle.reviewer_index) != Some(reviewer)
        {
            info!(run_id = %run_id, phase, reviewer, "verdict from a stale reviewer, ignoring");
            return Ok(WebhookReply::ignored("stale reviewer"));
        }

        let verdict = match payload.status.as_str() {
            "approved" => ReviewVerdict::Approved,
            "request_changes" => ReviewVerdict::RequestChanges,
            other => {
                warn!(status = other, "unrecognized review status");
                return Ok(WebhookReply::ignored(format!("unknown status {other}")));
            }
        };

        let action = cycle.on_review_result(
            &self.config.review_chain,
            verdict,
            payload.findings.clone(),
            payload.summary.clone(),
        )?;
        self.reviews.save(&cycle)?;

        match action {
            ReviewAction::SpawnReviewer(index) => {
                self.spawn_reviewer(run_id, phase, index).await?;
                Ok(WebhookReply::ok("next reviewer spawned"))
            }
            ReviewAction::SpawnFixer(findings) => {
                self.spawn_fixer(run_id, phase, &findings).await?;
                Ok(WebhookReply::ok("fixer spawned"))
            }
            ReviewAction::MergeToBase => {
                self.merge_to_base(run_id, phase).await?;
                Ok(WebhookReply::ok("phase approved and merged"))
            }
            ReviewAction::AwaitHuman => {
                warn!(run_id = %run_id, phase, "review requested changes without findings; needs clarification");
                if let Some(run) = self.runs.load(run_id)? {
                    activity::log_event(
                        &run.project_dir,
                        "needs-clarification",
                        serde_json::json!({"runId": run_id, "phaseNumber": phase, "summary": payload.summary}),
                    )?;
                }
                Ok(WebhookReply::ok("awaiting human clarification"))
            }
            ReviewAction::Escalate => {
                let run = self.runs.load(run_id)?;
                {
                    let mut escalations = self.escalations.lock().await;
                    escalations.create(EscalationParams {
                        run_id: run_id.to_string(),
                        pipeline: run.as_ref().map(|r| r.project_name.clone()),
                        phase_number: phase,
                        step_order: 0,
                        role_id: None,
                        task_id: None,
                        message: format!(
                            "Review fix attempts exhausted after {} fixes for phase {phase}",
                            cycle.fix_count
                        ),
                        attempt_count: cycle.fix_count,
                        max_attempts: cycle.max_fix_attempts,
                        severity: Some(crate::escalation::Severity::High),
                    })?;
                }
                self.fail_phase(run_id, phase, "review fix attempts exhausted")
                    .await?;
                Ok(WebhookReply::ok("escalated"))
            }
        }
    }

    /// `POST /fix-complete`
    pub async fn handle_fix_complete(
        &self,
        payload: FixCompletePayload,
    ) -> Result<WebhookReply> {
        let run_id = &payload.run_id;
        let phase = payload.phase_number;
        let Some(mut cycle) = self.reviews.load(run_id, phase)? else {
            warn!(run_id = %run_id, phase, "fix completion with no review cycle, ignoring");
            return Ok(WebhookReply::ignored("no review cycle"));
        };
        if cycle.status != crate::review::ReviewCycleStatus::Fixing {
            info!(run_id = %run_id, phase, status = ?cycle.status, "fix completion in non-fixing cycle, ignoring");
            return Ok(WebhookReply::ignored("cycle not fixing"));
        }

        let success = payload.success.unwrap_or(true);
        let action = cycle.on_fix_complete(success)?;
        self.reviews.save(&cycle)?;

        match action {
            ReviewAction::SpawnReviewer(index) => {
                // Fixes landed; the current reviewer re-reviews.
                self.spawn_reviewer(run_id, phase, index).await?;
                Ok(WebhookReply::ok("re-review spawned"))
            }
            ReviewAction::SpawnFixer(_) => {
                let history_findings = cycle
                    .history
                    .iter()
                    .rev()
                    .find(|a| !a.findings.is_empty())
                    .map(|a| a.findings.clone())
                    .unwrap_or_default();
                self.spawn_fixer(run_id, phase, &history_findings).await?;
                Ok(WebhookReply::ok("fixer respawned"))
            }
            ReviewAction::Escalate => {
                {
                    let run = self.runs.load(run_id)?;
                    let mut escalations = self.escalations.lock().await;
                    escalations.create(EscalationParams {
                        run_id: run_id.to_string(),
                        pipeline: run.map(|r| r.project_name),
                        phase_number: phase,
                        step_order: 0,
                        role_id: Some("fixer".to_string()),
                        task_id: None,
                        message: format!("Fixer failed repeatedly for phase {phase}"),
                        attempt_count: cycle.fix_count,
                        max_attempts: cycle.max_fix_attempts,
                        severity: Some(crate::escalation::Severity::High),
                    })?;
                }
                self.fail_phase(run_id, phase, "fixer attempts exhausted")
                    .await?;
                Ok(WebhookReply::ok("escalated"))
            }
            other => {
                warn!(?other, "unexpected review action after fix completion");
                Ok(WebhookReply::ok("recorded"))
            }
        }
    }

    /// `POST /spec-complete` — the spec agent finished writing the plan.
    pub async fn handle_spec_complete(
        &self,
        payload: SpecCompletePayload,
    ) -> Result<WebhookReply> {
        let project_dir = self.project_dir(&payload.project);
        let state = activity::load_state(&project_dir)?;
        if state.phase != ProjectPhase::Spec {
            info!(project = %payload.project, phase = state.phase.as_str(), "spec completion outside spec phase, ignoring");
            return Ok(WebhookReply::ignored("project not in spec phase"));
        }
        activity::advance_phase(&project_dir, ProjectPhase::Build, "spec complete")?;
        activity::log_event(
            &project_dir,
            "spec-complete",
            serde_json::json!({"summary": payload.summary, "source": payload.source}),
        )?;
        self.start_project(&payload.project).await?;
        Ok(WebhookReply::ok("project advanced to build"))
    }

    /// `POST /orchestrate` — idempotent dispatcher invocation.
    pub async fn handle_orchestrate(
        &self,
        payload: OrchestratePayload,
    ) -> Result<WebhookReply> {
        match payload.action.as_str() {
            "start" => {
                let run = self.start_project(&payload.project).await?;
                Ok(WebhookReply::ok(format!("run {} active", run.run_id)))
            }
            "continue" => match self.runs.active_run_for(&payload.project)? {
                Some(run) => {
                    self.check_current_phase(&run.run_id).await?;
                    Ok(WebhookReply::ok(format!("run {} re-examined", run.run_id)))
                }
                None => Ok(WebhookReply::ignored("no active run")),
            },
            other => Ok(WebhookReply::ignored(format!("unknown action {other}"))),
        }
    }
}
