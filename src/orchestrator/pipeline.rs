//! Phase pipeline: collection → merge loop → review chain → advancement.
//!
//! Entered when the collector reports a phase complete. Every transition is
//! persisted before the next suspension point, so a crash resumes from the
//! last completed step instead of replaying the phase.

use super::Orchestrator;
use crate::escalation::{EscalationParams, Severity};
use crate::gateway::SpawnRequest;
use crate::ledger::WorkStatus;
use crate::resolver::{NewResolver, ResolverContext};
use crate::review::{self, MergeLoopOutcome};
use crate::runstate::RunStatus;
use crate::{activity, collector};
use anyhow::{Context, Result};
use tracing::{error, info, warn};

impl Orchestrator {
    /// A phase's workers are all terminal: collect branches and start the
    /// merge pipeline (or short-circuit an empty phase).
    pub(crate) async fn on_phase_complete(&self, run_id: &str, phase: u32) -> Result<()> {
        let collected = {
            let mut collector = self.collector.lock().await;
            collector
                .collect_phase_branches(run_id, phase, &self.worktrees)
                .await
        };
        let collected = match collected {
            Ok(collected) => collected,
            Err(e) => {
                error!(run_id, phase, error = %e, "branch collection failed");
                self.fail_phase(run_id, phase, &format!("branch collection failed: {e}"))
                    .await?;
                return Ok(());
            }
        };

        if collected.empty {
            info!(run_id, phase, "no worker produced commits, completing phase empty");
            self.complete_phase_and_advance(run_id, phase).await?;
            return Ok(());
        }

        self.with_run(run_id, |run| {
            run.status = RunStatus::Merging;
            Ok(())
        })
        .await?;
        {
            let mut collector = self.collector.lock().await;
            collector.advance_status(run_id, phase, collector::PhaseStatus::Merging)?;
        }
        self.run_merge_loop(run_id, phase, &collected.phase_branch, &collected.branches)
            .await
    }

    /// Merge worker branches into the phase branch; a conflict pauses the
    /// loop and hands the remainder to a resolver agent.
    pub(crate) async fn run_merge_loop(
        &self,
        run_id: &str,
        phase: u32,
        phase_branch: &str,
        branches: &[String],
    ) -> Result<()> {
        let run = self
            .runs
            .load(run_id)?
            .context("run vanished during merge")?;

        match review::merge_branches(&self.worktrees, &run.repo_dir, phase_branch, branches)
            .await?
        {
            MergeLoopOutcome::Completed => self.start_review_chain(run_id, phase).await,
            MergeLoopOutcome::Conflicted {
                source_branch,
                conflict_files,
                remaining_branches,
            } => {
                let ctx = self.resolvers.create(NewResolver {
                    run_id: run_id.to_string(),
                    phase_number: phase,
                    phase_branch: phase_branch.to_string(),
                    source_branch,
                    conflict_files,
                    remaining_branches,
                    repo_dir: run.repo_dir.clone(),
                })?;
                activity::log_event(
                    &run.project_dir,
                    "merge-conflict",
                    serde_json::json!({
                        "runId": run_id,
                        "phaseNumber": phase,
                        "sourceBranch": ctx.source_branch,
                        "conflictFiles": ctx.conflict_files,
                    }),
                )?;
                self.spawn_resolver(&ctx).await
            }
        }
    }

    /// The resolver finished; resume merging whatever branches remain.
    pub(crate) async fn resume_after_resolver(
        &self,
        ctx: &ResolverContext,
    ) -> Result<()> {
        info!(
            run_id = %ctx.run_id,
            phase = ctx.phase_number,
            remaining = ctx.remaining_branches.len(),
            "resolver completed, resuming merge loop"
        );
        self.run_merge_loop(
            &ctx.run_id,
            ctx.phase_number,
            &ctx.phase_branch,
            &ctx.remaining_branches.clone(),
        )
        .await
    }

    /// Every branch merged: run the review chain from its first reviewer.
    async fn start_review_chain(&self, run_id: &str, phase: u32) -> Result<()> {
        self.with_run(run_id, |run| {
            run.status = RunStatus::Reviewing;
            Ok(())
        })
        .await?;
        {
            let mut collector = self.collector.lock().await;
            collector.advance_status(run_id, phase, collector::PhaseStatus::Reviewing)?;
        }
        self.reviews
            .load_or_create(run_id, phase, self.config.max_fix_attempts)?;
        self.spawn_reviewer(run_id, phase, 0).await
    }

    /// Spawn the reviewer at `index` in the configured chain. The chain is
    /// strictly sequential: this is only called for index 0 or after the
    /// previous reviewer approved.
    pub(crate) async fn spawn_reviewer(
        &self,
        run_id: &str,
        phase: u32,
        index: usize,
    ) -> Result<()> {
        let run = self.runs.load(run_id)?.context("run not found")?;
        let role_id = self
            .config
            .review_chain
            .get(index)
            .cloned()
            .unwrap_or_else(|| "reviewer".to_string());
        let instructions = self.role_instructions(&role_id)?;
        let phase_branch = crate::gitops::phase_branch(run_id, phase);
        let webhook_url = format!("{}/review-result", self.config.public_base_url);
        let prompt = crate::prompts::build_reviewer_prompt(
            &instructions,
            &role_id,
            run_id,
            phase,
            &phase_branch,
            &run.repo_dir,
            &webhook_url,
        );

        let work_item = self
            .ledger_create_task(
                &format!("Review phase {phase} ({role_id})"),
                "review",
                Some(role_id.clone()),
                run_id,
                phase,
            )
            .await?;

        let session = self.spawn_agent(&role_id, prompt, format!("{run_id}/review-{role_id}")).await;
        match session {
            Ok(session_key) => {
                self.ledger_status_lenient(&work_item.id, WorkStatus::Running, None)
                    .await;
                let mut cycle = self
                    .reviews
                    .load_or_create(run_id, phase, self.config.max_fix_attempts)?;
                cycle.mark_pending(Some(session_key.clone()));
                self.reviews.save(&cycle)?;
                activity::log_event(
                    &run.project_dir,
                    "review-spawned",
                    serde_json::json!({
                        "runId": run_id,
                        "phaseNumber": phase,
                        "reviewer": role_id,
                        "chainIndex": index,
                        "sessionKey": session_key,
                    }),
                )?;
                Ok(())
            }
            Err(e) => {
                self.ledger_status_lenient(&work_item.id, WorkStatus::Running, None)
                    .await;
                self.ledger_status_lenient(&work_item.id, WorkStatus::Failed, Some(e.to_string()))
                    .await;
                self.fail_phase(
                    run_id,
                    phase,
                    &format!("failed to spawn reviewer {role_id}: {e}"),
                )
                .await
            }
        }
    }

    /// Spawn a fixer for the current findings.
    pub(crate) async fn spawn_fixer(
        &self,
        run_id: &str,
        phase: u32,
        findings: &[review::Finding],
    ) -> Result<()> {
        let run = self.runs.load(run_id)?.context("run not found")?;
        let instructions = self.role_instructions("fixer")?;
        let phase_branch = crate::gitops::phase_branch(run_id, phase);
        let webhook_url = format!("{}/fix-complete", self.config.public_base_url);
        let prompt = crate::prompts::build_fixer_prompt(
            &instructions,
            run_id,
            phase,
            &phase_branch,
            &run.repo_dir,
            findings,
            &webhook_url,
        );

        match self
            .spawn_agent("fixer", prompt, format!("{run_id}/fix-phase-{phase}"))
            .await
        {
            Ok(session_key) => {
                activity::log_event(
                    &run.project_dir,
                    "fixer-spawned",
                    serde_json::json!({
                        "runId": run_id,
                        "phaseNumber": phase,
                        "findings": findings.len(),
                        "sessionKey": session_key,
                    }),
                )?;
                Ok(())
            }
            Err(e) => {
                self.fail_phase(run_id, phase, &format!("failed to spawn fixer: {e}"))
                    .await
            }
        }
    }

    /// Spawn a conflict-resolver agent for a persisted context.
    pub(crate) async fn spawn_resolver(&self, ctx: &ResolverContext) -> Result<()> {
        self.runs.load(&ctx.run_id)?.context("run not found")?;
        let instructions = self.role_instructions("conflict-resolver")?;

        // Name the tasks whose branches collided so the resolver understands
        // both sides' intent.
        let colliding: Vec<String> = {
            let mut collector = self.collector.lock().await;
            collector
                .get(&ctx.run_id, ctx.phase_number)?
                .map(|state| {
                    state
                        .workers
                        .iter()
                        .filter(|w| w.branch == ctx.source_branch)
                        .map(|w| w.task_id.clone())
                        .collect()
                })
                .unwrap_or_default()
        };

        let webhook_url = format!("{}/worker-complete", self.config.public_base_url);
        let prompt = crate::prompts::build_resolver_prompt(
            &instructions,
            &ctx.run_id,
            &ctx.phase_branch,
            &ctx.source_branch,
            &ctx.conflict_files,
            &colliding,
            &ctx.repo_dir,
            &webhook_url,
        );

        match self
            .spawn_agent(
                "conflict-resolver",
                prompt,
                format!("{}/resolve-{}", ctx.run_id, ctx.id),
            )
            .await
        {
            Ok(session_key) => {
                let mut updated = ctx.clone();
                updated.session_key = Some(session_key);
                self.resolvers.save(&updated)?;
                Ok(())
            }
            Err(e) => {
                let mut updated = ctx.clone();
                self.resolvers.mark_failed(&mut updated)?;
                self.fail_phase(
                    &ctx.run_id,
                    ctx.phase_number,
                    &format!("failed to spawn conflict resolver: {e}"),
                )
                .await
            }
        }
    }

    /// The last reviewer approved: merge the phase branch into base.
    pub(crate) async fn merge_to_base(&self, run_id: &str, phase: u32) -> Result<()> {
        let run = self.runs.load(run_id)?.context("run not found")?;
        let phase_branch = crate::gitops::phase_branch(run_id, phase);
        let outcome = review::merge_phase_into_base(
            &self.worktrees,
            &run.repo_dir,
            &run.base_branch,
            &phase_branch,
            phase,
            run_id,
        )
        .await?;

        if outcome.conflicted {
            // The manager already aborted and restored the previous branch.
            warn!(run_id, phase, files = ?outcome.conflict_files, "final merge conflicted");
            {
                let mut escalations = self.escalations.lock().await;
                escalations.create(EscalationParams {
                    run_id: run_id.to_string(),
                    pipeline: Some(run.project_name.clone()),
                    phase_number: phase,
                    step_order: 0,
                    role_id: None,
                    task_id: None,
                    message: format!(
                        "Merging {phase_branch} into {} conflicted in {:?}",
                        run.base_branch, outcome.conflict_files
                    ),
                    attempt_count: 1,
                    max_attempts: 1,
                    severity: Some(Severity::High),
                })?;
            }
            self.fail_phase(run_id, phase, "phase merge into base conflicted")
                .await?;
            return Ok(());
        }

        let mut cycle = self
            .reviews
            .load_or_create(run_id, phase, self.config.max_fix_attempts)?;
        cycle.mark_merged();
        self.reviews.save(&cycle)?;
        activity::log_event(
            &run.project_dir,
            "phase-merged",
            serde_json::json!({"runId": run_id, "phaseNumber": phase, "base": run.base_branch}),
        )?;
        self.complete_phase_and_advance(run_id, phase).await
    }

    /// Close out a phase and either dispatch the next one or complete the
    /// run. Worker branches and worktrees are destroyed here; phase branches
    /// live until the run terminates.
    pub(crate) async fn complete_phase_and_advance(
        &self,
        run_id: &str,
        phase: u32,
    ) -> Result<()> {
        let workers = {
            let mut collector = self.collector.lock().await;
            let workers = collector
                .get(run_id, phase)?
                .map(|s| s.workers)
                .unwrap_or_default();
            collector.complete_phase(run_id, phase)?;
            workers
        };

        let run = self.runs.load(run_id)?.context("run not found")?;
        for worker in &workers {
            let path = self.worktrees.worktree_path(run_id, &worker.worker_id);
            if let Err(e) = self
                .worktrees
                .remove_worktree(&run.repo_dir, &path, &worker.branch)
                .await
            {
                warn!(run_id, worker = %worker.worker_id, error = %e, "worktree cleanup failed");
            }
        }

        let next = self
            .with_run(run_id, |run| {
                run.mark_phase_complete(phase);
                let next = run.next_phase();
                match next {
                    Some(n) => {
                        run.current_phase_number = n;
                        run.status = RunStatus::Running;
                    }
                    None => run.finish(RunStatus::Completed),
                }
                Ok(next)
            })
            .await?;

        activity::log_event(
            &run.project_dir,
            "phase-completed",
            serde_json::json!({"runId": run_id, "phaseNumber": phase, "nextPhase": next}),
        )?;

        match next {
            Some(next_phase) => {
                info!(run_id, phase = next_phase, "advancing to next phase");
                self.dispatch_current_phase(run_id).await?;
                Ok(())
            }
            None => {
                info!(run_id, "run completed");
                self.runs.clear_active_run(&run.project_name)?;
                self.cleanup_phase_branches(run_id).await;
                activity::log_event(
                    &run.project_dir,
                    "run-completed",
                    serde_json::json!({"runId": run_id}),
                )?;
                Ok(())
            }
        }
    }

    /// Terminal phase failure: fail the phase and the run, mark the project
    /// errored (its phase is preserved for inspection).
    pub(crate) async fn fail_phase(
        &self,
        run_id: &str,
        phase: u32,
        message: &str,
    ) -> Result<()> {
        error!(run_id, phase, message, "phase failed");
        {
            let mut collector = self.collector.lock().await;
            if let Err(e) = collector.fail_phase(run_id, phase) {
                warn!(run_id, phase, error = %e, "collector fail_phase");
            }
        }
        let run = self
            .with_run(run_id, |run| {
                run.finish(RunStatus::Failed);
                Ok(run.clone())
            })
            .await?;
        self.runs.clear_active_run(&run.project_name)?;
        self.cleanup_phase_branches(run_id).await;
        activity::mark_error(&run.project_dir, message)?;
        activity::log_event(
            &run.project_dir,
            "phase-failed",
            serde_json::json!({"runId": run_id, "phaseNumber": phase, "message": message}),
        )?;
        Ok(())
    }

    /// Delete the run's phase branches (terminal runs only).
    async fn cleanup_phase_branches(&self, run_id: &str) {
        let Ok(Some(run)) = self.runs.load(run_id) else {
            return;
        };
        for phase in &run.phases {
            let branch = crate::gitops::phase_branch(run_id, phase.number);
            if matches!(self.worktrees.branch_exists(&run.repo_dir, &branch), Ok(true))
                && let Err(e) = self.worktrees.delete_branch(&run.repo_dir, &branch).await
            {
                warn!(run_id, branch, error = %e, "phase branch cleanup failed");
            }
        }
    }

    /// Resolve a role's instruction text with builtin fallback.
    fn role_instructions(&self, role_id: &str) -> Result<String> {
        match self.roles.get(role_id)? {
            Some(role) => self.roles.instructions_for(&role),
            None => Ok(String::new()),
        }
    }

    /// Fire one gateway spawn for a support agent (reviewer, fixer,
    /// resolver), returning its session key.
    async fn spawn_agent(
        &self,
        role_id: &str,
        prompt: String,
        label: String,
    ) -> Result<String> {
        let role = self.roles.get(role_id)?;
        let (model, thinking) = role
            .map(|r| (r.model, r.thinking))
            .unwrap_or_else(|| ("default".to_string(), Default::default()));
        let response = self
            .gateway
            .spawn(SpawnRequest {
                task: prompt,
                label,
                model,
                thinking,
                cleanup: true,
                run_timeout_seconds: Some(self.config.run_timeout.as_secs()),
                skip_verify: None,
            })
            .await?;
        Ok(response.child_session_key)
    }
}
