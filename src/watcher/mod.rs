//! Phase advancement poller and progress watchdog.
//!
//! The watcher ticks every 30 seconds (configurable) and decides, per
//! project, whether the lifecycle phase should advance — the polling
//! counterpart to the event-driven advancer in the webhook handlers. The
//! watchdog runs on a slower cadence and force-continues projects whose
//! state files have gone quiet mid-build.
//!
//! Both ticks are idempotent: every decision re-derives from files, and
//! per-(project, phase) cooldowns keep them from respawning agents that are
//! still working.

use crate::activity::{self, ProjectPhase};
use crate::escalation::EscalationParams;
use crate::gateway::SpawnRequest;
use crate::orchestrator::Orchestrator;
use crate::registry::RegistryStatus;
use crate::runstate::latest_mtime;
use crate::{progress, prompts};
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Start the watcher and watchdog loops.
pub fn spawn_pollers(orchestrator: Arc<Orchestrator>) -> (JoinHandle<()>, JoinHandle<()>) {
    let watcher = {
        let orch = orchestrator.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(orch.config.watcher_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = watcher_tick(&orch).await {
                    warn!(error = %e, "watcher tick failed");
                }
            }
        })
    };
    let watchdog = {
        let orch = orchestrator;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(orch.config.watchdog_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = watchdog_tick(&orch).await {
                    warn!(error = %e, "watchdog tick failed");
                }
            }
        })
    };
    (watcher, watchdog)
}

fn list_projects(projects_root: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(projects_root) else {
        return Vec::new();
    };
    let mut projects: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    projects.sort();
    projects
}

/// One watcher pass over every project. Returns the actions taken, for
/// logging and tests.
pub async fn watcher_tick(orch: &Arc<Orchestrator>) -> Result<Vec<String>> {
    let mut actions = Vec::new();
    for project in list_projects(&orch.config.projects_root) {
        match advance_project(orch, &project).await {
            Ok(Some(action)) => actions.push(format!("{project}: {action}")),
            Ok(None) => {}
            Err(e) => warn!(project, error = %e, "project advancement failed"),
        }
    }
    Ok(actions)
}

/// Check the cooldown for (project, phase); true means go (and stamps now).
fn cooldown_elapsed(
    orch: &Arc<Orchestrator>,
    project: &str,
    phase: ProjectPhase,
    window: std::time::Duration,
) -> bool {
    let key = (project.to_string(), phase.as_str().to_string());
    let mut cooldowns = orch.cooldowns.lock().expect("cooldown table poisoned");
    let go = cooldowns
        .get(&key)
        .is_none_or(|last| last.elapsed() >= window);
    if go {
        cooldowns.insert(key, Instant::now());
    }
    go
}

async fn advance_project(orch: &Arc<Orchestrator>, project: &str) -> Result<Option<String>> {
    let project_dir = orch.config.project_dir(project);
    let state = activity::load_state(&project_dir)?;
    if state.status == "error" || state.status == "complete" {
        return Ok(None);
    }

    match state.phase {
        ProjectPhase::Interview => {
            if activity::load_interview(&project_dir)?.complete {
                activity::advance_phase(&project_dir, ProjectPhase::Spec, "interview complete")?;
                activity::log_event(&project_dir, "phase-advanced", serde_json::json!({"to": "spec"}))?;
                spawn_spec_writer(orch, project, &project_dir).await?;
                return Ok(Some("interview -> spec".to_string()));
            }
        }
        ProjectPhase::Spec => {
            let plan_ready = activity::plan_path(&project_dir).exists();
            let progress_annotated = std::fs::read_to_string(activity::progress_path(&project_dir))
                .map(|text| text.contains("@id("))
                .unwrap_or(false);
            if plan_ready && progress_annotated {
                activity::advance_phase(&project_dir, ProjectPhase::Build, "plan and tasks ready")?;
                activity::log_event(&project_dir, "phase-advanced", serde_json::json!({"to": "build"}))?;
                orch.start_project(project).await?;
                return Ok(Some("spec -> build".to_string()));
            }
            // The spec agent may have died; respawn it after the (long)
            // spec cooldown.
            if cooldown_elapsed(orch, project, ProjectPhase::Spec, orch.config.spec_cooldown) {
                spawn_spec_writer(orch, project, &project_dir).await?;
                return Ok(Some("spec agent respawned".to_string()));
            }
        }
        ProjectPhase::Build | ProjectPhase::Review => {
            let progress_file = activity::progress_path(&project_dir);
            let graph = match progress::parse_file(&progress_file) {
                Ok(graph) => graph,
                Err(e) => {
                    // Surfaced to the operator; the pipeline does not
                    // advance on a document that fails to parse.
                    warn!(project, error = %e, "progress document failed to parse");
                    activity::log_event(
                        &project_dir,
                        "parse-error",
                        serde_json::json!({"error": e.to_string()}),
                    )?;
                    return Ok(None);
                }
            };

            // Skipped steps count as settled: a pipeline that used
            // skip-and-continue leaves its escalated boxes unchecked but
            // must still be able to leave build.
            let skipped = orch.project_skipped_tasks(project)?;
            if graph.all_settled(&skipped) {
                let (to, label) = match state.phase {
                    ProjectPhase::Build => (ProjectPhase::Review, "build -> review"),
                    _ => (ProjectPhase::Complete, "review -> complete"),
                };
                activity::advance_phase(&project_dir, to, label)?;
                activity::log_event(
                    &project_dir,
                    "phase-advanced",
                    serde_json::json!({"to": to.as_str()}),
                )?;
                return Ok(Some(label.to_string()));
            }

            // Recovery path: a stalled active run (nothing running, nothing
            // pending), or ready work with no run at all.
            match orch.runs.active_run_for(project)? {
                Some(run) => {
                    if !has_running_workers(orch, &run.run_id).await?
                        && cooldown_elapsed(orch, project, state.phase, orch.config.build_cooldown)
                    {
                        info!(project, "active run with nothing running, re-examining");
                        orch.check_current_phase(&run.run_id).await?;
                        return Ok(Some("re-examined".to_string()));
                    }
                }
                None => {
                    if !graph.ready_tasks_with(&skipped).is_empty()
                        && cooldown_elapsed(orch, project, state.phase, orch.config.build_cooldown)
                    {
                        info!(project, "ready tasks with no active run, starting run");
                        orch.start_project(project).await?;
                        return Ok(Some("re-dispatched".to_string()));
                    }
                }
            }
        }
        ProjectPhase::Complete => {}
    }
    Ok(None)
}

async fn has_running_workers(orch: &Arc<Orchestrator>, run_id: &str) -> Result<bool> {
    let entries = {
        let mut registry = orch.registry.lock().await;
        registry.by_run(run_id)?
    };
    Ok(entries
        .iter()
        .any(|(_, e)| e.status == RegistryStatus::Running))
}

async fn spawn_spec_writer(
    orch: &Arc<Orchestrator>,
    project: &str,
    project_dir: &Path,
) -> Result<()> {
    let role = orch.roles.get("spec-writer")?;
    let (model, thinking, instructions) = match role {
        Some(role) => {
            let instructions = orch.roles.instructions_for(&role)?;
            (role.model, role.thinking, instructions)
        }
        None => ("default".to_string(), Default::default(), String::new()),
    };
    let webhook_url = format!("{}/spec-complete", orch.config.public_base_url);
    let prompt = prompts::build_spec_prompt(&instructions, project, project_dir, &webhook_url);
    match orch
        .gateway
        .spawn(SpawnRequest {
            task: prompt,
            label: format!("{project}/spec"),
            model,
            thinking,
            cleanup: true,
            run_timeout_seconds: Some(orch.config.run_timeout.as_secs()),
            skip_verify: None,
        })
        .await
    {
        Ok(resp) => {
            activity::log_event(
                project_dir,
                "spec-spawned",
                serde_json::json!({"sessionKey": resp.child_session_key}),
            )?;
            Ok(())
        }
        Err(e) => {
            warn!(project, error = %e, "spec writer spawn failed");
            Ok(())
        }
    }
}

/// One watchdog pass: force-continue projects whose progress, activity, and
/// state files have all gone stale while a run is supposedly in flight.
pub async fn watchdog_tick(orch: &Arc<Orchestrator>) -> Result<Vec<String>> {
    let mut actions = Vec::new();

    // Registry entries stuck in running long past the session timeout are
    // dead agents; sweeping them failed lets the next dispatch reclaim them.
    let stale_deadline = chrono::Duration::from_std(
        orch.config.run_timeout + orch.config.watchdog_stale_after,
    )
    .unwrap_or_else(|_| chrono::Duration::minutes(20));
    let swept = {
        let mut registry = orch.registry.lock().await;
        registry.clear_stale(stale_deadline)?
    };
    for key in &swept {
        warn!(entry = %key, "swept stale registry entry");
    }

    // Closed escalations age out after a month; open ones never do.
    {
        let mut escalations = orch.escalations.lock().await;
        let dropped = escalations.prune(30)?;
        if dropped > 0 {
            info!(dropped, "pruned closed escalations");
        }
    }

    for project in list_projects(&orch.config.projects_root) {
        let project_dir = orch.config.project_dir(&project);
        let state = activity::load_state(&project_dir)?;
        if state.status != "running"
            || !matches!(state.phase, ProjectPhase::Build | ProjectPhase::Review)
        {
            continue;
        }

        let newest = latest_mtime(&[
            &activity::progress_path(&project_dir),
            &activity::activity_path(&project_dir),
            &activity::state_path(&project_dir),
        ]);
        let stale = newest
            .and_then(|t| t.elapsed().ok())
            .is_some_and(|age| age > orch.config.watchdog_stale_after);
        if !stale {
            continue;
        }

        let key = (project.clone(), state.phase.as_str().to_string());
        let count = {
            let mut counts = orch.watchdog_counts.lock().expect("watchdog table poisoned");
            let count = counts.entry(key).or_insert(0);
            *count += 1;
            *count
        };

        if count > orch.config.watchdog_max_retries {
            continue;
        }
        if count == orch.config.watchdog_max_retries {
            warn!(project, count, "watchdog retries exhausted, escalating");
            let run_id = orch
                .runs
                .active_run_for(&project)?
                .map(|r| r.run_id)
                .unwrap_or_default();
            let mut escalations = orch.escalations.lock().await;
            escalations.create(EscalationParams {
                run_id,
                pipeline: Some(project.clone()),
                phase_number: 0,
                step_order: 0,
                role_id: None,
                task_id: None,
                message: format!(
                    "Project '{project}' made no progress across {count} watchdog retries"
                ),
                attempt_count: count,
                max_attempts: orch.config.watchdog_max_retries,
                severity: None,
            })?;
            actions.push(format!("{project}: escalated"));
            continue;
        }

        info!(project, count, "no progress detected, forcing re-dispatch");
        activity::log_event(
            &project_dir,
            "watchdog-retry",
            serde_json::json!({"attempt": count}),
        )?;
        if let Some(run) = orch.runs.active_run_for(&project)? {
            orch.check_current_phase(&run.run_id).await?;
        }
        actions.push(format!("{project}: watchdog-retry {count}"));
    }
    Ok(actions)
}
