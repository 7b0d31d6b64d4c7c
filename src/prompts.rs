//! Prompt templates for spawned agent sessions.
//!
//! Every prompt embeds the webhook URL the agent must call on completion;
//! that callback is the only way work re-enters the orchestrator.
//!
//! ## Prompt Types
//!
//! - **Worker prompt**: one task, executed inside a dedicated worktree
//! - **Reviewer prompt**: one review-chain stage over a phase branch
//! - **Fixer prompt**: address review findings and trigger re-review
//! - **Resolver prompt**: resolve a merge conflict on the phase branch

use crate::progress::Task;
use crate::review::Finding;
use std::path::Path;

/// Hook for appending extra skill material to a worker prompt.
///
/// The default implementation injects a web-visuals skill document for
/// builder tasks whose titles look like front-end work. Deployments can swap
/// in their own augmenter.
pub trait PromptAugmenter: Send + Sync {
    fn augment(&self, role_id: &str, task: &Task) -> Option<String>;
}

/// Keyword heuristic over task titles.
pub struct WebVisualsAugmenter {
    keywords: Vec<&'static str>,
    skill: String,
}

impl Default for WebVisualsAugmenter {
    fn default() -> Self {
        Self {
            keywords: vec![
                "ui", "page", "frontend", "css", "design", "layout", "component", "styling",
            ],
            skill: "## Web Visuals\n\nWhen building user-facing pages, take a screenshot-driven \
                    approach: build, render, inspect, refine. Prefer semantic markup and a small, \
                    consistent spacing scale.\n"
                .to_string(),
        }
    }
}

impl PromptAugmenter for WebVisualsAugmenter {
    fn augment(&self, role_id: &str, task: &Task) -> Option<String> {
        if role_id != "builder" {
            return None;
        }
        let title = task.title.to_lowercase();
        if self.keywords.iter().any(|k| title.contains(k)) {
            Some(self.skill.clone())
        } else {
            None
        }
    }
}

/// Augmenter that never fires.
pub struct NoAugmenter;

impl PromptAugmenter for NoAugmenter {
    fn augment(&self, _role_id: &str, _task: &Task) -> Option<String> {
        None
    }
}

fn completion_section(webhook_url: &str, payload: &str) -> String {
    format!(
        "## Completion\n\n\
         When you are done, report the result (this is mandatory; the pipeline \
         cannot advance without it):\n\n\
         ```bash\n\
         curl -X POST {webhook_url} -H 'Content-Type: application/json' \\\n\
           -d '{payload}'\n\
         ```\n\n\
         On failure, send the same request with `\"status\": \"failed\"` and an \
         `\"error\"` field describing what went wrong.\n"
    )
}

/// Build the prompt for one worker spawned on one task.
pub fn build_worker_prompt(
    role_instructions: &str,
    task: &Task,
    run_id: &str,
    step_order: u64,
    working_dir: &Path,
    branch: &str,
    webhook_url: &str,
    skill: Option<&str>,
) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "# Task: {}\n\nYou are executing task `{}` in run `{}`.\n\n",
        task.title, task.id, run_id
    ));

    prompt.push_str("## Role\n\n");
    prompt.push_str(role_instructions);
    prompt.push_str("\n\n");

    prompt.push_str("## Workspace\n\n");
    prompt.push_str(&format!(
        "- **Directory**: `{}`\n- **Branch**: `{}`\n\n\
         Work only inside this directory. Commit your changes on the current \
         branch; do not switch branches or push.\n\n",
        working_dir.display(),
        branch
    ));

    if !task.depends_on.is_empty() {
        prompt.push_str(&format!(
            "## Dependencies\n\nAlready completed: {}\n\n",
            task.depends_on.join(", ")
        ));
    }

    if let Some(skill) = skill {
        prompt.push_str(skill);
        prompt.push('\n');
    }

    let payload = format!(
        "{{\"runId\": \"{run_id}\", \"stepOrder\": {step_order}, \"taskId\": \"{}\", \"status\": \"completed\"}}",
        task.id
    );
    prompt.push_str(&completion_section(webhook_url, &payload));
    prompt
}

/// Build the prompt for one review-chain stage.
pub fn build_reviewer_prompt(
    role_instructions: &str,
    reviewer_role: &str,
    run_id: &str,
    phase_number: u32,
    phase_branch: &str,
    repo_dir: &Path,
    webhook_url: &str,
) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!(
        "# Review: phase {phase_number} of run {run_id}\n\n"
    ));
    prompt.push_str("## Role\n\n");
    prompt.push_str(role_instructions);
    prompt.push_str("\n\n");
    prompt.push_str(&format!(
        "## Target\n\n\
         Review branch `{phase_branch}` in `{}`. Read the diff against the \
         base branch and judge the merged result as a whole.\n\n",
        repo_dir.display()
    ));
    prompt.push_str(&format!(
        "## Verdict\n\n\
         Post exactly one verdict:\n\n\
         ```bash\n\
         curl -X POST {webhook_url} -H 'Content-Type: application/json' \\\n\
           -d '{{\"runId\": \"{run_id}\", \"phaseNumber\": {phase_number}, \"reviewer\": \"{reviewer_role}\", \"status\": \"approved\", \"summary\": \"...\"}}'\n\
         ```\n\n\
         To request changes, use `\"status\": \"request_changes\"` and include a \
         `findings` array of `{{severity, file, line, description, fix}}` objects. \
         A change request without findings is treated as needing human \
         clarification, so always enumerate concrete findings.\n"
    ));
    prompt
}

/// Build the prompt for a fixer addressing review findings.
pub fn build_fixer_prompt(
    role_instructions: &str,
    run_id: &str,
    phase_number: u32,
    phase_branch: &str,
    repo_dir: &Path,
    findings: &[Finding],
    webhook_url: &str,
) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!(
        "# Fix review findings: phase {phase_number} of run {run_id}\n\n"
    ));
    prompt.push_str("## Role\n\n");
    prompt.push_str(role_instructions);
    prompt.push_str("\n\n");
    prompt.push_str(&format!(
        "## Workspace\n\nBranch `{phase_branch}` in `{}`. Commit each fix on \
         this branch.\n\n",
        repo_dir.display()
    ));
    prompt.push_str("## Findings\n\n");
    for (i, finding) in findings.iter().enumerate() {
        prompt.push_str(&format!(
            "{}. **{}** `{}`{}: {}\n",
            i + 1,
            finding.severity,
            finding.file,
            finding
                .line
                .map(|l| format!(":{l}"))
                .unwrap_or_default(),
            finding.description
        ));
        if let Some(fix) = &finding.fix {
            prompt.push_str(&format!("   Suggested fix: {fix}\n"));
        }
    }
    prompt.push('\n');

    let payload = format!(
        "{{\"runId\": \"{run_id}\", \"phaseNumber\": {phase_number}, \"issuesFixed\": {}}}",
        findings.len()
    );
    prompt.push_str(&completion_section(webhook_url, &payload));
    prompt
}

/// Build the prompt for a conflict-resolver agent.
pub fn build_resolver_prompt(
    role_instructions: &str,
    run_id: &str,
    phase_branch: &str,
    source_branch: &str,
    conflict_files: &[String],
    colliding_tasks: &[String],
    repo_dir: &Path,
    webhook_url: &str,
) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("# Resolve merge conflict in run {run_id}\n\n"));
    prompt.push_str("## Role\n\n");
    prompt.push_str(role_instructions);
    prompt.push_str("\n\n");
    prompt.push_str(&format!(
        "## Conflict\n\n\
         Merging `{source_branch}` into `{phase_branch}` in `{}` conflicts in:\n\n",
        repo_dir.display()
    ));
    for file in conflict_files {
        prompt.push_str(&format!("- `{file}`\n"));
    }
    prompt.push('\n');
    if !colliding_tasks.is_empty() {
        prompt.push_str("## Colliding work\n\n");
        for task in colliding_tasks {
            prompt.push_str(&format!("- {task}\n"));
        }
        prompt.push('\n');
    }
    prompt.push_str(&format!(
        "## Instructions\n\n\
         Check out `{phase_branch}`, merge `{source_branch}`, resolve every \
         conflict preserving the intent of both sides, and commit the merge on \
         `{phase_branch}`.\n\n"
    ));

    let payload =
        format!("{{\"runId\": \"{run_id}\", \"status\": \"completed\"}}");
    prompt.push_str(&completion_section(webhook_url, &payload));
    prompt
}

/// Build the prompt for the spec-writer agent that turns an interview into a
/// plan and an annotated progress document.
pub fn build_spec_prompt(
    role_instructions: &str,
    project: &str,
    project_dir: &Path,
    webhook_url: &str,
) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("# Write the implementation plan for {project}\n\n"));
    prompt.push_str("## Role\n\n");
    prompt.push_str(role_instructions);
    prompt.push_str("\n\n");
    prompt.push_str(&format!(
        "## Inputs and outputs\n\n\
         Read `{dir}/interview.json`. Produce:\n\n\
         - `{dir}/specs/IMPLEMENTATION_PLAN.md` — the plan\n\
         - `{dir}/progress.md` — a task checklist where every task line carries \
         `@id(...)`, optional `@depends(a,b)`, and `@role(...)` annotations, \
         grouped under `## Phase N:` headers\n\n",
        dir = project_dir.display()
    ));
    let payload = format!("{{\"project\": \"{project}\", \"summary\": \"...\"}}");
    prompt.push_str(&completion_section(webhook_url, &payload));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::TaskGraph;

    fn task(title: &str) -> Task {
        let doc = format!("- [ ] {title} @id(t1) @role(builder)\n");
        TaskGraph::parse(&doc).unwrap().get("t1").unwrap().clone()
    }

    #[test]
    fn worker_prompt_embeds_webhook_and_branch() {
        let prompt = build_worker_prompt(
            "Build it.",
            &task("Write parser"),
            "run-1",
            100_042,
            Path::new("/tmp/wt/run-1/w1"),
            "swarmops/run-1/w1",
            "http://127.0.0.1:7700/worker-complete",
            None,
        );
        assert!(prompt.contains("swarmops/run-1/w1"));
        assert!(prompt.contains("\"stepOrder\": 100042"));
        assert!(prompt.contains("/worker-complete"));
        assert!(prompt.contains("\"status\": \"failed\""));
    }

    #[test]
    fn web_visuals_augmenter_keys_on_builder_titles() {
        let augmenter = WebVisualsAugmenter::default();
        assert!(augmenter.augment("builder", &task("Build landing page")).is_some());
        assert!(augmenter.augment("builder", &task("Write parser")).is_none());
        // Only builders get the skill
        assert!(augmenter.augment("reviewer", &task("Review the UI")).is_none());
    }

    #[test]
    fn fixer_prompt_enumerates_findings() {
        let findings = vec![
            Finding {
                severity: "high".to_string(),
                file: "src/auth.rs".to_string(),
                line: Some(42),
                description: "token never expires".to_string(),
                fix: Some("add TTL check".to_string()),
            },
            Finding {
                severity: "low".to_string(),
                file: "src/lib.rs".to_string(),
                line: None,
                description: "dead code".to_string(),
                fix: None,
            },
        ];
        let prompt = build_fixer_prompt(
            "Fix things.",
            "run-1",
            2,
            "swarmops/run-1/phase-2",
            Path::new("/repo"),
            &findings,
            "http://127.0.0.1:7700/fix-complete",
        );
        assert!(prompt.contains("src/auth.rs"));
        assert!(prompt.contains(":42"));
        assert!(prompt.contains("add TTL check"));
        assert!(prompt.contains("\"issuesFixed\": 2"));
    }

    #[test]
    fn resolver_prompt_names_conflicts() {
        let prompt = build_resolver_prompt(
            "Resolve.",
            "run-1",
            "swarmops/run-1/phase-1",
            "swarmops/run-1/w2",
            &["shared.txt".to_string()],
            &["Write parser".to_string(), "Write tests".to_string()],
            Path::new("/repo"),
            "http://127.0.0.1:7700/worker-complete",
        );
        assert!(prompt.contains("shared.txt"));
        assert!(prompt.contains("Write parser"));
        assert!(prompt.contains("swarmops/run-1/w2"));
    }
}
