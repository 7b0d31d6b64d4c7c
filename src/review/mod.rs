//! Phase merging and the AI review chain.
//!
//! Once a phase's worker branches are collected, they merge one by one into
//! the phase branch ([`merge_branches`]); a conflict hands off to the
//! conflict resolver and pauses the loop. With everything merged, the review
//! chain runs strictly sequentially — reviewer N+1 is never spawned before
//! reviewer N approves — driven by the [`ReviewCycle`] state machine
//! persisted per (run, phase).

use crate::gitops::{MergeOutcome, WorktreeManager};
use crate::store;
use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// One reviewer finding, as posted by the review webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: String,
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix: Option<String>,
}

/// Reviewer verdict from the `/review-result` webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    Approved,
    RequestChanges,
}

/// One recorded review attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewAttempt {
    pub reviewer: String,
    pub verdict: ReviewVerdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<Finding>,
    pub at: DateTime<Utc>,
}

/// Lifecycle of one phase-merge review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewCycleStatus {
    /// Waiting on the current reviewer's verdict.
    Pending,
    /// A fixer is addressing findings.
    Fixing,
    /// Fixes landed; a re-review is due.
    PendingReview,
    /// Every reviewer in the chain approved.
    Approved,
    /// The phase branch is merged into base. Terminal.
    Merged,
    /// Automated budget exhausted. Terminal.
    Escalated,
    /// A reviewer requested changes without findings; humans only.
    NeedsClarification,
}

impl ReviewCycleStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Merged | Self::Escalated)
    }
}

/// What the orchestrator should do after feeding an event into the cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum ReviewAction {
    /// Spawn the reviewer at this chain index.
    SpawnReviewer(usize),
    /// All reviewers approved; merge the phase branch into base.
    MergeToBase,
    /// Spawn a fixer for these findings.
    SpawnFixer(Vec<Finding>),
    /// Human-only resolution; take no automated action.
    AwaitHuman,
    /// Create an escalation; the cycle is spent.
    Escalate,
}

/// `reviews/<run>-phase-<N>.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewCycle {
    pub run_id: String,
    pub phase_number: u32,
    pub status: ReviewCycleStatus,
    /// Index into the configured reviewer chain.
    pub reviewer_index: usize,
    pub fix_count: u32,
    pub max_fix_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_session_key: Option<String>,
    #[serde(default)]
    pub history: Vec<ReviewAttempt>,
}

impl ReviewCycle {
    pub fn new(run_id: &str, phase_number: u32, max_fix_attempts: u32) -> Self {
        Self {
            run_id: run_id.to_string(),
            phase_number,
            status: ReviewCycleStatus::Pending,
            reviewer_index: 0,
            fix_count: 0,
            max_fix_attempts,
            current_session_key: None,
            history: Vec::new(),
        }
    }

    /// Feed one reviewer verdict through the state machine.
    ///
    /// `chain` is the ordered reviewer role list; `reviewer_index` tracks the
    /// current position. Approval either advances to the next reviewer or,
    /// past the end of the chain, approves the cycle.
    pub fn on_review_result(
        &mut self,
        chain: &[String],
        verdict: ReviewVerdict,
        findings: Vec<Finding>,
        summary: Option<String>,
    ) -> Result<ReviewAction> {
        if self.status.is_terminal() {
            bail!(
                "review cycle for {} phase {} is already {:?}",
                self.run_id,
                self.phase_number,
                self.status
            );
        }
        let reviewer = chain
            .get(self.reviewer_index)
            .cloned()
            .unwrap_or_else(|| "reviewer".to_string());
        self.history.push(ReviewAttempt {
            reviewer,
            verdict,
            summary,
            findings: findings.clone(),
            at: Utc::now(),
        });

        match verdict {
            ReviewVerdict::Approved => {
                self.reviewer_index += 1;
                if self.reviewer_index >= chain.len() {
                    self.status = ReviewCycleStatus::Approved;
                    Ok(ReviewAction::MergeToBase)
                } else {
                    self.status = ReviewCycleStatus::Pending;
                    Ok(ReviewAction::SpawnReviewer(self.reviewer_index))
                }
            }
            ReviewVerdict::RequestChanges if findings.is_empty() => {
                // The reviewer's choice is respected, but without findings
                // there is nothing to hand a fixer.
                self.status = ReviewCycleStatus::NeedsClarification;
                Ok(ReviewAction::AwaitHuman)
            }
            ReviewVerdict::RequestChanges => {
                if self.fix_count < self.max_fix_attempts {
                    self.fix_count += 1;
                    self.status = ReviewCycleStatus::Fixing;
                    Ok(ReviewAction::SpawnFixer(findings))
                } else {
                    self.status = ReviewCycleStatus::Escalated;
                    Ok(ReviewAction::Escalate)
                }
            }
        }
    }

    /// The fixer reported back.
    pub fn on_fix_complete(&mut self, success: bool) -> Result<ReviewAction> {
        if self.status != ReviewCycleStatus::Fixing {
            bail!(
                "fix completion in status {:?} for {} phase {}",
                self.status,
                self.run_id,
                self.phase_number
            );
        }
        if success {
            self.status = ReviewCycleStatus::PendingReview;
            Ok(ReviewAction::SpawnReviewer(self.reviewer_index))
        } else if self.fix_count < self.max_fix_attempts {
            self.fix_count += 1;
            Ok(ReviewAction::SpawnFixer(Vec::new()))
        } else {
            self.status = ReviewCycleStatus::Escalated;
            Ok(ReviewAction::Escalate)
        }
    }

    /// A reviewer session was spawned; back to waiting on a verdict.
    pub fn mark_pending(&mut self, session_key: Option<String>) {
        self.status = ReviewCycleStatus::Pending;
        self.current_session_key = session_key;
    }

    pub fn mark_merged(&mut self) {
        self.status = ReviewCycleStatus::Merged;
        self.current_session_key = None;
    }
}

/// Persistence for review cycles.
pub struct ReviewStore {
    reviews_dir: PathBuf,
}

impl ReviewStore {
    pub fn new(reviews_dir: impl Into<PathBuf>) -> Self {
        Self {
            reviews_dir: reviews_dir.into(),
        }
    }

    fn path(&self, run_id: &str, phase: u32) -> PathBuf {
        self.reviews_dir.join(format!("{run_id}-phase-{phase}.json"))
    }

    pub fn load(&self, run_id: &str, phase: u32) -> Result<Option<ReviewCycle>> {
        store::read_json(&self.path(run_id, phase))
    }

    pub fn save(&self, cycle: &ReviewCycle) -> Result<()> {
        store::write_json_atomic(&self.path(&cycle.run_id, cycle.phase_number), cycle)
    }

    pub fn load_or_create(
        &self,
        run_id: &str,
        phase: u32,
        max_fix_attempts: u32,
    ) -> Result<ReviewCycle> {
        match self.load(run_id, phase)? {
            Some(cycle) => Ok(cycle),
            None => {
                let cycle = ReviewCycle::new(run_id, phase, max_fix_attempts);
                self.save(&cycle)?;
                Ok(cycle)
            }
        }
    }
}

/// Outcome of the branch merge loop.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeLoopOutcome {
    /// Every branch merged cleanly.
    Completed,
    /// A merge conflicted; the repository was restored and the loop paused.
    Conflicted {
        source_branch: String,
        conflict_files: Vec<String>,
        remaining_branches: Vec<String>,
    },
}

/// Merge collected worker branches into the phase branch in order.
///
/// On a conflict the worktree manager has already aborted and restored the
/// repository; the caller hands the returned context to the conflict
/// resolver and resumes later with `remaining_branches`.
pub async fn merge_branches(
    worktrees: &WorktreeManager,
    repo_dir: &Path,
    phase_branch: &str,
    branches: &[String],
) -> Result<MergeLoopOutcome> {
    for (idx, branch) in branches.iter().enumerate() {
        let message = format!("Merge {branch} into {phase_branch}");
        let outcome = worktrees
            .merge_branch(repo_dir, phase_branch, branch, &message)
            .await?;
        if outcome.conflicted {
            info!(branch, files = ?outcome.conflict_files, "merge conflict, pausing loop");
            return Ok(MergeLoopOutcome::Conflicted {
                source_branch: branch.clone(),
                conflict_files: outcome.conflict_files,
                remaining_branches: branches[idx + 1..].to_vec(),
            });
        }
    }
    Ok(MergeLoopOutcome::Completed)
}

/// The final merge of an approved phase branch into the base branch.
pub async fn merge_phase_into_base(
    worktrees: &WorktreeManager,
    repo_dir: &Path,
    base_branch: &str,
    phase_branch: &str,
    phase_number: u32,
    run_id: &str,
) -> Result<MergeOutcome> {
    let message = format!("Merge phase {phase_number} (run: {run_id}) - Approved by AI review");
    Ok(worktrees
        .merge_branch(repo_dir, base_branch, phase_branch, &message)
        .await?)
}
