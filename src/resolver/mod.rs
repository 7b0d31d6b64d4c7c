//! Conflict-resolver contexts.
//!
//! When a worker branch conflicts with the phase branch, the merge loop
//! pauses and a resolver agent takes over. The context records which branch
//! collided, which files conflicted, and which branches still wait — enough
//! for the resolver's completion webhook to resume the loop, keyed by run.

use crate::store;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolverStatus {
    Active,
    Completed,
    Failed,
}

/// `conflict-resolvers/<run_id>-<short_id>.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverContext {
    pub id: String,
    pub run_id: String,
    pub phase_number: u32,
    pub phase_branch: String,
    pub source_branch: String,
    pub conflict_files: Vec<String>,
    pub remaining_branches: Vec<String>,
    pub repo_dir: PathBuf,
    pub status: ResolverStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Parameters for [`ResolverStore::create`].
#[derive(Debug, Clone)]
pub struct NewResolver {
    pub run_id: String,
    pub phase_number: u32,
    pub phase_branch: String,
    pub source_branch: String,
    pub conflict_files: Vec<String>,
    pub remaining_branches: Vec<String>,
    pub repo_dir: PathBuf,
}

pub struct ResolverStore {
    dir: PathBuf,
}

impl ResolverStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, run_id: &str, id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}-{id}.json"))
    }

    pub fn create(&self, params: NewResolver) -> Result<ResolverContext> {
        let id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let ctx = ResolverContext {
            id: id.clone(),
            run_id: params.run_id,
            phase_number: params.phase_number,
            phase_branch: params.phase_branch,
            source_branch: params.source_branch,
            conflict_files: params.conflict_files,
            remaining_branches: params.remaining_branches,
            repo_dir: params.repo_dir,
            status: ResolverStatus::Active,
            session_key: None,
            created_at: Utc::now(),
        };
        store::write_json_atomic(&self.path(&ctx.run_id, &id), &ctx)?;
        Ok(ctx)
    }

    pub fn save(&self, ctx: &ResolverContext) -> Result<()> {
        store::write_json_atomic(&self.path(&ctx.run_id, &ctx.id), ctx)
    }

    /// All contexts for a run, newest first.
    pub fn by_run(&self, run_id: &str) -> Result<Vec<ResolverContext>> {
        let mut contexts = Vec::new();
        if !self.dir.exists() {
            return Ok(contexts);
        }
        let prefix = format!("{run_id}-");
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with(&prefix)
                && name.ends_with(".json")
                && let Some(ctx) = store::read_json::<ResolverContext>(&path)?
            {
                contexts.push(ctx);
            }
        }
        contexts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(contexts)
    }

    /// The active context a resolver webhook should resume. Even when several
    /// resolvers were spawned over a run's lifetime, only one is active at a
    /// time (the merge loop is paused while it works).
    pub fn active_for_run(&self, run_id: &str) -> Result<Option<ResolverContext>> {
        Ok(self
            .by_run(run_id)?
            .into_iter()
            .find(|c| c.status == ResolverStatus::Active))
    }

    pub fn mark_completed(&self, ctx: &mut ResolverContext) -> Result<()> {
        ctx.status = ResolverStatus::Completed;
        self.save(ctx)
    }

    pub fn mark_failed(&self, ctx: &mut ResolverContext) -> Result<()> {
        ctx.status = ResolverStatus::Failed;
        self.save(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_resolver(run: &str, source: &str) -> NewResolver {
        NewResolver {
            run_id: run.to_string(),
            phase_number: 1,
            phase_branch: format!("swarmops/{run}/phase-1"),
            source_branch: source.to_string(),
            conflict_files: vec!["shared.txt".to_string()],
            remaining_branches: vec![format!("swarmops/{run}/w3")],
            repo_dir: PathBuf::from("/repo"),
        }
    }

    #[test]
    fn create_and_lookup_by_run() {
        let dir = tempdir().unwrap();
        let resolvers = ResolverStore::new(dir.path());
        let ctx = resolvers
            .create(new_resolver("run-1", "swarmops/run-1/w2"))
            .unwrap();
        assert_eq!(ctx.status, ResolverStatus::Active);

        let active = resolvers.active_for_run("run-1").unwrap().unwrap();
        assert_eq!(active.id, ctx.id);
        assert_eq!(active.conflict_files, vec!["shared.txt"]);
        assert!(resolvers.active_for_run("run-2").unwrap().is_none());
    }

    #[test]
    fn completed_contexts_are_not_active() {
        let dir = tempdir().unwrap();
        let resolvers = ResolverStore::new(dir.path());
        let mut first = resolvers
            .create(new_resolver("run-1", "swarmops/run-1/w2"))
            .unwrap();
        resolvers.mark_completed(&mut first).unwrap();

        assert!(resolvers.active_for_run("run-1").unwrap().is_none());

        // A later conflict in the same run creates a fresh active context
        let second = resolvers
            .create(new_resolver("run-1", "swarmops/run-1/w3"))
            .unwrap();
        let active = resolvers.active_for_run("run-1").unwrap().unwrap();
        assert_eq!(active.id, second.id);
        assert_eq!(resolvers.by_run("run-1").unwrap().len(), 2);
    }

    #[test]
    fn failed_context_persists_status() {
        let dir = tempdir().unwrap();
        let resolvers = ResolverStore::new(dir.path());
        let mut ctx = resolvers
            .create(new_resolver("run-1", "swarmops/run-1/w2"))
            .unwrap();
        resolvers.mark_failed(&mut ctx).unwrap();
        let loaded = resolvers.by_run("run-1").unwrap();
        assert_eq!(loaded[0].status, ResolverStatus::Failed);
    }
}
