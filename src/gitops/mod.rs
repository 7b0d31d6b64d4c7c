//! Git worktree and branch plumbing for worker isolation.
//!
//! Each worker gets a dedicated branch (`swarmops/<run>/<worker>`) checked
//! out in its own worktree under the worktree root, so concurrent agents
//! never touch the same working directory. Mutating operations on the main
//! repository HEAD serialize on a per-repo mutex; commits inside worktrees
//! are the agents' own business.
//!
//! Write-path git goes through the injectable [`GitRunner`] (shelling out to
//! the `git` binary); read-side queries (branch existence, ahead counts) use
//! libgit2 directly.

use crate::errors::GitError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Branch name for one worker: `swarmops/<run_id>/<worker_id>`.
pub fn worker_branch(run_id: &str, worker_id: &str) -> String {
    format!("swarmops/{run_id}/{worker_id}")
}

/// Branch name for a phase merge target: `swarmops/<run_id>/phase-<N>`.
pub fn phase_branch(run_id: &str, phase_number: u32) -> String {
    format!("swarmops/{run_id}/phase-{phase_number}")
}

/// Captured output of one git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Abstraction over git CLI mutations so dispatch and merge flows can be
/// exercised with a mock in tests.
#[async_trait]
pub trait GitRunner: Send + Sync {
    async fn run(&self, dir: &Path, args: &[&str]) -> Result<GitOutput, GitError>;
}

/// Real runner shelling out to the `git` binary.
pub struct TokioGitRunner;

#[async_trait]
impl GitRunner for TokioGitRunner {
    async fn run(&self, dir: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
        let output = tokio::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .map_err(GitError::SpawnFailed)?;
        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// A created (or reused) worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeHandle {
    pub path: PathBuf,
    pub branch: String,
}

/// Outcome of merging one branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub success: bool,
    pub conflicted: bool,
    pub conflict_files: Vec<String>,
}

impl MergeOutcome {
    fn clean() -> Self {
        Self {
            success: true,
            conflicted: false,
            conflict_files: Vec::new(),
        }
    }
}

/// Worktree and branch manager. One instance serves every repo; locks are
/// per-repo.
pub struct WorktreeManager {
    worktree_root: PathBuf,
    runner: Box<dyn GitRunner>,
    repo_locks: std::sync::Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl WorktreeManager {
    pub fn new(worktree_root: impl Into<PathBuf>) -> Self {
        Self::with_runner(worktree_root, Box::new(TokioGitRunner))
    }

    pub fn with_runner(worktree_root: impl Into<PathBuf>, runner: Box<dyn GitRunner>) -> Self {
        Self {
            worktree_root: worktree_root.into(),
            runner,
            repo_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// `<worktree_root>/<run_id>/<worker_id>/`
    pub fn worktree_path(&self, run_id: &str, worker_id: &str) -> PathBuf {
        self.worktree_root.join(run_id).join(worker_id)
    }

    fn repo_lock(&self, repo_dir: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.repo_locks.lock().expect("repo lock table poisoned");
        locks
            .entry(repo_dir.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
        debug!(dir = %dir.display(), args = ?args, "git");
        self.runner.run(dir, args).await
    }

    async fn git_ok(&self, dir: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
        let out = self.git(dir, args).await?;
        if !out.success {
            return Err(GitError::CommandFailed {
                args: args.join(" "),
                dir: dir.display().to_string(),
                stderr: out.stderr,
            });
        }
        Ok(out)
    }

    /// Ensure a fresh worker branch off `base_branch` and a worktree for it.
    /// Idempotent: an existing worktree at the computed path is reused.
    pub async fn create_worktree(
        &self,
        repo_dir: &Path,
        run_id: &str,
        worker_id: &str,
        base_branch: &str,
    ) -> Result<WorktreeHandle, GitError> {
        let lock = self.repo_lock(repo_dir);
        let _guard = lock.lock().await;

        let path = self.worktree_path(run_id, worker_id);
        let branch = worker_branch(run_id, worker_id);

        if path.exists() {
            debug!(path = %path.display(), "reusing existing worktree");
            return Ok(WorktreeHandle { path, branch });
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(GitError::SpawnFailed)?;
        }

        let path_str = path.to_string_lossy().to_string();
        if self.branch_exists(repo_dir, &branch)? {
            self.git_ok(repo_dir, &["worktree", "add", &path_str, &branch])
                .await?;
        } else {
            self.git_ok(
                repo_dir,
                &["worktree", "add", "-b", &branch, &path_str, base_branch],
            )
            .await?;
        }
        Ok(WorktreeHandle { path, branch })
    }

    /// Prune the worktree and force-delete its branch.
    pub async fn remove_worktree(
        &self,
        repo_dir: &Path,
        path: &Path,
        branch: &str,
    ) -> Result<(), GitError> {
        let lock = self.repo_lock(repo_dir);
        let _guard = lock.lock().await;

        let path_str = path.to_string_lossy().to_string();
        if let Err(e) = self
            .git_ok(repo_dir, &["worktree", "remove", "--force", &path_str])
            .await
        {
            warn!(path = %path.display(), error = %e, "worktree remove failed");
        }
        if let Err(e) = self.git_ok(repo_dir, &["branch", "-D", branch]).await {
            warn!(branch, error = %e, "branch delete failed");
        }
        let _ = self.git(repo_dir, &["worktree", "prune"]).await;
        Ok(())
    }

    /// Does a local branch exist? (libgit2 read path.)
    pub fn branch_exists(&self, repo_dir: &Path, branch: &str) -> Result<bool, GitError> {
        let repo = git2::Repository::open(repo_dir)?;
        Ok(repo.find_branch(branch, git2::BranchType::Local).is_ok())
    }

    /// Current HEAD branch shorthand.
    pub fn current_branch(&self, repo_dir: &Path) -> Result<String, GitError> {
        let repo = git2::Repository::open(repo_dir)?;
        let head = repo.head()?;
        Ok(head.shorthand().unwrap_or("HEAD").to_string())
    }

    /// Number of commits on `branch` not reachable from `base`.
    pub fn commits_ahead(
        &self,
        repo_dir: &Path,
        base: &str,
        branch: &str,
    ) -> Result<usize, GitError> {
        let repo = git2::Repository::open(repo_dir)?;
        let branch_ref = repo
            .find_branch(branch, git2::BranchType::Local)
            .map_err(|_| GitError::BranchNotFound(branch.to_string()))?;
        let base_ref = repo
            .find_branch(base, git2::BranchType::Local)
            .map_err(|_| GitError::BranchNotFound(base.to_string()))?;

        let mut walk = repo.revwalk()?;
        walk.push(branch_ref.get().peel_to_commit()?.id())?;
        walk.hide(base_ref.get().peel_to_commit()?.id())?;
        Ok(walk.count())
    }

    pub async fn checkout_branch(&self, repo_dir: &Path, branch: &str) -> Result<(), GitError> {
        let lock = self.repo_lock(repo_dir);
        let _guard = lock.lock().await;
        self.git_ok(repo_dir, &["checkout", branch]).await?;
        Ok(())
    }

    /// Create (or reset) `name` to point at `from`.
    pub async fn create_branch(
        &self,
        repo_dir: &Path,
        name: &str,
        from: &str,
    ) -> Result<(), GitError> {
        let lock = self.repo_lock(repo_dir);
        let _guard = lock.lock().await;
        self.git_ok(repo_dir, &["branch", "-f", name, from]).await?;
        Ok(())
    }

    pub async fn delete_branch(&self, repo_dir: &Path, name: &str) -> Result<(), GitError> {
        let lock = self.repo_lock(repo_dir);
        let _guard = lock.lock().await;
        self.git_ok(repo_dir, &["branch", "-D", name]).await?;
        Ok(())
    }

    /// Merge `source` into `target` with `message`.
    ///
    /// The whole sequence holds the repo lock: record the original HEAD,
    /// checkout `target`, merge. On conflict the conflicting paths are
    /// collected, the merge is aborted, and HEAD is restored to the original
    /// branch, leaving the repository exactly as found.
    pub async fn merge_branch(
        &self,
        repo_dir: &Path,
        target: &str,
        source: &str,
        message: &str,
    ) -> Result<MergeOutcome, GitError> {
        let lock = self.repo_lock(repo_dir);
        let _guard = lock.lock().await;

        let original = self.current_branch(repo_dir)?;
        self.git_ok(repo_dir, &["checkout", target]).await?;

        let merge = self
            .git(
                repo_dir,
                &["merge", source, "--no-ff", "-m", message],
            )
            .await?;
        if merge.success {
            return Ok(MergeOutcome::clean());
        }

        let conflict_files: Vec<String> = self
            .git(repo_dir, &["diff", "--name-only", "--diff-filter=U"])
            .await
            .map(|out| {
                out.stdout
                    .lines()
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        if let Err(e) = self.git_ok(repo_dir, &["merge", "--abort"]).await {
            warn!(error = %e, "merge --abort failed");
        }
        if original != target
            && let Err(e) = self.git_ok(repo_dir, &["checkout", &original]).await
        {
            warn!(branch = %original, error = %e, "failed to restore original branch");
        }

        Ok(MergeOutcome {
            success: false,
            conflicted: true,
            conflict_files,
        })
    }

    /// Worktrees created under a run, as (worker_id, path) pairs.
    pub fn list_run_worktrees(&self, run_id: &str) -> Vec<(String, PathBuf)> {
        let run_dir = self.worktree_root.join(run_id);
        let Ok(entries) = std::fs::read_dir(&run_dir) else {
            return Vec::new();
        };
        let mut out: Vec<(String, PathBuf)> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .map(|e| (e.file_name().to_string_lossy().to_string(), e.path()))
            .collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Repository;
    use std::fs;
    use tempfile::tempdir;

    fn init_repo(dir: &Path) -> String {
        let repo = Repository::init(dir).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        drop(config);
        commit_file(dir, "README.md", "hello\n", "init");
        let head = repo.head().unwrap();
        head.shorthand().unwrap().to_string()
    }

    fn commit_file(dir: &Path, name: &str, content: &str, msg: &str) {
        let repo = Repository::open(dir).unwrap();
        fs::write(dir.join(name), content).unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = git2::Signature::now("test", "test@test.com").unwrap();
        if let Ok(head) = repo.head() {
            let parent = head.peel_to_commit().unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[&parent])
                .unwrap();
        } else {
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[])
                .unwrap();
        }
    }

    #[test]
    fn branch_names_are_bit_exact() {
        assert_eq!(worker_branch("run-1", "w-a"), "swarmops/run-1/w-a");
        assert_eq!(phase_branch("run-1", 3), "swarmops/run-1/phase-3");
    }

    #[tokio::test]
    async fn create_worktree_is_idempotent() {
        let repo_dir = tempdir().unwrap();
        let wt_root = tempdir().unwrap();
        let base = init_repo(repo_dir.path());
        let mgr = WorktreeManager::new(wt_root.path());

        let first = mgr
            .create_worktree(repo_dir.path(), "run-1", "w1", &base)
            .await
            .unwrap();
        assert_eq!(first.branch, "swarmops/run-1/w1");
        assert!(first.path.join("README.md").exists());

        let second = mgr
            .create_worktree(repo_dir.path(), "run-1", "w1", &base)
            .await
            .unwrap();
        assert_eq!(first, second);

        assert!(mgr.branch_exists(repo_dir.path(), &first.branch).unwrap());
        let listed = mgr.list_run_worktrees("run-1");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, "w1");
    }

    #[tokio::test]
    async fn remove_worktree_prunes_branch_and_path() {
        let repo_dir = tempdir().unwrap();
        let wt_root = tempdir().unwrap();
        let base = init_repo(repo_dir.path());
        let mgr = WorktreeManager::new(wt_root.path());

        let handle = mgr
            .create_worktree(repo_dir.path(), "run-1", "w1", &base)
            .await
            .unwrap();
        mgr.remove_worktree(repo_dir.path(), &handle.path, &handle.branch)
            .await
            .unwrap();
        assert!(!handle.path.exists());
        assert!(!mgr.branch_exists(repo_dir.path(), &handle.branch).unwrap());
    }

    #[tokio::test]
    async fn commits_ahead_counts_worktree_commits() {
        let repo_dir = tempdir().unwrap();
        let wt_root = tempdir().unwrap();
        let base = init_repo(repo_dir.path());
        let mgr = WorktreeManager::new(wt_root.path());

        let handle = mgr
            .create_worktree(repo_dir.path(), "run-1", "w1", &base)
            .await
            .unwrap();
        assert_eq!(
            mgr.commits_ahead(repo_dir.path(), &base, &handle.branch)
                .unwrap(),
            0
        );

        commit_file(&handle.path, "feature.rs", "fn f() {}\n", "add feature");
        assert_eq!(
            mgr.commits_ahead(repo_dir.path(), &base, &handle.branch)
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn clean_merge_lands_on_target() {
        let repo_dir = tempdir().unwrap();
        let wt_root = tempdir().unwrap();
        let base = init_repo(repo_dir.path());
        let mgr = WorktreeManager::new(wt_root.path());

        let handle = mgr
            .create_worktree(repo_dir.path(), "run-1", "w1", &base)
            .await
            .unwrap();
        commit_file(&handle.path, "a.rs", "a\n", "worker a");

        mgr.create_branch(repo_dir.path(), "swarmops/run-1/phase-1", &base)
            .await
            .unwrap();
        let outcome = mgr
            .merge_branch(
                repo_dir.path(),
                "swarmops/run-1/phase-1",
                &handle.branch,
                "Merge worker w1",
            )
            .await
            .unwrap();
        assert!(outcome.success);
        assert!(!outcome.conflicted);
        assert_eq!(
            mgr.commits_ahead(repo_dir.path(), &base, "swarmops/run-1/phase-1")
                .unwrap(),
            2 // worker commit + merge commit
        );
    }

    #[tokio::test]
    async fn conflicting_merge_aborts_and_restores_head() {
        let repo_dir = tempdir().unwrap();
        let wt_root = tempdir().unwrap();
        let base = init_repo(repo_dir.path());
        let mgr = WorktreeManager::new(wt_root.path());

        // Two workers editing the same file
        let w1 = mgr
            .create_worktree(repo_dir.path(), "run-1", "w1", &base)
            .await
            .unwrap();
        commit_file(&w1.path, "shared.txt", "from w1\n", "w1 edit");
        let w2 = mgr
            .create_worktree(repo_dir.path(), "run-1", "w2", &base)
            .await
            .unwrap();
        commit_file(&w2.path, "shared.txt", "from w2\n", "w2 edit");

        let phase = "swarmops/run-1/phase-1";
        mgr.create_branch(repo_dir.path(), phase, &base).await.unwrap();

        let first = mgr
            .merge_branch(repo_dir.path(), phase, &w1.branch, "Merge w1")
            .await
            .unwrap();
        assert!(first.success);

        let pre_conflict_head = {
            let repo = Repository::open(repo_dir.path()).unwrap();
            repo.revparse_single(phase).unwrap().id()
        };

        let second = mgr
            .merge_branch(repo_dir.path(), phase, &w2.branch, "Merge w2")
            .await
            .unwrap();
        assert!(!second.success);
        assert!(second.conflicted);
        assert_eq!(second.conflict_files, vec!["shared.txt".to_string()]);

        // Phase branch unchanged, no merge in progress
        let repo = Repository::open(repo_dir.path()).unwrap();
        assert_eq!(repo.revparse_single(phase).unwrap().id(), pre_conflict_head);
        assert_eq!(repo.state(), git2::RepositoryState::Clean);
    }
}
