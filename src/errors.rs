//! Typed error hierarchy for the SwarmOps orchestrator.
//!
//! Four top-level enums cover the subsystems:
//! - `ParseError` — progress-document parsing failures (never retried)
//! - `WorkError` — ledger and registry state-machine violations
//! - `GatewayError` — session-gateway transport failures (feed the retry controller)
//! - `GitError` — worktree and merge failures

use std::path::PathBuf;
use thiserror::Error;

/// Errors from parsing the progress document into a task graph.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Dependency cycle involving task '{task_id}'")]
    Cycle { task_id: String },

    #[error("Task '{task_id}' depends on unknown task '{dependency}'")]
    UnknownDependency { task_id: String, dependency: String },

    #[error("Duplicate task id '{task_id}' at line {line}")]
    DuplicateId { task_id: String, line: usize },

    #[error("Failed to read progress document at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the work ledger and task registry state machines.
#[derive(Debug, Error)]
pub enum WorkError {
    #[error("Invalid status transition {from} -> {to} for work item {work_id}")]
    InvalidTransition {
        work_id: String,
        from: String,
        to: String,
    },

    #[error("Work item {0} not found")]
    NotFound(String),

    #[error("Escalation {0} not found")]
    EscalationNotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the session gateway client.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Gateway refused spawn: {0}")]
    SpawnRefused(String),

    #[error("Gateway request failed: {0}")]
    Transport(String),

    #[error("Gateway returned malformed response: {0}")]
    BadResponse(String),
}

impl GatewayError {
    /// Transport failures are transient and worth retrying; refusals are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Errors from git worktree and merge operations.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("git {args} failed in {dir}: {stderr}")]
    CommandFailed {
        args: String,
        dir: String,
        stderr: String,
    },

    #[error("Failed to spawn git: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Branch '{0}' not found")]
    BranchNotFound(String),

    #[error(transparent)]
    Repository(#[from] git2::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_cycle_names_the_task() {
        let err = ParseError::Cycle {
            task_id: "auth".to_string(),
        };
        assert!(err.to_string().contains("auth"));
    }

    #[test]
    fn parse_error_duplicate_id_carries_line() {
        let err = ParseError::DuplicateId {
            task_id: "p".to_string(),
            line: 7,
        };
        match &err {
            ParseError::DuplicateId { task_id, line } => {
                assert_eq!(task_id, "p");
                assert_eq!(*line, 7);
            }
            _ => panic!("Expected DuplicateId"),
        }
    }

    #[test]
    fn work_error_invalid_transition_is_matchable() {
        let err = WorkError::InvalidTransition {
            work_id: "w1".to_string(),
            from: "complete".to_string(),
            to: "pending".to_string(),
        };
        assert!(matches!(err, WorkError::InvalidTransition { .. }));
        assert!(err.to_string().contains("complete -> pending"));
    }

    #[test]
    fn gateway_error_transience() {
        assert!(GatewayError::Transport("connection reset".into()).is_transient());
        assert!(!GatewayError::SpawnRefused("quota".into()).is_transient());
        assert!(!GatewayError::BadResponse("not json".into()).is_transient());
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ParseError::Cycle {
            task_id: "x".into(),
        });
        assert_std_error(&WorkError::NotFound("w".into()));
        assert_std_error(&GatewayError::Transport("x".into()));
        assert_std_error(&GitError::BranchNotFound("b".into()));
    }
}
