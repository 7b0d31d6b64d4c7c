//! Per-project files living next to the project workspace:
//! `state.json` (phase/status/history), `activity.jsonl` (event feed),
//! `interview.json` (read-only here, written by the interview surface).

use crate::store;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Lifecycle phase of a project, advanced by the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProjectPhase {
    #[default]
    Interview,
    Spec,
    Build,
    Review,
    Complete,
}

impl ProjectPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interview => "interview",
            Self::Spec => "spec",
            Self::Build => "build",
            Self::Review => "review",
            Self::Complete => "complete",
        }
    }

    pub fn next(&self) -> Option<ProjectPhase> {
        match self {
            Self::Interview => Some(Self::Spec),
            Self::Spec => Some(Self::Build),
            Self::Build => Some(Self::Review),
            Self::Review => Some(Self::Complete),
            Self::Complete => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub phase: ProjectPhase,
    pub note: String,
}

/// `<project>/state.json`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProjectState {
    pub phase: ProjectPhase,
    pub status: String,
    pub iteration: u32,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// `<project>/interview.json` — only the completion flag matters here.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Interview {
    #[serde(default)]
    pub complete: bool,
}

/// One line of `<project>/activity.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub at: DateTime<Utc>,
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

pub fn state_path(project_dir: &Path) -> PathBuf {
    project_dir.join("state.json")
}

pub fn progress_path(project_dir: &Path) -> PathBuf {
    project_dir.join("progress.md")
}

pub fn activity_path(project_dir: &Path) -> PathBuf {
    project_dir.join("activity.jsonl")
}

pub fn interview_path(project_dir: &Path) -> PathBuf {
    project_dir.join("interview.json")
}

pub fn plan_path(project_dir: &Path) -> PathBuf {
    project_dir.join("specs/IMPLEMENTATION_PLAN.md")
}

pub fn load_state(project_dir: &Path) -> Result<ProjectState> {
    Ok(store::read_json(&state_path(project_dir))?.unwrap_or_default())
}

pub fn save_state(project_dir: &Path, state: &ProjectState) -> Result<()> {
    store::write_json_atomic(&state_path(project_dir), state)
}

pub fn load_interview(project_dir: &Path) -> Result<Interview> {
    Ok(store::read_json(&interview_path(project_dir))?.unwrap_or_default())
}

/// Advance the project phase, recording the transition in the history.
pub fn advance_phase(project_dir: &Path, to: ProjectPhase, note: &str) -> Result<ProjectState> {
    let mut state = load_state(project_dir)?;
    state.phase = to;
    state.status = if to == ProjectPhase::Complete {
        "complete".to_string()
    } else {
        "running".to_string()
    };
    state.history.push(HistoryEntry {
        at: Utc::now(),
        phase: to,
        note: note.to_string(),
    });
    save_state(project_dir, &state)?;
    Ok(state)
}

/// Mark the project errored, preserving its phase for inspection.
pub fn mark_error(project_dir: &Path, note: &str) -> Result<()> {
    let mut state = load_state(project_dir)?;
    state.status = "error".to_string();
    state.history.push(HistoryEntry {
        at: Utc::now(),
        phase: state.phase,
        note: note.to_string(),
    });
    save_state(project_dir, &state)
}

/// Append one event to the project feed.
pub fn log_event(project_dir: &Path, kind: &str, data: serde_json::Value) -> Result<()> {
    store::append_jsonl(
        &activity_path(project_dir),
        &ActivityEvent {
            at: Utc::now(),
            kind: kind.to_string(),
            data,
        },
    )
}

/// Read the whole feed (diagnostics and tests).
pub fn read_events(project_dir: &Path) -> Result<Vec<ActivityEvent>> {
    let mut events = Vec::new();
    store::read_jsonl_fold(&activity_path(project_dir), |e: ActivityEvent| {
        events.push(e);
    })?;
    Ok(events)
}
