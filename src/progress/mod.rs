//! Progress-document parsing and task-graph derivation.
//!
//! The progress document is a markdown checklist. Tasks are `- [ ]` (open)
//! or `- [x]` (done) lines carrying inline annotations:
//!
//! ```text
//! ## Phase 1: Core
//! - [ ] Write parser @id(p) @role(builder)
//! - [ ] Write tests @id(t) @depends(p) @role(builder)
//! ```
//!
//! `## Phase N:` / `### Phase N:` headers group tasks into phases; without
//! any header the whole list is phase 1. Parsing never mutates the document;
//! [`mark_task_done`] is the single write path and rewrites atomically.

use crate::errors::ParseError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;

static TASK_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*-\s*\[( |x|X)\]\s*(.+)$").unwrap());

static PHASE_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#{2,3}\s*Phase\s+(\d+)\s*:?\s*(.*)$").unwrap());

static ID_ANNOTATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@id\(([^)]+)\)").unwrap());

static DEPENDS_ANNOTATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@depends\(([^)]*)\)").unwrap());

static ROLE_ANNOTATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@role\(([^)]+)\)").unwrap());

static ANY_ANNOTATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@(?:id|depends|role)\([^)]*\)").unwrap());

/// One annotated task from the progress document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub done: bool,
    pub role: Option<String>,
    pub depends_on: Vec<String>,
    /// 1-based phase number the task belongs to.
    pub phase: u32,
    /// 1-based source line, for error reporting.
    pub line: usize,
}

/// An ordered group of tasks under one `Phase N:` header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub number: u32,
    pub name: String,
    pub task_ids: Vec<String>,
}

/// Derived progress of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseProgress {
    /// All member tasks are done.
    Completed,
    /// This is the earliest incomplete phase and it has at least one ready task.
    Running,
    /// Incomplete with nothing currently ready (or a later phase).
    Blocked,
}

/// The parsed task DAG plus its phase grouping.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    tasks: BTreeMap<String, Task>,
    phases: Vec<PhaseSpec>,
}

impl TaskGraph {
    /// Parse a progress document.
    ///
    /// Checklist lines without an `@id` annotation are ignored; they are
    /// prose, not tasks. Fails on duplicate ids, unknown dependency ids, and
    /// dependency cycles.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let mut tasks: BTreeMap<String, Task> = BTreeMap::new();
        let mut phases: Vec<PhaseSpec> = Vec::new();
        let mut current_phase: Option<usize> = None;

        for (idx, raw) in text.lines().enumerate() {
            if let Some(cap) = PHASE_HEADER.captures(raw) {
                let number: u32 = cap[1].parse().unwrap_or(0);
                let name = cap[2].trim().to_string();
                phases.push(PhaseSpec {
                    number,
                    name,
                    task_ids: Vec::new(),
                });
                current_phase = Some(phases.len() - 1);
                continue;
            }

            let Some(cap) = TASK_LINE.captures(raw) else {
                continue;
            };
            let done = !cap[1].trim().is_empty();
            let body = cap[2].to_string();

            let Some(id_cap) = ID_ANNOTATION.captures(&body) else {
                continue;
            };
            let id = id_cap[1].trim().to_string();

            if tasks.contains_key(&id) {
                return Err(ParseError::DuplicateId {
                    task_id: id,
                    line: idx + 1,
                });
            }

            let depends_on: Vec<String> = DEPENDS_ANNOTATION
                .captures(&body)
                .map(|c| {
                    c[1].split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default();

            let role = ROLE_ANNOTATION
                .captures(&body)
                .map(|c| c[1].trim().to_string());

            let title = ANY_ANNOTATION.replace_all(&body, "").trim().to_string();

            // Degenerate document: no phase headers at all
            if phases.is_empty() {
                phases.push(PhaseSpec {
                    number: 1,
                    name: String::new(),
                    task_ids: Vec::new(),
                });
                current_phase = Some(0);
            }
            let phase_idx = current_phase.unwrap_or(phases.len() - 1);
            phases[phase_idx].task_ids.push(id.clone());
            let phase_number = phases[phase_idx].number;

            tasks.insert(
                id.clone(),
                Task {
                    id,
                    title,
                    done,
                    role,
                    depends_on,
                    phase: phase_number,
                    line: idx + 1,
                },
            );
        }

        // Drop headers that ended up with no annotated tasks
        phases.retain(|p| !p.task_ids.is_empty());

        let graph = Self { tasks, phases };
        graph.validate()?;
        Ok(graph)
    }

    /// Check referential integrity and acyclicity of the dependency graph.
    fn validate(&self) -> Result<(), ParseError> {
        for task in self.tasks.values() {
            for dep in &task.depends_on {
                if !self.tasks.contains_key(dep) {
                    return Err(ParseError::UnknownDependency {
                        task_id: task.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // Iterative DFS with a three-state color map
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }
        let mut color: HashMap<&str, Color> = self
            .tasks
            .keys()
            .map(|id| (id.as_str(), Color::White))
            .collect();

        for start in self.tasks.keys() {
            if color[start.as_str()] != Color::White {
                continue;
            }
            let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
            color.insert(start.as_str(), Color::Gray);
            while let Some((id, dep_idx)) = stack.pop() {
                let deps = &self.tasks[id].depends_on;
                if dep_idx < deps.len() {
                    stack.push((id, dep_idx + 1));
                    let dep = deps[dep_idx].as_str();
                    match color[dep] {
                        Color::Gray => {
                            return Err(ParseError::Cycle {
                                task_id: dep.to_string(),
                            });
                        }
                        Color::White => {
                            color.insert(dep, Color::Gray);
                            stack.push((dep, 0));
                        }
                        Color::Black => {}
                    }
                } else {
                    color.insert(id, Color::Black);
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn phases(&self) -> &[PhaseSpec] {
        &self.phases
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// A task is ready iff it is open and every dependency is done.
    pub fn is_ready(&self, id: &str) -> bool {
        self.is_ready_with(id, &HashSet::new())
    }

    /// Skip-aware readiness: a dependency is satisfied when its task is done
    /// OR when the caller knows it was skipped (retry budget spent, handed to
    /// a human). A skipped task itself is never ready.
    pub fn is_ready_with(&self, id: &str, skipped: &HashSet<String>) -> bool {
        let Some(task) = self.tasks.get(id) else {
            return false;
        };
        !task.done
            && !skipped.contains(id)
            && task.depends_on.iter().all(|dep| {
                self.tasks.get(dep).is_some_and(|d| d.done) || skipped.contains(dep)
            })
    }

    /// All ready tasks, document order.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        self.ready_tasks_with(&HashSet::new())
    }

    /// All ready tasks under a skip set, document order.
    pub fn ready_tasks_with(&self, skipped: &HashSet<String>) -> Vec<&Task> {
        let mut ready: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| self.is_ready_with(&t.id, skipped))
            .collect();
        ready.sort_by_key(|t| t.line);
        ready
    }

    /// Ready tasks restricted to one phase.
    pub fn ready_tasks_in_phase(&self, phase: u32) -> Vec<&Task> {
        self.ready_tasks_in_phase_with(phase, &HashSet::new())
    }

    /// Ready tasks restricted to one phase, under a skip set.
    pub fn ready_tasks_in_phase_with(
        &self,
        phase: u32,
        skipped: &HashSet<String>,
    ) -> Vec<&Task> {
        self.ready_tasks_with(skipped)
            .into_iter()
            .filter(|t| t.phase == phase)
            .collect()
    }

    pub fn all_done(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.values().all(|t| t.done)
    }

    /// Every task is settled: done, or skipped by the caller's set. This is
    /// the completion predicate for pipelines that used skip-and-continue.
    pub fn all_settled(&self, skipped: &HashSet<String>) -> bool {
        !self.tasks.is_empty()
            && self
                .tasks
                .values()
                .all(|t| t.done || skipped.contains(&t.id))
    }

    /// Every member of one phase is settled (done or skipped).
    pub fn phase_settled(&self, phase: u32, skipped: &HashSet<String>) -> bool {
        self.phases
            .iter()
            .find(|p| p.number == phase)
            .is_some_and(|p| {
                p.task_ids.iter().all(|id| {
                    self.tasks.get(id).is_some_and(|t| t.done) || skipped.contains(id)
                })
            })
    }

    /// Earliest phase with at least one open task.
    pub fn earliest_incomplete_phase(&self) -> Option<u32> {
        self.phases
            .iter()
            .find(|p| {
                p.task_ids
                    .iter()
                    .any(|id| self.tasks.get(id).is_some_and(|t| !t.done))
            })
            .map(|p| p.number)
    }

    /// Derived status of one phase.
    pub fn phase_progress(&self, phase: u32) -> PhaseProgress {
        let Some(spec) = self.phases.iter().find(|p| p.number == phase) else {
            return PhaseProgress::Blocked;
        };
        let all_done = spec
            .task_ids
            .iter()
            .all(|id| self.tasks.get(id).is_some_and(|t| t.done));
        if all_done {
            return PhaseProgress::Completed;
        }
        let earliest = self.earliest_incomplete_phase();
        if earliest == Some(phase)
            && spec.task_ids.iter().any(|id| self.is_ready(id))
        {
            PhaseProgress::Running
        } else {
            PhaseProgress::Blocked
        }
    }

    /// Ids whose open/done flags differ between `self` and a reparse — used
    /// by callers that cache the graph between webhooks.
    pub fn changed_since(&self, other: &TaskGraph) -> Vec<String> {
        let mut changed: HashSet<String> = HashSet::new();
        for task in self.tasks.values() {
            if other.get(&task.id).map(|t| t.done) != Some(task.done) {
                changed.insert(task.id.clone());
            }
        }
        let mut out: Vec<String> = changed.into_iter().collect();
        out.sort();
        out
    }
}

/// Parse the progress document at `path`.
pub fn parse_file(path: &Path) -> Result<TaskGraph, ParseError> {
    let text = std::fs::read_to_string(path).map_err(|source| ParseError::ReadFailed {
        path: path.to_path_buf(),
        source,
    })?;
    TaskGraph::parse(&text)
}

/// Flip the checkbox of the task annotated `@id(task_id)` to `[x]`, leaving
/// every other byte untouched. Atomic rewrite (tmp + rename). Returns false
/// when the task was not found or already done.
pub fn mark_task_done(path: &Path, task_id: &str) -> Result<bool, ParseError> {
    let text = std::fs::read_to_string(path).map_err(|source| ParseError::ReadFailed {
        path: path.to_path_buf(),
        source,
    })?;

    let needle = format!("@id({task_id})");
    let mut changed = false;
    let rewritten: Vec<String> = text
        .lines()
        .map(|line| {
            if !changed
                && line.contains(&needle)
                && let Some(cap) = TASK_LINE.captures(line)
                && cap[1].trim().is_empty()
            {
                changed = true;
                line.replacen("- [ ]", "- [x]", 1)
            } else {
                line.to_string()
            }
        })
        .collect();

    if !changed {
        return Ok(false);
    }

    let mut out = rewritten.join("\n");
    if text.ends_with('\n') {
        out.push('\n');
    }
    crate::store::write_atomic_bytes(path, out.as_bytes()).map_err(|e| {
        ParseError::ReadFailed {
            path: path.to_path_buf(),
            source: std::io::Error::other(e.to_string()),
        }
    })?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "\
# Project

## Phase 1: Core
- [ ] Write parser @id(p) @role(builder)
- [ ] Write tests @id(t) @depends(p) @role(builder)

## Phase 2: Review
- [ ] Review @id(r) @depends(t) @role(reviewer)
";

    #[test]
    fn parses_tasks_and_phases() {
        let graph = TaskGraph::parse(DOC).unwrap();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.phases().len(), 2);
        assert_eq!(graph.phases()[0].number, 1);
        assert_eq!(graph.phases()[0].name, "Core");
        assert_eq!(graph.phases()[0].task_ids, vec!["p", "t"]);

        let t = graph.get("t").unwrap();
        assert_eq!(t.title, "Write tests");
        assert_eq!(t.depends_on, vec!["p"]);
        assert_eq!(t.role.as_deref(), Some("builder"));
        assert_eq!(t.phase, 1);
    }

    #[test]
    fn document_without_headers_is_one_phase() {
        let graph = TaskGraph::parse("- [ ] A @id(a)\n- [x] B @id(b)\n").unwrap();
        assert_eq!(graph.phases().len(), 1);
        assert_eq!(graph.phases()[0].number, 1);
        assert!(graph.get("b").unwrap().done);
    }

    #[test]
    fn unannotated_checklist_lines_are_not_tasks() {
        let graph = TaskGraph::parse("- [ ] just prose\n- [ ] Real @id(x)\n").unwrap();
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn duplicate_id_rejected() {
        let err = TaskGraph::parse("- [ ] A @id(a)\n- [ ] B @id(a)\n").unwrap_err();
        assert!(matches!(err, ParseError::DuplicateId { .. }));
    }

    #[test]
    fn unknown_dependency_rejected() {
        let err = TaskGraph::parse("- [ ] A @id(a) @depends(ghost)\n").unwrap_err();
        match err {
            ParseError::UnknownDependency { task_id, dependency } => {
                assert_eq!(task_id, "a");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("Expected UnknownDependency, got {other:?}"),
        }
    }

    #[test]
    fn cycle_rejected() {
        let doc = "- [ ] A @id(a) @depends(b)\n- [ ] B @id(b) @depends(a)\n";
        let err = TaskGraph::parse(doc).unwrap_err();
        assert!(matches!(err, ParseError::Cycle { .. }));
    }

    #[test]
    fn self_cycle_rejected() {
        let err = TaskGraph::parse("- [ ] A @id(a) @depends(a)\n").unwrap_err();
        assert!(matches!(err, ParseError::Cycle { .. }));
    }

    #[test]
    fn readiness_follows_dependencies() {
        let graph = TaskGraph::parse(DOC).unwrap();
        assert!(graph.is_ready("p"));
        assert!(!graph.is_ready("t"));
        assert!(!graph.is_ready("r"));
        assert_eq!(graph.ready_tasks().len(), 1);
    }

    #[test]
    fn done_tasks_unlock_dependents() {
        let doc = "- [x] A @id(a)\n- [ ] B @id(b) @depends(a)\n";
        let graph = TaskGraph::parse(doc).unwrap();
        assert!(graph.is_ready("b"));
        assert!(!graph.is_ready("a"));
    }

    #[test]
    fn phase_progress_derivation() {
        let doc = "\
## Phase 1:
- [x] A @id(a)
## Phase 2:
- [ ] B @id(b) @depends(a)
## Phase 3:
- [ ] C @id(c) @depends(b)
";
        let graph = TaskGraph::parse(doc).unwrap();
        assert_eq!(graph.phase_progress(1), PhaseProgress::Completed);
        assert_eq!(graph.phase_progress(2), PhaseProgress::Running);
        assert_eq!(graph.phase_progress(3), PhaseProgress::Blocked);
        assert_eq!(graph.earliest_incomplete_phase(), Some(2));
    }

    #[test]
    fn all_done_requires_nonempty() {
        assert!(!TaskGraph::parse("").unwrap().all_done());
        assert!(TaskGraph::parse("- [x] A @id(a)\n").unwrap().all_done());
    }

    #[test]
    fn skipped_dependency_satisfies_dependents() {
        let doc = "\
- [x] A @id(a)
- [ ] B @id(b) @depends(a)
- [ ] C @id(c) @depends(b)
";
        let graph = TaskGraph::parse(doc).unwrap();
        assert!(!graph.is_ready("c"));

        let skipped: HashSet<String> = ["b".to_string()].into_iter().collect();
        // b was skipped: c unblocks, b itself never comes back
        assert!(graph.is_ready_with("c", &skipped));
        assert!(!graph.is_ready_with("b", &skipped));
        let ready: Vec<&str> = graph
            .ready_tasks_with(&skipped)
            .iter()
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(ready, vec!["c"]);
    }

    #[test]
    fn settled_counts_done_and_skipped() {
        let doc = "\
## Phase 1:
- [x] A @id(a)
- [ ] B @id(b) @depends(a)
## Phase 2:
- [ ] C @id(c) @depends(b)
";
        let graph = TaskGraph::parse(doc).unwrap();
        let skipped: HashSet<String> = ["b".to_string()].into_iter().collect();

        assert!(!graph.all_done());
        assert!(!graph.all_settled(&HashSet::new()));
        assert!(graph.phase_settled(1, &skipped));
        assert!(!graph.phase_settled(2, &skipped));
        assert!(!graph.all_settled(&skipped));

        let both: HashSet<String> = ["b".to_string(), "c".to_string()].into_iter().collect();
        assert!(graph.all_settled(&both));
        // Unknown phase is never settled
        assert!(!graph.phase_settled(9, &both));
    }

    #[test]
    fn empty_depends_annotation_is_no_deps() {
        let graph = TaskGraph::parse("- [ ] A @id(a) @depends()\n").unwrap();
        assert!(graph.get("a").unwrap().depends_on.is_empty());
        assert!(graph.is_ready("a"));
    }

    #[test]
    fn mark_task_done_rewrites_only_the_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.md");
        std::fs::write(&path, DOC).unwrap();

        assert!(mark_task_done(&path, "p").unwrap());
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("- [x] Write parser @id(p)"));
        assert!(text.contains("- [ ] Write tests @id(t)"));

        // Idempotent: already done
        assert!(!mark_task_done(&path, "p").unwrap());
        // Unknown id
        assert!(!mark_task_done(&path, "nope").unwrap());
    }

    #[test]
    fn changed_since_reports_flipped_ids() {
        let before = TaskGraph::parse(DOC).unwrap();
        let after =
            TaskGraph::parse(&DOC.replace("- [ ] Write parser", "- [x] Write parser")).unwrap();
        assert_eq!(after.changed_since(&before), vec!["p".to_string()]);
    }
}
