//! Append-only work ledger, sharded one JSONL file per UTC date.
//!
//! Every mutation appends a [`LedgerRecord`] first and folds it into the
//! in-memory cache second, so replaying the shards in order reconstructs the
//! cache exactly. The cache is authoritative between loads; a restart
//! rebuilds it by folding.

use crate::errors::WorkError;
use crate::store;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Lifecycle status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    #[default]
    Pending,
    Running,
    Complete,
    Failed,
    Cancelled,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }

    /// Guard for the work-state machine: `pending -> running`,
    /// `running -> {complete, failed, cancelled}`, and the administrative
    /// `pending -> cancelled`.
    pub fn can_transition_to(&self, next: WorkStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Complete)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
                | (Self::Pending, Self::Cancelled)
        )
    }
}

/// A timestamped free-form event attached to a work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkEvent {
    pub at: DateTime<Utc>,
    pub event: String,
}

/// One unit of tracked work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub title: String,
    pub work_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub status: WorkStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub iterations: u32,
    #[serde(default)]
    pub events: Vec<WorkEvent>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Input for [`Ledger::create`].
#[derive(Debug, Clone, Default)]
pub struct WorkInput {
    pub title: String,
    pub work_type: String,
    pub role_id: Option<String>,
    pub parent_id: Option<String>,
    pub tags: Vec<String>,
}

/// Partial mutation carried by an `update` record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add_tags: Vec<String>,
}

/// The four append-record variants. The `type` discriminant makes the
/// serialization round-trip unambiguous.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerRecord {
    Create {
        item: WorkItem,
    },
    Event {
        work_id: String,
        event: String,
        at: DateTime<Utc>,
    },
    Status {
        work_id: String,
        status: WorkStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        at: DateTime<Utc>,
    },
    Update {
        work_id: String,
        patch: WorkPatch,
    },
}

/// Filters for [`Ledger::list`].
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub date: Option<NaiveDate>,
    pub status: Option<WorkStatus>,
    pub work_type: Option<String>,
    pub role_id: Option<String>,
    pub parent_id: Option<String>,
    pub tag: Option<String>,
    pub offset: usize,
    pub limit: Option<usize>,
}

/// The sharded ledger. Not internally synchronized; callers hold it behind
/// the orchestrator's mutex.
pub struct Ledger {
    dir: PathBuf,
    cache: HashMap<String, WorkItem>,
    loaded_dates: HashSet<NaiveDate>,
    all_loaded: bool,
}

impl Ledger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: HashMap::new(),
            loaded_dates: HashSet::new(),
            all_loaded: false,
        }
    }

    fn shard_path(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.jsonl", date.format("%Y-%m-%d")))
    }

    /// Fold one shard into the cache, once.
    fn load_date(&mut self, date: NaiveDate) -> Result<()> {
        if self.loaded_dates.contains(&date) {
            return Ok(());
        }
        let path = self.shard_path(date);
        let mut records: Vec<LedgerRecord> = Vec::new();
        store::read_jsonl_fold(&path, |r: LedgerRecord| records.push(r))?;
        for record in records {
            Self::fold(&mut self.cache, record);
        }
        self.loaded_dates.insert(date);
        Ok(())
    }

    /// Load every shard present on disk. Shard file names are the dates.
    fn load_all(&mut self) -> Result<()> {
        if self.all_loaded {
            return Ok(());
        }
        if self.dir.exists() {
            let mut dates: Vec<NaiveDate> = std::fs::read_dir(&self.dir)
                .with_context(|| format!("Failed to list {}", self.dir.display()))?
                .filter_map(|e| e.ok())
                .filter_map(|e| {
                    let name = e.file_name().to_string_lossy().to_string();
                    name.strip_suffix(".jsonl")
                        .and_then(|stem| NaiveDate::parse_from_str(stem, "%Y-%m-%d").ok())
                })
                .collect();
            dates.sort();
            for date in dates {
                self.load_date(date)?;
            }
        }
        self.all_loaded = true;
        Ok(())
    }

    /// Apply one record to a cache. This is the single fold function used by
    /// both replay and live appends.
    fn fold(cache: &mut HashMap<String, WorkItem>, record: LedgerRecord) {
        match record {
            LedgerRecord::Create { item } => {
                cache.insert(item.id.clone(), item);
            }
            LedgerRecord::Event { work_id, event, at } => {
                if let Some(item) = cache.get_mut(&work_id) {
                    item.events.push(WorkEvent { at, event });
                }
            }
            LedgerRecord::Status {
                work_id,
                status,
                error,
                at,
            } => {
                if let Some(item) = cache.get_mut(&work_id) {
                    item.status = status;
                    if let Some(error) = error {
                        item.error = Some(error);
                    }
                    if status == WorkStatus::Running && item.started_at.is_none() {
                        item.started_at = Some(at);
                    }
                    if status.is_terminal() && item.completed_at.is_none() {
                        item.completed_at = Some(at);
                    }
                }
            }
            LedgerRecord::Update { work_id, patch } => {
                if let Some(item) = cache.get_mut(&work_id) {
                    if let Some(output) = patch.output {
                        item.output = Some(output);
                    }
                    if let Some(iterations) = patch.iterations {
                        item.iterations = iterations;
                    }
                    if let Some(title) = patch.title {
                        item.title = title;
                    }
                    for tag in patch.add_tags {
                        if !item.tags.contains(&tag) {
                            item.tags.push(tag);
                        }
                    }
                }
            }
        }
    }

    /// Append to today's shard, then fold into the cache.
    fn commit(&mut self, record: LedgerRecord) -> Result<()> {
        let path = self.shard_path(Utc::now().date_naive());
        store::append_jsonl(&path, &record)?;
        Self::fold(&mut self.cache, record);
        Ok(())
    }

    pub fn create(&mut self, input: WorkInput) -> Result<WorkItem> {
        self.load_all()?;
        let item = WorkItem {
            id: uuid::Uuid::new_v4().to_string(),
            title: input.title,
            work_type: input.work_type,
            role_id: input.role_id,
            parent_id: input.parent_id,
            tags: input.tags,
            status: WorkStatus::Pending,
            output: None,
            error: None,
            iterations: 0,
            events: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        self.commit(LedgerRecord::Create { item: item.clone() })?;
        Ok(item)
    }

    pub fn get(&mut self, id: &str) -> Result<Option<WorkItem>> {
        self.load_all()?;
        Ok(self.cache.get(id).cloned())
    }

    pub fn list(&mut self, filter: &ListFilter) -> Result<Vec<WorkItem>> {
        match filter.date {
            Some(date) => self.load_date(date)?,
            None => self.load_all()?,
        }
        let mut items: Vec<WorkItem> = self
            .cache
            .values()
            .filter(|item| {
                filter
                    .date
                    .is_none_or(|d| item.created_at.date_naive() == d)
                    && filter.status.is_none_or(|s| item.status == s)
                    && filter
                        .work_type
                        .as_deref()
                        .is_none_or(|t| item.work_type == t)
                    && filter
                        .role_id
                        .as_deref()
                        .is_none_or(|r| item.role_id.as_deref() == Some(r))
                    && filter
                        .parent_id
                        .as_deref()
                        .is_none_or(|p| item.parent_id.as_deref() == Some(p))
                    && filter
                        .tag
                        .as_deref()
                        .is_none_or(|t| item.tags.iter().any(|tag| tag == t))
            })
            .cloned()
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let items: Vec<WorkItem> = items
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(items)
    }

    pub fn append_event(&mut self, id: &str, event: &str) -> Result<(), WorkError> {
        self.require(id)?;
        self.commit(LedgerRecord::Event {
            work_id: id.to_string(),
            event: event.to_string(),
            at: Utc::now(),
        })
        .map_err(WorkError::Other)
    }

    pub fn update_status(
        &mut self,
        id: &str,
        status: WorkStatus,
        error: Option<String>,
    ) -> Result<(), WorkError> {
        let current = self.require(id)?.status;
        if !current.can_transition_to(status) {
            return Err(WorkError::InvalidTransition {
                work_id: id.to_string(),
                from: current.as_str().to_string(),
                to: status.as_str().to_string(),
            });
        }
        self.commit(LedgerRecord::Status {
            work_id: id.to_string(),
            status,
            error,
            at: Utc::now(),
        })
        .map_err(WorkError::Other)
    }

    pub fn set_output(&mut self, id: &str, output: serde_json::Value) -> Result<(), WorkError> {
        self.require(id)?;
        self.commit(LedgerRecord::Update {
            work_id: id.to_string(),
            patch: WorkPatch {
                output: Some(output),
                ..Default::default()
            },
        })
        .map_err(WorkError::Other)
    }

    pub fn increment_iterations(&mut self, id: &str) -> Result<u32, WorkError> {
        let next = self.require(id)?.iterations + 1;
        self.commit(LedgerRecord::Update {
            work_id: id.to_string(),
            patch: WorkPatch {
                iterations: Some(next),
                ..Default::default()
            },
        })
        .map_err(WorkError::Other)?;
        Ok(next)
    }

    /// Cancel a pending or running item; also records the reason as an event.
    pub fn cancel(&mut self, id: &str, reason: Option<&str>) -> Result<(), WorkError> {
        if let Some(reason) = reason {
            self.append_event(id, &format!("cancelled: {reason}"))?;
        }
        self.update_status(id, WorkStatus::Cancelled, None)
    }

    fn require(&mut self, id: &str) -> Result<&WorkItem, WorkError> {
        self.load_all().map_err(WorkError::Other)?;
        if !self.cache.contains_key(id) {
            return Err(WorkError::NotFound(id.to_string()));
        }
        Ok(&self.cache[id])
    }

    /// Test/diagnostic hook: the shard directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn work(title: &str) -> WorkInput {
        WorkInput {
            title: title.to_string(),
            work_type: "task".to_string(),
            role_id: Some("builder".to_string()),
            parent_id: None,
            tags: vec!["phase-1".to_string()],
        }
    }

    #[test]
    fn create_then_get() {
        let dir = tempdir().unwrap();
        let mut ledger = Ledger::new(dir.path());
        let item = ledger.create(work("parse")).unwrap();
        assert_eq!(item.status, WorkStatus::Pending);
        let got = ledger.get(&item.id).unwrap().unwrap();
        assert_eq!(got.title, "parse");
    }

    #[test]
    fn status_machine_guards_transitions() {
        let dir = tempdir().unwrap();
        let mut ledger = Ledger::new(dir.path());
        let item = ledger.create(work("t")).unwrap();

        // pending -> complete is not allowed
        let err = ledger
            .update_status(&item.id, WorkStatus::Complete, None)
            .unwrap_err();
        assert!(matches!(err, WorkError::InvalidTransition { .. }));

        ledger
            .update_status(&item.id, WorkStatus::Running, None)
            .unwrap();
        ledger
            .update_status(&item.id, WorkStatus::Complete, None)
            .unwrap();

        // terminal is terminal
        let err = ledger
            .update_status(&item.id, WorkStatus::Running, None)
            .unwrap_err();
        assert!(matches!(err, WorkError::InvalidTransition { .. }));
    }

    #[test]
    fn pending_can_be_cancelled_administratively() {
        let dir = tempdir().unwrap();
        let mut ledger = Ledger::new(dir.path());
        let item = ledger.create(work("t")).unwrap();
        ledger.cancel(&item.id, Some("superseded")).unwrap();
        let got = ledger.get(&item.id).unwrap().unwrap();
        assert_eq!(got.status, WorkStatus::Cancelled);
        assert!(got.events.iter().any(|e| e.event.contains("superseded")));
        assert!(got.completed_at.is_some());
    }

    #[test]
    fn timestamps_set_on_run_and_terminal() {
        let dir = tempdir().unwrap();
        let mut ledger = Ledger::new(dir.path());
        let item = ledger.create(work("t")).unwrap();
        assert!(item.started_at.is_none());

        ledger
            .update_status(&item.id, WorkStatus::Running, None)
            .unwrap();
        let running = ledger.get(&item.id).unwrap().unwrap();
        let started = running.started_at.unwrap();

        ledger
            .update_status(&item.id, WorkStatus::Failed, Some("boom".into()))
            .unwrap();
        let failed = ledger.get(&item.id).unwrap().unwrap();
        assert_eq!(failed.started_at, Some(started));
        assert!(failed.completed_at.unwrap() >= started);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn replay_reconstructs_cache_exactly() {
        let dir = tempdir().unwrap();
        let (id_a, id_b);
        {
            let mut ledger = Ledger::new(dir.path());
            let a = ledger.create(work("a")).unwrap();
            let b = ledger.create(work("b")).unwrap();
            ledger.update_status(&a.id, WorkStatus::Running, None).unwrap();
            ledger.append_event(&a.id, "spawned worker").unwrap();
            ledger.increment_iterations(&a.id).unwrap();
            ledger
                .set_output(&a.id, serde_json::json!({"files": 3}))
                .unwrap();
            ledger
                .update_status(&a.id, WorkStatus::Complete, None)
                .unwrap();
            id_a = a.id;
            id_b = b.id;
        }

        // Fresh instance folds the shards back into the same state
        let mut replayed = Ledger::new(dir.path());
        let a = replayed.get(&id_a).unwrap().unwrap();
        assert_eq!(a.status, WorkStatus::Complete);
        assert_eq!(a.iterations, 1);
        assert_eq!(a.output, Some(serde_json::json!({"files": 3})));
        assert_eq!(a.events.len(), 1);
        assert!(a.started_at.is_some() && a.completed_at.is_some());

        let b = replayed.get(&id_b).unwrap().unwrap();
        assert_eq!(b.status, WorkStatus::Pending);
    }

    #[test]
    fn list_filters_and_paginates() {
        let dir = tempdir().unwrap();
        let mut ledger = Ledger::new(dir.path());
        for i in 0..5 {
            let mut input = work(&format!("t{i}"));
            if i % 2 == 0 {
                input.work_type = "review".to_string();
            }
            ledger.create(input).unwrap();
        }

        let reviews = ledger
            .list(&ListFilter {
                work_type: Some("review".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(reviews.len(), 3);

        let page = ledger
            .list(&ListFilter {
                offset: 1,
                limit: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.len(), 2);

        let tagged = ledger
            .list(&ListFilter {
                tag: Some("phase-1".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(tagged.len(), 5);

        let today = ledger
            .list(&ListFilter {
                date: Some(Utc::now().date_naive()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(today.len(), 5);
    }

    #[test]
    fn unknown_id_is_not_found() {
        let dir = tempdir().unwrap();
        let mut ledger = Ledger::new(dir.path());
        let err = ledger.append_event("ghost", "x").unwrap_err();
        assert!(matches!(err, WorkError::NotFound(_)));
    }

    #[test]
    fn ledger_record_serialization_is_tagged() {
        let record = LedgerRecord::Status {
            work_id: "w1".to_string(),
            status: WorkStatus::Running,
            error: None,
            at: Utc::now(),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains(r#""type":"status""#));
        let parsed: LedgerRecord = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, LedgerRecord::Status { .. }));
    }
}
