//! In-memory task index
//!
//! Owns every [`Task`] and keeps secondary indices (project, tag, context,
//! priority, status, date bucket, file) in step with per-file upserts.
//! Mutation goes through [`Repository::upsert_file`] and
//! [`Repository::remove_file`] only.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::RangeInclusive;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::NaiveDate;
use serde::Serialize;

use crate::task::{DateField, Task, TaskStatus};

/// Per-file bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexEntry {
    pub content_hash: String,
    /// Modification time in epoch millis, if known.
    pub mtime: Option<i64>,
    pub task_ids: Vec<String>,
}

/// File metadata supplied alongside an upsert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryMeta {
    pub content_hash: String,
    pub mtime: Option<i64>,
}

/// Ids affected by one file-level mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub file: String,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl ChangeSet {
    pub fn empty(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.changed.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexSummary {
    pub total_tasks: usize,
    pub files: usize,
    pub projects: usize,
    pub tags: usize,
    pub contexts: usize,
    pub generation: u64,
    pub loaded: bool,
}

pub type IdSet = BTreeSet<String>;

/// The repository as shared between the worker and readers.
pub type SharedRepository = Arc<RwLock<Repository>>;

/// Read side; poisoning is ignored.
pub fn read_lock(repo: &SharedRepository) -> RwLockReadGuard<'_, Repository> {
    repo.read().unwrap_or_else(PoisonError::into_inner)
}

pub fn write_lock(repo: &SharedRepository) -> RwLockWriteGuard<'_, Repository> {
    repo.write().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Default)]
pub struct Repository {
    tasks: HashMap<String, Task>,
    files: BTreeMap<String, IndexEntry>,
    by_project: BTreeMap<String, IdSet>,
    by_tag: BTreeMap<String, IdSet>,
    by_context: BTreeMap<String, IdSet>,
    by_priority: BTreeMap<u8, IdSet>,
    by_status: BTreeMap<TaskStatus, IdSet>,
    by_date: BTreeMap<DateField, BTreeMap<NaiveDate, IdSet>>,
    generation: u64,
    loaded: bool,
}

/// Index keys are case-folded so lookups ignore case.
pub fn index_key(value: &str) -> String {
    value.trim().to_lowercase()
}

impl Repository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// `false` until the first full scan completes, so callers can tell
    /// "nothing loaded yet" from "empty corpus".
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn mark_loaded(&mut self) {
        self.loaded = true;
    }

    /// Continue numbering after `previous` when this repository replaces
    /// another one wholesale.
    pub fn continue_generation_from(&mut self, previous: u64) {
        self.generation = self.generation.max(previous) + 1;
    }

    /// Replace exactly the tasks previously associated with `file_id`.
    pub fn upsert_file(&mut self, file_id: &str, tasks: Vec<Task>, meta: EntryMeta) -> ChangeSet {
        let mut changes = ChangeSet::empty(file_id);
        let previous: Vec<String> = self
            .files
            .get(file_id)
            .map(|entry| entry.task_ids.clone())
            .unwrap_or_default();

        let mut incoming: Vec<Task> = Vec::with_capacity(tasks.len());
        for task in tasks {
            if let Some(existing) = incoming.iter_mut().find(|candidate| candidate.id == task.id) {
                *existing = task;
            } else {
                incoming.push(task);
            }
        }
        let incoming_ids: BTreeSet<&str> = incoming.iter().map(|task| task.id.as_str()).collect();

        for id in &previous {
            if !incoming_ids.contains(id.as_str()) {
                if let Some(task) = self.tasks.remove(id) {
                    self.unindex(&task);
                }
                changes.removed.push(id.clone());
            }
        }

        let mut task_ids = Vec::with_capacity(incoming.len());
        for task in incoming {
            task_ids.push(task.id.clone());
            match self.tasks.get(&task.id) {
                Some(existing) if *existing == task => continue,
                Some(_) => changes.changed.push(task.id.clone()),
                None => changes.added.push(task.id.clone()),
            }
            if let Some(old) = self.tasks.remove(&task.id) {
                self.unindex(&old);
            }
            self.index(&task);
            self.tasks.insert(task.id.clone(), task);
        }

        if task_ids.is_empty() && meta == EntryMeta::default() {
            self.files.remove(file_id);
        } else {
            self.files.insert(
                file_id.to_string(),
                IndexEntry {
                    content_hash: meta.content_hash,
                    mtime: meta.mtime,
                    task_ids,
                },
            );
        }

        if !changes.is_empty() {
            self.generation += 1;
        }
        changes
    }

    pub fn remove_file(&mut self, file_id: &str) -> ChangeSet {
        let mut changes = ChangeSet::empty(file_id);
        let Some(entry) = self.files.remove(file_id) else {
            return changes;
        };
        for id in entry.task_ids {
            if let Some(task) = self.tasks.remove(&id) {
                self.unindex(&task);
            }
            changes.removed.push(id);
        }
        if !changes.is_empty() {
            self.generation += 1;
        }
        changes
    }

    pub fn get_by_id(&self, id: &str) -> Option<Task> {
        self.tasks.get(id).cloned()
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Tasks of one file, ordered by line.
    pub fn get_by_file(&self, file_id: &str) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .files
            .get(file_id)
            .map(|entry| {
                entry
                    .task_ids
                    .iter()
                    .filter_map(|id| self.tasks.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        tasks.sort_by_key(|task| task.line_number);
        tasks
    }

    pub fn entry(&self, file_id: &str) -> Option<&IndexEntry> {
        self.files.get(file_id)
    }

    pub fn file_ids(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn ids_for_project(&self, project: &str) -> Option<&IdSet> {
        self.by_project.get(&index_key(project))
    }

    pub fn ids_for_tag(&self, tag: &str) -> Option<&IdSet> {
        self.by_tag.get(&index_key(tag.trim_start_matches('#')))
    }

    pub fn ids_for_context(&self, context: &str) -> Option<&IdSet> {
        self.by_context.get(&index_key(context))
    }

    pub fn ids_for_priority(&self, priority: u8) -> Option<&IdSet> {
        self.by_priority.get(&priority)
    }

    pub fn ids_for_status(&self, status: TaskStatus) -> Option<&IdSet> {
        self.by_status.get(&status)
    }

    /// Ids whose `field` falls on a day in `days`, in day order.
    pub fn ids_for_dates(&self, field: DateField, days: RangeInclusive<NaiveDate>) -> Vec<&str> {
        self.by_date
            .get(&field)
            .map(|buckets| {
                buckets
                    .range(days)
                    .flat_map(|(_, ids)| ids.iter().map(String::as_str))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn resolve_ids<'a>(&'a self, ids: impl IntoIterator<Item = &'a str>) -> Vec<Task> {
        ids.into_iter()
            .filter_map(|id| self.tasks.get(id).cloned())
            .collect()
    }

    pub fn summary(&self) -> IndexSummary {
        IndexSummary {
            total_tasks: self.tasks.len(),
            files: self.files.len(),
            projects: self.by_project.len(),
            tags: self.by_tag.len(),
            contexts: self.by_context.len(),
            generation: self.generation,
            loaded: self.loaded,
        }
    }

    fn index(&mut self, task: &Task) {
        let id = &task.id;
        if let Some(project) = task.metadata.effective_project() {
            insert_key(&mut self.by_project, index_key(project), id);
        }
        for tag in &task.metadata.tags {
            insert_key(&mut self.by_tag, index_key(tag), id);
        }
        if let Some(context) = task.metadata.context.as_deref() {
            insert_key(&mut self.by_context, index_key(context), id);
        }
        if let Some(priority) = task.metadata.priority {
            insert_key(&mut self.by_priority, priority, id);
        }
        insert_key(&mut self.by_status, task.status, id);
        for field in DateField::ALL {
            if let Some(day) = task.day(field) {
                insert_key(self.by_date.entry(field).or_default(), day, id);
            }
        }
    }

    fn unindex(&mut self, task: &Task) {
        let id = &task.id;
        if let Some(project) = task.metadata.effective_project() {
            remove_key(&mut self.by_project, &index_key(project), id);
        }
        for tag in &task.metadata.tags {
            remove_key(&mut self.by_tag, &index_key(tag), id);
        }
        if let Some(context) = task.metadata.context.as_deref() {
            remove_key(&mut self.by_context, &index_key(context), id);
        }
        if let Some(priority) = task.metadata.priority {
            remove_key(&mut self.by_priority, &priority, id);
        }
        remove_key(&mut self.by_status, &task.status, id);
        for field in DateField::ALL {
            if let Some(day) = task.day(field) {
                if let Some(buckets) = self.by_date.get_mut(&field) {
                    remove_key(buckets, &day, id);
                }
            }
        }
    }
}

fn insert_key<K: Ord>(index: &mut BTreeMap<K, IdSet>, key: K, id: &str) {
    index.entry(key).or_default().insert(id.to_string());
}

fn remove_key<K: Ord>(index: &mut BTreeMap<K, IdSet>, key: &K, id: &str) {
    if let Some(ids) = index.get_mut(key) {
        ids.remove(id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dates;
    use crate::task::{TaskMetadata, TaskOrigin};

    fn task(file: &str, line: usize, content: &str) -> Task {
        Task {
            id: Task::file_task_id(file, line),
            content: content.to_string(),
            status: TaskStatus::NotStarted,
            status_mark: ' ',
            source_path: file.to_string(),
            line_number: line,
            original_markdown: format!("- [ ] {content}"),
            metadata: TaskMetadata::default(),
            readonly: false,
            origin: TaskOrigin::File,
        }
    }

    fn meta(hash: &str) -> EntryMeta {
        EntryMeta {
            content_hash: hash.to_string(),
            mtime: None,
        }
    }

    #[test]
    fn upsert_is_idempotent() {
        let mut repo = Repository::new();
        let mut first = task("a.md", 1, "one");
        first.metadata.tags = vec!["Work".to_string()];
        let tasks = vec![first, task("a.md", 2, "two")];

        let changes = repo.upsert_file("a.md", tasks.clone(), meta("h1"));
        assert_eq!(changes.added.len(), 2);
        let generation = repo.generation();

        let again = repo.upsert_file("a.md", tasks, meta("h1"));
        assert!(again.is_empty());
        assert_eq!(repo.generation(), generation);
        assert_eq!(repo.len(), 2);
        assert_eq!(repo.ids_for_tag("work").map(|ids| ids.len()), Some(1));
    }

    #[test]
    fn upsert_diffs_added_removed_changed() {
        let mut repo = Repository::new();
        repo.upsert_file(
            "a.md",
            vec![task("a.md", 1, "one"), task("a.md", 2, "two")],
            meta("h1"),
        );

        let mut changed = task("a.md", 1, "one edited");
        changed.status = TaskStatus::Completed;
        let changes = repo.upsert_file(
            "a.md",
            vec![changed, task("a.md", 3, "three")],
            meta("h2"),
        );
        assert_eq!(changes.changed, vec!["a.md:L1".to_string()]);
        assert_eq!(changes.added, vec!["a.md:L3".to_string()]);
        assert_eq!(changes.removed, vec!["a.md:L2".to_string()]);
        assert!(repo.get_by_id("a.md:L2").is_none());
        assert_eq!(
            repo.ids_for_status(TaskStatus::Completed).map(|ids| ids.len()),
            Some(1)
        );
        assert!(repo.ids_for_status(TaskStatus::NotStarted).is_some());
        assert_eq!(repo.entry("a.md").map(|entry| entry.content_hash.as_str()), Some("h2"));
    }

    #[test]
    fn files_are_isolated() {
        let mut repo = Repository::new();
        repo.upsert_file("a.md", vec![task("a.md", 1, "a")], meta("a"));
        repo.upsert_file("b.md", vec![task("b.md", 1, "b")], meta("b"));
        let changes = repo.remove_file("a.md");
        assert_eq!(changes.removed, vec!["a.md:L1".to_string()]);
        assert_eq!(repo.get_by_file("b.md").len(), 1);
        assert!(repo.remove_file("a.md").is_empty());
    }

    #[test]
    fn get_by_file_orders_by_line() {
        let mut repo = Repository::new();
        repo.upsert_file(
            "a.md",
            vec![task("a.md", 9, "late"), task("a.md", 2, "early")],
            meta("x"),
        );
        let lines: Vec<usize> = repo.get_by_file("a.md").iter().map(|t| t.line_number).collect();
        assert_eq!(lines, vec![2, 9]);
    }

    #[test]
    fn date_buckets_follow_updates() {
        let mut repo = Repository::new();
        let mut due = task("a.md", 1, "due");
        due.metadata.due_date = dates::parse_date("2024-01-20");
        repo.upsert_file("a.md", vec![due.clone()], meta("1"));

        let day = |s: &str| NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("day");
        assert_eq!(
            repo.ids_for_dates(DateField::Due, day("2024-01-01")..=day("2024-01-31")),
            vec!["a.md:L1"]
        );

        due.metadata.due_date = dates::parse_date("2024-02-05");
        repo.upsert_file("a.md", vec![due], meta("2"));
        assert!(repo
            .ids_for_dates(DateField::Due, day("2024-01-01")..=day("2024-01-31"))
            .is_empty());
    }

    #[test]
    fn loaded_flag_and_summary() {
        let mut repo = Repository::new();
        assert!(!repo.is_loaded());
        repo.mark_loaded();
        let summary = repo.summary();
        assert!(summary.loaded);
        assert_eq!(summary.total_tasks, 0);

        let mut other = Repository::new();
        other.continue_generation_from(7);
        assert_eq!(other.generation(), 8);
    }
}
