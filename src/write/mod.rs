//! In-place edits of corpus files.
//!
//! Every mutation takes the file's sidecar lock, reads the file fresh,
//! re-validates the task line, writes atomically and then has the index
//! worker re-parse the file before answering. Operations report failures in
//! their outcome instead of returning `Err`.

pub mod line_edit;

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::task;
use tracing::{info, warn};

use crate::config::WriteConfig;
use crate::dates::{self, DateOffset};
use crate::error::{Error, Result};
use crate::events::{EventBus, EventKind};
use crate::lock::{write_atomic_str, FileLock, DEFAULT_LOCK_TIMEOUT_MS};
use crate::parser::TaskParser;
use crate::repository::{self, SharedRepository};
use crate::storage::{content_hash, Storage};
use crate::task::{DateField, Task, TaskStatus};
use crate::worker::IndexHandle;

pub use line_edit::{
    Document, EditedLine, FieldPatch, LineAnchor, LineEditor, TaskPatch, TextReplacement,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WriteOutcome {
    fn ok(task: Option<Task>, message: Option<String>) -> Self {
        Self {
            success: true,
            task,
            message,
        }
    }

    fn failed(err: &Error) -> Self {
        Self {
            success: false,
            task: None,
            message: Some(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub success: bool,
    pub created: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchItem {
    pub id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl BatchItem {
    fn from_outcome(id: &str, outcome: WriteOutcome) -> Self {
        Self {
            id: id.to_string(),
            success: outcome.success,
            message: outcome.message,
        }
    }
}

/// Arguments for a new task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateTaskArgs {
    pub content: String,
    /// Corpus-relative target file.
    pub file_path: Option<String>,
    pub heading: Option<String>,
    /// Parent task id; the new task becomes its subtask.
    pub parent: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<u8>,
    pub start_date: Option<String>,
    pub due_date: Option<String>,
    pub scheduled_date: Option<String>,
    pub project: Option<String>,
    pub context: Option<String>,
    pub tags: Vec<String>,
    pub recurrence: Option<String>,
}

impl CreateTaskArgs {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    fn patch(&self) -> TaskPatch {
        let mut patch = TaskPatch {
            status: self.status,
            priority: self.priority.map(FieldPatch::Set),
            project: self.project.clone().map(FieldPatch::Set),
            context: self.context.clone().map(FieldPatch::Set),
            tags: (!self.tags.is_empty()).then(|| self.tags.clone()),
            recurrence: self.recurrence.clone().map(FieldPatch::Set),
            ..TaskPatch::default()
        };
        let dates = [
            (DateField::Start, &self.start_date),
            (DateField::Scheduled, &self.scheduled_date),
            (DateField::Due, &self.due_date),
        ];
        for (field, value) in dates {
            if let Some(value) = value {
                patch.dates.insert(field, FieldPatch::Set(value.clone()));
            }
        }
        patch
    }
}

/// Where a postponed task's date goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Postpone {
    By(DateOffset),
    Until(NaiveDate),
}

impl Postpone {
    /// `+Nd|+Nw|+Nm|+Ny` or an absolute `YYYY-MM-DD`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            Ok(date) => Ok(Postpone::Until(date)),
            Err(_) => DateOffset::parse(raw).map(Postpone::By),
        }
    }

    fn target(&self, current: Option<NaiveDate>, today: NaiveDate) -> Result<NaiveDate> {
        match *self {
            Postpone::Until(date) => Ok(date),
            Postpone::By(offset) => offset
                .apply(current.unwrap_or(today))
                .ok_or_else(|| Error::InvalidArgument("postponed date out of range".into())),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Placement {
    BelowParent,
    AfterChildren,
}

/// File-mutating operations over the indexed corpus.
#[derive(Debug, Clone)]
pub struct WriteApi {
    storage: Arc<Storage>,
    repository: SharedRepository,
    index: IndexHandle,
    editor: Arc<LineEditor>,
    config: Arc<WriteConfig>,
    active_file: Arc<Mutex<Option<String>>>,
    events: EventBus,
    lock_timeout_ms: u64,
    today: Option<NaiveDate>,
}

impl WriteApi {
    pub fn new(
        storage: Arc<Storage>,
        repository: SharedRepository,
        index: IndexHandle,
        parser: Arc<TaskParser>,
        config: &WriteConfig,
        events: EventBus,
    ) -> Self {
        Self {
            editor: Arc::new(LineEditor::new(parser, config.auto_date_completion)),
            config: Arc::new(config.clone()),
            active_file: Arc::new(Mutex::new(None)),
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            today: None,
            storage,
            repository,
            index,
            events,
        }
    }

    /// Pin the date used for completion and cancellation stamps.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(dates::today)
    }

    /// Remember the file new tasks go to when no path is given. `None`
    /// clears it.
    pub fn set_active_file(&self, path: Option<&str>) -> WriteOutcome {
        let resolved = match path {
            Some(path) => match self.corpus_file_id(path) {
                Ok(file_id) => Some(file_id),
                Err(err) => return WriteOutcome::failed(&err),
            },
            None => None,
        };
        let message = resolved.clone();
        *self
            .active_file
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = resolved;
        WriteOutcome::ok(None, message)
    }

    pub fn active_file(&self) -> Option<String> {
        self.active_file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn update_task(&self, id: &str, patch: TaskPatch) -> WriteOutcome {
        let result = match self.writable_task(id) {
            Ok(task) => self.apply_patch(task, patch).await.map(|(task, _)| task),
            Err(err) => Err(err),
        };
        self.finish("update", id, result)
    }

    pub async fn delete_task(&self, id: &str, delete_children: bool) -> WriteOutcome {
        let result = self.try_delete(id, delete_children).await;
        match result {
            Ok((task, lines)) => {
                info!(task = %id, lines, "task deleted");
                self.announce("delete", id, &task.source_path);
                WriteOutcome::ok(Some(task), Some(format!("removed {lines} line(s)")))
            }
            Err(err) => {
                warn!(task = %id, error = %err, "delete failed");
                WriteOutcome::failed(&err)
            }
        }
    }

    pub async fn create_task(&self, args: CreateTaskArgs) -> WriteOutcome {
        let result = match args.parent.clone() {
            Some(parent) => self.try_create_subtask(&parent, args, self.placement()).await,
            None => self.try_create(args).await,
        };
        let id = result.as_ref().map(|task| task.id.clone()).unwrap_or_default();
        self.finish("create", &id, result)
    }

    pub async fn create_subtask(&self, parent_id: &str, args: CreateTaskArgs) -> WriteOutcome {
        let result = self
            .try_create_subtask(parent_id, args, self.placement())
            .await;
        let id = result.as_ref().map(|task| task.id.clone()).unwrap_or_default();
        self.finish("create_subtask", &id, result)
    }

    pub async fn batch_update_status(&self, ids: &[String], status: TaskStatus) -> Vec<BatchItem> {
        self.batch_patch(ids, |_| Ok(TaskPatch::status(status))).await
    }

    /// Create several tasks; `default_file` applies to specs without a path.
    pub async fn batch_create(
        &self,
        specs: Vec<CreateTaskArgs>,
        default_file: Option<&str>,
    ) -> BatchOutcome {
        let mut created = 0;
        let mut errors = Vec::new();
        for (idx, mut spec) in specs.into_iter().enumerate() {
            if spec.file_path.is_none() {
                spec.file_path = default_file.map(str::to_string);
            }
            let content = spec.content.clone();
            let outcome = self.create_task(spec).await;
            if outcome.success {
                created += 1;
            } else {
                errors.push(format!(
                    "#{} '{content}': {}",
                    idx + 1,
                    outcome.message.unwrap_or_default()
                ));
            }
        }
        BatchOutcome {
            success: errors.is_empty(),
            created,
            errors,
        }
    }

    /// Create several subtasks under one parent, in order.
    pub async fn batch_create_subtasks(
        &self,
        parent_id: &str,
        specs: Vec<CreateTaskArgs>,
    ) -> BatchOutcome {
        let mut created = 0;
        let mut errors = Vec::new();
        for (idx, spec) in specs.into_iter().enumerate() {
            let content = spec.content.clone();
            let result = self
                .try_create_subtask(parent_id, spec, Placement::AfterChildren)
                .await;
            let id = result.as_ref().map(|task| task.id.clone()).unwrap_or_default();
            let outcome = self.finish("create_subtask", &id, result);
            if outcome.success {
                created += 1;
            } else {
                errors.push(format!(
                    "#{} '{content}': {}",
                    idx + 1,
                    outcome.message.unwrap_or_default()
                ));
            }
        }
        BatchOutcome {
            success: errors.is_empty(),
            created,
            errors,
        }
    }

    /// Move the due date, or the start date for tasks without one.
    pub async fn postpone(&self, ids: &[String], spec: &str) -> Vec<BatchItem> {
        let target = match Postpone::parse(spec) {
            Ok(target) => target,
            Err(err) => return failed_items(ids, &err),
        };
        let today = self.today();
        self.batch_patch(ids, |task| {
            let field = if task.metadata.due_date.is_none() && task.metadata.start_date.is_some()
            {
                DateField::Start
            } else {
                DateField::Due
            };
            let date = target.target(task.day(field), today)?;
            Ok(TaskPatch::default().set_date(field, date.format("%Y-%m-%d").to_string()))
        })
        .await
    }

    /// Replace `find` with `replace` in each task's text. Matching runs over
    /// the raw line, so tags and contexts inside the text can be part of a
    /// match; dates and bracket fields never are.
    pub async fn batch_update_text(
        &self,
        ids: &[String],
        find: &str,
        replace: &str,
    ) -> Vec<BatchItem> {
        if find.is_empty() {
            let err = Error::InvalidArgument("search text is empty".into());
            return failed_items(ids, &err);
        }
        self.batch_patch(ids, |_| {
            Ok(TaskPatch {
                replace_text: Some(TextReplacement {
                    find: find.to_string(),
                    replace: replace.to_string(),
                }),
                ..TaskPatch::default()
            })
        })
        .await
    }

    /// Resolve every id up front so edits that shift lines (recurrences)
    /// do not disturb later items. Lines inserted by earlier items move the
    /// remembered positions of later ones in the same file.
    async fn batch_patch<F>(&self, ids: &[String], make_patch: F) -> Vec<BatchItem>
    where
        F: Fn(&Task) -> Result<TaskPatch>,
    {
        let mut pending: VecDeque<(String, Result<Task>)> = ids
            .iter()
            .map(|id| (id.clone(), self.writable_task(id)))
            .collect();
        let mut items = Vec::with_capacity(pending.len());
        while let Some((id, task)) = pending.pop_front() {
            let result = match task {
                Ok(task) => match make_patch(&task) {
                    Ok(patch) => self.apply_patch(task, patch).await,
                    Err(err) => Err(err),
                },
                Err(err) => Err(err),
            };
            let result = match result {
                Ok((task, inserted)) => {
                    if let Some(line) = inserted {
                        shift_below(&mut pending, &task.source_path, line);
                    }
                    Ok(task)
                }
                Err(err) => Err(err),
            };
            items.push(BatchItem::from_outcome(&id, self.finish("update", &id, result)));
        }
        items
    }

    fn placement(&self) -> Placement {
        if self.config.append_to_children {
            Placement::AfterChildren
        } else {
            Placement::BelowParent
        }
    }

    fn finish(&self, operation: &str, id: &str, result: Result<Task>) -> WriteOutcome {
        match result {
            Ok(task) => {
                info!(operation, task = %task.id, file = %task.source_path, "write completed");
                self.announce(operation, &task.id, &task.source_path);
                WriteOutcome::ok(Some(task), None)
            }
            Err(err) => {
                warn!(operation, task = %id, error = %err, "write failed");
                WriteOutcome::failed(&err)
            }
        }
    }

    fn announce(&self, operation: &str, task_id: &str, file: &str) {
        let generation = repository::read_lock(&self.repository).generation();
        self.events.emit(
            EventKind::WriteCompleted,
            generation,
            serde_json::json!({ "operation": operation, "task_id": task_id, "file": file }),
        );
    }

    fn writable_task(&self, id: &str) -> Result<Task> {
        let task = repository::read_lock(&self.repository)
            .get_by_id(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        if task.readonly || task.is_ics() {
            return Err(Error::ReadonlyTask(id.to_string()));
        }
        Ok(task)
    }

    fn task_at(&self, file_id: &str, line: usize) -> Result<Task> {
        let id = Task::file_task_id(file_id, line);
        repository::read_lock(&self.repository)
            .get_by_id(&id)
            .ok_or_else(|| {
                Error::OperationFailed(format!("task {id} not found after re-index"))
            })
    }

    fn corpus_file_id(&self, raw: &str) -> Result<String> {
        let file_id = self.storage.file_id(Path::new(raw.trim()))?;
        if !self.storage.is_corpus_file(&file_id) {
            return Err(Error::InvalidArgument(format!(
                "{file_id} is not an indexed corpus file"
            )));
        }
        Ok(file_id)
    }

    fn target_file(&self, explicit: Option<&str>) -> Result<String> {
        match explicit.filter(|path| !path.trim().is_empty()) {
            Some(path) => self.corpus_file_id(path),
            None => match self.active_file() {
                Some(active) => Ok(active),
                None => self.corpus_file_id(&self.config.default_file),
            },
        }
    }

    /// Returns the edited task and, for recurrences, the 1-based line the
    /// next instance was inserted at.
    async fn apply_patch(&self, task: Task, patch: TaskPatch) -> Result<(Task, Option<usize>)> {
        let editor = Arc::clone(&self.editor);
        let today = self.today();
        let file_id = task.source_path.clone();
        let anchor = self.anchor_for(&task);
        let (line, inserted) = self
            .edit_file(&file_id, false, move |doc, hash| {
                let idx = locate(doc, &anchor, hash, &task)?;
                let current = doc.line(idx).unwrap_or_default().to_string();
                let edited = editor.apply(&current, &patch, today)?;
                doc.replace(idx, edited.line);
                match edited.next_instance {
                    Some(next) => {
                        doc.insert(idx, next);
                        Ok((idx + 2, Some(idx + 1)))
                    }
                    None => Ok((idx + 1, None)),
                }
            })
            .await?;
        Ok((self.task_at(&file_id, line)?, inserted))
    }

    /// Snapshot of where the index saw `task`, taken under one read lock.
    fn anchor_for(&self, task: &Task) -> LineAnchor {
        let repo = repository::read_lock(&self.repository);
        let twins: Vec<usize> = repo
            .get_by_file(&task.source_path)
            .iter()
            .filter(|other| other.original_markdown == task.original_markdown)
            .map(|other| other.line_number)
            .collect();
        LineAnchor {
            line: task.line_number,
            text: task.original_markdown.clone(),
            indexed_hash: repo
                .entry(&task.source_path)
                .map(|entry| entry.content_hash.clone()),
            occurrence: twins.iter().position(|&line| line == task.line_number),
            copies: twins.len(),
        }
    }

    async fn try_delete(&self, id: &str, delete_children: bool) -> Result<(Task, usize)> {
        let task = self.writable_task(id)?;
        let editor = Arc::clone(&self.editor);
        let target = task.clone();
        let anchor = self.anchor_for(&task);
        let lines = self
            .edit_file(&task.source_path, false, move |doc, hash| {
                let idx = locate(doc, &anchor, hash, &target)?;
                let end = if delete_children {
                    doc.descendants_end(editor.parser(), idx)
                } else {
                    idx + 1
                };
                doc.remove_range(idx, end);
                Ok(end - idx)
            })
            .await?;
        Ok((task, lines))
    }

    async fn try_create(&self, args: CreateTaskArgs) -> Result<Task> {
        let file_id = self.target_file(args.file_path.as_deref())?;
        let heading = args
            .heading
            .clone()
            .or_else(|| self.config.default_heading.clone())
            .filter(|heading| !heading.trim().is_empty());
        let editor = Arc::clone(&self.editor);
        let today = self.today();
        let patch = args.patch();
        let content = args.content;
        let line = self
            .edit_file(&file_id, true, move |doc, _| {
                let rendered = editor.new_task_line("", &content, &patch, today)?;
                let idx = match heading.as_deref() {
                    Some(heading) => match doc.section_append_index(heading) {
                        Some(idx) => idx,
                        None => doc.append_heading(heading),
                    },
                    None => doc.append_index(),
                };
                doc.insert(idx, rendered);
                Ok(idx + 1)
            })
            .await?;
        self.task_at(&file_id, line)
    }

    async fn try_create_subtask(
        &self,
        parent_id: &str,
        args: CreateTaskArgs,
        placement: Placement,
    ) -> Result<Task> {
        let parent = self.writable_task(parent_id).map_err(|err| match err {
            Error::TaskNotFound(id) => Error::ParentNotFound(id),
            other => other,
        })?;
        let editor = Arc::clone(&self.editor);
        let today = self.today();
        let unit = self.config.indent.clone();
        let patch = args.patch();
        let content = args.content;
        let file_id = parent.source_path.clone();
        let anchor = self.anchor_for(&parent);
        let line = self
            .edit_file(&file_id, false, move |doc, hash| {
                let idx = locate(doc, &anchor, hash, &parent)?;
                let indent = {
                    let current = doc.line(idx).unwrap_or_default();
                    let split = editor.parser().split_line(current).ok_or_else(|| {
                        Error::OperationFailed("parent line is no longer a task".into())
                    })?;
                    format!("{}{unit}", split.indent)
                };
                let rendered = editor.new_task_line(&indent, &content, &patch, today)?;
                let at = match placement {
                    Placement::BelowParent => idx + 1,
                    Placement::AfterChildren => doc.descendants_end(editor.parser(), idx),
                };
                doc.insert(at, rendered);
                Ok(at + 1)
            })
            .await?;
        self.task_at(&file_id, line)
    }

    /// Lock, read, edit and atomically rewrite one file, then re-index it.
    async fn edit_file<T, F>(&self, file_id: &str, create: bool, edit: F) -> Result<T>
    where
        F: FnOnce(&mut Document, &str) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.storage.absolute(file_id);
        let lock_path = self.storage.lock_path_for(file_id);
        let timeout_ms = self.lock_timeout_ms;
        let label = PathBuf::from(file_id);
        let value = task::spawn_blocking(move || -> Result<T> {
            let _lock = FileLock::acquire(&lock_path, timeout_ms)?;
            let text = match fs::read_to_string(&path) {
                Ok(text) => text,
                Err(err) if err.kind() == io::ErrorKind::NotFound && create => String::new(),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    return Err(Error::FileNotFound(label))
                }
                Err(err) => return Err(err.into()),
            };
            let hash = content_hash(text.as_bytes());
            let mut doc = Document::parse(&text);
            let value = edit(&mut doc, hash.as_str())?;
            let rendered = doc.render();
            if rendered != text {
                write_atomic_str(&path, &rendered)?;
            }
            Ok(value)
        })
        .await
        .map_err(|err| Error::OperationFailed(format!("write task failed: {err}")))??;
        self.index.process_now(file_id).await?;
        Ok(value)
    }
}

fn locate(doc: &Document, anchor: &LineAnchor, hash: &str, task: &Task) -> Result<usize> {
    doc.locate(anchor, hash).ok_or_else(|| {
        Error::OperationFailed(format!(
            "line of task {} is no longer present in {}, or is ambiguous",
            task.id, task.source_path
        ))
    })
}

fn shift_below(pending: &mut VecDeque<(String, Result<Task>)>, file_id: &str, inserted: usize) {
    for (_, task) in pending.iter_mut() {
        if let Ok(task) = task {
            if task.source_path == file_id && task.line_number >= inserted {
                task.line_number += 1;
            }
        }
    }
}

fn failed_items(ids: &[String], err: &Error) -> Vec<BatchItem> {
    ids.iter()
        .map(|id| BatchItem {
            id: id.clone(),
            success: false,
            message: Some(err.to_string()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").expect("date")
    }

    #[test]
    fn postpone_accepts_offsets_and_dates() {
        let today = day("2024-01-31");
        let by_week = Postpone::parse("+1w").expect("offset");
        assert_eq!(by_week.target(Some(day("2024-01-10")), today).expect("date"), day("2024-01-17"));
        assert_eq!(by_week.target(None, today).expect("date"), day("2024-02-07"));
        let by_month = Postpone::parse("+1m").expect("offset");
        assert_eq!(by_month.target(None, today).expect("date"), day("2024-02-29"));
        let until = Postpone::parse("2024-06-01").expect("date");
        assert_eq!(until.target(Some(day("2024-01-10")), today).expect("date"), day("2024-06-01"));
        assert!(Postpone::parse("soon").is_err());
    }

    #[test]
    fn create_args_become_a_patch() {
        let args = CreateTaskArgs {
            priority: Some(4),
            due_date: Some("2024-02-01".into()),
            tags: vec!["errand".into()],
            ..CreateTaskArgs::new("Buy milk")
        };
        let patch = args.patch();
        assert_eq!(patch.priority, Some(FieldPatch::Set(4)));
        assert_eq!(
            patch.dates.get(&DateField::Due),
            Some(&FieldPatch::Set("2024-02-01".to_string()))
        );
        assert_eq!(patch.tags, Some(vec!["errand".to_string()]));
        assert!(patch.content.is_none());
    }
}
