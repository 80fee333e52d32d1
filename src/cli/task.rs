//! Task-editing commands: add, done, update, delete, postpone, replace.

use crate::error::{Error, Result};
use crate::output::{emit_success, HumanOutput};
use crate::task::{DateField, TaskStatus};
use crate::write::{BatchItem, CreateTaskArgs, FieldPatch, TaskPatch, WriteOutcome};

use super::list::task_row;
use super::{write_failed, Session};

pub struct AddOptions {
    pub content: String,
    pub file: Option<String>,
    pub heading: Option<String>,
    pub parent: Option<String>,
    pub priority: Option<u8>,
    pub start: Option<String>,
    pub due: Option<String>,
    pub scheduled: Option<String>,
    pub project: Option<String>,
    pub context: Option<String>,
    pub tags: Vec<String>,
    pub every: Option<String>,
}

pub struct UpdateOptions {
    pub id: String,
    pub content: Option<String>,
    pub status: Option<String>,
    pub priority: Option<u8>,
    pub start: Option<String>,
    pub due: Option<String>,
    pub scheduled: Option<String>,
    pub project: Option<String>,
    pub context: Option<String>,
    pub tags: Option<Vec<String>>,
    pub every: Option<String>,
    pub clear: Vec<String>,
}

pub async fn run_add(session: &Session, options: AddOptions) -> Result<()> {
    let args = CreateTaskArgs {
        content: options.content,
        file_path: options.file,
        heading: options.heading,
        parent: options.parent,
        status: None,
        priority: options.priority,
        start_date: options.start,
        due_date: options.due,
        scheduled_date: options.scheduled,
        project: options.project,
        context: options.context,
        tags: options.tags,
        recurrence: options.every,
    };
    let outcome = session.engine.write_api().create_task(args).await;
    emit_outcome(session, "add", "created", outcome)
}

pub async fn run_done(session: &Session, ids: &[String], undo: bool) -> Result<()> {
    let status = if undo {
        TaskStatus::NotStarted
    } else {
        TaskStatus::Completed
    };
    let items = session
        .engine
        .write_api()
        .batch_update_status(ids, status)
        .await;
    emit_batch(session, "done", items)
}

pub async fn run_update(session: &Session, options: UpdateOptions) -> Result<()> {
    let patch = update_patch(&options)?;
    let outcome = session
        .engine
        .write_api()
        .update_task(&options.id, patch)
        .await;
    emit_outcome(session, "update", "updated", outcome)
}

pub async fn run_delete(session: &Session, id: &str, children: bool) -> Result<()> {
    let outcome = session.engine.write_api().delete_task(id, children).await;
    emit_outcome(session, "delete", "deleted", outcome)
}

pub async fn run_postpone(session: &Session, ids: &[String], by: &str) -> Result<()> {
    let items = session.engine.write_api().postpone(ids, by).await;
    emit_batch(session, "postpone", items)
}

pub async fn run_replace(
    session: &Session,
    ids: &[String],
    find: &str,
    replacement: &str,
) -> Result<()> {
    let items = session
        .engine
        .write_api()
        .batch_update_text(ids, find, replacement)
        .await;
    emit_batch(session, "replace", items)
}

fn update_patch(options: &UpdateOptions) -> Result<TaskPatch> {
    let status = match options.status.as_deref() {
        Some(raw) => Some(
            TaskStatus::parse(raw)
                .ok_or_else(|| Error::InvalidArgument(format!("unknown status '{raw}'")))?,
        ),
        None => None,
    };

    let mut patch = TaskPatch {
        content: options.content.clone(),
        status,
        priority: options.priority.map(FieldPatch::Set),
        project: options.project.clone().map(FieldPatch::Set),
        context: options.context.clone().map(FieldPatch::Set),
        tags: options.tags.clone(),
        recurrence: options.every.clone().map(FieldPatch::Set),
        ..TaskPatch::default()
    };
    for (field, value) in [
        (DateField::Start, &options.start),
        (DateField::Due, &options.due),
        (DateField::Scheduled, &options.scheduled),
    ] {
        if let Some(value) = value {
            patch.dates.insert(field, FieldPatch::Set(value.clone()));
        }
    }

    for name in &options.clear {
        match name.trim().to_ascii_lowercase().as_str() {
            "priority" => patch.priority = Some(FieldPatch::Clear),
            "project" => patch.project = Some(FieldPatch::Clear),
            "context" => patch.context = Some(FieldPatch::Clear),
            "every" | "recurrence" => patch.recurrence = Some(FieldPatch::Clear),
            "tags" => patch.tags = Some(Vec::new()),
            other => {
                let field = DateField::parse(other).ok_or_else(|| {
                    Error::InvalidArgument(format!("cannot clear unknown field '{other}'"))
                })?;
                patch.dates.insert(field, FieldPatch::Clear);
            }
        }
    }

    if patch == TaskPatch::default() {
        return Err(Error::InvalidArgument("nothing to update".into()));
    }
    Ok(patch)
}

fn emit_outcome(session: &Session, command: &str, verb: &str, outcome: WriteOutcome) -> Result<()> {
    if !outcome.success {
        return Err(write_failed(outcome.message));
    }
    let mut human = HumanOutput::new(format!("taskflow {command}: {verb}"));
    if let Some(task) = &outcome.task {
        human.push_detail(task_row(task));
    }
    if let Some(message) = &outcome.message {
        human.push_summary("note", message.clone());
    }
    emit_success(session.output, command, &outcome, Some(&human))
}

/// Prints every item; fails the command when any item failed.
fn emit_batch(session: &Session, command: &str, items: Vec<BatchItem>) -> Result<()> {
    let failed = items.iter().filter(|item| !item.success).count();
    let mut human = HumanOutput::new(format!(
        "taskflow {command}: {} of {} succeeded",
        items.len() - failed,
        items.len()
    ));
    for item in &items {
        if item.success {
            human.push_detail(item.id.clone());
        } else {
            human.push_warning(format!(
                "{}: {}",
                item.id,
                item.message.as_deref().unwrap_or("failed")
            ));
        }
    }
    emit_success(session.output, command, &items, Some(&human))?;
    if failed > 0 {
        return Err(Error::OperationFailed(format!("{failed} of {} item(s) failed", items.len())));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(id: &str) -> UpdateOptions {
        UpdateOptions {
            id: id.into(),
            content: None,
            status: None,
            priority: None,
            start: None,
            due: None,
            scheduled: None,
            project: None,
            context: None,
            tags: None,
            every: None,
            clear: Vec::new(),
        }
    }

    #[test]
    fn update_patch_sets_and_clears_fields() {
        let mut opts = options("a.md:L1");
        opts.due = Some("2024-02-01".into());
        opts.status = Some("doing".into());
        opts.clear = vec!["start".into(), "priority".into()];
        let patch = update_patch(&opts).expect("patch");
        assert_eq!(patch.status, Some(TaskStatus::InProgress));
        assert_eq!(
            patch.dates.get(&DateField::Due),
            Some(&FieldPatch::Set("2024-02-01".to_string()))
        );
        assert_eq!(patch.dates.get(&DateField::Start), Some(&FieldPatch::Clear));
        assert_eq!(patch.priority, Some(FieldPatch::Clear));
    }

    #[test]
    fn update_patch_rejects_empty_and_unknown() {
        assert!(matches!(
            update_patch(&options("a.md:L1")),
            Err(Error::InvalidArgument(_))
        ));
        let mut opts = options("a.md:L1");
        opts.clear = vec!["colour".into()];
        assert!(update_patch(&opts).is_err());
    }
}
