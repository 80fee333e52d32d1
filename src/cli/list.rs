//! taskflow list, show and tags commands

use serde::Serialize;

use crate::dates;
use crate::error::{Error, Result};
use crate::output::{emit_success, HumanOutput};
use crate::query::TaxonomyListing;
use crate::task::{DateField, Task, TaskStatus};

use super::Session;

pub struct ListOptions {
    pub file: Option<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Serialize)]
struct ListReport {
    total: usize,
    tasks: Vec<Task>,
}

pub fn run_list(session: &Session, options: ListOptions) -> Result<()> {
    let status = match options.status.as_deref() {
        Some(raw) => Some(
            TaskStatus::parse(raw)
                .ok_or_else(|| Error::InvalidArgument(format!("unknown status '{raw}'")))?,
        ),
        None => None,
    };

    let api = session.engine.query_api();
    let mut tasks = match &options.file {
        Some(file) => api.tasks_for_file(file),
        None => api.get_all_tasks(),
    };
    if let Some(status) = status {
        tasks.retain(|task| task.status == status);
    }
    let total = tasks.len();
    if let Some(limit) = options.limit {
        tasks.truncate(limit);
    }

    let mut human = HumanOutput::new(format!("taskflow list: {total} task(s)"));
    push_tasks(&mut human, &tasks);
    if tasks.len() < total {
        human.push_warning(format!("showing {} of {total}", tasks.len()));
    }
    emit_success(session.output, "list", &ListReport { total, tasks }, Some(&human))
}

pub fn run_show(session: &Session, id: &str) -> Result<()> {
    let task = session
        .engine
        .query_api()
        .get_task_by_id(id)
        .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;

    let mut human = HumanOutput::new(format!("taskflow show: {}", task.id));
    human.push_summary("content", task.content.clone());
    human.push_summary("status", task.status.to_string());
    human.push_summary("source", format!("{}:{}", task.source_path, task.line_number));
    if let Some(project) = task.metadata.effective_project() {
        human.push_summary("project", project);
    }
    if let Some(context) = &task.metadata.context {
        human.push_summary("context", context.clone());
    }
    if let Some(priority) = task.metadata.priority {
        human.push_summary("priority", priority.to_string());
    }
    for field in DateField::ALL {
        if let Some(day) = task.date(field).and_then(dates::format_date) {
            human.push_summary(field.as_str(), day);
        }
    }
    if !task.metadata.tags.is_empty() {
        human.push_summary("tags", task.metadata.tags.join(", "));
    }
    if let Some(parent) = &task.metadata.parent {
        human.push_summary("parent", parent.clone());
    }
    for child in &task.metadata.children {
        human.push_detail(format!("child {child}"));
    }
    if task.readonly {
        human.push_warning("readonly");
    }

    emit_success(session.output, "show", &task, Some(&human))
}

pub fn run_tags(session: &Session) -> Result<()> {
    let listing: TaxonomyListing = session.engine.query_api().list_all_tags_projects_contexts();

    let mut human = HumanOutput::new("taskflow tags");
    human.push_summary("tags", join_or_none(&listing.tags));
    human.push_summary("projects", join_or_none(&listing.projects));
    human.push_summary("contexts", join_or_none(&listing.contexts));
    emit_success(session.output, "tags", &listing, Some(&human))
}

/// One task per detail line: mark, content, id and the due date if any.
pub(crate) fn push_tasks(human: &mut HumanOutput, tasks: &[Task]) {
    for task in tasks {
        human.push_detail(task_row(task));
    }
}

pub(crate) fn task_row(task: &Task) -> String {
    let mut row = format!("[{}] {}  ({})", task.status_mark, task.content, task.id);
    if let Some(due) = task.metadata.due_date.and_then(dates::format_date) {
        row.push_str(&format!("  due {due}"));
    }
    row
}

fn join_or_none(values: &[String]) -> String {
    if values.is_empty() {
        "none".to_string()
    } else {
        values.join(", ")
    }
}
