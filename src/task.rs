//! Canonical task model.
//!
//! A [`Task`] is one actionable record, either a checkbox line in a Markdown
//! file or an event from a calendar feed. Both share the same projection; the
//! difference lives in [`TaskOrigin`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dates;

/// URI scheme used as the synthetic source path of calendar-backed tasks.
pub const ICS_URI_SCHEME: &str = "ics://";

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    NotStarted,
    InProgress,
    Completed,
    Abandoned,
    Planned,
    /// A checkbox mark that is not mapped to any known status.
    Other(char),
}

impl TaskStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, TaskStatus::Completed)
    }

    /// Completed or abandoned.
    pub fn is_closed(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Abandoned)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::NotStarted => "not_started",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Abandoned => "abandoned",
            TaskStatus::Planned => "planned",
            TaskStatus::Other(_) => "other",
        }
    }

    /// Parse a user-facing status name. Accepts a few common aliases.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "not_started" | "todo" | "open" => Some(TaskStatus::NotStarted),
            "in_progress" | "doing" | "started" => Some(TaskStatus::InProgress),
            "completed" | "done" | "closed" => Some(TaskStatus::Completed),
            "abandoned" | "cancelled" | "canceled" => Some(TaskStatus::Abandoned),
            "planned" | "question" => Some(TaskStatus::Planned),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Other(mark) => write!(f, "other({mark})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// The date-valued metadata fields a task can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateField {
    Start,
    Due,
    Scheduled,
    Completed,
    Cancelled,
    Created,
}

impl DateField {
    pub const ALL: [DateField; 6] = [
        DateField::Start,
        DateField::Due,
        DateField::Scheduled,
        DateField::Completed,
        DateField::Cancelled,
        DateField::Created,
    ];

    pub fn get(&self, metadata: &TaskMetadata) -> Option<i64> {
        match self {
            DateField::Start => metadata.start_date,
            DateField::Due => metadata.due_date,
            DateField::Scheduled => metadata.scheduled_date,
            DateField::Completed => metadata.completed_date,
            DateField::Cancelled => metadata.cancelled_date,
            DateField::Created => metadata.created_date,
        }
    }

    pub fn slot<'a>(&self, metadata: &'a mut TaskMetadata) -> &'a mut Option<i64> {
        match self {
            DateField::Start => &mut metadata.start_date,
            DateField::Due => &mut metadata.due_date,
            DateField::Scheduled => &mut metadata.scheduled_date,
            DateField::Completed => &mut metadata.completed_date,
            DateField::Cancelled => &mut metadata.cancelled_date,
            DateField::Created => &mut metadata.created_date,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DateField::Start => "start",
            DateField::Due => "due",
            DateField::Scheduled => "scheduled",
            DateField::Completed => "completed",
            DateField::Cancelled => "cancelled",
            DateField::Created => "created",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "start" | "startdate" | "start_date" => Some(DateField::Start),
            "due" | "duedate" | "due_date" => Some(DateField::Due),
            "scheduled" | "scheduleddate" | "scheduled_date" => Some(DateField::Scheduled),
            "completed" | "completion" | "completeddate" | "completed_date" => {
                Some(DateField::Completed)
            }
            "cancelled" | "cancelleddate" | "cancelled_date" => Some(DateField::Cancelled),
            "created" | "createddate" | "created_date" => Some(DateField::Created),
            _ => None,
        }
    }
}

/// Which resolution mechanism produced a task's effective project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectSource {
    Explicit,
    ConfigFile,
    Metadata,
    PathMapping,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedProject {
    pub name: String,
    pub source: ProjectSource,
}

/// Closed set of documented metadata keys, plus `extra` for everything else.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_project: Option<ResolvedProject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_date: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_date: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_date: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_date: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_completion: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Author-assigned id (`🆔` / `[id:: ...]`), distinct from [`Task::id`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Trailing block anchor without the leading `^`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub heading: Vec<String>,
    /// Keys copied from frontmatter or project config files.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inherited: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl TaskMetadata {
    /// Effective project: resolved if available, explicit otherwise.
    pub fn effective_project(&self) -> Option<&str> {
        self.resolved_project
            .as_ref()
            .map(|resolved| resolved.name.as_str())
            .or(self.project.as_deref())
    }
}

/// Presentation hint for calendar sources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShowType {
    #[default]
    Event,
    Badge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IcsEventInfo {
    pub uid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub dtstart: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtend: Option<i64>,
    pub all_day: bool,
}

/// Where a task came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskOrigin {
    File,
    Ics {
        source_id: String,
        source_name: String,
        show_type: ShowType,
        #[serde(skip_serializing_if = "Option::is_none")]
        color: Option<String>,
        event: IcsEventInfo,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub content: String,
    pub status: TaskStatus,
    pub status_mark: char,
    pub source_path: String,
    /// 1-based; `0` for calendar tasks. Only valid for the last indexed
    /// version of the file.
    pub line_number: usize,
    pub original_markdown: String,
    pub metadata: TaskMetadata,
    pub readonly: bool,
    pub origin: TaskOrigin,
}

impl Task {
    pub fn file_task_id(source_path: &str, line_number: usize) -> String {
        format!("{source_path}:L{line_number}")
    }

    pub fn ics_task_id(source_id: &str, uid: &str) -> String {
        format!("ics:{source_id}:{uid}")
    }

    pub fn ics_source_path(source_id: &str) -> String {
        format!("{ICS_URI_SCHEME}{source_id}")
    }

    pub fn completed(&self) -> bool {
        self.status.is_completed()
    }

    pub fn is_ics(&self) -> bool {
        matches!(self.origin, TaskOrigin::Ics { .. })
    }

    pub fn ics_source_id(&self) -> Option<&str> {
        match &self.origin {
            TaskOrigin::Ics { source_id, .. } => Some(source_id.as_str()),
            TaskOrigin::File => None,
        }
    }

    pub fn date(&self, field: DateField) -> Option<i64> {
        field.get(&self.metadata)
    }

    /// Calendar day of a date field in local time.
    pub fn day(&self, field: DateField) -> Option<chrono::NaiveDate> {
        self.date(field).and_then(dates::local_day)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_is_a_view_over_status() {
        let mut metadata = TaskMetadata::default();
        metadata.due_date = dates::parse_date("2024-01-20");
        let mut task = Task {
            id: Task::file_task_id("notes/a.md", 3),
            content: "Write report".to_string(),
            status: TaskStatus::NotStarted,
            status_mark: ' ',
            source_path: "notes/a.md".to_string(),
            line_number: 3,
            original_markdown: "- [ ] Write report".to_string(),
            metadata,
            readonly: false,
            origin: TaskOrigin::File,
        };
        assert!(!task.completed());
        task.status = TaskStatus::Completed;
        assert!(task.completed());
        assert_eq!(task.id, "notes/a.md:L3");
        assert_eq!(
            task.day(DateField::Due),
            chrono::NaiveDate::from_ymd_opt(2024, 1, 20)
        );
    }

    #[test]
    fn status_aliases_parse() {
        assert_eq!(TaskStatus::parse("done"), Some(TaskStatus::Completed));
        assert_eq!(TaskStatus::parse("Cancelled"), Some(TaskStatus::Abandoned));
        assert_eq!(TaskStatus::parse("todo"), Some(TaskStatus::NotStarted));
        assert_eq!(TaskStatus::parse("bogus"), None);
    }

    #[test]
    fn origin_serializes_as_tagged_union() {
        let origin = TaskOrigin::Ics {
            source_id: "work".to_string(),
            source_name: "Work".to_string(),
            show_type: ShowType::Badge,
            color: None,
            event: IcsEventInfo {
                uid: "abc".to_string(),
                description: None,
                location: None,
                dtstart: 0,
                dtend: None,
                all_day: true,
            },
        };
        let value = serde_json::to_value(&origin).expect("serialize");
        assert_eq!(value["type"], "ics");
        assert_eq!(value["show_type"], "badge");
        assert_eq!(Task::ics_task_id("work", "abc"), "ics:work:abc");
        assert_eq!(Task::ics_source_path("work"), "ics://work");
    }
}
