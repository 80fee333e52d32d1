//! Read-side projections over the repository.
//!
//! Every call takes the read lock once, copies what it needs and releases
//! it. Nothing here caches across calls.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::dates;
use crate::repository::{self, IdSet, IndexSummary, Repository, SharedRepository};
use crate::task::{DateField, ShowType, Task, TaskOrigin, TaskStatus};

/// Applied when a query leaves `limit` unset.
pub const DEFAULT_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateQuery {
    pub date_type: DateField,
    /// Inclusive; open when unset.
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub limit: Option<usize>,
}

impl DateQuery {
    pub fn new(date_type: DateField) -> Self {
        Self {
            date_type,
            from: None,
            to: None,
            limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchField {
    Content,
    Tags,
    Project,
    Context,
}

impl SearchField {
    pub const ALL: [SearchField; 4] = [
        SearchField::Content,
        SearchField::Tags,
        SearchField::Project,
        SearchField::Context,
    ];

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "content" => Some(SearchField::Content),
            "tags" | "tag" => Some(SearchField::Tags),
            "project" => Some(SearchField::Project),
            "context" => Some(SearchField::Context),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub query: String,
    /// Fields to match; all of them when empty.
    #[serde(default)]
    pub search_in: Vec<SearchField>,
    pub limit: Option<usize>,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            search_in: Vec::new(),
            limit: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaxonomyListing {
    pub tags: Vec<String>,
    pub projects: Vec<String>,
    pub contexts: Vec<String>,
}

/// Count of badge-source events on one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BadgeEntry {
    pub source_id: String,
    pub source_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    pub count: usize,
}

#[derive(Debug, Clone)]
pub struct QueryApi {
    repository: SharedRepository,
}

impl QueryApi {
    pub fn new(repository: SharedRepository) -> Self {
        Self { repository }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Repository> {
        repository::read_lock(&self.repository)
    }

    /// Every task, ordered by file and line.
    pub fn get_all_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.read().tasks().cloned().collect();
        sort_by_location(&mut tasks);
        tasks
    }

    pub fn get_task_by_id(&self, id: &str) -> Option<Task> {
        self.read().get_by_id(id)
    }

    /// Tasks whose `date_type` falls within the inclusive day range, sorted
    /// by that date.
    pub fn query_by_date(&self, query: &DateQuery) -> Vec<Task> {
        let from = query.from.unwrap_or(NaiveDate::MIN);
        let to = query.to.unwrap_or(NaiveDate::MAX);
        if from > to {
            return Vec::new();
        }
        let repo = self.read();
        let mut tasks = repo.resolve_ids(repo.ids_for_dates(query.date_type, from..=to));
        drop(repo);
        tasks.sort_by(|a, b| {
            a.date(query.date_type)
                .cmp(&b.date(query.date_type))
                .then_with(|| location(a).cmp(&location(b)))
        });
        truncate(tasks, query.limit)
    }

    pub fn query_by_project(&self, project: &str) -> Vec<Task> {
        self.by_index(|repo| repo.ids_for_project(project))
    }

    pub fn query_by_context(&self, context: &str) -> Vec<Task> {
        let context = context.trim();
        self.by_index(|repo| {
            repo.ids_for_context(context).or_else(|| {
                // `@home` and `home` name the same context
                context
                    .strip_prefix('@')
                    .and_then(|bare| repo.ids_for_context(bare))
            })
        })
    }

    pub fn query_by_priority(&self, priority: u8) -> Vec<Task> {
        self.by_index(|repo| repo.ids_for_priority(priority))
    }

    pub fn query_by_status(&self, status: TaskStatus) -> Vec<Task> {
        self.by_index(|repo| repo.ids_for_status(status))
    }

    /// Tasks carrying all (`match_all`) or any of `tags`.
    pub fn query_by_tags(&self, tags: &[String], match_all: bool) -> Vec<Task> {
        if tags.is_empty() {
            return Vec::new();
        }
        let repo = self.read();
        let sets: Vec<Option<&IdSet>> = tags.iter().map(|tag| repo.ids_for_tag(tag)).collect();
        let ids: BTreeSet<&str> = if match_all {
            if sets.iter().any(Option::is_none) {
                BTreeSet::new()
            } else {
                let mut sets = sets.into_iter().flatten();
                let first: BTreeSet<&str> = sets
                    .next()
                    .map(|set| set.iter().map(String::as_str).collect())
                    .unwrap_or_default();
                sets.fold(first, |acc, set| {
                    acc.into_iter().filter(|id| set.contains(*id)).collect()
                })
            }
        } else {
            sets.into_iter()
                .flatten()
                .flat_map(|set| set.iter().map(String::as_str))
                .collect()
        };
        let mut tasks = repo.resolve_ids(ids);
        drop(repo);
        sort_by_location(&mut tasks);
        tasks
    }

    /// Case-insensitive substring search.
    pub fn search_tasks(&self, query: &SearchQuery) -> Vec<Task> {
        let needle = query.query.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        let fields: &[SearchField] = if query.search_in.is_empty() {
            &SearchField::ALL
        } else {
            &query.search_in
        };
        let contains = |value: &str| value.to_lowercase().contains(&needle);
        let mut tasks: Vec<Task> = self
            .read()
            .tasks()
            .filter(|task| {
                fields.iter().any(|field| match field {
                    SearchField::Content => contains(task.content.as_str()),
                    SearchField::Tags => task.metadata.tags.iter().any(|tag| contains(tag.as_str())),
                    SearchField::Project => {
                        task.metadata.project.as_deref().is_some_and(contains)
                            || task.metadata.effective_project().is_some_and(contains)
                    }
                    SearchField::Context => task.metadata.context.as_deref().is_some_and(contains),
                })
            })
            .cloned()
            .collect();
        sort_by_location(&mut tasks);
        truncate(tasks, query.limit)
    }

    /// Distinct tags, projects and contexts in use, sorted.
    pub fn list_all_tags_projects_contexts(&self) -> TaxonomyListing {
        let mut tags = BTreeSet::new();
        let mut projects = BTreeSet::new();
        let mut contexts = BTreeSet::new();
        for task in self.read().tasks() {
            tags.extend(task.metadata.tags.iter().cloned());
            if let Some(project) = task.metadata.effective_project() {
                projects.insert(project.to_string());
            }
            if let Some(context) = &task.metadata.context {
                contexts.insert(context.clone());
            }
        }
        TaxonomyListing {
            tags: tags.into_iter().collect(),
            projects: projects.into_iter().collect(),
            contexts: contexts.into_iter().collect(),
        }
    }

    /// Open tasks due on `today`.
    pub fn due_today(&self, today: NaiveDate) -> Vec<Task> {
        self.open_due_between(today, today)
    }

    /// Open tasks due before `today`. Calendar events end in the past
    /// without being late, so they are left out.
    pub fn overdue(&self, today: NaiveDate) -> Vec<Task> {
        let Some(yesterday) = today.pred_opt() else {
            return Vec::new();
        };
        self.open_due_between(NaiveDate::MIN, yesterday)
            .into_iter()
            .filter(|task| !task.is_ics())
            .collect()
    }

    /// Open tasks due in the `days` days after `today`.
    pub fn upcoming(&self, today: NaiveDate, days: u64) -> Vec<Task> {
        let (Some(start), Some(end)) = (today.succ_opt(), today.checked_add_days(Days::new(days)))
        else {
            return Vec::new();
        };
        self.open_due_between(start, end)
    }

    /// Calendar events overlapping the inclusive day range. Badge sources
    /// are left out; see [`badge_events_for_date`](Self::badge_events_for_date).
    pub fn calendar_events(&self, from: NaiveDate, to: NaiveDate) -> Vec<Task> {
        let start = dates::local_midnight(from);
        let end = to.succ_opt().and_then(dates::local_midnight);
        let (Some(start), Some(end)) = (start, end) else {
            return Vec::new();
        };
        let mut events: Vec<Task> = self
            .read()
            .tasks()
            .filter(|task| match &task.origin {
                TaskOrigin::Ics {
                    show_type: ShowType::Event,
                    event,
                    ..
                } => {
                    let finish = event.dtend.unwrap_or(event.dtstart).max(event.dtstart + 1);
                    event.dtstart < end && finish > start
                }
                _ => false,
            })
            .cloned()
            .collect();
        events.sort_by(|a, b| {
            a.metadata
                .start_date
                .cmp(&b.metadata.start_date)
                .then_with(|| a.id.cmp(&b.id))
        });
        events
    }

    /// Per-source counts of badge events starting on `date`.
    pub fn badge_events_for_date(&self, date: NaiveDate) -> Vec<BadgeEntry> {
        let mut entries: BTreeMap<String, BadgeEntry> = BTreeMap::new();
        for task in self.read().tasks() {
            let TaskOrigin::Ics {
                source_id,
                source_name,
                show_type: ShowType::Badge,
                color,
                event,
            } = &task.origin
            else {
                continue;
            };
            if dates::local_day(event.dtstart) != Some(date) {
                continue;
            }
            entries
                .entry(source_id.clone())
                .or_insert_with(|| BadgeEntry {
                    source_id: source_id.clone(),
                    source_name: source_name.clone(),
                    color: color.clone(),
                    count: 0,
                })
                .count += 1;
        }
        entries.into_values().collect()
    }

    pub fn summary(&self) -> IndexSummary {
        self.read().summary()
    }

    /// Tasks of one file, in line order.
    pub fn tasks_for_file(&self, file_id: &str) -> Vec<Task> {
        self.read().get_by_file(file_id)
    }

    fn by_index(&self, lookup: impl FnOnce(&Repository) -> Option<&IdSet>) -> Vec<Task> {
        let repo = self.read();
        let mut tasks = lookup(&repo)
            .map(|ids| repo.resolve_ids(ids.iter().map(String::as_str)))
            .unwrap_or_default();
        drop(repo);
        sort_by_location(&mut tasks);
        tasks
    }

    fn open_due_between(&self, from: NaiveDate, to: NaiveDate) -> Vec<Task> {
        let mut query = DateQuery::new(DateField::Due);
        query.from = Some(from);
        query.to = Some(to);
        query.limit = Some(usize::MAX);
        self.query_by_date(&query)
            .into_iter()
            .filter(|task| !task.status.is_closed())
            .collect()
    }
}

fn location(task: &Task) -> (&str, usize) {
    (task.source_path.as_str(), task.line_number)
}

fn sort_by_location(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| location(a).cmp(&location(b)).then_with(|| a.id.cmp(&b.id)));
}

fn truncate(mut tasks: Vec<Task>, limit: Option<usize>) -> Vec<Task> {
    tasks.truncate(limit.unwrap_or(DEFAULT_LIMIT));
    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParserConfig;
    use crate::parser::{FileKind, TaskParser};
    use crate::repository::EntryMeta;
    use crate::task::{IcsEventInfo, TaskMetadata};
    use std::sync::{Arc, RwLock};

    fn day(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").expect("date")
    }

    fn api_with(files: &[(&str, &str)]) -> QueryApi {
        let parser = TaskParser::new(&ParserConfig::default()).expect("parser");
        let mut repo = Repository::new();
        for (file_id, text) in files {
            let output = parser.parse(file_id, text, FileKind::Markdown);
            repo.upsert_file(file_id, output.tasks, EntryMeta::default());
        }
        QueryApi::new(Arc::new(RwLock::new(repo)))
    }

    fn ics_task(source: &str, uid: &str, show_type: ShowType, start: &str) -> Task {
        let dtstart = dates::parse_date(start).expect("start");
        Task {
            id: Task::ics_task_id(source, uid),
            content: uid.to_string(),
            status: TaskStatus::NotStarted,
            status_mark: ' ',
            source_path: Task::ics_source_path(source),
            line_number: 0,
            original_markdown: uid.to_string(),
            metadata: TaskMetadata {
                start_date: Some(dtstart),
                ..TaskMetadata::default()
            },
            readonly: true,
            origin: TaskOrigin::Ics {
                source_id: source.to_string(),
                source_name: source.to_uppercase(),
                show_type,
                color: Some("#f00".to_string()),
                event: IcsEventInfo {
                    uid: uid.to_string(),
                    description: None,
                    location: None,
                    dtstart,
                    dtend: Some(dtstart + 3_600_000),
                    all_day: false,
                },
            },
        }
    }

    const NOTES: &str = "\
- [ ] Write report 📅 2024-01-20 #work @office
- [x] Pay rent 📅 2024-01-01 #home
- [ ] Plan trip 📅 2024-01-10 #home #travel 🔼
- [ ] Read book
";

    #[test]
    fn date_range_is_inclusive_and_sorted() {
        let api = api_with(&[("notes.md", NOTES)]);
        let query = DateQuery {
            date_type: DateField::Due,
            from: Some(day("2024-01-01")),
            to: Some(day("2024-01-10")),
            limit: None,
        };
        let contents: Vec<String> = api
            .query_by_date(&query)
            .into_iter()
            .map(|task| task.content)
            .collect();
        assert!(contents[0].starts_with("Pay rent"));
        assert!(contents[1].starts_with("Plan trip"));
        assert_eq!(contents.len(), 2);

        let mut backwards = query.clone();
        backwards.from = Some(day("2024-02-01"));
        assert!(api.query_by_date(&backwards).is_empty());
    }

    #[test]
    fn tags_match_any_or_all() {
        let api = api_with(&[("notes.md", NOTES)]);
        let home = vec!["home".to_string(), "travel".to_string()];
        assert_eq!(api.query_by_tags(&home, false).len(), 2);
        assert_eq!(api.query_by_tags(&home, true).len(), 1);
        assert!(api
            .query_by_tags(&["home".to_string(), "missing".to_string()], true)
            .is_empty());
        assert_eq!(api.query_by_tags(&["#HOME".to_string()], false).len(), 2);
    }

    #[test]
    fn search_and_listings() {
        let api = api_with(&[("notes.md", NOTES)]);
        assert_eq!(api.search_tasks(&SearchQuery::new("REPORT")).len(), 1);
        let mut by_tag = SearchQuery::new("trav");
        by_tag.search_in = vec![SearchField::Tags];
        assert_eq!(api.search_tasks(&by_tag).len(), 1);
        by_tag.search_in = vec![SearchField::Content];
        assert!(api.search_tasks(&by_tag).is_empty());

        let listing = api.list_all_tags_projects_contexts();
        assert_eq!(listing.tags, vec!["home", "travel", "work"]);
        assert_eq!(listing.contexts, vec!["office"]);
        assert_eq!(api.query_by_context("@office").len(), 1);
        assert_eq!(api.query_by_priority(3).len(), 1);
        assert_eq!(api.query_by_status(TaskStatus::Completed).len(), 1);
    }

    #[test]
    fn due_buckets_skip_closed_tasks() {
        let api = api_with(&[("notes.md", NOTES)]);
        let today = day("2024-01-10");
        assert_eq!(api.due_today(today).len(), 1);
        // Pay rent is completed, so nothing is overdue
        assert!(api.overdue(today).is_empty());
        assert_eq!(api.upcoming(today, 10).len(), 1);
        assert!(api.upcoming(today, 5).is_empty());
    }

    #[test]
    fn past_calendar_events_are_not_overdue() {
        let api = api_with(&[("notes.md", NOTES)]);
        let mut meeting = ics_task("team", "a", ShowType::Event, "2024-01-03 09:00");
        meeting.metadata.due_date = dates::parse_date("2024-01-03 10:00");
        repository::write_lock(&api.repository).upsert_file(
            "ics://team",
            vec![meeting],
            EntryMeta::default(),
        );

        let today = day("2024-01-10");
        assert!(api.overdue(today).is_empty());
        assert_eq!(api.due_today(day("2024-01-03")).len(), 1);
    }

    #[test]
    fn badge_sources_are_counted_not_listed() {
        let api = api_with(&[]);
        {
            let mut repo = repository::write_lock(&api.repository);
            repo.upsert_file(
                "ics://team",
                vec![
                    ics_task("team", "a", ShowType::Event, "2024-03-01 09:00"),
                    ics_task("team", "b", ShowType::Event, "2024-03-05 09:00"),
                ],
                EntryMeta::default(),
            );
            repo.upsert_file(
                "ics://holidays",
                vec![
                    ics_task("holidays", "x", ShowType::Badge, "2024-03-01 08:00"),
                    ics_task("holidays", "y", ShowType::Badge, "2024-03-01 12:00"),
                ],
                EntryMeta::default(),
            );
        }

        let events = api.calendar_events(day("2024-03-01"), day("2024-03-02"));
        let ids: Vec<&str> = events.iter().map(|task| task.id.as_str()).collect();
        assert_eq!(ids, vec!["ics:team:a"]);

        let badges = api.badge_events_for_date(day("2024-03-01"));
        assert_eq!(badges.len(), 1);
        assert_eq!(badges[0].source_id, "holidays");
        assert_eq!(badges[0].count, 2);
        assert!(api.badge_events_for_date(day("2024-03-02")).is_empty());
    }
}
