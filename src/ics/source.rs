//! Per-source refresh and event mapping.
//!
//! Each configured source moves through `idle -> fetching -> parsed|failed`.
//! A refresh never touches the index directly: it yields an [`IcsUpdate`]
//! that the index worker applies. A failed refresh leaves the previous
//! snapshot in place.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{IcsConfig, IcsSource, ReplacementTarget};
use crate::diagnostic::{Diagnostic, DiagnosticKind};
use crate::error::{Error, Result};
use crate::ics::fetch::{FetchRequest, FetchResponse, Fetcher};
use crate::ics::normalize_url;
use crate::ics::parser::{self, IcsEvent};
use crate::task::{
    IcsEventInfo, ProjectSource, ResolvedProject, Task, TaskMetadata, TaskOrigin, TaskStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Idle,
    Fetching,
    Parsed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceStatus {
    pub source_id: String,
    pub state: SourceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub event_count: usize,
    #[serde(skip)]
    etag: Option<String>,
    #[serde(skip)]
    last_modified: Option<String>,
}

impl SourceStatus {
    fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            state: SourceState::Idle,
            last_attempt: None,
            last_success: None,
            last_error: None,
            event_count: 0,
            etag: None,
            last_modified: None,
        }
    }
}

/// A complete, freshly parsed view of one feed.
#[derive(Debug, Clone)]
pub struct IcsSnapshot {
    pub source_id: String,
    /// `ics://<source_id>`, the file id the tasks are stored under.
    pub file_id: String,
    pub tasks: Vec<Task>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Outcome of one refresh, for the index worker to apply.
#[derive(Debug, Clone)]
pub enum IcsUpdate {
    Snapshot(IcsSnapshot),
    /// 304: the stored snapshot is still current.
    NotModified { source_id: String },
    Failed { source_id: String, message: String },
}

impl IcsUpdate {
    pub fn source_id(&self) -> &str {
        match self {
            IcsUpdate::Snapshot(snapshot) => &snapshot.source_id,
            IcsUpdate::NotModified { source_id } | IcsUpdate::Failed { source_id, .. } => {
                source_id
            }
        }
    }
}

#[derive(Debug)]
struct PreparedSource {
    source: IcsSource,
    url: String,
    replacements: Vec<(Regex, String, ReplacementTarget)>,
}

/// Refreshes configured feeds through a [`Fetcher`].
pub struct IcsSourceRunner {
    sources: Vec<PreparedSource>,
    fetcher: Arc<dyn Fetcher>,
    timeout: Duration,
    max_events: usize,
    statuses: Mutex<HashMap<String, SourceStatus>>,
}

impl std::fmt::Debug for IcsSourceRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IcsSourceRunner")
            .field("sources", &self.sources.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl IcsSourceRunner {
    pub fn new(config: &IcsConfig, fetcher: Arc<dyn Fetcher>) -> Result<Self> {
        let mut sources = Vec::with_capacity(config.sources.len());
        let mut statuses = HashMap::new();
        for source in &config.sources {
            let url = normalize_url(&source.url)?;
            let mut replacements = Vec::with_capacity(source.text_replacements.len());
            for replacement in &source.text_replacements {
                replacements.push((
                    Regex::new(&replacement.pattern)?,
                    replacement.replacement.clone(),
                    replacement.target,
                ));
            }
            statuses.insert(source.id.clone(), SourceStatus::new(&source.id));
            sources.push(PreparedSource {
                source: source.clone(),
                url,
                replacements,
            });
        }
        Ok(Self {
            sources,
            fetcher,
            timeout: Duration::from_secs(config.timeout_seconds),
            max_events: config.max_events_per_source,
            statuses: Mutex::new(statuses),
        })
    }

    /// Enabled sources, in configuration order.
    pub fn enabled_sources(&self) -> impl Iterator<Item = &IcsSource> {
        self.sources
            .iter()
            .map(|prepared| &prepared.source)
            .filter(|source| source.enabled)
    }

    pub fn source(&self, source_id: &str) -> Option<&IcsSource> {
        self.prepared(source_id).map(|prepared| &prepared.source)
    }

    pub fn status(&self, source_id: &str) -> Option<SourceStatus> {
        self.lock_statuses().get(source_id).cloned()
    }

    pub fn statuses(&self) -> Vec<SourceStatus> {
        let statuses = self.lock_statuses();
        self.sources
            .iter()
            .filter_map(|prepared| statuses.get(&prepared.source.id).cloned())
            .collect()
    }

    /// Refresh every enabled source, one after another.
    pub async fn refresh_all(&self) -> Vec<IcsUpdate> {
        let ids: Vec<String> = self.enabled_sources().map(|source| source.id.clone()).collect();
        let mut updates = Vec::with_capacity(ids.len());
        for id in ids {
            match self.refresh(&id).await {
                Ok(update) => updates.push(update),
                Err(err) => warn!(source = %id, error = %err, "calendar refresh skipped"),
            }
        }
        updates
    }

    /// Fetch, parse and map one source. Fetch problems come back as
    /// [`IcsUpdate::Failed`]; only an unknown or disabled id is an `Err`.
    pub async fn refresh(&self, source_id: &str) -> Result<IcsUpdate> {
        let prepared = self
            .prepared(source_id)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown calendar source '{source_id}'")))?;
        if !prepared.source.enabled {
            return Err(Error::InvalidArgument(format!(
                "calendar source '{source_id}' is disabled"
            )));
        }

        let request = {
            let mut statuses = self.lock_statuses();
            let status = statuses
                .entry(source_id.to_string())
                .or_insert_with(|| SourceStatus::new(source_id));
            status.state = SourceState::Fetching;
            status.last_attempt = Some(Utc::now());
            FetchRequest {
                source_id: source_id.to_string(),
                url: prepared.url.clone(),
                headers: prepared.source.headers.clone(),
                username: prepared.source.username.clone(),
                password: prepared.source.password.clone(),
                etag: status.etag.clone(),
                last_modified: status.last_modified.clone(),
            }
        };

        debug!(source = %source_id, url = %request.url, "fetching calendar");
        let fetched = match tokio::time::timeout(self.timeout, self.fetcher.fetch(&request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Fetch {
                source_id: source_id.to_string(),
                message: format!("timed out after {}s", self.timeout.as_secs()),
            }),
        };

        match fetched {
            Ok(FetchResponse::NotModified) => {
                self.update_status(source_id, |status| {
                    status.state = SourceState::Parsed;
                    status.last_success = Some(Utc::now());
                    status.last_error = None;
                });
                debug!(source = %source_id, "calendar not modified");
                Ok(IcsUpdate::NotModified {
                    source_id: source_id.to_string(),
                })
            }
            Ok(FetchResponse::Body {
                body,
                etag,
                last_modified,
            }) => {
                let snapshot = self.build_snapshot(prepared, &body);
                let count = snapshot.tasks.len();
                self.update_status(source_id, |status| {
                    status.state = SourceState::Parsed;
                    status.last_success = Some(Utc::now());
                    status.last_error = None;
                    status.event_count = count;
                    status.etag = etag;
                    status.last_modified = last_modified;
                });
                info!(source = %source_id, events = count, "calendar refreshed");
                Ok(IcsUpdate::Snapshot(snapshot))
            }
            Err(err) => {
                let message = match &err {
                    Error::Fetch { message, .. } => message.clone(),
                    other => other.to_string(),
                };
                self.update_status(source_id, |status| {
                    status.state = SourceState::Failed;
                    status.last_error = Some(message.clone());
                });
                warn!(source = %source_id, error = %message, "calendar fetch failed");
                Ok(IcsUpdate::Failed {
                    source_id: source_id.to_string(),
                    message,
                })
            }
        }
    }

    /// Start one interval task per enabled source. The first tick fires
    /// after one full interval; `deliver` receives every outcome.
    pub fn spawn_timers<F>(self: &Arc<Self>, deliver: F) -> Vec<JoinHandle<()>>
    where
        F: Fn(IcsUpdate) + Send + Sync + 'static,
    {
        let deliver = Arc::new(deliver);
        self.enabled_sources()
            .map(|source| {
                let runner = Arc::clone(self);
                let deliver = Arc::clone(&deliver);
                let source_id = source.id.clone();
                let period = Duration::from_secs(source.refresh_interval_seconds.max(1));
                tokio::spawn(async move {
                    let mut ticker = interval_at(Instant::now() + period, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        ticker.tick().await;
                        match runner.refresh(&source_id).await {
                            Ok(update) => deliver(update),
                            Err(err) => {
                                warn!(source = %source_id, error = %err, "calendar timer stopped");
                                break;
                            }
                        }
                    }
                })
            })
            .collect()
    }

    fn build_snapshot(&self, prepared: &PreparedSource, body: &str) -> IcsSnapshot {
        let source = &prepared.source;
        let file_id = Task::ics_source_path(&source.id);
        let calendar = parser::parse(body);
        let diagnostics = calendar
            .errors
            .iter()
            .map(|error| {
                Diagnostic::new(DiagnosticKind::Parse, file_id.clone(), error.message.clone())
                    .at_line(error.line)
            })
            .collect();

        let mut events: Vec<IcsEvent> = calendar
            .events
            .into_iter()
            .filter(|event| {
                if event.all_day {
                    source.show_all_day_events
                } else {
                    source.show_timed_events
                }
            })
            .filter(|event| passes_keyword_filters(source, event))
            .map(|mut event| {
                apply_replacements(&prepared.replacements, &mut event);
                event
            })
            .collect();
        events.sort_by_key(|event| event.dtstart);
        if self.max_events > 0 {
            events.truncate(self.max_events);
        }

        IcsSnapshot {
            source_id: source.id.clone(),
            tasks: events.iter().map(|event| event_to_task(source, event)).collect(),
            file_id,
            diagnostics,
        }
    }

    fn prepared(&self, source_id: &str) -> Option<&PreparedSource> {
        self.sources
            .iter()
            .find(|prepared| prepared.source.id == source_id)
    }

    fn lock_statuses(&self) -> std::sync::MutexGuard<'_, HashMap<String, SourceStatus>> {
        self.statuses.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update_status(&self, source_id: &str, update: impl FnOnce(&mut SourceStatus)) {
        let mut statuses = self.lock_statuses();
        let status = statuses
            .entry(source_id.to_string())
            .or_insert_with(|| SourceStatus::new(source_id));
        update(status);
    }
}

fn passes_keyword_filters(source: &IcsSource, event: &IcsEvent) -> bool {
    let haystack = format!(
        "{}\n{}\n{}",
        event.summary,
        event.description.as_deref().unwrap_or(""),
        event.location.as_deref().unwrap_or("")
    )
    .to_lowercase();
    let contains = |keyword: &String| {
        let keyword = keyword.trim().to_lowercase();
        !keyword.is_empty() && haystack.contains(&keyword)
    };
    if source.filters.exclude.iter().any(contains) {
        return false;
    }
    source.filters.include.is_empty() || source.filters.include.iter().any(contains)
}

fn apply_replacements(replacements: &[(Regex, String, ReplacementTarget)], event: &mut IcsEvent) {
    for (pattern, replacement, target) in replacements {
        let field = match target {
            ReplacementTarget::Summary => Some(&mut event.summary),
            ReplacementTarget::Description => event.description.as_mut(),
            ReplacementTarget::Location => event.location.as_mut(),
        };
        if let Some(field) = field {
            let replaced = pattern.replace_all(field, replacement.as_str()).into_owned();
            *field = replaced;
        }
    }
}

/// Project one event onto a readonly task.
pub fn event_to_task(source: &IcsSource, event: &IcsEvent) -> Task {
    let status = if event.is_cancelled() {
        TaskStatus::Abandoned
    } else {
        TaskStatus::NotStarted
    };
    let metadata = TaskMetadata {
        tags: event.categories.clone(),
        project: Some(source.name.clone()),
        resolved_project: Some(ResolvedProject {
            name: source.name.clone(),
            source: ProjectSource::Explicit,
        }),
        context: event.location.clone(),
        start_date: Some(event.dtstart),
        scheduled_date: Some(event.dtstart),
        due_date: Some(event.dtend),
        recurrence: event.rrule.clone(),
        ..TaskMetadata::default()
    };
    Task {
        id: Task::ics_task_id(&source.id, &event.uid),
        content: event.summary.clone(),
        status,
        status_mark: if status == TaskStatus::Abandoned { '-' } else { ' ' },
        source_path: Task::ics_source_path(&source.id),
        line_number: 0,
        original_markdown: event.summary.clone(),
        metadata,
        readonly: true,
        origin: TaskOrigin::Ics {
            source_id: source.id.clone(),
            source_name: source.name.clone(),
            show_type: source.show_type,
            color: source.color.clone(),
            event: IcsEventInfo {
                uid: event.uid.clone(),
                description: event.description.clone(),
                location: event.location.clone(),
                dtstart: event.dtstart,
                dtend: Some(event.dtend),
                all_day: event.all_day,
            },
        },
    }
}
