//! The index worker.
//!
//! One task owns the [`Indexer`] and is the only writer of the repository.
//! Everything that changes the index (watcher events, write confirmations,
//! calendar snapshots, rebuilds) arrives as a message and is applied in
//! arrival order.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::ProjectConfig;
use crate::diagnostic::{Diagnostic, DiagnosticKind, DiagnosticLog};
use crate::error::{Error, Result};
use crate::events::{EventBus, EventKind};
use crate::ics::{IcsSourceRunner, IcsUpdate};
use crate::indexer::Indexer;
use crate::rebuild::{RebuildContext, RebuildController, RebuildOutcome};
use crate::repository::{self, ChangeSet, EntryMeta, SharedRepository};
use crate::task::{Task, ICS_URI_SCHEME};
use crate::version::VersionManager;

pub(crate) enum WorkerMessage {
    /// A corpus path changed on disk; re-index or remove it.
    FileChanged(String),
    ProcessNow {
        file_id: String,
        reply: oneshot::Sender<Result<ChangeSet>>,
    },
    Ics {
        update: IcsUpdate,
        reply: Option<oneshot::Sender<()>>,
    },
    Rebuild {
        reason: String,
        /// Completed rebuilds observed by the caller when asking.
        seen: u64,
        /// Write the version record once the rebuild succeeds.
        record_version: bool,
        reply: oneshot::Sender<Result<RebuildOutcome>>,
    },
    Reconfigure {
        config: ProjectConfig,
        reply: oneshot::Sender<Result<usize>>,
    },
    Shutdown,
}

/// Cloneable sender side of the worker.
#[derive(Clone)]
pub struct IndexHandle {
    sender: mpsc::UnboundedSender<WorkerMessage>,
    rebuilds: Arc<RebuildController>,
}

impl std::fmt::Debug for IndexHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexHandle")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

impl IndexHandle {
    pub(crate) fn new(
        sender: mpsc::UnboundedSender<WorkerMessage>,
        rebuilds: Arc<RebuildController>,
    ) -> Self {
        Self { sender, rebuilds }
    }

    fn send(&self, message: WorkerMessage) -> Result<()> {
        self.sender.send(message).map_err(|_| Error::ChannelClosed)
    }

    /// Queue a re-index of `file_id` without waiting for it.
    pub fn file_changed(&self, file_id: impl Into<String>) -> Result<()> {
        self.send(WorkerMessage::FileChanged(file_id.into()))
    }

    /// Re-index `file_id` and wait for the resulting change set.
    pub async fn process_now(&self, file_id: &str) -> Result<ChangeSet> {
        let (reply, response) = oneshot::channel();
        self.send(WorkerMessage::ProcessNow {
            file_id: file_id.to_string(),
            reply,
        })?;
        response.await.map_err(|_| Error::ChannelClosed)?
    }

    /// Queue a calendar update without waiting for it.
    pub fn deliver_ics(&self, update: IcsUpdate) -> Result<()> {
        self.send(WorkerMessage::Ics {
            update,
            reply: None,
        })
    }

    /// Apply a calendar update and wait until it is visible.
    pub async fn apply_ics(&self, update: IcsUpdate) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.send(WorkerMessage::Ics {
            update,
            reply: Some(reply),
        })?;
        response.await.map_err(|_| Error::ChannelClosed)
    }

    /// Request a rebuild. A request that a rebuild started after it was
    /// issued already satisfies comes back [`RebuildOutcome::Coalesced`].
    pub async fn rebuild(&self, reason: &str) -> Result<RebuildOutcome> {
        self.request_rebuild(reason, true).await
    }

    /// Full scan that leaves the version record alone.
    pub async fn scan(&self, reason: &str) -> Result<RebuildOutcome> {
        self.request_rebuild(reason, false).await
    }

    async fn request_rebuild(&self, reason: &str, record_version: bool) -> Result<RebuildOutcome> {
        let seen = self.rebuilds.completed_count();
        let (reply, response) = oneshot::channel();
        self.send(WorkerMessage::Rebuild {
            reason: reason.to_string(),
            seen,
            record_version,
            reply,
        })?;
        response.await.map_err(|_| Error::ChannelClosed)?
    }

    /// Swap the project configuration and re-resolve every indexed file.
    /// Returns the number of files whose tasks changed.
    pub async fn reconfigure_projects(&self, config: ProjectConfig) -> Result<usize> {
        let (reply, response) = oneshot::channel();
        self.send(WorkerMessage::Reconfigure { config, reply })?;
        response.await.map_err(|_| Error::ChannelClosed)?
    }

    /// Ask the worker to stop after the messages already queued.
    pub fn shutdown(&self) {
        let _ = self.sender.send(WorkerMessage::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

pub(crate) struct Worker {
    pub indexer: Indexer,
    pub repository: SharedRepository,
    pub events: EventBus,
    pub rebuilds: Arc<RebuildController>,
    pub version: Arc<VersionManager>,
    pub ics: Arc<IcsSourceRunner>,
    pub diagnostics: DiagnosticLog,
}

impl Worker {
    pub(crate) async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<WorkerMessage>) {
        info!("index worker started");
        while let Some(message) = receiver.recv().await {
            match message {
                WorkerMessage::FileChanged(file_id) => {
                    if let Err(err) = self.process_file(&file_id).await {
                        debug!(file = %file_id, error = %err, "file change not applied");
                    }
                }
                WorkerMessage::ProcessNow { file_id, reply } => {
                    let result = self.process_file(&file_id).await;
                    let _ = reply.send(result);
                }
                WorkerMessage::Ics { update, reply } => {
                    self.apply_ics(update);
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                }
                WorkerMessage::Rebuild {
                    reason,
                    seen,
                    record_version,
                    reply,
                } => {
                    let result = self.rebuild(&reason, seen, record_version).await;
                    let _ = reply.send(result);
                }
                WorkerMessage::Reconfigure { config, reply } => {
                    let result = self.reconfigure(config);
                    let _ = reply.send(result);
                }
                WorkerMessage::Shutdown => break,
            }
        }
        info!("index worker stopped");
    }

    fn generation(&self) -> u64 {
        repository::read_lock(&self.repository).generation()
    }

    /// Re-index one corpus path, removing it from the index when it is gone.
    /// Unreadable files keep their previous entries.
    pub(crate) async fn process_file(&mut self, file_id: &str) -> Result<ChangeSet> {
        if self.indexer.is_config_file(file_id) {
            self.indexer.invalidate_config(file_id);
            let dir = parent_dir(file_id).to_string();
            let touched = self.reresolve_where(|candidate| in_dir(candidate, &dir));
            debug!(config = %file_id, files = touched, "project config changed");
        }
        if !self.indexer.storage().is_corpus_file(file_id) {
            let known = repository::read_lock(&self.repository)
                .entry(file_id)
                .is_some();
            if known {
                return Ok(self.remove_file(file_id));
            }
            return Ok(ChangeSet::empty(file_id));
        }

        match self.indexer.load(file_id).await {
            Ok(file) => {
                self.indexer.remember(&file);
                let generation = self.generation();
                for diagnostic in &file.diagnostics {
                    self.events.emit(EventKind::Diagnostic, generation, diagnostic);
                }
                self.diagnostics
                    .replace_source(file_id, file.diagnostics.iter().cloned());
                let changes = repository::write_lock(&self.repository).upsert_file(
                    &file.file_id,
                    file.tasks,
                    file.meta,
                );
                if !changes.is_empty() {
                    debug!(file = %file_id, changes = changes.len(), "file re-indexed");
                    self.events
                        .emit(EventKind::TasksChanged, self.generation(), &changes);
                }
                Ok(changes)
            }
            Err(Error::FileNotFound(_)) => Ok(self.remove_file(file_id)),
            Err(err) => {
                warn!(file = %file_id, error = %err, "file unreadable, keeping previous entries");
                let diagnostic = Diagnostic::new(DiagnosticKind::Read, file_id, err.to_string());
                self.events
                    .emit(EventKind::Diagnostic, self.generation(), &diagnostic);
                self.diagnostics.replace_source(file_id, [diagnostic]);
                Err(err)
            }
        }
    }

    fn remove_file(&mut self, file_id: &str) -> ChangeSet {
        self.indexer.forget(file_id);
        self.diagnostics.replace_source(file_id, Vec::new());
        let changes = repository::write_lock(&self.repository).remove_file(file_id);
        if !changes.is_empty() {
            debug!(file = %file_id, removed = changes.removed.len(), "file removed from index");
            let generation = self.generation();
            self.events.emit(EventKind::FileRemoved, generation, &changes);
            self.events.emit(EventKind::TasksChanged, generation, &changes);
        }
        changes
    }

    /// Re-run project resolution for indexed corpus files matching `filter`.
    fn reresolve_where(&mut self, filter: impl Fn(&str) -> bool) -> usize {
        let file_ids: Vec<String> = repository::read_lock(&self.repository)
            .file_ids()
            .filter(|file_id| !file_id.starts_with(ICS_URI_SCHEME) && filter(file_id))
            .map(str::to_string)
            .collect();
        let mut touched = 0;
        for file_id in file_ids {
            let (mut tasks, meta) = {
                let repo = repository::read_lock(&self.repository);
                let meta = repo
                    .entry(&file_id)
                    .map(|entry| EntryMeta {
                        content_hash: entry.content_hash.clone(),
                        mtime: entry.mtime,
                    })
                    .unwrap_or_default();
                (repo.get_by_file(&file_id), meta)
            };
            self.indexer.reresolve(&file_id, &mut tasks);
            let changes =
                repository::write_lock(&self.repository).upsert_file(&file_id, tasks, meta);
            if !changes.is_empty() {
                touched += 1;
                self.events
                    .emit(EventKind::TasksChanged, self.generation(), &changes);
            }
        }
        touched
    }

    fn reconfigure(&mut self, config: ProjectConfig) -> Result<usize> {
        self.indexer.reconfigure(config)?;
        let touched = self.reresolve_where(|_| true);
        info!(files = touched, "project configuration replaced");
        Ok(touched)
    }

    fn apply_ics(&mut self, update: IcsUpdate) {
        match update {
            IcsUpdate::Snapshot(snapshot) => {
                let events = snapshot.tasks.len();
                let changes = repository::write_lock(&self.repository).upsert_file(
                    &snapshot.file_id,
                    snapshot.tasks,
                    EntryMeta::default(),
                );
                let generation = self.generation();
                for diagnostic in &snapshot.diagnostics {
                    self.events.emit(EventKind::Diagnostic, generation, diagnostic);
                }
                self.diagnostics
                    .replace_source(&snapshot.file_id, snapshot.diagnostics);
                info!(source = %snapshot.source_id, events, "calendar updated");
                self.events.emit(
                    EventKind::IcsUpdated,
                    generation,
                    serde_json::json!({
                        "source_id": snapshot.source_id,
                        "events": events,
                        "changes": &changes,
                    }),
                );
                if !changes.is_empty() {
                    self.events.emit(EventKind::TasksChanged, generation, &changes);
                }
            }
            IcsUpdate::NotModified { source_id } => {
                debug!(source = %source_id, "calendar not modified");
            }
            IcsUpdate::Failed { source_id, message } => {
                let generation = self.generation();
                let diagnostic = Diagnostic::new(
                    DiagnosticKind::Fetch,
                    Task::ics_source_path(&source_id),
                    message.clone(),
                );
                self.events.emit(EventKind::Diagnostic, generation, &diagnostic);
                let source = diagnostic.source.clone();
                self.diagnostics.replace_source(&source, [diagnostic]);
                self.events.emit(
                    EventKind::IcsFailed,
                    generation,
                    serde_json::json!({ "source_id": source_id, "message": message }),
                );
            }
        }
    }

    /// Rebuild unless a rebuild finished after the caller asked; then refresh
    /// calendars and, when asked to, record the processed version.
    pub(crate) async fn rebuild(
        &mut self,
        reason: &str,
        seen: u64,
        record_version: bool,
    ) -> Result<RebuildOutcome> {
        if self.rebuilds.is_covered(seen) {
            debug!(reason, "rebuild request coalesced");
            return Ok(RebuildOutcome::Coalesced);
        }
        let ics = Arc::clone(&self.ics);
        let keep_source = move |source_id: &str| {
            ics.source(source_id)
                .is_some_and(|source| source.enabled)
        };
        let stats = self
            .rebuilds
            .run(
                reason,
                RebuildContext {
                    indexer: &mut self.indexer,
                    repository: &self.repository,
                    events: &self.events,
                    keep_source: &keep_source,
                    diagnostics: &self.diagnostics,
                },
            )
            .await?;

        for update in self.ics.refresh_all().await {
            self.apply_ics(update);
        }
        if record_version {
            if let Err(err) = self.version.mark_processed() {
                warn!(error = %err, "could not record processed version");
            }
        }
        Ok(RebuildOutcome::Completed(stats))
    }
}

fn parent_dir(file_id: &str) -> &str {
    file_id.rsplit_once('/').map_or("", |(dir, _)| dir)
}

fn in_dir(file_id: &str, dir: &str) -> bool {
    dir.is_empty()
        || file_id
            .strip_prefix(dir)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_membership() {
        assert_eq!(parent_dir("work/a/todo.md"), "work/a");
        assert_eq!(parent_dir("todo.md"), "");
        assert!(in_dir("work/a/todo.md", "work"));
        assert!(!in_dir("workshop/todo.md", "work"));
        assert!(in_dir("todo.md", ""));
    }
}
