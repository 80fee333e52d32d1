//! Full corpus rebuild.
//!
//! A rebuild indexes every corpus file into a fresh [`Repository`] in
//! batches and swaps it in only when complete, so readers keep the last
//! good index in the meantime. Calendar snapshots are carried over.
//!
//! Rebuilds are driven by the index worker, one at a time. Callers pass the
//! number of completed rebuilds they observed when asking; a request that
//! finds the count advanced was satisfied by a rebuild that ran after it
//! was issued and is coalesced.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::diagnostic::{Diagnostic, DiagnosticKind, DiagnosticLog};
use crate::error::{Error, Result};
use crate::events::{EventBus, EventKind};
use crate::indexer::Indexer;
use crate::parser::Frontmatter;
use crate::repository::{self, EntryMeta, Repository, SharedRepository};
use crate::task::ICS_URI_SCHEME;

/// Called with the running scan count each time a scan starts.
pub type ScanHook = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildPhase {
    Scanning,
    Indexing,
    Swapping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebuildProgress {
    pub phase: RebuildPhase,
    pub processed: usize,
    pub total: usize,
    pub tasks_found: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebuildStats {
    pub reason: String,
    pub files: usize,
    pub tasks: usize,
    pub diagnostics: usize,
    /// Files that could not be read and were left out.
    pub skipped: usize,
    pub duration_ms: u64,
    pub emergency: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RebuildOutcome {
    Completed(RebuildStats),
    /// Another rebuild covered this request.
    Coalesced,
}

/// Everything one rebuild touches.
pub struct RebuildContext<'a> {
    pub indexer: &'a mut Indexer,
    pub repository: &'a SharedRepository,
    pub events: &'a EventBus,
    /// Calendar sources whose snapshots survive the swap.
    pub keep_source: &'a (dyn Fn(&str) -> bool + Sync),
    /// Receives the corpus diagnostics of the swapped-in index.
    pub diagnostics: &'a DiagnosticLog,
}

pub struct RebuildController {
    batch_size: usize,
    completed: AtomicU64,
    scans: AtomicU64,
    on_scan: Mutex<Option<ScanHook>>,
}

impl std::fmt::Debug for RebuildController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebuildController")
            .field("batch_size", &self.batch_size)
            .field("completed", &self.completed_count())
            .field("scans", &self.scan_count())
            .finish()
    }
}

impl RebuildController {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            completed: AtomicU64::new(0),
            scans: AtomicU64::new(0),
            on_scan: Mutex::new(None),
        }
    }

    /// Rebuilds finished so far, successful or not.
    pub fn completed_count(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Full corpus scans started so far, including emergency retries.
    pub fn scan_count(&self) -> u64 {
        self.scans.load(Ordering::SeqCst)
    }

    pub fn set_on_scan(&self, hook: Option<ScanHook>) {
        *self.on_scan.lock().unwrap_or_else(PoisonError::into_inner) = hook;
    }

    /// Whether a request issued after `seen` completions is already covered.
    pub fn is_covered(&self, seen: u64) -> bool {
        self.completed_count() > seen
    }

    /// Rebuild, retrying once as an emergency rebuild.
    pub async fn run(&self, reason: &str, ctx: RebuildContext<'_>) -> Result<RebuildStats> {
        let RebuildContext {
            indexer,
            repository,
            events,
            keep_source,
            diagnostics,
        } = ctx;
        let generation = repository::read_lock(repository).generation();
        events.emit(
            EventKind::RebuildStarted,
            generation,
            serde_json::json!({ "reason": reason }),
        );

        let first = self
            .attempt(reason, false, indexer, repository, events, keep_source, diagnostics)
            .await;
        let result = match first {
            Ok(stats) => Ok(stats),
            Err(err) => {
                let retry_reason = format!("emergency rebuild: {reason}");
                warn!(error = %err, reason = %retry_reason, "rebuild failed, retrying");
                self.attempt(&retry_reason, true, indexer, repository, events, keep_source, diagnostics)
                    .await
                    .map_err(|retry| {
                        Error::RebuildFailed(format!("{retry_reason}: {retry} (first attempt: {err})"))
                    })
            }
        };
        self.completed.fetch_add(1, Ordering::SeqCst);

        let generation = repository::read_lock(repository).generation();
        match &result {
            Ok(stats) => {
                info!(
                    files = stats.files,
                    tasks = stats.tasks,
                    duration_ms = stats.duration_ms,
                    emergency = stats.emergency,
                    "rebuild completed"
                );
                events.emit(EventKind::RebuildCompleted, generation, stats);
            }
            Err(err) => {
                warn!(error = %err, "rebuild failed");
                events.emit(
                    EventKind::RebuildFailed,
                    generation,
                    serde_json::json!({ "reason": reason, "error": err.to_string() }),
                );
            }
        }
        result
    }

    async fn attempt(
        &self,
        reason: &str,
        emergency: bool,
        indexer: &mut Indexer,
        repository: &SharedRepository,
        events: &EventBus,
        keep_source: &(dyn Fn(&str) -> bool + Sync),
        log: &DiagnosticLog,
    ) -> Result<RebuildStats> {
        let started = Instant::now();
        let scan = self.scans.fetch_add(1, Ordering::SeqCst) + 1;
        let hook = self
            .on_scan
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook(scan);
        }

        let generation = repository::read_lock(repository).generation();
        let progress = |phase: RebuildPhase,
                        processed: usize,
                        total: usize,
                        tasks_found: usize,
                        current_file: Option<String>| {
            events.emit(
                EventKind::RebuildProgress,
                generation,
                RebuildProgress {
                    phase,
                    processed,
                    total,
                    tasks_found,
                    current_file,
                },
            );
        };

        debug!(reason, "scanning corpus");
        progress(RebuildPhase::Scanning, 0, 0, 0, None);
        let file_ids = indexer.storage().enumerate()?;
        let total = file_ids.len();

        let mut fresh = Repository::new();
        let mut frontmatter: HashMap<String, Frontmatter> = HashMap::new();
        let mut processed = 0;
        let mut collected = Vec::new();
        let mut skipped = 0;
        for batch in file_ids.chunks(self.batch_size) {
            for (file_id, result) in indexer.load_batch(batch).await? {
                processed += 1;
                match result {
                    Ok(file) => {
                        for diagnostic in &file.diagnostics {
                            events.emit(EventKind::Diagnostic, generation, diagnostic);
                        }
                        collected.extend(file.diagnostics);
                        frontmatter.insert(file.file_id.clone(), file.frontmatter);
                        fresh.upsert_file(&file.file_id, file.tasks, file.meta);
                    }
                    Err(err) => {
                        skipped += 1;
                        warn!(file = %file_id, error = %err, "skipping unreadable file");
                        let diagnostic =
                            Diagnostic::new(DiagnosticKind::Read, file_id.as_str(), err.to_string());
                        events.emit(EventKind::Diagnostic, generation, &diagnostic);
                        collected.push(diagnostic);
                    }
                }
            }
            progress(
                RebuildPhase::Indexing,
                processed,
                total,
                fresh.len(),
                batch.last().cloned(),
            );
            tokio::task::yield_now().await;
        }

        progress(RebuildPhase::Swapping, processed, total, fresh.len(), None);
        let files = fresh.file_ids().count();
        {
            let mut current = repository::write_lock(repository);
            carry_over_calendars(&current, &mut fresh, keep_source);
            fresh.continue_generation_from(current.generation());
            fresh.mark_loaded();
            *current = fresh;
        }
        indexer.replace_frontmatter(frontmatter);
        let diagnostics = collected.len();
        log.replace_corpus(collected);

        let tasks = repository::read_lock(repository).len();
        Ok(RebuildStats {
            reason: reason.to_string(),
            files,
            tasks,
            diagnostics,
            skipped,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            emergency,
        })
    }
}

fn carry_over_calendars(
    current: &Repository,
    fresh: &mut Repository,
    keep_source: &(dyn Fn(&str) -> bool + Sync),
) {
    let calendars: Vec<String> = current
        .file_ids()
        .filter(|file_id| {
            file_id
                .strip_prefix(ICS_URI_SCHEME)
                .is_some_and(|source_id| keep_source(source_id))
        })
        .map(str::to_string)
        .collect();
    for file_id in calendars {
        let meta = current
            .entry(&file_id)
            .map(|entry| EntryMeta {
                content_hash: entry.content_hash.clone(),
                mtime: entry.mtime,
            })
            .unwrap_or_default();
        fresh.upsert_file(&file_id, current.get_by_file(&file_id), meta);
    }
}
