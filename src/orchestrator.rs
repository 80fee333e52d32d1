//! Engine lifecycle.
//!
//! The [`Orchestrator`] owns every moving part: the shared repository, the
//! index worker, calendar timers and the optional filesystem watcher.
//! Queries get a cheap [`QueryApi`] clone; mutations go through
//! [`WriteApi`], which reports back through the same worker.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{Config, ProjectConfig};
use crate::diagnostic::{Diagnostic, DiagnosticKind, DiagnosticLog};
use crate::error::{Error, Result};
use crate::events::{EventBus, IndexEvent};
use crate::ics::{Fetcher, HttpFetcher, IcsSourceRunner, IcsUpdate, SourceStatus};
use crate::indexer::Indexer;
use crate::query::QueryApi;
use crate::rebuild::{RebuildController, RebuildOutcome, ScanHook};
use crate::repository::{self, ChangeSet, IndexSummary, Repository, SharedRepository};
use crate::storage::Storage;
use crate::version::{FileKvStore, KvStore, VersionCheck, VersionDiagnostics, VersionManager};
use crate::watch::FileWatcher;
use crate::worker::{IndexHandle, Worker};
use crate::write::WriteApi;

/// Replacements for the production collaborators.
#[derive(Default)]
pub struct OrchestratorOptions {
    pub fetcher: Option<Arc<dyn Fetcher>>,
    pub kv_store: Option<Arc<dyn KvStore>>,
}

/// What `initialize` found and did.
#[derive(Debug, Clone, Serialize)]
pub struct InitReport {
    pub version: VersionCheck,
    pub rebuild: RebuildOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineDiagnostics {
    pub version: VersionDiagnostics,
    pub index: IndexSummary,
    pub calendars: Vec<SourceStatus>,
    pub scans: u64,
    pub rebuilds: u64,
    pub diagnostics: Vec<Diagnostic>,
}

pub struct Orchestrator {
    config: Config,
    storage: Arc<Storage>,
    repository: SharedRepository,
    events: EventBus,
    rebuilds: Arc<RebuildController>,
    version: Arc<VersionManager>,
    ics: Arc<IcsSourceRunner>,
    diagnostics: DiagnosticLog,
    handle: IndexHandle,
    query: QueryApi,
    write: WriteApi,
    worker: Option<JoinHandle<()>>,
    timers: Vec<JoinHandle<()>>,
    watcher: Option<FileWatcher>,
    initialized: bool,
    closed: bool,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("root", &self.storage.root())
            .field("initialized", &self.initialized)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Orchestrator {
    /// Load `.taskflow.toml` from `root` and build an engine over it.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let config = Config::load_from_root(&root)?;
        Self::new(root, config)
    }

    pub fn new(root: impl Into<PathBuf>, config: Config) -> Result<Self> {
        Self::with_options(root, config, OrchestratorOptions::default())
    }

    /// Build the engine and start its worker. Must be called from within a
    /// tokio runtime.
    pub fn with_options(
        root: impl Into<PathBuf>,
        config: Config,
        options: OrchestratorOptions,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::OperationFailed("no tokio runtime available".into()))?;

        let storage = Arc::new(Storage::new(root.into(), &config.index)?);
        let fetcher: Arc<dyn Fetcher> = match options.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFetcher::new(Duration::from_secs(
                config.ics.timeout_seconds.max(1),
            ))?),
        };
        let kv_store: Arc<dyn KvStore> = match options.kv_store {
            Some(store) => store,
            None => Arc::new(FileKvStore::for_storage(&storage)),
        };

        let indexer = Indexer::new(Arc::clone(&storage), &config)?;
        let parser = Arc::clone(indexer.parser());
        let repository: SharedRepository = Arc::new(RwLock::new(Repository::new()));
        let events = EventBus::new();
        let rebuilds = Arc::new(RebuildController::new(config.index.rebuild_batch_size));
        let version = Arc::new(VersionManager::new(kv_store));
        let ics = Arc::new(IcsSourceRunner::new(&config.ics, fetcher)?);
        let diagnostics = DiagnosticLog::default();

        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = IndexHandle::new(sender, Arc::clone(&rebuilds));
        let worker = Worker {
            indexer,
            repository: Arc::clone(&repository),
            events: events.clone(),
            rebuilds: Arc::clone(&rebuilds),
            version: Arc::clone(&version),
            ics: Arc::clone(&ics),
            diagnostics: diagnostics.clone(),
        };
        let worker = runtime.spawn(worker.run(receiver));

        let query = QueryApi::new(Arc::clone(&repository));
        let write = WriteApi::new(
            Arc::clone(&storage),
            Arc::clone(&repository),
            handle.clone(),
            parser,
            &config.write,
            events.clone(),
        );

        Ok(Self {
            config,
            storage,
            repository,
            events,
            rebuilds,
            version,
            ics,
            diagnostics,
            handle,
            query,
            write,
            worker: Some(worker),
            timers: Vec::new(),
            watcher: None,
            initialized: false,
            closed: false,
        })
    }

    pub fn root(&self) -> &Path {
        self.storage.root()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Check the version record, populate the index and start calendar
    /// timers. A failed rebuild is fatal.
    pub async fn initialize(&mut self) -> Result<InitReport> {
        self.ensure_open()?;
        self.storage.init()?;

        let version = self.version.check();
        if version.recovered {
            self.diagnostics.record(Diagnostic::new(
                DiagnosticKind::Storage,
                self.storage.state_dir().display().to_string(),
                "version record was corrupted and has been reset",
            ));
        }
        // The in-memory index always starts from a full scan; only a required
        // rebuild records the processed version.
        let rebuild = if version.rebuild_required() {
            self.handle.rebuild(&version.reason).await?
        } else {
            self.handle.scan("startup scan").await?
        };

        if !self.initialized {
            let handle = self.handle.clone();
            self.timers = self.ics.spawn_timers(move |update: IcsUpdate| {
                if handle.deliver_ics(update).is_err() {
                    warn!("calendar update dropped, worker stopped");
                }
            });
        }
        self.initialized = true;
        info!(
            tasks = repository::read_lock(&self.repository).len(),
            calendars = self.timers.len(),
            "engine initialized"
        );
        Ok(InitReport { version, rebuild })
    }

    /// Full rebuild; concurrent requests are coalesced.
    pub async fn rebuild(&self) -> Result<RebuildOutcome> {
        self.ensure_open()?;
        self.handle.rebuild("rebuild requested").await
    }

    /// Make the next start rebuild from scratch.
    pub fn invalidate_version(&self) -> Result<()> {
        self.version.invalidate()
    }

    /// Re-index one path, or drop it from the index when it no longer
    /// exists.
    pub async fn process_file_immediate(&self, path: impl AsRef<Path>) -> Result<ChangeSet> {
        self.ensure_open()?;
        let file_id = self.storage.file_id(path.as_ref())?;
        self.handle.process_now(&file_id).await
    }

    pub async fn reconfigure_projects(&self, config: ProjectConfig) -> Result<usize> {
        self.ensure_open()?;
        config.validate()?;
        self.handle.reconfigure_projects(config).await
    }

    /// Refresh one calendar source now and wait until its tasks are visible.
    pub async fn refresh_ics(&self, source_id: &str) -> Result<SourceStatus> {
        self.ensure_open()?;
        let update = self.ics.refresh(source_id).await?;
        self.handle.apply_ics(update).await?;
        self.ics
            .status(source_id)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown calendar source {source_id}")))
    }

    /// Refresh every enabled calendar source.
    pub async fn refresh_all_ics(&self) -> Result<Vec<SourceStatus>> {
        self.ensure_open()?;
        for update in self.ics.refresh_all().await {
            self.handle.apply_ics(update).await?;
        }
        Ok(self.ics.statuses())
    }

    pub fn start_watching(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.watcher.is_some() {
            return Ok(());
        }
        self.watcher = Some(FileWatcher::start(
            Arc::clone(&self.storage),
            self.handle.clone(),
            &self.config.project.config_file_name,
            Duration::from_millis(self.config.index.watch_debounce_ms),
        )?);
        Ok(())
    }

    pub fn query_api(&self) -> QueryApi {
        self.query.clone()
    }

    pub fn write_api(&self) -> WriteApi {
        self.write.clone()
    }

    pub fn index_handle(&self) -> IndexHandle {
        self.handle.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.events.subscribe()
    }

    /// Observe every full scan, mostly for tests.
    pub fn set_on_scan(&self, hook: Option<ScanHook>) {
        self.rebuilds.set_on_scan(hook);
    }

    pub fn diagnostics(&self) -> EngineDiagnostics {
        EngineDiagnostics {
            version: self.version.diagnostics(),
            index: repository::read_lock(&self.repository).summary(),
            calendars: self.ics.statuses(),
            scans: self.rebuilds.scan_count(),
            rebuilds: self.rebuilds.completed_count(),
            diagnostics: self.diagnostics.snapshot(),
        }
    }

    /// Stop the watcher and timers, then let the worker drain and exit.
    /// Safe to call more than once and after a failed `initialize`.
    pub async fn cleanup(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }
        for timer in self.timers.drain(..) {
            timer.abort();
        }
        self.handle.shutdown();
        if let Some(worker) = self.worker.take() {
            if let Err(err) = worker.await {
                if !err.is_cancelled() {
                    warn!(error = %err, "index worker ended abnormally");
                }
            }
        }
        info!("engine stopped");
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::ChannelClosed);
        }
        Ok(())
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        for timer in self.timers.drain(..) {
            timer.abort();
        }
        self.handle.shutdown();
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}
