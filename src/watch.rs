//! Filesystem watching.
//!
//! Raw `notify` events are collected per corpus file and forwarded to the
//! index worker once the tree has been quiet for the debounce window.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::storage::Storage;
use crate::worker::IndexHandle;

/// A running watcher. Dropping it stops watching.
pub struct FileWatcher {
    watcher: Option<RecommendedWatcher>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcher")
            .field("running", &!self.task.is_finished())
            .finish()
    }
}

impl FileWatcher {
    /// Watch the corpus root recursively. `config_file_name` names project
    /// config files, which are forwarded even when they are not corpus files.
    pub fn start(
        storage: Arc<Storage>,
        index: IndexHandle,
        config_file_name: &str,
        debounce: Duration,
    ) -> Result<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Event>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let _ = sender.send(event);
            }
            Err(err) => warn!(error = %err, "watch error"),
        })?;
        watcher.watch(storage.root(), RecursiveMode::Recursive)?;
        info!(root = %storage.root().display(), "watching corpus");

        let filter = PathFilter {
            state_dir: storage.state_dir(),
            config_file_name: config_file_name.to_string(),
            storage,
        };
        let task = tokio::spawn(async move {
            let mut pending: BTreeSet<String> = BTreeSet::new();
            let mut deadline = Instant::now();
            loop {
                tokio::select! {
                    event = receiver.recv() => {
                        let Some(event) = event else { break };
                        if !is_relevant(&event.kind) {
                            continue;
                        }
                        pending.extend(event.paths.iter().filter_map(|path| filter.file_id(path)));
                        deadline = Instant::now() + debounce;
                    }
                    _ = sleep_until(deadline), if !pending.is_empty() => {
                        for file_id in std::mem::take(&mut pending) {
                            debug!(file = %file_id, "file changed");
                            if index.file_changed(file_id).is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            watcher: Some(watcher),
            task,
        })
    }

    pub fn stop(&mut self) {
        if self.watcher.take().is_some() {
            info!("stopped watching corpus");
        }
        self.task.abort();
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

struct PathFilter {
    storage: Arc<Storage>,
    state_dir: PathBuf,
    config_file_name: String,
}

impl PathFilter {
    /// Corpus id of `path` if the worker should look at it.
    fn file_id(&self, path: &Path) -> Option<String> {
        if path.starts_with(&self.state_dir) {
            return None;
        }
        let file_id = self.storage.file_id(path).ok()?;
        let is_config = Path::new(&file_id)
            .file_name()
            .is_some_and(|name| name.to_string_lossy() == self.config_file_name.as_str());
        (is_config || self.storage.is_corpus_file(&file_id)).then_some(file_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;

    #[test]
    fn filter_skips_state_dir_and_foreign_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Arc::new(Storage::new(dir.path(), &IndexConfig::default()).expect("storage"));
        let filter = PathFilter {
            state_dir: storage.state_dir(),
            config_file_name: "project.md".into(),
            storage: Arc::clone(&storage),
        };
        assert_eq!(
            filter.file_id(&dir.path().join("notes/todo.md")).as_deref(),
            Some("notes/todo.md")
        );
        assert!(filter.file_id(&storage.state_dir().join("store.json")).is_none());
        assert!(filter.file_id(&dir.path().join("image.png")).is_none());
        assert!(filter.file_id(Path::new("/elsewhere/todo.md")).is_none());
    }
}
