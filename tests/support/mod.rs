#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use assert_cmd::Command;
use chrono::NaiveDate;
use tempfile::TempDir;

use taskflow::config::{Config, IcsSource};
use taskflow::ics::{StaticFetcher, StaticReply};
use taskflow::orchestrator::{Orchestrator, OrchestratorOptions};
use taskflow::version::MemoryKvStore;
use taskflow::write::WriteApi;

/// A throwaway corpus with an in-memory version store and canned feeds.
pub struct TestCorpus {
    dir: TempDir,
    pub fetcher: StaticFetcher,
    pub kv: Arc<MemoryKvStore>,
}

impl TestCorpus {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("failed to create tempdir"),
            fetcher: StaticFetcher::new(),
            kv: Arc::new(MemoryKvStore::new()),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_file(&self, rel_path: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(rel_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent dir");
        }
        fs::write(&path, contents).expect("write file");
        path
    }

    pub fn read_file(&self, rel_path: &str) -> String {
        fs::read_to_string(self.dir.path().join(rel_path)).expect("read file")
    }

    pub fn remove_file(&self, rel_path: &str) {
        fs::remove_file(self.dir.path().join(rel_path)).expect("remove file");
    }

    pub fn write_config(&self, contents: &str) -> PathBuf {
        self.write_file(".taskflow.toml", contents)
    }

    /// Serve `body` for `url` and register the URL as a calendar source.
    pub fn feed(&self, config: &mut Config, id: &str, url: &str, body: &str) {
        self.fetcher.set(url, StaticReply::Body(body.to_string()));
        config.ics.sources.push(IcsSource::new(id, id, url));
    }

    /// An engine over this corpus that has not been initialized yet.
    pub fn engine(&self, config: Config) -> Orchestrator {
        Orchestrator::with_options(
            self.dir.path(),
            config,
            OrchestratorOptions {
                fetcher: Some(Arc::new(self.fetcher.clone())),
                kv_store: Some(self.kv.clone()),
            },
        )
        .expect("engine")
    }

    pub async fn start(&self, config: Config) -> Orchestrator {
        let mut engine = self.engine(config);
        engine.initialize().await.expect("initialize");
        engine
    }
}

pub fn day(raw: &str) -> NaiveDate {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").expect("date")
}

/// Write API pinned to a fixed "today" so stamped dates are predictable.
pub fn writer(engine: &Orchestrator, today: &str) -> WriteApi {
    engine.write_api().with_today(day(today))
}

pub fn taskflow_cmd(corpus: &TestCorpus) -> Command {
    let mut cmd = Command::cargo_bin("taskflow").expect("binary");
    cmd.current_dir(corpus.path());
    cmd.env_remove("TASKFLOW_ROOT");
    cmd.env_remove("RUST_LOG");
    cmd
}

pub const WORK_FEED: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nBEGIN:VEVENT\r\nUID:evt-1\r\nSUMMARY:Team sync\r\nDTSTART:20240115T090000Z\r\nDTEND:20240115T100000Z\r\nEND:VEVENT\r\nBEGIN:VEVENT\r\nUID:evt-2\r\nSUMMARY:Offsite\r\nDTSTART;VALUE=DATE:20240116\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
