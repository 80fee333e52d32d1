mod support;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use taskflow::config::{Config, PathMapping, ProjectConfig};
use taskflow::diagnostic::DiagnosticKind;
use taskflow::error::Error;
use taskflow::rebuild::RebuildOutcome;
use taskflow::task::ProjectSource;
use taskflow::version::{KvStore, VersionState, VERSION_KEY};
use taskflow::write::TaskPatch;
use taskflow::TaskStatus;

use support::TestCorpus;

#[tokio::test]
async fn first_start_rebuilds_and_records_version() {
    let corpus = TestCorpus::new();
    corpus.write_file("inbox.md", "- [ ] Call Bob\n- [x] Pay rent\n");
    corpus.write_file("work/plan.md", "# Plan\n- [ ] Draft memo\nnot a task\n");

    let mut engine = corpus.engine(Config::default());
    let report = engine.initialize().await.expect("initialize");
    assert_eq!(report.version.reason, "first install");
    let RebuildOutcome::Completed(stats) = &report.rebuild else {
        panic!("expected a completed rebuild, got {:?}", report.rebuild);
    };
    assert_eq!(stats.files, 2);
    assert_eq!(stats.tasks, 3);

    let api = engine.query_api();
    let ids: Vec<String> = api.get_all_tasks().into_iter().map(|task| task.id).collect();
    assert_eq!(ids, vec!["inbox.md:L1", "inbox.md:L2", "work/plan.md:L2"]);
    engine.cleanup().await;
    let recorded = corpus.kv.get(VERSION_KEY).expect("get").expect("record");

    let mut again = corpus.engine(Config::default());
    let report = again.initialize().await.expect("initialize");
    assert_eq!(report.version.state, VersionState::NoRebuildNeeded);
    assert!(!report.version.recovered);
    assert_eq!(again.query_api().get_all_tasks().len(), 3);
    // A startup scan without a version change leaves the record untouched.
    assert_eq!(corpus.kv.get(VERSION_KEY).expect("get"), Some(recorded));
    again.cleanup().await;
}

#[tokio::test]
async fn concurrent_rebuild_requests_share_one_scan() {
    let corpus = TestCorpus::new();
    corpus.write_file("a.md", "- [ ] One\n");
    let mut engine = corpus.start(Config::default()).await;

    let scans = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&scans);
    engine.set_on_scan(Some(Arc::new(move |_: u64| {
        counter.fetch_add(1, Ordering::SeqCst);
    })));

    let (first, second) = tokio::join!(engine.rebuild(), engine.rebuild());
    let outcomes = [first.expect("first"), second.expect("second")];
    assert_eq!(scans.load(Ordering::SeqCst), 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|outcome| matches!(outcome, RebuildOutcome::Coalesced))
            .count(),
        1
    );

    // A request issued after the last rebuild finished scans again.
    engine.rebuild().await.expect("third");
    assert_eq!(scans.load(Ordering::SeqCst), 2);
    engine.cleanup().await;
}

#[tokio::test]
async fn invalidated_version_forces_rebuild_on_next_start() {
    let corpus = TestCorpus::new();
    corpus.write_file("a.md", "- [ ] One\n");
    let mut engine = corpus.start(Config::default()).await;
    engine.invalidate_version().expect("invalidate");
    engine.cleanup().await;

    let mut engine = corpus.engine(Config::default());
    let report = engine.initialize().await.expect("initialize");
    assert!(report.version.rebuild_required());
    assert_eq!(report.version.reason, "rebuild requested");
    engine.cleanup().await;
}

#[tokio::test]
async fn corrupted_version_record_is_recovered() {
    let corpus = TestCorpus::new();
    corpus.write_file("a.md", "- [ ] One\n");
    corpus
        .kv
        .set(VERSION_KEY, serde_json::json!({ "schemaVersion": "garbage" }))
        .expect("seed");

    let mut engine = corpus.engine(Config::default());
    let report = engine.initialize().await.expect("initialize");
    assert!(report.version.recovered);
    assert_eq!(engine.query_api().get_all_tasks().len(), 1);

    let diagnostics = engine.diagnostics();
    assert!(diagnostics
        .diagnostics
        .iter()
        .any(|diagnostic| diagnostic.kind == DiagnosticKind::Storage));
    assert!(diagnostics.version.record_valid);
    engine.cleanup().await;
}

#[tokio::test]
async fn processing_a_file_is_idempotent_and_handles_removal() {
    let corpus = TestCorpus::new();
    let mut engine = corpus.start(Config::default()).await;

    corpus.write_file("notes/today.md", "- [ ] Buy milk\n  - [ ] Oat\n");
    let first = engine
        .process_file_immediate("notes/today.md")
        .await
        .expect("first");
    assert_eq!(first.added.len(), 2);

    let second = engine
        .process_file_immediate("notes/today.md")
        .await
        .expect("second");
    assert!(second.is_empty());

    let child = engine
        .query_api()
        .get_task_by_id("notes/today.md:L2")
        .expect("child");
    assert_eq!(child.metadata.parent.as_deref(), Some("notes/today.md:L1"));

    corpus.remove_file("notes/today.md");
    let removed = engine
        .process_file_immediate("notes/today.md")
        .await
        .expect("removed");
    assert_eq!(removed.removed.len(), 2);
    assert!(engine.query_api().tasks_for_file("notes/today.md").is_empty());
    engine.cleanup().await;
}

#[tokio::test]
async fn explicit_project_beats_directory_config_file() {
    let corpus = TestCorpus::new();
    corpus.write_file("work/project.md", "---\nproject: Apollo\n---\n");
    corpus.write_file(
        "work/todo.md",
        "- [ ] Ship it\n- [ ] Review #project/Gemini\n",
    );
    let mut engine = corpus.start(Config::default()).await;
    let api = engine.query_api();

    let inherited = api.get_task_by_id("work/todo.md:L1").expect("inherited");
    let resolved = inherited.metadata.resolved_project.expect("resolved");
    assert_eq!(resolved.name, "Apollo");
    assert_eq!(resolved.source, ProjectSource::ConfigFile);

    let explicit = api.get_task_by_id("work/todo.md:L2").expect("explicit");
    assert_eq!(explicit.metadata.effective_project(), Some("Gemini"));
    assert_eq!(api.query_by_project("Apollo").len(), 1);
    engine.cleanup().await;
}

#[tokio::test]
async fn reconfigured_projects_apply_to_indexed_files() {
    let corpus = TestCorpus::new();
    corpus.write_file("clients/acme/notes.md", "- [ ] Send invoice\n");
    let mut engine = corpus.start(Config::default()).await;
    assert!(engine.query_api().query_by_project("Acme").is_empty());

    let config = ProjectConfig {
        path_mappings: vec![PathMapping {
            pattern: "clients/acme".into(),
            project: "Acme".into(),
            enabled: true,
        }],
        ..ProjectConfig::default()
    };
    let changed = engine
        .reconfigure_projects(config)
        .await
        .expect("reconfigure");
    assert_eq!(changed, 1);
    assert_eq!(engine.query_api().query_by_project("Acme").len(), 1);
    engine.cleanup().await;
}

#[tokio::test]
async fn cleanup_is_idempotent_and_closes_the_engine() {
    let corpus = TestCorpus::new();
    corpus.write_file("a.md", "- [ ] One\n");
    let mut engine = corpus.start(Config::default()).await;
    let writer = engine.write_api();

    engine.cleanup().await;
    engine.cleanup().await;
    assert!(engine.is_closed());
    assert!(matches!(engine.rebuild().await, Err(Error::ChannelClosed)));

    // The index stays readable; writes can no longer be re-indexed.
    assert_eq!(engine.query_api().get_all_tasks().len(), 1);
    let outcome = writer
        .update_task("a.md:L1", TaskPatch::status(TaskStatus::Completed))
        .await;
    assert!(!outcome.success);
}

#[tokio::test]
async fn readonly_version_store_is_not_fatal() {
    let corpus = TestCorpus::new();
    corpus.kv.set_fail_writes(true);
    corpus.write_file("a.md", "- [ ] One\n");
    let mut engine = corpus.engine(Config::default());
    // A read-only version store is not fatal; the rebuild still runs.
    engine.initialize().await.expect("initialize");
    assert!(!engine.diagnostics().version.storage_writable);
    engine.cleanup().await;
    engine.cleanup().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watcher_picks_up_new_files() {
    let corpus = TestCorpus::new();
    let mut config = Config::default();
    config.index.watch_debounce_ms = 50;
    let mut engine = corpus.start(config).await;
    engine.start_watching().expect("watch");

    corpus.write_file("later.md", "- [ ] Appeared\n");
    let api = engine.query_api();
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while api.get_task_by_id("later.md:L1").is_none() {
        assert!(std::time::Instant::now() < deadline, "watcher never indexed the file");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    engine.cleanup().await;
}
