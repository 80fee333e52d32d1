mod support;

use taskflow::config::{Config, IcsSource};
use taskflow::ics::{SourceState, StaticReply};
use taskflow::task::{ShowType, TaskOrigin};
use taskflow::write::TaskPatch;
use taskflow::TaskStatus;

use support::{day, TestCorpus, WORK_FEED};

const WORK_URL: &str = "https://cal.example.com/work.ics";

#[tokio::test]
async fn feeds_are_indexed_as_readonly_tasks() {
    let corpus = TestCorpus::new();
    corpus.write_file("inbox.md", "- [ ] Call Bob\n");
    let mut config = Config::default();
    corpus.feed(&mut config, "work", WORK_URL, WORK_FEED);
    let mut engine = corpus.start(config).await;
    let api = engine.query_api();

    let sync = api.get_task_by_id("ics:work:evt-1").expect("calendar task");
    assert!(sync.readonly);
    assert_eq!(sync.content, "Team sync");
    assert_eq!(sync.source_path, "ics://work");
    assert!(matches!(sync.origin, TaskOrigin::Ics { .. }));
    assert_eq!(api.get_all_tasks().len(), 3);

    let events = api.calendar_events(day("2024-01-15"), day("2024-01-15"));
    let ids: Vec<&str> = events.iter().map(|task| task.id.as_str()).collect();
    assert_eq!(ids, vec!["ics:work:evt-1"]);

    let outcome = engine
        .write_api()
        .update_task("ics:work:evt-1", TaskPatch::status(TaskStatus::Completed))
        .await;
    assert!(!outcome.success);
    assert!(outcome.message.unwrap_or_default().contains("readonly"));
    engine.cleanup().await;
}

#[tokio::test]
async fn badge_sources_are_counted_not_listed() {
    let corpus = TestCorpus::new();
    let mut config = Config::default();
    corpus.feed(&mut config, "work", WORK_URL, WORK_FEED);
    let badge_url = "https://cal.example.com/holidays.ics";
    corpus.fetcher.set(badge_url, StaticReply::Body(WORK_FEED.to_string()));
    let mut holidays = IcsSource::new("holidays", "Holidays", badge_url);
    holidays.show_type = ShowType::Badge;
    holidays.color = Some("#ff0000".into());
    config.ics.sources.push(holidays);
    let mut engine = corpus.start(config).await;
    let api = engine.query_api();

    let events = api.calendar_events(day("2024-01-14"), day("2024-01-17"));
    assert!(events
        .iter()
        .all(|task| task.source_path == "ics://work"));
    assert_eq!(events.len(), 2);

    let badges = api.badge_events_for_date(day("2024-01-15"));
    assert_eq!(badges.len(), 1);
    assert_eq!(badges[0].source_id, "holidays");
    assert_eq!(badges[0].count, 1);
    assert_eq!(badges[0].color.as_deref(), Some("#ff0000"));
    engine.cleanup().await;
}

#[tokio::test]
async fn a_failing_source_does_not_affect_others() {
    let corpus = TestCorpus::new();
    corpus.write_file("inbox.md", "- [ ] Call Bob\n");
    let mut config = Config::default();
    corpus.feed(&mut config, "work", WORK_URL, WORK_FEED);
    let broken_url = "https://cal.example.com/broken.ics";
    corpus
        .fetcher
        .set(broken_url, StaticReply::Fail("connection refused".into()));
    config
        .ics
        .sources
        .push(IcsSource::new("broken", "Broken", broken_url));
    let mut engine = corpus.start(config).await;

    let api = engine.query_api();
    assert_eq!(api.get_all_tasks().len(), 3);
    let statuses = engine.diagnostics().calendars;
    let broken = statuses
        .iter()
        .find(|status| status.source_id == "broken")
        .expect("broken status");
    assert_eq!(broken.state, SourceState::Failed);
    assert!(broken.last_error.is_some());
    let work = statuses
        .iter()
        .find(|status| status.source_id == "work")
        .expect("work status");
    assert_eq!(work.state, SourceState::Parsed);
    assert_eq!(work.event_count, 2);
    engine.cleanup().await;
}

#[tokio::test]
async fn failed_refresh_keeps_the_last_snapshot() {
    let corpus = TestCorpus::new();
    let mut config = Config::default();
    corpus.feed(&mut config, "work", WORK_URL, WORK_FEED);
    let mut engine = corpus.start(config).await;
    assert_eq!(engine.query_api().tasks_for_file("ics://work").len(), 2);

    corpus
        .fetcher
        .set(WORK_URL, StaticReply::Fail("503 Service Unavailable".into()));
    let status = engine.refresh_ics("work").await.expect("refresh");
    assert_eq!(status.state, SourceState::Failed);
    assert!(status.last_success.is_some());
    assert_eq!(engine.query_api().tasks_for_file("ics://work").len(), 2);

    let has_fetch_diagnostic = engine
        .diagnostics()
        .diagnostics
        .iter()
        .any(|diagnostic| diagnostic.source == "ics://work");
    assert!(has_fetch_diagnostic);
    engine.cleanup().await;
}

#[tokio::test]
async fn unknown_sources_are_rejected() {
    let corpus = TestCorpus::new();
    let mut engine = corpus.start(Config::default()).await;
    assert!(engine.refresh_ics("nope").await.is_err());
    assert!(engine.refresh_all_ics().await.expect("refresh all").is_empty());
    engine.cleanup().await;
}
