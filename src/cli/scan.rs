//! taskflow scan and rebuild commands

use serde::Serialize;

use crate::error::Result;
use crate::orchestrator::InitReport;
use crate::output::{emit_success, HumanOutput};
use crate::rebuild::{RebuildOutcome, RebuildStats};
use crate::repository::IndexSummary;

use super::Session;

#[derive(Serialize)]
struct ScanReport<'a> {
    init: &'a InitReport,
    index: IndexSummary,
}

pub fn run_scan(session: &Session) -> Result<()> {
    let index = session.engine.query_api().summary();
    let report = ScanReport {
        init: &session.init,
        index: index.clone(),
    };

    let mut human = HumanOutput::new("taskflow scan: index ready");
    push_index(&mut human, &index);
    if let RebuildOutcome::Completed(stats) = &session.init.rebuild {
        push_stats(&mut human, stats);
    }
    if session.init.version.rebuild_required() {
        human.push_warning(format!("full rebuild: {}", session.init.version.reason));
    }
    human.push_next_step("taskflow list");

    emit_success(session.output, "scan", &report, Some(&human))
}

pub async fn run_rebuild(session: &mut Session, force: bool) -> Result<()> {
    if force {
        session.engine.invalidate_version()?;
    }
    let outcome = session.engine.rebuild().await?;
    let index = session.engine.query_api().summary();

    let mut human = HumanOutput::new(match &outcome {
        RebuildOutcome::Completed(_) => "taskflow rebuild: done",
        RebuildOutcome::Coalesced => "taskflow rebuild: covered by a concurrent rebuild",
    });
    push_index(&mut human, &index);
    if let RebuildOutcome::Completed(stats) = &outcome {
        push_stats(&mut human, stats);
    }

    emit_success(session.output, "rebuild", &outcome, Some(&human))
}

fn push_index(human: &mut HumanOutput, index: &IndexSummary) {
    human.push_summary("tasks", index.total_tasks.to_string());
    human.push_summary("files", index.files.to_string());
    human.push_summary("projects", index.projects.to_string());
    human.push_summary("tags", index.tags.to_string());
}

fn push_stats(human: &mut HumanOutput, stats: &RebuildStats) {
    human.push_summary("scanned", format!("{} file(s) in {} ms", stats.files, stats.duration_ms));
    if stats.skipped > 0 {
        human.push_warning(format!("{} unreadable file(s) skipped", stats.skipped));
    }
    if stats.diagnostics > 0 {
        human.push_warning(format!("{} diagnostic(s); see `taskflow status`", stats.diagnostics));
    }
    if stats.emergency {
        human.push_warning("emergency rebuild after a failed attempt");
    }
}
