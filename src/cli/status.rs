//! taskflow status command

use crate::error::Result;
use crate::output::{emit_success, HumanOutput};

use super::Session;

/// Diagnostics printed in human mode; JSON output carries all of them.
const SHOWN_DIAGNOSTICS: usize = 20;

pub fn run(session: &Session) -> Result<()> {
    let report = session.engine.diagnostics();

    let mut human = HumanOutput::new("taskflow status");
    human.push_summary("root", session.engine.root().display().to_string());
    human.push_summary("version", report.version.current.app_version.clone());
    human.push_summary("tasks", report.index.total_tasks.to_string());
    human.push_summary("files", report.index.files.to_string());
    human.push_summary("generation", report.index.generation.to_string());
    human.push_summary("scans", report.scans.to_string());
    human.push_summary("calendars", report.calendars.len().to_string());
    if !report.version.storage_writable {
        human.push_warning("state directory is not writable");
    }
    for diagnostic in report.diagnostics.iter().rev().take(SHOWN_DIAGNOSTICS) {
        let location = match diagnostic.line {
            Some(line) => format!("{}:{line}", diagnostic.source),
            None => diagnostic.source.clone(),
        };
        human.push_detail(format!("{location}: {}", diagnostic.message));
    }
    if report.diagnostics.len() > SHOWN_DIAGNOSTICS {
        human.push_next_step("taskflow status --json");
    }

    emit_success(session.output, "status", &report, Some(&human))
}
