//! taskflow calendar subcommands

use chrono::Days;

use crate::dates;
use crate::error::{Error, Result};
use crate::ics::{SourceState, SourceStatus};
use crate::output::{emit_success, HumanOutput};

use super::list::push_tasks;
use super::{CalendarCommands, Session};

/// Window shown by `calendar events` when no end day is given.
const DEFAULT_WINDOW_DAYS: u64 = 7;

pub async fn run(session: &Session, command: CalendarCommands) -> Result<()> {
    match command {
        CalendarCommands::Events { from, to } => {
            let from = from.unwrap_or_else(dates::today);
            let to = match to {
                Some(to) => to,
                None => from
                    .checked_add_days(Days::new(DEFAULT_WINDOW_DAYS - 1))
                    .ok_or_else(|| Error::InvalidArgument("date out of range".into()))?,
            };
            if to < from {
                return Err(Error::InvalidArgument(format!("{to} is before {from}")));
            }
            let events = session.engine.query_api().calendar_events(from, to);
            let mut human = HumanOutput::new(format!(
                "taskflow calendar events: {} event(s) from {from} to {to}",
                events.len()
            ));
            push_tasks(&mut human, &events);
            emit_success(session.output, "calendar events", &events, Some(&human))
        }
        CalendarCommands::Badges { date } => {
            let date = date.unwrap_or_else(dates::today);
            let badges = session.engine.query_api().badge_events_for_date(date);
            let mut human = HumanOutput::new(format!("taskflow calendar badges: {date}"));
            for badge in &badges {
                human.push_summary(badge.source_name.clone(), badge.count.to_string());
            }
            emit_success(session.output, "calendar badges", &badges, Some(&human))
        }
        CalendarCommands::Refresh { source } => {
            let statuses = match source {
                Some(source_id) => vec![session.engine.refresh_ics(&source_id).await?],
                None => session.engine.refresh_all_ics().await?,
            };
            let mut human = HumanOutput::new("taskflow calendar refresh");
            push_statuses(&mut human, &statuses);
            emit_success(session.output, "calendar refresh", &statuses, Some(&human))
        }
        CalendarCommands::Status => {
            let statuses = session.engine.diagnostics().calendars;
            let mut human = HumanOutput::new("taskflow calendar status");
            push_statuses(&mut human, &statuses);
            if statuses.is_empty() {
                human.push_next_step("add [[ics.sources]] to .taskflow.toml");
            }
            emit_success(session.output, "calendar status", &statuses, Some(&human))
        }
    }
}

fn push_statuses(human: &mut HumanOutput, statuses: &[SourceStatus]) {
    for status in statuses {
        let state = match status.state {
            SourceState::Idle => "idle",
            SourceState::Fetching => "fetching",
            SourceState::Parsed => "ok",
            SourceState::Failed => "failed",
        };
        human.push_summary(
            status.source_id.clone(),
            format!("{state}, {} event(s)", status.event_count),
        );
        if let Some(error) = &status.last_error {
            human.push_warning(format!("{}: {error}", status.source_id));
        }
    }
}
