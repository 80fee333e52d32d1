//! taskflow query subcommands

use crate::dates;
use crate::error::{Error, Result};
use crate::output::{emit_success, HumanOutput};
use crate::query::{DateQuery, SearchField, SearchQuery};
use crate::task::{DateField, Task};

use super::list::push_tasks;
use super::{QueryCommands, Session};

pub fn run(session: &Session, command: QueryCommands) -> Result<()> {
    let api = session.engine.query_api();
    let today = dates::today();
    let (command_name, tasks): (&str, Vec<Task>) = match command {
        QueryCommands::Date {
            field,
            from,
            to,
            limit,
        } => {
            let date_type = DateField::parse(&field)
                .ok_or_else(|| Error::InvalidArgument(format!("unknown date field '{field}'")))?;
            let query = DateQuery {
                date_type,
                from,
                to,
                limit,
            };
            ("query date", api.query_by_date(&query))
        }
        QueryCommands::Project { name } => ("query project", api.query_by_project(&name)),
        QueryCommands::Context { name } => ("query context", api.query_by_context(&name)),
        QueryCommands::Priority { level } => ("query priority", api.query_by_priority(level)),
        QueryCommands::Tag { tags, all } => ("query tag", api.query_by_tags(&tags, all)),
        QueryCommands::Search {
            text,
            fields,
            limit,
        } => {
            let search_in = fields
                .iter()
                .map(|raw| {
                    SearchField::parse(raw).ok_or_else(|| {
                        Error::InvalidArgument(format!("unknown search field '{raw}'"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let query = SearchQuery {
                query: text,
                search_in,
                limit,
            };
            ("query search", api.search_tasks(&query))
        }
        QueryCommands::Today => ("query today", api.due_today(today)),
        QueryCommands::Overdue => ("query overdue", api.overdue(today)),
        QueryCommands::Upcoming { days } => ("query upcoming", api.upcoming(today, days)),
    };

    let mut human = HumanOutput::new(format!("taskflow {command_name}: {} task(s)", tasks.len()));
    push_tasks(&mut human, &tasks);
    emit_success(session.output, command_name, &tasks, Some(&human))
}
