//! Command-line interface for taskflow
//!
//! This module defines the CLI structure using clap derive macros.
//! Each subcommand is implemented in its own submodule; they all share a
//! [`Session`] that opens the engine over the corpus root and tears it down
//! again when the command is done.

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::dates;
use crate::error::{Error, Result};
use crate::events::EventDestination;
use crate::orchestrator::{InitReport, Orchestrator};
use crate::output::OutputOptions;

mod calendar;
mod init;
mod list;
mod query;
mod scan;
mod status;
mod task;
mod watch;

/// taskflow - index and query tasks in a folder of markdown notes
///
/// Scans checklist items across a notes corpus, keeps an in-memory index of
/// them up to date, merges calendar feeds and edits task lines in place.
#[derive(Parser, Debug)]
#[command(name = "taskflow")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Corpus root (defaults to current directory)
    #[arg(long, global = true, env = "TASKFLOW_ROOT")]
    pub root: Option<PathBuf>,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Stream engine events as JSONL to a file, or `-` for stdout
    #[arg(long, global = true)]
    pub events: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a default .taskflow.toml and create the state directory
    Init,

    /// Index the corpus and report what was found
    Scan,

    /// Rebuild the index from scratch
    Rebuild {
        /// Reset the stored version record before rebuilding
        #[arg(long)]
        force: bool,
    },

    /// List indexed tasks
    List {
        /// Only tasks from this corpus file
        #[arg(long)]
        file: Option<String>,

        /// Only tasks with this status (not_started, in_progress, completed, abandoned)
        #[arg(long)]
        status: Option<String>,

        /// Maximum number of tasks to print
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show a single task
    Show {
        /// Task id (`path:L<line>` or `ics:<source>:<uid>`)
        id: String,
    },

    /// Query the index
    #[command(subcommand)]
    Query(QueryCommands),

    /// List every tag, project and context in use
    Tags,

    /// Calendar feeds
    #[command(subcommand)]
    Calendar(CalendarCommands),

    /// Add a task
    Add {
        /// Task text
        content: String,

        /// Target file (defaults to the configured default file)
        #[arg(long)]
        file: Option<String>,

        /// Append under this heading, creating it if missing
        #[arg(long)]
        heading: Option<String>,

        /// Create the task as a subtask of this task id
        #[arg(long)]
        parent: Option<String>,

        /// Priority 1 (highest) to 5
        #[arg(long)]
        priority: Option<u8>,

        /// Start date (YYYY-MM-DD)
        #[arg(long)]
        start: Option<String>,

        /// Due date (YYYY-MM-DD)
        #[arg(long)]
        due: Option<String>,

        /// Scheduled date (YYYY-MM-DD)
        #[arg(long)]
        scheduled: Option<String>,

        /// Project name
        #[arg(long)]
        project: Option<String>,

        /// Context name
        #[arg(long)]
        context: Option<String>,

        /// Tag (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Recurrence rule, e.g. "every week"
        #[arg(long)]
        every: Option<String>,
    },

    /// Mark tasks completed
    Done {
        /// Task ids
        #[arg(required = true)]
        ids: Vec<String>,

        /// Reopen instead of completing
        #[arg(long)]
        undo: bool,
    },

    /// Update fields of a task
    Update {
        /// Task id
        id: String,

        /// Replace the task text
        #[arg(long)]
        content: Option<String>,

        /// New status
        #[arg(long)]
        status: Option<String>,

        /// Priority 1 (highest) to 5
        #[arg(long)]
        priority: Option<u8>,

        /// Start date (YYYY-MM-DD)
        #[arg(long)]
        start: Option<String>,

        /// Due date (YYYY-MM-DD)
        #[arg(long)]
        due: Option<String>,

        /// Scheduled date (YYYY-MM-DD)
        #[arg(long)]
        scheduled: Option<String>,

        /// Project name
        #[arg(long)]
        project: Option<String>,

        /// Context name
        #[arg(long)]
        context: Option<String>,

        /// Replace the tag set (comma separated)
        #[arg(long, value_delimiter = ',')]
        tags: Option<Vec<String>>,

        /// Recurrence rule
        #[arg(long)]
        every: Option<String>,

        /// Remove a field (priority, start, due, scheduled, project, context, every)
        #[arg(long)]
        clear: Vec<String>,
    },

    /// Delete a task line
    Delete {
        /// Task id
        id: String,

        /// Also remove nested lines
        #[arg(long)]
        children: bool,
    },

    /// Move due dates (or start dates) of tasks
    Postpone {
        /// Task ids
        #[arg(required = true)]
        ids: Vec<String>,

        /// Offset (+3d, +1w, +1m, +1y) or absolute date
        #[arg(long)]
        by: String,
    },

    /// Replace text in the content of tasks
    Replace {
        /// Text to find
        #[arg(long)]
        find: String,

        /// Replacement text
        #[arg(long = "with")]
        replacement: String,

        /// Task ids
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Keep the index live and stream events until interrupted
    Watch,

    /// Show engine diagnostics
    Status,
}

#[derive(Subcommand, Debug)]
pub enum QueryCommands {
    /// Tasks with a date in a range
    Date {
        /// Which date: due, start, scheduled, completed, cancelled, created
        #[arg(long, default_value = "due")]
        field: String,

        /// First day (inclusive)
        #[arg(long, value_parser = parse_day)]
        from: Option<NaiveDate>,

        /// Last day (inclusive)
        #[arg(long, value_parser = parse_day)]
        to: Option<NaiveDate>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Tasks of a project
    Project { name: String },

    /// Tasks with a context
    Context { name: String },

    /// Tasks with a priority
    Priority { level: u8 },

    /// Tasks carrying tags
    Tag {
        #[arg(required = true)]
        tags: Vec<String>,

        /// Require every tag instead of any
        #[arg(long)]
        all: bool,
    },

    /// Substring search
    Search {
        text: String,

        /// Fields to search (content, tags, project, context)
        #[arg(long = "in", value_delimiter = ',')]
        fields: Vec<String>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Open tasks due today
    Today,

    /// Open tasks past their due date
    Overdue,

    /// Open tasks due in the next days
    Upcoming {
        #[arg(long, default_value_t = 7)]
        days: u64,
    },
}

#[derive(Subcommand, Debug)]
pub enum CalendarCommands {
    /// Calendar tasks overlapping a range
    Events {
        #[arg(long, value_parser = parse_day)]
        from: Option<NaiveDate>,

        #[arg(long, value_parser = parse_day)]
        to: Option<NaiveDate>,
    },

    /// Per-source event counts for badge sources on one day
    Badges {
        #[arg(long, value_parser = parse_day)]
        date: Option<NaiveDate>,
    },

    /// Fetch calendar sources now
    Refresh {
        /// Source id (all enabled sources when omitted)
        source: Option<String>,
    },

    /// Fetch state of every source
    Status,
}

impl Cli {
    /// Execute the CLI command
    pub fn run(self) -> Result<()> {
        let root = match self.root {
            Some(path) => path,
            None => std::env::current_dir()?,
        };
        let context = Context {
            root,
            output: OutputOptions {
                json: self.json,
                quiet: self.quiet,
            },
            events: EventDestination::parse(self.events.as_deref()),
        };

        if let Commands::Init = self.command {
            return init::run(&context);
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        runtime.block_on(dispatch(context, self.command))
    }
}

async fn dispatch(context: Context, command: Commands) -> Result<()> {
    let mut session = Session::open(&context).await?;
    let result = match command {
        Commands::Init => Ok(()),
        Commands::Scan => scan::run_scan(&session),
        Commands::Rebuild { force } => scan::run_rebuild(&mut session, force).await,
        Commands::List {
            file,
            status,
            limit,
        } => list::run_list(
            &session,
            list::ListOptions {
                file,
                status,
                limit,
            },
        ),
        Commands::Show { id } => list::run_show(&session, &id),
        Commands::Query(cmd) => query::run(&session, cmd),
        Commands::Tags => list::run_tags(&session),
        Commands::Calendar(cmd) => calendar::run(&session, cmd).await,
        Commands::Add {
            content,
            file,
            heading,
            parent,
            priority,
            start,
            due,
            scheduled,
            project,
            context,
            tags,
            every,
        } => {
            task::run_add(
                &session,
                task::AddOptions {
                    content,
                    file,
                    heading,
                    parent,
                    priority,
                    start,
                    due,
                    scheduled,
                    project,
                    context,
                    tags,
                    every,
                },
            )
            .await
        }
        Commands::Done { ids, undo } => task::run_done(&session, &ids, undo).await,
        Commands::Update {
            id,
            content,
            status,
            priority,
            start,
            due,
            scheduled,
            project,
            context,
            tags,
            every,
            clear,
        } => {
            task::run_update(
                &session,
                task::UpdateOptions {
                    id,
                    content,
                    status,
                    priority,
                    start,
                    due,
                    scheduled,
                    project,
                    context,
                    tags,
                    every,
                    clear,
                },
            )
            .await
        }
        Commands::Delete { id, children } => task::run_delete(&session, &id, children).await,
        Commands::Postpone { ids, by } => task::run_postpone(&session, &ids, &by).await,
        Commands::Replace {
            find,
            replacement,
            ids,
        } => task::run_replace(&session, &ids, &find, &replacement).await,
        Commands::Watch => watch::run(&mut session).await,
        Commands::Status => status::run(&session),
    };
    session.close().await;
    result
}

/// Global options shared by every command.
pub(crate) struct Context {
    pub root: PathBuf,
    pub output: OutputOptions,
    pub events: Option<EventDestination>,
}

/// An initialized engine for the duration of one command.
pub(crate) struct Session {
    pub engine: Orchestrator,
    pub output: OutputOptions,
    pub init: InitReport,
    forwarder: Option<JoinHandle<()>>,
}

impl Session {
    async fn open(context: &Context) -> Result<Self> {
        let mut engine = Orchestrator::open(context.root.clone())?;
        let forwarder = match &context.events {
            Some(destination) => Some(spawn_forwarder(&engine, destination)?),
            None => None,
        };
        let init = match engine.initialize().await {
            Ok(init) => init,
            Err(err) => {
                engine.cleanup().await;
                return Err(err);
            }
        };
        Ok(Self {
            engine,
            output: context.output,
            init,
            forwarder,
        })
    }

    pub fn forwarding_events(&self) -> bool {
        self.forwarder.is_some()
    }

    /// Stop the engine, then let the forwarder drain what was already
    /// published.
    async fn close(self) {
        let Session {
            mut engine,
            forwarder,
            ..
        } = self;
        engine.cleanup().await;
        drop(engine);
        if let Some(forwarder) = forwarder {
            if let Err(err) = forwarder.await {
                debug!(error = %err, "event forwarder ended");
            }
        }
    }
}

fn spawn_forwarder(engine: &Orchestrator, destination: &EventDestination) -> Result<JoinHandle<()>> {
    let mut sink = destination.open()?;
    let mut receiver = engine.subscribe();
    Ok(tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if let Err(err) = sink.emit(&event) {
                        warn!(error = %err, "failed to write event");
                        return;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    }))
}

/// `today` or `YYYY-MM-DD`.
fn parse_day(raw: &str) -> std::result::Result<NaiveDate, String> {
    if raw.trim().eq_ignore_ascii_case("today") {
        return Ok(dates::today());
    }
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| format!("expected YYYY-MM-DD, got '{raw}'"))
}

/// Turn a failed write result into a command error.
pub(crate) fn write_failed(message: Option<String>) -> Error {
    Error::OperationFailed(message.unwrap_or_else(|| "write failed".to_string()))
}
