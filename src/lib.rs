//! taskflow - Markdown task indexing library
//!
//! This library provides the engine behind the taskflow CLI: it scans a
//! folder of markdown notes for checklist tasks, keeps an in-memory index of
//! them current as files change, merges tasks from calendar feeds and writes
//! edits back to the exact source lines.
//!
//! # Core Concepts
//!
//! - **Task**: one checklist line with typed metadata, keyed `path:L<line>`
//! - **Repository**: the single in-memory index with per-field lookups
//! - **Project resolution**: explicit, path, config file, frontmatter, default
//! - **Calendar sources**: ICS feeds fetched on timers into readonly tasks
//! - **Rebuild**: a full scan published atomically, triggered by version changes
//!
//! # Module Organization
//!
//! - `cli`: Command-line interface using clap
//! - `config`: Configuration loading from `.taskflow.toml`
//! - `error`: Error types and result aliases
//! - `parser`: Task line, metadata token and frontmatter parsing
//! - `resolver`: Project resolution policy
//! - `indexer`: Turning one corpus file into tasks
//! - `repository`: The shared task index
//! - `rebuild`: Full scans with coalescing and emergency fallback
//! - `version`: Schema/app version records that force rebuilds
//! - `ics`: Calendar fetching, parsing and refresh scheduling
//! - `query`: Read-side projections
//! - `write`: Line-preserving task edits
//! - `worker`: The index worker that serializes every mutation
//! - `watch`: Debounced filesystem watching
//! - `orchestrator`: Engine lifecycle
//! - `storage`: Corpus enumeration and state files
//! - `lock`: File locking and atomic writes for concurrency safety

pub mod cli;
pub mod config;
pub mod dates;
pub mod diagnostic;
pub mod error;
pub mod events;
pub mod ics;
pub mod indexer;
pub mod lock;
pub mod orchestrator;
pub mod output;
pub mod parser;
pub mod query;
pub mod rebuild;
pub mod repository;
pub mod resolver;
pub mod storage;
pub mod task;
pub mod version;
pub mod watch;
pub mod worker;
pub mod write;

pub use config::Config;
pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, OrchestratorOptions};
pub use query::QueryApi;
pub use task::{Task, TaskStatus};
pub use write::WriteApi;
