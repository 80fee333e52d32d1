//! Non-fatal, reportable conditions.
//!
//! Parse problems, unreadable files and failed calendar fetches all travel
//! through this one shape so callers can surface them uniformly.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::task::ICS_URI_SCHEME;

/// Entries kept by a [`DiagnosticLog`]; the oldest are dropped first.
pub const DIAGNOSTIC_LOG_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// A line or frontmatter block could not be interpreted.
    Parse,
    /// A corpus file could not be read; its previous entries are kept.
    Read,
    /// A calendar fetch failed or timed out; the previous snapshot is kept.
    Fetch,
    /// The version record was unreadable and has been recovered.
    Storage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// File path or `ics://<source>` URI.
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            source: source.into(),
            line: None,
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn at_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }
}

/// Shared, bounded record of the diagnostics currently in effect.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticLog {
    entries: Arc<Mutex<VecDeque<Diagnostic>>>,
}

impl DiagnosticLog {
    fn lock(&self) -> MutexGuard<'_, VecDeque<Diagnostic>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, diagnostic: Diagnostic) {
        let mut entries = self.lock();
        entries.push_back(diagnostic);
        while entries.len() > DIAGNOSTIC_LOG_CAPACITY {
            entries.pop_front();
        }
    }

    /// Drop what is known about `source` and record `fresh` instead.
    pub fn replace_source(&self, source: &str, fresh: impl IntoIterator<Item = Diagnostic>) {
        self.lock().retain(|entry| entry.source != source);
        for diagnostic in fresh {
            self.record(diagnostic);
        }
    }

    /// Replace every corpus file diagnostic. Calendar and storage entries
    /// are kept.
    pub fn replace_corpus(&self, fresh: impl IntoIterator<Item = Diagnostic>) {
        self.lock().retain(|entry| {
            entry.kind == DiagnosticKind::Storage || entry.source.starts_with(ICS_URI_SCHEME)
        });
        for diagnostic in fresh {
            self.record(diagnostic);
        }
    }

    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
