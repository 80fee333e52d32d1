//! Calendar feed ingestion.
//!
//! - `parser`: RFC 5545 `VEVENT` extraction
//! - `fetch`: transport seam (HTTP, `file://`, in-memory)
//! - `source`: per-source refresh state machine and event-to-task mapping

pub mod fetch;
pub mod parser;
pub mod source;

pub use fetch::{FetchRequest, FetchResponse, Fetcher, HttpFetcher, StaticFetcher, StaticReply};
pub use parser::{IcsCalendar, IcsEvent};
pub use source::{IcsSnapshot, IcsSourceRunner, IcsUpdate, SourceState, SourceStatus};

use crate::error::{Error, Result};

/// Normalize a feed URL: `webcal(s)://` becomes `https://`; only
/// `http(s)://` and `file://` are accepted.
pub fn normalize_url(raw: &str) -> Result<String> {
    let url = raw.trim();
    let lowered = url.to_ascii_lowercase();
    let normalized = if let Some(rest) = strip_scheme(url, &lowered, "webcals://") {
        format!("https://{rest}")
    } else if let Some(rest) = strip_scheme(url, &lowered, "webcal://") {
        format!("https://{rest}")
    } else if lowered.starts_with("https://")
        || lowered.starts_with("http://")
        || lowered.starts_with("file://")
    {
        url.to_string()
    } else {
        return Err(Error::InvalidConfig(format!(
            "calendar URL '{url}' must use http, https, webcal or file"
        )));
    };

    let (scheme, rest) = normalized
        .split_once("://")
        .ok_or_else(|| Error::InvalidConfig(format!("invalid calendar URL '{url}'")))?;
    let has_host = rest
        .split(['/', '?', '#'])
        .next()
        .is_some_and(|host| !host.is_empty());
    let valid = if scheme.eq_ignore_ascii_case("file") {
        rest.len() > 1
    } else {
        has_host
    };
    if !valid {
        return Err(Error::InvalidConfig(format!("invalid calendar URL '{url}'")));
    }
    Ok(normalized)
}

fn strip_scheme<'a>(url: &'a str, lowered: &str, scheme: &str) -> Option<&'a str> {
    if lowered.starts_with(scheme) {
        url.get(scheme.len()..)
    } else {
        None
    }
}
