//! iCalendar (RFC 5545) event parsing.
//!
//! Only the `VEVENT` properties the index projects are kept. Recurrence
//! rules are carried verbatim and never expanded.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;

use crate::dates;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IcsEvent {
    pub uid: String,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    /// Upper-cased `STATUS` value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Epoch millis.
    pub dtstart: i64,
    /// Epoch millis, defaulted when the feed omits it.
    pub dtend: i64,
    pub all_day: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rrule: Option<String>,
}

impl IcsEvent {
    pub fn is_cancelled(&self) -> bool {
        self.status.as_deref() == Some("CANCELLED")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IcsParseError {
    /// 1-based physical line the problem starts on.
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IcsCalendar {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub events: Vec<IcsEvent>,
    pub errors: Vec<IcsParseError>,
}

/// One unfolded content line.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ContentLine {
    line: usize,
    name: String,
    params: BTreeMap<String, String>,
    value: String,
}

#[derive(Debug, Default)]
struct PendingEvent {
    line: usize,
    uid: Option<String>,
    summary: Option<String>,
    description: Option<String>,
    location: Option<String>,
    categories: Vec<String>,
    status: Option<String>,
    dtstart: Option<(i64, bool)>,
    dtend: Option<(i64, bool)>,
    rrule: Option<String>,
    bad_date: Option<String>,
}

pub fn parse(content: &str) -> IcsCalendar {
    let mut calendar = IcsCalendar::default();
    let mut in_calendar = false;
    let mut current: Option<PendingEvent> = None;
    // Nested components inside a VEVENT, e.g. VALARM.
    let mut nested = 0usize;

    for (line, raw) in unfold(content) {
        if raw.trim().is_empty() {
            continue;
        }
        let Some(parsed) = parse_content_line(line, &raw) else {
            calendar.errors.push(IcsParseError {
                line,
                message: "invalid content line: missing ':'".to_string(),
            });
            continue;
        };

        match parsed.name.as_str() {
            "BEGIN" => match parsed.value.trim().to_ascii_uppercase().as_str() {
                "VCALENDAR" => in_calendar = true,
                "VEVENT" if in_calendar && current.is_none() => {
                    current = Some(PendingEvent {
                        line,
                        ..PendingEvent::default()
                    });
                }
                _ if current.is_some() => nested += 1,
                _ => {}
            },
            "END" => match parsed.value.trim().to_ascii_uppercase().as_str() {
                "VEVENT" if nested == 0 => {
                    if let Some(pending) = current.take() {
                        match finalize(pending) {
                            Ok(event) => calendar.events.push(event),
                            Err(error) => calendar.errors.push(error),
                        }
                    }
                }
                "VCALENDAR" => in_calendar = false,
                _ if nested > 0 => nested -= 1,
                _ => {}
            },
            "X-WR-CALNAME" if current.is_none() && in_calendar => {
                calendar.name = Some(unescape(&parsed.value));
            }
            _ => {
                if nested == 0 {
                    if let Some(pending) = current.as_mut() {
                        apply_property(pending, &parsed);
                    }
                }
            }
        }
    }

    if let Some(pending) = current {
        calendar.errors.push(IcsParseError {
            line: pending.line,
            message: "unterminated VEVENT".to_string(),
        });
    }
    calendar
}

/// RFC 5545 unfolding: a line starting with a space or tab continues the
/// previous one, minus that single whitespace character.
fn unfold(content: &str) -> Vec<(usize, String)> {
    let mut lines: Vec<(usize, String)> = Vec::new();
    for (idx, raw) in content.split('\n').enumerate() {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        if let Some(rest) = raw.strip_prefix([' ', '\t']) {
            if let Some((_, last)) = lines.last_mut() {
                last.push_str(rest);
                continue;
            }
        }
        lines.push((idx + 1, raw.to_string()));
    }
    lines
}

/// Split `NAME;PARAM=VALUE;...:value`, honouring quoted parameter values.
fn parse_content_line(line: usize, raw: &str) -> Option<ContentLine> {
    let mut in_quotes = false;
    let mut colon = None;
    for (idx, ch) in raw.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ':' if !in_quotes => {
                colon = Some(idx);
                break;
            }
            _ => {}
        }
    }
    let colon = colon?;
    let (head, value) = (&raw[..colon], &raw[colon + 1..]);

    let mut parts = split_unquoted(head, ';').into_iter();
    let name = parts.next()?.trim().to_ascii_uppercase();
    if name.is_empty() {
        return None;
    }
    let params = parts
        .filter_map(|part| {
            let (key, value) = part.split_once('=')?;
            Some((
                key.trim().to_ascii_uppercase(),
                value.trim().trim_matches('"').to_string(),
            ))
        })
        .collect();

    Some(ContentLine {
        line,
        name,
        params,
        value: value.to_string(),
    })
}

fn split_unquoted(text: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (idx, ch) in text.char_indices() {
        if ch == '"' {
            in_quotes = !in_quotes;
        } else if ch == separator && !in_quotes {
            parts.push(&text[start..idx]);
            start = idx + ch.len_utf8();
        }
    }
    parts.push(&text[start..]);
    parts
}

fn apply_property(event: &mut PendingEvent, line: &ContentLine) {
    match line.name.as_str() {
        "UID" => event.uid = Some(line.value.trim().to_string()),
        "SUMMARY" => event.summary = Some(unescape(&line.value)),
        "DESCRIPTION" => event.description = Some(unescape(&line.value)),
        "LOCATION" => event.location = Some(unescape(&line.value)),
        "STATUS" => event.status = Some(line.value.trim().to_ascii_uppercase()),
        "RRULE" => event.rrule = Some(line.value.trim().to_string()),
        "CATEGORIES" => {
            for category in split_escaped_list(&line.value) {
                if !category.is_empty() && !event.categories.contains(&category) {
                    event.categories.push(category);
                }
            }
        }
        "DTSTART" | "DTEND" => match parse_date_value(&line.value, &line.params) {
            Some(value) => {
                if line.name == "DTSTART" {
                    event.dtstart = Some(value);
                } else {
                    event.dtend = Some(value);
                }
            }
            None => {
                event.bad_date = Some(format!("invalid {} '{}'", line.name, line.value.trim()));
            }
        },
        _ => {}
    }
}

fn finalize(event: PendingEvent) -> Result<IcsEvent, IcsParseError> {
    let fail = |message: String| IcsParseError {
        line: event.line,
        message,
    };
    let uid = event
        .uid
        .clone()
        .filter(|uid| !uid.is_empty())
        .ok_or_else(|| fail("VEVENT without UID".to_string()))?;
    let Some((dtstart, all_day)) = event.dtstart else {
        let reason = event
            .bad_date
            .clone()
            .unwrap_or_else(|| "VEVENT without DTSTART".to_string());
        return Err(fail(format!("{reason} (uid {uid})")));
    };
    let dtend = match event.dtend {
        Some((end, _)) => end,
        None if all_day => dtstart + Duration::days(1).num_milliseconds(),
        None => dtstart,
    };

    Ok(IcsEvent {
        uid,
        summary: event.summary.unwrap_or_default(),
        description: event.description.filter(|text| !text.is_empty()),
        location: event.location.filter(|text| !text.is_empty()),
        categories: event.categories,
        status: event.status,
        dtstart,
        dtend,
        all_day,
        rrule: event.rrule,
    })
}

/// Parse a `DATE` or `DATE-TIME` value to epoch millis plus an all-day flag.
///
/// UTC values (`Z`) are exact. Floating and `TZID` values are taken as
/// local time.
pub fn parse_date_value(value: &str, params: &BTreeMap<String, String>) -> Option<(i64, bool)> {
    let value = value.trim();
    let date_only = params
        .get("VALUE")
        .is_some_and(|kind| kind.eq_ignore_ascii_case("DATE"))
        || (value.len() == 8 && value.bytes().all(|byte| byte.is_ascii_digit()));

    if date_only {
        let date = NaiveDate::parse_from_str(value.get(..8)?, "%Y%m%d").ok()?;
        return dates::local_midnight(date).map(|millis| (millis, true));
    }

    let (text, utc) = match value.strip_suffix(['Z', 'z']) {
        Some(stripped) => (stripped, true),
        None => (value, false),
    };
    let datetime = NaiveDateTime::parse_from_str(text, "%Y%m%dT%H%M%S")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y%m%dT%H%M"))
        .ok()?;
    let millis = if utc {
        Utc.from_utc_datetime(&datetime).timestamp_millis()
    } else {
        dates::local_millis(datetime)?
    };
    Some((millis, false))
}

/// Undo RFC 5545 text escaping.
pub fn unescape(text: &str) -> String {
    if !text.contains('\\') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(',') => out.push(','),
            Some(';') => out.push(';'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Split a comma list, leaving escaped commas in place.
fn split_escaped_list(value: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for ch in value.chars() {
        if escaped {
            current.push('\\');
            current.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == ',' {
            items.push(unescape(current.trim()));
            current.clear();
        } else {
            current.push(ch);
        }
    }
    items.push(unescape(current.trim()));
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nX-WR-CALNAME:Work\r\nBEGIN:VEVENT\r\nUID:evt-1\r\nSUMMARY:Team sync\\, weekly\r\nDESCRIPTION:Line one\\nline\r\n  two\r\nLOCATION:Room 4\r\nCATEGORIES:Meetings,Work\r\nDTSTART:20240115T090000Z\r\nDTEND:20240115T100000Z\r\nRRULE:FREQ=WEEKLY\r\nBEGIN:VALARM\r\nDESCRIPTION:alarm\r\nEND:VALARM\r\nEND:VEVENT\r\nBEGIN:VEVENT\r\nUID:evt-2\r\nSUMMARY:Holiday\r\nDTSTART;VALUE=DATE:20240120\r\nSTATUS:cancelled\r\nEND:VEVENT\r\nBEGIN:VEVENT\r\nSUMMARY:No uid\r\nDTSTART:20240101T000000\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";

    #[test]
    fn parses_events_and_reports_bad_ones() {
        let calendar = parse(FEED);
        assert_eq!(calendar.name.as_deref(), Some("Work"));
        assert_eq!(calendar.events.len(), 2);
        assert_eq!(calendar.errors.len(), 1);
        assert!(calendar.errors[0].message.contains("UID"));

        let sync = &calendar.events[0];
        assert_eq!(sync.summary, "Team sync, weekly");
        assert_eq!(sync.description.as_deref(), Some("Line one\nline two"));
        assert_eq!(sync.categories, vec!["Meetings".to_string(), "Work".to_string()]);
        assert_eq!(sync.dtend - sync.dtstart, 60 * 60 * 1000);
        assert!(!sync.all_day);
        assert_eq!(sync.rrule.as_deref(), Some("FREQ=WEEKLY"));
        let start = Utc.timestamp_millis_opt(sync.dtstart).single().expect("utc");
        assert_eq!(start.to_rfc3339(), "2024-01-15T09:00:00+00:00");
    }

    #[test]
    fn all_day_events_default_end_to_next_day() {
        let calendar = parse(FEED);
        let holiday = &calendar.events[1];
        assert!(holiday.all_day);
        assert!(holiday.is_cancelled());
        assert_eq!(
            dates::local_day(holiday.dtstart),
            NaiveDate::from_ymd_opt(2024, 1, 20)
        );
        assert_eq!(holiday.dtend - holiday.dtstart, 24 * 60 * 60 * 1000);
    }

    #[test]
    fn tzid_and_floating_times_are_local() {
        let mut params = BTreeMap::new();
        params.insert("TZID".to_string(), "Europe/Berlin".to_string());
        let (tzid, all_day) = parse_date_value("20240301T083000", &params).expect("tzid");
        assert!(!all_day);
        let floating = parse_date_value("20240301T083000", &BTreeMap::new()).expect("floating");
        assert_eq!(tzid, floating.0);
        assert_eq!(Some(tzid), dates::parse_date("2024-03-01 08:30"));
        assert!(parse_date_value("2024-03-01", &BTreeMap::new()).is_none());
    }

    #[test]
    fn quoted_params_may_contain_colons() {
        let line = parse_content_line(1, "ATTENDEE;CN=\"Doe: Jane\":mailto:jane@example.com")
            .expect("line");
        assert_eq!(line.name, "ATTENDEE");
        assert_eq!(line.params.get("CN").map(String::as_str), Some("Doe: Jane"));
        assert_eq!(line.value, "mailto:jane@example.com");
    }

    #[test]
    fn unescape_handles_all_sequences() {
        assert_eq!(unescape(r"a\,b\;c\\d\ne"), "a,b;c\\d\ne");
        assert_eq!(split_escaped_list(r"one\,two,three"), vec!["one,two", "three"]);
    }
}
