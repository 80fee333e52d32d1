//! Metadata token scanning for task lines.
//!
//! Shared by the parser (to extract metadata) and the line editor (to patch
//! metadata in place). All offsets are byte offsets into the task body, the
//! text after the `[ ]` checkbox.

use regex::Regex;

use crate::config::{MetadataFormat, ParserConfig};
use crate::error::Result;
use crate::task::DateField;

const VARIATION_SELECTOR: char = '\u{FE0F}';

/// Emoji markers for date fields.
pub const DATE_EMOJIS: [(&str, DateField); 6] = [
    ("📅", DateField::Due),
    ("🛫", DateField::Start),
    ("⏳", DateField::Scheduled),
    ("✅", DateField::Completed),
    ("❌", DateField::Cancelled),
    ("➕", DateField::Created),
];

/// Emoji markers for priority, highest first.
pub const PRIORITY_EMOJIS: [(&str, u8); 5] = [
    ("🔺", 5),
    ("⏫", 4),
    ("🔼", 3),
    ("🔽", 2),
    ("⏬", 1),
];

const RECURRENCE_EMOJI: &str = "🔁";
const ON_COMPLETION_EMOJI: &str = "🏁";
const DEPENDS_ON_EMOJI: &str = "⛔";
const ID_EMOJI: &str = "🆔";

/// Priority names used by the bracketed syntax, highest first.
const PRIORITY_NAMES: [(&str, u8); 5] = [
    ("highest", 5),
    ("high", 4),
    ("medium", 3),
    ("low", 2),
    ("lowest", 1),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    /// Emoji date marker. `value` holds the raw date text, possibly empty.
    Date(DateField),
    Priority(u8),
    Recurrence,
    OnCompletion,
    DependsOn,
    Id,
    /// Bracketed `[key:: value]` field.
    Field(String),
    /// `#tag` without the leading `#`.
    Tag,
    /// Context token without its prefix.
    Context,
}

impl TokenKind {
    /// Tags and contexts are also plain-text words; they only count as
    /// metadata for insertion purposes inside the trailing run.
    pub fn is_inline_word(&self) -> bool {
        matches!(self, TokenKind::Tag | TokenKind::Context)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub value: String,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anchor {
    pub id: String,
    /// Start of the whitespace preceding `^`, or of `^` itself.
    pub start: usize,
}

/// Result of scanning one task body.
#[derive(Debug, Clone, Default)]
pub struct ScannedBody {
    pub tokens: Vec<Token>,
    pub anchor: Option<Anchor>,
}

impl ScannedBody {
    /// Body length once the anchor is cut off.
    pub fn content_limit(&self, body: &str) -> usize {
        self.anchor
            .as_ref()
            .map(|anchor| anchor.start)
            .unwrap_or_else(|| body.trim_end().len())
    }

    /// Offset at which a new metadata token is inserted: after the last
    /// recognized metadata token, before the anchor, else end of line.
    pub fn insertion_offset(&self, body: &str) -> usize {
        let limit = self.content_limit(body);
        let mut best: Option<usize> = None;
        for (idx, token) in self.tokens.iter().enumerate() {
            if token.end > limit {
                continue;
            }
            let counts = !token.kind.is_inline_word() || self.only_tokens_follow(idx, body, limit);
            if counts {
                best = Some(best.map_or(token.end, |current| current.max(token.end)));
            }
        }
        best.unwrap_or(limit)
    }

    /// Whether token `idx` is metadata rather than a word of the content.
    pub fn is_metadata(&self, idx: usize, body: &str) -> bool {
        let limit = self.content_limit(body);
        !self.tokens[idx].kind.is_inline_word() || self.only_tokens_follow(idx, body, limit)
    }

    fn only_tokens_follow(&self, idx: usize, body: &str, limit: usize) -> bool {
        let mut cursor = self.tokens[idx].end;
        for token in &self.tokens[idx + 1..] {
            if token.start > limit {
                break;
            }
            if !body[cursor..token.start].trim().is_empty() {
                return false;
            }
            cursor = token.end.max(cursor);
        }
        cursor >= limit || body[cursor..limit].trim().is_empty()
    }

    /// The body with every token and the anchor removed, whitespace collapsed.
    pub fn plain_text(&self, body: &str) -> String {
        let limit = self.content_limit(body);
        let mut out = String::with_capacity(limit);
        let mut cursor = 0;
        for token in &self.tokens {
            if token.start >= limit {
                break;
            }
            if token.start > cursor {
                out.push_str(&body[cursor..token.start]);
                out.push(' ');
            }
            cursor = cursor.max(token.end);
        }
        if cursor < limit {
            out.push_str(&body[cursor..limit]);
        }
        collapse_whitespace(&out)
    }
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Compiled scanner for one parser configuration.
#[derive(Debug, Clone)]
pub struct TokenScanner {
    format: MetadataFormat,
    parse_tags: bool,
    context_prefix: String,
    field_re: Regex,
    anchor_re: Regex,
    tag_re: Regex,
    context_re: Regex,
    code_re: Regex,
    date_re: Regex,
}

impl TokenScanner {
    pub fn new(config: &ParserConfig) -> Result<Self> {
        let context_prefix = config.context_prefix.trim().to_string();
        Ok(Self {
            format: config.format,
            parse_tags: config.parse_tags,
            field_re: Regex::new(r"\[([A-Za-z][A-Za-z0-9_-]*)::\s*([^\]]*)\]")?,
            anchor_re: Regex::new(r"(?:^|\s+)\^([A-Za-z0-9_-]+)\s*$")?,
            tag_re: Regex::new(r"(?:^|\s)#([\p{L}\p{N}_/-]*[\p{L}_/-][\p{L}\p{N}_/-]*)")?,
            context_re: Regex::new(&format!(
                r"(?:^|\s){}([\p{{L}}\p{{N}}_/.-]+)",
                regex::escape(&context_prefix)
            ))?,
            code_re: Regex::new(r"`[^`]*`")?,
            date_re: Regex::new(r"^\s*(\d{4}-\d{2}-\d{2}(?:[ T]\d{2}:\d{2})?)")?,
            context_prefix,
        })
    }

    pub fn format(&self) -> MetadataFormat {
        self.format
    }

    pub fn context_prefix(&self) -> &str {
        &self.context_prefix
    }

    pub fn scan(&self, body: &str) -> ScannedBody {
        let anchor = self.anchor_re.captures(body).and_then(|caps| {
            let whole = caps.get(0)?;
            let id = caps.get(1)?;
            Some(Anchor {
                id: id.as_str().to_string(),
                start: whole.start(),
            })
        });
        let limit = anchor
            .as_ref()
            .map(|anchor| anchor.start)
            .unwrap_or(body.len());
        let scope = &body[..limit];

        let mut excluded: Vec<(usize, usize)> = self
            .code_re
            .find_iter(scope)
            .map(|m| (m.start(), m.end()))
            .collect();
        let mut tokens = Vec::new();

        for caps in self.field_re.captures_iter(scope) {
            let (Some(whole), Some(key), Some(value)) = (caps.get(0), caps.get(1), caps.get(2))
            else {
                continue;
            };
            if overlaps(&excluded, whole.start(), whole.end()) {
                continue;
            }
            tokens.push(Token {
                kind: TokenKind::Field(key.as_str().to_string()),
                value: value.as_str().trim().to_string(),
                start: whole.start(),
                end: whole.end(),
            });
        }
        excluded.extend(tokens.iter().map(|token| (token.start, token.end)));

        if self.format == MetadataFormat::Tasks {
            let emoji_tokens = self.scan_emoji(scope, &excluded);
            excluded.extend(emoji_tokens.iter().map(|token| (token.start, token.end)));
            tokens.extend(emoji_tokens);
        }

        if self.parse_tags {
            let mut words = Vec::new();
            for caps in self.tag_re.captures_iter(scope) {
                let Some(name) = caps.get(1) else { continue };
                let start = name.start() - 1;
                if overlaps(&excluded, start, name.end()) {
                    continue;
                }
                words.push(Token {
                    kind: TokenKind::Tag,
                    value: name.as_str().to_string(),
                    start,
                    end: name.end(),
                });
            }
            for caps in self.context_re.captures_iter(scope) {
                let Some(name) = caps.get(1) else { continue };
                let start = name.start() - self.context_prefix.len();
                if overlaps(&excluded, start, name.end())
                    || words.iter().any(|word| start < word.end && word.start < name.end())
                {
                    continue;
                }
                let value = name.as_str().trim_end_matches('.').to_string();
                if value.is_empty() {
                    continue;
                }
                words.push(Token {
                    kind: TokenKind::Context,
                    end: start + self.context_prefix.len() + value.len(),
                    value,
                    start,
                });
            }
            tokens.extend(words);
        }

        tokens.sort_by_key(|token| token.start);
        ScannedBody { tokens, anchor }
    }

    fn scan_emoji(&self, scope: &str, excluded: &[(usize, usize)]) -> Vec<Token> {
        let mut hits: Vec<(usize, usize, EmojiClass)> = Vec::new();
        for (emoji, class) in emoji_table() {
            for (start, _) in scope.match_indices(emoji) {
                let mut end = start + emoji.len();
                if scope[end..].starts_with(VARIATION_SELECTOR) {
                    end += VARIATION_SELECTOR.len_utf8();
                }
                if !overlaps(excluded, start, end) {
                    hits.push((start, end, class));
                }
            }
        }
        hits.sort_by_key(|hit| hit.0);

        let mut tokens = Vec::with_capacity(hits.len());
        for (idx, &(start, marker_end, class)) in hits.iter().enumerate() {
            let next_start = hits
                .get(idx + 1)
                .map(|hit| hit.0)
                .unwrap_or(scope.len())
                .min(next_excluded_start(excluded, marker_end).unwrap_or(scope.len()));
            let rest = &scope[marker_end..next_start];
            let token = match class {
                EmojiClass::Date(field) => match self.date_re.captures(rest) {
                    Some(caps) => Token {
                        kind: TokenKind::Date(field),
                        value: caps.get(1).map_or("", |m| m.as_str()).to_string(),
                        start,
                        end: marker_end + caps.get(0).map_or(0, |m| m.end()),
                    },
                    None => Token {
                        kind: TokenKind::Date(field),
                        value: String::new(),
                        start,
                        end: marker_end,
                    },
                },
                EmojiClass::Priority(level) => Token {
                    kind: TokenKind::Priority(level),
                    value: String::new(),
                    start,
                    end: marker_end,
                },
                EmojiClass::Text(kind) => {
                    let value_len = self.text_value_len(kind, rest);
                    let value = rest[..value_len].trim().to_string();
                    let end = if value.is_empty() {
                        marker_end
                    } else {
                        marker_end + value_len
                    };
                    Token {
                        kind: kind.token_kind(),
                        value,
                        start,
                        end,
                    }
                }
            };
            tokens.push(token);
        }
        tokens
    }

    /// Byte length of the value following a text marker, including the
    /// separating whitespace but not trailing whitespace.
    fn text_value_len(&self, kind: TextMarker, rest: &str) -> usize {
        let leading = rest.len() - rest.trim_start().len();
        let trimmed = &rest[leading..];
        let value_len = match kind {
            TextMarker::Id | TextMarker::OnCompletion | TextMarker::DependsOn => trimmed
                .find(char::is_whitespace)
                .unwrap_or(trimmed.len()),
            TextMarker::Recurrence => {
                let context_stop = format!(" {}", self.context_prefix);
                let stop = [trimmed.find(" #"), trimmed.find(context_stop.as_str())]
                    .into_iter()
                    .flatten()
                    .min()
                    .unwrap_or(trimmed.len());
                trimmed[..stop].trim_end().len()
            }
        };
        leading + value_len
    }
}

fn overlaps(spans: &[(usize, usize)], start: usize, end: usize) -> bool {
    spans.iter().any(|&(s, e)| start < e && s < end)
}

#[derive(Debug, Clone, Copy)]
enum TextMarker {
    Recurrence,
    OnCompletion,
    DependsOn,
    Id,
}

impl TextMarker {
    fn token_kind(self) -> TokenKind {
        match self {
            TextMarker::Recurrence => TokenKind::Recurrence,
            TextMarker::OnCompletion => TokenKind::OnCompletion,
            TextMarker::DependsOn => TokenKind::DependsOn,
            TextMarker::Id => TokenKind::Id,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum EmojiClass {
    Date(DateField),
    Priority(u8),
    Text(TextMarker),
}

fn emoji_table() -> Vec<(&'static str, EmojiClass)> {
    let mut table: Vec<(&'static str, EmojiClass)> = DATE_EMOJIS
        .iter()
        .map(|&(emoji, field)| (emoji, EmojiClass::Date(field)))
        .collect();
    table.extend(
        PRIORITY_EMOJIS
            .iter()
            .map(|&(emoji, level)| (emoji, EmojiClass::Priority(level))),
    );
    table.push((RECURRENCE_EMOJI, EmojiClass::Text(TextMarker::Recurrence)));
    table.push((ON_COMPLETION_EMOJI, EmojiClass::Text(TextMarker::OnCompletion)));
    table.push((DEPENDS_ON_EMOJI, EmojiClass::Text(TextMarker::DependsOn)));
    table.push((ID_EMOJI, EmojiClass::Text(TextMarker::Id)));
    table
}

fn next_excluded_start(excluded: &[(usize, usize)], from: usize) -> Option<usize> {
    excluded
        .iter()
        .filter(|&&(start, _)| start >= from)
        .map(|&(start, _)| start)
        .min()
}

/// Parse a priority from an emoji level, a digit, or a name.
pub fn parse_priority(raw: &str) -> Option<u8> {
    let raw = raw.trim().to_ascii_lowercase();
    if let Ok(level) = raw.parse::<u8>() {
        return (1..=5).contains(&level).then_some(level);
    }
    PRIORITY_NAMES
        .iter()
        .find(|(name, _)| *name == raw)
        .map(|&(_, level)| level)
        .or_else(|| {
            PRIORITY_EMOJIS
                .iter()
                .find(|(emoji, _)| raw.starts_with(emoji))
                .map(|&(_, level)| level)
        })
}

/// Map a bracketed field key onto a date field, if it is one.
pub fn date_field_for_key(key: &str) -> Option<DateField> {
    match key.to_ascii_lowercase().as_str() {
        "due" | "duedate" => Some(DateField::Due),
        "start" | "startdate" => Some(DateField::Start),
        "scheduled" | "scheduleddate" => Some(DateField::Scheduled),
        "completion" | "completed" | "completeddate" => Some(DateField::Completed),
        "cancelled" | "canceled" | "cancelleddate" => Some(DateField::Cancelled),
        "created" | "createddate" => Some(DateField::Created),
        _ => None,
    }
}

fn dataview_date_key(field: DateField) -> &'static str {
    match field {
        DateField::Due => "due",
        DateField::Start => "start",
        DateField::Scheduled => "scheduled",
        DateField::Completed => "completion",
        DateField::Cancelled => "cancelled",
        DateField::Created => "created",
    }
}

fn date_emoji(field: DateField) -> &'static str {
    DATE_EMOJIS
        .iter()
        .find(|(_, candidate)| *candidate == field)
        .map(|(emoji, _)| *emoji)
        .unwrap_or("📅")
}

/// Renders metadata tokens in one syntax.
#[derive(Debug, Clone)]
pub struct TokenRenderer {
    pub format: MetadataFormat,
    pub project_prefix: String,
    pub context_prefix: String,
}

impl TokenRenderer {
    pub fn new(config: &ParserConfig) -> Self {
        Self {
            format: config.format,
            project_prefix: config.project_prefix.clone(),
            context_prefix: config.context_prefix.clone(),
        }
    }

    pub fn date(&self, field: DateField, value: &str) -> String {
        match self.format {
            MetadataFormat::Tasks => format!("{} {value}", date_emoji(field)),
            MetadataFormat::Dataview => format!("[{}:: {value}]", dataview_date_key(field)),
        }
    }

    pub fn priority(&self, level: u8) -> String {
        match self.format {
            MetadataFormat::Tasks => PRIORITY_EMOJIS
                .iter()
                .find(|(_, candidate)| *candidate == level)
                .map(|(emoji, _)| emoji.to_string())
                .unwrap_or_default(),
            MetadataFormat::Dataview => {
                let name = PRIORITY_NAMES
                    .iter()
                    .find(|(_, candidate)| *candidate == level)
                    .map(|(name, _)| *name)
                    .unwrap_or("medium");
                format!("[priority:: {name}]")
            }
        }
    }

    pub fn recurrence(&self, rule: &str) -> String {
        match self.format {
            MetadataFormat::Tasks => format!("{RECURRENCE_EMOJI} {rule}"),
            MetadataFormat::Dataview => format!("[repeat:: {rule}]"),
        }
    }

    pub fn project(&self, name: &str) -> String {
        match self.format {
            MetadataFormat::Tasks => format!("#{}/{}", self.project_prefix, name.replace(' ', "-")),
            MetadataFormat::Dataview => format!("[{}:: {name}]", self.project_prefix),
        }
    }

    pub fn context(&self, name: &str) -> String {
        match self.format {
            MetadataFormat::Tasks => format!("{}{}", self.context_prefix, name.replace(' ', "-")),
            MetadataFormat::Dataview => format!("[context:: {name}]"),
        }
    }

    pub fn tag(&self, name: &str) -> String {
        format!("#{}", name.trim_start_matches('#'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanner() -> TokenScanner {
        TokenScanner::new(&ParserConfig::default()).expect("scanner")
    }

    #[test]
    fn anchor_is_detected_and_excluded() {
        let body = "Task 🛫 2024-01-01 ^blk-1";
        let scanned = scanner().scan(body);
        let anchor = scanned.anchor.as_ref().expect("anchor");
        assert_eq!(anchor.id, "blk-1");
        assert_eq!(&body[anchor.start..], " ^blk-1");
        assert_eq!(scanned.tokens.len(), 1);
        assert_eq!(scanned.tokens[0].kind, TokenKind::Date(DateField::Start));
        assert_eq!(scanned.tokens[0].value, "2024-01-01");
        assert_eq!(scanned.plain_text(body), "Task");
    }

    #[test]
    fn insertion_goes_before_anchor_without_metadata() {
        let body = "Task ^blk-1";
        let scanned = scanner().scan(body);
        assert_eq!(scanned.insertion_offset(body), 4);
    }

    #[test]
    fn insertion_goes_after_last_metadata_token() {
        let body = "Task 🛫 2024-01-01 ^blk-1";
        let scanned = scanner().scan(body);
        assert_eq!(&body[..scanned.insertion_offset(body)], "Task 🛫 2024-01-01");
    }

    #[test]
    fn inline_tags_do_not_pull_insertion_point() {
        let body = "Fix #bug in parser";
        let scanned = scanner().scan(body);
        assert_eq!(scanned.insertion_offset(body), body.len());

        let trailing = "Fix parser #bug @work";
        let scanned = scanner().scan(trailing);
        assert_eq!(scanned.insertion_offset(trailing), trailing.len());
    }

    #[test]
    fn fields_and_emoji_mixed() {
        let body = "Call Bob [due:: 2024-02-01] ⏫ 🔁 every week #home @phone";
        let scanned = scanner().scan(body);
        let kinds: Vec<&TokenKind> = scanned.tokens.iter().map(|token| &token.kind).collect();
        assert_eq!(
            kinds,
            vec![
                &TokenKind::Field("due".to_string()),
                &TokenKind::Priority(4),
                &TokenKind::Recurrence,
                &TokenKind::Tag,
                &TokenKind::Context,
            ]
        );
        assert_eq!(scanned.tokens[2].value, "every week");
        assert_eq!(scanned.plain_text(body), "Call Bob");
    }

    #[test]
    fn dataview_mode_ignores_emoji() {
        let config = ParserConfig {
            format: MetadataFormat::Dataview,
            ..ParserConfig::default()
        };
        let scanner = TokenScanner::new(&config).expect("scanner");
        let scanned = scanner.scan("Pay rent 📅 2024-01-01 [due:: 2024-01-05]");
        assert_eq!(scanned.tokens.len(), 1);
        assert_eq!(scanned.tokens[0].value, "2024-01-05");
    }

    #[test]
    fn code_spans_hide_tokens() {
        let scanned = scanner().scan("Document `#not-a-tag` usage #real");
        let tags: Vec<&str> = scanned
            .tokens
            .iter()
            .filter(|token| token.kind == TokenKind::Tag)
            .map(|token| token.value.as_str())
            .collect();
        assert_eq!(tags, vec!["real"]);
    }

    #[test]
    fn priority_parsing_accepts_all_forms() {
        assert_eq!(parse_priority("high"), Some(4));
        assert_eq!(parse_priority("2"), Some(2));
        assert_eq!(parse_priority("🔺"), Some(5));
        assert_eq!(parse_priority("9"), None);
    }
}
