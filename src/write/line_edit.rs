//! Line-level editing of task markdown.
//!
//! Everything here is pure text manipulation: the caller reads the file,
//! hands a [`Document`] to the editor and writes the result back.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::StatusMarks;
use crate::dates::{self, DateOffset};
use crate::error::{Error, Result};
use crate::parser::tokens::{self, collapse_whitespace, Token, TokenKind};
use crate::parser::{strip_tag_prefix, TaskParser, TokenRenderer};
use crate::task::{DateField, TaskStatus};

/// Set or clear one optional field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldPatch<T> {
    Set(T),
    Clear,
}

/// A partial update of one task. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskPatch {
    pub content: Option<String>,
    pub status: Option<TaskStatus>,
    /// Shorthand for `Completed` / `NotStarted` when `status` is unset.
    pub completed: Option<bool>,
    pub priority: Option<FieldPatch<u8>>,
    /// Date values are `YYYY-MM-DD`, optionally with ` HH:MM`.
    pub dates: BTreeMap<DateField, FieldPatch<String>>,
    pub project: Option<FieldPatch<String>>,
    pub context: Option<FieldPatch<String>>,
    /// Replaces the task's plain tag set.
    pub tags: Option<Vec<String>>,
    pub recurrence: Option<FieldPatch<String>>,
    /// Substring replacement over the raw text, applied after `content`.
    pub replace_text: Option<TextReplacement>,
}

/// Replace every occurrence of `find` in the editable part of a task line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextReplacement {
    pub find: String,
    pub replace: String,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn set_date(mut self, field: DateField, value: impl Into<String>) -> Self {
        self.dates.insert(field, FieldPatch::Set(value.into()));
        self
    }

    fn target_status(&self, current: TaskStatus) -> TaskStatus {
        self.status
            .or_else(|| {
                self.completed.map(|done| {
                    if done {
                        TaskStatus::Completed
                    } else {
                        TaskStatus::NotStarted
                    }
                })
            })
            .unwrap_or(current)
    }

    fn touches_date(&self, field: DateField) -> bool {
        self.dates.contains_key(&field)
    }
}

/// Result of editing one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditedLine {
    pub line: String,
    /// Next occurrence of a recurring task, to be placed above `line`.
    pub next_instance: Option<String>,
}

/// Where the index last saw a task line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineAnchor {
    /// 1-based line number in the indexed version of the file.
    pub line: usize,
    pub text: String,
    /// Content hash of the indexed version, if the file is indexed.
    pub indexed_hash: Option<String>,
    /// Rank of this line among the identical task lines of the indexed file.
    pub occurrence: Option<usize>,
    /// Number of identical task lines in the indexed file.
    pub copies: usize,
}

/// A file's lines with its newline convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    lines: Vec<String>,
    newline: &'static str,
    trailing_newline: bool,
}

impl Default for Document {
    fn default() -> Self {
        Self {
            lines: Vec::new(),
            newline: "\n",
            trailing_newline: true,
        }
    }
}

impl Document {
    pub fn parse(text: &str) -> Self {
        if text.is_empty() {
            return Self::default();
        }
        Self {
            lines: text.lines().map(str::to_string).collect(),
            newline: if text.contains("\r\n") { "\r\n" } else { "\n" },
            trailing_newline: text.ends_with('\n'),
        }
    }

    pub fn render(&self) -> String {
        let mut out = self.lines.join(self.newline);
        if self.trailing_newline && !self.lines.is_empty() {
            out.push_str(self.newline);
        }
        out
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn line(&self, idx: usize) -> Option<&str> {
        self.lines.get(idx).map(String::as_str)
    }

    pub fn insert(&mut self, idx: usize, line: String) {
        let idx = idx.min(self.lines.len());
        self.lines.insert(idx, line);
    }

    pub fn replace(&mut self, idx: usize, line: String) {
        if let Some(slot) = self.lines.get_mut(idx) {
            *slot = line;
        }
    }

    pub fn remove_range(&mut self, start: usize, end: usize) {
        let end = end.min(self.lines.len());
        if start < end {
            self.lines.drain(start..end);
        }
    }

    pub fn push(&mut self, line: String) {
        self.lines.push(line);
    }

    /// Index of the anchored line in this version of the file.
    ///
    /// An unchanged file is trusted at the indexed line number. After an
    /// outside edit the k-th identical line maps to the k-th identical line
    /// of the indexed version; if the number of identical lines changed the
    /// line is ambiguous and `None` is returned.
    pub fn locate(&self, anchor: &LineAnchor, current_hash: &str) -> Option<usize> {
        let expected = anchor.text.trim_end_matches('\r');
        let matches = |idx: usize| {
            self.lines
                .get(idx)
                .is_some_and(|line| line.trim_end_matches('\r') == expected)
        };
        let hinted = anchor.line.saturating_sub(1);
        if anchor.indexed_hash.as_deref() == Some(current_hash) && matches(hinted) {
            return Some(hinted);
        }
        let candidates: Vec<usize> = (0..self.lines.len()).filter(|&idx| matches(idx)).collect();
        match (anchor.occurrence, candidates.len()) {
            (_, 0) => None,
            (Some(rank), found) if found == anchor.copies => candidates.get(rank).copied(),
            (_, 1) if anchor.copies <= 1 => candidates.first().copied(),
            _ => None,
        }
    }

    /// End (exclusive) of the block of lines nested below `idx`.
    pub fn descendants_end(&self, parser: &TaskParser, idx: usize) -> usize {
        let Some(line) = self.lines.get(idx) else {
            return self.lines.len();
        };
        let width = parser.indent_width(leading_whitespace(line));
        let mut end = idx + 1;
        while let Some(next) = self.lines.get(end) {
            if next.trim().is_empty() || parser.indent_width(leading_whitespace(next)) <= width {
                break;
            }
            end += 1;
        }
        end
    }

    /// Insertion index at the end of the section under `heading`, or `None`
    /// if no such heading exists.
    pub fn section_append_index(&self, heading: &str) -> Option<usize> {
        let wanted = heading.trim().trim_start_matches('#').trim();
        let (start, level) = self.lines.iter().enumerate().find_map(|(idx, line)| {
            heading_of(line)
                .filter(|(_, text)| text.eq_ignore_ascii_case(wanted))
                .map(|(level, _)| (idx, level))
        })?;
        let end = self.lines[start + 1..]
            .iter()
            .position(|line| heading_of(line).is_some_and(|(other, _)| other <= level))
            .map_or(self.lines.len(), |offset| start + 1 + offset);
        let last_content = (start + 1..end)
            .rev()
            .find(|&idx| !self.lines[idx].trim().is_empty());
        Some(last_content.map_or(start + 1, |idx| idx + 1))
    }

    /// Append a level-two heading, separated from preceding text by a blank
    /// line. Returns the index just below it.
    pub fn append_heading(&mut self, heading: &str) -> usize {
        let end = self.append_index();
        self.lines.truncate(end);
        if !self.lines.is_empty() {
            self.lines.push(String::new());
        }
        self.lines
            .push(format!("## {}", heading.trim().trim_start_matches('#').trim()));
        self.lines.len()
    }

    /// Index just after the last non-blank line.
    pub fn append_index(&self) -> usize {
        self.lines
            .iter()
            .rposition(|line| !line.trim().is_empty())
            .map_or(0, |idx| idx + 1)
    }
}

fn leading_whitespace(line: &str) -> &str {
    &line[..line.len() - line.trim_start().len()]
}

fn heading_of(line: &str) -> Option<(usize, &str)> {
    let level = line.chars().take_while(|&ch| ch == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &line[level..];
    if !rest.starts_with([' ', '\t']) {
        return None;
    }
    Some((level, rest.trim().trim_end_matches('#').trim_end()))
}

#[derive(Debug, Clone, Copy)]
enum Slot<'a> {
    Date(DateField),
    Priority,
    Recurrence,
    Project,
    Context,
    Tag(&'a str),
    AnyTag,
}

/// Applies [`TaskPatch`]es to raw task lines.
#[derive(Debug, Clone)]
pub struct LineEditor {
    parser: Arc<TaskParser>,
    renderer: TokenRenderer,
    marks: StatusMarks,
    auto_dates: bool,
}

impl LineEditor {
    pub fn new(parser: Arc<TaskParser>, auto_date_completion: bool) -> Self {
        let config = parser.config();
        Self {
            renderer: TokenRenderer::new(config),
            marks: config.status_marks.clone(),
            auto_dates: auto_date_completion,
            parser,
        }
    }

    pub fn parser(&self) -> &TaskParser {
        &self.parser
    }

    /// Render a fresh task line.
    pub fn new_task_line(
        &self,
        indent: &str,
        content: &str,
        patch: &TaskPatch,
        today: NaiveDate,
    ) -> Result<String> {
        let content = clean_content(content)?;
        let base = format!(
            "{indent}- [{}] {content}",
            self.marks.mark_for(TaskStatus::NotStarted)
        );
        let patch = TaskPatch {
            content: None,
            replace_text: None,
            ..patch.clone()
        };
        Ok(self.apply(&base, &patch, today)?.line)
    }

    /// Apply `patch` to one task line.
    pub fn apply(&self, line: &str, patch: &TaskPatch, today: NaiveDate) -> Result<EditedLine> {
        let split = self
            .parser
            .split_line(line)
            .ok_or_else(|| Error::OperationFailed("line is no longer a task".into()))?;
        let old_status = self.marks.status_for(split.status_mark);
        let new_status = patch.target_status(old_status);
        let clean_head = line[..split.body_offset].to_string();
        let mut body = split.body.to_string();

        if let Some(content) = &patch.content {
            body = self.replace_content(&body, content)?;
        }
        if let Some(replacement) = &patch.replace_text {
            body = self.replace_text(&body, replacement)?;
        }
        match &patch.priority {
            Some(FieldPatch::Set(level)) => {
                if !(1..=5).contains(level) {
                    return Err(Error::InvalidArgument(format!(
                        "priority must be between 1 and 5, got {level}"
                    )));
                }
                self.set_token(&mut body, Slot::Priority, &self.renderer.priority(*level));
            }
            Some(FieldPatch::Clear) => self.clear_tokens(&mut body, Slot::Priority),
            None => {}
        }
        for (&field, value) in &patch.dates {
            match value {
                FieldPatch::Set(raw) => {
                    let raw = raw.trim();
                    if dates::parse_date(raw).is_none() {
                        return Err(Error::InvalidArgument(format!(
                            "invalid {} date '{raw}'",
                            field.as_str()
                        )));
                    }
                    self.set_token(&mut body, Slot::Date(field), &self.renderer.date(field, raw));
                }
                FieldPatch::Clear => self.clear_tokens(&mut body, Slot::Date(field)),
            }
        }
        match &patch.project {
            Some(FieldPatch::Set(name)) => {
                let name = non_empty(name, "project")?;
                self.set_token(&mut body, Slot::Project, &self.renderer.project(name));
            }
            Some(FieldPatch::Clear) => self.clear_tokens(&mut body, Slot::Project),
            None => {}
        }
        match &patch.context {
            Some(FieldPatch::Set(name)) => {
                let name = non_empty(name, "context")?;
                let name = name.trim_start_matches(self.renderer.context_prefix.as_str());
                self.set_token(&mut body, Slot::Context, &self.renderer.context(name));
            }
            Some(FieldPatch::Clear) => self.clear_tokens(&mut body, Slot::Context),
            None => {}
        }
        if let Some(tags) = &patch.tags {
            self.replace_tags(&mut body, tags);
        }
        match &patch.recurrence {
            Some(FieldPatch::Set(rule)) => {
                let rule = non_empty(rule, "recurrence")?;
                self.set_token(&mut body, Slot::Recurrence, &self.renderer.recurrence(rule));
            }
            Some(FieldPatch::Clear) => self.clear_tokens(&mut body, Slot::Recurrence),
            None => {}
        }

        let completing = new_status.is_completed() && !old_status.is_completed();
        let next_instance = if completing {
            self.next_instance(&clean_head, &body)
        } else {
            None
        };

        if self.auto_dates && new_status != old_status {
            let stamp = today.format("%Y-%m-%d").to_string();
            if completing && !patch.touches_date(DateField::Completed) {
                let token = self.renderer.date(DateField::Completed, &stamp);
                self.set_token(&mut body, Slot::Date(DateField::Completed), &token);
            }
            if old_status.is_completed()
                && !new_status.is_completed()
                && !patch.touches_date(DateField::Completed)
            {
                self.clear_tokens(&mut body, Slot::Date(DateField::Completed));
            }
            let abandoning =
                new_status == TaskStatus::Abandoned && old_status != TaskStatus::Abandoned;
            if abandoning && !patch.touches_date(DateField::Cancelled) {
                let token = self.renderer.date(DateField::Cancelled, &stamp);
                self.set_token(&mut body, Slot::Date(DateField::Cancelled), &token);
            }
            let reviving =
                old_status == TaskStatus::Abandoned && new_status != TaskStatus::Abandoned;
            if reviving && !patch.touches_date(DateField::Cancelled) {
                self.clear_tokens(&mut body, Slot::Date(DateField::Cancelled));
            }
        }

        let head = if new_status == old_status {
            clean_head
        } else {
            with_mark(
                &clean_head,
                split.status_offset,
                split.status_mark,
                self.marks.mark_for(new_status),
            )
        };
        Ok(EditedLine {
            line: join_line(&head, &body),
            next_instance,
        })
    }

    /// Replace the text of a task, keeping its metadata and anchor. Tags and
    /// contexts written inside the old text move into the metadata run unless
    /// the new text repeats them.
    fn replace_content(&self, body: &str, content: &str) -> Result<String> {
        let content = clean_content(content)?;
        let fresh = self.parser.scanner().scan(&content);
        let scanned = self.parser.scanner().scan(body);
        let limit = scanned.content_limit(body);
        let mut out = content;
        for token in &scanned.tokens {
            if token.end > limit {
                continue;
            }
            let repeated = token.kind.is_inline_word()
                && fresh
                    .tokens
                    .iter()
                    .any(|other| other.kind == token.kind && other.value == token.value);
            if repeated {
                continue;
            }
            out.push(' ');
            out.push_str(&body[token.start..token.end]);
        }
        if let Some(anchor) = &scanned.anchor {
            out.push(' ');
            out.push_str(body[anchor.start..].trim());
        }
        Ok(out)
    }

    /// Substitute text outside dates, fields and other structured tokens.
    /// Tags and contexts are plain words here, so a match may span them.
    fn replace_text(&self, body: &str, replacement: &TextReplacement) -> Result<String> {
        let TextReplacement { find, replace } = replacement;
        if find.is_empty() {
            return Err(Error::InvalidArgument("search text is empty".into()));
        }
        if replace.contains(['\n', '\r']) {
            return Err(Error::InvalidArgument(
                "task content must be a single line".into(),
            ));
        }
        let scanned = self.parser.scanner().scan(body);
        let limit = scanned.content_limit(body);
        let mut out = String::with_capacity(body.len());
        let mut cursor = 0;
        let mut hits = 0;
        for token in &scanned.tokens {
            if token.end > limit || token.kind.is_inline_word() || token.start < cursor {
                continue;
            }
            hits += splice(&mut out, &body[cursor..token.start], find, replace);
            out.push_str(&body[token.start..token.end]);
            cursor = token.end;
        }
        hits += splice(&mut out, &body[cursor..limit], find, replace);
        if hits == 0 {
            return Err(Error::InvalidArgument(format!("'{find}' not found in task")));
        }
        out.push_str(&body[limit..]);

        let rescanned = self.parser.scanner().scan(&out);
        if rescanned.plain_text(&out).is_empty() {
            return Err(Error::InvalidArgument("task content is empty".into()));
        }
        Ok(out)
    }

    fn matches(&self, slot: Slot<'_>, token: &Token) -> bool {
        let project_prefix = self.renderer.project_prefix.as_str();
        let area_prefix = self.parser.config().area_prefix.as_str();
        match (slot, &token.kind) {
            (Slot::Date(field), TokenKind::Date(found)) => field == *found,
            (Slot::Date(field), TokenKind::Field(key)) => {
                tokens::date_field_for_key(key) == Some(field)
            }
            (Slot::Priority, TokenKind::Priority(_)) => true,
            (Slot::Priority, TokenKind::Field(key)) => key.eq_ignore_ascii_case("priority"),
            (Slot::Recurrence, TokenKind::Recurrence) => true,
            (Slot::Recurrence, TokenKind::Field(key)) => {
                key.eq_ignore_ascii_case("repeat") || key.eq_ignore_ascii_case("recurrence")
            }
            (Slot::Project, TokenKind::Tag) => {
                strip_tag_prefix(&token.value, project_prefix).is_some()
            }
            (Slot::Project, TokenKind::Field(key)) => {
                key.eq_ignore_ascii_case(project_prefix) || key.eq_ignore_ascii_case("project")
            }
            (Slot::Context, TokenKind::Context) => true,
            (Slot::Context, TokenKind::Field(key)) => key.eq_ignore_ascii_case("context"),
            (Slot::Tag(name), TokenKind::Tag) => token.value == name,
            (Slot::AnyTag, TokenKind::Tag) => {
                strip_tag_prefix(&token.value, project_prefix).is_none()
                    && strip_tag_prefix(&token.value, area_prefix).is_none()
            }
            (Slot::AnyTag, TokenKind::Field(key)) => key.eq_ignore_ascii_case("tags"),
            _ => false,
        }
    }

    /// Replace the first token filling `slot`, or insert `rendered` at the
    /// metadata insertion point.
    fn set_token(&self, body: &mut String, slot: Slot<'_>, rendered: &str) {
        let scanned = self.parser.scanner().scan(body);
        match scanned.tokens.iter().find(|token| self.matches(slot, token)) {
            Some(token) => body.replace_range(token.start..token.end, rendered),
            None => {
                let at = scanned.insertion_offset(body);
                insert_token(body, at, rendered);
            }
        }
    }

    fn clear_tokens(&self, body: &mut String, slot: Slot<'_>) {
        let scanned = self.parser.scanner().scan(body);
        let ranges: Vec<(usize, usize)> = scanned
            .tokens
            .iter()
            .filter(|token| self.matches(slot, token))
            .map(|token| (token.start, token.end))
            .collect();
        for (start, end) in ranges.into_iter().rev() {
            remove_token(body, start, end);
        }
    }

    fn replace_tags(&self, body: &mut String, tags: &[String]) {
        let mut wanted: Vec<&str> = Vec::new();
        for tag in tags {
            let tag = tag.trim().trim_start_matches('#');
            if !tag.is_empty() && !wanted.contains(&tag) {
                wanted.push(tag);
            }
        }

        let scanned = self.parser.scanner().scan(body);
        let mut present: Vec<String> = Vec::new();
        let mut stale: Vec<(usize, usize)> = Vec::new();
        for token in &scanned.tokens {
            if !self.matches(Slot::AnyTag, token) {
                continue;
            }
            let keep = token.kind == TokenKind::Tag && wanted.contains(&token.value.as_str());
            if keep {
                present.push(token.value.clone());
            } else {
                stale.push((token.start, token.end));
            }
        }
        for (start, end) in stale.into_iter().rev() {
            remove_token(body, start, end);
        }
        for tag in wanted {
            if present.iter().any(|existing| existing == tag) {
                continue;
            }
            self.set_token(body, Slot::Tag(tag), &self.renderer.tag(tag));
        }
    }

    /// The next open occurrence of a recurring task: dates shifted by the
    /// rule's interval, completion bookkeeping and block anchor dropped.
    fn next_instance(&self, head: &str, body: &str) -> Option<String> {
        let scanned = self.parser.scanner().scan(body);
        let rule = scanned.tokens.iter().find_map(|token| {
            self.matches(Slot::Recurrence, token)
                .then(|| token.value.clone())
        })?;
        let Some(offset) = parse_recurrence(&rule) else {
            tracing::warn!(rule = %rule, "unsupported recurrence rule, no next instance");
            return None;
        };

        let mut next = body[..scanned.content_limit(body)].to_string();
        for field in [DateField::Completed, DateField::Cancelled] {
            self.clear_tokens(&mut next, Slot::Date(field));
        }
        for field in [DateField::Start, DateField::Scheduled, DateField::Due] {
            let scanned = self.parser.scanner().scan(&next);
            let Some(token) = scanned
                .tokens
                .iter()
                .find(|token| self.matches(Slot::Date(field), token))
            else {
                continue;
            };
            let Some(shifted) = shift_date_text(&token.value, offset) else {
                continue;
            };
            let rendered = self.renderer.date(field, &shifted);
            next.replace_range(token.start..token.end, &rendered);
        }

        let split = self.parser.split_line(head)?;
        let head = with_mark(
            head,
            split.status_offset,
            split.status_mark,
            self.marks.mark_for(TaskStatus::NotStarted),
        );
        Some(join_line(&head, next.trim_end()))
    }
}

/// Parse `every [N] day|week|month|year[s]`. Trailing qualifiers such as
/// `when done` are ignored.
pub fn parse_recurrence(rule: &str) -> Option<DateOffset> {
    let lowered = rule.trim().to_ascii_lowercase();
    let mut words = lowered.split_whitespace();
    if words.next()? != "every" {
        return None;
    }
    let mut word = words.next()?;
    let count = match word.parse::<i64>() {
        Ok(count) if count > 0 => {
            word = words.next()?;
            count
        }
        Ok(_) => return None,
        Err(_) => 1,
    };
    match word.trim_end_matches('s') {
        "day" => Some(DateOffset::Days(count)),
        "week" => Some(DateOffset::Weeks(count)),
        "month" => i32::try_from(count).ok().map(DateOffset::Months),
        "year" => i32::try_from(count).ok().map(DateOffset::Years),
        _ => None,
    }
}

/// Shift the date part of `YYYY-MM-DD[ HH:MM]`, keeping any time suffix.
fn shift_date_text(value: &str, offset: DateOffset) -> Option<String> {
    let date_part = value.get(..10)?;
    let date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()?;
    let shifted = offset.apply(date)?;
    Some(format!("{}{}", shifted.format("%Y-%m-%d"), &value[10..]))
}

fn clean_content(content: &str) -> Result<String> {
    if content.contains(['\n', '\r']) {
        return Err(Error::InvalidArgument(
            "task content must be a single line".into(),
        ));
    }
    let content = collapse_whitespace(content);
    if content.is_empty() {
        return Err(Error::InvalidArgument("task content is empty".into()));
    }
    Ok(content)
}

fn splice(out: &mut String, text: &str, find: &str, replace: &str) -> usize {
    let hits = text.matches(find).count();
    if hits == 0 {
        out.push_str(text);
    } else {
        out.push_str(&text.replace(find, replace));
    }
    hits
}

fn non_empty<'a>(value: &'a str, what: &str) -> Result<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::InvalidArgument(format!("{what} is empty")));
    }
    Ok(value)
}

fn with_mark(head: &str, offset: usize, old: char, new: char) -> String {
    let mut head = head.to_string();
    let end = offset + old.len_utf8();
    if head.is_char_boundary(offset) && end <= head.len() {
        head.replace_range(offset..end, new.encode_utf8(&mut [0; 4]));
    }
    head
}

fn join_line(head: &str, body: &str) -> String {
    if body.is_empty() || head.ends_with([' ', '\t']) {
        format!("{head}{body}")
    } else {
        format!("{head} {body}")
    }
}

fn insert_token(body: &mut String, at: usize, rendered: &str) {
    let space_before = at > 0 && !body[..at].ends_with(char::is_whitespace);
    let space_after = at < body.len() && !body[at..].starts_with(char::is_whitespace);
    let mut piece = String::with_capacity(rendered.len() + 2);
    if space_before {
        piece.push(' ');
    }
    piece.push_str(rendered);
    if space_after {
        piece.push(' ');
    }
    body.insert_str(at, &piece);
}

/// Remove `start..end` together with one adjacent space.
fn remove_token(body: &mut String, start: usize, end: usize) {
    let mut start = start;
    let mut end = end;
    if body[..start].ends_with(' ') {
        start -= 1;
    } else if body[end..].starts_with(' ') {
        end += 1;
    }
    body.replace_range(start..end, "");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MetadataFormat, ParserConfig};

    fn editor() -> LineEditor {
        let parser = TaskParser::new(&ParserConfig::default()).expect("parser");
        LineEditor::new(Arc::new(parser), true)
    }

    fn day(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").expect("date")
    }

    #[test]
    fn completion_date_goes_before_anchor() {
        let edited = editor()
            .apply(
                "- [ ] Task ^blk-1",
                &TaskPatch::status(TaskStatus::Completed),
                day("2024-01-20"),
            )
            .expect("edit");
        assert_eq!(edited.line, "- [x] Task ✅ 2024-01-20 ^blk-1");
        assert!(edited.next_instance.is_none());
    }

    #[test]
    fn cancelled_date_follows_existing_metadata() {
        let edited = editor()
            .apply(
                "- [ ] Task 🛫 2024-01-01 ^blk-1",
                &TaskPatch::status(TaskStatus::Abandoned),
                day("2024-01-20"),
            )
            .expect("edit");
        assert_eq!(edited.line, "- [-] Task 🛫 2024-01-01 ❌ 2024-01-20 ^blk-1");
    }

    #[test]
    fn reopening_removes_completion_date() {
        let patch = TaskPatch {
            completed: Some(false),
            ..TaskPatch::default()
        };
        let edited = editor()
            .apply("  - [x] Done ✅ 2024-01-20 #work", &patch, day("2024-02-01"))
            .expect("edit");
        assert_eq!(edited.line, "  - [ ] Done #work");
    }

    #[test]
    fn existing_tokens_are_replaced_in_place() {
        let patch = TaskPatch::default().set_date(DateField::Due, "2024-03-01");
        let patch = TaskPatch {
            priority: Some(FieldPatch::Set(5)),
            ..patch
        };
        let edited = editor()
            .apply("- [ ] Pay rent 📅 2024-02-01 #home", &patch, day("2024-01-01"))
            .expect("edit");
        assert_eq!(edited.line, "- [ ] Pay rent 📅 2024-03-01 #home 🔺");
    }

    #[test]
    fn content_change_keeps_metadata() {
        let patch = TaskPatch {
            content: Some("Pay the rent".into()),
            ..TaskPatch::default()
        };
        let edited = editor()
            .apply("- [ ] Pay rent 📅 2024-02-01 ^rent", &patch, day("2024-01-01"))
            .expect("edit");
        assert_eq!(edited.line, "- [ ] Pay the rent 📅 2024-02-01 ^rent");
    }

    #[test]
    fn tags_are_replaced_as_a_set() {
        let patch = TaskPatch {
            tags: Some(vec!["#b".into(), "c".into()]),
            ..TaskPatch::default()
        };
        let edited = editor()
            .apply("- [ ] Sort #a #b #project/x", &patch, day("2024-01-01"))
            .expect("edit");
        assert_eq!(edited.line, "- [ ] Sort #b #project/x #c");
    }

    #[test]
    fn recurring_task_yields_next_instance() {
        let edited = editor()
            .apply(
                "- [ ] Water plants 🔁 every 2 weeks 📅 2024-01-10 ^plants",
                &TaskPatch::status(TaskStatus::Completed),
                day("2024-01-10"),
            )
            .expect("edit");
        assert_eq!(
            edited.line,
            "- [x] Water plants 🔁 every 2 weeks 📅 2024-01-10 ✅ 2024-01-10 ^plants"
        );
        assert_eq!(
            edited.next_instance.as_deref(),
            Some("- [ ] Water plants 🔁 every 2 weeks 📅 2024-01-24")
        );
    }

    #[test]
    fn dataview_format_renders_fields() {
        let config = ParserConfig {
            format: MetadataFormat::Dataview,
            ..ParserConfig::default()
        };
        let parser = TaskParser::new(&config).expect("parser");
        let editor = LineEditor::new(Arc::new(parser), true);
        let edited = editor
            .apply(
                "- [ ] Task [due:: 2024-01-01]",
                &TaskPatch::status(TaskStatus::Completed),
                day("2024-01-20"),
            )
            .expect("edit");
        assert_eq!(
            edited.line,
            "- [x] Task [due:: 2024-01-01] [completion:: 2024-01-20]"
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        let editor = editor();
        let bad_date = TaskPatch::default().set_date(DateField::Due, "tomorrow-ish");
        assert!(matches!(
            editor.apply("- [ ] Task", &bad_date, day("2024-01-01")),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            editor.apply("plain text", &TaskPatch::default(), day("2024-01-01")),
            Err(Error::OperationFailed(_))
        ));
    }

    #[test]
    fn recurrence_rules() {
        assert_eq!(parse_recurrence("every day"), Some(DateOffset::Days(1)));
        assert_eq!(parse_recurrence("every 3 months"), Some(DateOffset::Months(3)));
        assert_eq!(parse_recurrence("Every year when done"), Some(DateOffset::Years(1)));
        assert_eq!(parse_recurrence("every weekday"), None);
        assert_eq!(parse_recurrence("daily"), None);
    }

    fn anchor(line: usize, text: &str, occurrence: usize, copies: usize) -> LineAnchor {
        LineAnchor {
            line,
            text: text.to_string(),
            indexed_hash: Some("indexed".to_string()),
            occurrence: Some(occurrence),
            copies,
        }
    }

    fn content(text: &str) -> TaskPatch {
        TaskPatch {
            content: Some(text.to_string()),
            ..TaskPatch::default()
        }
    }

    fn replacing(find: &str, replace: &str) -> TaskPatch {
        TaskPatch {
            replace_text: Some(TextReplacement {
                find: find.to_string(),
                replace: replace.to_string(),
            }),
            ..TaskPatch::default()
        }
    }

    #[test]
    fn new_content_keeps_tags_written_inside_the_old_text() {
        let line = "- [ ] Fix #bug in parser @desk 📅 2024-01-10 ^b1";
        let edited = editor()
            .apply(line, &content("Rewrite the lexer"), day("2024-01-01"))
            .expect("edit");
        assert_eq!(edited.line, "- [ ] Rewrite the lexer #bug @desk 📅 2024-01-10 ^b1");

        let edited = editor()
            .apply(line, &content("Fix #bug in lexer"), day("2024-01-01"))
            .expect("edit");
        assert_eq!(edited.line, "- [ ] Fix #bug in lexer @desk 📅 2024-01-10 ^b1");
    }

    #[test]
    fn text_replacement_edits_raw_text_around_tokens() {
        let line = "- [ ] Fix #bug in parser 📅 2024-01-10 ^b1";
        let edited = editor()
            .apply(line, &replacing("parser", "lexer"), day("2024-01-01"))
            .expect("edit");
        assert_eq!(edited.line, "- [ ] Fix #bug in lexer 📅 2024-01-10 ^b1");

        let edited = editor()
            .apply(line, &replacing("#bug in", "#issue in"), day("2024-01-01"))
            .expect("edit");
        assert_eq!(edited.line, "- [ ] Fix #issue in parser 📅 2024-01-10 ^b1");

        assert!(editor()
            .apply(line, &replacing("2024", "2025"), day("2024-01-01"))
            .is_err());
        assert!(editor()
            .apply(line, &replacing("b1", "b2"), day("2024-01-01"))
            .is_err());
    }

    #[test]
    fn unchanged_documents_trust_the_indexed_line() {
        let doc = Document::parse("- [ ] A
- [ ] B
- [ ] A
");
        assert_eq!(doc.locate(&anchor(3, "- [ ] A", 1, 2), "indexed"), Some(2));
        assert_eq!(doc.render(), "- [ ] A
- [ ] B
- [ ] A
");
    }

    #[test]
    fn moved_duplicates_keep_their_order() {
        let doc = Document::parse("Header
- [ ] A
- [ ] B
- [ ] A
");
        assert_eq!(doc.locate(&anchor(1, "- [ ] A", 0, 2), "edited"), Some(1));
        assert_eq!(doc.locate(&anchor(3, "- [ ] A", 1, 2), "edited"), Some(3));
        assert_eq!(doc.locate(&anchor(2, "- [ ] B", 0, 1), "edited"), Some(2));
        assert_eq!(doc.locate(&anchor(2, "- [ ] C", 0, 1), "edited"), None);
    }

    #[test]
    fn changed_duplicate_counts_are_ambiguous() {
        let doc = Document::parse("- [ ] A
- [ ] A
");
        assert_eq!(doc.locate(&anchor(1, "- [ ] A", 0, 1), "edited"), None);
        let doc = Document::parse("- [ ] A
");
        assert_eq!(doc.locate(&anchor(3, "- [ ] A", 1, 2), "edited"), None);
    }

    #[test]
    fn document_sections_and_children() {
        let parser = TaskParser::new(&ParserConfig::default()).expect("parser");
        let doc = Document::parse(
            "## Work\n- [ ] A\n  - [ ] A1\n    - [ ] A1a\n- [ ] B\n\n## Home\n- [ ] C\n",
        );
        assert_eq!(doc.descendants_end(&parser, 1), 4);
        assert_eq!(doc.descendants_end(&parser, 4), 5);
        assert_eq!(doc.section_append_index("Work"), Some(5));
        assert_eq!(doc.section_append_index("## home"), Some(8));
        assert_eq!(doc.section_append_index("Garden"), None);
    }

    #[test]
    fn document_keeps_crlf() {
        let mut doc = Document::parse("- [ ] A\r\n");
        doc.push("- [ ] B".into());
        assert_eq!(doc.render(), "- [ ] A\r\n- [ ] B\r\n");
    }
}
