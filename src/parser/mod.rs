//! Task parser
//!
//! Turns one file's raw text into task records plus per-file diagnostics.
//! Parsing is a pure function of its inputs: no I/O, no shared state, so it
//! is safe to run off the worker thread.

pub mod frontmatter;
pub mod tokens;

use std::path::Path;

use regex::Regex;

use crate::config::ParserConfig;
use crate::dates;
use crate::diagnostic::{Diagnostic, DiagnosticKind};
use crate::error::Result;
use crate::task::{Task, TaskMetadata, TaskOrigin};

pub use frontmatter::Frontmatter;
pub use tokens::{ScannedBody, TokenKind, TokenRenderer, TokenScanner};

/// Kind of source file, decided from its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Markdown,
    Other,
}

impl FileKind {
    pub fn from_path(path: &Path, include_extensions: &[String]) -> Self {
        let matches = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                include_extensions
                    .iter()
                    .any(|candidate| candidate.trim_start_matches('.').eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false);
        if matches {
            FileKind::Markdown
        } else {
            FileKind::Other
        }
    }
}

/// Everything the parser extracts from one file.
#[derive(Debug, Clone, Default)]
pub struct ParseOutput {
    pub tasks: Vec<Task>,
    pub diagnostics: Vec<Diagnostic>,
    pub frontmatter: Frontmatter,
}

/// The structural parts of one checkbox line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLine<'a> {
    pub indent: &'a str,
    pub marker: &'a str,
    pub status_mark: char,
    /// Byte offset of the status mark within the line.
    pub status_offset: usize,
    pub body: &'a str,
    /// Byte offset of `body` within the line.
    pub body_offset: usize,
}

/// Compiled parser for one configuration.
#[derive(Debug, Clone)]
pub struct TaskParser {
    config: ParserConfig,
    scanner: TokenScanner,
    line_re: Regex,
    heading_re: Regex,
    fence_re: Regex,
}

impl TaskParser {
    pub fn new(config: &ParserConfig) -> Result<Self> {
        Ok(Self {
            config: config.clone(),
            scanner: TokenScanner::new(config)?,
            line_re: Regex::new(r"^([ \t]*)([-*+]|\d+[.)])[ \t]+\[(.)\][ \t]?(.*)$")?,
            heading_re: Regex::new(r"^(#{1,6})[ \t]+(.+?)[ \t#]*$")?,
            fence_re: Regex::new(r"^[ \t]*(```|~~~)")?,
        })
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    pub fn scanner(&self) -> &TokenScanner {
        &self.scanner
    }

    /// Split a line into its checkbox structure, or `None` if it is not a
    /// task line.
    pub fn split_line<'a>(&self, line: &'a str) -> Option<TaskLine<'a>> {
        let caps = self.line_re.captures(line)?;
        let indent = caps.get(1)?;
        let marker = caps.get(2)?;
        let status = caps.get(3)?;
        let body = caps.get(4)?;
        Some(TaskLine {
            indent: indent.as_str(),
            marker: marker.as_str(),
            status_mark: status.as_str().chars().next()?,
            status_offset: status.start(),
            body: body.as_str(),
            body_offset: body.start(),
        })
    }

    /// Indentation width, with tabs counted as `max_indent_size` columns.
    pub fn indent_width(&self, indent: &str) -> usize {
        indent
            .chars()
            .map(|ch| if ch == '\t' { self.config.max_indent_size } else { 1 })
            .sum()
    }

    pub fn parse(&self, file_id: &str, raw_text: &str, kind: FileKind) -> ParseOutput {
        let mut output = ParseOutput::default();
        if kind == FileKind::Other {
            output.diagnostics.push(Diagnostic::new(
                DiagnosticKind::Parse,
                file_id,
                "unsupported file kind",
            ));
            return output;
        }

        let split = frontmatter::split(raw_text);
        if let Some(error) = split.error {
            output.diagnostics.push(
                Diagnostic::new(
                    DiagnosticKind::Parse,
                    file_id,
                    format!("invalid frontmatter: {error}"),
                )
                .at_line(1),
            );
        }
        output.frontmatter = split.frontmatter;

        let mut headings: Vec<(usize, String)> = Vec::new();
        let mut ancestors: Vec<(usize, usize)> = Vec::new();
        let mut in_fence = false;

        for (idx, line) in raw_text.lines().enumerate().skip(split.lines) {
            let line_number = idx + 1;

            if self.fence_re.is_match(line) {
                in_fence = !in_fence;
                continue;
            }
            if in_fence {
                continue;
            }

            if let Some(caps) = self.heading_re.captures(line) {
                let level = caps.get(1).map_or(1, |m| m.as_str().len());
                let text = caps.get(2).map_or("", |m| m.as_str()).trim().to_string();
                if self.config.parse_headings {
                    while headings.last().is_some_and(|(top, _)| *top >= level) {
                        headings.pop();
                    }
                    headings.push((level, text));
                }
                ancestors.clear();
                continue;
            }

            let Some(task_line) = self.split_line(line) else {
                continue;
            };

            let width = self.indent_width(task_line.indent);
            while ancestors.last().is_some_and(|(top, _)| *top >= width) {
                ancestors.pop();
            }
            let parent_index = ancestors.last().map(|&(_, index)| index);

            let mut task = self.build_task(file_id, line_number, line, &task_line, &mut output);
            task.metadata.heading = headings.iter().map(|(_, text)| text.clone()).collect();
            if let Some(parent_index) = parent_index {
                let parent_id = output.tasks[parent_index].id.clone();
                output.tasks[parent_index].metadata.children.push(task.id.clone());
                task.metadata.parent = Some(parent_id);
            }

            ancestors.push((width, output.tasks.len()));
            output.tasks.push(task);
        }

        output
    }

    fn build_task(
        &self,
        file_id: &str,
        line_number: usize,
        line: &str,
        task_line: &TaskLine<'_>,
        output: &mut ParseOutput,
    ) -> Task {
        let body = task_line.body;
        let scanned = self.scanner.scan(body);
        let mut metadata = TaskMetadata {
            anchor: scanned.anchor.as_ref().map(|anchor| anchor.id.clone()),
            ..TaskMetadata::default()
        };

        for token in &scanned.tokens {
            if let Some(message) = self.apply_token(token, &mut metadata) {
                output.diagnostics.push(
                    Diagnostic::new(DiagnosticKind::Parse, file_id, message).at_line(line_number),
                );
            }
        }

        Task {
            id: Task::file_task_id(file_id, line_number),
            content: scanned.plain_text(body),
            status: self.config.status_marks.status_for(task_line.status_mark),
            status_mark: task_line.status_mark,
            source_path: file_id.to_string(),
            line_number,
            original_markdown: line.to_string(),
            metadata,
            readonly: false,
            origin: TaskOrigin::File,
        }
    }

    /// Fold one token into `metadata`. Returns a diagnostic message for
    /// values that could not be interpreted. The first occurrence of a
    /// field wins.
    fn apply_token(&self, token: &tokens::Token, metadata: &mut TaskMetadata) -> Option<String> {
        match &token.kind {
            TokenKind::Date(field) => {
                if token.value.is_empty() {
                    return Some(format!("{} marker without a date", field.as_str()));
                }
                return self.apply_date(*field, &token.value, metadata);
            }
            TokenKind::Priority(level) => {
                metadata.priority.get_or_insert(*level);
            }
            TokenKind::Recurrence => set_text(&mut metadata.recurrence, &token.value),
            TokenKind::OnCompletion => set_text(&mut metadata.on_completion, &token.value),
            TokenKind::Id => set_text(&mut metadata.task_id, &token.value),
            TokenKind::DependsOn => push_list(&mut metadata.depends_on, &token.value),
            TokenKind::Tag => self.apply_tag(&token.value, metadata),
            TokenKind::Context => set_text(&mut metadata.context, &token.value),
            TokenKind::Field(key) => return self.apply_field(key, &token.value, metadata),
        }
        None
    }

    fn apply_date(
        &self,
        field: crate::task::DateField,
        value: &str,
        metadata: &mut TaskMetadata,
    ) -> Option<String> {
        match dates::parse_date(value) {
            Some(millis) => {
                field.slot(metadata).get_or_insert(millis);
                None
            }
            None => Some(format!("invalid {} date '{value}'", field.as_str())),
        }
    }

    fn apply_tag(&self, value: &str, metadata: &mut TaskMetadata) {
        if let Some(project) = strip_tag_prefix(value, &self.config.project_prefix) {
            set_text(&mut metadata.project, project);
            return;
        }
        if let Some(area) = strip_tag_prefix(value, &self.config.area_prefix) {
            set_text(&mut metadata.area, area);
            return;
        }
        if !metadata.tags.iter().any(|tag| tag == value) {
            metadata.tags.push(value.to_string());
        }
    }

    fn apply_field(&self, key: &str, value: &str, metadata: &mut TaskMetadata) -> Option<String> {
        if let Some(field) = tokens::date_field_for_key(key) {
            return self.apply_date(field, value, metadata);
        }
        let lowered = key.to_ascii_lowercase();
        if lowered == self.config.project_prefix.to_ascii_lowercase() || lowered == "project" {
            set_text(&mut metadata.project, value);
            return None;
        }
        match lowered.as_str() {
            "priority" => match tokens::parse_priority(value) {
                Some(level) => {
                    metadata.priority.get_or_insert(level);
                }
                None => return Some(format!("invalid priority '{value}'")),
            },
            "context" => set_text(&mut metadata.context, value),
            "area" => set_text(&mut metadata.area, value),
            "tags" => {
                for tag in value.split([',', ' ']) {
                    let tag = tag.trim().trim_start_matches('#');
                    if !tag.is_empty() && !metadata.tags.iter().any(|existing| existing == tag) {
                        metadata.tags.push(tag.to_string());
                    }
                }
            }
            "repeat" | "recurrence" => set_text(&mut metadata.recurrence, value),
            "oncompletion" => set_text(&mut metadata.on_completion, value),
            "dependson" => push_list(&mut metadata.depends_on, value),
            "id" => set_text(&mut metadata.task_id, value),
            _ => {
                metadata
                    .extra
                    .entry(key.to_string())
                    .or_insert_with(|| value.to_string());
            }
        }
        None
    }
}

pub(crate) fn strip_tag_prefix<'a>(tag: &'a str, prefix: &str) -> Option<&'a str> {
    let prefix = prefix.trim_matches('#').trim_end_matches('/');
    if prefix.is_empty() || tag.len() <= prefix.len() + 1 {
        return None;
    }
    let (Some(head), Some(rest)) = (tag.get(..prefix.len()), tag.get(prefix.len()..)) else {
        return None;
    };
    if head.eq_ignore_ascii_case(prefix) {
        rest.strip_prefix('/').filter(|value| !value.is_empty())
    } else {
        None
    }
}

fn set_text(slot: &mut Option<String>, value: &str) {
    let value = value.trim();
    if slot.is_none() && !value.is_empty() {
        *slot = Some(value.to_string());
    }
}

fn push_list(list: &mut Vec<String>, value: &str) {
    for item in value.split(',') {
        let item = item.trim();
        if !item.is_empty() && !list.iter().any(|existing| existing == item) {
            list.push(item.to_string());
        }
    }
}
