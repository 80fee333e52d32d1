//! Configuration loading and management
//!
//! Handles parsing of `.taskflow.toml` at the corpus root.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::task::{ShowType, TaskStatus};

/// Config file name looked up at the corpus root
pub const CONFIG_FILE_NAME: &str = ".taskflow.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Task line parsing
    #[serde(default)]
    pub parser: ParserConfig,

    /// Project resolution policy
    #[serde(default)]
    pub project: ProjectConfig,

    /// Corpus scanning and rebuild behavior
    #[serde(default)]
    pub index: IndexConfig,

    /// Source file mutation
    #[serde(default)]
    pub write: WriteConfig,

    /// Calendar feeds
    #[serde(default)]
    pub ics: IcsConfig,
}

/// Metadata syntax preference.
///
/// `Tasks` parses both syntaxes and writes emoji markers; `Dataview` parses
/// and writes bracketed `[key:: value]` fields only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataFormat {
    #[default]
    Tasks,
    Dataview,
}

/// Parser configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParserConfig {
    #[serde(default)]
    pub format: MetadataFormat,

    #[serde(default = "default_true")]
    pub parse_tags: bool,

    #[serde(default = "default_true")]
    pub parse_headings: bool,

    /// Checkbox marks per lifecycle status
    #[serde(default)]
    pub status_marks: StatusMarks,

    /// Tag prefix that marks an explicit project (`#project/name`)
    #[serde(default = "default_project_prefix")]
    pub project_prefix: String,

    /// Token prefix that marks a context (`@home`)
    #[serde(default = "default_context_prefix")]
    pub context_prefix: String,

    /// Tag prefix that marks an area (`#area/name`)
    #[serde(default = "default_area_prefix")]
    pub area_prefix: String,

    /// Width a tab counts for when measuring indentation
    #[serde(default = "default_max_indent_size")]
    pub max_indent_size: usize,
}

fn default_true() -> bool {
    true
}

fn default_project_prefix() -> String {
    "project".to_string()
}

fn default_context_prefix() -> String {
    "@".to_string()
}

fn default_area_prefix() -> String {
    "area".to_string()
}

fn default_max_indent_size() -> usize {
    4
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            format: MetadataFormat::default(),
            parse_tags: true,
            parse_headings: true,
            status_marks: StatusMarks::default(),
            project_prefix: default_project_prefix(),
            context_prefix: default_context_prefix(),
            area_prefix: default_area_prefix(),
            max_indent_size: default_max_indent_size(),
        }
    }
}

/// Checkbox marks per status. The first mark of each set is used when writing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMarks {
    #[serde(default = "default_marks_completed")]
    pub completed: String,
    #[serde(default = "default_marks_in_progress")]
    pub in_progress: String,
    #[serde(default = "default_marks_abandoned")]
    pub abandoned: String,
    #[serde(default = "default_marks_planned")]
    pub planned: String,
    #[serde(default = "default_marks_not_started")]
    pub not_started: String,
}

fn default_marks_completed() -> String {
    "xX".to_string()
}

fn default_marks_in_progress() -> String {
    ">/".to_string()
}

fn default_marks_abandoned() -> String {
    "-".to_string()
}

fn default_marks_planned() -> String {
    "?".to_string()
}

fn default_marks_not_started() -> String {
    " ".to_string()
}

impl Default for StatusMarks {
    fn default() -> Self {
        Self {
            completed: default_marks_completed(),
            in_progress: default_marks_in_progress(),
            abandoned: default_marks_abandoned(),
            planned: default_marks_planned(),
            not_started: default_marks_not_started(),
        }
    }
}

impl StatusMarks {
    pub fn status_for(&self, mark: char) -> TaskStatus {
        if self.completed.contains(mark) {
            TaskStatus::Completed
        } else if self.in_progress.contains(mark) {
            TaskStatus::InProgress
        } else if self.abandoned.contains(mark) {
            TaskStatus::Abandoned
        } else if self.planned.contains(mark) {
            TaskStatus::Planned
        } else if self.not_started.contains(mark) {
            TaskStatus::NotStarted
        } else {
            TaskStatus::Other(mark)
        }
    }

    pub fn mark_for(&self, status: TaskStatus) -> char {
        let set = match status {
            TaskStatus::Completed => &self.completed,
            TaskStatus::InProgress => &self.in_progress,
            TaskStatus::Abandoned => &self.abandoned,
            TaskStatus::Planned => &self.planned,
            TaskStatus::NotStarted => &self.not_started,
            TaskStatus::Other(mark) => return mark,
        };
        set.chars().next().unwrap_or(' ')
    }

    fn validate(&self) -> Result<()> {
        let sets = [
            ("completed", &self.completed),
            ("in_progress", &self.in_progress),
            ("abandoned", &self.abandoned),
            ("planned", &self.planned),
            ("not_started", &self.not_started),
        ];
        let mut seen = HashSet::new();
        for (name, marks) in sets {
            if marks.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "parser.status_marks.{name} cannot be empty"
                )));
            }
            for mark in marks.chars() {
                if mark == ']' || mark == '[' {
                    return Err(Error::InvalidConfig(format!(
                        "parser.status_marks.{name} cannot contain brackets"
                    )));
                }
                if !seen.insert(mark) {
                    return Err(Error::InvalidConfig(format!(
                        "parser.status_marks: mark '{mark}' is assigned twice"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Project resolution policy. Every mechanism can be switched off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default = "default_true")]
    pub config_file_enabled: bool,

    /// File that declares a project for its directory
    #[serde(default = "default_config_file_name")]
    pub config_file_name: String,

    /// Walk ancestor directories when looking for the config file
    #[serde(default)]
    pub search_recursively: bool,

    #[serde(default = "default_true")]
    pub metadata_enabled: bool,

    /// Frontmatter key holding the project name
    #[serde(default = "default_metadata_key")]
    pub metadata_key: String,

    #[serde(default = "default_true")]
    pub path_mappings_enabled: bool,

    #[serde(default)]
    pub path_mappings: Vec<PathMapping>,

    #[serde(default = "default_true")]
    pub metadata_mappings_enabled: bool,

    #[serde(default)]
    pub metadata_mappings: Vec<MetadataMapping>,

    #[serde(default)]
    pub default_naming: DefaultNaming,

    /// Copy context, priority, area and tags from frontmatter into tasks
    /// that lack them
    #[serde(default = "default_true")]
    pub inherit_frontmatter: bool,
}

fn default_config_file_name() -> String {
    "project.md".to_string()
}

fn default_metadata_key() -> String {
    "project".to_string()
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            config_file_enabled: true,
            config_file_name: default_config_file_name(),
            search_recursively: false,
            metadata_enabled: true,
            metadata_key: default_metadata_key(),
            path_mappings_enabled: true,
            path_mappings: Vec::new(),
            metadata_mappings_enabled: true,
            metadata_mappings: Vec::new(),
            default_naming: DefaultNaming::default(),
            inherit_frontmatter: true,
        }
    }
}

/// Maps files under a path prefix or glob to a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathMapping {
    pub pattern: String,
    pub project: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Copies a frontmatter key onto a task metadata key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataMapping {
    pub source_key: String,
    pub target_key: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamingStrategy {
    #[default]
    Filename,
    Foldername,
    Metadata,
}

/// Fallback project name derived from the file itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultNaming {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub strategy: NamingStrategy,
    /// Frontmatter key for the `metadata` strategy
    #[serde(default)]
    pub metadata_key: Option<String>,
    #[serde(default = "default_true")]
    pub strip_extension: bool,
}

impl Default for DefaultNaming {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: NamingStrategy::default(),
            metadata_key: None,
            strip_extension: true,
        }
    }
}

impl ProjectConfig {
    pub fn validate(&self) -> Result<()> {
        if self.config_file_enabled && self.config_file_name.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "project.config_file_name cannot be empty".to_string(),
            ));
        }
        if self.metadata_enabled && self.metadata_key.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "project.metadata_key cannot be empty".to_string(),
            ));
        }
        for mapping in &self.path_mappings {
            validate_pattern(&mapping.pattern, "project.path_mappings")?;
            if mapping.project.trim().is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "project.path_mappings: project for '{}' cannot be empty",
                    mapping.pattern
                )));
            }
        }
        for mapping in &self.metadata_mappings {
            if mapping.source_key.trim().is_empty() || mapping.target_key.trim().is_empty() {
                return Err(Error::InvalidConfig(
                    "project.metadata_mappings keys cannot be empty".to_string(),
                ));
            }
        }
        if self.default_naming.enabled
            && self.default_naming.strategy == NamingStrategy::Metadata
            && self
                .default_naming
                .metadata_key
                .as_deref()
                .map(str::trim)
                .unwrap_or("")
                .is_empty()
        {
            return Err(Error::InvalidConfig(
                "project.default_naming.metadata_key is required for the metadata strategy"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Corpus scanning configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// File extensions that are parsed for tasks
    #[serde(default = "default_include_extensions")]
    pub include_extensions: Vec<String>,

    /// Glob patterns (relative to the root) that are never scanned
    #[serde(default)]
    pub ignore: Vec<String>,

    /// Files per rebuild batch
    #[serde(default = "default_rebuild_batch_size")]
    pub rebuild_batch_size: usize,

    /// State directory relative to the root
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Quiet period before a burst of file events is processed
    #[serde(default = "default_watch_debounce_ms")]
    pub watch_debounce_ms: u64,
}

fn default_include_extensions() -> Vec<String> {
    vec!["md".to_string()]
}

fn default_rebuild_batch_size() -> usize {
    50
}

fn default_state_dir() -> String {
    ".taskflow".to_string()
}

fn default_watch_debounce_ms() -> u64 {
    150
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            include_extensions: default_include_extensions(),
            ignore: Vec::new(),
            rebuild_batch_size: default_rebuild_batch_size(),
            state_dir: default_state_dir(),
            watch_debounce_ms: default_watch_debounce_ms(),
        }
    }
}

impl IndexConfig {
    fn validate(&self) -> Result<()> {
        if self.include_extensions.is_empty() {
            return Err(Error::InvalidConfig(
                "index.include_extensions cannot be empty".to_string(),
            ));
        }
        for pattern in &self.ignore {
            validate_pattern(pattern, "index.ignore")?;
        }
        if self.rebuild_batch_size == 0 {
            return Err(Error::InvalidConfig(
                "index.rebuild_batch_size must be > 0".to_string(),
            ));
        }
        if self.state_dir.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "index.state_dir cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Write-side configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteConfig {
    /// Target for new tasks when neither a file nor an active file is known
    #[serde(default = "default_write_file")]
    pub default_file: String,

    /// Heading new top-level tasks are appended under
    #[serde(default)]
    pub default_heading: Option<String>,

    /// Add or remove the completion date when the status changes
    #[serde(default = "default_true")]
    pub auto_date_completion: bool,

    /// One indentation unit for subtasks
    #[serde(default = "default_indent")]
    pub indent: String,

    /// Place new subtasks after the parent's existing children
    #[serde(default)]
    pub append_to_children: bool,
}

fn default_write_file() -> String {
    "Inbox.md".to_string()
}

fn default_indent() -> String {
    "  ".to_string()
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            default_file: default_write_file(),
            default_heading: None,
            auto_date_completion: true,
            indent: default_indent(),
            append_to_children: false,
        }
    }
}

impl WriteConfig {
    fn validate(&self) -> Result<()> {
        if self.default_file.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "write.default_file cannot be empty".to_string(),
            ));
        }
        if self.indent.is_empty() || !self.indent.chars().all(|ch| ch == ' ' || ch == '\t') {
            return Err(Error::InvalidConfig(
                "write.indent must be spaces or tabs".to_string(),
            ));
        }
        Ok(())
    }
}

/// Calendar feed configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IcsConfig {
    /// Upper bound for one fetch
    #[serde(default = "default_ics_timeout")]
    pub timeout_seconds: u64,

    /// Events kept per source after filtering
    #[serde(default = "default_max_events")]
    pub max_events_per_source: usize,

    #[serde(default)]
    pub sources: Vec<IcsSource>,
}

fn default_ics_timeout() -> u64 {
    30
}

fn default_max_events() -> usize {
    1000
}

impl Default for IcsConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_ics_timeout(),
            max_events_per_source: default_max_events(),
            sources: Vec::new(),
        }
    }
}

/// One remote calendar feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IcsSource {
    pub id: String,
    pub name: String,
    pub url: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_seconds: u64,

    #[serde(default = "default_true")]
    pub show_all_day_events: bool,

    #[serde(default = "default_true")]
    pub show_timed_events: bool,

    #[serde(default)]
    pub show_type: ShowType,

    #[serde(default)]
    pub color: Option<String>,

    /// Extra request headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub filters: IcsFilters,

    #[serde(default)]
    pub text_replacements: Vec<TextReplacement>,
}

fn default_refresh_interval() -> u64 {
    3600
}

/// Minimum refresh interval
pub const MIN_REFRESH_INTERVAL_SECONDS: u64 = 60;

/// Keyword filters applied to summary, description and location
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IcsFilters {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplacementTarget {
    #[default]
    Summary,
    Description,
    Location,
}

/// Regex rewrite applied to one event field before mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextReplacement {
    pub pattern: String,
    pub replacement: String,
    #[serde(default)]
    pub target: ReplacementTarget,
}

impl IcsSource {
    /// Minimal source with defaults for everything but identity and URL
    pub fn new(id: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            url: url.into(),
            enabled: true,
            refresh_interval_seconds: default_refresh_interval(),
            show_all_day_events: true,
            show_timed_events: true,
            show_type: ShowType::default(),
            color: None,
            headers: BTreeMap::new(),
            username: None,
            password: None,
            filters: IcsFilters::default(),
            text_replacements: Vec::new(),
        }
    }

    fn validate(&self) -> Result<()> {
        let id = self.id.trim();
        if id.is_empty() {
            return Err(Error::InvalidConfig("ics.sources.id cannot be empty".to_string()));
        }
        if !id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
        {
            return Err(Error::InvalidConfig(format!(
                "ics.sources.id '{id}' must be alphanumeric, '-' or '_'"
            )));
        }
        if self.name.trim().is_empty() {
            return Err(Error::InvalidConfig(format!(
                "ics.sources[{id}].name cannot be empty"
            )));
        }
        crate::ics::normalize_url(&self.url)?;
        if self.refresh_interval_seconds < MIN_REFRESH_INTERVAL_SECONDS {
            return Err(Error::InvalidConfig(format!(
                "ics.sources[{id}].refresh_interval_seconds must be >= {MIN_REFRESH_INTERVAL_SECONDS}"
            )));
        }
        for replacement in &self.text_replacements {
            regex::Regex::new(&replacement.pattern).map_err(|err| {
                Error::InvalidConfig(format!(
                    "ics.sources[{id}].text_replacements: invalid regex '{}': {err}",
                    replacement.pattern
                ))
            })?;
        }
        Ok(())
    }
}

impl IcsConfig {
    fn validate(&self) -> Result<()> {
        if self.timeout_seconds == 0 {
            return Err(Error::InvalidConfig(
                "ics.timeout_seconds must be > 0".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for source in &self.sources {
            source.validate()?;
            if !seen.insert(source.id.trim().to_string()) {
                return Err(Error::InvalidConfig(format!(
                    "ics.sources has duplicate id '{}'",
                    source.id
                )));
            }
        }
        Ok(())
    }
}

fn validate_pattern(pattern: &str, field: &str) -> Result<()> {
    if pattern.trim().is_empty() {
        return Err(Error::InvalidConfig(format!(
            "{field}: pattern cannot be empty"
        )));
    }
    glob::Pattern::new(pattern).map_err(|err| {
        Error::InvalidConfig(format!("{field}: invalid glob pattern '{pattern}': {err}"))
    })?;
    Ok(())
}

impl Config {
    /// Load configuration from a `.taskflow.toml` file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the corpus root, or return defaults when the
    /// file is absent
    pub fn load_from_root(root: &Path) -> Result<Self> {
        let config_path = root.join(CONFIG_FILE_NAME);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.parser.status_marks.validate()?;
        if self.parser.max_indent_size == 0 {
            return Err(Error::InvalidConfig(
                "parser.max_indent_size must be > 0".to_string(),
            ));
        }
        if self.parser.context_prefix.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "parser.context_prefix cannot be empty".to_string(),
            ));
        }
        self.project.validate()?;
        self.index.validate()?;
        self.write.validate()?;
        self.ics.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn defaults_are_expected() {
        let cfg = Config::default();
        assert_eq!(cfg.parser.format, MetadataFormat::Tasks);
        assert_eq!(cfg.parser.project_prefix, "project");
        assert_eq!(cfg.parser.context_prefix, "@");
        assert_eq!(cfg.project.config_file_name, "project.md");
        assert!(!cfg.project.search_recursively);
        assert_eq!(cfg.project.metadata_key, "project");
        assert!(!cfg.project.default_naming.enabled);
        assert_eq!(cfg.index.include_extensions, vec!["md".to_string()]);
        assert_eq!(cfg.index.rebuild_batch_size, 50);
        assert_eq!(cfg.index.state_dir, ".taskflow");
        assert_eq!(cfg.write.default_file, "Inbox.md");
        assert_eq!(cfg.write.indent, "  ");
        assert_eq!(cfg.ics.timeout_seconds, 30);
        assert!(cfg.ics.sources.is_empty());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn status_marks_map_both_ways() {
        let marks = StatusMarks::default();
        assert_eq!(marks.status_for('x'), TaskStatus::Completed);
        assert_eq!(marks.status_for('X'), TaskStatus::Completed);
        assert_eq!(marks.status_for('/'), TaskStatus::InProgress);
        assert_eq!(marks.status_for(' '), TaskStatus::NotStarted);
        assert_eq!(marks.status_for('!'), TaskStatus::Other('!'));
        assert_eq!(marks.mark_for(TaskStatus::Completed), 'x');
        assert_eq!(marks.mark_for(TaskStatus::Abandoned), '-');
    }

    #[test]
    fn load_parses_overrides() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE_NAME);
        let content = r#"
[parser]
format = "dataview"

[project]
search_recursively = true
path_mappings = [{ pattern = "work/", project = "Work" }]
metadata_mappings = [{ source_key = "proj", target_key = "project" }]

[project.default_naming]
enabled = true
strategy = "foldername"

[index]
ignore = ["archive/**"]
rebuild_batch_size = 10

[write]
default_file = "Tasks.md"
default_heading = "Inbox"

[[ics.sources]]
id = "team"
name = "Team"
url = "webcal://calendar.example.com/team.ics"
show_type = "badge"
refresh_interval_seconds = 900
"#;
        fs::write(&path, content.trim()).expect("write config");

        let cfg = Config::load(&path).expect("load config");
        assert_eq!(cfg.parser.format, MetadataFormat::Dataview);
        assert!(cfg.project.search_recursively);
        assert_eq!(cfg.project.path_mappings[0].project, "Work");
        assert!(cfg.project.path_mappings[0].enabled);
        assert_eq!(cfg.project.metadata_mappings[0].source_key, "proj");
        assert_eq!(cfg.project.default_naming.strategy, NamingStrategy::Foldername);
        assert_eq!(cfg.index.ignore, vec!["archive/**".to_string()]);
        assert_eq!(cfg.index.rebuild_batch_size, 10);
        assert_eq!(cfg.write.default_heading.as_deref(), Some("Inbox"));
        assert_eq!(cfg.ics.sources[0].show_type, ShowType::Badge);
        assert_eq!(cfg.ics.sources[0].refresh_interval_seconds, 900);
    }

    #[test]
    fn invalid_batch_size_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "[index]\nrebuild_batch_size = 0").expect("write config");

        let err = Config::load(&path).expect_err("invalid config");
        match err {
            Error::InvalidConfig(_) => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn duplicate_ics_ids_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE_NAME);
        let content = r#"
[[ics.sources]]
id = "a"
name = "A"
url = "https://example.com/a.ics"

[[ics.sources]]
id = "a"
name = "Again"
url = "https://example.com/b.ics"
"#;
        fs::write(&path, content.trim()).expect("write config");

        let err = Config::load(&path).expect_err("invalid config");
        match err {
            Error::InvalidConfig(message) => assert!(message.contains("duplicate")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn short_refresh_interval_rejected() {
        let mut cfg = Config::default();
        let mut source = IcsSource::new("a", "A", "https://example.com/a.ics");
        source.refresh_interval_seconds = 5;
        cfg.ics.sources.push(source);
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn load_from_root_defaults_when_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = Config::load_from_root(dir.path()).expect("defaults");
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn save_writes_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.toml");
        let cfg = Config::default();
        cfg.save(&path).expect("save config");

        let written = fs::read_to_string(&path).expect("read config");
        assert!(written.contains("default_file = \"Inbox.md\""));
        let reloaded = Config::load(&path).expect("reload");
        assert_eq!(reloaded, cfg);
    }
}
