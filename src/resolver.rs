//! Project resolution
//!
//! [`Resolver`] is the pure precedence chain that picks a task's effective
//! project. [`ProjectConfigLoader`] does the I/O: it finds and caches the
//! per-directory project config files the chain consumes.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::{NamingStrategy, ProjectConfig};
use crate::error::{Error, Result};
use crate::parser::frontmatter::{self, Frontmatter};
use crate::parser::tokens;
use crate::task::{ProjectSource, ResolvedProject, Task};

/// Keys copied from frontmatter into tasks that lack them.
const INHERITABLE_KEYS: [&str; 4] = ["context", "priority", "area", "tags"];

/// A parsed project config file.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectConfigFile {
    /// Corpus-relative path of the config file.
    pub path: String,
    /// Corpus-relative directory the config applies to (`""` for the root).
    pub directory: String,
    pub project: Option<String>,
    /// Remaining frontmatter keys.
    pub metadata: BTreeMap<String, String>,
}

impl ProjectConfigFile {
    /// Parse a config file body. The project comes from frontmatter
    /// `project:` or, failing that, a `project: Name` line.
    pub fn parse(path: &str, directory: &str, text: &str) -> Self {
        let split = frontmatter::split(text);
        let mut metadata: BTreeMap<String, String> = split
            .frontmatter
            .iter()
            .map(|(key, value)| (key.clone(), value.to_text()))
            .collect();
        let mut project = metadata
            .remove("project")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        if project.is_none() {
            project = text.lines().skip(split.lines).find_map(|line| {
                let (key, value) = line.split_once(':')?;
                let key = key.trim().trim_start_matches(['-', '*']).trim();
                if !key.eq_ignore_ascii_case("project") {
                    return None;
                }
                let value = value.trim();
                (!value.is_empty()).then(|| value.to_string())
            });
        }

        Self {
            path: path.to_string(),
            directory: directory.to_string(),
            project,
            metadata,
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledMapping {
    pattern: String,
    glob: glob::Pattern,
    project: String,
}

/// Pure precedence chain over a [`ProjectConfig`] snapshot.
#[derive(Debug, Clone)]
pub struct Resolver {
    config: ProjectConfig,
    mappings: Vec<CompiledMapping>,
}

impl Resolver {
    pub fn new(config: ProjectConfig) -> Result<Self> {
        let mut mappings = Vec::with_capacity(config.path_mappings.len());
        for mapping in config.path_mappings.iter().filter(|mapping| mapping.enabled) {
            let glob = glob::Pattern::new(&mapping.pattern).map_err(|err| {
                Error::InvalidConfig(format!(
                    "invalid path mapping pattern '{}': {err}",
                    mapping.pattern
                ))
            })?;
            mappings.push(CompiledMapping {
                pattern: mapping.pattern.clone(),
                glob,
                project: mapping.project.clone(),
            });
        }
        Ok(Self { config, mappings })
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    /// Effective project for `task`, or `None` if no mechanism applies.
    ///
    /// `ancestor_configs` is ordered nearest first.
    pub fn resolve(
        &self,
        task: &Task,
        file_metadata: &Frontmatter,
        ancestor_configs: &[ProjectConfigFile],
    ) -> Option<ResolvedProject> {
        if let Some(project) = non_empty(task.metadata.project.as_deref()) {
            return Some(resolved(project, ProjectSource::Explicit));
        }

        if self.config.config_file_enabled {
            if let Some(project) = ancestor_configs
                .iter()
                .find_map(|config| non_empty(config.project.as_deref()))
            {
                return Some(resolved(project, ProjectSource::ConfigFile));
            }
        }

        if let Some(project) = self.from_metadata(file_metadata) {
            return Some(resolved(project, ProjectSource::Metadata));
        }

        if self.config.path_mappings_enabled {
            if let Some(project) = self.from_path(&task.source_path) {
                return Some(resolved(project, ProjectSource::PathMapping));
            }
        }

        self.from_default_naming(&task.source_path, file_metadata)
            .map(|project| resolved(&project, ProjectSource::Default))
    }

    fn from_metadata<'a>(&self, file_metadata: &'a Frontmatter) -> Option<&'a str> {
        if self.config.metadata_enabled {
            if let Some(project) = file_metadata.get_str(&self.config.metadata_key) {
                return Some(project.trim());
            }
        }
        if self.config.metadata_mappings_enabled {
            return self
                .config
                .metadata_mappings
                .iter()
                .filter(|mapping| mapping.enabled && mapping.target_key == "project")
                .find_map(|mapping| file_metadata.get_str(&mapping.source_key))
                .map(str::trim);
        }
        None
    }

    /// Longest matching pattern wins; ties go to the first registered.
    fn from_path(&self, source_path: &str) -> Option<&str> {
        let path = normalize_path(source_path);
        let mut best: Option<&CompiledMapping> = None;
        for mapping in &self.mappings {
            if !mapping_matches(mapping, &path) {
                continue;
            }
            if best.map_or(true, |current| mapping.pattern.len() > current.pattern.len()) {
                best = Some(mapping);
            }
        }
        best.map(|mapping| mapping.project.as_str())
    }

    fn from_default_naming(&self, source_path: &str, file_metadata: &Frontmatter) -> Option<String> {
        let naming = &self.config.default_naming;
        if !naming.enabled {
            return None;
        }
        let path = Path::new(source_path);
        let name = match naming.strategy {
            NamingStrategy::Filename => {
                let name = if naming.strip_extension {
                    path.file_stem()
                } else {
                    path.file_name()
                };
                name.map(|name| name.to_string_lossy().to_string())
            }
            NamingStrategy::Foldername => path
                .parent()
                .and_then(Path::file_name)
                .map(|name| name.to_string_lossy().to_string()),
            NamingStrategy::Metadata => naming
                .metadata_key
                .as_deref()
                .and_then(|key| file_metadata.get_str(key))
                .map(|value| value.trim().to_string()),
        };
        name.filter(|name| !name.is_empty())
    }

    /// Resolve and attach the project, then copy inheritable metadata into
    /// fields the task leaves empty.
    pub fn apply(
        &self,
        task: &mut Task,
        file_metadata: &Frontmatter,
        ancestor_configs: &[ProjectConfigFile],
    ) {
        strip_inherited(task);
        task.metadata.resolved_project = self.resolve(task, file_metadata, ancestor_configs);

        if self.config.metadata_mappings_enabled {
            for mapping in &self.config.metadata_mappings {
                if !mapping.enabled || mapping.target_key == "project" {
                    continue;
                }
                if let Some(value) = file_metadata.get(&mapping.source_key) {
                    inherit(task, &mapping.target_key, &value.to_text());
                }
            }
        }

        if self.config.inherit_frontmatter {
            for key in INHERITABLE_KEYS {
                if let Some(value) = file_metadata.get(key) {
                    inherit(task, key, &value.to_text());
                }
            }
            if self.config.config_file_enabled {
                for config in ancestor_configs {
                    for key in INHERITABLE_KEYS {
                        if let Some(value) = config.metadata.get(key) {
                            inherit(task, key, value);
                        }
                    }
                }
            }
        }
    }
}

fn resolved(name: &str, source: ProjectSource) -> ResolvedProject {
    ResolvedProject {
        name: name.to_string(),
        source,
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Glob match, or a plain directory/file prefix match.
fn mapping_matches(mapping: &CompiledMapping, path: &str) -> bool {
    if mapping.glob.matches(path) {
        return true;
    }
    let prefix = mapping.pattern.trim_start_matches("./").trim_end_matches('/');
    if prefix.is_empty() {
        return false;
    }
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn normalize_path(path: &str) -> String {
    let raw = path.replace('\\', "/");
    raw.strip_prefix("./").map(str::to_string).unwrap_or(raw)
}

/// Undo a previous [`Resolver::apply`] so it can run again.
fn strip_inherited(task: &mut Task) {
    let inherited = std::mem::take(&mut task.metadata.inherited);
    let metadata = &mut task.metadata;
    for key in inherited.keys() {
        match key.as_str() {
            "context" => metadata.context = None,
            "area" => metadata.area = None,
            "priority" => metadata.priority = None,
            "tags" => metadata.tags.clear(),
            _ => {}
        }
    }
}

/// Copy `value` into the task field named `key` if that field is empty.
fn inherit(task: &mut Task, key: &str, value: &str) {
    let value = value.trim();
    if value.is_empty() {
        return;
    }
    let metadata = &mut task.metadata;
    let applied = match key {
        "context" if metadata.context.is_none() => {
            metadata.context = Some(value.trim_start_matches('@').to_string());
            true
        }
        "area" if metadata.area.is_none() => {
            metadata.area = Some(value.to_string());
            true
        }
        "priority" if metadata.priority.is_none() => match tokens::parse_priority(value) {
            Some(level) => {
                metadata.priority = Some(level);
                true
            }
            None => false,
        },
        "tags" if metadata.tags.is_empty() => {
            metadata.tags = value
                .split(',')
                .map(|tag| tag.trim().trim_start_matches('#').to_string())
                .filter(|tag| !tag.is_empty())
                .collect();
            !metadata.tags.is_empty()
        }
        "context" | "area" | "priority" | "tags" => false,
        other => !metadata.extra.contains_key(other),
    };
    if applied {
        metadata
            .inherited
            .entry(key.to_string())
            .or_insert_with(|| value.to_string());
    }
}

/// Finds and caches project config files on disk.
#[derive(Debug)]
pub struct ProjectConfigLoader {
    root: PathBuf,
    file_name: String,
    enabled: bool,
    search_recursively: bool,
    cache: HashMap<String, Option<ProjectConfigFile>>,
}

impl ProjectConfigLoader {
    pub fn new(root: impl Into<PathBuf>, config: &ProjectConfig) -> Self {
        Self {
            root: root.into(),
            file_name: config.config_file_name.clone(),
            enabled: config.config_file_enabled,
            search_recursively: config.search_recursively,
            cache: HashMap::new(),
        }
    }

    /// Adopt a new policy. The cache is dropped since the file name or the
    /// search depth may have changed.
    pub fn reconfigure(&mut self, config: &ProjectConfig) {
        self.file_name = config.config_file_name.clone();
        self.enabled = config.config_file_enabled;
        self.search_recursively = config.search_recursively;
        self.cache.clear();
    }

    /// Whether `file_id` names a project config file.
    pub fn is_config_file(&self, file_id: &str) -> bool {
        Path::new(file_id)
            .file_name()
            .is_some_and(|name| name.to_string_lossy() == self.file_name.as_str())
    }

    /// Config files that apply to `file_id`, nearest first.
    pub fn ancestors_for(&mut self, file_id: &str) -> Vec<ProjectConfigFile> {
        if !self.enabled {
            return Vec::new();
        }
        let mut directory = parent_dir(file_id);
        let mut found = Vec::new();
        loop {
            if let Some(config) = self.load_dir(&directory) {
                found.push(config);
            }
            if !self.search_recursively || directory.is_empty() {
                break;
            }
            directory = parent_dir(&directory);
        }
        found
    }

    /// Drop the cached entry for the directory `path` belongs to.
    pub fn invalidate(&mut self, path: &str) {
        let directory = parent_dir(&normalize_path(path));
        self.cache.remove(&directory);
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    fn load_dir(&mut self, directory: &str) -> Option<ProjectConfigFile> {
        if let Some(cached) = self.cache.get(directory) {
            return cached.clone();
        }
        let relative = if directory.is_empty() {
            self.file_name.clone()
        } else {
            format!("{directory}/{}", self.file_name)
        };
        let loaded = match fs::read_to_string(self.root.join(&relative)) {
            Ok(text) => Some(ProjectConfigFile::parse(&relative, directory, &text)),
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    debug!(path = %relative, error = %err, "project config unreadable");
                }
                None
            }
        };
        self.cache.insert(directory.to_string(), loaded.clone());
        loaded
    }
}

fn parent_dir(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((parent, _)) => parent.to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DefaultNaming, MetadataMapping, PathMapping};
    use crate::parser::frontmatter::FrontmatterValue;
    use crate::task::{TaskMetadata, TaskOrigin, TaskStatus};

    fn task(path: &str, project: Option<&str>) -> Task {
        Task {
            id: Task::file_task_id(path, 1),
            content: "thing".to_string(),
            status: TaskStatus::NotStarted,
            status_mark: ' ',
            source_path: path.to_string(),
            line_number: 1,
            original_markdown: "- [ ] thing".to_string(),
            metadata: TaskMetadata {
                project: project.map(str::to_string),
                ..TaskMetadata::default()
            },
            readonly: false,
            origin: TaskOrigin::File,
        }
    }

    fn config_file(project: &str) -> ProjectConfigFile {
        ProjectConfigFile {
            path: "work/project.md".to_string(),
            directory: "work".to_string(),
            project: Some(project.to_string()),
            metadata: BTreeMap::new(),
        }
    }

    fn frontmatter(key: &str, value: &str) -> Frontmatter {
        let mut frontmatter = Frontmatter::default();
        frontmatter.insert(key, FrontmatterValue::Text(value.to_string()));
        frontmatter
    }

    #[test]
    fn explicit_project_beats_config_file() {
        let resolver = Resolver::new(ProjectConfig::default()).expect("resolver");
        let resolved = resolver
            .resolve(&task("work/a.md", Some("Alpha")), &Frontmatter::default(), &[config_file("Beta")])
            .expect("resolved");
        assert_eq!(resolved.name, "Alpha");
        assert_eq!(resolved.source, ProjectSource::Explicit);
    }

    #[test]
    fn precedence_chain_in_order() {
        let config = ProjectConfig {
            path_mappings: vec![PathMapping {
                pattern: "work".to_string(),
                project: "Mapped".to_string(),
                enabled: true,
            }],
            default_naming: DefaultNaming {
                enabled: true,
                ..DefaultNaming::default()
            },
            ..ProjectConfig::default()
        };
        let resolver = Resolver::new(config).expect("resolver");
        let subject = task("work/notes.md", None);
        let meta = frontmatter("project", "FromMeta");

        let resolved = resolver.resolve(&subject, &meta, &[config_file("FromConfig")]);
        assert_eq!(resolved.map(|r| r.source), Some(ProjectSource::ConfigFile));

        let resolved = resolver.resolve(&subject, &meta, &[]).expect("meta");
        assert_eq!((resolved.name.as_str(), resolved.source), ("FromMeta", ProjectSource::Metadata));

        let resolved = resolver.resolve(&subject, &Frontmatter::default(), &[]).expect("path");
        assert_eq!((resolved.name.as_str(), resolved.source), ("Mapped", ProjectSource::PathMapping));

        let resolved = resolver
            .resolve(&task("home/chores.md", None), &Frontmatter::default(), &[])
            .expect("default");
        assert_eq!((resolved.name.as_str(), resolved.source), ("chores", ProjectSource::Default));
    }

    #[test]
    fn disabled_mechanisms_are_skipped() {
        let config = ProjectConfig {
            config_file_enabled: false,
            metadata_enabled: false,
            ..ProjectConfig::default()
        };
        let resolver = Resolver::new(config).expect("resolver");
        let resolved = resolver.resolve(
            &task("work/a.md", None),
            &frontmatter("project", "Meta"),
            &[config_file("Config")],
        );
        assert!(resolved.is_none());
    }

    #[test]
    fn longest_path_mapping_wins_then_first_registered() {
        let mapping = |pattern: &str, project: &str| PathMapping {
            pattern: pattern.to_string(),
            project: project.to_string(),
            enabled: true,
        };
        let config = ProjectConfig {
            path_mappings: vec![
                mapping("work", "Work"),
                mapping("work/clients/*", "Clients"),
                mapping("work/*/zeta.md", "Zeta"),
                mapping("work/clients/a*.md", "Acme"),
            ],
            ..ProjectConfig::default()
        };
        let resolver = Resolver::new(config).expect("resolver");
        let name = |path: &str| {
            resolver
                .resolve(&task(path, None), &Frontmatter::default(), &[])
                .map(|resolved| resolved.name)
        };
        assert_eq!(name("work/todo.md").as_deref(), Some("Work"));
        assert_eq!(name("work/clients/acme.md").as_deref(), Some("Acme"));
        // "work/clients/*" and "work/*/zeta.md" are the same length.
        assert_eq!(name("work/clients/zeta.md").as_deref(), Some("Clients"));
        assert_eq!(name("personal/x.md"), None);
    }

    #[test]
    fn metadata_mappings_feed_project_and_other_keys() {
        let config = ProjectConfig {
            metadata_enabled: false,
            metadata_mappings: vec![
                MetadataMapping {
                    source_key: "client".to_string(),
                    target_key: "project".to_string(),
                    enabled: true,
                },
                MetadataMapping {
                    source_key: "ctx".to_string(),
                    target_key: "context".to_string(),
                    enabled: true,
                },
            ],
            ..ProjectConfig::default()
        };
        let resolver = Resolver::new(config).expect("resolver");
        let mut meta = frontmatter("client", "Acme");
        meta.insert("ctx", FrontmatterValue::Text("office".to_string()));
        let mut subject = task("a.md", None);
        resolver.apply(&mut subject, &meta, &[]);
        let resolved = subject.metadata.resolved_project.as_ref().expect("resolved");
        assert_eq!(resolved.name, "Acme");
        assert_eq!(resolved.source, ProjectSource::Metadata);
        assert_eq!(subject.metadata.context.as_deref(), Some("office"));
        assert_eq!(subject.metadata.inherited.get("context").map(String::as_str), Some("office"));
    }

    #[test]
    fn frontmatter_inheritance_fills_only_missing_fields() {
        let resolver = Resolver::new(ProjectConfig::default()).expect("resolver");
        let mut meta = frontmatter("priority", "high");
        meta.insert("context", FrontmatterValue::Text("home".to_string()));
        meta.insert(
            "tags",
            FrontmatterValue::List(vec!["a".to_string(), "b".to_string()]),
        );
        let mut subject = task("a.md", None);
        subject.metadata.context = Some("desk".to_string());
        resolver.apply(&mut subject, &meta, &[]);
        assert_eq!(subject.metadata.priority, Some(4));
        assert_eq!(subject.metadata.context.as_deref(), Some("desk"));
        assert_eq!(subject.metadata.tags, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn reapplying_with_new_frontmatter_replaces_inherited_values() {
        let resolver = Resolver::new(ProjectConfig::default()).expect("resolver");
        let mut subject = task("a.md", None);
        resolver.apply(&mut subject, &frontmatter("context", "home"), &[]);
        assert_eq!(subject.metadata.context.as_deref(), Some("home"));
        resolver.apply(&mut subject, &frontmatter("context", "office"), &[]);
        assert_eq!(subject.metadata.context.as_deref(), Some("office"));
        resolver.apply(&mut subject, &Frontmatter::default(), &[]);
        assert!(subject.metadata.context.is_none());
        assert!(subject.metadata.inherited.is_empty());
    }

    #[test]
    fn default_naming_strategies() {
        let mut config = ProjectConfig {
            default_naming: DefaultNaming {
                enabled: true,
                strategy: NamingStrategy::Foldername,
                ..DefaultNaming::default()
            },
            ..ProjectConfig::default()
        };
        let resolver = Resolver::new(config.clone()).expect("resolver");
        let resolved = resolver.resolve(&task("areas/garden/plan.md", None), &Frontmatter::default(), &[]);
        assert_eq!(resolved.map(|r| r.name).as_deref(), Some("garden"));

        config.default_naming.strategy = NamingStrategy::Metadata;
        config.default_naming.metadata_key = Some("title".to_string());
        let resolver = Resolver::new(config).expect("resolver");
        let resolved = resolver.resolve(&task("x.md", None), &frontmatter("title", "Titled"), &[]);
        assert_eq!(resolved.map(|r| r.name).as_deref(), Some("Titled"));
    }

    #[test]
    fn config_file_parses_frontmatter_or_line() {
        let parsed = ProjectConfigFile::parse("w/project.md", "w", "---\nproject: Apollo\ncontext: lab\n---\nnotes\n");
        assert_eq!(parsed.project.as_deref(), Some("Apollo"));
        assert_eq!(parsed.metadata.get("context").map(String::as_str), Some("lab"));

        let parsed = ProjectConfigFile::parse("w/project.md", "w", "# About\nproject: Zephyr\n");
        assert_eq!(parsed.project.as_deref(), Some("Zephyr"));
    }

    #[test]
    fn loader_walks_ancestors_when_recursive() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("work/deep")).expect("mkdir");
        fs::write(dir.path().join("work/project.md"), "project: Work\n").expect("write");

        let mut config = ProjectConfig::default();
        let mut loader = ProjectConfigLoader::new(dir.path(), &config);
        assert!(loader.ancestors_for("work/deep/a.md").is_empty());
        assert_eq!(loader.ancestors_for("work/a.md").len(), 1);

        config.search_recursively = true;
        loader.reconfigure(&config);
        let found = loader.ancestors_for("work/deep/a.md");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].project.as_deref(), Some("Work"));
        assert!(loader.is_config_file("work/project.md"));
    }

    #[test]
    fn loader_invalidate_rereads() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("project.md"), "project: One\n").expect("write");
        let mut loader = ProjectConfigLoader::new(dir.path(), &ProjectConfig::default());
        assert_eq!(loader.ancestors_for("a.md")[0].project.as_deref(), Some("One"));

        fs::write(dir.path().join("project.md"), "project: Two\n").expect("write");
        assert_eq!(loader.ancestors_for("a.md")[0].project.as_deref(), Some("One"));
        loader.invalidate("project.md");
        assert_eq!(loader.ancestors_for("a.md")[0].project.as_deref(), Some("Two"));
    }
}
