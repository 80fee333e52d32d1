//! Read, parse and resolve corpus files.
//!
//! Reading and parsing run on the blocking pool; project resolution runs on
//! the caller since it shares the config-file cache.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::task;

use crate::config::{Config, ProjectConfig};
use crate::diagnostic::Diagnostic;
use crate::error::{Error, Result};
use crate::parser::{FileKind, Frontmatter, ParseOutput, TaskParser};
use crate::repository::EntryMeta;
use crate::resolver::{ProjectConfigLoader, Resolver};
use crate::storage::{CorpusFile, Storage};
use crate::task::Task;

/// One file, parsed and resolved, ready to upsert.
#[derive(Debug, Clone)]
pub struct IndexedFile {
    pub file_id: String,
    pub tasks: Vec<Task>,
    pub diagnostics: Vec<Diagnostic>,
    pub frontmatter: Frontmatter,
    pub meta: EntryMeta,
}

type Loaded = (String, Result<(CorpusFile, ParseOutput)>);

#[derive(Debug)]
pub struct Indexer {
    storage: Arc<Storage>,
    parser: Arc<TaskParser>,
    resolver: Resolver,
    loader: ProjectConfigLoader,
    frontmatter: HashMap<String, Frontmatter>,
}

impl Indexer {
    pub fn new(storage: Arc<Storage>, config: &Config) -> Result<Self> {
        Ok(Self {
            parser: Arc::new(TaskParser::new(&config.parser)?),
            resolver: Resolver::new(config.project.clone())?,
            loader: ProjectConfigLoader::new(storage.root(), &config.project),
            storage,
            frontmatter: HashMap::new(),
        })
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn parser(&self) -> &Arc<TaskParser> {
        &self.parser
    }

    /// Index one file. A missing file is [`Error::FileNotFound`].
    pub async fn load(&mut self, file_id: &str) -> Result<IndexedFile> {
        let mut batch = self.load_batch(&[file_id.to_string()]).await?;
        match batch.pop() {
            Some((_, result)) => result,
            None => Err(Error::FileNotFound(file_id.into())),
        }
    }

    /// Index several files with one trip to the blocking pool. Per-file
    /// failures are returned next to the file id; only a crashed parse
    /// task fails the whole batch.
    pub async fn load_batch(
        &mut self,
        file_ids: &[String],
    ) -> Result<Vec<(String, Result<IndexedFile>)>> {
        let storage = Arc::clone(&self.storage);
        let parser = Arc::clone(&self.parser);
        let ids = file_ids.to_vec();
        let loaded: Vec<Loaded> = task::spawn_blocking(move || {
            ids.into_iter()
                .map(|file_id| {
                    let result = storage.read(&file_id).map(|file| {
                        let kind =
                            FileKind::from_path(Path::new(&file_id), storage.include_extensions());
                        let output = parser.parse(&file_id, &file.text, kind);
                        (file, output)
                    });
                    (file_id, result)
                })
                .collect()
        })
        .await
        .map_err(|err| Error::OperationFailed(format!("parse task failed: {err}")))?;

        Ok(loaded
            .into_iter()
            .map(|(file_id, result)| {
                let indexed = result.map(|(file, output)| self.finish(file, output));
                (file_id, indexed)
            })
            .collect())
    }

    fn finish(&mut self, file: CorpusFile, output: ParseOutput) -> IndexedFile {
        let ParseOutput {
            mut tasks,
            diagnostics,
            frontmatter,
        } = output;
        let ancestors = self.loader.ancestors_for(&file.file_id);
        for task in &mut tasks {
            self.resolver.apply(task, &frontmatter, &ancestors);
        }
        IndexedFile {
            file_id: file.file_id,
            tasks,
            diagnostics,
            frontmatter,
            meta: file.meta,
        }
    }

    /// Keep the file's frontmatter for later re-resolution.
    pub fn remember(&mut self, file: &IndexedFile) {
        self.frontmatter
            .insert(file.file_id.clone(), file.frontmatter.clone());
    }

    pub fn forget(&mut self, file_id: &str) {
        self.frontmatter.remove(file_id);
    }

    /// Swap in the frontmatter gathered by a rebuild.
    pub fn replace_frontmatter(&mut self, frontmatter: HashMap<String, Frontmatter>) {
        self.frontmatter = frontmatter;
        self.loader.clear();
    }

    pub fn is_config_file(&self, file_id: &str) -> bool {
        self.loader.is_config_file(file_id)
    }

    /// Drop the cached project config for `file_id`'s directory.
    pub fn invalidate_config(&mut self, file_id: &str) {
        self.loader.invalidate(file_id);
    }

    pub fn reconfigure(&mut self, config: ProjectConfig) -> Result<()> {
        let resolver = Resolver::new(config)?;
        self.loader.reconfigure(resolver.config());
        self.resolver = resolver;
        Ok(())
    }

    /// Re-run project resolution on already parsed tasks of one file. Ids,
    /// line numbers and content are untouched.
    pub fn reresolve(&mut self, file_id: &str, tasks: &mut [Task]) {
        let ancestors = self.loader.ancestors_for(file_id);
        let empty = Frontmatter::default();
        let frontmatter = self.frontmatter.get(file_id).unwrap_or(&empty);
        for task in tasks {
            self.resolver.apply(task, frontmatter, &ancestors);
        }
    }
}
