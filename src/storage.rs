//! Storage layer for taskflow
//!
//! Knows where things live on disk: the corpus root, the state directory
//! and the files inside it. Also enumerates and reads corpus files.
//!
//! # Directory Structure
//!
//! ```text
//! <root>/
//!   .taskflow.toml                # Configuration
//!   .taskflow/                    # State directory (ignored)
//!     store.json                  # Key-value store (version record)
//!     store.json.lock             # Lock for the store
//!     locks/                      # Sidecar write locks
//!       <hash>.lock               # One per corpus file being edited
//!   **/*.md                       # Corpus files
//! ```

use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use sha2::{Digest, Sha256};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use crate::config::IndexConfig;
use crate::error::{Error, Result};
use crate::repository::EntryMeta;

/// File name of the key-value store inside the state directory
pub const STORE_FILE: &str = "store.json";

/// Sidecar lock directory inside the state directory
pub const LOCKS_DIR: &str = "locks";

/// Storage manager for one corpus
#[derive(Debug, Clone)]
pub struct Storage {
    /// Corpus root
    root: PathBuf,
    /// Directory name of the state dir, relative to the root
    state_dir_name: String,
    include_extensions: Vec<String>,
    ignore: Vec<glob::Pattern>,
}

/// A corpus file read from disk.
#[derive(Debug, Clone)]
pub struct CorpusFile {
    pub file_id: String,
    pub text: String,
    pub meta: EntryMeta,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>, config: &IndexConfig) -> Result<Self> {
        let mut ignore = Vec::with_capacity(config.ignore.len());
        for pattern in &config.ignore {
            ignore.push(glob::Pattern::new(pattern).map_err(|err| {
                Error::InvalidConfig(format!("invalid ignore pattern '{pattern}': {err}"))
            })?);
        }
        Ok(Self {
            root: root.into(),
            state_dir_name: config.state_dir.clone(),
            include_extensions: config.include_extensions.clone(),
            ignore,
        })
    }

    // =========================================================================
    // Path accessors
    // =========================================================================

    /// Path to the corpus root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the state directory
    pub fn state_dir(&self) -> PathBuf {
        self.root.join(&self.state_dir_name)
    }

    /// Path to the key-value store
    pub fn store_file(&self) -> PathBuf {
        self.state_dir().join(STORE_FILE)
    }

    /// Path to the lock guarding the key-value store
    pub fn store_lock_file(&self) -> PathBuf {
        self.state_dir().join(format!("{STORE_FILE}.lock"))
    }

    /// Sidecar lock for a corpus file
    pub fn lock_path_for(&self, file_id: &str) -> PathBuf {
        let key = content_hash(file_id.as_bytes());
        self.state_dir()
            .join(LOCKS_DIR)
            .join(format!("{}.lock", &key[..16]))
    }

    /// Absolute path of a corpus file
    pub fn absolute(&self, file_id: &str) -> PathBuf {
        self.root.join(file_id)
    }

    /// Corpus-relative id of `path`, with forward slashes.
    ///
    /// Fails for paths outside the root.
    pub fn file_id(&self, path: &Path) -> Result<String> {
        let relative = if path.is_absolute() {
            path.strip_prefix(&self.root)
                .or_else(|_| {
                    let canonical_root = self.root.canonicalize()?;
                    path.strip_prefix(&canonical_root)
                        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))
                })
                .map_err(|_| {
                    Error::InvalidArgument(format!(
                        "path is outside the corpus root: {}",
                        path.display()
                    ))
                })?
        } else {
            path
        };
        normalize_relative(relative)
    }

    // =========================================================================
    // Directory initialization
    // =========================================================================

    /// Create the state directory
    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(self.state_dir().join(LOCKS_DIR))?;
        Ok(())
    }

    // =========================================================================
    // Corpus enumeration
    // =========================================================================

    /// Whether `file_id` belongs to the indexed corpus.
    pub fn is_corpus_file(&self, file_id: &str) -> bool {
        let path = Path::new(file_id);
        let in_hidden_dir = path.components().any(|component| match component {
            Component::Normal(name) => name.to_string_lossy().starts_with('.'),
            _ => false,
        });
        !in_hidden_dir
            && self.has_included_extension(path)
            && !self.ignore.iter().any(|pattern| pattern.matches(file_id))
    }

    pub fn has_included_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                self.include_extensions
                    .iter()
                    .any(|candidate| candidate.trim_start_matches('.').eq_ignore_ascii_case(ext))
            })
    }

    pub fn include_extensions(&self) -> &[String] {
        &self.include_extensions
    }

    /// Every corpus file id, sorted. Hidden directories and the state
    /// directory are skipped.
    pub fn enumerate(&self) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            return Err(Error::FileNotFound(self.root.clone()));
        }
        let state_dir = self.state_dir();
        let mut files = Vec::new();
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| !is_hidden(entry) && entry.path() != state_dir);
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(error = %err, "skipping unreadable corpus entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let file_id = self.file_id(entry.path())?;
            if self.is_corpus_file(&file_id) {
                files.push(file_id);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Read one corpus file with its hash and mtime.
    pub fn read(&self, file_id: &str) -> Result<CorpusFile> {
        let path = self.absolute(file_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(Error::FileNotFound(PathBuf::from(file_id)))
            }
            Err(err) => return Err(err.into()),
        };
        let mtime = fs::metadata(&path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .and_then(|duration| i64::try_from(duration.as_millis()).ok());
        Ok(CorpusFile {
            file_id: file_id.to_string(),
            meta: EntryMeta {
                content_hash: content_hash(&bytes),
                mtime,
            },
            text: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }

    pub fn exists(&self, file_id: &str) -> bool {
        self.absolute(file_id).is_file()
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0 && entry.file_name().to_string_lossy().starts_with('.')
}

fn normalize_relative(path: &Path) -> Result<String> {
    let mut parts: Vec<String> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(Error::InvalidArgument(format!(
                        "path escapes the corpus root: {}",
                        path.display()
                    )));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::InvalidArgument(format!(
                    "expected a corpus-relative path: {}",
                    path.display()
                )))
            }
        }
    }
    if parts.is_empty() {
        return Err(Error::InvalidArgument("empty file path".to_string()));
    }
    Ok(parts.join("/"))
}

/// Hex SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

// =============================================================================
// Utility functions
// =============================================================================

/// Ensure the state directory is in .gitignore if not already present
pub fn ensure_gitignore(root: &Path, state_dir: &str) -> io::Result<()> {
    let gitignore_path = root.join(".gitignore");
    let pattern = format!("/{state_dir}/");

    let existing = if gitignore_path.exists() {
        fs::read_to_string(&gitignore_path)?
    } else {
        String::new()
    };

    let bare = state_dir.trim_matches('/');
    let already_ignored = existing.lines().any(|line| {
        let trimmed = line.trim().trim_matches('/');
        trimmed == bare
    });

    if !already_ignored {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&gitignore_path)?;

        if !existing.is_empty() && !existing.ends_with('\n') {
            writeln!(file)?;
        }

        writeln!(file, "# taskflow state")?;
        writeln!(file, "{pattern}")?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(root: &Path) -> Storage {
        Storage::new(root, &IndexConfig::default()).expect("storage")
    }

    #[test]
    fn paths_live_under_state_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = storage(dir.path());
        assert_eq!(storage.state_dir(), dir.path().join(".taskflow"));
        assert_eq!(storage.store_file(), dir.path().join(".taskflow/store.json"));
        let lock = storage.lock_path_for("notes/a.md");
        assert!(lock.starts_with(dir.path().join(".taskflow/locks")));
        assert_eq!(lock, storage.lock_path_for("notes/a.md"));
        assert_ne!(lock, storage.lock_path_for("notes/b.md"));
    }

    #[test]
    fn enumerate_skips_hidden_ignored_and_foreign_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        for path in [
            "a.md",
            "notes/b.md",
            "notes/c.txt",
            ".obsidian/d.md",
            ".taskflow/e.md",
            "archive/old.md",
        ] {
            let full = root.join(path);
            fs::create_dir_all(full.parent().expect("parent")).expect("mkdir");
            fs::write(full, "- [ ] x\n").expect("write");
        }
        let config = IndexConfig {
            ignore: vec!["archive/**".to_string()],
            ..IndexConfig::default()
        };
        let storage = Storage::new(root, &config).expect("storage");
        assert_eq!(
            storage.enumerate().expect("enumerate"),
            vec!["a.md".to_string(), "notes/b.md".to_string()]
        );
    }

    #[test]
    fn file_id_normalizes_and_rejects_escapes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = storage(dir.path());
        assert_eq!(storage.file_id(Path::new("./notes/../a.md")).expect("id"), "a.md");
        assert_eq!(
            storage.file_id(&dir.path().join("notes/x.md")).expect("id"),
            "notes/x.md"
        );
        assert!(storage.file_id(Path::new("../outside.md")).is_err());
    }

    #[test]
    fn read_reports_hash_and_missing_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = storage(dir.path());
        fs::write(dir.path().join("a.md"), "hello").expect("write");
        let file = storage.read("a.md").expect("read");
        assert_eq!(file.text, "hello");
        assert_eq!(file.meta.content_hash, content_hash(b"hello"));
        assert!(file.meta.mtime.is_some());
        assert!(matches!(storage.read("missing.md"), Err(Error::FileNotFound(_))));
    }

    #[test]
    fn gitignore_entry_is_added_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        ensure_gitignore(dir.path(), ".taskflow").expect("first");
        ensure_gitignore(dir.path(), ".taskflow").expect("second");
        let content = fs::read_to_string(dir.path().join(".gitignore")).expect("read");
        assert_eq!(content.matches("/.taskflow/").count(), 1);
    }
}
