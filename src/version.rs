//! Version record and rebuild decision.
//!
//! The record lives under [`VERSION_KEY`] in a small JSON key-value store in
//! the state directory. A missing, stale or unreadable record means the
//! persisted state cannot be trusted and the corpus is rebuilt.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::lock::{self, FileLock, DEFAULT_LOCK_TIMEOUT_MS};
use crate::storage::Storage;

pub const VERSION_KEY: &str = "taskflow.version";

/// Bumped when the persisted layout or parse semantics change.
pub const SCHEMA_VERSION: u32 = 1;

pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

const PROBE_KEY: &str = "taskflow.probe";

/// Schema version written by [`VersionManager::invalidate`].
const INVALIDATED_SCHEMA: u32 = 0;

// =============================================================================
// Key-value store
// =============================================================================

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;
    fn set(&self, key: &str, value: Value) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// JSON object file, rewritten atomically under a lock.
#[derive(Debug, Clone)]
pub struct FileKvStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileKvStore {
    pub fn new(path: impl Into<PathBuf>, lock_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_path: lock_path.into(),
        }
    }

    pub fn for_storage(storage: &Storage) -> Self {
        Self::new(storage.store_file(), storage.store_lock_file())
    }

    fn load(&self) -> Result<BTreeMap<String, Value>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content).map_err(|err| {
            Error::StorageIntegrity(format!("{} is not a JSON object: {err}", self.path.display()))
        })
    }

    fn update(&self, apply: impl FnOnce(&mut BTreeMap<String, Value>)) -> Result<()> {
        let _lock = FileLock::acquire(&self.lock_path, DEFAULT_LOCK_TIMEOUT_MS)?;
        let mut map = match self.load() {
            Ok(map) => map,
            Err(Error::StorageIntegrity(message)) => {
                warn!(error = %message, "discarding unreadable store");
                BTreeMap::new()
            }
            Err(err) => return Err(err),
        };
        apply(&mut map);
        let json = serde_json::to_vec_pretty(&map)?;
        lock::write_atomic(&self.path, &json)
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.update(|map| {
            map.insert(key.to_string(), value);
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.update(|map| {
            map.remove(key);
        })
    }
}

/// In-memory store with switchable write failures.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    values: Mutex<BTreeMap<String, Value>>,
    fail_writes: AtomicBool,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::StorageIntegrity("store is read-only".to_string()));
        }
        Ok(())
    }

    fn values(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Value>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.values().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.check_writable()?;
        self.values().insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.check_writable()?;
        self.values().remove(key);
        Ok(())
    }
}

// =============================================================================
// Version record
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionRecord {
    pub schema_version: u32,
    pub last_processed_app_version: String,
    /// Epoch milliseconds.
    pub timestamp_written: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionState {
    NoRebuildNeeded,
    RebuildRequired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionCheck {
    pub state: VersionState,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<VersionRecord>,
    /// The stored record was unreadable and has been reset.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub recovered: bool,
}

impl VersionCheck {
    pub fn rebuild_required(&self) -> bool {
        self.state == VersionState::RebuildRequired
    }

    fn rebuild(reason: impl Into<String>, previous: Option<VersionRecord>) -> Self {
        Self {
            state: VersionState::RebuildRequired,
            reason: reason.into(),
            previous,
            recovered: false,
        }
    }
}

/// Where the manager is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckPhase {
    Unknown,
    Checked(VersionCheck),
}

#[derive(Debug, Clone, Serialize)]
pub struct CurrentVersion {
    pub schema_version: u32,
    pub app_version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionDiagnostics {
    pub current: CurrentVersion,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<VersionRecord>,
    pub storage_writable: bool,
    pub record_valid: bool,
}

pub struct VersionManager {
    store: Arc<dyn KvStore>,
    app_version: String,
    phase: Mutex<CheckPhase>,
}

impl std::fmt::Debug for VersionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionManager")
            .field("app_version", &self.app_version)
            .field("phase", &self.phase())
            .finish()
    }
}

impl VersionManager {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_app_version(store, APP_VERSION)
    }

    pub fn with_app_version(store: Arc<dyn KvStore>, app_version: impl Into<String>) -> Self {
        Self {
            store,
            app_version: app_version.into(),
            phase: Mutex::new(CheckPhase::Unknown),
        }
    }

    pub fn app_version(&self) -> &str {
        &self.app_version
    }

    pub fn phase(&self) -> CheckPhase {
        self.phase
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Compare the stored record with the running build.
    ///
    /// Integrity problems are recovered from here: the key is dropped and the
    /// store is probed. The caller always gets a decision, never an error.
    pub fn check(&self) -> VersionCheck {
        let check = match self.read_record() {
            Ok(None) => VersionCheck::rebuild("first install", None),
            Ok(Some(previous)) => self.compare(previous),
            Err(err) => {
                warn!(error = %err, "version record unreadable");
                if let Err(recovery) = self.recover() {
                    warn!(error = %recovery, "version store recovery failed");
                }
                VersionCheck {
                    recovered: true,
                    ..VersionCheck::rebuild("corrupted version record", None)
                }
            }
        };
        info!(state = ?check.state, reason = %check.reason, "version checked");
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) =
            CheckPhase::Checked(check.clone());
        check
    }

    /// Record that the current build has processed the corpus.
    pub fn mark_processed(&self) -> Result<VersionRecord> {
        let record = VersionRecord {
            schema_version: SCHEMA_VERSION,
            last_processed_app_version: self.app_version.clone(),
            timestamp_written: chrono::Utc::now().timestamp_millis(),
        };
        self.store.set(VERSION_KEY, serde_json::to_value(&record)?)?;
        Ok(record)
    }

    /// Make the next [`check`](Self::check) require a rebuild.
    pub fn invalidate(&self) -> Result<()> {
        let record = VersionRecord {
            schema_version: INVALIDATED_SCHEMA,
            last_processed_app_version: self.app_version.clone(),
            timestamp_written: chrono::Utc::now().timestamp_millis(),
        };
        self.store.set(VERSION_KEY, serde_json::to_value(&record)?)
    }

    pub fn diagnostics(&self) -> VersionDiagnostics {
        let (previous, record_valid) = match self.read_record() {
            Ok(record) => (record, true),
            Err(_) => (None, false),
        };
        VersionDiagnostics {
            current: CurrentVersion {
                schema_version: SCHEMA_VERSION,
                app_version: self.app_version.clone(),
            },
            previous,
            storage_writable: self.probe_writable().is_ok(),
            record_valid,
        }
    }

    fn read_record(&self) -> Result<Option<VersionRecord>> {
        let Some(value) = self.store.get(VERSION_KEY)? else {
            return Ok(None);
        };
        let record: VersionRecord = serde_json::from_value(value)
            .map_err(|err| Error::StorageIntegrity(format!("malformed version record: {err}")))?;
        if parse_version(&record.last_processed_app_version).is_none() {
            return Err(Error::StorageIntegrity(format!(
                "invalid version string '{}'",
                record.last_processed_app_version
            )));
        }
        Ok(Some(record))
    }

    fn compare(&self, previous: VersionRecord) -> VersionCheck {
        if previous.schema_version == INVALIDATED_SCHEMA {
            return VersionCheck::rebuild("rebuild requested", Some(previous));
        }
        if previous.schema_version != SCHEMA_VERSION {
            let reason = format!(
                "schema version changed from {} to {SCHEMA_VERSION}",
                previous.schema_version
            );
            return VersionCheck::rebuild(reason, Some(previous));
        }
        let before = parse_version(&previous.last_processed_app_version);
        let now = parse_version(&self.app_version);
        match (before, now) {
            (Some(before), Some(now)) if before == now => VersionCheck {
                state: VersionState::NoRebuildNeeded,
                reason: format!("version {} already processed", self.app_version),
                previous: Some(previous),
                recovered: false,
            },
            (Some(before), Some(now)) => {
                let direction = if now > before { "upgraded" } else { "downgraded" };
                let reason = format!(
                    "app version {direction} from {} to {}",
                    previous.last_processed_app_version, self.app_version
                );
                VersionCheck::rebuild(reason, Some(previous))
            }
            _ => VersionCheck::rebuild(
                format!("unrecognized app version '{}'", self.app_version),
                Some(previous),
            ),
        }
    }

    fn recover(&self) -> Result<()> {
        self.store.delete(VERSION_KEY)?;
        self.probe_writable()
    }

    fn probe_writable(&self) -> Result<()> {
        self.store.set(PROBE_KEY, Value::Bool(true))?;
        self.store.delete(PROBE_KEY)
    }
}

/// `MAJOR.MINOR.PATCH`, ignoring pre-release and build suffixes.
fn parse_version(raw: &str) -> Option<(u64, u64, u64)> {
    let core = raw.trim().split(['-', '+']).next()?;
    let mut parts = core.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().unwrap_or("0").parse().ok()?;
    let patch = parts.next().unwrap_or("0").parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(store: &Arc<MemoryKvStore>, version: &str) -> VersionManager {
        VersionManager::with_app_version(Arc::clone(store) as Arc<dyn KvStore>, version)
    }

    #[test]
    fn first_install_then_processed() {
        let store = Arc::new(MemoryKvStore::new());
        let versions = manager(&store, "1.2.0");
        assert_eq!(versions.phase(), CheckPhase::Unknown);

        let check = versions.check();
        assert!(check.rebuild_required());
        assert_eq!(check.reason, "first install");

        versions.mark_processed().expect("mark");
        let check = versions.check();
        assert_eq!(check.state, VersionState::NoRebuildNeeded);
        assert!(matches!(versions.phase(), CheckPhase::Checked(_)));
    }

    #[test]
    fn upgrade_and_downgrade_require_rebuild() {
        let store = Arc::new(MemoryKvStore::new());
        manager(&store, "1.2.0").mark_processed().expect("mark");

        let check = manager(&store, "1.3.0").check();
        assert!(check.rebuild_required());
        assert!(check.reason.contains("upgraded from 1.2.0 to 1.3.0"));

        let check = manager(&store, "1.1.9").check();
        assert!(check.reason.contains("downgraded"));
        assert_eq!(
            check.previous.map(|record| record.last_processed_app_version),
            Some("1.2.0".to_string())
        );
    }

    #[test]
    fn corrupted_record_is_recovered() {
        let store = Arc::new(MemoryKvStore::new());
        store
            .set(VERSION_KEY, serde_json::json!({ "garbage": true }))
            .expect("seed");
        let versions = manager(&store, "1.0.0");
        assert!(!versions.diagnostics().record_valid);

        let check = versions.check();
        assert!(check.rebuild_required());
        assert_eq!(check.reason, "corrupted version record");
        assert!(check.recovered);
        assert!(store.get(VERSION_KEY).expect("get").is_none());
    }

    #[test]
    fn invalid_version_string_counts_as_corruption() {
        let store = Arc::new(MemoryKvStore::new());
        store
            .set(
                VERSION_KEY,
                serde_json::json!({
                    "schemaVersion": SCHEMA_VERSION,
                    "lastProcessedAppVersion": "not-a-version",
                    "timestampWritten": 0
                }),
            )
            .expect("seed");
        assert_eq!(manager(&store, "1.0.0").check().reason, "corrupted version record");
    }

    #[test]
    fn failed_recovery_still_requires_rebuild() {
        let store = Arc::new(MemoryKvStore::new());
        store.set(VERSION_KEY, Value::String("junk".into())).expect("seed");
        store.set_fail_writes(true);
        let versions = manager(&store, "1.0.0");
        assert!(versions.check().rebuild_required());
        assert!(!versions.diagnostics().storage_writable);
    }

    #[test]
    fn invalidate_forces_rebuild() {
        let store = Arc::new(MemoryKvStore::new());
        let versions = manager(&store, "1.0.0");
        versions.mark_processed().expect("mark");
        versions.invalidate().expect("invalidate");
        let check = versions.check();
        assert!(check.rebuild_required());
        assert!(!check.recovered);
        assert_eq!(check.reason, "rebuild requested");
    }

    #[test]
    fn file_store_round_trips_and_recovers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state").join("store.json");
        let store = Arc::new(FileKvStore::new(&path, dir.path().join("store.lock")));
        let versions = VersionManager::with_app_version(store.clone(), "2.0.0");
        versions.mark_processed().expect("mark");
        let raw = fs::read_to_string(&path).expect("read");
        assert!(raw.contains("\"taskflow.version\""));
        assert!(raw.contains("\"lastProcessedAppVersion\": \"2.0.0\""));

        fs::write(&path, "{ not json").expect("corrupt");
        let check = versions.check();
        assert_eq!(check.reason, "corrupted version record");
        assert!(versions.diagnostics().record_valid);
        assert!(store.get(VERSION_KEY).expect("get").is_none());
    }

    #[test]
    fn version_strings_parse() {
        assert_eq!(parse_version("1.2.3"), Some((1, 2, 3)));
        assert_eq!(parse_version("1.2.3-beta.1"), Some((1, 2, 3)));
        assert_eq!(parse_version("2"), Some((2, 0, 0)));
        assert_eq!(parse_version("1.x"), None);
        assert_eq!(parse_version(""), None);
    }
}
