//! Persistent TTL caches
//!
//! Two small JSON stores keep discovery cheap across runs: the run cache
//! remembers verified failure counts per workflow run, and the quarantine
//! cache remembers repos that recently classified as unusable. Both are
//! write-through, prune expired or malformed entries at load, and treat any
//! schema mismatch or corruption as an empty cache.

use crate::models::SourceStatus;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration as StdDuration, Instant};

/// Run entries expire when the platform's own artifact retention (90 days)
/// will have reclaimed the underlying archive anyway. Anchored to the run's
/// remote creation time, not to when we cached it.
const RUN_CACHE_TTL_DAYS: i64 = 90;
const RUN_CACHE_SCHEMA_VERSION: u64 = 1;

/// A quarantined repo gets rechecked after a day; CI often recovers overnight.
const QUARANTINE_TTL_HOURS: i64 = 24;
const QUARANTINE_SCHEMA_VERSION: u64 = 1;

const CACHE_LOCK_TIMEOUT_SECS: u64 = 5;
const CACHE_LOCK_RETRY_MS: u64 = 50;

pub const RUN_CACHE_FILE: &str = "verified_runs.json";
pub const QUARANTINE_CACHE_FILE: &str = "quarantined_repos.json";

/// Per-user cache directory for the default cache locations.
pub fn default_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("failscout"))
}

/// Lock an entry map, taking the guard back from a worker that panicked while
/// holding it. Map mutations are single inserts or removes, so a poisoned
/// lock never leaves a half-written map behind.
fn lock_entries<T>(entries: &Mutex<T>) -> MutexGuard<'_, T> {
    match entries.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ============================================================================
// Run Cache
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunEntry {
    failure_count: u32,
    run_created_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct RunDocument<'a> {
    schema_version: u64,
    runs: &'a HashMap<u64, RunEntry>,
}

fn run_entry_expired(entry: &RunEntry) -> bool {
    Utc::now().signed_duration_since(entry.run_created_at) > Duration::days(RUN_CACHE_TTL_DAYS)
}

/// Verified failure counts keyed by workflow run id.
///
/// Safe to share across workers; each mutation and its synchronous save happen
/// under one lock acquisition.
pub struct RunCache {
    path: Option<PathBuf>,
    entries: Mutex<HashMap<u64, RunEntry>>,
}

impl RunCache {
    /// A cache with no backing file. Entries live for the process only.
    pub fn in_memory() -> Self {
        RunCache {
            path: None,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Load from `path`, pruning expired and malformed entries. If anything
    /// was pruned the cleaned file is written back immediately. A missing,
    /// corrupt, or wrong-schema file starts empty.
    pub fn load(path: PathBuf) -> Self {
        let mut entries = HashMap::new();
        let mut dropped = false;
        if let Some(raw) = load_document(&path, RUN_CACHE_SCHEMA_VERSION, "runs") {
            let total = raw.len();
            for (key, value) in raw {
                let Ok(id) = key.parse::<u64>() else {
                    continue;
                };
                let Ok(entry) = serde_json::from_value::<RunEntry>(value) else {
                    continue;
                };
                if run_entry_expired(&entry) {
                    continue;
                }
                entries.insert(id, entry);
            }
            dropped = entries.len() != total;
        }

        let cache = RunCache {
            path: Some(path),
            entries: Mutex::new(entries),
        };
        if dropped {
            let entries = lock_entries(&cache.entries);
            let _ = cache.persist(&entries);
        }
        cache
    }

    /// The cached failure count, if the run is still inside the TTL.
    pub fn get(&self, run_id: u64) -> Option<u32> {
        let entries = lock_entries(&self.entries);
        let entry = entries.get(&run_id)?;
        if run_entry_expired(entry) {
            return None;
        }
        Some(entry.failure_count)
    }

    /// Store a verified count and write through to disk.
    pub fn set(
        &self,
        run_id: u64,
        failure_count: u32,
        run_created_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut entries = lock_entries(&self.entries);
        entries.insert(
            run_id,
            RunEntry {
                failure_count,
                run_created_at,
            },
        );
        self.persist(&entries)
    }

    /// Persist the current contents.
    pub fn save(&self) -> Result<()> {
        let entries = lock_entries(&self.entries);
        self.persist(&entries)
    }

    fn persist(&self, entries: &HashMap<u64, RunEntry>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let document = RunDocument {
            schema_version: RUN_CACHE_SCHEMA_VERSION,
            runs: entries,
        };
        let content = serde_json::to_string_pretty(&document)?;
        save_document(path, &content)
    }
}

// ============================================================================
// Quarantine Cache
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QuarantineEntry {
    status: SourceStatus,
    quarantined_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct QuarantineDocument<'a> {
    schema_version: u64,
    repos: &'a HashMap<String, QuarantineEntry>,
}

fn quarantine_entry_expired(entry: &QuarantineEntry) -> bool {
    Utc::now().signed_duration_since(entry.quarantined_at)
        > Duration::hours(QUARANTINE_TTL_HOURS)
}

/// Repos to skip for a while, keyed by `owner/repo`, anchored to local time.
pub struct QuarantineCache {
    path: Option<PathBuf>,
    entries: Mutex<HashMap<String, QuarantineEntry>>,
}

impl QuarantineCache {
    pub fn in_memory() -> Self {
        QuarantineCache {
            path: None,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Load from `path` with the same pruning and self-healing behavior as
    /// [`RunCache::load`].
    pub fn load(path: PathBuf) -> Self {
        let mut entries = HashMap::new();
        let mut dropped = false;
        if let Some(raw) = load_document(&path, QUARANTINE_SCHEMA_VERSION, "repos") {
            let total = raw.len();
            for (repo, value) in raw {
                let Ok(entry) = serde_json::from_value::<QuarantineEntry>(value) else {
                    continue;
                };
                if quarantine_entry_expired(&entry) {
                    continue;
                }
                entries.insert(repo, entry);
            }
            dropped = entries.len() != total;
        }

        let cache = QuarantineCache {
            path: Some(path),
            entries: Mutex::new(entries),
        };
        if dropped {
            let entries = lock_entries(&cache.entries);
            let _ = cache.persist(&entries);
        }
        cache
    }

    pub fn is_quarantined(&self, repo: &str) -> bool {
        let entries = lock_entries(&self.entries);
        match entries.get(repo) {
            Some(entry) => !quarantine_entry_expired(entry),
            None => false,
        }
    }

    /// Quarantine a repo as of now and write through to disk.
    pub fn set(&self, repo: &str, status: SourceStatus) -> Result<()> {
        let mut entries = lock_entries(&self.entries);
        entries.insert(
            repo.to_string(),
            QuarantineEntry {
                status,
                quarantined_at: Utc::now(),
            },
        );
        self.persist(&entries)
    }

    /// Clear a repo's quarantine. Removing an absent key is a no-op and
    /// performs no write.
    pub fn remove(&self, repo: &str) -> Result<()> {
        let mut entries = lock_entries(&self.entries);
        if entries.remove(repo).is_none() {
            return Ok(());
        }
        self.persist(&entries)
    }

    pub fn save(&self) -> Result<()> {
        let entries = lock_entries(&self.entries);
        self.persist(&entries)
    }

    fn persist(&self, entries: &HashMap<String, QuarantineEntry>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let document = QuarantineDocument {
            schema_version: QUARANTINE_SCHEMA_VERSION,
            repos: entries,
        };
        let content = serde_json::to_string_pretty(&document)?;
        save_document(path, &content)
    }
}

// ============================================================================
// File Handling
// ============================================================================

struct CacheLock {
    file: std::fs::File,
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Advisory lock guarding a cache file, shared for reads and exclusive for
/// writes, with a bounded retry so a wedged process cannot hang us.
fn acquire_lock(path: &Path, exclusive: bool) -> Result<CacheLock> {
    let lock_path = path.with_extension("lock");
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false) // Lock file content doesn't matter, just the lock
        .open(&lock_path)?;

    let start = Instant::now();
    loop {
        let result = if exclusive {
            FileExt::try_lock_exclusive(&file)
        } else {
            FileExt::try_lock_shared(&file)
        };
        match result {
            Ok(()) => break,
            Err(err) => {
                if err.kind() != ErrorKind::WouldBlock {
                    return Err(err.into());
                }
                if start.elapsed() >= StdDuration::from_secs(CACHE_LOCK_TIMEOUT_SECS) {
                    return Err(anyhow::anyhow!(
                        "Timed out waiting for cache lock ({}s)",
                        CACHE_LOCK_TIMEOUT_SECS
                    ));
                }
                std::thread::sleep(StdDuration::from_millis(CACHE_LOCK_RETRY_MS));
            }
        }
    }

    Ok(CacheLock { file })
}

/// Read a cache document's entry map, or `None` for anything unusable:
/// missing file, unreadable contents, bad JSON, or a schema we don't know.
fn load_document(
    path: &Path,
    expected_version: u64,
    entries_key: &str,
) -> Option<serde_json::Map<String, Value>> {
    if !path.exists() {
        return None;
    }
    let _lock = acquire_lock(path, false).ok()?;
    let raw = fs::read_to_string(path).ok()?;
    let value: Value = serde_json::from_str(&raw).ok()?;
    if value.get("schema_version").and_then(Value::as_u64) != Some(expected_version) {
        return None;
    }
    value.get(entries_key)?.as_object().cloned()
}

fn save_document(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let _lock = acquire_lock(path, true)?;
    write_atomic(path, content)
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)?;

    // Set restrictive permissions on Unix before renaming
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600); // Owner read/write only
        let _ = std::fs::set_permissions(&tmp_path, perms);
    }

    #[cfg(windows)]
    {
        let backup_path = path.with_extension("bak");
        // Clean up any stale backup from a previous crash
        if backup_path.exists() {
            let _ = fs::remove_file(&backup_path);
        }
        if path.exists() {
            if let Err(err) = fs::rename(path, &backup_path) {
                let _ = fs::remove_file(&tmp_path);
                return Err(err.into());
            }
        }
        if let Err(err) = fs::rename(&tmp_path, path) {
            // Attempt rollback on failure
            if backup_path.exists() {
                let _ = fs::rename(&backup_path, path);
            }
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        // Clean up backup on success
        if backup_path.exists() {
            let _ = fs::remove_file(&backup_path);
        }
        return Ok(());
    }

    #[cfg(not(windows))]
    {
        if let Err(err) = fs::rename(&tmp_path, path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        Ok(())
    }
}
