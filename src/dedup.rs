//! Persistent record of published event identities.
//!
//! The store is a single JSON file:
//!
//! ```json
//! { "version": 1, "entries": { "<identity key>": { "committed_at": "...", "last_seen": "..." } } }
//! ```
//!
//! Every mutation is written through immediately with a temp file and a
//! rename, so a crash leaves either the old or the new file, never a torn one.
//! Only one process may use a given file.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// On-disk format version.
const STORE_VERSION: u8 = 1;

/// Bookkeeping for one published identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupEntry {
    /// When the event was published (or deliberately skipped).
    pub committed_at: DateTime<Utc>,
    /// Last cycle in which the event was still listed upstream.
    pub last_seen: DateTime<Utc>,
}

/// How long identities are remembered after they drop off the portal page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Entries whose `last_seen` is older than this are pruned.
    pub window: Duration,
}

impl RetentionPolicy {
    /// Creates a policy with the given window.
    pub fn new(window: Duration) -> Self {
        Self { window }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u8,
    #[serde(default)]
    entries: BTreeMap<String, DedupEntry>,
}

/// Set of identity keys that have already been published.
#[derive(Debug)]
pub struct DedupStore {
    path: PathBuf,
    entries: BTreeMap<String, DedupEntry>,
}

impl DedupStore {
    /// Loads the store at `path`.
    ///
    /// A missing file is an empty store. An unreadable or corrupt file is an
    /// error: starting empty would re-announce everything on the page.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RelayError> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(content) => {
                let file: StoreFile = serde_json::from_str(&content).map_err(|e| {
                    RelayError::Store(format!("corrupt dedup file {}: {e}", path.display()))
                })?;
                if file.version != STORE_VERSION {
                    return Err(RelayError::Store(format!(
                        "unsupported dedup file version {} in {}",
                        file.version,
                        path.display()
                    )));
                }
                file.entries
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No dedup file at {}, starting empty", path.display());
                BTreeMap::new()
            }
            Err(e) => {
                return Err(RelayError::Store(format!(
                    "failed to read {}: {e}",
                    path.display()
                )))
            }
        };

        log::debug!("Loaded {} published identities from {}", entries.len(), path.display());
        Ok(Self { path, entries })
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of remembered identities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when nothing has been published yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true when `key` has not been committed.
    pub fn is_new(&self, key: &str) -> bool {
        !self.entries.contains_key(key)
    }

    /// Bookkeeping for `key`, if committed.
    pub fn entry(&self, key: &str) -> Option<&DedupEntry> {
        self.entries.get(key)
    }

    /// Records `key` as published and persists the store.
    ///
    /// If the write fails the key is removed again so memory and disk agree.
    pub fn commit(&mut self, key: &str, now: DateTime<Utc>) -> Result<(), RelayError> {
        if !self.is_new(key) {
            return Ok(());
        }
        self.entries.insert(
            key.to_string(),
            DedupEntry {
                committed_at: now,
                last_seen: now,
            },
        );
        if let Err(e) = self.persist() {
            self.entries.remove(key);
            return Err(e);
        }
        Ok(())
    }

    /// Refreshes `last_seen` for committed keys still listed upstream.
    ///
    /// Unknown keys are ignored.
    pub fn mark_seen<'a, I>(&mut self, keys: I, now: DateTime<Utc>) -> Result<(), RelayError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut touched = 0usize;
        for key in keys {
            if let Some(entry) = self.entries.get_mut(key) {
                if entry.last_seen < now {
                    entry.last_seen = now;
                    touched += 1;
                }
            }
        }
        if touched > 0 {
            self.persist()?;
        }
        Ok(())
    }

    /// Forgets identities not seen within `policy.window` of `now`.
    ///
    /// Returns how many were removed.
    pub fn prune(&mut self, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<usize, RelayError> {
        let window = TimeDelta::from_std(policy.window).unwrap_or(TimeDelta::MAX);
        let cutoff = now.checked_sub_signed(window);
        let before = self.entries.len();
        if let Some(cutoff) = cutoff {
            self.entries.retain(|_, entry| entry.last_seen >= cutoff);
        }
        let removed = before - self.entries.len();
        if removed > 0 {
            self.persist()?;
            log::info!("Pruned {removed} expired identities from dedup store");
        }
        Ok(removed)
    }

    fn persist(&self) -> Result<(), RelayError> {
        let file = StoreFile {
            version: STORE_VERSION,
            entries: self.entries.clone(),
        };
        let content = serde_json::to_string_pretty(&file)
            .map_err(|e| RelayError::Store(format!("failed to serialize dedup store: {e}")))?;
        write_atomic(&self.path, content.as_bytes())
            .map_err(|e| RelayError::Store(format!("failed to write {}: {e}", self.path.display())))
    }
}

fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(content)?;
    file.sync_all()?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
    }

    fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn store_in(dir: &TempDir) -> DedupStore {
        DedupStore::open(dir.path().join("published.json")).unwrap()
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert!(store.is_empty());
        assert!(store.is_new("abc"));
    }

    #[test]
    fn test_commit_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        store.commit("abc", t0()).unwrap();
        assert!(!store.is_new("abc"));

        let reopened = store_in(&dir);
        assert_eq!(reopened.len(), 1);
        assert_eq!(
            reopened.entry("abc"),
            Some(&DedupEntry {
                committed_at: t0(),
                last_seen: t0()
            })
        );
    }

    #[test]
    fn test_commit_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        store.commit("abc", t0()).unwrap();
        store.commit("abc", t0() + TimeDelta::hours(1)).unwrap();
        assert_eq!(store.entry("abc").map(|e| e.committed_at), Some(t0()));
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("published.json");
        fs::write(&path, "{ not json").unwrap();
        let err = DedupStore::open(&path).unwrap_err();
        assert!(matches!(err, RelayError::Store(_)));
    }

    #[test]
    fn test_commit_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state").join("published.json");
        let mut store = DedupStore::open(&path).unwrap();
        store.commit("abc", t0()).unwrap();
        assert!(path.exists());
        assert!(!path.with_file_name("published.json.tmp").exists());
    }

    #[test]
    fn test_prune_keeps_recently_seen() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        store.commit("old", t0()).unwrap();
        store.commit("still-listed", t0()).unwrap();

        let later = t0() + TimeDelta::days(20);
        store.mark_seen(["still-listed", "never-committed"], later).unwrap();

        let policy = RetentionPolicy::new(Duration::from_secs(10 * 24 * 60 * 60));
        let removed = store.prune(&policy, later + TimeDelta::days(1)).unwrap();
        assert_eq!(removed, 1);
        assert!(store.is_new("old"));
        assert!(!store.is_new("still-listed"));
        assert!(store.is_new("never-committed"));

        let reopened = store_in(&dir);
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn test_prune_boundary_is_inclusive() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        store.commit("abc", t0()).unwrap();
        let policy = RetentionPolicy::new(Duration::from_secs(3600));
        assert_eq!(store.prune(&policy, t0() + TimeDelta::hours(1)).unwrap(), 0);
        assert_eq!(store.prune(&policy, t0() + TimeDelta::seconds(3601)).unwrap(), 1);
    }

    #[test]
    fn test_wrong_version_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("published.json");
        fs::write(&path, r#"{"version": 9, "entries": {}}"#).unwrap();
        assert!(DedupStore::open(&path).is_err());
    }
}
