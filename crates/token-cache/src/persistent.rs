//! File-backed token store
//!
//! Wraps [`MemoryTokenStore`] with a durable JSON file so tokens survive
//! process restarts and several store instances (separate processes
//! included) can share one path. Coordination is mtime-based: every read
//! path first compares the file's modification time against the last time
//! this instance saved or loaded, and reloads the whole map when the file is
//! newer. Concurrent saves from different instances are last-writer-wins;
//! the file is never locked.
//!
//! Persistence is best-effort: read, write, and delete failures are logged
//! and suppressed, and the in-memory store keeps working. Writes go through
//! a temp file + rename in the same directory to prevent a crash mid-write
//! from corrupting the file, and the file is created 0600 on unix since it
//! holds credentials.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::memory::{Entry, MemoryTokenStore, RefreshResult, lock};

/// Token store persisted as a JSON object mapping each key to a
/// `[token, expirySeconds]` pair.
pub struct PersistentTokenStore {
    memory: MemoryTokenStore,
    path: PathBuf,
    /// Modification time of the file as of this instance's last save or
    /// load. `None` until the file has been observed at all.
    last_sync: Mutex<Option<SystemTime>>,
}

impl PersistentTokenStore {
    /// Open a store backed by `path`, loading its contents when the file
    /// exists. An absent file is an empty store, not an error; it is only
    /// created once a token is ingested.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::open_with_clock(path, Arc::new(SystemClock))
    }

    /// Open a store backed by `path` with an explicit time source.
    pub fn open_with_clock(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        let store = Self {
            memory: MemoryTokenStore::with_clock(clock),
            path: path.into(),
            last_sync: Mutex::new(None),
        };
        store.reload_if_newer();
        store
    }

    /// Store a bearer token under `key` and persist the map.
    pub fn ingest_bearer(&self, key: &str, token: &str) -> Result<()> {
        self.memory.ingest_bearer(key, token)?;
        self.save();
        Ok(())
    }

    /// Store an access token under `key` and persist the map.
    pub fn ingest_access(&self, key: &str, token: &str, expires_in_secs: u64) {
        self.memory.ingest_access(key, token, expires_in_secs);
        self.save();
    }

    /// Return the cached token for `key`, picking up external writes to the
    /// backing file first.
    pub fn get(&self, key: &str) -> Result<String> {
        self.reload_if_newer();
        self.memory.get(key)
    }

    /// Return the cached token for `key`, invoking `refresh` when it is
    /// missing or expired. Same contract as
    /// [`MemoryTokenStore::get_or_refresh`], with a reload check up front
    /// and a save once the refreshed credential is ingested.
    pub fn get_or_refresh<F>(&self, key: &str, refresh: F) -> Result<String>
    where
        F: FnOnce() -> RefreshResult,
    {
        self.reload_if_newer();
        if let Some(token) = self.memory.lookup_valid(key) {
            return Ok(token);
        }
        debug!(key, "token missing or expired, refreshing");

        let resolved = self.memory.refresh_and_ingest(key, refresh)?;
        self.save();
        match self.memory.lookup_valid(&resolved) {
            Some(token) => Ok(token),
            None => Err(Error::AuthenticationFailed(resolved)),
        }
    }

    /// Remove every entry and delete the backing file.
    pub fn clear(&self) {
        self.memory.clear();
        *lock(&self.last_sync) = None;
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                debug!(path = %self.path.display(), error = %e, "cannot remove token file");
            }
        }
    }

    /// Persist the whole map, best-effort.
    fn save(&self) {
        if let Err(e) = self.try_save() {
            warn!(path = %self.path.display(), error = %e, "cannot save tokens");
        }
    }

    fn try_save(&self) -> io::Result<()> {
        // One save at a time: concurrent saves share the temp file, and an
        // unserialized writer could truncate it between another writer's
        // write and rename, publishing a partial map.
        let mut last_sync = lock(&self.last_sync);

        let entries = self.memory.snapshot();
        let json = serde_json::to_string(&entries).map_err(io::Error::other)?;
        write_atomic(&self.path, json.as_bytes())?;

        let modified = fs::metadata(&self.path)?.modified()?;
        *last_sync = Some(modified);
        debug!(path = %self.path.display(), entries = entries.len(), "persisted tokens");
        Ok(())
    }

    /// Replace the in-memory map from the file when it has been modified
    /// since this instance last saved or loaded, best-effort.
    fn reload_if_newer(&self) {
        if let Err(e) = self.try_reload() {
            warn!(path = %self.path.display(), error = %e, "cannot load tokens");
        }
    }

    fn try_reload(&self) -> io::Result<()> {
        let metadata = match fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        let modified = metadata.modified()?;

        let mut last_sync = lock(&self.last_sync);
        if last_sync.is_some_and(|seen| modified <= seen) {
            return Ok(());
        }

        let contents = fs::read_to_string(&self.path)?;
        let entries: HashMap<String, Entry> =
            serde_json::from_str(&contents).map_err(io::Error::other)?;
        debug!(path = %self.path.display(), entries = entries.len(), "reloaded tokens");
        self.memory.replace_all(entries);
        *last_sync = Some(modified);
        Ok(())
    }
}

/// Write to a temp file in the same directory, then rename over the target.
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "token path has no parent directory")
    })?;
    let tmp_path = dir.join(format!(".tokens.tmp.{}", std::process::id()));

    fs::write(&tmp_path, bytes)?;

    // 0600: the file holds credentials (unix only)
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
    use crate::memory::Refreshed;

    use std::time::Duration;

    // The reload check needs the file's mtime to strictly increase between
    // writes. Advance it explicitly instead of sleeping past filesystem
    // timestamp granularity.
    fn bump_mtime(path: &Path) {
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(2))
            .unwrap();
    }

    #[test]
    fn tokens_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        let store = PersistentTokenStore::open(&path);
        store.ingest_access("k", "tok", 3600);

        let reopened = PersistentTokenStore::open(&path);
        assert_eq!(reopened.get("k").unwrap(), "tok");
    }

    #[test]
    fn absent_file_is_an_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        let store = PersistentTokenStore::open(&path);
        assert!(matches!(
            store.get("k"),
            Err(Error::AuthenticationFailed(_))
        ));
        // Opening alone must not create the file
        assert!(!path.exists());
    }

    #[test]
    fn writes_are_visible_to_another_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        let writer = PersistentTokenStore::open(&path);
        let reader = PersistentTokenStore::open(&path);

        writer.ingest_access("k1", "tok1", 3600);
        assert_eq!(reader.get("k1").unwrap(), "tok1");

        // A later write is picked up too, via the newer mtime
        writer.ingest_access("k2", "tok2", 3600);
        bump_mtime(&path);
        assert_eq!(reader.get("k2").unwrap(), "tok2");
    }

    #[test]
    fn reload_replaces_the_map_wholesale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        let a = PersistentTokenStore::open(&path);
        a.ingest_access("k", "tok", 3600);

        let b = PersistentTokenStore::open(&path);
        assert_eq!(b.get("k").unwrap(), "tok");

        a.clear();
        a.ingest_access("other", "tok2", 3600);
        bump_mtime(&path);

        // b observes a's final state: "k" is gone, "other" is present
        assert_eq!(b.get("other").unwrap(), "tok2");
        assert!(b.get("k").is_err());
    }

    #[test]
    fn clear_removes_the_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        let store = PersistentTokenStore::open(&path);
        store.ingest_access("k", "tok", 3600);
        assert!(path.exists());

        store.clear();
        assert!(!path.exists());
        assert!(store.get("k").is_err());

        let reopened = PersistentTokenStore::open(&path);
        assert!(reopened.get("k").is_err());
    }

    #[test]
    fn refreshed_token_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        let store = PersistentTokenStore::open(&path);
        let token = store
            .get_or_refresh("k", || {
                Ok(Refreshed::Access {
                    key: "k".into(),
                    token: "fresh".into(),
                    expires_in: 3600,
                })
            })
            .unwrap();
        assert_eq!(token, "fresh");

        let reopened = PersistentTokenStore::open(&path);
        assert_eq!(reopened.get("k").unwrap(), "fresh");
    }

    #[test]
    fn failed_refresh_does_not_touch_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        let store = PersistentTokenStore::open(&path);
        let result = store.get_or_refresh("k", || {
            Err(Box::new(std::io::Error::other("endpoint down"))
                as Box<dyn std::error::Error + Send + Sync>)
        });
        assert!(matches!(result, Err(Error::Refresh(_))));
        assert!(!path.exists());
    }

    #[test]
    fn persisted_format_is_token_expiry_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        let store = PersistentTokenStore::open(&path);
        store.ingest_access("k", "tok", 3600);

        let contents = fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        let entry = parsed.get("k").unwrap().as_array().unwrap();
        assert_eq!(entry.len(), 2);
        assert_eq!(entry[0].as_str().unwrap(), "tok");
        assert!(entry[1].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn unwritable_path_leaves_memory_working() {
        let dir = tempfile::tempdir().unwrap();
        // Parent directory does not exist, so every save fails
        let path = dir.path().join("missing").join("tokens.json");

        let store = PersistentTokenStore::open(&path);
        store.ingest_access("k", "tok", 3600);
        assert_eq!(store.get("k").unwrap(), "tok");
        assert!(!path.exists());
    }

    #[test]
    fn corrupt_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        fs::write(&path, "{not json").unwrap();

        let store = PersistentTokenStore::open(&path);
        assert!(matches!(
            store.get("k"),
            Err(Error::AuthenticationFailed(_))
        ));

        // The store still works; a save overwrites the corrupt file
        store.ingest_access("k", "tok", 3600);
        assert_eq!(store.get("k").unwrap(), "tok");
    }

    #[test]
    fn concurrent_ingests_do_not_corrupt_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let store = Arc::new(PersistentTokenStore::open(&path));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for round in 0..20 {
                        store.ingest_access(
                            &format!("acct-{i}"),
                            &format!("tok-{i}-{round}"),
                            3600,
                        );
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Racing saves must never publish a truncated or interleaved map:
        // the file is valid JSON holding every account's final token
        let contents = fs::read_to_string(&path).unwrap();
        let parsed: HashMap<String, (String, f64)> = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.len(), 8);
        for i in 0..8 {
            assert_eq!(parsed[&format!("acct-{i}")].0, format!("tok-{i}-19"));
        }
    }

    #[cfg(unix)]
    #[test]
    fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        let store = PersistentTokenStore::open(&path);
        store.ingest_access("k", "tok", 3600);

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "token file must be 0600, got {mode:o}");
    }
}
