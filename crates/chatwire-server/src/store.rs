//! Server-owned file storage.
//!
//! Uploads are staged under `<root>/.incoming/` while chunks arrive and are
//! moved into `<root>` under a collision-free name on completion. Finished
//! files may also be kept in a bounded in-memory cache; when a new entry
//! would push the cache over its budget the whole cache is cleared first.

use chatwire_proto::{FileSink, is_safe_file_name};
use rand::Rng;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Staging directory name inside the storage root
pub const STAGING_DIR: &str = ".incoming";

/// Extension of staging files
const STAGING_EXT: &str = "part";

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),

    /// No stored file has this name
    #[error("file not found: {0}")]
    NotFound(String),

    /// Name would resolve outside the storage directory
    #[error("unsafe file name: {0:?}")]
    UnsafeName(String),
}

/// A file that has been persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    /// Collision-resolved name
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Location on disk
    pub path: PathBuf,
}

/// Where a requested file's bytes come from
#[derive(Debug, Clone)]
pub enum FileSource {
    /// Served from the memory cache
    Cached(Arc<Vec<u8>>),
    /// Streamed from disk
    Disk {
        /// Location on disk
        path: PathBuf,
        /// Size in bytes
        size: u64,
    },
}

impl FileSource {
    /// Total size in bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        match self {
            FileSource::Cached(bytes) => bytes.len() as u64,
            FileSource::Disk { size, .. } => *size,
        }
    }
}

/// Name used for the `n`th collision of `name` (`report.pdf` → `report_2.pdf`)
#[must_use]
pub fn collision_name(name: &str, n: u32) -> String {
    if n == 0 {
        return name.to_string();
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}_{n}.{ext}"),
        _ => format!("{name}_{n}"),
    }
}

/// Memory cache with an all-or-nothing eviction policy
#[derive(Debug)]
struct FileCache {
    entries: HashMap<String, Arc<Vec<u8>>>,
    size: u64,
    budget: u64,
}

impl FileCache {
    fn new(budget: u64) -> Self {
        Self {
            entries: HashMap::new(),
            size: 0,
            budget,
        }
    }

    fn fits(&self, len: u64) -> bool {
        self.budget > 0 && len <= self.budget
    }

    fn insert(&mut self, name: String, bytes: Vec<u8>) -> bool {
        let len = bytes.len() as u64;
        if !self.fits(len) {
            return false;
        }

        if self.size + len > self.budget {
            debug!(
                entries = self.entries.len(),
                bytes = self.size,
                "cache budget exceeded, clearing cache"
            );
            self.entries.clear();
            self.size = 0;
        }

        if let Some(old) = self.entries.insert(name, Arc::new(bytes)) {
            self.size -= old.len() as u64;
        }
        self.size += len;
        true
    }

    fn get(&self, name: &str) -> Option<Arc<Vec<u8>>> {
        self.entries.get(name).cloned()
    }
}

/// Disk-backed file store with a bounded memory cache
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    staging: PathBuf,
    cache: Mutex<FileCache>,
    /// Held while a final name is chosen and claimed
    persist_lock: Mutex<()>,
}

impl FileStore {
    /// Open (creating if needed) the store rooted at `root`
    ///
    /// Leftover staging files from an earlier run are removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created or read.
    pub async fn open(root: impl Into<PathBuf>, cache_budget: u64) -> Result<Self, StoreError> {
        let root = root.into();
        let staging = root.join(STAGING_DIR);
        tokio::fs::create_dir_all(&staging).await?;

        let mut leftovers = tokio::fs::read_dir(&staging).await?;
        while let Some(entry) = leftovers.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == STAGING_EXT) {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), "failed to remove stale staging file: {e}");
                }
            }
        }

        info!(root = %root.display(), cache_budget, "file store ready");
        Ok(Self {
            root,
            staging,
            cache: Mutex::new(FileCache::new(cache_budget)),
            persist_lock: Mutex::new(()),
        })
    }

    /// Storage root
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Staging directory
    #[must_use]
    pub fn staging_dir(&self) -> &Path {
        &self.staging
    }

    /// Open a fresh staging sink for an incoming upload
    ///
    /// # Errors
    ///
    /// Returns an error if the staging file cannot be created.
    pub async fn create_staging(&self) -> Result<FileSink, StoreError> {
        let mut id = [0u8; 16];
        rand::thread_rng().fill(&mut id[..]);
        let path = self
            .staging
            .join(format!("{}.{STAGING_EXT}", hex::encode(id)));
        Ok(FileSink::create_new(path).await?)
    }

    /// Move a finished staging file into the store under a free name
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnsafeName`] for names that are not sanitized,
    /// or an I/O error if the move fails.
    pub async fn persist(&self, staged: &Path, name: &str) -> Result<StoredFile, StoreError> {
        if !is_safe_file_name(name) {
            return Err(StoreError::UnsafeName(name.to_string()));
        }

        let (final_name, path) = {
            let _claim = self.persist_lock.lock().await;
            let mut n = 0;
            let (final_name, path) = loop {
                let candidate = collision_name(name, n);
                let path = self.root.join(&candidate);
                if !tokio::fs::try_exists(&path).await? {
                    break (candidate, path);
                }
                n += 1;
            };
            tokio::fs::rename(staged, &path).await?;
            (final_name, path)
        };

        let size = tokio::fs::metadata(&path).await?.len();
        self.cache_file(&final_name, &path, size).await;

        info!(file = %final_name, size, "file stored");
        Ok(StoredFile {
            name: final_name,
            size,
            path,
        })
    }

    async fn cache_file(&self, name: &str, path: &Path, size: u64) {
        if !self.cache.lock().await.fits(size) {
            return;
        }
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                self.cache.lock().await.insert(name.to_string(), bytes);
            }
            Err(e) => warn!(file = name, "failed to cache stored file: {e}"),
        }
    }

    /// Find a stored file, preferring the cache
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnsafeName`] for names that could escape the
    /// storage directory and [`StoreError::NotFound`] for unknown names.
    pub async fn lookup(&self, name: &str) -> Result<FileSource, StoreError> {
        if !is_safe_file_name(name) {
            return Err(StoreError::UnsafeName(name.to_string()));
        }

        if let Some(bytes) = self.cache.lock().await.get(name) {
            return Ok(FileSource::Cached(bytes));
        }

        let path = self.root.join(name);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(FileSource::Disk {
                path,
                size: meta.len(),
            }),
            Ok(_) => Err(StoreError::NotFound(name.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Bytes currently held in the cache
    pub async fn cached_bytes(&self) -> u64 {
        self.cache.lock().await.size
    }

    /// Whether `name` is currently cached
    pub async fn is_cached(&self, name: &str) -> bool {
        self.cache.lock().await.entries.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatwire_proto::TransferSink;

    async fn staged_file(store: &FileStore, bytes: &[u8]) -> PathBuf {
        let mut sink = store.create_staging().await.unwrap();
        sink.append(bytes).await.unwrap();
        sink.finish().await.unwrap()
    }

    #[test]
    fn test_collision_name() {
        assert_eq!(collision_name("report.pdf", 0), "report.pdf");
        assert_eq!(collision_name("report.pdf", 1), "report_1.pdf");
        assert_eq!(collision_name("archive.tar.gz", 2), "archive.tar_2.gz");
        assert_eq!(collision_name("README", 3), "README_3");
        assert_eq!(collision_name(".env", 1), ".env_1");
    }

    #[test]
    fn test_cache_clears_when_over_budget() {
        let mut cache = FileCache::new(10);
        assert!(cache.insert("a".into(), vec![0; 4]));
        assert!(cache.insert("b".into(), vec![0; 4]));
        assert_eq!(cache.size, 8);

        // 8 + 4 > 10: everything goes, then "c" is added
        assert!(cache.insert("c".into(), vec![0; 4]));
        assert_eq!(cache.size, 4);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_cache_rejects_oversized_and_disabled() {
        let mut cache = FileCache::new(10);
        assert!(!cache.insert("big".into(), vec![0; 11]));
        assert_eq!(cache.size, 0);

        let mut disabled = FileCache::new(0);
        assert!(!disabled.insert("a".into(), vec![0; 1]));
    }

    #[tokio::test]
    async fn test_persist_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path(), 1024).await.unwrap();

        let staged = staged_file(&store, b"hello").await;
        let stored = store.persist(&staged, "hello.txt").await.unwrap();
        assert_eq!(stored.name, "hello.txt");
        assert_eq!(stored.size, 5);
        assert!(!staged.exists());
        assert!(store.is_cached("hello.txt").await);

        match store.lookup("hello.txt").await.unwrap() {
            FileSource::Cached(bytes) => assert_eq!(&bytes[..], b"hello"),
            other => panic!("expected cached source, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_persist_resolves_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path(), 0).await.unwrap();

        let mut names = Vec::new();
        for body in [&b"one"[..], b"two", b"three"] {
            let staged = staged_file(&store, body).await;
            names.push(store.persist(&staged, "report.pdf").await.unwrap().name);
        }
        assert_eq!(names, ["report.pdf", "report_1.pdf", "report_2.pdf"]);
        assert_eq!(
            std::fs::read(dir.path().join("report_1.pdf")).unwrap(),
            b"two"
        );
    }

    #[tokio::test]
    async fn test_lookup_falls_back_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path(), 0).await.unwrap();

        let staged = staged_file(&store, b"on disk").await;
        store.persist(&staged, "d.bin").await.unwrap();

        match store.lookup("d.bin").await.unwrap() {
            FileSource::Disk { size, .. } => assert_eq!(size, 7),
            other => panic!("expected disk source, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lookup_rejects_unknown_and_unsafe() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path(), 0).await.unwrap();

        assert!(matches!(
            store.lookup("missing.txt").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.lookup("../secret").await,
            Err(StoreError::UnsafeName(_))
        ));
        assert!(matches!(
            store.lookup(STAGING_DIR).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_open_removes_stale_staging_files() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join(STAGING_DIR);
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("old.part"), b"junk").unwrap();

        let _store = FileStore::open(dir.path(), 0).await.unwrap();
        assert!(!staging.join("old.part").exists());
    }
}
