//! Transient storage for uploads while they are being classified.
//!
//! Every accepted upload is written to a [`StagingStorage`] under a name that is unique
//! per request, read back to build the outbound request, and then released. Two
//! implementations are provided:
//!
//! - [`DiskStaging`] writes files into a directory (the OS temp dir by default)
//! - [`MemoryStaging`] keeps bytes in a concurrent map, useful for tests and for
//!   deployments without a writable filesystem
//!
//! Handlers never talk to the storage directly; they go through [`StagedFile`], which
//! owns the staged entry and guarantees it is released exactly once. The normal path
//! is an explicit [`StagedFile::release`] after the backend reply has been read. If the
//! request future is dropped first (client disconnect), `Drop` spawns the release
//! onto the runtime instead.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::{DashMap, mapref::entry::Entry};
use std::{
    fmt,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, task::JoinHandle};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Longest sanitized original filename kept in a staged name
const MAX_NAME_CHARS: usize = 100;

/// Unique identifier of a staged upload within its storage
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StagedKey(String);

impl StagedKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StagedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("staging I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("staged upload {0} does not exist")]
    Missing(StagedKey),

    #[error("staged name {0} is already in use")]
    Collision(StagedKey),
}

/// Storage backend for uploads that are in flight.
#[async_trait]
pub trait StagingStorage: Send + Sync {
    /// Store `bytes` under a fresh unique key derived from `original_name`.
    async fn stage(&self, original_name: &str, bytes: Bytes) -> Result<StagedKey, StagingError>;

    /// Read back the full contents of a staged upload.
    async fn read(&self, key: &StagedKey) -> Result<Bytes, StagingError>;

    /// Delete a staged upload.
    async fn release(&self, key: &StagedKey) -> Result<(), StagingError>;
}

/// Build a staged name: `upload-<unix nanos>-<random token>-<sanitized original name>`.
///
/// The timestamp keeps names sortable for anyone inspecting the staging directory, the
/// random token keeps two requests landing in the same nanosecond apart.
pub fn staged_name(original_name: &str) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let token = Uuid::new_v4().simple().to_string();
    format!("upload-{}-{}-{}", nanos, &token[..12], sanitize_file_name(original_name))
}

/// Keep only the last path component and replace anything outside `[A-Za-z0-9._-]`.
fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .take(MAX_NAME_CHARS)
        .collect();
    let cleaned = cleaned.trim_start_matches('.');

    if cleaned.is_empty() {
        "image".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Stages uploads as files in a directory.
#[derive(Debug, Clone)]
pub struct DiskStaging {
    dir: PathBuf,
}

impl DiskStaging {
    /// Create the staging directory if needed.
    pub async fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &StagedKey) -> PathBuf {
        self.dir.join(key.as_str())
    }
}

fn not_found_as_missing(err: std::io::Error, key: &StagedKey) -> StagingError {
    if err.kind() == ErrorKind::NotFound {
        StagingError::Missing(key.clone())
    } else {
        StagingError::Io(err)
    }
}

/// Create `path` (never overwriting) and fill it with `bytes`.
///
/// A failed write removes the partial file before returning.
async fn write_new_file(path: PathBuf, bytes: Bytes) -> std::io::Result<()> {
    // create_new refuses to overwrite, so a collision can never clobber another request
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .await?;

    let written = async {
        file.write_all(&bytes).await?;
        file.flush().await
    }
    .await;
    drop(file);

    if let Err(e) = written {
        if let Err(cleanup) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %cleanup, "Failed to remove partially staged upload");
        }
        return Err(e);
    }

    Ok(())
}

/// Owns a disk write running on its own task until its result has been handed back.
///
/// The write is spawned so that dropping the caller cannot interrupt it halfway. If the
/// caller goes away before the result arrives, `Drop` waits for the write in the
/// background and deletes the file it produced.
struct PendingWrite {
    key: StagedKey,
    path: PathBuf,
    handle: Option<JoinHandle<std::io::Result<()>>>,
}

impl PendingWrite {
    fn spawn(key: StagedKey, path: PathBuf, bytes: Bytes) -> Self {
        let handle = tokio::spawn(write_new_file(path.clone(), bytes));
        Self {
            key,
            path,
            handle: Some(handle),
        }
    }

    async fn finish(mut self) -> Result<StagedKey, StagingError> {
        let joined = match self.handle.as_mut() {
            Some(handle) => handle.await,
            None => return Ok(self.key.clone()),
        };
        self.handle = None;

        match joined {
            Ok(Ok(())) => Ok(self.key.clone()),
            Ok(Err(e)) if e.kind() == ErrorKind::AlreadyExists => Err(StagingError::Collision(self.key.clone())),
            Ok(Err(e)) => Err(StagingError::Io(e)),
            Err(e) => Err(StagingError::Io(std::io::Error::other(e))),
        }
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        let key = self.key.clone();
        let path = self.path.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!(staged = %key, "Request ended while staging, removing upload once written");
                runtime.spawn(async move {
                    // Only a completed write left a file that belongs to this request
                    if let Ok(Ok(())) = handle.await
                        && let Err(e) = tokio::fs::remove_file(&path).await
                    {
                        warn!(staged = %key, error = %e, "Failed to remove abandoned staged upload");
                    }
                });
            }
            Err(_) => {
                warn!(staged = %key, "No runtime available, abandoned staged upload was not removed");
            }
        }
    }
}

#[async_trait]
impl StagingStorage for DiskStaging {
    async fn stage(&self, original_name: &str, bytes: Bytes) -> Result<StagedKey, StagingError> {
        let key = StagedKey(staged_name(original_name));
        let path = self.path_for(&key);

        PendingWrite::spawn(key, path, bytes).finish().await
    }

    async fn read(&self, key: &StagedKey) -> Result<Bytes, StagingError> {
        tokio::fs::read(self.path_for(key))
            .await
            .map(Bytes::from)
            .map_err(|e| not_found_as_missing(e, key))
    }

    async fn release(&self, key: &StagedKey) -> Result<(), StagingError> {
        tokio::fs::remove_file(self.path_for(key))
            .await
            .map_err(|e| not_found_as_missing(e, key))
    }
}

/// Stages uploads in memory.
#[derive(Debug, Default)]
pub struct MemoryStaging {
    files: DashMap<StagedKey, Bytes>,
    staged: AtomicUsize,
    released: AtomicUsize,
}

impl MemoryStaging {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of uploads currently staged
    pub fn live(&self) -> usize {
        self.files.len()
    }

    /// Total number of successful `stage` calls
    pub fn staged_count(&self) -> usize {
        self.staged.load(Ordering::SeqCst)
    }

    /// Total number of successful `release` calls
    pub fn released_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StagingStorage for MemoryStaging {
    async fn stage(&self, original_name: &str, bytes: Bytes) -> Result<StagedKey, StagingError> {
        let key = StagedKey(staged_name(original_name));
        match self.files.entry(key.clone()) {
            Entry::Occupied(_) => Err(StagingError::Collision(key)),
            Entry::Vacant(slot) => {
                slot.insert(bytes);
                self.staged.fetch_add(1, Ordering::SeqCst);
                Ok(key)
            }
        }
    }

    async fn read(&self, key: &StagedKey) -> Result<Bytes, StagingError> {
        self.files
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StagingError::Missing(key.clone()))
    }

    async fn release(&self, key: &StagedKey) -> Result<(), StagingError> {
        self.files.remove(key).ok_or_else(|| StagingError::Missing(key.clone()))?;
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// An upload held in staging storage for the duration of one request.
pub struct StagedFile {
    key: StagedKey,
    size_bytes: usize,
    storage: Arc<dyn StagingStorage>,
    released: bool,
}

impl StagedFile {
    /// Stage `bytes` and take ownership of the resulting entry.
    #[instrument(skip(storage, bytes), fields(size_bytes = bytes.len()), err)]
    pub async fn acquire(storage: Arc<dyn StagingStorage>, original_name: &str, bytes: Bytes) -> Result<Self, StagingError> {
        let size_bytes = bytes.len();
        let key = storage.stage(original_name, bytes).await?;
        ::metrics::counter!("imgclass_staged_files_total").increment(1);
        debug!(staged = %key, "Staged upload");

        Ok(Self {
            key,
            size_bytes,
            storage,
            released: false,
        })
    }

    pub fn key(&self) -> &StagedKey {
        &self.key
    }

    /// Read the staged bytes back from storage.
    pub async fn contents(&self) -> Result<Bytes, StagingError> {
        self.storage.read(&self.key).await
    }

    /// Delete the staged entry. Failures are logged and swallowed.
    pub async fn release(mut self) {
        self.released = true;
        release_logged(self.storage.as_ref(), &self.key, self.size_bytes).await;
    }
}

async fn release_logged(storage: &dyn StagingStorage, key: &StagedKey, size_bytes: usize) {
    match storage.release(key).await {
        Ok(()) => {
            ::metrics::counter!("imgclass_released_files_total").increment(1);
            debug!(staged = %key, size_bytes, "Released staged upload");
        }
        Err(e) => {
            warn!(staged = %key, error = %e, "Failed to release staged upload");
        }
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let storage = self.storage.clone();
        let key = self.key.clone();
        let size_bytes = self.size_bytes;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(staged = %key, "Request ended before release, releasing in background");
                handle.spawn(async move {
                    release_logged(storage.as_ref(), &key, size_bytes).await;
                });
            }
            Err(_) => {
                warn!(staged = %key, "No runtime available, staged upload was not released");
            }
        }
    }
}

impl fmt::Debug for StagedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagedFile")
            .field("key", &self.key)
            .field("size_bytes", &self.size_bytes)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::collections::HashSet;
    use std::time::Duration;

    /// Storage whose release always fails
    struct StuckStaging(MemoryStaging);

    #[async_trait]
    impl StagingStorage for StuckStaging {
        async fn stage(&self, original_name: &str, bytes: Bytes) -> Result<StagedKey, StagingError> {
            self.0.stage(original_name, bytes).await
        }

        async fn read(&self, key: &StagedKey) -> Result<Bytes, StagingError> {
            self.0.read(key).await
        }

        async fn release(&self, _key: &StagedKey) -> Result<(), StagingError> {
            Err(StagingError::Io(std::io::Error::new(ErrorKind::PermissionDenied, "read-only")))
        }
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("cat.png"), "cat.png");
        assert_eq!(sanitize_file_name("my cat (1).jpg"), "my_cat__1_.jpg");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\me\\dog.jpeg"), "dog.jpeg");
        assert_eq!(sanitize_file_name(".."), "image");
        assert_eq!(sanitize_file_name(""), "image");
        assert_eq!(sanitize_file_name(&"a".repeat(500)).len(), MAX_NAME_CHARS);
    }

    #[test]
    fn test_staged_name_shape() {
        let name = staged_name("cat.png");
        assert!(name.starts_with("upload-"));
        assert!(name.ends_with("-cat.png"));
        assert_ne!(name, staged_name("cat.png"));
    }

    #[tokio::test]
    async fn test_concurrent_stages_with_same_name_never_collide() {
        let storage = Arc::new(MemoryStaging::new());

        let stages = (0..64).map(|_| {
            let storage = storage.clone();
            async move { storage.stage("cat.png", Bytes::from_static(b"img")).await }
        });
        let keys: Vec<StagedKey> = join_all(stages).await.into_iter().map(|r| r.unwrap()).collect();

        let distinct: HashSet<_> = keys.iter().collect();
        assert_eq!(distinct.len(), 64);
        assert_eq!(storage.live(), 64);
    }

    #[tokio::test]
    async fn test_disk_staging_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStaging::new(dir.path().join("uploads")).await.unwrap();

        let key = storage.stage("dog.jpg", Bytes::from_static(b"\xff\xd8jpeg")).await.unwrap();
        let path = storage.dir().join(key.as_str());
        assert!(path.exists());
        assert_eq!(storage.read(&key).await.unwrap(), Bytes::from_static(b"\xff\xd8jpeg"));

        storage.release(&key).await.unwrap();
        assert!(!path.exists());

        assert!(matches!(storage.release(&key).await, Err(StagingError::Missing(_))));
        assert!(matches!(storage.read(&key).await, Err(StagingError::Missing(_))));
    }

    #[tokio::test]
    async fn test_disk_staging_concurrent_same_name() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(DiskStaging::new(dir.path()).await.unwrap());

        let stages = (0..32).map(|i| {
            let storage = storage.clone();
            async move { storage.stage("same.png", Bytes::from(vec![i as u8; 16])).await }
        });
        let keys: Vec<StagedKey> = join_all(stages).await.into_iter().map(|r| r.unwrap()).collect();

        let distinct: HashSet<_> = keys.iter().collect();
        assert_eq!(distinct.len(), 32);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 32);
    }

    #[tokio::test]
    async fn test_cancelled_disk_stage_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStaging::new(dir.path()).await.unwrap();
        let bytes = Bytes::from(vec![0u8; 64 * 1024 * 1024]);

        let staged = tokio::time::timeout(Duration::from_micros(50), storage.stage("cat.png", bytes)).await;
        if let Ok(Ok(key)) = staged {
            // Finished before the deadline, so it is ours to release
            storage.release(&key).await.unwrap();
        }

        let mut remaining = usize::MAX;
        for _ in 0..200 {
            remaining = std::fs::read_dir(dir.path()).unwrap().count();
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(remaining, 0, "staged file left behind after a cancelled stage");
    }

    #[tokio::test]
    async fn test_staged_file_release_is_exactly_once() {
        let storage = Arc::new(MemoryStaging::new());

        let staged = StagedFile::acquire(storage.clone(), "cat.png", Bytes::from_static(b"img"))
            .await
            .unwrap();
        assert_eq!(staged.contents().await.unwrap(), Bytes::from_static(b"img"));
        assert_eq!(storage.live(), 1);

        staged.release().await;
        // Give any stray background release a chance to run
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(storage.live(), 0);
        assert_eq!(storage.released_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_staged_file_is_released_in_background() {
        let storage = Arc::new(MemoryStaging::new());

        let staged = StagedFile::acquire(storage.clone(), "cat.png", Bytes::from_static(b"img"))
            .await
            .unwrap();
        drop(staged);

        for _ in 0..50 {
            if storage.live() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(storage.live(), 0);
        assert_eq!(storage.released_count(), 1);
    }

    #[tokio::test]
    async fn test_release_failure_is_swallowed() {
        let storage = Arc::new(StuckStaging(MemoryStaging::new()));

        let staged = StagedFile::acquire(storage.clone(), "cat.png", Bytes::from_static(b"img"))
            .await
            .unwrap();
        staged.release().await;

        assert_eq!(storage.0.live(), 1);
    }
}
