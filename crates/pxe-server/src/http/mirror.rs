//! Mirror cache
//!
//! Proxies OS archive files from each kernel's upstream `archive` and keeps
//! them under `http.root`. The in-memory index is keyed by the request path
//! normalised the same way as the file it maps to, so aliases such as
//! `/alpine//netboot` share one entry:
//!
//! 1. downloaded entry: serve it from disk
//! 2. entry still filling: queue behind the fill, no second download
//! 3. no entry: insert one (before any I/O, so concurrent first requests see
//!    it), then fill it from disk if the file already exists or from upstream
//!
//! The fill runs in its own task and is the only place pending waiters are
//! drained, in arrival order. A failed fill answers every waiter with the
//! error and drops the entry so the next request retries.

use crate::error::PxeError;
use crate::metrics::Metrics;
use crate::paths::safe_join;
use chrono::{DateTime, Utc};
use netboot_store::Kernel;
use reqwest::header::{CONTENT_LENGTH, LAST_MODIFIED};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// A file ready to be served
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFile {
    pub file_path: PathBuf,
    pub size: u64,
    /// Upstream `Last-Modified`, verbatim
    pub last_modified: Option<String>,
}

/// Failure delivered to every waiter of a fill
#[derive(Debug, Clone)]
struct FillFailure {
    status: Option<u16>,
    message: String,
}

impl From<FillFailure> for PxeError {
    fn from(failure: FillFailure) -> Self {
        PxeError::UpstreamFetchFailed {
            status: failure.status,
            message: failure.message,
        }
    }
}

type Waiter = oneshot::Sender<Result<CachedFile, FillFailure>>;

/// In-memory cache index entry
#[derive(Debug)]
struct CacheEntry {
    kernel: u64,
    file_path: PathBuf,
    size: u64,
    is_downloading: bool,
    is_downloaded: bool,
    last_modified: Option<String>,
    last_accessed: DateTime<Utc>,
    pending: Vec<Waiter>,
}

impl CacheEntry {
    fn cached(&self) -> CachedFile {
        CachedFile {
            file_path: self.file_path.clone(),
            size: self.size,
            last_modified: self.last_modified.clone(),
        }
    }
}

/// Cache listing row; waiters are reported as a count
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntryInfo {
    pub path: String,
    pub kernel: u64,
    pub file_path: PathBuf,
    pub size: u64,
    pub is_downloading: bool,
    pub is_downloaded: bool,
    pub last_modified: Option<String>,
    pub last_accessed: DateTime<Utc>,
    pub pending_requests: usize,
}

/// Caching reverse proxy for kernel archives
#[derive(Debug, Clone)]
pub struct Mirror {
    root: PathBuf,
    client: reqwest::Client,
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
    metrics: Metrics,
}

impl Mirror {
    pub fn new(root: impl Into<PathBuf>, client: reqwest::Client, metrics: Metrics) -> Self {
        Self {
            root: root.into(),
            client,
            entries: Arc::new(Mutex::new(HashMap::new())),
            metrics,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Index key and on-disk location of a request path
    fn locate(&self, path: &str) -> Result<(String, PathBuf), PxeError> {
        let file_path = safe_join(&self.root, path)?;
        let relative = file_path.strip_prefix(&self.root).unwrap_or(&file_path);
        let key = relative
            .components()
            .fold(String::new(), |mut key, component| {
                key.push('/');
                key.push_str(&component.as_os_str().to_string_lossy());
                key
            });
        Ok((key, file_path))
    }

    /// Resolve `path` of `kernel` to a file on disk, filling the cache if needed
    ///
    /// # Arguments
    ///
    /// * `kernel` - Kernel whose `archive` is the upstream origin
    /// * `path` - Request path, e.g. `/alpine/netboot/3.14.0/vmlinuz-lts`
    ///
    /// # Returns
    ///
    /// The cached file, or `UpstreamFetchFailed` shared by every request
    /// that waited on the same failed fill
    pub async fn fetch(&self, kernel: &Kernel, path: &str) -> Result<CachedFile, PxeError> {
        let (key, file_path) = self.locate(path)?;

        let waiter = {
            let mut entries = self.entries();
            match entries.get_mut(&key) {
                Some(entry) if entry.is_downloaded => {
                    entry.last_accessed = Utc::now();
                    self.metrics.mirror_requests.with_label_values(&["hit"]).inc();
                    debug!("Cache hit for {}", key);
                    return Ok(entry.cached());
                }
                Some(entry) => {
                    let (tx, rx) = oneshot::channel();
                    entry.pending.push(tx);
                    self.metrics.mirror_requests.with_label_values(&["wait"]).inc();
                    debug!("Waiting on in-flight fill of {} ({} queued)", key, entry.pending.len());
                    rx
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    entries.insert(
                        key.clone(),
                        CacheEntry {
                            kernel: kernel.id,
                            file_path: file_path.clone(),
                            size: 0,
                            is_downloading: true,
                            is_downloaded: false,
                            last_modified: None,
                            last_accessed: Utc::now(),
                            pending: vec![tx],
                        },
                    );
                    self.metrics.mirror_requests.with_label_values(&["miss"]).inc();

                    let mirror = self.clone();
                    let key = key.clone();
                    let archive = kernel.archive.clone();
                    tokio::spawn(async move { mirror.fill(key, archive, file_path).await });
                    rx
                }
            }
        };

        match waiter.await {
            Ok(result) => result.map_err(|failure| {
                self.metrics.mirror_requests.with_label_values(&["error"]).inc();
                failure.into()
            }),
            Err(_) => Err(PxeError::UpstreamFetchFailed {
                status: None,
                message: format!("Fill of {} was abandoned", key),
            }),
        }
    }

    /// Complete the entry for `key` and answer its waiters
    async fn fill(&self, key: String, archive: Option<String>, file_path: PathBuf) {
        let result = match tokio::fs::metadata(&file_path).await {
            Ok(metadata) if metadata.is_file() => {
                info!("Cache entry found on disk for {}", key);
                self.metrics.mirror_downloads.with_label_values(&["disk"]).inc();
                Ok(CachedFile {
                    file_path: file_path.clone(),
                    size: metadata.len(),
                    last_modified: None,
                })
            }
            _ => match archive {
                Some(archive) => {
                    let url = format!("{}{}", archive.trim_end_matches('/'), key);
                    let result = self.download(&url, &file_path).await;
                    let label = if result.is_ok() { "ok" } else { "failed" };
                    self.metrics.mirror_downloads.with_label_values(&[label]).inc();
                    result
                }
                None => Err(FillFailure {
                    status: Some(404),
                    message: format!("{} is not on disk and its kernel has no archive", key),
                }),
            },
        };

        let waiters = {
            let mut entries = self.entries();
            match &result {
                Ok(cached) => match entries.get_mut(&key) {
                    Some(entry) => {
                        entry.is_downloading = false;
                        entry.is_downloaded = true;
                        entry.size = cached.size;
                        entry.last_modified = cached.last_modified.clone();
                        std::mem::take(&mut entry.pending)
                    }
                    None => Vec::new(),
                },
                Err(_) => entries.remove(&key).map(|entry| entry.pending).unwrap_or_default(),
            }
        };

        if let Err(failure) = &result {
            warn!("Cache fill of {} failed: {}", key, failure.message);
        }
        for waiter in waiters {
            // A waiter whose request was cancelled has dropped its receiver
            let _ = waiter.send(result.clone());
        }
    }

    /// Stream `url` into `file_path` via a temporary file in the same directory
    ///
    /// The temporary file is unique per fill and only renamed into place once
    /// the body is complete, so `file_path` never holds a partial download.
    async fn download(&self, url: &str, file_path: &Path) -> Result<CachedFile, FillFailure> {
        let failure = |message: String| FillFailure { status: None, message };

        info!("Downloading {} to {}", url, file_path.display());
        let parent = file_path.parent().unwrap_or(&self.root);
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| failure(format!("Cannot create {}: {}", parent.display(), e)))?;

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| failure(format!("Error downloading {}: {}", url, e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FillFailure {
                status: Some(status.as_u16()),
                message: format!("Error downloading {}: upstream answered {}", url, status),
            });
        }

        let expected = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let last_modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        // Removed on drop unless persisted
        let (file, part) = tempfile::Builder::new()
            .suffix(".part")
            .tempfile_in(parent)
            .map_err(|e| failure(format!("Cannot create a download file in {}: {}", parent.display(), e)))?
            .into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let mut size: u64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| failure(format!("Error downloading {}: {}", url, e)))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| failure(format!("Cannot write {}: {}", part.display(), e)))?;
            size += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| failure(format!("Cannot write {}: {}", part.display(), e)))?;
        drop(file);

        if let Some(expected) = expected {
            if expected != size {
                return Err(failure(format!(
                    "Truncated download of {}: {} of {} bytes",
                    url, size, expected
                )));
            }
        }

        part.persist(file_path)
            .map_err(|e| failure(format!("Cannot move download into {}: {}", file_path.display(), e)))?;

        info!("Downloaded {} ({} bytes)", url, size);
        Ok(CachedFile {
            file_path: file_path.to_path_buf(),
            size,
            last_modified,
        })
    }

    /// Cache index, sorted by path
    pub fn list(&self) -> Vec<CacheEntryInfo> {
        let mut rows: Vec<CacheEntryInfo> = self
            .entries()
            .iter()
            .map(|(path, entry)| CacheEntryInfo {
                path: path.clone(),
                kernel: entry.kernel,
                file_path: entry.file_path.clone(),
                size: entry.size,
                is_downloading: entry.is_downloading,
                is_downloaded: entry.is_downloaded,
                last_modified: entry.last_modified.clone(),
                last_accessed: entry.last_accessed,
                pending_requests: entry.pending.len(),
            })
            .collect();
        rows.sort_by(|a, b| a.path.cmp(&b.path));
        rows
    }

    /// Entry for `path`, if indexed
    pub fn get(&self, path: &str) -> Option<CacheEntryInfo> {
        let (key, _) = self.locate(path).ok()?;
        self.list().into_iter().find(|row| row.path == key)
    }

    /// Forget downloaded entries; files on disk are kept
    ///
    /// Entries still filling stay indexed so their waiters are answered.
    ///
    /// # Returns
    ///
    /// Number of entries dropped
    pub fn clear(&self) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_downloading);
        let dropped = before - entries.len();
        info!("Cleared {} cache entries", dropped);
        dropped
    }
}
