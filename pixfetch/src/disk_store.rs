// Copyright 2024 The Pixfetch Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use filetime::FileTime;
use parking_lot::Mutex;
use pixfetch_config::DiskCacheConfig;
use pixfetch_error::{make_err, Code, Error, ResultExt};
use pixfetch_util::expiration::{Expiration, ExpirationExtending};
use serde::{Deserialize, Serialize};
use tracing::warn;

const METADATA_SUFFIX: &str = ".meta";
const TEMP_SUFFIX: &str = ".tmp";

/// Per-write knobs of the disk store.
#[derive(Clone, Copy, Debug, Default)]
pub struct DiskWriteOptions {
    /// Flush the content file to stable storage before the write resolves.
    pub sync_on_write: bool,
}

/// Sidecar record written next to every content file. Stands in for an
/// extended attribute so externally synced cache directories stay
/// self-describing.
#[derive(Serialize, Deserialize, Debug)]
struct SidecarMeta {
    /// Expiration policy the entry was stored with; re-arms the deadline on
    /// access-extending reads.
    expiration: Expiration,
    /// `None` means the entry never expires.
    estimated_expiration: Option<SystemTime>,
    file_size: u64,
}

struct DiskEntrySnapshot {
    path: PathBuf,
    size: u64,
    modified: FileTime,
    estimated_expiration: Option<SystemTime>,
}

/// The slow tier: one leaf file per entry plus a metadata sidecar, no index
/// file. File names derive deterministically from cache keys; mtime encodes
/// last access and orders size-based eviction.
pub struct DiskStore {
    directory: PathBuf,
    config: DiskCacheConfig,
    /// Serialises all metadata-modifying operations (mtime refreshes,
    /// expiration rewrites). Content reads and writes run outside it.
    /// Shared so blocking-pool closures can take their turn on it.
    metadata_queue: Arc<Mutex<()>>,
}

impl DiskStore {
    /// Creates the store and its directory. The directory is re-created on
    /// the next write if deleted externally.
    pub fn new(config: DiskCacheConfig) -> Result<Self, Error> {
        if config.cache_name.is_empty() {
            return Err(make_err!(Code::InvalidArgument, "Disk cache name may not be empty"));
        }
        let root = match &config.directory {
            Some(directory) => directory.clone(),
            None => dirs::cache_dir().unwrap_or_else(std::env::temp_dir),
        };
        let directory = root.join(&config.cache_name);
        std::fs::create_dir_all(&directory).err_tip_with_code(|_| {
            (
                Code::CannotCreateDirectory,
                format!("While creating cache directory {}", directory.display()),
            )
        })?;
        Ok(DiskStore {
            directory,
            config,
            metadata_queue: Arc::new(Mutex::new(())),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Deterministic file name for `key`: the 128-bit hex digest of the key
    /// bytes in hashed mode, the escaped key bytes verbatim otherwise, plus
    /// the configured extension.
    pub fn file_name(&self, key: &str) -> String {
        let mut name = if self.config.use_hashed_filenames {
            hex::encode(md5::compute(key.as_bytes()).0)
        } else {
            escape_key(key)
        };
        if let Some(extension) = &self.config.path_extension {
            name.push('.');
            name.push_str(extension);
        }
        name
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.directory.join(self.file_name(key))
    }

    fn meta_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(METADATA_SUFFIX);
        PathBuf::from(name)
    }

    fn default_expiration(&self) -> Expiration {
        Expiration::Seconds(self.config.default_expiration_seconds())
    }

    /// Writes `data` under `key`. The content lands via a temp file and an
    /// atomic rename so readers never observe a torn entry.
    pub async fn store(
        &self,
        key: &str,
        data: &Bytes,
        expiration: Option<Expiration>,
        write_options: &DiskWriteOptions,
    ) -> Result<(), Error> {
        let expiration = expiration.unwrap_or_else(|| self.default_expiration());
        let path = self.file_path(key);
        tokio::fs::create_dir_all(&self.directory)
            .await
            .err_tip_with_code(|_| {
                (
                    Code::CannotCreateDirectory,
                    format!("While re-creating cache directory {}", self.directory.display()),
                )
            })?;

        let mut temp_name = path.as_os_str().to_owned();
        temp_name.push(TEMP_SUFFIX);
        let temp_path = PathBuf::from(temp_name);
        {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::File::create(&temp_path)
                .await
                .err_tip(|| format!("While creating temp file {}", temp_path.display()))?;
            file.write_all(data)
                .await
                .err_tip(|| format!("While writing cache entry {}", path.display()))?;
            if write_options.sync_on_write {
                file.sync_all()
                    .await
                    .err_tip(|| format!("While syncing cache entry {}", path.display()))?;
            }
        }
        tokio::fs::rename(&temp_path, &path)
            .await
            .err_tip(|| format!("While committing cache entry {}", path.display()))?;

        let now = SystemTime::now();
        let meta = SidecarMeta {
            estimated_expiration: expiration.estimated_expiration(now),
            expiration,
            file_size: data.len() as u64,
        };
        let queue = self.metadata_queue.clone();
        spawn_blocking_joined(move || {
            let _queue = queue.lock();
            write_sidecar(&path, &meta)?;
            filetime::set_file_mtime(&path, FileTime::from_system_time(now))
                .err_tip(|| format!("While stamping access time on {}", path.display()))
        })
        .await?
    }

    /// Reads the bytes stored under `key`, if present and not expired.
    /// With an extending policy the read advances mtime and re-arms the
    /// sidecar deadline.
    pub async fn value(
        &self,
        key: &str,
        extending: ExpirationExtending,
    ) -> Result<Option<Bytes>, Error> {
        let path = self.file_path(key);
        let now = SystemTime::now();
        let meta = {
            let path = path.clone();
            spawn_blocking_joined(move || read_sidecar_if_live(&path, now)).await?
        };
        let Some(meta) = meta else {
            return Ok(None);
        };
        let data = match tokio::fs::read(&path).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::from(e)).err_tip_with_code(|_| {
                    (
                        Code::CannotLoadFromDisk,
                        format!("While reading cache entry {}", path.display()),
                    )
                })
            }
        };
        let queue = self.metadata_queue.clone();
        spawn_blocking_joined(move || extend_entry(&queue, &path, &meta, extending, now)).await?;
        Ok(Some(data))
    }

    /// Same as [`DiskStore::value`] but on the caller's thread with
    /// blocking I/O.
    pub fn value_sync(
        &self,
        key: &str,
        extending: ExpirationExtending,
    ) -> Result<Option<Bytes>, Error> {
        let path = self.file_path(key);
        let now = SystemTime::now();
        let Some(meta) = read_sidecar_if_live(&path, now) else {
            return Ok(None);
        };
        let data = match std::fs::read(&path) {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::from(e)).err_tip_with_code(|_| {
                    (
                        Code::CannotLoadFromDisk,
                        format!("While reading cache entry {}", path.display()),
                    )
                })
            }
        };
        extend_entry(&self.metadata_queue, &path, &meta, extending, now);
        Ok(Some(data))
    }

    /// Presence check against `reference_date` (now when `None`). Reads the
    /// metadata snapshot only; never touches the metadata queue.
    pub fn is_cached(&self, key: &str, reference_date: Option<SystemTime>) -> bool {
        let path = self.file_path(key);
        if !path.is_file() {
            return false;
        }
        read_sidecar_if_live(&path, reference_date.unwrap_or_else(SystemTime::now)).is_some()
    }

    /// Removing an absent entry is not an error.
    pub async fn remove(&self, key: &str) -> Result<(), Error> {
        let path = self.file_path(key);
        remove_entry_files(&path).await
    }

    /// Deletes the whole cache directory. Unless `skip_recreate` is set the
    /// empty directory is restored so subsequent writes need no extra
    /// bootstrap.
    pub async fn remove_all(&self, skip_recreate: bool) -> Result<(), Error> {
        match tokio::fs::remove_dir_all(&self.directory).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::from(e))
                    .err_tip(|| format!("While clearing cache directory {}", self.directory.display()))
            }
        }
        if !skip_recreate {
            tokio::fs::create_dir_all(&self.directory)
                .await
                .err_tip_with_code(|_| {
                    (
                        Code::CannotCreateDirectory,
                        format!("While re-creating cache directory {}", self.directory.display()),
                    )
                })?;
        }
        Ok(())
    }

    /// Removes every entry expired at `reference_date`. Returns the paths
    /// of the removed content files.
    pub async fn remove_expired(&self, reference_date: SystemTime) -> Result<Vec<PathBuf>, Error> {
        let mut removed = Vec::new();
        for entry in self.scan().await? {
            let expired = match entry.estimated_expiration {
                Some(deadline) => reference_date >= deadline,
                None => false,
            };
            if expired {
                remove_entry_files(&entry.path).await?;
                removed.push(entry.path);
            }
        }
        Ok(removed)
    }

    /// When cumulative content size exceeds the configured limit, removes
    /// entries oldest-access first until it is at or below
    /// `limit * eviction_target_ratio`. Returns the removed paths.
    pub async fn remove_size_exceeded(&self) -> Result<Vec<PathBuf>, Error> {
        let limit = self.config.size_limit_bytes;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut entries = self.scan().await?;
        let mut total: u64 = entries.iter().map(|e| e.size).sum();
        if total <= limit {
            return Ok(Vec::new());
        }
        let target = (limit as f64 * self.config.eviction_target_ratio()) as u64;
        entries.sort_by_key(|e| e.modified);

        let mut removed = Vec::new();
        for entry in entries {
            if total <= target {
                break;
            }
            remove_entry_files(&entry.path).await?;
            total -= entry.size;
            removed.push(entry.path);
        }
        Ok(removed)
    }

    /// Cumulative size of all content files.
    pub async fn total_size(&self) -> Result<u64, Error> {
        Ok(self.scan().await?.iter().map(|e| e.size).sum())
    }

    async fn scan(&self) -> Result<Vec<DiskEntrySnapshot>, Error> {
        let mut read_dir = match tokio::fs::read_dir(&self.directory).await {
            Ok(read_dir) => read_dir,
            // An externally deleted directory is an empty store, not an
            // error.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::from(e))
                    .err_tip(|| format!("While scanning cache directory {}", self.directory.display()))
            }
        };
        let mut content_files = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .err_tip(|| "While iterating cache directory")?
        {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(METADATA_SUFFIX) || name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            let Ok(metadata) = entry.metadata().await else {
                continue; // Deleted while scanning.
            };
            if !metadata.is_file() {
                continue;
            }
            content_files.push((
                path,
                metadata.len(),
                FileTime::from_last_modification_time(&metadata),
            ));
        }
        // Sidecar reads hit the filesystem synchronously; batch them onto
        // the blocking pool.
        spawn_blocking_joined(move || {
            Ok(content_files
                .into_iter()
                .map(|(path, size, modified)| DiskEntrySnapshot {
                    estimated_expiration: read_sidecar(&path)
                        .map(|m| m.estimated_expiration)
                        .unwrap_or(None),
                    path,
                    size,
                    modified,
                })
                .collect())
        })
        .await?
    }
}

/// Runs a blocking filesystem closure on the blocking pool and flattens the
/// join error.
async fn spawn_blocking_joined<T, F>(work: F) -> Result<T, Error>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| make_err!(Code::Internal, "Failed to join blocking disk task: {e}"))
}

/// Re-arms the sidecar deadline and mtime after an access-extending read.
/// Failures are logged, not surfaced: the read itself already succeeded.
fn extend_entry(
    queue: &Mutex<()>,
    path: &Path,
    meta: &SidecarMeta,
    extending: ExpirationExtending,
    accessed_at: SystemTime,
) {
    let Some(new_deadline) = extending.extended_deadline(&meta.expiration, accessed_at) else {
        return;
    };
    let _queue = queue.lock();
    let new_meta = SidecarMeta {
        expiration: meta.expiration,
        estimated_expiration: new_deadline,
        file_size: meta.file_size,
    };
    if let Err(e) = write_sidecar(path, &new_meta) {
        warn!("Failed to extend expiration of {}: {e}", path.display());
    }
    if let Err(e) = filetime::set_file_mtime(path, FileTime::from_system_time(accessed_at)) {
        warn!("Failed to refresh access time of {}: {e}", path.display());
    }
}

/// Reads the sidecar record, if any. A missing or malformed sidecar is
/// reported as `None`, which callers treat as never-expiring for
/// compatibility with externally populated directories.
fn read_sidecar(path: &Path) -> Option<SidecarMeta> {
    let meta_path = DiskStore::meta_path(path);
    let raw = std::fs::read(&meta_path).ok()?;
    match bincode::deserialize(&raw) {
        Ok(meta) => Some(meta),
        Err(e) => {
            warn!(
                "Malformed expiration metadata at {}; treating entry as never-expiring: {e}",
                meta_path.display()
            );
            None
        }
    }
}

/// Metadata snapshot for a live (present, unexpired) entry. An entry with
/// no sidecar is live and never expires.
fn read_sidecar_if_live(path: &Path, reference: SystemTime) -> Option<SidecarMeta> {
    let meta = match read_sidecar(path) {
        Some(meta) => meta,
        None => {
            if !path.is_file() {
                return None;
            }
            let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            SidecarMeta {
                expiration: Expiration::Never,
                estimated_expiration: None,
                file_size: size,
            }
        }
    };
    match meta.estimated_expiration {
        Some(deadline) if reference >= deadline => None,
        _ => Some(meta),
    }
}

fn write_sidecar(path: &Path, meta: &SidecarMeta) -> Result<(), Error> {
    let encoded = bincode::serialize(meta)
        .map_err(|e| make_err!(Code::Internal, "Failed to encode sidecar metadata: {e}"))?;
    std::fs::write(DiskStore::meta_path(path), encoded)
        .err_tip(|| format!("While writing sidecar metadata for {}", path.display()))
}

async fn remove_entry_files(path: &Path) -> Result<(), Error> {
    for target in [path.to_path_buf(), DiskStore::meta_path(path)] {
        match tokio::fs::remove_file(&target).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::from(e))
                    .err_tip(|| format!("While removing cache entry {}", target.display()))
            }
        }
    }
    Ok(())
}

/// Escapes a cache key for verbatim (non-hashed) file naming. Reserved
/// filesystem bytes and the escape character itself are percent-encoded;
/// everything else is preserved, so distinct keys map to distinct names.
fn escape_key(key: &str) -> String {
    let mut escaped = String::with_capacity(key.len());
    for byte in key.bytes() {
        let reserved = matches!(byte, b'/' | b'\\' | b':' | b'*' | b'?' | b'"' | b'<' | b'>' | b'|' | b'%')
            || byte < 0x20
            || byte >= 0x7f;
        if reserved {
            escaped.push('%');
            escaped.push_str(&format!("{byte:02x}"));
        } else {
            escaped.push(byte as char);
        }
    }
    escaped
}
