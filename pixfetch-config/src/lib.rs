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

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Eviction policy always works on LRU (Least Recently Used). Any time an
/// entry is read it updates its recency. Inserts will execute the eviction
/// policy, removing the oldest entries until the store size becomes smaller
/// than `max_bytes`.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct EvictionPolicy {
    /// Maximum number of cost units (bytes by convention) before eviction
    /// takes place.
    /// Default: 0. Zero means never evict based on cost.
    #[serde(default)]
    pub max_bytes: u64,

    /// When eviction is triggered by `max_bytes`, keep evicting until this
    /// many cost units below `max_bytes` have been freed. This reduces how
    /// often the eviction pass needs to run on a store hovering at its
    /// limit.
    /// Default: 0. Zero means evict only down to `max_bytes`.
    #[serde(default)]
    pub evict_bytes: u64,

    /// Maximum number of seconds an entry may live after insertion,
    /// regardless of its own expiration. The effective deadline of an entry
    /// is the earlier of this and the entry's expiration.
    /// Default: 0. Zero means no insertion-age limit.
    #[serde(default)]
    pub max_seconds: u32,

    /// Maximum number of entries before an eviction takes place.
    /// Default: 0. Zero means never evict based on count.
    #[serde(default)]
    pub max_count: u64,
}

/// Configuration of the in-memory image store.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct MemoryCacheConfig {
    /// Policy used to evict items out of the store. Failure to set this
    /// value will cause items to never be evicted from the store causing
    /// unbounded memory usage.
    #[serde(default)]
    pub eviction_policy: Option<EvictionPolicy>,

    /// Default time-to-live in seconds applied to entries stored without an
    /// explicit expiration.
    /// Default: 0. Zero means entries never expire by default.
    #[serde(default)]
    pub default_expiration_seconds: u64,

    /// How often, in seconds, the background sweep removes expired entries.
    /// Default: 120.
    #[serde(default)]
    pub clean_interval_seconds: u64,
}

impl MemoryCacheConfig {
    pub fn clean_interval(&self) -> Duration {
        if self.clean_interval_seconds == 0 {
            return Duration::from_secs(120);
        }
        Duration::from_secs(self.clean_interval_seconds)
    }
}

/// Configuration of the on-disk image store.
///
/// The store places one leaf file per entry under
/// `<directory>/<cache_name>/`; there is no index file. The file mtime holds
/// the last-access time and orders size-based eviction.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DiskCacheConfig {
    /// Root directory under which the cache directory is created. When
    /// unset, the system cache directory is used.
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Name of the directory holding this cache instance's files. Two cache
    /// instances sharing a name and root share (and fight over) a
    /// directory.
    pub cache_name: String,

    /// Maximum number of on-disk bytes before `remove_size_exceeded`
    /// evicts entries.
    /// Default: 0. Zero means unlimited.
    #[serde(default)]
    pub size_limit_bytes: u64,

    /// When a size eviction pass runs, entries are removed oldest-access
    /// first until the cumulative size is at or below
    /// `size_limit_bytes * eviction_target_ratio`.
    /// Default: 0.5.
    #[serde(default)]
    pub eviction_target_ratio: Option<f64>,

    /// Default time-to-live in seconds for entries stored without an
    /// explicit expiration.
    /// Default: 604800 (one week).
    #[serde(default)]
    pub default_expiration_seconds: u64,

    /// When true (the default), file names are the 128-bit hex digest of
    /// the cache key. When false, the escaped key bytes are used verbatim.
    #[serde(default = "default_true")]
    pub use_hashed_filenames: bool,

    /// Extension appended to every cache file name, without the leading
    /// dot.
    #[serde(default)]
    pub path_extension: Option<String>,
}

fn default_true() -> bool {
    true
}

impl DiskCacheConfig {
    pub fn new(cache_name: impl Into<String>) -> Self {
        DiskCacheConfig {
            directory: None,
            cache_name: cache_name.into(),
            size_limit_bytes: 0,
            eviction_target_ratio: None,
            default_expiration_seconds: 0,
            use_hashed_filenames: true,
            path_extension: None,
        }
    }

    pub fn eviction_target_ratio(&self) -> f64 {
        self.eviction_target_ratio.unwrap_or(0.5).clamp(0.0, 1.0)
    }

    pub fn default_expiration_seconds(&self) -> u64 {
        if self.default_expiration_seconds == 0 {
            return 7 * 24 * 60 * 60;
        }
        self.default_expiration_seconds
    }
}

/// Retry configuration. This configuration is exponential and each iteration
/// a jitter as a percentage is applied of the calculated delay. For example:
/// ```haskell
/// Retry{
///   max_retries: 7,
///   delay: 0.1,
///   jitter: 0.5,
/// }
/// ```
/// will result in:
/// Attempt - Delay
/// 1         0ms
/// 2         75ms - 125ms
/// 3         150ms - 250ms
/// 4         300ms - 500ms
/// 5         600ms - 1s
/// 6         1.2s - 2s
/// 7         2.4s - 4s
/// 8         4.8s - 8s
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Retry {
    /// Maximum number of retries until retrying stops.
    /// Setting this to zero will always attempt 1 time, but not retry.
    #[serde(default)]
    pub max_retries: usize,

    /// Delay in seconds for exponential back off.
    #[serde(default)]
    pub delay: f32,

    /// Amount of jitter to add as a percentage in decimal form. This will
    /// change the formula like:
    /// ```haskell
    /// random(
    ///    2 ^ {attempt_number} * {delay} * (1 - (jitter / 2)),
    ///    2 ^ {attempt_number} * {delay} * (1 + (jitter / 2)),
    /// )
    /// ```
    #[serde(default)]
    pub jitter: f32,
}

/// Configuration of the download coalescer.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct DownloaderConfig {
    /// Per-request transport timeout in seconds.
    /// Default: 15.
    #[serde(default)]
    pub timeout_seconds: u64,

    /// Maximum number of redirects the bundled HTTP transport will follow
    /// for a single request before giving up.
    /// Default: 10.
    #[serde(default)]
    pub max_redirects: u32,
}

impl DownloaderConfig {
    pub fn timeout(&self) -> Duration {
        if self.timeout_seconds == 0 {
            return Duration::from_secs(15);
        }
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn max_redirects(&self) -> u32 {
        if self.max_redirects == 0 {
            return 10;
        }
        self.max_redirects
    }
}

/// Configuration of the prefetcher batch driver.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct PrefetcherConfig {
    /// Maximum number of retrievals in flight at once.
    /// Default: 5.
    #[serde(default)]
    pub max_concurrent_downloads: usize,
}

impl PrefetcherConfig {
    pub fn max_concurrent_downloads(&self) -> usize {
        if self.max_concurrent_downloads == 0 {
            return 5;
        }
        self.max_concurrent_downloads
    }
}
