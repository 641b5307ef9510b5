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

use std::sync::Arc;

use bytes::Bytes;
use pixfetch_config::{DiskCacheConfig, MemoryCacheConfig};
use pixfetch_error::{Error, ResultExt};
use pixfetch_util::common::Fingerprint;
use pixfetch_util::expiration::{Expiration, ExpirationExtending};
use tracing::{debug, warn};

use crate::decoded_image::{DecodeOptions, DecodedImage};
use crate::disk_store::{DiskStore, DiskWriteOptions};
use crate::memory_store::MemoryStore;
use crate::serializer::CacheSerializer;

/// Which tier satisfied a retrieval.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheType {
    /// Not served from cache (fresh download or provider read).
    None,
    Memory,
    Disk,
}

/// Read-side policy for a two-tier lookup.
#[derive(Clone, Debug, Default)]
pub struct CacheReadOptions {
    /// Skip the disk tier entirely; a memory miss is a miss.
    pub memory_only: bool,
    /// Read disk content on the caller's thread instead of the async pool.
    pub load_disk_synchronously: bool,
    pub memory_extending: ExpirationExtending,
    pub disk_extending: ExpirationExtending,
    /// Expiration used when a disk hit back-fills the memory tier.
    pub memory_expiration: Option<Expiration>,
}

/// Write-side policy for a two-tier store.
#[derive(Clone, Debug, Default)]
pub struct CacheWriteOptions {
    pub memory_expiration: Option<Expiration>,
    pub disk_expiration: Option<Expiration>,
    /// Do not touch the disk tier.
    pub memory_only: bool,
    /// Resolve only after the disk write has resolved. Without this the
    /// disk write is fire-and-forget.
    pub wait_for_disk: bool,
    pub disk_write_options: DiskWriteOptions,
}

/// A memory tier in front of a disk tier, indexed by fingerprint. Reads
/// fall through memory to disk; a disk hit back-fills memory while
/// returning, so the next read of the same fingerprint is a memory hit.
pub struct ImageCache {
    memory: Arc<MemoryStore>,
    disk: Arc<DiskStore>,
}

impl ImageCache {
    pub fn new(
        memory_config: &MemoryCacheConfig,
        disk_config: DiskCacheConfig,
    ) -> Result<Arc<Self>, Error> {
        Ok(Arc::new(ImageCache {
            memory: Arc::new(MemoryStore::new(memory_config)),
            disk: Arc::new(DiskStore::new(disk_config)?),
        }))
    }

    pub fn from_parts(memory: Arc<MemoryStore>, disk: Arc<DiskStore>) -> Arc<Self> {
        Arc::new(ImageCache { memory, disk })
    }

    pub fn memory_store(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    pub fn disk_store(&self) -> &Arc<DiskStore> {
        &self.disk
    }

    /// The tier that would serve `fingerprint` right now.
    pub fn cached_type(&self, fingerprint: &Fingerprint) -> CacheType {
        if self.memory.is_cached(fingerprint) {
            return CacheType::Memory;
        }
        if self.disk.is_cached(&fingerprint.flat(), None) {
            return CacheType::Disk;
        }
        CacheType::None
    }

    pub fn is_cached(&self, fingerprint: &Fingerprint) -> bool {
        self.cached_type(fingerprint) != CacheType::None
    }

    /// Two-tier lookup. A memory hit short-circuits; a disk hit
    /// deserialises, back-fills memory, and reports `CacheType::Disk`.
    pub async fn retrieve(
        &self,
        fingerprint: &Fingerprint,
        serializer: &Arc<dyn CacheSerializer>,
        decode: &DecodeOptions,
        options: &CacheReadOptions,
    ) -> Result<Option<(Arc<DecodedImage>, CacheType)>, Error> {
        if let Some(image) = self.memory.value(fingerprint, options.memory_extending) {
            debug!("Memory hit for {fingerprint}");
            return Ok(Some((image, CacheType::Memory)));
        }
        if options.memory_only {
            return Ok(None);
        }

        let key = fingerprint.flat();
        let data = if options.load_disk_synchronously {
            self.disk.value_sync(&key, options.disk_extending)?
        } else {
            self.disk.value(&key, options.disk_extending).await?
        };
        let Some(data) = data else {
            return Ok(None);
        };
        debug!("Disk hit for {fingerprint}");
        let image = Arc::new(
            serializer
                .image(&data, decode)
                .err_tip(|| format!("While deserialising disk entry for {fingerprint}"))?,
        );
        self.memory
            .store(fingerprint.clone(), image.clone(), None, options.memory_expiration);
        Ok(Some((image, CacheType::Disk)))
    }

    /// Two-tier store: memory synchronously, disk per the write policy
    /// (awaited or fire-and-forget).
    pub async fn store(
        self: &Arc<Self>,
        fingerprint: &Fingerprint,
        image: Arc<DecodedImage>,
        data: Bytes,
        options: &CacheWriteOptions,
    ) -> Result<(), Error> {
        self.memory
            .store(fingerprint.clone(), image, None, options.memory_expiration);
        if options.memory_only {
            return Ok(());
        }
        let key = fingerprint.flat();
        if options.wait_for_disk {
            return self
                .disk
                .store(&key, &data, options.disk_expiration, &options.disk_write_options)
                .await;
        }
        let cache = self.clone();
        let disk_expiration = options.disk_expiration;
        let write_options = options.disk_write_options;
        tokio::spawn(async move {
            if let Err(e) = cache
                .disk
                .store(&key, &data, disk_expiration, &write_options)
                .await
            {
                warn!("Background disk write for {key} failed: {e}");
            }
        });
        Ok(())
    }

    /// Removes `fingerprint` from both tiers.
    pub async fn remove(&self, fingerprint: &Fingerprint) -> Result<(), Error> {
        self.memory.remove(fingerprint);
        self.disk.remove(&fingerprint.flat()).await
    }

    /// Clears both tiers.
    pub async fn remove_all(&self) -> Result<(), Error> {
        self.memory.remove_all();
        self.disk.remove_all(false).await
    }
}
