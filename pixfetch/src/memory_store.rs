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

use pixfetch_config::MemoryCacheConfig;
use pixfetch_util::common::{Fingerprint, JoinHandleDropGuard};
use pixfetch_util::evicting_map::{EvictingMap, LenEntry};
use pixfetch_util::expiration::{Expiration, ExpirationExtending};
use pixfetch_util::instant_wrapper::{InstantWrapper, SystemClock};

use crate::decoded_image::DecodedImage;

#[derive(Clone, Debug)]
struct MemoryEntry {
    image: Arc<DecodedImage>,
    cost: u64,
}

impl LenEntry for MemoryEntry {
    fn len(&self) -> u64 {
        self.cost
    }
}

/// The fast tier: decoded images in memory, wait-free for callers.
///
/// All operations are synchronous and take only brief internal locks. A
/// background sweep drops expired entries every clean interval; it is
/// spawned when a tokio runtime is reachable at construction time and is
/// aborted when the store drops.
pub struct MemoryStore<I: InstantWrapper = SystemClock> {
    map: Arc<EvictingMap<MemoryEntry, I>>,
    default_expiration: Expiration,
    _sweep_task: Option<JoinHandleDropGuard<()>>,
}

impl MemoryStore<SystemClock> {
    pub fn new(config: &MemoryCacheConfig) -> Self {
        MemoryStore::new_with_clock(config, SystemClock)
    }
}

impl<I: InstantWrapper> MemoryStore<I> {
    pub fn new_with_clock(config: &MemoryCacheConfig, clock: I) -> Self {
        let map = Arc::new(EvictingMap::new(
            &config.eviction_policy.clone().unwrap_or_default(),
            clock,
        ));
        let sweep_task = tokio::runtime::Handle::try_current().ok().map(|handle| {
            let map = map.clone();
            let clean_interval = config.clean_interval();
            JoinHandleDropGuard::new(handle.spawn(async move {
                let mut interval = tokio::time::interval(clean_interval);
                // The first tick of a tokio interval fires immediately.
                interval.tick().await;
                loop {
                    interval.tick().await;
                    map.remove_expired();
                }
            }))
        });
        MemoryStore {
            map,
            default_expiration: if config.default_expiration_seconds == 0 {
                Expiration::Never
            } else {
                Expiration::Seconds(config.default_expiration_seconds)
            },
            _sweep_task: sweep_task,
        }
    }

    /// Inserts or replaces. `cost` defaults to the decoded pixel footprint.
    /// Eviction runs before this returns, so the store never exposes a
    /// state over its cost budget.
    pub fn store(
        &self,
        fingerprint: Fingerprint,
        image: Arc<DecodedImage>,
        cost: Option<u64>,
        expiration: Option<Expiration>,
    ) {
        let expiration = expiration.unwrap_or(self.default_expiration);
        if expiration.is_expired() {
            // Storing an already-expired entry is a remove.
            self.map.remove(&fingerprint);
            return;
        }
        let cost = cost.unwrap_or_else(|| image.cost());
        self.map.insert(fingerprint, MemoryEntry { image, cost }, expiration);
    }

    /// Returns the image if present and not expired. `extending` decides
    /// whether the read refreshes the entry's deadline.
    pub fn value(
        &self,
        fingerprint: &Fingerprint,
        extending: ExpirationExtending,
    ) -> Option<Arc<DecodedImage>> {
        self.map.get(fingerprint, extending).map(|entry| entry.image)
    }

    pub fn is_cached(&self, fingerprint: &Fingerprint) -> bool {
        self.map.contains_key(fingerprint)
    }

    pub fn remove(&self, fingerprint: &Fingerprint) -> bool {
        self.map.remove(fingerprint)
    }

    pub fn remove_all(&self) {
        self.map.remove_all();
    }

    /// Drops expired entries now, without waiting for the sweep. Returns
    /// the removed fingerprints.
    pub fn remove_expired(&self) -> Vec<Fingerprint> {
        self.map.remove_expired()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Cumulative cost of all live entries.
    pub fn total_cost(&self) -> u64 {
        self.map.sum_store_size()
    }
}
