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

use std::time::{Duration, SystemTime};

use lru::LruCache;
use parking_lot::Mutex;
use pixfetch_config::EvictionPolicy;
use tracing::info;

use crate::common::Fingerprint;
use crate::expiration::{Expiration, ExpirationExtending};
use crate::instant_wrapper::InstantWrapper;

/// Cost of the referenced data, in the unit the eviction policy budgets
/// (bytes by convention).
pub trait LenEntry {
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
struct EvictionItem<T: LenEntry> {
    data: T,
    /// Expiration policy the entry was stored with. Needed to re-arm the
    /// deadline on access-extending reads.
    expiration: Expiration,
    /// `None` means the entry never expires.
    deadline: Option<SystemTime>,
}

impl<T: LenEntry> EvictionItem<T> {
    fn is_expired(&self, now: SystemTime) -> bool {
        match self.deadline {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}

struct State<T: LenEntry> {
    lru: LruCache<Fingerprint, EvictionItem<T>>,
    sum_store_size: u64,
}

impl<T: LenEntry> State<T> {
    fn note_removed(&mut self, item: &EvictionItem<T>) {
        self.sum_store_size -= item.data.len();
    }
}

/// An LRU map bounded by cumulative entry cost, entry count, and per-entry
/// expiration. Mutations evict before returning, so the cost invariant holds
/// at every observable instant. All operations take a single internal lock;
/// nothing here suspends, keeping the memory tier wait-free for callers.
pub struct EvictingMap<T: LenEntry, I: InstantWrapper> {
    state: Mutex<State<T>>,
    clock: I,
    max_bytes: u64,
    evict_bytes: u64,
    max_seconds: u64,
    max_count: u64,
}

impl<T, I> EvictingMap<T, I>
where
    T: LenEntry + Clone,
    I: InstantWrapper,
{
    pub fn new(config: &EvictionPolicy, clock: I) -> Self {
        EvictingMap {
            // We use unbounded because the cost budget, not the entry count,
            // is the primary limit and `LruCache`'s own capacity would evict
            // behind our back.
            state: Mutex::new(State {
                lru: LruCache::unbounded(),
                sum_store_size: 0,
            }),
            clock,
            max_bytes: config.max_bytes,
            evict_bytes: config.evict_bytes,
            max_seconds: u64::from(config.max_seconds),
            max_count: config.max_count,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cumulative cost of all live entries.
    pub fn sum_store_size(&self) -> u64 {
        self.state.lock().sum_store_size
    }

    fn should_evict(
        &self,
        lru_len: usize,
        peek_entry: &EvictionItem<T>,
        sum_store_size: u64,
        max_bytes: u64,
        now: SystemTime,
    ) -> bool {
        let is_over_size = max_bytes != 0 && sum_store_size > max_bytes;
        let is_over_count = self.max_count != 0 && (lru_len as u64) > self.max_count;
        let old_item_exists = peek_entry.is_expired(now);
        is_over_size || is_over_count || old_item_exists
    }

    fn evict_items(&self, state: &mut State<T>) {
        let now = self.clock.now();
        let Some((_, mut peek_entry)) = state.lru.peek_lru() else {
            return;
        };

        let max_bytes = if self.max_bytes != 0
            && self.evict_bytes != 0
            && self.should_evict(
                state.lru.len(),
                peek_entry,
                state.sum_store_size,
                self.max_bytes,
                now,
            ) {
            self.max_bytes.saturating_sub(self.evict_bytes)
        } else {
            self.max_bytes
        };

        while self.should_evict(state.lru.len(), peek_entry, state.sum_store_size, max_bytes, now) {
            let (key, eviction_item) = state
                .lru
                .pop_lru()
                .expect("Tried to peek() then pop() but failed");
            info!("\x1b[0;31mEvicting Map\x1b[0m: Evicting {key}");
            state.note_removed(&eviction_item);

            peek_entry = if let Some((_, entry)) = state.lru.peek_lru() {
                entry
            } else {
                return;
            };
        }
    }

    fn deadline_for(&self, expiration: &Expiration, now: SystemTime) -> Option<SystemTime> {
        let deadline = expiration.estimated_expiration(now);
        if self.max_seconds == 0 {
            return deadline;
        }
        let age_cap = now + Duration::from_secs(self.max_seconds);
        match deadline {
            Some(deadline) => Some(deadline.min(age_cap)),
            None => Some(age_cap),
        }
    }

    /// Inserts or replaces. Returns the replaced data, if any.
    pub fn insert(&self, key: Fingerprint, data: T, expiration: Expiration) -> Option<T> {
        let now = self.clock.now();
        let new_item_size = data.len();
        let eviction_item = EvictionItem {
            data,
            deadline: self.deadline_for(&expiration, now),
            expiration,
        };

        let mut state = self.state.lock();
        let replaced = state.lru.put(key, eviction_item).map(|old_item| {
            state.note_removed(&old_item);
            old_item.data
        });
        state.sum_store_size += new_item_size;
        self.evict_items(&mut state);
        replaced
    }

    /// Returns the data if present and not expired. An expired entry is
    /// dropped and reported as absent. `extending` decides whether the read
    /// refreshes the entry's deadline.
    pub fn get(&self, key: &Fingerprint, extending: ExpirationExtending) -> Option<T> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.evict_items(&mut state);

        let expired = state.lru.get(key)?.is_expired(now);
        if expired {
            let (key, eviction_item) = state
                .lru
                .pop_entry(key)
                .expect("Entry observed under lock must still be present");
            info!("\x1b[0;31mEvicting Map\x1b[0m: Dropping expired {key}");
            state.note_removed(&eviction_item);
            return None;
        }
        let entry = state
            .lru
            .get_mut(key)
            .expect("Entry observed under lock must still be present");
        if let Some(new_deadline) = extending.extended_deadline(&entry.expiration, now) {
            entry.deadline = new_deadline;
        }
        Some(entry.data.clone())
    }

    /// Presence check without refreshing recency or deadlines.
    pub fn contains_key(&self, key: &Fingerprint) -> bool {
        let now = self.clock.now();
        let state = self.state.lock();
        match state.lru.peek(key) {
            Some(entry) => !entry.is_expired(now),
            None => false,
        }
    }

    pub fn remove(&self, key: &Fingerprint) -> bool {
        let mut state = self.state.lock();
        if let Some(entry) = state.lru.pop(key) {
            state.note_removed(&entry);
            return true;
        }
        false
    }

    pub fn remove_all(&self) {
        let mut state = self.state.lock();
        state.lru.clear();
        state.sum_store_size = 0;
    }

    /// Drops every entry whose deadline has passed. Returns the removed
    /// keys. This is the backing of the periodic store sweep.
    pub fn remove_expired(&self) -> Vec<Fingerprint> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let expired_keys: Vec<Fingerprint> = state
            .lru
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired_keys {
            if let Some(entry) = state.lru.pop(key) {
                state.note_removed(&entry);
            }
        }
        if !expired_keys.is_empty() {
            info!(
                "\x1b[0;31mEvicting Map\x1b[0m: Sweep removed {} expired entries",
                expired_keys.len()
            );
        }
        expired_keys
    }
}
