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

use serde::{Deserialize, Serialize};

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// How long a cache entry stays valid, measured from the moment it was
/// stored (or last access-extended).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expiration {
    /// The entry never expires.
    Never,
    /// The entry expires this many seconds after storage.
    Seconds(u64),
    /// The entry expires this many days after storage.
    Days(u64),
    /// The entry expires at an absolute point in time.
    Date(SystemTime),
    /// The entry is already expired. Storing with this value effectively
    /// disables caching for the write.
    Expired,
}

impl Expiration {
    /// The deadline an entry stored at `from` carries. `None` means it
    /// never expires.
    pub fn estimated_expiration(&self, from: SystemTime) -> Option<SystemTime> {
        match self {
            Expiration::Never => None,
            Expiration::Seconds(secs) => Some(from + Duration::from_secs(*secs)),
            Expiration::Days(days) => {
                Some(from + Duration::from_secs(SECONDS_PER_DAY.saturating_mul(*days)))
            }
            Expiration::Date(date) => Some(*date),
            Expiration::Expired => Some(from),
        }
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, Expiration::Expired)
    }
}

/// Whether reading an entry refreshes its deadline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpirationExtending {
    /// Reads leave the deadline untouched.
    None,
    /// Reads re-arm the deadline with the entry's own expiration, measured
    /// from the access time.
    #[default]
    CacheTime,
    /// Reads set the deadline to this expiration, measured from the access
    /// time.
    Expiration(Expiration),
}

impl ExpirationExtending {
    /// The new deadline for an entry stored with `original` and read at
    /// `accessed_at`, or `None` when the read must not change it.
    pub fn extended_deadline(
        &self,
        original: &Expiration,
        accessed_at: SystemTime,
    ) -> Option<Option<SystemTime>> {
        match self {
            ExpirationExtending::None => None,
            ExpirationExtending::CacheTime => Some(original.estimated_expiration(accessed_at)),
            ExpirationExtending::Expiration(expiration) => {
                Some(expiration.estimated_expiration(accessed_at))
            }
        }
    }
}
