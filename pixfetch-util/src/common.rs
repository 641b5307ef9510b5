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

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use pixfetch_error::{make_err, make_input_err, Code, Error};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

/// Identifier of the identity processor. A fingerprint carrying it addresses
/// the original (unprocessed) bytes of a source.
pub const DEFAULT_PROCESSOR_IDENTIFIER: &str = "";

/// The key under which a particular cached variant is addressed: the
/// caller-stable cache key of the source plus the identifier of the
/// processor that produced the variant.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    cache_key: String,
    processor: String,
}

impl Fingerprint {
    pub fn new(cache_key: impl Into<String>, processor: impl Into<String>) -> Result<Self, Error> {
        let cache_key = cache_key.into();
        if cache_key.is_empty() {
            return Err(make_err!(Code::InvalidKey, "Cache keys may not be empty"));
        }
        Ok(Fingerprint {
            cache_key,
            processor: processor.into(),
        })
    }

    /// Fingerprint of the original bytes of `cache_key` (identity
    /// processor).
    pub fn original(cache_key: impl Into<String>) -> Result<Self, Error> {
        Fingerprint::new(cache_key, DEFAULT_PROCESSOR_IDENTIFIER)
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    pub fn processor(&self) -> &str {
        &self.processor
    }

    pub fn is_original(&self) -> bool {
        self.processor == DEFAULT_PROCESSOR_IDENTIFIER
    }

    /// The same cache key addressed through the identity processor.
    pub fn to_original(&self) -> Fingerprint {
        Fingerprint {
            cache_key: self.cache_key.clone(),
            processor: DEFAULT_PROCESSOR_IDENTIFIER.to_string(),
        }
    }

    /// Stable single-string form. Original fingerprints collapse to the bare
    /// cache key so externally populated caches stay addressable.
    pub fn flat(&self) -> String {
        if self.is_original() {
            return self.cache_key.clone();
        }
        format!("{}@{}", self.cache_key, self.processor)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.flat())
    }
}

/// Holds a tokio `JoinHandle` and aborts the underlying task when dropped.
/// Used to tie background work (store sweeps, transport fetches) to the
/// lifetime of its owner.
pub struct JoinHandleDropGuard<T> {
    join_handle: JoinHandle<T>,
}

impl<T> JoinHandleDropGuard<T> {
    pub fn new(join_handle: JoinHandle<T>) -> Self {
        JoinHandleDropGuard { join_handle }
    }
}

impl<T> Future for JoinHandleDropGuard<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.join_handle)
            .poll(cx)
            .map(|result| result.map_err(|e| make_input_err!("Failed to join spawned task: {e}")))
    }
}

impl<T> Drop for JoinHandleDropGuard<T> {
    fn drop(&mut self) {
        self.join_handle.abort();
    }
}
