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
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use pixfetch_error::{make_err, Code, Error};

/// Supplies raw image bytes for a source that is not a network URL (a
/// bundled asset, a database blob, a generated image).
#[async_trait]
pub trait ImageDataProvider: Send + Sync {
    /// Caller-stable identifier the provided bytes are cached under.
    fn cache_key(&self) -> &str;

    async fn data(&self) -> Result<Bytes, Error>;
}

/// A network source, optionally carrying an explicit cache key. Without one
/// the absolute URL string is the key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UrlSource {
    pub url: String,
    pub cache_key: Option<String>,
}

impl UrlSource {
    pub fn new(url: impl Into<String>) -> Self {
        UrlSource {
            url: url.into(),
            cache_key: None,
        }
    }

    pub fn with_cache_key(url: impl Into<String>, cache_key: impl Into<String>) -> Self {
        UrlSource {
            url: url.into(),
            cache_key: Some(cache_key.into()),
        }
    }
}

/// A logical image reference the retriever can resolve.
#[derive(Clone)]
pub enum Source {
    Network(UrlSource),
    Provider(Arc<dyn ImageDataProvider>),
}


impl Source {
    pub fn network(url: impl Into<String>) -> Self {
        Source::Network(UrlSource::new(url))
    }

    /// The caller-stable cache key of this source.
    pub fn cache_key(&self) -> Result<String, Error> {
        match self {
            Source::Network(source) => {
                if source.url.is_empty() {
                    return Err(make_err!(Code::EmptySource, "Source URL is empty"));
                }
                Ok(source
                    .cache_key
                    .clone()
                    .unwrap_or_else(|| source.url.clone()))
            }
            Source::Provider(provider) => {
                let key = provider.cache_key();
                if key.is_empty() {
                    return Err(make_err!(Code::InvalidKey, "Provider cache key is empty"));
                }
                Ok(key.to_string())
            }
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            Source::Network(source) => Some(&source.url),
            Source::Provider(_) => None,
        }
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Source::Network(source) => f.debug_tuple("Network").field(&source.url).finish(),
            Source::Provider(provider) => {
                f.debug_tuple("Provider").field(&provider.cache_key()).finish()
            }
        }
    }
}
