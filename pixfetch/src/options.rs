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
use std::time::Duration;

use pixfetch_config::Retry;
use pixfetch_util::expiration::{Expiration, ExpirationExtending};

use crate::decoded_image::{DecodeOptions, DecodedImage};
use crate::disk_store::DiskWriteOptions;
use crate::downloader::Downloader;
use crate::image_cache::ImageCache;
use crate::processor::{DefaultProcessor, ImageProcessor};
use crate::serializer::{CacheSerializer, FormatSerializer};
use crate::source::Source;
use crate::transport::{
    AsyncRequestModifier, DataModifier, DownloadPriority, ProgressSink, RedirectHandler,
    RequestModifier, ResponseGate,
};

/// Decorates an image right before delivery. The result is what the caller
/// sees; caches keep the undecorated variant.
pub trait ImageModifier: Send + Sync {
    fn modify(&self, image: Arc<DecodedImage>) -> Arc<DecodedImage>;
}

/// How a binding layer should animate a freshly downloaded image into its
/// target. Purely advisory for UI layers; the engine carries it through
/// untouched.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum Transition {
    #[default]
    None,
    Fade(Duration),
    FlipFromLeft(Duration),
    FlipFromRight(Duration),
    FlipFromTop(Duration),
    FlipFromBottom(Duration),
}

/// The enumerated decision surface of a retrieval. Every knob defaults to
/// the conventional behavior: full two-tier caching, identity processing,
/// stock serializer, no modifiers.
#[derive(Clone)]
pub struct RetrieveOptions {
    /// Route cache operations to this cache instead of the retriever's.
    pub target_cache: Option<Arc<ImageCache>>,
    /// Secondary cache for original bytes when a non-identity processor is
    /// in play.
    pub original_cache: Option<Arc<ImageCache>>,
    /// Override the retriever's downloader.
    pub downloader: Option<Arc<Downloader>>,

    /// Skip memory and disk lookup and always refetch.
    pub force_refresh: bool,
    /// On a memory miss, go straight to download instead of trying disk.
    pub from_memory_cache_or_refresh: bool,
    /// Never write the disk tier.
    pub cache_memory_only: bool,
    /// Deliver only after cache writes resolve.
    pub wait_for_cache: bool,
    /// Never hit the transport; a cache miss is a `NotCached` failure.
    pub only_from_cache: bool,
    /// Deserialize disk entries on a worker thread.
    pub background_decode: bool,
    /// Read disk content on the caller's thread.
    pub load_disk_synchronously: bool,
    /// Runtime that completion callbacks of spawned retrieve tasks are
    /// delivered on. Defaults to the runtime the task was spawned from.
    pub callback_runtime: Option<tokio::runtime::Handle>,

    pub processor: Arc<dyn ImageProcessor>,
    pub serializer: Arc<dyn CacheSerializer>,
    pub image_modifier: Option<Arc<dyn ImageModifier>>,

    /// Decoder parameters (scale factor, frame policy).
    pub decode: DecodeOptions,

    pub request_modifier: Option<Arc<dyn RequestModifier>>,
    pub async_request_modifier: Option<Arc<dyn AsyncRequestModifier>>,
    pub redirect_handler: Option<Arc<dyn RedirectHandler>>,
    pub response_gate: Option<Arc<dyn ResponseGate>>,
    pub data_modifier: Option<Arc<dyn DataModifier>>,
    pub retry_strategy: Option<Retry>,
    pub download_priority: DownloadPriority,
    pub download_timeout: Option<Duration>,
    pub progress: Option<ProgressSink>,

    /// Also cache the original (unprocessed) image when a non-identity
    /// processor produced the delivered variant.
    pub cache_original_image: bool,
    pub memory_cache_expiration: Option<Expiration>,
    pub disk_cache_expiration: Option<Expiration>,
    pub memory_cache_access_extending: ExpirationExtending,
    pub disk_cache_access_extending: ExpirationExtending,
    pub disk_store_write_options: DiskWriteOptions,

    /// Fallbacks attempted in order when the primary source fails with a
    /// transport-class error.
    pub alternative_sources: Vec<Source>,
    /// Fallback attempted when a fetch fails because the network is in
    /// low-data (constrained) mode.
    pub low_data_source: Option<Source>,

    /// Delivered as the result surface when retrieval terminally fails;
    /// the completion still carries the error.
    pub on_failure_image: Option<Arc<DecodedImage>>,
    /// UI-layer hint: keep showing the current image while this retrieval
    /// is in flight. Recorded for binding layers; the engine itself has no
    /// view to keep.
    pub keep_current_image_while_loading: bool,
    /// UI-layer hint: shown by binding layers until the retrieval
    /// resolves.
    pub placeholder: Option<Arc<DecodedImage>>,
    /// UI-layer hint: how to animate a fresh result in.
    pub transition: Transition,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        RetrieveOptions {
            target_cache: None,
            original_cache: None,
            downloader: None,
            force_refresh: false,
            from_memory_cache_or_refresh: false,
            cache_memory_only: false,
            wait_for_cache: false,
            only_from_cache: false,
            background_decode: false,
            load_disk_synchronously: false,
            callback_runtime: None,
            processor: Arc::new(DefaultProcessor),
            serializer: Arc::new(FormatSerializer::new()),
            image_modifier: None,
            decode: DecodeOptions::default(),
            request_modifier: None,
            async_request_modifier: None,
            redirect_handler: None,
            response_gate: None,
            data_modifier: None,
            retry_strategy: None,
            download_priority: DownloadPriority::default(),
            download_timeout: None,
            progress: None,
            cache_original_image: false,
            memory_cache_expiration: None,
            disk_cache_expiration: None,
            memory_cache_access_extending: ExpirationExtending::default(),
            disk_cache_access_extending: ExpirationExtending::default(),
            disk_store_write_options: DiskWriteOptions::default(),
            alternative_sources: Vec::new(),
            low_data_source: None,
            on_failure_image: None,
            keep_current_image_while_loading: false,
            placeholder: None,
            transition: Transition::None,
        }
    }
}

impl RetrieveOptions {
    pub fn with_processor(mut self, processor: Arc<dyn ImageProcessor>) -> Self {
        self.processor = processor;
        self
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn CacheSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    pub fn with_only_from_cache(mut self) -> Self {
        self.only_from_cache = true;
        self
    }

    pub fn with_cache_memory_only(mut self) -> Self {
        self.cache_memory_only = true;
        self
    }

    pub fn with_wait_for_cache(mut self) -> Self {
        self.wait_for_cache = true;
        self
    }

    pub fn with_cache_original_image(mut self) -> Self {
        self.cache_original_image = true;
        self
    }

    pub fn with_scale_factor(mut self, scale_factor: f32) -> Self {
        self.decode.scale_factor = scale_factor;
        self
    }

    pub fn with_retry_strategy(mut self, retry: Retry) -> Self {
        self.retry_strategy = Some(retry);
        self
    }

    pub fn with_alternative_sources(mut self, sources: Vec<Source>) -> Self {
        self.alternative_sources = sources;
        self
    }

    pub fn with_memory_cache_expiration(mut self, expiration: Expiration) -> Self {
        self.memory_cache_expiration = Some(expiration);
        self
    }

    pub fn with_disk_cache_expiration(mut self, expiration: Expiration) -> Self {
        self.disk_cache_expiration = Some(expiration);
        self
    }
}
