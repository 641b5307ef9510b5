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

//! Client-side image retrieval and caching engine.
//!
//! Given a logical image reference — a URL, a provider of raw bytes, or an
//! already-decoded image — the engine returns a decoded, optionally
//! post-processed image, serving repeat requests for the same logical
//! reference from a two-tier (memory + disk) cache and deduplicating
//! concurrent downloads of the same URL into a single fetch.

pub mod decoded_image;
pub mod disk_store;
pub mod downloader;
pub mod image_cache;
pub mod memory_store;
pub mod options;
pub mod prefetcher;
pub mod processor;
pub mod retriever;
pub mod serializer;
pub mod source;
pub mod transport;

pub use decoded_image::{DecodeOptions, DecodedImage};
pub use disk_store::{DiskStore, DiskWriteOptions};
pub use downloader::{DownloadHandle, DownloadOptions, DownloadOutput, Downloader};
pub use image_cache::{CacheReadOptions, CacheType, CacheWriteOptions, ImageCache};
pub use memory_store::MemoryStore;
pub use options::{ImageModifier, RetrieveOptions, Transition};
pub use prefetcher::{PrefetchStatus, Prefetcher};
pub use processor::{DefaultProcessor, ImageProcessor, ProcessItem, ProcessorContext};
pub use retriever::{ImageRetriever, RetrieveError, RetrieveResult, RetrieveTask};
pub use serializer::{CacheSerializer, FormatSerializer};
pub use source::{ImageDataProvider, Source, UrlSource};
pub use transport::{
    DownloadPriority, DownloadRequest, HttpTransport, Transport, TransportContext,
    TransportResponse,
};
