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

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use image::{DynamicImage, ImageFormat};
use pixfetch::decoded_image::DecodedImage;
use pixfetch::downloader::Downloader;
use pixfetch::image_cache::{CacheType, ImageCache};
use pixfetch::options::{ImageModifier, RetrieveOptions};
use pixfetch::processor::{BlurProcessor, ImageProcessor, RoundCornerProcessor};
use pixfetch::retriever::ImageRetriever;
use pixfetch::source::{ImageDataProvider, Source};
use pixfetch::transport::{DownloadRequest, Transport, TransportContext, TransportResponse};
use pixfetch_config::{DiskCacheConfig, DownloaderConfig, MemoryCacheConfig};
use pixfetch_error::{make_err, Code, Error};
use pixfetch_util::common::Fingerprint;
use pixfetch_util::expiration::Expiration;

fn png_bytes(width: u32, height: u32) -> Bytes {
    DecodedImage::from_dynamic(DynamicImage::new_rgba8(width, height), 1.0)
        .encode(ImageFormat::Png)
        .unwrap()
}

/// Url → (status, body) lookup table counting fetches.
struct ScriptedTransport {
    responses: Mutex<HashMap<String, (u16, Bytes)>>,
    fetches: AtomicUsize,
}

impl ScriptedTransport {
    fn new(entries: Vec<(&str, u16, Bytes)>) -> Arc<Self> {
        let mut responses = HashMap::new();
        for (url, status, data) in entries {
            responses.insert(url.to_string(), (status, data));
        }
        Arc::new(ScriptedTransport {
            responses: Mutex::new(responses),
            fetches: AtomicUsize::new(0),
        })
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn fetch(
        &self,
        request: DownloadRequest,
        _context: TransportContext,
    ) -> Result<TransportResponse, Error> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let responses = self.responses.lock().unwrap();
        let (status, data) = responses
            .get(&request.url)
            .ok_or_else(|| make_err!(Code::TransportError, "Unscripted url {}", request.url))?;
        Ok(TransportResponse {
            status: *status,
            data: data.clone(),
        })
    }
}

fn engine(
    temp: &tempfile::TempDir,
    transport: Arc<ScriptedTransport>,
) -> (Arc<ImageRetriever>, Arc<ImageCache>) {
    let cache = ImageCache::new(
        &MemoryCacheConfig::default(),
        DiskCacheConfig {
            directory: Some(temp.path().to_path_buf()),
            ..DiskCacheConfig::new("retriever-test")
        },
    )
    .unwrap();
    let downloader = Arc::new(Downloader::new_with_transport(
        DownloaderConfig::default(),
        transport,
    ));
    (ImageRetriever::new(cache.clone(), downloader), cache)
}

fn waiting_options() -> RetrieveOptions {
    RetrieveOptions::default().with_wait_for_cache()
}

#[cfg(test)]
mod retriever_tests {
    use super::*;
    use pretty_assertions::assert_eq; // Must be declared in every module.

    const URL: &str = "https://example.com/photo.png";

    #[tokio::test]
    async fn fresh_download_then_memory_hit() {
        let temp = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(vec![(URL, 200, png_bytes(4, 4))]);
        let (retriever, _cache) = engine(&temp, transport.clone());
        let source = Source::network(URL);

        let first = retriever.retrieve(&source, &waiting_options()).await.unwrap();
        assert_eq!(first.cache_type, CacheType::None, "Expected a fresh download");
        assert_eq!(first.image.pixel_width(), 4);

        let second = retriever.retrieve(&source, &waiting_options()).await.unwrap();
        assert_eq!(second.cache_type, CacheType::Memory);
        assert_eq!(transport.fetches(), 1, "Expected the repeat to be served from cache");
    }

    #[tokio::test]
    async fn disk_hit_populates_memory() {
        let temp = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(vec![(URL, 200, png_bytes(4, 4))]);
        let (retriever, cache) = engine(&temp, transport.clone());
        let source = Source::network(URL);

        retriever.retrieve(&source, &waiting_options()).await.unwrap();
        // Drop the memory tier so the next read must fall through to disk.
        cache.memory_store().remove_all();

        let first = retriever.retrieve(&source, &waiting_options()).await.unwrap();
        assert_eq!(first.cache_type, CacheType::Disk);

        let second = retriever.retrieve(&source, &waiting_options()).await.unwrap();
        assert_eq!(
            second.cache_type,
            CacheType::Memory,
            "Expected the disk hit to have back-filled memory"
        );
        assert_eq!(transport.fetches(), 1);
    }

    #[tokio::test]
    async fn only_from_cache_surfaces_not_cached() {
        let temp = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(vec![(URL, 200, png_bytes(4, 4))]);
        let (retriever, _cache) = engine(&temp, transport.clone());

        let options = waiting_options().with_only_from_cache();
        let error = retriever
            .retrieve(&Source::network(URL), &options)
            .await
            .unwrap_err();

        assert_eq!(error.error.code, Code::NotCached);
        assert_eq!(transport.fetches(), 0, "only-from-cache must never hit the transport");
    }

    #[tokio::test]
    async fn force_refresh_skips_both_tiers() {
        let temp = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(vec![(URL, 200, png_bytes(4, 4))]);
        let (retriever, _cache) = engine(&temp, transport.clone());
        let source = Source::network(URL);

        retriever.retrieve(&source, &waiting_options()).await.unwrap();
        let refreshed = retriever
            .retrieve(&source, &waiting_options().with_force_refresh())
            .await
            .unwrap();

        assert_eq!(refreshed.cache_type, CacheType::None);
        assert_eq!(transport.fetches(), 2, "Expected force-refresh to re-download");
    }

    #[tokio::test]
    async fn memory_miss_with_memory_or_refresh_skips_disk() {
        let temp = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(vec![(URL, 200, png_bytes(4, 4))]);
        let (retriever, cache) = engine(&temp, transport.clone());
        let source = Source::network(URL);

        retriever.retrieve(&source, &waiting_options()).await.unwrap();
        cache.memory_store().remove_all();

        let mut options = waiting_options();
        options.from_memory_cache_or_refresh = true;
        let result = retriever.retrieve(&source, &options).await.unwrap();

        assert_eq!(result.cache_type, CacheType::None, "Disk must be skipped");
        assert_eq!(transport.fetches(), 2);
    }

    #[tokio::test]
    async fn processor_variants_cache_under_distinct_fingerprints() {
        let temp = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(vec![(URL, 200, png_bytes(16, 16))]);
        let (retriever, _cache) = engine(&temp, transport.clone());
        let source = Source::network(URL);

        let round = waiting_options().with_processor(Arc::new(RoundCornerProcessor::new(4.0)));
        retriever.retrieve(&source, &round).await.unwrap();

        // A different processor is a different variant: lookup misses.
        let blur = waiting_options()
            .with_processor(Arc::new(BlurProcessor::new(3.0)))
            .with_only_from_cache();
        let error = retriever.retrieve(&source, &blur).await.unwrap_err();
        assert_eq!(error.error.code, Code::NotCached);

        // An equal-parameter processor is the same variant: memory hit.
        let round_again = waiting_options()
            .with_processor(Arc::new(RoundCornerProcessor::new(4.0)))
            .with_only_from_cache();
        let hit = retriever.retrieve(&source, &round_again).await.unwrap();
        assert_eq!(hit.cache_type, CacheType::Memory);
        assert_eq!(transport.fetches(), 1);
    }

    #[tokio::test]
    async fn variant_miss_reprocesses_the_cached_original() {
        let temp = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(vec![(URL, 200, png_bytes(16, 16))]);
        let (retriever, cache) = engine(&temp, transport.clone());
        let source = Source::network(URL);

        let options = waiting_options()
            .with_processor(Arc::new(RoundCornerProcessor::new(4.0)))
            .with_cache_original_image();
        retriever.retrieve(&source, &options).await.unwrap();

        // The original bytes were cached under the identity fingerprint.
        let original = Fingerprint::original(URL).unwrap();
        assert_eq!(cache.is_cached(&original), true);

        // Drop the processed variant; the original must satisfy the next
        // lookup without touching the transport, even under only-from-cache.
        let variant = Fingerprint::new(
            URL,
            RoundCornerProcessor::new(4.0).identifier(),
        )
        .unwrap();
        cache.remove(&variant).await.unwrap();

        let result = retriever
            .retrieve(&source, &options.clone().with_only_from_cache())
            .await
            .unwrap();
        assert_eq!(
            result.cache_type,
            CacheType::Memory,
            "The cached original satisfied the lookup"
        );
        assert_eq!(transport.fetches(), 1, "Reprocessing must not re-download");
    }

    #[tokio::test]
    async fn alternative_source_recovers_a_failed_download() {
        let temp = tempfile::tempdir().unwrap();
        let alt_url = "https://backup.example.com/photo.png";
        let transport = ScriptedTransport::new(vec![
            (URL, 500, Bytes::new()),
            (alt_url, 200, png_bytes(4, 4)),
        ]);
        let (retriever, _cache) = engine(&temp, transport.clone());

        let options =
            waiting_options().with_alternative_sources(vec![Source::network(alt_url)]);
        let result = retriever
            .retrieve(&Source::network(URL), &options)
            .await
            .unwrap();

        assert_eq!(result.image.pixel_width(), 4);
        assert_eq!(transport.fetches(), 2);
    }

    #[tokio::test]
    async fn exhausted_alternatives_report_their_own_kind() {
        let temp = tempfile::tempdir().unwrap();
        let alt_url = "https://backup.example.com/photo.png";
        let transport = ScriptedTransport::new(vec![
            (URL, 500, Bytes::new()),
            (alt_url, 503, Bytes::new()),
        ]);
        let (retriever, _cache) = engine(&temp, transport.clone());

        let options =
            waiting_options().with_alternative_sources(vec![Source::network(alt_url)]);
        let error = retriever
            .retrieve(&Source::network(URL), &options)
            .await
            .unwrap_err();

        assert_eq!(error.error.code, Code::AlternativeSourcesExhausted);
        assert_eq!(transport.fetches(), 2);
    }

    #[tokio::test]
    async fn terminal_failure_without_alternatives_keeps_its_kind() {
        let temp = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(vec![(URL, 404, Bytes::new())]);
        let (retriever, _cache) = engine(&temp, transport);

        let failure_marker = Arc::new(DecodedImage::from_dynamic(
            DynamicImage::new_rgba8(1, 1),
            1.0,
        ));
        let mut options = waiting_options();
        options.on_failure_image = Some(failure_marker.clone());

        let error = retriever
            .retrieve(&Source::network(URL), &options)
            .await
            .unwrap_err();

        assert_eq!(error.error.code, Code::InvalidStatusCode);
        assert_eq!(
            error.failure_image.is_some(),
            true,
            "The on-failure image rides along with the error"
        );
    }

    #[tokio::test]
    async fn provider_sources_skip_the_transport() {
        struct StaticProvider {
            key: String,
            data: Bytes,
        }
        #[async_trait]
        impl ImageDataProvider for StaticProvider {
            fn cache_key(&self) -> &str {
                &self.key
            }
            async fn data(&self) -> Result<Bytes, Error> {
                Ok(self.data.clone())
            }
        }

        let temp = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(vec![]);
        let (retriever, _cache) = engine(&temp, transport.clone());
        let source = Source::Provider(Arc::new(StaticProvider {
            key: "asset://logo".to_string(),
            data: png_bytes(5, 5),
        }));

        let first = retriever.retrieve(&source, &waiting_options()).await.unwrap();
        assert_eq!(first.cache_type, CacheType::None);
        assert_eq!(first.image.pixel_width(), 5);

        let second = retriever.retrieve(&source, &waiting_options()).await.unwrap();
        assert_eq!(second.cache_type, CacheType::Memory);
        assert_eq!(transport.fetches(), 0);
    }

    #[tokio::test]
    async fn image_modifier_decorates_delivery_but_not_the_cache() {
        struct MarkerModifier;
        impl ImageModifier for MarkerModifier {
            fn modify(&self, _image: Arc<DecodedImage>) -> Arc<DecodedImage> {
                Arc::new(DecodedImage::from_dynamic(DynamicImage::new_rgba8(1, 1), 1.0))
            }
        }

        let temp = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(vec![(URL, 200, png_bytes(8, 8))]);
        let (retriever, cache) = engine(&temp, transport);
        let source = Source::network(URL);

        let mut options = waiting_options();
        options.image_modifier = Some(Arc::new(MarkerModifier));

        let delivered = retriever.retrieve(&source, &options).await.unwrap();
        assert_eq!(delivered.image.pixel_width(), 1, "Delivery is decorated");

        let cached = cache
            .memory_store()
            .value(
                &Fingerprint::original(URL).unwrap(),
                pixfetch_util::expiration::ExpirationExtending::None,
            )
            .unwrap();
        assert_eq!(cached.pixel_width(), 8, "The cache holds the undecorated image");
    }

    #[tokio::test]
    async fn expired_memory_expiration_disables_the_memory_tier() {
        let temp = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(vec![(URL, 200, png_bytes(4, 4))]);
        let (retriever, _cache) = engine(&temp, transport.clone());
        let source = Source::network(URL);

        let options = waiting_options()
            .with_cache_memory_only()
            .with_memory_cache_expiration(Expiration::Expired);
        retriever.retrieve(&source, &options).await.unwrap();
        let second = retriever.retrieve(&source, &options).await.unwrap();

        assert_eq!(second.cache_type, CacheType::None);
        assert_eq!(transport.fetches(), 2, "Nothing was cached, both reads download");
    }

    #[tokio::test]
    async fn retrieve_task_can_be_cancelled() {
        let temp = tempfile::tempdir().unwrap();
        // An unscripted URL makes the transport error; block instead by
        // scripting nothing and using a never-matching URL with retry...
        // Simpler: a blocked-forever transport via an empty script and a
        // slow provider is overkill — cancel before the task even runs.
        let transport = ScriptedTransport::new(vec![(URL, 200, png_bytes(4, 4))]);
        let (retriever, _cache) = engine(&temp, transport);

        let task = retriever.retrieve_task(Source::network(URL), waiting_options());
        task.cancel();
        let outcome = task.outcome().await;

        match outcome {
            Err(error) => assert_eq!(error.error.code, Code::TaskCancelled),
            Ok(result) => {
                // The select between cancel and work is racy by design; a
                // win by the work side must still be a valid result.
                assert_eq!(result.image.pixel_width(), 4);
            }
        }
    }

    #[tokio::test]
    async fn empty_url_is_an_empty_source() {
        let temp = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(vec![]);
        let (retriever, _cache) = engine(&temp, transport);

        let error = retriever
            .retrieve(&Source::network(""), &waiting_options())
            .await
            .unwrap_err();
        assert_eq!(error.error.code, Code::EmptySource);
    }
}
