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

use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use pixfetch_config::{DiskCacheConfig, DownloaderConfig, MemoryCacheConfig};
use pixfetch_error::{make_err, Code, Error, ResultExt};
use pixfetch_util::common::Fingerprint;
use pixfetch_util::retrier::{ExponentialBackoff, Retrier, RetryResult};
use rand::Rng;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::decoded_image::DecodedImage;
use crate::downloader::{DownloadOptions, DownloadOutput, Downloader};
use crate::image_cache::{CacheReadOptions, CacheType, CacheWriteOptions, ImageCache};
use crate::options::RetrieveOptions;
use crate::processor::{ProcessItem, ProcessorContext};
use crate::source::Source;

/// A successfully retrieved image and where it came from.
#[derive(Clone, Debug)]
pub struct RetrieveResult {
    pub image: Arc<DecodedImage>,
    pub cache_type: CacheType,
    pub source: Source,
}

/// A terminally failed retrieval. When the options configured an
/// on-failure image it rides along as the result surface; the error is
/// still the authoritative outcome.
#[derive(Clone)]
pub struct RetrieveError {
    pub error: Error,
    pub failure_image: Option<Arc<DecodedImage>>,
}

impl From<Error> for RetrieveError {
    fn from(error: Error) -> Self {
        RetrieveError {
            error,
            failure_image: None,
        }
    }
}

impl std::fmt::Debug for RetrieveError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("RetrieveError")
            .field("error", &self.error)
            .field("has_failure_image", &self.failure_image.is_some())
            .finish()
    }
}

impl std::fmt::Display for RetrieveError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl std::error::Error for RetrieveError {}

/// A spawned, cancellable retrieval.
pub struct RetrieveTask {
    cancel_token: CancellationToken,
    receiver: oneshot::Receiver<Result<RetrieveResult, RetrieveError>>,
    _task: pixfetch_util::common::JoinHandleDropGuard<()>,
}

impl RetrieveTask {
    /// Cancels the retrieval; the outcome resolves with `TaskCancelled`.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub async fn outcome(self) -> Result<RetrieveResult, RetrieveError> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(RetrieveError::from(make_err!(
                Code::TaskCancelled,
                "Retrieve task went away before completing"
            ))),
        }
    }
}

/// Resolves sources through the cache tiers and the download coalescer,
/// routing decoded bytes through processors and serializers and writing
/// variants back per the options.
pub struct ImageRetriever {
    cache: Arc<ImageCache>,
    downloader: Arc<Downloader>,
}

static DEFAULT_INSTANCE: OnceLock<Arc<ImageRetriever>> = OnceLock::new();

impl ImageRetriever {
    pub fn new(cache: Arc<ImageCache>, downloader: Arc<Downloader>) -> Arc<Self> {
        Arc::new(ImageRetriever { cache, downloader })
    }

    /// The process-wide default engine, built lazily on first use. Purely
    /// a convenience; independent instances are equal citizens.
    pub fn default_instance() -> Result<Arc<ImageRetriever>, Error> {
        if let Some(instance) = DEFAULT_INSTANCE.get() {
            return Ok(instance.clone());
        }
        let cache = ImageCache::new(
            &MemoryCacheConfig::default(),
            DiskCacheConfig::new("pixfetch-default"),
        )?;
        let downloader = Arc::new(Downloader::new(DownloaderConfig::default())?);
        let instance = ImageRetriever::new(cache, downloader);
        Ok(DEFAULT_INSTANCE.get_or_init(|| instance).clone())
    }

    pub fn cache(&self) -> &Arc<ImageCache> {
        &self.cache
    }

    pub fn downloader(&self) -> &Arc<Downloader> {
        &self.downloader
    }

    /// Resolves `source` per the options: memory, then disk, then the
    /// original-variant disk entry, then the network — writing results
    /// back to the stores on the way out.
    pub async fn retrieve(
        &self,
        source: &Source,
        options: &RetrieveOptions,
    ) -> Result<RetrieveResult, RetrieveError> {
        self.retrieve_inner(source, options)
            .await
            .map_err(|error| RetrieveError {
                failure_image: options.on_failure_image.clone(),
                error,
            })
    }

    /// Spawns the retrieval and returns a cancellable task. The completion
    /// is driven on `options.callback_runtime` when set, else on the
    /// current runtime.
    pub fn retrieve_task(self: &Arc<Self>, source: Source, options: RetrieveOptions) -> RetrieveTask {
        let (sender, receiver) = oneshot::channel();
        let cancel_token = CancellationToken::new();
        let runtime = options
            .callback_runtime
            .clone()
            .unwrap_or_else(tokio::runtime::Handle::current);

        let retriever = self.clone();
        let token = cancel_token.clone();
        let task = runtime.spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => Err(RetrieveError {
                    failure_image: options.on_failure_image.clone(),
                    error: make_err!(Code::TaskCancelled, "Retrieve task was cancelled"),
                }),
                result = retriever.retrieve(&source, &options) => result,
            };
            let _ = sender.send(result);
        });
        RetrieveTask {
            cancel_token,
            receiver,
            _task: pixfetch_util::common::JoinHandleDropGuard::new(task),
        }
    }

    async fn retrieve_inner(
        &self,
        source: &Source,
        options: &RetrieveOptions,
    ) -> Result<RetrieveResult, Error> {
        let cache = options
            .target_cache
            .clone()
            .unwrap_or_else(|| self.cache.clone());
        let original_cache = options.original_cache.clone().unwrap_or_else(|| cache.clone());

        let cache_key = source.cache_key()?;
        let fingerprint = Fingerprint::new(cache_key, options.processor.identifier())?;

        if !options.force_refresh {
            let read_options = CacheReadOptions {
                memory_only: options.from_memory_cache_or_refresh,
                load_disk_synchronously: options.load_disk_synchronously,
                memory_extending: options.memory_cache_access_extending,
                disk_extending: options.disk_cache_access_extending,
                memory_expiration: options.memory_cache_expiration,
            };
            if let Some((image, cache_type)) = cache
                .retrieve(&fingerprint, &options.serializer, &options.decode, &read_options)
                .await?
            {
                return Ok(self.deliver(image, cache_type, source, options));
            }

            // The variant is not cached, but the original bytes might be:
            // re-apply the processor in-process instead of re-downloading.
            if !fingerprint.is_original() && !options.from_memory_cache_or_refresh {
                if let Some((original, original_cache_type)) = original_cache
                    .retrieve(
                        &fingerprint.to_original(),
                        &options.serializer,
                        &options.decode,
                        &read_options,
                    )
                    .await?
                {
                    debug!("Reprocessing cached original for {fingerprint}");
                    let processed = self
                        .apply_processor(ProcessorInput::Image(original), options, &fingerprint)
                        .await?;
                    let data = options
                        .serializer
                        .data(&processed, None)
                        .err_tip(|| "While serializing reprocessed variant")?;
                    cache
                        .store(&fingerprint, processed.clone(), data, &write_options(options))
                        .await?;
                    return Ok(self.deliver(processed, original_cache_type, source, options));
                }
            }
        }

        if options.only_from_cache {
            return Err(make_err!(
                Code::NotCached,
                "No cached entry for {fingerprint} and only-from-cache is set"
            ));
        }

        self.download_and_cache(source, &fingerprint, &cache, &original_cache, options)
            .await
    }

    /// Steps 7–9: resolve over the transport with retry, fall over to
    /// alternative sources on eligible failures, process, store, deliver.
    async fn download_and_cache(
        &self,
        source: &Source,
        fingerprint: &Fingerprint,
        cache: &Arc<ImageCache>,
        original_cache: &Arc<ImageCache>,
        options: &RetrieveOptions,
    ) -> Result<RetrieveResult, Error> {
        let downloader = options
            .downloader
            .clone()
            .unwrap_or_else(|| self.downloader.clone());

        let mut current = source.clone();
        let mut alternatives = options.alternative_sources.clone().into_iter();
        let mut tried_low_data = false;
        let mut had_alternatives = false;
        let mut last_error: Option<Error> = None;

        loop {
            let attempt = async {
                let output = self.resolve_source(&current, &downloader, options).await?;
                self.process_and_store(output, &current, fingerprint, cache, original_cache, options)
                    .await
            }
            .await;

            let error = match attempt {
                Ok(result) => return Ok(result),
                Err(error) => error,
            };

            if error.code == Code::ConstrainedNetwork && !tried_low_data {
                if let Some(low_data_source) = &options.low_data_source {
                    tried_low_data = true;
                    debug!("Falling back to the low-data source for {fingerprint}");
                    current = low_data_source.clone();
                    last_error = Some(error);
                    continue;
                }
            }

            let eligible = error.code.is_retriable()
                || matches!(
                    error.code,
                    Code::DecodeFailed | Code::ProcessingFailed | Code::DataModifyingFailed
                );
            if eligible {
                if let Some(next) = alternatives.next() {
                    had_alternatives = true;
                    debug!("Source failed ({}); trying alternative", error);
                    current = next;
                    last_error = Some(error);
                    continue;
                }
            }

            if had_alternatives || tried_low_data {
                let exhausted = make_err!(
                    Code::AlternativeSourcesExhausted,
                    "Every configured source failed for {fingerprint}"
                );
                return Err(match last_error {
                    Some(previous) => exhausted.merge(previous).merge(error),
                    None => exhausted.merge(error),
                });
            }
            return Err(error);
        }
    }

    /// One source resolution: a coalesced (and optionally retried) network
    /// fetch, or a provider read decoded once.
    async fn resolve_source(
        &self,
        source: &Source,
        downloader: &Arc<Downloader>,
        options: &RetrieveOptions,
    ) -> Result<DownloadOutput, Error> {
        match source {
            Source::Network(url_source) => {
                self.fetch_url(&url_source.url, downloader, options).await
            }
            Source::Provider(provider) => {
                let data = provider
                    .data()
                    .await
                    .err_tip(|| format!("While reading provider source {}", provider.cache_key()))?;
                let image = Arc::new(DecodedImage::decode(&data, &options.decode)?);
                Ok(DownloadOutput {
                    url: provider.cache_key().to_string(),
                    data,
                    image,
                })
            }
        }
    }

    async fn fetch_url(
        &self,
        url: &str,
        downloader: &Arc<Downloader>,
        options: &RetrieveOptions,
    ) -> Result<DownloadOutput, Error> {
        let download_options = DownloadOptions {
            request_modifier: options.request_modifier.clone(),
            async_request_modifier: options.async_request_modifier.clone(),
            redirect_handler: options.redirect_handler.clone(),
            response_gate: options.response_gate.clone(),
            data_modifier: options.data_modifier.clone(),
            priority: options.download_priority,
            timeout: options.download_timeout,
            decode: options.decode.clone(),
            progress: options.progress.clone(),
        };

        let Some(retry) = &options.retry_strategy else {
            return downloader.download(url, download_options).output().await;
        };

        let jitter_amt = retry.jitter;
        let backoff = ExponentialBackoff::new(Duration::from_secs_f32(retry.delay.max(0.001)))
            .map(move |delay: Duration| {
                if jitter_amt <= 0.0 {
                    return delay;
                }
                let min = 1.0 - (jitter_amt / 2.0);
                let max = 1.0 + (jitter_amt / 2.0);
                delay.mul_f32(rand::thread_rng().gen_range(min..max))
            })
            .take(retry.max_retries);

        let retrier = Retrier::default_sleep();
        let attempts = Box::pin(futures::stream::unfold((), move |state| {
            let downloader = downloader.clone();
            let download_options = download_options.clone();
            let url = url.to_string();
            async move {
                let result = downloader.download(&url, download_options).output().await;
                let retry_result = match result {
                    Ok(output) => RetryResult::Ok(output),
                    Err(e) if e.code.is_retriable() => RetryResult::Retry(e),
                    Err(e) => RetryResult::Err(e),
                };
                Some((retry_result, state))
            }
        }));
        Pin::new(&retrier).retry(backoff, attempts).await
    }

    /// Per-awaiter processing of a session output, then write-back of the
    /// variant (and optionally the original) per the cache policy.
    async fn process_and_store(
        &self,
        output: DownloadOutput,
        source: &Source,
        fingerprint: &Fingerprint,
        cache: &Arc<ImageCache>,
        original_cache: &Arc<ImageCache>,
        options: &RetrieveOptions,
    ) -> Result<RetrieveResult, Error> {
        let processed = if fingerprint.is_original() {
            output.image.clone()
        } else {
            self.apply_processor(ProcessorInput::Data(output.data.clone()), options, fingerprint)
                .await?
        };

        if options.cache_original_image && !fingerprint.is_original() {
            original_cache
                .store(
                    &fingerprint.to_original(),
                    output.image.clone(),
                    output.data.clone(),
                    &write_options(options),
                )
                .await?;
        }

        let original_data = fingerprint.is_original().then_some(&output.data);
        let disk_data = options
            .serializer
            .data(&processed, original_data)
            .err_tip(|| format!("While serializing {fingerprint} for disk"))?;
        cache
            .store(fingerprint, processed.clone(), disk_data, &write_options(options))
            .await?;

        Ok(self.deliver(processed, CacheType::None, source, options))
    }

    async fn apply_processor(
        &self,
        input: ProcessorInput,
        options: &RetrieveOptions,
        fingerprint: &Fingerprint,
    ) -> Result<Arc<DecodedImage>, Error> {
        let processor = options.processor.clone();
        let context = ProcessorContext {
            decode: options.decode.clone(),
        };
        let apply = move || match &input {
            ProcessorInput::Data(data) => processor.process(ProcessItem::Data(data), &context),
            ProcessorInput::Image(image) => {
                processor.process(ProcessItem::Image(image.as_ref()), &context)
            }
        };
        let processed = if options.background_decode {
            tokio::task::spawn_blocking(apply)
                .await
                .map_err(|e| make_err!(Code::Internal, "Processor task failed to join: {e}"))?
        } else {
            apply()
        };
        processed
            .map(Arc::new)
            .ok_or_else(|| {
                make_err!(
                    Code::ProcessingFailed,
                    "Processor {} failed for {}",
                    options.processor.identifier(),
                    fingerprint.cache_key()
                )
            })
    }

    fn deliver(
        &self,
        image: Arc<DecodedImage>,
        cache_type: CacheType,
        source: &Source,
        options: &RetrieveOptions,
    ) -> RetrieveResult {
        // The modifier decorates what the caller sees; caches hold the
        // undecorated variant.
        let image = match &options.image_modifier {
            Some(modifier) => modifier.modify(image),
            None => image,
        };
        RetrieveResult {
            image,
            cache_type,
            source: source.clone(),
        }
    }
}

enum ProcessorInput {
    Data(bytes::Bytes),
    Image(Arc<DecodedImage>),
}

fn write_options(options: &RetrieveOptions) -> CacheWriteOptions {
    CacheWriteOptions {
        memory_expiration: options.memory_cache_expiration,
        disk_expiration: options.disk_cache_expiration,
        memory_only: options.cache_memory_only,
        wait_for_disk: options.wait_for_cache,
        disk_write_options: options.disk_store_write_options,
    }
}
