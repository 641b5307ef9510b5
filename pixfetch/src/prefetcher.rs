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

use futures::StreamExt;
use parking_lot::Mutex;
use pixfetch_config::PrefetcherConfig;
use pixfetch_error::Error;
use pixfetch_util::common::{Fingerprint, JoinHandleDropGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::options::RetrieveOptions;
use crate::retriever::ImageRetriever;
use crate::source::Source;

/// Running tallies of a prefetch batch. `completed + skipped + failed`
/// reaches `total` exactly once, when the batch terminates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrefetchStatus {
    pub total: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl PrefetchStatus {
    pub fn finished_count(&self) -> usize {
        self.completed + self.skipped + self.failed
    }
}

pub type PrefetchSink = Arc<dyn Fn(PrefetchStatus) + Send + Sync>;

struct PrefetcherInner {
    retriever: Arc<ImageRetriever>,
    sources: Vec<Source>,
    options: RetrieveOptions,
    max_concurrent: usize,
    cancel_token: CancellationToken,
    status: Mutex<PrefetchStatus>,
    progress_sink: Option<PrefetchSink>,
    completion_sink: Option<PrefetchSink>,
}

/// Drives the retriever over a source list with bounded concurrency,
/// classifying every terminated source as completed, skipped (cached
/// before this run), or failed.
pub struct Prefetcher {
    inner: Arc<PrefetcherInner>,
    driver: Mutex<Option<JoinHandleDropGuard<()>>>,
}

impl Prefetcher {
    pub fn new(
        sources: Vec<Source>,
        options: RetrieveOptions,
        retriever: Arc<ImageRetriever>,
        config: &PrefetcherConfig,
    ) -> Self {
        let total = sources.len();
        Prefetcher {
            inner: Arc::new(PrefetcherInner {
                retriever,
                sources,
                options,
                max_concurrent: config.max_concurrent_downloads(),
                cancel_token: CancellationToken::new(),
                status: Mutex::new(PrefetchStatus {
                    total,
                    ..PrefetchStatus::default()
                }),
                progress_sink: None,
                completion_sink: None,
            }),
            driver: Mutex::new(None),
        }
    }

    /// Progress fires once after each source terminates.
    pub fn with_progress(mut self, sink: PrefetchSink) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("sinks must be attached before start()")
            .progress_sink = Some(sink);
        self
    }

    /// Completion fires once, with the final tallies.
    pub fn with_completion(mut self, sink: PrefetchSink) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("sinks must be attached before start()")
            .completion_sink = Some(sink);
        self
    }

    /// Starts the batch in the background. Dropping the prefetcher aborts
    /// it; use [`Prefetcher::stop`] for a graceful cancel that still fires
    /// the completion sink.
    pub fn start(&self) {
        let mut driver = self.driver.lock();
        if driver.is_some() {
            return;
        }
        let inner = self.inner.clone();
        *driver = Some(JoinHandleDropGuard::new(tokio::spawn(async move {
            Self::drive(inner).await;
        })));
    }

    /// Runs the batch to completion and returns the final tallies.
    pub async fn run(&self) -> PrefetchStatus {
        Self::drive(self.inner.clone()).await
    }

    /// Marks the batch cancelled and cancels outstanding retrievals.
    /// Already-delivered results stay delivered.
    pub fn stop(&self) {
        self.inner.cancel_token.cancel();
    }

    pub fn status(&self) -> PrefetchStatus {
        *self.inner.status.lock()
    }

    async fn drive(inner: Arc<PrefetcherInner>) -> PrefetchStatus {
        let sources = inner.sources.clone();
        futures::stream::iter(sources)
            .for_each_concurrent(Some(inner.max_concurrent), |source| {
                let inner = inner.clone();
                async move {
                    let outcome = Self::prefetch_one(&inner, &source).await;
                    let status = {
                        let mut status = inner.status.lock();
                        match outcome {
                            PrefetchOutcome::Completed => status.completed += 1,
                            PrefetchOutcome::Skipped => status.skipped += 1,
                            PrefetchOutcome::Failed => status.failed += 1,
                        }
                        *status
                    };
                    if let Some(progress) = &inner.progress_sink {
                        progress(status);
                    }
                }
            })
            .await;

        let status = *inner.status.lock();
        if let Some(completion) = &inner.completion_sink {
            completion(status);
        }
        status
    }

    async fn prefetch_one(inner: &Arc<PrefetcherInner>, source: &Source) -> PrefetchOutcome {
        if inner.cancel_token.is_cancelled() {
            return PrefetchOutcome::Failed;
        }
        match Self::already_cached(inner, source) {
            Ok(true) => {
                debug!("Prefetch skipping already-cached {source:?}");
                return PrefetchOutcome::Skipped;
            }
            Ok(false) => {}
            Err(_) => return PrefetchOutcome::Failed,
        }

        let retrieval = inner.retriever.retrieve(source, &inner.options);
        tokio::select! {
            _ = inner.cancel_token.cancelled() => PrefetchOutcome::Failed,
            result = retrieval => match result {
                Ok(_) => PrefetchOutcome::Completed,
                Err(_) => PrefetchOutcome::Failed,
            },
        }
    }

    fn already_cached(inner: &Arc<PrefetcherInner>, source: &Source) -> Result<bool, Error> {
        let cache = inner
            .options
            .target_cache
            .clone()
            .unwrap_or_else(|| inner.retriever.cache().clone());
        let fingerprint = Fingerprint::new(
            source.cache_key()?,
            inner.options.processor.identifier(),
        )?;
        Ok(cache.is_cached(&fingerprint))
    }
}

enum PrefetchOutcome {
    Completed,
    Skipped,
    Failed,
}
