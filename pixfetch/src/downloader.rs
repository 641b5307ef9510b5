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
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use pixfetch_config::DownloaderConfig;
use pixfetch_error::{make_err, Code, Error};
use pixfetch_util::common::JoinHandleDropGuard;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::decoded_image::{DecodeOptions, DecodedImage};
use crate::transport::{
    AsyncRequestModifier, DataModifier, DownloadPriority, DownloadRequest, HttpTransport,
    ProgressSink, RedirectHandler, RequestModifier, ResponseGate, Transport, TransportContext,
};

/// What a completed session fans out to every awaiter: the (possibly
/// data-modified) bytes and the reference image decoded once from them.
#[derive(Clone, Debug)]
pub struct DownloadOutput {
    pub url: String,
    pub data: Bytes,
    pub image: Arc<DecodedImage>,
}

/// Per-enqueue knobs. Session-level hooks (modifiers, gate, redirect
/// handler, decode options) are captured from the options of the caller
/// that created the session; per-caller hooks (progress) apply to each
/// awaiter separately.
#[derive(Clone, Default)]
pub struct DownloadOptions {
    pub request_modifier: Option<Arc<dyn RequestModifier>>,
    pub async_request_modifier: Option<Arc<dyn AsyncRequestModifier>>,
    pub redirect_handler: Option<Arc<dyn RedirectHandler>>,
    pub response_gate: Option<Arc<dyn ResponseGate>>,
    pub data_modifier: Option<Arc<dyn DataModifier>>,
    pub priority: DownloadPriority,
    pub timeout: Option<Duration>,
    pub decode: DecodeOptions,
    pub progress: Option<ProgressSink>,
}

struct SessionCallback {
    id: Uuid,
    progress: Option<ProgressSink>,
    completion: oneshot::Sender<Result<DownloadOutput, Error>>,
}

struct SessionState {
    callbacks: Vec<SessionCallback>,
    /// Set exactly once: by completion fan-out, by the last cancellation,
    /// or by a session sweep. Whoever flips it owns delivery (I6/I7).
    finished: bool,
    _task: Option<JoinHandleDropGuard<()>>,
}

struct DownloadSession {
    url: String,
    cancel_token: CancellationToken,
    state: Mutex<SessionState>,
}

struct DownloaderInner {
    transport: Arc<dyn Transport>,
    config: DownloaderConfig,
    /// At most one live session per URL. Lock order is always this map
    /// first, then a session's state.
    sessions: Mutex<HashMap<String, Arc<DownloadSession>>>,
}

/// Cancellable reference to one awaiter of one session. Await `output()`
/// for the result; dropping the handle without awaiting detaches (and
/// cancels) this awaiter only.
pub struct DownloadHandle {
    url: String,
    callback_id: Uuid,
    downloader: Weak<DownloaderInner>,
    receiver: Option<oneshot::Receiver<Result<DownloadOutput, Error>>>,
}

impl DownloadHandle {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Cancels this awaiter. Other awaiters of the same URL are
    /// unaffected; the transport is cancelled only when the last awaiter
    /// goes away.
    pub fn cancel(&self) {
        if let Some(inner) = self.downloader.upgrade() {
            Downloader::cancel_callback(&inner, &self.url, self.callback_id);
        }
    }

    /// Resolves with the session output, or the error this awaiter was
    /// cancelled with.
    pub async fn output(mut self) -> Result<DownloadOutput, Error> {
        let receiver = self
            .receiver
            .take()
            .expect("output() can only be polled once");
        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(make_err!(
                Code::TaskCancelled,
                "Download session for {} went away before completing",
                self.url
            )),
        }
    }
}

impl Drop for DownloadHandle {
    fn drop(&mut self) {
        // An abandoned handle must not leave its callback registered, or
        // the session would never observe "all awaiters gone".
        if self.receiver.is_some() {
            self.cancel();
        }
    }
}

/// Deduplicates concurrent fetches per URL: any number of callers may
/// enqueue the same URL while one transport fetch runs; each gets its own
/// cancellable handle and its own completion.
pub struct Downloader {
    inner: Arc<DownloaderInner>,
}

impl Downloader {
    pub fn new(config: DownloaderConfig) -> Result<Self, Error> {
        let transport = Arc::new(HttpTransport::new(&config)?);
        Ok(Downloader::new_with_transport(config, transport))
    }

    pub fn new_with_transport(config: DownloaderConfig, transport: Arc<dyn Transport>) -> Self {
        Downloader {
            inner: Arc::new(DownloaderInner {
                transport,
                config,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Joins the live session for `url`, or creates one and starts its
    /// fetch. Session-level options take effect only when this call
    /// creates the session.
    pub fn download(&self, url: &str, options: DownloadOptions) -> DownloadHandle {
        let callback_id = Uuid::new_v4();
        let (completion, receiver) = oneshot::channel();
        let callback = SessionCallback {
            id: callback_id,
            progress: options.progress.clone(),
            completion,
        };
        let handle = DownloadHandle {
            url: url.to_string(),
            callback_id,
            downloader: Arc::downgrade(&self.inner),
            receiver: Some(receiver),
        };

        let mut sessions = self.inner.sessions.lock();
        if let Some(session) = sessions.get(url) {
            let mut state = session.state.lock();
            if !state.finished {
                debug!("Coalescing download of {url} onto the in-flight session");
                state.callbacks.push(callback);
                return handle;
            }
            // Finished but not yet retired; fall through and replace it.
        }

        let session = Arc::new(DownloadSession {
            url: url.to_string(),
            cancel_token: CancellationToken::new(),
            state: Mutex::new(SessionState {
                callbacks: vec![callback],
                finished: false,
                _task: None,
            }),
        });
        sessions.insert(url.to_string(), session.clone());
        drop(sessions);

        let task = JoinHandleDropGuard::new(tokio::spawn(Self::run_session(
            self.inner.clone(),
            session.clone(),
            options,
        )));
        session.state.lock()._task = Some(task);
        handle
    }

    async fn run_session(
        inner: Arc<DownloaderInner>,
        session: Arc<DownloadSession>,
        options: DownloadOptions,
    ) {
        let result = Self::fetch_session(&inner, &session, &options).await;
        Self::complete_session(&inner, &session, result);
    }

    async fn fetch_session(
        inner: &Arc<DownloaderInner>,
        session: &Arc<DownloadSession>,
        options: &DownloadOptions,
    ) -> Result<DownloadOutput, Error> {
        let mut request = DownloadRequest::new(&session.url, &inner.config);
        request.priority = options.priority;
        if let Some(timeout) = options.timeout {
            request.timeout = timeout;
        }

        // Materialise the request. With an async modifier the session sits
        // in "not started" until the future resolves; a cancellation that
        // lands meanwhile wins and the transport is never engaged.
        if let Some(modifier) = &options.async_request_modifier {
            request = modifier
                .modify(request)
                .await
                .ok_or_else(|| make_err!(Code::EmptyRequest, "Request modifier emptied the request"))?;
        } else if let Some(modifier) = &options.request_modifier {
            request = modifier
                .modify(request)
                .ok_or_else(|| make_err!(Code::EmptyRequest, "Request modifier emptied the request"))?;
        }
        if session.state.lock().finished {
            return Err(make_err!(
                Code::TaskCancelled,
                "All awaiters cancelled before the request materialised"
            ));
        }

        // Progress fans out to every awaiter registered at event time.
        let progress_session = session.clone();
        let progress: ProgressSink = Arc::new(move |received, total| {
            let state = progress_session.state.lock();
            for callback in &state.callbacks {
                if let Some(progress) = &callback.progress {
                    progress(received, total);
                }
            }
        });

        let response = inner
            .transport
            .fetch(
                request,
                TransportContext {
                    progress: Some(progress),
                    response_gate: options.response_gate.clone(),
                    redirect_handler: options.redirect_handler.clone(),
                    cancel: session.cancel_token.clone(),
                },
            )
            .await?;

        match response.status {
            200..=299 => {}
            304 => {
                return Err(make_err!(
                    Code::NotModified,
                    "Server reported {} unmodified",
                    session.url
                ))
            }
            code => {
                return Err(make_err!(
                    Code::InvalidStatusCode,
                    "Unacceptable status code {code} for {}",
                    session.url
                ))
            }
        }

        // The data modifier runs once per session, not once per awaiter.
        let data = match &options.data_modifier {
            Some(modifier) => modifier.modify(response.data).ok_or_else(|| {
                make_err!(
                    Code::DataModifyingFailed,
                    "Data modifier rejected the payload of {}",
                    session.url
                )
            })?,
            None => response.data,
        };

        // Decode once to the shared reference image; per-awaiter processing
        // happens downstream in the retriever.
        let image = Arc::new(DecodedImage::decode(&data, &options.decode)?);
        Ok(DownloadOutput {
            url: session.url.clone(),
            data,
            image,
        })
    }

    /// Delivers `result` to every awaiter still registered, in
    /// registration order, then retires the session. A session that was
    /// already finished by cancellation delivers nothing.
    fn complete_session(
        inner: &Arc<DownloaderInner>,
        session: &Arc<DownloadSession>,
        result: Result<DownloadOutput, Error>,
    ) {
        let mut sessions = inner.sessions.lock();
        let callbacks = {
            let mut state = session.state.lock();
            if state.finished {
                return;
            }
            state.finished = true;
            std::mem::take(&mut state.callbacks)
        };
        Self::retire_session(&mut sessions, session);
        drop(sessions);

        for callback in callbacks {
            let _ = callback.completion.send(result.clone());
        }
    }

    fn retire_session(
        sessions: &mut HashMap<String, Arc<DownloadSession>>,
        session: &Arc<DownloadSession>,
    ) {
        if let Some(live) = sessions.get(&session.url) {
            if Arc::ptr_eq(live, session) {
                sessions.remove(&session.url);
            }
        }
    }

    fn cancel_callback(inner: &Arc<DownloaderInner>, url: &str, callback_id: Uuid) {
        let mut sessions = inner.sessions.lock();
        let Some(session) = sessions.get(url).cloned() else {
            return;
        };
        let cancelled = {
            let mut state = session.state.lock();
            let Some(position) = state.callbacks.iter().position(|c| c.id == callback_id) else {
                return;
            };
            let cancelled = state.callbacks.remove(position);
            if state.callbacks.is_empty() && !state.finished {
                // Last awaiter left: the transport has nobody to serve.
                state.finished = true;
                session.cancel_token.cancel();
                Self::retire_session(&mut sessions, &session);
            }
            cancelled
        };
        drop(sessions);
        let _ = cancelled.completion.send(Err(make_err!(
            Code::TaskCancelled,
            "Download of {url} was cancelled"
        )));
    }

    /// Cancels every awaiter of `url` and the underlying fetch.
    pub fn cancel_all(&self, url: &str) {
        let mut sessions = self.inner.sessions.lock();
        let Some(session) = sessions.remove(url) else {
            return;
        };
        drop(sessions);
        Self::cancel_session(&session);
    }

    /// Cancels everything in flight.
    pub fn cancel_all_sessions(&self) {
        let sessions: Vec<Arc<DownloadSession>> =
            self.inner.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            Self::cancel_session(&session);
        }
    }

    fn cancel_session(session: &Arc<DownloadSession>) {
        let callbacks = {
            let mut state = session.state.lock();
            if state.finished {
                return;
            }
            state.finished = true;
            session.cancel_token.cancel();
            std::mem::take(&mut state.callbacks)
        };
        for callback in callbacks {
            let _ = callback.completion.send(Err(make_err!(
                Code::TaskCancelled,
                "Download of {} was cancelled",
                session.url
            )));
        }
    }

    /// Number of sessions currently in flight. Function is not for
    /// production code paths.
    pub fn active_session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }
}

impl Drop for Downloader {
    fn drop(&mut self) {
        self.cancel_all_sessions();
    }
}
