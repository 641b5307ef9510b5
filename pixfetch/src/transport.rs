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

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use pixfetch_config::DownloaderConfig;
use pixfetch_error::{make_err, Code, Error, ResultExt};
use tokio_util::sync::CancellationToken;

/// Relative urgency of a fetch, forwarded to transports that can reorder.
/// The bundled HTTP transport records it but HTTP/1 offers no signal to
/// honor it with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum DownloadPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// The request a transport executes. Modifiers rewrite values of this
/// before the session materialises.
#[derive(Clone, Debug)]
pub struct DownloadRequest {
    pub url: String,
    pub timeout: Duration,
    pub priority: DownloadPriority,
    pub headers: Vec<(String, String)>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, config: &DownloaderConfig) -> Self {
        DownloadRequest {
            url: url.into(),
            timeout: config.timeout(),
            priority: DownloadPriority::default(),
            headers: Vec::new(),
        }
    }
}

/// Rewrites a request before it is sent. Returning `None` means "empty
/// request" and fails the download with `EmptyRequest`.
pub trait RequestModifier: Send + Sync {
    fn modify(&self, request: DownloadRequest) -> Option<DownloadRequest>;
}

/// Like [`RequestModifier`] but resolved asynchronously. The session is not
/// materialised until the request is known; a handle issued in the meantime
/// can still cancel, and doing so guarantees the transport never starts.
#[async_trait]
pub trait AsyncRequestModifier: Send + Sync {
    async fn modify(&self, request: DownloadRequest) -> Option<DownloadRequest>;
}

/// Rewrites downloaded bytes once per session, before decode. Returning
/// `None` fails the download with `DataModifyingFailed`.
pub trait DataModifier: Send + Sync {
    fn modify(&self, data: Bytes) -> Option<Bytes>;
}

/// Decides what to do with a redirect the server proposed. `proposed`
/// carries the original request retargeted at the redirect location.
/// Returning `None` stops following; the redirect response becomes the
/// final one.
pub trait RedirectHandler: Send + Sync {
    fn handle(&self, status: u16, proposed: DownloadRequest) -> Option<DownloadRequest>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseDisposition {
    Allow,
    Cancel,
}

/// Inspects the initial response status and headers before the body is
/// read. `Cancel` fails the download with `CancelledByDelegate`.
pub trait ResponseGate: Send + Sync {
    fn evaluate(&self, status: u16, headers: &[(String, String)]) -> ResponseDisposition;
}

/// Byte progress callback: (received so far, expected total when known).
pub type ProgressSink = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Everything a transport needs besides the request itself.
#[derive(Clone)]
pub struct TransportContext {
    pub progress: Option<ProgressSink>,
    pub response_gate: Option<Arc<dyn ResponseGate>>,
    pub redirect_handler: Option<Arc<dyn RedirectHandler>>,
    pub cancel: CancellationToken,
}

#[derive(Clone, Debug)]
pub struct TransportResponse {
    pub status: u16,
    pub data: Bytes,
}

/// The wire boundary. One call, one fetch; coalescing happens a layer up.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(
        &self,
        request: DownloadRequest,
        context: TransportContext,
    ) -> Result<TransportResponse, Error>;
}

/// The bundled HTTP transport. Redirects are followed manually so a
/// configured [`RedirectHandler`] can rewrite each hop; the body is
/// streamed so progress fires per chunk.
pub struct HttpTransport {
    client: reqwest::Client,
    max_redirects: u32,
}

impl HttpTransport {
    pub fn new(config: &DownloaderConfig) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .err_tip(|| "Failed to build HTTP client")?;
        Ok(HttpTransport {
            client,
            max_redirects: config.max_redirects(),
        })
    }

    async fn send_once(
        &self,
        request: &DownloadRequest,
    ) -> Result<reqwest::Response, Error> {
        let mut builder = self
            .client
            .get(&request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
            .send()
            .await
            .err_tip(|| format!("While requesting {}", request.url))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(
        &self,
        request: DownloadRequest,
        context: TransportContext,
    ) -> Result<TransportResponse, Error> {
        if reqwest::Url::parse(&request.url).is_err() {
            return Err(make_err!(Code::InvalidUrl, "Invalid URL: {}", request.url));
        }

        let mut request = request;
        let mut response = None;
        for _ in 0..=self.max_redirects {
            let sending = self.send_once(&request);
            let current = tokio::select! {
                _ = context.cancel.cancelled() => {
                    return Err(make_err!(Code::TaskCancelled, "Fetch cancelled: {}", request.url));
                }
                result = sending => result?,
            };
            if !current.status().is_redirection() {
                response = Some(current);
                break;
            }
            let Some(location) = current
                .headers()
                .get(http::header::LOCATION)
                .and_then(|v| v.to_str().ok())
            else {
                response = Some(current);
                break;
            };
            let next_url = reqwest::Url::parse(&request.url)
                .and_then(|base| base.join(location))
                .map_err(|e| make_err!(Code::InvalidUrl, "Invalid redirect target {location}: {e}"))?;
            let mut proposed = request.clone();
            proposed.url = next_url.to_string();
            match &context.redirect_handler {
                Some(handler) => match handler.handle(current.status().as_u16(), proposed) {
                    Some(rewritten) => request = rewritten,
                    None => {
                        response = Some(current);
                        break;
                    }
                },
                None => request = proposed,
            }
        }
        let response = response.err_tip_with_code(|_| {
            (
                Code::TransportError,
                format!("Redirect limit exceeded for {}", request.url),
            )
        })?;

        let status = response.status().as_u16();
        if let Some(gate) = &context.response_gate {
            let headers: Vec<(String, String)> = response
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).to_string(),
                    )
                })
                .collect();
            if gate.evaluate(status, &headers) == ResponseDisposition::Cancel {
                return Err(make_err!(
                    Code::CancelledByDelegate,
                    "Response for {} rejected by delegate",
                    request.url
                ));
            }
        }

        let expected_total = response.content_length();
        let mut body = BytesMut::new();
        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                _ = context.cancel.cancelled() => {
                    return Err(make_err!(Code::TaskCancelled, "Fetch cancelled: {}", request.url));
                }
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(chunk) => {
                    let chunk = chunk.err_tip(|| format!("While downloading {}", request.url))?;
                    body.extend_from_slice(&chunk);
                    if let Some(progress) = &context.progress {
                        progress(body.len() as u64, expected_total);
                    }
                }
                None => break,
            }
        }
        Ok(TransportResponse {
            status,
            data: body.freeze(),
        })
    }
}
