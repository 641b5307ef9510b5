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

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures::stream::StreamExt;
use futures::Stream;
use pixfetch_error::{make_err, Code, Error};

/// The outcome of a single attempt inside a retried operation.
pub enum RetryResult<T> {
    Ok(T),
    Retry(Error),
    Err(Error),
}

/// Duration iterator that doubles the delay on every step. Callers cap the
/// attempt count with `.take()` and add jitter with `.map()`.
pub struct ExponentialBackoff {
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration) -> Self {
        ExponentialBackoff { current: base }
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = self.current;
        self.current *= 2;
        Some(delay)
    }
}

type SleepFn = Box<dyn Fn(Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Drives a stream of attempts until one resolves, sleeping between retries
/// with delays drawn from a duration iterator. When the iterator runs dry
/// the last retryable error is returned.
pub struct Retrier {
    sleep_fn: SleepFn,
}

impl Retrier {
    pub fn new(sleep_fn: SleepFn) -> Self {
        Retrier { sleep_fn }
    }

    /// A retrier sleeping on the tokio timer.
    pub fn default_sleep() -> Self {
        Retrier::new(Box::new(|duration| Box::pin(tokio::time::sleep(duration))))
    }

    pub fn retry<'a, T, Iter, S>(
        self: Pin<&'a Self>,
        duration_iter: Iter,
        operation: S,
    ) -> impl Future<Output = Result<T, Error>> + 'a
    where
        T: Send + 'a,
        Iter: Iterator<Item = Duration> + Send + 'a,
        S: Stream<Item = RetryResult<T>> + Send + Unpin + 'a,
    {
        let mut duration_iter = duration_iter;
        let mut operation = operation;
        async move {
            loop {
                match operation.next().await {
                    None => {
                        return Err(make_err!(
                            Code::Internal,
                            "Operation stream ended before yielding a result"
                        ))
                    }
                    Some(RetryResult::Ok(value)) => return Ok(value),
                    Some(RetryResult::Err(e)) => return Err(e),
                    Some(RetryResult::Retry(e)) => match duration_iter.next() {
                        None => return Err(e),
                        Some(duration) => (self.sleep_fn)(duration).await,
                    },
                }
            }
        }
    }
}
