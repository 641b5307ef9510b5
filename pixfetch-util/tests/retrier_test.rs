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
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::ready;
use futures::stream::repeat_with;
use pixfetch_error::{make_err, Code, Error};
use pixfetch_util::retrier::{ExponentialBackoff, Retrier, RetryResult};

/// A retrier whose sleeps resolve instantly, recording each requested
/// delay.
fn instant_retrier(slept: Arc<Mutex<Vec<Duration>>>) -> Retrier {
    Retrier::new(Box::new(move |delay| {
        slept.lock().unwrap().push(delay);
        Box::pin(ready(()))
    }))
}

/// Simulates a flaky image fetch: transport errors for the first
/// `failures` attempts, then a payload size.
fn flaky_fetch(
    failures: usize,
    attempts: Arc<AtomicUsize>,
) -> impl FnMut() -> RetryResult<usize> {
    move || {
        let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
        if attempt <= failures {
            RetryResult::Retry(make_err!(Code::TransportError, "Connection reset by peer"))
        } else {
            RetryResult::Ok(128)
        }
    }
}

#[cfg(test)]
mod retrier_tests {
    use super::*;
    use pretty_assertions::assert_eq; // Must be declared in every module.

    #[tokio::test]
    async fn healthy_fetch_resolves_on_the_first_attempt() -> Result<(), Error> {
        let slept = Arc::new(Mutex::new(Vec::new()));
        let retrier = instant_retrier(slept.clone());
        let attempts = Arc::new(AtomicUsize::new(0));

        let payload = Pin::new(&retrier)
            .retry(
                ExponentialBackoff::new(Duration::from_millis(10)).take(4),
                repeat_with(flaky_fetch(0, attempts.clone())),
            )
            .await?;

        assert_eq!(payload, 128);
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
        assert_eq!(
            slept.lock().unwrap().is_empty(),
            true,
            "A first-attempt success must never sleep"
        );
        Ok(())
    }

    #[tokio::test]
    async fn transient_failures_recover_within_the_delay_budget() -> Result<(), Error> {
        let slept = Arc::new(Mutex::new(Vec::new()));
        let retrier = instant_retrier(slept.clone());
        let attempts = Arc::new(AtomicUsize::new(0));

        let payload = Pin::new(&retrier)
            .retry(
                ExponentialBackoff::new(Duration::from_millis(10)).take(4),
                repeat_with(flaky_fetch(2, attempts.clone())),
            )
            .await?;

        assert_eq!(payload, 128);
        assert_eq!(attempts.load(Ordering::Relaxed), 3, "Two failures, then the hit");
        assert_eq!(
            *slept.lock().unwrap(),
            vec![Duration::from_millis(10), Duration::from_millis(20)],
            "One exponential sleep per failed attempt"
        );
        Ok(())
    }

    #[tokio::test]
    async fn the_delay_iterator_caps_the_attempt_count() {
        let slept = Arc::new(Mutex::new(Vec::new()));
        let retrier = instant_retrier(slept.clone());
        let attempts = Arc::new(AtomicUsize::new(0));

        // Two delays buy three attempts: the first try plus one retry per
        // delay. The fetch never succeeds, so the last retry error
        // surfaces.
        let result = Pin::new(&retrier)
            .retry(
                ExponentialBackoff::new(Duration::from_millis(10)).take(2),
                repeat_with(flaky_fetch(usize::MAX, attempts.clone())),
            )
            .await;

        assert_eq!(attempts.load(Ordering::Relaxed), 3);
        assert_eq!(result.unwrap_err().code, Code::TransportError);
        assert_eq!(slept.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn terminal_errors_stop_retrying_immediately() {
        let retrier = instant_retrier(Arc::new(Mutex::new(Vec::new())));
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_in_fetch = attempts.clone();

        // A 404-style failure is not worth retrying no matter how many
        // delays remain.
        let result: Result<usize, Error> = Pin::new(&retrier)
            .retry(
                ExponentialBackoff::new(Duration::from_millis(10)).take(10),
                repeat_with(move || {
                    attempts_in_fetch.fetch_add(1, Ordering::Relaxed);
                    RetryResult::Err(make_err!(Code::InvalidStatusCode, "Status 404"))
                }),
            )
            .await;

        assert_eq!(attempts.load(Ordering::Relaxed), 1);
        assert_eq!(result.unwrap_err().code, Code::InvalidStatusCode);
    }

    #[test]
    fn exponential_backoff_doubles() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(100));
        assert_eq!(backoff.next(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(400)));
    }
}
