// Copyright 2022 Webb Technologies Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Retry logic for shared-store calls.

use std::time::Duration;

use backoff::backoff::Backoff;

use crate::probe;

/// Exponential backoff which doubles a base interval, until it exceeds the
/// maximum retry count.
#[derive(Debug)]
pub struct CappedExponential {
    initial: Duration,
    current: Duration,
    max_retry_count: usize,
    count: usize,
}

impl CappedExponential {
    /// Creates a new capped exponential backoff with `interval` and
    /// `max_retry_count`. `interval` is the initial duration to wait between
    /// retries and doubles on every attempt; `max_retry_count` is the maximum
    /// number of retries, after which we return `None` to indicate that we
    /// should stop retrying.
    pub fn new(interval: Duration, max_retry_count: usize) -> Self {
        Self {
            initial: interval,
            current: interval,
            max_retry_count,
            count: 0,
        }
    }
}

impl Backoff for CappedExponential {
    fn next_backoff(&mut self) -> Option<Duration> {
        (self.count < self.max_retry_count).then(|| {
            self.count += 1;
            let interval = self.current;
            self.current = self.current.saturating_mul(2);
            interval
        })
    }

    fn reset(&mut self) {
        self.count = 0;
        self.current = self.initial;
    }
}

/// How many times a transient store failure is retried before it is
/// surfaced to the caller.
pub const STORE_RETRY_COUNT: usize = 3;

const STORE_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Runs `op` against the shared store, retrying transient failures with
/// [`CappedExponential`] backoff. Non-transient errors are returned
/// immediately; transient ones are returned once the retry window is
/// exhausted, at which point the caller is expected to degrade.
pub async fn with_store_retries<T, F>(mut op: F) -> crate::Result<T>
where
    F: FnMut() -> crate::Result<T>,
{
    let mut policy =
        CappedExponential::new(STORE_RETRY_INTERVAL, STORE_RETRY_COUNT);
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() => match policy.next_backoff() {
                Some(interval) => {
                    tracing::event!(
                        target: probe::TARGET,
                        tracing::Level::DEBUG,
                        kind = %probe::Kind::Retry,
                        error = %e,
                        backoff_ms = %interval.as_millis(),
                    );
                    tokio::time::sleep(interval).await;
                }
                None => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_stops() {
        let mut policy =
            CappedExponential::new(Duration::from_millis(10), 3);
        assert_eq!(policy.next_backoff(), Some(Duration::from_millis(10)));
        assert_eq!(policy.next_backoff(), Some(Duration::from_millis(20)));
        assert_eq!(policy.next_backoff(), Some(Duration::from_millis(40)));
        assert_eq!(policy.next_backoff(), None);
        policy.reset();
        assert_eq!(policy.next_backoff(), Some(Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let mut attempts = 0;
        let result: crate::Result<u32> = with_store_retries(|| {
            attempts += 1;
            if attempts < 3 {
                Err(crate::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "flaky",
                )))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let mut attempts = 0;
        let result: crate::Result<u32> = with_store_retries(|| {
            attempts += 1;
            Err(crate::Error::Generic("no luck"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }
}
