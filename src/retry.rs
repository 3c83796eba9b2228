/*
 * Call Insights - Rust Edition
 * Copyright (c) 2025 Call Insights Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use std::future::Future;
use std::time::Duration;

use crate::error::WorkerError;
use crate::token_client::{StatusResponse, TokenClient};

/// Anything that can report the broker's window status. The retry wrapper
/// only needs this one read.
pub trait StatusSource {
    fn get_status(&self) -> StatusResponse;
}

impl StatusSource for TokenClient {
    fn get_status(&self) -> StatusResponse {
        TokenClient::get_status(self)
    }
}

/// Re-invoke `op` after waiting out the broker's reset window whenever it
/// fails with a rate-limit error.
///
/// Any other error propagates immediately. There is no jitter and no backoff
/// curve here: every worker shares the same window, and the broker is
/// authoritative about when it resets. `op` runs at most `max_retries` times.
pub async fn with_rate_limit_retry<T, S, F, Fut>(
    status_source: &S,
    max_retries: usize,
    mut op: F,
) -> Result<T, WorkerError>
where
    S: StatusSource,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, WorkerError>>,
{
    let attempts = max_retries.max(1);
    let mut last_error = None;

    for attempt in 0..attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_rate_limit() && attempt + 1 < attempts => {
                let status = status_source.get_status();
                let wait = status.reset_time_seconds + 1; // 1 second buffer past the reset
                tracing::info!(
                    attempt = attempt + 1,
                    wait_seconds = wait,
                    "Rate limit exceeded, waiting for window reset before retry"
                );
                tokio::time::sleep(Duration::from_secs(wait)).await;
                last_error = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_error.unwrap_or(WorkerError::RateLimitExceeded { reset_seconds: 0 }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    struct CountingStatus {
        calls: Cell<usize>,
        reset_seconds: u64,
    }

    impl CountingStatus {
        fn new(reset_seconds: u64) -> Self {
            Self {
                calls: Cell::new(0),
                reset_seconds,
            }
        }
    }

    impl StatusSource for CountingStatus {
        fn get_status(&self) -> StatusResponse {
            self.calls.set(self.calls.get() + 1);
            StatusResponse {
                available_tokens: 0,
                used_tokens: 0,
                locked_tokens: 0,
                reset_time_seconds: self.reset_seconds,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_rate_limit_until_success() {
        let status = CountingStatus::new(30);
        let failures = RefCell::new(2usize);

        let result = with_rate_limit_retry(&status, 5, || async {
            let mut remaining = failures.borrow_mut();
            if *remaining > 0 {
                *remaining -= 1;
                Err(WorkerError::RateLimitExceeded { reset_seconds: 30 })
            } else {
                Ok("done")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        // one status read per wait, and nothing once the op succeeds
        assert_eq!(status.calls.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn non_rate_limit_errors_propagate_without_status_reads() {
        let status = CountingStatus::new(30);

        let result: Result<(), _> = with_rate_limit_retry(&status, 5, || async {
            Err(WorkerError::Backend("connection reset".into()))
        })
        .await;

        assert!(matches!(result, Err(WorkerError::Backend(_))));
        assert_eq!(status.calls.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_the_last_rate_limit_error() {
        let status = CountingStatus::new(10);
        let calls = Cell::new(0usize);

        let result: Result<(), _> = with_rate_limit_retry(&status, 3, || {
            calls.set(calls.get() + 1);
            async { Err(WorkerError::RateLimitExceeded { reset_seconds: 10 }) }
        })
        .await;

        assert!(matches!(
            result,
            Err(WorkerError::RateLimitExceeded { reset_seconds: 10 })
        ));
        assert_eq!(calls.get(), 3);
        assert_eq!(status.calls.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_requests_are_not_retried() {
        let status = CountingStatus::new(10);
        let calls = Cell::new(0usize);

        let result: Result<(), _> = with_rate_limit_retry(&status, 3, || {
            calls.set(calls.get() + 1);
            async {
                Err(WorkerError::RequestTooLarge {
                    estimated: 200,
                    limit: 100,
                })
            }
        })
        .await;

        assert!(matches!(result, Err(WorkerError::RequestTooLarge { .. })));
        assert_eq!(calls.get(), 1);
        assert_eq!(status.calls.get(), 0);
    }
}
