use crate::domain::errors::{ClientError, ClientResult};
use crate::domain::ports::time_service::TimeService;
use crate::domain::ports::write_client::{WriteClient, WriteMeta};
use crate::infrastructure::runtime::TokioTimeService;
use http::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lower bound (exclusive) of the retryable server-error window: 500 Internal
/// Server Error.
///
/// A plain 500 is deliberately not retried; only the statuses above it are.
/// Moving the window to include 500 is a change to this constant only.
pub const RETRYABLE_STATUS_LOWER_EXCLUSIVE: u16 = 500;

/// Upper bound (exclusive) of the retryable server-error window: 511 Network
/// Authentication Required.
pub const RETRYABLE_STATUS_UPPER_EXCLUSIVE: u16 = 511;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_DELAY_BASE: Duration = Duration::from_secs(1);

/// Whether a response with `status` may be attempted again.
pub fn is_call_retriable(status: u16) -> bool {
    (status > RETRYABLE_STATUS_LOWER_EXCLUSIVE && status < RETRYABLE_STATUS_UPPER_EXCLUSIVE)
        || status == StatusCode::TOO_MANY_REQUESTS.as_u16()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOptions {
    /// Total number of attempts, including the first one.
    pub max_retries: u32,
    /// Delay before the second attempt; doubled for each further attempt.
    pub delay_base: Duration,
    /// Replaces the exponential schedule with a constant delay.
    pub fixed_delay: Option<Duration>,
    /// Cap on any single inter-attempt delay.
    pub max_backoff_delay: Option<Duration>,
    /// No further attempt is made once this much time has passed since the
    /// first one.
    pub max_to_last_call: Option<Duration>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            delay_base: DEFAULT_DELAY_BASE,
            fixed_delay: None,
            max_backoff_delay: None,
            max_to_last_call: None,
        }
    }
}

impl RetryOptions {
    /// Delay to wait before `attempt` (zero-based).
    /// Delay: 0, base, 2*base, 4*base, ... (capped at `max_backoff_delay`)
    pub fn attempt_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.fixed_delay {
            Some(fixed) => fixed,
            None => 2u32
                .checked_pow(attempt - 1)
                .and_then(|factor| self.delay_base.checked_mul(factor))
                .unwrap_or(Duration::MAX),
        };

        match self.max_backoff_delay {
            Some(cap) if delay > cap => cap,
            _ => delay,
        }
    }
}

/// Wraps a `WriteClient` with bounded, cancellable exponential backoff.
#[derive(Clone)]
pub struct RetryClient {
    inner: Arc<dyn WriteClient>,
    options: RetryOptions,
    time_service: Arc<dyn TimeService>,
}

impl RetryClient {
    pub fn new(inner: Arc<dyn WriteClient>, options: RetryOptions) -> Self {
        Self {
            inner,
            options,
            time_service: TokioTimeService::shared(),
        }
    }

    pub fn with_time_service(mut self, time_service: Arc<dyn TimeService>) -> Self {
        self.time_service = time_service;
        self
    }

    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    /// Perform the write, retrying transient server failures.
    ///
    /// Returns as soon as an attempt succeeds, the failure is not
    /// retryable, the deadline has passed or attempts run out; in the last
    /// three cases the error of the final attempt is returned. Cancellation
    /// aborts any pending wait or in-flight write with
    /// `ClientError::Canceled`.
    pub async fn retry_put(
        &self,
        cancel: &CancellationToken,
        endpoint: &str,
        body: &Value,
    ) -> ClientResult<(WriteMeta, Value)> {
        let max_attempts = self.options.max_retries.max(1);
        let started = self.time_service.now();
        let mut attempt = 0;

        loop {
            let delay = self.options.attempt_delay(attempt);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ClientError::Canceled),
                _ = self.time_service.sleep(delay) => {}
            }

            // An in-flight write is abandoned on cancellation
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ClientError::Canceled),
                result = self.inner.put(endpoint, body) => result,
            };
            let err = match result {
                Ok(result) => return Ok(result),
                Err(err) => err,
            };
            attempt += 1;

            if let Some(deadline) = self.options.max_to_last_call {
                if self.time_service.now() - started > deadline {
                    warn!(
                        "PUT {} failed after {} attempts, retry deadline exceeded: {}",
                        endpoint, attempt, err
                    );
                    return Err(err);
                }
            }

            let status = match err.as_unexpected_response() {
                Some(response) => response.status_code(),
                None => {
                    // No response at all; not retried at this layer
                    return Err(err);
                }
            };

            if !is_call_retriable(status) {
                return Err(err);
            }

            if attempt >= max_attempts {
                warn!(
                    "PUT {} failed after {} attempts: {}",
                    endpoint, attempt, err
                );
                return Err(err);
            }

            debug!(
                "PUT {} returned retryable status {} (attempt {}/{})",
                endpoint, status, attempt, max_attempts
            );
        }
    }
}
