use crate::{
    batcher::Batch,
    client::{CardGenerator, GenerationRequest},
    error::{ApiError, Error, Result},
    prompt::PromptAssembler,
    validator::{ResponseValidator, Validated},
};
use std::fmt;
use std::thread;
use std::time::Duration;
use tracing::{debug, instrument, trace, warn};

const DEFAULT_RATE_LIMIT_ATTEMPTS: usize = 6;
const DEFAULT_SERVER_ERROR_ATTEMPTS: usize = 3;
const DEFAULT_VALIDATION_ATTEMPTS: usize = 2;
const DEFAULT_TIMEOUT_ATTEMPTS: usize = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Attempt bounds and backoff for one batch.
///
/// Every bound counts total requests for that cause, so a bound of 2 means
/// one retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Requests allowed while the API answers 429
    pub max_rate_limit_attempts: usize,

    /// Requests allowed while the API answers 5xx
    pub max_server_error_attempts: usize,

    /// Requests allowed while responses fail validation
    pub max_validation_attempts: usize,

    /// Requests allowed for a single item that keeps timing out
    pub max_timeout_attempts: usize,

    /// Delay before the first retry; doubles per attempt
    pub base_delay: Duration,

    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_rate_limit_attempts: DEFAULT_RATE_LIMIT_ATTEMPTS,
            max_server_error_attempts: DEFAULT_SERVER_ERROR_ATTEMPTS,
            max_validation_attempts: DEFAULT_VALIDATION_ATTEMPTS,
            max_timeout_attempts: DEFAULT_TIMEOUT_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Same bounds as the default, without any waiting.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based): `base * 2^(retry - 1)`, capped.
    #[must_use]
    pub fn backoff(&self, retry: usize) -> Duration {
        let exponent = u32::try_from(retry.saturating_sub(1)).unwrap_or(u32::MAX).min(16);
        self.base_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay)
    }

    /// Delay before retry number `retry` after `error`.
    ///
    /// A `Retry-After` on a rate limit wins over the computed backoff but is
    /// still capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, error: &ApiError, retry: usize) -> Duration {
        match error {
            ApiError::RateLimited {
                retry_after: Some(wait),
            } => (*wait).min(self.max_delay),
            _ => self.backoff(retry),
        }
    }

    /// Checks that every bound allows at least one request.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the offending bound.
    pub fn validate(&self) -> Result<()> {
        let bounds = [
            ("max_rate_limit_attempts", self.max_rate_limit_attempts),
            ("max_server_error_attempts", self.max_server_error_attempts),
            ("max_validation_attempts", self.max_validation_attempts),
            ("max_timeout_attempts", self.max_timeout_attempts),
        ];

        for (name, value) in bounds {
            if value == 0 {
                return Err(Error::config(format!("{name} must be greater than 0")));
            }
        }

        if self.base_delay > self.max_delay {
            return Err(Error::config(format!(
                "base_delay ({:?}) must not exceed max_delay ({:?})",
                self.base_delay, self.max_delay
            )));
        }

        Ok(())
    }
}

/// Lifecycle of one batch, reported in traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// Queued, no request sent yet
    Pending,
    /// Waiting for the API
    Requesting,
    /// Checking the response
    Validating,
    /// Validated and handed back
    Succeeded,
    /// Waiting before the next request
    Retrying,
    /// Out of attempts
    Failed,
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Requesting => "requesting",
            Self::Validating => "validating",
            Self::Succeeded => "succeeded",
            Self::Retrying => "retrying",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Result of driving one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Validated results for every item of the batch
    Completed(Validated),

    /// The batch timed out and must be processed as two smaller batches, in order
    Split(Batch, Batch),
}

#[derive(Debug, Default)]
struct Attempts {
    total: usize,
    rate_limited: usize,
    server_error: usize,
    validation: usize,
    timeout: usize,
}

/// Sends a batch, validates the answer, and retries within [`RetryPolicy`].
pub struct RetryController<'a> {
    generator: &'a dyn CardGenerator,
    assembler: &'a PromptAssembler,
    validator: ResponseValidator,
    policy: RetryPolicy,
    requests: usize,
    retries: usize,
}

impl<'a> RetryController<'a> {
    /// Creates a controller.
    #[must_use]
    pub fn new(
        generator: &'a dyn CardGenerator,
        assembler: &'a PromptAssembler,
        validator: ResponseValidator,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            generator,
            assembler,
            validator,
            policy,
            requests: 0,
            retries: 0,
        }
    }

    /// Requests issued so far.
    #[must_use]
    pub const fn requests(&self) -> usize {
        self.requests
    }

    /// Retries issued so far.
    #[must_use]
    pub const fn retries(&self) -> usize {
        self.retries
    }

    /// Drives `batch` until it succeeds, splits, or runs out of attempts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BatchFailed`] once a retry bound is exhausted or the
    /// API reports a non-retryable error, and template errors from rendering
    /// the request.
    #[instrument(skip_all, fields(first = batch.first_position(), len = batch.len()))]
    pub fn process(&mut self, batch: &Batch) -> Result<BatchOutcome> {
        let user_message = self.assembler.user_message(batch)?;
        let request = GenerationRequest {
            system: self.assembler.system_message(),
            user_message: &user_message,
            batch,
        };

        let mut attempts = Attempts::default();
        trace!(state = %BatchState::Pending);

        loop {
            attempts.total += 1;
            self.requests += 1;
            trace!(state = %BatchState::Requesting, attempt = attempts.total);

            let delay = match self.generator.generate(&request) {
                Ok(raw) => {
                    trace!(state = %BatchState::Validating);
                    match self.validator.validate(&raw, batch) {
                        Ok(validated) => {
                            trace!(state = %BatchState::Succeeded, attempts = attempts.total);
                            return Ok(BatchOutcome::Completed(validated));
                        }
                        Err(e) => {
                            attempts.validation += 1;
                            if attempts.validation >= self.policy.max_validation_attempts {
                                return Err(Self::fail(batch, &attempts, e.into()));
                            }
                            debug!(
                                cause = e.kind(),
                                "Invalid response for items {}-{} ({}). Retrying...",
                                batch.first_position(),
                                batch.last_position(),
                                e
                            );
                            Duration::ZERO
                        }
                    }
                }
                Err(ApiError::RateLimited { retry_after }) => {
                    attempts.rate_limited += 1;
                    if attempts.rate_limited >= self.policy.max_rate_limit_attempts {
                        return Err(Self::fail(
                            batch,
                            &attempts,
                            ApiError::RateLimited { retry_after }.into(),
                        ));
                    }
                    let delay = self
                        .policy
                        .delay_for(&ApiError::RateLimited { retry_after }, attempts.rate_limited);
                    debug!(
                        cause = "rate-limited",
                        "Rate limit hit. Retrying in {:.1}s...",
                        delay.as_secs_f64()
                    );
                    delay
                }
                Err(e @ ApiError::ServerError { .. }) => {
                    attempts.server_error += 1;
                    if attempts.server_error >= self.policy.max_server_error_attempts {
                        return Err(Self::fail(batch, &attempts, e.into()));
                    }
                    let delay = self.policy.delay_for(&e, attempts.server_error);
                    debug!(
                        cause = "server-error",
                        "{}. Retrying in {:.1}s...",
                        e,
                        delay.as_secs_f64()
                    );
                    delay
                }
                Err(ApiError::Timeout) => {
                    if let Some((left, right)) = batch.halve() {
                        debug!(
                            cause = "timeout",
                            "Request timed out. Splitting batch into {} + {} items",
                            left.len(),
                            right.len()
                        );
                        self.retries += 1;
                        return Ok(BatchOutcome::Split(left, right));
                    }

                    attempts.timeout += 1;
                    if attempts.timeout >= self.policy.max_timeout_attempts {
                        return Err(Self::fail(batch, &attempts, ApiError::Timeout.into()));
                    }
                    let delay = self.policy.delay_for(&ApiError::Timeout, attempts.timeout);
                    debug!(
                        cause = "timeout",
                        "Request timed out. Retrying in {:.1}s...",
                        delay.as_secs_f64()
                    );
                    delay
                }
                Err(e) => return Err(Self::fail(batch, &attempts, e.into())),
            };

            trace!(state = %BatchState::Retrying);
            self.retries += 1;
            if !delay.is_zero() {
                thread::sleep(delay);
            }
        }
    }

    fn fail(batch: &Batch, attempts: &Attempts, source: Error) -> Error {
        warn!(
            state = %BatchState::Failed,
            "Giving up on items {}-{} after {} attempt(s): {}",
            batch.first_position(),
            batch.last_position(),
            attempts.total,
            source
        );

        // everything before this batch was recorded before it started
        Error::BatchFailed {
            first_item: batch.first_position(),
            last_item: batch.last_position(),
            attempts: attempts.total,
            resume_after: batch.first_position().saturating_sub(1),
            source: Box::new(source),
        }
    }
}
