//! Retry policies for activity invocations.
//!
//! A [`RetryPolicy`] describes how many times a failing activity invocation
//! may be attempted and how long to back off between attempts. Policies are
//! pure configuration: they compute delays and retry decisions but perform no
//! I/O themselves.

use jiff::{Span, ToSpan};

/// A type alias for policy construction results.
pub type Result<T> = std::result::Result<T, Error>;

/// Retry policy construction errors.
///
/// Invalid configuration fails fast at build time; a constructed policy has
/// no failure modes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An interval was configured with a negative value.
    #[error("retry intervals must be non-negative, got {0}")]
    NegativeInterval(i64),

    /// The backoff coefficient was configured as zero or negative.
    #[error("backoff coefficient must be positive, got {0}")]
    NonPositiveCoefficient(f32),

    /// Bounded attempts were configured as zero.
    #[error("bounded max attempts must be at least 1")]
    ZeroMaxAttempts,
}

/// A type alias for attempt counters.
///
/// Attempts are one-based: the first invocation is attempt `1`.
pub type Attempt = u32;

/// Configuration of a policy for retries in case of activity failure.
///
/// # Example
///
/// ```rust
/// use headway::retry::RetryPolicy;
///
/// let retry_policy = RetryPolicy::builder()
///     .max_attempts(10)
///     .backoff_coefficient(4.0)
///     .build()?;
/// # Ok::<(), headway::retry::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub(crate) max_attempts: Option<Attempt>,
    pub(crate) initial_interval_ms: i64,
    pub(crate) max_interval_ms: i64,
    pub(crate) backoff_coefficient: f32,
    pub(crate) non_retryable: Vec<String>,
}

impl RetryPolicy {
    /// Creates a new builder.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Computes the backoff delay preceding the next attempt.
    ///
    /// The delay grows exponentially from the initial interval by the backoff
    /// coefficient and is capped at the maximum interval.
    pub fn next_delay(&self, attempt: Attempt) -> Span {
        let base_delay = self.initial_interval_ms as f32;
        let backoff_delay = base_delay * self.backoff_coefficient.powi(attempt as i32 - 1);
        let delay = backoff_delay.min(self.max_interval_ms as f32) as i64;
        delay.milliseconds()
    }

    /// Decides whether a failure with the given code may be retried after the
    /// given attempt.
    ///
    /// Returns `false` when the code is in the non-retryable set, or when the
    /// attempt count has reached the bounded maximum. Policies with unbounded
    /// attempts retry any code outside the non-retryable set.
    pub fn should_retry(&self, code: &str, attempt: Attempt) -> bool {
        if self.non_retryable.iter().any(|c| c == code) {
            return false;
        }

        match self.max_attempts {
            Some(max_attempts) => attempt < max_attempts,
            None => true,
        }
    }

    /// The configured maximum number of attempts, if bounded.
    pub fn max_attempts(&self) -> Option<Attempt> {
        self.max_attempts
    }
}

const DEFAULT_RETRY_POLICY: RetryPolicy = RetryPolicy {
    max_attempts: Some(5),
    initial_interval_ms: 1_000,
    max_interval_ms: 60_000,
    backoff_coefficient: 2.0,
    non_retryable: Vec::new(),
};

/// The default policy allows 5 attempts with an initial 1-second delay and
/// exponential backoff capped at 60 seconds.
impl Default for RetryPolicy {
    fn default() -> Self {
        DEFAULT_RETRY_POLICY
    }
}

/// A builder of [`RetryPolicy`].
#[derive(Debug, Default)]
pub struct Builder {
    inner: RetryPolicy,
}

impl Builder {
    /// Creates a new builder with the default retry settings.
    pub const fn new() -> Self {
        Self {
            inner: DEFAULT_RETRY_POLICY,
        }
    }

    /// Sets the maximum number of attempts.
    ///
    /// Default value is `5`.
    pub fn max_attempts(mut self, max_attempts: Attempt) -> Self {
        self.inner.max_attempts = Some(max_attempts);
        self
    }

    /// Removes the attempt bound, retrying transient failures indefinitely.
    pub fn unlimited_attempts(mut self) -> Self {
        self.inner.max_attempts = None;
        self
    }

    /// Sets the initial interval before the first retry (in milliseconds).
    ///
    /// Default value is `1_000`.
    pub fn initial_interval_ms(mut self, initial_interval_ms: i64) -> Self {
        self.inner.initial_interval_ms = initial_interval_ms;
        self
    }

    /// Sets the maximum interval between retries (in milliseconds).
    ///
    /// Default value is `60_000`.
    pub fn max_interval_ms(mut self, max_interval_ms: i64) -> Self {
        self.inner.max_interval_ms = max_interval_ms;
        self
    }

    /// Sets the backoff coefficient to apply after each retry.
    ///
    /// Default value is `2.0`.
    pub fn backoff_coefficient(mut self, backoff_coefficient: f32) -> Self {
        self.inner.backoff_coefficient = backoff_coefficient;
        self
    }

    /// Adds a failure code that short-circuits retries.
    ///
    /// A failure reporting this code is terminal regardless of remaining
    /// attempts.
    pub fn non_retryable(mut self, code: impl Into<String>) -> Self {
        self.inner.non_retryable.push(code.into());
        self
    }

    /// Validates the configuration and builds the `RetryPolicy`.
    pub fn build(self) -> Result<RetryPolicy> {
        if self.inner.initial_interval_ms < 0 {
            return Err(Error::NegativeInterval(self.inner.initial_interval_ms));
        }

        if self.inner.max_interval_ms < 0 {
            return Err(Error::NegativeInterval(self.inner.max_interval_ms));
        }

        if self.inner.backoff_coefficient <= 0.0 {
            return Err(Error::NonPositiveCoefficient(self.inner.backoff_coefficient));
        }

        if self.inner.max_attempts == Some(0) {
            return Err(Error::ZeroMaxAttempts);
        }

        Ok(self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_defaults() {
        let default_policy = RetryPolicy::default();
        assert_eq!(default_policy.max_attempts, Some(5));
        assert_eq!(default_policy.initial_interval_ms, 1_000);
        assert_eq!(default_policy.max_interval_ms, 60_000);
        assert_eq!(default_policy.backoff_coefficient, 2.0);
        assert!(default_policy.non_retryable.is_empty());
    }

    #[test]
    fn retry_policy_custom() {
        let retry_policy = RetryPolicy::builder()
            .max_attempts(3)
            .initial_interval_ms(500)
            .max_interval_ms(5_000)
            .backoff_coefficient(1.5)
            .non_retryable("bad_input")
            .build()
            .unwrap();

        assert_eq!(retry_policy.max_attempts, Some(3));
        assert_eq!(retry_policy.initial_interval_ms, 500);
        assert_eq!(retry_policy.max_interval_ms, 5_000);
        assert_eq!(retry_policy.backoff_coefficient, 1.5);
        assert_eq!(retry_policy.non_retryable, ["bad_input"]);
    }

    #[test]
    fn delay_grows_exponentially_to_cap() {
        let retry_policy = RetryPolicy::builder()
            .initial_interval_ms(1_000)
            .max_interval_ms(4_000)
            .backoff_coefficient(2.0)
            .build()
            .unwrap();

        assert_eq!(retry_policy.next_delay(1).get_milliseconds(), 1_000);
        assert_eq!(retry_policy.next_delay(2).get_milliseconds(), 2_000);
        assert_eq!(retry_policy.next_delay(3).get_milliseconds(), 4_000);
        assert_eq!(retry_policy.next_delay(4).get_milliseconds(), 4_000);
    }

    #[test]
    fn bounded_attempts_stop_retries() {
        let retry_policy = RetryPolicy::builder().max_attempts(3).build().unwrap();

        assert!(retry_policy.should_retry("transport", 1));
        assert!(retry_policy.should_retry("transport", 2));
        assert!(!retry_policy.should_retry("transport", 3));
    }

    #[test]
    fn unlimited_attempts_always_retry() {
        let retry_policy = RetryPolicy::builder().unlimited_attempts().build().unwrap();

        assert!(retry_policy.should_retry("transport", 1_000));
    }

    #[test]
    fn non_retryable_code_short_circuits() {
        let retry_policy = RetryPolicy::builder()
            .max_attempts(5)
            .non_retryable("bad_input")
            .build()
            .unwrap();

        assert!(!retry_policy.should_retry("bad_input", 1));
        assert!(retry_policy.should_retry("transport", 1));
    }

    #[test]
    fn invalid_configuration_fails_fast() {
        assert!(matches!(
            RetryPolicy::builder().initial_interval_ms(-1).build(),
            Err(Error::NegativeInterval(-1))
        ));
        assert!(matches!(
            RetryPolicy::builder().max_interval_ms(-10).build(),
            Err(Error::NegativeInterval(-10))
        ));
        assert!(matches!(
            RetryPolicy::builder().backoff_coefficient(0.0).build(),
            Err(Error::NonPositiveCoefficient(_))
        ));
        assert!(matches!(
            RetryPolicy::builder().max_attempts(0).build(),
            Err(Error::ZeroMaxAttempts)
        ));
    }
}
