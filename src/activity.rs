//! Activities are units of remote, retryable, side-effecting work.
//!
//! The workflow state machine never performs I/O itself; all real work
//! happens inside activity handlers invoked through the
//! [gateway](crate::gateway). Handlers are expected to tolerate duplicate
//! execution: dispatch is at-least-once and a retried attempt may re-run a
//! handler whose earlier reply was lost.
//!
//! # Defining activities
//!
//! ```rust
//! use headway::{Activity, ActivityError};
//!
//! struct LookupEmail;
//!
//! impl Activity for LookupEmail {
//!     const NAME: &'static str = "lookup-email";
//!
//!     type Input = i64;
//!     type Output = String;
//!
//!     async fn execute(&self, user_id: Self::Input) -> headway::activity::Result<Self::Output> {
//!         if user_id <= 0 {
//!             return Err(ActivityError::fatal(
//!                 "invalid_user",
//!                 "user_id must be positive",
//!             ));
//!         }
//!
//!         Ok(format!("user-{user_id}@example.com"))
//!     }
//! }
//! ```

use std::{future::Future, result::Result as StdResult};

use jiff::{Span, ToSpan};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// A type alias for activity execution results.
pub type Result<T> = StdResult<T, Error>;

/// Standard activity error envelope.
///
/// The `retryable` flag is the handler's own verdict: `false` marks a
/// permanent rejection that short-circuits the retry policy.
#[derive(Debug, Clone, Deserialize, Serialize, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct Error {
    /// Stable activity-local error code.
    pub code: String,

    /// Human-readable description of the failure.
    pub message: String,

    /// Whether the failure should be retried.
    pub retryable: bool,

    /// Optional structured details.
    pub details: Option<serde_json::Value>,
}

impl Error {
    /// Creates a retryable activity error.
    pub fn retryable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: true,
            details: None,
        }
    }

    /// Creates a non-retryable activity error.
    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: false,
            details: None,
        }
    }

    /// Adds structured details to the error envelope.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Trait for activity handlers.
pub trait Activity: Send + Sync + 'static {
    /// Stable activity name.
    const NAME: &'static str;

    /// Input payload for this activity.
    type Input: DeserializeOwned + Serialize + Send + 'static;

    /// Output payload for this activity.
    type Output: DeserializeOwned + Serialize + Send + 'static;

    /// Executes the activity.
    fn execute(&self, input: Self::Input) -> impl Future<Output = Result<Self::Output>> + Send;

    /// Retry policy for this activity.
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    /// Per-attempt timeout for this activity.
    fn timeout(&self) -> Span {
        10.seconds()
    }
}

/// A one-shot activity invocation request.
///
/// Requests are immutable and never reused for a second invocation; the
/// gateway consumes one per [`invoke`](crate::gateway::Gateway::invoke).
#[derive(Debug, Clone)]
pub struct Request {
    /// Name of the activity to invoke.
    pub activity: String,

    /// Serialized input payload.
    pub input: serde_json::Value,

    /// Per-attempt timeout.
    pub timeout: Span,

    /// Policy governing attempts and backoff.
    pub retry_policy: RetryPolicy,
}

impl Request {
    /// Builds a request for a typed activity.
    pub fn for_activity<A: Activity>(
        activity: &A,
        input: &A::Input,
    ) -> StdResult<Self, serde_json::Error> {
        Ok(Self {
            activity: A::NAME.to_string(),
            input: serde_json::to_value(input)?,
            timeout: activity.timeout(),
            retry_policy: activity.retry_policy(),
        })
    }
}
