//! The activity invocation gateway.
//!
//! [`Gateway::invoke`] drives a single activity invocation to a terminal
//! outcome: it dispatches attempts through a [`Transport`], bounds each
//! attempt by the request's per-attempt timeout, backs off between attempts
//! per the request's retry policy, and classifies failures so callers only
//! ever observe a structured [`Failure`] rather than a raw transport error.
//!
//! The gateway holds no per-invocation state across calls and is cheap to
//! clone; it is safely shared by any number of concurrently executing
//! workflow instances.
//!
//! # Transports
//!
//! [`Transport`] is the seam to the external task queue. This crate ships
//! [`ActivityRegistry`], an in-process transport over a closed set of typed
//! handlers resolved at registration time. A remote broker client would
//! implement the same trait; either way, delivery is at-least-once and
//! handlers must tolerate duplicate execution.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    activity::{self, Activity, Request},
    retry::Attempt,
};

/// A type alias for gateway invocation results.
pub type Result<T> = std::result::Result<T, Failure>;

/// Error code reported when a dispatch names an unregistered activity.
pub const UNKNOWN_ACTIVITY_CODE: &str = "unknown_activity";

/// Error code reported when an attempt exceeds its timeout.
pub const TIMEOUT_CODE: &str = "activity_timeout";

/// Classification of a terminal invocation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum FailureKind {
    /// Transient failures recurred past the policy's attempt budget.
    RetryExhausted,

    /// The activity reported a non-retryable rejection.
    Permanent,

    /// Cancellation was observed at a suspension boundary.
    Cancelled,

    /// The request named an activity with no registered handler.
    UnknownActivity,
}

/// A terminal invocation failure.
///
/// Carries enough information for the caller to distinguish transient
/// exhaustion from a permanent rejection.
#[derive(Debug, Clone, Deserialize, Serialize, thiserror::Error)]
#[error("activity failed ({kind:?}) after {attempts} attempt(s): {message}")]
pub struct Failure {
    /// Why the invocation is terminal.
    pub kind: FailureKind,

    /// The last underlying failure message.
    pub message: String,

    /// How many dispatch attempts were made.
    pub attempts: Attempt,
}

impl Failure {
    fn cancelled(attempts: Attempt) -> Self {
        Self {
            kind: FailureKind::Cancelled,
            message: "invocation cancelled".to_string(),
            attempts,
        }
    }
}

/// Transport over which activity dispatches travel.
///
/// Implementations must assume at-least-once delivery: a dispatch whose
/// reply is lost will be re-issued by the gateway's retry loop.
pub trait Transport: Send + Sync + 'static {
    /// Dispatches one attempt of the named activity with the given payload.
    fn dispatch<'a>(
        &'a self,
        activity: &'a str,
        payload: Value,
    ) -> Pin<Box<dyn Future<Output = activity::Result<Value>> + Send + 'a>>;
}

trait ActivityHandler: Send + Sync {
    fn execute_json<'a>(
        &'a self,
        input: Value,
    ) -> Pin<Box<dyn Future<Output = activity::Result<Value>> + Send + 'a>>;
}

struct RegisteredActivity<A: Activity> {
    inner: A,
}

impl<A: Activity> ActivityHandler for RegisteredActivity<A> {
    fn execute_json<'a>(
        &'a self,
        input: Value,
    ) -> Pin<Box<dyn Future<Output = activity::Result<Value>> + Send + 'a>> {
        Box::pin(async move {
            let input: A::Input = serde_json::from_value(input).map_err(|err| {
                activity::Error::fatal(
                    "deserialize_input",
                    format!(
                        "Failed to deserialize input for activity `{}`: {err}",
                        A::NAME
                    ),
                )
            })?;

            let output = self.inner.execute(input).await?;

            serde_json::to_value(output).map_err(|err| {
                activity::Error::fatal(
                    "serialize_output",
                    format!(
                        "Failed to serialize output for activity `{}`: {err}",
                        A::NAME
                    ),
                )
            })
        })
    }
}

/// An in-process [`Transport`] over a closed set of typed handlers.
///
/// Handlers are resolved at registration time; dispatching a name that was
/// never registered fails with [`UNKNOWN_ACTIVITY_CODE`] rather than falling
/// back to any runtime lookup.
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    handlers: HashMap<String, Arc<dyn ActivityHandler>>,
}

impl ActivityRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an activity handler under its stable name.
    ///
    /// Registering a second handler for the same name replaces the first.
    pub fn register<A: Activity>(&mut self, activity: A) {
        self.handlers.insert(
            A::NAME.to_string(),
            Arc::new(RegisteredActivity { inner: activity }),
        );
    }

    /// Whether no handlers have been registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Transport for ActivityRegistry {
    fn dispatch<'a>(
        &'a self,
        activity: &'a str,
        payload: Value,
    ) -> Pin<Box<dyn Future<Output = activity::Result<Value>> + Send + 'a>> {
        let Some(handler) = self.handlers.get(activity).cloned() else {
            return Box::pin(async move {
                Err(activity::Error::fatal(
                    UNKNOWN_ACTIVITY_CODE,
                    format!("No activity handler registered for `{activity}`"),
                ))
            });
        };

        Box::pin(async move { handler.execute_json(payload).await })
    }
}

/// Stateless dispatcher of activity invocations over a shared transport.
#[derive(Clone)]
pub struct Gateway {
    transport: Arc<dyn Transport>,
}

impl Gateway {
    /// Creates a gateway over the given transport.
    pub fn new(transport: impl Transport) -> Self {
        Self {
            transport: Arc::new(transport),
        }
    }

    /// Invokes an activity to a terminal outcome.
    ///
    /// Attempts are issued sequentially, each bounded by the request's
    /// per-attempt timeout. An elapsed timeout drops the attempt's dispatch
    /// future, so a late reply can never be observed by the caller. Between
    /// attempts the gateway suspends for the policy's backoff delay.
    ///
    /// Cancellation is checked at every suspension boundary (the dispatch
    /// await and the backoff sleep) and yields a
    /// [`Cancelled`](FailureKind::Cancelled) failure.
    #[instrument(skip_all, fields(activity = %request.activity), err)]
    pub async fn invoke(&self, request: Request, cancellation: &CancellationToken) -> Result<Value> {
        let timeout: Duration = request
            .timeout
            .try_into()
            .map_err(|err: jiff::Error| Failure {
                kind: FailureKind::Permanent,
                message: format!("invalid activity timeout: {err}"),
                attempts: 0,
            })?;

        let mut attempt: Attempt = 0;
        loop {
            attempt += 1;

            if cancellation.is_cancelled() {
                return Err(Failure::cancelled(attempt - 1));
            }

            let outcome = tokio::select! {
                _ = cancellation.cancelled() => {
                    return Err(Failure::cancelled(attempt - 1));
                }

                outcome = tokio::time::timeout(
                    timeout,
                    self.transport.dispatch(&request.activity, request.input.clone()),
                ) => outcome,
            };

            let err = match outcome {
                Ok(Ok(output)) => return Ok(output),

                Ok(Err(err)) if err.code == UNKNOWN_ACTIVITY_CODE => {
                    return Err(Failure {
                        kind: FailureKind::UnknownActivity,
                        message: err.to_string(),
                        attempts: attempt,
                    });
                }

                Ok(Err(err)) if !err.retryable => {
                    tracing::error!(%err, "Activity reported a permanent rejection");
                    return Err(Failure {
                        kind: FailureKind::Permanent,
                        message: err.to_string(),
                        attempts: attempt,
                    });
                }

                Ok(Err(err)) => err,

                Err(_) => activity::Error::retryable(
                    TIMEOUT_CODE,
                    format!("Activity `{}` timed out", request.activity),
                ),
            };

            tracing::warn!(%err, attempt, "Activity attempt failed");

            if !request.retry_policy.should_retry(&err.code, attempt) {
                tracing::info!(attempt, "Retry policy exhausted");
                return Err(Failure {
                    kind: FailureKind::RetryExhausted,
                    message: err.to_string(),
                    attempts: attempt,
                });
            }

            let delay: Duration = request
                .retry_policy
                .next_delay(attempt)
                .try_into()
                .unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = cancellation.cancelled() => {
                    return Err(Failure::cancelled(attempt));
                }

                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Invokes a typed activity, using its own timeout and retry policy.
    pub async fn call<A: Activity>(
        &self,
        activity: &A,
        input: &A::Input,
        cancellation: &CancellationToken,
    ) -> Result<A::Output> {
        let request = Request::for_activity(activity, input).map_err(|err| Failure {
            kind: FailureKind::Permanent,
            message: format!("failed to serialize input for `{}`: {err}", A::NAME),
            attempts: 0,
        })?;

        let output = self.invoke(request, cancellation).await?;

        serde_json::from_value(output).map_err(|err| Failure {
            kind: FailureKind::Permanent,
            message: format!("failed to deserialize output of `{}`: {err}", A::NAME),
            attempts: 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use jiff::ToSpan;

    use super::*;
    use crate::retry::RetryPolicy;

    struct Echo;

    impl Activity for Echo {
        const NAME: &'static str = "echo";

        type Input = String;
        type Output = String;

        async fn execute(&self, input: Self::Input) -> activity::Result<Self::Output> {
            Ok(format!("echo:{input}"))
        }
    }

    #[derive(Clone)]
    struct AlwaysTransient {
        attempts: Arc<AtomicU32>,
    }

    impl Activity for AlwaysTransient {
        const NAME: &'static str = "always-transient";

        type Input = ();
        type Output = ();

        async fn execute(&self, _: Self::Input) -> activity::Result<Self::Output> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(activity::Error::retryable("transport", "simulated failure"))
        }

        fn retry_policy(&self) -> RetryPolicy {
            RetryPolicy::builder()
                .max_attempts(3)
                .initial_interval_ms(10)
                .build()
                .unwrap()
        }
    }

    #[derive(Clone)]
    struct Rejecting {
        attempts: Arc<AtomicU32>,
    }

    impl Activity for Rejecting {
        const NAME: &'static str = "rejecting";

        type Input = ();
        type Output = ();

        async fn execute(&self, _: Self::Input) -> activity::Result<Self::Output> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(activity::Error::fatal("bad_input", "cannot process"))
        }
    }

    struct Stuck;

    impl Activity for Stuck {
        const NAME: &'static str = "stuck";

        type Input = ();
        type Output = ();

        async fn execute(&self, _: Self::Input) -> activity::Result<Self::Output> {
            std::future::pending().await
        }

        fn retry_policy(&self) -> RetryPolicy {
            RetryPolicy::builder()
                .max_attempts(2)
                .initial_interval_ms(10)
                .build()
                .unwrap()
        }

        fn timeout(&self) -> jiff::Span {
            50.milliseconds()
        }
    }

    fn gateway_with<A: Activity>(activity: A) -> Gateway {
        let mut registry = ActivityRegistry::new();
        registry.register(activity);
        Gateway::new(registry)
    }

    #[tokio::test]
    async fn first_attempt_success() {
        let gateway = gateway_with(Echo);
        let token = CancellationToken::new();

        let output = gateway
            .call(&Echo, &"hello".to_string(), &token)
            .await
            .unwrap();
        assert_eq!(output, "echo:hello");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_attempted_exactly_max_times() {
        let attempts = Arc::new(AtomicU32::new(0));
        let activity = AlwaysTransient {
            attempts: attempts.clone(),
        };
        let gateway = gateway_with(activity.clone());
        let token = CancellationToken::new();

        let failure = gateway.call(&activity, &(), &token).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::RetryExhausted);
        assert_eq!(failure.attempts, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_rejection_short_circuits() {
        let attempts = Arc::new(AtomicU32::new(0));
        let activity = Rejecting {
            attempts: attempts.clone(),
        };
        let gateway = gateway_with(activity.clone());
        let token = CancellationToken::new();

        let failure = gateway.call(&activity, &(), &token).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Permanent);
        assert_eq!(failure.attempts, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_activity_is_terminal() {
        let gateway = Gateway::new(ActivityRegistry::new());
        let token = CancellationToken::new();

        let failure = gateway
            .call(&Echo, &"hello".to_string(), &token)
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::UnknownActivity);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_transient_and_exhausts() {
        let gateway = gateway_with(Stuck);
        let token = CancellationToken::new();

        let failure = gateway.call(&Stuck, &(), &token).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::RetryExhausted);
        assert_eq!(failure.attempts, 2);
        assert!(failure.message.contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_observed_during_backoff() {
        let attempts = Arc::new(AtomicU32::new(0));
        let activity = AlwaysTransient {
            attempts: attempts.clone(),
        };
        let gateway = gateway_with(activity.clone());
        let token = CancellationToken::new();

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            cancel.cancel();
        });

        let failure = gateway.call(&activity, &(), &token).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Cancelled);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
