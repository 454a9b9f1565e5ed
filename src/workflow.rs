//! The workflow state machine.
//!
//! A workflow instance advances through a fixed, strictly ordered sequence of
//! phases, invoking one activity per activity-bearing phase through the
//! [gateway](crate::gateway). Between activity calls the machine merges
//! queued [signals](Signal) into its pending input and answers
//! [queries](Query) from a published snapshot, so external observers can
//! inspect and influence an in-flight run without ever touching its state
//! directly.
//!
//! ```text
//! Pending ──▶ Greeting ──▶ Processing ──▶ Finalizing ──▶ Completed
//!                 │             │              │
//!                 ╰─────────────┴──────────────┴────────▶ Failed
//! ```
//!
//! Every transition is caused by an [`Event`](crate::history::Event) which is
//! recorded to the history store before state is mutated; the machine and
//! [`replay`](crate::history::replay) share one apply function, making
//! crash-and-replay recovery deterministic by construction.

use jiff::{Span, Timestamp, ToSpan};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    activities::{Greet, GreetInput, ProcessInput, ProcessText},
    activity::{Activity, Request},
    gateway::{Failure, FailureKind, Gateway},
    history::{Event, HistoryStore, Recorded},
    retry::{Attempt, RetryPolicy},
};

/// A type alias for a workflow run's terminal result.
pub type RunResult = std::result::Result<Output, RunError>;

/// Phases of a workflow run, in their strict order.
///
/// A run's phase only ever advances through this order; [`Failed`](Phase::Failed)
/// is orthogonal and reachable from any non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
pub enum Phase {
    /// Created, no transition taken yet.
    Pending,

    /// The greeting activity is being invoked.
    Greeting,

    /// The processing activity is being invoked.
    Processing,

    /// The final result is being assembled.
    Finalizing,

    /// Terminal success.
    Completed,

    /// Terminal failure, reachable from any non-terminal phase.
    Failed,
}

impl Phase {
    /// Whether this phase is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Immutable input supplied when a workflow is started.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WorkflowInput {
    /// Who the workflow runs for.
    pub user_identifier: String,

    /// Optional custom salutation for the greeting.
    pub custom_message: Option<String>,

    /// Text to be processed.
    pub text_payload: String,

    /// Whether the processed message is upper-cased.
    pub uppercase: bool,
}

impl WorkflowInput {
    /// Validates required fields.
    ///
    /// Runs before any phase transition; a malformed input is never retried.
    pub fn validate(&self) -> std::result::Result<(), RunError> {
        if self.user_identifier.trim().is_empty() {
            return Err(RunError::Validation(
                "user_identifier must not be empty".to_string(),
            ));
        }

        if self.text_payload.trim().is_empty() {
            return Err(RunError::Validation(
                "text_payload must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

/// An asynchronous state update, applied at the next phase boundary.
///
/// Each kind targets one field of the pending input. A signal whose target
/// was already consumed is still recorded in the signal log but changes
/// nothing; this is a deliberate ordering guarantee, not an error.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum Signal {
    /// Replaces the greeting salutation, if the greeting is not yet final.
    CustomMessage(String),

    /// Replaces the text payload, if processing has not yet consumed it.
    TextPayload(String),

    /// Replaces the uppercase flag, if processing has not yet consumed it.
    Uppercase(bool),
}

/// A signal queued for a specific instance, ordered by ingestion sequence.
#[derive(Debug, Clone)]
pub(crate) struct SignalEnvelope {
    pub(crate) seq: u64,
    pub(crate) signal: Signal,
}

/// Audit record of a consumed signal.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SignalRecord {
    /// Ingestion-assigned sequence number; ties are impossible.
    pub seq: u64,

    /// The signal as received.
    pub signal: Signal,

    /// Whether the signal changed pending input.
    pub effective: bool,

    /// When the signal was consumed.
    pub received_at: Timestamp,
}

/// A synchronous, side-effect-free read of workflow state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Query {
    /// Returns only the current phase.
    Phase,

    /// Returns the phase and whatever result fields are set.
    State,
}

/// A point-in-time view of workflow state.
///
/// Snapshots are published by the state machine after every mutation;
/// reading one never blocks on activity completion and never mutates state.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Snapshot {
    /// Current phase.
    pub phase: Phase,

    /// The greeting, once finalized.
    pub greeting: Option<String>,

    /// The processed message, once finalized.
    pub processed_message: Option<String>,
}

/// The final result of a completed workflow.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Output {
    /// Who the workflow ran for.
    pub user_identifier: String,

    /// The finalized greeting.
    pub greeting: String,

    /// The finalized processed message.
    pub processed_message: String,

    /// Completion status, `"success"` for completed runs.
    pub status: String,

    /// Identity of the run that produced this result.
    pub workflow_id: String,
}

/// Structured reason a workflow reached [`Phase::Failed`].
///
/// This is the only failure shape clients observe; raw transport errors are
/// classified inside the gateway and never escape.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, thiserror::Error)]
pub enum RunError {
    /// The start input was malformed; no phase transition was taken.
    #[error("input validation failed: {0}")]
    Validation(String),

    /// An activity invocation reached a terminal failure.
    #[error("activity `{activity}` failed ({kind:?}) after {attempts} attempt(s): {message}")]
    Activity {
        /// Name of the failing activity.
        activity: String,

        /// Terminal failure classification.
        kind: FailureKind,

        /// The last underlying failure message.
        message: String,

        /// Dispatch attempts made.
        attempts: Attempt,
    },

    /// Cancellation was observed at a suspension boundary.
    #[error("workflow was cancelled")]
    Cancelled,

    /// The orchestration core itself failed (history store write, state
    /// invariant violation).
    #[error("internal orchestration error: {0}")]
    Internal(String),
}

/// A state mutation that would break a workflow invariant.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InvariantViolation {
    /// The phase order only ever advances.
    #[error("phase cannot move from {from:?} to {to:?}")]
    PhaseRegression {
        /// Phase before the rejected transition.
        from: Phase,

        /// Phase the event attempted to enter.
        to: Phase,
    },

    /// A field that is set exactly once was set again.
    #[error("`{0}` is already finalized")]
    AlreadyFinalized(&'static str),

    /// An event arrived in a phase where it is meaningless.
    #[error("event `{0}` is not valid in phase {1:?}")]
    UnexpectedEvent(&'static str, Phase),
}

/// The mutable record of one workflow instance.
///
/// Owned exclusively by its state machine; external influence arrives only
/// through the signal channel and is merged at phase boundaries.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WorkflowState {
    /// Identity of this instance.
    pub workflow_id: String,

    /// Current phase.
    pub phase: Phase,

    /// Set exactly once, when the greeting phase completes.
    pub greeting: Option<String>,

    /// Set exactly once, when the processing phase completes.
    pub processed_message: Option<String>,

    /// The not-yet-consumed input, as updated by effective signals.
    pub pending: WorkflowInput,

    /// Ordered audit log of consumed signals, effective or not.
    pub signal_log: Vec<SignalRecord>,

    /// Timestamp of the last applied event.
    pub last_updated: Option<Timestamp>,
}

impl WorkflowState {
    pub(crate) fn started(workflow_id: &str, input: WorkflowInput, at: Timestamp) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            phase: Phase::Pending,
            greeting: None,
            processed_message: None,
            pending: input,
            signal_log: Vec::new(),
            last_updated: Some(at),
        }
    }

    /// Applies one recorded event.
    ///
    /// This is the single mutation path shared by the live state machine and
    /// [`replay`](crate::history::replay).
    pub(crate) fn apply(
        &mut self,
        recorded: &Recorded,
    ) -> std::result::Result<(), InvariantViolation> {
        match &recorded.event {
            Event::Started { .. } => {
                return Err(InvariantViolation::UnexpectedEvent("Started", self.phase));
            }

            Event::PhaseChanged { phase: to } => self.advance(*to)?,

            Event::GreetingSet { greeting } => {
                if self.greeting.is_some() {
                    return Err(InvariantViolation::AlreadyFinalized("greeting"));
                }
                self.greeting = Some(greeting.clone());
            }

            Event::MessageProcessed { message } => {
                if self.processed_message.is_some() {
                    return Err(InvariantViolation::AlreadyFinalized("processed_message"));
                }
                self.processed_message = Some(message.clone());
            }

            Event::SignalApplied {
                seq,
                signal,
                effective,
            } => {
                if self.phase.is_terminal() {
                    return Err(InvariantViolation::UnexpectedEvent(
                        "SignalApplied",
                        self.phase,
                    ));
                }

                if *effective {
                    match signal {
                        Signal::CustomMessage(message) => {
                            self.pending.custom_message = Some(message.clone());
                        }
                        Signal::TextPayload(payload) => {
                            self.pending.text_payload = payload.clone();
                        }
                        Signal::Uppercase(uppercase) => {
                            self.pending.uppercase = *uppercase;
                        }
                    }
                }

                self.signal_log.push(SignalRecord {
                    seq: *seq,
                    signal: signal.clone(),
                    effective: *effective,
                    received_at: recorded.at,
                });
            }

            Event::Completed { .. } => {
                if self.phase != Phase::Finalizing {
                    return Err(InvariantViolation::UnexpectedEvent("Completed", self.phase));
                }
                self.phase = Phase::Completed;
            }

            Event::Failed { .. } => {
                if self.phase.is_terminal() {
                    return Err(InvariantViolation::UnexpectedEvent("Failed", self.phase));
                }
                self.phase = Phase::Failed;
            }
        }

        self.last_updated = Some(recorded.at);

        Ok(())
    }

    fn advance(&mut self, to: Phase) -> std::result::Result<(), InvariantViolation> {
        let regression = self.phase.is_terminal() || (to != Phase::Failed && to <= self.phase);
        if regression {
            return Err(InvariantViolation::PhaseRegression {
                from: self.phase,
                to,
            });
        }

        self.phase = to;

        Ok(())
    }

    /// Takes a point-in-time snapshot for query answering.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            phase: self.phase,
            greeting: self.greeting.clone(),
            processed_message: self.processed_message.clone(),
        }
    }
}

/// Per-activity invocation configuration used by the state machine.
#[derive(Debug, Clone)]
pub struct InvokeOptions {
    /// Per-attempt timeout.
    pub timeout: Span,

    /// Retry policy for the invocation.
    pub retry_policy: RetryPolicy,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self {
            timeout: 10.seconds(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MachineOptions {
    pub(crate) greet: InvokeOptions,
    pub(crate) process: InvokeOptions,
}

/// Drives one workflow instance from `Pending` to a terminal phase.
///
/// A machine executes strictly sequentially: phase transitions never
/// interleave, and its only suspension points are the gateway's dispatch
/// await and retry backoff. Signals are drained at phase boundaries only.
pub(crate) struct Machine {
    gateway: Gateway,
    history: Arc<dyn HistoryStore>,
    options: MachineOptions,
    state: WorkflowState,
    start_event: Option<Recorded>,
    signals: mpsc::UnboundedReceiver<SignalEnvelope>,
    snapshot: watch::Sender<Snapshot>,
    cancellation: CancellationToken,
}

impl Machine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        workflow_id: &str,
        input: WorkflowInput,
        gateway: Gateway,
        history: Arc<dyn HistoryStore>,
        options: MachineOptions,
        signals: mpsc::UnboundedReceiver<SignalEnvelope>,
        snapshot: watch::Sender<Snapshot>,
        cancellation: CancellationToken,
    ) -> Self {
        let start_event = Recorded::now(Event::Started {
            input: input.clone(),
        });
        let state = WorkflowState::started(workflow_id, input, start_event.at);

        Self {
            gateway,
            history,
            options,
            state,
            start_event: Some(start_event),
            signals,
            snapshot,
            cancellation,
        }
    }

    /// Runs the instance to a terminal phase and returns its result.
    #[instrument(skip(self), fields(workflow.id = %self.state.workflow_id))]
    pub(crate) async fn run(mut self) -> RunResult {
        match self.advance_to_completion().await {
            Ok(output) => {
                tracing::info!("Workflow completed");
                Ok(output)
            }

            Err(reason) => {
                tracing::warn!(%reason, "Workflow failed");

                // Terminal failure is itself a recorded transition; finalized
                // fields stay readable for audit and queries.
                let recorded = Recorded::now(Event::Failed {
                    reason: reason.clone(),
                });
                if let Err(err) = self
                    .history
                    .record(&self.state.workflow_id, recorded.clone())
                {
                    tracing::error!(%err, "Failed to record workflow failure");
                }
                if let Err(err) = self.state.apply(&recorded) {
                    tracing::error!(%err, "Failed to apply workflow failure");
                }
                self.publish();

                Err(reason)
            }
        }
    }

    async fn advance_to_completion(&mut self) -> RunResult {
        if let Some(started) = self.start_event.take() {
            self.history
                .record(&self.state.workflow_id, started)
                .map_err(|err| RunError::Internal(err.to_string()))?;
            self.publish();
        }

        self.transition(Phase::Greeting)?;
        let greeting = self.invoke_greeting().await?;
        self.record(Event::GreetingSet { greeting })?;

        self.transition(Phase::Processing)?;
        let message = self.invoke_processing().await?;
        self.record(Event::MessageProcessed { message })?;

        self.transition(Phase::Finalizing)?;
        let output = self.assemble_output()?;
        self.record(Event::Completed {
            output: output.clone(),
        })?;

        Ok(output)
    }

    /// Applies queued signals, then advances the phase.
    ///
    /// Cancellation is checked here because this is where the machine resumes
    /// after any suspension point.
    fn transition(&mut self, to: Phase) -> std::result::Result<(), RunError> {
        if self.cancellation.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        self.drain_signals()?;

        tracing::debug!(from = ?self.state.phase, ?to, "Phase transition");
        self.record(Event::PhaseChanged { phase: to })
    }

    fn drain_signals(&mut self) -> std::result::Result<(), RunError> {
        while let Ok(SignalEnvelope { seq, signal }) = self.signals.try_recv() {
            let effective = match &signal {
                Signal::CustomMessage(_) => self.state.greeting.is_none(),
                Signal::TextPayload(_) | Signal::Uppercase(_) => {
                    self.state.processed_message.is_none()
                }
            };

            tracing::debug!(seq, effective, "Consuming signal");
            self.record(Event::SignalApplied {
                seq,
                signal,
                effective,
            })?;
        }

        Ok(())
    }

    async fn invoke_greeting(&mut self) -> std::result::Result<String, RunError> {
        let input = GreetInput {
            user_identifier: self.state.pending.user_identifier.clone(),
            custom_message: self.state.pending.custom_message.clone(),
        };

        self.invoke(Greet::NAME, &input, self.options.greet.clone())
            .await
    }

    async fn invoke_processing(&mut self) -> std::result::Result<String, RunError> {
        // Uses the signal-current payload and flag, as of this boundary.
        let input = ProcessInput {
            text_payload: self.state.pending.text_payload.clone(),
            uppercase: self.state.pending.uppercase,
        };

        self.invoke(ProcessText::NAME, &input, self.options.process.clone())
            .await
    }

    async fn invoke<I: Serialize>(
        &mut self,
        activity: &str,
        input: &I,
        options: InvokeOptions,
    ) -> std::result::Result<String, RunError> {
        let payload =
            serde_json::to_value(input).map_err(|err| RunError::Internal(err.to_string()))?;

        let request = Request {
            activity: activity.to_string(),
            input: payload,
            timeout: options.timeout,
            retry_policy: options.retry_policy,
        };

        let output = self
            .gateway
            .invoke(request, &self.cancellation)
            .await
            .map_err(|failure| run_error(activity, failure))?;

        serde_json::from_value(output).map_err(|err| RunError::Internal(err.to_string()))
    }

    fn assemble_output(&self) -> std::result::Result<Output, RunError> {
        let greeting = self
            .state
            .greeting
            .clone()
            .ok_or_else(|| RunError::Internal("greeting missing at finalization".to_string()))?;
        let processed_message = self.state.processed_message.clone().ok_or_else(|| {
            RunError::Internal("processed message missing at finalization".to_string())
        })?;

        Ok(Output {
            user_identifier: self.state.pending.user_identifier.clone(),
            greeting,
            processed_message,
            status: "success".to_string(),
            workflow_id: self.state.workflow_id.clone(),
        })
    }

    fn record(&mut self, event: Event) -> std::result::Result<(), RunError> {
        let recorded = Recorded::now(event);

        // Persist the cause before acknowledging the transition.
        self.history
            .record(&self.state.workflow_id, recorded.clone())
            .map_err(|err| RunError::Internal(err.to_string()))?;
        self.state
            .apply(&recorded)
            .map_err(|err| RunError::Internal(err.to_string()))?;
        self.publish();

        Ok(())
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.state.snapshot());
    }
}

fn run_error(activity: &str, failure: Failure) -> RunError {
    match failure.kind {
        FailureKind::Cancelled => RunError::Cancelled,
        kind => RunError::Activity {
            activity: activity.to_string(),
            kind,
            message: failure.message,
            attempts: failure.attempts,
        },
    }
}
