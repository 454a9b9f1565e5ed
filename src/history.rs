//! Durable event history.
//!
//! Every state mutation the workflow state machine makes is caused by an
//! [`Event`], and the event is recorded to a [`HistoryStore`] *before* the
//! mutation is applied. Because the live machine and [`replay`] share the
//! same apply function, folding a recorded history reconstructs the exact
//! state the machine held, including timestamps — this is what makes
//! crash-and-replay recovery correct.
//!
//! The storage engine itself is out of scope; [`InMemoryHistory`] is the
//! default implementation and the seam a transactional store would plug
//! into.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::workflow::{Output, Phase, RunError, Signal, WorkflowInput, WorkflowState};

/// A type alias for history operation results.
pub type Result<T> = std::result::Result<T, Error>;

/// History errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying store rejected the operation.
    #[error("history store error: {0}")]
    Storage(String),

    /// A replayed history did not begin with a start event.
    #[error("history for `{0}` does not begin with a start event")]
    MissingStart(String),

    /// A replayed event violated a state invariant.
    #[error(transparent)]
    Invariant(#[from] crate::workflow::InvariantViolation),
}

/// The cause of a single state transition.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum Event {
    /// The workflow was started with the given validated input.
    Started {
        /// The immutable start input.
        input: WorkflowInput,
    },

    /// The workflow advanced to a new phase.
    PhaseChanged {
        /// The phase entered.
        phase: Phase,
    },

    /// The greeting activity completed and its result was finalized.
    GreetingSet {
        /// The finalized greeting.
        greeting: String,
    },

    /// The processing activity completed and its result was finalized.
    MessageProcessed {
        /// The finalized processed message.
        message: String,
    },

    /// A signal was consumed at a phase boundary.
    SignalApplied {
        /// Ingestion-assigned sequence number.
        seq: u64,

        /// The signal itself.
        signal: Signal,

        /// Whether the signal changed pending input, or was a recorded no-op
        /// because its target was already finalized.
        effective: bool,
    },

    /// The workflow reached its terminal success state.
    Completed {
        /// The assembled final result.
        output: Output,
    },

    /// The workflow reached its terminal failure state.
    Failed {
        /// The structured failure reason.
        reason: RunError,
    },
}

/// An [`Event`] stamped at record time.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Recorded {
    /// When the event was recorded.
    pub at: Timestamp,

    /// The event itself.
    pub event: Event,
}

impl Recorded {
    /// Stamps an event with the current time.
    pub fn now(event: Event) -> Self {
        Self {
            at: Timestamp::now(),
            event,
        }
    }
}

/// Store for per-workflow event histories.
///
/// Implementations must persist an event durably before returning from
/// [`record`](HistoryStore::record); the state machine acknowledges a
/// transition only after the record call succeeds.
pub trait HistoryStore: Send + Sync + 'static {
    /// Appends an event to the given workflow's history.
    fn record(&self, workflow_id: &str, event: Recorded) -> Result<()>;

    /// Returns the given workflow's history in record order.
    fn events(&self, workflow_id: &str) -> Result<Vec<Recorded>>;
}

/// An in-memory, mutex-guarded history store.
#[derive(Clone, Default)]
pub struct InMemoryHistory {
    histories: Arc<Mutex<HashMap<String, Vec<Recorded>>>>,
}

impl InMemoryHistory {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryStore for InMemoryHistory {
    fn record(&self, workflow_id: &str, event: Recorded) -> Result<()> {
        let mut histories = self
            .histories
            .lock()
            .map_err(|_| Error::Storage("history lock poisoned".to_string()))?;

        histories
            .entry(workflow_id.to_string())
            .or_default()
            .push(event);

        Ok(())
    }

    fn events(&self, workflow_id: &str) -> Result<Vec<Recorded>> {
        let histories = self
            .histories
            .lock()
            .map_err(|_| Error::Storage("history lock poisoned".to_string()))?;

        Ok(histories.get(workflow_id).cloned().unwrap_or_default())
    }
}

/// Reconstructs workflow state by folding a recorded history.
///
/// Applies each event with the same function the live state machine uses;
/// an identical event order yields the identical state.
pub fn replay(workflow_id: &str, events: &[Recorded]) -> Result<WorkflowState> {
    let mut events = events.iter();

    let mut state = match events.next() {
        Some(Recorded {
            at,
            event: Event::Started { input },
        }) => WorkflowState::started(workflow_id, input.clone(), *at),
        _ => return Err(Error::MissingStart(workflow_id.to_string())),
    };

    for recorded in events {
        state.apply(recorded)?;
    }

    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> WorkflowInput {
        WorkflowInput {
            user_identifier: "Ferris".to_string(),
            custom_message: None,
            text_payload: "hello".to_string(),
            uppercase: false,
        }
    }

    #[test]
    fn records_in_order() {
        let store = InMemoryHistory::new();

        store
            .record("wf-1", Recorded::now(Event::Started { input: input() }))
            .unwrap();
        store
            .record(
                "wf-1",
                Recorded::now(Event::PhaseChanged {
                    phase: Phase::Greeting,
                }),
            )
            .unwrap();

        let events = store.events("wf-1").unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0].event, Event::Started { .. }));
        assert!(matches!(
            events[1].event,
            Event::PhaseChanged {
                phase: Phase::Greeting
            }
        ));

        assert!(store.events("wf-2").unwrap().is_empty());
    }

    #[test]
    fn replay_requires_start_event() {
        let err = replay("wf-1", &[]).unwrap_err();
        assert!(matches!(err, Error::MissingStart(_)));
    }

    #[test]
    fn replay_folds_to_final_state() {
        let history = vec![
            Recorded::now(Event::Started { input: input() }),
            Recorded::now(Event::PhaseChanged {
                phase: Phase::Greeting,
            }),
            Recorded::now(Event::GreetingSet {
                greeting: "Hello, Ferris! Welcome to the Slackagent workflow!".to_string(),
            }),
            Recorded::now(Event::SignalApplied {
                seq: 1,
                signal: Signal::TextPayload("updated".to_string()),
                effective: true,
            }),
            Recorded::now(Event::PhaseChanged {
                phase: Phase::Processing,
            }),
            Recorded::now(Event::MessageProcessed {
                message: "Processed: updated".to_string(),
            }),
            Recorded::now(Event::PhaseChanged {
                phase: Phase::Finalizing,
            }),
        ];

        let state = replay("wf-1", &history).unwrap();
        assert_eq!(state.phase, Phase::Finalizing);
        assert_eq!(state.pending.text_payload, "updated");
        assert_eq!(
            state.greeting.as_deref(),
            Some("Hello, Ferris! Welcome to the Slackagent workflow!")
        );
        assert_eq!(state.processed_message.as_deref(), Some("Processed: updated"));
        assert_eq!(state.signal_log.len(), 1);
        assert_eq!(state.last_updated, Some(history.last().unwrap().at));
    }

    #[test]
    fn replay_rejects_phase_regression() {
        let history = vec![
            Recorded::now(Event::Started { input: input() }),
            Recorded::now(Event::PhaseChanged {
                phase: Phase::Processing,
            }),
            Recorded::now(Event::PhaseChanged {
                phase: Phase::Greeting,
            }),
        ];

        let err = replay("wf-1", &history).unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
    }
}
