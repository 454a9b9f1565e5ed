//! # Headway
//!
//! ⏩ Durable workflow orchestration as a deterministic state machine.
//!
//! ## Overview
//!
//! Headway runs long-lived workflows as strictly ordered state machines.
//! Each workflow instance advances through a fixed sequence of phases,
//! invoking one retryable activity per activity-bearing phase, and records
//! every transition as an event before applying it. Because the live machine
//! and [`replay`](crate::history::replay) share one apply function, an
//! instance's state can be rebuilt from its event history alone, at any
//! time, with an identical result.
//!
//! Key features:
//!
//! - **Deterministic replay:** Every state change is caused by a recorded
//!   event; folding the history reproduces the exact live state.
//! - **Retryable activities:** Side-effecting work runs behind a gateway
//!   with per-attempt timeouts, exponential backoff and non-retryable
//!   failure classification.
//! - **Signals:** External callers update in-flight input asynchronously;
//!   updates merge at phase boundaries, in ingestion order.
//! - **Queries:** Snapshot-backed reads that never block on an activity and
//!   never mutate state.
//! - **Idempotent starts:** Starting the same workflow ID with identical
//!   input returns a handle to the existing instance.
//! - **Cancellation:** Observed at suspension boundaries; completed phases
//!   keep their recorded results.
//!
//! # Examples
//!
//! Starting a workflow, nudging it with a signal, and awaiting its result:
//!
//! ```rust,no_run
//! use headway::{Query, Runtime, Signal, WorkflowInput};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = Runtime::builder().build();
//!
//!     let handle = runtime
//!         .start(
//!             "my-workflow-id",
//!             WorkflowInput {
//!                 user_identifier: "John Doe".to_string(),
//!                 custom_message: None,
//!                 text_payload: "Welcome to Temporal workflows!".to_string(),
//!                 uppercase: false,
//!             },
//!         )
//!         .await?;
//!
//!     runtime.signal("my-workflow-id", Signal::Uppercase(true))?;
//!
//!     let snapshot = runtime.query("my-workflow-id", Query::Phase)?;
//!     println!("Workflow is {:?}", snapshot.phase);
//!
//!     let output = handle.await_result(None).await??;
//!     println!("{}", output.processed_message);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Concepts
//!
//! Headway is composed of a few core concepts:
//!
//! - [Workflows](#workflows) are deterministic state machines over phases.
//! - [Activities](#activities) are retryable units of side-effecting work.
//! - [The gateway](#the-gateway) drives activity attempts to a terminal
//!   outcome.
//! - [Histories](#histories) make workflow state replayable.
//! - [The runtime](#the-runtime) hosts instances and exposes the client
//!   surface.
//!
//! ### Workflows
//!
//! A workflow instance owns a [`WorkflowState`](workflow::WorkflowState) and
//! advances it through [`Phase`]s in strict order; a failure at any point
//! moves it to the orthogonal `Failed` phase instead. State is mutated only
//! by applying recorded events, and external influence arrives only as
//! [`Signal`]s merged at phase boundaries.
//!
//! ### Activities
//!
//! An [`Activity`] is a named, typed unit of work with its own retry policy
//! and per-attempt timeout. Activities must tolerate duplicate execution:
//! delivery to the remote side is at-least-once.
//!
//! ### The gateway
//!
//! The [`Gateway`] dispatches invocation requests over a [`Transport`] and
//! owns the retry loop: per-attempt timeouts, backoff between attempts, and
//! classification of terminal failures. Workflow code never sees a raw
//! transport error.
//!
//! ### Histories
//!
//! Every event is recorded to a [`HistoryStore`] before the state machine
//! acknowledges it. [`replay`](history::replay) folds a recorded history
//! back into the state it produced.
//!
//! ### The runtime
//!
//! The [`Runtime`] hosts instances as tasks and exposes start, signal,
//! query, await-result, cancel and shutdown. Handles returned from start are
//! cheap to clone and awaiting a result never consumes it.

#![warn(clippy::all, nonstandard_style, future_incompatible, missing_docs)]

pub use crate::{
    activity::{Activity, Error as ActivityError, Request as ActivityRequest},
    config::Config,
    gateway::{ActivityRegistry, Gateway, Transport},
    history::HistoryStore,
    retry::RetryPolicy,
    runtime::{Runtime, WorkflowHandle},
    workflow::{Output, Phase, Query, RunError, RunResult, Signal, Snapshot, WorkflowInput},
};

pub mod activities;
pub mod activity;
pub mod config;
pub mod gateway;
pub mod history;
pub mod retry;
pub mod runtime;
pub mod workflow;
