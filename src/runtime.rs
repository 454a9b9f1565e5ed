//! Runtime that hosts workflow instances.
//!
//! The runtime owns the instance table and exposes the whole client
//! surface: idempotent [`start`](Runtime::start), fire-and-forget
//! [`signal`](Runtime::signal), side-effect-free [`query`](Runtime::query),
//! non-consuming [`await_result`](Runtime::await_result),
//! [`cancel`](Runtime::cancel) and graceful [`shutdown`](Runtime::shutdown).
//!
//! Each started instance runs as its own task; the runtime communicates with
//! it only through channels, so no client operation ever blocks on an
//! activity completing.
//!
//! # Example
//!
//! ```rust,no_run
//! use headway::{Runtime, WorkflowInput};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = Runtime::builder().build();
//!
//! let handle = runtime
//!     .start(
//!         "my-workflow-id",
//!         WorkflowInput {
//!             user_identifier: "John Doe".to_string(),
//!             custom_message: None,
//!             text_payload: "Welcome to Temporal workflows!".to_string(),
//!             uppercase: false,
//!         },
//!     )
//!     .await?;
//!
//! let output = handle.await_result(None).await??;
//! println!("{}", output.processed_message);
//! # Ok(())
//! # }
//! ```

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use jiff::Span;
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use ulid::Ulid;
use uuid::Uuid;

use crate::{
    activities::{Greet, ProcessText},
    config::Config,
    gateway::{ActivityRegistry, Gateway, Transport},
    history::{HistoryStore, InMemoryHistory},
    workflow::{
        InvokeOptions, Machine, MachineOptions, Phase, Query, RunResult, Signal, SignalEnvelope,
        Snapshot, WorkflowInput,
    },
    Activity,
};

/// A type alias for runtime operation results.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from client-facing runtime operations.
///
/// Distinct from [`RunError`](crate::workflow::RunError): these describe
/// rejected or failed *operations*, not the outcome of a run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The start input failed validation; no instance was created.
    #[error("invalid workflow input: {0}")]
    InvalidInput(String),

    /// A workflow with this ID already started with different input.
    #[error("workflow `{0}` already started with different input")]
    AlreadyExists(String),

    /// No instance is known under this ID.
    #[error("workflow `{0}` not found")]
    NotFound(String),

    /// The await deadline elapsed before the run reached a terminal phase.
    #[error("timed out awaiting workflow `{0}`")]
    TimedOut(String),

    /// The await timeout span does not convert to a non-negative duration.
    #[error("invalid await timeout: {0}")]
    InvalidTimeout(String),

    /// The instance task went away without publishing a result.
    #[error("workflow `{0}` terminated without publishing a result")]
    ResultUnavailable(String),

    /// The instance table lock was poisoned by a panicking holder.
    #[error("runtime state lock poisoned")]
    LockPoisoned,
}

struct Instance {
    input: WorkflowInput,
    signals: mpsc::UnboundedSender<SignalEnvelope>,
    snapshot: watch::Receiver<Snapshot>,
    result: watch::Receiver<Option<RunResult>>,
    cancellation: CancellationToken,
    next_seq: AtomicU64,
}

/// A bound reference to one started workflow instance.
///
/// Handles are cheap to clone and awaiting a result does not consume it;
/// every holder observes the same terminal outcome.
#[derive(Clone)]
pub struct WorkflowHandle {
    workflow_id: String,
    result: watch::Receiver<Option<RunResult>>,
}

impl WorkflowHandle {
    /// The workflow this handle is bound to.
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Waits for the run's terminal result.
    ///
    /// With a timeout, returns [`Error::TimedOut`] if the run has not
    /// terminated when the deadline elapses; the run itself keeps going.
    pub async fn await_result(&self, timeout: Option<Span>) -> Result<RunResult> {
        await_published(&self.workflow_id, self.result.clone(), timeout).await
    }
}

async fn await_published(
    workflow_id: &str,
    mut result: watch::Receiver<Option<RunResult>>,
    timeout: Option<Span>,
) -> Result<RunResult> {
    let wait = async {
        let published = result
            .wait_for(|published| published.is_some())
            .await
            .map_err(|_| Error::ResultUnavailable(workflow_id.to_string()))?
            .clone();

        published.ok_or_else(|| Error::ResultUnavailable(workflow_id.to_string()))
    };

    match timeout {
        Some(span) => {
            let deadline: std::time::Duration = span
                .try_into()
                .map_err(|err: jiff::Error| Error::InvalidTimeout(err.to_string()))?;

            tokio::time::timeout(deadline, wait)
                .await
                .map_err(|_| Error::TimedOut(workflow_id.to_string()))?
        }

        None => wait.await,
    }
}

/// Hosts workflow instances over a shared gateway and history store.
pub struct Runtime {
    gateway: Gateway,
    history: Arc<dyn HistoryStore>,
    options: MachineOptions,
    config: Config,
    instances: Mutex<HashMap<String, Instance>>,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
    shutdown: CancellationToken,
}

impl Runtime {
    /// Creates a new runtime builder.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Starts a workflow instance under a caller-chosen ID.
    ///
    /// Starting is idempotent: a second start with the same ID and an
    /// identical input returns a handle to the existing instance, even after
    /// it has terminated. The same ID with a different input is rejected
    /// with [`Error::AlreadyExists`].
    #[instrument(
        skip(self, input),
        fields(workflow.id = %workflow_id, task.queue = %self.config.task_queue),
        err
    )]
    pub async fn start(&self, workflow_id: &str, input: WorkflowInput) -> Result<WorkflowHandle> {
        if let Err(reason) = input.validate() {
            return Err(Error::InvalidInput(reason.to_string()));
        }

        let (machine, result_tx, handle) = {
            let mut instances = self.instances()?;

            if let Some(existing) = instances.get(workflow_id) {
                if existing.input == input {
                    tracing::debug!("Start is idempotent, returning existing handle");
                    return Ok(WorkflowHandle {
                        workflow_id: workflow_id.to_string(),
                        result: existing.result.clone(),
                    });
                }

                return Err(Error::AlreadyExists(workflow_id.to_string()));
            }

            let (signal_tx, signal_rx) = mpsc::unbounded_channel();
            let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot {
                phase: Phase::Pending,
                greeting: None,
                processed_message: None,
            });
            let (result_tx, result_rx) = watch::channel(None);
            let cancellation = self.shutdown.child_token();

            let machine = Machine::new(
                workflow_id,
                input.clone(),
                self.gateway.clone(),
                self.history.clone(),
                self.options.clone(),
                signal_rx,
                snapshot_tx,
                cancellation.clone(),
            );

            instances.insert(
                workflow_id.to_string(),
                Instance {
                    input,
                    signals: signal_tx,
                    snapshot: snapshot_rx,
                    result: result_rx.clone(),
                    cancellation,
                    next_seq: AtomicU64::new(0),
                },
            );

            let handle = WorkflowHandle {
                workflow_id: workflow_id.to_string(),
                result: result_rx,
            };

            (machine, result_tx, handle)
        };

        tracing::info!("Starting workflow");

        let mut tasks = self.tasks.lock().await;
        tasks.spawn(async move {
            let result = machine.run().await;
            result_tx.send_replace(Some(result));
        });

        Ok(handle)
    }

    /// Starts a workflow instance under a freshly generated ID.
    ///
    /// IDs are ULID-backed UUIDs, so they sort by creation time.
    pub async fn start_generated(&self, input: WorkflowInput) -> Result<WorkflowHandle> {
        let workflow_id = Uuid::from(Ulid::new()).to_string();
        self.start(&workflow_id, input).await
    }

    /// Queues a signal for an instance.
    ///
    /// Signals are merged at the instance's next phase boundary, in the
    /// order they were ingested here. A signal sent after the instance
    /// reached a terminal phase is acknowledged but lands nowhere.
    pub fn signal(&self, workflow_id: &str, signal: Signal) -> Result<()> {
        let instances = self.instances()?;
        let Some(instance) = instances.get(workflow_id) else {
            return Err(Error::NotFound(workflow_id.to_string()));
        };

        let seq = instance.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        if instance
            .signals
            .send(SignalEnvelope { seq, signal })
            .is_err()
        {
            tracing::debug!(seq, "Signal arrived after termination");
        }

        Ok(())
    }

    /// Answers a query from the instance's latest published snapshot.
    ///
    /// Never blocks on the instance and never mutates it; terminated
    /// instances keep answering with their final snapshot.
    pub fn query(&self, workflow_id: &str, query: Query) -> Result<Snapshot> {
        let instances = self.instances()?;
        let Some(instance) = instances.get(workflow_id) else {
            return Err(Error::NotFound(workflow_id.to_string()));
        };

        let snapshot = instance.snapshot.borrow().clone();

        Ok(match query {
            Query::Phase => Snapshot {
                phase: snapshot.phase,
                greeting: None,
                processed_message: None,
            },

            Query::State => snapshot,
        })
    }

    /// Waits for an instance's terminal result without consuming it.
    pub async fn await_result(&self, workflow_id: &str, timeout: Option<Span>) -> Result<RunResult> {
        let result = {
            let instances = self.instances()?;
            let Some(instance) = instances.get(workflow_id) else {
                return Err(Error::NotFound(workflow_id.to_string()));
            };

            instance.result.clone()
        };

        await_published(workflow_id, result, timeout).await
    }

    /// Requests cancellation of an instance.
    ///
    /// Cancellation is observed at the instance's next suspension boundary;
    /// phases that already completed keep their recorded results.
    pub fn cancel(&self, workflow_id: &str) -> Result<()> {
        let instances = self.instances()?;
        let Some(instance) = instances.get(workflow_id) else {
            return Err(Error::NotFound(workflow_id.to_string()));
        };

        tracing::info!(workflow.id = %workflow_id, "Cancelling workflow");
        instance.cancellation.cancel();

        Ok(())
    }

    /// Cancels all in-flight instances and waits for their tasks to settle.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down runtime");
        self.shutdown.cancel();

        let mut tasks = self.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
    }

    fn instances(&self) -> Result<MutexGuard<'_, HashMap<String, Instance>>> {
        self.instances.lock().map_err(|_| Error::LockPoisoned)
    }
}

/// Builds a [`Runtime`].
pub struct Builder {
    registry: ActivityRegistry,
    gateway: Option<Gateway>,
    history: Option<Arc<dyn HistoryStore>>,
    config: Config,
    greet: InvokeOptions,
    process: InvokeOptions,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            registry: ActivityRegistry::new(),
            gateway: None,
            history: None,
            config: Config::default(),
            greet: InvokeOptions::default(),
            process: InvokeOptions::default(),
        }
    }
}

impl Builder {
    /// Registers an activity handler on the in-process transport.
    ///
    /// When no activity is registered and no transport is provided, the
    /// built runtime registers [`Greet`] and [`ProcessText`] with their
    /// defaults.
    pub fn activity<A: Activity>(mut self, activity: A) -> Self {
        self.registry.register(activity);
        self
    }

    /// Dispatches activities over the given transport instead of the
    /// in-process registry.
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.gateway = Some(Gateway::new(transport));
        self
    }

    /// Records event histories to the given store instead of the in-memory
    /// default.
    pub fn history(mut self, history: impl HistoryStore) -> Self {
        self.history = Some(Arc::new(history));
        self
    }

    /// Sets connection and routing configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Sets invocation options for the greeting activity.
    pub fn greet_options(mut self, options: InvokeOptions) -> Self {
        self.greet = options;
        self
    }

    /// Sets invocation options for the processing activity.
    pub fn process_options(mut self, options: InvokeOptions) -> Self {
        self.process = options;
        self
    }

    /// Builds the runtime.
    pub fn build(mut self) -> Runtime {
        if self.gateway.is_none() && self.registry.is_empty() {
            self.registry.register(Greet);
            self.registry.register(ProcessText::default());
        }

        let gateway = match self.gateway {
            Some(gateway) => gateway,
            None => Gateway::new(self.registry),
        };

        let history = self
            .history
            .unwrap_or_else(|| Arc::new(InMemoryHistory::new()));

        Runtime {
            gateway,
            history,
            options: MachineOptions {
                greet: self.greet,
                process: self.process,
            },
            config: self.config,
            instances: Mutex::new(HashMap::new()),
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
            shutdown: CancellationToken::new(),
        }
    }
}
