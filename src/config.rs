//! Runtime configuration.
//!
//! Describes where the external orchestration service lives and which
//! namespace and task queue this process works against. The in-process
//! runtime carries these values as telemetry context; a remote
//! [`Transport`](crate::gateway::Transport) implementation would use them to
//! dial out.

use std::env;

const DEFAULT_SERVER_ADDRESS: &str = "localhost:7233";
const DEFAULT_NAMESPACE: &str = "default";
const DEFAULT_TASK_QUEUE: &str = "task_queue_1";

/// Connection and routing configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Address of the orchestration service.
    pub server_address: String,

    /// Namespace workflows run in.
    pub namespace: String,

    /// Task queue activities are dispatched on.
    pub task_queue: String,
}

impl Config {
    /// Reads configuration from the environment, falling back to defaults.
    ///
    /// Recognized variables are `HEADWAY_SERVER_ADDRESS`, `HEADWAY_NAMESPACE`
    /// and `HEADWAY_TASK_QUEUE`.
    pub fn from_env() -> Self {
        Self {
            server_address: env::var("HEADWAY_SERVER_ADDRESS")
                .unwrap_or_else(|_| DEFAULT_SERVER_ADDRESS.to_string()),
            namespace: env::var("HEADWAY_NAMESPACE")
                .unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string()),
            task_queue: env::var("HEADWAY_TASK_QUEUE")
                .unwrap_or_else(|_| DEFAULT_TASK_QUEUE.to_string()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_address: DEFAULT_SERVER_ADDRESS.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            task_queue: DEFAULT_TASK_QUEUE.to_string(),
        }
    }
}
