//! Error types for tandem-core.

use std::time::Duration;

use thiserror::Error;

use crate::exception::Exception;

/// Result type for tandem-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tandem-core.
#[derive(Debug, Error)]
pub enum Error {
    /// IPC communication error with a worker endpoint.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// The worker could not be spawned or never signalled readiness.
    #[error("worker did not start: {0}")]
    WorkerStartup(String),

    /// The worker went away before answering.
    #[error("worker exited unexpectedly: {0}")]
    WorkerExited(String),

    /// The configured deadline elapsed; the worker has been terminated.
    #[error("operation timeout after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The task was aborted by the caller.
    #[error("task aborted")]
    Aborted,

    /// The invoked function threw or rejected.
    #[error(transparent)]
    Remote(Exception),

    /// The caller misused a handle or referenced stale state.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Send on a channel that is no longer open.
    #[error("the channel is closed")]
    ChannelClosed,

    /// The pool was shut down while the caller was waiting.
    #[error("worker pool has been shut down")]
    PoolShutdown,

    /// Encoding or decoding of a wire value failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl Error {
    /// Convert into an error object that can be shipped across the boundary.
    ///
    /// Remote errors pass through untouched; timeouts and aborts become the
    /// `DOMException` kinds a script would see for the same condition.
    pub fn into_exception(self) -> Exception {
        match self {
            Self::Remote(exception) => exception,
            Self::Timeout(_) => Exception::dom("TimeoutError", self.to_string()),
            Self::Aborted => Exception::dom("AbortError", "This operation was aborted"),
            other => Exception::new(other.to_string()),
        }
    }

    /// Message with a recovery hint, for command-line output.
    pub fn with_hint(&self) -> String {
        let hint = match self {
            Self::WorkerStartup(_) => Some(
                "build the worker with `cargo build -p tandem-worker` or set TANDEM_WORKER_PATH",
            ),
            Self::Timeout(_) => Some("raise --timeout or check the function for a hang"),
            Self::Config(_) => Some("check the TANDEM_* environment variables"),
            _ => None,
        };
        match hint {
            Some(hint) => format!("{}\n  hint: {}", self, hint),
            None => self.to_string(),
        }
    }

    /// Whether the failure came from the transport rather than the callee.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Ipc(_) | Self::WorkerStartup(_) | Self::WorkerExited(_) | Self::Io(_)
        )
    }
}
