//! Error types for the aggregator agent.
//!
//! Every error except [`ConfigError`] is recoverable: it aborts one attempt,
//! is logged, and the next tick or trigger retries.

use thiserror::Error;

use crate::service::ManagedService;

/// Fatal startup configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `ELASTICSEARCH_TARGETS` was not a JSON array of targets.
    #[error("failed to parse ELASTICSEARCH_TARGETS: {0}")]
    InvalidTargets(#[source] serde_json::Error),
}

/// Config rendering failures.
#[derive(Debug, Error)]
pub enum RenderError {
    /// No downstream target with both url and user configured.
    #[error("no valid elasticsearch targets configured for {0}")]
    NoTargets(ManagedService),
}

/// Process manager failures. Messages carry the tool output verbatim.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The command ran and exited unsuccessfully.
    #[error("`{command}` failed ({status}): {output}")]
    CommandFailed {
        command: String,
        status: String,
        output: String,
    },

    /// The command could not be spawned, or a manifest file could not be written.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reconciliation attempt failures.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("render failed: {0}")]
    Render(#[from] RenderError),

    /// A required external dependency is absent.
    #[error("dependency `{0}` does not exist")]
    MissingDependency(String),

    #[error("process manager: {0}")]
    Process(#[from] ProcessError),
}

/// Config synchronizer failures.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport failure after all retries.
    #[error("transport error after {attempts} attempts: {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    /// 5xx after all retries.
    #[error("server error {status} after {attempts} attempts")]
    ServerError { status: u16, attempts: u32 },

    /// 4xx or other non-retriable response.
    #[error("non-retriable status {0}")]
    Rejected(u16),

    /// Response body did not match the expected envelope.
    #[error("failed to decode response: {0}")]
    Decode(#[source] reqwest::Error),

    /// Client construction failed.
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Live update channel failures.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid connect request: {0}")]
    Request(String),

    #[error("dial failed: {0}")]
    Dial(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("dial timed out")]
    DialTimeout,
}
