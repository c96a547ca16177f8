use std::time::Duration;
use thiserror::Error;

/// Error type for every failure the pool can surface.
///
/// Job-level failures are delivered to callers as the `Err` arm of a
/// [`JobOutcome`](crate::JobOutcome); configuration failures abort pool
/// initialization or dispatch immediately and are never retried.
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("no workers left in the pool")]
    PoolExhausted,

    #[error("browser launch failed: {0}")]
    LaunchFailed(String),

    #[error("missing source url or file path")]
    MissingSource,

    #[error("invalid source: {0}")]
    InvalidSource(String),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("page error: {0}")]
    Page(String),

    #[error("screenshot capture failed: {0}")]
    Capture(String),

    #[error("screenshot produced an empty image")]
    EmptyImage,

    #[error("browser closed or crashed")]
    WorkerDisconnected,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("io error: {0}")]
    Io(String),

    #[error("completion channel dropped before delivery")]
    Delivery,
}

impl RenderError {
    /// Whether the scheduler's single top-level retry applies.
    ///
    /// Configuration problems (no executable, empty pool, failed launch) and
    /// request validation problems are deterministic; re-running them cannot
    /// help. Everything that depends on a live browser or the network is
    /// worth one more attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RenderError::Navigation(_)
                | RenderError::Page(_)
                | RenderError::Capture(_)
                | RenderError::EmptyImage
                | RenderError::WorkerDisconnected
                | RenderError::Timeout(_)
                | RenderError::Io(_)
                | RenderError::Delivery
        )
    }

    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            RenderError::Configuration(_)
                | RenderError::PoolExhausted
                | RenderError::LaunchFailed(_)
        )
    }
}

impl From<std::io::Error> for RenderError {
    fn from(err: std::io::Error) -> Self {
        RenderError::Io(err.to_string())
    }
}
