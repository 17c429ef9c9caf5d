use console_sdk::ConsoleError;
use thiserror::Error;

/// Outcome of a single delta fetch that did not produce a page.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Caller-initiated abort. Not a failure; loops stop without retrying.
    #[error("fetch cancelled")]
    Cancelled,
    #[error(transparent)]
    Api(#[from] ConsoleError),
}

impl FetchError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled)
    }
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("invalid push url: {0}")]
    Url(#[from] url::ParseError),
    #[error("websocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("push channel closed: {0}")]
    Closed(String),
}

/// Errors surfaced to the UI for user-initiated actions.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Api(#[from] ConsoleError),
}
