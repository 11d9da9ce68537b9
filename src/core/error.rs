#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("http status error: {status} ({})", .detail.as_deref().unwrap_or("no detail"))]
    Status { status: u16, detail: Option<String> },

    #[error("network error: {0}")]
    Network(String),

    /// 信号流在没有终止信号的情况下结束
    #[error("transport closed without a terminal signal")]
    Disconnected,

    #[error("stream closed before any response body was received")]
    EmptyResponse,
}

impl TransportError {
    pub fn network(err: impl std::fmt::Display) -> Self {
        Self::Network(err.to_string())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("upload cancelled")]
    Cancelled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("worker task failed: {0}")]
    Internal(String),
}

/// A payload that could not be lifted into a [`ProgressEvent`](crate::core::events::ProgressEvent).
/// Never surfaced to callers.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed event payload: {reason}")]
pub struct MalformedEvent {
    pub reason: String,
}
