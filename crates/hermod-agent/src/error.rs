use thiserror::Error;

/// Errors surfaced by agent runners.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The model/provider layer failed before or during streaming.
    #[error("provider error: {0}")]
    Provider(String),

    /// The run was cancelled before the agent finished.
    #[error("run cancelled")]
    Cancelled,

    /// The event channel closed while the run was still producing.
    #[error("event channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, AgentError>;
