use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunError {
    /// The incoming input was rejected by the backlog drop rule.
    #[error("input dropped by queue policy")]
    Dropped,

    /// The coordinator is shutting down and accepts no new work.
    #[error("coordinator is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, RunError>;
