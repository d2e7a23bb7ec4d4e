use thiserror::Error;

#[derive(Debug, Error)]
pub enum HermodError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Session store error: {0}")]
    Store(String),

    #[error("Run error: {0}")]
    Run(String),

    #[error("Run timed out after {seconds}s")]
    RunTimeout { seconds: u64 },

    #[error("Delivery failed ({surface}): {reason}")]
    Delivery { surface: String, reason: String },

    #[error("Webhook mapping not found: {name}")]
    MappingNotFound { name: String },

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HermodError {
    /// Short error code string surfaced to HTTP clients and logs.
    pub fn code(&self) -> &'static str {
        match self {
            HermodError::Config(_) => "CONFIG_ERROR",
            HermodError::AuthFailed(_) => "AUTH_FAILED",
            HermodError::Session(_) => "SESSION_ERROR",
            HermodError::Store(_) => "STORE_ERROR",
            HermodError::Run(_) => "RUN_ERROR",
            HermodError::RunTimeout { .. } => "RUN_TIMEOUT",
            HermodError::Delivery { .. } => "DELIVERY_FAILED",
            HermodError::MappingNotFound { .. } => "MAPPING_NOT_FOUND",
            HermodError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            HermodError::Serialization(_) => "SERIALIZATION_ERROR",
            HermodError::Io(_) => "IO_ERROR",
            HermodError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, HermodError>;
