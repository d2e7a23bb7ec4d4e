use thiserror::Error;

/// Failures at the transport seam.
///
/// The distinction that matters downstream is retryability: `Transient`
/// failures go back through the retry schedule, `Refused` is permanent and
/// short-circuits it, `RetriesExhausted` is what the dispatcher reports once
/// the schedule runs dry.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The surface's link is not up; nothing can leave the process on it.
    #[error("link down on {surface}")]
    LinkDown { surface: String },

    /// The platform refused the message outright (unknown recipient,
    /// oversized payload, revoked credentials). Retrying cannot help.
    #[error("{surface} refused the message: {reason}")]
    Refused { surface: String, reason: String },

    /// A failure worth retrying: network hiccup, rate limit, flapping link.
    #[error("transient failure on {surface}: {reason}")]
    Transient { surface: String, reason: String },

    /// Every attempt in the retry schedule failed.
    #[error("delivery to {to} via {surface} gave up after {attempts} attempts")]
    RetriesExhausted {
        surface: String,
        to: String,
        attempts: u32,
    },
}

impl TransportError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Transient { .. } | TransportError::LinkDown { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refusal_is_not_retryable() {
        let e = TransportError::Refused {
            surface: "webchat".into(),
            reason: "payload too large".into(),
        };
        assert!(!e.is_retryable());
    }

    #[test]
    fn transient_and_link_down_are_retryable() {
        assert!(TransportError::Transient {
            surface: "telegram".into(),
            reason: "429".into()
        }
        .is_retryable());
        assert!(TransportError::LinkDown {
            surface: "telegram".into()
        }
        .is_retryable());
    }
}
