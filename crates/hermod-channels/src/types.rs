use serde::{Deserialize, Serialize};

/// A message to be delivered to a transport surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Logical surface name (e.g. "whatsapp", "telegram", "webchat").
    pub surface: String,

    /// Platform-native identifier for the recipient (chat ID, number, …).
    pub to: String,

    /// Text content; already sliced to the transport's block size upstream.
    pub text: String,

    /// Media URLs extracted from the block by the event subscriber.
    #[serde(default)]
    pub media_urls: Vec<String>,
}

/// Non-blocking view of a transport's link to its platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkHealth {
    /// Ready to push and receive.
    Up,

    /// No link; pushes fail with `LinkDown`.
    Down,

    /// Link exists but is degraded (rate limited, partial platform outage).
    Impaired(String),
}

impl LinkHealth {
    pub fn is_up(&self) -> bool {
        !matches!(self, LinkHealth::Down)
    }
}
