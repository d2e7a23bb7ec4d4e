use async_trait::async_trait;

use crate::{
    error::TransportError,
    types::{LinkHealth, OutboundMessage},
};

/// What a surface can render. Declared once per transport; the dispatcher
/// consults it before pushing (a surface without media support gets the URLs
/// folded into the text body instead of dropped).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportCaps {
    /// The surface can deliver media attachments alongside text.
    pub media: bool,
    /// The surface can render live-updating partial replies.
    pub live_updates: bool,
}

/// The seam between the core and a platform driver.
///
/// The core never speaks a chat protocol: a driver turns platform traffic
/// into `InboundEvent`s on its own ingest loop and consumes
/// [`OutboundMessage`]s here. Implementations must be `Send + Sync` so a
/// [`TransportSet`](crate::set::TransportSet) can drive them from multiple
/// Tokio tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Surface this transport serves (`"whatsapp"`, `"webchat"`, …).
    /// Unique within a [`TransportSet`](crate::set::TransportSet) and
    /// embedded verbatim in session keys.
    fn surface(&self) -> &str;

    /// Fixed capability set for this surface.
    fn caps(&self) -> TransportCaps {
        TransportCaps::default()
    }

    /// Bring the platform link up (`true`) or down (`false`).
    ///
    /// Taking a direction instead of separate connect/disconnect methods
    /// keeps drivers honest about the one piece of state they own; bringing
    /// a link down is best-effort and must not fail loudly.
    async fn set_link(&mut self, up: bool) -> Result<(), TransportError>;

    /// Push one outbound message. `&self` on purpose: a live transport sends
    /// concurrently without a mutable borrow.
    async fn push(&self, msg: &OutboundMessage) -> Result<(), TransportError>;

    /// Current link state without blocking.
    fn health(&self) -> LinkHealth;
}
