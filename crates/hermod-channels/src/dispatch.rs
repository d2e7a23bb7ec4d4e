//! Delivery dispatcher: pushes reply blocks out through a transport.
//!
//! Retryable failures walk the delivery retry schedule; a permanent refusal
//! short-circuits it. When the schedule runs dry the failure surfaces as
//! `RetriesExhausted` and a minimal notice is attempted on the originating
//! surface so the conversation does not go silently dark.
//!
//! The dispatcher also honours the transport's capability set: a surface
//! that cannot attach media gets the URLs folded into the text body instead
//! of losing them.

use tokio::time::sleep;
use tracing::{info, warn};

use crate::{
    error::TransportError,
    retry::RetryPolicy,
    transport::Transport,
    types::OutboundMessage,
};

pub struct DeliveryDispatcher {
    policy: RetryPolicy,
}

impl DeliveryDispatcher {
    pub fn new() -> Self {
        Self {
            policy: RetryPolicy::delivery(),
        }
    }

    pub fn with_policy(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Deliver one message through `transport`, retrying per the schedule.
    pub async fn deliver(
        &self,
        transport: &(dyn Transport + Send + Sync),
        msg: &OutboundMessage,
    ) -> Result<(), TransportError> {
        let rendered = render_for(transport, msg);
        let mut attempts = 0u32;

        loop {
            match transport.push(&rendered).await {
                Ok(()) => {
                    if attempts > 0 {
                        info!(surface = %msg.surface, to = %msg.to, attempts, "delivered after retry");
                    }
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => {
                    warn!(surface = %msg.surface, to = %msg.to, error = %e, "permanent delivery failure");
                    return Err(e);
                }
                Err(e) => {
                    attempts += 1;
                    warn!(
                        surface = %msg.surface,
                        to = %msg.to,
                        attempts,
                        budget = self.policy.budget,
                        error = %e,
                        "delivery attempt failed"
                    );
                    if self.policy.exhausted(attempts) {
                        return Err(TransportError::RetriesExhausted {
                            surface: msg.surface.clone(),
                            to: msg.to.clone(),
                            attempts,
                        });
                    }
                    sleep(self.policy.delay_for(&msg.to, attempts - 1)).await;
                }
            }
        }
    }

    /// Deliver, and on failure attempt a minimal notice on the same surface.
    pub async fn deliver_or_notify(
        &self,
        transport: &(dyn Transport + Send + Sync),
        msg: &OutboundMessage,
    ) {
        if let Err(e) = self.deliver(transport, msg).await {
            warn!(surface = %msg.surface, to = %msg.to, error = %e, "delivery failed; sending minimal notice");
            let notice = OutboundMessage {
                surface: msg.surface.clone(),
                to: msg.to.clone(),
                text: "\u{26a0} Reply could not be delivered in full.".to_string(),
                media_urls: Vec::new(),
            };
            if let Err(e) = transport.push(&notice).await {
                warn!(surface = %msg.surface, error = %e, "failure notice also undeliverable");
            }
        }
    }
}

impl Default for DeliveryDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Adapt a message to the surface's capability set. Surfaces without media
/// support get the URLs appended as plain lines.
fn render_for(transport: &(dyn Transport + Send + Sync), msg: &OutboundMessage) -> OutboundMessage {
    if msg.media_urls.is_empty() || transport.caps().media {
        return msg.clone();
    }
    let mut text = msg.text.clone();
    for url in &msg.media_urls {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(url);
    }
    OutboundMessage {
        surface: msg.surface.clone(),
        to: msg.to.clone(),
        text,
        media_urls: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportCaps;
    use crate::types::LinkHealth;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingTransport {
        fail_first: u32,
        refuse: bool,
        media: bool,
        pushes: AtomicU32,
        sent: Mutex<Vec<OutboundMessage>>,
    }

    impl RecordingTransport {
        fn new(fail_first: u32) -> Self {
            Self {
                fail_first,
                refuse: false,
                media: true,
                pushes: AtomicU32::new(0),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn surface(&self) -> &str {
            "webchat"
        }

        fn caps(&self) -> TransportCaps {
            TransportCaps {
                media: self.media,
                live_updates: false,
            }
        }

        async fn set_link(&mut self, _up: bool) -> Result<(), TransportError> {
            Ok(())
        }

        async fn push(&self, msg: &OutboundMessage) -> Result<(), TransportError> {
            let n = self.pushes.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                if self.refuse {
                    return Err(TransportError::Refused {
                        surface: "webchat".into(),
                        reason: "too big".into(),
                    });
                }
                return Err(TransportError::Transient {
                    surface: "webchat".into(),
                    reason: "hiccup".into(),
                });
            }
            self.sent.lock().unwrap().push(msg.clone());
            Ok(())
        }

        fn health(&self) -> LinkHealth {
            LinkHealth::Up
        }
    }

    fn fast() -> DeliveryDispatcher {
        DeliveryDispatcher::with_policy(RetryPolicy {
            initial: Duration::from_millis(10),
            cap: Duration::from_millis(40),
            budget: 3,
            jitter_permille: 0,
        })
    }

    fn msg(text: &str) -> OutboundMessage {
        OutboundMessage {
            surface: "webchat".into(),
            to: "u1".into(),
            text: text.into(),
            media_urls: Vec::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let t = RecordingTransport::new(2);
        fast().deliver(&t, &msg("hello")).await.unwrap();
        assert_eq!(t.pushes.load(Ordering::SeqCst), 3);
        assert_eq!(t.sent.lock().unwrap()[0].text, "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn refusal_short_circuits_the_schedule() {
        let mut t = RecordingTransport::new(u32::MAX);
        t.refuse = true;
        let err = fast().deliver(&t, &msg("hello")).await.unwrap_err();
        assert!(matches!(err, TransportError::Refused { .. }));
        assert_eq!(t.pushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_the_attempt_count() {
        let t = RecordingTransport::new(u32::MAX);
        let err = fast().deliver(&t, &msg("hello")).await.unwrap_err();
        let TransportError::RetriesExhausted { attempts, to, .. } = err else {
            panic!("expected RetriesExhausted, got {err:?}");
        };
        assert_eq!(attempts, 3);
        assert_eq!(to, "u1");
        assert_eq!(t.pushes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_delivery_sends_notice() {
        let t = RecordingTransport::new(3); // all scheduled pushes fail, notice lands
        fast().deliver_or_notify(&t, &msg("payload")).await;
        let sent = t.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].text.contains("could not be delivered"));
    }

    #[tokio::test]
    async fn media_folds_into_text_for_incapable_surfaces() {
        let mut t = RecordingTransport::new(0);
        t.media = false;
        let mut m = msg("see the chart");
        m.media_urls = vec!["https://example.com/c.png".into()];

        fast().deliver(&t, &m).await.unwrap();
        let sent = t.sent.lock().unwrap();
        assert_eq!(sent[0].text, "see the chart\nhttps://example.com/c.png");
        assert!(sent[0].media_urls.is_empty());
    }

    #[tokio::test]
    async fn media_passes_through_for_capable_surfaces() {
        let t = RecordingTransport::new(0);
        let mut m = msg("see the chart");
        m.media_urls = vec!["https://example.com/c.png".into()];

        fast().deliver(&t, &m).await.unwrap();
        let sent = t.sent.lock().unwrap();
        assert_eq!(sent[0].media_urls, vec!["https://example.com/c.png"]);
    }
}
