//! The inbound pipeline: gate → session resolution → run submission →
//! reply forwarding.
//!
//! Transport adapters push normalised [`InboundEvent`]s into the ingest
//! queue; this module owns everything between the adapter and the agent.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hermod_agent::subscriber::ReplyEvent;
use hermod_channels::types::OutboundMessage;
use hermod_channels::DeliveryDispatcher;
use hermod_core::template::{expand, TemplateVars};
use hermod_core::types::InboundEvent;
use hermod_gate::GateVerdict;
use hermod_heartbeat::HeartbeatDelivery;
use hermod_runs::coordinator::SubmitOptions;

use crate::app::AppState;

/// Spawn the ingest loop over the transport event queue. Exits when the
/// queue closes or `shutdown` fires.
pub fn spawn_ingest(
    state: Arc<AppState>,
    mut events: mpsc::Receiver<InboundEvent>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => handle_inbound(&state, event).await,
                    None => break,
                }
            }
        }
        debug!("ingest loop stopped");
    })
}

/// Run one event through gate, session resolution, and the run coordinator.
pub async fn handle_inbound(state: &Arc<AppState>, event: InboundEvent) {
    let snapshot = state.snapshot();
    let hint = match snapshot.gate.check(&event) {
        GateVerdict::Accept(hint) => hint,
        GateVerdict::Reject(reason) => {
            state.count_gate_rejection();
            debug!(surface = %event.surface, %reason, "event rejected by gate");
            return;
        }
    };

    let resolved = state.sessions.resolve(&event, hint.group_id.as_deref(), Some(&hint.body_stripped));
    let surface = event.surface.as_str().to_string();
    let reply_to = event.reply_target().to_string();

    if resolved.was_reset {
        info!(session = %resolved.key, "reset trigger acknowledged");
        send_outbound(
            state,
            OutboundMessage {
                surface,
                to: reply_to,
                text: "Session reset.".to_string(),
                media_urls: Vec::new(),
            },
        )
        .await;
        return;
    }

    let (reply_tx, reply_rx) = mpsc::channel(64);
    spawn_reply_forwarder(Arc::clone(state), surface.clone(), reply_to, reply_rx);

    let text = match snapshot
        .config
        .surfaces
        .get(&surface)
        .and_then(|s| s.message_template.as_deref())
    {
        Some(template) => {
            let vars = TemplateVars::from_event(
                &event,
                &hint.body_stripped,
                &resolved.key,
                resolved.is_new,
            );
            expand(template, &vars, event.payload.as_ref())
        }
        None if hint.body_stripped.is_empty() => event.body.clone(),
        None => hint.body_stripped.clone(),
    };

    let outcome = state.coordinator.submit(
        &resolved.key,
        &text,
        SubmitOptions {
            surface: Some(surface),
            model: None,
            reply_tx,
        },
    );
    debug!(session = %resolved.key, ?outcome, "event submitted");
}

/// Forward a run's block stream to the surface's outbound queue. Partials and
/// tool summaries stay inside the core; adapters that want them subscribe
/// differently.
pub(crate) fn spawn_reply_forwarder(
    state: Arc<AppState>,
    surface: String,
    to: String,
    mut replies: mpsc::Receiver<ReplyEvent>,
) {
    tokio::spawn(async move {
        while let Some(evt) = replies.recv().await {
            if let ReplyEvent::Block { text, media_urls } = evt {
                send_outbound(
                    &state,
                    OutboundMessage {
                        surface: surface.clone(),
                        to: to.clone(),
                        text,
                        media_urls,
                    },
                )
                .await;
            }
        }
    });
}

async fn send_outbound(state: &Arc<AppState>, msg: OutboundMessage) {
    let Some(tx) = state.outbound.get(&msg.surface).map(|e| e.value().clone()) else {
        warn!(surface = %msg.surface, "no outbound queue for surface; reply dropped");
        return;
    };
    if tx.send(msg).await.is_err() {
        warn!("outbound queue closed; reply dropped");
    }
}

/// Heartbeat replies route through the same outbound queues.
impl HeartbeatDelivery for AppState {
    fn reply_sink(&self, session: &str, target: &str) -> mpsc::Sender<ReplyEvent> {
        let (tx, mut rx) = mpsc::channel(64);

        // Resolve the destination from the session record: `last` follows the
        // session's own surface, anything else names a surface explicitly.
        let record = self.sessions.get(session);
        let (surface, to) = match (target, record) {
            ("last", Some(s)) => (s.surface, s.to),
            (surface, Some(s)) => (surface.to_string(), s.to),
            (surface, None) => (surface.to_string(), String::new()),
        };

        let outbound = self
            .outbound
            .get(&surface)
            .map(|entry| entry.value().clone());
        tokio::spawn(async move {
            while let Some(evt) = rx.recv().await {
                if let ReplyEvent::Block { text, media_urls } = evt {
                    let Some(outbound) = &outbound else { continue };
                    let _ = outbound
                        .send(OutboundMessage {
                            surface: surface.clone(),
                            to: to.clone(),
                            text,
                            media_urls,
                        })
                        .await;
                }
            }
        });
        tx
    }
}

/// Breaks the construction cycle between the heartbeat scheduler (which needs
/// a delivery implementation) and `AppState` (which needs the scheduler's
/// handle). Until `bind` is called, heartbeat replies are discarded.
#[derive(Default)]
pub struct DeliveryProxy {
    inner: std::sync::OnceLock<Arc<AppState>>,
}

impl DeliveryProxy {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn bind(&self, state: Arc<AppState>) {
        let _ = self.inner.set(state);
    }
}

impl HeartbeatDelivery for DeliveryProxy {
    fn reply_sink(&self, session: &str, target: &str) -> mpsc::Sender<ReplyEvent> {
        match self.inner.get() {
            Some(state) => state.reply_sink(session, target),
            None => {
                let (tx, mut rx) = mpsc::channel(8);
                tokio::spawn(async move { while rx.recv().await.is_some() {} });
                tx
            }
        }
    }
}

/// Periodic idle sweep: evict sessions past their idle deadline unless a run
/// is active on them.
pub fn spawn_idle_sweep(state: Arc<AppState>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let coordinator = Arc::clone(&state.coordinator);
                    state
                        .sessions
                        .sweep_idle(&move |key| coordinator.is_active(key));
                }
            }
        }
    });
}

/// Drive an outbound queue through the delivery dispatcher and a transport
/// driver. One forwarding task per installed transport.
pub fn spawn_delivery(
    transport: Arc<dyn hermod_channels::Transport + Send + Sync>,
    mut queue: mpsc::Receiver<OutboundMessage>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let dispatcher = DeliveryDispatcher::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = queue.recv() => match msg {
                    Some(msg) => dispatcher.deliver_or_notify(transport.as_ref(), &msg).await,
                    None => break,
                }
            }
        }
    })
}
