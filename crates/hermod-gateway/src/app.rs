use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use axum::{routing::get, routing::post, Router};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::info;

use hermod_channels::types::OutboundMessage;
use hermod_core::config::HermodConfig;
use hermod_gate::Gate;
use hermod_heartbeat::HeartbeatHandle;
use hermod_runs::RunCoordinator;
use hermod_sessions::SessionManager;

/// A named payload rewrite applied by webhook mappings before dispatch.
pub type TransformFn = dyn Fn(serde_json::Value) -> serde_json::Value + Send + Sync;

/// The reload unit: config plus everything derived from it. Swapped as one
/// `Arc` so a request sees a consistent view. Structural settings (bind
/// address, session scope, run limits) are fixed at startup; a reload takes
/// effect on gating, webhook mappings, and the gateway token.
pub struct ConfigSnapshot {
    pub config: HermodConfig,
    pub gate: Gate,
}

/// Central shared state, passed as `Arc<AppState>` to all Axum handlers and
/// ingest loops.
pub struct AppState {
    snapshot: RwLock<Arc<ConfigSnapshot>>,
    pub sessions: Arc<SessionManager>,
    pub coordinator: Arc<RunCoordinator>,
    pub heartbeat: HeartbeatHandle,
    /// Outbound senders per surface, registered by transport adapters.
    /// Key: surface name, value: the adapter's delivery queue.
    pub outbound: DashMap<String, mpsc::Sender<OutboundMessage>>,
    /// Named payload transforms referenced by webhook mappings.
    pub transforms: DashMap<String, Arc<TransformFn>>,
    /// Events refused by the gate since startup (observability only).
    pub gate_rejections: AtomicU64,
}

impl AppState {
    pub fn new(
        config: HermodConfig,
        sessions: Arc<SessionManager>,
        coordinator: Arc<RunCoordinator>,
        heartbeat: HeartbeatHandle,
    ) -> Self {
        let gate = Gate::new(&config.surfaces);
        Self {
            snapshot: RwLock::new(Arc::new(ConfigSnapshot { config, gate })),
            sessions,
            coordinator,
            heartbeat,
            outbound: DashMap::new(),
            transforms: DashMap::new(),
            gate_rejections: AtomicU64::new(0),
        }
    }

    /// A consistent view of the current config and gate.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        Arc::clone(&self.snapshot.read().unwrap())
    }

    /// Atomically swap in a validated config. In-flight requests keep the
    /// snapshot they started with.
    pub fn reload(&self, mut config: HermodConfig) {
        config.validate();
        let gate = Gate::new(&config.surfaces);
        *self.snapshot.write().unwrap() = Arc::new(ConfigSnapshot { config, gate });
        info!("configuration reloaded");
    }

    pub fn count_gate_rejection(&self) {
        self.gate_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Register a transport adapter's outbound queue under its surface name.
    pub fn register_outbound(&self, surface: &str, tx: mpsc::Sender<OutboundMessage>) {
        self.outbound.insert(surface.to_string(), tx);
    }

    /// Register a named payload transform for webhook mappings.
    pub fn register_transform(
        &self,
        name: &str,
        transform: impl Fn(serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    ) {
        self.transforms.insert(name.to_string(), Arc::new(transform));
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/hooks/wake", post(crate::http::hooks::wake_handler))
        .route("/hooks/agent", post(crate::http::hooks::agent_handler))
        .route("/hooks/{name}", post(crate::http::hooks::named_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
