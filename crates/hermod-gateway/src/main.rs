use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use hermod_agent::event::{AgentEvent, AgentRunner, RunInput, RunRequest};
use hermod_core::config::{HermodConfig, SHUTDOWN_GRACE_SECS};
use hermod_gateway::app::{build_router, AppState};
use hermod_gateway::pipeline;
use hermod_heartbeat::HeartbeatScheduler;
use hermod_runs::RunCoordinator;
use hermod_sessions::{SessionManager, SessionStore};

#[derive(Parser)]
#[command(name = "hermod-gateway", about = "Multi-transport chat-to-agent gateway")]
struct Args {
    /// Path to hermod.toml (default: HERMOD_CONFIG or ~/.hermod/hermod.toml)
    #[arg(long)]
    config: Option<String>,
}

/// Development stand-in for the embedded agent. Real deployments construct
/// the gateway as a library and inject a provider-backed runner here.
struct DevRunner;

#[async_trait]
impl AgentRunner for DevRunner {
    async fn run(
        &self,
        request: RunRequest,
        events: mpsc::Sender<AgentEvent>,
        _inputs: mpsc::Receiver<RunInput>,
        cancel: CancellationToken,
    ) -> hermod_agent::error::Result<()> {
        let _ = events
            .send(AgentEvent::AgentStart {
                run_id: request.run_id,
            })
            .await;
        if !cancel.is_cancelled() {
            let _ = events
                .send(AgentEvent::MessageUpdate {
                    text: format!("(dev) received: {}", request.prompt),
                })
                .await;
            let _ = events.send(AgentEvent::MessageEnd).await;
        }
        let _ = events.send(AgentEvent::AgentEnd { stop_reason: None }).await;
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hermod=info,hermod_gateway=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = match HermodConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return 1;
        }
    };

    // No usable state directory is one of the two fatal conditions.
    let (store, doc) = match SessionStore::open(&config.session.state_dir) {
        Ok(opened) => opened,
        Err(e) => {
            error!(error = %e, state_dir = %config.session.state_dir, "cannot open session store");
            return 2;
        }
    };
    let store_writer = store.spawn_writer();
    let sessions = Arc::new(SessionManager::new(config.session.clone(), store, doc));

    let runner: Arc<dyn AgentRunner> = Arc::new(DevRunner);
    let coordinator = Arc::new(RunCoordinator::new(
        config.queue.clone(),
        config.runs.clone(),
        config.reply.clone(),
        runner,
        Arc::clone(&sessions),
    ));

    // The degraded flag is flipped by an operator/health integration; the
    // heartbeat scheduler backs off while it is set.
    let (_degraded_tx, degraded_rx) = watch::channel(false);
    let delivery = pipeline::DeliveryProxy::new();
    let scheduler = HeartbeatScheduler::new(
        &config.heartbeat.jobs,
        Arc::clone(&coordinator),
        Arc::clone(&sessions),
        Arc::clone(&delivery) as Arc<dyn hermod_heartbeat::HeartbeatDelivery>,
        degraded_rx,
    );
    let heartbeat = scheduler.handle();

    let state = Arc::new(AppState::new(
        config.clone(),
        Arc::clone(&sessions),
        Arc::clone(&coordinator),
        heartbeat,
    ));
    delivery.bind(Arc::clone(&state));

    let shutdown = CancellationToken::new();
    let (hb_shutdown_tx, hb_shutdown_rx) = watch::channel(false);
    tokio::spawn(scheduler.run(hb_shutdown_rx));
    pipeline::spawn_idle_sweep(Arc::clone(&state), shutdown.clone());

    // Transport adapters feed this queue; they are wired in by the embedding
    // application (each one also registers an outbound sender on AppState).
    let (_inbound_tx, inbound_rx) = mpsc::channel(256);
    pipeline::spawn_ingest(Arc::clone(&state), inbound_rx, shutdown.clone());

    let addr: SocketAddr =
        match format!("{}:{}", config.gateway.bind, config.gateway.port).parse() {
            Ok(addr) => addr,
            Err(e) => {
                error!(error = %e, "invalid bind address");
                return 1;
            }
        };
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, %addr, "cannot bind listener");
            return 1;
        }
    };
    info!(%addr, "hermod gateway listening");

    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupted_flag = Arc::clone(&interrupted);
    let serve_result = axum::serve(listener, build_router(Arc::clone(&state)))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            interrupted_flag.store(true, Ordering::SeqCst);
        })
        .await;

    // Drain: stop intake, give active runs a bounded grace period, cancel
    // stragglers, flush the session store.
    shutdown.cancel();
    let _ = hb_shutdown_tx.send(true);
    coordinator
        .shutdown(Duration::from_secs(SHUTDOWN_GRACE_SECS))
        .await;
    if let Err(e) = sessions.flush() {
        error!(error = %e, "session store flush failed at shutdown");
    }
    store_writer.abort();

    if let Err(e) = serve_result {
        error!(error = %e, "server error");
        return 2;
    }
    if interrupted.load(Ordering::SeqCst) {
        info!("interrupted; shut down cleanly");
        return 130;
    }
    0
}
