//! Heartbeat scheduler: periodic wake runs against idle sessions.
//!
//! Each configured job fires on its cadence unless the session already has an
//! active run (`skipped`) or the control channel reports degraded (`failed`,
//! rescheduled with exponential backoff capped at the base cadence). Only the
//! last event per session is kept; the UI reads it as `{ts, status}`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use hermod_agent::subscriber::ReplyEvent;
use hermod_core::config::{HeartbeatJobConfig, WakeMode};
use hermod_runs::RunCoordinator;
use hermod_runs::coordinator::SubmitOptions;
use hermod_sessions::SessionManager;

/// Engine tick granularity.
const TICK: Duration = Duration::from_millis(100);
/// First backoff step after a degraded failure.
const BACKOFF_BASE: Duration = Duration::from_secs(30);

/// Last heartbeat attempt for one session, exposed to UIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatEvent {
    /// Milliseconds since the Unix epoch.
    pub ts: i64,
    pub status: HeartbeatStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HeartbeatStatus {
    Sent,
    OkEmpty,
    OkToken,
    Skipped,
    Failed,
}

/// Builds the reply sink for a heartbeat run. Implemented by the gateway,
/// which knows how to route to `"last"`, a named surface, or nowhere.
pub trait HeartbeatDelivery: Send + Sync {
    fn reply_sink(&self, session: &str, target: &str) -> mpsc::Sender<ReplyEvent>;
}

struct JobState {
    config: HeartbeatJobConfig,
    cadence: Duration,
    next_fire: Instant,
    failures: u32,
}

struct Shared {
    coordinator: Arc<RunCoordinator>,
    sessions: Arc<SessionManager>,
    delivery: Arc<dyn HeartbeatDelivery>,
    status: DashMap<String, HeartbeatEvent>,
    /// Wake texts deferred to the next heartbeat fire.
    pending_wakes: Mutex<Vec<String>>,
    degraded: watch::Receiver<bool>,
    default_session: String,
}

/// Cloneable handle for status queries and webhook wakes.
#[derive(Clone)]
pub struct HeartbeatHandle {
    shared: Arc<Shared>,
}

impl HeartbeatHandle {
    /// Last event for a session, if any heartbeat has been attempted.
    pub fn last_event(&self, session: &str) -> Option<HeartbeatEvent> {
        self.shared.status.get(session).map(|e| *e)
    }

    pub fn events(&self) -> Vec<(String, HeartbeatEvent)> {
        let mut out: Vec<(String, HeartbeatEvent)> = self
            .shared
            .status
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Webhook wake pulse. `Now` fires immediately against the default
    /// session; `NextHeartbeat` stashes the text for the next scheduled fire.
    pub fn wake(&self, text: &str, mode: WakeMode) {
        match mode {
            WakeMode::Now => {
                let session = self.shared.default_session.clone();
                info!(%session, "immediate wake");
                fire(&self.shared, &session, "last", text, None);
            }
            WakeMode::NextHeartbeat => {
                debug!("wake deferred to next heartbeat");
                self.shared.pending_wakes.lock().unwrap().push(text.to_string());
            }
        }
    }
}

pub struct HeartbeatScheduler {
    shared: Arc<Shared>,
    jobs: Vec<JobState>,
}

impl HeartbeatScheduler {
    pub fn new(
        jobs: &[HeartbeatJobConfig],
        coordinator: Arc<RunCoordinator>,
        sessions: Arc<SessionManager>,
        delivery: Arc<dyn HeartbeatDelivery>,
        degraded: watch::Receiver<bool>,
    ) -> Self {
        let now = Instant::now();
        let job_states: Vec<JobState> = jobs
            .iter()
            .filter_map(|job| match job.cadence() {
                Some(cadence) => Some(JobState {
                    config: job.clone(),
                    cadence,
                    next_fire: now + cadence,
                    failures: 0,
                }),
                None => {
                    warn!(session = %job.session, every = %job.every, "heartbeat job skipped: bad cadence");
                    None
                }
            })
            .collect();

        let default_session = job_states
            .first()
            .map(|j| j.config.session.clone())
            .unwrap_or_else(|| sessions.config().main_key.clone());

        Self {
            shared: Arc::new(Shared {
                coordinator,
                sessions,
                delivery,
                status: DashMap::new(),
                pending_wakes: Mutex::new(Vec::new()),
                degraded,
                default_session,
            }),
            jobs: job_states,
        }
    }

    pub fn handle(&self) -> HeartbeatHandle {
        HeartbeatHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Main loop. Ticks until `shutdown` broadcasts `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(jobs = self.jobs.len(), "heartbeat scheduler started");
        let mut interval = tokio::time::interval(TICK);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("heartbeat scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Fire every due job once.
    pub fn tick(&mut self) {
        let now = Instant::now();
        for job in self.jobs.iter_mut() {
            if job.next_fire > now {
                continue;
            }

            let session = job.config.session.clone();
            if self.shared.coordinator.is_active(&session) {
                record(&self.shared, &session, HeartbeatStatus::Skipped);
                debug!(%session, "heartbeat skipped: run active");
                job.failures = 0;
                job.next_fire = now + job.cadence;
                continue;
            }

            if *self.shared.degraded.borrow() {
                record(&self.shared, &session, HeartbeatStatus::Failed);
                job.failures += 1;
                let backoff = BACKOFF_BASE
                    .checked_mul(1 << (job.failures - 1).min(16))
                    .unwrap_or(job.cadence)
                    .min(job.cadence);
                warn!(%session, failures = job.failures, backoff_s = backoff.as_secs(), "heartbeat failed: control channel degraded");
                job.next_fire = now + backoff;
                continue;
            }

            let mut prompt = job.config.prompt.clone();
            let pending: Vec<String> =
                std::mem::take(&mut *self.shared.pending_wakes.lock().unwrap());
            if !pending.is_empty() {
                prompt = format!("{}\n\n{}", pending.join("\n\n"), prompt);
            }

            fire(
                &self.shared,
                &session,
                &job.config.target,
                &prompt,
                job.config.model.clone(),
            );
            job.failures = 0;
            job.next_fire = now + job.cadence;
        }
    }
}

/// Submit a wake run and upgrade the recorded status once it completes.
fn fire(shared: &Arc<Shared>, session: &str, target: &str, prompt: &str, model: Option<String>) {
    shared.sessions.ensure(session, "heartbeat", "");

    // Wrap the delivery sink so the final status can report whether the run
    // produced any deliverable output.
    let (tx, mut rx) = mpsc::channel::<ReplyEvent>(64);
    let sink = shared.delivery.reply_sink(session, target);
    let discard = target == "none";
    let status_map = Arc::clone(shared);
    let session_owned = session.to_string();
    tokio::spawn(async move {
        let mut saw_block = false;
        while let Some(evt) = rx.recv().await {
            if matches!(evt, ReplyEvent::Block { .. }) {
                saw_block = true;
            }
            if !discard {
                let _ = sink.send(evt).await;
            }
        }
        // Sender side closes when the run's subscriber finishes.
        let status = if saw_block {
            HeartbeatStatus::OkToken
        } else {
            HeartbeatStatus::OkEmpty
        };
        record(&status_map, &session_owned, status);
    });

    shared.coordinator.submit(
        session,
        prompt,
        SubmitOptions {
            surface: None,
            model,
            reply_tx: tx,
        },
    );
    record(shared, session, HeartbeatStatus::Sent);
}

fn record(shared: &Arc<Shared>, session: &str, status: HeartbeatStatus) {
    shared.status.insert(
        session.to_string(),
        HeartbeatEvent {
            ts: Utc::now().timestamp_millis(),
            status,
        },
    );
}
