//! The run coordinator.
//!
//! Guarantees:
//! - at most one active run per session key (serial per key, parallel across
//!   keys)
//! - a global `max_concurrent` cap; excess runs queue FIFO on the semaphore
//! - inputs arriving during an active run follow the configured queue policy
//!   and are never silently lost outside the documented drop rules
//! - every run holds a cancellation token; cancellation (or timeout) flushes
//!   buffered text as a terminal block and releases the key, so a new run can
//!   start immediately
//!
//! A session's backlog is shared across consecutive runs of the same key, so
//! an input racing the hand-off between runs lands in the next run instead of
//! vanishing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use hermod_agent::event::{AgentRunner, RunInput, RunRequest};
use hermod_agent::signal::CompletionSignal;
use hermod_agent::subscriber::{EventSubscriber, ReplyEvent, RunOutcome};
use hermod_core::config::{QueueConfig, QueueMode, ReplyConfig, RunsConfig};
use hermod_sessions::SessionManager;

use crate::queue::{Backlog, Disposition};

/// Shared per-key state while a run is active.
struct ActiveEntry {
    run_id: String,
    cancel: CancellationToken,
    inputs: mpsc::Sender<RunInput>,
    backlog: Arc<Mutex<Backlog>>,
    completion: CompletionSignal,
}

/// Caller-facing handle for a started run.
#[derive(Clone)]
pub struct RunHandle {
    pub run_id: String,
    pub session_key: String,
    pub completion: CompletionSignal,
    pub cancel: CancellationToken,
}

pub struct SubmitOptions {
    /// Surface the input came from, for per-surface queue mode overrides.
    pub surface: Option<String>,
    pub model: Option<String>,
    /// Where this session's reply stream goes (dispatcher input).
    pub reply_tx: mpsc::Sender<ReplyEvent>,
}

#[derive(Debug)]
pub enum SubmitOutcome {
    /// A fresh run started.
    Started { run_id: String },
    /// The input was steered into the active run.
    Steered { run_id: String },
    /// The input queued for after the active run.
    Queued {
        disposition: Disposition,
        backlog_len: usize,
    },
    /// The active run is being cancelled; the input starts the next one.
    Interrupting { run_id: String },
    /// The drop rule rejected the input, or the coordinator is shutting down.
    Dropped,
}

struct Inner {
    queue: QueueConfig,
    runs: RunsConfig,
    reply: ReplyConfig,
    runner: Arc<dyn AgentRunner>,
    sessions: Arc<SessionManager>,
    semaphore: Arc<Semaphore>,
    active: DashMap<String, Arc<ActiveEntry>>,
    intake_closed: CancellationToken,
}

pub struct RunCoordinator {
    inner: Arc<Inner>,
}

/// Channels and subscriber for one run iteration.
struct PerRun {
    entry: Arc<ActiveEntry>,
    run_id: String,
    cancel: CancellationToken,
    subscriber: EventSubscriber,
    evt_tx: mpsc::Sender<hermod_agent::event::AgentEvent>,
    evt_rx: mpsc::Receiver<hermod_agent::event::AgentEvent>,
    input_rx: mpsc::Receiver<RunInput>,
}

impl RunCoordinator {
    pub fn new(
        queue: QueueConfig,
        runs: RunsConfig,
        reply: ReplyConfig,
        runner: Arc<dyn AgentRunner>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(runs.max_concurrent.max(1)));
        Self {
            inner: Arc::new(Inner {
                queue,
                runs,
                reply,
                runner,
                sessions,
                semaphore,
                active: DashMap::new(),
                intake_closed: CancellationToken::new(),
            }),
        }
    }

    /// Submit an input for a session. Starts a run when the key is idle,
    /// otherwise applies the queue policy.
    pub fn submit(&self, session_key: &str, text: &str, opts: SubmitOptions) -> SubmitOutcome {
        if self.inner.intake_closed.is_cancelled() {
            warn!(session = %session_key, "submission rejected: shutting down");
            return SubmitOutcome::Dropped;
        }

        use dashmap::mapref::entry::Entry;
        let per_run = match self.inner.active.entry(session_key.to_string()) {
            Entry::Occupied(occupied) => {
                let entry = Arc::clone(occupied.get());
                drop(occupied);
                return self.handle_while_active(session_key, &entry, text, &opts);
            }
            Entry::Vacant(vacant) => {
                let backlog = Arc::new(Mutex::new(Backlog::new(
                    self.inner.queue.cap,
                    self.inner.queue.drop,
                    self.inner.queue.debounce_ms,
                )));
                let per_run = make_per_run(&self.inner.reply, backlog, opts.reply_tx.clone());
                vacant.insert(Arc::clone(&per_run.entry));
                per_run
            }
        };

        let run_id = per_run.run_id.clone();
        info!(session = %session_key, %run_id, "run starting");
        let inner = Arc::clone(&self.inner);
        let key = session_key.to_string();
        let text = text.to_string();
        let model = opts.model.clone().or_else(|| inner.runs.model.clone());
        let reply_tx = opts.reply_tx.clone();
        tokio::spawn(run_loop(inner, key, text, model, reply_tx, per_run));

        SubmitOutcome::Started { run_id }
    }

    fn handle_while_active(
        &self,
        session_key: &str,
        entry: &Arc<ActiveEntry>,
        text: &str,
        opts: &SubmitOptions,
    ) -> SubmitOutcome {
        let mode = match &opts.surface {
            Some(surface) => self.inner.queue.mode_for(surface),
            None => self.inner.queue.mode,
        };
        debug!(session = %session_key, ?mode, "input while run active");

        match mode {
            QueueMode::Steer => self.steer(entry, text),
            QueueMode::Followup => {
                if entry
                    .inputs
                    .try_send(RunInput::Followup(text.to_string()))
                    .is_ok()
                {
                    SubmitOutcome::Queued {
                        disposition: Disposition::Followup,
                        backlog_len: 0,
                    }
                } else {
                    self.enqueue(entry, text, Disposition::Followup)
                }
            }
            QueueMode::Collect => self.enqueue(entry, text, Disposition::Collect),
            QueueMode::SteerBacklog => {
                let outcome = self.steer(entry, text);
                // The backlog also retains the input for the next run.
                entry
                    .backlog
                    .lock()
                    .unwrap()
                    .push(text, Disposition::Steer);
                outcome
            }
            QueueMode::Interrupt => {
                let queued = entry
                    .backlog
                    .lock()
                    .unwrap()
                    .push(text, Disposition::Collect);
                if !queued {
                    return SubmitOutcome::Dropped;
                }
                info!(session = %session_key, run_id = %entry.run_id, "interrupt: cancelling active run");
                entry.cancel.cancel();
                SubmitOutcome::Interrupting {
                    run_id: entry.run_id.clone(),
                }
            }
        }
    }

    fn steer(&self, entry: &Arc<ActiveEntry>, text: &str) -> SubmitOutcome {
        match entry.inputs.try_send(RunInput::Steer(text.to_string())) {
            Ok(()) => SubmitOutcome::Steered {
                run_id: entry.run_id.clone(),
            },
            Err(_) => {
                // The runner is winding down; keep the input for the next run.
                self.enqueue(entry, text, Disposition::Steer)
            }
        }
    }

    fn enqueue(
        &self,
        entry: &Arc<ActiveEntry>,
        text: &str,
        disposition: Disposition,
    ) -> SubmitOutcome {
        let mut backlog = entry.backlog.lock().unwrap();
        if backlog.push(text, disposition) {
            SubmitOutcome::Queued {
                disposition,
                backlog_len: backlog.len(),
            }
        } else {
            SubmitOutcome::Dropped
        }
    }

    pub fn is_active(&self, session_key: &str) -> bool {
        self.inner.active.contains_key(session_key)
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    /// Handle to an active run, if any.
    pub fn handle(&self, session_key: &str) -> Option<RunHandle> {
        self.inner.active.get(session_key).map(|e| RunHandle {
            run_id: e.run_id.clone(),
            session_key: session_key.to_string(),
            completion: e.completion.clone(),
            cancel: e.cancel.clone(),
        })
    }

    /// Cancel a session's active run, if any.
    pub fn cancel(&self, session_key: &str) -> bool {
        match self.inner.active.get(session_key) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop intake, let active runs drain within `grace`, then cancel
    /// stragglers and wait briefly for their flushes.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.intake_closed.cancel();
        let deadline = tokio::time::Instant::now() + grace;
        while !self.inner.active.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let stragglers = self.inner.active.len();
        if stragglers > 0 {
            warn!(count = stragglers, "cancelling runs still active at shutdown");
            for entry in self.inner.active.iter() {
                entry.value().cancel.cancel();
            }
            let hard_deadline = tokio::time::Instant::now() + Duration::from_secs(1);
            while !self.inner.active.is_empty() && tokio::time::Instant::now() < hard_deadline {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
        info!("run coordinator drained");
    }
}

fn make_per_run(
    reply: &ReplyConfig,
    backlog: Arc<Mutex<Backlog>>,
    reply_tx: mpsc::Sender<ReplyEvent>,
) -> PerRun {
    let run_id = Uuid::new_v4().to_string();
    let cancel = CancellationToken::new();
    let (evt_tx, evt_rx) = mpsc::channel(256);
    let (input_tx, input_rx) = mpsc::channel(64);
    let subscriber = EventSubscriber::new(reply.clone(), reply_tx);
    let completion = subscriber.completion();
    let entry = Arc::new(ActiveEntry {
        run_id: run_id.clone(),
        cancel: cancel.clone(),
        inputs: input_tx,
        backlog,
        completion,
    });
    PerRun {
        entry,
        run_id,
        cancel,
        subscriber,
        evt_tx,
        evt_rx,
        input_rx,
    }
}

async fn run_loop(
    inner: Arc<Inner>,
    key: String,
    mut text: String,
    model: Option<String>,
    reply_tx: mpsc::Sender<ReplyEvent>,
    mut per_run: PerRun,
) {
    loop {
        let permit = match Arc::clone(&inner.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                inner.active.remove(&key);
                return;
            }
        };

        inner.sessions.mark_run(&key);
        inner.sessions.append_history(&key, "user", &text);

        let request = RunRequest {
            run_id: per_run.run_id.clone(),
            session_key: key.clone(),
            prompt: text.clone(),
            history: inner
                .sessions
                .get(&key)
                .map(|s| s.history.into_iter().collect())
                .unwrap_or_default(),
            model: model.clone(),
        };

        let runner = Arc::clone(&inner.runner);
        let runner_cancel = per_run.cancel.clone();
        let evt_tx = per_run.evt_tx.clone();
        let input_rx = per_run.input_rx;
        let run_id = per_run.run_id.clone();
        tokio::spawn(async move {
            if let Err(e) = runner.run(request, evt_tx, input_rx, runner_cancel).await {
                debug!(%run_id, error = %e, "runner finished with error");
            }
        });

        let mut sub_task = tokio::spawn(
            per_run
                .subscriber
                .process(per_run.evt_rx, per_run.cancel.clone()),
        );

        let budget = Duration::from_secs(inner.runs.timeout_seconds.max(1));
        let outcome: RunOutcome = match tokio::time::timeout(budget, &mut sub_task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(session = %key, error = %e, "subscriber task failed");
                RunOutcome {
                    interrupted: true,
                    ..Default::default()
                }
            }
            Err(_) => {
                warn!(session = %key, timeout_s = inner.runs.timeout_seconds, "run timed out; cancelling");
                per_run.cancel.cancel();
                sub_task.await.unwrap_or_else(|_| RunOutcome {
                    interrupted: true,
                    ..Default::default()
                })
            }
        };
        // Stop a runner that is still producing (timeout, stream error).
        per_run.cancel.cancel();
        drop(permit);

        for reply in &outcome.assistant_texts {
            inner.sessions.append_history(&key, "assistant", reply);
        }
        info!(
            session = %key,
            run_id = %per_run.run_id,
            texts = outcome.assistant_texts.len(),
            tools = outcome.tool_results.len(),
            retries = outcome.compaction_retries,
            interrupted = outcome.interrupted,
            "run finished"
        );

        // Exit if the backlog is empty, checked under the map shard lock so
        // a racing submit either sees the active entry or a free key.
        let backlog = Arc::clone(&per_run.entry.backlog);
        if inner
            .active
            .remove_if(&key, |_, e| e.backlog.lock().unwrap().is_empty())
            .is_some()
        {
            return;
        }

        let Some(next) = backlog.lock().unwrap().drain_combined() else {
            // Drained by nobody yet empty: treat as spurious and exit.
            inner.active.remove(&key);
            return;
        };
        debug!(session = %key, "starting follow-up run from backlog");
        text = next;
        per_run = make_per_run(&inner.reply, backlog, reply_tx.clone());
        inner.active.insert(key.clone(), Arc::clone(&per_run.entry));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hermod_agent::event::AgentEvent;
    use hermod_core::config::DropRule;
    use hermod_core::config::SessionConfig;
    use hermod_sessions::SessionStore;
    use std::sync::Mutex as StdMutex;

    /// Scripted runner: echoes the prompt, optionally holding the run open
    /// until a gate permit arrives (or cancellation).
    struct TestRunner {
        gate: Arc<Semaphore>,
        hold: bool,
        prompts: Arc<StdMutex<Vec<String>>>,
        steers: Arc<StdMutex<Vec<String>>>,
        concurrency: Arc<StdMutex<(usize, usize)>>,
    }

    impl TestRunner {
        fn new(hold: bool) -> Arc<Self> {
            Arc::new(Self {
                gate: Arc::new(Semaphore::new(0)),
                hold,
                prompts: Arc::new(StdMutex::new(Vec::new())),
                steers: Arc::new(StdMutex::new(Vec::new())),
                concurrency: Arc::new(StdMutex::new((0, 0))),
            })
        }

        fn release_one(&self) {
            self.gate.add_permits(1);
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }

        fn max_concurrency(&self) -> usize {
            self.concurrency.lock().unwrap().1
        }
    }

    #[async_trait]
    impl AgentRunner for TestRunner {
        async fn run(
            &self,
            request: RunRequest,
            events: mpsc::Sender<AgentEvent>,
            mut inputs: mpsc::Receiver<RunInput>,
            cancel: CancellationToken,
        ) -> hermod_agent::error::Result<()> {
            {
                let mut c = self.concurrency.lock().unwrap();
                c.0 += 1;
                c.1 = c.1.max(c.0);
            }
            self.prompts.lock().unwrap().push(request.prompt.clone());

            let _ = events
                .send(AgentEvent::AgentStart {
                    run_id: request.run_id.clone(),
                })
                .await;
            let _ = events
                .send(AgentEvent::MessageUpdate {
                    text: format!("echo: {}", request.prompt),
                })
                .await;

            if self.hold {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.concurrency.lock().unwrap().0 -= 1;
                            return Ok(());
                        }
                        permit = self.gate.acquire() => {
                            permit.expect("gate closed").forget();
                            break;
                        }
                        Some(input) = inputs.recv() => {
                            if let RunInput::Steer(text) = input {
                                self.steers.lock().unwrap().push(text);
                            }
                        }
                    }
                }
            }

            let _ = events.send(AgentEvent::MessageEnd).await;
            let _ = events.send(AgentEvent::AgentEnd { stop_reason: None }).await;
            self.concurrency.lock().unwrap().0 -= 1;
            Ok(())
        }
    }

    fn sessions(dir: &tempfile::TempDir) -> Arc<SessionManager> {
        let config = SessionConfig {
            state_dir: dir.path().to_string_lossy().into_owned(),
            ..SessionConfig::default()
        };
        let (store, doc) = SessionStore::open(&config.state_dir).unwrap();
        Arc::new(SessionManager::new(config, store, doc))
    }

    fn queue(mode: QueueMode, cap: usize, drop: DropRule) -> QueueConfig {
        QueueConfig {
            mode,
            debounce_ms: 0,
            cap,
            drop,
            by_surface: Default::default(),
        }
    }

    fn coordinator(
        runner: Arc<TestRunner>,
        sessions: Arc<SessionManager>,
        queue: QueueConfig,
        max_concurrent: usize,
        timeout_seconds: u64,
    ) -> RunCoordinator {
        RunCoordinator::new(
            queue,
            RunsConfig {
                max_concurrent,
                timeout_seconds,
                model: None,
            },
            ReplyConfig::default(),
            runner,
            sessions,
        )
    }

    fn opts(reply_tx: &mpsc::Sender<ReplyEvent>) -> SubmitOptions {
        SubmitOptions {
            surface: None,
            model: None,
            reply_tx: reply_tx.clone(),
        }
    }

    async fn wait_idle(coord: &RunCoordinator, key: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while coord.is_active(key) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("coordinator never went idle");
    }

    #[tokio::test]
    async fn collect_queues_and_runs_combined_follow_up() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TestRunner::new(true);
        let coord = coordinator(
            Arc::clone(&runner),
            sessions(&dir),
            queue(QueueMode::Collect, 10, DropRule::Summarize),
            4,
            30,
        );
        let (reply_tx, _reply_rx) = mpsc::channel(256);

        assert!(matches!(
            coord.submit("k1", "a", opts(&reply_tx)),
            SubmitOutcome::Started { .. }
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            coord.submit("k1", "b", opts(&reply_tx)),
            SubmitOutcome::Queued { .. }
        ));
        assert!(matches!(
            coord.submit("k1", "c", opts(&reply_tx)),
            SubmitOutcome::Queued { .. }
        ));

        runner.release_one(); // finish run 1 → follow-up starts
        tokio::time::sleep(Duration::from_millis(100)).await;
        runner.release_one(); // finish follow-up
        wait_idle(&coord, "k1").await;

        assert_eq!(runner.prompts(), vec!["a", "b\n\nc"]);
        assert_eq!(runner.max_concurrency(), 1, "one run per key at a time");
    }

    #[tokio::test]
    async fn collect_cap_summarizes_backlog() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TestRunner::new(true);
        let coord = coordinator(
            Arc::clone(&runner),
            sessions(&dir),
            queue(QueueMode::Collect, 2, DropRule::Summarize),
            4,
            30,
        );
        let (reply_tx, _reply_rx) = mpsc::channel(256);

        coord.submit("k1", "first", opts(&reply_tx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        coord.submit("k1", "a", opts(&reply_tx));
        coord.submit("k1", "b", opts(&reply_tx));
        coord.submit("k1", "c", opts(&reply_tx));

        runner.release_one();
        tokio::time::sleep(Duration::from_millis(100)).await;
        runner.release_one();
        wait_idle(&coord, "k1").await;

        assert_eq!(
            runner.prompts(),
            vec!["first", "3 messages arrived while you were busy"]
        );
    }

    #[tokio::test]
    async fn global_cap_serialises_across_keys_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TestRunner::new(true);
        let coord = coordinator(
            Arc::clone(&runner),
            sessions(&dir),
            queue(QueueMode::Collect, 10, DropRule::Summarize),
            1,
            30,
        );
        let (reply_tx, _reply_rx) = mpsc::channel(256);

        coord.submit("k1", "one", opts(&reply_tx));
        coord.submit("k2", "two", opts(&reply_tx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Only the first run got the permit.
        assert_eq!(runner.prompts(), vec!["one"]);

        runner.release_one();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runner.prompts(), vec!["one", "two"]);
        runner.release_one();
        wait_idle(&coord, "k1").await;
        wait_idle(&coord, "k2").await;
        assert_eq!(runner.max_concurrency(), 1);
    }

    #[tokio::test]
    async fn steer_preempts_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TestRunner::new(true);
        let coord = coordinator(
            Arc::clone(&runner),
            sessions(&dir),
            queue(QueueMode::Steer, 10, DropRule::Summarize),
            4,
            30,
        );
        let (reply_tx, _reply_rx) = mpsc::channel(256);

        coord.submit("k1", "go", opts(&reply_tx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let outcome = coord.submit("k1", "course correction", opts(&reply_tx));
        assert!(matches!(outcome, SubmitOutcome::Steered { .. }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runner.steers.lock().unwrap().clone(), vec!["course correction"]);

        runner.release_one();
        wait_idle(&coord, "k1").await;
        assert_eq!(runner.prompts(), vec!["go"], "steer must not start a new run");
    }

    #[tokio::test]
    async fn interrupt_cancels_then_restarts_with_queued_input() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TestRunner::new(true);
        let coord = coordinator(
            Arc::clone(&runner),
            sessions(&dir),
            queue(QueueMode::Interrupt, 10, DropRule::Summarize),
            4,
            30,
        );
        let (reply_tx, _reply_rx) = mpsc::channel(256);

        coord.submit("k1", "slow task", opts(&reply_tx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let outcome = coord.submit("k1", "forget that, do this", opts(&reply_tx));
        assert!(matches!(outcome, SubmitOutcome::Interrupting { .. }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        runner.release_one(); // lets the restarted run finish
        wait_idle(&coord, "k1").await;

        assert_eq!(runner.prompts(), vec!["slow task", "forget that, do this"]);
    }

    #[tokio::test]
    async fn timeout_cancels_and_flushes_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TestRunner::new(true); // never released
        let coord = coordinator(
            Arc::clone(&runner),
            sessions(&dir),
            queue(QueueMode::Collect, 10, DropRule::Summarize),
            4,
            1,
        );
        let (reply_tx, mut reply_rx) = mpsc::channel(256);

        coord.submit("k1", "never finishes", opts(&reply_tx));
        wait_idle(&coord, "k1").await;

        let mut saw_flush = false;
        while let Ok(evt) = reply_rx.try_recv() {
            if let ReplyEvent::Block { text, .. } = evt {
                assert_eq!(text, "echo: never finishes");
                saw_flush = true;
            }
        }
        assert!(saw_flush, "timeout must flush buffered text as a terminal block");
    }

    #[tokio::test]
    async fn history_reflects_input_and_reply() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TestRunner::new(false);
        let mgr = sessions(&dir);
        let coord = coordinator(
            Arc::clone(&runner),
            Arc::clone(&mgr),
            queue(QueueMode::Collect, 10, DropRule::Summarize),
            4,
            30,
        );
        let (reply_tx, _reply_rx) = mpsc::channel(256);

        // The pipeline creates the session before submitting.
        let event = hermod_core::types::InboundEvent {
            surface: hermod_core::types::Surface::new("whatsapp"),
            chat_type: hermod_core::types::ChatType::Direct,
            from: "+111".into(),
            to: "+222".into(),
            body: "hi".into(),
            mentions_bot: false,
            text_mention_hit: false,
            media: Vec::new(),
            transcript: None,
            message_id: "m".into(),
            received_at: chrono::Utc::now(),
            group_id: None,
            group_subject: None,
            sender_name: None,
            payload: None,
        };
        let resolved = mgr.resolve(&event, None, None);

        coord.submit(&resolved.key, "hi", opts(&reply_tx));
        wait_idle(&coord, &resolved.key).await;

        let session = mgr.get(&resolved.key).unwrap();
        let roles: Vec<_> = session
            .history
            .iter()
            .map(|h| (h.role.as_str(), h.content.as_str()))
            .collect();
        assert!(roles.contains(&("user", "hi")));
        assert!(roles.contains(&("assistant", "echo: hi")));
    }

    #[tokio::test]
    async fn shutdown_rejects_new_submissions() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TestRunner::new(false);
        let coord = coordinator(
            Arc::clone(&runner),
            sessions(&dir),
            queue(QueueMode::Collect, 10, DropRule::Summarize),
            4,
            30,
        );
        let (reply_tx, _reply_rx) = mpsc::channel(256);

        coord.shutdown(Duration::from_millis(100)).await;
        assert!(matches!(
            coord.submit("k1", "late", opts(&reply_tx)),
            SubmitOutcome::Dropped
        ));
    }
}
