//! Session table ownership.
//!
//! The manager is the only component that mutates the table. The run
//! coordinator borrows exactly one session per run and goes through manager
//! methods for history and run-timestamp updates; transports never touch
//! sessions directly.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info};

use hermod_core::config::SessionConfig;
use hermod_core::types::{HistoryEntry, InboundEvent};

use crate::store::{SessionStore, StoreDocument};
use crate::types::{derive_key, Session};

/// Evicted sessions stay in the store document for this long before the
/// sweep prunes them.
const PERSIST_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
/// Minimum interval between idle sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Outcome of resolving an event to a session.
#[derive(Debug, Clone)]
pub struct ResolvedSession {
    pub key: String,
    pub is_new: bool,
    /// The event was a reset trigger: the previous session (if any) was
    /// dropped and `key` now names a fresh one. Callers acknowledge with a
    /// short confirmation reply.
    pub was_reset: bool,
}

pub struct SessionManager {
    config: SessionConfig,
    table: Mutex<HashMap<String, Session>>,
    /// Mirror of what the store document should contain. Retains evicted
    /// sessions until the persistence window elapses.
    persisted: Mutex<StoreDocument>,
    store: SessionStore,
    last_sweep: Mutex<Option<Instant>>,
}

impl SessionManager {
    /// Build the manager over an opened store, resurrecting persisted
    /// sessions into the in-memory table.
    pub fn new(config: SessionConfig, store: SessionStore, doc: StoreDocument) -> Self {
        let table = doc
            .iter()
            .map(|(key, entry)| (key.clone(), Session::from_entry(key, entry)))
            .collect();
        Self {
            config,
            table: Mutex::new(table),
            persisted: Mutex::new(doc),
            store,
            last_sweep: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Derive the key an event routes to, honouring the configured scope.
    pub fn key_for(&self, event: &InboundEvent, group_id: Option<&str>) -> String {
        derive_key(self.config.scope, &self.config.main_key, event, group_id)
    }

    /// True when the trimmed body equals a configured reset trigger.
    pub fn is_reset_trigger(&self, body: &str) -> bool {
        let trimmed = body.trim();
        self.config.reset_triggers.iter().any(|t| t == trimmed)
    }

    /// Resolve an accepted event to its session, creating one if needed and
    /// honouring reset triggers. `stripped_body` is the gate's
    /// mention-stripped view, so `"@bot /reset"` in a group still matches.
    ///
    /// When several coalesced inputs include a reset trigger, the first one
    /// wins: the session is dropped once and the remaining inputs are
    /// processed against the fresh session.
    pub fn resolve(
        &self,
        event: &InboundEvent,
        group_id: Option<&str>,
        stripped_body: Option<&str>,
    ) -> ResolvedSession {
        let key = self.key_for(event, group_id);
        let reset = self.is_reset_trigger(&event.body)
            || stripped_body.is_some_and(|b| self.is_reset_trigger(b));

        let mut table = self.table.lock().unwrap();
        if reset && table.remove(&key).is_some() {
            self.persisted.lock().unwrap().remove(&key);
            info!(session = %key, "session reset by trigger");
            table.insert(
                key.clone(),
                Session::new(&key, event.surface.as_str(), event.reply_target()),
            );
            drop(table);
            self.persist();
            return ResolvedSession {
                key,
                is_new: true,
                was_reset: true,
            };
        }

        let is_new = !table.contains_key(&key);
        if is_new {
            debug!(session = %key, surface = %event.surface, "session created");
            table.insert(
                key.clone(),
                Session::new(&key, event.surface.as_str(), event.reply_target()),
            );
        }
        drop(table);
        if is_new {
            self.persist();
        }
        ResolvedSession {
            key,
            is_new,
            was_reset: false,
        }
    }

    pub fn get(&self, key: &str) -> Option<Session> {
        self.table.lock().unwrap().get(key).cloned()
    }

    /// Make sure a session exists for `key` without an inbound event;
    /// heartbeat jobs and webhook mappings address sessions by key directly.
    /// Returns `true` when a new session was created.
    pub fn ensure(&self, key: &str, surface: &str, to: &str) -> bool {
        let mut table = self.table.lock().unwrap();
        if table.contains_key(key) {
            return false;
        }
        debug!(session = %key, %surface, "session created by key");
        table.insert(key.to_string(), Session::new(key, surface, to));
        drop(table);
        self.persist();
        true
    }

    /// Append one turn to a session's bounded history.
    pub fn append_history(&self, key: &str, role: &str, content: &str) {
        let mut table = self.table.lock().unwrap();
        if let Some(session) = table.get_mut(key) {
            session.push_history(HistoryEntry::new(role, content), self.config.history_limit);
        }
        drop(table);
        self.persist();
    }

    /// Record that a run started against this session.
    pub fn mark_run(&self, key: &str) {
        let now = Utc::now().timestamp_millis();
        let mut table = self.table.lock().unwrap();
        if let Some(session) = table.get_mut(key) {
            session.last_run_at = Some(now);
            session.updated_at = now;
        }
        drop(table);
        self.persist();
    }

    /// Evict idle sessions. Runs at most once per `SWEEP_INTERVAL`;
    /// `is_active` reports whether a key currently has an active run
    /// (active sessions are never evicted). Returns the evicted keys.
    pub fn sweep_idle(&self, is_active: &dyn Fn(&str) -> bool) -> Vec<String> {
        {
            let mut last = self.last_sweep.lock().unwrap();
            if last.is_some_and(|t| t.elapsed() < SWEEP_INTERVAL) {
                return Vec::new();
            }
            *last = Some(Instant::now());
        }
        self.sweep_idle_now(is_active)
    }

    fn sweep_idle_now(&self, is_active: &dyn Fn(&str) -> bool) -> Vec<String> {
        let now = Utc::now().timestamp_millis();
        let mut table = self.table.lock().unwrap();
        let evict: Vec<String> = table
            .iter()
            .filter(|(key, s)| s.idle_deadline(self.config.idle_minutes) < now && !is_active(key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &evict {
            // History was mirrored to the persisted view on every mutation,
            // so removal from the table loses nothing.
            table.remove(key);
            debug!(session = %key, "idle session evicted");
        }
        drop(table);

        // Prune persisted leftovers whose window has elapsed.
        let window_ms = PERSIST_WINDOW.as_millis() as i64;
        {
            let table = self.table.lock().unwrap();
            let mut persisted = self.persisted.lock().unwrap();
            persisted.retain(|key, entry| {
                table.contains_key(key) || now - entry.updated_at < window_ms
            });
        }

        if !evict.is_empty() {
            info!(evicted = evict.len(), "idle sweep complete");
        }
        self.persist();
        evict
    }

    /// Drop a session outright (shutdown of a webhook-scoped session, admin
    /// action). Unlike eviction this also removes the persisted entry.
    pub fn remove(&self, key: &str) -> bool {
        let removed = self.table.lock().unwrap().remove(key).is_some();
        if removed {
            self.persisted.lock().unwrap().remove(key);
            self.persist();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.table.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().unwrap().len() == 0
    }

    /// Flush the store immediately (graceful shutdown path).
    pub fn flush(&self) -> crate::error::Result<()> {
        self.persist();
        self.store.flush_now()
    }

    /// Sync the persisted mirror with the live table and hand the document
    /// to the debounced writer.
    fn persist(&self) {
        let table = self.table.lock().unwrap();
        let mut persisted = self.persisted.lock().unwrap();
        for (key, session) in table.iter() {
            persisted.insert(key.clone(), session.to_entry());
        }
        let doc = persisted.clone();
        drop(persisted);
        drop(table);
        self.store.persist(doc);
    }

    #[cfg(test)]
    fn backdate(&self, key: &str, ms: i64) {
        let mut table = self.table.lock().unwrap();
        if let Some(s) = table.get_mut(key) {
            s.updated_at -= ms;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hermod_core::types::{ChatType, SessionScope, Surface};

    fn manager(dir: &tempfile::TempDir, reset_triggers: Vec<String>) -> SessionManager {
        let config = SessionConfig {
            scope: SessionScope::PerSender,
            main_key: "main".into(),
            idle_minutes: 60,
            history_limit: 5,
            reset_triggers,
            state_dir: dir.path().to_string_lossy().into_owned(),
        };
        let (store, doc) = SessionStore::open(&config.state_dir).unwrap();
        SessionManager::new(config, store, doc)
    }

    fn event(body: &str) -> InboundEvent {
        InboundEvent {
            surface: Surface::new("whatsapp"),
            chat_type: ChatType::Direct,
            from: "+111".into(),
            to: "+222".into(),
            body: body.into(),
            mentions_bot: false,
            text_mention_hit: false,
            media: Vec::new(),
            transcript: None,
            message_id: "m".into(),
            received_at: Utc::now(),
            group_id: None,
            group_subject: None,
            sender_name: None,
            payload: None,
        }
    }

    #[tokio::test]
    async fn resolve_creates_then_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir, Vec::new());

        let first = m.resolve(&event("hi"), None, None);
        assert!(first.is_new);
        let second = m.resolve(&event("again"), None, None);
        assert!(!second.is_new);
        assert_eq!(first.key, second.key);
        assert_eq!(m.len(), 1);
    }

    #[tokio::test]
    async fn reset_trigger_drops_history() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir, vec!["/reset".into()]);

        let r = m.resolve(&event("hi"), None, None);
        m.append_history(&r.key, "user", "hi");
        assert_eq!(m.get(&r.key).unwrap().history.len(), 1);

        let r2 = m.resolve(&event("  /reset  "), None, None);
        assert!(r2.was_reset);
        assert!(r2.is_new);
        assert_eq!(m.get(&r2.key).unwrap().history.len(), 0);
    }

    #[tokio::test]
    async fn reset_trigger_on_fresh_key_is_plain_create() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir, vec!["/reset".into()]);
        let r = m.resolve(&event("/reset"), None, None);
        assert!(r.is_new);
        assert!(!r.was_reset, "nothing existed to reset");
    }

    #[tokio::test]
    async fn history_respects_limit() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir, Vec::new());
        let r = m.resolve(&event("hi"), None, None);
        for i in 0..8 {
            m.append_history(&r.key, "user", &format!("m{i}"));
        }
        let s = m.get(&r.key).unwrap();
        assert_eq!(s.history.len(), 5);
        assert_eq!(s.history.front().unwrap().content, "m3");
    }

    #[tokio::test]
    async fn sweep_evicts_idle_but_not_active() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir, Vec::new());
        let idle = m.resolve(&event("hi"), None, None).key;
        let mut busy_event = event("hi");
        busy_event.from = "+333".into();
        let busy = m.resolve(&busy_event, None, None).key;

        // Both are two hours idle; one has an active run.
        m.backdate(&idle, 2 * 60 * 60 * 1000);
        m.backdate(&busy, 2 * 60 * 60 * 1000);

        let evicted = m.sweep_idle(&|key| key == busy);
        assert_eq!(evicted, vec![idle]);
        assert_eq!(m.len(), 1);
    }

    #[tokio::test]
    async fn sweep_is_rate_limited() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir, Vec::new());
        let key = m.resolve(&event("hi"), None, None).key;
        m.backdate(&key, 2 * 60 * 60 * 1000);

        // First sweep runs; an immediate second one is skipped even though
        // the session is still evictable.
        assert_eq!(m.sweep_idle(&|_| true).len(), 0); // active → kept
        m.backdate(&key, 0);
        assert_eq!(m.sweep_idle(&|_| false).len(), 0); // rate limited
    }

    #[tokio::test]
    async fn persisted_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key;
        {
            let m = manager(&dir, Vec::new());
            let r = m.resolve(&event("hi"), None, None);
            key = r.key.clone();
            m.append_history(&key, "user", "remember me");
            m.flush().unwrap();
        }
        let m = manager(&dir, Vec::new());
        let s = m.get(&key).expect("session should have been restored");
        assert_eq!(s.history.back().unwrap().content, "remember me");
    }
}
