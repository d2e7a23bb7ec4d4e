use std::collections::VecDeque;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use hermod_core::types::{ChatType, HistoryEntry, InboundEvent, SessionScope};

/// Derive the session key for an event.
///
/// - `per-sender`: `surface:from`
/// - `per-group`:  `surface:group:<gid>` for groups, `surface:from` for DMs
/// - `global`:     the configured main key (default `"main"`)
pub fn derive_key(
    scope: SessionScope,
    main_key: &str,
    event: &InboundEvent,
    group_id: Option<&str>,
) -> String {
    match scope {
        SessionScope::PerSender => format!("{}:{}", event.surface, event.from),
        SessionScope::PerGroup => match (event.chat_type, group_id) {
            (ChatType::Group, Some(gid)) => format!("{}:group:{}", event.surface, gid),
            _ => format!("{}:{}", event.surface, event.from),
        },
        SessionScope::Global => main_key.to_string(),
    }
}

/// An in-memory conversation session.
///
/// The session manager is the sole owner; the run coordinator mutates
/// `history`, `updated_at`, and `last_run_at` through manager methods while
/// holding a run for the key.
#[derive(Debug, Clone)]
pub struct Session {
    pub key: String,
    pub surface: String,
    /// Delivery destination on that surface (chat id, group id, number).
    pub to: String,
    /// Milliseconds since the Unix epoch, matching the store format.
    pub created_at: i64,
    pub updated_at: i64,
    pub last_run_at: Option<i64>,
    pub history: VecDeque<HistoryEntry>,
}

impl Session {
    pub fn new(key: &str, surface: &str, to: &str) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            key: key.to_string(),
            surface: surface.to_string(),
            to: to.to_string(),
            created_at: now,
            updated_at: now,
            last_run_at: None,
            history: VecDeque::new(),
        }
    }

    /// Append a turn, dropping the oldest entry past `limit`.
    pub fn push_history(&mut self, entry: HistoryEntry, limit: usize) {
        self.history.push_back(entry);
        while self.history.len() > limit {
            self.history.pop_front();
        }
        self.updated_at = Utc::now().timestamp_millis();
    }

    /// The instant past which an idle session becomes evictable.
    pub fn idle_deadline(&self, idle_minutes: u64) -> i64 {
        self.updated_at + (idle_minutes as i64) * 60_000
    }

    pub fn to_entry(&self) -> SessionEntry {
        SessionEntry {
            surface: self.surface.clone(),
            to: self.to.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_run_at: self.last_run_at,
            history: self.history.iter().cloned().collect(),
        }
    }

    pub fn from_entry(key: &str, entry: &SessionEntry) -> Self {
        Self {
            key: key.to_string(),
            surface: entry.surface.clone(),
            to: entry.to.clone(),
            created_at: entry.created_at,
            updated_at: entry.updated_at,
            last_run_at: entry.last_run_at,
            history: entry.history.iter().cloned().collect(),
        }
    }
}

/// Persisted form of one session inside the store document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub surface: String,
    pub to: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_run_at: Option<i64>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use hermod_core::types::Surface;

    fn event(chat_type: ChatType, group_id: Option<&str>) -> InboundEvent {
        InboundEvent {
            surface: Surface::new("whatsapp"),
            chat_type,
            from: "+111".into(),
            to: "+222".into(),
            body: "hi".into(),
            mentions_bot: false,
            text_mention_hit: false,
            media: Vec::new(),
            transcript: None,
            message_id: "m".into(),
            received_at: Utc::now(),
            group_id: group_id.map(String::from),
            group_subject: None,
            sender_name: None,
            payload: None,
        }
    }

    #[test]
    fn per_sender_key() {
        let e = event(ChatType::Direct, None);
        assert_eq!(
            derive_key(SessionScope::PerSender, "main", &e, None),
            "whatsapp:+111"
        );
    }

    #[test]
    fn per_group_key_for_groups() {
        let e = event(ChatType::Group, Some("gid-9"));
        assert_eq!(
            derive_key(SessionScope::PerGroup, "main", &e, Some("gid-9")),
            "whatsapp:group:gid-9"
        );
    }

    #[test]
    fn per_group_falls_back_to_sender_for_dms() {
        let e = event(ChatType::Direct, None);
        assert_eq!(
            derive_key(SessionScope::PerGroup, "main", &e, None),
            "whatsapp:+111"
        );
    }

    #[test]
    fn global_key_is_main() {
        let e = event(ChatType::Group, Some("gid-9"));
        assert_eq!(derive_key(SessionScope::Global, "main", &e, Some("gid-9")), "main");
    }

    #[test]
    fn history_is_bounded_oldest_first() {
        let mut s = Session::new("k", "whatsapp", "+222");
        for i in 0..5 {
            s.push_history(HistoryEntry::new("user", &format!("m{i}")), 3);
        }
        let contents: Vec<_> = s.history.iter().map(|h| h.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn entry_round_trip() {
        let mut s = Session::new("k", "whatsapp", "+222");
        s.push_history(HistoryEntry::new("user", "hello"), 10);
        let restored = Session::from_entry("k", &s.to_entry());
        assert_eq!(restored.history.len(), 1);
        assert_eq!(restored.to, "+222");
        assert_eq!(restored.created_at, s.created_at);
    }
}
