use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical transport identifier (e.g. `"whatsapp"`, `"telegram"`, `"discord"`,
/// `"desktop"`, `"webchat"`, `"webhook"`).
///
/// Surfaces are open-ended strings rather than a closed enum: adapters register
/// under whatever name their config block uses, and session keys embed the
/// surface verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Surface(pub String);

impl Surface {
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }

    /// The synthetic surface used for webhook-originated events.
    pub fn webhook() -> Self {
        Self("webhook".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Surface {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Surface {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Whether an event came from a one-to-one conversation or a group/guild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Direct,
    Group,
}

impl fmt::Display for ChatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatType::Direct => f.write_str("direct"),
            ChatType::Group => f.write_str("group"),
        }
    }
}

/// How inbound events map to session keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionScope {
    /// One session per sender: `surface:from`.
    #[default]
    PerSender,
    /// One session per group (`surface:group:<gid>`); DMs fall back to sender.
    PerGroup,
    /// A single shared session under the configured main key.
    Global,
}

/// Classification of a media attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    Document,
    Other,
}

/// A reference to an attachment carried by an inbound event.
///
/// The gateway never holds raw bytes; adapters download to a local path or
/// pass through a URL, and the agent receives the reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub url: Option<String>,
    pub path: Option<String>,
    pub mime: Option<String>,
}

/// One normalised inbound message from any transport.
///
/// Adapters construct this and hand it to the gate; everything downstream
/// (session resolution, run submission, template expansion) reads from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub surface: Surface,
    pub chat_type: ChatType,
    /// Platform-native sender identifier (phone number, user id, …).
    pub from: String,
    /// Platform-native destination (own number, bot id, channel id, …).
    pub to: String,
    pub body: String,
    /// Native platform mention of the bot identity (metadata flag).
    #[serde(default)]
    pub mentions_bot: bool,
    /// Set when the adapter already matched a configured mention pattern
    /// against the body. The gate also evaluates patterns itself, so leaving
    /// this `false` is always safe.
    #[serde(default)]
    pub text_mention_hit: bool,
    #[serde(default)]
    pub media: Vec<MediaRef>,
    /// Voice-note transcript, when the adapter produced one.
    pub transcript: Option<String>,
    pub message_id: String,
    pub received_at: DateTime<Utc>,
    /// Group id and human subject, present for `ChatType::Group`.
    pub group_id: Option<String>,
    pub group_subject: Option<String>,
    pub sender_name: Option<String>,
    /// Full raw payload for webhook events that need field access.
    pub payload: Option<serde_json::Value>,
}

impl InboundEvent {
    /// Minimal well-formedness check used by the gate: a usable event names
    /// its surface and sender, and carries either text, media, or a transcript.
    pub fn is_well_formed(&self) -> bool {
        !self.surface.as_str().is_empty()
            && !self.from.is_empty()
            && (!self.body.trim().is_empty()
                || !self.media.is_empty()
                || self.transcript.is_some())
    }

    /// Where replies to this event should be delivered: the group for group
    /// chats, the sender for DMs.
    pub fn reply_target(&self) -> &str {
        match self.chat_type {
            ChatType::Group => self.group_id.as_deref().unwrap_or(&self.to),
            ChatType::Direct => &self.from,
        }
    }

    /// Body with a leading mention token removed (e.g. `"@bot hi"` → `"hi"`).
    pub fn body_stripped(&self, mention_patterns: &[regex::Regex]) -> String {
        let mut text = self.body.trim().to_string();
        for re in mention_patterns {
            if let Some(m) = re.find(&text) {
                if m.start() == 0 {
                    text = text[m.end()..].trim_start().to_string();
                    break;
                }
            }
        }
        text
    }
}

/// A single entry in a session's bounded history window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
    /// Milliseconds since the Unix epoch.
    pub ts: i64,
}

impl HistoryEntry {
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
            ts: Utc::now().timestamp_millis(),
        }
    }
}
