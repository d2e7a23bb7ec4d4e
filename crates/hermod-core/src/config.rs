use std::collections::HashMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::SessionScope;

pub const DEFAULT_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";
/// Hard cap on webhook request bodies (256 KiB) unless overridden.
pub const DEFAULT_MAX_BODY_BYTES: usize = 256 * 1024;
/// Default wall-clock budget for a single agent run.
pub const DEFAULT_RUN_TIMEOUT_SECS: u64 = 600;
/// Bound on how long active runs may drain during graceful shutdown.
pub const SHUTDOWN_GRACE_SECS: u64 = 5;

/// Top-level config (hermod.toml + HERMOD_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HermodConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub runs: RunsConfig,
    #[serde(default)]
    pub reply: ReplyConfig,
    /// Per-surface gate configuration, keyed by surface name.
    /// A surface with no block here is disabled.
    #[serde(default)]
    pub surfaces: HashMap<String, SurfaceConfig>,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub webhooks: WebhooksConfig,
}

impl Default for HermodConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            session: SessionConfig::default(),
            queue: QueueConfig::default(),
            runs: RunsConfig::default(),
            reply: ReplyConfig::default(),
            surfaces: HashMap::new(),
            heartbeat: HeartbeatConfig::default(),
            webhooks: WebhooksConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Shared token for the webhook surface. Accepted via
    /// `Authorization: Bearer`, `X-Gateway-Token`, or `?token=`.
    pub token: Option<String>,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            token: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub scope: SessionScope,
    /// Key used by `SessionScope::Global`.
    #[serde(default = "default_main_key")]
    pub main_key: String,
    /// Sessions idle longer than this are eligible for eviction.
    #[serde(default = "default_idle_minutes")]
    pub idle_minutes: u64,
    /// Bound on the per-session history window; oldest entries drop first.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Trimmed-body strings that drop the session and start a fresh one.
    #[serde(default)]
    pub reset_triggers: Vec<String>,
    /// Root for persisted state; the store lives at
    /// `<state_dir>/sessions/sessions.json`.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scope: SessionScope::default(),
            main_key: default_main_key(),
            idle_minutes: default_idle_minutes(),
            history_limit: default_history_limit(),
            reset_triggers: Vec::new(),
            state_dir: default_state_dir(),
        }
    }
}

/// What to do with an input that arrives while the session's run is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueMode {
    /// Preempt the running agent's next turn in place; the run continues.
    Steer,
    /// Append to the run's input buffer; delivered as the next user turn.
    Followup,
    /// Hold until the run ends, then start one run over the combined backlog.
    #[default]
    Collect,
    /// Like `steer`, but the backlog is also retained for the next run.
    SteerBacklog,
    /// Cancel the current run, then start a new one with the queued input.
    Interrupt,
}

/// Which queued item to sacrifice when the backlog exceeds `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DropRule {
    /// Discard the oldest queued item.
    Old,
    /// Reject the incoming item.
    New,
    /// Collapse the backlog into one synthetic summary item.
    #[default]
    Summarize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub mode: QueueMode,
    /// Inputs arriving within this window coalesce before policy evaluation.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_queue_cap")]
    pub cap: usize,
    #[serde(default)]
    pub drop: DropRule,
    /// Per-surface mode overrides.
    #[serde(default)]
    pub by_surface: HashMap<String, QueueMode>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            mode: QueueMode::default(),
            debounce_ms: default_debounce_ms(),
            cap: default_queue_cap(),
            drop: DropRule::default(),
            by_surface: HashMap::new(),
        }
    }
}

impl QueueConfig {
    /// Effective mode for a surface, honouring `by_surface` overrides.
    pub fn mode_for(&self, surface: &str) -> QueueMode {
        self.by_surface.get(surface).copied().unwrap_or(self.mode)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunsConfig {
    /// Global cap on concurrent agent runs; excess submissions queue FIFO.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_run_timeout")]
    pub timeout_seconds: u64,
    /// Default model passed to the runner; jobs and webhooks may override.
    pub model: Option<String>,
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            timeout_seconds: default_run_timeout(),
            model: None,
        }
    }
}

/// Preferred break point when slicing assistant output into blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakPreference {
    #[default]
    Paragraph,
    Newline,
    Sentence,
}

/// Which stream boundary flushes a partially filled block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockBreak {
    TextEnd,
    #[default]
    MessageEnd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default)]
    pub break_preference: BreakPreference,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            min_chars: default_min_chars(),
            max_chars: default_max_chars(),
            break_preference: BreakPreference::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplyConfig {
    /// When set, only `<final>…</final>` content is published.
    #[serde(default)]
    pub enforce_final_tag: bool,
    #[serde(default)]
    pub block_reply_break: BlockBreak,
    #[serde(default)]
    pub chunking: ChunkingConfig,
}

/// Gate configuration for one surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfaceConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// DM allowlist. `None` disables the check; an empty list means
    /// "own identity only" (self-chat mode).
    pub allow_from: Option<Vec<String>>,
    /// The bot's own identity on this surface, used by self-chat mode.
    pub self_id: Option<String>,
    /// Case-insensitive regex patterns that count as a mention.
    #[serde(default)]
    pub mention_patterns: Vec<String>,
    /// Surface-level default for `require_mention` in groups.
    pub require_mention: Option<bool>,
    /// Optional prompt template for accepted events. Supports the full
    /// `{{…}}` vocabulary (`{{Body}}`, `{{SenderName}}`, `{{Surface}}`, …);
    /// when absent the stripped body is submitted as-is.
    pub message_template: Option<String>,
    /// Group descriptors keyed by platform group id (or `"*"` wildcard).
    #[serde(default)]
    pub groups: HashMap<String, GroupConfig>,
}

impl SurfaceConfig {
    /// Self-chat mode: an allowlist is present but empty, so only the bot's
    /// own identity may talk to it.
    pub fn is_self_chat(&self) -> bool {
        self.allow_from.as_ref().is_some_and(|l| l.is_empty())
    }

    /// Resolve a group descriptor by id (preferred), slug, then wildcard.
    pub fn resolve_group(&self, id: Option<&str>, subject: Option<&str>) -> Option<&GroupConfig> {
        if let Some(id) = id {
            if let Some(g) = self.groups.get(id) {
                return Some(g);
            }
        }
        if let Some(subject) = subject {
            if let Some(g) = self
                .groups
                .values()
                .find(|g| g.slug.as_deref().is_some_and(|s| s.eq_ignore_ascii_case(subject)))
            {
                return Some(g);
            }
        }
        self.groups.get("*")
    }
}

/// Per-group overrides; deeper settings win over the surface defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Human-readable name used when the platform id is unavailable.
    pub slug: Option<String>,
    pub require_mention: Option<bool>,
    /// Tightens the sender set inside this group when present.
    pub allow_from: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default)]
    pub jobs: Vec<HeartbeatJobConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatJobConfig {
    /// Session key the wakeup runs against.
    #[serde(default = "default_main_key")]
    pub session: String,
    /// Cadence, humantime syntax (e.g. `"30m"`, `"1h 15m"`).
    pub every: String,
    /// Prompt submitted on each fire.
    #[serde(default = "default_heartbeat_prompt")]
    pub prompt: String,
    /// `"last"`, `"none"`, or a surface name.
    #[serde(default = "default_heartbeat_target")]
    pub target: String,
    pub model: Option<String>,
}

impl HeartbeatJobConfig {
    pub fn cadence(&self) -> Option<std::time::Duration> {
        humantime::parse_duration(&self.every).ok()
    }
}

/// How a named webhook mapping authenticates, on top of the gateway token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookAuthMode {
    /// Gateway token only (the default).
    #[default]
    Token,
    /// Additionally verify an HMAC-SHA256 signature over the raw body
    /// (GitHub-style `X-Hub-Signature-256`).
    HmacSha256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookAction {
    Wake,
    #[default]
    Agent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WakeMode {
    #[default]
    Now,
    NextHeartbeat,
}

/// Translates `POST /hooks/<name>` into a wake pulse or an agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookMapping {
    pub name: String,
    /// Path segment to match; defaults to `name`.
    pub match_path: Option<String>,
    /// Alternatively match the payload's top-level `source` field.
    pub match_source: Option<String>,
    #[serde(default)]
    pub action: HookAction,
    /// Session key template (`{{…}}` substitution against the payload).
    pub session_key: Option<String>,
    /// Message template for `action = agent`.
    pub message: Option<String>,
    #[serde(default)]
    pub wake_mode: WakeMode,
    /// Name of a registered payload transform applied before dispatch.
    pub transform: Option<String>,
    #[serde(default)]
    pub auth_mode: HookAuthMode,
    /// HMAC signing secret when `auth_mode = hmac-sha256`.
    pub secret: Option<String>,
    /// Delivery surface for the agent's reply; `None` keeps it store-only.
    pub deliver: Option<String>,
    pub to: Option<String>,
}

impl WebhookMapping {
    pub fn matches(&self, path: &str, payload: &serde_json::Value) -> bool {
        if let Some(p) = self.match_path.as_deref() {
            if p == path {
                return true;
            }
        } else if self.name == path {
            return true;
        }
        if let Some(src) = self.match_source.as_deref() {
            return payload.get("source").and_then(|v| v.as_str()) == Some(src);
        }
        false
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhooksConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mappings: Vec<WebhookMapping>,
}

fn bool_true() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}
fn default_main_key() -> String {
    "main".to_string()
}
fn default_idle_minutes() -> u64 {
    60
}
fn default_history_limit() -> usize {
    50
}
fn default_state_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.hermod", home)
}
fn default_debounce_ms() -> u64 {
    700
}
fn default_queue_cap() -> usize {
    10
}
fn default_max_concurrent() -> usize {
    4
}
fn default_run_timeout() -> u64 {
    DEFAULT_RUN_TIMEOUT_SECS
}
fn default_min_chars() -> usize {
    800
}
fn default_max_chars() -> usize {
    1200
}
fn default_heartbeat_prompt() -> String {
    "HEARTBEAT".to_string()
}
fn default_heartbeat_target() -> String {
    "last".to_string()
}

impl HermodConfig {
    /// Load config from a TOML file with HERMOD_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. HERMOD_CONFIG env var
    ///   3. ~/.hermod/hermod.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("HERMOD_CONFIG").ok())
            .unwrap_or_else(default_config_path);

        let mut config: HermodConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("HERMOD_").split("_"))
            .extract()
            .map_err(|e| crate::error::HermodError::Config(e.to_string()))?;

        config.validate();
        Ok(config)
    }

    /// Post-load validation. Never fails: invalid mention patterns are
    /// dropped with a warning, suspicious values get a log line.
    pub fn validate(&mut self) {
        for (name, surface) in self.surfaces.iter_mut() {
            surface.mention_patterns.retain(|pattern| {
                match regex::RegexBuilder::new(pattern).case_insensitive(true).build() {
                    Ok(_) => true,
                    Err(e) => {
                        warn!(surface = %name, %pattern, error = %e, "invalid mention pattern skipped");
                        false
                    }
                }
            });
        }

        // `interrupt` kept its name but changed meaning over time: it now
        // cancels the active run and restarts, while `steer` preempts in
        // place. Flag configs that still use it so operators re-check intent.
        let mut modes: Vec<(String, QueueMode)> =
            vec![("queue.mode".to_string(), self.queue.mode)];
        for (surface, mode) in &self.queue.by_surface {
            modes.push((format!("queue.by_surface.{surface}"), *mode));
        }
        for (path, mode) in modes {
            if mode == QueueMode::Interrupt {
                warn!(
                    %path,
                    "queue mode 'interrupt' cancels the active run and restarts; \
                     use 'steer' to preempt without cancelling"
                );
            }
        }

        for job in &self.heartbeat.jobs {
            if job.cadence().is_none() {
                warn!(session = %job.session, every = %job.every, "unparseable heartbeat cadence; job will not fire");
            }
        }

        if self.reply.chunking.min_chars >= self.reply.chunking.max_chars {
            warn!(
                min = self.reply.chunking.min_chars,
                max = self.reply.chunking.max_chars,
                "chunking min_chars >= max_chars; falling back to defaults"
            );
            self.reply.chunking = ChunkingConfig::default();
        }
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.hermod/hermod.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = HermodConfig::default();
        assert_eq!(cfg.gateway.port, DEFAULT_PORT);
        assert_eq!(cfg.queue.mode, QueueMode::Collect);
        assert_eq!(cfg.runs.timeout_seconds, 600);
        assert_eq!(cfg.reply.chunking.min_chars, 800);
        assert_eq!(cfg.reply.chunking.max_chars, 1200);
    }

    #[test]
    fn queue_mode_surface_override() {
        let mut cfg = QueueConfig::default();
        cfg.by_surface.insert("telegram".into(), QueueMode::Steer);
        assert_eq!(cfg.mode_for("telegram"), QueueMode::Steer);
        assert_eq!(cfg.mode_for("discord"), QueueMode::Collect);
    }

    #[test]
    fn validate_drops_invalid_mention_pattern() {
        let mut cfg = HermodConfig::default();
        cfg.surfaces.insert(
            "telegram".into(),
            SurfaceConfig {
                enabled: true,
                allow_from: None,
                self_id: None,
                mention_patterns: vec!["@bot".into(), "(unclosed".into()],
                require_mention: None,
                message_template: None,
                groups: HashMap::new(),
            },
        );
        cfg.validate();
        assert_eq!(cfg.surfaces["telegram"].mention_patterns, vec!["@bot"]);
    }

    #[test]
    fn validate_resets_inverted_chunk_window() {
        let mut cfg = HermodConfig::default();
        cfg.reply.chunking.min_chars = 500;
        cfg.reply.chunking.max_chars = 100;
        cfg.validate();
        assert_eq!(cfg.reply.chunking.min_chars, 800);
    }

    #[test]
    fn self_chat_is_empty_allowlist() {
        let mut s = SurfaceConfig {
            enabled: true,
            allow_from: Some(Vec::new()),
            self_id: Some("+15555550123".into()),
            mention_patterns: Vec::new(),
            require_mention: None,
            message_template: None,
            groups: HashMap::new(),
        };
        assert!(s.is_self_chat());
        s.allow_from = Some(vec!["+1444".into()]);
        assert!(!s.is_self_chat());
        s.allow_from = None;
        assert!(!s.is_self_chat());
    }

    #[test]
    fn group_resolution_prefers_id_then_slug_then_wildcard() {
        let mut groups = HashMap::new();
        groups.insert(
            "g-1".to_string(),
            GroupConfig {
                slug: Some("ops".into()),
                require_mention: Some(false),
                allow_from: None,
            },
        );
        groups.insert("*".to_string(), GroupConfig::default());
        let s = SurfaceConfig {
            enabled: true,
            allow_from: None,
            self_id: None,
            mention_patterns: Vec::new(),
            require_mention: None,
            message_template: None,
            groups,
        };

        assert_eq!(
            s.resolve_group(Some("g-1"), None).unwrap().require_mention,
            Some(false)
        );
        assert_eq!(
            s.resolve_group(Some("nope"), Some("OPS")).unwrap().require_mention,
            Some(false)
        );
        // Unknown id and subject fall through to the wildcard.
        assert!(s.resolve_group(Some("nope"), Some("random")).is_some());
    }

    #[test]
    fn mapping_matches_path_and_source() {
        let m = WebhookMapping {
            name: "gh".into(),
            match_path: None,
            match_source: Some("github".into()),
            action: HookAction::Agent,
            session_key: None,
            message: None,
            wake_mode: WakeMode::Now,
            transform: None,
            auth_mode: HookAuthMode::Token,
            secret: None,
            deliver: None,
            to: None,
        };
        assert!(m.matches("gh", &serde_json::json!({})));
        assert!(m.matches("other", &serde_json::json!({"source": "github"})));
        assert!(!m.matches("other", &serde_json::json!({"source": "gitlab"})));
    }
}
