//! Inbound event gating.
//!
//! The gate is a pure function from `(InboundEvent, per-surface config)` to
//! accept/reject. It never mutates state and never fails: anything it cannot
//! make sense of becomes `Reject("malformed")`.
//!
//! Rules, evaluated in order:
//! 1. surface enabled
//! 2. DM allowlist (empty list = own identity only, "self-chat")
//! 3. group descriptor resolution (id, slug, `"*"` wildcard)
//! 4. mention requirement (native mention or pattern hit; native mentions
//!    are ignored in self-chat mode, where every message carries the flag)
//! 5. per-group overrides, which win over surface defaults

use std::collections::HashMap;

use hermod_core::config::SurfaceConfig;
use hermod_core::types::{ChatType, InboundEvent};
use tracing::debug;

use crate::mention::MentionMatcher;

/// Context the gate hands to the session resolver on accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHint {
    /// Resolved group id for group chats, `None` for DMs.
    pub group_id: Option<String>,
    /// Body with a leading mention token removed.
    pub body_stripped: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateVerdict {
    Accept(SessionHint),
    Reject(&'static str),
}

impl GateVerdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, GateVerdict::Accept(_))
    }
}

struct CompiledSurface {
    config: SurfaceConfig,
    mentions: MentionMatcher,
}

/// The inbound gate, holding per-surface config with precompiled mention
/// patterns. Built once from validated config; rebuilt on config reload.
pub struct Gate {
    surfaces: HashMap<String, CompiledSurface>,
}

impl Gate {
    pub fn new(surfaces: &HashMap<String, SurfaceConfig>) -> Self {
        let surfaces = surfaces
            .iter()
            .map(|(name, cfg)| {
                let mentions = MentionMatcher::compile(name, &cfg.mention_patterns);
                (
                    name.clone(),
                    CompiledSurface {
                        config: cfg.clone(),
                        mentions,
                    },
                )
            })
            .collect();
        Self { surfaces }
    }

    /// Evaluate the gate rules for one event.
    pub fn check(&self, event: &InboundEvent) -> GateVerdict {
        if !event.is_well_formed() {
            return GateVerdict::Reject("malformed");
        }

        let Some(surface) = self.surfaces.get(event.surface.as_str()) else {
            return GateVerdict::Reject("surface-disabled");
        };
        if !surface.config.enabled {
            return GateVerdict::Reject("surface-disabled");
        }

        match event.chat_type {
            ChatType::Direct => self.check_direct(event, surface),
            ChatType::Group => self.check_group(event, surface),
        }
    }

    fn check_direct(&self, event: &InboundEvent, surface: &CompiledSurface) -> GateVerdict {
        if let Some(allow) = &surface.config.allow_from {
            let own = surface.config.self_id.as_deref().unwrap_or(&event.to);
            let permitted = if allow.is_empty() {
                event.from == own
            } else {
                sender_allowed(allow, &event.from)
            };
            if !permitted {
                debug!(surface = %event.surface, from = %event.from, "DM sender not in allowlist");
                return GateVerdict::Reject("sender-not-allowed");
            }
        }

        GateVerdict::Accept(SessionHint {
            group_id: None,
            body_stripped: event.body_stripped(surface.mentions.patterns()),
        })
    }

    fn check_group(&self, event: &InboundEvent, surface: &CompiledSurface) -> GateVerdict {
        let group = surface
            .config
            .resolve_group(event.group_id.as_deref(), event.group_subject.as_deref());
        let Some(group) = group else {
            return GateVerdict::Reject("group-not-configured");
        };

        if let Some(allow) = &group.allow_from {
            if !sender_allowed(allow, &event.from) {
                return GateVerdict::Reject("sender-not-allowed");
            }
        }

        // Groups require a mention unless a deeper override loosens it.
        let require_mention = group
            .require_mention
            .or(surface.config.require_mention)
            .unwrap_or(true);

        if require_mention && !self.mention_satisfied(event, surface) {
            return GateVerdict::Reject("mention-required");
        }

        let group_id = event
            .group_id
            .clone()
            .or_else(|| event.group_subject.clone())
            .unwrap_or_else(|| event.to.clone());

        GateVerdict::Accept(SessionHint {
            group_id: Some(group_id),
            body_stripped: event.body_stripped(surface.mentions.patterns()),
        })
    }

    /// A mention is either a native metadata mention or a pattern hit.
    ///
    /// In self-chat mode the platform flags every message from the owner as
    /// mentioning the bot, so metadata mentions carry no signal and only
    /// text patterns count.
    fn mention_satisfied(&self, event: &InboundEvent, surface: &CompiledSurface) -> bool {
        let self_chat = self.is_self_chat(&surface.config);
        if event.mentions_bot && !self_chat {
            return true;
        }
        event.text_mention_hit || surface.mentions.hit(&event.body)
    }

    /// Self-chat: an empty allowlist, or one that names only the bot's own
    /// identity.
    fn is_self_chat(&self, config: &SurfaceConfig) -> bool {
        let Some(allow) = &config.allow_from else {
            return false;
        };
        if allow.is_empty() {
            return true;
        }
        config
            .self_id
            .as_deref()
            .is_some_and(|own| allow.iter().all(|entry| entry == own))
    }
}

/// Allowlist matching: `"*"` allows everyone, otherwise exact sender match.
fn sender_allowed(allow: &[String], from: &str) -> bool {
    allow.iter().any(|entry| entry == "*" || entry == from)
}
