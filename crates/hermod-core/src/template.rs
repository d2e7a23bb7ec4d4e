//! `{{…}}` template expansion for webhook session keys, message templates,
//! and configured agent prompts.
//!
//! Two substitution sources, tried in order:
//! 1. the fixed event vocabulary (`{{Body}}`, `{{From}}`, `{{SessionId}}`, …)
//! 2. dotted paths into the JSON payload (`{{messages[0].subject}}`)
//!
//! Placeholders that resolve to nothing are left untouched, so a template
//! expanded against an empty payload round-trips unchanged.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::types::InboundEvent;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\[\]\-]+)\s*\}\}").unwrap())
}

/// The fixed substitution vocabulary derived from an inbound event.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    map: HashMap<String, String>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.map.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    /// Populate the full vocabulary from an event plus session context.
    pub fn from_event(
        event: &InboundEvent,
        body_stripped: &str,
        session_id: &str,
        is_new_session: bool,
    ) -> Self {
        let mut vars = Self::new();
        vars.set("Body", event.body.clone())
            .set("BodyStripped", body_stripped)
            .set("From", event.from.clone())
            .set("To", event.to.clone())
            .set("MessageId", event.message_id.clone())
            .set("SessionId", session_id)
            .set("IsNewSession", if is_new_session { "true" } else { "false" })
            .set("ChatType", event.chat_type.to_string())
            .set("Surface", event.surface.as_str());
        if let Some(t) = &event.transcript {
            vars.set("Transcript", t.clone());
        }
        if let Some(s) = &event.group_subject {
            vars.set("GroupSubject", s.clone());
        }
        if let Some(n) = &event.sender_name {
            vars.set("SenderName", n.clone());
        }
        if let Some(m) = event.media.first() {
            if let Some(url) = &m.url {
                vars.set("MediaUrl", url.clone());
            }
            if let Some(path) = &m.path {
                vars.set("MediaPath", path.clone());
            }
            if let Some(mime) = &m.mime {
                vars.set("MediaType", mime.clone());
            }
        }
        vars
    }
}

/// Expand every `{{key}}` placeholder against `vars`, then `payload` paths.
/// Unresolvable placeholders are returned verbatim.
pub fn expand(template: &str, vars: &TemplateVars, payload: Option<&Value>) -> String {
    placeholder_re()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            if let Some(v) = vars.get(key) {
                return v.to_string();
            }
            if let Some(payload) = payload {
                if let Some(v) = lookup_path(payload, key) {
                    return v;
                }
            }
            caps[0].to_string()
        })
        .into_owned()
}

/// Resolve a dotted path with optional `[index]` segments into a JSON value.
/// Scalars render bare; arrays/objects render as compact JSON.
fn lookup_path(payload: &Value, path: &str) -> Option<String> {
    let mut current = payload;
    for segment in path.split('.') {
        let (field, indexes) = split_indexes(segment)?;
        if !field.is_empty() {
            current = current.get(field)?;
        }
        for idx in indexes {
            current = current.get(idx)?;
        }
    }
    Some(render(current))
}

/// Split `"messages[0][1]"` into `("messages", [0, 1])`.
fn split_indexes(segment: &str) -> Option<(&str, Vec<usize>)> {
    let Some(bracket) = segment.find('[') else {
        return Some((segment, Vec::new()));
    };
    let field = &segment[..bracket];
    let mut indexes = Vec::new();
    let mut rest = &segment[bracket..];
    while let Some(stripped) = rest.strip_prefix('[') {
        let close = stripped.find(']')?;
        indexes.push(stripped[..close].parse().ok()?);
        rest = &stripped[close + 1..];
    }
    if rest.is_empty() {
        Some((field, indexes))
    } else {
        None
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
