//! Webhook ingress: the token-gated HTTP entry that translates external
//! events into wake pulses or full agent runs.
//!
//! Endpoints:
//! - `POST /hooks/wake`:   `{text, mode?}`, immediate wake or defer to the
//!   next heartbeat
//! - `POST /hooks/agent`:  `{message, name?, sessionKey?, wakeMode?,
//!   deliver?, channel?, to?}`: create/reuse a session and submit a run
//! - `POST /hooks/<name>`: resolved through configured mappings with
//!   `{{path.to.field}}` substitution against the JSON body
//!
//! Auth is `Authorization: Bearer`, `X-Gateway-Token`, or `?token=`; wrong or
//! missing token is 401 and never touches sessions. Oversized bodies are 413,
//! non-JSON bodies 400.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, RawQuery, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{info, warn};

use hermod_core::config::{HookAction, HookAuthMode, WakeMode, WebhookMapping};
use hermod_core::template::{expand, TemplateVars};
use hermod_runs::coordinator::{SubmitOptions, SubmitOutcome};

use crate::app::AppState;
use crate::auth::authorize;
use crate::pipeline::spawn_reply_forwarder;

type HmacSha256 = Hmac<Sha256>;

type HookError = (StatusCode, Json<Value>);

// ── Public handlers ──────────────────────────────────────────────────────────

/// POST /hooks/wake
pub async fn wake_handler(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, HookError> {
    guard(&state.snapshot(), &headers, query.as_deref(), &body)?;
    let payload = parse_json(&body)?;

    let Some(text) = payload.get("text").and_then(Value::as_str) else {
        return Err(bad_request("missing 'text' field"));
    };
    let mode = parse_wake_mode(payload.get("mode"))?;

    info!(?mode, "wake hook accepted");
    state.heartbeat.wake(text, mode);
    Ok(Json(json!({ "ok": true })))
}

/// POST /hooks/agent
pub async fn agent_handler(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, HookError> {
    guard(&state.snapshot(), &headers, query.as_deref(), &body)?;
    let payload = parse_json(&body)?;

    let Some(message) = payload.get("message").and_then(Value::as_str) else {
        return Err(bad_request("missing 'message' field"));
    };
    let name = payload
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("agent");

    if parse_wake_mode(payload.get("wakeMode"))? == WakeMode::NextHeartbeat {
        state.heartbeat.wake(message, WakeMode::NextHeartbeat);
        return Ok(Json(json!({ "ok": true, "deferred": true })));
    }

    let session_key = match payload.get("sessionKey").and_then(Value::as_str) {
        Some(template) => expand(template, &TemplateVars::new(), Some(&payload)),
        None => format!("webhook:{name}"),
    };

    let deliver = payload
        .get("deliver")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let channel = payload.get("channel").and_then(Value::as_str);
    let to = payload.get("to").and_then(Value::as_str).unwrap_or("");

    let delivery = if deliver {
        channel.map(|c| (c.to_string(), to.to_string()))
    } else {
        None
    };

    let outcome = submit_run(&state, &session_key, message, delivery, to);
    Ok(Json(outcome_json(&session_key, &outcome)))
}

/// POST /hooks/{name}, resolved through configured mappings.
pub async fn named_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, HookError> {
    let snapshot = state.snapshot();
    guard(&snapshot, &headers, query.as_deref(), &body)?;
    let payload = parse_json(&body)?;

    if !snapshot.config.webhooks.enabled {
        return Err(not_found("webhook mappings are disabled"));
    }
    let mapping = snapshot
        .config
        .webhooks
        .mappings
        .iter()
        .find(|m| m.matches(&name, &payload))
        .ok_or_else(|| {
            warn!(hook = %name, "no mapping matched");
            not_found("no mapping for this hook")
        })?;

    if mapping.auth_mode == HookAuthMode::HmacSha256 {
        verify_hmac_sha256(&headers, &body, mapping.secret.as_deref())
            .map_err(|reason| auth_error(&reason))?;
    }

    let payload = apply_transform(&state, mapping, payload);
    info!(hook = %name, action = ?mapping.action, "webhook mapping matched");

    match mapping.action {
        HookAction::Wake => {
            let text = mapping
                .message
                .as_deref()
                .map(|t| expand(t, &TemplateVars::new(), Some(&payload)))
                .or_else(|| payload.get("text").and_then(Value::as_str).map(String::from))
                .unwrap_or_else(|| payload.to_string());
            state.heartbeat.wake(&text, mapping.wake_mode);
            Ok(Json(json!({ "ok": true })))
        }
        HookAction::Agent => {
            let session_key = mapping
                .session_key
                .as_deref()
                .map(|t| expand(t, &TemplateVars::new(), Some(&payload)))
                .unwrap_or_else(|| format!("webhook:{name}"));
            let message = mapping
                .message
                .as_deref()
                .map(|t| expand(t, &TemplateVars::new(), Some(&payload)))
                .unwrap_or_else(|| format!("[webhook:{name}] {payload}"));

            if mapping.wake_mode == WakeMode::NextHeartbeat {
                state.heartbeat.wake(&message, WakeMode::NextHeartbeat);
                return Ok(Json(json!({ "ok": true, "deferred": true })));
            }

            let to = mapping.to.as_deref().unwrap_or("");
            let delivery = mapping
                .deliver
                .as_deref()
                .map(|surface| (surface.to_string(), to.to_string()));
            let outcome = submit_run(&state, &session_key, &message, delivery, to);
            Ok(Json(outcome_json(&session_key, &outcome)))
        }
    }
}

// ── Request guards ───────────────────────────────────────────────────────────

/// Token auth, then body size. Auth failures never touch sessions.
fn guard(
    snapshot: &crate::app::ConfigSnapshot,
    headers: &HeaderMap,
    query: Option<&str>,
    body: &Bytes,
) -> Result<(), HookError> {
    if !authorize(snapshot.config.gateway.token.as_deref(), headers, query) {
        warn!("webhook authentication failed");
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "unauthorized" })),
        ));
    }
    let max = snapshot.config.gateway.max_body_bytes;
    if body.len() > max {
        return Err((
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(json!({ "error": "payload too large", "max_bytes": max })),
        ));
    }
    Ok(())
}

fn parse_json(body: &Bytes) -> Result<Value, HookError> {
    serde_json::from_slice(body).map_err(|e| {
        warn!(error = %e, "invalid JSON in webhook body");
        bad_request("invalid JSON body")
    })
}

fn parse_wake_mode(value: Option<&Value>) -> Result<WakeMode, HookError> {
    match value.and_then(Value::as_str) {
        None => Ok(WakeMode::Now),
        Some("now") => Ok(WakeMode::Now),
        Some("next-heartbeat") => Ok(WakeMode::NextHeartbeat),
        Some(other) => Err(bad_request(&format!("unknown wake mode: {other}"))),
    }
}

// ── Dispatch helpers ─────────────────────────────────────────────────────────

fn submit_run(
    state: &Arc<AppState>,
    session_key: &str,
    message: &str,
    delivery: Option<(String, String)>,
    to: &str,
) -> SubmitOutcome {
    state.sessions.ensure(session_key, "webhook", to);

    let (reply_tx, reply_rx) = tokio::sync::mpsc::channel(64);
    match delivery {
        Some((surface, to)) => {
            spawn_reply_forwarder(Arc::clone(state), surface, to, reply_rx)
        }
        None => {
            // Store-only run: keep the reply stream drained.
            let mut rx = reply_rx;
            tokio::spawn(async move { while rx.recv().await.is_some() {} });
        }
    }

    state.coordinator.submit(
        session_key,
        message,
        SubmitOptions {
            surface: Some("webhook".to_string()),
            model: None,
            reply_tx,
        },
    )
}

fn outcome_json(session_key: &str, outcome: &SubmitOutcome) -> Value {
    match outcome {
        SubmitOutcome::Started { run_id } => {
            json!({ "ok": true, "sessionKey": session_key, "runId": run_id })
        }
        SubmitOutcome::Steered { run_id } => {
            json!({ "ok": true, "sessionKey": session_key, "runId": run_id, "steered": true })
        }
        SubmitOutcome::Queued { backlog_len, .. } => {
            json!({ "ok": true, "sessionKey": session_key, "queued": true, "backlog": backlog_len })
        }
        SubmitOutcome::Interrupting { run_id } => {
            json!({ "ok": true, "sessionKey": session_key, "interrupted": run_id })
        }
        SubmitOutcome::Dropped => {
            json!({ "ok": false, "sessionKey": session_key, "dropped": true })
        }
    }
}

fn apply_transform(state: &AppState, mapping: &WebhookMapping, payload: Value) -> Value {
    let Some(name) = mapping.transform.as_deref() else {
        return payload;
    };
    match state.transforms.get(name).map(|t| Arc::clone(t.value())) {
        Some(transform) => transform(payload),
        None => {
            warn!(transform = %name, "referenced transform is not registered; payload unchanged");
            payload
        }
    }
}

// ── Auth helpers ─────────────────────────────────────────────────────────────

/// Verify GitHub-style HMAC-SHA256: `sha256=<hex>` in X-Hub-Signature-256.
fn verify_hmac_sha256(
    headers: &HeaderMap,
    body: &Bytes,
    secret: Option<&str>,
) -> Result<(), String> {
    let secret = secret.ok_or_else(|| "no HMAC secret configured for this mapping".to_string())?;

    let sig_header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| "missing X-Hub-Signature-256 header".to_string())?;

    let sig_hex = sig_header
        .strip_prefix("sha256=")
        .ok_or_else(|| "malformed X-Hub-Signature-256 header".to_string())?;

    let expected =
        hex::decode(sig_hex).map_err(|_| "X-Hub-Signature-256 is not valid hex".to_string())?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| "invalid HMAC key length".to_string())?;
    mac.update(body);

    mac.verify_slice(&expected)
        .map_err(|_| "HMAC signature mismatch".to_string())
}

// ── Error helpers ────────────────────────────────────────────────────────────

fn bad_request(reason: &str) -> HookError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": reason })))
}

fn not_found(reason: &str) -> HookError {
    (StatusCode::NOT_FOUND, Json(json!({ "error": reason })))
}

fn auth_error(reason: &str) -> HookError {
    warn!(%reason, "webhook HMAC verification failed");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "authentication failed", "reason": reason })),
    )
}
