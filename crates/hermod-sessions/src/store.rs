//! Debounced JSON-document session store.
//!
//! The store is a single document at `<state_dir>/sessions/sessions.json`
//! mapping session key → [`SessionEntry`]. Writes are debounced: the writer
//! task waits for a 250 ms quiet period but never defers a dirty document
//! longer than 2 s. Write failures are logged and retried on the next change;
//! the in-memory table stays authoritative throughout.
//!
//! A corrupted document is renamed with a timestamp suffix and a fresh one is
//! started. History is sacrificed, the process keeps running.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::types::SessionEntry;

/// Quiet period before a dirty document is written.
const DEBOUNCE_MIN: Duration = Duration::from_millis(250);
/// Upper bound on how long a dirty document may wait.
const DEBOUNCE_MAX: Duration = Duration::from_secs(2);

pub type StoreDocument = HashMap<String, SessionEntry>;

pub struct SessionStore {
    path: PathBuf,
    tx: watch::Sender<StoreDocument>,
}

impl SessionStore {
    /// Open (or create) the store under `state_dir` and read the current
    /// document. Returns the store handle plus the loaded entries.
    pub fn open(state_dir: &str) -> Result<(Self, StoreDocument)> {
        let dir = Path::new(state_dir).join("sessions");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("sessions.json");
        let doc = load_document(&path);
        let (tx, _) = watch::channel(doc.clone());
        Ok((Self { path, tx }, doc))
    }

    /// Replace the pending document. Latest snapshot wins; the writer task
    /// decides when it reaches disk.
    pub fn persist(&self, doc: StoreDocument) {
        // send_replace never fails even with no live receivers.
        self.tx.send_replace(doc);
    }

    /// Spawn the debounced writer loop. The task exits (after a final flush)
    /// once the store handle is dropped.
    pub fn spawn_writer(&self) -> JoinHandle<()> {
        let mut rx = self.tx.subscribe();
        let path = self.path.clone();
        tokio::spawn(async move {
            loop {
                if rx.changed().await.is_err() {
                    break;
                }
                let first_dirty = Instant::now();
                loop {
                    let quiet = tokio::time::sleep(DEBOUNCE_MIN);
                    tokio::pin!(quiet);
                    tokio::select! {
                        _ = &mut quiet => break,
                        changed = rx.changed() => {
                            if changed.is_err() || first_dirty.elapsed() >= DEBOUNCE_MAX {
                                break;
                            }
                        }
                    }
                }
                let doc = rx.borrow_and_update().clone();
                if let Err(e) = write_document(&path, &doc) {
                    // In-memory state stays authoritative; the next change retries.
                    error!(path = %path.display(), error = %e, "session store write failed");
                }
            }
            // Final flush on shutdown.
            let doc = rx.borrow().clone();
            if let Err(e) = write_document(&path, &doc) {
                error!(path = %path.display(), error = %e, "session store final flush failed");
            }
        })
    }

    /// Write the current document immediately, bypassing the debounce.
    pub fn flush_now(&self) -> Result<()> {
        let doc = self.tx.borrow().clone();
        write_document(&self.path, &doc)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Best-effort read. Missing file → empty document. Corrupted file →
/// quarantined with a timestamp suffix, empty document.
fn load_document(path: &Path) -> StoreDocument {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return StoreDocument::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "session store unreadable; starting empty");
            return StoreDocument::new();
        }
    };

    match serde_json::from_str(&raw) {
        Ok(doc) => doc,
        Err(e) => {
            let quarantine = path.with_file_name(format!(
                "sessions.json.corrupt-{}",
                Utc::now().timestamp()
            ));
            warn!(
                path = %path.display(),
                quarantine = %quarantine.display(),
                error = %e,
                "session store corrupted; quarantining and starting fresh"
            );
            if let Err(e) = std::fs::rename(path, &quarantine) {
                error!(error = %e, "failed to quarantine corrupted store");
            }
            StoreDocument::new()
        }
    }
}

/// Atomic write: serialise to a sibling temp file, then rename over the
/// document.
fn write_document(path: &Path, doc: &StoreDocument) -> Result<()> {
    let json = serde_json::to_string_pretty(doc)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    info!(path = %path.display(), sessions = doc.len(), "session store written");
    Ok(())
}
