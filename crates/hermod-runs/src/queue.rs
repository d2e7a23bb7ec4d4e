//! Backlog bookkeeping for inputs that arrive while a run is active.
//!
//! The disposition of a queued input is fixed at enqueue time and never
//! rewritten. The backlog is bounded by the configured cap; overflow applies
//! the drop rule (`old` / `new` / `summarize`).

use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::debug;

use hermod_core::config::{DropRule, QueueMode};

/// Why a queued item exists, decided when it was enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Steer,
    Followup,
    Collect,
}

impl Disposition {
    pub fn for_mode(mode: QueueMode) -> Self {
        match mode {
            QueueMode::Steer => Disposition::Steer,
            QueueMode::Followup => Disposition::Followup,
            QueueMode::Collect | QueueMode::SteerBacklog | QueueMode::Interrupt => {
                Disposition::Collect
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BacklogItem {
    pub text: String,
    pub disposition: Disposition,
    pub enqueued_at: DateTime<Utc>,
    /// How many raw inputs this item represents (>1 after summarize/coalesce).
    pub count: u32,
}

impl BacklogItem {
    fn new(text: String, disposition: Disposition) -> Self {
        Self {
            text,
            disposition,
            enqueued_at: Utc::now(),
            count: 1,
        }
    }
}

/// Bounded FIFO of inputs waiting for the active run to finish.
#[derive(Debug)]
pub struct Backlog {
    items: Vec<BacklogItem>,
    cap: usize,
    drop: DropRule,
    debounce_ms: u64,
    last_enqueue: Option<Instant>,
}

impl Backlog {
    pub fn new(cap: usize, drop: DropRule, debounce_ms: u64) -> Self {
        Self {
            items: Vec::new(),
            cap: cap.max(1),
            drop,
            debounce_ms,
            last_enqueue: None,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Enqueue an input. Inputs inside the debounce window coalesce into the
    /// previous item (counting as one toward the cap). Returns `false` when
    /// the `new` drop rule rejected the input.
    pub fn push(&mut self, text: &str, disposition: Disposition) -> bool {
        let now = Instant::now();
        let within_debounce = self
            .last_enqueue
            .is_some_and(|t| now.duration_since(t).as_millis() < self.debounce_ms as u128);
        self.last_enqueue = Some(now);

        if within_debounce {
            if let Some(last) = self.items.last_mut() {
                last.text.push('\n');
                last.text.push_str(text);
                last.count += 1;
                return true;
            }
        }

        if self.items.len() >= self.cap {
            match self.drop {
                DropRule::Old => {
                    let dropped = self.items.remove(0);
                    debug!(count = dropped.count, "backlog overflow: oldest item dropped");
                }
                DropRule::New => {
                    debug!("backlog overflow: incoming item rejected");
                    return false;
                }
                DropRule::Summarize => {
                    let total: u32 = self.items.iter().map(|i| i.count).sum::<u32>() + 1;
                    let disposition = self
                        .items
                        .first()
                        .map(|i| i.disposition)
                        .unwrap_or(disposition);
                    self.items.clear();
                    self.items.push(BacklogItem {
                        text: format!("{total} messages arrived while you were busy"),
                        disposition,
                        enqueued_at: Utc::now(),
                        count: total,
                    });
                    return true;
                }
            }
        }

        self.items.push(BacklogItem::new(text.to_string(), disposition));
        true
    }

    /// Drain the backlog into one combined input: deduplicated, in order,
    /// joined by blank lines. `None` when nothing is queued.
    pub fn drain_combined(&mut self) -> Option<String> {
        if self.items.is_empty() {
            return None;
        }
        let mut seen = Vec::new();
        for item in self.items.drain(..) {
            if !seen.contains(&item.text) {
                seen.push(item.text);
            }
        }
        self.last_enqueue = None;
        Some(seen.join("\n\n"))
    }
}
