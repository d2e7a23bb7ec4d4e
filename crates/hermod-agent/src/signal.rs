//! Completion and compaction signals.
//!
//! External waiters (webhook responders, CLI callers) subscribe to a run's
//! [`CompletionSignal`]; it resolves exactly once per logical run no matter
//! how many compaction retries happened in between. The [`CompactionGauge`]
//! lets the same waiters hold off while a compaction retry is still settling.

use tokio::sync::watch;

/// One-shot, multi-consumer completion flag.
#[derive(Clone)]
pub struct CompletionSignal {
    tx: watch::Sender<bool>,
}

impl CompletionSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Mark the run complete. Idempotent.
    pub fn complete(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_complete(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the run completes. Resolves immediately when it already has.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks compaction state: whether a compaction is in flight and how many
/// retried message streams have yet to finish.
#[derive(Clone)]
pub struct CompactionGauge {
    tx: watch::Sender<(bool, u32)>,
}

impl CompactionGauge {
    pub fn new() -> Self {
        let (tx, _) = watch::channel((false, 0));
        Self { tx }
    }

    pub fn start(&self) {
        self.tx.send_modify(|(in_flight, _)| *in_flight = true);
    }

    pub fn end(&self, will_retry: bool) {
        self.tx.send_modify(|(in_flight, pending)| {
            *in_flight = false;
            if will_retry {
                *pending += 1;
            }
        });
    }

    /// The retried stream delivered its replacement content.
    pub fn retry_settled(&self) {
        self.tx
            .send_modify(|(_, pending)| *pending = pending.saturating_sub(1));
    }

    /// Force-settle at run end so waiters are never stranded.
    pub fn settle_all(&self) {
        self.tx.send_replace((false, 0));
    }

    pub fn is_idle(&self) -> bool {
        *self.tx.borrow() == (false, 0)
    }

    /// Wait until no compaction is in flight and no retries are pending.
    pub async fn wait_idle(&self) {
        let mut rx = self.tx.subscribe();
        while *rx.borrow_and_update() != (false, 0) {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CompactionGauge {
    fn default() -> Self {
        Self::new()
    }
}
