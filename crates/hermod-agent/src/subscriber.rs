//! The agent event subscriber.
//!
//! Consumes one run's [`AgentEvent`] stream and produces the three reply
//! streams as a single typed [`ReplyEvent`] channel:
//! - partials: the growing visible assistant text, for surfaces that render
//!   typing indicators or live-updating messages
//! - blocks: complete deliverable chunks sized by the chunking policy
//! - tool summaries and sanitised tool results
//!
//! Thinking segments are stripped before any consumer sees text. With
//! `enforce_final_tag` set, only the `<final>` region is published and block
//! slicing happens at `message_end` against the extracted text; otherwise
//! blocks are sliced incrementally as the stream fills.
//!
//! A compaction retry (`AutoCompactionEnd { will_retry: true }`) resets every
//! accumulated buffer and continues the run transparently: waiters observe a
//! single completion per logical run.

use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use hermod_core::config::ReplyConfig;

use crate::chunk::BlockChunker;
use crate::event::AgentEvent;
use crate::sanitize::{extract_media, sanitize_tool_result};
use crate::signal::{CompactionGauge, CompletionSignal};
use crate::strip::{extract_final, safe_publish_len, streaming_final_view, strip_thinking};

/// Identical consecutive tool invocations inside this window aggregate into
/// one "name (×N)" summary.
const TOOL_DEBOUNCE: Duration = Duration::from_secs(2);

/// Lifecycle of an active run, observable by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Starting,
    Streaming,
    Compacting,
    Ending,
}

/// Output of the subscriber, consumed by the delivery dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyEvent {
    /// Cumulative visible text of the in-flight assistant message.
    Partial { text: String },
    /// A deliverable chunk, media pseudo-URLs already extracted.
    Block {
        text: String,
        media_urls: Vec<String>,
    },
    /// Short human-readable tool activity line.
    Tool { summary: String },
    /// A sanitised tool result for external consumers.
    ToolResult {
        name: String,
        result: serde_json::Value,
    },
}

/// What a completed (or cancelled) run leaves behind.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    /// Final visible text of each assistant message, in order.
    pub assistant_texts: Vec<String>,
    pub tool_results: Vec<serde_json::Value>,
    pub compaction_retries: u32,
    /// The run was cancelled or timed out before `agent_end`.
    pub interrupted: bool,
    pub error: Option<String>,
}

struct ToolAggregate {
    name: String,
    meta: String,
    count: u32,
    last_seen: Instant,
}

pub struct EventSubscriber {
    reply: ReplyConfig,
    out: mpsc::Sender<ReplyEvent>,
    chunker: BlockChunker,

    /// Cumulative raw text of the current assistant message.
    raw: String,
    /// Bytes of the visible (stripped) view already fed to the chunker.
    fed: usize,
    /// Bytes of the visible view last published as a partial.
    last_partial: usize,

    assistant_texts: Vec<String>,
    tool_results: Vec<serde_json::Value>,
    tool_agg: Option<ToolAggregate>,
    compaction_retries: u32,
    /// Retries whose replacement message has not finished yet.
    unsettled_retries: u32,

    state_tx: watch::Sender<RunState>,
    completion: CompletionSignal,
    gauge: CompactionGauge,
}

impl EventSubscriber {
    pub fn new(reply: ReplyConfig, out: mpsc::Sender<ReplyEvent>) -> Self {
        let chunker = BlockChunker::new(reply.chunking.clone());
        let (state_tx, _) = watch::channel(RunState::Starting);
        Self {
            reply,
            out,
            chunker,
            raw: String::new(),
            fed: 0,
            last_partial: 0,
            assistant_texts: Vec::new(),
            tool_results: Vec::new(),
            tool_agg: None,
            compaction_retries: 0,
            unsettled_retries: 0,
            state_tx,
            completion: CompletionSignal::new(),
            gauge: CompactionGauge::new(),
        }
    }

    /// Handle for waiters; resolves exactly once per logical run.
    pub fn completion(&self) -> CompletionSignal {
        self.completion.clone()
    }

    pub fn compaction(&self) -> CompactionGauge {
        self.gauge.clone()
    }

    pub fn state(&self) -> watch::Receiver<RunState> {
        self.state_tx.subscribe()
    }

    /// Drive the subscriber until the run ends, is cancelled, or the event
    /// stream closes. Consumes the subscriber and returns the outcome.
    pub async fn process(
        mut self,
        mut events: mpsc::Receiver<AgentEvent>,
        cancel: CancellationToken,
    ) -> RunOutcome {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return self.finish(true, None).await;
                }
                evt = events.recv() => match evt {
                    None => return self.finish(true, Some("event stream closed".into())).await,
                    Some(evt) => {
                        if let Some(outcome) = self.handle(evt).await {
                            return outcome;
                        }
                    }
                }
            }
        }
    }

    async fn handle(&mut self, evt: AgentEvent) -> Option<RunOutcome> {
        match evt {
            AgentEvent::AgentStart { run_id } => {
                debug!(%run_id, "agent stream started");
                self.set_state(RunState::Streaming);
            }
            AgentEvent::MessageUpdate { text } => {
                self.raw = text;
                self.emit_stream().await;
            }
            AgentEvent::TextEnd => {
                if self.reply.block_reply_break == hermod_core::config::BlockBreak::TextEnd {
                    let blocks = self.chunker.flush();
                    self.emit_blocks(blocks).await;
                }
            }
            AgentEvent::MessageEnd => {
                self.end_message().await;
            }
            AgentEvent::ToolStart {
                call_id,
                name,
                meta,
            } => {
                debug!(%call_id, tool = %name, "tool started");
                self.tool_started(name, meta).await;
            }
            AgentEvent::ToolUpdate { call_id, meta } => {
                debug!(%call_id, %meta, "tool progress");
            }
            AgentEvent::ToolEnd {
                call_id,
                name,
                result,
            } => {
                debug!(%call_id, tool = %name, "tool finished");
                let sanitized = sanitize_tool_result(&result);
                self.tool_results.push(sanitized.clone());
                self.send(ReplyEvent::ToolResult {
                    name,
                    result: sanitized,
                })
                .await;
            }
            AgentEvent::AutoCompactionStart => {
                self.set_state(RunState::Compacting);
                self.gauge.start();
            }
            AgentEvent::AutoCompactionEnd { will_retry } => {
                self.gauge.end(will_retry);
                if will_retry {
                    debug!("compaction retry: resetting accumulated buffers");
                    self.reset_buffers();
                    self.compaction_retries += 1;
                    self.unsettled_retries += 1;
                }
                self.set_state(RunState::Streaming);
            }
            AgentEvent::AgentEnd { stop_reason } => {
                debug!(stop_reason = ?stop_reason, "agent stream ended");
                return Some(self.finish(false, None).await);
            }
            AgentEvent::StreamError { message } => {
                warn!(error = %message, "model stream error mid-run");
                return Some(self.finish(true, Some(message)).await);
            }
            AgentEvent::Unknown { kind } => {
                debug!(%kind, "unknown agent event ignored");
            }
        }
        None
    }

    /// The visible view of the current raw message: thinking stripped, final
    /// region applied when enforcing, dangling tag prefixes held back.
    fn visible(&self) -> String {
        let stripped = strip_thinking(&self.raw);
        let view = if self.reply.enforce_final_tag {
            streaming_final_view(&stripped).to_string()
        } else {
            stripped
        };
        let safe = safe_publish_len(&view);
        view[..safe].to_string()
    }

    async fn emit_stream(&mut self) {
        let visible = self.visible();

        if visible.len() > self.last_partial {
            self.last_partial = visible.len();
            self.send(ReplyEvent::Partial {
                text: visible.clone(),
            })
            .await;
        }

        // Incremental block slicing only applies outside final-tag
        // enforcement; with enforcement on, slicing waits for message_end.
        if self.reply.enforce_final_tag {
            return;
        }
        if visible.len() < self.fed {
            // A stray close tag reclassified earlier text as reasoning.
            // Already-emitted blocks cannot be recalled; drop the pending
            // buffer and realign.
            self.chunker.reset();
            self.fed = visible.len();
            return;
        }
        if visible.len() > self.fed {
            let new = visible[self.fed..].to_string();
            self.fed = visible.len();
            let blocks = self.chunker.push(&new);
            self.emit_blocks(blocks).await;
        }
    }

    async fn end_message(&mut self) {
        let stripped = strip_thinking(&self.raw);
        let final_text = if self.reply.enforce_final_tag {
            extract_final(&stripped)
        } else {
            stripped
        };

        let mut blocks = if self.reply.enforce_final_tag {
            self.chunker.push(&final_text)
        } else if final_text.len() > self.fed {
            let tail = final_text[self.fed..].to_string();
            self.chunker.push(&tail)
        } else {
            Vec::new()
        };
        // The remaining partial buffer is always force-flushed here.
        blocks.extend(self.chunker.flush());
        self.emit_blocks(blocks).await;

        let trimmed = final_text.trim();
        if !trimmed.is_empty() {
            self.assistant_texts.push(trimmed.to_string());
        }

        if self.unsettled_retries > 0 {
            self.unsettled_retries -= 1;
            self.gauge.retry_settled();
        }

        self.raw.clear();
        self.fed = 0;
        self.last_partial = 0;
    }

    async fn tool_started(&mut self, name: String, meta: String) {
        let now = Instant::now();
        if let Some(agg) = &mut self.tool_agg {
            if agg.name == name && agg.meta == meta && now - agg.last_seen < TOOL_DEBOUNCE {
                agg.count += 1;
                agg.last_seen = now;
                let summary = format!("{} (×{})", tool_label(&name, &meta), agg.count);
                self.send(ReplyEvent::Tool { summary }).await;
                return;
            }
        }
        self.tool_agg = Some(ToolAggregate {
            name: name.clone(),
            meta: meta.clone(),
            count: 1,
            last_seen: now,
        });
        self.send(ReplyEvent::Tool {
            summary: tool_label(&name, &meta),
        })
        .await;
    }

    /// Flush whatever is buffered and close out the run.
    async fn finish(&mut self, interrupted: bool, error: Option<String>) -> RunOutcome {
        self.set_state(RunState::Ending);
        if !self.raw.is_empty() {
            // No message_end arrived; flush the partial message as a
            // terminal block.
            self.end_message().await;
        } else {
            let blocks = self.chunker.flush();
            self.emit_blocks(blocks).await;
        }
        self.gauge.settle_all();
        self.completion.complete();
        RunOutcome {
            assistant_texts: std::mem::take(&mut self.assistant_texts),
            tool_results: std::mem::take(&mut self.tool_results),
            compaction_retries: self.compaction_retries,
            interrupted,
            error,
        }
    }

    fn reset_buffers(&mut self) {
        self.raw.clear();
        self.fed = 0;
        self.last_partial = 0;
        self.assistant_texts.clear();
        self.tool_results.clear();
        self.tool_agg = None;
        self.chunker.reset();
    }

    async fn emit_blocks(&mut self, blocks: Vec<String>) {
        for block in blocks {
            let (text, media_urls) = extract_media(&block);
            if text.is_empty() && media_urls.is_empty() {
                continue;
            }
            self.send(ReplyEvent::Block { text, media_urls }).await;
        }
    }

    async fn send(&self, evt: ReplyEvent) {
        if self.out.send(evt).await.is_err() {
            debug!("reply consumer dropped; discarding event");
        }
    }

    fn set_state(&self, state: RunState) {
        self.state_tx.send_replace(state);
    }
}

fn tool_label(name: &str, meta: &str) -> String {
    if meta.is_empty() {
        name.to_string()
    } else {
        format!("{name}: {meta}")
    }
}
