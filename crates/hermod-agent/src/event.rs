//! Agent event stream.
//!
//! A run produces a totally ordered stream of [`AgentEvent`]s consumed by a
//! single [`EventSubscriber`](crate::subscriber::EventSubscriber). Ordering
//! guarantees:
//! - `AgentStart` precedes all stream events; `AgentEnd` is last.
//! - `MessageUpdate` carries the *cumulative* text of the current assistant
//!   message; later updates extend earlier ones.
//! - Tool events for one `call_id` follow start → update* → end.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hermod_core::types::HistoryEntry;

#[derive(Debug, Clone)]
pub enum AgentEvent {
    AgentStart {
        run_id: String,
    },
    /// Cumulative text of the in-flight assistant message.
    MessageUpdate {
        text: String,
    },
    /// The current text segment is complete (more may follow in the message).
    TextEnd,
    /// The assistant message is complete.
    MessageEnd,
    ToolStart {
        call_id: String,
        name: String,
        meta: String,
    },
    ToolUpdate {
        call_id: String,
        meta: String,
    },
    ToolEnd {
        call_id: String,
        name: String,
        result: serde_json::Value,
    },
    /// The model layer started compacting context.
    AutoCompactionStart,
    /// Compaction finished; `will_retry` means the run restarts transparently
    /// and all accumulated buffers must be discarded.
    AutoCompactionEnd {
        will_retry: bool,
    },
    AgentEnd {
        stop_reason: Option<String>,
    },
    /// The model stream failed mid-run.
    StreamError {
        message: String,
    },
    /// Anything this version does not understand. Logged and ignored.
    Unknown {
        kind: String,
    },
}

/// Input injected into an already-running agent.
#[derive(Debug, Clone)]
pub enum RunInput {
    /// Preempts the model's next turn; the run continues.
    Steer(String),
    /// Delivered as the next user turn after the current turn completes.
    Followup(String),
}

/// What the coordinator hands a runner for one invocation.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: String,
    pub session_key: String,
    pub prompt: String,
    /// Last-N conversation window the agent receives as context.
    pub history: Vec<HistoryEntry>,
    pub model: Option<String>,
}

/// The seam between the gateway core and the embedded agent.
///
/// Implementations drive the model/tool loop and emit [`AgentEvent`]s on
/// `events`. They must watch `inputs` for steer/followup injections and exit
/// promptly when `cancel` fires. Provider adapters live outside this crate.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(
        &self,
        request: RunRequest,
        events: mpsc::Sender<AgentEvent>,
        inputs: mpsc::Receiver<RunInput>,
        cancel: CancellationToken,
    ) -> crate::error::Result<()>;
}
