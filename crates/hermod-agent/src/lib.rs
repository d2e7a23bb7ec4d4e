pub mod chunk;
pub mod event;
pub mod error;
pub mod sanitize;
pub mod signal;
pub mod strip;
pub mod subscriber;

pub use chunk::BlockChunker;
pub use error::AgentError;
pub use event::{AgentEvent, AgentRunner, RunInput, RunRequest};
pub use signal::{CompactionGauge, CompletionSignal};
pub use subscriber::{EventSubscriber, ReplyEvent, RunOutcome};
