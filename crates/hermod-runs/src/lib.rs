pub mod coordinator;
pub mod error;
pub mod queue;

pub use coordinator::{RunCoordinator, RunHandle, SubmitOptions, SubmitOutcome};
pub use error::RunError;
pub use queue::{Backlog, BacklogItem, Disposition};
