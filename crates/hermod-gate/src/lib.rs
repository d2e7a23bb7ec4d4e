pub mod gate;
pub mod mention;

pub use gate::{Gate, GateVerdict, SessionHint};
pub use mention::MentionMatcher;
