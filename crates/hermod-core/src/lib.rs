pub mod config;
pub mod error;
pub mod template;
pub mod types;

pub use config::HermodConfig;
pub use error::{HermodError, Result};
pub use types::{ChatType, InboundEvent, MediaKind, MediaRef, SessionScope, Surface};
