pub mod error;
pub mod manager;
pub mod store;
pub mod types;

pub use error::SessionError;
pub use manager::{ResolvedSession, SessionManager};
pub use store::SessionStore;
pub use types::{derive_key, Session, SessionEntry};
