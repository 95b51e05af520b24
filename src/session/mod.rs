//! Logical sessions and persistent multiplexer sessions

mod persistent;
pub mod screen;
mod store;

pub use persistent::{
    CreateSessionOptions, PersistentSession, PersistentSessionEvent, PersistentSessionManager,
    PersistentStatus, SessionMetadata,
};
pub use store::{
    SessionData, SessionStore, SessionStoreEvent, DEFAULT_MAX_BUFFER_CHARS, DEFAULT_TIMEOUT,
};
