//! In-memory, process-lifetime state keyed by identity. Each map carries its
//! own synchronization; nothing here knows about connections or transports.

pub mod references;
pub mod sessions;

pub use references::ReferenceCache;
pub use sessions::{Session, SessionSnapshot, SessionStore};
