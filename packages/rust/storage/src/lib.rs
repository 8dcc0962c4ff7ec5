//! Persistence layer for Dossier.
//!
//! - [`SessionStore`]: session checkpoints, with a locked file store for
//!   production ([`FileSessionStore`]) and an in-memory store for tests
//!   ([`MemorySessionStore`]).
//! - [`Cache`]: libSQL-backed TTL cache for search results and fetched pages.

mod cache;
mod migrations;
mod session_store;

pub use cache::{Cache, CacheKind, CacheStats, hash_key};
pub use session_store::{FileSessionStore, MemorySessionStore, SessionStore};
