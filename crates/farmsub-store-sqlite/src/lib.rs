//! SQLite-backed shared store for cross-process submission handshakes.

mod store;

pub use store::SqliteSharedStore;
