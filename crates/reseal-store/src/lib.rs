//! Reseal Store - SQLite-backed object store
//!
//! Objects are stored as JSON with an integer version per row; conditional
//! updates compare that version inside a single UPDATE statement.

pub mod sqlite;

pub use sqlite::SqliteStore;
