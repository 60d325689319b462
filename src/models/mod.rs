//! Data models for stored and retrieved files.
//!
//! `StoredFile` maps to the store's files table via `sqlx::FromRow`;
//! `RetrievedFile` is the per-request value handed to the HTTP layer.

pub mod retrieved_file;
pub mod stored_file;
