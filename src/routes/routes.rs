//! Binds the file handler under the configured path prefix.
//!
//! ## Structure
//! - `ANY {prefix}`        — empty lookup key
//! - `ANY {prefix}{*key}`  — everything after the prefix is the lookup key
//!
//! The wildcard `*key` allows nested keys like `reports/2025/q1.pdf`.
//! Any other path is answered with 404 by the router.

use crate::{
    handlers::file_handlers::{serve_file, serve_prefix},
    state::AppState,
};
use axum::{Router, routing::any};

/// Build the router for `handle_path`, which must start and end with `/`.
pub fn routes(handle_path: &str) -> Router<AppState> {
    Router::new()
        .route(handle_path, any(serve_prefix))
        .route(&format!("{handle_path}{{*key}}"), any(serve_file))
}
