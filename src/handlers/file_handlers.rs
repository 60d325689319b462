//! HTTP handler that serves a stored file as an attachment.
//!
//! The whole file is drained into memory by `RetrievalService` before the
//! response is built, so a failed read never produces a truncated body.

use crate::{config::StatusPolicy, errors::AppError, state::AppState};
use axum::{
    body::Body,
    extract::{Path, State, rejection::PathRejection},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use tracing::{error, info};

/// `ANY {prefix}{*key}` — the path suffix is the lookup key.
///
/// A suffix that does not decode to UTF-8 never reaches the store; it is
/// logged and answered through the same failure policy as a failed lookup.
pub async fn serve_file(
    State(state): State<AppState>,
    key: Result<Path<String>, PathRejection>,
) -> Response {
    match key {
        Ok(Path(key)) => respond(&state, &key).await,
        Err(rejection) => {
            error!(error = %rejection, "undecodable lookup key");
            let err = AppError::new(rejection.status(), rejection.body_text());
            failure(&state, None, err)
        }
    }
}

/// `ANY {prefix}` — nothing follows the prefix, so the key is empty.
pub async fn serve_prefix(State(state): State<AppState>) -> Response {
    respond(&state, "").await
}

async fn respond(state: &AppState, key: &str) -> Response {
    if state.config.debug {
        info!(key, "lookup");
    }

    match state.retrieval.retrieve(key).await {
        Ok(file) => {
            info!(
                key = %file.key,
                name = %file.name,
                bytes = file.content.len(),
                "served file"
            );
            attachment(&file.name, Body::from(file.content))
        }
        Err(err) => {
            error!(key, name = ?err.name, error = %err, "retrieval failed");
            failure(state, err.name.as_deref(), AppError::from(err.source))
        }
    }
}

/// Permissive: 200 with an empty body, named after whatever was resolved.
/// Strict: the mapped error status.
fn failure(state: &AppState, name: Option<&str>, err: AppError) -> Response {
    match state.config.status_policy {
        StatusPolicy::Permissive => attachment(name.unwrap_or(""), Body::empty()),
        StatusPolicy::Strict => err.into_response(),
    }
}

fn attachment(filename: &str, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_DISPOSITION, content_disposition(filename));
    response
}

/// `attachment; filename="<name>"` with `"` and `\` escaped. Names that
/// cannot form a header value (control characters) degrade to `attachment`.
fn content_disposition(filename: &str) -> HeaderValue {
    let escaped = filename.replace('\\', "\\\\").replace('"', "\\\"");
    HeaderValue::from_str(&format!("attachment; filename=\"{}\"", escaped))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}
