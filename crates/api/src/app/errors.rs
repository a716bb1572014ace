use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use bulkmsg_core::DomainError;
use bulkmsg_infra::engine::{EngineError, ResolveError};
use bulkmsg_infra::job_store::JobStoreError;

pub fn engine_error_to_response(err: EngineError) -> axum::response::Response {
    match err {
        EngineError::Invalid(e) => domain_error_to_response(e),
        EngineError::NoRecipients => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "no_recipients", err.to_string())
        }
        EngineError::TooManyRecipients { .. } => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "too_many_recipients", err.to_string())
        }
        EngineError::Resolve(ResolveError::InvalidSelection(msg)) => {
            json_error(StatusCode::BAD_REQUEST, "invalid_selection", msg)
        }
        EngineError::Resolve(e @ ResolveError::Unavailable(_)) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "directory_unavailable", e.to_string())
        }
        EngineError::Store(e) => store_error_to_response(e),
        EngineError::Dispatch(e) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "dispatch_error", e.to_string())
        }
    }
}

pub fn store_error_to_response(err: JobStoreError) -> axum::response::Response {
    match err {
        JobStoreError::Rejected(e) => domain_error_to_response(e),
        JobStoreError::Concurrency(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        other => {
            tracing::error!(error = %other, "job store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", other.to_string())
        }
    }
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        DomainError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
        DomainError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        e @ (DomainError::InvariantViolation(_) | DomainError::InvalidState(_)) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invariant_violation", e.to_string())
        }
    }
}

pub fn not_found(what: &str) -> axum::response::Response {
    json_error(StatusCode::NOT_FOUND, "not_found", format!("{what} not found"))
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
