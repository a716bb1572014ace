use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use bulkmsg_infra::engine::{ActionOutcome, EngineError};

use crate::app::{dto, errors};
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_job).get(list_jobs))
        .route("/:id", get(get_job).delete(delete_job))
        .route("/:id/progress", get(get_progress))
        .route("/:id/cancel", post(cancel_job))
        .route("/:id/stop", post(stop_job))
        .route("/:id/start", post(start_job))
}

pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::CreateJobRequest>,
) -> axum::response::Response {
    let payload = match body.payload() {
        Ok(p) => p,
        Err(e) => return errors::domain_error_to_response(e),
    };

    let created = match services
        .engine
        .controller
        .create_for_selection(payload, body.sender_id, body.selection, body.filter_description)
        .await
    {
        Ok(c) => c,
        Err(e) => return errors::engine_error_to_response(e),
    };

    (
        StatusCode::CREATED,
        Json(serde_json::json!({
            "id": created.job_id.to_string(),
            "recipient_count": created.recipient_count,
            "batch_count": created.batch_count,
            "message": created.message,
        })),
    )
        .into_response()
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::HistoryQuery>,
) -> axum::response::Response {
    match services.engine.progress.history(query.page_request()).await {
        Ok(page) => (StatusCode::OK, Json(page)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match dto::parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.engine.progress.detail(id).await {
        Ok(Some(job)) => (StatusCode::OK, Json(job)).into_response(),
        Ok(None) => errors::not_found("job"),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn get_progress(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match dto::parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.engine.progress.progress(id).await {
        Ok(Some(snapshot)) => (StatusCode::OK, Json(snapshot)).into_response(),
        Ok(None) => errors::not_found("job"),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match dto::parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    action_response(services.engine.controller.cancel(id).await)
}

pub async fn stop_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match dto::parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    action_response(services.engine.controller.stop(id).await)
}

pub async fn start_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match dto::parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    action_response(services.engine.controller.start(id).await)
}

pub async fn delete_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match dto::parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    action_response(services.engine.controller.delete(id).await)
}

/// Applied actions and precondition misses are both 200; the body says which.
fn action_response(result: Result<ActionOutcome, EngineError>) -> axum::response::Response {
    match result {
        Ok(ActionOutcome::NotFound) => errors::not_found("job"),
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}
