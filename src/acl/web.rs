use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::acl::types::{CheckRequest, CheckResponse, Options};
use crate::acl::Acl;

pub fn router(acl: Arc<Acl>) -> Router {
    Router::new()
        .route("/v1/check", post(handle_check))
        .route("/healthz", get(health))
        .with_state(acl)
}

async fn handle_check(
    State(acl): State<Arc<Acl>>,
    Json(req): Json<CheckRequest>,
) -> impl IntoResponse {
    let options = Options {
        reject_silently: req.reject_silently,
        on_reject: None,
    };
    let operation = acl.guard(&req.namespace);
    match operation.call(req.params, req.auth.as_ref(), &options).await {
        Ok(Some(params)) => {
            tracing::info!(namespace = %req.namespace, "ACL check granted");
            Json(CheckResponse {
                allowed: true,
                params: Some(params),
            })
            .into_response()
        }
        Ok(None) => Json(CheckResponse {
            allowed: false,
            params: None,
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
