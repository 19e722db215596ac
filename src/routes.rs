use crate::error::GatewayError;
use crate::types::{CompareRequest, CompareResponse, Provenance};
use crate::AppState;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

const ANONYMOUS_CLIENT: &str = "anonymous";

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/compare", post(compare_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "comps-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "gateway": state.gateway.status(),
    }))
}

/// First `x-forwarded-for` hop, used when the body names no client.
fn forwarded_client(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn into_http(response: CompareResponse) -> Response {
    let status = response
        .reason
        .map(|kind| kind.status_code())
        .unwrap_or(axum::http::StatusCode::OK);
    let retry_after = response.retry_after_sec;
    let mut http = (status, Json(response)).into_response();
    if let Some(secs) = retry_after {
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            http.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    http
}

async fn compare_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<CompareRequest>, JsonRejection>,
) -> Response {
    let mut request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!("Rejected compare body: {}", rejection);
            let err = GatewayError::Validation(rejection.body_text());
            return into_http(CompareResponse::failure(
                &err,
                Provenance::new(Uuid::new_v4().to_string()),
            ));
        }
    };

    let has_client = request
        .client_id
        .as_deref()
        .is_some_and(|c| !c.trim().is_empty());
    if !has_client {
        request.client_id =
            Some(forwarded_client(&headers).unwrap_or_else(|| ANONYMOUS_CLIENT.to_string()));
    }

    let response = state.gateway.compare(&request).await;
    info!(
        "compare {} -> ok={} source={:?}",
        response.debug.request_id, response.ok, response.debug.source
    );
    into_http(response)
}
