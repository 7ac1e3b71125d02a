//! Agent-facing HTTP endpoint.
//!
//! `POST /v1/execute?capability=<capID>` with `X-Agent-ID` and
//! `Authorization: Bearer <token>` headers and an opaque body. Successful
//! responses return the downstream bytes as-is; refusals return a stable
//! machine-readable kind and never internal error detail. A trace layer
//! assigns or propagates `X-Trace-ID` on every response.

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Query, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use uag_core::auth::TokenValidator;
use uag_core::pipeline::Gateway;

use crate::status::error_status;

/// Trace id header name.
pub const TRACE_HEADER: &str = "x-trace-id";

/// Agent id header name.
pub const AGENT_HEADER: &str = "x-agent-id";

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// The request pipeline.
    pub gateway: Arc<Gateway>,
    /// Bearer-token verifier.
    pub validator: Arc<dyn TokenValidator>,
}

/// Builds the gateway router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/execute", post(execute))
        .route("/healthz", get(healthz))
        .layer(middleware::from_fn(trace_layer))
        .with_state(state)
}

/// Request-scoped trace id, injected by [`trace_layer`].
#[derive(Debug, Clone)]
struct TraceId(String);

/// Assigns or propagates the trace id and reflects it on the response.
async fn trace_layer(mut request: Request, next: Next) -> Response {
    let trace_id = request
        .headers()
        .get(TRACE_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);

    request.extensions_mut().insert(TraceId(trace_id.clone()));
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(TRACE_HEADER, value);
    }
    response
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct ExecuteParams {
    capability: String,
}

fn error_body(status: StatusCode, kind: &str) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        format!(r#"{{"error":"{kind}"}}"#),
    )
        .into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

async fn execute(
    State(state): State<AppState>,
    Query(params): Query<ExecuteParams>,
    trace: Option<axum::Extension<TraceId>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let trace_id = trace.map_or_else(|| Uuid::new_v4().to_string(), |t| t.0.0);

    let Some(agent_id) = headers
        .get(AGENT_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
    else {
        return error_body(StatusCode::BAD_REQUEST, "agent_id_required");
    };
    if params.capability.is_empty() {
        return error_body(StatusCode::BAD_REQUEST, "capability_required");
    }

    let Some(token) = bearer_token(&headers) else {
        return error_body(StatusCode::UNAUTHORIZED, "missing_token");
    };
    let claims = match state.validator.validate(token) {
        Ok(claims) => claims,
        Err(e) => {
            debug!(error = %e, "token rejected");
            return error_body(StatusCode::UNAUTHORIZED, "invalid_token");
        }
    };

    match state
        .gateway
        .process_action(&claims, &agent_id, &params.capability, &body, &trace_id)
        .await
    {
        Ok(response) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            Bytes::from(response),
        )
            .into_response(),
        Err(e) => {
            let (code, kind) = error_status(&e);
            let status =
                StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            error_body(status, kind)
        }
    }
}
