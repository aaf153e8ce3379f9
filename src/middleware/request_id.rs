//! Request correlation.
//!
//! Every response carries `x-request-id` (the caller's if it is sane, else a
//! fresh UUID) and every 4xx/5xx body carries the same id as `traceId`.
//! Requests under `/api/engagement/users/{id}` also tag their span with the
//! user they act on, so engine logs for one user can be followed end to end.

use std::time::Instant;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use http_body_util::BodyExt;
use serde_json::Value;
use tracing::Instrument;

use crate::response::ErrorBody;

const REQUEST_ID_HEADER: &str = "x-request-id";
const USER_ROUTES_PREFIX: &str = "/api/engagement/users/";

pub async fn request_id_middleware(req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|id| is_valid_request_id(id))
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let path = req.uri().path().to_string();
    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %req.method(),
        path = %path,
        user_id = tracing::field::Empty,
    );
    if let Some(user_id) = target_user(&path) {
        span.record("user_id", user_id);
    }

    let started = Instant::now();
    let mut response = next.run(req).instrument(span.clone()).await;
    let status = response.status();
    let latency_ms = started.elapsed().as_millis() as u64;

    span.in_scope(|| {
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), latency_ms, "request failed");
        } else {
            tracing::info!(status = status.as_u16(), latency_ms, "request completed");
        }
    });

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    if status.is_client_error() || status.is_server_error() {
        response = with_trace_id(response, &request_id).await;
    }
    response
}

/// User id segment of a per-user engagement route.
fn target_user(path: &str) -> Option<&str> {
    path.strip_prefix(USER_ROUTES_PREFIX)?
        .split('/')
        .next()
        .filter(|id| !id.is_empty())
}

/// Handler errors are already `ErrorBody` JSON and just gain `traceId`.
/// Anything else (axum's plain-text rejections) is rewrapped as `ErrorBody`.
async fn with_trace_id(response: Response, request_id: &str) -> Response {
    let (mut parts, body) = response.into_parts();
    let bytes = body
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .unwrap_or_default();

    let patched = match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(mut obj)) => {
            obj.insert("traceId".to_string(), Value::String(request_id.to_string()));
            serde_json::to_vec(&obj)
        }
        _ => {
            let text = String::from_utf8_lossy(&bytes).trim().to_string();
            let message = if text.is_empty() {
                parts.status.canonical_reason().unwrap_or("Error").to_string()
            } else {
                text
            };
            serde_json::to_vec(&ErrorBody {
                success: false,
                code: rejection_code(parts.status).to_string(),
                message,
                trace_id: Some(request_id.to_string()),
            })
        }
    };

    let Ok(patched) = patched else {
        return Response::from_parts(parts, Body::from(bytes));
    };
    parts.headers.remove(header::CONTENT_LENGTH);
    parts.headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    Response::from_parts(parts, Body::from(patched))
}

/// Codes for errors raised by axum itself before a handler runs. Body
/// decoding failures share the handlers' `INVALID_REQUEST_BODY`; a bad
/// path or query string is `INVALID_REQUEST`.
fn rejection_code(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "INVALID_REQUEST",
        StatusCode::UNSUPPORTED_MEDIA_TYPE | StatusCode::UNPROCESSABLE_ENTITY => "INVALID_REQUEST_BODY",
        StatusCode::NOT_FOUND => "NOT_FOUND",
        StatusCode::METHOD_NOT_ALLOWED => "METHOD_NOT_ALLOWED",
        StatusCode::PAYLOAD_TOO_LARGE => "PAYLOAD_TOO_LARGE",
        _ => "INTERNAL_ERROR",
    }
}

/// Client-supplied ids: at most 128 chars of `[A-Za-z0-9_-]`.
fn is_valid_request_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
