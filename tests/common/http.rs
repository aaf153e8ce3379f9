use axum::body::{to_bytes, Body};
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::util::ServiceExt;

/// A response with its body already parsed.
#[derive(Debug)]
pub struct ApiReply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl ApiReply {
    /// The `data` payload of a successful envelope.
    pub fn data(&self) -> &Value {
        assert!(
            self.status.is_success(),
            "expected success, got {}: {}",
            self.status,
            self.body
        );
        assert_eq!(self.body["success"], true);
        &self.body["data"]
    }

    pub fn assert_error(&self, status: StatusCode, code: &str) {
        assert_eq!(self.status, status, "body: {}", self.body);
        assert_eq!(self.body["success"], false);
        assert_eq!(self.body["code"], code);
        assert!(self.body["message"].is_string());
        assert!(self.body["traceId"].is_string());
    }
}

pub async fn call(app: &Router, method: Method, path: &str, body: Option<Value>) -> ApiReply {
    call_traced(app, method, path, body, None).await
}

pub async fn call_traced(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
    request_id: Option<&str>,
) -> ApiReply {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(id) = request_id {
        builder = builder.header("x-request-id", id);
    }
    let req = match body {
        Some(payload) => builder
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("build request");

    let resp = app.clone().oneshot(req).await.expect("oneshot response");
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("read body bytes");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };

    ApiReply { status, headers, body }
}

pub async fn enroll(app: &Router, user_id: &str, themes: &[&str]) -> ApiReply {
    call(
        app,
        Method::POST,
        &format!("/api/engagement/users/{user_id}/enroll"),
        Some(json!({ "themes": themes })),
    )
    .await
}
