use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tower_http::request_id::RequestId;
use uuid::Uuid;

use crate::{
    problem::{ApiError, ErrorCode},
    state::AppState,
};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const REPLAYED_HEADER: &str = "idempotency-replayed";

const LOCK_TTL: Duration = Duration::from_secs(30);
const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const POLL_ATTEMPTS: u32 = 20;
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct CachedResponse {
    status: u16,
    content_type: Option<String>,
    body: String,
    location: Option<String>,
}

pub fn cache_key(method: &Method, url: &str, header_key: &str) -> String {
    let digest = hex::encode(Sha256::digest(header_key.as_bytes()));
    format!("idemp:{method}:{url}:{digest}")
}

/// Replay cache for POST/DELETE requests carrying an `Idempotency-Key`.
/// First presentation takes an in-flight lock and caches the completed
/// response; retries replay it; concurrent duplicates wait briefly and then
/// fail closed.
pub async fn idempotency_gate(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() != Method::POST && request.method() != Method::DELETE {
        return next.run(request).await;
    }
    let Some(header_key) = request
        .headers()
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
    else {
        return next.run(request).await;
    };

    let trace_id = request
        .extensions()
        .get::<RequestId>()
        .and_then(|id| id.header_value().to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let cache_key = cache_key(request.method(), &request.uri().to_string(), &header_key);
    let lock_key = format!("{cache_key}:lock");

    match state.kv.get_json::<CachedResponse>(&cache_key).await {
        Ok(Some(cached)) => return replay(cached),
        Ok(None) => {}
        Err(err) => {
            tracing::error!("idempotency cache read failed: {err}");
            return ApiError::internal().with_trace(&trace_id).into_response();
        }
    }

    let acquired = match state.kv.set_nx_ex(&lock_key, "1", LOCK_TTL).await {
        Ok(acquired) => acquired,
        Err(err) => {
            tracing::error!("idempotency lock failed: {err}");
            return ApiError::internal().with_trace(&trace_id).into_response();
        }
    };

    if !acquired {
        for _ in 0..POLL_ATTEMPTS {
            tokio::time::sleep(POLL_INTERVAL).await;
            if let Ok(Some(cached)) = state.kv.get_json::<CachedResponse>(&cache_key).await {
                return replay(cached);
            }
        }
        return ApiError::new(StatusCode::CONFLICT, ErrorCode::IdempotencyInProgress)
            .with_detail("an identical request is still in flight")
            .with_trace(&trace_id)
            .into_response();
    }

    let response = next.run(request).await;
    let (parts, body) = response.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::error!("failed to buffer response body: {err}");
            let _ = state.kv.del(&lock_key).await;
            return ApiError::internal().with_trace(&trace_id).into_response();
        }
    };

    // Errored handlers release the lock and are never cached.
    if parts.status.as_u16() < 500 {
        let cached = CachedResponse {
            status: parts.status.as_u16(),
            content_type: parts
                .headers
                .get(header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string),
            body: String::from_utf8_lossy(&bytes).into_owned(),
            location: parts
                .headers
                .get(header::LOCATION)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string),
        };
        match serde_json::to_string(&cached) {
            Ok(serialized) => {
                if let Err(err) = state
                    .kv
                    .set_ex_and_del(&cache_key, &serialized, CACHE_TTL, &lock_key)
                    .await
                {
                    tracing::error!("failed to publish idempotency entry: {err}");
                    let _ = state.kv.del(&lock_key).await;
                }
            }
            Err(err) => {
                tracing::error!("failed to serialize idempotency entry: {err}");
                let _ = state.kv.del(&lock_key).await;
            }
        }
    } else {
        let _ = state.kv.del(&lock_key).await;
    }

    Response::from_parts(parts, Body::from(bytes))
}

fn replay(cached: CachedResponse) -> Response {
    let status = StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK);
    let mut builder = Response::builder()
        .status(status)
        .header(REPLAYED_HEADER, "true");
    if let Some(content_type) = cached
        .content_type
        .as_deref()
        .and_then(|value| HeaderValue::from_str(value).ok())
    {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    if let Some(location) = cached
        .location
        .as_deref()
        .and_then(|value| HeaderValue::from_str(value).ok())
    {
        builder = builder.header(header::LOCATION, location);
    }
    builder
        .body(Body::from(cached.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
