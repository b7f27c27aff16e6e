use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;

/// `{data}` envelope for single resources.
pub fn data<T: Serialize>(value: T) -> Response {
    Json(json!({ "data": value })).into_response()
}

/// 201 with a `Location` header and the `{data}` envelope.
pub fn created<T: Serialize>(location: Option<String>, value: T) -> Response {
    let mut response = (StatusCode::CREATED, Json(json!({ "data": value }))).into_response();
    if let Some(location) = location.and_then(|raw| HeaderValue::from_str(&raw).ok()) {
        response.headers_mut().insert(header::LOCATION, location);
    }
    response
}

/// List envelope: items land in `data`, paging hints in `meta`.
pub fn page<T: Serialize>(items: Vec<T>, next_cursor: Option<String>, limit: i64) -> Response {
    let mut meta = serde_json::Map::new();
    if let Some(cursor) = next_cursor {
        meta.insert("nextCursor".to_string(), json!(cursor));
    }
    meta.insert("limit".to_string(), json!(limit));
    Json(json!({ "data": items, "meta": meta })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn page_promotes_items_and_meta() {
        let response = page(vec![1, 2, 3], Some("abc".to_string()), 20);
        let bytes = to_bytes(response.into_body(), 1024).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["data"], json!([1, 2, 3]));
        assert_eq!(body["meta"]["nextCursor"], json!("abc"));
        assert_eq!(body["meta"]["limit"], json!(20));
    }

    #[tokio::test]
    async fn created_sets_location() {
        let response = created(Some("/v1/transactions/abc".to_string()), json!({"id": "abc"}));
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "/v1/transactions/abc"
        );
    }
}
