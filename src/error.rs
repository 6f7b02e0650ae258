//! 统一的 API 错误类型与上传领域错误。

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// 上传会话各阶段可能产生的错误。
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{0}")]
    Validation(String),
    #[error("upload session not found")]
    NotFound,
    #[error("upload session belongs to another user")]
    Forbidden,
    #[error("chunk out of order: expected {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },
    #[error("too many active uploads")]
    TooManySessions,
    #[error("spool i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to persist file record: {0}")]
    Persistence(String),
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    TooManyRequests(u64),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => json_error(StatusCode::BAD_REQUEST, &msg),
            ApiError::Unauthorized(msg) => json_error(StatusCode::UNAUTHORIZED, &msg),
            ApiError::Forbidden(msg) => json_error(StatusCode::FORBIDDEN, &msg),
            ApiError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, &msg),
            ApiError::Conflict(msg) => json_error(StatusCode::CONFLICT, &msg),
            ApiError::TooManyRequests(retry_after) => {
                let mut response =
                    json_error(StatusCode::TOO_MANY_REQUESTS, "too many active uploads");
                if retry_after > 0
                    && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
                {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                response
            }
            ApiError::Internal(detail) => {
                error!(error = %detail, "internal error");
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
            }
        }
    }
}

fn json_error(status: StatusCode, message: &str) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    (status, headers, Json(json!({ "error": message }))).into_response()
}

impl From<UploadError> for ApiError {
    fn from(error: UploadError) -> Self {
        match error {
            UploadError::Validation(msg) => ApiError::BadRequest(msg),
            UploadError::NotFound => ApiError::NotFound(error.to_string()),
            UploadError::Forbidden => ApiError::Forbidden(error.to_string()),
            UploadError::OutOfOrder { .. } => ApiError::Conflict(error.to_string()),
            UploadError::TooManySessions => ApiError::TooManyRequests(60),
            UploadError::Io(_) | UploadError::Persistence(_) => {
                ApiError::Internal(error.to_string())
            }
        }
    }
}

/// 请求体反序列化失败统一返回 400 + JSON。
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(format!("invalid request body: {}", rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(format!("invalid query: {}", rejection.body_text()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn internal_error_hides_detail() {
        let err = std::io::Error::other("/srv/spool/abc: disk full");
        let api: ApiError = UploadError::Io(err).into();
        let response = api.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"], "internal server error");
    }

    #[tokio::test]
    async fn out_of_order_maps_to_conflict() {
        let api: ApiError = UploadError::OutOfOrder {
            expected: 2,
            got: 4,
        }
        .into();
        let response = api.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = body_json(response).await;
        assert_eq!(body["error"], "chunk out of order: expected 2, got 4");
    }

    #[test]
    fn too_many_sessions_sets_retry_after() {
        let api: ApiError = UploadError::TooManySessions.into();
        let response = api.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok()),
            Some("60")
        );
    }

    #[tokio::test]
    async fn query_rejection_is_json_bad_request() {
        use axum::extract::Query;
        use axum::http::Uri;
        use std::collections::HashMap;

        let uri = Uri::from_static("/api/upload/status?uploadId=abc");
        let rejection = match Query::<HashMap<String, u64>>::try_from_uri(&uri) {
            Ok(_) => panic!("query should be rejected"),
            Err(rejection) => rejection,
        };
        let response = ApiError::from(rejection).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(
            body["error"]
                .as_str()
                .is_some_and(|msg| msg.starts_with("invalid query"))
        );
    }
}
