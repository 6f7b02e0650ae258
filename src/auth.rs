//! 身份识别：信任上游代理注入的用户头。

use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::{HeaderMap, HeaderName, Request};
use axum::middleware;
use axum::response::Response;
use std::sync::Arc;
use tracing::warn;

use crate::error::ApiError;

/// 上游代理传递已认证用户的请求头。
#[derive(Clone, Debug)]
pub struct IdentityConfig {
    pub header: HeaderName,
}

/// 当前请求的已认证用户。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Owner(pub String);

impl Owner {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// 认证中间件：上传接口必须带有身份头，并注入 `Owner` 扩展。
pub async fn identity_middleware(
    Extension(identity): Extension<Arc<IdentityConfig>>,
    mut req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    if !req.uri().path().starts_with("/api/upload") {
        return Ok(next.run(req).await);
    }

    let Some(owner) = resolve_owner(req.headers(), &identity.header) else {
        warn!(path = req.uri().path(), "request without identity");
        return Err(ApiError::Unauthorized("authentication required".into()));
    };
    req.extensions_mut().insert(owner);
    Ok(next.run(req).await)
}

fn resolve_owner(headers: &HeaderMap, header: &HeaderName) -> Option<Owner> {
    headers
        .get(header)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| Owner(value.to_string()))
}
