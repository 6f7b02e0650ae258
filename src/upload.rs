//! 分片上传 HTTP 处理器。

use axum::Error as AxumError;
use axum::body::Body as AxumBody;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Extension, Json, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json as JsonResponse;
use futures_util::stream::StreamExt;
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::Owner;
use crate::config::MAX_CHUNK_SIZE;
use crate::error::ApiError;
use crate::manager::{UploadManager, UploadProgress};

pub const CHUNK_INDEX_HEADER: &str = "X-Chunk-Index";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadInitRequest {
    name: String,
    total_size: u64,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadInitResponse {
    upload_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadIdQuery {
    upload_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadIdRequest {
    upload_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadCompleteResponse {
    file_id: String,
}

/// 初始化上传会话。
pub async fn init_upload(
    Extension(manager): Extension<Arc<UploadManager>>,
    Extension(owner): Extension<Owner>,
    payload: Result<Json<UploadInitRequest>, JsonRejection>,
) -> Result<JsonResponse<UploadInitResponse>, ApiError> {
    let Json(payload) = payload?;
    let upload_id = manager
        .init(
            owner.as_str(),
            &payload.name,
            payload.total_size,
            payload.metadata,
        )
        .await?;
    Ok(JsonResponse(UploadInitResponse { upload_id }))
}

/// 上传单个分片。
pub async fn upload_chunk(
    query: Result<Query<UploadIdQuery>, QueryRejection>,
    headers: HeaderMap,
    Extension(manager): Extension<Arc<UploadManager>>,
    Extension(owner): Extension<Owner>,
    body: AxumBody,
) -> Result<JsonResponse<UploadProgress>, ApiError> {
    let Query(UploadIdQuery { upload_id }) = query?;
    validate_upload_id(&upload_id)?;
    let chunk_index = match headers.get(CHUNK_INDEX_HEADER) {
        Some(value) => Some(
            value
                .to_str()
                .ok()
                .and_then(|value| value.trim().parse::<u64>().ok())
                .ok_or_else(|| ApiError::BadRequest("X-Chunk-Index is invalid".into()))?,
        ),
        None => None,
    };

    let data = read_chunk_body(body).await?;
    let progress = manager
        .append_chunk(&upload_id, owner.as_str(), chunk_index, data)
        .await?;
    Ok(JsonResponse(progress))
}

/// 完成上传并返回新文件 id。
pub async fn complete_upload(
    Extension(manager): Extension<Arc<UploadManager>>,
    Extension(owner): Extension<Owner>,
    payload: Result<Json<UploadIdRequest>, JsonRejection>,
) -> Result<(StatusCode, JsonResponse<UploadCompleteResponse>), ApiError> {
    let Json(payload) = payload?;
    validate_upload_id(&payload.upload_id)?;
    let file_id = manager
        .complete(&payload.upload_id, owner.as_str())
        .await?;
    Ok((
        StatusCode::CREATED,
        JsonResponse(UploadCompleteResponse { file_id }),
    ))
}

/// 中止上传并清理 spool 文件。
pub async fn abort_upload(
    Extension(manager): Extension<Arc<UploadManager>>,
    Extension(owner): Extension<Owner>,
    payload: Result<Json<UploadIdRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(payload) = payload?;
    validate_upload_id(&payload.upload_id)?;
    manager.abort(&payload.upload_id, owner.as_str()).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// 查询上传进度。
pub async fn upload_status(
    query: Result<Query<UploadIdQuery>, QueryRejection>,
    Extension(manager): Extension<Arc<UploadManager>>,
    Extension(owner): Extension<Owner>,
) -> Result<JsonResponse<UploadProgress>, ApiError> {
    let Query(UploadIdQuery { upload_id }) = query?;
    validate_upload_id(&upload_id)?;
    let progress = manager.status(&upload_id, owner.as_str()).await?;
    Ok(JsonResponse(progress))
}

fn validate_upload_id(upload_id: &str) -> Result<(), ApiError> {
    if upload_id.trim().is_empty() {
        return Err(ApiError::BadRequest("upload_id is required".into()));
    }
    if Uuid::parse_str(upload_id).is_err() {
        return Err(ApiError::BadRequest("upload_id is invalid".into()));
    }
    Ok(())
}

/// 读取请求体，超过单分片上限时立即拒绝。
async fn read_chunk_body(body: AxumBody) -> Result<Vec<u8>, ApiError> {
    let mut data_stream = BodyExt::into_data_stream(body);
    let mut data = Vec::new();
    while let Some(chunk) = data_stream.next().await {
        let chunk = chunk.map_err(|err: AxumError| ApiError::BadRequest(err.to_string()))?;
        if data.len() as u64 + chunk.len() as u64 > MAX_CHUNK_SIZE {
            return Err(ApiError::BadRequest("chunk too large".into()));
        }
        data.extend_from_slice(&chunk);
    }
    Ok(data)
}
