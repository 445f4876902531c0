use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use axum::extract::{Path, Query, State};
use axum::Json;
use axum_typed_multipart::{FieldData, TypedMultipart};
use log::info;
use serde_json::{json, Value};

use super::error::Result;
use super::state::AppState;
use super::types::*;
use crate::border::Border;
use crate::db::{DiscStatus, NewDisc, UploadStatus};
use crate::matcher::Deadline;

/// 单个请求的截止时间，首次调用会额外付出编码器加载的开销
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn content_type_of(file: &FieldData<axum::body::Bytes>) -> String {
    file.metadata.content_type.clone().unwrap_or_else(|| "image/jpeg".to_string())
}

/// 搜索一张图片
#[utoipa::path(
    post,
    path = "/search",
    request_body(content = SearchForm, content_type = "multipart/form-data"),
    responses((status = 200))
)]
pub async fn search_handler(
    State(state): State<Arc<AppState>>,
    data: TypedMultipart<SearchRequest>,
) -> Result<Json<Value>> {
    let start = Instant::now();
    info!("正在搜索上传图片");

    let status_filter = match &data.status {
        Some(s) => Some(s.parse::<DiscStatus>().map_err(|e| anyhow!(e))?),
        None => None,
    };

    let matches = state
        .matcher
        .find_matches(
            &data.file.contents,
            &content_type_of(&data.file),
            data.k,
            data.min_similarity,
            status_filter,
            Deadline::after(REQUEST_TIMEOUT),
        )
        .await?;

    Ok(Json(json!({
        "time": start.elapsed().as_millis(),
        "result": matches,
    })))
}

/// 注册一个新飞盘
#[utoipa::path(
    post,
    path = "/discs",
    request_body(content = RegisterForm, content_type = "multipart/form-data"),
    responses((status = 200))
)]
pub async fn register_handler(
    State(state): State<Arc<AppState>>,
    data: TypedMultipart<RegisterRequest>,
) -> Result<Json<Value>> {
    let defaults = NewDisc::default();
    let meta = NewDisc {
        owner_name: data.owner_name.clone().unwrap_or(defaults.owner_name),
        owner_contact: data.owner_contact.clone().unwrap_or(defaults.owner_contact),
        status: DiscStatus::Registered,
        disc_model: data.disc_model.clone(),
        disc_color: data.disc_color.clone(),
        notes: data.notes.clone(),
        location: data.location.clone(),
    };

    let registration = state
        .matcher
        .register(
            &data.file.contents,
            &content_type_of(&data.file),
            meta,
            None,
            Deadline::after(REQUEST_TIMEOUT),
        )
        .await?;

    Ok(Json(json!({
        "disc_id": registration.disc_id,
        "image_id": registration.image_id,
        "encoder_name": registration.encoder_name,
        "border_detected": registration.border.is_some(),
        "border_confidence": registration.border.as_ref().map(Border::confidence).unwrap_or(0.0),
    })))
}

/// 确认上传，使飞盘对搜索可见
pub async fn confirm_handler(
    State(state): State<Arc<AppState>>,
    Path(disc_id): Path<i64>,
) -> Result<Json<Value>> {
    state.matcher.confirm(disc_id).await?;
    Ok(Json(json!({})))
}

/// 取消 pending 状态的飞盘
pub async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Path(disc_id): Path<i64>,
) -> Result<Json<Value>> {
    state.matcher.cancel(disc_id).await?;
    Ok(Json(json!({})))
}

pub async fn get_disc_handler(
    State(state): State<Arc<AppState>>,
    Path(disc_id): Path<i64>,
) -> Result<Json<Value>> {
    let (disc, images) = state.matcher.get_disc(disc_id).await?;
    Ok(Json(json!({ "disc": disc, "images": images })))
}

pub async fn list_discs_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListDiscsParams>,
) -> Result<Json<Value>> {
    let status = match &params.status {
        Some(s) => Some(s.parse::<DiscStatus>().map_err(|e| anyhow!(e))?),
        None => None,
    };
    let upload_status = match &params.upload_status {
        Some(s) => Some(s.parse::<UploadStatus>().map_err(|e| anyhow!(e))?),
        None => None,
    };
    let discs = state.matcher.list_discs(status, upload_status).await?;
    Ok(Json(json!({ "discs": discs })))
}

pub async fn delete_disc_handler(
    State(state): State<Arc<AppState>>,
    Path(disc_id): Path<i64>,
) -> Result<Json<Value>> {
    state.matcher.delete_disc(disc_id).await?;
    Ok(Json(json!({})))
}

/// 给已有飞盘追加一张图片
pub async fn add_image_handler(
    State(state): State<Arc<AppState>>,
    Path(disc_id): Path<i64>,
    data: TypedMultipart<AddImageRequest>,
) -> Result<Json<Value>> {
    let registration = state
        .matcher
        .add_image_to_disc(
            disc_id,
            &data.file.contents,
            &content_type_of(&data.file),
            Deadline::after(REQUEST_TIMEOUT),
        )
        .await?;
    Ok(Json(json!({
        "disc_id": registration.disc_id,
        "image_id": registration.image_id,
        "border_detected": registration.border.is_some(),
    })))
}

pub async fn update_status_handler(
    State(state): State<Arc<AppState>>,
    Path(disc_id): Path<i64>,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<Json<Value>> {
    state.matcher.update_status(disc_id, req.status).await?;
    Ok(Json(json!({})))
}

/// 手工修订图片边框并重新编码
pub async fn update_border_handler(
    State(state): State<Arc<AppState>>,
    Path(image_id): Path<i64>,
    Json(border): Json<Border>,
) -> Result<Json<Value>> {
    state.matcher.update_border(image_id, border, Deadline::after(REQUEST_TIMEOUT)).await?;
    Ok(Json(json!({})))
}
