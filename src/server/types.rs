use axum::body::Bytes;
use axum_typed_multipart::{FieldData, TryFromMultipart};
use serde::Deserialize;
use utoipa::ToSchema;

use crate::db::DiscStatus;

/// 搜索请求（multipart 解析用）
#[derive(TryFromMultipart)]
pub struct SearchRequest {
    #[form_data(limit = "unlimited")]
    pub file: FieldData<Bytes>,
    pub k: Option<usize>,
    pub min_similarity: Option<f32>,
    /// 可选的状态过滤：registered / stolen / found
    pub status: Option<String>,
}

/// 搜索请求（文档用）
#[derive(ToSchema)]
#[allow(dead_code)]
pub struct SearchForm {
    #[schema(value_type = String, format = Binary)]
    pub file: String,
    pub k: Option<usize>,
    pub min_similarity: Option<f32>,
    pub status: Option<String>,
}

/// 注册请求（multipart 解析用）
#[derive(TryFromMultipart)]
pub struct RegisterRequest {
    #[form_data(limit = "unlimited")]
    pub file: FieldData<Bytes>,
    pub owner_name: Option<String>,
    pub owner_contact: Option<String>,
    pub disc_model: Option<String>,
    pub disc_color: Option<String>,
    pub notes: Option<String>,
    pub location: Option<String>,
}

/// 注册请求（文档用）
#[derive(ToSchema)]
#[allow(dead_code)]
pub struct RegisterForm {
    #[schema(value_type = String, format = Binary)]
    pub file: String,
    pub owner_name: Option<String>,
    pub owner_contact: Option<String>,
    pub disc_model: Option<String>,
    pub disc_color: Option<String>,
    pub notes: Option<String>,
    pub location: Option<String>,
}

/// 追加图片请求
#[derive(TryFromMultipart)]
pub struct AddImageRequest {
    #[form_data(limit = "unlimited")]
    pub file: FieldData<Bytes>,
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub status: DiscStatus,
}

#[derive(Deserialize, Default)]
pub struct ListDiscsParams {
    pub status: Option<String>,
    pub upload_status: Option<String>,
}
