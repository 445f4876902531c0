mod api;
mod error;
mod state;
mod types;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::limit::RequestBodyLimitLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use self::state::*;

#[derive(OpenApi)]
#[openapi(
    paths(api::search_handler, api::register_handler),
    components(schemas(types::SearchForm, types::RegisterForm))
)]
pub struct ApiDoc;

/// 构建 API 服务器
pub fn create_app(state: Arc<AppState>, max_image_bytes: usize) -> Router {
    Router::new()
        .route("/search", post(api::search_handler))
        .route("/discs", post(api::register_handler).get(api::list_discs_handler))
        .route("/discs/{id}", get(api::get_disc_handler).delete(api::delete_disc_handler))
        .route("/discs/{id}/confirm", post(api::confirm_handler))
        .route("/discs/{id}/cancel", post(api::cancel_handler))
        .route("/discs/{id}/images", post(api::add_image_handler))
        .route("/discs/{id}/status", post(api::update_status_handler))
        .route("/images/{id}/border", post(api::update_border_handler))
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(DefaultBodyLimit::disable())
        // 上传限制：图片上限之外再留一点 multipart 开销
        .layer(RequestBodyLimitLayer::new(max_image_bytes + 1024 * 1024))
        .with_state(state)
}
