//! 代理路由

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

use crate::metrics::OutcomeRecorder;

use super::dispatcher::{BackendDispatcher, CHAT_COMPLETIONS_PATH, MODELS_PATH};
use super::handlers::{chat_completions, health, list_models};

/// 代理 API 状态
#[derive(Clone)]
pub struct ProxyState {
    pub dispatcher: BackendDispatcher,
    pub recorder: OutcomeRecorder,
}

impl ProxyState {
    pub fn new(dispatcher: BackendDispatcher, recorder: OutcomeRecorder) -> Self {
        Self {
            dispatcher,
            recorder,
        }
    }
}

/// 创建代理路由
///
/// # 端点
/// - `POST /v1/chat/completions` - 转发并记录指标
/// - `GET /v1/models` - 透传，不记录
/// - `GET /health` - 本地健康检查
///
/// 请求体不设大小上限，原样转发给后端
pub fn create_router(state: ProxyState) -> Router {
    Router::new()
        .route(CHAT_COMPLETIONS_PATH, post(chat_completions))
        .route(MODELS_PATH, get(list_models))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::disable())
        .layer(cors_layer())
        .with_state(state)
}

/// CORS 中间件层
///
/// 允许任何来源、方法和请求头
fn cors_layer() -> tower_http::cors::CorsLayer {
    use tower_http::cors::{Any, CorsLayer};

    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}
