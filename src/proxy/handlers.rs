//! 代理 API 处理器

use std::time::Instant;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};

use crate::common::duration_ms;
use crate::metrics::model::RequestOutcome;

use super::analyzer::relay_buffered;
use super::classifier::{FailureContext, classify};
use super::context::RequestContext;
use super::dispatcher::{DispatchError, relay_response_headers};
use super::router::ProxyState;
use super::stream::{StreamDecoder, relay_stream};
use super::types::{ErrorResponse, HealthResponse};

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().simple())
}

/// POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let request_id = new_request_id();
    tracing::info!(request_id = %request_id, body_bytes = body.len(), "收到 chat completions 请求");

    #[cfg(feature = "sensitive-logs")]
    tracing::debug!(
        request_id = %request_id,
        "请求体: {}",
        crate::common::truncate_with_ellipsis(&String::from_utf8_lossy(&body), 4096)
    );

    let ctx = RequestContext::extract(&headers, &body);
    tracing::info!(
        request_id = %request_id,
        model = ?ctx.model,
        user = ?ctx.user,
        origin = ?ctx.origin,
        streaming = ctx.is_streaming,
        messages = ?ctx.message_count,
        "请求详情"
    );

    let upstream = match state.dispatcher.send_chat_completion(&headers, body).await {
        Ok(upstream) => upstream,
        Err(e) => return connection_failure(&state, &request_id, &ctx, started, e),
    };

    if ctx.is_streaming {
        let decoder = StreamDecoder::new(request_id, ctx, started, state.recorder.clone());
        relay_stream(upstream, decoder).await
    } else {
        match relay_buffered(upstream, &request_id, &ctx, started, &state.recorder).await {
            Ok(response) => response,
            Err(e) => connection_failure(&state, &request_id, &ctx, started, e),
        }
    }
}

/// 传输层失败：记录 connection_error，返回网关错误
fn connection_failure(
    state: &ProxyState,
    request_id: &str,
    ctx: &RequestContext,
    started: Instant,
    error: DispatchError,
) -> Response {
    let DispatchError::Transport(source) = &error;
    tracing::error!(request_id = %request_id, "请求后端失败: {}", source);

    let failure = classify(&FailureContext::Connection(source.to_string()));
    state.recorder.record(RequestOutcome::failure(
        request_id,
        ctx,
        failure.status_code,
        duration_ms(started.elapsed()),
        &failure,
    ));

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new(failure.kind.as_str(), error.to_string())),
    )
        .into_response()
}

/// GET /v1/models
///
/// 纯透传，不记录指标
pub async fn list_models(State(state): State<ProxyState>, headers: HeaderMap) -> Response {
    tracing::info!("收到模型列表请求");

    let upstream = match state.dispatcher.fetch_models(&headers).await {
        Ok(upstream) => upstream,
        Err(e) => return models_failure(e),
    };

    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    relay_response_headers(&mut headers);
    match upstream.bytes().await {
        Ok(body) => {
            tracing::info!(status = status.as_u16(), "后端模型列表响应");
            (status, headers, body).into_response()
        }
        Err(e) => models_failure(e.into()),
    }
}

fn models_failure(error: DispatchError) -> Response {
    tracing::error!("模型列表请求失败: {}", error);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new("connection_error", error.to_string())),
    )
        .into_response()
}

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}
