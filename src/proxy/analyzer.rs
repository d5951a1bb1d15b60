//! 非流式响应分析
//!
//! 等待完整响应体，只解析一次 JSON；无论解析成功与否，原始字节都原样返回

use std::time::Instant;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::Value;

use crate::common::duration_ms;
use crate::metrics::model::{RequestOutcome, ResponseMetrics, Usage};
use crate::metrics::recorder::OutcomeRecorder;

use super::classifier::{FailureContext, classify};
use super::context::RequestContext;
use super::dispatcher::{DispatchError, relay_response_headers};

/// 从完整响应体中提取 usage 与 finish_reason
///
/// 响应体不是 JSON 对象时返回错误；缺失或类型不对的字段视为未设置
pub fn analyze_body(body: &[u8]) -> Result<ResponseMetrics, String> {
    let value: Value = serde_json::from_slice(body).map_err(|e| e.to_string())?;
    let obj = value
        .as_object()
        .ok_or_else(|| "response body is not a JSON object".to_string())?;

    let usage = obj.get("usage").and_then(Usage::from_value);
    let finish_reason = obj
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("finish_reason"))
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(ResponseMetrics {
        usage,
        finish_reason,
        time_to_first_token_ms: None,
        time_to_last_token_ms: None,
    })
}

/// 处理非流式分支：读取完整响应体、记录结果、原样返回
///
/// 读取响应体时的传输错误作为 DispatchError 返回，由调用方按连接错误处理
pub async fn relay_buffered(
    upstream: reqwest::Response,
    request_id: &str,
    ctx: &RequestContext,
    started: Instant,
    recorder: &OutcomeRecorder,
) -> Result<Response, DispatchError> {
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    relay_response_headers(&mut headers);

    let body = upstream.bytes().await?;
    let response_time_ms = duration_ms(started.elapsed());
    tracing::info!(
        request_id = %request_id,
        status = status.as_u16(),
        response_time_ms,
        "收到后端响应"
    );

    let outcome = if status == StatusCode::OK {
        match analyze_body(&body) {
            Ok(mut metrics) => {
                // 非流式响应没有中间 token 边界
                metrics.time_to_first_token_ms = Some(response_time_ms);
                metrics.time_to_last_token_ms = Some(response_time_ms);
                tracing::info!(
                    request_id = %request_id,
                    total_tokens = ?metrics.usage.and_then(|u| u.total_tokens),
                    finish_reason = ?metrics.finish_reason,
                    "响应解析完成"
                );
                RequestOutcome::success(request_id, ctx, status.as_u16(), response_time_ms, metrics)
            }
            Err(e) => {
                tracing::error!(request_id = %request_id, "解析响应失败: {}", e);
                let failure = classify(&FailureContext::ResponseParse(e));
                RequestOutcome::failure(
                    request_id,
                    ctx,
                    failure.status_code,
                    response_time_ms,
                    &failure,
                )
            }
        }
    } else {
        tracing::error!(request_id = %request_id, status = status.as_u16(), "后端返回错误状态");
        let failure = classify(&FailureContext::HttpStatus(status.as_u16()));
        RequestOutcome::failure(request_id, ctx, failure.status_code, response_time_ms, &failure)
    };

    recorder.record(outcome);
    Ok((status, headers, body).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analyze_complete_body() {
        let body = br#"{
            "id": "chatcmpl-1",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hi"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }"#;
        let metrics = analyze_body(body).unwrap();
        let usage = metrics.usage.unwrap();
        assert_eq!(usage.prompt_tokens, Some(10));
        assert_eq!(usage.completion_tokens, Some(5));
        assert_eq!(usage.total_tokens, Some(15));
        assert_eq!(metrics.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_analyze_missing_fields_are_unset() {
        let metrics = analyze_body(br#"{"choices": []}"#).unwrap();
        assert!(metrics.usage.is_none());
        assert!(metrics.finish_reason.is_none());

        let metrics = analyze_body(br#"{"usage": "n/a", "choices": [{"finish_reason": 7}]}"#).unwrap();
        assert!(metrics.usage.is_none());
        assert!(metrics.finish_reason.is_none());
    }

    #[test]
    fn test_analyze_rejects_non_json() {
        assert!(analyze_body(b"<html>Bad Gateway</html>").is_err());
        assert!(analyze_body(b"[1,2]").is_err());
        assert!(analyze_body(b"").is_err());
    }
}
