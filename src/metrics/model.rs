//! 请求结果记录数据模型

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::proxy::classifier::Failure;
use crate::proxy::context::RequestContext;

/// 后端上报的 token 用量
///
/// 字段缺失或类型不对时视为未设置，不会导致解析失败
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
}

impl Usage {
    /// 从 usage JSON 对象宽松地提取字段；非对象返回 None
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let field = |name: &str| obj.get(name).and_then(Value::as_i64);
        Some(Self {
            prompt_tokens: field("prompt_tokens"),
            completion_tokens: field("completion_tokens"),
            total_tokens: field("total_tokens"),
        })
    }

    /// 三个计数均缺失或为 0 时视为空用量
    pub fn is_empty(&self) -> bool {
        [self.prompt_tokens, self.completion_tokens, self.total_tokens]
            .iter()
            .all(|v| v.unwrap_or(0) == 0)
    }
}

/// 计算生成速度（tokens/s）
///
/// 流式与非流式路径共用此公式；任一操作数缺失或耗时不为正时返回 None
pub fn tokens_per_second(completion_tokens: Option<i64>, elapsed_ms: Option<i64>) -> Option<f64> {
    let tokens = completion_tokens.filter(|t| *t > 0)?;
    let elapsed_ms = elapsed_ms.filter(|ms| *ms > 0)?;
    Some(tokens as f64 / (elapsed_ms as f64 / 1000.0))
}

/// 从响应中观察到的指标（流式与非流式共用）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseMetrics {
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
    pub time_to_first_token_ms: Option<i64>,
    pub time_to_last_token_ms: Option<i64>,
}

/// 单个请求的最终结果记录
///
/// 每个请求恰好创建一次，交给存储后由存储负责持久化
#[derive(Debug, Clone, Serialize)]
pub struct RequestOutcome {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub status_code: u16,
    pub response_time_ms: i64,

    pub model: Option<String>,
    pub user: Option<String>,
    pub origin: Option<String>,
    pub is_streaming: bool,
    pub max_tokens: Option<i64>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub message_count: Option<i64>,

    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub finish_reason: Option<String>,

    pub time_to_first_token_ms: Option<i64>,
    pub time_to_last_token_ms: Option<i64>,
    pub tokens_per_second: Option<f64>,

    pub error_type: Option<String>,
    pub error_message: Option<String>,
}

impl RequestOutcome {
    fn from_context(
        request_id: &str,
        ctx: &RequestContext,
        success: bool,
        status_code: u16,
        response_time_ms: i64,
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            timestamp: Utc::now(),
            success,
            status_code,
            response_time_ms,
            model: ctx.model.clone(),
            user: ctx.user.clone(),
            origin: ctx.origin.clone(),
            is_streaming: ctx.is_streaming,
            max_tokens: ctx.max_tokens,
            temperature: ctx.temperature,
            top_p: ctx.top_p,
            message_count: ctx.message_count,
            prompt_tokens: None,
            completion_tokens: None,
            total_tokens: None,
            finish_reason: None,
            time_to_first_token_ms: None,
            time_to_last_token_ms: None,
            tokens_per_second: None,
            error_type: None,
            error_message: None,
        }
    }

    /// 成功请求
    pub fn success(
        request_id: &str,
        ctx: &RequestContext,
        status_code: u16,
        response_time_ms: i64,
        metrics: ResponseMetrics,
    ) -> Self {
        let mut outcome = Self::from_context(request_id, ctx, true, status_code, response_time_ms);
        if let Some(usage) = metrics.usage {
            outcome.prompt_tokens = usage.prompt_tokens;
            outcome.completion_tokens = usage.completion_tokens;
            outcome.total_tokens = usage.total_tokens;
        }
        outcome.finish_reason = metrics.finish_reason;
        outcome.time_to_first_token_ms = metrics.time_to_first_token_ms;
        outcome.time_to_last_token_ms = metrics.time_to_last_token_ms;
        outcome.tokens_per_second =
            tokens_per_second(outcome.completion_tokens, outcome.time_to_last_token_ms);
        outcome
    }

    /// 失败请求
    pub fn failure(
        request_id: &str,
        ctx: &RequestContext,
        status_code: u16,
        response_time_ms: i64,
        failure: &Failure,
    ) -> Self {
        let mut outcome = Self::from_context(request_id, ctx, false, status_code, response_time_ms);
        outcome.error_type = Some(failure.kind.as_str().to_string());
        outcome.error_message = Some(failure.message.clone());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::classifier::{FailureContext, classify};
    use serde_json::json;

    #[test]
    fn test_usage_from_value_is_lenient() {
        let usage = Usage::from_value(&json!({
            "prompt_tokens": 12,
            "completion_tokens": "oops",
            "total_tokens": 30
        }))
        .unwrap();
        assert_eq!(usage.prompt_tokens, Some(12));
        assert_eq!(usage.completion_tokens, None);
        assert_eq!(usage.total_tokens, Some(30));

        assert!(Usage::from_value(&Value::Null).is_none());
        assert!(Usage::from_value(&json!([1, 2])).is_none());
    }

    #[test]
    fn test_usage_is_empty() {
        assert!(Usage::default().is_empty());
        assert!(Usage::from_value(&json!({})).unwrap().is_empty());
        assert!(
            Usage::from_value(&json!({"prompt_tokens": 0, "total_tokens": 0}))
                .unwrap()
                .is_empty()
        );
        assert!(!Usage::from_value(&json!({"completion_tokens": 3})).unwrap().is_empty());
    }

    #[test]
    fn test_tokens_per_second() {
        assert_eq!(tokens_per_second(Some(100), Some(2000)), Some(50.0));
        assert_eq!(tokens_per_second(None, Some(2000)), None);
        assert_eq!(tokens_per_second(Some(100), None), None);
        assert_eq!(tokens_per_second(Some(100), Some(0)), None);
        assert_eq!(tokens_per_second(Some(0), Some(1000)), None);
    }

    #[test]
    fn test_success_outcome_copies_context_and_usage() {
        let ctx = RequestContext {
            model: Some("llama3".to_string()),
            is_streaming: true,
            message_count: Some(2),
            ..Default::default()
        };
        let metrics = ResponseMetrics {
            usage: Some(Usage {
                prompt_tokens: Some(5),
                completion_tokens: Some(20),
                total_tokens: Some(25),
            }),
            finish_reason: Some("stop".to_string()),
            time_to_first_token_ms: Some(100),
            time_to_last_token_ms: Some(1000),
        };

        let outcome = RequestOutcome::success("req-1", &ctx, 200, 1000, metrics);
        assert!(outcome.success);
        assert_eq!(outcome.model.as_deref(), Some("llama3"));
        assert!(outcome.is_streaming);
        assert_eq!(outcome.total_tokens, Some(25));
        assert_eq!(outcome.tokens_per_second, Some(20.0));
        assert!(outcome.error_type.is_none());
        assert!(outcome.error_message.is_none());
    }

    #[test]
    fn test_failure_outcome_has_error_fields_only() {
        let ctx = RequestContext::default();
        let failure = classify(&FailureContext::HttpStatus(503));
        let outcome = RequestOutcome::failure("req-2", &ctx, 503, 12, &failure);

        assert!(!outcome.success);
        assert_eq!(outcome.status_code, 503);
        assert_eq!(outcome.error_type.as_deref(), Some("http_error"));
        assert_eq!(outcome.error_message.as_deref(), Some("Backend returned 503"));
        assert!(outcome.total_tokens.is_none());
        assert!(outcome.time_to_first_token_ms.is_none());
    }
}
