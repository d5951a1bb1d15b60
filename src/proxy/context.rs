//! 请求上下文提取
//!
//! 从入站请求中解析出指标所需的字段，只读，不修改原始请求体

use http::HeaderMap;
use serde::Serialize;
use serde_json::Value;

/// 请求上下文（提取后不可变）
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequestContext {
    pub model: Option<String>,
    pub user: Option<String>,
    /// 调用方声明的 Origin 头
    pub origin: Option<String>,
    pub is_streaming: bool,
    pub max_tokens: Option<i64>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    /// 对话中的消息条数
    pub message_count: Option<i64>,
}

impl RequestContext {
    /// 从请求头和原始请求体提取上下文
    ///
    /// 永不失败：请求体无法解析时返回各字段均未设置、`is_streaming = false` 的上下文
    pub fn extract(headers: &HeaderMap, body: &[u8]) -> Self {
        let origin = headers
            .get("origin")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut ctx = Self {
            origin,
            ..Self::default()
        };

        let value: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("解析请求体失败，指标字段将留空: {}", e);
                return ctx;
            }
        };

        let Some(obj) = value.as_object() else {
            tracing::warn!("请求体不是 JSON 对象，指标字段将留空");
            return ctx;
        };

        let string_field = |name: &str| obj.get(name).and_then(Value::as_str).map(str::to_string);

        ctx.model = string_field("model");
        ctx.user = string_field("user");
        ctx.is_streaming = obj.get("stream").and_then(Value::as_bool).unwrap_or(false);
        ctx.max_tokens = obj.get("max_tokens").and_then(Value::as_i64);
        ctx.temperature = obj.get("temperature").and_then(Value::as_f64);
        ctx.top_p = obj.get("top_p").and_then(Value::as_f64);
        ctx.message_count = obj
            .get("messages")
            .and_then(Value::as_array)
            .filter(|messages| !messages.is_empty())
            .map(|messages| messages.len() as i64);

        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_extract_full_request() {
        let mut headers = HeaderMap::new();
        headers.insert("origin", HeaderValue::from_static("https://chat.example.com"));
        let body = br#"{
            "model": "llama3.1:8b",
            "user": "alice",
            "stream": true,
            "max_tokens": 256,
            "temperature": 0.7,
            "top_p": 0.9,
            "messages": [
                {"role": "system", "content": "Be brief"},
                {"role": "user", "content": "Hi"}
            ]
        }"#;

        let ctx = RequestContext::extract(&headers, body);
        assert_eq!(ctx.model.as_deref(), Some("llama3.1:8b"));
        assert_eq!(ctx.user.as_deref(), Some("alice"));
        assert_eq!(ctx.origin.as_deref(), Some("https://chat.example.com"));
        assert!(ctx.is_streaming);
        assert_eq!(ctx.max_tokens, Some(256));
        assert_eq!(ctx.temperature, Some(0.7));
        assert_eq!(ctx.top_p, Some(0.9));
        assert_eq!(ctx.message_count, Some(2));
    }

    #[test]
    fn test_malformed_body_yields_empty_context() {
        let ctx = RequestContext::extract(&HeaderMap::new(), b"{not json");
        assert_eq!(ctx, RequestContext::default());
        assert!(!ctx.is_streaming);
    }

    #[test]
    fn test_non_object_body_yields_empty_context() {
        let ctx = RequestContext::extract(&HeaderMap::new(), b"[1, 2, 3]");
        assert_eq!(ctx, RequestContext::default());
    }

    #[test]
    fn test_origin_survives_malformed_body() {
        let mut headers = HeaderMap::new();
        headers.insert("origin", HeaderValue::from_static("http://localhost:3000"));
        let ctx = RequestContext::extract(&headers, b"");
        assert_eq!(ctx.origin.as_deref(), Some("http://localhost:3000"));
        assert!(ctx.model.is_none());
    }

    #[test]
    fn test_wrong_types_are_ignored() {
        let body = br#"{"model": 42, "stream": "yes", "temperature": "hot", "messages": []}"#;
        let ctx = RequestContext::extract(&HeaderMap::new(), body);
        assert!(ctx.model.is_none());
        assert!(!ctx.is_streaming);
        assert!(ctx.temperature.is_none());
        // 空 messages 数组不计数
        assert!(ctx.message_count.is_none());
    }
}
