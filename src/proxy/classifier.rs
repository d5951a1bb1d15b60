//! 失败分类
//!
//! 把每个可区分的失败点映射为稳定的错误类型，供结果记录使用。
//! 纯函数：同一失败上下文总是得到同一 (error_type, error_message, status_code)。

use serde::Serialize;

/// 稳定的错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 收到任何后端字节之前的传输/连接失败
    ConnectionError,
    /// 后端返回非 200 状态
    HttpError,
    /// 后端返回 200 但响应体不是合法 JSON
    ResponseParseError,
    /// 流式响应没有任何 chunk 就结束
    StreamingIncomplete,
    /// 迭代流时出错（包括客户端断开）
    StreamingError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionError => "connection_error",
            Self::HttpError => "http_error",
            Self::ResponseParseError => "response_parse_error",
            Self::StreamingIncomplete => "streaming_incomplete",
            Self::StreamingError => "streaming_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 失败发生时的上下文
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureContext {
    /// 连接后端失败（拒绝连接、DNS、超时）
    Connection(String),
    /// 后端返回了非 200 状态码
    HttpStatus(u16),
    /// 200 响应体解析失败
    ResponseParse(String),
    /// 流结束时一个 chunk 都没有
    StreamEmpty,
    /// 读取后端流时出错
    StreamInterrupted(String),
    /// 客户端在流结束前断开
    ClientDisconnected { chunks: u64 },
}

/// 分类结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
    /// 写入结果记录的状态码
    pub status_code: u16,
}

/// 分类失败上下文
pub fn classify(ctx: &FailureContext) -> Failure {
    let (kind, message, status_code) = match ctx {
        FailureContext::Connection(err) => (ErrorKind::ConnectionError, err.clone(), 500),
        FailureContext::HttpStatus(status) => (
            ErrorKind::HttpError,
            format!("Backend returned {}", status),
            *status,
        ),
        FailureContext::ResponseParse(err) => (ErrorKind::ResponseParseError, err.clone(), 200),
        FailureContext::StreamEmpty => (
            ErrorKind::StreamingIncomplete,
            "Streaming did not complete successfully".to_string(),
            500,
        ),
        FailureContext::StreamInterrupted(err) => (ErrorKind::StreamingError, err.clone(), 500),
        FailureContext::ClientDisconnected { chunks } => (
            ErrorKind::StreamingError,
            format!("Client disconnected after {} chunks", chunks),
            500,
        ),
    };

    Failure {
        kind,
        message,
        status_code,
    }
}
