//! 后端分发
//!
//! 把原始请求体和清洗后的请求头转发到唯一配置的后端，带整体超时

use http::{HeaderMap, HeaderValue, header};
use bytes::Bytes;
use reqwest::Client;

use crate::http_client::build_client;
use crate::model::config::{DispatcherConfig, TlsBackend};

/// 不应跨越代理转发的逐跳头
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
pub const MODELS_PATH: &str = "/v1/models";

/// 传输层失败（在收到任何后端字节之前）
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Failed to connect to backend: {0}")]
    Transport(#[from] reqwest::Error),
}

/// 清洗入站请求头，得到转发给后端的请求头
pub fn sanitize_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in HOP_BY_HOP_HEADERS {
        out.remove(*name);
    }
    out
}

/// chat completions 转发用的请求头
///
/// 强制 `accept-encoding: identity`：响应体需要按明文解析用量
pub fn chat_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = sanitize_request_headers(headers);
    out.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    out
}

/// 移除后端响应头中的逐跳头，其余原样回传
pub fn relay_response_headers(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// 后端分发器
///
/// 配置在构造时传入，之后不再变化
#[derive(Clone)]
pub struct BackendDispatcher {
    config: DispatcherConfig,
    client: Client,
    models_client: Client,
}

impl BackendDispatcher {
    pub fn new(
        config: DispatcherConfig,
        proxy_url: Option<&str>,
        tls_backend: TlsBackend,
    ) -> anyhow::Result<Self> {
        let client = build_client(proxy_url, config.request_timeout, tls_backend)?;
        let models_client = build_client(proxy_url, config.models_timeout, tls_backend)?;
        Ok(Self {
            config,
            client,
            models_client,
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// 拼接后端地址
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.backend_base_url, path)
    }

    /// 转发 chat completions 请求
    ///
    /// 返回的响应只代表已收到响应头，响应体由调用方按流式/非流式分支读取
    pub async fn send_chat_completion(
        &self,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response, DispatchError> {
        let response = self
            .client
            .post(self.endpoint(CHAT_COMPLETIONS_PATH))
            .headers(chat_request_headers(headers))
            .body(body)
            .send()
            .await?;
        Ok(response)
    }

    /// 透传 /v1/models
    pub async fn fetch_models(&self, headers: &HeaderMap) -> Result<reqwest::Response, DispatchError> {
        let response = self
            .models_client
            .get(self.endpoint(MODELS_PATH))
            .headers(sanitize_request_headers(headers))
            .send()
            .await?;
        Ok(response)
    }
}
