use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TlsBackend {
    Rustls,
    NativeTls,
}

impl Default for TlsBackend {
    fn default() -> Self {
        Self::Rustls
    }
}

/// 代理应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// 后端主机名（未配置 backend_url 时使用）
    #[serde(default = "default_backend_host")]
    pub backend_host: String,

    /// 后端端口（未配置 backend_url 时使用）
    #[serde(default = "default_backend_port")]
    pub backend_port: u16,

    /// 完整的后端基础 URL（可选，优先于 backend_host/backend_port）
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_url: Option<String>,

    /// chat completions 请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// /v1/models 透传请求超时（秒）
    #[serde(default = "default_models_timeout_secs")]
    pub models_timeout_secs: u64,

    /// 指标数据库路径
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// HTTP 代理地址（可选）
    /// 支持格式: http://host:port, https://host:port, socks5://host:port
    #[serde(default)]
    pub proxy_url: Option<String>,

    #[serde(default = "default_tls_backend")]
    pub tls_backend: TlsBackend,

    /// 配置文件路径（运行时元数据，不写入 JSON）
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_backend_host() -> String {
    "ollama".to_string()
}

fn default_backend_port() -> u16 {
    11434
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_models_timeout_secs() -> u64 {
    30
}

fn default_db_path() -> String {
    "./data/metrics.db".to_string()
}

fn default_tls_backend() -> TlsBackend {
    TlsBackend::Rustls
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backend_host: default_backend_host(),
            backend_port: default_backend_port(),
            backend_url: None,
            request_timeout_secs: default_request_timeout_secs(),
            models_timeout_secs: default_models_timeout_secs(),
            db_path: default_db_path(),
            proxy_url: None,
            tls_backend: default_tls_backend(),
            config_path: None,
        }
    }
}

/// 分发器使用的静态配置，进程启动时解析一次，之后不再变化
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// 后端基础 URL（不含末尾斜杠）
    pub backend_base_url: String,
    pub request_timeout: Duration,
    pub models_timeout: Duration,
}

impl Config {
    /// 获取默认配置文件路径
    pub fn default_config_path() -> &'static str {
        "config.json"
    }

    /// 获取有效的后端基础 URL
    /// 优先使用 backend_url，未配置时由 backend_host/backend_port 拼接
    pub fn effective_backend_url(&self) -> String {
        match self.backend_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => url.trim_end_matches('/').to_string(),
            _ => format!("http://{}:{}", self.backend_host, self.backend_port),
        }
    }

    /// 生成分发器配置
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            backend_base_url: self.effective_backend_url(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            models_timeout: Duration::from_secs(self.models_timeout_secs),
        }
    }

    /// 从文件加载配置
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            // 配置文件不存在，返回默认配置
            let mut config = Self::default();
            config.config_path = Some(path.to_path_buf());
            return Ok(config);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        let mut config: Config = serde_json::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
        config.config_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// 应用环境变量覆盖（BACKEND_HOST / BACKEND_PORT / PROXY_PORT / DB_PATH）
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("BACKEND_HOST") {
            self.backend_host = host;
        }
        if let Some(port) = lookup("BACKEND_PORT") {
            self.backend_port = port
                .trim()
                .parse()
                .with_context(|| format!("无效的 BACKEND_PORT: {}", port))?;
        }
        if let Some(port) = lookup("PROXY_PORT") {
            self.port = port
                .trim()
                .parse()
                .with_context(|| format!("无效的 PROXY_PORT: {}", port))?;
        }
        if let Some(path) = lookup("DB_PATH") {
            self.db_path = path;
        }
        Ok(())
    }

    /// 获取配置文件路径（如果有）
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }
}
