mod common;
mod http_client;
mod metrics;
mod model;
mod proxy;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use metrics::{InMemoryMetricsStore, MetricsStore, OutcomeRecorder, SqliteMetricsStore};
use model::config::Config;
use proxy::{BackendDispatcher, ProxyState, create_router};

/// OpenAI 兼容 LLM 后端的指标采集反向代理
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = Config::default_config_path())]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let args = Args::parse();
    let mut config = Config::load(&args.config)
        .with_context(|| format!("加载配置失败: {}", args.config))?;
    config.apply_env_overrides()?;
    if let Some(path) = config.config_path() {
        if path.exists() {
            tracing::info!("配置文件: {}", path.display());
        } else {
            tracing::info!("未找到配置文件 {}，使用默认配置", path.display());
        }
    }

    let store = open_store(&config.db_path)?;
    let recorder = OutcomeRecorder::new(store);
    let dispatcher = BackendDispatcher::new(
        config.dispatcher_config(),
        config.proxy_url.as_deref(),
        config.tls_backend,
    )?;

    let app = create_router(ProxyState::new(dispatcher.clone(), recorder));

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!("LLM Metrics Proxy 启动: http://{}", addr);
    tracing::info!("后端地址: {}", dispatcher.config().backend_base_url);
    tracing::info!(
        "请求超时: {}s, 模型列表超时: {}s",
        config.request_timeout_secs,
        config.models_timeout_secs
    );
    if let Some(proxy_url) = &config.proxy_url {
        tracing::info!("HTTP 代理: {}", proxy_url);
    }
    tracing::info!("可用端点:");
    tracing::info!("  POST /v1/chat/completions");
    tracing::info!("  GET  /v1/models");
    tracing::info!("  GET  /health");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("绑定监听地址失败: {}", addr))?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// dbPath 为空时只在内存中保留记录
fn open_store(db_path: &str) -> anyhow::Result<Arc<dyn MetricsStore>> {
    if db_path.trim().is_empty() {
        tracing::warn!("未配置 dbPath，指标仅保存在内存中");
        return Ok(Arc::new(InMemoryMetricsStore::new()));
    }
    let store = SqliteMetricsStore::open(db_path)
        .with_context(|| format!("打开指标数据库失败: {}", db_path))?;
    tracing::info!("指标数据库: {} (已有 {} 条记录)", db_path, store.count()?);
    Ok(Arc::new(store))
}
