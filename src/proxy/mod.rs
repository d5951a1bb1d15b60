//! OpenAI 兼容代理模块
//!
//! 请求上下文提取、后端转发、流式/非流式响应分析以及失败分类

pub mod analyzer;
pub mod classifier;
pub mod context;
pub mod dispatcher;
mod handlers;
mod router;
pub mod stream;
pub mod types;

pub use dispatcher::BackendDispatcher;
pub use router::{ProxyState, create_router};
