//! 结果记录器
//!
//! HTTP 响应路径只把记录放进 channel，写库在独立的后台任务中完成，
//! 写入失败只记日志，永远不会影响客户端响应

use std::sync::Arc;

use tokio::sync::mpsc;

use super::model::RequestOutcome;
use super::store::MetricsStore;

/// channel 容量
const CHANNEL_CAPACITY: usize = 10_000;
/// 单批最多写入的记录数
const MAX_BATCH_SIZE: usize = 500;

/// 异步结果记录器（公开 API）
#[derive(Clone)]
pub struct OutcomeRecorder {
    sender: mpsc::Sender<RequestOutcome>,
}

impl OutcomeRecorder {
    /// 创建新的 OutcomeRecorder，启动后台写入任务
    pub fn new(store: Arc<dyn MetricsStore>) -> Self {
        Self::with_capacity(store, CHANNEL_CAPACITY)
    }

    fn with_capacity(store: Arc<dyn MetricsStore>, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<RequestOutcome>(capacity);
        tokio::spawn(Self::write_loop(store, receiver));
        Self { sender }
    }

    /// 非阻塞记录结果（发送到 channel）
    ///
    /// 可在 Drop 等同步上下文中调用
    pub fn record(&self, outcome: RequestOutcome) {
        if let Err(e) = self.sender.try_send(outcome) {
            tracing::warn!("结果记录通道已满或已关闭，丢弃记录: {}", e);
        }
    }

    /// 后台写入循环
    async fn write_loop(store: Arc<dyn MetricsStore>, mut receiver: mpsc::Receiver<RequestOutcome>) {
        while let Some(first) = receiver.recv().await {
            // 取出当前所有可用记录组成一批
            let mut batch = vec![first];
            while let Ok(outcome) = receiver.try_recv() {
                batch.push(outcome);
                if batch.len() >= MAX_BATCH_SIZE {
                    break;
                }
            }

            let store = store.clone();
            let result = tokio::task::spawn_blocking(move || {
                let count = batch.len();
                match store.append_batch(&batch) {
                    Ok(_) => tracing::debug!("已写入 {} 条请求记录", count),
                    Err(e) => tracing::error!("写入 {} 条请求记录失败: {}", count, e),
                }
            })
            .await;

            if let Err(e) = result {
                tracing::error!("请求记录写入任务异常退出: {}", e);
            }
        }
        tracing::debug!("结果记录写入循环已退出");
    }
}
