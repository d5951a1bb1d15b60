//! 请求指标模块
//!
//! 结果记录模型、仅追加存储以及异步记录器

pub mod model;
pub mod recorder;
pub mod store;

pub use recorder::OutcomeRecorder;
pub use store::{InMemoryMetricsStore, MetricsStore, SqliteMetricsStore};

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::model::RequestOutcome;
    use super::store::{InMemoryMetricsStore, MetricsStore, RequestId, StoreError};

    /// 总是写入失败的存储
    #[derive(Default)]
    pub struct FailingStore {
        attempts: AtomicUsize,
    }

    impl FailingStore {
        pub fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    impl MetricsStore for FailingStore {
        fn append(&self, _outcome: &RequestOutcome) -> Result<RequestId, StoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Unavailable("磁盘已满".to_string()))
        }
    }

    /// 等待后台写入任务把至少 `count` 条记录写进存储
    pub async fn wait_for_records(store: &InMemoryMetricsStore, count: usize) -> Vec<RequestOutcome> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let records = store.snapshot();
            if records.len() >= count {
                return records;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {} records, got {}",
                count,
                records.len()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
