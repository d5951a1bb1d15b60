//! 指标存储
//!
//! 核心只依赖 `append` 语义：要么持久写入，要么返回错误（由调用方记录并丢弃）

use parking_lot::Mutex;
use rusqlite::Connection;

use super::model::RequestOutcome;

/// 存储分配的记录 ID
pub type RequestId = i64;

/// 写入时附带的应用版本
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("存储不可用: {0}")]
    Unavailable(String),
}

/// 结果记录存储（仅追加）
///
/// 实现需要允许并发追加而不破坏已有记录
pub trait MetricsStore: Send + Sync + 'static {
    fn append(&self, outcome: &RequestOutcome) -> Result<RequestId, StoreError>;

    /// 批量追加，默认逐条写入
    fn append_batch(&self, outcomes: &[RequestOutcome]) -> Result<Vec<RequestId>, StoreError> {
        outcomes.iter().map(|outcome| self.append(outcome)).collect()
    }
}

/// SQLite 存储
pub struct SqliteMetricsStore {
    conn: Mutex<Connection>,
}

impl SqliteMetricsStore {
    /// 打开数据库并确保 completion_requests 表存在
    pub fn open(db_path: &str) -> Result<Self, StoreError> {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Unavailable(format!("创建数据目录失败 {}: {}", parent.display(), e))
                })?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS completion_requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp DATETIME DEFAULT CURRENT_TIMESTAMP,
                request_id TEXT,
                success BOOLEAN NOT NULL,
                status_code INTEGER,
                response_time_ms INTEGER,
                model TEXT,
                user TEXT,
                origin TEXT,
                is_streaming BOOLEAN,
                max_tokens INTEGER,
                temperature REAL,
                top_p REAL,
                message_count INTEGER,
                prompt_tokens INTEGER,
                completion_tokens INTEGER,
                total_tokens INTEGER,
                finish_reason TEXT,
                time_to_first_token_ms INTEGER,
                time_to_last_token_ms INTEGER,
                tokens_per_second REAL,
                app_version TEXT DEFAULT '1.0.0',
                error_type TEXT,
                error_message TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_completion_timestamp ON completion_requests(timestamp);
            CREATE INDEX IF NOT EXISTS idx_completion_model ON completion_requests(model);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(conn: &Connection, outcome: &RequestOutcome) -> Result<RequestId, StoreError> {
        conn.execute(
            "INSERT INTO completion_requests (
                timestamp, request_id, success, status_code, response_time_ms,
                model, user, origin, is_streaming, max_tokens, temperature, top_p, message_count,
                prompt_tokens, completion_tokens, total_tokens, finish_reason,
                time_to_first_token_ms, time_to_last_token_ms, tokens_per_second,
                app_version, error_type, error_message
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
            rusqlite::params![
                outcome.timestamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
                outcome.request_id,
                outcome.success,
                outcome.status_code,
                outcome.response_time_ms,
                outcome.model,
                outcome.user,
                outcome.origin,
                outcome.is_streaming,
                outcome.max_tokens,
                outcome.temperature,
                outcome.top_p,
                outcome.message_count,
                outcome.prompt_tokens,
                outcome.completion_tokens,
                outcome.total_tokens,
                outcome.finish_reason,
                outcome.time_to_first_token_ms,
                outcome.time_to_last_token_ms,
                outcome.tokens_per_second,
                APP_VERSION,
                outcome.error_type,
                outcome.error_message,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// 已写入的记录数
    pub fn count(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock();
        let count = conn.query_row("SELECT COUNT(*) FROM completion_requests", [], |row| {
            row.get(0)
        })?;
        Ok(count)
    }
}

impl MetricsStore for SqliteMetricsStore {
    fn append(&self, outcome: &RequestOutcome) -> Result<RequestId, StoreError> {
        let conn = self.conn.lock();
        Self::insert(&conn, outcome)
    }

    fn append_batch(&self, outcomes: &[RequestOutcome]) -> Result<Vec<RequestId>, StoreError> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        let ids = outcomes
            .iter()
            .map(|outcome| Self::insert(&tx, outcome))
            .collect::<Result<Vec<_>, _>>()?;
        tx.commit()?;
        Ok(ids)
    }
}

/// 内存存储（dbPath 为空时使用，也用于测试）
#[derive(Default)]
pub struct InMemoryMetricsStore {
    records: Mutex<Vec<RequestOutcome>>,
}

impl InMemoryMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前所有记录的快照
    #[cfg(test)]
    pub fn snapshot(&self) -> Vec<RequestOutcome> {
        self.records.lock().clone()
    }
}

impl MetricsStore for InMemoryMetricsStore {
    fn append(&self, outcome: &RequestOutcome) -> Result<RequestId, StoreError> {
        let mut records = self.records.lock();
        records.push(outcome.clone());
        Ok(records.len() as RequestId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::model::{ResponseMetrics, Usage};
    use crate::proxy::classifier::{FailureContext, classify};
    use crate::proxy::context::RequestContext;

    fn sample_success() -> RequestOutcome {
        let ctx = RequestContext {
            model: Some("llama3".to_string()),
            origin: Some("http://localhost:3000".to_string()),
            is_streaming: true,
            temperature: Some(0.2),
            message_count: Some(3),
            ..Default::default()
        };
        RequestOutcome::success(
            "req-1",
            &ctx,
            200,
            800,
            ResponseMetrics {
                usage: Some(Usage {
                    prompt_tokens: Some(10),
                    completion_tokens: Some(40),
                    total_tokens: Some(50),
                }),
                finish_reason: Some("stop".to_string()),
                time_to_first_token_ms: Some(120),
                time_to_last_token_ms: Some(800),
            },
        )
    }

    #[test]
    fn test_sqlite_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("metrics.db");
        let store = SqliteMetricsStore::open(path.to_str().unwrap()).unwrap();

        let first = store.append(&sample_success()).unwrap();
        let failure = classify(&FailureContext::StreamEmpty);
        let failed = RequestOutcome::failure("req-2", &RequestContext::default(), 500, 5, &failure);
        let second = store.append(&failed).unwrap();

        assert!(second > first);
        assert_eq!(store.count().unwrap(), 2);

        let conn = store.conn.lock();
        let (model, tps, finish): (Option<String>, Option<f64>, Option<String>) = conn
            .query_row(
                "SELECT model, tokens_per_second, finish_reason FROM completion_requests WHERE id = ?1",
                [first],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(model.as_deref(), Some("llama3"));
        assert_eq!(tps, Some(50.0));
        assert_eq!(finish.as_deref(), Some("stop"));

        let (success, error_type): (bool, Option<String>) = conn
            .query_row(
                "SELECT success, error_type FROM completion_requests WHERE id = ?1",
                [second],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert!(!success);
        assert_eq!(error_type.as_deref(), Some("streaming_incomplete"));
    }

    #[test]
    fn test_sqlite_batch_append() {
        let store = SqliteMetricsStore::open(":memory:").unwrap();
        let batch = vec![sample_success(), sample_success(), sample_success()];
        let ids = store.append_batch(&batch).unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(store.count().unwrap(), 3);
    }

    #[test]
    fn test_reopen_keeps_existing_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.db");
        let path = path.to_str().unwrap();

        SqliteMetricsStore::open(path)
            .unwrap()
            .append(&sample_success())
            .unwrap();
        let store = SqliteMetricsStore::open(path).unwrap();
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_in_memory_store() {
        let store = InMemoryMetricsStore::new();
        assert_eq!(store.append(&sample_success()).unwrap(), 1);
        assert_eq!(store.append_batch(&[sample_success()]).unwrap(), vec![2]);
        assert_eq!(store.snapshot().len(), 2);
    }
}
