//! 流式响应解码
//!
//! 状态机：`AwaitingHeaders → Streaming → {Completed, Failed}`。
//! 每个后端 chunk 原样立即转发给客户端；JSON 解码推迟到该 chunk 交出之后，
//! 解码失败一律忽略，不影响转发。

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::common::{duration_ms, truncate_with_ellipsis};
use crate::metrics::model::{RequestOutcome, ResponseMetrics, Usage};
use crate::metrics::recorder::OutcomeRecorder;

use super::classifier::{FailureContext, classify};
use super::context::RequestContext;
use super::dispatcher::relay_response_headers;

/// SSE 数据行前缀
const DATA_PREFIX: &str = "data:";
/// 流结束标记
const DONE_SENTINEL: &str = "[DONE]";
/// 未遇到换行时行缓冲的最大字节数
const MAX_LINE_BUFFER_BYTES: usize = 1024 * 1024;
/// 默认结束原因（未从帧中解析到 finish_reason 时使用）
pub const DEFAULT_FINISH_REASON: &str = "stream_complete";

/// 单帧中解析出的元数据
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameMetadata {
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
}

/// 从一行 SSE 帧中提取用量和结束原因
///
/// 非 `data:` 行、结束标记、非 JSON 负载以及不含有用字段的帧都返回 None
pub fn try_extract(frame: &str) -> Option<FrameMetadata> {
    let payload = frame.strip_prefix(DATA_PREFIX)?.trim();
    if payload.is_empty() || payload == DONE_SENTINEL {
        return None;
    }

    let value: Value = serde_json::from_str(payload).ok()?;

    let usage = value
        .get("usage")
        .and_then(Usage::from_value)
        .filter(|usage| !usage.is_empty());

    let finish_reason = value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("finish_reason"))
        .and_then(Value::as_str)
        .filter(|reason| !reason.is_empty())
        .map(str::to_string);

    if usage.is_none() && finish_reason.is_none() {
        return None;
    }

    Some(FrameMetadata {
        usage,
        finish_reason,
    })
}

/// chunk 是否仅包含结束标记帧
fn is_terminator_chunk(chunk: &[u8]) -> bool {
    let text = String::from_utf8_lossy(chunk);
    text.trim()
        .strip_prefix(DATA_PREFIX)
        .is_some_and(|payload| payload.trim() == DONE_SENTINEL)
}

/// 按行切分 SSE 字节流，处理跨 chunk 的帧边界
#[derive(Debug, Default)]
struct SseLineBuffer {
    buffer: BytesMut,
    /// 已确认不含换行符的前缀长度
    scanned: usize,
}

impl SseLineBuffer {
    /// 追加 chunk，返回其中所有完整的行（不含换行符）
    ///
    /// 只扫描新追加的字节，跨多个 chunk 的长帧不会被重复扫描
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(offset) = self.buffer[self.scanned..].iter().position(|b| *b == b'\n') {
            let pos = self.scanned + offset;
            let line = self.buffer.split_to(pos + 1);
            let line = String::from_utf8_lossy(&line[..pos]);
            lines.push(line.trim_end_matches('\r').to_string());
            self.scanned = 0;
        }
        self.scanned = self.buffer.len();

        if self.buffer.len() > MAX_LINE_BUFFER_BYTES {
            tracing::debug!("SSE 行缓冲超过上限，丢弃未完成的帧");
            self.buffer.clear();
            self.scanned = 0;
        }

        lines
    }

    /// 取出末尾未以换行结束的残留行
    fn finish(&mut self) -> Option<String> {
        self.scanned = 0;
        if self.buffer.is_empty() {
            return None;
        }
        let rest = self.buffer.split();
        let line = String::from_utf8_lossy(&rest);
        let line = line.trim_end_matches('\r');
        (!line.is_empty()).then(|| line.to_string())
    }
}

/// 解码器所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    AwaitingHeaders,
    Streaming,
    Completed,
    Failed,
}

/// 单个流式响应的观测状态
#[derive(Debug, Clone)]
pub struct StreamState {
    pub first_token_at: Option<Instant>,
    pub last_token_at: Option<Instant>,
    pub chunk_count: u64,
    pub usage: Option<Usage>,
    pub finish_reason: String,
    pub done_seen: bool,
}

impl Default for StreamState {
    fn default() -> Self {
        Self {
            first_token_at: None,
            last_token_at: None,
            chunk_count: 0,
            usage: None,
            finish_reason: DEFAULT_FINISH_REASON.to_string(),
            done_seen: false,
        }
    }
}

impl StreamState {
    /// 记录一个 chunk 的到达时间
    fn mark_chunk(&mut self, now: Instant) {
        if self.first_token_at.is_none() {
            self.first_token_at = Some(now);
        }
        self.last_token_at = Some(now);
        self.chunk_count += 1;
    }

    /// 合并一帧元数据：后出现的 usage / finish_reason 覆盖先前的值
    fn apply(&mut self, meta: FrameMetadata) {
        if let Some(usage) = meta.usage {
            self.usage = Some(usage);
        }
        if let Some(reason) = meta.finish_reason {
            self.finish_reason = reason;
        }
    }
}

/// 流式响应解码器
///
/// 独占一个响应的 StreamState，在终止点恰好记录一次结果
pub struct StreamDecoder {
    request_id: String,
    ctx: RequestContext,
    started: Instant,
    recorder: OutcomeRecorder,
    phase: StreamPhase,
    state: StreamState,
    lines: SseLineBuffer,
    /// 已转发、尚未解码的 chunk
    pending: Option<Bytes>,
}

impl StreamDecoder {
    pub fn new(
        request_id: impl Into<String>,
        ctx: RequestContext,
        started: Instant,
        recorder: OutcomeRecorder,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            ctx,
            started,
            recorder,
            phase: StreamPhase::AwaitingHeaders,
            state: StreamState::default(),
            lines: SseLineBuffer::default(),
            pending: None,
        }
    }

    #[cfg(test)]
    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    #[cfg(test)]
    pub fn state(&self) -> &StreamState {
        &self.state
    }

    /// 后端返回非 200：直接进入 Failed，记录 http_error
    pub fn reject(&mut self, status: u16) {
        if self.phase != StreamPhase::AwaitingHeaders {
            return;
        }
        tracing::error!(request_id = %self.request_id, status, "后端返回错误状态");
        self.fail(FailureContext::HttpStatus(status));
    }

    /// 后端返回 200：进入 Streaming
    pub fn begin(&mut self) {
        if self.phase == StreamPhase::AwaitingHeaders {
            tracing::info!(request_id = %self.request_id, "开始转发流式响应");
            self.phase = StreamPhase::Streaming;
        }
    }

    /// 观测一个已转发的 chunk：立即更新计时，解码推迟到下一次调用
    pub fn observe(&mut self, chunk: &Bytes) {
        if self.phase != StreamPhase::Streaming {
            return;
        }
        self.decode_pending();

        if chunk.is_empty() {
            return;
        }

        if is_terminator_chunk(chunk) {
            tracing::info!(request_id = %self.request_id, "流以 [DONE] 标记结束");
            self.state.done_seen = true;
            return;
        }

        let now = Instant::now();
        if self.state.first_token_at.is_none() {
            tracing::info!(
                request_id = %self.request_id,
                ttft_ms = duration_ms(now.duration_since(self.started)),
                "收到首个 token"
            );
        }
        self.state.mark_chunk(now);
        self.pending = Some(chunk.clone());
    }

    /// 解码上一个已转发的 chunk
    fn decode_pending(&mut self) {
        let Some(chunk) = self.pending.take() else {
            return;
        };
        for line in self.lines.push(&chunk) {
            self.decode_line(&line);
        }
    }

    fn decode_line(&mut self, line: &str) {
        if let Some(meta) = try_extract(line) {
            if let Some(usage) = meta.usage.as_ref() {
                tracing::debug!(request_id = %self.request_id, ?usage, "从流中捕获 usage");
            }
            if let Some(reason) = meta.finish_reason.as_deref() {
                tracing::debug!(request_id = %self.request_id, finish_reason = reason, "从流中捕获 finish_reason");
            }
            self.state.apply(meta);
        }
    }

    /// 后端流正常耗尽
    pub fn complete(&mut self) {
        if self.phase != StreamPhase::Streaming {
            return;
        }
        self.drain_decoder();

        let (Some(first), Some(last)) = (self.state.first_token_at, self.state.last_token_at) else {
            tracing::warn!(request_id = %self.request_id, "流结束时未收到任何 chunk");
            self.fail(FailureContext::StreamEmpty);
            return;
        };

        if !self.state.done_seen {
            tracing::debug!(request_id = %self.request_id, "流结束但未收到 [DONE] 标记");
        }

        self.phase = StreamPhase::Completed;
        let response_time_ms = duration_ms(self.started.elapsed());
        let metrics = ResponseMetrics {
            usage: self.state.usage,
            finish_reason: Some(self.state.finish_reason.clone()),
            time_to_first_token_ms: Some(duration_ms(first.duration_since(self.started))),
            time_to_last_token_ms: Some(duration_ms(last.duration_since(self.started))),
        };

        tracing::info!(
            request_id = %self.request_id,
            chunks = self.state.chunk_count,
            response_time_ms,
            finish_reason = %self.state.finish_reason,
            "流式响应完成"
        );

        let outcome =
            RequestOutcome::success(&self.request_id, &self.ctx, 200, response_time_ms, metrics);
        self.recorder.record(outcome);
    }

    /// 读取后端流出错
    pub fn interrupt(&mut self, error: &str) {
        if self.phase != StreamPhase::Streaming {
            return;
        }
        self.drain_decoder();
        tracing::error!(
            request_id = %self.request_id,
            chunks = self.state.chunk_count,
            "流式传输错误: {}",
            truncate_with_ellipsis(error, 512)
        );
        self.fail(FailureContext::StreamInterrupted(error.to_string()));
    }

    /// 客户端在流结束前断开
    pub fn abandon(&mut self) {
        if self.phase != StreamPhase::Streaming {
            return;
        }
        self.drain_decoder();
        tracing::warn!(
            request_id = %self.request_id,
            chunks = self.state.chunk_count,
            "客户端在流结束前断开连接"
        );
        self.fail(FailureContext::ClientDisconnected {
            chunks: self.state.chunk_count,
        });
    }

    fn drain_decoder(&mut self) {
        self.decode_pending();
        if let Some(line) = self.lines.finish() {
            self.decode_line(&line);
        }
    }

    fn fail(&mut self, ctx: FailureContext) {
        self.phase = StreamPhase::Failed;
        let failure = classify(&ctx);
        let outcome = RequestOutcome::failure(
            &self.request_id,
            &self.ctx,
            failure.status_code,
            duration_ms(self.started.elapsed()),
            &failure,
        );
        self.recorder.record(outcome);
    }

    fn is_terminal(&self) -> bool {
        matches!(self.phase, StreamPhase::Completed | StreamPhase::Failed)
    }
}

/// 包装后端字节流：原样转发每个 chunk，同时驱动 StreamDecoder
pub struct ObservedStream<S> {
    upstream: S,
    decoder: StreamDecoder,
}

impl<S> ObservedStream<S> {
    pub fn new(upstream: S, decoder: StreamDecoder) -> Self {
        Self { upstream, decoder }
    }
}

impl<S, E> Stream for ObservedStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.as_mut().get_mut();
        if this.decoder.is_terminal() {
            return Poll::Ready(None);
        }

        match Pin::new(&mut this.upstream).poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                this.decoder.observe(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.decoder.interrupt(&err.to_string());
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.decoder.complete();
                Poll::Ready(None)
            }
        }
    }
}

impl<S> Drop for ObservedStream<S> {
    fn drop(&mut self) {
        // 客户端断开时 body 被提前丢弃，尽力记录部分结果
        self.decoder.abandon();
    }
}

/// 处理流式分支：非 200 原样返回错误体，200 时边转发边观测
pub async fn relay_stream(upstream: reqwest::Response, mut decoder: StreamDecoder) -> Response {
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    relay_response_headers(&mut headers);

    if status != StatusCode::OK {
        decoder.reject(status.as_u16());
        let body = match upstream.bytes().await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!("读取后端错误响应体失败: {}", e);
                Bytes::new()
            }
        };
        return (status, headers, body).into_response();
    }

    decoder.begin();
    headers
        .entry(header::CONTENT_TYPE)
        .or_insert(HeaderValue::from_static("text/event-stream"));

    let stream = ObservedStream::new(upstream.bytes_stream().boxed(), decoder);
    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
