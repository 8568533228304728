//! レスポンスオーケストレーター
//!
//! ファサードが返した生の結果（JSON 1 つ、またはチャンク列）を消費して、
//! 思考／回答の分離、メタデータの集約、TTFT・レイテンシ・速度の計測を行い、
//! イベントを流しながら最終的な `Reply` を組み立てる。

use crate::cancel::CancelSignal;
use crate::clock::{Clock, StdClock};
use crate::error::Error;
use crate::events::{emit, EventSink, LlmEvent};
use crate::metrics::{as_millis_f64, finalize_metrics, Metrics, Timing};
use crate::provider::{ChatResponse, ChunkStream, LlmProvider};
use crate::reply::{Reply, ReplyStatus};
use crate::think::{finish_split, split_thinking, Segment, ThinkStreamParser};
use crate::tokens::{HeuristicTokenCounter, TokenCounter};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// generation_metrics イベントの既定の送信間隔
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_millis(100);

/// キャンセル時に finish_reason に入れる値
pub const CANCELLED_FINISH_REASON: &str = "cancelled";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// generation_metrics の間引き間隔
    pub metrics_interval: Duration,
    /// 問い合わせ全体の締め切り（チャンクの合間に確認する）
    pub query_timeout: Option<Duration>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            metrics_interval: DEFAULT_METRICS_INTERVAL,
            query_timeout: None,
        }
    }
}

/// 1 リクエスト分の文脈
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// 設定上のモデル名（サーバーが model を返さないときに使う）
    pub model: String,
    /// プロンプト側トークン数の見積もりに使う本文
    pub prompt_text: String,
    /// リクエスト送信直前の時刻
    pub start: Instant,
}

/// 処理の途中で失敗したときの情報
#[derive(Debug)]
pub struct StreamFailure {
    /// Response エラーなら受信済み本文が `partial` に入っている
    pub error: Error,
    /// 失敗時点までのメトリクス（error フィールド付き）
    pub partial_metrics: Metrics,
    /// 失敗までに受信していた本文（エラーの種別によらない）
    pub partial_response: Option<String>,
}

/// ストリーム処理中の状態
struct StreamState {
    parser: ThinkStreamParser,
    /// マーカー込みの受信テキスト全体
    raw: String,
    thinking: String,
    content: String,
    first_token: Option<Instant>,
    server: Metrics,
    finish_reason: Option<String>,
    logprobs: Vec<Value>,
    chunks: usize,
    last_metrics_at: Option<Instant>,
    last_tokens: u64,
}

impl StreamState {
    fn new() -> Self {
        Self {
            parser: ThinkStreamParser::new(),
            raw: String::new(),
            thinking: String::new(),
            content: String::new(),
            first_token: None,
            server: Metrics::default(),
            finish_reason: None,
            logprobs: Vec::new(),
            chunks: 0,
            last_metrics_at: None,
            last_tokens: 0,
        }
    }

    /// 確定した断片を蓄積し、イベントとして流す
    fn apply(&mut self, segments: Vec<Segment>, sink: &mut dyn EventSink) {
        for seg in segments {
            match seg {
                Segment::Content(text) => {
                    self.content.push_str(&text);
                    emit(sink, LlmEvent::Content(text));
                }
                Segment::Thinking(text) => {
                    self.thinking.push_str(&text);
                    emit(sink, LlmEvent::Thinking(text));
                }
            }
        }
    }
}

/// レスポンスオーケストレーター
pub struct ResponseOrchestrator {
    clock: Arc<dyn Clock>,
    counter: Arc<dyn TokenCounter>,
    settings: OrchestratorSettings,
}

impl Default for ResponseOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseOrchestrator {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(StdClock),
            counter: Arc::new(HeuristicTokenCounter),
            settings: OrchestratorSettings::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// 計測に使う時計の現在時刻（リクエスト開始時刻の記録用）
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// ファサードの結果を処理して Reply を返す
    pub fn process(
        &self,
        provider: &dyn LlmProvider,
        response: ChatResponse,
        ctx: &RequestContext,
        sink: &mut dyn EventSink,
        cancel: &dyn CancelSignal,
    ) -> Result<Reply, StreamFailure> {
        match response {
            ChatResponse::Full(v) => self.process_full(provider, &v, ctx, sink),
            ChatResponse::Stream(chunks) => self.process_stream(provider, chunks, ctx, sink, cancel),
        }
    }

    fn process_full(
        &self,
        provider: &dyn LlmProvider,
        response: &Value,
        ctx: &RequestContext,
        sink: &mut dyn EventSink,
    ) -> Result<Reply, StreamFailure> {
        if let Some(err) = response.get("error").filter(|e| !e.is_null()) {
            let msg = err
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| err.as_str().map(str::to_string))
                .unwrap_or_else(|| err.to_string());
            return Err(self.failure(Error::response(msg), ctx, Metrics::default(), None, ""));
        }
        let choices = provider.extract_choices(response);
        if choices.is_empty() {
            return Err(self.failure(
                Error::response("response contains no choices"),
                ctx,
                provider.extract_metadata_from_response(response),
                None,
                "",
            ));
        }
        let raw: String = choices
            .iter()
            .map(|c| provider.extract_content_from_choice(c))
            .collect();
        let logprobs: Vec<Value> = choices
            .iter()
            .filter_map(|c| c.get("logprobs").filter(|l| !l.is_null()).cloned())
            .collect();
        let server = provider.extract_metadata_from_response(response);
        let end = self.clock.now();

        let timing = Timing {
            start: ctx.start,
            first_token: None,
            end,
        };
        emit(
            sink,
            LlmEvent::Ttft {
                ms: as_millis_f64(timing.total()),
            },
        );
        let split = split_thinking(&raw);
        if !split.thinking.is_empty() {
            emit(sink, LlmEvent::Thinking(split.thinking.clone()));
        }
        if !split.response.is_empty() {
            emit(sink, LlmEvent::Content(split.response.clone()));
        }

        let metrics = self.final_metrics(server, &timing, &raw, ctx, None);
        debug!(choices = choices.len(), "non-stream response processed");
        Ok(self.finish(sink, split.thinking, split.response, metrics, logprobs, ReplyStatus::Complete))
    }

    fn process_stream(
        &self,
        provider: &dyn LlmProvider,
        mut chunks: ChunkStream,
        ctx: &RequestContext,
        sink: &mut dyn EventSink,
        cancel: &dyn CancelSignal,
    ) -> Result<Reply, StreamFailure> {
        let mut st = StreamState::new();
        let mut cancelled = false;

        loop {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            if let Some(limit) = self.settings.query_timeout {
                if self.clock.now().saturating_duration_since(ctx.start) > limit {
                    let err = Error::timeout(format!(
                        "query exceeded {:.1}s",
                        limit.as_secs_f64()
                    ));
                    return Err(self.stream_failure(err, ctx, &mut st, sink));
                }
            }
            let chunk = match chunks.next() {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => return Err(self.stream_failure(e, ctx, &mut st, sink)),
            };
            st.chunks += 1;

            if st.first_token.is_none() {
                let now = self.clock.now();
                st.first_token = Some(now);
                emit(
                    sink,
                    LlmEvent::Ttft {
                        ms: as_millis_f64(now.saturating_duration_since(ctx.start)),
                    },
                );
            }

            let delta = provider.extract_delta_from_chunk(&chunk);
            if let Some(lp) = delta.logprobs {
                st.logprobs.push(lp);
            }
            if !delta.content.is_empty() {
                st.raw.push_str(&delta.content);
                let segments = st.parser.push(&delta.content);
                st.apply(segments, sink);
                self.maybe_emit_generation_metrics(&mut st, sink);
            }
            if let Some(reason) = delta.finish_reason {
                st.finish_reason = Some(reason);
            }
            if let Some(meta) = provider.extract_metadata_from_chunk(&chunk) {
                st.server.merge(meta);
            }
        }
        // 接続を閉じる
        drop(chunks);

        let tail = st.parser.finish();
        st.apply(tail, sink);
        let end = self.clock.now();

        if cancelled {
            warn!(chunks = st.chunks, "stream cancelled");
        }
        let timing = Timing {
            start: ctx.start,
            first_token: st.first_token,
            end,
        };
        let finish_reason = if cancelled {
            Some(CANCELLED_FINISH_REASON.to_string())
        } else {
            st.finish_reason.take()
        };
        let server = std::mem::take(&mut st.server);
        let metrics = self.final_metrics(server, &timing, &st.raw, ctx, finish_reason);
        let split = finish_split(&st.thinking, &st.content);
        info!(
            model = %ctx.model,
            chunks = st.chunks,
            latency_ms = metrics.total_latency_ms.unwrap_or_default(),
            "stream completed"
        );
        let status = if cancelled {
            ReplyStatus::Cancelled
        } else {
            ReplyStatus::Complete
        };
        let logprobs = std::mem::take(&mut st.logprobs);
        Ok(self.finish(sink, split.thinking, split.response, metrics, logprobs, status))
    }

    /// 一定間隔ごとに見積もりトークン数と速度を流す
    fn maybe_emit_generation_metrics(&self, st: &mut StreamState, sink: &mut dyn EventSink) {
        let now = self.clock.now();
        if let Some(last) = st.last_metrics_at {
            if now.saturating_duration_since(last) < self.settings.metrics_interval {
                return;
            }
        }
        let tokens = self.counter.count(&st.raw).max(st.last_tokens);
        let elapsed = st
            .first_token
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default()
            .as_secs_f64();
        let tokens_per_second = if elapsed > 0.0 {
            tokens as f64 / elapsed
        } else {
            0.0
        };
        st.last_metrics_at = Some(now);
        st.last_tokens = tokens;
        emit(
            sink,
            LlmEvent::GenerationMetrics {
                tokens,
                tokens_per_second,
            },
        );
    }

    /// サーバー値を正として、欠けている分をクライアント計測で補う
    fn final_metrics(
        &self,
        server: Metrics,
        timing: &Timing,
        raw: &str,
        ctx: &RequestContext,
        finish_reason: Option<String>,
    ) -> Metrics {
        let completion = self.counter.count(raw);
        let prompt = self.counter.count(&ctx.prompt_text);
        let mut m = finalize_metrics(server, timing, completion, prompt);
        if m.model.is_none() {
            m.model = Some(ctx.model.clone());
        }
        if finish_reason.as_deref() == Some(CANCELLED_FINISH_REASON) {
            m.finish_reason = finish_reason;
        } else if m.finish_reason.is_none() {
            m.finish_reason = finish_reason;
        }
        m
    }

    fn finish(
        &self,
        sink: &mut dyn EventSink,
        thinking: String,
        response: String,
        metrics: Metrics,
        logprobs: Vec<Value>,
        status: ReplyStatus,
    ) -> Reply {
        emit(sink, LlmEvent::FinalMetrics(metrics.clone()));
        let reply = Reply {
            thinking_response: thinking,
            llm_response: response,
            performance_metrics: metrics,
            logprobs,
            status,
            partial_response: None,
        };
        emit(sink, LlmEvent::Finished(reply.clone()));
        reply
    }

    /// ストリーム途中の失敗。バッファ済みの断片は流してから失敗にする
    fn stream_failure(
        &self,
        error: Error,
        ctx: &RequestContext,
        st: &mut StreamState,
        sink: &mut dyn EventSink,
    ) -> StreamFailure {
        let tail = st.parser.finish();
        st.apply(tail, sink);
        let server = std::mem::take(&mut st.server);
        let first_token = st.first_token;
        let raw = std::mem::take(&mut st.raw);
        self.failure(error, ctx, server, first_token, &raw)
    }

    fn failure(
        &self,
        error: Error,
        ctx: &RequestContext,
        server: Metrics,
        first_token: Option<Instant>,
        raw: &str,
    ) -> StreamFailure {
        let timing = Timing {
            start: ctx.start,
            first_token,
            end: self.clock.now(),
        };
        let mut partial_metrics = self.final_metrics(server, &timing, raw, ctx, None);
        partial_metrics.error = Some(error.to_string());
        StreamFailure {
            error: error.with_partial(raw),
            partial_metrics,
            partial_response: if raw.is_empty() { None } else { Some(raw.to_string()) },
        }
    }
}
