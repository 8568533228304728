//! オーケストレーターが外部へ流すイベントと、その受け手（sink）
//!
//! 1 リクエスト内の順序: ttft → content / thinking / generation_metrics（任意回）
//! → final_metrics → finished。失敗時は error で終わる。

use crate::error::ErrorKind;
use crate::metrics::Metrics;
use crate::reply::Reply;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// 正規化済みイベント
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum LlmEvent {
    /// 最初のチャンク受信（リクエスト開始からのミリ秒）
    Ttft { ms: f64 },
    /// 本文の増分
    Content(String),
    /// `<think>` 内の増分
    Thinking(String),
    /// 生成中の見積もりトークン数と速度（間引いて送る）
    GenerationMetrics { tokens: u64, tokens_per_second: f64 },
    FinalMetrics(Metrics),
    Finished(Reply),
    Error {
        kind: ErrorKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partial_metrics: Option<Metrics>,
    },
}

impl LlmEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ttft { .. } => "ttft",
            Self::Content(_) => "content",
            Self::Thinking(_) => "thinking",
            Self::GenerationMetrics { .. } => "generation_metrics",
            Self::FinalMetrics(_) => "final_metrics",
            Self::Finished(_) => "finished",
            Self::Error { .. } => "error",
        }
    }
}

/// イベントの受け手
///
/// 失敗しても生成は止めない（呼び出し側で警告を出して続行する）。
pub trait EventSink: Send {
    fn on_event(&mut self, event: &LlmEvent) -> anyhow::Result<()>;

    /// リクエスト終了時。flush が必要な sink だけ実装する
    fn on_end(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// 何もしない sink
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn on_event(&mut self, _event: &LlmEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// 受け取ったイベントを共有ベクタに溜める sink（テストや GUI スレッドへの受け渡し用）
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    events: Arc<Mutex<Vec<LlmEvent>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// ここまでに届いたイベントのコピー
    pub fn events(&self) -> Vec<LlmEvent> {
        match self.events.lock() {
            Ok(v) => v.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(LlmEvent::kind).collect()
    }
}

impl EventSink for CollectingSink {
    fn on_event(&mut self, event: &LlmEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("collecting sink lock poisoned"))?
            .push(event.clone());
        Ok(())
    }
}

/// 複数 sink へ順に配信する dispatcher
///
/// sink が失敗しても他の sink への配信は続ける（best-effort）。
#[derive(Default)]
pub struct EventHub {
    sinks: Vec<Box<dyn EventSink>>,
}

impl EventHub {
    pub fn new(sinks: Vec<Box<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Box<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for EventHub {
    fn on_event(&mut self, event: &LlmEvent) -> anyhow::Result<()> {
        for (i, sink) in self.sinks.iter_mut().enumerate() {
            if let Err(e) = sink.on_event(event) {
                tracing::warn!(sink = i, kind = event.kind(), "sink on_event failed: {}", e);
            }
        }
        Ok(())
    }

    fn on_end(&mut self) -> anyhow::Result<()> {
        for (i, sink) in self.sinks.iter_mut().enumerate() {
            if let Err(e) = sink.on_end() {
                tracing::warn!(sink = i, "sink on_end failed: {}", e);
            }
        }
        Ok(())
    }
}

/// sink に渡し、失敗は警告だけにする
pub(crate) fn emit(sink: &mut dyn EventSink, event: LlmEvent) {
    if let Err(e) = sink.on_event(&event) {
        tracing::warn!(kind = event.kind(), "event sink failed: {}", e);
    }
}
