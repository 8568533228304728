//! リクエスト 1 回分の性能メトリクス
//!
//! サーバー報告値を正とし、欠けているフィールドだけをクライアント計測で埋める。
//! `total_latency_ms` と `time_to_first_token_ms` はクライアント専用で常に付与する。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};

/// サーバー報告の持続時間はナノ秒、クライアント計測はミリ秒
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_eval_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_eval_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_first_token_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_finish_reason: Option<String>,
    /// エラー応答のときだけ入る
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `src` に値があれば `dst` を置き換える
fn overwrite<T>(dst: &mut Option<T>, src: Option<T>) {
    if src.is_some() {
        *dst = src;
    }
}

impl Metrics {
    pub fn is_empty(&self) -> bool {
        *self == Metrics::default()
    }

    /// `other` にある値で上書きする（後から届いた終端チャンクの値を優先）
    pub fn merge(&mut self, other: Metrics) {
        overwrite(&mut self.prompt_eval_count, other.prompt_eval_count);
        overwrite(&mut self.eval_count, other.eval_count);
        overwrite(&mut self.total_tokens, other.total_tokens);
        overwrite(&mut self.prompt_eval_duration, other.prompt_eval_duration);
        overwrite(&mut self.eval_duration, other.eval_duration);
        overwrite(&mut self.total_duration, other.total_duration);
        overwrite(&mut self.load_duration, other.load_duration);
        overwrite(&mut self.total_latency_ms, other.total_latency_ms);
        overwrite(&mut self.time_to_first_token_ms, other.time_to_first_token_ms);
        overwrite(&mut self.model, other.model);
        overwrite(&mut self.created, other.created);
        overwrite(&mut self.id, other.id);
        overwrite(&mut self.system_fingerprint, other.system_fingerprint);
        overwrite(&mut self.provider, other.provider);
        overwrite(&mut self.finish_reason, other.finish_reason);
        overwrite(&mut self.native_finish_reason, other.native_finish_reason);
        overwrite(&mut self.error, other.error);
    }

    /// ベンダーの JSON（レスポンス全体や終端チャンク）から直接フィールドを読む。
    /// OpenAI 形式の `usage` は Ollama 形式のカウントが無いときだけ使う。
    pub fn from_wire(v: &Value) -> Metrics {
        let first_choice = v.get("choices").and_then(|c| c.get(0));
        let mut m = Metrics {
            prompt_eval_count: as_u64(v.get("prompt_eval_count")),
            eval_count: as_u64(v.get("eval_count")),
            prompt_eval_duration: as_u64(v.get("prompt_eval_duration")),
            eval_duration: as_u64(v.get("eval_duration")),
            total_duration: as_u64(v.get("total_duration")),
            load_duration: as_u64(v.get("load_duration")),
            model: as_string(v.get("model")),
            created: v.get("created").and_then(Value::as_i64),
            id: as_string(v.get("id")),
            system_fingerprint: as_string(v.get("system_fingerprint")),
            provider: as_string(v.get("provider")),
            native_finish_reason: as_string(v.get("native_finish_reason"))
                .or_else(|| first_choice.and_then(|c| as_string(c.get("native_finish_reason")))),
            ..Default::default()
        };
        if let Some(usage) = v.get("usage").filter(|u| u.is_object()) {
            if m.prompt_eval_count.is_none() {
                m.prompt_eval_count = as_u64(usage.get("prompt_tokens"));
            }
            if m.eval_count.is_none() {
                m.eval_count = as_u64(usage.get("completion_tokens"));
            }
            if m.total_tokens.is_none() {
                m.total_tokens = as_u64(usage.get("total_tokens"));
            }
        }
        m
    }
}

/// 終端チャンクに載る既知のタイミング・カウントのフィールド
pub const TIMING_FIELDS: &[&str] = &[
    "total_duration",
    "load_duration",
    "prompt_eval_count",
    "prompt_eval_duration",
    "eval_count",
    "eval_duration",
];

/// タイミング・カウント・usage のいずれかを持つか
pub fn has_timing_fields(v: &Value) -> bool {
    TIMING_FIELDS.iter().any(|k| v.get(*k).map(|x| !x.is_null()).unwrap_or(false))
        || v.get("usage").map(Value::is_object).unwrap_or(false)
}

fn as_u64(v: Option<&Value>) -> Option<u64> {
    let v = v?;
    v.as_u64().or_else(|| v.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
}

fn as_string(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// クライアント側の計測時刻
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub start: Instant,
    pub first_token: Option<Instant>,
    pub end: Instant,
}

impl Timing {
    pub fn total(&self) -> Duration {
        self.end.saturating_duration_since(self.start)
    }

    pub fn ttft(&self) -> Option<Duration> {
        self.first_token
            .map(|t| t.saturating_duration_since(self.start))
    }
}

/// 最終メトリクスを組み立てる
///
/// `completion_tokens` / `prompt_tokens` はクライアント見積もり値。
pub fn finalize_metrics(
    server: Metrics,
    timing: &Timing,
    completion_tokens: u64,
    prompt_tokens: u64,
) -> Metrics {
    let mut m = server;
    if m.eval_count.is_none() {
        m.eval_count = Some(completion_tokens);
    }
    if m.prompt_eval_count.is_none() {
        m.prompt_eval_count = Some(prompt_tokens);
    }
    if m.prompt_eval_duration.is_none() {
        let total = timing.total();
        let (prompt_eval, eval) = match timing.first_token {
            Some(ft) => (
                ft.saturating_duration_since(timing.start),
                timing.end.saturating_duration_since(ft),
            ),
            None => (total, Duration::ZERO),
        };
        m.total_duration.get_or_insert(as_nanos(total));
        m.prompt_eval_duration = Some(as_nanos(prompt_eval));
        m.eval_duration.get_or_insert(as_nanos(eval));
        m.load_duration.get_or_insert(0);
    }
    let total_ms = as_millis_f64(timing.total());
    m.total_latency_ms = Some(total_ms);
    m.time_to_first_token_ms = Some(timing.ttft().map(as_millis_f64).unwrap_or(total_ms));
    m
}

fn as_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

pub(crate) fn as_millis_f64(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}
