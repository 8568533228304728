//! オーケストレーターの最終出力

use crate::error::{Error, ErrorKind};
use crate::metrics::Metrics;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 応答の終わり方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "kind")]
pub enum ReplyStatus {
    Complete,
    /// 協調キャンセルで途中終了（エラーではない）
    Cancelled,
    Failed(ErrorKind),
}

/// 1 リクエスト分の応答
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// `<think>` ブロック内側の連結（trim 済み）
    pub thinking_response: String,
    /// マーカーとブロックを除いた本文（trim 済み）。エラー時は "ERROR: …"
    pub llm_response: String,
    pub performance_metrics: Metrics,
    /// チャンクごとの logprobs（返されたものだけ）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logprobs: Vec<Value>,
    pub status: ReplyStatus,
    /// 失敗までに受信していた本文（エラー応答のときだけ）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_response: Option<String>,
}

impl Reply {
    /// エラー応答を作る。メトリクスは model / total_latency_ms / error のみ
    pub fn from_error(error: &Error, model: &str, total_latency_ms: f64) -> Self {
        let message = error.to_string();
        Self {
            thinking_response: String::new(),
            llm_response: format!("ERROR: {}", message),
            performance_metrics: Metrics {
                model: Some(model.to_string()),
                total_latency_ms: Some(total_latency_ms),
                error: Some(message),
                ..Default::default()
            },
            logprobs: Vec::new(),
            status: ReplyStatus::Failed(error.kind()),
            partial_response: match error {
                Error::Response { partial, .. } => partial.clone(),
                _ => None,
            },
        }
    }

    /// 呼び出し側に見せる最終文字列
    pub fn final_response(&self) -> &str {
        &self.llm_response
    }

    pub fn is_error(&self) -> bool {
        matches!(self.status, ReplyStatus::Failed(_))
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == ReplyStatus::Cancelled
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self.status {
            ReplyStatus::Failed(kind) => Some(kind),
            _ => None,
        }
    }
}
