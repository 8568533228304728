//! プロバイダ（ドライバー）のトレイト定義
//!
//! 各ベンダーの違い（ペイロードの形、ストリームの枠組み、メタデータの位置）は
//! ここで吸収し、オーケストレーターはこのトレイト越しにしか触らない。

pub mod http;
pub mod ollama;
pub mod openai_compat;

use crate::config::OptionBag;
use crate::error::Error;
use crate::message::Message;
use crate::metrics::Metrics;
use serde_json::Value;

pub use ollama::OllamaProvider;
pub use openai_compat::OpenAiCompatProvider;

/// デコード済みチャンクの遅延イテレーター（ネットワーク読み取りでブロックする）
pub type ChunkStream = Box<dyn Iterator<Item = Result<Value, Error>> + Send>;

/// `send_request` の結果
pub enum ChatResponse {
    /// 非ストリーム: デコード済み JSON 1 つ
    Full(Value),
    /// ストリーム: チャンク列
    Stream(ChunkStream),
}

impl std::fmt::Debug for ChatResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full(v) => f.debug_tuple("Full").field(v).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// チャンク 1 つから取り出した増分
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delta {
    pub content: String,
    pub logprobs: Option<Value>,
    pub finish_reason: Option<String>,
}

/// LLM プロバイダのトレイト
///
/// 1 つのインスタンスは 1 つの HTTP セッションを持つ。独立したリクエストなら
/// 複数スレッドから使ってよいが、並列ストリームが必要なら別インスタンスを作る。
pub trait LlmProvider: Send + Sync {
    /// プロバイダ名（ログ用）
    fn name(&self) -> &str;

    /// リクエスト先 URL
    fn endpoint(&self) -> &str;

    /// メッセージとオプションからベンダー形式のボディを作る
    ///
    /// null のオプションは落とす。`stream` は引数の値を常に入れる。
    /// `timeout` はトランスポート用にボディへ残し、`send_request` が取り出す。
    fn prepare_payload(
        &self,
        messages: &[Message],
        model: &str,
        stream: bool,
        options: &OptionBag,
    ) -> Result<Value, Error>;

    /// HTTP を実行する。ボディの `stream` が true ならチャンク列を返す
    fn send_request(&self, payload: Value, api_key: Option<&str>) -> Result<ChatResponse, Error>;

    /// 非ストリーム応答の choice 一覧
    fn extract_choices<'a>(&self, response: &'a Value) -> Vec<&'a Value>;

    /// choice 1 つの本文（推論フィールドは `<think>` で包んで先頭に付ける）
    fn extract_content_from_choice(&self, choice: &Value) -> String;

    fn extract_delta_from_chunk(&self, chunk: &Value) -> Delta;

    /// 非ストリーム応答全体のメタデータ
    fn extract_metadata_from_response(&self, response: &Value) -> Metrics {
        Metrics::from_wire(response)
    }

    /// 終端チャンクのときだけメタデータを返す
    fn extract_metadata_from_chunk(&self, chunk: &Value) -> Option<Metrics>;
}

/// 推論テキストを `<think>` で包んで本文の前に置く
pub(crate) fn fold_thinking(thinking: Option<&str>, content: &str) -> String {
    match thinking.filter(|t| !t.is_empty()) {
        Some(t) => format!("<think>{}</think>{}", t, content),
        None => content.to_string(),
    }
}

/// null 値のキーを除いたコピー
pub(crate) fn strip_unset(options: &OptionBag) -> OptionBag {
    options
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
