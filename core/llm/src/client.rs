//! ベンダー非依存のクライアント（ファサード）
//!
//! 設定の各層をマージしてドライバーに渡すだけ。本文・メトリクス・思考マーカーには
//! 触らない。

use crate::config::{ModelConfig, OptionBag};
use crate::error::Error;
use crate::factory::{create_provider, AnyProvider};
use crate::message::Message;
use crate::provider::{ChatResponse, LlmProvider};
use tracing::debug;

/// LLM クライアント
pub struct LlmClient<P: LlmProvider> {
    provider: P,
    config: ModelConfig,
}

impl LlmClient<AnyProvider> {
    /// 設定からドライバーを作ってクライアントを組み立てる
    pub fn from_config(config: ModelConfig) -> Result<Self, Error> {
        let provider = create_provider(&config)?;
        Ok(Self::new(provider, config))
    }
}

impl<P: LlmProvider> LlmClient<P> {
    pub fn new(provider: P, config: ModelConfig) -> Self {
        Self { provider, config }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// generation → inference → 呼び出しごとの上書き の順にマージする
    ///
    /// `stream` は引数側が正なのでマージ結果からは取り除く。
    pub fn effective_options(&self, overrides: &OptionBag) -> OptionBag {
        let mut merged = OptionBag::new();
        for layer in [&self.config.generation, &self.config.inference, overrides] {
            for (k, v) in layer {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged.remove("stream");
        merged
    }

    /// チャットを 1 回実行し、ドライバーの結果をそのまま返す
    pub fn chat(
        &self,
        messages: &[Message],
        stream: bool,
        overrides: &OptionBag,
    ) -> Result<ChatResponse, Error> {
        let options = self.effective_options(overrides);
        let payload = self
            .provider
            .prepare_payload(messages, &self.config.name, stream, &options)?;
        debug!(
            model = %self.config.name,
            provider = self.provider.name(),
            stream,
            messages = messages.len(),
            "chat"
        );
        let api_key = self.config.resolve_api_key();
        self.provider.send_request(payload, api_key.as_deref())
    }
}
