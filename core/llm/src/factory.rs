//! プロバイダファクトリー
//!
//! `client_type` と既知のデフォルト base URL からドライバーを作る。
//! ベンダーによる分岐はここだけで行う。

use crate::config::{ClientType, ModelConfig, OptionBag};
use crate::error::Error;
use crate::message::Message;
use crate::metrics::Metrics;
use crate::provider::{ChatResponse, Delta, LlmProvider, OllamaProvider, OpenAiCompatProvider};
use serde_json::Value;

/// プロバイダの enum ラッパー
///
/// 設定ファイルから選んだドライバーを静的ディスパッチで扱う。
#[derive(Debug)]
pub enum AnyProvider {
    OpenAiCompat(OpenAiCompatProvider),
    Ollama(OllamaProvider),
}

macro_rules! delegate {
    ($self:ident, $p:ident => $call:expr) => {
        match $self {
            Self::OpenAiCompat($p) => $call,
            Self::Ollama($p) => $call,
        }
    };
}

impl LlmProvider for AnyProvider {
    fn name(&self) -> &str {
        delegate!(self, p => p.name())
    }

    fn endpoint(&self) -> &str {
        delegate!(self, p => p.endpoint())
    }

    fn prepare_payload(
        &self,
        messages: &[Message],
        model: &str,
        stream: bool,
        options: &OptionBag,
    ) -> Result<Value, Error> {
        delegate!(self, p => p.prepare_payload(messages, model, stream, options))
    }

    fn send_request(&self, payload: Value, api_key: Option<&str>) -> Result<ChatResponse, Error> {
        delegate!(self, p => p.send_request(payload, api_key))
    }

    fn extract_choices<'a>(&self, response: &'a Value) -> Vec<&'a Value> {
        delegate!(self, p => p.extract_choices(response))
    }

    fn extract_content_from_choice(&self, choice: &Value) -> String {
        delegate!(self, p => p.extract_content_from_choice(choice))
    }

    fn extract_delta_from_chunk(&self, chunk: &Value) -> Delta {
        delegate!(self, p => p.extract_delta_from_chunk(chunk))
    }

    fn extract_metadata_from_response(&self, response: &Value) -> Metrics {
        delegate!(self, p => p.extract_metadata_from_response(response))
    }

    fn extract_metadata_from_chunk(&self, chunk: &Value) -> Option<Metrics> {
        delegate!(self, p => p.extract_metadata_from_chunk(chunk))
    }
}

/// 実際に使う base URL（設定値、無ければ client_type の既定値）
pub fn resolve_base_url(config: &ModelConfig) -> Result<String, Error> {
    let client_type = config.client_type()?;
    match config.api_base.as_deref().map(str::trim).filter(|b| !b.is_empty()) {
        Some(base) => Ok(base.to_string()),
        None => client_type.default_base_url().map(str::to_string).ok_or_else(|| {
            Error::config(format!(
                "api_base is required for {} model '{}'",
                client_type.as_str(),
                config.name
            ))
        }),
    }
}

/// プロバイダを作成する
///
/// - ollama → Ollama ドライバー（既定 http://localhost:11434）
/// - lmstudio / jan / openai_compatible → OpenAI 互換ドライバー
pub fn create_provider(config: &ModelConfig) -> Result<AnyProvider, Error> {
    config.validate()?;
    let base = resolve_base_url(config)?;
    let provider = match config.client_type()? {
        ClientType::Ollama => AnyProvider::Ollama(OllamaProvider::new(&base)?),
        ClientType::OpenaiCompatible | ClientType::Lmstudio | ClientType::Jan => {
            AnyProvider::OpenAiCompat(OpenAiCompatProvider::new(&base)?)
        }
    };
    tracing::debug!(
        model = %config.name,
        provider = provider.name(),
        endpoint = provider.endpoint(),
        "provider created"
    );
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_create_ollama_default_base() {
        let p = create_provider(&ModelConfig::new("llama3", "ollama")).unwrap();
        assert!(matches!(p, AnyProvider::Ollama(_)));
        assert_eq!(p.name(), "ollama");
        assert_eq!(p.endpoint(), "http://localhost:11434/api/chat");
    }

    #[test]
    fn test_create_lmstudio_and_jan_defaults() {
        let p = create_provider(&ModelConfig::new("qwen", "lmstudio")).unwrap();
        assert!(matches!(p, AnyProvider::OpenAiCompat(_)));
        assert_eq!(p.endpoint(), "http://127.0.0.1:1234/v1/chat/completions");

        let p = create_provider(&ModelConfig::new("qwen", "jan")).unwrap();
        assert_eq!(p.endpoint(), "http://127.0.0.1:1337/v1/chat/completions");
    }

    #[test]
    fn test_explicit_base_overrides_default() {
        let cfg = ModelConfig::new("llama3", "ollama").with_api_base("http://gpu-box:11434");
        let p = create_provider(&cfg).unwrap();
        assert_eq!(p.endpoint(), "http://gpu-box:11434/api/chat");
    }

    #[test]
    fn test_openai_compatible_requires_base() {
        let err = create_provider(&ModelConfig::new("gpt", "openai_compatible")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let cfg = ModelConfig::new("gpt", "openai_compatible").with_api_base("https://api.openai.com/v1");
        let p = create_provider(&cfg).unwrap();
        assert_eq!(p.endpoint(), "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn test_unknown_client_type_is_configuration_error() {
        let err = create_provider(&ModelConfig::new("x", "anthropic")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("anthropic"));
    }

    #[test]
    fn test_malformed_url_is_configuration_error() {
        let cfg = ModelConfig::new("x", "lmstudio").with_api_base("localhost:1234 /v1");
        assert_eq!(create_provider(&cfg).unwrap_err().kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_factory_is_deterministic() {
        let cfg = ModelConfig::new("qwen", "jan");
        let a = create_provider(&cfg).unwrap();
        let b = create_provider(&cfg).unwrap();
        assert_eq!(a.endpoint(), b.endpoint());
        assert_eq!(a.name(), b.name());
    }
}
