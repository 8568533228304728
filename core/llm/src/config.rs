//! モデル設定（ModelConfig）と models.json の読み込み
//!
//! ModelConfig は 1 モデル分の接続先とオプション群。オプション群は
//! `serde_json::Map` のまま保持し、ベンダー固有のキーもそのまま流す。

use crate::error::Error;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::env;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// オプション群（generation / inference / options / 呼び出しごとの上書き）
pub type OptionBag = Map<String, Value>;

/// HTTP リクエストのデフォルトタイムアウト（秒）
pub const DEFAULT_TIMEOUT_SECS: f64 = 180.0;

/// client_type タグ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    Ollama,
    OpenaiCompatible,
    Lmstudio,
    Jan,
}

impl ClientType {
    /// 文字列から解析する（大文字小文字は区別しない）
    pub fn parse(s: &str) -> Result<Self, Error> {
        match s.trim().to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai_compatible" | "openai_compat" => Ok(Self::OpenaiCompatible),
            "lmstudio" => Ok(Self::Lmstudio),
            "jan" => Ok(Self::Jan),
            "" => Err(Error::config("client_type is empty")),
            other => Err(Error::config(format!(
                "Unknown client_type: '{}'. Available: ollama, openai_compatible, lmstudio, jan",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::OpenaiCompatible => "openai_compatible",
            Self::Lmstudio => "lmstudio",
            Self::Jan => "jan",
        }
    }

    /// 既知のデフォルト base URL（openai_compatible は必須指定なので None）
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            Self::Ollama => Some("http://localhost:11434"),
            Self::Lmstudio => Some("http://127.0.0.1:1234/v1"),
            Self::Jan => Some("http://127.0.0.1:1337/v1"),
            Self::OpenaiCompatible => None,
        }
    }
}

/// 1 モデル分の設定
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    /// モデル名（ペイロードの `model` にも使う）
    pub name: String,
    /// ollama | openai_compatible | lmstudio | jan
    pub client_type: String,
    #[serde(default, alias = "base_url", skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// API キーを読む環境変数名（api_key が無いときに使う）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// temperature, max_tokens, top_p, repetition_penalty, ...
    #[serde(default)]
    pub generation: OptionBag,
    /// stream, timeout, provider
    #[serde(default)]
    pub inference: OptionBag,
    /// query_timeout など
    #[serde(default)]
    pub options: OptionBag,
}

impl fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelConfig")
            .field("name", &self.name)
            .field("client_type", &self.client_type)
            .field("api_base", &self.api_base)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("api_key_env", &self.api_key_env)
            .field("generation", &self.generation)
            .field("inference", &self.inference)
            .field("options", &self.options)
            .finish()
    }
}

impl ModelConfig {
    pub fn new(name: impl Into<String>, client_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client_type: client_type.into(),
            ..Default::default()
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = Some(api_base.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_generation(mut self, key: &str, value: Value) -> Self {
        self.generation.insert(key.to_string(), value);
        self
    }

    pub fn with_inference(mut self, key: &str, value: Value) -> Self {
        self.inference.insert(key.to_string(), value);
        self
    }

    pub fn with_option(mut self, key: &str, value: Value) -> Self {
        self.options.insert(key.to_string(), value);
        self
    }

    pub fn client_type(&self) -> Result<ClientType, Error> {
        ClientType::parse(&self.client_type)
    }

    /// api_key を優先し、無ければ api_key_env の環境変数を読む
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Some(key.clone());
        }
        self.api_key_env
            .as_ref()
            .and_then(|name| env::var(name).ok())
            .filter(|k| !k.is_empty())
    }

    /// inference.stream（未指定なら false）
    pub fn stream_enabled(&self) -> bool {
        self.inference
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// options.query_timeout（秒）。問い合わせ全体の締め切り
    pub fn query_timeout(&self) -> Option<Duration> {
        self.options
            .get("query_timeout")
            .and_then(Value::as_f64)
            .filter(|t| *t > 0.0)
            .map(Duration::from_secs_f64)
    }

    /// 設定値の検証
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.trim().is_empty() {
            return Err(Error::config("model name is empty"));
        }
        let client_type = self.client_type()?;
        match (&self.api_base, client_type) {
            (None, ClientType::OpenaiCompatible) => {
                return Err(Error::config(format!(
                    "api_base is required for openai_compatible model '{}'",
                    self.name
                )));
            }
            (Some(base), _) => validate_base_url(base)?,
            _ => {}
        }
        if let Some(t) = self.generation.get("temperature") {
            match t.as_f64() {
                Some(v) if (0.0..=2.0).contains(&v) => {}
                Some(v) => {
                    return Err(Error::config(format!(
                        "generation.temperature must be between 0.0 and 2.0 (got {})",
                        v
                    )))
                }
                None if t.is_null() => {}
                None => return Err(Error::config("generation.temperature must be a number")),
            }
        }
        if let Some(t) = self.inference.get("timeout") {
            if !t.is_null() && !t.as_f64().map(|v| v > 0.0).unwrap_or(false) {
                return Err(Error::config("inference.timeout must be a positive number of seconds"));
            }
        }
        Ok(())
    }
}

/// base URL が http(s) の正しい URL かを検証する
pub fn validate_base_url(base: &str) -> Result<(), Error> {
    let url = reqwest::Url::parse(base)
        .map_err(|e| Error::config(format!("malformed api_base '{}': {}", base, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(Error::config(format!(
            "unsupported scheme '{}' in api_base '{}'",
            other, base
        ))),
    }
}

/// models.json のルート
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsFile {
    /// 未指定時に使うモデル名
    #[serde(default, alias = "default_model", skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

impl ModelsFile {
    /// JSON 文字列からパース（ファイル読みは load で行う）
    pub fn parse(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(|e| Error::config(format!("invalid models file: {}", e)))
    }

    /// ファイルから読み込む。エラーメッセージにはパスを含める
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("{}: {}", path.display(), e),
            ))
        })?;
        Self::parse(&contents).map_err(|e| match e {
            Error::Configuration(msg) => Error::config(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    pub fn names(&self) -> Vec<&str> {
        self.models.iter().map(|m| m.name.as_str()).collect()
    }

    /// 名前で選ぶ。None のときは default、それも無く 1 件だけならそれを返す
    pub fn select(&self, requested: Option<&str>) -> Result<&ModelConfig, Error> {
        let wanted = requested.or(self.default.as_deref());
        match wanted {
            Some(name) => self.models.iter().find(|m| m.name == name).ok_or_else(|| {
                Error::config(format!(
                    "Unknown model: '{}'. Available: {}",
                    name,
                    self.names().join(", ")
                ))
            }),
            None if self.models.len() == 1 => Ok(&self.models[0]),
            None if self.models.is_empty() => Err(Error::config("no models configured")),
            None => Err(Error::config(format!(
                "no default model set; choose one of: {}",
                self.names().join(", ")
            ))),
        }
    }
}
