//! エラーハンドリング
//!
//! ドライバーとオーケストレーターが返すエラーを 1 つの enum に集約する。
//! ファサード（`LlmClient`）自身はエラーを生成せず、ドライバーのエラーをそのまま返す。

use serde::{Deserialize, Serialize};

/// エラー種別（イベントやエラー応答に載せるタグ）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Connection,
    Timeout,
    Request,
    Response,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Connection => "connection",
            Self::Timeout => "timeout",
            Self::Request => "request",
            Self::Response => "response",
            Self::Io => "io",
        }
    }

    /// 終了コード（sysexits 準拠）
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration => 64,
            Self::Connection => 69,
            Self::Timeout => 75,
            Self::Request => 69,
            Self::Response | Self::Io => 74,
        }
    }
}

/// LLM コアのエラー型
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// client_type 不正、api_base 欠落、URL 不正など
    #[error("configuration error: {0}")]
    Configuration(String),
    /// TCP/TLS/DNS 失敗、接続拒否
    #[error("connection error: {0}")]
    Connection(String),
    /// HTTP タイムアウト、または query_timeout 超過
    #[error("timeout: {0}")]
    Timeout(String),
    /// HTTP 4xx/5xx（ベンダーのエラーメッセージを取り出したもの）
    #[error("request failed (HTTP {status}): {message}")]
    Request { status: u16, message: String },
    /// 不正な JSON、途中で切れたストリーム、想定外の形
    ///
    /// `partial` はストリーム途中で失敗したときに受信済みだった本文。
    #[error("response error: {message}")]
    Response {
        message: String,
        partial: Option<String>,
    },
    /// 設定ファイル読み込みなどの I/O
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn request(status: u16, msg: impl Into<String>) -> Self {
        Self::Request {
            status,
            message: msg.into(),
        }
    }

    pub fn response(msg: impl Into<String>) -> Self {
        Self::Response {
            message: msg.into(),
            partial: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Connection(_) => ErrorKind::Connection,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Request { .. } => ErrorKind::Request,
            Self::Response { .. } => ErrorKind::Response,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }

    /// Response エラーに受信済み本文を付ける（他の種別はそのまま返す）
    pub fn with_partial(self, text: impl Into<String>) -> Self {
        match self {
            Self::Response { message, .. } => {
                let text = text.into();
                Self::Response {
                    message,
                    partial: if text.is_empty() { None } else { Some(text) },
                }
            }
            other => other,
        }
    }

    /// reqwest のトランスポートエラーを分類する
    pub fn from_transport(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::timeout(e.to_string())
        } else if e.is_builder() {
            Self::config(format!("invalid request: {}", e))
        } else if e.is_connect() {
            Self::connection(e.to_string())
        } else if e.is_decode() || e.is_body() {
            Self::response(e.to_string())
        } else {
            Self::connection(e.to_string())
        }
    }

    /// ストリーム読み取り中の I/O エラーを分類する
    ///
    /// blocking reqwest は本文読み取り中のタイムアウトを `reqwest::Error` を包んだ
    /// `io::ErrorKind::Other` として返すので、中身も確認する。
    pub fn from_stream_io(e: std::io::Error) -> Self {
        let transport_timeout = e
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
            .map(reqwest::Error::is_timeout)
            .unwrap_or(false);
        if transport_timeout || e.kind() == std::io::ErrorKind::TimedOut {
            Self::timeout(format!("stream read timed out: {}", e))
        } else {
            Self::response(format!("stream truncated: {}", e))
        }
    }
}
