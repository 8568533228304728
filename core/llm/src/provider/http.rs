//! ドライバー共通の HTTP セッションとストリームの枠組み
//!
//! OpenAI 系は SSE（`data: {json}` 行と `data: [DONE]`）、Ollama は 1 行 1 JSON。
//! どちらも `BufRead` 上のイテレーターとして実装し、テストでは `Cursor` を流す。

use crate::config::DEFAULT_TIMEOUT_SECS;
use crate::error::Error;
use serde_json::Value;
use std::io::BufRead;
use std::time::Duration;
use tracing::debug;

/// 永続 HTTP セッション（keep-alive・接続再利用）
#[derive(Debug, Clone)]
pub struct HttpSession {
    client: reqwest::blocking::Client,
}

impl HttpSession {
    pub fn new() -> Result<Self, Error> {
        let client = reqwest::blocking::Client::builder()
            .build()
            .map_err(Error::from_transport)?;
        Ok(Self { client })
    }

    /// JSON を POST する。ボディの `timeout`（秒）は取り出してリクエストのタイムアウトにする
    ///
    /// 2xx 以外はボディからベンダーのエラーメッセージを取り出して Request エラーにする。
    pub fn post_json(
        &self,
        url: &str,
        mut payload: Value,
        api_key: Option<&str>,
    ) -> Result<reqwest::blocking::Response, Error> {
        let timeout = take_timeout(&mut payload);
        debug!(url, timeout_secs = timeout.as_secs_f64(), "POST");

        let mut builder = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .timeout(timeout)
            .json(&payload);
        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().map_err(Error::from_transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(Error::request(
                status.as_u16(),
                decode_error_message(&body, status.as_u16()),
            ));
        }
        Ok(response)
    }
}

/// ペイロードから `timeout` を取り除き、Duration にする（未指定・不正値は 180 秒）
pub fn take_timeout(payload: &mut Value) -> Duration {
    let secs = payload
        .as_object_mut()
        .and_then(|obj| obj.remove("timeout"))
        .and_then(|v| v.as_f64())
        .filter(|t| t.is_finite() && *t > 0.0)
        .unwrap_or(DEFAULT_TIMEOUT_SECS);
    Duration::from_secs_f64(secs)
}

/// エラーボディからメッセージを取り出す
///
/// `{"error": {"message": ...}}`（OpenAI 系）、`{"error": "..."}`（Ollama）、
/// `{"message": ...}` の順に試し、どれも無ければボディそのもの。
pub fn decode_error_message(body: &str, status: u16) -> String {
    let trimmed = body.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        if let Some(msg) = v.get("error").and_then(error_text) {
            return msg;
        }
        if let Some(msg) = v.get("message").and_then(Value::as_str) {
            return msg.to_string();
        }
    }
    if trimmed.is_empty() {
        format!("HTTP {}", status)
    } else {
        trimmed.to_string()
    }
}

fn error_text(err: &Value) -> Option<String> {
    match err {
        Value::String(s) => Some(s.clone()),
        Value::Object(_) => err
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(err.to_string())),
        _ => None,
    }
}

/// 非ストリーム応答のボディを JSON として読む
pub fn read_json(response: reqwest::blocking::Response) -> Result<Value, Error> {
    let text = response.text().map_err(Error::from_transport)?;
    serde_json::from_str(&text)
        .map_err(|e| Error::response(format!("Failed to parse response JSON: {}", e)))
}

/// ストリーム中に届いた `{"error": ...}` をエラーにする
fn chunk_error(v: &Value) -> Option<Error> {
    let err = v.get("error").filter(|e| !e.is_null())?;
    let msg = error_text(err).unwrap_or_else(|| err.to_string());
    Some(Error::response(format!("error in stream: {}", msg)))
}

/// 1 行読む。EOF は Ok(None)
fn next_line<R: BufRead>(reader: &mut R, buf: &mut String) -> Result<Option<()>, Error> {
    buf.clear();
    match reader.read_line(buf) {
        Ok(0) => Ok(None),
        Ok(_) => Ok(Some(())),
        Err(e) => Err(Error::from_stream_io(e)),
    }
}

/// SSE のチャンク列
///
/// `[DONE]`、または最初の choice に finish_reason が入ったチャンクで終わる。
/// 終端前に EOF になったら途中切断として Response エラーを 1 回返す。
pub struct SseChunks<R> {
    reader: R,
    line: String,
    finished: bool,
    yielded: usize,
}

impl<R: BufRead> SseChunks<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            finished: false,
            yielded: 0,
        }
    }

    fn fail(&mut self, e: Error) -> Option<Result<Value, Error>> {
        self.finished = true;
        Some(Err(e))
    }
}

impl<R: BufRead> Iterator for SseChunks<R> {
    type Item = Result<Value, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            match next_line(&mut self.reader, &mut self.line) {
                Ok(Some(())) => {}
                Ok(None) => {
                    return self.fail(Error::response(format!(
                        "stream truncated: connection closed after {} chunk(s) without [DONE]",
                        self.yielded
                    )));
                }
                Err(e) => return self.fail(e),
            }
            let line = self.line.trim_end_matches(['\r', '\n']);
            // 空行はイベント区切り、':' はコメント、event:/id: などは使わない
            let data = match line.strip_prefix("data:") {
                Some(d) => d.trim(),
                None => continue,
            };
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                debug!(chunks = self.yielded, "SSE stream finished");
                self.finished = true;
                return None;
            }
            let v: Value = match serde_json::from_str(data) {
                Ok(v) => v,
                Err(e) => {
                    return self.fail(Error::response(format!(
                        "Failed to parse stream chunk: {}",
                        e
                    )))
                }
            };
            if let Some(e) = chunk_error(&v) {
                return self.fail(e);
            }
            let terminal = v
                .get("choices")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("finish_reason"))
                .map(|f| !f.is_null())
                .unwrap_or(false);
            if terminal {
                debug!(chunks = self.yielded + 1, "SSE stream finished by finish_reason");
                self.finished = true;
            }
            self.yielded += 1;
            return Some(Ok(v));
        }
    }
}

/// 1 行 1 JSON のチャンク列（Ollama）
///
/// `done: true` のチャンクを返したあとで終わる。
pub struct NdjsonChunks<R> {
    reader: R,
    line: String,
    finished: bool,
    yielded: usize,
}

impl<R: BufRead> NdjsonChunks<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            finished: false,
            yielded: 0,
        }
    }

    fn fail(&mut self, e: Error) -> Option<Result<Value, Error>> {
        self.finished = true;
        Some(Err(e))
    }
}

impl<R: BufRead> Iterator for NdjsonChunks<R> {
    type Item = Result<Value, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            match next_line(&mut self.reader, &mut self.line) {
                Ok(Some(())) => {}
                Ok(None) => {
                    return self.fail(Error::response(format!(
                        "stream truncated: connection closed after {} chunk(s) without done",
                        self.yielded
                    )));
                }
                Err(e) => return self.fail(e),
            }
            let line = self.line.trim();
            if line.is_empty() {
                continue;
            }
            let v: Value = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(e) => {
                    return self.fail(Error::response(format!(
                        "Failed to parse stream chunk: {}",
                        e
                    )))
                }
            };
            if let Some(e) = chunk_error(&v) {
                return self.fail(e);
            }
            if v.get("done").and_then(Value::as_bool).unwrap_or(false) {
                debug!(chunks = self.yielded + 1, "NDJSON stream finished");
                self.finished = true;
            }
            self.yielded += 1;
            return Some(Ok(v));
        }
    }
}
