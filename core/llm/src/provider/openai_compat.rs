//! OpenAI Chat Completions 互換 (/chat/completions) プロバイダ
//!
//! LM Studio / Jan / 任意の互換エンドポイントで共用する。生成オプションはすべて
//! ボディのトップレベルに展開する。

use super::http::{read_json, HttpSession, SseChunks};
use super::{fold_thinking, strip_unset, ChatResponse, Delta, LlmProvider};
use crate::config::OptionBag;
use crate::error::Error;
use crate::message::Message;
use crate::metrics::{has_timing_fields, Metrics};
use serde_json::{json, Value};
use std::io::BufReader;
use tracing::debug;

/// `provider` ルーティングを受け付けるマルチプロバイダ・ゲートウェイ
const ROUTER_HOSTS: &[&str] = &["openrouter.ai"];

/// ボディ側で決めるので、オプションからは受け付けないキー
const RESERVED_KEYS: &[&str] = &["model", "messages", "stream"];

/// OpenAI Chat Completions 互換プロバイダ
#[derive(Debug)]
pub struct OpenAiCompatProvider {
    base_url: String,
    endpoint: String,
    is_router: bool,
    session: HttpSession,
}

impl OpenAiCompatProvider {
    /// `base_url` は `/v1` まで含めたもの（末尾の `/` は無視）
    pub fn new(base_url: &str) -> Result<Self, Error> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let url = reqwest::Url::parse(&base_url)
            .map_err(|e| Error::config(format!("malformed api_base '{}': {}", base_url, e)))?;
        let is_router = url
            .host_str()
            .map(|h| ROUTER_HOSTS.iter().any(|r| h == *r || h.ends_with(&format!(".{}", r))))
            .unwrap_or(false);
        Ok(Self {
            endpoint: format!("{}/chat/completions", base_url),
            base_url,
            is_router,
            session: HttpSession::new()?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn is_router(&self) -> bool {
        self.is_router
    }
}

/// `content` は文字列か、`{type, text}` の配列
fn content_text(v: Option<&Value>) -> String {
    match v {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect(),
        _ => String::new(),
    }
}

/// DeepSeek 系は `reasoning_content`、OpenRouter 系は `reasoning`
fn reasoning_text(v: &Value) -> Option<&str> {
    v.get("reasoning_content")
        .and_then(Value::as_str)
        .or_else(|| v.get("reasoning").and_then(Value::as_str))
}

fn finish_reason_of(choice: Option<&Value>) -> Option<String> {
    choice
        .and_then(|c| c.get("finish_reason"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai_compatible"
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn prepare_payload(
        &self,
        messages: &[Message],
        model: &str,
        stream: bool,
        options: &OptionBag,
    ) -> Result<Value, Error> {
        let mut payload = json!({
            "model": model,
            "messages": messages,
            "stream": stream,
        });
        let Some(body) = payload.as_object_mut() else {
            return Err(Error::response("payload is not an object"));
        };
        for (key, value) in strip_unset(options) {
            if RESERVED_KEYS.contains(&key.as_str()) {
                continue;
            }
            // -1 は「上限なし」。互換サーバーは負値を拒否するので送らない
            if key == "max_tokens" && value.as_i64().map(|n| n < 0).unwrap_or(false) {
                continue;
            }
            body.insert(key, value);
        }
        if self.is_router && !body.contains_key("provider") {
            body.insert("provider".to_string(), json!("auto"));
        }
        debug!(
            keys = ?body.keys().collect::<Vec<_>>(),
            "prepared openai_compatible payload"
        );
        Ok(payload)
    }

    fn send_request(&self, payload: Value, api_key: Option<&str>) -> Result<ChatResponse, Error> {
        let stream = payload.get("stream").and_then(Value::as_bool).unwrap_or(false);
        let response = self.session.post_json(&self.endpoint, payload, api_key)?;
        if stream {
            Ok(ChatResponse::Stream(Box::new(SseChunks::new(BufReader::new(
                response,
            )))))
        } else {
            Ok(ChatResponse::Full(read_json(response)?))
        }
    }

    fn extract_choices<'a>(&self, response: &'a Value) -> Vec<&'a Value> {
        response
            .get("choices")
            .and_then(Value::as_array)
            .map(|a| a.iter().collect())
            .unwrap_or_default()
    }

    fn extract_content_from_choice(&self, choice: &Value) -> String {
        let Some(message) = choice.get("message") else {
            // 古い completions 形式
            return content_text(choice.get("text"));
        };
        fold_thinking(reasoning_text(message), &content_text(message.get("content")))
    }

    fn extract_delta_from_chunk(&self, chunk: &Value) -> Delta {
        let choice = chunk.get("choices").and_then(|c| c.get(0));
        let delta = choice.and_then(|c| c.get("delta"));
        let content = match delta {
            Some(d) => fold_thinking(reasoning_text(d), &content_text(d.get("content"))),
            None => String::new(),
        };
        Delta {
            content,
            logprobs: choice
                .and_then(|c| c.get("logprobs"))
                .filter(|l| !l.is_null())
                .cloned(),
            finish_reason: finish_reason_of(choice),
        }
    }

    fn extract_metadata_from_response(&self, response: &Value) -> Metrics {
        let mut m = Metrics::from_wire(response);
        m.finish_reason = finish_reason_of(response.get("choices").and_then(|c| c.get(0)));
        m
    }

    fn extract_metadata_from_chunk(&self, chunk: &Value) -> Option<Metrics> {
        let finish_reason = finish_reason_of(chunk.get("choices").and_then(|c| c.get(0)));
        if finish_reason.is_none() && !has_timing_fields(chunk) {
            return None;
        }
        let mut m = Metrics::from_wire(chunk);
        m.finish_reason = finish_reason;
        Some(m)
    }
}
