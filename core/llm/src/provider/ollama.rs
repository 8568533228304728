//! Ollama ネイティブ API (/api/chat) プロバイダ
//!
//! `format` / `keep_alive` / `think` だけをトップレベルに置き、それ以外の
//! 生成オプションは `options` の下に入れる。ストリームは 1 行 1 JSON で、
//! `done: true` のチャンクにタイミングとトークン数が載る。

use super::http::{read_json, HttpSession, NdjsonChunks};
use super::{fold_thinking, strip_unset, ChatResponse, Delta, LlmProvider};
use crate::config::OptionBag;
use crate::error::Error;
use crate::message::Message;
use crate::metrics::{has_timing_fields, Metrics};
use chrono::DateTime;
use serde_json::{json, Map, Value};
use std::io::BufReader;
use tracing::debug;

/// ボディのトップレベルに置くキー（timeout は送信前に取り除かれる）
const TOP_LEVEL_KEYS: &[&str] = &["format", "keep_alive", "think", "timeout"];

/// Ollama には送らないキー
const DROPPED_KEYS: &[&str] = &["model", "messages", "stream", "provider"];

/// 共通オプション名 → Ollama のオプション名
const RENAMES: &[(&str, &str)] = &[
    ("max_tokens", "num_predict"),
    ("repetition_penalty", "repeat_penalty"),
];

/// Ollama ネイティブプロバイダ
#[derive(Debug)]
pub struct OllamaProvider {
    base_url: String,
    endpoint: String,
    session: HttpSession,
}

impl OllamaProvider {
    /// `base_url` はホストまで（例: http://localhost:11434）
    pub fn new(base_url: &str) -> Result<Self, Error> {
        let base_url = base_url.trim_end_matches('/').to_string();
        reqwest::Url::parse(&base_url)
            .map_err(|e| Error::config(format!("malformed api_base '{}': {}", base_url, e)))?;
        Ok(Self {
            endpoint: format!("{}/api/chat", base_url),
            base_url,
            session: HttpSession::new()?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn option_name(key: &str) -> &str {
    RENAMES
        .iter()
        .find(|(from, _)| *from == key)
        .map(|(_, to)| *to)
        .unwrap_or(key)
}

/// `done` のチャンクだけ終了理由を持つ（done_reason が無ければ "stop"）
fn finish_reason_of(v: &Value) -> Option<String> {
    if !v.get("done").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }
    Some(
        v.get("done_reason")
            .and_then(Value::as_str)
            .unwrap_or("stop")
            .to_string(),
    )
}

fn message_text(message: Option<&Value>) -> String {
    let Some(message) = message else {
        return String::new();
    };
    let content = message.get("content").and_then(Value::as_str).unwrap_or("");
    fold_thinking(message.get("thinking").and_then(Value::as_str), content)
}

fn metadata(v: &Value) -> Metrics {
    let mut m = Metrics::from_wire(v);
    if m.created.is_none() {
        // Ollama は created_at を RFC 3339 で返す
        m.created = v
            .get("created_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.timestamp());
    }
    m.finish_reason = finish_reason_of(v);
    m
}

impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
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
        let mut nested = Map::new();
        for (key, value) in strip_unset(options) {
            if DROPPED_KEYS.contains(&key.as_str()) {
                continue;
            }
            if TOP_LEVEL_KEYS.contains(&key.as_str()) {
                body.insert(key, value);
                continue;
            }
            if key == "options" {
                // 呼び出し側が Ollama 形式の options を直接渡した場合
                if let Value::Object(inner) = value {
                    for (k, v) in inner.into_iter().filter(|(_, v)| !v.is_null()) {
                        nested.insert(option_name(&k).to_string(), v);
                    }
                }
                continue;
            }
            nested.insert(option_name(&key).to_string(), value);
        }
        if !nested.is_empty() {
            body.insert("options".to_string(), Value::Object(nested));
        }
        debug!(
            keys = ?body.keys().collect::<Vec<_>>(),
            "prepared ollama payload"
        );
        Ok(payload)
    }

    fn send_request(&self, payload: Value, api_key: Option<&str>) -> Result<ChatResponse, Error> {
        let stream = payload.get("stream").and_then(Value::as_bool).unwrap_or(false);
        let response = self.session.post_json(&self.endpoint, payload, api_key)?;
        if stream {
            Ok(ChatResponse::Stream(Box::new(NdjsonChunks::new(
                BufReader::new(response),
            ))))
        } else {
            Ok(ChatResponse::Full(read_json(response)?))
        }
    }

    fn extract_choices<'a>(&self, response: &'a Value) -> Vec<&'a Value> {
        if response.get("message").is_some() {
            vec![response]
        } else {
            Vec::new()
        }
    }

    fn extract_content_from_choice(&self, choice: &Value) -> String {
        message_text(choice.get("message"))
    }

    fn extract_delta_from_chunk(&self, chunk: &Value) -> Delta {
        Delta {
            content: message_text(chunk.get("message")),
            logprobs: chunk.get("logprobs").filter(|l| !l.is_null()).cloned(),
            finish_reason: finish_reason_of(chunk),
        }
    }

    fn extract_metadata_from_response(&self, response: &Value) -> Metrics {
        metadata(response)
    }

    fn extract_metadata_from_chunk(&self, chunk: &Value) -> Option<Metrics> {
        let done = chunk.get("done").and_then(Value::as_bool).unwrap_or(false);
        if done || has_timing_fields(chunk) {
            Some(metadata(chunk))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn provider(base: &str) -> OllamaProvider {
        OllamaProvider::new(base).unwrap()
    }

    fn opts(v: Value) -> OptionBag {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_endpoint() {
        assert_eq!(
            provider("http://localhost:11434/").endpoint(),
            "http://localhost:11434/api/chat"
        );
    }

    #[test]
    fn test_prepare_payload_partitions_options() {
        let p = provider("http://localhost:11434");
        let payload = p
            .prepare_payload(
                &[Message::user("hi")],
                "llama3",
                true,
                &opts(json!({
                    "temperature": 0.7,
                    "max_tokens": -1,
                    "repetition_penalty": 1.1,
                    "top_k": 40,
                    "keep_alive": "5m",
                    "format": "json",
                    "think": true,
                    "provider": "auto",
                    "seed": null,
                    "timeout": 60
                })),
            )
            .unwrap();
        assert_eq!(payload["model"], "llama3");
        assert_eq!(payload["stream"], true);
        assert_eq!(payload["keep_alive"], "5m");
        assert_eq!(payload["format"], "json");
        assert_eq!(payload["think"], true);
        assert_eq!(payload["timeout"], 60);
        assert!(payload.get("provider").is_none());
        assert!(payload.get("temperature").is_none());

        let o = &payload["options"];
        assert_eq!(o["temperature"], 0.7);
        assert_eq!(o["num_predict"], -1);
        assert_eq!(o["repeat_penalty"], 1.1);
        assert_eq!(o["top_k"], 40);
        assert!(o.get("seed").is_none());
        assert!(o.get("max_tokens").is_none());
    }

    #[test]
    fn test_prepare_payload_without_options_has_no_options_key() {
        let p = provider("http://localhost:11434");
        let payload = p
            .prepare_payload(&[Message::user("hi")], "llama3", false, &opts(json!({ "stream": true })))
            .unwrap();
        assert!(payload.get("options").is_none());
        assert_eq!(payload["stream"], false);
    }

    #[test]
    fn test_prepare_payload_merges_explicit_options_object() {
        let p = provider("http://localhost:11434");
        let payload = p
            .prepare_payload(
                &[Message::user("hi")],
                "llama3",
                false,
                &opts(json!({ "options": { "num_ctx": 8192, "max_tokens": 10 }, "top_p": 0.9 })),
            )
            .unwrap();
        assert_eq!(payload["options"]["num_ctx"], 8192);
        assert_eq!(payload["options"]["num_predict"], 10);
        assert_eq!(payload["options"]["top_p"], 0.9);
    }

    #[test]
    fn test_extract_delta_with_thinking() {
        let p = provider("http://localhost:11434");
        let d = p.extract_delta_from_chunk(&json!({
            "message": { "role": "assistant", "thinking": "why", "content": "" },
            "done": false
        }));
        assert_eq!(d.content, "<think>why</think>");
        assert!(d.finish_reason.is_none());

        let d = p.extract_delta_from_chunk(&json!({
            "message": { "content": "42" },
            "done": true
        }));
        assert_eq!(d.content, "42");
        assert_eq!(d.finish_reason.as_deref(), Some("stop"));

        let d = p.extract_delta_from_chunk(&json!({ "done": true, "done_reason": "length" }));
        assert_eq!(d.content, "");
        assert_eq!(d.finish_reason.as_deref(), Some("length"));
    }

    #[test]
    fn test_extract_choices_wraps_message_response() {
        let p = provider("http://localhost:11434");
        let resp = json!({ "message": { "content": "ok" }, "done": true });
        let choices = p.extract_choices(&resp);
        assert_eq!(choices.len(), 1);
        assert_eq!(p.extract_content_from_choice(choices[0]), "ok");
        assert!(p.extract_choices(&json!({ "error": "x" })).is_empty());
    }

    #[test]
    fn test_extract_metadata_from_chunk() {
        let p = provider("http://localhost:11434");
        assert!(p
            .extract_metadata_from_chunk(&json!({ "message": { "content": "x" }, "done": false }))
            .is_none());
        let m = p
            .extract_metadata_from_chunk(&json!({
                "model": "llama3",
                "created_at": "2024-05-01T12:00:00Z",
                "message": { "content": "" },
                "done": true,
                "done_reason": "stop",
                "total_duration": 1_000_000_000u64,
                "prompt_eval_count": 5,
                "eval_count": 3
            }))
            .unwrap();
        assert_eq!(m.model.as_deref(), Some("llama3"));
        assert_eq!(m.created, Some(1714564800));
        assert_eq!(m.finish_reason.as_deref(), Some("stop"));
        assert_eq!(m.total_duration, Some(1_000_000_000));
        assert_eq!(m.prompt_eval_count, Some(5));
        assert_eq!(m.eval_count, Some(3));

        // done が無くてもタイミングがあれば終端扱い
        assert!(p
            .extract_metadata_from_chunk(&json!({ "eval_duration": 10 }))
            .is_some());
    }

    #[test]
    fn test_send_request_stream() {
        let mut server = mockito::Server::new();
        let body = concat!(
            "{\"message\":{\"thinking\":\"why\",\"content\":\"\"},\"done\":false}\n",
            "{\"message\":{\"content\":\"42\"},\"done\":true,\"eval_count\":3}\n"
        );
        let mock = server
            .mock("POST", "/api/chat")
            .match_header("authorization", Matcher::Missing)
            .match_body(Matcher::PartialJson(json!({ "model": "llama3", "stream": true })))
            .with_status(200)
            .with_header("content-type", "application/x-ndjson")
            .with_body(body)
            .create();

        let p = provider(&server.url());
        let payload = p
            .prepare_payload(&[Message::user("hi")], "llama3", true, &OptionBag::new())
            .unwrap();
        let chunks: Vec<Value> = match p.send_request(payload, None).unwrap() {
            ChatResponse::Stream(it) => it.collect::<Result<_, _>>().unwrap(),
            other => panic!("Expected Stream, got {:?}", other),
        };
        assert_eq!(chunks.len(), 2);
        assert_eq!(p.extract_delta_from_chunk(&chunks[0]).content, "<think>why</think>");
        mock.assert();
    }

    #[test]
    fn test_send_request_model_not_found() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/api/chat")
            .with_status(404)
            .with_body(r#"{"error":"model \"nope\" not found, try pulling it first"}"#)
            .create();

        let p = provider(&server.url());
        let payload = p
            .prepare_payload(&[Message::user("hi")], "nope", false, &OptionBag::new())
            .unwrap();
        match p.send_request(payload, None).unwrap_err() {
            Error::Request { status, message } => {
                assert_eq!(status, 404);
                assert!(message.contains("not found"));
            }
            other => panic!("Expected Request error, got {:?}", other),
        }
    }
}
