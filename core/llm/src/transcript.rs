//! イベントの JSONL 記録
//!
//! 1 イベント = 1 行 JSON（末尾 \n）。長い文字列は preview と len に置き換える。

use crate::events::{EventSink, LlmEvent};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

const PREVIEW_MAX_LEN: usize = 2048;

/// 巨大文字列を preview + len に置き換えた Value を返す
fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::String(s) => {
            let len = s.chars().count();
            if len <= PREVIEW_MAX_LEN {
                Value::String(s.clone())
            } else {
                let preview: String = s.chars().take(PREVIEW_MAX_LEN).collect();
                serde_json::json!({ "preview": preview, "len": len })
            }
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sanitize_payload).collect()),
        Value::Object(obj) => Value::Object(
            obj.iter()
                .map(|(k, v)| (k.clone(), sanitize_payload(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[derive(Serialize)]
struct TranscriptLine<'a> {
    ts: String,
    seq: u64,
    kind: &'a str,
    payload: Value,
}

/// JSONL へ追記する sink
pub struct JsonlEventSink<W: Write + Send> {
    writer: W,
    seq: u64,
}

impl JsonlEventSink<BufWriter<File>> {
    /// 追記モードで開く。親ディレクトリは作成する
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open transcript {}", path.display()))?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send> JsonlEventSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, seq: 0 }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> EventSink for JsonlEventSink<W> {
    fn on_event(&mut self, event: &LlmEvent) -> Result<()> {
        self.seq += 1;
        let mut tagged = serde_json::to_value(event)?;
        let payload = tagged
            .get_mut("payload")
            .map(Value::take)
            .unwrap_or(Value::Null);
        let line = TranscriptLine {
            ts: Utc::now().to_rfc3339(),
            seq: self.seq,
            kind: event.kind(),
            payload: sanitize_payload(&payload),
        };
        serde_json::to_writer(&mut self.writer, &line)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn on_end(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
