//! 端末表示用の sink
//!
//! content は stdout、thinking と最終メトリクスは stderr に出す。

use anyhow::Result;
use llm::{EventSink, LlmEvent, Metrics};
use std::io::{self, Stderr, Stdout, Write};

const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq)]
enum Section {
    None,
    Thinking,
    Content,
}

pub struct ConsoleSink<O: Write + Send, E: Write + Send> {
    out: O,
    err: E,
    /// stderr が端末のときだけ色を付ける
    color: bool,
    section: Section,
}

impl ConsoleSink<Stdout, Stderr> {
    pub fn stdio(color: bool) -> Self {
        Self::new(io::stdout(), io::stderr(), color)
    }
}

impl<O: Write + Send, E: Write + Send> ConsoleSink<O, E> {
    pub fn new(out: O, err: E, color: bool) -> Self {
        Self {
            out,
            err,
            color,
            section: Section::None,
        }
    }

    #[cfg(test)]
    fn into_parts(self) -> (O, E) {
        (self.out, self.err)
    }

    fn dim(&self, s: &str) -> String {
        if self.color {
            format!("{}{}{}", DIM, s, RESET)
        } else {
            s.to_string()
        }
    }

    fn write_thinking(&mut self, text: &str) -> Result<()> {
        if self.section != Section::Thinking {
            let prefix = self.dim("[thinking] ");
            write!(self.err, "{}", prefix)?;
            self.section = Section::Thinking;
        }
        let body = self.dim(text);
        write!(self.err, "{}", body)?;
        self.err.flush()?;
        Ok(())
    }

    fn write_content(&mut self, text: &str) -> Result<()> {
        if self.section == Section::Thinking {
            writeln!(self.err)?;
        }
        self.section = Section::Content;
        write!(self.out, "{}", text)?;
        self.out.flush()?;
        Ok(())
    }

    fn write_summary(&mut self, m: &Metrics) -> Result<()> {
        if self.section == Section::Content {
            writeln!(self.out)?;
            self.out.flush()?;
        } else if self.section == Section::Thinking {
            writeln!(self.err)?;
        }
        self.section = Section::None;
        let line = format_summary(m);
        let line = self.dim(&line);
        writeln!(self.err, "{}", line)?;
        Ok(())
    }
}

/// 最終メトリクスの 1 行要約
pub fn format_summary(m: &Metrics) -> String {
    let mut parts = Vec::new();
    if let Some(model) = &m.model {
        parts.push(model.clone());
    }
    if let Some(ttft) = m.time_to_first_token_ms {
        parts.push(format!("ttft {:.0}ms", ttft));
    }
    if let Some(total) = m.total_latency_ms {
        parts.push(format!("total {:.0}ms", total));
    }
    match (m.prompt_eval_count, m.eval_count) {
        (Some(p), Some(e)) => parts.push(format!("tokens {}+{}", p, e)),
        (None, Some(e)) => parts.push(format!("tokens {}", e)),
        _ => {}
    }
    if let (Some(e), Some(total)) = (m.eval_count, m.total_latency_ms) {
        if total > 0.0 {
            parts.push(format!("{:.1} tok/s", e as f64 * 1000.0 / total));
        }
    }
    if let Some(reason) = &m.finish_reason {
        parts.push(reason.clone());
    }
    format!("-- {}", parts.join(" | "))
}

impl<O: Write + Send, E: Write + Send> EventSink for ConsoleSink<O, E> {
    fn on_event(&mut self, event: &LlmEvent) -> Result<()> {
        match event {
            LlmEvent::Thinking(t) => self.write_thinking(t),
            LlmEvent::Content(t) => self.write_content(t),
            LlmEvent::FinalMetrics(m) => self.write_summary(m),
            _ => Ok(()),
        }
    }

    fn on_end(&mut self) -> Result<()> {
        self.out.flush()?;
        self.err.flush()?;
        Ok(())
    }
}
