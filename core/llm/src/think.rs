//! `<think>…</think>` による推論部分と最終回答の分離
//!
//! `split_thinking` は完成した文字列に対する純関数。`ThinkStreamParser` は
//! チャンクごとに呼ぶ 2 状態オートマトンで、最後まで流すと同じ分離結果になる。
//! マーカーは ASCII の範囲で大文字小文字を区別しない。閉じられていない `<think>` は末尾まで、
//! 対応する開始の無い `</think>` は削除する。

use once_cell::sync::Lazy;
use regex::Regex;

pub const OPEN_MARKER: &str = "<think>";
pub const CLOSE_MARKER: &str = "</think>";

// 大文字小文字の同一視は ASCII のみ（ストリーム側の to_ascii_lowercase と揃える）
static THINK_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<[tT][hH][iI][nN][kK]>(.*?)(?:</[tT][hH][iI][nN][kK]>|\z)")
        .expect("valid think regex")
});
static STRAY_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"</?[tT][hH][iI][nN][kK]>").expect("valid marker regex"));

/// 分離結果（どちらも前後の空白を除去済み）
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ThinkSplit {
    pub thinking: String,
    pub response: String,
}

/// 推論ブロックと回答を分離する
///
/// 複数ブロックは内側を順に連結し、外側からはすべて取り除く。
pub fn split_thinking(text: &str) -> ThinkSplit {
    let mut thinking = String::new();
    for caps in THINK_BLOCK.captures_iter(text) {
        if let Some(inner) = caps.get(1) {
            thinking.push_str(inner.as_str());
        }
    }
    let outer = THINK_BLOCK.replace_all(text, "");
    ThinkSplit {
        thinking: thinking.trim().to_string(),
        response: strip_markers(&outer).trim().to_string(),
    }
}

/// 残ったマーカーを消す。消した結果マーカーが新たにできた場合も消えるまで繰り返す
pub fn strip_markers(text: &str) -> String {
    let mut current = text.to_string();
    while STRAY_MARKER.is_match(&current) {
        current = STRAY_MARKER.replace_all(&current, "").into_owned();
    }
    current
}

/// ストリームから切り出した断片
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Content(String),
    Thinking(String),
}

/// `<think>` の内外を追跡するオートマトン
///
/// チャンク境界で分割されたマーカーに備えて、マーカーの先頭と一致する末尾は
/// 次のチャンクまでバッファに残す。
#[derive(Debug, Default)]
pub struct ThinkStreamParser {
    in_think: bool,
    buffer: String,
    /// 対応の無い `</think>` を取り除いた位置（buffer 内のバイト位置）。
    /// ここをまたいでできたマーカーは解釈せずに削除する
    splice: Option<usize>,
}

impl ThinkStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_think(&self) -> bool {
        self.in_think
    }

    /// 増分を追加し、確定した断片を返す
    pub fn push(&mut self, delta: &str) -> Vec<Segment> {
        self.buffer.push_str(delta);
        self.drain(false)
    }

    /// ストリーム終了（またはキャンセル）時に残りをすべて吐き出す
    pub fn finish(&mut self) -> Vec<Segment> {
        self.drain(true)
    }

    fn drain(&mut self, at_end: bool) -> Vec<Segment> {
        let mut out = Vec::new();
        loop {
            // ASCII 小文字化はバイト位置を変えない
            let lower = self.buffer.to_ascii_lowercase();
            if self.in_think {
                if let Some(idx) = lower.find(CLOSE_MARKER) {
                    push_segment(&mut out, Segment::Thinking(self.buffer[..idx].to_string()));
                    self.buffer.drain(..idx + CLOSE_MARKER.len());
                    self.in_think = false;
                    continue;
                }
                let keep = if at_end {
                    0
                } else {
                    partial_marker_len(&lower, &[CLOSE_MARKER])
                };
                let cut = self.buffer.len() - keep;
                push_segment(&mut out, Segment::Thinking(self.buffer[..cut].to_string()));
                self.buffer.drain(..cut);
                break;
            }

            let open = lower.find(OPEN_MARKER);
            let close = lower.find(CLOSE_MARKER);
            let next = match (open, close) {
                (Some(o), Some(c)) if c < o => Some((c, CLOSE_MARKER.len(), false)),
                (Some(o), _) => Some((o, OPEN_MARKER.len(), true)),
                (None, Some(c)) => Some((c, CLOSE_MARKER.len(), false)),
                (None, None) => None,
            };
            match next {
                Some((idx, marker_len, opens)) => {
                    let spliced = self
                        .splice
                        .map_or(false, |at| idx < at && at < idx + marker_len);
                    if opens && !spliced {
                        push_segment(&mut out, Segment::Content(self.buffer[..idx].to_string()));
                        self.buffer.drain(..idx + marker_len);
                        self.in_think = true;
                        self.splice = None;
                        continue;
                    }
                    // 削除したマーカーの前後がつながって新しいマーカーになり得るので、
                    // 直前のマーカー接頭辞は送らずに残す
                    let keep = held_back_len(&lower[..idx]);
                    let cut = idx - keep;
                    push_segment(&mut out, Segment::Content(self.buffer[..cut].to_string()));
                    self.buffer.replace_range(idx..idx + marker_len, "");
                    self.buffer.drain(..cut);
                    self.splice = Some(keep).filter(|k| *k > 0);
                }
                None => {
                    let keep = if at_end { 0 } else { held_back_len(&lower) };
                    let cut = self.buffer.len() - keep;
                    push_segment(&mut out, Segment::Content(self.buffer[..cut].to_string()));
                    self.buffer.drain(..cut);
                    self.splice = self
                        .splice
                        .and_then(|at| at.checked_sub(cut))
                        .filter(|at| *at > 0);
                    break;
                }
            }
        }
        out
    }
}

fn push_segment(out: &mut Vec<Segment>, seg: Segment) {
    let empty = match &seg {
        Segment::Content(s) | Segment::Thinking(s) => s.is_empty(),
    };
    if !empty {
        out.push(seg);
    }
}

/// 末尾がいずれかのマーカーの真の接頭辞と一致する最長の長さ
fn partial_marker_len(lower: &str, markers: &[&str]) -> usize {
    let mut best = 0;
    for marker in markers {
        for k in (1..marker.len()).rev() {
            if k <= best {
                break;
            }
            if lower.ends_with(&marker[..k]) {
                best = k;
                break;
            }
        }
    }
    best
}

/// 本文側で送らずに残す末尾の長さ
///
/// `<thi</thi` のようにマーカー接頭辞が連なる場合は、内側の `</think>` が
/// 削除されたあとにつながる可能性があるので、連なり全体を残す。
fn held_back_len(lower: &str) -> usize {
    let mut total = 0;
    loop {
        let k = partial_marker_len(&lower[..lower.len() - total], &[OPEN_MARKER, CLOSE_MARKER]);
        if k == 0 {
            return total;
        }
        total += k;
    }
}

/// 断片列を (thinking, response) に畳み込む。ストリーム結果の最終整形に使う
pub fn collect_segments<'a>(segments: impl IntoIterator<Item = &'a Segment>) -> ThinkSplit {
    let mut thinking = String::new();
    let mut content = String::new();
    for seg in segments {
        match seg {
            Segment::Content(s) => content.push_str(s),
            Segment::Thinking(s) => thinking.push_str(s),
        }
    }
    finish_split(&thinking, &content)
}

/// 蓄積済みの推論・本文から最終的な分離結果を作る
pub fn finish_split(thinking: &str, content: &str) -> ThinkSplit {
    ThinkSplit {
        thinking: thinking.trim().to_string(),
        response: strip_markers(content).trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_split(chunks: &[&str]) -> ThinkSplit {
        let mut parser = ThinkStreamParser::new();
        let mut segs = Vec::new();
        for c in chunks {
            segs.extend(parser.push(c));
        }
        segs.extend(parser.finish());
        collect_segments(&segs)
    }

    const SAMPLES: &[&str] = &[
        "Hello",
        "",
        "   padded   ",
        "<think>reason</think>answer",
        "<THINK>Upper</Think> mixed case",
        "before <think>one</think> middle <think>two</think> after",
        "<think>never closed",
        "stray</think> close",
        "<think>\nmulti\nline\n</think>\n\nfinal\nanswer",
        "a<think></think>b",
        "日本語<think>考え中</think>答え",
        "no markers but < and > and </thin",
        "<think>x</think",
        "<think>a<think>b</think>c",
        "<thin\u{212A}>x</think>y",
        "<thi</think>nk>",
        "<thi</think>nk>x</think>y",
        "</thi</think>nk>after",
        "<th<thi</think>nk>ink>tail",
        "x <t</think>able>",
    ];

    #[test]
    fn test_split_basic() {
        let s = split_thinking("<think>reason</think>answer");
        assert_eq!(s.thinking, "reason");
        assert_eq!(s.response, "answer");
    }

    #[test]
    fn test_split_no_block() {
        let s = split_thinking("  just text \n");
        assert_eq!(s.thinking, "");
        assert_eq!(s.response, "just text");
    }

    #[test]
    fn test_split_multiple_blocks() {
        let s = split_thinking("<think>a</think>x<think>b</think>y");
        assert_eq!(s.thinking, "ab");
        assert_eq!(s.response, "xy");
    }

    #[test]
    fn test_split_case_insensitive_and_dotall() {
        let s = split_thinking("<Think>line1\nline2</THINK>\nok");
        assert_eq!(s.thinking, "line1\nline2");
        assert_eq!(s.response, "ok");
    }

    #[test]
    fn test_split_unclosed_runs_to_end() {
        let s = split_thinking("answer first <think>still thinking");
        assert_eq!(s.thinking, "still thinking");
        assert_eq!(s.response, "answer first");
    }

    #[test]
    fn test_split_stray_close_removed() {
        let s = split_thinking("reasoning leaked</think>The answer");
        assert_eq!(s.thinking, "");
        assert_eq!(s.response, "reasoning leakedThe answer");
    }

    #[test]
    fn test_response_never_contains_markers() {
        for sample in SAMPLES {
            let s = split_thinking(sample);
            let lower = s.response.to_ascii_lowercase();
            assert!(!lower.contains("<think>"), "sample: {:?}", sample);
            assert!(!lower.contains("</think>"), "sample: {:?}", sample);
        }
    }

    #[test]
    fn test_split_idempotent() {
        for sample in SAMPLES {
            let once = split_thinking(sample);
            let twice = split_thinking(&once.response);
            assert_eq!(twice.response, once.response, "sample: {:?}", sample);
            assert_eq!(twice.thinking, "");
            assert_eq!(split_thinking(sample), once);
        }
    }

    #[test]
    fn test_stream_matches_pure_at_every_split_point() {
        for sample in SAMPLES {
            let expected = split_thinking(sample);
            let bounds: Vec<usize> = sample
                .char_indices()
                .map(|(i, _)| i)
                .chain(std::iter::once(sample.len()))
                .collect();
            for &i in &bounds {
                for &j in bounds.iter().filter(|&&j| j >= i) {
                    let chunks = [&sample[..i], &sample[i..j], &sample[j..]];
                    assert_eq!(
                        stream_split(&chunks),
                        expected,
                        "sample: {:?} chunks: {:?}",
                        sample,
                        chunks
                    );
                }
            }
        }
    }

    #[test]
    fn test_stream_char_by_char() {
        for sample in SAMPLES {
            let chars: Vec<String> = sample.chars().map(|c| c.to_string()).collect();
            let refs: Vec<&str> = chars.iter().map(String::as_str).collect();
            assert_eq!(stream_split(&refs), split_thinking(sample), "sample: {:?}", sample);
        }
    }

    #[test]
    fn test_stream_content_events_never_rejoin_into_marker() {
        for sample in SAMPLES {
            let bounds: Vec<usize> = sample
                .char_indices()
                .map(|(i, _)| i)
                .chain(std::iter::once(sample.len()))
                .collect();
            for &i in &bounds {
                let mut parser = ThinkStreamParser::new();
                let mut segs = parser.push(&sample[..i]);
                segs.extend(parser.push(&sample[i..]));
                segs.extend(parser.finish());
                let content: String = segs
                    .iter()
                    .filter_map(|s| match s {
                        Segment::Content(t) => Some(t.as_str()),
                        Segment::Thinking(_) => None,
                    })
                    .collect();
                let lower = content.to_ascii_lowercase();
                assert!(
                    !lower.contains(OPEN_MARKER) && !lower.contains(CLOSE_MARKER),
                    "sample: {:?} split at {}: {:?}",
                    sample,
                    i,
                    content
                );
            }
        }
    }

    #[test]
    fn test_stream_stray_close_does_not_leak_joined_marker() {
        let mut parser = ThinkStreamParser::new();
        let mut segs = parser.push("<thi</think>nk>");
        segs.extend(parser.finish());
        assert!(segs.is_empty());
        assert!(!parser.in_think());
    }

    #[test]
    fn test_non_ascii_case_fold_is_not_a_marker() {
        let sample = "<thin\u{212A}>x</think>y";
        let s = split_thinking(sample);
        assert_eq!(s.thinking, "");
        assert_eq!(s.response, "<thin\u{212A}>xy");
        assert_eq!(stream_split(&[sample]), s);
    }

    #[test]
    fn test_stream_marker_split_across_chunks() {
        let mut parser = ThinkStreamParser::new();
        assert!(parser.push("<thi").is_empty());
        let segs = parser.push("nk>reason</think>answer");
        assert_eq!(
            segs,
            vec![
                Segment::Thinking("reason".to_string()),
                Segment::Content("answer".to_string())
            ]
        );
        assert!(!parser.in_think());
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn test_stream_holds_back_only_possible_marker_prefix() {
        let mut parser = ThinkStreamParser::new();
        let segs = parser.push("a < b <t");
        assert_eq!(segs, vec![Segment::Content("a < b ".to_string())]);
        let segs = parser.push("able>");
        assert_eq!(segs, vec![Segment::Content("<table>".to_string())]);
    }

    #[test]
    fn test_stream_thinking_emitted_incrementally() {
        let mut parser = ThinkStreamParser::new();
        assert_eq!(parser.push("<think>ab"), vec![Segment::Thinking("ab".to_string())]);
        assert!(parser.in_think());
        assert_eq!(parser.push("cd</"), vec![Segment::Thinking("cd".to_string())]);
        assert_eq!(parser.push("think>done"), vec![Segment::Content("done".to_string())]);
    }

    #[test]
    fn test_finish_flushes_partial_marker_as_current_state() {
        let mut parser = ThinkStreamParser::new();
        assert!(parser.push("<thin").is_empty());
        assert_eq!(parser.finish(), vec![Segment::Content("<thin".to_string())]);
    }
}
