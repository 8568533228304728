//! クライアント側のトークン数見積もり
//!
//! サーバーが usage を返さなかったときの補完にだけ使う。上書きには使わない。

/// トークン数を数える（実トークナイザを差し込む場合はこの trait を実装する）
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> u64;
}

/// 文字数 / 4 + 1 の粗い見積もり
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenCounter;

impl TokenCounter for HeuristicTokenCounter {
    fn count(&self, text: &str) -> u64 {
        estimate_tokens(text)
    }
}

/// 空文字列は 0、それ以外は floor(文字数 / 4) + 1
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count();
    if chars == 0 {
        0
    } else {
        (chars / 4) as u64 + 1
    }
}
