//! 協調的キャンセル
//!
//! オーケストレーターはチャンクの合間にだけフラグを確認する。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub trait CancelSignal: Send + Sync {
    fn is_cancelled(&self) -> bool;
}

/// 複数スレッドから共有できるキャンセルフラグ（UI スレッドや Ctrl+C ハンドラから立てる）
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::Relaxed);
    }
}

impl CancelSignal for CancelFlag {
    fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// キャンセルされないスタブ
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverCancel;

impl CancelSignal for NeverCancel {
    fn is_cancelled(&self) -> bool {
        false
    }
}
