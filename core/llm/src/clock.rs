//! 時刻取得の抽象
//!
//! TTFT・レイテンシの計測はこの trait 経由で行い、テストでは時刻を差し替える。

use std::sync::Mutex;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// `Instant::now()` をそのまま返す実装
#[derive(Debug, Clone, Copy, Default)]
pub struct StdClock;

impl Clock for StdClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// 呼ばれるたびに一定量だけ進む時計（テスト・再現用）
#[derive(Debug)]
pub struct SteppingClock {
    current: Mutex<Instant>,
    step: Duration,
}

impl SteppingClock {
    pub fn new(step: Duration) -> Self {
        Self {
            current: Mutex::new(Instant::now()),
            step,
        }
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> Instant {
        match self.current.lock() {
            Ok(mut t) => {
                *t += self.step;
                *t
            }
            Err(poisoned) => {
                let mut t = poisoned.into_inner();
                *t += self.step;
                *t
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stepping_clock_advances() {
        let clock = SteppingClock::new(Duration::from_millis(10));
        let a = clock.now();
        let b = clock.now();
        assert_eq!(b - a, Duration::from_millis(10));
    }

    #[test]
    fn test_std_clock_monotonic() {
        let clock = StdClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
