// src/clock.rs

//! 时钟抽象：所有事件时间戳、心跳判定都从这里取时间
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

pub const NS_PER_MS: i64 = 1_000_000;

pub fn ms_to_ns(ms: u64) -> i64 {
    (ms as i64).saturating_mul(NS_PER_MS)
}

/// 单调时钟，返回纳秒
pub trait Clock: Send + Sync {
    fn now_ns(&self) -> i64;
}

/// 以构造时刻为零点的稳定时钟
pub struct SteadyClock {
    origin: Instant,
}

impl SteadyClock {
    pub fn new() -> Self {
        SteadyClock { origin: Instant::now() }
    }
}

impl Default for SteadyClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SteadyClock {
    fn now_ns(&self) -> i64 {
        let elapsed: Duration = self.origin.elapsed();
        i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX)
    }
}

/// 测试用时钟，时间只在手动推进时变化
#[derive(Default)]
pub struct FakeClock {
    now: AtomicI64,
}

impl FakeClock {
    pub fn new(start_ns: i64) -> Self {
        FakeClock { now: AtomicI64::new(start_ns) }
    }

    pub fn set(&self, ns: i64) {
        self.now.store(ns, Ordering::SeqCst);
    }

    pub fn advance(&self, ns: i64) {
        self.now.fetch_add(ns, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_ns(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_clock_advance() {
        let clock = FakeClock::new(1000);
        assert_eq!(clock.now_ns(), 1000);
        clock.advance(ms_to_ns(500));
        assert_eq!(clock.now_ns(), 1000 + 500 * NS_PER_MS);
        clock.set(7);
        assert_eq!(clock.now_ns(), 7);
    }

    #[test]
    fn test_steady_clock_is_monotonic() {
        let clock = SteadyClock::new();
        let a = clock.now_ns();
        let b = clock.now_ns();
        assert!(b >= a);
    }
}
