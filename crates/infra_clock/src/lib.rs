use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

mod reconciler;

pub use reconciler::{ClockOutcome, ClockPhase, ClockReconciler, ClockVerdict};

/// Primary clock period: the 50 MHz counter is 43 bits wide.
pub const MAXTIME: u64 = 1 << 43;
/// Largest forward step between consecutive good events (10 s).
pub const MAX_JUMP: u64 = 10 * 50_000_000;
/// Tolerated disagreement between the two clocks, in primary ticks (1 us).
pub const MAX_DRIFT: u64 = 5_000;

/// Source of the wall-clock second sampled once per record.
pub trait WallClock {
    fn now_sec(&self) -> i64;
}

impl<T: WallClock + ?Sized> WallClock for Arc<T> {
    fn now_sec(&self) -> i64 {
        (**self).now_sec()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemWallClock;

impl SystemWallClock {
    pub fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl WallClock for SystemWallClock {
    fn now_sec(&self) -> i64 {
        self.utc_now().timestamp()
    }
}

/// Settable clock for replays and tests.
#[derive(Debug, Default)]
pub struct ManualWallClock {
    now_sec: AtomicI64,
}

impl ManualWallClock {
    pub fn new(now_sec: i64) -> Self {
        Self {
            now_sec: AtomicI64::new(now_sec),
        }
    }

    pub fn set(&self, now_sec: i64) {
        self.now_sec.store(now_sec, Ordering::Relaxed);
    }

    pub fn advance(&self, secs: i64) {
        self.now_sec.fetch_add(secs, Ordering::Relaxed);
    }
}

impl WallClock for ManualWallClock {
    fn now_sec(&self) -> i64 {
        self.now_sec.load(Ordering::Relaxed)
    }
}
