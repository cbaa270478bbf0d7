//! 进度事件节流
//!
//! 分片完成的频率可能很高，进度事件按时间间隔合并，最后一次进度强制发布

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

/// 进度事件节流器
#[derive(Debug)]
pub struct ProgressThrottler {
    last_emit: Mutex<Option<Instant>>,
    interval: Duration,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_emit: Mutex::new(None),
            interval,
        }
    }

    /// 距离上次发布超过间隔时返回 true 并记录本次时间
    pub fn should_emit(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last_emit.lock();
        match *last {
            Some(at) if now.duration_since(at) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// 强制发布（最后一个分片完成时）
    pub fn force_emit(&self) -> bool {
        *self.last_emit.lock() = Some(Instant::now());
        true
    }

    /// 重新开始计时（任务重新启动时）
    pub fn reset(&self) {
        *self.last_emit.lock() = None;
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_THROTTLE_INTERVAL_MS))
    }
}
