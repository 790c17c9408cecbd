//! 时间源

use chrono::Utc;
use std::time::Duration;

/// 时间源抽象，资料同步策略依赖它判断过期
pub trait Clock: Send + Sync {
    /// 当前毫秒时间戳
    fn now_ms(&self) -> i64;

    /// 当前微秒时间戳
    fn now_micros(&self) -> i64 {
        self.now_ms().saturating_mul(1000)
    }
}

/// 系统时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    fn now_micros(&self) -> i64 {
        Utc::now().timestamp_micros()
    }
}

/// 时长转毫秒，超出 i64 时取最大值
pub(crate) fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_ms_saturates() {
        assert_eq!(duration_ms(Duration::from_secs(120)), 120_000);
        assert_eq!(duration_ms(Duration::MAX), i64::MAX);
    }
}
