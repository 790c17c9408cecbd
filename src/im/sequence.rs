//! 排序序列号
//!
//! 63 位整数：低 61 位为微秒时间戳，第 61 位为置顶标记。
//! 置顶项总是排在非置顶项之前（按 seq 倒序），同一置顶状态内按时间排序。
//! 同一微秒可能产生相同的 seq，分页时只能当作游标使用。

use crate::im::clock::Clock;

const TIME_BITS: u32 = 61;
const TIME_MASK: i64 = (1i64 << TIME_BITS) - 1;
const PINNED_BIT: i64 = 1i64 << TIME_BITS;

pub struct Sequence;

impl Sequence {
    /// 由置顶标记和微秒时间戳生成序列号
    pub fn create(pinned: bool, time_micros: i64) -> i64 {
        let seq = time_micros & TIME_MASK;
        if pinned {
            seq | PINNED_BIT
        } else {
            seq
        }
    }

    /// 以当前时间生成序列号
    pub fn now(pinned: bool, clock: &dyn Clock) -> i64 {
        Self::create(pinned, clock.now_micros())
    }

    pub fn is_pinned(seq: i64) -> bool {
        seq & PINNED_BIT != 0
    }

    pub fn time_micros(seq: i64) -> i64 {
        seq & TIME_MASK
    }

    /// 保留时间部分，只改置顶标记
    pub fn with_pinned(seq: i64, pinned: bool) -> i64 {
        Self::create(pinned, Self::time_micros(seq))
    }
}
