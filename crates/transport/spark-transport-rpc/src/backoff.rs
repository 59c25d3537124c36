//! 重连退避规则与放弃策略。

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 退避指数的上限；超过后延迟保持在 `2 << 12 = 8192ms`。
pub const MAX_BACKOFF_SHIFT: u32 = 12;

/// 第 `attempts` 次计数对应的重连延迟：`2 << min(attempts, 12)` 毫秒。
///
/// 断线后计数先自增再取延迟，因此首次断线等待 4ms，随后 8ms、16ms……直至 8192ms。
pub fn backoff_delay(attempts: u32) -> Duration {
    Duration::from_millis(2u64 << attempts.min(MAX_BACKOFF_SHIFT))
}

/// 重连上限策略。
///
/// `max_attempts = None` 表示只要未显式停止就无限重连；`Some(n)` 表示在两次成功之间最多
/// 调度 `n` 次重连，第 `n + 1` 次断线时放弃。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// 无上限。
    pub const fn unbounded() -> Self {
        Self { max_attempts: None }
    }

    /// 指定上限。
    pub const fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
        }
    }

    /// 当前上限。
    pub const fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// 已连续调度 `consecutive_failures` 次后是否还允许再调度一次。
    pub fn allows(&self, consecutive_failures: u32) -> bool {
        match self.max_attempts {
            Some(max) => consecutive_failures < max,
            None => true,
        }
    }
}

/// 退避计数器。
///
/// `attempts` 封顶于 [`MAX_BACKOFF_SHIFT`]，只用于计算延迟；`consecutive_failures`
/// 不封顶，用于与 [`ReconnectPolicy`] 比较。两者在连接激活时同时清零。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct BackoffState {
    attempts: u32,
    consecutive_failures: u32,
}

impl BackoffState {
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    /// 记录一次失败并返回下一次重连前的等待时长。
    pub(crate) fn on_failure(&mut self) -> Duration {
        if self.attempts < MAX_BACKOFF_SHIFT {
            self.attempts += 1;
        }
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        backoff_delay(self.attempts)
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn delay_doubles_until_cap() {
        let expected: Vec<u64> = (0..=12).map(|n| 2u64 << n).collect();
        let actual: Vec<u64> = (0..=12).map(|n| backoff_delay(n).as_millis() as u64).collect();
        assert_eq!(actual, expected);
        assert_eq!(backoff_delay(12), Duration::from_millis(8192));
        assert_eq!(backoff_delay(13), Duration::from_millis(8192));
        assert_eq!(backoff_delay(u32::MAX), Duration::from_millis(8192));
    }

    #[test]
    fn failures_walk_the_sequence_then_plateau() {
        let mut state = BackoffState::default();
        let delays: Vec<u64> = (0..15)
            .map(|_| state.on_failure().as_millis() as u64)
            .collect();
        assert_eq!(&delays[..4], &[4, 8, 16, 32]);
        assert_eq!(delays[11], 8192);
        assert!(delays[11..].iter().all(|&ms| ms == 8192));
        assert_eq!(state.attempts(), MAX_BACKOFF_SHIFT);
        assert_eq!(state.consecutive_failures(), 15);

        state.reset();
        assert_eq!(state.on_failure(), Duration::from_millis(4));
    }

    #[test]
    fn policy_limits_consecutive_schedules() {
        let policy = ReconnectPolicy::with_max_attempts(2);
        assert!(policy.allows(0));
        assert!(policy.allows(1));
        assert!(!policy.allows(2));
        assert!(ReconnectPolicy::unbounded().allows(u32::MAX));
    }

    proptest! {
        #[test]
        fn delay_is_monotonic_and_bounded(a in 0u32..64, b in 0u32..64) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(backoff_delay(lo) <= backoff_delay(hi));
            prop_assert!(backoff_delay(hi) <= Duration::from_millis(8192));
        }
    }
}
