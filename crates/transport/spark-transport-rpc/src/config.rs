//! 连接器配置。
//!
//! # 教案式说明
//! - **意图 (Why)**：线程数、写缓冲水位、空闲阈值与重连上限需要在部署时调整，
//!   以 `serde` 结构承载即可直接从 TOML 加载，缺省字段回落到生产默认值；
//! - **契约 (What)**：
//!   - 水位仅在 `low >= 0 && high > 0` 时生效，否则沿用传输层默认（不做可写性限流）；
//!   - `low > high` 视为非法配置，由 [`ConnectorConfig::validate`] 拒绝；
//!   - 建连超时固定为 3 秒，不开放配置；
//! - **权衡 (Trade-offs)**：线程数默认值依赖 [`std::thread::available_parallelism`]，
//!   在容器中可能读到宿主机核数，部署时建议显式设置。

use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;

use crate::backoff::ReconnectPolicy;
use crate::error::ConfigError;

/// 建连超时。
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// 写空闲检测的默认阈值（秒）。
pub const WRITER_IDLE_TIME_SECONDS: u64 = 30;

/// 默认派发队列容量。
pub const DEFAULT_DISPATCH_QUEUE_CAPACITY: usize = 1024;

/// 写缓冲水位。
///
/// 待写字节超过 `high` 时连接变为不可写，回落到 `low` 及以下时恢复可写。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaterMark {
    /// 低水位（字节）。
    pub low: usize,
    /// 高水位（字节）。
    pub high: usize,
}

/// 连接器配置。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectorConfig {
    /// IO 工作线程数，默认 `2 × 可用并行度`。
    pub worker_threads: usize,
    /// 写缓冲高水位（字节），`<= 0` 表示不设置。
    pub write_buffer_high_water_mark: i64,
    /// 写缓冲低水位（字节），`< 0` 表示不设置。
    pub write_buffer_low_water_mark: i64,
    /// 写空闲多少秒后发送心跳。
    pub writer_idle_seconds: u64,
    /// 平台支持时优先使用原生事件通知。
    pub prefer_native_polling: bool,
    /// 两次成功之间最多调度的重连次数，缺省为无限。
    pub max_reconnect_attempts: Option<u32>,
    /// 派发线程数；`0` 表示在 IO 线程上直接交付。
    ///
    /// `0` 与 `1` 保持单连接内的帧顺序；多于一个线程时帧并行交付，
    /// 同一连接的帧可能不按到达顺序进入回调。
    pub dispatch_threads: usize,
    /// 派发队列容量。
    pub dispatch_queue_capacity: usize,
    /// 单帧负载上限（字节），缺省不限制。
    pub max_frame_length: Option<u32>,
}

fn available_parallelism() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            worker_threads: available_parallelism() << 1,
            write_buffer_high_water_mark: -1,
            write_buffer_low_water_mark: -1,
            writer_idle_seconds: WRITER_IDLE_TIME_SECONDS,
            prefer_native_polling: true,
            max_reconnect_attempts: None,
            dispatch_threads: available_parallelism(),
            dispatch_queue_capacity: DEFAULT_DISPATCH_QUEUE_CAPACITY,
            max_frame_length: None,
        }
    }
}

impl ConnectorConfig {
    /// 从 TOML 文本加载并校验。
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// 校验字段组合。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::Invalid {
                field: "worker_threads",
                reason: "must be at least 1".to_owned(),
            });
        }
        if self.writer_idle_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "writer_idle_seconds",
                reason: "must be at least 1".to_owned(),
            });
        }
        if self.dispatch_threads > 0 && self.dispatch_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "dispatch_queue_capacity",
                reason: "must be at least 1 when dispatch_threads > 0".to_owned(),
            });
        }
        if self.water_mark_configured()
            && self.write_buffer_low_water_mark > self.write_buffer_high_water_mark
        {
            return Err(ConfigError::Invalid {
                field: "write_buffer_low_water_mark",
                reason: format!(
                    "low water mark {} exceeds high water mark {}",
                    self.write_buffer_low_water_mark, self.write_buffer_high_water_mark
                ),
            });
        }
        Ok(())
    }

    fn water_mark_configured(&self) -> bool {
        self.write_buffer_low_water_mark >= 0 && self.write_buffer_high_water_mark > 0
    }

    /// 生效的写缓冲水位。
    pub fn water_mark(&self) -> Option<WaterMark> {
        if !self.water_mark_configured() {
            return None;
        }
        Some(WaterMark {
            low: usize::try_from(self.write_buffer_low_water_mark).ok()?,
            high: usize::try_from(self.write_buffer_high_water_mark).ok()?,
        })
    }

    /// 写空闲阈值。
    pub fn writer_idle(&self) -> Duration {
        Duration::from_secs(self.writer_idle_seconds)
    }

    /// 重连上限策略。
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        match self.max_reconnect_attempts {
            Some(max) => ReconnectPolicy::with_max_attempts(max),
            None => ReconnectPolicy::unbounded(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_leave_water_marks_unset() {
        let config = ConnectorConfig::default();
        assert_eq!(config.water_mark(), None);
        assert_eq!(config.writer_idle(), Duration::from_secs(30));
        assert!(config.worker_threads >= 2);
        assert_eq!(config.reconnect_policy(), ReconnectPolicy::unbounded());
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn water_marks_apply_only_when_both_are_set() {
        let config = ConnectorConfig::from_toml_str(
            "write_buffer_high_water_mark = 65536\nwrite_buffer_low_water_mark = 0\n",
        )
        .expect("parses");
        assert_eq!(
            config.water_mark(),
            Some(WaterMark {
                low: 0,
                high: 65536
            })
        );

        let only_high =
            ConnectorConfig::from_toml_str("write_buffer_high_water_mark = 65536\n").expect("ok");
        assert_eq!(only_high.water_mark(), None);
    }

    #[test]
    fn inverted_water_marks_are_rejected() {
        let err = ConnectorConfig::from_toml_str(
            "write_buffer_high_water_mark = 10\nwrite_buffer_low_water_mark = 20\n",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "write_buffer_low_water_mark",
                ..
            }
        ));
    }

    #[test]
    fn unknown_fields_fail_to_parse() {
        let err = ConnectorConfig::from_toml_str("worker_thread = 4\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn reconnect_limit_is_read_from_toml() {
        let config =
            ConnectorConfig::from_toml_str("max_reconnect_attempts = 5\nworker_threads = 1\n")
                .expect("parses");
        assert_eq!(config.reconnect_policy().max_attempts(), Some(5));
        assert_eq!(config.worker_threads, 1);
    }
}
