#![deny(unsafe_code)]
#![warn(missing_docs)]

//! # spark-transport-rpc
//!
//! ## 教案目的（Why）
//! - **定位**：RPC 客户端传输层，负责与远端提供者建立并维持长连接：
//!   TCP 建连、16 字节协议头分帧、写空闲心跳、断线后指数退避重连、存活连接登记；
//! - **架构角色**：向上把完整帧交给业务侧 [`MessageHandler`]，向下只依赖 Tokio 的 TCP 与
//!   [`spark_codec_rpc`] 的帧格式；业务派发线程池饱和时由 [`RejectedTaskPolicy`] 兜底。
//!
//! ## 实现策略（How）
//! - **模块划分**：
//!   1. `pipeline`：入站/出站处理器链与 [`build_chain`] 装配；
//!   2. `handlers`：空闲检测、心跳触发、帧编解码与应用交付；
//!   3. `watchdog`：每个远端一个的重连状态机，退避规则见 `backoff`；
//!   4. `connector`：运行时、套接字选项与建连入口；
//!   5. `group`：按远端地址分组的存活连接表；
//!   6. `dispatch`/`rejected`：业务派发线程池与饱和策略；
//!   7. `timer`：定时器抽象，测试以 [`ManualTimer`] 驱动虚拟时间。
//! - **关键约束**：处理器链顺序固定；同一 Watchdog 同一时刻最多一个在途建连或一个计划中的重连。
//!
//! ## 交互契约（What）
//! - 首次建连失败返回 [`ConnectFailed`]；建连成功后的断线由 Watchdog 自动重连，
//!   直到调用 [`Connector::stop_reconnect`] 或达到 `max_reconnect_attempts`；
//! - 日志统一经 `tracing` 输出，字段 `remote`/`connection`/`code` 便于聚合。
//!
//! ## 风险提示（Trade-offs）
//! - 重连退避上限约 8 秒，不带抖动；大量客户端同时断线时可能同步重连；
//! - 派发线程数配置为 0 时业务回调运行在 IO 线程上，回调阻塞会拖慢整个连接器。

pub mod backoff;
pub mod config;
pub mod connection;
pub mod connector;
pub mod dispatch;
pub mod error;
pub mod group;
pub mod handlers;
pub mod lookup;
pub mod pipeline;
pub mod rejected;
pub mod timer;
pub mod watchdog;

pub use backoff::{MAX_BACKOFF_SHIFT, ReconnectPolicy, backoff_delay};
pub use config::{
    CONNECT_TIMEOUT, ConnectorConfig, DEFAULT_DISPATCH_QUEUE_CAPACITY, WRITER_IDLE_TIME_SECONDS,
    WaterMark,
};
pub use connection::{Connection, ConnectionId};
pub use connector::{Connector, PollingStrategy};
pub use dispatch::{DispatchExecutor, RejectedExecutionHandler, RejectedRunnable, Task, TaskQueue};
pub use error::{ConfigError, ConnectFailed, OperationKind, TransportError};
pub use group::ChannelGroup;
pub use handlers::{
    ApplicationHandler, FrameDecoderHandler, FrameEncoder, HeartbeatTrigger, IdleStateChecker,
    MessageHandler,
};
pub use lookup::{LookupService, ProviderAddress, StaticLookup, SubscribeInfo};
pub use pipeline::{
    ChainDependencies, ChannelHandler, HandlerContext, Message, Pipeline, UserEvent, build_chain,
};
pub use rejected::RejectedTaskPolicy;
pub use timer::{ManualTimer, TimeoutHandle, Timer, TimerTask, WheelTimer};
pub use watchdog::{ConnectionWatchdog, ReconnectTarget, WatchdogSnapshot, WatchdogState};
