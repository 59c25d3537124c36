//! # ConnectionWatchdog：断线重连状态机
//!
//! ## 核心意图（Why）
//! - 长连接客户端必须在服务端重启、网络抖动后自动恢复；Watchdog 作为管线首个处理器，
//!   最先观察到连接激活与断开，并据此调度带指数退避的重连；
//! - 建连失败与“连上后又断开”走同一条退避路径，调用方无需区分两种失败。
//!
//! ## 状态机（What）
//! ```text
//!              connect()                 channel_active
//! DISCONNECTED ─────────▶ CONNECTING ─────────────────▶ CONNECTED
//!      ▲                    ▲    │ connect failed            │ channel_inactive
//!      │ set_reconnect(false)│    ▼                           ▼
//!      └──────────────── RECONNECT_SCHEDULED ◀───────────────┘
//!                         (timer fires → CONNECTING)
//! ```
//! - 激活：计数清零，连接登记到 [`ChannelGroup`]；
//! - 断开/建连失败：若允许重连，`attempts` 自增（封顶 12）并在 `2 << attempts` 毫秒后重连；
//! - 定时器触发时再次检查“仍允许重连且仍处于等待态”，之后才交给 [`ReconnectTarget`] 建连；
//! - 任意时刻关闭重连：取消在途定时器，状态回到 `DISCONNECTED`。
//!
//! ## 并发约束（How）
//! - 所有状态迁移在同一把 `parking_lot::Mutex` 下完成；同一时刻至多一次建连在途；
//! - 只接受当前连接的断开事件，旧连接迟到的 `channel_inactive` 被忽略；
//! - 对连接器只持有 `Weak` 引用，连接器析构后定时器触发的重连自然失效。
//!
//! ## 风险提示（Trade-offs）
//! - 默认不限制重连次数；通过 [`ReconnectPolicy`] 设置上限后，超限进入
//!   `DISCONNECTED` 并在快照中标记 `gave_up`。

use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backoff::{BackoffState, ReconnectPolicy};
use crate::connection::ConnectionId;
use crate::error::TransportError;
use crate::group::ChannelGroup;
use crate::pipeline::{ChannelHandler, HandlerContext};
use crate::timer::{TimeoutHandle, Timer};

/// Watchdog 状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WatchdogState {
    /// 未连接且没有计划中的重连。
    Disconnected,
    /// 建连在途。
    Connecting,
    /// 连接已激活。
    Connected,
    /// 已调度重连，等待定时器。
    ReconnectScheduled,
}

/// 重连入口。
///
/// 实现方负责重建处理器链并对 [`ConnectionWatchdog::remote_addr`] 发起建连；
/// 建连结果须通过 [`ConnectionWatchdog::connect_failed`] 或连接激活回报。
/// 该方法在定时器线程上调用，不得阻塞。
pub trait ReconnectTarget: Send + Sync + 'static {
    /// 发起一次重连。
    fn reconnect(&self, watchdog: Arc<ConnectionWatchdog>);
}

/// 某一时刻的状态快照。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchdogSnapshot {
    /// 当前状态。
    pub state: WatchdogState,
    /// 退避计数（封顶 12）。
    pub attempts: u32,
    /// 自上次成功以来的连续失败次数。
    pub consecutive_failures: u32,
    /// 是否因超过重连上限而放弃。
    pub gave_up: bool,
    /// 是否允许重连。
    pub reconnect: bool,
    /// 计划中的重连延迟。
    pub scheduled_delay: Option<Duration>,
    /// 当前连接。
    pub connection: Option<ConnectionId>,
}

struct Supervisor {
    state: WatchdogState,
    backoff: BackoffState,
    pending: Option<TimeoutHandle>,
    current: Option<ConnectionId>,
    gave_up: bool,
    resume_on_failure: bool,
}

/// 单个远端地址的重连监督者。
pub struct ConnectionWatchdog {
    remote: SocketAddr,
    timer: Arc<dyn Timer>,
    group: Arc<ChannelGroup>,
    target: Weak<dyn ReconnectTarget>,
    policy: ReconnectPolicy,
    reconnect: AtomicBool,
    supervisor: Mutex<Supervisor>,
    this: Weak<ConnectionWatchdog>,
}

impl ConnectionWatchdog {
    /// 创建处于 `DISCONNECTED` 且允许重连的 Watchdog。
    pub fn new(
        remote: SocketAddr,
        timer: Arc<dyn Timer>,
        group: Arc<ChannelGroup>,
        target: Weak<dyn ReconnectTarget>,
        policy: ReconnectPolicy,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            remote,
            timer,
            group,
            target,
            policy,
            reconnect: AtomicBool::new(true),
            supervisor: Mutex::new(Supervisor {
                state: WatchdogState::Disconnected,
                backoff: BackoffState::default(),
                pending: None,
                current: None,
                gave_up: false,
                resume_on_failure: false,
            }),
            this: Weak::clone(this),
        })
    }

    /// 被监督的远端地址。
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// 当前状态。
    pub fn state(&self) -> WatchdogState {
        self.supervisor.lock().state
    }

    /// 是否允许重连。
    pub fn is_reconnect(&self) -> bool {
        self.reconnect.load(Ordering::Acquire)
    }

    /// 开启或关闭重连。
    ///
    /// 关闭时取消计划中的重连并回到 `DISCONNECTED`；已建立的连接不受影响，
    /// 但它断开后不会再被重连。
    pub fn set_reconnect(&self, reconnect: bool) {
        self.reconnect.store(reconnect, Ordering::Release);
        if reconnect {
            return;
        }
        let mut supervisor = self.supervisor.lock();
        if let Some(pending) = supervisor.pending.take() {
            pending.cancel();
        }
        supervisor.state = WatchdogState::Disconnected;
        debug!(remote = %self.remote, "reconnect disabled");
    }

    /// 状态快照。
    pub fn snapshot(&self) -> WatchdogSnapshot {
        let supervisor = self.supervisor.lock();
        WatchdogSnapshot {
            state: supervisor.state,
            attempts: supervisor.backoff.attempts(),
            consecutive_failures: supervisor.backoff.consecutive_failures(),
            gave_up: supervisor.gave_up,
            reconnect: self.is_reconnect(),
            scheduled_delay: supervisor.pending.as_ref().map(TimeoutHandle::delay),
            connection: supervisor.current,
        }
    }

    /// 调用方发起的显式建连；已有建连在途或连接存活时返回 `false`。
    ///
    /// 计划中的重连会被取消，由本次建连取而代之；本次失败时退避从原处继续。
    pub fn begin_connect(&self) -> bool {
        let mut supervisor = self.supervisor.lock();
        if matches!(
            supervisor.state,
            WatchdogState::Connecting | WatchdogState::Connected
        ) {
            return false;
        }
        supervisor.resume_on_failure = supervisor.state == WatchdogState::ReconnectScheduled;
        if let Some(pending) = supervisor.pending.take() {
            pending.cancel();
        }
        supervisor.state = WatchdogState::Connecting;
        supervisor.gave_up = false;
        true
    }

    /// 显式建连失败。
    ///
    /// 取代了计划中重连的建连按重连失败处理，继续退避；
    /// 否则回到 `DISCONNECTED`，不进入重连。
    pub fn abort_connect(&self) {
        let mut supervisor = self.supervisor.lock();
        if supervisor.state != WatchdogState::Connecting {
            return;
        }
        if std::mem::take(&mut supervisor.resume_on_failure) {
            self.schedule_locked(&mut supervisor);
        } else {
            supervisor.state = WatchdogState::Disconnected;
        }
    }

    /// 重连建立传输失败，与断开走同一退避路径。
    pub fn connect_failed(&self, error: &TransportError) {
        let mut supervisor = self.supervisor.lock();
        if supervisor.state != WatchdogState::Connecting {
            debug!(
                remote = %self.remote,
                state = ?supervisor.state,
                error = %error,
                "ignored connect failure outside of an attempt"
            );
            return;
        }
        warn!(
            remote = %self.remote,
            code = error.code(),
            error = %error,
            "Reconnects with {}, failed",
            self.remote
        );
        self.schedule_locked(&mut supervisor);
    }

    fn schedule_locked(&self, supervisor: &mut Supervisor) {
        if !self.is_reconnect() {
            supervisor.state = WatchdogState::Disconnected;
            return;
        }
        if !self.policy.allows(supervisor.backoff.consecutive_failures()) {
            supervisor.state = WatchdogState::Disconnected;
            supervisor.gave_up = true;
            warn!(
                remote = %self.remote,
                failures = supervisor.backoff.consecutive_failures(),
                max_attempts = ?self.policy.max_attempts(),
                "gave up reconnecting to {}",
                self.remote
            );
            return;
        }
        let delay = supervisor.backoff.on_failure();
        let attempts = supervisor.backoff.attempts();
        let watchdog = Weak::clone(&self.this);
        let handle = self.timer.new_timeout(
            delay,
            Box::new(move || {
                if let Some(watchdog) = watchdog.upgrade() {
                    watchdog.fire_reconnect();
                }
            }),
        );
        supervisor.pending = Some(handle);
        supervisor.state = WatchdogState::ReconnectScheduled;
        info!(
            remote = %self.remote,
            delay_ms = delay.as_millis() as u64,
            attempts,
            "reconnect to {} scheduled",
            self.remote
        );
    }

    fn fire_reconnect(self: Arc<Self>) {
        {
            let mut supervisor = self.supervisor.lock();
            supervisor.pending = None;
            if !self.is_reconnect() || supervisor.state != WatchdogState::ReconnectScheduled {
                debug!(
                    remote = %self.remote,
                    state = ?supervisor.state,
                    "stale reconnect timer ignored"
                );
                return;
            }
            supervisor.state = WatchdogState::Connecting;
        }
        match self.target.upgrade() {
            Some(target) => target.reconnect(Arc::clone(&self)),
            None => {
                debug!(remote = %self.remote, "connector dropped, reconnect abandoned");
                self.supervisor.lock().state = WatchdogState::Disconnected;
            }
        }
    }
}

impl ChannelHandler for ConnectionWatchdog {
    fn name(&self) -> &'static str {
        "connection-watchdog"
    }

    fn channel_active(&self, ctx: &HandlerContext<'_>) {
        let connection = ctx.connection();
        {
            let mut supervisor = self.supervisor.lock();
            supervisor.backoff.reset();
            supervisor.gave_up = false;
            supervisor.resume_on_failure = false;
            supervisor.current = Some(connection.id());
            if let Some(pending) = supervisor.pending.take() {
                pending.cancel();
            }
            supervisor.state = WatchdogState::Connected;
        }
        self.group.add(self.remote, connection.clone());
        info!(
            remote = %self.remote,
            connection = %connection.id(),
            local = %connection.local_addr(),
            "Connects with {}.",
            self.remote
        );
        ctx.fire_channel_active();
    }

    fn channel_inactive(&self, ctx: &HandlerContext<'_>) {
        let connection = ctx.connection();
        {
            let mut supervisor = self.supervisor.lock();
            if supervisor.current == Some(connection.id()) {
                supervisor.current = None;
                let reconnect = self.is_reconnect();
                warn!(
                    remote = %self.remote,
                    connection = %connection.id(),
                    reconnect,
                    "Disconnects with {}, reconnect: {}",
                    self.remote,
                    reconnect
                );
                match supervisor.state {
                    WatchdogState::Connected => self.schedule_locked(&mut supervisor),
                    // 重复或迟到的断开事件不再叠加退避。
                    WatchdogState::ReconnectScheduled
                    | WatchdogState::Connecting
                    | WatchdogState::Disconnected => {}
                }
            } else {
                debug!(
                    remote = %self.remote,
                    connection = %connection.id(),
                    "inactive event from a superseded connection"
                );
            }
        }
        ctx.fire_channel_inactive();
    }
}

impl fmt::Debug for ConnectionWatchdog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionWatchdog")
            .field("remote", &self.remote)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
