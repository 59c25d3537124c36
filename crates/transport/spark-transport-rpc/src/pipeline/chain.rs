use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::handlers::{
    ApplicationHandler, FrameDecoderHandler, FrameEncoder, HeartbeatTrigger, IdleStateChecker,
};
use crate::pipeline::ChannelHandler;
use crate::timer::Timer;
use crate::watchdog::ConnectionWatchdog;

/// 组装一条处理器链所需的依赖。
///
/// 无状态处理器（心跳触发、编码器、应用处理器）在连接间共享，
/// 有状态处理器（空闲检测、解码器）由 [`build_chain`] 为每条连接新建。
#[derive(Clone)]
pub struct ChainDependencies {
    /// 链首的 Watchdog。
    pub watchdog: Arc<ConnectionWatchdog>,
    /// 空闲检测使用的定时器。
    pub timer: Arc<dyn Timer>,
    /// 写空闲阈值。
    pub writer_idle: Duration,
    /// 单帧负载上限。
    pub max_frame_length: Option<u32>,
    /// 共享心跳触发器。
    pub heartbeat: Arc<HeartbeatTrigger>,
    /// 共享编码器。
    pub encoder: Arc<FrameEncoder>,
    /// 共享应用处理器。
    pub application: Arc<ApplicationHandler>,
}

impl fmt::Debug for ChainDependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainDependencies")
            .field("remote", &self.watchdog.remote_addr())
            .field("writer_idle", &self.writer_idle)
            .field("max_frame_length", &self.max_frame_length)
            .finish_non_exhaustive()
    }
}

/// 按固定顺序构造一条连接的处理器链。
///
/// 顺序：Watchdog → 空闲检测 → 心跳触发 → 解码器 → 编码器 → 应用处理器。
/// Watchdog 必须先于空闲与心跳逻辑观察到激活/断开，解码必须先于应用处理。
/// 该函数无副作用，首次建连与每次重连各调用一次。
pub fn build_chain(deps: &ChainDependencies) -> Vec<Arc<dyn ChannelHandler>> {
    vec![
        Arc::clone(&deps.watchdog) as Arc<dyn ChannelHandler>,
        IdleStateChecker::writer_only(Arc::clone(&deps.timer), deps.writer_idle),
        Arc::clone(&deps.heartbeat) as Arc<dyn ChannelHandler>,
        Arc::new(FrameDecoderHandler::new(deps.max_frame_length)),
        Arc::clone(&deps.encoder) as Arc<dyn ChannelHandler>,
        Arc::clone(&deps.application) as Arc<dyn ChannelHandler>,
    ]
}
