//! 每条连接上的处理器链。
//!
//! # 教案式说明
//! - **意图 (Why)**：连接生命周期事件（激活、断开、读到字节、空闲、异常）与写出路径都需要经过
//!   一串职责单一的处理器：Watchdog 关心断线、空闲检测关心写入时间、解码器关心帧边界、
//!   应用处理器关心完整帧。借鉴 Netty `ChannelPipeline`，入站事件自首向尾传播，出站写自尾向首
//!   传播，最终到达套接字；
//! - **逻辑 (How)**：
//!   - [`Pipeline`] 只保存有序的处理器列表，不持有连接，避免“连接 ↔ 管线”的引用环；
//!   - [`HandlerContext`] 是“连接 + 当前下标”的临时视图，`fire_*` 把事件交给下一个处理器，
//!     `write` 把消息交给上一个处理器，越过首部时写入连接的发送队列；
//!   - 事件越过尾部时由管线兜底：未处理的消息记录后丢弃，未处理的致命异常关闭连接；
//! - **契约 (What)**：
//!   - 处理器方法在 IO 线程或定时器线程上同步调用，不得阻塞；
//!   - 同一连接的入站事件按到达顺序串行传播；
//! - **权衡 (Trade-offs)**：处理器以 `Arc<dyn ChannelHandler>` 存放，无状态处理器可在连接间共享，
//!   有状态处理器（空闲检测、帧解码）需为每条连接单独构造，参见 [`build_chain`]。

mod chain;

pub use chain::{ChainDependencies, build_chain};

use bytes::Bytes;
use spark_codec_rpc::Frame;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::connection::Connection;
use crate::error::TransportError;

/// 管线中流动的消息。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// 原始字节：入站为套接字读到的数据，出站为即将写出的编码结果。
    Bytes(Bytes),
    /// 完整的一帧。
    Frame(Frame),
}

/// 处理器之间传递的带外事件。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserEvent {
    /// 超过阈值未读到任何数据。
    ReaderIdle {
        /// 生效的阈值。
        idle_for: Duration,
    },
    /// 超过阈值未写出任何数据。
    WriterIdle {
        /// 生效的阈值。
        idle_for: Duration,
    },
}

/// 连接管线上的处理器。
///
/// 所有方法默认把事件原样传给相邻处理器，实现方只需覆盖关心的事件。
pub trait ChannelHandler: Send + Sync + 'static {
    /// 处理器名称，用于日志与链路断言。
    fn name(&self) -> &'static str;

    /// 连接建立。
    fn channel_active(&self, ctx: &HandlerContext<'_>) {
        ctx.fire_channel_active();
    }

    /// 连接断开，每条连接恰好一次。
    fn channel_inactive(&self, ctx: &HandlerContext<'_>) {
        ctx.fire_channel_inactive();
    }

    /// 入站消息。
    fn channel_read(&self, ctx: &HandlerContext<'_>, msg: Message) {
        ctx.fire_channel_read(msg);
    }

    /// 带外事件。
    fn user_event(&self, ctx: &HandlerContext<'_>, event: UserEvent) {
        ctx.fire_user_event(event);
    }

    /// 可写性变化。
    fn writability_changed(&self, ctx: &HandlerContext<'_>, writable: bool) {
        ctx.fire_writability_changed(writable);
    }

    /// 入站处理中出现的错误。
    fn exception_caught(&self, ctx: &HandlerContext<'_>, error: TransportError) {
        ctx.fire_exception_caught(error);
    }

    /// 出站写。
    fn write(&self, ctx: &HandlerContext<'_>, msg: Message) -> Result<(), TransportError> {
        ctx.write(msg)
    }
}

/// 有序处理器列表。
pub struct Pipeline {
    handlers: Vec<Arc<dyn ChannelHandler>>,
}

impl Pipeline {
    /// 以首到尾的顺序构造。
    pub fn new(handlers: Vec<Arc<dyn ChannelHandler>>) -> Self {
        Self { handlers }
    }

    /// 处理器名称，首到尾。
    pub fn names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|handler| handler.name()).collect()
    }

    /// 处理器数量。
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// 是否为空。
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn get(&self, index: usize) -> Option<&Arc<dyn ChannelHandler>> {
        self.handlers.get(index)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// 处理器在管线中的位置视图。
pub struct HandlerContext<'a> {
    connection: &'a Connection,
    index: usize,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(connection: &'a Connection, index: usize) -> Self {
        Self { connection, index }
    }

    /// 所属连接。
    pub fn connection(&self) -> &'a Connection {
        self.connection
    }

    /// 当前处理器下标。
    pub fn index(&self) -> usize {
        self.index
    }

    /// 把激活事件交给下一个处理器。
    pub fn fire_channel_active(&self) {
        invoke_channel_active(self.connection, self.index + 1);
    }

    /// 把断开事件交给下一个处理器。
    pub fn fire_channel_inactive(&self) {
        invoke_channel_inactive(self.connection, self.index + 1);
    }

    /// 把入站消息交给下一个处理器。
    pub fn fire_channel_read(&self, msg: Message) {
        invoke_channel_read(self.connection, self.index + 1, msg);
    }

    /// 把带外事件交给下一个处理器。
    pub fn fire_user_event(&self, event: UserEvent) {
        invoke_user_event(self.connection, self.index + 1, event);
    }

    /// 把可写性变化交给下一个处理器。
    pub fn fire_writability_changed(&self, writable: bool) {
        invoke_writability_changed(self.connection, self.index + 1, writable);
    }

    /// 把异常交给下一个处理器。
    pub fn fire_exception_caught(&self, error: TransportError) {
        invoke_exception_caught(self.connection, self.index + 1, error);
    }

    /// 把出站消息交给上一个处理器，越过首部后进入发送队列。
    pub fn write(&self, msg: Message) -> Result<(), TransportError> {
        invoke_write(self.connection, self.index, msg)
    }

    /// 关闭所属连接。
    pub fn close(&self) {
        self.connection.close();
    }
}

fn handler_at(connection: &Connection, index: usize) -> Option<&Arc<dyn ChannelHandler>> {
    connection.pipeline().and_then(|pipeline| pipeline.get(index))
}

pub(crate) fn invoke_channel_active(connection: &Connection, index: usize) {
    if let Some(handler) = handler_at(connection, index) {
        handler.channel_active(&HandlerContext::new(connection, index));
    }
}

pub(crate) fn invoke_channel_inactive(connection: &Connection, index: usize) {
    if let Some(handler) = handler_at(connection, index) {
        handler.channel_inactive(&HandlerContext::new(connection, index));
    }
}

pub(crate) fn invoke_channel_read(connection: &Connection, index: usize, msg: Message) {
    match handler_at(connection, index) {
        Some(handler) => handler.channel_read(&HandlerContext::new(connection, index), msg),
        None => debug!(
            connection = %connection.id(),
            remote = %connection.remote_addr(),
            "discarded inbound message that reached the tail of the pipeline"
        ),
    }
}

pub(crate) fn invoke_user_event(connection: &Connection, index: usize, event: UserEvent) {
    match handler_at(connection, index) {
        Some(handler) => handler.user_event(&HandlerContext::new(connection, index), event),
        None => trace!(connection = %connection.id(), ?event, "unhandled user event"),
    }
}

pub(crate) fn invoke_writability_changed(connection: &Connection, index: usize, writable: bool) {
    if let Some(handler) = handler_at(connection, index) {
        handler.writability_changed(&HandlerContext::new(connection, index), writable);
    }
}

pub(crate) fn invoke_exception_caught(
    connection: &Connection,
    index: usize,
    error: TransportError,
) {
    match handler_at(connection, index) {
        Some(handler) => handler.exception_caught(&HandlerContext::new(connection, index), error),
        None => {
            warn!(
                connection = %connection.id(),
                remote = %connection.remote_addr(),
                code = error.code(),
                error = %error,
                "unhandled exception reached the tail of the pipeline"
            );
            if error.is_fatal_for_connection() {
                connection.close();
            }
        }
    }
}

/// `upper` 为调用方下标；写入交给 `upper - 1`，`upper == 0` 时进入发送队列。
pub(crate) fn invoke_write(
    connection: &Connection,
    upper: usize,
    msg: Message,
) -> Result<(), TransportError> {
    if upper == 0 {
        return connection.enqueue(msg);
    }
    let index = upper - 1;
    match handler_at(connection, index) {
        Some(handler) => handler.write(&HandlerContext::new(connection, index), msg),
        None => connection.enqueue(msg),
    }
}
