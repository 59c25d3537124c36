//! 已建立的客户端连接句柄。
//!
//! # 教案式说明
//! - **意图 (Why)**：业务侧、Watchdog、空闲检测都需要引用“同一条连接”，并在任意线程上写入；
//!   句柄本身只是 `Arc` 包装，克隆廉价，所有状态以原子量或通道共享；
//! - **逻辑 (How)**：
//!   - 出站字节进入无界 `mpsc` 队列，由连接器的写任务按序写入套接字，
//!     调用方线程从不直接触碰套接字；
//!   - 以“已入队未写出”的字节数对照 [`WaterMark`] 维护可写性，跨越水位时向管线广播
//!     `writability_changed`；
//!   - 关闭以 `watch` 通道广播，读写任务据此退出；
//! - **契约 (What)**：
//!   - [`Connection::close`] 幂等；关闭后的写入返回 [`TransportError::Closed`]；
//!   - `channel_inactive` 对每条连接只触发一次，由读任务在退出时发出。

use bytes::Bytes;
use spark_codec_rpc::Frame;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, watch};

use crate::config::WaterMark;
use crate::error::TransportError;
use crate::pipeline::{self, Message, Pipeline};

/// 连接标识，在一个连接器内单调分配。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// 由原始值构造。
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// 原始值。
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// 连接句柄。
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: ConnectionId,
    remote: SocketAddr,
    local: SocketAddr,
    outbound: mpsc::UnboundedSender<Bytes>,
    pending: AtomicUsize,
    writable: AtomicBool,
    water_mark: Option<WaterMark>,
    closed: watch::Sender<bool>,
    inactive_fired: AtomicBool,
    pipeline: OnceLock<Pipeline>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        remote: SocketAddr,
        local: SocketAddr,
        water_mark: Option<WaterMark>,
    ) -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (outbound, receiver) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let connection = Self {
            inner: Arc::new(ConnectionInner {
                id,
                remote,
                local,
                outbound,
                pending: AtomicUsize::new(0),
                writable: AtomicBool::new(true),
                water_mark,
                closed,
                inactive_fired: AtomicBool::new(false),
                pipeline: OnceLock::new(),
            }),
        };
        (connection, receiver)
    }

    /// 脱离套接字的连接，出站字节留在返回的接收端，供处理器单元测试观察。
    #[cfg(test)]
    pub(crate) fn detached(pipeline: Pipeline) -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        Self::detached_with_water_mark(pipeline, None)
    }

    #[cfg(test)]
    pub(crate) fn detached_with_water_mark(
        pipeline: Pipeline,
        water_mark: Option<WaterMark>,
    ) -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        use std::net::{IpAddr, Ipv4Addr};
        static NEXT: AtomicUsize = AtomicUsize::new(1);
        let id = ConnectionId::new(NEXT.fetch_add(1, Ordering::Relaxed) as u64);
        let remote = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 18090);
        let local = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000);
        let (connection, receiver) = Self::new(id, remote, local, water_mark);
        connection.install_pipeline(pipeline);
        (connection, receiver)
    }

    pub(crate) fn install_pipeline(&self, pipeline: Pipeline) {
        let _ = self.inner.pipeline.set(pipeline);
    }

    /// 连接标识。
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// 远端地址。
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote
    }

    /// 本地地址。
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local
    }

    /// 已安装的处理器链。
    pub fn pipeline(&self) -> Option<&Pipeline> {
        self.inner.pipeline.get()
    }

    /// 连接是否仍然打开。
    pub fn is_active(&self) -> bool {
        !*self.inner.closed.borrow()
    }

    /// 待写字节是否低于高水位。
    pub fn is_writable(&self) -> bool {
        self.inner.writable.load(Ordering::Acquire)
    }

    /// 已入队但尚未写入套接字的字节数。
    pub fn pending_write_bytes(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// 经完整管线写出一帧。
    pub fn write_frame(&self, frame: Frame) -> Result<(), TransportError> {
        self.write(Message::Frame(frame))
    }

    /// 经完整管线写出已编码字节。
    pub fn write_bytes(&self, bytes: Bytes) -> Result<(), TransportError> {
        self.write(Message::Bytes(bytes))
    }

    /// 从管线尾部开始写出。
    pub fn write(&self, msg: Message) -> Result<(), TransportError> {
        if !self.is_active() {
            return Err(TransportError::Closed);
        }
        let tail = self.pipeline().map_or(0, Pipeline::len);
        pipeline::invoke_write(self, tail, msg)
    }

    /// 关闭连接；返回 `true` 表示本次调用完成了关闭。
    pub fn close(&self) -> bool {
        self.inner.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    /// 等待连接关闭。
    pub async fn closed(&self) {
        let mut receiver = self.inner.closed.subscribe();
        let _ = receiver.wait_for(|closed| *closed).await;
    }

    pub(crate) fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.inner.closed.subscribe()
    }

    /// 管线首部之后的出口：只接受已编码字节。
    pub(crate) fn enqueue(&self, msg: Message) -> Result<(), TransportError> {
        let bytes = match msg {
            Message::Bytes(bytes) => bytes,
            Message::Frame(_) => return Err(TransportError::Unencoded),
        };
        if !self.is_active() {
            return Err(TransportError::Closed);
        }
        let len = bytes.len();
        // 先计数再入队，写任务的 `on_flushed` 不会先于计数发生。
        let pending = self.inner.pending.fetch_add(len, Ordering::AcqRel) + len;
        if self.inner.outbound.send(bytes).is_err() {
            self.inner.pending.fetch_sub(len, Ordering::AcqRel);
            return Err(TransportError::Closed);
        }
        if let Some(mark) = self.inner.water_mark
            && pending > mark.high
            && self.inner.writable.swap(false, Ordering::AcqRel)
        {
            pipeline::invoke_writability_changed(self, 0, false);
        }
        Ok(())
    }

    /// 写任务完成 `len` 字节后回调。
    pub(crate) fn on_flushed(&self, len: usize) {
        let previous = self
            .inner
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                Some(pending.saturating_sub(len))
            })
            .unwrap_or(0);
        let pending = previous.saturating_sub(len);
        if let Some(mark) = self.inner.water_mark
            && pending <= mark.low
            && !self.inner.writable.swap(true, Ordering::AcqRel)
        {
            pipeline::invoke_writability_changed(self, 0, true);
        }
    }

    pub(crate) fn fire_channel_active(&self) {
        pipeline::invoke_channel_active(self, 0);
    }

    pub(crate) fn fire_channel_read(&self, msg: Message) {
        pipeline::invoke_channel_read(self, 0, msg);
    }

    pub(crate) fn fire_exception_caught(&self, error: TransportError) {
        pipeline::invoke_exception_caught(self, 0, error);
    }

    /// 发出 `channel_inactive`，重复调用无效果。
    pub(crate) fn fire_channel_inactive_once(&self) -> bool {
        if self.inner.inactive_fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.close();
        pipeline::invoke_channel_inactive(self, 0);
        true
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("remote", &self.inner.remote)
            .field("local", &self.inner.local)
            .field("active", &self.is_active())
            .finish()
    }
}
