//! # Connector：客户端建连与处理器链装配
//!
//! ## 核心意图（Why）
//! - 拥有 IO 工作线程池、套接字选项与处理器链模板；为每个远端地址维护一个
//!   [`ConnectionWatchdog`]，首次建连由调用方触发，之后的断线重连由 Watchdog 经
//!   [`ReconnectTarget`] 回调本连接器完成；
//! - 首次建连与重连共用同一段“装配处理器链 + 发起建连”的代码，且在同一把锁下执行，
//!   定时器线程与调用方线程不会把两条链挂到同一次建连上。
//!
//! ## 行为契约（What）
//! - 套接字选项：`SO_REUSEADDR`、`SO_KEEPALIVE`、`TCP_NODELAY` 开启；建连超时固定 3 秒；
//!   对端半关闭即视为断开；配置了水位时启用可写性追踪；
//! - 处理器链顺序固定，见 [`build_chain`]；
//! - 首次建连失败以 [`ConnectFailed`] 返回，不进入重连；
//! - `shutdown`/`Drop`：停止全部 Watchdog 的重连、关闭全部连接、后台停止运行时。
//!
//! ## 风险提示（Trade-offs）
//! - 连接器自带 Tokio 运行时，`connect` 返回的 Future 可在任意运行时上等待；
//! - 两种轮询策略都由 Tokio 承载，区别仅在 IO 事件轮询频率，见 [`PollingStrategy`]。

use bytes::BytesMut;
use dashmap::DashMap;
use parking_lot::Mutex;
use socket2::SockRef;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{CONNECT_TIMEOUT, ConnectorConfig, WaterMark};
use crate::connection::{Connection, ConnectionId};
use crate::dispatch::DispatchExecutor;
use crate::error::{
    CONFIGURE, CONNECT, ConnectFailed, READ, TransportError, WRITE, map_io_error,
};
use crate::group::ChannelGroup;
use crate::handlers::{ApplicationHandler, FrameEncoder, HeartbeatTrigger, MessageHandler};
use crate::lookup::{LookupService, SubscribeInfo};
use crate::pipeline::{ChainDependencies, Message, Pipeline, build_chain};
use crate::rejected::RejectedTaskPolicy;
use crate::timer::{Timer, WheelTimer};
use crate::watchdog::{ConnectionWatchdog, ReconnectTarget};

const READ_BUFFER_SIZE: usize = 8 * 1024;
const CONNECTOR_THREAD_NAME: &str = "spark.connector";
const TIMER_THREAD_NAME: &str = "spark.rpc.timer";
const DISPATCH_POOL_NAME: &str = "spark.rpc.dispatch";

/// IO 事件轮询策略，构造时选定，连接器生命周期内不变。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollingStrategy {
    /// 平台原生事件通知（epoll/kqueue），每执行一个任务即检查一次 IO 事件。
    Native,
    /// 可移植默认配置。
    Portable,
}

impl PollingStrategy {
    /// 当前平台是否具备原生事件通知。
    pub const fn native_available() -> bool {
        cfg!(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        ))
    }

    /// 按偏好与平台能力选择。
    pub fn select(prefer_native: bool) -> Self {
        if prefer_native && Self::native_available() {
            PollingStrategy::Native
        } else {
            PollingStrategy::Portable
        }
    }

    fn configure(self, builder: &mut Builder) {
        if self == PollingStrategy::Native {
            builder.event_interval(1);
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct SocketOptions {
    water_mark: Option<WaterMark>,
}

/// 建连模板：运行时句柄与套接字选项，停机后句柄被清空。
struct Bootstrap {
    handle: Option<Handle>,
    options: SocketOptions,
}

impl Bootstrap {
    fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>, TransportError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let handle = self.handle.as_ref().ok_or(TransportError::Shutdown)?;
        Ok(handle.spawn(future))
    }
}

/// RPC 客户端连接器。
pub struct Connector {
    inner: Arc<ConnectorInner>,
}

struct ConnectorInner {
    config: ConnectorConfig,
    strategy: PollingStrategy,
    timer: Arc<dyn Timer>,
    group: Arc<ChannelGroup>,
    watchdogs: DashMap<SocketAddr, Arc<ConnectionWatchdog>>,
    bootstrap: Mutex<Bootstrap>,
    runtime: Mutex<Option<Runtime>>,
    heartbeat: Arc<HeartbeatTrigger>,
    encoder: Arc<FrameEncoder>,
    application: Arc<ApplicationHandler>,
    executor: Option<Arc<DispatchExecutor>>,
    next_id: AtomicU64,
}

impl Connector {
    /// 以生产定时器构造。
    pub fn new(
        config: ConnectorConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, TransportError> {
        let timer: Arc<dyn Timer> = Arc::new(WheelTimer::new(TIMER_THREAD_NAME)?);
        Self::with_timer(config, handler, timer)
    }

    /// 注入定时器构造，测试可传入虚拟时间定时器。
    pub fn with_timer(
        config: ConnectorConfig,
        handler: Arc<dyn MessageHandler>,
        timer: Arc<dyn Timer>,
    ) -> Result<Self, TransportError> {
        config.validate()?;
        let strategy = PollingStrategy::select(config.prefer_native_polling);

        let mut builder = Builder::new_multi_thread();
        builder
            .worker_threads(config.worker_threads)
            .thread_name(CONNECTOR_THREAD_NAME)
            .enable_all();
        strategy.configure(&mut builder);
        let runtime = builder.build().map_err(|source| TransportError::Runtime {
            what: "connector runtime",
            source,
        })?;

        let executor = if config.dispatch_threads > 0 {
            Some(Arc::new(DispatchExecutor::new(
                DISPATCH_POOL_NAME,
                config.dispatch_threads,
                config.dispatch_queue_capacity,
                Arc::new(RejectedTaskPolicy::new(DISPATCH_POOL_NAME)),
            )?))
        } else {
            None
        };
        let application = Arc::new(ApplicationHandler::new(handler, executor.clone()));

        debug!(
            worker_threads = config.worker_threads,
            polling = ?strategy,
            dispatch_threads = config.dispatch_threads,
            "connector started"
        );

        Ok(Self {
            inner: Arc::new(ConnectorInner {
                bootstrap: Mutex::new(Bootstrap {
                    handle: Some(runtime.handle().clone()),
                    options: SocketOptions {
                        water_mark: config.water_mark(),
                    },
                }),
                runtime: Mutex::new(Some(runtime)),
                config,
                strategy,
                timer,
                group: Arc::new(ChannelGroup::new()),
                watchdogs: DashMap::new(),
                heartbeat: Arc::new(HeartbeatTrigger::new()),
                encoder: Arc::new(FrameEncoder::new()),
                application,
                executor,
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// 生效配置。
    pub fn config(&self) -> &ConnectorConfig {
        &self.inner.config
    }

    /// 选定的轮询策略。
    pub fn polling_strategy(&self) -> PollingStrategy {
        self.inner.strategy
    }

    /// 存活连接登记表。
    pub fn group(&self) -> &Arc<ChannelGroup> {
        &self.inner.group
    }

    /// `remote` 的存活连接。
    pub fn connections(&self, remote: SocketAddr) -> Vec<Connection> {
        self.inner.group.connections(remote)
    }

    /// `remote` 的 Watchdog（首次建连后存在）。
    pub fn watchdog(&self, remote: SocketAddr) -> Option<Arc<ConnectionWatchdog>> {
        self.inner
            .watchdogs
            .get(&remote)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn watchdog_for(&self, remote: SocketAddr) -> Arc<ConnectionWatchdog> {
        let inner: Weak<ConnectorInner> = Arc::downgrade(&self.inner);
        let target: Weak<dyn ReconnectTarget> = inner;
        let entry = self.inner.watchdogs.entry(remote).or_insert_with(|| {
            ConnectionWatchdog::new(
                remote,
                Arc::clone(&self.inner.timer),
                Arc::clone(&self.inner.group),
                target,
                self.inner.config.reconnect_policy(),
            )
        });
        Arc::clone(entry.value())
    }

    /// 建立到 `remote` 的连接，并对其开启断线重连。
    ///
    /// - 该远端已有存活连接时直接返回该连接，不再拨号；
    /// - 建连在独立任务中进行，调用方中途放弃等待不影响结果回报给 Watchdog。
    pub async fn connect(&self, remote: SocketAddr) -> Result<Connection, ConnectFailed> {
        let watchdog = self.watchdog_for(remote);
        watchdog.set_reconnect(true);
        if !watchdog.begin_connect() {
            if let Some(live) = self.live_connection(&watchdog) {
                return Ok(live);
            }
            return Err(ConnectFailed::new(
                remote.to_string(),
                TransportError::ConnectInProgress { remote },
            ));
        }
        let attempt = match self.inner.start_connect(&watchdog) {
            Ok(attempt) => attempt,
            Err(error) => {
                watchdog.abort_connect();
                return Err(ConnectFailed::new(remote.to_string(), error));
            }
        };
        match attempt.await {
            Ok(Ok(connection)) => Ok(connection),
            Ok(Err(error)) => Err(ConnectFailed::new(remote.to_string(), error)),
            Err(join) => {
                // 任务未运行完（运行时停机），失败回报没有发生。
                watchdog.abort_connect();
                Err(ConnectFailed::new(remote.to_string(), join_error(join)))
            }
        }
    }

    fn live_connection(&self, watchdog: &ConnectionWatchdog) -> Option<Connection> {
        let current = watchdog.snapshot().connection?;
        self.inner
            .group
            .connections(watchdog.remote_addr())
            .into_iter()
            .find(|connection| connection.id() == current && connection.is_active())
    }

    /// 通过服务发现查询提供者后建连。
    pub async fn connect_service(
        &self,
        lookup: &dyn LookupService,
        info: &SubscribeInfo,
    ) -> Result<Connection, ConnectFailed> {
        let provider = lookup.lookup(&info.service_name).ok_or_else(|| {
            ConnectFailed::new(
                info.service_name.clone(),
                TransportError::NoProvider {
                    service: info.service_name.clone(),
                },
            )
        })?;
        let remote = provider
            .resolve()
            .await
            .map_err(|error| ConnectFailed::new(provider.to_string(), error))?;
        debug!(
            service = %info.service_name,
            provider = %provider,
            remote = %remote,
            "provider resolved"
        );
        self.connect(remote).await
    }

    /// 停止对 `remote` 的重连；已建立的连接保持打开。
    pub fn stop_reconnect(&self, remote: SocketAddr) -> bool {
        match self.watchdog(remote) {
            Some(watchdog) => {
                watchdog.set_reconnect(false);
                true
            }
            None => false,
        }
    }

    /// 停止全部重连并关闭全部连接，返回关闭数量。
    pub fn close_all(&self) -> usize {
        self.inner.close_all()
    }

    /// 停止连接器。
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("strategy", &self.inner.strategy)
            .field("connections", &self.inner.group.len())
            .field("watchdogs", &self.inner.watchdogs.len())
            .finish()
    }
}

impl ConnectorInner {
    fn chain_dependencies(&self, watchdog: &Arc<ConnectionWatchdog>) -> ChainDependencies {
        ChainDependencies {
            watchdog: Arc::clone(watchdog),
            timer: Arc::clone(&self.timer),
            writer_idle: self.config.writer_idle(),
            max_frame_length: self.config.max_frame_length,
            heartbeat: Arc::clone(&self.heartbeat),
            encoder: Arc::clone(&self.encoder),
            application: Arc::clone(&self.application),
        }
    }

    fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn attempt(
        &self,
        bootstrap: &Bootstrap,
        watchdog: &Arc<ConnectionWatchdog>,
    ) -> impl Future<Output = Result<Connection, TransportError>> + Send + 'static {
        establish(
            watchdog.remote_addr(),
            self.next_connection_id(),
            bootstrap.options,
            self.chain_dependencies(watchdog),
            Arc::clone(&self.group),
        )
    }

    /// 在模板锁下装配处理器链并提交建连；失败在任务内回报给 Watchdog。
    fn start_connect(
        &self,
        watchdog: &Arc<ConnectionWatchdog>,
    ) -> Result<JoinHandle<Result<Connection, TransportError>>, TransportError> {
        let bootstrap = self.bootstrap.lock();
        let attempt = self.attempt(&bootstrap, watchdog);
        let reporter = Arc::clone(watchdog);
        bootstrap.spawn(async move {
            let outcome = attempt.await;
            if let Err(error) = &outcome {
                debug!(
                    remote = %reporter.remote_addr(),
                    code = error.code(),
                    error = %error,
                    "explicit connect failed"
                );
                reporter.abort_connect();
            }
            outcome
        })
    }

    fn close_all(&self) -> usize {
        for entry in self.watchdogs.iter() {
            entry.value().set_reconnect(false);
        }
        self.group.close_all()
    }

    fn shutdown(&self) {
        let closed = self.close_all();
        self.bootstrap.lock().handle = None;
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
            debug!(closed, "connector stopped");
        }
        if let Some(executor) = &self.executor {
            executor.shutdown();
        }
    }
}

impl ReconnectTarget for ConnectorInner {
    fn reconnect(&self, watchdog: Arc<ConnectionWatchdog>) {
        let remote = watchdog.remote_addr();
        let spawned = {
            let bootstrap = self.bootstrap.lock();
            let attempt = self.attempt(&bootstrap, &watchdog);
            let reporter = Arc::clone(&watchdog);
            bootstrap.spawn(async move {
                match attempt.await {
                    Ok(connection) => info!(
                        remote = %remote,
                        connection = %connection.id(),
                        "Reconnects with {}, succeed",
                        remote
                    ),
                    Err(error) => reporter.connect_failed(&error),
                }
            })
        };
        if let Err(error) = spawned {
            watchdog.connect_failed(&error);
        }
    }
}

impl Drop for ConnectorInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn join_error(join: tokio::task::JoinError) -> TransportError {
    if join.is_cancelled() {
        TransportError::Shutdown
    } else {
        TransportError::Runtime {
            what: "connect task",
            source: io::Error::other(join.to_string()),
        }
    }
}

async fn establish(
    remote: SocketAddr,
    id: ConnectionId,
    options: SocketOptions,
    deps: ChainDependencies,
    group: Arc<ChannelGroup>,
) -> Result<Connection, TransportError> {
    let socket = if remote.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|source| map_io_error(CONFIGURE, source))?;
    socket
        .set_reuseaddr(true)
        .map_err(|source| map_io_error(CONFIGURE, source))?;

    let stream = match tokio::time::timeout(CONNECT_TIMEOUT, socket.connect(remote)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => return Err(map_io_error(CONNECT, source)),
        Err(_) => {
            return Err(TransportError::Timeout {
                kind: CONNECT,
                after: CONNECT_TIMEOUT,
            });
        }
    };
    apply_stream_options(&stream).map_err(|source| map_io_error(CONFIGURE, source))?;
    let local = stream
        .local_addr()
        .map_err(|source| map_io_error(CONFIGURE, source))?;

    let (connection, outbound) = Connection::new(id, remote, local, options.water_mark);
    let pipeline = Pipeline::new(build_chain(&deps));
    debug!(
        remote = %remote,
        connection = %id,
        local = %local,
        chain = ?pipeline.names(),
        "transport established"
    );
    connection.install_pipeline(pipeline);

    let (reader, writer) = stream.into_split();
    tokio::spawn(write_loop(connection.clone(), writer, outbound));
    connection.fire_channel_active();
    tokio::spawn(read_loop(connection.clone(), reader, group));
    Ok(connection)
}

fn apply_stream_options(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    SockRef::from(stream).set_keepalive(true)
}

/// 等待关闭广播；`watch::Ref` 在返回前释放，调用方的 future 保持 `Send`。
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

async fn read_loop(connection: Connection, mut reader: OwnedReadHalf, group: Arc<ChannelGroup>) {
    let mut closed = connection.subscribe_closed();
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        if buf.capacity() - buf.len() < READ_BUFFER_SIZE / 2 {
            buf.reserve(READ_BUFFER_SIZE);
        }
        tokio::select! {
            _ = wait_closed(&mut closed) => break,
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => {
                    debug!(connection = %connection.id(), "peer closed the connection");
                    break;
                }
                Ok(_) => {
                    let chunk = buf.split().freeze();
                    connection.fire_channel_read(Message::Bytes(chunk));
                }
                Err(source) => {
                    connection.fire_exception_caught(map_io_error(READ, source));
                    break;
                }
            },
        }
    }
    connection.close();
    group.remove(connection.remote_addr(), connection.id());
    connection.fire_channel_inactive_once();
}

async fn write_loop(
    connection: Connection,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<bytes::Bytes>,
) {
    let mut closed = connection.subscribe_closed();
    loop {
        tokio::select! {
            biased;
            next = outbound.recv() => match next {
                Some(bytes) => {
                    let len = bytes.len();
                    if let Err(source) = writer.write_all(&bytes).await {
                        let error = map_io_error(WRITE, source);
                        warn!(
                            connection = %connection.id(),
                            code = error.code(),
                            error = %error,
                            "write failed, closing connection"
                        );
                        connection.close();
                        break;
                    }
                    connection.on_flushed(len);
                }
                None => break,
            },
            _ = wait_closed(&mut closed) => break,
        }
    }
    if let Err(source) = writer.shutdown().await {
        debug!(
            connection = %connection.id(),
            error = %source,
            "socket shutdown after writer exit failed"
        );
    }
    debug!(
        connection = %connection.id(),
        remote = %connection.remote_addr(),
        "connection writer stopped"
    );
}
