use spark_codec_rpc::{Frame, MessageKind};
use std::sync::Arc;
use tracing::{trace, warn};

use crate::connection::Connection;
use crate::dispatch::{DispatchExecutor, Task};
use crate::error::TransportError;
use crate::pipeline::{ChannelHandler, HandlerContext, Message};

/// 业务侧的帧处理回调。
///
/// 回调在派发线程上执行；派发线程数为 0 时在 IO 线程上执行，此时不得阻塞。
/// 派发线程多于一个时，同一连接的帧可能乱序到达 [`MessageHandler::on_frame`]，
/// 依赖顺序的实现应把派发线程数配为 0 或 1。
pub trait MessageHandler: Send + Sync + 'static {
    /// 收到一帧非心跳消息。
    fn on_frame(&self, connection: &Connection, frame: Frame);

    /// 连接激活。
    fn on_active(&self, _connection: &Connection) {}

    /// 连接断开。
    fn on_inactive(&self, _connection: &Connection) {}
}

/// 管线尾部：把完整帧交给 [`MessageHandler`]。
///
/// # 教案式说明
/// - **意图 (Why)**：应用处理与 IO 解耦；心跳是链路层信号，不进入业务；
/// - **契约 (What)**：
///   - 心跳帧在此被吞掉；
///   - 配置了派发线程池时每帧包装为 [`Task::Plain`] 提交，饱和由拒绝策略处理；
///     单线程池按提交顺序执行，多线程池不保证同一连接内的顺序；
///   - 未配置时在当前线程直接回调，帧顺序与到达顺序一致；
///   - 未被前序处理器处理的异常在此记录，致命异常关闭连接。
pub struct ApplicationHandler {
    handler: Arc<dyn MessageHandler>,
    executor: Option<Arc<DispatchExecutor>>,
}

impl ApplicationHandler {
    /// 构造；`executor = None` 表示在 IO 线程上交付。
    pub fn new(handler: Arc<dyn MessageHandler>, executor: Option<Arc<DispatchExecutor>>) -> Self {
        Self { handler, executor }
    }

    fn deliver(&self, connection: &Connection, frame: Frame) {
        match &self.executor {
            Some(executor) => {
                let handler = Arc::clone(&self.handler);
                let connection = connection.clone();
                executor.execute(Task::plain(move || handler.on_frame(&connection, frame)));
            }
            None => self.handler.on_frame(connection, frame),
        }
    }
}

impl ChannelHandler for ApplicationHandler {
    fn name(&self) -> &'static str {
        "application"
    }

    fn channel_active(&self, ctx: &HandlerContext<'_>) {
        self.handler.on_active(ctx.connection());
        ctx.fire_channel_active();
    }

    fn channel_inactive(&self, ctx: &HandlerContext<'_>) {
        self.handler.on_inactive(ctx.connection());
        ctx.fire_channel_inactive();
    }

    fn channel_read(&self, ctx: &HandlerContext<'_>, msg: Message) {
        match msg {
            Message::Frame(frame) if frame.header().kind() == MessageKind::HEARTBEAT => {
                trace!(connection = %ctx.connection().id(), "heartbeat received");
            }
            Message::Frame(frame) => self.deliver(ctx.connection(), frame),
            other => ctx.fire_channel_read(other),
        }
    }

    fn exception_caught(&self, ctx: &HandlerContext<'_>, error: TransportError) {
        let connection = ctx.connection();
        warn!(
            connection = %connection.id(),
            remote = %connection.remote_addr(),
            code = error.code(),
            error = %error,
            "connection error"
        );
        if error.is_fatal_for_connection() {
            connection.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{RejectedExecutionHandler, TaskQueue};
    use crate::pipeline::Pipeline;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use spark_codec_rpc::CodecError;
    use std::sync::mpsc;
    use std::time::Duration;

    #[derive(Default)]
    struct Recording {
        frames: Mutex<Vec<u64>>,
        activations: Mutex<usize>,
    }

    impl MessageHandler for Recording {
        fn on_frame(&self, _connection: &Connection, frame: Frame) {
            self.frames.lock().push(frame.header().id());
        }

        fn on_active(&self, _connection: &Connection) {
            *self.activations.lock() += 1;
        }
    }

    #[test]
    fn heartbeats_are_consumed_inline_frames_delivered() {
        let recording = Arc::new(Recording::default());
        let app = ApplicationHandler::new(Arc::clone(&recording) as Arc<dyn MessageHandler>, None);
        let (connection, _outbound) = Connection::detached(Pipeline::new(vec![Arc::new(app)]));
        connection.fire_channel_active();

        let heartbeat = Frame::new(MessageKind::HEARTBEAT, 0, 0, Bytes::new()).expect("frame");
        let request = Frame::new(MessageKind::RESPONSE, 0, 42, Bytes::new()).expect("frame");
        connection.fire_channel_read(Message::Frame(heartbeat));
        connection.fire_channel_read(Message::Frame(request));

        assert_eq!(*recording.frames.lock(), vec![42]);
        assert_eq!(*recording.activations.lock(), 1);
    }

    #[test]
    fn codec_errors_close_the_connection() {
        let app = ApplicationHandler::new(Arc::new(Recording::default()), None);
        let (connection, _outbound) = Connection::detached(Pipeline::new(vec![Arc::new(app)]));
        connection.fire_exception_caught(TransportError::Codec(CodecError::BadMagic { found: 0 }));
        assert!(!connection.is_active());
    }

    struct Forward(mpsc::Sender<(u64, Option<String>)>);

    impl MessageHandler for Forward {
        fn on_frame(&self, _connection: &Connection, frame: Frame) {
            let name = std::thread::current().name().map(str::to_owned);
            let _ = self.0.send((frame.header().id(), name));
        }
    }

    struct Ignore;

    impl RejectedExecutionHandler for Ignore {
        fn rejected(&self, _task: Task, _queue: &TaskQueue) {}
    }

    #[test]
    fn frames_are_dispatched_to_the_pool() {
        let (tx, rx) = mpsc::channel();
        let executor = Arc::new(
            DispatchExecutor::new("spark.rpc.app-test", 1, 16, Arc::new(Ignore)).expect("pool"),
        );
        let app = ApplicationHandler::new(Arc::new(Forward(tx)), Some(executor));
        let (connection, _outbound) = Connection::detached(Pipeline::new(vec![Arc::new(app)]));

        let frame = Frame::new(MessageKind::REQUEST, 0, 9, Bytes::new()).expect("frame");
        connection.fire_channel_read(Message::Frame(frame));
        let (id, thread) = rx.recv_timeout(Duration::from_secs(5)).expect("dispatched");
        assert_eq!(id, 9);
        assert_eq!(thread.as_deref(), Some("spark.rpc.app-test-0"));
    }

    #[test]
    fn single_dispatch_thread_keeps_wire_order() {
        let (tx, rx) = mpsc::channel();
        let executor = Arc::new(
            DispatchExecutor::new("spark.rpc.app-order", 1, 64, Arc::new(Ignore)).expect("pool"),
        );
        let app = ApplicationHandler::new(Arc::new(Forward(tx)), Some(executor));
        let (connection, _outbound) = Connection::detached(Pipeline::new(vec![Arc::new(app)]));

        for id in 1..=50u64 {
            let frame = Frame::new(MessageKind::RESPONSE, 0, id, Bytes::new()).expect("frame");
            connection.fire_channel_read(Message::Frame(frame));
        }
        let ids: Vec<u64> = (0..50)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("dispatched").0)
            .collect();
        assert_eq!(ids, (1..=50).collect::<Vec<_>>());
    }
}
