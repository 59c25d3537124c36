//! 空闲检测与心跳触发。
//!
//! # 教案式说明
//! - **意图 (Why)**：NAT 与负载均衡会回收长时间无流量的连接，对端也可能静默消失；
//!   客户端在写空闲时主动发送心跳，既保活链路，也让断线尽早以写失败的形式暴露；
//! - **逻辑 (How)**：
//!   - [`IdleStateChecker`] 每条连接一个实例，连接激活后登记定时任务；任务触发时比较
//!     “距上次写入/读取”的时长，超过阈值则向后续处理器发出 [`UserEvent`]，否则按剩余时长重排；
//!   - [`HeartbeatTrigger`] 无状态、连接间共享，收到写空闲事件后写出共享心跳；
//!     心跳经由空闲检测器的写路径，因此会刷新“上次写入”时间；
//! - **契约 (What)**：连接断开后取消全部定时任务，不再发出事件。

use parking_lot::Mutex;
use spark_codec_rpc::heartbeat_content;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::connection::Connection;
use crate::error::TransportError;
use crate::pipeline::{ChannelHandler, HandlerContext, Message, UserEvent};
use crate::timer::{TimeoutHandle, Timer};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum IdleKind {
    Reader,
    Writer,
}

struct IdleState {
    last_read: Instant,
    last_write: Instant,
    reader_timeout: Option<TimeoutHandle>,
    writer_timeout: Option<TimeoutHandle>,
    closed: bool,
}

/// 读/写空闲检测器。
pub struct IdleStateChecker {
    timer: Arc<dyn Timer>,
    reader_idle: Option<Duration>,
    writer_idle: Option<Duration>,
    state: Mutex<IdleState>,
    this: Weak<IdleStateChecker>,
}

impl IdleStateChecker {
    /// 构造检测器；阈值为 `None` 的方向不检测。
    pub fn new(
        timer: Arc<dyn Timer>,
        reader_idle: Option<Duration>,
        writer_idle: Option<Duration>,
    ) -> Arc<Self> {
        let now = timer.now();
        Arc::new_cyclic(|this| Self {
            timer,
            reader_idle: reader_idle.filter(|d| !d.is_zero()),
            writer_idle: writer_idle.filter(|d| !d.is_zero()),
            state: Mutex::new(IdleState {
                last_read: now,
                last_write: now,
                reader_timeout: None,
                writer_timeout: None,
                closed: false,
            }),
            this: Weak::clone(this),
        })
    }

    /// 只检测写空闲。
    pub fn writer_only(timer: Arc<dyn Timer>, writer_idle: Duration) -> Arc<Self> {
        Self::new(timer, None, Some(writer_idle))
    }

    fn threshold(&self, kind: IdleKind) -> Option<Duration> {
        match kind {
            IdleKind::Reader => self.reader_idle,
            IdleKind::Writer => self.writer_idle,
        }
    }

    fn schedule(&self, kind: IdleKind, delay: Duration, connection: &Connection, index: usize) {
        let checker = Weak::clone(&self.this);
        let connection = connection.clone();
        let handle = self.timer.new_timeout(
            delay,
            Box::new(move || {
                if let Some(checker) = checker.upgrade() {
                    checker.on_timeout(kind, &connection, index);
                }
            }),
        );
        let mut state = self.state.lock();
        if state.closed {
            handle.cancel();
            return;
        }
        let slot = match kind {
            IdleKind::Reader => &mut state.reader_timeout,
            IdleKind::Writer => &mut state.writer_timeout,
        };
        if let Some(previous) = slot.replace(handle) {
            previous.cancel();
        }
    }

    fn on_timeout(&self, kind: IdleKind, connection: &Connection, index: usize) {
        let Some(threshold) = self.threshold(kind) else {
            return;
        };
        let remaining = {
            let state = self.state.lock();
            if state.closed || !connection.is_active() {
                return;
            }
            let last = match kind {
                IdleKind::Reader => state.last_read,
                IdleKind::Writer => state.last_write,
            };
            let idle_for = self.timer.now().saturating_duration_since(last);
            threshold.checked_sub(idle_for).filter(|d| !d.is_zero())
        };

        match remaining {
            Some(remaining) => self.schedule(kind, remaining, connection, index),
            None => {
                self.schedule(kind, threshold, connection, index);
                let event = match kind {
                    IdleKind::Reader => UserEvent::ReaderIdle {
                        idle_for: threshold,
                    },
                    IdleKind::Writer => UserEvent::WriterIdle {
                        idle_for: threshold,
                    },
                };
                trace!(connection = %connection.id(), ?event, "idle state detected");
                HandlerContext::new(connection, index).fire_user_event(event);
            }
        }
    }

    fn cancel_all(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        for handle in [state.reader_timeout.take(), state.writer_timeout.take()]
            .into_iter()
            .flatten()
        {
            handle.cancel();
        }
    }
}

impl ChannelHandler for IdleStateChecker {
    fn name(&self) -> &'static str {
        "idle-state-checker"
    }

    fn channel_active(&self, ctx: &HandlerContext<'_>) {
        {
            let now = self.timer.now();
            let mut state = self.state.lock();
            state.last_read = now;
            state.last_write = now;
        }
        for kind in [IdleKind::Reader, IdleKind::Writer] {
            if let Some(threshold) = self.threshold(kind) {
                self.schedule(kind, threshold, ctx.connection(), ctx.index());
            }
        }
        ctx.fire_channel_active();
    }

    fn channel_inactive(&self, ctx: &HandlerContext<'_>) {
        self.cancel_all();
        ctx.fire_channel_inactive();
    }

    fn channel_read(&self, ctx: &HandlerContext<'_>, msg: Message) {
        if self.reader_idle.is_some() {
            self.state.lock().last_read = self.timer.now();
        }
        ctx.fire_channel_read(msg);
    }

    fn write(&self, ctx: &HandlerContext<'_>, msg: Message) -> Result<(), TransportError> {
        ctx.write(msg)?;
        if self.writer_idle.is_some() {
            self.state.lock().last_write = self.timer.now();
        }
        Ok(())
    }
}

/// 写空闲时发送心跳。
#[derive(Debug, Default)]
pub struct HeartbeatTrigger;

impl HeartbeatTrigger {
    /// 构造触发器。
    pub fn new() -> Self {
        Self
    }
}

impl ChannelHandler for HeartbeatTrigger {
    fn name(&self) -> &'static str {
        "heartbeat-trigger"
    }

    fn user_event(&self, ctx: &HandlerContext<'_>, event: UserEvent) {
        match event {
            UserEvent::WriterIdle { .. } => {
                if let Err(error) = ctx.write(Message::Bytes(heartbeat_content())) {
                    debug!(
                        connection = %ctx.connection().id(),
                        code = error.code(),
                        error = %error,
                        "heartbeat not sent"
                    );
                } else {
                    trace!(connection = %ctx.connection().id(), "heartbeat sent");
                }
            }
            other => ctx.fire_user_event(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use crate::timer::ManualTimer;
    use bytes::Bytes;
    use spark_codec_rpc::{HEARTBEAT_HEADER, HEADER_LENGTH};

    fn chain(timer: &ManualTimer) -> Vec<Arc<dyn ChannelHandler>> {
        vec![
            IdleStateChecker::writer_only(Arc::new(timer.clone()), Duration::from_secs(30)),
            Arc::new(HeartbeatTrigger::new()),
        ]
    }

    #[test]
    fn heartbeat_is_written_after_writer_idle() {
        let timer = ManualTimer::new();
        let (connection, mut outbound) = Connection::detached(Pipeline::new(chain(&timer)));
        connection.fire_channel_active();

        timer.advance(Duration::from_secs(29));
        assert!(outbound.try_recv().is_err());

        timer.advance(Duration::from_secs(1));
        let sent = outbound.try_recv().expect("heartbeat queued");
        assert_eq!(sent.len(), HEADER_LENGTH);
        assert_eq!(sent.as_ref(), &HEARTBEAT_HEADER.to_array());

        timer.advance(Duration::from_secs(30));
        assert!(outbound.try_recv().is_ok());
    }

    #[test]
    fn writes_postpone_the_heartbeat() {
        let timer = ManualTimer::new();
        let (connection, mut outbound) = Connection::detached(Pipeline::new(chain(&timer)));
        connection.fire_channel_active();

        timer.advance(Duration::from_secs(20));
        connection
            .write_bytes(Bytes::from_static(b"payload"))
            .expect("write accepted");
        assert_eq!(outbound.try_recv().expect("payload").as_ref(), b"payload");

        timer.advance(Duration::from_secs(10));
        assert!(outbound.try_recv().is_err());
        assert_eq!(timer.pending_delays(), vec![Duration::from_secs(20)]);

        timer.advance(Duration::from_secs(20));
        assert_eq!(
            outbound.try_recv().expect("heartbeat").as_ref(),
            &HEARTBEAT_HEADER.to_array()
        );
    }

    #[test]
    fn inactive_connection_stops_heartbeats() {
        let timer = ManualTimer::new();
        let (connection, mut outbound) = Connection::detached(Pipeline::new(chain(&timer)));
        connection.fire_channel_active();
        connection.fire_channel_inactive_once();
        assert_eq!(timer.pending_count(), 0);
        timer.advance(Duration::from_secs(60));
        assert!(outbound.try_recv().is_err());
    }

    #[test]
    fn reader_idle_is_forwarded_past_the_trigger() {
        struct Sink(Arc<Mutex<Vec<UserEvent>>>);
        impl ChannelHandler for Sink {
            fn name(&self) -> &'static str {
                "sink"
            }
            fn user_event(&self, _ctx: &HandlerContext<'_>, event: UserEvent) {
                self.0.lock().push(event);
            }
        }

        let timer = ManualTimer::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handlers: Vec<Arc<dyn ChannelHandler>> = vec![
            IdleStateChecker::new(Arc::new(timer.clone()), Some(Duration::from_secs(5)), None),
            Arc::new(HeartbeatTrigger::new()),
            Arc::new(Sink(Arc::clone(&seen))),
        ];
        let (connection, _outbound) = Connection::detached(Pipeline::new(handlers));
        connection.fire_channel_active();
        timer.advance(Duration::from_secs(5));
        assert_eq!(
            *seen.lock(),
            vec![UserEvent::ReaderIdle {
                idle_for: Duration::from_secs(5)
            }]
        );
    }
}
