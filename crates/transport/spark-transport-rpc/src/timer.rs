//! 一次性定时任务调度：Watchdog 的重连与空闲检测都建立在这里。
//!
//! # 教案式说明
//! - **意图 (Why)**：重连延迟与写空闲检查都是“若干时间后执行一次”的任务，并且必须可取消；
//!   以 trait 注入定时器，生产环境使用真实时间，测试通过 [`ManualTimer`] 精确推进虚拟时间，
//!   无需真实等待即可断言退避序列；
//! - **契约 (What)**：
//!   - [`Timer::new_timeout`] 不阻塞调用方，任务在到期后最多执行一次；
//!   - [`TimeoutHandle::cancel`] 与到期执行之间以单个原子状态仲裁，二者恰有一个成功；
//!   - 任务运行在定时器自身的线程上，不得长时间阻塞；
//! - **权衡 (Trade-offs)**：[`WheelTimer`] 以专用线程上的单线程 Tokio 运行时承载所有定时任务，
//!   精度受运行时时钟粒度（毫秒）影响，足以覆盖毫秒级退避与秒级空闲检测。

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::error::TransportError;

/// 到期后执行一次的任务。
pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// 可注入的一次性定时器。
pub trait Timer: Send + Sync + 'static {
    /// 当前单调时间点，供空闲检测计算“距上次写入多久”。
    fn now(&self) -> Instant;

    /// 在 `delay` 之后执行 `task`，返回可取消句柄。
    fn new_timeout(&self, delay: Duration, task: TimerTask) -> TimeoutHandle;
}

const PENDING: u8 = 0;
const CANCELLED: u8 = 1;
const EXPIRED: u8 = 2;

struct TimeoutState {
    delay: Duration,
    status: AtomicU8,
    abort: Mutex<Option<AbortHandle>>,
}

impl TimeoutState {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            status: AtomicU8::new(PENDING),
            abort: Mutex::new(None),
        })
    }

    fn try_expire(&self) -> bool {
        self.status
            .compare_exchange(PENDING, EXPIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// 已登记定时任务的句柄。
#[derive(Clone)]
pub struct TimeoutHandle {
    state: Arc<TimeoutState>,
}

impl TimeoutHandle {
    fn new(state: Arc<TimeoutState>) -> Self {
        Self { state }
    }

    /// 登记时给出的延迟。
    pub fn delay(&self) -> Duration {
        self.state.delay
    }

    /// 取消尚未执行的任务；返回 `true` 表示本次调用成功阻止了执行。
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .state
            .status
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if cancelled && let Some(abort) = self.state.abort.lock().take() {
            abort.abort();
        }
        cancelled
    }

    /// 是否已被取消。
    pub fn is_cancelled(&self) -> bool {
        self.state.status.load(Ordering::Acquire) == CANCELLED
    }

    /// 任务是否已开始执行。
    pub fn is_expired(&self) -> bool {
        self.state.status.load(Ordering::Acquire) == EXPIRED
    }
}

impl fmt::Debug for TimeoutHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutHandle")
            .field("delay", &self.state.delay)
            .field("cancelled", &self.is_cancelled())
            .field("expired", &self.is_expired())
            .finish()
    }
}

/// 生产环境定时器：专用线程驱动的单线程 Tokio 运行时。
///
/// # 教案式说明
/// - **意图 (Why)**：定时任务不应与 IO 工作线程抢占调度，也不应依赖调用方所在的运行时；
///   单独线程保证即使 IO 线程繁忙，重连调度仍能准时触发；
/// - **逻辑 (How)**：构造时创建 `current_thread` 运行时并把它移交给线程，线程在 `block_on`
///   中等待停机信号，期间驱动所有经 [`Handle::spawn`] 提交的睡眠任务；
/// - **契约 (What)**：`Drop` 时发送停机信号并回收线程，未到期任务随运行时一并丢弃。
pub struct WheelTimer {
    handle: Handle,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl WheelTimer {
    /// 以指定线程名启动定时器。
    pub fn new(name: &str) -> Result<Self, TransportError> {
        let runtime = Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|source| TransportError::Runtime {
                what: "timer runtime",
                source,
            })?;
        let handle = runtime.handle().clone();
        let (shutdown, stopped) = oneshot::channel::<()>();
        let thread = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                runtime.block_on(async move {
                    let _ = stopped.await;
                });
            })
            .map_err(|source| TransportError::Runtime {
                what: "timer thread",
                source,
            })?;
        Ok(Self {
            handle,
            shutdown: Some(shutdown),
            thread: Some(thread),
        })
    }
}

impl Timer for WheelTimer {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn new_timeout(&self, delay: Duration, task: TimerTask) -> TimeoutHandle {
        let state = TimeoutState::new(delay);
        let fired = Arc::clone(&state);
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if fired.try_expire() {
                task();
            }
        });
        *state.abort.lock() = Some(join.abort_handle());
        // 登记 abort 之前已被取消时补一次中止。
        if state.status.load(Ordering::Acquire) == CANCELLED {
            join.abort();
        }
        TimeoutHandle::new(state)
    }
}

impl Drop for WheelTimer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take()
            && thread.thread().id() != thread::current().id()
        {
            let _ = thread.join();
        }
    }
}

impl fmt::Debug for WheelTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WheelTimer").finish_non_exhaustive()
    }
}

/// 测试用虚拟时间定时器。
///
/// - `advance` 推进虚拟时间并在调用线程上按到期时间、登记顺序执行到期任务；
/// - 任务执行期间新登记且已到期的任务会在同一次 `advance` 中继续执行；
/// - [`ManualTimer::pending_delays`] 暴露尚未执行的任务延迟，便于断言退避序列。
#[derive(Clone)]
pub struct ManualTimer {
    inner: Arc<Mutex<ManualState>>,
}

struct ManualState {
    origin: Instant,
    elapsed: Duration,
    next_seq: u64,
    entries: Vec<ManualEntry>,
}

struct ManualEntry {
    seq: u64,
    deadline: Duration,
    state: Arc<TimeoutState>,
    task: TimerTask,
}

impl ManualTimer {
    /// 起点为当前时间的虚拟定时器。
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualState {
                origin: Instant::now(),
                elapsed: Duration::ZERO,
                next_seq: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// 推进虚拟时间并执行到期任务，返回本次执行的任务数。
    pub fn advance(&self, delta: Duration) -> usize {
        {
            let mut guard = self.inner.lock();
            guard.elapsed = guard.elapsed.saturating_add(delta);
        }
        let mut executed = 0;
        while let Some(entry) = self.pop_due() {
            if entry.state.try_expire() {
                (entry.task)();
                executed += 1;
            }
        }
        executed
    }

    /// 自起点累计的虚拟时间。
    pub fn elapsed(&self) -> Duration {
        self.inner.lock().elapsed
    }

    /// 尚未执行且未取消的任务延迟，按登记顺序排列。
    pub fn pending_delays(&self) -> Vec<Duration> {
        let mut guard = self.inner.lock();
        guard.entries.retain(|entry| !entry.state_is_cancelled());
        guard.entries.iter().map(|entry| entry.state.delay).collect()
    }

    /// 尚未执行且未取消的任务数量。
    pub fn pending_count(&self) -> usize {
        self.pending_delays().len()
    }

    fn pop_due(&self) -> Option<ManualEntry> {
        let mut guard = self.inner.lock();
        guard.entries.retain(|entry| !entry.state_is_cancelled());
        let elapsed = guard.elapsed;
        let index = guard
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.deadline <= elapsed)
            .min_by_key(|(_, entry)| (entry.deadline, entry.seq))
            .map(|(index, _)| index)?;
        Some(guard.entries.remove(index))
    }
}

impl ManualEntry {
    fn state_is_cancelled(&self) -> bool {
        self.state.status.load(Ordering::Acquire) == CANCELLED
    }
}

impl Default for ManualTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ManualTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.inner.lock();
        f.debug_struct("ManualTimer")
            .field("elapsed", &guard.elapsed)
            .field("pending", &guard.entries.len())
            .finish()
    }
}

impl Timer for ManualTimer {
    fn now(&self) -> Instant {
        let guard = self.inner.lock();
        guard.origin + guard.elapsed
    }

    fn new_timeout(&self, delay: Duration, task: TimerTask) -> TimeoutHandle {
        let state = TimeoutState::new(delay);
        let mut guard = self.inner.lock();
        let seq = guard.next_seq;
        guard.next_seq += 1;
        let deadline = guard.elapsed.saturating_add(delay);
        guard.entries.push(ManualEntry {
            seq,
            deadline,
            state: Arc::clone(&state),
            task,
        });
        TimeoutHandle::new(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn manual_timer_fires_in_deadline_order() {
        let timer = ManualTimer::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (label, delay) in [("late", 30u64), ("early", 10), ("middle", 20)] {
            let order = Arc::clone(&order);
            timer.new_timeout(
                Duration::from_millis(delay),
                Box::new(move || order.lock().push(label)),
            );
        }
        assert_eq!(timer.advance(Duration::from_millis(15)), 1);
        assert_eq!(timer.advance(Duration::from_millis(15)), 2);
        assert_eq!(*order.lock(), vec!["early", "middle", "late"]);
        assert_eq!(timer.elapsed(), Duration::from_millis(30));
    }

    #[test]
    fn cancelled_timeout_never_runs() {
        let timer = ManualTimer::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let handle = timer.new_timeout(
            Duration::from_millis(5),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(handle.is_cancelled());
        assert!(timer.pending_delays().is_empty());
        timer.advance(Duration::from_millis(10));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn tasks_scheduled_while_firing_run_when_due() {
        let timer = ManualTimer::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let inner_timer = timer.clone();
        let counter = Arc::clone(&hits);
        timer.new_timeout(
            Duration::from_millis(1),
            Box::new(move || {
                let counter = Arc::clone(&counter);
                inner_timer.new_timeout(
                    Duration::ZERO,
                    Box::new(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }),
                );
            }),
        );
        assert_eq!(timer.advance(Duration::from_millis(1)), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wheel_timer_fires_on_its_own_thread() {
        let timer = WheelTimer::new("spark.rpc.timer-test").expect("timer starts");
        let (tx, rx) = mpsc::channel();
        let handle = timer.new_timeout(
            Duration::from_millis(5),
            Box::new(move || {
                let name = thread::current().name().map(str::to_owned);
                let _ = tx.send(name);
            }),
        );
        let name = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("timeout fires");
        assert_eq!(name.as_deref(), Some("spark.rpc.timer-test"));
        assert!(handle.is_expired());
        assert!(!handle.cancel());
    }

    #[test]
    fn wheel_timer_cancel_prevents_execution() {
        let timer = WheelTimer::new("spark.rpc.timer-cancel").expect("timer starts");
        let (tx, rx) = mpsc::channel::<()>();
        let handle = timer.new_timeout(
            Duration::from_millis(50),
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        assert!(handle.cancel());
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }
}
