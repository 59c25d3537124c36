//! 入站帧的异步派发线程池。
//!
//! # 教案式说明
//! - **意图 (Why)**：应用处理可能较慢，不应占用 IO 线程；完整帧被包装为任务提交到有界队列，
//!   由命名的派发线程消费。队列饱和时由 [`RejectedExecutionHandler`] 决定如何腾挪空间；
//! - **逻辑 (How)**：
//!   - [`TaskQueue`] 以 `parking_lot::Mutex + Condvar` 实现有界阻塞队列，支持非阻塞 `offer`、
//!     阻塞 `put`、批量丢弃队首；
//!   - 工作线程循环 `take`，单个任务 panic 被捕获并记录，线程继续服务；
//! - **契约 (What)**：
//!   - `shutdown` 之后 `offer/put` 立即失败，工作线程处理完剩余任务后退出；
//!   - 任务在派发线程上执行，执行顺序与入队顺序一致，但多线程之间互不等待。

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

use crate::error::TransportError;

/// 被拒绝时可自行善后的任务。
pub trait RejectedRunnable: Send + 'static {
    /// 正常执行。
    fn run(self: Box<Self>);

    /// 队列饱和、任务未被执行时调用。
    fn rejected(self: Box<Self>);
}

/// 派发任务。
pub enum Task {
    /// 普通闭包；饱和时由策略腾挪空间后重新入队。
    Plain(Box<dyn FnOnce() + Send + 'static>),
    /// 自带拒绝回调的任务；饱和时只调用其 `rejected`。
    Rejectable(Box<dyn RejectedRunnable>),
}

impl Task {
    /// 包装闭包。
    pub fn plain<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Task::Plain(Box::new(f))
    }

    /// 包装自带拒绝回调的任务。
    pub fn rejectable<R>(runnable: R) -> Self
    where
        R: RejectedRunnable,
    {
        Task::Rejectable(Box::new(runnable))
    }

    /// 执行任务。
    pub fn run(self) {
        match self {
            Task::Plain(f) => f(),
            Task::Rejectable(runnable) => runnable.run(),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Plain(_) => f.write_str("Task::Plain"),
            Task::Rejectable(_) => f.write_str("Task::Rejectable"),
        }
    }
}

/// 有界阻塞任务队列。
pub struct TaskQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
}

struct QueueState {
    tasks: VecDeque<Task>,
    shutdown: bool,
}

impl TaskQueue {
    /// 指定容量，`capacity` 至少为 1。
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(QueueState {
                tasks: VecDeque::with_capacity(capacity),
                shutdown: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// 容量。
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 当前排队数。
    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    /// 是否为空。
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 是否已停止。
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    /// 非阻塞入队；满或已停止时原样交还任务。
    pub fn offer(&self, task: Task) -> Result<(), Task> {
        let mut state = self.state.lock();
        if state.shutdown || state.tasks.len() >= self.capacity {
            return Err(task);
        }
        state.tasks.push_back(task);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// 阻塞直到有空位；已停止时交还任务。
    pub fn put(&self, task: Task) -> Result<(), Task> {
        let mut state = self.state.lock();
        while !state.shutdown && state.tasks.len() >= self.capacity {
            self.not_full.wait(&mut state);
        }
        if state.shutdown {
            return Err(task);
        }
        state.tasks.push_back(task);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// 非阻塞出队。
    pub fn poll(&self) -> Option<Task> {
        let task = self.state.lock().tasks.pop_front();
        if task.is_some() {
            self.not_full.notify_one();
        }
        task
    }

    /// 阻塞出队；队列停止且为空时返回 `None`。
    pub fn take(&self) -> Option<Task> {
        let mut state = self.state.lock();
        loop {
            if let Some(task) = state.tasks.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(task);
            }
            if state.shutdown {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// 从队首丢弃至多 `count` 个任务，返回实际丢弃数。
    pub fn discard_oldest(&self, count: usize) -> usize {
        let discarded: Vec<Task> = {
            let mut state = self.state.lock();
            let count = count.min(state.tasks.len());
            state.tasks.drain(..count).collect()
        };
        if !discarded.is_empty() {
            self.not_full.notify_all();
        }
        discarded.len()
    }

    /// 停止队列并唤醒所有等待者。
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TaskQueue")
            .field("capacity", &self.capacity)
            .field("len", &state.tasks.len())
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

/// 队列饱和时的处置策略。
pub trait RejectedExecutionHandler: Send + Sync + 'static {
    /// 处置一个未能入队的任务。
    fn rejected(&self, task: Task, queue: &TaskQueue);
}

/// 命名线程池。
pub struct DispatchExecutor {
    name: String,
    queue: Arc<TaskQueue>,
    handler: Arc<dyn RejectedExecutionHandler>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DispatchExecutor {
    /// 启动 `threads` 个名为 `{name}-{idx}` 的工作线程。
    pub fn new(
        name: impl Into<String>,
        threads: usize,
        capacity: usize,
        handler: Arc<dyn RejectedExecutionHandler>,
    ) -> Result<Self, TransportError> {
        let name = name.into();
        let queue = Arc::new(TaskQueue::new(capacity));
        let mut workers = Vec::with_capacity(threads);
        for idx in 0..threads.max(1) {
            let thread_name = format!("{name}-{idx}");
            let worker_queue = Arc::clone(&queue);
            let worker = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || worker_loop(&thread_name, &worker_queue))
                .map_err(|source| {
                    // 已启动的线程随队列停止而退出。
                    queue.shutdown();
                    TransportError::Runtime {
                        what: "dispatch worker",
                        source,
                    }
                })?;
            workers.push(worker);
        }
        Ok(Self {
            name,
            queue,
            handler,
            workers: Mutex::new(workers),
        })
    }

    /// 线程池名称。
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 任务队列。
    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// 提交任务；队列满时交给拒绝策略。
    pub fn execute(&self, task: Task) {
        if let Err(task) = self.queue.offer(task) {
            self.handler.rejected(task, &self.queue);
        }
    }

    /// 停止接收任务并等待工作线程处理完剩余任务。
    pub fn shutdown(&self) {
        self.queue.shutdown();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
    }
}

fn worker_loop(thread_name: &str, queue: &TaskQueue) {
    while let Some(task) = queue.take() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_owned());
            error!(thread = thread_name, panic = %message, "uncaught panic in dispatch task");
        }
    }
    debug!(thread = thread_name, "dispatch worker stopped");
}

impl Drop for DispatchExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for DispatchExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchExecutor")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .finish()
    }
}
