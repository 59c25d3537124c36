//! 派发队列饱和时的默认处置策略。
//!
//! # 教案式说明
//! - **意图 (Why)**：入站帧派发队列打满意味着应用处理跟不上网络输入；此时最新到达的帧通常
//!   比排队已久的帧更有价值，静默丢弃最新任务会让调用方永远等不到响应；
//! - **逻辑 (How)**：
//!   1. 记录一条包含池名与队列深度的 `error` 日志；
//!   2. 任务自带拒绝回调（[`Task::Rejectable`]）时只调用该回调，由任务自己决定如何失败；
//!   3. 否则在队列未停止时从队首丢弃 `len >> 1` 个旧任务，再把新任务阻塞入队；
//!   4. 队列已停止时放弃该任务，不返回错误；
//! - **契约 (What)**：除队列已停止外，新任务要么被执行，要么其拒绝回调被调用，绝不被静默丢弃；
//!   容量为 `N` 的满队列处置后深度不超过 `ceil(N/2) + 1`；
//! - **权衡 (Trade-offs)**：丢弃与重新入队是两步操作，并发生产者可能在两步之间抢占空位，
//!   此时 `put` 会阻塞调用方直到消费者腾出空间。

use tracing::{debug, error};

use crate::dispatch::{RejectedExecutionHandler, Task, TaskQueue};

/// 记录并腾挪空间的拒绝策略。
#[derive(Clone, Debug)]
pub struct RejectedTaskPolicy {
    pool_name: String,
}

impl RejectedTaskPolicy {
    /// 以线程池名称构造，名称只用于日志。
    pub fn new(pool_name: impl Into<String>) -> Self {
        Self {
            pool_name: pool_name.into(),
        }
    }

    /// 线程池名称。
    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }
}

impl RejectedExecutionHandler for RejectedTaskPolicy {
    fn rejected(&self, task: Task, queue: &TaskQueue) {
        error!(
            pool = %self.pool_name,
            queued = queue.len(),
            capacity = queue.capacity(),
            "dispatch pool [{}] is exhausted",
            self.pool_name
        );

        match task {
            Task::Rejectable(runnable) => runnable.rejected(),
            plain @ Task::Plain(_) => {
                if queue.is_shutdown() {
                    debug!(pool = %self.pool_name, "task abandoned, queue is shut down");
                    return;
                }
                let discarded = queue.discard_oldest(queue.len() >> 1);
                debug!(pool = %self.pool_name, discarded, "discarded oldest queued tasks");
                if queue.put(plain).is_err() {
                    debug!(pool = %self.pool_name, "task abandoned, queue is shut down");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::RejectedRunnable;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tracing_test::traced_test;

    fn fill(queue: &TaskQueue, ids: impl Iterator<Item = usize>, log: &Arc<Mutex<Vec<usize>>>) {
        for id in ids {
            let log = Arc::clone(log);
            queue
                .offer(Task::plain(move || log.lock().push(id)))
                .expect("room in queue");
        }
    }

    fn drain(queue: &TaskQueue) {
        while let Some(task) = queue.poll() {
            task.run();
        }
    }

    #[test]
    fn saturated_queue_keeps_newest_half_and_new_task() {
        let queue = TaskQueue::new(4);
        let log = Arc::new(Mutex::new(Vec::new()));
        fill(&queue, 0..4, &log);

        let policy = RejectedTaskPolicy::new("spark.rpc.dispatch");
        let newest = Arc::clone(&log);
        policy.rejected(Task::plain(move || newest.lock().push(4)), &queue);

        assert_eq!(queue.len(), 3);
        drain(&queue);
        assert_eq!(*log.lock(), vec![2, 3, 4]);
    }

    struct Callback {
        ran: Arc<AtomicBool>,
        rejected: Arc<AtomicBool>,
    }

    impl RejectedRunnable for Callback {
        fn run(self: Box<Self>) {
            self.ran.store(true, Ordering::SeqCst);
        }

        fn rejected(self: Box<Self>) {
            self.rejected.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn rejectable_task_only_gets_its_callback() {
        let queue = TaskQueue::new(2);
        let log = Arc::new(Mutex::new(Vec::new()));
        fill(&queue, 0..2, &log);

        let ran = Arc::new(AtomicBool::new(false));
        let rejected = Arc::new(AtomicBool::new(false));
        RejectedTaskPolicy::new("spark.rpc.dispatch").rejected(
            Task::rejectable(Callback {
                ran: Arc::clone(&ran),
                rejected: Arc::clone(&rejected),
            }),
            &queue,
        );

        assert!(rejected.load(Ordering::SeqCst));
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn shut_down_queue_abandons_quietly() {
        let queue = TaskQueue::new(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        fill(&queue, 0..1, &log);
        queue.shutdown();

        let newest = Arc::clone(&log);
        RejectedTaskPolicy::new("spark.rpc.dispatch")
            .rejected(Task::plain(move || newest.lock().push(99)), &queue);
        assert_eq!(queue.len(), 1);
        drain(&queue);
        assert_eq!(*log.lock(), vec![0]);
    }

    #[test]
    #[traced_test]
    fn exhaustion_is_logged_with_pool_name() {
        let queue = TaskQueue::new(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        fill(&queue, 0..1, &log);
        RejectedTaskPolicy::new("orders-pool").rejected(Task::plain(|| {}), &queue);
        assert!(logs_contain("dispatch pool [orders-pool] is exhausted"));
    }

    proptest! {
        #[test]
        fn newest_task_always_survives(capacity in 2usize..64) {
            let queue = TaskQueue::new(capacity);
            let log = Arc::new(Mutex::new(Vec::new()));
            fill(&queue, 0..capacity, &log);

            let newest = Arc::clone(&log);
            RejectedTaskPolicy::new("prop")
                .rejected(Task::plain(move || newest.lock().push(usize::MAX)), &queue);

            prop_assert!(queue.len() <= capacity.div_ceil(2) + 1);
            drain(&queue);
            let observed = log.lock().clone();
            prop_assert_eq!(observed.last().copied(), Some(usize::MAX));
            let discarded = capacity >> 1;
            let expected: Vec<usize> = (discarded..capacity).chain([usize::MAX]).collect();
            prop_assert_eq!(observed, expected);
        }
    }
}
