use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::AbortHandle;

/// 任务 ID，可用于取消尚未执行的任务
pub type TaskId = u64;

/// 延时 / 定时任务管理器
///
/// 每个任务都是独立的 tokio 任务，只在自己的计时器上挂起。
/// 管理器只保存 `AbortHandle`，因此任务在执行完毕之前随时可以被取消，
/// 插件卸载时调用 [`Scheduler::shutdown`] 即可清理全部未完成的任务。
pub struct Scheduler {
    tasks: Mutex<HashMap<TaskId, AbortHandle>>,
    next_id: AtomicU64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// 在 `delay` 之后执行一次 `task`
    pub fn add_delayed<Fut>(&self, delay: Duration, task: Fut) -> TaskId
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });

        self.track(handle.abort_handle())
    }

    /// 固定间隔重复执行，首次执行发生在一个间隔之后
    pub fn add_interval<F, Fut>(&self, period: Duration, mut task_gen: F) -> TaskId
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                task_gen().await;
            }
        });

        self.track(handle.abort_handle())
    }

    /// 取消任务；任务已经结束时无事发生
    pub fn remove(&self, id: TaskId) -> bool {
        match self.lock_tasks().remove(&id) {
            Some(handle) => {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            }
            None => false,
        }
    }

    /// 尚未结束的任务数量
    pub fn pending(&self) -> usize {
        let mut tasks = self.lock_tasks();
        tasks.retain(|_, h| !h.is_finished());
        tasks.len()
    }

    /// 取消全部任务
    pub fn shutdown(&self) {
        let mut tasks = self.lock_tasks();
        let count = tasks.len();
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
        if count > 0 {
            info!(target: "Scheduler", "已取消 {} 个待执行任务", count);
        }
    }

    fn track(&self, handle: AbortHandle) -> TaskId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut tasks = self.lock_tasks();
        // 顺手清理已结束的任务，避免句柄无限堆积
        tasks.retain(|_, h| !h.is_finished());
        tasks.insert(id, handle);
        id
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, AbortHandle>> {
        // 锁中毒只可能来自持锁期间 panic，此时句柄表本身仍然有效
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(|e| e.into_inner());
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }
}
