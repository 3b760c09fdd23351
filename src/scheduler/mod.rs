//! 关键路径优先的任务调度器
//!
//! @yutiansut @quantaxis
//!
//! 固定大小的工作线程池 + 就绪任务优先队列：
//! - 只接受未完成依赖数为 0 的任务
//! - 关键路径时长长的任务先执行，相同时按提交顺序
//! - 任务完成后对每个下游调用 finish_dependency，归零的下游直接入队
//! - 关闭时先排空队列，执行中的任务正常完成后再 join

pub mod task;

pub use task::{Job, Task, TaskStats};

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::{EngineError, Result};

/// 就绪队列中的任务
struct ReadyTask {
    priority: Duration,
    seq: u64,
    task: Arc<Task>,
}

impl PartialEq for ReadyTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for ReadyTask {}

impl PartialOrd for ReadyTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // 大顶堆：关键路径长的优先，其次 seq 小的优先
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState {
    ready: BinaryHeap<ReadyTask>,
    running: bool,
    /// 已入队但尚未完成的任务数
    in_flight: usize,
    next_seq: u64,
    completed: u64,
}

impl QueueState {
    /// 入队；优先级在加锁前算好
    fn push(&mut self, task: Arc<Task>, priority: Duration) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.in_flight += 1;
        self.ready.push(ReadyTask {
            priority,
            seq,
            task,
        });
    }
}

struct SchedulerInner {
    state: Mutex<QueueState>,
    work_ready: Condvar,
    idle: Condvar,
}

/// 任务调度器
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    thread_count: usize,
}

impl TaskScheduler {
    /// 启动 `thread_count` 个工作线程 (至少 1 个)
    pub fn new(thread_count: usize) -> Self {
        let thread_count = thread_count.max(1);
        let inner = Arc::new(SchedulerInner {
            state: Mutex::new(QueueState {
                ready: BinaryHeap::new(),
                running: true,
                in_flight: 0,
                next_seq: 0,
                completed: 0,
            }),
            work_ready: Condvar::new(),
            idle: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(thread_count);
        for i in 0..thread_count {
            let inner = inner.clone();
            let handle = thread::Builder::new()
                .name(format!("chunk-worker-{}", i))
                .spawn(move || worker_loop(i, inner));
            match handle {
                Ok(handle) => workers.push(handle),
                Err(e) => log::error!("Failed to spawn chunk worker {}: {}", i, e),
            }
        }

        log::info!("TaskScheduler started with {} workers", workers.len());

        Self {
            inner,
            thread_count: workers.len(),
            workers: Mutex::new(workers),
        }
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// 提交就绪任务
    pub fn add_task(&self, task: Arc<Task>) -> Result<()> {
        let waiting = task.waiting();
        if waiting != 0 {
            return Err(EngineError::TaskNotReady(waiting));
        }

        let priority = task.critical_path();
        let mut state = self.inner.state.lock();
        if !state.running {
            return Err(EngineError::SchedulerShutdown);
        }
        state.push(task, priority);
        drop(state);

        self.inner.work_ready.notify_one();
        Ok(())
    }

    /// 排队中的任务数
    pub fn queued(&self) -> usize {
        self.inner.state.lock().ready.len()
    }

    /// 已完成的任务数
    pub fn completed(&self) -> u64 {
        self.inner.state.lock().completed
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// 阻塞直到没有排队或执行中的任务
    ///
    /// 不能在工作线程内调用
    pub fn wait_idle(&self) {
        let mut state = self.inner.state.lock();
        while state.in_flight > 0 {
            self.inner.idle.wait(&mut state);
        }
    }

    /// 带超时的 wait_idle，返回是否已空闲
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.in_flight > 0 {
            if self.inner.idle.wait_until(&mut state, deadline).timed_out() {
                return state.in_flight == 0;
            }
        }
        true
    }

    /// 停止接收新任务，排空队列并等待工作线程退出
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if !state.running && self.workers.lock().is_empty() {
                return;
            }
            state.running = false;
        }
        self.inner.work_ready.notify_all();

        let workers = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        for handle in workers {
            // 最后一个引用可能在工作线程内释放
            if handle.thread().id() == current {
                continue;
            }
            let name = handle.thread().name().unwrap_or("chunk-worker").to_string();
            if handle.join().is_err() {
                log::error!("Worker thread {} panicked", name);
            }
        }

        log::info!("TaskScheduler stopped");
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(worker_id: usize, inner: Arc<SchedulerInner>) {
    log::debug!("Chunk worker {} started", worker_id);

    loop {
        let task = {
            let mut state = inner.state.lock();
            loop {
                if let Some(ready) = state.ready.pop() {
                    break ready.task;
                }
                if !state.running {
                    log::debug!("Chunk worker {} exiting", worker_id);
                    return;
                }
                inner.work_ready.wait(&mut state);
            }
        };

        let started = Instant::now();
        if let Some(job) = task.take_job() {
            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                log::error!("Task panicked on chunk worker {}", worker_id);
            }
        }
        task.stats().record(started.elapsed());

        let ready: Vec<(Arc<Task>, Duration)> = task
            .take_dependents()
            .into_iter()
            .filter(|dependent| dependent.finish_dependency())
            .map(|dependent| {
                let priority = dependent.critical_path();
                (dependent, priority)
            })
            .collect();

        let mut state = inner.state.lock();
        let woken = ready.len();
        for (dependent, priority) in ready {
            state.push(dependent, priority);
        }
        state.in_flight -= 1;
        state.completed += 1;
        let drained = state.in_flight == 0;
        drop(state);

        for _ in 0..woken {
            inner.work_ready.notify_one();
        }
        if drained {
            inner.idle.notify_all();
        }
    }
}
