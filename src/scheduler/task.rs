//! 任务与耗时统计
//!
//! @yutiansut @quantaxis
//!
//! - TaskStats: 一条序列所有 chunk 共享的运行耗时统计，以及序列级的下游链接
//! - Task: 一次可调度的计算单元，带未完成依赖计数和下游任务列表
//!
//! 关键路径时长 = 自身平均耗时 + 下游关键路径时长的最大值
//!
//! 序列级关键路径按统计纪元缓存：任何耗时样本、下游链接或统计析构都会推进纪元，
//! 缓存随之失效；一次重算中每个统计只计算一次

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

/// 任务执行体
pub type Job = Box<dyn FnOnce() + Send>;

/// 平均耗时的衰减分母 (新样本权重 1/8)
const AVERAGE_DECAY: u64 = 8;

const UNSET: u64 = u64::MAX;

/// 统计纪元 (进程内所有 TaskStats 共享)
static STATS_EPOCH: AtomicU64 = AtomicU64::new(0);

#[inline]
fn advance_epoch() {
    STATS_EPOCH.fetch_add(1, Ordering::AcqRel);
}

// ═══════════════════════════════════════════════════════════════════════════
// 耗时统计
// ═══════════════════════════════════════════════════════════════════════════

/// 运行耗时统计 (按序列共享)
#[derive(Debug, Default)]
pub struct TaskStats {
    runs: AtomicU64,
    average_nanos: AtomicU64,
    downstream: Mutex<Vec<Weak<TaskStats>>>,
    /// (纪元, 关键路径) 缓存
    cached_path: Mutex<Option<(u64, Duration)>>,
}

impl TaskStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// 带初始估计值的统计 (尚无样本时作为平均耗时)
    pub fn with_estimate(estimate: Duration) -> Self {
        let stats = Self::new();
        stats
            .average_nanos
            .store(duration_nanos(estimate), Ordering::Relaxed);
        stats
    }

    /// 记录一次运行耗时
    pub fn record(&self, elapsed: Duration) {
        let sample = duration_nanos(elapsed);
        let first = self.runs.fetch_add(1, Ordering::AcqRel) == 0;
        let _ = self
            .average_nanos
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |avg| {
                if first && avg == 0 {
                    Some(sample)
                } else if sample >= avg {
                    Some(avg + (sample - avg) / AVERAGE_DECAY)
                } else {
                    Some(avg - (avg - sample) / AVERAGE_DECAY)
                }
            });
        advance_epoch();
    }

    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Acquire)
    }

    /// 平均耗时
    pub fn average(&self) -> Duration {
        Duration::from_nanos(self.average_nanos.load(Ordering::Acquire))
    }

    /// 链接下游统计 (去重，忽略自身)
    pub fn link_downstream(&self, downstream: &Arc<TaskStats>) {
        if std::ptr::eq(self, Arc::as_ptr(downstream)) {
            return;
        }
        let mut links = self.downstream.lock();
        links.retain(|w| w.strong_count() > 0);
        if links.iter().any(|w| w.as_ptr() == Arc::as_ptr(downstream)) {
            return;
        }
        links.push(Arc::downgrade(downstream));
        drop(links);
        advance_epoch();
    }

    /// 存活的下游数
    pub fn downstream_count(&self) -> usize {
        self.downstream
            .lock()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// 序列级关键路径时长
    pub fn critical_path(&self) -> Duration {
        let epoch = STATS_EPOCH.load(Ordering::Acquire);
        let mut memo = HashMap::new();
        self.critical_path_at(epoch, &mut memo)
    }

    fn critical_path_at(&self, epoch: u64, memo: &mut HashMap<usize, Duration>) -> Duration {
        if let Some((at, path)) = *self.cached_path.lock() {
            if at == epoch {
                return path;
            }
        }
        let key = self as *const TaskStats as usize;
        if let Some(&path) = memo.get(&key) {
            return path;
        }

        let links: Vec<Arc<TaskStats>> = self
            .downstream
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        let longest = links
            .iter()
            .map(|s| s.critical_path_at(epoch, memo))
            .max()
            .unwrap_or_default();
        let path = self.average() + longest;

        memo.insert(key, path);
        *self.cached_path.lock() = Some((epoch, path));
        path
    }
}

impl Drop for TaskStats {
    fn drop(&mut self) {
        // 上游缓存的路径可能经过本统计
        advance_epoch();
    }
}

fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX - 1)
}

// ═══════════════════════════════════════════════════════════════════════════
// Task
// ═══════════════════════════════════════════════════════════════════════════

/// 可调度的计算单元
pub struct Task {
    job: Mutex<Option<Job>>,
    /// 未完成的前置任务数
    waiting: AtomicUsize,
    dependents: Mutex<Vec<Arc<Task>>>,
    stats: Arc<TaskStats>,
    /// 关键路径时长缓存 (纳秒)
    critical_path: AtomicU64,
}

impl Task {
    pub fn new<F>(job: F, stats: Arc<TaskStats>) -> Arc<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Arc::new(Self {
            job: Mutex::new(Some(Box::new(job))),
            waiting: AtomicUsize::new(0),
            dependents: Mutex::new(Vec::new()),
            stats,
            critical_path: AtomicU64::new(UNSET),
        })
    }

    /// 添加下游任务：下游的未完成依赖数 +1
    pub fn add_dependent(&self, dependent: Arc<Task>) {
        dependent.waiting.fetch_add(1, Ordering::AcqRel);
        self.dependents.lock().push(dependent);
    }

    /// 未完成的前置任务数
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    /// 一个前置任务完成，返回本任务是否就绪
    pub(crate) fn finish_dependency(&self) -> bool {
        let prev = self.waiting.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "finish_dependency on a ready task");
        prev == 1
    }

    pub fn stats(&self) -> &Arc<TaskStats> {
        &self.stats
    }

    /// 关键路径时长 (首次计算后缓存)
    pub fn critical_path(&self) -> Duration {
        let cached = self.critical_path.load(Ordering::Acquire);
        if cached != UNSET {
            return Duration::from_nanos(cached);
        }

        let dependents: Vec<Arc<Task>> = self.dependents.lock().clone();
        let longest = dependents
            .iter()
            .map(|t| t.critical_path())
            .max()
            .unwrap_or_default();
        let total = self.stats.critical_path() + longest;
        self.critical_path
            .store(duration_nanos(total), Ordering::Release);
        total
    }

    pub(crate) fn take_job(&self) -> Option<Job> {
        self.job.lock().take()
    }

    pub(crate) fn take_dependents(&self) -> Vec<Arc<Task>> {
        std::mem::take(&mut *self.dependents.lock())
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("waiting", &self.waiting())
            .field("dependents", &self.dependents.lock().len())
            .field("average", &self.stats.average())
            .finish()
    }
}
