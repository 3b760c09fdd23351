//! 引擎运行时
//!
//! @yutiansut @quantaxis
//!
//! Engine 持有所有 chunk 共享的单例：
//! - GarbageCollector (内存预算)
//! - TaskScheduler (工作线程池，可选)
//! - EngineMetrics
//! - 逻辑时钟 (最近访问时间的来源)
//!
//! 构造顺序：配置 → 回收器 → 调度器；销毁时反向：先排空调度器，再清空回收器

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::chunk::{ChunkBase, Element};
use crate::gc::{GarbageCollector, GcReport};
use crate::scheduler::TaskScheduler;
use crate::series::{ChunkFactory, DataSeries, SeriesOptions, SourceSeries};
use crate::utils::config::EngineConfig;
use crate::utils::metrics::{EngineMetrics, MetricsSnapshot};
use crate::{BuildContext, Computer, Result};

/// chunk 回收器
pub type ChunkCollector = GarbageCollector<dyn ChunkBase>;

/// 所有 chunk 共享的引擎状态
pub struct EngineShared {
    config: EngineConfig,
    pub(crate) gc: ChunkCollector,
    scheduler: Option<TaskScheduler>,
    pub(crate) metrics: EngineMetrics,
    clock: AtomicU64,
    graph_thread: ThreadId,
    inline_threshold: Duration,
}

impl EngineShared {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn collector(&self) -> &ChunkCollector {
        &self.gc
    }

    pub fn scheduler(&self) -> Option<&TaskScheduler> {
        self.scheduler.as_ref()
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// 推进逻辑时钟并返回新时刻
    pub(crate) fn tick_clock(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// 当前逻辑时刻
    pub fn now(&self) -> u64 {
        self.clock.load(Ordering::Acquire)
    }

    pub fn inline_threshold(&self) -> Duration {
        self.inline_threshold
    }

    /// 当前线程是否为图变更线程
    pub fn is_graph_thread(&self) -> bool {
        thread::current().id() == self.graph_thread
    }
}

/// 引擎
///
/// 创建引擎的线程即图变更线程：get_chunk、序列构造和 GC 扫描都只能在这里进行
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let gc = GarbageCollector::new(config.gc_memory_limit);
        let scheduler = match config.worker_threads {
            0 => None,
            n => Some(TaskScheduler::new(n)),
        };
        let inline_threshold = Duration::from_micros(config.inline_threshold_us);

        log::info!(
            "Engine started: gc_limit={} bytes, workers={}, inline_threshold={:?}",
            config.gc_memory_limit,
            config.worker_threads,
            inline_threshold
        );

        Self {
            shared: Arc::new(EngineShared {
                config,
                gc,
                scheduler,
                metrics: EngineMetrics::new(),
                clock: AtomicU64::new(0),
                graph_thread: thread::current().id(),
                inline_threshold,
            }),
        }
    }

    pub fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }

    pub fn config(&self) -> &EngineConfig {
        self.shared.config()
    }

    /// 创建默认选项的派生序列
    pub fn series<T, F>(&self, name: &str, factory: F) -> Arc<DataSeries<T>>
    where
        T: Element,
        F: Fn(&DataSeries<T>, usize, &mut BuildContext) -> Computer<T> + Send + Sync + 'static,
    {
        self.series_with(name, SeriesOptions::default(), factory)
    }

    pub fn series_with<T, F>(
        &self,
        name: &str,
        options: SeriesOptions,
        factory: F,
    ) -> Arc<DataSeries<T>>
    where
        T: Element,
        F: Fn(&DataSeries<T>, usize, &mut BuildContext) -> Computer<T> + Send + Sync + 'static,
    {
        self.series_from_factory(name, options, Box::new(factory))
    }

    /// 由任意 ChunkFactory 实现创建序列
    pub fn series_from_factory<T: Element>(
        &self,
        name: &str,
        options: SeriesOptions,
        factory: Box<dyn ChunkFactory<T>>,
    ) -> Arc<DataSeries<T>> {
        log::debug!("Created series '{}' ({:?})", name, options);
        DataSeries::new(name, options, factory, self.shared.clone())
    }

    /// 创建数据源序列
    pub fn source<T: Element>(&self, name: &str) -> SourceSeries<T> {
        self.source_with(name, SeriesOptions::default())
    }

    pub fn source_with<T: Element>(&self, name: &str, options: SeriesOptions) -> SourceSeries<T> {
        SourceSeries::new(self, name, options)
    }

    /// 外层循环的一次节拍：在开启 GC 时执行一次回收扫描
    pub fn tick(&self) -> Result<GcReport> {
        if !self.shared.config.gc_enabled {
            return Ok(GcReport {
                usage: self.shared.gc.memory_usage(),
                limit: self.shared.gc.limit(),
                ..GcReport::default()
            });
        }
        debug_assert!(
            self.shared.is_graph_thread(),
            "GC must run on the graph thread"
        );
        self.shared.metrics.record_gc_pass();
        self.shared.gc.run_gc()
    }

    pub fn collector(&self) -> &ChunkCollector {
        &self.shared.gc
    }

    pub fn scheduler(&self) -> Option<&TaskScheduler> {
        self.shared.scheduler()
    }

    /// 等待线程池中的计算全部完成 (无线程池时立即返回)
    pub fn wait_idle(&self) {
        if let Some(scheduler) = self.shared.scheduler() {
            scheduler.wait_idle();
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// 当前内存占用 (字节)
    pub fn memory_usage(&self) -> i64 {
        self.shared.gc.memory_usage()
    }

    /// 停止线程池并清空回收候选
    pub fn shutdown(&self) {
        if let Some(scheduler) = self.shared.scheduler() {
            scheduler.shutdown();
        }
        self.shared.gc.clear();
        log::info!(
            "Engine shut down, {} bytes still held by live series",
            self.shared.gc.memory_usage()
        );
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
