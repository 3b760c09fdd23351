//! 序列
//!
//! @yutiansut @quantaxis
//!
//! DataSeries 是一条按 chunk 分块、惰性计算的数据序列：
//! - 槽位表缓存已构造的 chunk (裸 Arc，不计入逻辑引用)
//! - ChunkFactory 描述如何构造第 i 个 chunk：通过 BuildContext 取得上游 chunk，
//!   返回增量计算闭包
//! - 构造完成后先登记依赖边，再触发首次 notify
//!
//! 数据源见 `source`，派生算子见 `nodes`

pub mod nodes;
pub mod source;

pub use source::SourceSeries;

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::chunk::{
    split_index, AnyChunkHandle, Chunk, ChunkBase, ChunkCore, ChunkHandle, ChunkId, ChunkOwner,
    Computer, Element, Handle,
};
use crate::gc::Collectable;
use crate::runtime::EngineShared;
use crate::scheduler::TaskStats;

// ═══════════════════════════════════════════════════════════════════════════
// 选项
// ═══════════════════════════════════════════════════════════════════════════

/// 计算执行策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// 平均耗时超过阈值时交给线程池，否则在通知线程内联执行
    #[default]
    Auto,
    /// 总是内联执行
    Inline,
    /// 总是交给线程池 (无线程池时退化为内联)
    Offload,
}

/// 序列选项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesOptions {
    /// 瞬态 chunk 在引用归零后可被回收；非瞬态 chunk 常驻
    pub transient: bool,
    pub exec_mode: ExecMode,
}

impl Default for SeriesOptions {
    fn default() -> Self {
        Self {
            transient: true,
            exec_mode: ExecMode::Auto,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 构造上下文
// ═══════════════════════════════════════════════════════════════════════════

/// chunk 构造期间记录上游依赖
///
/// 通过 `chunk()` 取得的每个上游 chunk 都会成为新 chunk 的依赖，
/// 新 chunk 存活期间上游不会被回收
#[derive(Default)]
pub struct BuildContext {
    dependencies: Vec<AnyChunkHandle>,
}

impl BuildContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取得上游序列的第 `index` 个 chunk 并记录为依赖
    pub fn chunk<U: Element>(&mut self, series: &DataSeries<U>, index: usize) -> ChunkHandle<U> {
        let handle = series.get_chunk(index);
        if !self.dependencies.iter().any(|d| d.id() == handle.id()) {
            self.dependencies.push(handle.clone().erase());
        }
        handle
    }

    /// 已记录的依赖数
    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    pub fn dependency_ids(&self) -> Vec<ChunkId> {
        self.dependencies.iter().map(|d| d.id()).collect()
    }

    fn into_dependencies(self) -> Vec<AnyChunkHandle> {
        self.dependencies
    }
}

/// 序列的 chunk 构造逻辑
pub trait ChunkFactory<T: Element>: Send + Sync {
    /// 构造第 `index` 个 chunk 的计算闭包
    ///
    /// 上游 chunk 必须通过 `ctx` 取得，否则依赖边不会被记录
    fn make_chunk(&self, series: &DataSeries<T>, index: usize, ctx: &mut BuildContext)
        -> Computer<T>;
}

impl<T, F> ChunkFactory<T> for F
where
    T: Element,
    F: Fn(&DataSeries<T>, usize, &mut BuildContext) -> Computer<T> + Send + Sync,
{
    fn make_chunk(
        &self,
        series: &DataSeries<T>,
        index: usize,
        ctx: &mut BuildContext,
    ) -> Computer<T> {
        self(series, index, ctx)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 槽位表
// ═══════════════════════════════════════════════════════════════════════════

struct SlotTable<T: Element> {
    name: String,
    slots: Mutex<HashMap<usize, Arc<Chunk<T>>>>,
}

impl<T: Element> SlotTable<T> {
    fn get(&self, index: usize) -> Option<Arc<Chunk<T>>> {
        self.slots.lock().get(&index).cloned()
    }

    fn insert(&self, index: usize, chunk: Arc<Chunk<T>>) {
        let previous = self.slots.lock().insert(index, chunk);
        debug_assert!(previous.is_none(), "slot {} built twice", index);
        drop(previous);
    }
}

impl<T: Element> ChunkOwner for SlotTable<T> {
    fn release_chunk(&self, index: usize, id: ChunkId) -> bool {
        let removed = {
            let mut slots = self.slots.lock();
            match slots.get(&index) {
                Some(chunk) if chunk.core().id() == id => slots.remove(&index),
                _ => None,
            }
        };
        removed.is_some()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// DataSeries
// ═══════════════════════════════════════════════════════════════════════════

/// 分块惰性序列
pub struct DataSeries<T: Element> {
    name: String,
    options: SeriesOptions,
    table: Arc<SlotTable<T>>,
    factory: Box<dyn ChunkFactory<T>>,
    /// 本序列所有 chunk 共享的耗时统计
    stats: Arc<TaskStats>,
    engine: Arc<EngineShared>,
}

impl<T: Element> DataSeries<T> {
    pub(crate) fn new(
        name: &str,
        options: SeriesOptions,
        factory: Box<dyn ChunkFactory<T>>,
        engine: Arc<EngineShared>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            options,
            table: Arc::new(SlotTable {
                name: name.to_string(),
                slots: Mutex::new(HashMap::new()),
            }),
            factory,
            stats: Arc::new(TaskStats::new()),
            engine,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &SeriesOptions {
        &self.options
    }

    pub fn stats(&self) -> &Arc<TaskStats> {
        &self.stats
    }

    pub fn engine(&self) -> &Arc<EngineShared> {
        &self.engine
    }

    /// 取得第 `index` 个 chunk，未缓存时构造
    ///
    /// 只能在图变更线程调用
    pub fn get_chunk(&self, index: usize) -> ChunkHandle<T> {
        debug_assert!(
            self.engine.is_graph_thread(),
            "get_chunk on '{}' called off the graph thread",
            self.name
        );

        if let Some(chunk) = self.table.get(index) {
            chunk.core().touch();
            return Handle::acquire(chunk);
        }

        let mut ctx = BuildContext::new();
        let computer = self.factory.make_chunk(self, index, &mut ctx);

        let owner: Weak<SlotTable<T>> = Arc::downgrade(&self.table);
        let core = ChunkCore::new(
            index,
            self.options.transient,
            self.options.exec_mode,
            self.stats.clone(),
            owner,
            self.engine.clone(),
        );
        let chunk = Chunk::new(core, computer, ctx.into_dependencies());
        self.table.insert(index, chunk.clone());
        self.engine.metrics.record_built();

        log::trace!(
            "Built chunk {} of series '{}' (index {}, {} dependencies)",
            chunk.core().id(),
            self.name,
            index,
            chunk.dependency_count()
        );

        let handle = Handle::acquire(chunk.clone());
        chunk.notify();
        handle
    }

    /// 自底向上构造到第 `index` 个 chunk
    ///
    /// 第 i 个 chunk 依赖本序列第 i-1 个 chunk 时 (如前缀和)，直接 `get_chunk`
    /// 会沿缺失的前驱逐级递归。这里先找到最低的缺失下标，再按升序逐个构造，
    /// 每一步的前驱都已驻留，递归深度恒为一层
    pub fn build_through(&self, index: usize) -> ChunkHandle<T> {
        let mut lowest = index;
        while lowest > 0 && !self.is_resident(lowest - 1) {
            lowest -= 1;
        }
        if lowest < index {
            log::debug!(
                "Building chunks {}..={} of series '{}' bottom-up",
                lowest,
                index,
                self.name
            );
        }

        // 只需保住上一个：构造第 i 个时第 i-1 个不能被回收
        let mut previous: Option<ChunkHandle<T>> = None;
        for i in lowest..index {
            previous = Some(self.get_chunk(i));
        }
        let handle = self.get_chunk(index);
        drop(previous);
        handle
    }

    /// 已驻留的 chunk (不构造、不刷新访问时间、不计引用)
    pub fn resident(&self, index: usize) -> Option<Arc<Chunk<T>>> {
        self.table.get(index)
    }

    pub fn is_resident(&self, index: usize) -> bool {
        self.table.slots.lock().contains_key(&index)
    }

    pub fn resident_count(&self) -> usize {
        self.table.slots.lock().len()
    }

    /// 已驻留 chunk 的下标 (升序)
    pub fn resident_indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self.table.slots.lock().keys().copied().collect();
        indices.sort_unstable();
        indices
    }

    /// 通知已驻留的第 `index` 个 chunk (未驻留时忽略)
    pub fn notify_resident(&self, index: usize) {
        if let Some(chunk) = self.table.get(index) {
            chunk.notify();
        }
    }

    /// 读取全局下标 `index` 处的元素 (尚未计算返回 None)
    ///
    /// 单点读取：chunk 已驻留时只刷新访问时间，未被引用的 chunk 在候选池中
    /// 重新排队 (一次 GC 加锁)；未驻留时构造。批量读取应持有
    /// `get_chunk` 返回的句柄并用 `ChunkHandle::get` / `data()` 逐个读取
    pub fn get(&self, index: usize) -> Option<T> {
        let (chunk_index, offset) = split_index(index);
        match self.table.get(chunk_index) {
            Some(chunk) => {
                chunk.core().touch();
                if chunk.can_free() {
                    self.engine.gc.enqueue(chunk.clone().into_dyn());
                }
                chunk.get(offset)
            }
            None => self.get_chunk(chunk_index).get(offset),
        }
    }

    /// 丢弃所有驻留 chunk 的槽位
    pub fn clear(&self) {
        let drained = std::mem::take(&mut *self.table.slots.lock());
        log::debug!(
            "Cleared {} resident chunks of series '{}'",
            drained.len(),
            self.name
        );
        drop(drained);
    }
}

impl<T: Element> std::fmt::Debug for DataSeries<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSeries")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("resident", &self.resident_count())
            .field("average", &self.stats.average())
            .finish()
    }
}
