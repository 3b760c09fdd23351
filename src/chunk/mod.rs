//! 分块惰性求值核心
//!
//! @yutiansut @quantaxis
//!
//! 一个 Chunk 保存某条序列的一批连续元素 (CHUNK_SIZE 个)：
//! - 单调部分填充：computed count 只增不减，已发布元素不可变
//! - notify 合并：并发通知只产生一次待执行的 exec
//! - 依赖边显式保存：下游持有上游句柄，上游以弱引用记录下游
//! - 逻辑引用计数由 Handle 维护，瞬态 chunk 归零后进入 GC 候选池

pub mod buffer;
pub mod handle;

pub use buffer::{ChunkWriter, ComputedCount};
pub use handle::{AnyChunkHandle, ChunkHandle, Handle};

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;

use crate::gc::{Collectable, GcSlot};
use crate::runtime::EngineShared;
use crate::scheduler::{Task, TaskStats};
use crate::series::ExecMode;
use buffer::ChunkBuffer;

// ═══════════════════════════════════════════════════════════════════════════
// 基础定义
// ═══════════════════════════════════════════════════════════════════════════

/// 每个 chunk 的元素容量 (2 的幂)
pub const CHUNK_SIZE: usize = 1024;

const _: () = assert!(CHUNK_SIZE.is_power_of_two());

/// 全局元素下标 → (chunk 下标, chunk 内偏移)
#[inline]
pub fn split_index(index: usize) -> (usize, usize) {
    (index / CHUNK_SIZE, index % CHUNK_SIZE)
}

/// 序列元素类型
pub trait Element: Copy + Default + Send + Sync + 'static {}

impl<T: Copy + Default + Send + Sync + 'static> Element for T {}

/// chunk 唯一标识 (进程内单调分配)
pub type ChunkId = u64;

static NEXT_CHUNK_ID: AtomicU64 = AtomicU64::new(1);

/// 计算闭包：向 writer 追加新元素
///
/// 上游数据不足时可以什么都不写，等待下一次 notify
pub type Computer<T> = Box<dyn FnMut(&mut ChunkWriter<'_, T>) + Send>;

/// 把闭包装箱为 `Computer`，由参数类型推断闭包签名
pub fn computer<T, F>(f: F) -> Computer<T>
where
    T: Element,
    F: FnMut(&mut ChunkWriter<'_, T>) + Send + 'static,
{
    Box::new(f)
}

/// chunk 所属的序列槽位表
pub trait ChunkOwner: Send + Sync {
    /// 移除槽位中的 chunk (id 必须匹配)，返回是否移除
    fn release_chunk(&self, index: usize, id: ChunkId) -> bool;

    fn name(&self) -> &str;
}

// ═══════════════════════════════════════════════════════════════════════════
// 类型擦除的 chunk 接口
// ═══════════════════════════════════════════════════════════════════════════

/// 不依赖元素类型的 chunk 接口 (依赖边、GC、调度都通过它操作)
pub trait ChunkBase: Collectable + 'static {
    fn core(&self) -> &ChunkCore;

    /// 已发布的元素数
    fn computed(&self) -> usize;

    /// 执行一次增量计算；数据前进时通知所有下游
    fn exec(&self);

    /// 通知有新的上游数据
    ///
    /// 只有把合并计数从 0 推到 1 的调用者负责调度执行，其余全部合并
    fn notify(self: Arc<Self>);

    /// 估算的内存占用 (字节)
    fn footprint(&self) -> usize;

    fn as_dyn(&self) -> &dyn ChunkBase;

    fn into_dyn(self: Arc<Self>) -> Arc<dyn ChunkBase>;
}

/// 下游依赖者
struct Dependent {
    id: ChunkId,
    chunk: Weak<dyn ChunkBase>,
}

/// chunk 的类型无关状态
pub struct ChunkCore {
    id: ChunkId,
    index: usize,
    transient: bool,
    exec_mode: ExecMode,
    /// 存活的 Handle 数
    refs: AtomicUsize,
    /// notify 合并计数
    notifies: AtomicUsize,
    /// 最近访问的逻辑时间
    last_access: AtomicU64,
    dependents: Mutex<Vec<Dependent>>,
    gc_slot: GcSlot,
    stats: Arc<TaskStats>,
    owner: Weak<dyn ChunkOwner>,
    engine: Arc<EngineShared>,
}

impl ChunkCore {
    pub(crate) fn new(
        index: usize,
        transient: bool,
        exec_mode: ExecMode,
        stats: Arc<TaskStats>,
        owner: Weak<dyn ChunkOwner>,
        engine: Arc<EngineShared>,
    ) -> Self {
        let last_access = engine.tick_clock();
        Self {
            id: NEXT_CHUNK_ID.fetch_add(1, Ordering::Relaxed),
            index,
            transient,
            exec_mode,
            refs: AtomicUsize::new(0),
            notifies: AtomicUsize::new(0),
            last_access: AtomicU64::new(last_access),
            dependents: Mutex::new(Vec::new()),
            gc_slot: GcSlot::new(),
            stats,
            owner,
            engine,
        }
    }

    #[inline]
    pub fn id(&self) -> ChunkId {
        self.id
    }

    /// 在所属序列中的 chunk 下标
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn is_transient(&self) -> bool {
        self.transient
    }

    #[inline]
    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    #[inline]
    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &Arc<TaskStats> {
        &self.stats
    }

    pub fn engine(&self) -> &Arc<EngineShared> {
        &self.engine
    }

    /// 所属序列名 (序列已销毁时返回 None)
    pub fn owner_name(&self) -> Option<String> {
        self.owner.upgrade().map(|owner| owner.name().to_string())
    }

    /// 刷新最近访问时间
    pub(crate) fn touch(&self) {
        self.last_access
            .store(self.engine.tick_clock(), Ordering::Release);
    }

    /// 增加引用，返回是否发生 0→1
    pub(crate) fn inc_refs(&self) -> bool {
        self.refs.fetch_add(1, Ordering::AcqRel) == 0
    }

    /// 减少引用，返回是否发生 1→0
    pub(crate) fn dec_refs(&self) -> bool {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            log::error!("Chunk {} released more handles than it had", self.id);
            panic!("chunk {} refcount underflow", self.id);
        }
        prev == 1
    }

    /// 注册下游依赖者 (图变更线程)
    pub(crate) fn add_dependent(&self, id: ChunkId, chunk: Weak<dyn ChunkBase>) {
        self.dependents.lock().push(Dependent { id, chunk });
    }

    /// 移除下游依赖者，返回是否存在
    pub(crate) fn remove_dependent(&self, id: ChunkId) -> bool {
        let mut dependents = self.dependents.lock();
        match dependents.iter().position(|d| d.id == id) {
            Some(pos) => {
                dependents.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// 当前下游依赖者数量
    pub fn dependent_count(&self) -> usize {
        self.dependents.lock().len()
    }

    /// 下游依赖者 id 列表
    pub fn dependent_ids(&self) -> Vec<ChunkId> {
        self.dependents.lock().iter().map(|d| d.id).collect()
    }

    /// 存活下游的快照 (锁外通知)
    fn live_dependents(&self) -> Vec<Arc<dyn ChunkBase>> {
        self.dependents
            .lock()
            .iter()
            .filter_map(|d| d.chunk.upgrade())
            .collect()
    }

    /// 是否应把计算交给线程池
    fn should_offload(&self) -> bool {
        match self.exec_mode {
            ExecMode::Inline => false,
            ExecMode::Offload => true,
            ExecMode::Auto => self.stats.average() > self.engine.inline_threshold(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Chunk
// ═══════════════════════════════════════════════════════════════════════════

/// 一条序列的一批元素
pub struct Chunk<T: Element> {
    core: ChunkCore,
    computed: ComputedCount,
    buffer: ChunkBuffer<T>,
    /// 计算闭包；锁同时串行化对 buffer 尾部的写入
    computer: Mutex<Computer<T>>,
    /// 构造时取得的上游句柄 (计算闭包可提前释放)
    dependencies: Mutex<Vec<AnyChunkHandle>>,
}

impl<T: Element> Chunk<T> {
    /// 创建 chunk 并向每个上游注册自己
    ///
    /// 必须在图变更线程调用；注册完成前不会有任何 notify
    pub(crate) fn new(
        core: ChunkCore,
        computer: Computer<T>,
        dependencies: Vec<AnyChunkHandle>,
    ) -> Arc<Self> {
        let chunk = Arc::new(Self {
            core,
            computed: ComputedCount::new(),
            buffer: ChunkBuffer::new(),
            computer: Mutex::new(computer),
            dependencies: Mutex::new(dependencies),
        });

        let erased: Arc<dyn ChunkBase> = chunk.clone();
        let weak = Arc::downgrade(&erased);
        for dependency in chunk.dependencies.lock().iter() {
            let upstream = dependency.core();
            upstream.add_dependent(chunk.core.id, weak.clone());
            upstream.stats.link_downstream(&chunk.core.stats);
        }

        chunk
            .core
            .engine
            .gc
            .update_memory_usage(chunk.footprint() as i64);

        chunk
    }

    /// 已发布元素的只读视图
    pub fn data(&self) -> &[T] {
        let len = self.computed.get();
        // SAFETY: len 是已发布的计数，前缀不会再被写入
        unsafe { self.buffer.prefix(len) }
    }

    /// chunk 内偏移 `offset` 的元素 (未计算返回 None)
    pub fn get(&self, offset: usize) -> Option<T> {
        self.data().get(offset).copied()
    }

    pub fn is_complete(&self) -> bool {
        self.computed.is_complete()
    }

    /// 上游依赖数
    pub fn dependency_count(&self) -> usize {
        self.dependencies.lock().len()
    }

    /// 上游 chunk id 列表
    pub fn dependency_ids(&self) -> Vec<ChunkId> {
        self.dependencies.lock().iter().map(|d| d.id()).collect()
    }

    /// 拆除到指定上游的依赖边并归还句柄
    fn release_dependencies(&self, ids: &[ChunkId]) {
        let released: Vec<AnyChunkHandle> = {
            let mut dependencies = self.dependencies.lock();
            let (released, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut *dependencies)
                .into_iter()
                .partition(|d| ids.contains(&d.id()));
            *dependencies = kept;
            released
        };

        for dependency in &released {
            detach(self.core.id, dependency);
            log::trace!(
                "Chunk {} released dependency on chunk {}",
                self.core.id,
                dependency.id()
            );
        }
        // 句柄在锁外析构，可能让上游进入 GC 候选池
        drop(released);
    }

    /// 执行所有待处理的通知
    ///
    /// 循环开始时读取待处理数，exec 结束后扣除；若期间有新通知到达，
    /// 扣除后计数不为 0，再跑一轮。保证 notify 之后开始的 exec 能看到它的效果
    fn run_pending(&self, record: bool) {
        loop {
            let pending = self.core.notifies.load(Ordering::Acquire);
            let started = Instant::now();
            self.exec();
            if record {
                self.core.stats.record(started.elapsed());
            }
            if self.core.notifies.fetch_sub(pending, Ordering::AcqRel) == pending {
                break;
            }
        }
    }
}

impl<T: Element> ChunkBase for Chunk<T> {
    fn core(&self) -> &ChunkCore {
        &self.core
    }

    fn computed(&self) -> usize {
        self.computed.get()
    }

    fn exec(&self) {
        let mut computer = self.computer.lock();
        let start = self.computed.get();
        if start == CHUNK_SIZE {
            return;
        }

        // SAFETY: 持有计算锁，start 为当前已发布计数
        let (published, tail) = unsafe { self.buffer.split_at(start) };
        let mut writer = ChunkWriter::new(published, tail);
        (*computer)(&mut writer);
        let end = writer.len();
        let released = writer.take_released();
        drop(computer);

        self.core.engine.metrics.record_exec();
        if !released.is_empty() {
            self.release_dependencies(&released);
        }

        if end > start && self.computed.publish(end) {
            log::trace!(
                "Chunk {} (index {}) advanced {} -> {}",
                self.core.id,
                self.core.index,
                start,
                end
            );
            for dependent in self.core.live_dependents() {
                dependent.notify();
            }
        }
    }

    fn notify(self: Arc<Self>) {
        let engine = self.core.engine.clone();
        if self.core.notifies.fetch_add(1, Ordering::AcqRel) != 0 {
            engine.metrics.record_coalesced();
            return;
        }

        if self.core.should_offload() {
            if let Some(scheduler) = engine.scheduler() {
                let runner = self.clone();
                let task = Task::new(move || runner.run_pending(false), self.core.stats.clone());
                match scheduler.add_task(task) {
                    Ok(()) => {
                        engine.metrics.record_offloaded();
                        return;
                    }
                    Err(e) => {
                        log::warn!("Chunk {} falls back to inline exec: {}", self.core.id, e);
                    }
                }
            }
        }

        engine.metrics.record_inline();
        self.run_pending(true);
    }

    fn footprint(&self) -> usize {
        std::mem::size_of::<Self>() + CHUNK_SIZE * std::mem::size_of::<T>()
    }

    fn as_dyn(&self) -> &dyn ChunkBase {
        self
    }

    fn into_dyn(self: Arc<Self>) -> Arc<dyn ChunkBase> {
        self
    }
}

impl<T: Element> Collectable for Chunk<T> {
    fn gc_id(&self) -> u64 {
        self.core.id
    }

    fn last_access(&self) -> u64 {
        self.core.last_access()
    }

    fn can_free(&self) -> bool {
        self.core.transient && self.core.refs() == 0
    }

    fn gc_slot(&self) -> &GcSlot {
        &self.core.gc_slot
    }

    fn release(&self) {
        if !self.can_free() {
            log::error!(
                "Chunk {} released while referenced (refs={})",
                self.core.id,
                self.core.refs()
            );
            panic!("chunk {} is not freeable", self.core.id);
        }

        if let Some(owner) = self.core.owner.upgrade() {
            if owner.release_chunk(self.core.index, self.core.id) {
                log::debug!(
                    "Evicted chunk {} of series '{}' (index {})",
                    self.core.id,
                    owner.name(),
                    self.core.index
                );
            }
        }
        self.core.engine.metrics.record_evicted();
    }
}

/// 从上游的依赖者列表中移除 `id`
fn detach(id: ChunkId, dependency: &AnyChunkHandle) {
    if !dependency.core().remove_dependent(id) {
        log::error!(
            "Chunk {} missing from dependents of chunk {}",
            id,
            dependency.id()
        );
        debug_assert!(false, "dependency edge already removed");
    }
}

impl<T: Element> Drop for Chunk<T> {
    fn drop(&mut self) {
        for dependency in self.dependencies.get_mut().iter() {
            detach(self.core.id, dependency);
        }
        self.core
            .engine
            .gc
            .update_memory_usage(-(self.footprint() as i64));
    }
}
