//! 内存预算垃圾回收
//!
//! @yutiansut @quantaxis
//!
//! 只跟踪"可回收候选"：逻辑引用归零的瞬态对象。
//! 内存占用超过上限时，按最近访问时间从旧到新驱逐候选，直到回到上限以内。
//!
//! 队列按 `(last_access, seq)` 排序；同一访问时间按入队顺序先进先出。
//! 所有 Arc 的析构都在锁外进行 (析构可能递归地入队上游对象)

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::{EngineError, Result};

// ═══════════════════════════════════════════════════════════════════════════
// 可回收对象接口
// ═══════════════════════════════════════════════════════════════════════════

/// 可被 GarbageCollector 管理的对象
pub trait Collectable: Send + Sync {
    /// 唯一标识
    fn gc_id(&self) -> u64;

    /// 最近访问的逻辑时间
    fn last_access(&self) -> u64;

    /// 当前是否可以释放
    fn can_free(&self) -> bool;

    /// 回收器在对象内的登记位
    fn gc_slot(&self) -> &GcSlot;

    /// 驱逐回调 (从所属容器中移除自己)
    fn release(&self);
}

/// 对象在回收队列中的位置
///
/// `seq == 0` 表示不在队列中；两个字段只在回收器锁内写入
#[derive(Debug, Default)]
pub struct GcSlot {
    access: AtomicU64,
    seq: AtomicU64,
}

impl GcSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// 是否在回收队列中
    pub fn is_tracked(&self) -> bool {
        self.seq.load(Ordering::Acquire) != 0
    }

    fn key(&self) -> Option<(u64, u64)> {
        match self.seq.load(Ordering::Acquire) {
            0 => None,
            seq => Some((self.access.load(Ordering::Acquire), seq)),
        }
    }

    fn set(&self, access: u64, seq: u64) {
        self.access.store(access, Ordering::Release);
        self.seq.store(seq, Ordering::Release);
    }

    fn clear(&self) {
        self.seq.store(0, Ordering::Release);
    }
}

/// 一次回收扫描的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    /// 被驱逐的对象数
    pub evicted: usize,
    /// 出队时已不可释放而跳过的对象数
    pub skipped: usize,
    /// 扫描结束时的内存占用
    pub usage: i64,
    pub limit: u64,
}

struct GcState<T: ?Sized> {
    queue: BTreeMap<(u64, u64), Arc<T>>,
    next_seq: u64,
}

// ═══════════════════════════════════════════════════════════════════════════
// GarbageCollector
// ═══════════════════════════════════════════════════════════════════════════

/// 按最近访问时间驱逐的内存预算回收器
pub struct GarbageCollector<T: ?Sized + Collectable> {
    state: Mutex<GcState<T>>,
    usage: AtomicI64,
    limit: AtomicU64,
}

impl<T: ?Sized + Collectable> GarbageCollector<T> {
    pub fn new(limit: u64) -> Self {
        log::debug!("Created GarbageCollector with limit {} bytes", limit);
        Self {
            state: Mutex::new(GcState {
                queue: BTreeMap::new(),
                next_seq: 1,
            }),
            usage: AtomicI64::new(0),
            limit: AtomicU64::new(limit),
        }
    }

    /// 登记可回收对象
    ///
    /// 已在队列中且访问时间未变时不做任何事；访问时间变化则重新排队。
    /// 锁内复查 `can_free`，调用期间被重新引用的对象不会入队
    pub fn enqueue(&self, obj: Arc<T>) {
        let displaced;
        {
            let mut state = self.state.lock();
            if !obj.can_free() {
                return;
            }

            let access = obj.last_access();
            let slot = obj.gc_slot();
            displaced = match slot.key() {
                Some((old_access, _)) if old_access == access => return,
                Some(old_key) => state.queue.remove(&old_key),
                None => None,
            };

            let seq = state.next_seq;
            state.next_seq += 1;
            slot.set(access, seq);
            state.queue.insert((access, seq), obj);
        }
        drop(displaced);
    }

    /// 取消登记 (不在队列中时为空操作)
    pub fn dequeue(&self, obj: &T) {
        let removed = {
            let mut state = self.state.lock();
            let slot = obj.gc_slot();
            match slot.key() {
                Some(key) => {
                    slot.clear();
                    state.queue.remove(&key)
                }
                None => None,
            }
        };
        drop(removed);
    }

    /// 调整内存占用 (正数分配、负数释放)
    pub fn update_memory_usage(&self, delta: i64) {
        self.usage.fetch_add(delta, Ordering::AcqRel);
    }

    pub fn memory_usage(&self) -> i64 {
        self.usage.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> u64 {
        self.limit.load(Ordering::Acquire)
    }

    pub fn set_limit(&self, limit: u64) {
        log::info!("GarbageCollector limit set to {} bytes", limit);
        self.limit.store(limit, Ordering::Release);
    }

    fn over_limit(&self) -> bool {
        self.memory_usage() > self.limit() as i64
    }

    /// 回收扫描：驱逐最旧的候选直到占用不超过上限
    ///
    /// 候选耗尽仍超限时返回 `CapacityExceeded`
    pub fn run_gc(&self) -> Result<GcReport> {
        let mut report = GcReport::default();

        while self.over_limit() {
            let next = {
                let mut state = self.state.lock();
                state.queue.pop_first().map(|(_, obj)| {
                    obj.gc_slot().clear();
                    obj
                })
            };

            let Some(obj) = next else {
                let usage = self.memory_usage();
                let limit = self.limit();
                log::warn!(
                    "GC exhausted candidates: usage={} limit={} evicted={}",
                    usage,
                    limit,
                    report.evicted
                );
                return Err(EngineError::CapacityExceeded { usage, limit });
            };

            if !obj.can_free() {
                report.skipped += 1;
                continue;
            }

            obj.release();
            drop(obj);
            report.evicted += 1;
        }

        report.usage = self.memory_usage();
        report.limit = self.limit();
        if report.evicted > 0 {
            log::debug!(
                "GC evicted {} objects, usage now {} / {} bytes",
                report.evicted,
                report.usage,
                report.limit
            );
        }
        Ok(report)
    }

    /// 清空候选队列 (对象本身随最后一个 Arc 释放)
    ///
    /// 释放过程中新入队的上游对象也会被清掉
    pub fn clear(&self) {
        loop {
            let drained = {
                let mut state = self.state.lock();
                let queue = std::mem::take(&mut state.queue);
                for obj in queue.values() {
                    obj.gc_slot().clear();
                }
                queue
            };
            if drained.is_empty() {
                break;
            }
            drop(drained);
        }
    }

    /// 候选数
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 对象是否在候选队列中
    pub fn contains(&self, obj: &T) -> bool {
        obj.gc_slot().is_tracked()
    }

    /// 当前驱逐顺序 (最先驱逐的在前)
    pub fn eviction_order(&self) -> Vec<u64> {
        self.state
            .lock()
            .queue
            .values()
            .map(|obj| obj.gc_id())
            .collect()
    }

    /// 断言驱逐顺序与期望一致
    pub fn assert_sequence(&self, expected: &[u64]) {
        let actual = self.eviction_order();
        assert_eq!(actual, expected, "unexpected GC eviction order");
    }
}
