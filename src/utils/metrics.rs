//! 引擎运行指标
//!
//! 原子计数器，支持实时查询和 JSON 导出
//!
//! @author @yutiansut @quantaxis

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// 引擎计数器
#[derive(Debug, Default)]
pub struct EngineMetrics {
    chunks_built: AtomicU64,
    chunks_evicted: AtomicU64,
    exec_runs: AtomicU64,
    inline_runs: AtomicU64,
    offloaded_runs: AtomicU64,
    coalesced_notifies: AtomicU64,
    gc_passes: AtomicU64,
}

/// 指标快照
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// 构造的 chunk 数
    pub chunks_built: u64,
    /// 被 GC 驱逐的 chunk 数
    pub chunks_evicted: u64,
    /// exec 调用次数
    pub exec_runs: u64,
    /// 在通知线程内执行的调度次数
    pub inline_runs: u64,
    /// 提交到线程池的调度次数
    pub offloaded_runs: u64,
    /// 被合并的 notify 数
    pub coalesced_notifies: u64,
    pub gc_passes: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_built(&self) {
        self.chunks_built.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_evicted(&self) {
        self.chunks_evicted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_exec(&self) {
        self.exec_runs.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_inline(&self) {
        self.inline_runs.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_offloaded(&self) {
        self.offloaded_runs.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_coalesced(&self) {
        self.coalesced_notifies.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_gc_pass(&self) {
        self.gc_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            chunks_built: self.chunks_built.load(Ordering::Relaxed),
            chunks_evicted: self.chunks_evicted.load(Ordering::Relaxed),
            exec_runs: self.exec_runs.load(Ordering::Relaxed),
            inline_runs: self.inline_runs.load(Ordering::Relaxed),
            offloaded_runs: self.offloaded_runs.load(Ordering::Relaxed),
            coalesced_notifies: self.coalesced_notifies.load(Ordering::Relaxed),
            gc_passes: self.gc_passes.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSnapshot {
    /// 导出为 JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}
