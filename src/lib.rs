//! # CHUNKFLOW
//!
//! 分块惰性求值引擎 - 流式时间序列数据流图的计算内核
//!
//! ## 核心能力
//!
//! - **分块计算**: 每条序列按固定大小 (CHUNK_SIZE) 分块，元素只计算一次
//! - **增量填充**: chunk 的 computed count 单调递增，已发布的元素不可变
//! - **依赖追踪**: 构造时显式记录上下游依赖边，驱逐时直接拆除
//! - **引用计数**: Handle 维护逻辑引用数，归零即进入 GC 候选池
//! - **内存预算**: GarbageCollector 按最近访问时间驱逐，驱逐后按需重算
//! - **关键路径调度**: 代价高的计算交给线程池，按关键路径时长排序
//!
//! ## 架构设计
//!
//! ```text
//! 消费者 (渲染/导出)
//!     ↓ get_chunk(i)
//! DataSeries (series/) ── BuildContext 记录依赖
//!     ↓
//! Chunk (chunk/) ── notify 合并 → exec → 通知下游
//!     ↓                       ↓
//! GarbageCollector (gc/)   TaskScheduler (scheduler/)
//!     ↑
//! Engine (runtime/) ── 持有共享单例 + 逻辑时钟
//! ```
//!
//! ## 线程模型
//!
//! - 图变更线程: get_chunk / 构造 / 依赖边增删 / GC 扫描
//! - 工作线程池: 只执行平均耗时超过阈值的 chunk 计算闭包

#![allow(dead_code)]

// ============================================================================
// 外部依赖
// ============================================================================

// 并发工具
pub use parking_lot;

// 序列化
pub use serde;
pub use serde_json;

// 日志
pub use log;

// 错误处理
pub use thiserror;

// ============================================================================
// 内部模块
// ============================================================================

/// Chunk 与句柄 - 分块缓冲、增量填充、引用计数
pub mod chunk;

/// 序列 - chunk 工厂/缓存、构造上下文、数据源与算子
pub mod series;

/// 内存预算垃圾回收
pub mod gc;

/// 关键路径优先的任务调度器
pub mod scheduler;

/// 引擎运行时 (共享单例容器)
pub mod runtime;

/// 工具模块 (配置、指标)
pub mod utils;

// ============================================================================
// 重导出常用类型
// ============================================================================

pub use chunk::{
    AnyChunkHandle, Chunk, ChunkBase, ChunkHandle, ChunkId, ChunkWriter, Computer, Element,
    CHUNK_SIZE,
};
pub use gc::{Collectable, GarbageCollector, GcReport, GcSlot};
pub use runtime::{ChunkCollector, Engine, EngineShared};
pub use scheduler::{Task, TaskScheduler, TaskStats};
pub use series::nodes::{BinaryOp, UnaryOp};
pub use series::{BuildContext, ChunkFactory, DataSeries, ExecMode, SeriesOptions, SourceSeries};
pub use utils::config::EngineConfig;
pub use utils::metrics::{EngineMetrics, MetricsSnapshot};

// ============================================================================
// 全局错误类型
// ============================================================================

/// 引擎错误类型
///
/// 只覆盖可恢复的运行时条件；图结构的不变量破坏 (重复释放、移除不存在的
/// 依赖边等) 属于编程错误，直接断言失败
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Memory capacity exceeded: usage={usage} bytes, limit={limit} bytes, nothing evictable")]
    CapacityExceeded { usage: i64, limit: u64 },

    #[error("Task not ready: {0} unfinished dependencies")]
    TaskNotReady(usize),

    #[error("Scheduler is shut down")]
    SchedulerShutdown,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IOError(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

// ============================================================================
// 测试模块
// ============================================================================
