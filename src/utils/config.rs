//! 配置管理模块
//!
//! @yutiansut @quantaxis

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::{EngineError, Result};

/// 引擎配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine::tick 是否执行回收扫描
    #[serde(default = "default_gc_enabled")]
    pub gc_enabled: bool,

    /// 内存预算 (字节)
    #[serde(default = "default_gc_memory_limit")]
    pub gc_memory_limit: u64,

    /// 工作线程数 (0 = 不启动线程池，全部内联执行)
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// 平均耗时超过该值 (微秒) 的计算交给线程池
    #[serde(default = "default_inline_threshold_us")]
    pub inline_threshold_us: u64,
}

fn default_gc_enabled() -> bool {
    true
}

fn default_gc_memory_limit() -> u64 {
    256 * 1024 * 1024 // 256 MiB
}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

fn default_inline_threshold_us() -> u64 {
    20
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gc_enabled: default_gc_enabled(),
            gc_memory_limit: default_gc_memory_limit(),
            worker_threads: default_worker_threads(),
            inline_threshold_us: default_inline_threshold_us(),
        }
    }
}

impl EngineConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| EngineError::IOError(format!("Failed to read config file: {}", e)))?;
        Self::from_toml(&content)
    }

    pub fn load_default() -> Result<Self> {
        Self::load_from_file("config/engine.toml")
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| EngineError::ConfigError(format!("Failed to parse config file: {}", e)))
    }
}
