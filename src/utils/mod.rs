//! 工具模块

/// 引擎配置
pub mod config;

/// 运行指标
pub mod metrics;
