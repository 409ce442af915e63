//! # MTR管理模块
//!
//! 提供配置加载、配置验证与日志初始化等运维功能

pub mod config;
pub mod logging;

pub use config::{
    ConfigManager, ConfigValidator, LoggingConfig, MtrConfig, StorageBackend, StorageConfig,
    WorkflowConfig,
};
pub use logging::{build_filter, init_logging};
