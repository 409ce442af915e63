//! 配置管理
//!
//! 默认值、可选配置文件与 `MTR_` 前缀环境变量三层叠加，加载后统一验证

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// 配置管理器
#[derive(Debug)]
pub struct ConfigManager {
    /// 配置数据
    config: MtrConfig,
    /// 配置文件路径
    config_path: Option<String>,
}

/// MTR系统完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MtrConfig {
    /// 评估流程配置
    pub workflow: WorkflowConfig,
    /// 会话存储配置
    pub storage: StorageConfig,
    /// 日志配置
    pub logging: LoggingConfig,
}

/// 评估流程配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkflowConfig {
    /// 启用自动保存
    pub autosave_enabled: bool,
    /// 自动保存间隔（秒）
    pub autosave_interval_secs: u64,
}

impl WorkflowConfig {
    pub fn autosave_interval(&self) -> Duration {
        Duration::from_secs(self.autosave_interval_secs)
    }
}

/// 存储后端
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    JsonFile,
}

/// 会话存储配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// 存储后端
    pub backend: StorageBackend,
    /// JSON 文件后端的数据目录
    pub data_dir: String,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别或过滤指令
    pub level: String,
    /// 输出事件目标
    pub with_target: bool,
    /// 彩色输出
    pub ansi: bool,
}

/// 配置验证器
#[derive(Debug)]
pub struct ConfigValidator {
    /// 验证规则
    validation_rules: Vec<ValidationRule>,
}

/// 验证规则
#[derive(Debug)]
struct ValidationRule {
    /// 字段路径
    field_path: String,
    /// 验证函数
    validator: fn(&MtrConfig) -> Result<()>,
    /// 错误消息
    error_message: String,
}

impl ConfigManager {
    /// 加载并验证配置
    pub fn new(config_path: Option<&str>) -> Result<Self> {
        let config = Self::load(config_path)?;
        ConfigValidator::new().validate(&config)?;

        Ok(Self {
            config,
            config_path: config_path.map(str::to_string),
        })
    }

    /// 叠加默认值、配置文件和环境变量
    ///
    /// 环境变量形如 `MTR_WORKFLOW__AUTOSAVE_INTERVAL_SECS=60`。
    pub fn load(config_path: Option<&str>) -> Result<MtrConfig> {
        let mut builder = Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path));
        }

        let settings = builder
            .add_source(
                Environment::with_prefix("MTR")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration sources")?;

        let config: MtrConfig = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        match config_path {
            Some(path) => info!("Configuration loaded successfully from: {}", path),
            None => info!("Configuration loaded from defaults and environment"),
        }
        Ok(config)
    }

    /// 获取配置
    pub fn config(&self) -> &MtrConfig {
        &self.config
    }

    pub fn config_path(&self) -> Option<&str> {
        self.config_path.as_deref()
    }

    /// 记录生效的配置概况；应在日志初始化之后调用
    pub fn log_summary(&self) {
        info!(
            "Using configuration from {}: storage={:?}, autosave={} every {}s, log level {}",
            self.config_path.as_deref().unwrap_or("defaults and environment"),
            self.config.storage.backend,
            self.config.workflow.autosave_enabled,
            self.config.workflow.autosave_interval_secs,
            self.config.logging.level
        );
    }
}

impl ConfigValidator {
    /// 创建新的配置验证器
    pub fn new() -> Self {
        let validation_rules = vec![
            ValidationRule {
                field_path: "workflow.autosave_interval_secs".to_string(),
                validator: |config| {
                    if config.workflow.autosave_interval_secs == 0 {
                        Err(anyhow::anyhow!("Auto-save interval cannot be 0"))
                    } else {
                        Ok(())
                    }
                },
                error_message: "Invalid auto-save interval".to_string(),
            },
            ValidationRule {
                field_path: "storage.data_dir".to_string(),
                validator: |config| {
                    if config.storage.backend == StorageBackend::JsonFile
                        && config.storage.data_dir.trim().is_empty()
                    {
                        Err(anyhow::anyhow!("Data directory is required for the json_file backend"))
                    } else {
                        Ok(())
                    }
                },
                error_message: "Invalid storage data directory".to_string(),
            },
            ValidationRule {
                field_path: "logging.level".to_string(),
                validator: |config| {
                    EnvFilter::try_new(&config.logging.level)
                        .map(|_| ())
                        .map_err(|e| anyhow::anyhow!("{}", e))
                },
                error_message: "Invalid log level".to_string(),
            },
        ];

        Self { validation_rules }
    }

    /// 验证配置
    pub fn validate(&self, config: &MtrConfig) -> Result<()> {
        for rule in &self.validation_rules {
            if let Err(e) = (rule.validator)(config) {
                error!("Configuration validation failed for {}: {}", rule.field_path, e);
                return Err(anyhow::anyhow!("{}: {}", rule.error_message, e));
            }
        }

        info!("Configuration validation passed");
        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            autosave_enabled: true,
            autosave_interval_secs: 30,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            data_dir: "./data/sessions".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_target: false,
            ansi: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_defaults_are_valid() {
        let config = MtrConfig::default();
        assert!(config.workflow.autosave_enabled);
        assert_eq!(config.workflow.autosave_interval(), Duration::from_secs(30));
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert!(ConfigValidator::new().validate(&config).is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[storage]\nbackend = \"json_file\"\ndata_dir = \"/tmp/mtr\"\n\n[workflow]\nautosave_interval_secs = 10"
        )
        .unwrap();

        let path = file.path().to_str().unwrap();
        let manager = ConfigManager::new(Some(path)).unwrap();
        let config = manager.config();
        assert_eq!(config.storage.backend, StorageBackend::JsonFile);
        assert_eq!(config.storage.data_dir, "/tmp/mtr");
        assert_eq!(config.workflow.autosave_interval_secs, 10);
        assert!(config.workflow.autosave_enabled);
        assert_eq!(config.logging.level, "info");
        assert_eq!(manager.config_path(), Some(path));
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_summary_logged_after_subscriber_installed() {
        let manager = ConfigManager::new(None).unwrap();

        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, || manager.log_summary());

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("defaults and environment"));
        assert!(output.contains("storage=Memory"));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        assert!(ConfigManager::load(Some("/nonexistent/mtr-config.toml")).is_err());
    }

    #[test]
    fn test_validation_rules() {
        let validator = ConfigValidator::new();

        let mut config = MtrConfig::default();
        config.workflow.autosave_interval_secs = 0;
        assert!(validator.validate(&config).is_err());

        let mut config = MtrConfig::default();
        config.storage.backend = StorageBackend::JsonFile;
        config.storage.data_dir = "  ".to_string();
        assert!(validator.validate(&config).is_err());

        let mut config = MtrConfig::default();
        config.logging.level = "mtr_workflow=debug,warn".to_string();
        assert!(validator.validate(&config).is_ok());
        config.logging.level = "mtr=verbose".to_string();
        assert!(validator.validate(&config).is_err());
    }
}
