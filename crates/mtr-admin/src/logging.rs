//! 日志初始化

use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

/// 解析日志过滤指令；命令行覆盖优先于配置
pub fn build_filter(config: &LoggingConfig, override_level: Option<&str>) -> Result<EnvFilter> {
    let level = override_level.unwrap_or(&config.level);
    EnvFilter::try_new(level).with_context(|| format!("Invalid log level: {}", level))
}

/// 安装全局 tracing 订阅器，日志写到标准错误
pub fn init_logging(config: &LoggingConfig, override_level: Option<&str>) -> Result<()> {
    let filter = build_filter(config, override_level)?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target)
        .with_ansi(config.ansi)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))?;

    tracing::debug!("Logging initialised at level {}", override_level.unwrap_or(&config.level));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_takes_precedence() {
        let config = LoggingConfig {
            level: "mtr=verbose".to_string(),
            ..LoggingConfig::default()
        };
        assert!(build_filter(&config, None).is_err());
        assert!(build_filter(&config, Some("debug")).is_ok());
    }

    #[test]
    fn test_second_init_reports_error() {
        let config = LoggingConfig {
            ansi: false,
            ..LoggingConfig::default()
        };
        let _ = init_logging(&config, Some("warn"));
        assert!(init_logging(&config, Some("warn")).is_err());
    }
}
