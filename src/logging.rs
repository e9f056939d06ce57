//! 日志模块 - 文件/控制台日志初始化与传输记录

use crate::config::{load_section, save_section};
use crate::core::transfer::TransferDirection;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// 日志文件名
pub const LOG_FILE_NAME: &str = "ftpsync.log";

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否启用日志记录
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    /// 从配置文件加载日志配置
    pub fn load(config_dir: &Path) -> Self {
        load_section(config_dir, "log")
    }

    /// 保存日志配置
    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        save_section(config_dir, "log", self)
    }

    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

/// 初始化日志：文件日志 + 控制台日志
///
/// 返回的 guard 需要一直持有，丢弃后缓冲中的日志会被刷新并停止写入文件。
pub fn init_logging(log_dir: &Path, config: &LogConfig) -> Option<WorkerGuard> {
    if !config.enabled {
        // 日志已禁用，只初始化一个空的 subscriber
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return None;
    }

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(config.tracing_level().into());

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        // 无法创建日志目录，回退到控制台
        let console_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false);
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init();
        tracing::warn!("创建日志目录失败 {}: {}", log_dir.display(), e);
        return None;
    }

    let file_appender = tracing_appender::rolling::never(log_dir, LOG_FILE_NAME);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init();

    Some(guard)
}

/// 一次传输的结果记录
#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub direction: TransferDirection,
    pub protocol: String,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub size: u64,
    pub duration: Duration,
    pub error: Option<String>,
}

/// 传输日志记录器
///
/// 由 `TransferManager` 和 `Syncer` 在每次传输结束后调用，构造时注入。
pub trait TransferLog: Send + Sync {
    fn log_transfer(&self, record: &TransferRecord);
}

/// 输出到 tracing 的默认实现
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTransferLog;

impl TransferLog for TracingTransferLog {
    fn log_transfer(&self, record: &TransferRecord) {
        let duration_ms = record.duration.as_millis() as u64;
        match &record.error {
            None => tracing::info!(
                direction = %record.direction,
                protocol = %record.protocol,
                local = %record.local_path.display(),
                remote = %record.remote_path,
                size = record.size,
                duration_ms,
                "传输完成"
            ),
            Some(error) => tracing::warn!(
                direction = %record.direction,
                protocol = %record.protocol,
                local = %record.local_path.display(),
                remote = %record.remote_path,
                size = record.size,
                duration_ms,
                error = %error,
                "传输失败"
            ),
        }
    }
}
