//! 应用配置模块
//!
//! 所有配置保存在配置目录下的 `config.json` 中，按模块分节（`transfer`、`cache`、
//! `sync`、`log`）。缺失或格式错误的分节使用默认值。

use crate::core::cache::DEFAULT_DIR_TTL;
use crate::core::engine::SyncOptions;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "config.json";

/// 读取 `config.json` 中的一个分节
pub fn load_section<T: DeserializeOwned + Default>(config_dir: &Path, key: &str) -> T {
    let config_file = config_dir.join(CONFIG_FILE_NAME);
    fs::read_to_string(&config_file)
        .ok()
        .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
        .and_then(|config| config.get(key).cloned())
        .and_then(|section| match serde_json::from_value::<T>(section) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("配置项 {} 格式错误，使用默认值: {}", key, e);
                None
            }
        })
        .unwrap_or_default()
}

/// 写入 `config.json` 中的一个分节，保留其他分节
pub fn save_section<T: Serialize>(config_dir: &Path, key: &str, value: &T) -> io::Result<()> {
    let config_file = config_dir.join(CONFIG_FILE_NAME);

    // 读取现有配置
    let mut config: serde_json::Value = if config_file.exists() {
        let content = fs::read_to_string(&config_file)?;
        serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
    } else {
        serde_json::json!({})
    };
    if !config.is_object() {
        config = serde_json::json!({});
    }

    config[key] = serde_json::to_value(value).map_err(io::Error::other)?;

    fs::create_dir_all(config_dir)?;
    let content = serde_json::to_string_pretty(&config).map_err(io::Error::other)?;
    fs::write(&config_file, content)
}

/// 传输配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferConfig {
    /// 最大并行传输数（至少为 1）
    #[serde(default = "default_max_parallel")]
    pub max_parallel_transfers: usize,
    /// 上传限速（字节/秒），0 表示不限速
    #[serde(default)]
    pub upload_rate_limit: u64,
    /// 下载限速（字节/秒），0 表示不限速
    #[serde(default)]
    pub download_rate_limit: u64,
    /// 断点续传状态文件，未设置时使用配置目录下的 resume.json
    #[serde(default)]
    pub resume_state_file: Option<PathBuf>,
}

fn default_max_parallel() -> usize {
    4
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_parallel_transfers: default_max_parallel(),
            upload_rate_limit: 0,
            download_rate_limit: 0,
            resume_state_file: None,
        }
    }
}

impl TransferConfig {
    pub fn load(config_dir: &Path) -> Self {
        let mut config: Self = load_section(config_dir, "transfer");
        config.max_parallel_transfers = config.max_parallel_transfers.max(1);
        config
    }

    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        save_section(config_dir, "transfer", self)
    }

    pub fn resume_state_path(&self, config_dir: &Path) -> PathBuf {
        self.resume_state_file
            .clone()
            .unwrap_or_else(|| config_dir.join("resume.json"))
    }
}

/// 缓存配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// 目录列表缓存有效期（秒）
    #[serde(default = "default_dir_ttl")]
    pub dir_ttl_secs: u64,
}

fn default_dir_ttl() -> u64 {
    DEFAULT_DIR_TTL.as_secs()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir_ttl_secs: default_dir_ttl(),
        }
    }
}

impl CacheConfig {
    /// 从配置文件加载缓存配置
    pub fn load(config_dir: &Path) -> Self {
        load_section(config_dir, "cache")
    }

    /// 保存缓存配置
    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        save_section(config_dir, "cache", self)
    }

    pub fn dir_ttl(&self) -> Duration {
        Duration::from_secs(self.dir_ttl_secs)
    }
}

/// 读取同步选项（`sync` 分节）
pub fn load_sync_options(config_dir: &Path) -> SyncOptions {
    load_section(config_dir, "sync")
}

pub fn save_sync_options(config_dir: &Path, options: &SyncOptions) -> io::Result<()> {
    save_section(config_dir, "sync", options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::{CompareMethod, SyncMode};

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(TransferConfig::load(dir.path()), TransferConfig::default());
        assert_eq!(CacheConfig::load(dir.path()).dir_ttl(), Duration::from_secs(30));
        assert_eq!(load_sync_options(dir.path()).mode, SyncMode::Upload);
    }

    #[test]
    fn test_sections_are_read_independently() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{
                "transfer": { "maxParallelTransfers": 0, "uploadRateLimit": 1024 },
                "cache": { "dirTtlSecs": "not a number" },
                "sync": { "mode": "mirror", "compareMethod": "size", "deleteExtra": true,
                          "excludePatterns": ["*.tmp"] }
            }"#,
        )
        .unwrap();

        let transfer = TransferConfig::load(dir.path());
        assert_eq!(transfer.max_parallel_transfers, 1);
        assert_eq!(transfer.upload_rate_limit, 1024);
        assert_eq!(transfer.download_rate_limit, 0);
        assert_eq!(
            transfer.resume_state_path(dir.path()),
            dir.path().join("resume.json")
        );

        // 格式错误的分节回退到默认值
        assert_eq!(CacheConfig::load(dir.path()), CacheConfig::default());

        let sync = load_sync_options(dir.path());
        assert_eq!(sync.mode, SyncMode::Mirror);
        assert_eq!(sync.compare_method, CompareMethod::Size);
        assert!(sync.delete_extra);
        assert_eq!(sync.exclude_patterns, vec!["*.tmp".to_string()]);
    }

    #[test]
    fn test_save_preserves_other_sections() {
        let dir = tempfile::tempdir().unwrap();
        CacheConfig { dir_ttl_secs: 5 }.save(dir.path()).unwrap();
        TransferConfig {
            max_parallel_transfers: 8,
            ..Default::default()
        }
        .save(dir.path())
        .unwrap();

        assert_eq!(CacheConfig::load(dir.path()).dir_ttl_secs, 5);
        assert_eq!(TransferConfig::load(dir.path()).max_parallel_transfers, 8);
    }
}
