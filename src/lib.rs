use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod transport;

pub use crate::core::{
    DirectoryCache, ResumeManager, SyncOptions, SyncResult, Syncer, TransferManager,
};
pub use error::{CoreError, Result};

use crate::config::{CacheConfig, TransferConfig};
use crate::core::throttle::BandwidthLimiter;
use crate::logging::{TracingTransferLog, TransferLog};
use crate::transport::Transport;

/// 应用状态，持有各传输共享的限速器、断点续传状态和目录缓存
#[derive(Clone)]
pub struct AppState {
    pub config_dir: PathBuf,
    pub transfer_config: TransferConfig,
    pub bandwidth: Arc<BandwidthLimiter>,
    pub resume: Arc<ResumeManager>,
    pub dir_cache: Arc<DirectoryCache>,
    pub transfer_log: Arc<dyn TransferLog>,
}

impl AppState {
    /// 从配置目录加载状态，需要在 tokio 运行时内调用
    pub fn load(config_dir: &Path) -> Self {
        let transfer_config = TransferConfig::load(config_dir);
        let cache_config = CacheConfig::load(config_dir);

        let bandwidth = Arc::new(BandwidthLimiter::new(
            transfer_config.upload_rate_limit,
            transfer_config.download_rate_limit,
        ));
        let resume = Arc::new(ResumeManager::new(
            transfer_config.resume_state_path(config_dir),
        ));
        let dir_cache = Arc::new(DirectoryCache::new(cache_config.dir_ttl()));

        tracing::debug!(
            "已加载配置: 并行数 {}, 上传限速 {}, 下载限速 {}, 目录缓存 {}s",
            transfer_config.max_parallel_transfers,
            transfer_config.upload_rate_limit,
            transfer_config.download_rate_limit,
            cache_config.dir_ttl_secs
        );

        Self {
            config_dir: config_dir.to_path_buf(),
            transfer_config,
            bandwidth,
            resume,
            dir_cache,
            transfer_log: Arc::new(TracingTransferLog),
        }
    }

    /// 创建绑定到指定 Transport 的传输管理器
    pub fn transfer_manager(&self, transport: Arc<dyn Transport>) -> TransferManager {
        TransferManager::builder(transport)
            .max_parallel(self.transfer_config.max_parallel_transfers)
            .transfer_log(self.transfer_log.clone())
            .resume_manager(self.resume.clone())
            .build()
    }

    /// 创建绑定到指定 Transport 的同步器，共享目录缓存
    pub fn syncer(&self, transport: Arc<dyn Transport>, options: SyncOptions) -> Syncer {
        Syncer::new(transport, options)
            .with_cache(self.dir_cache.clone())
            .with_transfer_log(self.transfer_log.clone())
    }

    /// 关闭前刷新断点续传状态
    pub async fn shutdown(&self) {
        self.resume.flush().await;
        self.dir_cache.close();
    }
}

pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            // Linux
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        }
    }

    /// 应用配置目录
    pub fn app_config_dir() -> PathBuf {
        config_dir()
            .map(|p| p.join("ftpsync"))
            .unwrap_or_else(|| PathBuf::from(".ftpsync"))
    }
}
