pub mod local;

#[cfg(test)]
pub(crate) mod mock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

pub use local::LocalTransport;

// ============ 公共常量 ============

/// 默认传输缓冲区（256KB）
pub const DEFAULT_BUFFER_SIZE: usize = 256 * 1024;
/// 大文件阈值（10MB），超过后使用大缓冲区
pub const LARGE_FILE_THRESHOLD: u64 = 10 * 1024 * 1024;
/// 大文件缓冲区（1MB）
pub const LARGE_BUFFER_SIZE: usize = 1024 * 1024;

/// 根据文件大小选择缓冲区大小
pub fn optimal_buffer_size(file_size: u64) -> usize {
    if file_size > LARGE_FILE_THRESHOLD {
        LARGE_BUFFER_SIZE
    } else {
        DEFAULT_BUFFER_SIZE
    }
}

/// 远程目录项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    pub mod_time: DateTime<Utc>,
    pub permissions: String,
}

/// 传输进度
#[derive(Debug, Clone, Default)]
pub struct TransferProgress {
    pub file_name: String,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub bytes_per_second: u64,
}

/// 进度回调
pub type ProgressFn = Arc<dyn Fn(TransferProgress) + Send + Sync>;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// 文件传输能力（由 SFTP/FTPS 等协议适配器实现）
///
/// 远程路径统一使用 `/` 分隔。上传/下载在 `resume` 为 true 且目标已有部分内容时
/// 必须从已有偏移继续，并以合理频率调用进度回调。
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// 列出目录内容（不递归）
    async fn list(&self, path: &str) -> Result<Vec<FileRecord>>;

    /// 获取文件或目录信息
    async fn stat(&self, path: &str) -> Result<FileRecord>;

    async fn mkdir(&self, path: &str) -> Result<()>;

    /// 删除文件
    async fn remove(&self, path: &str) -> Result<()>;

    /// 删除目录
    async fn remove_dir(&self, path: &str) -> Result<()>;

    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// 上传本地文件
    async fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        resume: bool,
        on_progress: Option<ProgressFn>,
    ) -> Result<()>;

    /// 下载远程文件
    async fn download(
        &self,
        remote_path: &str,
        local_path: &Path,
        resume: bool,
        on_progress: Option<ProgressFn>,
    ) -> Result<()>;

    /// 流式读取远程文件
    async fn get_reader(&self, path: &str) -> Result<BoxedReader>;

    /// 不经过带宽限制的流式读取，用于计算校验和等内部读取
    async fn get_raw_reader(&self, path: &str) -> Result<BoxedReader> {
        self.get_reader(path).await
    }

    /// 流式写入远程文件
    async fn get_writer(&self, path: &str, append: bool) -> Result<BoxedWriter>;

    async fn current_dir(&self) -> Result<String>;

    async fn change_dir(&self, path: &str) -> Result<()>;

    /// 协议名称（用于日志）
    fn protocol_name(&self) -> &str;

    /// 连接标识（协议、主机、端口、用户或根目录），作为目录缓存的作用域
    ///
    /// 不同连接必须返回不同的值。
    fn cache_scope(&self) -> String;
}

/// 拼接远程路径
pub fn join_remote(base: &str, relative: &str) -> String {
    let relative = relative.trim_start_matches('/');
    if relative.is_empty() {
        return base.to_string();
    }
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        format!("/{}", relative)
    } else {
        format!("{}/{}", base, relative)
    }
}

/// 远程路径的父目录
pub fn remote_parent(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
        None => ".".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optimal_buffer_size() {
        assert_eq!(optimal_buffer_size(1024), DEFAULT_BUFFER_SIZE);
        assert_eq!(optimal_buffer_size(LARGE_FILE_THRESHOLD), DEFAULT_BUFFER_SIZE);
        assert_eq!(optimal_buffer_size(LARGE_FILE_THRESHOLD + 1), LARGE_BUFFER_SIZE);
    }

    #[test]
    fn test_join_remote() {
        assert_eq!(join_remote("/data", "a/b.txt"), "/data/a/b.txt");
        assert_eq!(join_remote("/data/", "/a.txt"), "/data/a.txt");
        assert_eq!(join_remote("/", "a.txt"), "/a.txt");
        assert_eq!(join_remote("", "a.txt"), "/a.txt");
        assert_eq!(join_remote("/data", ""), "/data");
    }

    #[test]
    fn test_remote_parent() {
        assert_eq!(remote_parent("/data/a/b.txt"), "/data/a");
        assert_eq!(remote_parent("/a.txt"), "/");
        assert_eq!(remote_parent("a.txt"), ".");
    }
}
