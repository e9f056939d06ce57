//! 核心错误类型

use crate::core::transfer::TransferStatus;
use std::path::PathBuf;

/// 传输调度与同步引擎的错误
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// 队列或历史中不存在该传输任务
    #[error("传输任务不存在: {0}")]
    NotFound(String),

    /// 当前状态不允许该操作
    #[error("传输任务 {id} 处于 {status} 状态，无法{action}")]
    InvalidState {
        id: String,
        status: TransferStatus,
        action: &'static str,
    },

    /// Transport 返回的错误
    #[error("{op} {path} 失败: {source}")]
    Transport {
        op: &'static str,
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// 本地文件系统错误
    #[error("{op} {} 失败: {source}", path.display())]
    LocalIo {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 操作被取消
    #[error("操作已取消")]
    Cancelled,

    /// 断点续传状态等持久化失败
    #[error("持久化 {} 失败: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("序列化失败: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// 包装 Transport 错误，附带操作名和路径
    pub fn transport(op: &'static str, path: impl Into<String>, source: anyhow::Error) -> Self {
        CoreError::Transport {
            op,
            path: path.into(),
            source: source.into(),
        }
    }

    pub fn local_io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CoreError::LocalIo {
            op,
            path: path.into(),
            source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CoreError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
