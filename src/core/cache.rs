//! 目录列表缓存
//!
//! 按 "作用域 + 路径" 缓存目录列表，避免浏览和同步时重复请求远程服务器。

use crate::transport::FileRecord;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 默认缓存有效期
pub const DEFAULT_DIR_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct CacheEntry {
    files: Vec<FileRecord>,
    cached_at: Instant,
}

type EntryMap = HashMap<String, CacheEntry>;

/// 带 TTL 的目录列表缓存
///
/// 超过 TTL 的条目视为不存在。后台清理任务以 TTL 为周期删除过期条目，
/// 仅用于限制内存占用，`get` 本身不依赖它。
pub struct DirectoryCache {
    entries: Arc<RwLock<EntryMap>>,
    ttl: Duration,
    sweeper: CancellationToken,
}

impl DirectoryCache {
    /// 创建缓存；在 tokio 运行时内时同时启动后台清理任务
    pub fn new(ttl: Duration) -> Self {
        let entries = Arc::new(RwLock::new(HashMap::new()));
        let sweeper = CancellationToken::new();

        if !ttl.is_zero() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(run_sweeper(Arc::downgrade(&entries), ttl, sweeper.clone()));
            }
        }

        Self {
            entries,
            ttl,
            sweeper,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn key(scope: &str, path: &str) -> String {
        format!("{}:{}", scope, path)
    }

    /// 读取未过期的缓存（返回副本）
    pub fn get(&self, scope: &str, path: &str) -> Option<Vec<FileRecord>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get(&Self::key(scope, path))?;

        let age = entry.cached_at.elapsed();
        if age > self.ttl {
            return None;
        }

        debug!(
            "命中目录缓存 {}:{} ({} 项, 缓存于 {})",
            scope,
            path,
            entry.files.len(),
            format_age(age.as_secs())
        );
        Some(entry.files.clone())
    }

    pub fn set(&self, scope: &str, path: &str, files: &[FileRecord]) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            Self::key(scope, path),
            CacheEntry {
                files: files.to_vec(),
                cached_at: Instant::now(),
            },
        );
    }

    /// 目录内容发生变化后调用（上传、删除、重命名、新建目录）
    pub fn invalidate(&self, scope: &str, path: &str) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.remove(&Self::key(scope, path)).is_some() {
            debug!("目录缓存失效: {}:{}", scope, path);
        }
    }

    pub fn invalidate_all(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// 立即删除过期条目，返回删除数量
    pub fn sweep(&self) -> usize {
        sweep_expired(&self.entries, self.ttl)
    }

    /// 条目数（包括尚未清理的过期条目）
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 停止后台清理任务
    pub fn close(&self) {
        self.sweeper.cancel();
    }
}

impl Default for DirectoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_DIR_TTL)
    }
}

impl Drop for DirectoryCache {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}

fn sweep_expired(entries: &RwLock<EntryMap>, ttl: Duration) -> usize {
    let mut entries = entries.write().unwrap_or_else(PoisonError::into_inner);
    let before = entries.len();
    entries.retain(|_, entry| entry.cached_at.elapsed() <= ttl);
    before - entries.len()
}

async fn run_sweeper(entries: Weak<RwLock<EntryMap>>, ttl: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + ttl, ttl);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let Some(entries) = entries.upgrade() else {
                    break;
                };
                let removed = sweep_expired(&entries, ttl);
                if removed > 0 {
                    debug!("清理过期目录缓存: {} 项", removed);
                }
            }
        }
    }
}

/// 格式化缓存时间
pub fn format_age(age_seconds: u64) -> String {
    if age_seconds < 60 {
        format!("{}秒前", age_seconds)
    } else if age_seconds < 3600 {
        format!("{}分钟前", age_seconds / 60)
    } else if age_seconds < 86400 {
        format!("{}小时前", age_seconds / 3600)
    } else {
        format!("{}天前", age_seconds / 86400)
    }
}
