//! 断点续传状态
//!
//! 每个进行中的传输对应一条 `ResumeInfo`，以 JSON 数组形式整体写入状态文件。
//! 写入由单个后台任务串行完成，连续的快照会被合并，进程崩溃最多丢失最近一次检查点，
//! 但不会留下半写的文件（先写临时文件再重命名）。

use crate::core::transfer::TransferDirection;
use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// 单个传输的检查点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeInfo {
    pub id: String,
    pub direction: TransferDirection,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
}

impl ResumeInfo {
    /// 已有进度且尚未完成
    pub fn is_resumable(&self) -> bool {
        self.transferred_bytes > 0 && self.transferred_bytes < self.total_bytes
    }
}

enum WriteRequest {
    Snapshot(Vec<ResumeInfo>),
    Flush(oneshot::Sender<()>),
}

pub struct ResumeManager {
    state_path: PathBuf,
    transfers: RwLock<HashMap<String, ResumeInfo>>,
    writer: Option<mpsc::UnboundedSender<WriteRequest>>,
}

impl ResumeManager {
    /// 打开状态文件；文件不存在或损坏时以空状态启动
    ///
    /// 在 tokio 运行时内创建时使用后台写入任务，否则同步写入。
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let transfers = load_state(&state_path);

        let writer = tokio::runtime::Handle::try_current().ok().map(|handle| {
            let (tx, rx) = mpsc::unbounded_channel();
            handle.spawn(run_writer(state_path.clone(), rx));
            tx
        });

        if !transfers.is_empty() {
            tracing::info!(
                "加载断点续传状态: {} 条记录 ({})",
                transfers.len(),
                state_path.display()
            );
        }

        Self {
            state_path,
            transfers: RwLock::new(transfers),
            writer,
        }
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// 记录传输开始（进度为 0）
    pub fn start_transfer(
        &self,
        id: &str,
        direction: TransferDirection,
        local_path: &Path,
        remote_path: &str,
        total_bytes: u64,
    ) {
        let now = Utc::now();
        let mut transfers = self.write();
        transfers.insert(
            id.to_string(),
            ResumeInfo {
                id: id.to_string(),
                direction,
                local_path: local_path.to_path_buf(),
                remote_path: remote_path.to_string(),
                total_bytes,
                transferred_bytes: 0,
                start_time: now,
                last_update: now,
                checksum: String::new(),
            },
        );
        self.persist(&transfers);
    }

    pub fn update_progress(&self, id: &str, transferred_bytes: u64) {
        let mut transfers = self.write();
        if let Some(info) = transfers.get_mut(id) {
            info.transferred_bytes = transferred_bytes;
            info.last_update = Utc::now();
            self.persist(&transfers);
        }
    }

    /// 开始时未知的总大小在传输中得知后补写
    pub fn update_total(&self, id: &str, total_bytes: u64) {
        let mut transfers = self.write();
        if let Some(info) = transfers.get_mut(id) {
            if info.total_bytes != total_bytes {
                info.total_bytes = total_bytes;
                info.last_update = Utc::now();
                self.persist(&transfers);
            }
        }
    }

    /// 传输完成，不再需要续传
    pub fn complete_transfer(&self, id: &str) {
        let mut transfers = self.write();
        if transfers.remove(id).is_some() {
            self.persist(&transfers);
        }
    }

    /// 传输失败，保留记录以便之后续传
    pub fn fail_transfer(&self, id: &str, transferred_bytes: u64) {
        let mut transfers = self.write();
        if let Some(info) = transfers.get_mut(id) {
            info.transferred_bytes = transferred_bytes;
            info.last_update = Utc::now();
            self.persist(&transfers);
        }
    }

    /// 可续传的记录（0 < 已传输 < 总大小）
    pub fn get_incomplete(&self) -> Vec<ResumeInfo> {
        let mut result: Vec<ResumeInfo> = self
            .read()
            .values()
            .filter(|info| info.is_resumable())
            .cloned()
            .collect();
        sort_entries(&mut result);
        result
    }

    pub fn get_resume_info(&self, id: &str) -> Option<ResumeInfo> {
        self.read().get(id).cloned()
    }

    /// 删除最后更新时间早于 `max_age` 的记录
    pub fn clear_old(&self, max_age: Duration) {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return;
        };

        let mut transfers = self.write();
        let before = transfers.len();
        transfers.retain(|_, info| info.last_update >= cutoff);
        let removed = before - transfers.len();
        if removed > 0 {
            tracing::info!("清理过期断点续传记录: {} 条", removed);
        }
        self.persist(&transfers);
    }

    pub fn clear(&self) {
        let mut transfers = self.write();
        transfers.clear();
        self.persist(&transfers);
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }

    /// 等待已排队的写入全部落盘
    pub async fn flush(&self) {
        if let Some(writer) = &self.writer {
            let (tx, rx) = oneshot::channel();
            if writer.send(WriteRequest::Flush(tx)).is_ok() {
                let _ = rx.await;
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, ResumeInfo>> {
        self.transfers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, ResumeInfo>> {
        self.transfers.write().unwrap_or_else(PoisonError::into_inner)
    }

    // 在持有写锁时调用，保证快照按修改顺序进入写入队列
    fn persist(&self, transfers: &HashMap<String, ResumeInfo>) {
        let mut snapshot: Vec<ResumeInfo> = transfers.values().cloned().collect();
        sort_entries(&mut snapshot);

        match &self.writer {
            Some(writer) => {
                if writer.send(WriteRequest::Snapshot(snapshot)).is_err() {
                    tracing::warn!("断点续传写入任务已停止，检查点未保存");
                }
            }
            None => {
                if let Err(e) = write_snapshot(&self.state_path, &snapshot) {
                    tracing::warn!("保存断点续传状态失败: {}", e);
                }
            }
        }
    }
}

fn sort_entries(entries: &mut [ResumeInfo]) {
    entries.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
}

fn load_state(path: &Path) -> HashMap<String, ResumeInfo> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
        Err(e) => {
            tracing::warn!("读取断点续传状态失败，忽略: {} ({})", path.display(), e);
            return HashMap::new();
        }
    };

    match serde_json::from_slice::<Vec<ResumeInfo>>(&data) {
        Ok(entries) => entries.into_iter().map(|e| (e.id.clone(), e)).collect(),
        Err(e) => {
            tracing::warn!("断点续传状态文件损坏，忽略: {} ({})", path.display(), e);
            HashMap::new()
        }
    }
}

fn write_snapshot(path: &Path, entries: &[ResumeInfo]) -> Result<()> {
    let data = serde_json::to_vec_pretty(entries)?;

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| CoreError::Persistence {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let tmp_path = path.with_extension("json.tmp");
    let cleanup = scopeguard::guard(tmp_path.clone(), |tmp| {
        let _ = std::fs::remove_file(tmp);
    });

    std::fs::write(&tmp_path, &data).map_err(|source| CoreError::Persistence {
        path: tmp_path.clone(),
        source,
    })?;
    std::fs::rename(&tmp_path, path).map_err(|source| CoreError::Persistence {
        path: path.to_path_buf(),
        source,
    })?;

    scopeguard::ScopeGuard::into_inner(cleanup);
    Ok(())
}

async fn run_writer(path: PathBuf, mut rx: mpsc::UnboundedReceiver<WriteRequest>) {
    while let Some(request) = rx.recv().await {
        let mut latest = None;
        let mut flushes = Vec::new();

        let mut pending = Some(request);
        while let Some(request) = pending.take().or_else(|| rx.try_recv().ok()) {
            match request {
                WriteRequest::Snapshot(snapshot) => latest = Some(snapshot),
                WriteRequest::Flush(done) => flushes.push(done),
            }
        }

        if let Some(snapshot) = latest {
            let target = path.clone();
            let count = snapshot.len();
            match tokio::task::spawn_blocking(move || write_snapshot(&target, &snapshot)).await {
                Ok(Ok(())) => tracing::debug!("断点续传状态已保存: {} 条", count),
                Ok(Err(e)) => tracing::warn!("保存断点续传状态失败: {}", e),
                Err(e) => tracing::warn!("断点续传写入任务异常: {}", e),
            }
        }

        for done in flushes {
            let _ = done.send(());
        }
    }
}
