//! 同步引擎
//!
//! `Syncer` 扫描本地与远程目录树，按同步模式生成动作计划，再直接通过
//! Transport 逐个执行，或交给 `TransferManager` 并发执行。

use crate::core::cache::DirectoryCache;
use crate::core::comparator::{DiffPlanner, FileComparator, FileMap, SyncAction, SyncActionKind};
use crate::core::scanner::{compute_local_checksum, compute_remote_checksum, FileScanner, PathFilter};
use crate::core::transfer::{TransferDirection, TransferItem, TransferManager, TransferRequest, TransferStatus};
use crate::error::{CoreError, Result};
use crate::logging::{TracingTransferLog, TransferLog, TransferRecord};
use crate::transport::{remote_parent, Transport};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use crate::core::comparator::{CompareMethod, SyncMode};

/// 同步选项
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncOptions {
    pub mode: SyncMode,
    pub compare_method: CompareMethod,
    pub exclude_patterns: Vec<String>,
    pub include_patterns: Vec<String>,
    /// 镜像模式下删除远程多余文件
    pub delete_extra: bool,
    /// 只统计，不执行
    pub dry_run: bool,
    /// 跳过以 `.` 开头的文件和目录
    pub ignore_hidden: bool,
}

/// 同步结果
#[derive(Debug, Default)]
pub struct SyncResult {
    pub files_uploaded: u32,
    pub files_downloaded: u32,
    pub files_deleted: u32,
    pub files_skipped: u32,
    pub bytes_transferred: u64,
    pub duration: Duration,
    pub errors: Vec<CoreError>,
    pub dry_run: bool,
}

/// 可序列化的结果摘要
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub files_uploaded: u32,
    pub files_downloaded: u32,
    pub files_deleted: u32,
    pub files_skipped: u32,
    pub bytes_transferred: u64,
    pub duration_ms: u64,
    pub errors: Vec<String>,
    pub dry_run: bool,
}

impl SyncResult {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn was_cancelled(&self) -> bool {
        self.errors.iter().any(CoreError::is_cancelled)
    }

    pub fn summary(&self) -> SyncSummary {
        SyncSummary {
            files_uploaded: self.files_uploaded,
            files_downloaded: self.files_downloaded,
            files_deleted: self.files_deleted,
            files_skipped: self.files_skipped,
            bytes_transferred: self.bytes_transferred,
            duration_ms: self.duration.as_millis() as u64,
            errors: self.errors.iter().map(|e| e.to_string()).collect(),
            dry_run: self.dry_run,
        }
    }

    fn tally(&mut self, kind: SyncActionKind) {
        match kind {
            SyncActionKind::Upload => self.files_uploaded += 1,
            SyncActionKind::Download => self.files_downloaded += 1,
            SyncActionKind::DeleteLocal | SyncActionKind::DeleteRemote => self.files_deleted += 1,
            SyncActionKind::Skip => self.files_skipped += 1,
        }
    }
}

/// 目录同步器
pub struct Syncer {
    transport: Arc<dyn Transport>,
    options: SyncOptions,
    filter: PathFilter,
    comparator: FileComparator,
    cache: Option<Arc<DirectoryCache>>,
    transfer_log: Arc<dyn TransferLog>,
}

impl Syncer {
    pub fn new(transport: Arc<dyn Transport>, options: SyncOptions) -> Self {
        let filter = PathFilter::new(&options.exclude_patterns, &options.include_patterns);
        let comparator = FileComparator::new(options.compare_method);
        Self {
            transport,
            options,
            filter,
            comparator,
            cache: None,
            transfer_log: Arc::new(TracingTransferLog),
        }
    }

    /// 远程目录列表走缓存
    pub fn with_cache(mut self, cache: Arc<DirectoryCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_transfer_log(mut self, log: Arc<dyn TransferLog>) -> Self {
        self.transfer_log = log;
        self
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// 扫描两侧目录并生成动作计划
    pub async fn analyze(&self, local_root: &Path, remote_root: &str) -> Result<Vec<SyncAction>> {
        self.analyze_inner(local_root, remote_root, None).await
    }

    async fn analyze_inner(
        &self,
        local_root: &Path,
        remote_root: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<SyncAction>> {
        info!(
            "分析同步差异: {} <-> {} (模式 {:?}, 比较方式 {:?})",
            local_root.display(),
            remote_root,
            self.options.mode,
            self.options.compare_method
        );

        let mut scanner = FileScanner::new(&self.filter, self.options.ignore_hidden);
        if let Some(token) = cancel {
            scanner = scanner.with_cancel(token);
        }

        let mut local = scanner.scan_local(local_root).await?;
        let mut remote = scanner
            .scan_remote(self.transport.as_ref(), self.cache.as_deref(), remote_root)
            .await?;

        if self.options.compare_method == CompareMethod::Hash {
            self.fill_checksums(local_root, remote_root, &mut local, &mut remote)
                .await;
        }

        let planner = DiffPlanner::new(&self.comparator, local_root, remote_root);
        let actions = planner.plan(
            self.options.mode,
            self.options.delete_extra,
            &local,
            &remote,
        );

        debug!(
            "本地 {} 个文件, 远程 {} 个文件, 生成 {} 个动作",
            local.len(),
            remote.len(),
            actions.len()
        );
        Ok(actions)
    }

    /// 为两侧都存在的文件计算校验和，失败的保持为空（视为需要同步）
    async fn fill_checksums(
        &self,
        local_root: &Path,
        remote_root: &str,
        local: &mut FileMap,
        remote: &mut FileMap,
    ) {
        for (rel, local_file) in local.iter_mut() {
            let Some(remote_file) = remote.get_mut(rel) else {
                continue;
            };

            let local_path = local_root.join(rel);
            match compute_local_checksum(&local_path).await {
                Ok(sum) => local_file.checksum = Some(sum),
                Err(e) => warn!("计算本地校验和失败 {}: {}", local_path.display(), e),
            }

            let remote_path = crate::transport::join_remote(remote_root, rel);
            match compute_remote_checksum(self.transport.as_ref(), &remote_path).await {
                Ok(sum) => remote_file.checksum = Some(sum),
                Err(e) => warn!("计算远程校验和失败 {}: {}", remote_path, e),
            }
        }
    }

    /// 分析并逐个执行动作
    ///
    /// 单个动作失败不会中止整体同步，错误收集在结果中。每个动作开始前检查
    /// `cancel`，取消后剩余动作不再执行，已完成的保持不变。
    pub async fn execute(
        &self,
        local_root: &Path,
        remote_root: &str,
        cancel: &CancellationToken,
    ) -> Result<SyncResult> {
        let start = Instant::now();
        let actions = self.analyze_inner(local_root, remote_root, Some(cancel)).await?;

        let mut result = SyncResult {
            dry_run: self.options.dry_run,
            ..Default::default()
        };

        if self.options.dry_run {
            for action in &actions {
                result.tally(action.kind);
            }
            result.duration = start.elapsed();
            info!("演练模式: {} 个动作未执行", actions.len());
            return Ok(result);
        }

        let mut known_dirs = HashSet::new();
        for action in &actions {
            if cancel.is_cancelled() {
                warn!("同步已取消，剩余动作不再执行");
                result.errors.push(CoreError::Cancelled);
                break;
            }

            match self.apply(action, &mut known_dirs).await {
                Ok(bytes) => {
                    result.tally(action.kind);
                    result.bytes_transferred += bytes;
                }
                Err(e) => {
                    error!("{} {} 失败: {}", action.kind, action.relative_path, e);
                    result.errors.push(e);
                }
            }
        }

        result.duration = start.elapsed();
        info!(
            "同步完成: 上传 {}, 下载 {}, 删除 {}, 跳过 {}, 错误 {}",
            result.files_uploaded,
            result.files_downloaded,
            result.files_deleted,
            result.files_skipped,
            result.errors.len()
        );
        Ok(result)
    }

    /// 通过 `TransferManager` 并发执行上传下载，删除直接执行
    ///
    /// 返回的结果与 `execute` 相同。取消时撤销尚未结束的排队任务。
    pub async fn execute_queued(
        &self,
        manager: &TransferManager,
        local_root: &Path,
        remote_root: &str,
        cancel: &CancellationToken,
    ) -> Result<SyncResult> {
        let start = Instant::now();
        let actions = self.analyze_inner(local_root, remote_root, Some(cancel)).await?;

        let mut result = SyncResult {
            dry_run: self.options.dry_run,
            ..Default::default()
        };

        if self.options.dry_run {
            for action in &actions {
                result.tally(action.kind);
            }
            result.duration = start.elapsed();
            return Ok(result);
        }

        let mut known_dirs = HashSet::new();
        let mut queued: Vec<(SyncActionKind, TransferItem)> = Vec::new();
        // 入队时立即登记等待者，任务在收集完之前就结束也不会丢
        let mut waits = Vec::new();
        for action in &actions {
            if cancel.is_cancelled() {
                result.errors.push(CoreError::Cancelled);
                break;
            }

            let request = match action.kind {
                SyncActionKind::Upload => {
                    if let Err(e) = self
                        .ensure_remote_dir(&remote_parent(&action.remote_path), &mut known_dirs)
                        .await
                    {
                        result.errors.push(e);
                        continue;
                    }
                    TransferRequest::upload(&action.local_path, &action.remote_path)
                }
                SyncActionKind::Download => {
                    TransferRequest::download(&action.remote_path, &action.local_path)
                }
                _ => {
                    match self.apply(action, &mut known_dirs).await {
                        Ok(_) => result.tally(action.kind),
                        Err(e) => result.errors.push(e),
                    }
                    continue;
                }
            };
            let (item, wait) = manager.enqueue_and_wait(request.resume(false));
            queued.push((action.kind, item));
            waits.push(wait);
        }

        debug!("已加入传输队列: {} 个", queued.len());
        let waits = futures::future::join_all(waits);

        let finished = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            finished = waits => Some(finished),
        };

        let Some(finished) = finished else {
            warn!("同步已取消，撤销排队中的传输");
            for (_, item) in &queued {
                let _ = manager.cancel(&item.id);
            }
            if !result.was_cancelled() {
                result.errors.push(CoreError::Cancelled);
            }
            result.duration = start.elapsed();
            return Ok(result);
        };

        for ((kind, _), outcome) in queued.iter().zip(finished) {
            match outcome {
                Ok(item) if item.status == TransferStatus::Completed => {
                    result.tally(*kind);
                    result.bytes_transferred += item.total_bytes;
                    if *kind == SyncActionKind::Upload {
                        self.invalidate_parent(&item.remote_path);
                    }
                }
                Ok(item) if item.status == TransferStatus::Cancelled => {
                    result.errors.push(CoreError::Cancelled);
                }
                Ok(item) => {
                    let op = match item.direction {
                        TransferDirection::Upload => "upload",
                        TransferDirection::Download => "download",
                    };
                    let message = item.error.clone().unwrap_or_else(|| item.status.to_string());
                    result.errors.push(CoreError::transport(
                        op,
                        item.remote_path.clone(),
                        anyhow::anyhow!(message),
                    ));
                }
                Err(e) => result.errors.push(e),
            }
        }

        result.duration = start.elapsed();
        info!(
            "队列同步完成: 上传 {}, 下载 {}, 删除 {}, 错误 {}",
            result.files_uploaded,
            result.files_downloaded,
            result.files_deleted,
            result.errors.len()
        );
        Ok(result)
    }

    /// 执行单个动作，返回传输的字节数
    async fn apply(&self, action: &SyncAction, known_dirs: &mut HashSet<String>) -> Result<u64> {
        match action.kind {
            SyncActionKind::Skip => Ok(0),
            SyncActionKind::Upload => {
                self.ensure_remote_dir(&remote_parent(&action.remote_path), known_dirs)
                    .await?;
                let started = Instant::now();
                let outcome = self
                    .transport
                    .upload(&action.local_path, &action.remote_path, false, None)
                    .await
                    .map_err(|e| CoreError::transport("upload", action.remote_path.as_str(), e));
                let size = local_size(&action.local_path, action.size).await;
                self.record(TransferDirection::Upload, action, size, started, &outcome);
                self.invalidate_parent(&action.remote_path);
                outcome.map(|_| size)
            }
            SyncActionKind::Download => {
                if let Some(parent) = action.local_path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| CoreError::local_io("创建目录", parent, e))?;
                }
                let started = Instant::now();
                let outcome = self
                    .transport
                    .download(&action.remote_path, &action.local_path, false, None)
                    .await
                    .map_err(|e| CoreError::transport("download", action.remote_path.as_str(), e));
                let size = local_size(&action.local_path, action.size).await;
                self.record(TransferDirection::Download, action, size, started, &outcome);
                outcome.map(|_| size)
            }
            SyncActionKind::DeleteLocal => {
                tokio::fs::remove_file(&action.local_path)
                    .await
                    .map_err(|e| CoreError::local_io("删除文件", &action.local_path, e))?;
                debug!("已删除本地文件: {}", action.local_path.display());
                Ok(0)
            }
            SyncActionKind::DeleteRemote => {
                let outcome = self
                    .transport
                    .remove(&action.remote_path)
                    .await
                    .map_err(|e| CoreError::transport("remove", action.remote_path.as_str(), e));
                self.invalidate_parent(&action.remote_path);
                outcome?;
                debug!("已删除远程文件: {}", action.remote_path);
                Ok(0)
            }
        }
    }

    /// 自上而下确保远程目录存在
    async fn ensure_remote_dir(&self, dir: &str, known: &mut HashSet<String>) -> Result<()> {
        let mut chain = Vec::new();
        let mut current = dir.to_string();
        while !current.is_empty() && current != "/" && current != "." {
            if known.contains(&current) {
                break;
            }
            chain.push(current.clone());
            current = remote_parent(&current);
        }

        for path in chain.into_iter().rev() {
            let exists = matches!(self.transport.stat(&path).await, Ok(record) if record.is_dir);
            if !exists {
                self.transport
                    .mkdir(&path)
                    .await
                    .map_err(|e| CoreError::transport("mkdir", path.as_str(), e))?;
                self.invalidate_parent(&path);
                debug!("已创建远程目录: {}", path);
            }
            known.insert(path);
        }
        Ok(())
    }

    fn invalidate_parent(&self, remote_path: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate(&self.transport.cache_scope(), &remote_parent(remote_path));
        }
    }

    fn record(
        &self,
        direction: TransferDirection,
        action: &SyncAction,
        size: u64,
        started: Instant,
        outcome: &Result<()>,
    ) {
        self.transfer_log.log_transfer(&TransferRecord {
            direction,
            protocol: self.transport.protocol_name().to_string(),
            local_path: action.local_path.clone(),
            remote_path: action.remote_path.clone(),
            size,
            duration: started.elapsed(),
            error: outcome.as_ref().err().map(|e| e.to_string()),
        });
    }
}

async fn local_size(path: &Path, fallback: u64) -> u64 {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .unwrap_or(fallback)
}
