//! 传输队列管理
//!
//! `TransferManager` 维护按优先级排序的等待队列，由单个调度任务在并发上限内
//! 启动传输。每个传输拥有独立的取消令牌（派生自管理器的根令牌），结束后移入
//! 容量有限的历史记录，并通知已注册的监听器。

use crate::core::resume::ResumeManager;
use crate::error::{CoreError, Result};
use crate::logging::{TracingTransferLog, TransferLog, TransferRecord};
use crate::transport::{ProgressFn, Transport, TransferProgress};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// 历史记录容量
pub const MAX_HISTORY: usize = 100;

/// 默认并行传输数
pub const DEFAULT_MAX_PARALLEL: usize = 4;

/// 传输方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::Upload => write!(f, "upload"),
            TransferDirection::Download => write!(f, "download"),
        }
    }
}

/// 传输状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl TransferStatus {
    /// 终止状态（不会再变化）
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Pending => write!(f, "pending"),
            TransferStatus::InProgress => write!(f, "in_progress"),
            TransferStatus::Completed => write!(f, "completed"),
            TransferStatus::Failed => write!(f, "failed"),
            TransferStatus::Cancelled => write!(f, "cancelled"),
            TransferStatus::Paused => write!(f, "paused"),
        }
    }
}

/// 入队参数
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub direction: TransferDirection,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub priority: i32,
    pub resume: bool,
}

impl TransferRequest {
    pub fn upload(local_path: impl Into<PathBuf>, remote_path: impl Into<String>) -> Self {
        Self {
            direction: TransferDirection::Upload,
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            priority: 0,
            resume: true,
        }
    }

    pub fn download(remote_path: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            direction: TransferDirection::Download,
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            priority: 0,
            resume: true,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// 是否从目标已有内容继续传输
    pub fn resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }
}

/// 传输任务快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferItem {
    pub id: String,
    pub direction: TransferDirection,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub bytes_per_second: u64,
    pub status: TransferStatus,
    pub error: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// 数值越大越先调度
    pub priority: i32,
    /// 目标已有部分内容时从断点继续
    pub resume: bool,
}

impl TransferItem {
    fn new(id: String, request: TransferRequest) -> Self {
        Self {
            id,
            direction: request.direction,
            local_path: request.local_path,
            remote_path: request.remote_path,
            total_bytes: 0,
            transferred_bytes: 0,
            bytes_per_second: 0,
            status: TransferStatus::Pending,
            error: None,
            start_time: None,
            end_time: None,
            priority: request.priority,
            resume: request.resume,
        }
    }

    /// 进度百分比（0-100）
    pub fn progress(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.transferred_bytes as f64 / self.total_bytes as f64 * 100.0
    }

    /// 按当前速度估算的剩余时间（整秒）
    pub fn remaining_time(&self) -> Duration {
        if self.bytes_per_second == 0 {
            return Duration::ZERO;
        }
        let remaining = self.total_bytes.saturating_sub(self.transferred_bytes);
        Duration::from_secs(remaining / self.bytes_per_second)
    }
}

/// 传输事件监听器
///
/// 回调在传输任务中同步调用，实现应尽快返回。
pub trait TransferListener: Send + Sync {
    /// 每次进度更新和状态变化时调用
    fn on_update(&self, _item: &TransferItem) {}

    /// 每个任务进入终止状态时调用一次
    fn on_complete(&self, _item: &TransferItem) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Updated(TransferItem),
    Completed(TransferItem),
}

/// 把事件转发到 channel 的监听器
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<TransferEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TransferListener for ChannelListener {
    fn on_update(&self, item: &TransferItem) {
        let _ = self.tx.send(TransferEvent::Updated(item.clone()));
    }

    fn on_complete(&self, item: &TransferItem) {
        let _ = self.tx.send(TransferEvent::Completed(item.clone()));
    }
}

// 优先级高者先出堆，同优先级按入队顺序
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: i32,
    seq: Reverse<u64>,
    id: String,
}

struct Entry {
    item: TransferItem,
    seq: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct QueueState {
    /// 队列中的任务（等待、暂停、进行中）
    items: HashMap<String, Entry>,
    /// 等待调度的任务；出堆时校验状态，过期的键直接丢弃
    pending: BinaryHeap<QueueKey>,
    history: VecDeque<TransferItem>,
    active: usize,
    max_parallel: usize,
    /// 任务 id 前缀，每个管理器实例不同
    id_prefix: String,
    next_id: u64,
    next_seq: u64,
    waiters: HashMap<String, Vec<oneshot::Sender<TransferItem>>>,
}

impl QueueState {
    fn next_id(&mut self) -> String {
        self.next_id += 1;
        format!("transfer-{}-{}", self.id_prefix, self.next_id)
    }

    fn enqueue(&mut self, request: TransferRequest, token: CancellationToken) -> TransferItem {
        self.next_seq += 1;
        let id = self.next_id();
        let item = TransferItem::new(id.clone(), request);

        self.pending.push(QueueKey {
            priority: item.priority,
            seq: Reverse(self.next_seq),
            id: id.clone(),
        });
        self.items.insert(
            id,
            Entry {
                item: item.clone(),
                seq: self.next_seq,
                token,
            },
        );
        item
    }

    fn push_history(&mut self, item: TransferItem) {
        self.history.push_back(item);
        while self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }
    }

    /// 把未启动的任务直接标记为取消并移入历史
    fn cancel_waiting(&mut self, id: &str) -> Option<(TransferItem, Vec<oneshot::Sender<TransferItem>>)> {
        let entry = self.items.remove(id)?;
        let mut item = entry.item;
        item.status = TransferStatus::Cancelled;
        item.end_time = Some(Utc::now());
        self.push_history(item.clone());
        let waiters = self.waiters.remove(id).unwrap_or_default();
        Some((item, waiters))
    }

    fn is_idle(&self) -> bool {
        self.active == 0
            && self.items.values().all(|e| e.item.status == TransferStatus::Paused)
    }
}

enum Outcome {
    Completed,
    Failed(String),
    Cancelled,
}

struct Shared {
    transport: Arc<dyn Transport>,
    state: RwLock<QueueState>,
    listeners: RwLock<Vec<Arc<dyn TransferListener>>>,
    transfer_log: Arc<dyn TransferLog>,
    resume: Option<Arc<ResumeManager>>,
    /// 唤醒调度任务
    wake: Notify,
    /// 队列变空闲时通知 `wait_idle`
    idle: Notify,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Shared {
    fn read(&self) -> RwLockReadGuard<'_, QueueState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, QueueState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> Vec<Arc<dyn TransferListener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn emit_update(&self, item: &TransferItem) {
        for listener in self.listeners() {
            listener.on_update(item);
        }
    }

    fn emit_finished(&self, item: &TransferItem, waiters: Vec<oneshot::Sender<TransferItem>>) {
        for listener in self.listeners() {
            listener.on_update(item);
            listener.on_complete(item);
        }
        for waiter in waiters {
            let _ = waiter.send(item.clone());
        }
        self.idle.notify_waiters();
    }

    fn on_progress(&self, id: &str, progress: &TransferProgress) {
        let snapshot = {
            let mut state = self.write();
            let Some(entry) = state.items.get_mut(id) else {
                return;
            };
            entry.item.total_bytes = progress.total_bytes;
            entry.item.transferred_bytes = progress.transferred_bytes;
            entry.item.bytes_per_second = progress.bytes_per_second;
            entry.item.clone()
        };

        if let Some(resume) = &self.resume {
            resume.update_total(id, snapshot.total_bytes);
            resume.update_progress(id, snapshot.transferred_bytes);
        }

        self.emit_update(&snapshot);
    }

    /// 一次调度：在并发上限内启动等待中的任务
    fn schedule(self: &Arc<Self>) {
        let launches = {
            let mut guard = self.write();
            let state = &mut *guard;
            let mut launches = Vec::new();

            while state.active < state.max_parallel {
                let Some(key) = state.pending.pop() else {
                    break;
                };
                let Some(entry) = state.items.get_mut(&key.id) else {
                    continue;
                };
                if entry.item.status != TransferStatus::Pending || entry.seq != key.seq.0 {
                    continue;
                }

                entry.item.status = TransferStatus::InProgress;
                entry.item.start_time = Some(Utc::now());
                launches.push((entry.item.clone(), entry.token.clone()));
                state.active += 1;
            }
            launches
        };

        for (item, token) in launches {
            debug!("开始传输 {} ({} {})", item.id, item.direction, item.remote_path);
            self.emit_update(&item);
            let shared = Arc::clone(self);
            self.tracker.spawn(run_transfer(shared, item, token));
        }
    }

    fn finish(&self, id: &str, outcome: Outcome, duration: Duration) {
        let finished = {
            let mut state = self.write();
            state.active = state.active.saturating_sub(1);

            match state.items.remove(id) {
                Some(entry) => {
                    let mut item = entry.item;
                    item.end_time = Some(Utc::now());
                    match &outcome {
                        Outcome::Completed => item.status = TransferStatus::Completed,
                        Outcome::Cancelled => item.status = TransferStatus::Cancelled,
                        Outcome::Failed(error) => {
                            item.status = TransferStatus::Failed;
                            item.error = Some(error.clone());
                        }
                    }
                    state.push_history(item.clone());
                    let waiters = state.waiters.remove(id).unwrap_or_default();
                    Some((item, waiters))
                }
                None => None,
            }
        };
        self.wake.notify_one();

        let Some((item, waiters)) = finished else {
            self.idle.notify_waiters();
            return;
        };

        match item.status {
            TransferStatus::Completed => info!("传输完成: {} {}", item.id, item.remote_path),
            TransferStatus::Cancelled => info!("传输已取消: {} {}", item.id, item.remote_path),
            _ => warn!(
                "传输失败: {} {}: {}",
                item.id,
                item.remote_path,
                item.error.as_deref().unwrap_or_default()
            ),
        }

        self.transfer_log.log_transfer(&TransferRecord {
            direction: item.direction,
            protocol: self.transport.protocol_name().to_string(),
            local_path: item.local_path.clone(),
            remote_path: item.remote_path.clone(),
            size: item.total_bytes,
            duration,
            error: item.error.clone(),
        });

        if let Some(resume) = &self.resume {
            if item.status == TransferStatus::Completed {
                resume.complete_transfer(&item.id);
            } else {
                resume.fail_transfer(&item.id, item.transferred_bytes);
            }
        }

        self.emit_finished(&item, waiters);
    }
}

async fn run_scheduler(shared: Arc<Shared>) {
    loop {
        shared.schedule();
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = shared.wake.notified() => {}
        }
    }
    debug!("传输调度任务退出");
}

async fn run_transfer(shared: Arc<Shared>, item: TransferItem, token: CancellationToken) {
    let started = Instant::now();

    // 进入 InProgress 即建立检查点，下载的总大小在首次进度回调时补上
    if let Some(resume) = &shared.resume {
        let total = match item.direction {
            TransferDirection::Upload => tokio::fs::metadata(&item.local_path)
                .await
                .map(|m| m.len())
                .unwrap_or(0),
            TransferDirection::Download => 0,
        };
        resume.start_transfer(&item.id, item.direction, &item.local_path, &item.remote_path, total);
    }

    let progress: ProgressFn = {
        let shared = Arc::clone(&shared);
        let id = item.id.clone();
        Arc::new(move |p: TransferProgress| shared.on_progress(&id, &p))
    };

    let (op, work) = match item.direction {
        TransferDirection::Upload => (
            "upload",
            shared
                .transport
                .upload(&item.local_path, &item.remote_path, item.resume, Some(progress)),
        ),
        TransferDirection::Download => (
            "download",
            shared
                .transport
                .download(&item.remote_path, &item.local_path, item.resume, Some(progress)),
        ),
    };

    let outcome = tokio::select! {
        biased;
        _ = token.cancelled() => Outcome::Cancelled,
        result = work => match result {
            Ok(()) => Outcome::Completed,
            Err(_) if token.is_cancelled() => Outcome::Cancelled,
            Err(e) => Outcome::Failed(CoreError::transport(op, &item.remote_path, e).to_string()),
        },
    };

    shared.finish(&item.id, outcome, started.elapsed());
}

static MANAGER_SEQ: AtomicU64 = AtomicU64::new(0);

/// 创建时刻（毫秒，十六进制）加进程内序号
///
/// 检查点文件跨会话保存，任务 id 不能与之前会话或其他管理器的重复。
fn session_prefix() -> String {
    let seq = MANAGER_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{:x}.{}", Utc::now().timestamp_millis(), seq)
}

/// `TransferManager` 构造器
pub struct TransferManagerBuilder {
    transport: Arc<dyn Transport>,
    max_parallel: usize,
    transfer_log: Arc<dyn TransferLog>,
    resume: Option<Arc<ResumeManager>>,
}

impl TransferManagerBuilder {
    pub fn max_parallel(mut self, n: usize) -> Self {
        self.max_parallel = n.max(1);
        self
    }

    pub fn transfer_log(mut self, log: Arc<dyn TransferLog>) -> Self {
        self.transfer_log = log;
        self
    }

    /// 传输过程中写入断点续传检查点
    pub fn resume_manager(mut self, resume: Arc<ResumeManager>) -> Self {
        self.resume = Some(resume);
        self
    }

    /// 创建管理器并启动调度任务，必须在 tokio 运行时内调用
    pub fn build(self) -> TransferManager {
        let shared = Arc::new(Shared {
            transport: self.transport,
            state: RwLock::new(QueueState {
                max_parallel: self.max_parallel,
                id_prefix: session_prefix(),
                ..Default::default()
            }),
            listeners: RwLock::new(Vec::new()),
            transfer_log: self.transfer_log,
            resume: self.resume,
            wake: Notify::new(),
            idle: Notify::new(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });

        shared.tracker.spawn(run_scheduler(Arc::clone(&shared)));
        TransferManager { shared }
    }
}

/// 带优先级和并发上限的传输管理器
pub struct TransferManager {
    shared: Arc<Shared>,
}

impl TransferManager {
    pub fn builder(transport: Arc<dyn Transport>) -> TransferManagerBuilder {
        TransferManagerBuilder {
            transport,
            max_parallel: DEFAULT_MAX_PARALLEL,
            transfer_log: Arc::new(TracingTransferLog),
            resume: None,
        }
    }

    pub fn new(transport: Arc<dyn Transport>, max_parallel: usize) -> Self {
        Self::builder(transport).max_parallel(max_parallel).build()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.shared.transport
    }

    pub fn add_listener(&self, listener: Arc<dyn TransferListener>) {
        self.shared
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// 添加上传任务，立即返回等待中的任务快照
    pub fn add_upload(
        &self,
        local_path: impl Into<PathBuf>,
        remote_path: impl Into<String>,
        priority: i32,
    ) -> TransferItem {
        self.enqueue(TransferRequest::upload(local_path, remote_path).priority(priority))
    }

    /// 添加下载任务，立即返回等待中的任务快照
    pub fn add_download(
        &self,
        remote_path: impl Into<String>,
        local_path: impl Into<PathBuf>,
        priority: i32,
    ) -> TransferItem {
        self.enqueue(TransferRequest::download(remote_path, local_path).priority(priority))
    }

    /// 加入队列；管理器停止后加入的任务直接以 Cancelled 进入历史
    pub fn enqueue(&self, request: TransferRequest) -> TransferItem {
        self.submit(request, false).0
    }

    /// 加入队列并在同一把锁内登记等待者
    ///
    /// 返回的 future 不会因为任务在被轮询前结束而丢失结果。
    pub fn enqueue_and_wait(
        &self,
        request: TransferRequest,
    ) -> (TransferItem, impl Future<Output = Result<TransferItem>> + Send + 'static) {
        let (item, rx) = self.submit(request, true);
        let result = async move {
            match rx {
                Some(rx) => rx.await.map_err(|_| CoreError::Cancelled),
                None => Err(CoreError::Cancelled),
            }
        };
        (item, result)
    }

    fn submit(
        &self,
        request: TransferRequest,
        wait: bool,
    ) -> (TransferItem, Option<oneshot::Receiver<TransferItem>>) {
        let (waiters, rx) = if wait {
            let (tx, rx) = oneshot::channel();
            (vec![tx], Some(rx))
        } else {
            (Vec::new(), None)
        };

        let token = self.shared.shutdown.child_token();
        let mut state = self.shared.write();

        // stop() 先取消 shutdown 再收集队列，这里在锁内检查就不会漏掉任务
        if self.shared.shutdown.is_cancelled() {
            let mut item = TransferItem::new(state.next_id(), request);
            item.status = TransferStatus::Cancelled;
            item.end_time = Some(Utc::now());
            state.push_history(item.clone());
            drop(state);

            warn!("传输管理器已停止，任务直接取消: {} {}", item.id, item.remote_path);
            self.shared.emit_finished(&item, waiters);
            return (item, rx);
        }

        let item = state.enqueue(request, token);
        if !waiters.is_empty() {
            state.waiters.insert(item.id.clone(), waiters);
        }
        drop(state);

        debug!("加入传输队列: {} (优先级 {})", item.id, item.priority);
        self.shared.wake.notify_one();
        (item, rx)
    }

    /// 取消任务：进行中的任务异步结束为 Cancelled，未启动的立即取消
    pub fn cancel(&self, id: &str) -> Result<()> {
        let finished = {
            let mut state = self.shared.write();
            let entry = state
                .items
                .get(id)
                .ok_or_else(|| CoreError::NotFound(id.to_string()))?;

            if entry.item.status == TransferStatus::InProgress {
                entry.token.cancel();
                None
            } else {
                state.cancel_waiting(id)
            }
        };

        if let Some((item, waiters)) = finished {
            info!("传输已取消: {} {}", item.id, item.remote_path);
            self.shared.emit_finished(&item, waiters);
        }
        Ok(())
    }

    /// 取消所有等待中和进行中的任务
    pub fn cancel_all(&self) {
        let ids: Vec<String> = self
            .shared
            .read()
            .items
            .values()
            .filter(|e| {
                matches!(
                    e.item.status,
                    TransferStatus::Pending | TransferStatus::InProgress
                )
            })
            .map(|e| e.item.id.clone())
            .collect();

        for id in ids {
            let _ = self.cancel(&id);
        }
    }

    /// 暂停等待中的任务（进行中的任务不支持暂停）
    pub fn pause(&self, id: &str) -> Result<()> {
        let snapshot = {
            let mut state = self.shared.write();
            let entry = state
                .items
                .get_mut(id)
                .ok_or_else(|| CoreError::NotFound(id.to_string()))?;

            if entry.item.status != TransferStatus::Pending {
                return Err(CoreError::InvalidState {
                    id: id.to_string(),
                    status: entry.item.status,
                    action: "暂停",
                });
            }
            entry.item.status = TransferStatus::Paused;
            entry.item.clone()
        };

        self.shared.emit_update(&snapshot);
        self.shared.idle.notify_waiters();
        Ok(())
    }

    /// 恢复已暂停的任务，保持原有排队位置
    pub fn resume(&self, id: &str) -> Result<()> {
        let snapshot = {
            let mut guard = self.shared.write();
            let state = &mut *guard;
            let entry = state
                .items
                .get_mut(id)
                .ok_or_else(|| CoreError::NotFound(id.to_string()))?;

            if entry.item.status != TransferStatus::Paused {
                return Err(CoreError::InvalidState {
                    id: id.to_string(),
                    status: entry.item.status,
                    action: "恢复",
                });
            }
            entry.item.status = TransferStatus::Pending;
            state.pending.push(QueueKey {
                priority: entry.item.priority,
                seq: Reverse(entry.seq),
                id: id.to_string(),
            });
            entry.item.clone()
        };

        self.shared.emit_update(&snapshot);
        self.shared.wake.notify_one();
        Ok(())
    }

    /// 重试历史中失败的任务，返回新任务
    pub fn retry(&self, id: &str) -> Result<TransferItem> {
        let item = {
            let mut state = self.shared.write();
            let index = state
                .history
                .iter()
                .position(|h| h.id == id && h.status == TransferStatus::Failed)
                .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
            if self.shared.shutdown.is_cancelled() {
                return Err(CoreError::InvalidState {
                    id: id.to_string(),
                    status: TransferStatus::Failed,
                    action: "重试",
                });
            }

            let old = state
                .history
                .remove(index)
                .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
            let request = TransferRequest {
                direction: old.direction,
                local_path: old.local_path,
                remote_path: old.remote_path,
                priority: old.priority,
                resume: old.resume,
            };
            state.enqueue(request, self.shared.shutdown.child_token())
        };

        info!("重试传输 {} -> {}", id, item.id);
        self.shared.wake.notify_one();
        Ok(item)
    }

    /// 调整并发上限；降低时进行中的任务自然结束
    pub fn set_max_parallel(&self, n: usize) {
        self.shared.write().max_parallel = n.max(1);
        self.shared.wake.notify_one();
    }

    pub fn max_parallel(&self) -> usize {
        self.shared.read().max_parallel
    }

    /// 队列快照，按调度顺序排列
    pub fn get_queue(&self) -> Vec<TransferItem> {
        let state = self.shared.read();
        let mut entries: Vec<&Entry> = state.items.values().collect();
        entries.sort_by(|a, b| {
            b.item
                .priority
                .cmp(&a.item.priority)
                .then_with(|| a.seq.cmp(&b.seq))
        });
        entries.into_iter().map(|e| e.item.clone()).collect()
    }

    /// 历史记录，按结束顺序排列
    pub fn get_history(&self) -> Vec<TransferItem> {
        self.shared.read().history.iter().cloned().collect()
    }

    pub fn get_item(&self, id: &str) -> Option<TransferItem> {
        let state = self.shared.read();
        state
            .items
            .get(id)
            .map(|e| e.item.clone())
            .or_else(|| state.history.iter().rev().find(|h| h.id == id).cloned())
    }

    pub fn get_active_count(&self) -> usize {
        self.shared.read().active
    }

    pub fn clear_history(&self) {
        self.shared.write().history.clear();
    }

    /// 等待指定任务进入终止状态
    ///
    /// 调用时立即登记，之后任务被挤出历史记录也能收到结果。
    pub fn wait_item(&self, id: &str) -> impl Future<Output = Result<TransferItem>> + Send + 'static {
        enum Waiter {
            Done(TransferItem),
            Pending(oneshot::Receiver<TransferItem>),
        }

        let waiter = {
            let mut state = self.shared.write();
            if state.items.contains_key(id) {
                let (tx, rx) = oneshot::channel();
                state.waiters.entry(id.to_string()).or_default().push(tx);
                Ok(Waiter::Pending(rx))
            } else {
                state
                    .history
                    .iter()
                    .rev()
                    .find(|h| h.id == id)
                    .cloned()
                    .map(Waiter::Done)
                    .ok_or_else(|| CoreError::NotFound(id.to_string()))
            }
        };

        async move {
            match waiter? {
                Waiter::Done(item) => Ok(item),
                Waiter::Pending(rx) => rx.await.map_err(|_| CoreError::Cancelled),
            }
        }
    }

    /// 等待队列中没有等待中或进行中的任务（已暂停的任务不计）
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.read().is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// 取消全部任务（包括已暂停的）并等待所有传输任务退出
    ///
    /// 停止后管理器不再调度新任务。
    pub async fn stop(&self) {
        info!("停止传输管理器");
        self.shared.shutdown.cancel();

        let waiting: Vec<String> = self
            .shared
            .read()
            .items
            .values()
            .filter(|e| e.item.status != TransferStatus::InProgress)
            .map(|e| e.item.id.clone())
            .collect();
        for id in waiting {
            let _ = self.cancel(&id);
        }

        self.shared.tracker.close();
        self.shared.tracker.wait().await;
    }
}

impl Drop for TransferManager {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::testing::RecordingLog;
    use crate::transport::mock::MockTransport;

    fn manager(mock: &Arc<MockTransport>, max_parallel: usize) -> TransferManager {
        TransferManager::new(mock.clone(), max_parallel)
    }

    async fn wait_for_status(manager: &TransferManager, id: &str, status: TransferStatus) {
        while manager.get_item(id).map(|i| i.status) != Some(status) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[test]
    fn test_item_progress_and_remaining_time() {
        let mut item = TransferItem::new("transfer-1".into(), TransferRequest::upload("/l", "/r"));
        assert_eq!(item.progress(), 0.0);
        assert_eq!(item.remaining_time(), Duration::ZERO);

        item.total_bytes = 1000;
        item.transferred_bytes = 250;
        item.bytes_per_second = 100;
        assert_eq!(item.progress(), 25.0);
        assert_eq!(item.remaining_time(), Duration::from_secs(7));
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&TransferStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert_eq!(
            serde_json::to_string(&TransferDirection::Download).unwrap(),
            "\"download\""
        );
        assert!(TransferStatus::Cancelled.is_terminal());
        assert!(!TransferStatus::Paused.is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_higher_priority_starts_first() {
        let mock = Arc::new(MockTransport::new());
        let manager = manager(&mock, 1);

        let low = manager.add_upload("/l/1", "/p1", 1);
        manager.add_upload("/l/5", "/p5", 5);
        manager.add_upload("/l/3", "/p3", 3);
        manager.add_upload("/l/3b", "/p3b", 3);
        assert_eq!(low.status, TransferStatus::Pending);
        assert!(low.id.starts_with("transfer-"));

        let queue: Vec<String> = manager.get_queue().into_iter().map(|i| i.remote_path).collect();
        assert_eq!(queue, vec!["/p5", "/p3", "/p3b", "/p1"]);

        manager.wait_idle().await;
        assert_eq!(mock.started(), vec!["/p5", "/p3", "/p3b", "/p1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_never_exceeds_max_parallel() {
        let mock = Arc::new(MockTransport::new().with_delay(Duration::from_millis(50)));
        let manager = manager(&mock, 3);

        for i in 0..12 {
            manager.add_upload(format!("/l/{i}"), format!("/r/{i}"), (i % 4) as i32);
        }

        let mut samples = 0;
        while !manager.get_queue().is_empty() {
            assert!(manager.get_active_count() <= 3);
            samples += 1;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        manager.wait_idle().await;

        assert!(samples > 0);
        assert_eq!(mock.max_active(), 3);
        assert_eq!(manager.get_active_count(), 0);
        assert_eq!(manager.get_history().len(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_keeps_most_recent_hundred() {
        let mock = Arc::new(MockTransport::new().with_delay(Duration::from_millis(2)));
        let manager = manager(&mock, 1);

        let ids: Vec<String> = (0..150)
            .map(|i| manager.add_upload(format!("/l/{i}"), format!("/r/{i}"), 0).id)
            .collect();
        manager.wait_idle().await;

        let history = manager.get_history();
        assert_eq!(history.len(), MAX_HISTORY);
        assert_eq!(history.first().unwrap().id, ids[50]);
        assert_eq!(history.last().unwrap().id, ids[149]);
        assert!(history.iter().all(|i| i.status == TransferStatus::Completed));

        manager.clear_history();
        assert!(manager.get_history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_in_progress_transfer() {
        let mock = Arc::new(MockTransport::new());
        mock.delay_on("/slow", Duration::from_secs(3600));
        let manager = manager(&mock, 2);

        let slow = manager.add_upload("/l/slow", "/slow", 0);
        let fast = manager.add_upload("/l/fast", "/fast", 0);
        wait_for_status(&manager, &slow.id, TransferStatus::InProgress).await;

        manager.cancel(&slow.id).unwrap();
        let done = manager.wait_item(&slow.id).await.unwrap();
        assert_eq!(done.status, TransferStatus::Cancelled);
        assert!(done.error.is_none());
        assert!(done.end_time.is_some());

        // 取消一个任务不影响其他任务
        let fast = manager.wait_item(&fast.id).await.unwrap();
        assert_eq!(fast.status, TransferStatus::Completed);
        assert!(!mock.has_file("/slow"));
        assert!(manager.cancel(&slow.id).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending_is_immediate() {
        let mock = Arc::new(MockTransport::new());
        mock.delay_on("/first", Duration::from_secs(60));
        let manager = manager(&mock, 1);
        let (listener, mut events) = ChannelListener::new();
        manager.add_listener(Arc::new(listener));

        let first = manager.add_upload("/l/a", "/first", 0);
        let second = manager.add_upload("/l/b", "/second", 0);
        wait_for_status(&manager, &first.id, TransferStatus::InProgress).await;

        manager.cancel(&second.id).unwrap();
        let item = manager.get_item(&second.id).unwrap();
        assert_eq!(item.status, TransferStatus::Cancelled);
        assert!(manager.get_queue().iter().all(|i| i.id != second.id));

        let mut completed = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let TransferEvent::Completed(item) = event {
                completed.push(item.id);
            }
        }
        assert_eq!(completed, vec![second.id.clone()]);

        assert!(matches!(
            manager.cancel("transfer-999"),
            Err(CoreError::NotFound(_))
        ));
        manager.stop().await;
        assert!(!mock.started().contains(&"/second".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume_rules() {
        let mock = Arc::new(MockTransport::new());
        mock.delay_on("/first", Duration::from_secs(60));
        let manager = manager(&mock, 1);

        let first = manager.add_upload("/l/a", "/first", 0);
        let second = manager.add_upload("/l/b", "/second", 0);
        wait_for_status(&manager, &first.id, TransferStatus::InProgress).await;

        assert!(matches!(
            manager.pause(&first.id),
            Err(CoreError::InvalidState {
                status: TransferStatus::InProgress,
                ..
            })
        ));
        assert!(matches!(
            manager.resume(&second.id),
            Err(CoreError::InvalidState { .. })
        ));

        manager.pause(&second.id).unwrap();
        assert_eq!(manager.get_item(&second.id).unwrap().status, TransferStatus::Paused);
        assert!(manager.pause(&second.id).is_err());

        // 暂停的任务不会被调度
        manager.cancel(&first.id).unwrap();
        manager.wait_idle().await;
        assert_eq!(mock.started(), vec!["/first"]);
        assert_eq!(manager.get_item(&second.id).unwrap().status, TransferStatus::Paused);

        manager.resume(&second.id).unwrap();
        let done = manager.wait_item(&second.id).await.unwrap();
        assert_eq!(done.status, TransferStatus::Completed);
        assert!(matches!(manager.pause("nope"), Err(CoreError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_failed_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("bad");
        let mock = Arc::new(MockTransport::new());
        mock.fail_on("/bad");
        let manager = manager(&mock, 2);

        let item = manager.add_download("/bad", &local, 7);
        let failed = manager.wait_item(&item.id).await.unwrap();
        assert_eq!(failed.status, TransferStatus::Failed);
        let error = failed.error.clone().unwrap();
        assert!(error.contains("download"));
        assert!(error.contains("/bad"));

        mock.clear_failures();
        let retried = manager.retry(&item.id).unwrap();
        assert_ne!(retried.id, item.id);
        assert_eq!(retried.status, TransferStatus::Pending);
        assert_eq!(retried.direction, TransferDirection::Download);
        assert_eq!(retried.local_path, local);
        assert_eq!(retried.remote_path, "/bad");
        assert_eq!(retried.priority, 7);
        assert!(manager.get_history().iter().all(|h| h.id != item.id));

        let done = manager.wait_item(&retried.id).await.unwrap();
        assert_eq!(done.status, TransferStatus::Completed);

        // 只有失败的任务可以重试
        assert!(matches!(manager.retry(&retried.id), Err(CoreError::NotFound(_))));
        assert!(matches!(manager.retry(&item.id), Err(CoreError::NotFound(_))));

        // 停止后失败的任务不再重试，留在历史中
        mock.fail_on("/bad2");
        let second = manager.add_download("/bad2", dir.path().join("bad2"), 0);
        manager.wait_item(&second.id).await.unwrap();
        manager.stop().await;
        assert!(matches!(
            manager.retry(&second.id),
            Err(CoreError::InvalidState { .. })
        ));
        assert!(manager.get_history().iter().any(|h| h.id == second.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_receives_progress_and_single_completion() {
        let mock = Arc::new(MockTransport::new());
        let manager = manager(&mock, 2);
        let (listener, mut events) = ChannelListener::new();
        manager.add_listener(Arc::new(listener));

        let a = manager.add_upload("/l/a", "/a", 0);
        let b = manager.add_upload("/l/b", "/b", 0);
        manager.wait_idle().await;

        let mut completions: HashMap<String, usize> = HashMap::new();
        let mut saw_progress = false;
        let mut saw_in_progress = false;
        while let Ok(event) = events.try_recv() {
            match event {
                TransferEvent::Updated(item) => {
                    saw_in_progress |= item.status == TransferStatus::InProgress;
                    saw_progress |= item.transferred_bytes == 50 && item.total_bytes == 100;
                }
                TransferEvent::Completed(item) => {
                    assert_eq!(item.status, TransferStatus::Completed);
                    *completions.entry(item.id).or_default() += 1;
                }
            }
        }
        assert!(saw_in_progress);
        assert!(saw_progress);
        assert_eq!(completions.get(&a.id), Some(&1));
        assert_eq!(completions.get(&b.id), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_max_parallel_starts_more() {
        let mock = Arc::new(MockTransport::new().with_delay(Duration::from_millis(100)));
        let manager = manager(&mock, 1);
        for i in 0..4 {
            manager.add_upload(format!("/l/{i}"), format!("/r/{i}"), 0);
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.get_active_count(), 1);

        manager.set_max_parallel(4);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.get_active_count(), 4);
        assert_eq!(manager.max_parallel(), 4);

        manager.wait_idle().await;
        assert_eq!(mock.max_active(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_everything() {
        let mock = Arc::new(MockTransport::new().with_delay(Duration::from_secs(3600)));
        let manager = manager(&mock, 2);

        let ids: Vec<String> = (0..5)
            .map(|i| manager.add_upload(format!("/l/{i}"), format!("/r/{i}"), 0).id)
            .collect();
        manager.pause(&ids[4]).unwrap();
        wait_for_status(&manager, &ids[0], TransferStatus::InProgress).await;

        manager.stop().await;

        assert_eq!(manager.get_active_count(), 0);
        assert!(manager.get_queue().is_empty());
        let history = manager.get_history();
        assert_eq!(history.len(), 5);
        assert!(history.iter().all(|i| i.status == TransferStatus::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_leaves_paused() {
        let mock = Arc::new(MockTransport::new().with_delay(Duration::from_secs(3600)));
        let manager = manager(&mock, 1);

        let running = manager.add_upload("/l/0", "/r/0", 0);
        let pending = manager.add_upload("/l/1", "/r/1", 0);
        let paused = manager.add_upload("/l/2", "/r/2", 0);
        manager.pause(&paused.id).unwrap();
        wait_for_status(&manager, &running.id, TransferStatus::InProgress).await;

        manager.cancel_all();
        manager.wait_idle().await;

        assert_eq!(manager.get_item(&running.id).unwrap().status, TransferStatus::Cancelled);
        assert_eq!(manager.get_item(&pending.id).unwrap().status, TransferStatus::Cancelled);
        assert_eq!(manager.get_item(&paused.id).unwrap().status, TransferStatus::Paused);
    }

    #[tokio::test]
    async fn test_outcomes_are_logged_and_checkpointed() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockTransport::new().with_delay(Duration::from_millis(4)));
        mock.fail_on("/bad");
        let log = Arc::new(RecordingLog::default());
        let resume = Arc::new(ResumeManager::new(dir.path().join("resume.json")));

        let manager = TransferManager::builder(mock.clone())
            .max_parallel(2)
            .transfer_log(log.clone())
            .resume_manager(resume.clone())
            .build();

        let good = manager.add_upload("/l/good", "/good", 0);
        let bad = manager.add_upload("/l/bad", "/bad", 0);
        manager.wait_idle().await;

        let records = log.records();
        assert_eq!(records.len(), 2);
        let bad_record = records.iter().find(|r| r.remote_path == "/bad").unwrap();
        assert_eq!(bad_record.protocol, "mock");
        assert!(bad_record.error.is_some());
        let good_record = records.iter().find(|r| r.remote_path == "/good").unwrap();
        assert!(good_record.error.is_none());
        assert_eq!(good_record.size, 100);

        // 成功的任务清除检查点，失败的任务保留已传输的偏移
        assert!(resume.get_resume_info(&good.id).is_none());
        let incomplete = resume.get_incomplete();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].id, bad.id);
        assert_eq!(incomplete[0].transferred_bytes, 50);
        assert_eq!(incomplete[0].total_bytes, 100);
    }

    #[tokio::test]
    async fn test_checkpoint_created_when_transfer_starts() {
        let dir = tempfile::tempdir().unwrap();
        let transport = crate::transport::LocalTransport::new(dir.path().join("remote"));
        transport.connect().await.unwrap();
        let resume = Arc::new(ResumeManager::new(dir.path().join("resume.json")));

        let manager = TransferManager::builder(Arc::new(transport))
            .resume_manager(resume.clone())
            .build();

        // 远程文件不存在，传输在任何进度回调之前就失败
        let item = manager.add_download("/missing.bin", dir.path().join("missing.bin"), 0);
        let done = manager.wait_item(&item.id).await.unwrap();
        assert_eq!(done.status, TransferStatus::Failed);

        let info = resume.get_resume_info(&item.id).unwrap();
        assert_eq!(info.direction, TransferDirection::Download);
        assert_eq!(info.remote_path, "/missing.bin");
        assert_eq!(info.transferred_bytes, 0);
        assert_eq!(resume.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ids_unique_across_managers() {
        let mock = Arc::new(MockTransport::new());
        let first = manager(&mock, 1);
        let second = manager(&mock, 1);

        let a = first.add_upload("/l/a", "/a", 0);
        let b = second.add_upload("/l/b", "/b", 0);
        let c = first.add_upload("/l/c", "/c", 0);
        assert_ne!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_ne!(b.id, c.id);

        first.wait_idle().await;
        second.wait_idle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_after_stop_is_cancelled() {
        let mock = Arc::new(MockTransport::new());
        let manager = manager(&mock, 2);
        let (listener, mut events) = ChannelListener::new();
        manager.add_listener(Arc::new(listener));
        manager.stop().await;

        let item = manager.add_upload("/l/late", "/late", 0);
        assert_eq!(item.status, TransferStatus::Cancelled);
        assert!(item.end_time.is_some());
        assert!(manager.get_queue().is_empty());

        tokio::time::timeout(Duration::from_secs(1), manager.wait_idle())
            .await
            .unwrap();
        let history = manager.get_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, item.id);

        let (_, waited) = manager.enqueue_and_wait(TransferRequest::upload("/l/x", "/x"));
        assert_eq!(waited.await.unwrap().status, TransferStatus::Cancelled);
        assert!(mock.started().is_empty());

        let mut completions = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, TransferEvent::Completed(_)) {
                completions += 1;
            }
        }
        assert_eq!(completions, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_and_wait_survives_history_eviction() {
        let mock = Arc::new(MockTransport::new().with_delay(Duration::from_millis(1)));
        let manager = manager(&mock, 4);

        let waits: Vec<_> = (0..MAX_HISTORY + 50)
            .map(|i| {
                manager
                    .enqueue_and_wait(TransferRequest::upload(format!("/l/{i}"), format!("/r/{i}")))
                    .1
            })
            .collect();
        manager.wait_idle().await;
        assert_eq!(manager.get_history().len(), MAX_HISTORY);

        // 早期任务已被挤出历史，登记过的等待者仍能拿到结果
        let results = futures::future::join_all(waits).await;
        assert!(results
            .iter()
            .all(|r| r.as_ref().unwrap().status == TransferStatus::Completed));
    }
}
