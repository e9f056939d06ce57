//! 文件比较与同步计划
//!
//! 根据同步模式和比较方式，把本地/远程两侧的文件表转换为同步动作列表。
//! 这里只做纯计算，不访问文件系统。

use crate::transport::join_remote;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

pub const REASON_MISSING_REMOTE: &str = "file does not exist on remote";
pub const REASON_LOCAL_NEWER: &str = "local file is newer";
pub const REASON_SKIP_UPLOAD: &str = "files are identical or remote is newer";
pub const REASON_REMOTE_NEWER: &str = "remote file is newer";
pub const REASON_SKIP_DOWNLOAD: &str = "files are identical or local is newer";
pub const REASON_MISSING_LOCAL: &str = "file does not exist locally";

/// 同步模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// 本地 -> 远程，只上传新增或更新的文件
    #[default]
    Upload,
    /// 远程 -> 本地
    Download,
    /// 远程与本地保持一致（可删除远程多余文件）
    Mirror,
    /// 双向同步，较新的一方胜出
    Bidirectional,
}

/// 文件比较方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareMethod {
    ModTime,
    Size,
    Hash,
    #[default]
    SizeAndTime,
}

/// 同步动作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncActionKind {
    Upload,
    Download,
    DeleteLocal,
    DeleteRemote,
    Skip,
}

impl fmt::Display for SyncActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncActionKind::Upload => write!(f, "upload"),
            SyncActionKind::Download => write!(f, "download"),
            SyncActionKind::DeleteLocal => write!(f, "delete_local"),
            SyncActionKind::DeleteRemote => write!(f, "delete_remote"),
            SyncActionKind::Skip => write!(f, "skip"),
        }
    }
}

/// 一个计划中的同步动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncAction {
    pub kind: SyncActionKind,
    /// 相对同步根目录的路径（`/` 分隔）
    pub relative_path: String,
    pub local_path: PathBuf,
    pub remote_path: String,
    /// 源文件大小
    pub size: u64,
    pub reason: String,
}

/// 扫描得到的文件元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannedFile {
    pub relative_path: String,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
    /// 仅在按内容比较时计算
    pub checksum: Option<String>,
}

/// 相对路径 -> 文件元数据，按路径有序
pub type FileMap = BTreeMap<String, ScannedFile>;

/// 比较配置
#[derive(Debug, Clone)]
pub struct CompareConfig {
    pub method: CompareMethod,
    /// 时间容差（毫秒），用于抵消文件系统/协议的时间精度差异
    pub time_tolerance_ms: i64,
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            method: CompareMethod::default(),
            time_tolerance_ms: 2000,
        }
    }
}

/// 文件比较器
#[derive(Debug, Clone, Default)]
pub struct FileComparator {
    config: CompareConfig,
}

impl FileComparator {
    pub fn new(method: CompareMethod) -> Self {
        Self {
            config: CompareConfig {
                method,
                ..Default::default()
            },
        }
    }

    pub fn with_config(config: CompareConfig) -> Self {
        Self { config }
    }

    pub fn method(&self) -> CompareMethod {
        self.config.method
    }

    fn time_differs(&self, local: &ScannedFile, remote: &ScannedFile) -> bool {
        let diff = (local.mod_time - remote.mod_time).num_milliseconds().abs();
        diff > self.config.time_tolerance_ms
    }

    /// 两侧文件是否需要同步
    ///
    /// 按内容比较时，任一侧缺少校验和都视为需要同步。
    pub fn needs_sync(&self, local: &ScannedFile, remote: &ScannedFile) -> bool {
        match self.config.method {
            CompareMethod::Size => local.size != remote.size,
            CompareMethod::ModTime => self.time_differs(local, remote),
            CompareMethod::SizeAndTime => {
                local.size != remote.size || self.time_differs(local, remote)
            }
            CompareMethod::Hash => match (&local.checksum, &remote.checksum) {
                (Some(a), Some(b)) => a != b,
                _ => true,
            },
        }
    }
}

/// 把两侧文件表转换为同步动作
pub struct DiffPlanner<'a> {
    comparator: &'a FileComparator,
    local_root: &'a Path,
    remote_root: &'a str,
}

impl<'a> DiffPlanner<'a> {
    pub fn new(comparator: &'a FileComparator, local_root: &'a Path, remote_root: &'a str) -> Self {
        Self {
            comparator,
            local_root,
            remote_root,
        }
    }

    fn action(&self, kind: SyncActionKind, rel: &str, size: u64, reason: &str) -> SyncAction {
        SyncAction {
            kind,
            relative_path: rel.to_string(),
            local_path: self.local_root.join(rel),
            remote_path: join_remote(self.remote_root, rel),
            size,
            reason: reason.to_string(),
        }
    }

    pub fn plan(
        &self,
        mode: SyncMode,
        delete_extra: bool,
        local: &FileMap,
        remote: &FileMap,
    ) -> Vec<SyncAction> {
        match mode {
            SyncMode::Upload => self.upload(local, remote),
            SyncMode::Download => self.download(local, remote),
            SyncMode::Mirror => self.mirror(local, remote, delete_extra),
            SyncMode::Bidirectional => self.bidirectional(local, remote),
        }
    }

    /// 上传新增和本地更新的文件；远程独有的文件不处理
    pub fn upload(&self, local: &FileMap, remote: &FileMap) -> Vec<SyncAction> {
        local
            .iter()
            .map(|(rel, l)| match remote.get(rel) {
                None => self.action(SyncActionKind::Upload, rel, l.size, REASON_MISSING_REMOTE),
                Some(r) if self.comparator.needs_sync(l, r) && l.mod_time > r.mod_time => {
                    self.action(SyncActionKind::Upload, rel, l.size, REASON_LOCAL_NEWER)
                }
                Some(_) => self.action(SyncActionKind::Skip, rel, l.size, REASON_SKIP_UPLOAD),
            })
            .collect()
    }

    /// 下载新增和远程更新的文件；本地独有的文件不处理
    pub fn download(&self, local: &FileMap, remote: &FileMap) -> Vec<SyncAction> {
        remote
            .iter()
            .map(|(rel, r)| match local.get(rel) {
                None => self.action(SyncActionKind::Download, rel, r.size, REASON_MISSING_LOCAL),
                Some(l) if self.comparator.needs_sync(l, r) && r.mod_time > l.mod_time => {
                    self.action(SyncActionKind::Download, rel, r.size, REASON_REMOTE_NEWER)
                }
                Some(_) => self.action(SyncActionKind::Skip, rel, r.size, REASON_SKIP_DOWNLOAD),
            })
            .collect()
    }

    /// 与上传相同，`delete_extra` 时额外删除远程独有的文件（本地文件从不删除）
    pub fn mirror(&self, local: &FileMap, remote: &FileMap, delete_extra: bool) -> Vec<SyncAction> {
        let mut actions = self.upload(local, remote);
        if delete_extra {
            actions.extend(
                remote
                    .iter()
                    .filter(|(rel, _)| !local.contains_key(*rel))
                    .map(|(rel, r)| {
                        self.action(SyncActionKind::DeleteRemote, rel, r.size, REASON_MISSING_LOCAL)
                    }),
            );
        }
        actions
    }

    /// 双向：两侧都有且需要同步时较新的一方胜出，相同则不产生动作
    pub fn bidirectional(&self, local: &FileMap, remote: &FileMap) -> Vec<SyncAction> {
        let mut actions = Vec::new();

        for (rel, l) in local {
            match remote.get(rel) {
                None => actions.push(self.action(
                    SyncActionKind::Upload,
                    rel,
                    l.size,
                    REASON_MISSING_REMOTE,
                )),
                Some(r) if self.comparator.needs_sync(l, r) => {
                    if l.mod_time > r.mod_time {
                        actions.push(self.action(
                            SyncActionKind::Upload,
                            rel,
                            l.size,
                            REASON_LOCAL_NEWER,
                        ));
                    } else {
                        actions.push(self.action(
                            SyncActionKind::Download,
                            rel,
                            r.size,
                            REASON_REMOTE_NEWER,
                        ));
                    }
                }
                Some(_) => {}
            }
        }

        for (rel, r) in remote {
            if !local.contains_key(rel) {
                actions.push(self.action(
                    SyncActionKind::Download,
                    rel,
                    r.size,
                    REASON_MISSING_LOCAL,
                ));
            }
        }

        actions
    }
}
