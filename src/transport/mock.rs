//! 测试用的内存 Transport

use super::{
    join_remote, BoxedReader, BoxedWriter, FileRecord, ProgressFn, Transport, TransferProgress,
};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
struct MockFile {
    size: u64,
    mod_time: DateTime<Utc>,
}

/// 内存中的远程文件系统，记录调用顺序与并发度
pub(crate) struct MockTransport {
    files: Mutex<BTreeMap<String, MockFile>>,
    dirs: Mutex<HashSet<String>>,
    delay: Duration,
    path_delays: Mutex<HashMap<String, Duration>>,
    fail_paths: Mutex<HashSet<String>>,
    started: Mutex<Vec<String>>,
    list_calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    connected: AtomicBool,
    transfer_size: u64,
}

impl MockTransport {
    pub fn new() -> Self {
        let mut dirs = HashSet::new();
        dirs.insert("/".to_string());
        Self {
            files: Mutex::new(BTreeMap::new()),
            dirs: Mutex::new(dirs),
            delay: Duration::from_millis(10),
            path_delays: Mutex::new(HashMap::new()),
            fail_paths: Mutex::new(HashSet::new()),
            started: Mutex::new(Vec::new()),
            list_calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            connected: AtomicBool::new(true),
            transfer_size: 100,
        }
    }

    /// 每次传输的默认耗时
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn delay_on(&self, path: &str, delay: Duration) {
        self.path_delays
            .lock()
            .unwrap()
            .insert(path.to_string(), delay);
    }

    pub fn fail_on(&self, path: &str) {
        self.fail_paths.lock().unwrap().insert(path.to_string());
    }

    pub fn clear_failures(&self) {
        self.fail_paths.lock().unwrap().clear();
    }

    pub fn put_file(&self, path: &str, size: u64, mod_time: DateTime<Utc>) {
        let mut dirs = self.dirs.lock().unwrap();
        let mut parent = super::remote_parent(path);
        while parent != "/" && parent != "." {
            dirs.insert(parent.clone());
            parent = super::remote_parent(&parent);
        }
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), MockFile { size, mod_time });
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    /// 传输开始的顺序（远程路径）
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    async fn simulate(&self, remote_path: &str, on_progress: Option<ProgressFn>) -> Result<()> {
        self.started.lock().unwrap().push(remote_path.to_string());
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        scopeguard::defer! {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }

        let delay = self
            .path_delays
            .lock()
            .unwrap()
            .get(remote_path)
            .copied()
            .unwrap_or(self.delay);

        let total = self.transfer_size;
        let report = |transferred: u64| {
            if let Some(cb) = &on_progress {
                cb(TransferProgress {
                    file_name: remote_path.to_string(),
                    total_bytes: total,
                    transferred_bytes: transferred,
                    bytes_per_second: 1000,
                });
            }
        };

        report(0);
        tokio::time::sleep(delay / 2).await;
        report(total / 2);
        tokio::time::sleep(delay / 2).await;

        if self.fail_paths.lock().unwrap().contains(remote_path) {
            bail!("模拟传输失败: {}", remote_path);
        }
        report(total);
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn list(&self, path: &str) -> Result<Vec<FileRecord>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if !self.dirs.lock().unwrap().contains(path) {
            bail!("目录不存在: {}", path);
        }

        let mut records = Vec::new();
        for dir in self.dirs.lock().unwrap().iter() {
            if dir != "/" && super::remote_parent(dir) == path {
                records.push(FileRecord {
                    name: dir.rsplit('/').next().unwrap_or(dir).to_string(),
                    size: 0,
                    is_dir: true,
                    mod_time: Utc::now(),
                    permissions: "755".to_string(),
                });
            }
        }
        for (file_path, file) in self.files.lock().unwrap().iter() {
            if super::remote_parent(file_path) == path {
                records.push(FileRecord {
                    name: file_path.rsplit('/').next().unwrap_or(file_path).to_string(),
                    size: file.size,
                    is_dir: false,
                    mod_time: file.mod_time,
                    permissions: "644".to_string(),
                });
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    async fn stat(&self, path: &str) -> Result<FileRecord> {
        let files = self.files.lock().unwrap();
        let file = files
            .get(path)
            .ok_or_else(|| anyhow!("文件不存在: {}", path))?;
        Ok(FileRecord {
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            size: file.size,
            is_dir: false,
            mod_time: file.mod_time,
            permissions: "644".to_string(),
        })
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        self.dirs.lock().unwrap().insert(path.to_string());
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        if self.fail_paths.lock().unwrap().contains(path) {
            bail!("模拟删除失败: {}", path);
        }
        self.files
            .lock()
            .unwrap()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| anyhow!("文件不存在: {}", path))
    }

    async fn remove_dir(&self, path: &str) -> Result<()> {
        self.dirs.lock().unwrap().remove(path);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        let file = files
            .remove(from)
            .ok_or_else(|| anyhow!("文件不存在: {}", from))?;
        files.insert(to.to_string(), file);
        Ok(())
    }

    async fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        _resume: bool,
        on_progress: Option<ProgressFn>,
    ) -> Result<()> {
        self.simulate(remote_path, on_progress).await?;
        let size = std::fs::metadata(local_path)
            .map(|m| m.len())
            .unwrap_or(self.transfer_size);
        self.put_file(remote_path, size, Utc::now());
        Ok(())
    }

    async fn download(
        &self,
        remote_path: &str,
        local_path: &Path,
        _resume: bool,
        on_progress: Option<ProgressFn>,
    ) -> Result<()> {
        self.simulate(remote_path, on_progress).await?;
        let size = self
            .files
            .lock()
            .unwrap()
            .get(remote_path)
            .map(|f| f.size)
            .unwrap_or(self.transfer_size);
        if let Some(parent) = local_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(local_path, vec![0u8; size as usize])?;
        Ok(())
    }

    async fn get_reader(&self, path: &str) -> Result<BoxedReader> {
        let size = self
            .files
            .lock()
            .unwrap()
            .get(path)
            .map(|f| f.size)
            .ok_or_else(|| anyhow!("文件不存在: {}", path))?;
        Ok(Box::new(std::io::Cursor::new(vec![0u8; size as usize])))
    }

    async fn get_writer(&self, _path: &str, _append: bool) -> Result<BoxedWriter> {
        Ok(Box::new(tokio::io::sink()))
    }

    async fn current_dir(&self) -> Result<String> {
        Ok("/".to_string())
    }

    async fn change_dir(&self, path: &str) -> Result<()> {
        if self.dirs.lock().unwrap().contains(&join_remote("/", path)) {
            Ok(())
        } else {
            bail!("目录不存在: {}", path)
        }
    }

    fn protocol_name(&self) -> &str {
        "mock"
    }

    fn cache_scope(&self) -> String {
        "mock".to_string()
    }
}
