use super::{
    join_remote, optimal_buffer_size, BoxedReader, BoxedWriter, FileRecord, ProgressFn,
    Transport, TransferProgress,
};
use crate::core::throttle::BandwidthLimiter;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// 以本地目录作为"远程"根目录的 Transport 实现
///
/// 用于本地到本地的同步（例如挂载的网络盘）以及测试。
pub struct LocalTransport {
    base_path: PathBuf,
    name: String,
    connected: AtomicBool,
    cwd: Mutex<String>,
    bandwidth: Option<Arc<BandwidthLimiter>>,
}

impl LocalTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let base_path = path.into();
        let name = format!("local:{}", base_path.display());
        Self {
            base_path,
            name,
            connected: AtomicBool::new(false),
            cwd: Mutex::new("/".to_string()),
            bandwidth: None,
        }
    }

    /// 对上传写入和下载读取应用带宽限制
    pub fn with_bandwidth(mut self, limiter: Arc<BandwidthLimiter>) -> Self {
        self.bandwidth = Some(limiter);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn ensure_connected(&self) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            bail!("未连接: {}", self.name);
        }
        Ok(())
    }

    fn cwd(&self) -> String {
        self.cwd
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 相对路径基于当前目录解析，结果始终以 `/` 开头
    fn absolute(&self, path: &str) -> String {
        let joined = if path.starts_with('/') {
            path.to_string()
        } else {
            join_remote(&self.cwd(), path)
        };

        let mut parts: Vec<&str> = Vec::new();
        for part in joined.split(['/', '\\']) {
            match part {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                p => parts.push(p),
            }
        }
        format!("/{}", parts.join("/"))
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let absolute = self.absolute(path);
        let relative = absolute.trim_start_matches('/');
        if relative.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(relative)
        }
    }

    fn to_record(name: String, metadata: &std::fs::Metadata) -> FileRecord {
        let mod_time = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        FileRecord {
            name,
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            is_dir: metadata.is_dir(),
            mod_time,
            permissions: permissions_string(metadata),
        }
    }

    fn wrap_reader(&self, file: fs::File) -> BoxedReader {
        match &self.bandwidth {
            Some(limiter) => limiter.wrap_reader(file),
            None => Box::new(file),
        }
    }

    async fn open_remote(&self, path: &str) -> Result<fs::File> {
        self.ensure_connected()?;
        let full_path = self.resolve_path(path);
        fs::File::open(&full_path)
            .await
            .with_context(|| format!("打开远程文件失败: {}", full_path.display()))
    }

    fn wrap_writer(&self, file: fs::File) -> BoxedWriter {
        match &self.bandwidth {
            Some(limiter) => limiter.wrap_writer(file),
            None => Box::new(file),
        }
    }
}

#[cfg(unix)]
fn permissions_string(metadata: &std::fs::Metadata) -> String {
    use std::os::unix::fs::PermissionsExt;
    format!("{:o}", metadata.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
fn permissions_string(metadata: &std::fs::Metadata) -> String {
    if metadata.permissions().readonly() {
        "r--".to_string()
    } else {
        "rw-".to_string()
    }
}

/// 续传偏移：目标存在且不超过源大小时从目标末尾继续
async fn resume_offset(dest: &Path, total: u64, resume: bool) -> u64 {
    if !resume {
        return 0;
    }
    match fs::metadata(dest).await {
        Ok(meta) if meta.is_file() && meta.len() <= total => meta.len(),
        _ => 0,
    }
}

async fn open_dest(dest: &Path, offset: u64) -> Result<fs::File> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("创建目录失败: {}", parent.display()))?;
    }

    let file = if offset > 0 {
        fs::OpenOptions::new().append(true).open(dest).await
    } else {
        fs::File::create(dest).await
    };
    file.with_context(|| format!("打开目标文件失败: {}", dest.display()))
}

async fn copy_with_progress(
    mut reader: BoxedReader,
    mut writer: BoxedWriter,
    offset: u64,
    total: u64,
    file_name: String,
    on_progress: Option<ProgressFn>,
) -> Result<u64> {
    let mut buf = vec![0u8; optimal_buffer_size(total)];
    let started = Instant::now();
    let mut transferred = offset;
    let mut moved = 0u64;

    let report = |transferred: u64, moved: u64| {
        if let Some(cb) = &on_progress {
            let elapsed = started.elapsed().as_secs_f64();
            let speed = if elapsed > 0.0 {
                (moved as f64 / elapsed) as u64
            } else {
                0
            };
            cb(TransferProgress {
                file_name: file_name.clone(),
                total_bytes: total,
                transferred_bytes: transferred,
                bytes_per_second: speed,
            });
        }
    };

    report(transferred, moved);

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        transferred += n as u64;
        moved += n as u64;
        report(transferred, moved);
    }

    writer.flush().await?;
    writer.shutdown().await?;

    Ok(transferred)
}

fn file_name_of(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&self) -> Result<()> {
        if !self.base_path.exists() {
            fs::create_dir_all(&self.base_path)
                .await
                .with_context(|| format!("创建根目录失败: {}", self.base_path.display()))?;
        }
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!("已连接本地传输: {}", self.name);
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
        self.ensure_connected()?;
        let dir = self.resolve_path(path);

        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("读取目录失败: {}", dir.display()))?;

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!("跳过无法读取的条目 {:?}: {}", entry.path(), e);
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            records.push(Self::to_record(name, &metadata));
        }

        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    async fn stat(&self, path: &str) -> Result<FileRecord> {
        self.ensure_connected()?;
        let full_path = self.resolve_path(path);
        let metadata = fs::metadata(&full_path)
            .await
            .with_context(|| format!("获取文件信息失败: {}", full_path.display()))?;

        let absolute = self.absolute(path);
        let name = if absolute == "/" {
            "/".to_string()
        } else {
            file_name_of(&absolute)
        };
        Ok(Self::to_record(name, &metadata))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        self.ensure_connected()?;
        let full_path = self.resolve_path(path);
        fs::create_dir_all(&full_path)
            .await
            .with_context(|| format!("创建目录失败: {}", full_path.display()))
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.ensure_connected()?;
        let full_path = self.resolve_path(path);
        fs::remove_file(&full_path)
            .await
            .with_context(|| format!("删除文件失败: {}", full_path.display()))
    }

    async fn remove_dir(&self, path: &str) -> Result<()> {
        self.ensure_connected()?;
        let full_path = self.resolve_path(path);
        fs::remove_dir(&full_path)
            .await
            .with_context(|| format!("删除目录失败: {}", full_path.display()))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.ensure_connected()?;
        let from_path = self.resolve_path(from);
        let to_path = self.resolve_path(to);
        fs::rename(&from_path, &to_path)
            .await
            .with_context(|| format!("重命名失败: {} -> {}", from_path.display(), to_path.display()))
    }

    async fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        resume: bool,
        on_progress: Option<ProgressFn>,
    ) -> Result<()> {
        self.ensure_connected()?;
        let dest = self.resolve_path(remote_path);

        let total = fs::metadata(local_path)
            .await
            .with_context(|| format!("读取本地文件信息失败: {}", local_path.display()))?
            .len();
        let offset = resume_offset(&dest, total, resume).await;

        let mut source = fs::File::open(local_path)
            .await
            .with_context(|| format!("打开本地文件失败: {}", local_path.display()))?;
        if offset > 0 {
            source.seek(std::io::SeekFrom::Start(offset)).await?;
            tracing::debug!("续传上传 {} 从 {} 字节开始", remote_path, offset);
        }

        let dest_file = open_dest(&dest, offset).await?;
        copy_with_progress(
            Box::new(source),
            self.wrap_writer(dest_file),
            offset,
            total,
            file_name_of(remote_path),
            on_progress,
        )
        .await?;

        Ok(())
    }

    async fn download(
        &self,
        remote_path: &str,
        local_path: &Path,
        resume: bool,
        on_progress: Option<ProgressFn>,
    ) -> Result<()> {
        self.ensure_connected()?;
        let source_path = self.resolve_path(remote_path);

        let total = fs::metadata(&source_path)
            .await
            .with_context(|| format!("读取远程文件信息失败: {}", source_path.display()))?
            .len();
        let offset = resume_offset(local_path, total, resume).await;

        let mut source = fs::File::open(&source_path)
            .await
            .with_context(|| format!("打开远程文件失败: {}", source_path.display()))?;
        if offset > 0 {
            source.seek(std::io::SeekFrom::Start(offset)).await?;
            tracing::debug!("续传下载 {} 从 {} 字节开始", remote_path, offset);
        }

        let dest_file = open_dest(local_path, offset).await?;
        copy_with_progress(
            self.wrap_reader(source),
            Box::new(dest_file),
            offset,
            total,
            file_name_of(remote_path),
            on_progress,
        )
        .await?;

        Ok(())
    }

    async fn get_reader(&self, path: &str) -> Result<BoxedReader> {
        let file = self.open_remote(path).await?;
        Ok(self.wrap_reader(file))
    }

    async fn get_raw_reader(&self, path: &str) -> Result<BoxedReader> {
        Ok(Box::new(self.open_remote(path).await?))
    }

    async fn get_writer(&self, path: &str, append: bool) -> Result<BoxedWriter> {
        self.ensure_connected()?;
        let full_path = self.resolve_path(path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&full_path)
            .await
            .with_context(|| format!("打开远程文件失败: {}", full_path.display()))?;
        Ok(self.wrap_writer(file))
    }

    async fn current_dir(&self) -> Result<String> {
        Ok(self.cwd())
    }

    async fn change_dir(&self, path: &str) -> Result<()> {
        self.ensure_connected()?;
        let absolute = self.absolute(path);
        let full_path = self.resolve_path(&absolute);
        if !fs::metadata(&full_path).await.map(|m| m.is_dir()).unwrap_or(false) {
            bail!("目录不存在: {}", absolute);
        }
        *self.cwd.lock().unwrap_or_else(PoisonError::into_inner) = absolute;
        Ok(())
    }

    fn protocol_name(&self) -> &str {
        "local"
    }

    fn cache_scope(&self) -> String {
        self.name.clone()
    }
}
