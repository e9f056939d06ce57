use crate::core::cache::DirectoryCache;
use crate::core::comparator::{FileMap, ScannedFile};
use crate::error::{CoreError, Result};
use crate::transport::{join_remote, FileRecord, Transport};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const CHECKSUM_BUFFER_SIZE: usize = 64 * 1024;

/// include/exclude glob 过滤
///
/// 模式与 basename 或完整相对路径任一匹配即算命中。`*` 和 `?` 不跨越 `/`，
/// 支持 `[abc]`、`[a-z]`、`[!x]` 字符类，区分大小写。
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    exclude: Vec<Regex>,
    include: Vec<Regex>,
}

impl PathFilter {
    pub fn new(exclude_patterns: &[String], include_patterns: &[String]) -> Self {
        Self {
            exclude: compile_patterns(exclude_patterns),
            include: compile_patterns(include_patterns),
        }
    }

    fn matches_any(patterns: &[Regex], rel_path: &str) -> bool {
        let base = rel_path.rsplit('/').next().unwrap_or(rel_path);
        patterns
            .iter()
            .any(|re| re.is_match(base) || re.is_match(rel_path))
    }

    pub fn is_excluded(&self, rel_path: &str) -> bool {
        Self::matches_any(&self.exclude, rel_path)
    }

    /// 未配置 include 时全部包含
    pub fn is_included(&self, rel_path: &str) -> bool {
        self.include.is_empty() || Self::matches_any(&self.include, rel_path)
    }

    pub fn accepts_file(&self, rel_path: &str) -> bool {
        !self.is_excluded(rel_path) && self.is_included(rel_path)
    }

    /// 目录只受 exclude 影响，include 只作用于文件
    pub fn accepts_dir(&self, rel_path: &str) -> bool {
        !self.is_excluded(rel_path)
    }
}

fn compile_patterns(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| match glob_to_regex(p) {
            Some(re) => Some(re),
            None => {
                warn!("无效的匹配模式，已忽略: {}", p);
                None
            }
        })
        .collect()
}

/// 把 glob 模式转换为锚定的正则表达式
pub fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::with_capacity(pattern.len() * 2 + 2);
    re.push('^');

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            '\\' => {
                let escaped = chars.next()?;
                re.push_str(&regex::escape(&escaped.to_string()));
            }
            '[' => {
                re.push('[');
                if matches!(chars.peek(), Some('!') | Some('^')) {
                    chars.next();
                    re.push('^');
                }
                let mut closed = false;
                let mut empty = true;
                while let Some(c) = chars.next() {
                    match c {
                        ']' if !empty => {
                            closed = true;
                            break;
                        }
                        '\\' => {
                            let escaped = chars.next()?;
                            re.push('\\');
                            re.push(escaped);
                        }
                        '[' | '&' | '~' | ']' => {
                            re.push('\\');
                            re.push(c);
                        }
                        _ => re.push(c),
                    }
                    empty = false;
                }
                if !closed {
                    return None;
                }
                re.push(']');
            }
            _ => re.push_str(&regex::escape(&c.to_string())),
        }
    }

    re.push('$');
    Regex::new(&re).ok()
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// 文件扫描器
pub struct FileScanner<'a> {
    filter: &'a PathFilter,
    ignore_hidden: bool,
    cancel: Option<&'a CancellationToken>,
}

impl<'a> FileScanner<'a> {
    pub fn new(filter: &'a PathFilter, ignore_hidden: bool) -> Self {
        Self {
            filter,
            ignore_hidden,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: &'a CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn check_cancelled(&self) -> Result<()> {
        match self.cancel {
            Some(token) if token.is_cancelled() => Err(CoreError::Cancelled),
            _ => Ok(()),
        }
    }

    /// 递归扫描本地目录；根目录不存在时返回空表
    pub async fn scan_local(&self, root: &Path) -> Result<FileMap> {
        self.check_cancelled()?;

        if !tokio::fs::try_exists(root).await.unwrap_or(false) {
            debug!("本地目录不存在，视为空: {}", root.display());
            return Ok(FileMap::new());
        }

        let root = root.to_path_buf();
        let filter = self.filter.clone();
        let ignore_hidden = self.ignore_hidden;
        let cancel = self.cancel.cloned();

        let files = tokio::task::spawn_blocking(move || {
            walk_local(&root, &filter, ignore_hidden, cancel.as_ref())
        })
        .await
        .map_err(|e| CoreError::local_io("扫描", PathBuf::new(), std::io::Error::other(e)))??;

        info!("本地扫描完成: {} 个文件", files.len());
        Ok(files)
    }

    /// 递归扫描远程目录，目录列表优先从缓存读取
    ///
    /// 根目录不存在时返回空表。
    pub async fn scan_remote(
        &self,
        transport: &dyn Transport,
        cache: Option<&DirectoryCache>,
        root: &str,
    ) -> Result<FileMap> {
        let mut files = FileMap::new();

        let root_entries = match list_dir(transport, cache, root).await {
            Ok(entries) => entries,
            Err(e) => {
                if transport.stat(root).await.is_err() {
                    debug!("远程目录不存在，视为空: {}", root);
                    return Ok(files);
                }
                return Err(e);
            }
        };

        let mut stack: Vec<(String, Vec<FileRecord>)> = vec![(String::new(), root_entries)];
        while let Some((dir_rel, entries)) = stack.pop() {
            self.check_cancelled()?;

            for entry in entries {
                if self.ignore_hidden && is_hidden(&entry.name) {
                    continue;
                }
                let rel = if dir_rel.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{}/{}", dir_rel, entry.name)
                };

                if entry.is_dir {
                    if !self.filter.accepts_dir(&rel) {
                        debug!("排除目录: {}", rel);
                        continue;
                    }
                    let children = list_dir(transport, cache, &join_remote(root, &rel)).await?;
                    stack.push((rel, children));
                } else if self.filter.accepts_file(&rel) {
                    files.insert(
                        rel.clone(),
                        ScannedFile {
                            relative_path: rel,
                            size: entry.size,
                            mod_time: entry.mod_time,
                            checksum: None,
                        },
                    );
                }
            }
        }

        info!("远程扫描完成: {} 个文件", files.len());
        Ok(files)
    }
}

async fn list_dir(
    transport: &dyn Transport,
    cache: Option<&DirectoryCache>,
    path: &str,
) -> Result<Vec<FileRecord>> {
    let scope = transport.cache_scope();
    if let Some(hit) = cache.and_then(|c| c.get(&scope, path)) {
        return Ok(hit);
    }

    let entries = transport
        .list(path)
        .await
        .map_err(|e| CoreError::transport("list", path, e))?;
    if let Some(cache) = cache {
        cache.set(&scope, path, &entries);
    }
    Ok(entries)
}

fn walk_local(
    root: &Path,
    filter: &PathFilter,
    ignore_hidden: bool,
    cancel: Option<&CancellationToken>,
) -> Result<FileMap> {
    let mut files = FileMap::new();

    let walker = WalkDir::new(root).min_depth(1).into_iter().filter_entry(|entry| {
        let name = entry.file_name().to_string_lossy();
        if ignore_hidden && is_hidden(&name) {
            return false;
        }
        if entry.file_type().is_dir() {
            return relative_path(root, entry.path())
                .map(|rel| filter.accepts_dir(&rel))
                .unwrap_or(false);
        }
        true
    });

    for (index, entry) in walker.enumerate() {
        if index % 100 == 0 && cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(CoreError::Cancelled);
        }

        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
            CoreError::local_io("扫描", path, e.into())
        })?;

        // 符号链接不跟随也不同步
        if !entry.file_type().is_file() {
            continue;
        }

        let Some(rel) = relative_path(root, entry.path()) else {
            continue;
        };
        if !filter.accepts_file(&rel) {
            debug!("排除文件: {}", rel);
            continue;
        }

        let metadata = entry
            .metadata()
            .map_err(|e| CoreError::local_io("读取文件信息", entry.path(), e.into()))?;
        let mod_time = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        files.insert(
            rel.clone(),
            ScannedFile {
                relative_path: rel,
                size: metadata.len(),
                mod_time,
                checksum: None,
            },
        );
    }

    Ok(files)
}

/// `/` 分隔的相对路径
fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

/// 计算本地文件内容的 BLAKE3 校验和（十六进制）
pub async fn compute_local_checksum(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file =
            std::fs::File::open(&path).map_err(|e| CoreError::local_io("打开文件", &path, e))?;
        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; CHECKSUM_BUFFER_SIZE];
        loop {
            let n = file
                .read(&mut buf)
                .map_err(|e| CoreError::local_io("读取文件", &path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize().to_hex().to_string())
    })
    .await
    .map_err(|e| CoreError::local_io("计算校验和", PathBuf::new(), std::io::Error::other(e)))?
}

/// 通过 Transport 流式读取远程文件并计算 BLAKE3 校验和
pub async fn compute_remote_checksum(transport: &dyn Transport, path: &str) -> Result<String> {
    let mut reader = transport
        .get_raw_reader(path)
        .await
        .map_err(|e| CoreError::transport("read", path, e))?;

    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; CHECKSUM_BUFFER_SIZE];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| CoreError::transport("read", path, e.into()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}
