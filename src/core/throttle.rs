//! 带宽限制 - 令牌桶限速与读写流包装

use crate::transport::{BoxedReader, BoxedWriter};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

// 常用带宽预设（字节/秒）
pub const BANDWIDTH_UNLIMITED: u64 = 0;
pub const BANDWIDTH_100_KBPS: u64 = 12_500;
pub const BANDWIDTH_256_KBPS: u64 = 32_000;
pub const BANDWIDTH_512_KBPS: u64 = 64_000;
pub const BANDWIDTH_1_MBPS: u64 = 125_000;
pub const BANDWIDTH_2_MBPS: u64 = 250_000;
pub const BANDWIDTH_5_MBPS: u64 = 625_000;
pub const BANDWIDTH_10_MBPS: u64 = 1_250_000;
pub const BANDWIDTH_50_MBPS: u64 = 6_250_000;
pub const BANDWIDTH_100_MBPS: u64 = 12_500_000;

/// 带宽预设
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthPreset {
    pub name: &'static str,
    pub bytes_per_second: u64,
}

/// 可选的带宽预设列表
pub fn bandwidth_presets() -> Vec<BandwidthPreset> {
    [
        ("Unlimited", BANDWIDTH_UNLIMITED),
        ("100 Kbit/s", BANDWIDTH_100_KBPS),
        ("256 Kbit/s", BANDWIDTH_256_KBPS),
        ("512 Kbit/s", BANDWIDTH_512_KBPS),
        ("1 Mbit/s", BANDWIDTH_1_MBPS),
        ("2 Mbit/s", BANDWIDTH_2_MBPS),
        ("5 Mbit/s", BANDWIDTH_5_MBPS),
        ("10 Mbit/s", BANDWIDTH_10_MBPS),
        ("50 Mbit/s", BANDWIDTH_50_MBPS),
        ("100 Mbit/s", BANDWIDTH_100_MBPS),
    ]
    .into_iter()
    .map(|(name, bytes_per_second)| BandwidthPreset {
        name,
        bytes_per_second,
    })
    .collect()
}

#[derive(Debug)]
struct Bucket {
    rate: u64,
    /// 可为负数：表示已预支、尚需等待偿还的字节数
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate as f64).min(self.rate as f64);
        self.last_refill = now;
    }
}

/// 令牌桶限速器
///
/// 容量等于每秒字节数，按实际经过的时间连续补充。速率 0 表示不限速。
/// 桶初始为空，`set_rate` 也会清空桶，因此第一秒同样受限。
/// 超过容量的请求不会死锁：余额记为负数，调用方睡眠直到偿还。
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(bytes_per_second: u64) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                rate: bytes_per_second,
                tokens: 0.0,
                last_refill: Instant::now(),
            }),
        }
    }

    /// 修改速率，下一次 `wait` 生效
    pub fn set_rate(&self, bytes_per_second: u64) {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        bucket.rate = bytes_per_second;
        bucket.tokens = 0.0;
        bucket.last_refill = Instant::now();
    }

    pub fn rate(&self) -> u64 {
        self.bucket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .rate
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate() == 0
    }

    /// 预支 `n` 字节，返回需要等待的时长
    pub fn reserve(&self, n: u64) -> Option<Duration> {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        if bucket.rate == 0 || n == 0 {
            return None;
        }

        bucket.refill(Instant::now());
        bucket.tokens -= n as f64;

        if bucket.tokens >= 0.0 {
            None
        } else {
            let secs = -bucket.tokens / bucket.rate as f64;
            Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
        }
    }

    /// 等待直到可以传输 `n` 字节
    pub async fn wait(&self, n: u64) {
        if let Some(delay) = self.reserve(n) {
            tokio::time::sleep(delay).await;
        }
    }
}

/// 限速读取包装
///
/// 每次读取后按实际字节数扣减，欠下的时间在下一次读取前睡眠偿还。
pub struct ThrottledReader<R> {
    inner: R,
    limiter: Arc<RateLimiter>,
    delay: Option<Pin<Box<Sleep>>>,
}

impl<R> ThrottledReader<R> {
    pub fn new(inner: R, limiter: Arc<RateLimiter>) -> Self {
        Self {
            inner,
            limiter,
            delay: None,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ThrottledReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some(delay) = this.delay.as_mut() {
            ready!(delay.as_mut().poll(cx));
            this.delay = None;
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let n = buf.filled().len() - before;

        if let Some(wait) = this.limiter.reserve(n as u64) {
            this.delay = Some(Box::pin(tokio::time::sleep(wait)));
        }

        Poll::Ready(Ok(()))
    }
}

/// 限速写入包装
pub struct ThrottledWriter<W> {
    inner: W,
    limiter: Arc<RateLimiter>,
    delay: Option<Pin<Box<Sleep>>>,
}

impl<W> ThrottledWriter<W> {
    pub fn new(inner: W, limiter: Arc<RateLimiter>) -> Self {
        Self {
            inner,
            limiter,
            delay: None,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn poll_delay(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if let Some(delay) = self.delay.as_mut() {
            ready!(delay.as_mut().poll(cx));
            self.delay = None;
        }
        Poll::Ready(())
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ThrottledWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_delay(cx));

        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        if let Some(wait) = this.limiter.reserve(n as u64) {
            this.delay = Some(Box::pin(tokio::time::sleep(wait)));
        }

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_delay(cx));
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_delay(cx));
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// 上传/下载两路独立限速
#[derive(Debug)]
pub struct BandwidthLimiter {
    upload: Arc<RateLimiter>,
    download: Arc<RateLimiter>,
}

impl BandwidthLimiter {
    /// 速率为 0 表示不限速
    pub fn new(upload_bytes_per_sec: u64, download_bytes_per_sec: u64) -> Self {
        Self {
            upload: Arc::new(RateLimiter::new(upload_bytes_per_sec)),
            download: Arc::new(RateLimiter::new(download_bytes_per_sec)),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(BANDWIDTH_UNLIMITED, BANDWIDTH_UNLIMITED)
    }

    pub fn set_upload_rate(&self, bytes_per_second: u64) {
        self.upload.set_rate(bytes_per_second);
    }

    pub fn set_download_rate(&self, bytes_per_second: u64) {
        self.download.set_rate(bytes_per_second);
    }

    pub fn upload_rate(&self) -> u64 {
        self.upload.rate()
    }

    pub fn download_rate(&self) -> u64 {
        self.download.rate()
    }

    pub fn upload_limiter(&self) -> Arc<RateLimiter> {
        self.upload.clone()
    }

    pub fn download_limiter(&self) -> Arc<RateLimiter> {
        self.download.clone()
    }

    /// 包装下载方向的读取流（不限速时原样返回）
    pub fn wrap_reader<R>(&self, reader: R) -> BoxedReader
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        if self.download.is_unlimited() {
            return Box::new(reader);
        }
        Box::new(ThrottledReader::new(reader, self.download.clone()))
    }

    /// 包装上传方向的写入流（不限速时原样返回）
    pub fn wrap_writer<W>(&self, writer: W) -> BoxedWriter
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        if self.upload.is_unlimited() {
            return Box::new(writer);
        }
        Box::new(ThrottledWriter::new(writer, self.upload.clone()))
    }
}

impl Default for BandwidthLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}
