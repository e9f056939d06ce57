use anyhow::{bail, Context};
use ftpsync_lib::config::load_sync_options;
use ftpsync_lib::logging::{init_logging, LogConfig};
use ftpsync_lib::transport::{LocalTransport, Transport};
use ftpsync_lib::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 用法: ftpsync <local_dir> <remote_root>
///
/// 把本地目录同步到另一个本地目录（通过 LocalTransport 模拟远程端）。
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let [local_dir, remote_root] = args.as_slice() else {
        bail!("用法: ftpsync <local_dir> <remote_root>");
    };

    let config_dir = ftpsync_lib::dirs::app_config_dir();
    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("创建配置目录失败: {}", config_dir.display()))?;

    // guard 需要持有到进程结束
    let log_guard = init_logging(&config_dir.join("logs"), &LogConfig::load(&config_dir));

    let state = AppState::load(&config_dir);
    for info in state.resume.get_incomplete() {
        tracing::info!(
            "未完成的传输: {} {} -> {} ({}/{} 字节)",
            info.direction,
            info.local_path.display(),
            info.remote_path,
            info.transferred_bytes,
            info.total_bytes
        );
    }

    let transport = Arc::new(
        LocalTransport::new(PathBuf::from(remote_root)).with_bandwidth(state.bandwidth.clone()),
    );
    transport.connect().await.context("连接失败")?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("收到中断信号，正在取消同步");
            ctrl_c.cancel();
        }
    });

    let options = load_sync_options(&config_dir);
    let result = state
        .syncer(transport.clone(), options)
        .execute(&PathBuf::from(local_dir), "/", &cancel)
        .await?;

    transport.disconnect().await.ok();
    state.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&result.summary())?);
    if !result.is_success() {
        drop(log_guard);
        std::process::exit(1);
    }
    Ok(())
}
