use anyhow::Context;
use resilient_transfer::{
    logging, AppConfig, FileStore, HttpMutationExecutor, MutationExecutor, MutationQueue,
    NetworkMonitor, ReplayEngine, UploadFile, UploadOptions, UploadSession,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 配置文件路径环境变量
const CONFIG_PATH_ENV: &str = "RESILIENT_TRANSFER_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 建立连接超时
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// 上传命令行参数中的所有文件，返回失败数量
async fn upload_paths(session: &UploadSession, config: &AppConfig, paths: &[String]) -> usize {
    let mut files = Vec::with_capacity(paths.len());
    let mut failed = 0;
    for path in paths {
        match UploadFile::from_path(path).await {
            Ok(file) => files.push(file),
            Err(e) => {
                error!("无法读取文件 {}: {}", path, e);
                failed += 1;
            }
        }
    }

    let options = UploadOptions::from_config(&config.upload);
    for result in session.upload_multiple(files, options).await {
        match result {
            Ok(result) => info!(
                "✓ 上传成功: {} ({} bytes, {:?}, 第 {} 次尝试)",
                result.file_name, result.size, result.strategy, result.attempts
            ),
            Err(e) if e.is_cancelled() => {
                warn!("上传已取消");
                failed += 1;
            }
            Err(e) => {
                error!("上传失败: {}", e);
                failed += 1;
            }
        }
    }
    failed
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path =
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    // 先加载配置，日志系统依赖其中的日志配置
    let (config, load_error) = match AppConfig::load_from_file(&config_path).await {
        Ok(config) => (config, None),
        Err(e) => (AppConfig::default(), Some(e)),
    };

    // 初始化日志系统（必须保持 _log_guard 存活）
    let _log_guard = logging::init_logging(&config.log);

    info!("resilient-transfer v{} 启动中...", env!("CARGO_PKG_VERSION"));
    match load_error {
        None => info!("配置文件加载成功: {}", config_path),
        Some(e) => warn!("配置文件加载失败，使用默认配置: {}: {:#}", config_path, e),
    }

    // 离线写操作队列
    let store = FileStore::new(&config.queue.storage_dir)
        .with_context(|| format!("无法创建队列目录: {:?}", config.queue.storage_dir))?;
    let queue = Arc::new(MutationQueue::open(Arc::new(store), &config.queue));
    let replay_timeout = Duration::from_secs(config.queue.replay_timeout_secs);
    let executor: Arc<dyn MutationExecutor> = Arc::new(HttpMutationExecutor::new(replay_timeout)?);

    let monitor = NetworkMonitor::new(true);
    let engine = Arc::new(
        ReplayEngine::new(queue.clone(), monitor.clone())
            .with_executor_timeout(Some(replay_timeout)),
    );
    let shutdown = CancellationToken::new();
    let replay_task = engine.spawn(executor.clone(), shutdown.clone());

    // 启动时回放上次遗留的操作
    if !queue.is_empty() {
        info!("发现 {} 个待回放的写操作", queue.len());
        let report = engine.drain_and_replay(executor.as_ref()).await;
        info!(
            "回放完成: 成功={}, 重新入队={}, 丢弃={}",
            report.succeeded, report.requeued, report.dropped
        );
    }

    // 上传命令行指定的文件
    let paths: Vec<String> = std::env::args().skip(1).collect();
    let mut failed = 0;
    if !paths.is_empty() {
        let session = UploadSession::with_reqwest(CONNECT_TIMEOUT)?;

        let uploads = upload_paths(&session, &config, &paths);
        tokio::pin!(uploads);

        failed = tokio::select! {
            count = &mut uploads => count,
            _ = tokio::signal::ctrl_c() => {
                info!("收到 Ctrl+C，取消所有上传");
                session.cancel_all();
                // 继续等待，让每个文件都以取消结果返回
                uploads.await
            }
        };
    }

    // 优雅关闭
    shutdown.cancel();
    if let Err(e) = replay_task.await {
        warn!("回放任务异常退出: {}", e);
    }
    queue.persist();
    info!("应用已安全退出");

    if failed > 0 {
        anyhow::bail!("{} 个文件上传失败", failed);
    }
    Ok(())
}
