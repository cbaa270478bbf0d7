use anyhow::{bail, Context};
use bigfile_upload::{logging, AppConfig, UploadEvent, UploadQueue};
use std::path::Path;
use tracing::{error, info, warn};

/// 未指定配置文件时的默认路径
const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 第一个参数以 .toml 结尾时作为配置文件，其余为待上传文件
fn split_args(mut args: Vec<String>) -> (Option<String>, Vec<String>) {
    match args.first() {
        Some(first) if first.ends_with(".toml") => {
            let config = args.remove(0);
            (Some(config), args)
        }
        _ => (None, args),
    }
}

async fn load_config(path: Option<String>) -> anyhow::Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load_from_file(&path)
            .await
            .with_context(|| format!("加载配置失败: {}", path)),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => AppConfig::load_from_file(DEFAULT_CONFIG_PATH)
            .await
            .with_context(|| format!("加载配置失败: {}", DEFAULT_CONFIG_PATH)),
        None => Ok(AppConfig::default()),
    }
}

fn print_event(event: &UploadEvent) {
    match event {
        UploadEvent::Progress(p) => info!(
            "📤 file={} {:.2}% ({}/{} 分片) {} 剩余 {}s",
            p.file_id,
            p.percentage,
            p.completed_chunks,
            p.total_chunks,
            p.rate_text,
            p.left_time.map(|t| t.to_string()).unwrap_or_else(|| "-".into())
        ),
        UploadEvent::SliceEnd {
            file_id,
            file_hash,
            total_chunks,
            ..
        } => info!("切片完成: file={}, hash={}, 分片数={}", file_id, file_hash, total_chunks),
        UploadEvent::Success { file_id, path, .. } => {
            info!("✓ 上传成功: file={}, path={:?}", file_id, path)
        }
        UploadEvent::UploadError { file_id, error, .. }
        | UploadEvent::SliceError { file_id, error, .. } => {
            warn!("上传出错: file={}, 错误: {}", file_id, error)
        }
        _ => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config_path, files) = split_args(std::env::args().skip(1).collect());
    if files.is_empty() {
        bail!("用法: bigfile-upload [config.toml] <file>...");
    }

    let config = load_config(config_path).await?;
    let _log_guard = logging::init_logging(&config.log);
    info!("🚀 bigfile-upload 启动, 待上传 {} 个文件", files.len());

    let queue = UploadQueue::with_http(&config)?;
    let mut events = queue.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    let mut handles = Vec::with_capacity(files.len());
    for file in &files {
        handles.push((file.clone(), queue.add_path(file).await?));
    }

    let mut failed = 0;
    for (file, handle) in handles {
        match handle.completion.await {
            Ok(outcome) => info!("{} -> {:?}", file, outcome.path),
            Err(e) => {
                failed += 1;
                error!("{} 上传失败: {}", file, e);
            }
        }
    }

    drop(queue);
    printer.abort();

    if failed > 0 {
        bail!("{} 个文件上传失败", failed);
    }
    info!("全部上传完成");
    Ok(())
}
