// 多线程切片与 hash 计算
//
// 把分片索引划分为连续的若干分带，每个分带交给一个阻塞线程：
// - 线程内逐个读取分片，计算分片 MD5，同时把字节喂给分带的 MD5
// - 所有分带结束后按顺序拼接分片列表，再把分带 hash（十六进制文本）依次折叠成文件 hash
//
// 文件 hash 取决于（字节, 分片大小, 分带方式），线程数不同 hash 也不同

use futures::future::try_join_all;
use parking_lot::Mutex;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::chunk::{chunk_range, total_chunks, UploadChunk};
use super::error::UploadError;
use super::hasher::HashingAccumulator;
use super::source::FileSource;
use super::types::FileId;
use crate::config::WorkerConfig;

/// 切片结果
#[derive(Debug, Clone)]
pub struct SliceOutput {
    /// 文件 hash
    pub file_hash: String,
    /// 按索引排列的分片列表
    pub chunks: Vec<UploadChunk>,
}

/// 单个分带的结果
struct BandOutput {
    hash: String,
    chunks: Vec<UploadChunk>,
}

/// 计算切片线程数
///
/// T = min(CPU 核数, 配置线程数)，至少为 1；分片数不超过 T 时只用 1 个线程。
/// 打开 `pin_thread_count` 后不再受 CPU 核数限制
pub fn resolve_thread_count(total: usize, config: &WorkerConfig) -> usize {
    let configured = config.thread.max(1);
    let threads = if config.pin_thread_count {
        configured
    } else {
        let hardware = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        configured.min(hardware).max(1)
    };

    if total <= threads {
        1
    } else {
        threads
    }
}

/// 按 ceil(total / threads) 划分连续分带
pub fn partition_bands(total: usize, threads: usize) -> Vec<Range<usize>> {
    if total == 0 {
        return Vec::new();
    }
    let threads = threads.max(1);
    let band_size = total.div_ceil(threads);

    (0..threads)
        .map(|i| {
            let start = (i * band_size).min(total);
            let end = (start + band_size).min(total);
            start..end
        })
        .filter(|band| !band.is_empty())
        .collect()
}

/// 切片器，每个上传任务一个
pub struct Slicer {
    file_id: FileId,
    source: Arc<dyn FileSource>,
    chunk_size: u64,
    config: WorkerConfig,
    /// 当前这次切片的取消令牌
    token: Mutex<CancellationToken>,
}

impl Slicer {
    pub fn new(
        file_id: FileId,
        source: Arc<dyn FileSource>,
        chunk_size: u64,
        config: WorkerConfig,
    ) -> Self {
        Self {
            file_id,
            source,
            chunk_size,
            config,
            token: Mutex::new(CancellationToken::new()),
        }
    }

    /// 开始切片
    ///
    /// 超时或 `stop()` 后所有 worker 在处理下一个分片前退出，结果被丢弃
    pub async fn start(&self) -> Result<SliceOutput, UploadError> {
        let token = CancellationToken::new();
        *self.token.lock() = token.clone();

        let size = self.source.size();
        let total = total_chunks(size, self.chunk_size);
        let threads = resolve_thread_count(total, &self.config);
        let bands = partition_bands(total, threads);
        let timeout = self.config.timeout();
        let started = Instant::now();

        info!(
            "开始切片: file={}, 名称={}, 大小={} bytes, 分片数={}, 线程数={}, 分带数={}",
            self.file_id,
            self.source.name(),
            size,
            total,
            threads,
            bands.len()
        );

        let handles: Vec<_> = bands
            .into_iter()
            .map(|band| {
                let source = self.source.clone();
                let token = token.clone();
                let file_id = self.file_id;
                let chunk_size = self.chunk_size;
                tokio::task::spawn_blocking(move || {
                    slice_band(file_id, source, band, chunk_size, size, &token)
                })
            })
            .collect();

        let joined = try_join_all(handles.into_iter().map(|handle| async move {
            handle
                .await
                .map_err(|e| UploadError::Slice(format!("切片线程异常: {}", e)))?
        }));

        let result = tokio::select! {
            _ = token.cancelled() => Err(UploadError::cancelled("切片已停止")),
            res = tokio::time::timeout(timeout, joined) => match res {
                Ok(res) => res,
                Err(_) => Err(UploadError::SliceTimeout(timeout)),
            },
        };

        let bands = match result {
            Ok(bands) => bands,
            Err(e) => {
                // 通知仍在运行的 worker 退出
                token.cancel();
                warn!("切片失败: file={}, 错误: {}", self.file_id, e);
                return Err(e);
            }
        };

        // 结果出来后被 stop 的也算取消
        if token.is_cancelled() {
            return Err(UploadError::cancelled("切片已停止"));
        }

        let mut file_acc = HashingAccumulator::new();
        let mut chunks = Vec::with_capacity(total);
        for band in bands {
            file_acc.append_str(&band.hash);
            chunks.extend(band.chunks);
        }
        let file_hash = file_acc.finish();

        info!(
            "✓ 切片完成: file={}, hash={}, 分片数={}, 耗时 {:?}",
            self.file_id,
            file_hash,
            chunks.len(),
            started.elapsed()
        );

        Ok(SliceOutput { file_hash, chunks })
    }

    /// 终止所有 worker
    pub fn stop(&self) {
        self.token.lock().cancel();
    }
}

fn slice_band(
    file_id: FileId,
    source: Arc<dyn FileSource>,
    band: Range<usize>,
    chunk_size: u64,
    size: u64,
    token: &CancellationToken,
) -> Result<BandOutput, UploadError> {
    let mut band_acc = HashingAccumulator::new();
    let mut chunks = Vec::with_capacity(band.len());

    for index in band.clone() {
        if token.is_cancelled() {
            return Err(UploadError::cancelled("切片已停止"));
        }

        let range = chunk_range(size, chunk_size, index);
        let bytes = source
            .read_range(range.clone())
            .map_err(|e| UploadError::Slice(format!("读取分片 #{} 失败: {}", index, e)))?;

        let hash = HashingAccumulator::digest(&bytes);
        band_acc.append(&bytes);
        chunks.push(UploadChunk::new(file_id, index, range, hash));
    }

    debug!(
        "分带完成: file={}, 分片 {}..{}",
        file_id, band.start, band.end
    );

    Ok(BandOutput {
        hash: band_acc.finish(),
        chunks,
    })
}
