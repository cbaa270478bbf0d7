// 上传分片管理
//
// 分片规则：
// - 分片数 = ceil(文件大小 / 分片大小)，空文件 0 个分片
// - 最后一个分片可以不足分片大小
// - 分片 hash 只由分片字节决定

use std::collections::BTreeSet;
use std::ops::Range;
use tracing::debug;

use super::types::FileId;

/// 计算分片数量
pub fn total_chunks(file_size: u64, chunk_size: u64) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    file_size.div_ceil(chunk_size) as usize
}

/// 计算每个分片的字节范围
pub fn plan_ranges(file_size: u64, chunk_size: u64) -> Vec<Range<u64>> {
    let mut ranges = Vec::with_capacity(total_chunks(file_size, chunk_size));
    if chunk_size == 0 {
        return ranges;
    }

    let mut offset = 0u64;
    while offset < file_size {
        let end = std::cmp::min(offset + chunk_size, file_size);
        ranges.push(offset..end);
        offset = end;
    }
    ranges
}

/// 指定索引的分片范围
pub fn chunk_range(file_size: u64, chunk_size: u64, index: usize) -> Range<u64> {
    let start = (index as u64 * chunk_size).min(file_size);
    let end = (start + chunk_size).min(file_size);
    start..end
}

/// 上传分片信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadChunk {
    /// 所属文件
    pub file_id: FileId,
    /// 分片索引（从 0 开始）
    pub index: usize,
    /// 字节范围
    pub range: Range<u64>,
    /// 分片 MD5
    pub hash: String,
}

impl UploadChunk {
    pub fn new(file_id: FileId, index: usize, range: Range<u64>, hash: String) -> Self {
        Self {
            file_id,
            index,
            range,
            hash,
        }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }
}

/// 上传分片管理器
///
/// 保存切片结果以及服务端已确认的分片
#[derive(Debug, Default)]
pub struct UploadChunkManager {
    /// 所有分片（切片完成后才有）
    chunks: Vec<UploadChunk>,
    /// 已确认上传的分片索引
    confirmed: BTreeSet<usize>,
    /// 文件总大小
    total_size: u64,
}

impl UploadChunkManager {
    pub fn new(total_size: u64) -> Self {
        Self {
            chunks: Vec::new(),
            confirmed: BTreeSet::new(),
            total_size,
        }
    }

    /// 写入切片结果
    pub fn set_chunks(&mut self, chunks: Vec<UploadChunk>) {
        debug!("写入切片结果: 分片数量={}", chunks.len());
        self.chunks = chunks;
        self.confirmed.clear();
    }

    /// 获取所有分片
    pub fn chunks(&self) -> &[UploadChunk] {
        &self.chunks
    }

    /// 获取分片数量
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// 获取已确认的分片数量
    pub fn completed_count(&self) -> usize {
        self.confirmed.len()
    }

    /// 标记分片已上传，返回是否为新确认
    pub fn confirm(&mut self, index: usize) -> bool {
        if index >= self.chunks.len() {
            return false;
        }
        self.confirmed.insert(index)
    }

    /// 用 check 接口返回的已上传集合替换确认列表
    pub fn replace_confirmed(&mut self, indices: impl IntoIterator<Item = usize>) {
        let count = self.chunks.len();
        self.confirmed = indices.into_iter().filter(|i| *i < count).collect();
    }

    /// 尚未确认的分片
    pub fn residual(&self) -> Vec<UploadChunk> {
        self.chunks
            .iter()
            .filter(|c| !self.confirmed.contains(&c.index))
            .cloned()
            .collect()
    }

    /// 获取已上传的字节数
    pub fn uploaded_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| self.confirmed.contains(&c.index))
            .map(|c| c.size())
            .sum()
    }

    /// 计算上传进度（0-100）
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return if self.is_completed() { 100.0 } else { 0.0 };
        }
        (self.uploaded_bytes() as f64 / self.total_size as f64) * 100.0
    }

    /// 是否全部确认
    pub fn is_completed(&self) -> bool {
        self.confirmed.len() == self.chunks.len()
    }

    /// 清空确认记录
    pub fn reset(&mut self) {
        self.confirmed.clear();
    }
}
