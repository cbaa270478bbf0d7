// 上传文件数据源
//
// 切片阶段和上传阶段都按字节范围读取文件，分片数据在发送时才读入内存，发送完即释放

use bytes::Bytes;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::error::UploadError;

/// 可按字节范围读取的文件
///
/// `read_range` 是阻塞调用，只在 `spawn_blocking` 或切片 worker 线程里调用
pub trait FileSource: Send + Sync + fmt::Debug {
    /// 文件名
    fn name(&self) -> &str;

    /// 文件大小
    fn size(&self) -> u64;

    /// 读取 `range` 范围内的字节
    fn read_range(&self, range: Range<u64>) -> io::Result<Bytes>;
}

/// 本地磁盘文件
#[derive(Debug, Clone)]
pub struct PathSource {
    path: PathBuf,
    name: String,
    size: u64,
}

impl PathSource {
    /// 打开本地文件，读取元信息
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = std::fs::metadata(&path)?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("不是普通文件: {:?}", path),
            ));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        Ok(Self {
            name,
            size: metadata.len(),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FileSource for PathSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn read_range(&self, range: Range<u64>) -> io::Result<Bytes> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(range.start))?;

        let mut buffer = vec![0u8; (range.end - range.start) as usize];
        file.read_exact(&mut buffer)?;

        Ok(Bytes::from(buffer))
    }
}

/// 内存数据（测试以及调用方已持有数据时使用）
#[derive(Clone)]
pub struct MemorySource {
    name: String,
    data: Bytes,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

impl fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySource")
            .field("name", &self.name)
            .field("size", &self.data.len())
            .finish()
    }
}

impl FileSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_range(&self, range: Range<u64>) -> io::Result<Bytes> {
        if range.end > self.data.len() as u64 || range.start > range.end {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("读取越界: {:?}, 大小 {}", range, self.data.len()),
            ));
        }
        Ok(self.data.slice(range.start as usize..range.end as usize))
    }
}

/// 分片负载：只保存数据源与范围，发送前才读取
#[derive(Clone)]
pub struct ChunkPayload {
    source: Arc<dyn FileSource>,
    range: Range<u64>,
}

impl ChunkPayload {
    pub fn new(source: Arc<dyn FileSource>, range: Range<u64>) -> Self {
        Self { source, range }
    }

    pub fn len(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 在阻塞线程中读取分片数据
    pub async fn load(&self) -> Result<Bytes, UploadError> {
        let source = self.source.clone();
        let range = self.range.clone();
        let bytes = tokio::task::spawn_blocking(move || source.read_range(range))
            .await
            .map_err(|e| UploadError::Io(format!("读取分片任务异常: {}", e)))??;

        debug!(
            "读取分片数据: {} bytes={}-{}",
            self.source.name(),
            self.range.start,
            self.range.end
        );
        Ok(bytes)
    }
}

impl fmt::Debug for ChunkPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkPayload")
            .field("source", &self.source.name())
            .field("range", &self.range)
            .finish()
    }
}
