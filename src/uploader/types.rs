// 上传文件与状态定义

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use super::chunk::total_chunks;

/// 文件 ID（进程内唯一）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub u64);

static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(1);

impl FileId {
    pub fn next() -> Self {
        FileId(NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 上传状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// 等待中
    Waiting,
    /// 切片读取中
    Reading,
    /// 切片完成，等待上传
    Ready,
    /// 上传中
    Uploading,
    /// 合并中
    Merging,
    /// 上传成功（终态）
    Success,
    /// 失败
    Failed,
    /// 已取消
    Cancel,
    /// 已暂停，可恢复
    Pending,
    /// 断网，恢复联网后自动继续
    Offline,
}

impl UploadStatus {
    /// 是否为结束状态（完成 future 在这些状态落定）
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            UploadStatus::Success | UploadStatus::Failed | UploadStatus::Cancel
        )
    }

    /// 是否还在执行中
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            UploadStatus::Waiting
                | UploadStatus::Reading
                | UploadStatus::Ready
                | UploadStatus::Uploading
                | UploadStatus::Merging
        )
    }
}

/// 上传文件快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadFile {
    /// 文件ID
    pub id: FileId,
    /// 文件名
    pub name: String,
    /// 文件大小
    pub size: u64,
    /// 分片大小
    pub chunk_size: u64,
    /// 总分片数
    pub total: usize,
    /// 文件 hash（切片完成后才有）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// 已上传字节数
    pub uploaded: u64,
    /// 进度百分比（保留两位小数）
    pub percentage: f64,
    /// 状态
    pub status: UploadStatus,
    /// 所属任务ID
    pub task_id: String,
    /// 合并后服务端返回的路径
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// 错误信息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 完成时间 (Unix timestamp)
    pub completed_at: Option<i64>,
}

impl UploadFile {
    pub fn new(name: String, size: u64, chunk_size: u64, task_id: String) -> Self {
        Self {
            id: FileId::next(),
            name,
            size,
            chunk_size,
            total: total_chunks(size, chunk_size),
            hash: None,
            uploaded: 0,
            percentage: 0.0,
            status: UploadStatus::Waiting,
            task_id,
            path: None,
            error: None,
            created_at: chrono::Utc::now().timestamp(),
            completed_at: None,
        }
    }

    /// 更新已上传字节数与百分比
    pub fn set_uploaded(&mut self, uploaded: u64) {
        self.uploaded = uploaded.min(self.size);
        self.percentage = percentage(self.uploaded, self.size);
    }
}

/// 百分比，保留两位小数
pub fn percentage(uploaded: u64, size: u64) -> f64 {
    if size == 0 {
        return 100.0;
    }
    let value = uploaded as f64 / size as f64 * 100.0;
    (value * 100.0).round() / 100.0
}
