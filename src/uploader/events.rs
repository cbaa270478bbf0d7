// 上传事件
//
// 生命周期回调统一成 UploadEvent，通过无界通道推送给所有订阅者

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::types::{FileId, UploadStatus};

/// 进度事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub file_id: FileId,
    pub task_id: String,
    /// 已上传字节数
    pub uploaded: u64,
    /// 文件大小
    pub size: u64,
    /// 百分比（保留两位小数）
    pub percentage: f64,
    /// 本次上传速度 (bytes/s)
    pub rate: u64,
    /// 速度文本，例如 "1.50 MB/s"
    pub rate_text: String,
    /// 预计剩余秒数
    pub left_time: Option<u64>,
    pub completed_chunks: usize,
    pub total_chunks: usize,
}

/// 上传事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 状态变更
    StatusChanged {
        file_id: FileId,
        task_id: String,
        old_status: UploadStatus,
        new_status: UploadStatus,
    },
    /// 进度更新
    Progress(ProgressEvent),
    /// 开始切片
    SliceStart { file_id: FileId, task_id: String },
    /// 切片完成
    SliceEnd {
        file_id: FileId,
        task_id: String,
        file_hash: String,
        total_chunks: usize,
    },
    /// 切片失败
    SliceError {
        file_id: FileId,
        task_id: String,
        error: String,
        is_cancel: bool,
    },
    /// 开始上传（check 之前）
    UploadStart { file_id: FileId, task_id: String },
    /// 上传失败
    UploadError {
        file_id: FileId,
        task_id: String,
        error: String,
        is_cancel: bool,
    },
    /// 上传成功
    Success {
        file_id: FileId,
        task_id: String,
        path: Option<String>,
    },
    /// 取消
    Cancel { file_id: FileId, task_id: String },
    /// 断网
    Offline,
    /// 恢复联网
    Online,
}

impl UploadEvent {
    /// 获取事件类型名称
    pub fn event_type_name(&self) -> &'static str {
        match self {
            UploadEvent::StatusChanged { .. } => "status_changed",
            UploadEvent::Progress(_) => "progress",
            UploadEvent::SliceStart { .. } => "slice_start",
            UploadEvent::SliceEnd { .. } => "slice_end",
            UploadEvent::SliceError { .. } => "slice_error",
            UploadEvent::UploadStart { .. } => "upload_start",
            UploadEvent::UploadError { .. } => "upload_error",
            UploadEvent::Success { .. } => "success",
            UploadEvent::Cancel { .. } => "cancel",
            UploadEvent::Offline => "offline",
            UploadEvent::Online => "online",
        }
    }
}

/// 事件总线
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<UploadEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 订阅事件流
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<UploadEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// 发布事件，顺便清理已关闭的订阅者
    pub fn emit(&self, event: UploadEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// 格式化速度
pub fn format_rate(bytes_per_sec: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes_per_sec >= GB {
        format!("{:.2} GB/s", bytes_per_sec as f64 / GB as f64)
    } else if bytes_per_sec >= MB {
        format!("{:.2} MB/s", bytes_per_sec as f64 / MB as f64)
    } else if bytes_per_sec >= KB {
        format!("{:.2} KB/s", bytes_per_sec as f64 / KB as f64)
    } else {
        format!("{} B/s", bytes_per_sec)
    }
}
