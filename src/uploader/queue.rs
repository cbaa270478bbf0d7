// 上传队列
//
// 负责管理多个上传任务：
// - 文件登记与移除（成功的任务自动移出队列）
// - 切片队列、上传队列与请求调度器的所有权
// - 暂停/恢复/取消
// - 断网时挂起执行中的任务，恢复联网后自动继续

use anyhow::{Context, Result};
use dashmap::DashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::events::UploadEvent;
use super::source::{FileSource, PathSource};
use super::task::{Completion, StopReason, TaskContext, UploadTask};
use super::transport::{HttpTransport, UploadTransport};
use super::types::{FileId, UploadFile, UploadStatus};
use crate::config::AppConfig;

/// add 的返回值
pub struct UploadHandle {
    pub task: Arc<UploadTask>,
    /// 加入时的文件快照
    pub file: UploadFile,
    pub completion: Completion,
}

struct QueueInner {
    ctx: Arc<TaskContext>,
    /// 所有任务（file_id -> task）
    files: Arc<DashMap<FileId, Arc<UploadTask>>>,
    online: AtomicBool,
    /// 清理成功任务的后台任务
    reaper: JoinHandle<()>,
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        self.reaper.abort();
    }
}

/// 上传队列
#[derive(Clone)]
pub struct UploadQueue {
    inner: Arc<QueueInner>,
}

impl UploadQueue {
    /// 创建上传队列（需要在 tokio 运行时内调用）
    pub fn new(config: &AppConfig, transport: Arc<dyn UploadTransport>) -> Self {
        let ctx = Arc::new(TaskContext::new(config, transport));
        let files: Arc<DashMap<FileId, Arc<UploadTask>>> = Arc::new(DashMap::new());

        let reaper = {
            let mut events = ctx.events.subscribe();
            let files = files.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    if let UploadEvent::Success { file_id, .. } = event {
                        files.remove(&file_id);
                    }
                }
            })
        };

        info!(
            "创建上传队列: 分片大小={} bytes, 接口并发={}, 文件并发={}",
            ctx.upload.chunk_size,
            ctx.scheduler.request_limit(),
            ctx.upload_queue.parallelism()
        );

        Self {
            inner: Arc::new(QueueInner {
                ctx,
                files,
                online: AtomicBool::new(true),
                reaper,
            }),
        }
    }

    /// 使用 HTTP 传输创建上传队列
    pub fn with_http(config: &AppConfig) -> Result<Self> {
        let transport =
            HttpTransport::new(&config.upload.normalized()).context("初始化 HTTP 传输失败")?;
        Ok(Self::new(config, Arc::new(transport)))
    }

    /// 添加文件并启动上传
    pub fn add(&self, source: Arc<dyn FileSource>) -> UploadHandle {
        let task = UploadTask::new(source, self.inner.ctx.clone());
        self.inner.files.insert(task.file_id(), task.clone());

        if self.is_online() {
            task.start();
        } else {
            info!("当前离线，任务挂起: task={}", task.id());
            task.park_offline();
        }

        UploadHandle {
            file: task.file(),
            completion: task.completion(),
            task,
        }
    }

    /// 添加本地文件
    pub async fn add_path(&self, path: impl AsRef<Path>) -> Result<UploadHandle> {
        let path = path.as_ref().to_path_buf();
        let display = path.display().to_string();
        let source = tokio::task::spawn_blocking(move || PathSource::open(&path))
            .await
            .context("打开文件任务异常")?
            .with_context(|| format!("打开上传文件失败: {}", display))?;
        Ok(self.add(Arc::new(source)))
    }

    pub fn get(&self, id: FileId) -> Option<Arc<UploadTask>> {
        self.inner.files.get(&id).map(|entry| entry.value().clone())
    }

    fn require(&self, id: FileId) -> Result<Arc<UploadTask>> {
        self.get(id)
            .with_context(|| format!("上传任务不存在: file={}", id))
    }

    /// 所有文件快照（按 id 排序）
    pub fn files(&self) -> Vec<UploadFile> {
        let mut files: Vec<UploadFile> = self
            .inner
            .files
            .iter()
            .map(|entry| entry.value().file())
            .collect();
        files.sort_by_key(|f| f.id);
        files
    }

    /// 取消任务并移出队列
    pub fn remove(&self, id: FileId) -> Result<()> {
        let (_, task) = self
            .inner
            .files
            .remove(&id)
            .with_context(|| format!("上传任务不存在: file={}", id))?;
        task.stop(StopReason::Cancel);
        info!("移除上传任务: task={}, file={}", task.id(), id);
        Ok(())
    }

    /// 暂停任务
    pub fn pause(&self, id: FileId) -> Result<()> {
        self.require(id)?.stop(StopReason::Pause);
        Ok(())
    }

    /// 恢复暂停、失败或已取消的任务，返回是否重新启动
    pub fn resume(&self, id: FileId) -> Result<bool> {
        let task = self.require(id)?;
        match task.status() {
            UploadStatus::Pending | UploadStatus::Failed | UploadStatus::Cancel => {
                if self.is_online() {
                    Ok(task.start())
                } else {
                    task.park_offline();
                    Ok(false)
                }
            }
            status => {
                warn!("任务状态为 {:?}，无需恢复: task={}", status, task.id());
                Ok(false)
            }
        }
    }

    /// 取消任务（保留在队列中，可通过 resume 重试）
    pub fn cancel(&self, id: FileId) -> Result<()> {
        self.require(id)?.stop(StopReason::Cancel);
        Ok(())
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// 断网：暂停调度，执行中的任务转为 OFFLINE
    pub fn on_offline(&self) {
        if !self.inner.online.swap(false, Ordering::SeqCst) {
            return;
        }
        warn!("⚠ 网络断开，挂起执行中的上传任务");

        self.inner.ctx.scheduler.pause();
        self.inner.ctx.events.emit(UploadEvent::Offline);
        for entry in self.inner.files.iter() {
            let task = entry.value();
            if task.status().is_active() {
                task.stop(StopReason::Offline);
            }
        }
    }

    /// 恢复联网：恢复调度，重新启动所有 OFFLINE 任务
    pub fn on_online(&self) {
        if self.inner.online.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("✓ 网络恢复，继续上传");

        self.inner.ctx.scheduler.resume();
        self.inner.ctx.events.emit(UploadEvent::Online);
        let offline: Vec<Arc<UploadTask>> = self
            .inner
            .files
            .iter()
            .filter(|entry| entry.value().status() == UploadStatus::Offline)
            .map(|entry| entry.value().clone())
            .collect();
        for task in offline {
            task.start();
        }
    }

    /// 监听联网状态（true 为在线）
    pub fn watch_connectivity(&self, mut online: watch::Receiver<bool>) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            loop {
                if *online.borrow_and_update() {
                    queue.on_online();
                } else {
                    queue.on_offline();
                }
                if online.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    /// 订阅上传事件
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<UploadEvent> {
        self.inner.ctx.events.subscribe()
    }
}
