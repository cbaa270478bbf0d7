// 上传任务
//
// 每个文件一个任务，状态机：
// WAITING -> READING -> READY -> UPLOADING -> MERGING -> SUCCESS
// 以及 FAILED / CANCEL / PENDING（暂停）/ OFFLINE（断网）
//
// 上传阶段总是从 check 开始，重启任务不会重复上传服务端已有的分片

use futures::future::{try_join_all, BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::api::{parse_check, parse_merge, parse_upload, ApiResponse, ScheduledRequest, UploadApi};
use super::chunk::{UploadChunk, UploadChunkManager};
use super::error::UploadError;
use super::events::{format_rate, EventBus, ProgressEvent, UploadEvent};
use super::limiter::ConcurrencyLimiter;
use super::scheduler::RequestScheduler;
use super::slicer::Slicer;
use super::source::{ChunkPayload, FileSource};
use super::throttle::ProgressThrottler;
use super::types::{percentage, FileId, UploadFile, UploadStatus};
use super::transport::UploadTransport;
use crate::config::{AppConfig, UploadConfig, WorkerConfig};

/// 任务结果
pub type TaskResult = Result<UploadOutcome, UploadError>;

/// 任务完成 future，可以被多处等待
pub type Completion = Shared<BoxFuture<'static, TaskResult>>;

/// 上传成功的结果
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub file_id: FileId,
    pub file_hash: String,
    /// merge 接口返回的服务端路径
    pub path: Option<String>,
}

/// 停止原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// 取消，完成 future 以取消结束
    Cancel,
    /// 暂停，可恢复
    Pause,
    /// 断网，恢复联网后自动继续
    Offline,
}

/// 一次运行（start 到结束或 stop）
///
/// 调度器按 key 归属请求，重启后的新运行与旧运行互不影响
#[derive(Clone)]
struct RunScope {
    token: CancellationToken,
    /// 调度器中的归属 key：任务 id#第几次启动
    key: String,
}

impl RunScope {
    fn new(task_id: &str, generation: u32) -> Self {
        Self {
            token: CancellationToken::new(),
            key: format!("{}#{}", task_id, generation),
        }
    }
}

/// 任务共享的队列、调度器与配置
pub struct TaskContext {
    pub slice_queue: ConcurrencyLimiter,
    pub upload_queue: ConcurrencyLimiter,
    pub scheduler: RequestScheduler,
    pub api: UploadApi,
    pub events: EventBus,
    pub upload: UploadConfig,
    pub worker: WorkerConfig,
}

impl TaskContext {
    /// 按配置创建两个限流队列与请求调度器
    pub fn new(config: &AppConfig, transport: Arc<dyn UploadTransport>) -> Self {
        let upload = config.upload.normalized();
        let slice_parallel = config.worker.parallel.unwrap_or(upload.parallel).max(1);

        Self {
            slice_queue: ConcurrencyLimiter::new("slice", slice_parallel),
            upload_queue: ConcurrencyLimiter::new("upload", upload.parallel),
            scheduler: RequestScheduler::new(transport, upload.request_limit, upload.retry_backoff()),
            api: UploadApi::new(config.actions.clone(), &upload),
            events: EventBus::new(),
            worker: config.worker.clone(),
            upload,
        }
    }
}

struct CompletionSlot {
    sender: Option<oneshot::Sender<TaskResult>>,
    future: Completion,
}

impl CompletionSlot {
    fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        let future = rx
            .map(|res| res.unwrap_or_else(|_| Err(UploadError::cancelled("任务已释放"))))
            .boxed()
            .shared();
        Self {
            sender: Some(tx),
            future,
        }
    }
}

/// 上传任务
pub struct UploadTask {
    id: String,
    file: RwLock<UploadFile>,
    source: Arc<dyn FileSource>,
    ctx: Arc<TaskContext>,
    slicer: Slicer,
    chunks: Mutex<UploadChunkManager>,
    throttler: ProgressThrottler,
    running: AtomicBool,
    sliced: AtomicBool,
    /// 启动次数（首次之后的启动都算重试，排到队首）
    start_count: AtomicU32,
    /// 当前这次运行
    run: Mutex<RunScope>,
    completion: Mutex<CompletionSlot>,
}

impl UploadTask {
    pub fn new(source: Arc<dyn FileSource>, ctx: Arc<TaskContext>) -> Arc<Self> {
        let id = Uuid::new_v4().to_string();
        let file = UploadFile::new(
            source.name().to_string(),
            source.size(),
            ctx.upload.chunk_size,
            id.clone(),
        );
        let slicer = Slicer::new(file.id, source.clone(), file.chunk_size, ctx.worker.clone());

        info!(
            "创建上传任务: task={}, file={}, 名称={}, 大小={} bytes, 分片数={}",
            id, file.id, file.name, file.size, file.total
        );

        let run = RunScope::new(&id, 0);
        Arc::new(Self {
            chunks: Mutex::new(UploadChunkManager::new(file.size)),
            throttler: ProgressThrottler::new(ctx.upload.progress_interval()),
            file: RwLock::new(file),
            id,
            source,
            slicer,
            ctx,
            running: AtomicBool::new(false),
            sliced: AtomicBool::new(false),
            start_count: AtomicU32::new(0),
            run: Mutex::new(run),
            completion: Mutex::new(CompletionSlot::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn file_id(&self) -> FileId {
        self.file.read().id
    }

    /// 文件快照
    pub fn file(&self) -> UploadFile {
        self.file.read().clone()
    }

    pub fn status(&self) -> UploadStatus {
        self.file.read().status
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_sliced(&self) -> bool {
        self.sliced.load(Ordering::SeqCst)
    }

    pub fn start_count(&self) -> u32 {
        self.start_count.load(Ordering::SeqCst)
    }

    /// 已切好的分片
    pub fn chunks(&self) -> Vec<UploadChunk> {
        self.chunks.lock().chunks().to_vec()
    }

    /// 本次运行的完成 future（SUCCESS / FAILED / CANCEL 时落定）
    pub fn completion(&self) -> Completion {
        self.completion.lock().future.clone()
    }

    /// 启动任务，已在运行或已成功时返回 false
    pub fn start(self: &Arc<Self>) -> bool {
        if self.status() == UploadStatus::Success {
            return false;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }

        {
            let mut slot = self.completion.lock();
            if slot.sender.is_none() {
                *slot = CompletionSlot::new();
            }
        }

        let generation = self.start_count.fetch_add(1, Ordering::SeqCst) + 1;
        let restarted = generation > 1;
        let scope = RunScope::new(&self.id, generation);
        *self.run.lock() = scope.clone();
        self.throttler.reset();

        info!("🚀 启动上传任务: task={}, 第 {} 次启动", self.id, self.start_count());

        let task = self.clone();
        tokio::spawn(async move { task.run(scope, restarted).await });
        true
    }

    /// 停止任务：终止切片、取消该任务所有请求
    ///
    /// 对已成功的任务无效
    pub fn stop(&self, reason: StopReason) {
        let status = self.status();
        if status == UploadStatus::Success {
            return;
        }

        // 只取消当前这次运行，旧运行的清理不会波及之后的重启
        let scope = self.run.lock().clone();
        self.slicer.stop();
        scope.token.cancel();
        self.ctx.scheduler.cancel_upload(&scope.key);
        self.running.store(false, Ordering::SeqCst);

        info!("停止上传任务: task={}, 原因={:?}, 当前状态={:?}", self.id, reason, status);

        match reason {
            StopReason::Cancel => {
                self.set_status(UploadStatus::Cancel);
                self.emit(UploadEvent::Cancel {
                    file_id: self.file_id(),
                    task_id: self.id.clone(),
                });
                self.settle(Err(UploadError::cancelled("手动取消")));
            }
            StopReason::Pause => {
                if status.is_active() || status == UploadStatus::Offline {
                    self.set_status(UploadStatus::Pending);
                }
            }
            StopReason::Offline => {
                if status.is_active() {
                    self.set_status(UploadStatus::Offline);
                }
            }
        }
    }

    /// 加入队列时已断网，直接挂起
    pub(crate) fn park_offline(&self) {
        self.set_status(UploadStatus::Offline);
    }

    async fn run(self: Arc<Self>, scope: RunScope, restarted: bool) {
        if !self.is_sliced() {
            self.transition(&scope, UploadStatus::Reading);

            let work = {
                let task = self.clone();
                let scope = scope.clone();
                move || async move { task.slice(&scope).await }
            };
            let sliced = if restarted {
                self.ctx.slice_queue.submit_front(work).await
            } else {
                self.ctx.slice_queue.submit(work).await
            };

            if let Err(e) = sliced {
                self.fail(&scope, e, false);
                return;
            }
        }

        if scope.token.is_cancelled() {
            return;
        }
        self.transition(&scope, UploadStatus::Ready);

        let work = {
            let task = self.clone();
            let scope = scope.clone();
            move || async move { task.upload_phase(&scope).await }
        };
        let uploaded = if restarted {
            self.ctx.upload_queue.submit_front(work).await
        } else {
            self.ctx.upload_queue.submit(work).await
        };

        match uploaded {
            Ok(outcome) => self.succeed(&scope, outcome),
            Err(e) => self.fail(&scope, e, true),
        }
    }

    /// 切片（在切片队列中执行）
    async fn slice(&self, scope: &RunScope) -> Result<(), UploadError> {
        if scope.token.is_cancelled() {
            return Err(UploadError::cancelled("切片前任务已停止"));
        }

        let file_id = self.file_id();
        self.emit(UploadEvent::SliceStart {
            file_id,
            task_id: self.id.clone(),
        });

        let result = tokio::select! {
            _ = scope.token.cancelled() => Err(UploadError::cancelled("切片已停止")),
            res = self.slicer.start() => res,
        };
        let result = match result {
            Ok(_) if scope.token.is_cancelled() => Err(UploadError::cancelled("切片已停止")),
            other => other,
        };

        match result {
            Ok(output) => {
                let total = output.chunks.len();
                self.chunks.lock().set_chunks(output.chunks);
                self.file.write().hash = Some(output.file_hash.clone());
                self.sliced.store(true, Ordering::SeqCst);

                self.emit(UploadEvent::SliceEnd {
                    file_id,
                    task_id: self.id.clone(),
                    file_hash: output.file_hash,
                    total_chunks: total,
                });
                Ok(())
            }
            Err(e) => {
                self.emit(UploadEvent::SliceError {
                    file_id,
                    task_id: self.id.clone(),
                    error: e.to_string(),
                    is_cancel: e.is_cancel(),
                });
                Err(e)
            }
        }
    }

    /// 上传阶段（在上传队列中执行）：check -> 补传 -> check -> merge
    async fn upload_phase(&self, scope: &RunScope) -> TaskResult {
        if scope.token.is_cancelled() {
            return Err(UploadError::cancelled("上传前任务已停止"));
        }

        let file = self.file();
        self.emit(UploadEvent::UploadStart {
            file_id: file.id,
            task_id: self.id.clone(),
        });

        let hash = match (&file.hash, self.is_sliced()) {
            (Some(hash), true) => hash.clone(),
            _ => return Err(UploadError::NotSliced),
        };
        let chunks = self.chunks();

        let check = self
            .request(scope, self.ctx.api.check(&file, &hash, &chunks))
            .await?;
        let outcome = parse_check(&check, &chunks)?;

        if !outcome.success {
            info!(
                "秒传检查: task={}, 已有分片 {} 个，需要上传 {} 个",
                self.id,
                outcome.uploaded.len(),
                outcome.residual.len()
            );
            self.chunks
                .lock()
                .replace_confirmed(outcome.uploaded.iter().map(|c| c.index));
            self.refresh_uploaded();

            self.transition(scope, UploadStatus::Uploading);
            self.upload_chunks(scope, &file, &hash, outcome.residual)
                .await?;

            let check_again = self
                .request(scope, self.ctx.api.check(&file, &hash, &chunks))
                .await?;
            let again = parse_check(&check_again, &chunks)?;
            if !again.success {
                return Err(UploadError::Protocol(format!(
                    "分片上传完成后服务端仍缺少 {} 个分片",
                    again.residual.len()
                )));
            }
        } else {
            info!("✓ 服务端已有完整文件: task={}, hash={}", self.id, hash);
        }

        self.chunks
            .lock()
            .replace_confirmed(chunks.iter().map(|c| c.index));
        self.refresh_uploaded();

        self.transition(scope, UploadStatus::Merging);
        let merge = self
            .request(scope, self.ctx.api.merge(&file, &hash))
            .await?;
        let path = parse_merge(&merge)?;

        Ok(UploadOutcome {
            file_id: file.id,
            file_hash: hash,
            path,
        })
    }

    /// 并发上传剩余分片，任一分片最终失败则取消其余请求
    async fn upload_chunks(
        &self,
        scope: &RunScope,
        file: &UploadFile,
        hash: &str,
        residual: Vec<UploadChunk>,
    ) -> Result<(), UploadError> {
        let started = Instant::now();
        let session_bytes = AtomicU64::new(0);

        let uploads = residual.into_iter().map(|chunk| {
            let payload = ChunkPayload::new(self.source.clone(), chunk.range.clone());
            let scheduled = self.ctx.api.upload(file, hash, &chunk, payload);
            let session_bytes = &session_bytes;
            async move {
                let response = self.request(scope, scheduled).await?;
                parse_upload(&response)?;
                debug!("分片上传成功: task={}, 分片 #{}", self.id, chunk.index);
                self.on_chunk_uploaded(&chunk, started, session_bytes);
                Ok::<(), UploadError>(())
            }
        });

        if let Err(e) = try_join_all(uploads).await {
            self.ctx.scheduler.cancel_upload(&scope.key);
            return Err(e);
        }
        Ok(())
    }

    /// 通过调度器发送请求，与任务令牌竞速
    async fn request(
        &self,
        scope: &RunScope,
        scheduled: ScheduledRequest,
    ) -> Result<ApiResponse, UploadError> {
        if scope.token.is_cancelled() {
            return Err(UploadError::cancelled("任务已停止"));
        }

        let pending = self.ctx.scheduler.submit(&scope.key, scheduled);
        tokio::select! {
            _ = scope.token.cancelled() => {
                // 停止后才入队的请求也要清掉
                self.ctx.scheduler.cancel_upload(&scope.key);
                Err(UploadError::cancelled("任务已停止"))
            }
            res = pending => res,
        }
    }

    fn on_chunk_uploaded(&self, chunk: &UploadChunk, started: Instant, session_bytes: &AtomicU64) {
        let (uploaded, completed, total) = {
            let mut manager = self.chunks.lock();
            manager.confirm(chunk.index);
            (
                manager.uploaded_bytes(),
                manager.completed_count(),
                manager.chunk_count(),
            )
        };
        let session = session_bytes.fetch_add(chunk.size(), Ordering::SeqCst) + chunk.size();

        let (file_id, size, pct) = {
            let mut file = self.file.write();
            file.set_uploaded(uploaded);
            (file.id, file.size, file.percentage)
        };

        let last = completed == total;
        if last {
            self.throttler.force_emit();
        } else if !self.throttler.should_emit() {
            return;
        }

        let elapsed = started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            (session as f64 / elapsed) as u64
        } else {
            0
        };
        let left = size.saturating_sub(uploaded);
        let left_time = if rate > 0 && left > 0 {
            Some(left / rate)
        } else if left == 0 {
            Some(0)
        } else {
            None
        };

        self.emit(UploadEvent::Progress(ProgressEvent {
            file_id,
            task_id: self.id.clone(),
            uploaded,
            size,
            percentage: pct,
            rate,
            rate_text: format_rate(rate),
            left_time,
            completed_chunks: completed,
            total_chunks: total,
        }));
    }

    fn refresh_uploaded(&self) {
        let uploaded = self.chunks.lock().uploaded_bytes();
        self.file.write().set_uploaded(uploaded);
    }

    fn succeed(&self, scope: &RunScope, outcome: UploadOutcome) {
        if scope.token.is_cancelled() {
            return;
        }

        {
            let mut file = self.file.write();
            file.uploaded = file.size;
            file.percentage = percentage(file.size, file.size);
            file.path = outcome.path.clone();
            file.error = None;
            file.completed_at = Some(chrono::Utc::now().timestamp());
        }
        self.set_status(UploadStatus::Success);
        self.running.store(false, Ordering::SeqCst);
        self.ctx.scheduler.release(&scope.key);

        info!(
            "✓ 上传完成: task={}, hash={}, path={:?}",
            self.id, outcome.file_hash, outcome.path
        );
        self.emit(UploadEvent::Success {
            file_id: outcome.file_id,
            task_id: self.id.clone(),
            path: outcome.path.clone(),
        });
        self.settle(Ok(outcome));
    }

    fn fail(&self, scope: &RunScope, err: UploadError, upload_phase: bool) {
        // 已被 stop 处理
        if scope.token.is_cancelled() {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        self.ctx.scheduler.release(&scope.key);

        if err.is_cancel() {
            warn!("上传任务被取消: task={}, {}", self.id, err);
            self.set_status(UploadStatus::Cancel);
        } else {
            error!("上传任务失败: task={}, 错误: {}", self.id, err);
            self.file.write().error = Some(err.to_string());
            self.set_status(UploadStatus::Failed);
        }

        if upload_phase {
            self.emit(UploadEvent::UploadError {
                file_id: self.file_id(),
                task_id: self.id.clone(),
                error: err.to_string(),
                is_cancel: err.is_cancel(),
            });
        }
        self.settle(Err(err));
    }

    fn settle(&self, result: TaskResult) {
        if let Some(tx) = self.completion.lock().sender.take() {
            let _ = tx.send(result);
        }
    }

    /// 令牌未取消时才切换状态
    fn transition(&self, scope: &RunScope, status: UploadStatus) -> bool {
        if scope.token.is_cancelled() {
            return false;
        }
        self.set_status(status)
    }

    /// 切换状态并发布事件，SUCCESS 之后不再变化
    fn set_status(&self, status: UploadStatus) -> bool {
        let (file_id, old) = {
            let mut file = self.file.write();
            if file.status == status || file.status == UploadStatus::Success {
                return false;
            }
            let old = file.status;
            file.status = status;
            (file.id, old)
        };

        debug!("状态变更: task={}, {:?} -> {:?}", self.id, old, status);
        self.emit(UploadEvent::StatusChanged {
            file_id,
            task_id: self.id.clone(),
            old_status: old,
            new_status: status,
        });
        true
    }

    fn emit(&self, event: UploadEvent) {
        self.ctx.events.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::api::Endpoint;
    use crate::uploader::source::MemorySource;
    use crate::uploader::test_support::{test_context, MemoryServer};
    use std::time::Duration;

    const KB: usize = 1024;

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 253) as u8).collect()
    }

    fn task_with(server: &Arc<MemoryServer>, len: usize) -> Arc<UploadTask> {
        let ctx = test_context(server.clone(), KB as u64);
        UploadTask::new(Arc::new(MemorySource::new("a.bin", data(len))), ctx)
    }

    #[tokio::test]
    async fn test_full_upload() {
        let server = MemoryServer::new();
        let task = task_with(&server, 5 * KB + 10);

        assert!(task.start());
        assert!(!task.start());

        let outcome = task.completion().await.unwrap();
        assert_eq!(task.status(), UploadStatus::Success);
        assert_eq!(outcome.path.as_deref(), Some("/files/a.bin"));
        assert_eq!(server.count(Endpoint::Upload), 6);
        assert_eq!(server.count(Endpoint::Check), 2);
        assert_eq!(server.count(Endpoint::Merge), 1);
        assert_eq!(server.merged_file(&outcome.file_hash), Some(data(5 * KB + 10)));

        let file = task.file();
        assert_eq!(file.uploaded, file.size);
        assert_eq!(file.percentage, 100.0);
        assert!(!task.is_running());
        // 成功后不能再启动
        assert!(!task.start());
    }

    #[tokio::test]
    async fn test_scheduler_state_released_after_finish() {
        let server = MemoryServer::new();
        let task = task_with(&server, 3 * KB);
        assert!(task.start());
        task.completion().await.unwrap();
        assert_eq!(task.ctx.scheduler.tracked_tasks(), 0);

        let failing = MemoryServer::new();
        failing.fail_always(Endpoint::Merge);
        let task = task_with(&failing, 3 * KB);
        assert!(task.start());
        assert!(task.completion().await.is_err());
        assert_eq!(task.ctx.scheduler.tracked_tasks(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pause_resume_loop_always_completes() {
        for round in 0..30 {
            let server = MemoryServer::new();
            server.set_delay(Endpoint::Upload, Duration::from_millis(10));
            let task = task_with(&server, 4 * KB);

            assert!(task.start());
            tokio::time::timeout(Duration::from_secs(5), async {
                while task.status() != UploadStatus::Uploading {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
            .await
            .unwrap();

            task.stop(StopReason::Pause);
            assert!(task.start(), "round {}", round);

            let result = tokio::time::timeout(Duration::from_secs(10), task.completion())
                .await
                .unwrap();
            assert!(result.is_ok(), "round {}: {:?}", round, result.as_ref().err());
            assert_eq!(task.status(), UploadStatus::Success);
            assert_eq!(
                server.merged_file(&result.unwrap().file_hash),
                Some(data(4 * KB))
            );
        }
    }

    #[tokio::test]
    async fn test_resume_skips_stored_chunks() {
        let server = MemoryServer::new();
        let task = task_with(&server, 10 * KB);
        // 先切片拿到 hash，再预置分片 2、5、7
        let out = task.slicer.start().await.unwrap();
        for index in [2, 5, 7] {
            server.seed(&out.file_hash, &out.chunks[index], &data(10 * KB));
        }

        assert!(task.start());
        task.completion().await.unwrap();

        assert_eq!(server.count(Endpoint::Upload), 7);
        assert_eq!(server.count(Endpoint::Check), 2);
        assert_eq!(server.count(Endpoint::Merge), 1);
        let mut uploaded = server.uploaded_indices();
        uploaded.sort_unstable();
        assert_eq!(uploaded, vec![0, 1, 3, 4, 6, 8, 9]);
    }

    #[tokio::test]
    async fn test_complete_file_goes_straight_to_merge() {
        let server = MemoryServer::new();
        let task = task_with(&server, 3 * KB);
        let out = task.slicer.start().await.unwrap();
        for chunk in &out.chunks {
            server.seed(&out.file_hash, chunk, &data(3 * KB));
        }

        assert!(task.start());
        task.completion().await.unwrap();
        assert_eq!(server.count(Endpoint::Upload), 0);
        assert_eq!(server.count(Endpoint::Check), 1);
        assert_eq!(server.count(Endpoint::Merge), 1);
    }

    #[tokio::test]
    async fn test_stop_while_uploading() {
        let server = MemoryServer::new();
        server.set_delay(Endpoint::Upload, Duration::from_millis(100));
        let task = task_with(&server, 20 * KB);
        let mut events = task.ctx.events.subscribe();

        assert!(task.start());
        let completion = task.completion();

        // 等待进入 UPLOADING
        tokio::time::timeout(Duration::from_secs(5), async {
            while task.status() != UploadStatus::Uploading {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        task.stop(StopReason::Cancel);
        let err = completion.clone().await.unwrap_err();
        assert!(err.is_cancel());
        assert_eq!(task.status(), UploadStatus::Cancel);

        let uploads_at_stop = server.count(Endpoint::Upload);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(server.count(Endpoint::Upload), uploads_at_stop);
        assert_eq!(server.count(Endpoint::Merge), 0);

        // 完成 future 只落定一次
        assert!(completion.await.unwrap_err().is_cancel());
        let mut cancels = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, UploadEvent::Cancel { .. }) {
                cancels += 1;
            }
        }
        assert_eq!(cancels, 1);
    }

    #[tokio::test]
    async fn test_protocol_inconsistency_fails() {
        let server = MemoryServer::new();
        server.set_drop_uploads(true);
        let task = task_with(&server, 4 * KB);

        assert!(task.start());
        let err = task.completion().await.unwrap_err();
        assert!(matches!(err, UploadError::Protocol(_)));
        assert_eq!(task.status(), UploadStatus::Failed);
        assert_eq!(server.count(Endpoint::Merge), 0);
        assert!(task.file().error.is_some());
    }

    #[tokio::test]
    async fn test_retries_exhausted_fails() {
        let server = MemoryServer::new();
        server.fail_always(Endpoint::Upload);
        let task = task_with(&server, 2 * KB);

        assert!(task.start());
        let err = task.completion().await.unwrap_err();
        assert!(!err.is_cancel());
        assert_eq!(task.status(), UploadStatus::Failed);
        assert_eq!(server.count(Endpoint::Merge), 0);
    }

    #[tokio::test]
    async fn test_pause_then_resume_reuses_slices() {
        let server = MemoryServer::new();
        server.set_delay(Endpoint::Upload, Duration::from_millis(50));
        let task = task_with(&server, 12 * KB);

        assert!(task.start());
        let completion = task.completion();
        tokio::time::timeout(Duration::from_secs(5), async {
            while task.status() != UploadStatus::Uploading {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        task.stop(StopReason::Pause);
        assert_eq!(task.status(), UploadStatus::Pending);
        assert!(task.is_sliced());

        assert!(task.start());
        let outcome = completion.await.unwrap();
        assert_eq!(task.status(), UploadStatus::Success);
        assert_eq!(task.start_count(), 2);
        assert_eq!(server.merged_file(&outcome.file_hash), Some(data(12 * KB)));
    }
}
