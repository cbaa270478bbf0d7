// 接口请求调度器
//
// 功能：
// - 按上传任务分组排队，Round-Robin 轮流发起各任务的请求
// - 全局并发控制（同时在途的请求数不超过 request_limit）
// - 达到上限后打开节流开关，200ms 后自动关闭再继续调度
// - 失败重试（插到本任务队首，指数退避）
// - 接口失败台账：同一接口连续失败 6 次后直接拒绝，成功一次清零
// - 按任务取消：清空排队请求并中断在途请求，不影响其他任务

use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::api::{ApiRequest, ApiResponse, ScheduledRequest};
use super::error::UploadError;
use super::transport::UploadTransport;
use crate::config::MAX_REQUEST_LIMIT;

/// 同一接口连续失败次数上限
pub const FAILURE_CEILING: u32 = 6;

/// 节流冷却时间
const THROTTLE_COOLDOWN: Duration = Duration::from_millis(200);

/// 最大退避延迟（毫秒）
const MAX_BACKOFF_MS: u64 = 5000;

/// 计算指数退避延迟
///
/// 第 n 次重试等待 base * 2^(n-1)，上限 5s；base 为 0 时立即重试
pub fn calculate_backoff_delay(retry_count: u32, base: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    if base_ms == 0 {
        return Duration::ZERO;
    }
    let exp = retry_count.saturating_sub(1).min(16);
    let delay = base_ms.saturating_mul(2u64.pow(exp)).min(MAX_BACKOFF_MS);
    Duration::from_millis(delay)
}

type Responder = oneshot::Sender<Result<ApiResponse, UploadError>>;

/// 排队中的请求
struct Entry {
    task_id: String,
    request: ApiRequest,
    cancel: CancellationToken,
    /// 已重试次数
    attempt: u32,
    max_retries: u32,
    responder: Responder,
}

impl Entry {
    fn respond(self, result: Result<ApiResponse, UploadError>) {
        let _ = self.responder.send(result);
    }
}

#[derive(Default)]
struct SchedulerState {
    /// 每个任务的请求队列
    queues: HashMap<String, VecDeque<Entry>>,
    /// 有排队请求的任务（轮转顺序）
    order: Vec<String>,
    /// 轮转游标
    cursor: usize,
    /// 在途请求数
    running: usize,
    /// 节流开关
    throttled: bool,
    /// 整体暂停（断网）
    paused: bool,
    /// 接口 -> 连续失败次数
    failures: HashMap<String, u32>,
    /// 任务级取消令牌
    task_tokens: HashMap<String, CancellationToken>,
}

impl SchedulerState {
    /// 轮转取出下一个请求
    ///
    /// 队列为空的任务直接移出轮转，游标不前进
    fn next_entry(&mut self) -> Option<Entry> {
        while !self.order.is_empty() {
            if self.cursor >= self.order.len() {
                self.cursor = 0;
            }
            let task_id = &self.order[self.cursor];
            match self.queues.get_mut(task_id).and_then(|q| q.pop_front()) {
                Some(entry) => {
                    self.cursor = (self.cursor + 1) % self.order.len();
                    return Some(entry);
                }
                None => {
                    let task_id = self.order.remove(self.cursor);
                    self.queues.remove(&task_id);
                }
            }
        }
        self.cursor = 0;
        None
    }

    fn enqueue(&mut self, entry: Entry, front: bool) {
        if !self.order.iter().any(|id| id == &entry.task_id) {
            self.order.push(entry.task_id.clone());
        }
        let queue = self.queues.entry(entry.task_id.clone()).or_default();
        if front {
            queue.push_front(entry);
        } else {
            queue.push_back(entry);
        }
    }

    fn remove_task(&mut self, task_id: &str) -> Vec<Entry> {
        if let Some(pos) = self.order.iter().position(|id| id == task_id) {
            self.order.remove(pos);
            if pos < self.cursor {
                self.cursor -= 1;
            }
            if self.cursor >= self.order.len() {
                self.cursor = 0;
            }
        }
        self.queues
            .remove(task_id)
            .map(|q| q.into_iter().collect())
            .unwrap_or_default()
    }
}

struct SchedulerInner {
    transport: Arc<dyn UploadTransport>,
    state: Mutex<SchedulerState>,
    request_limit: usize,
    retry_backoff: Duration,
}

/// 接口请求调度器
#[derive(Clone)]
pub struct RequestScheduler {
    inner: Arc<SchedulerInner>,
}

/// 取出请求后的处理方式
enum Dispatch {
    Send(Entry),
    Reject(Entry, UploadError),
}

impl RequestScheduler {
    /// 创建调度器，request_limit 收敛到 1-6
    pub fn new(transport: Arc<dyn UploadTransport>, request_limit: usize, retry_backoff: Duration) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                transport,
                state: Mutex::new(SchedulerState::default()),
                request_limit: request_limit.clamp(1, MAX_REQUEST_LIMIT),
                retry_backoff,
            }),
        }
    }

    pub fn request_limit(&self) -> usize {
        self.inner.request_limit
    }

    /// 提交请求，返回响应 future
    pub fn submit(&self, task_id: &str, scheduled: ScheduledRequest) -> impl Future<Output = Result<ApiResponse, UploadError>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            let task_token = state
                .task_tokens
                .entry(task_id.to_string())
                .or_default()
                .clone();
            let entry = Entry {
                task_id: task_id.to_string(),
                request: scheduled.request,
                cancel: task_token.child_token(),
                attempt: 0,
                max_retries: scheduled.retries,
                responder: tx,
            };
            state.enqueue(entry, false);
        }
        self.pump();

        async move {
            rx.await
                .unwrap_or_else(|_| Err(UploadError::cancelled("请求已被丢弃")))
        }
    }

    /// 在条件允许时发起排队中的请求
    fn pump(&self) {
        loop {
            let dispatch = {
                let mut state = self.inner.state.lock();
                if state.paused || state.throttled || state.running >= self.inner.request_limit {
                    return;
                }
                let Some(entry) = state.next_entry() else {
                    return;
                };

                if entry.cancel.is_cancelled() {
                    Dispatch::Reject(entry, UploadError::cancelled("请求已取消"))
                } else {
                    let failures = state
                        .failures
                        .get(&entry.request.url)
                        .copied()
                        .unwrap_or(0);
                    if failures >= FAILURE_CEILING {
                        let err = UploadError::CircuitOpen {
                            endpoint: entry.request.url.clone(),
                            failures,
                        };
                        Dispatch::Reject(entry, err)
                    } else {
                        self.record_dispatch(&mut state);
                        Dispatch::Send(entry)
                    }
                }
            };

            match dispatch {
                Dispatch::Send(entry) => {
                    let scheduler = self.clone();
                    tokio::spawn(async move { scheduler.execute(entry).await });
                }
                Dispatch::Reject(entry, err) => {
                    debug!("请求未发送: task={}, url={}, {}", entry.task_id, entry.request.url, err);
                    entry.respond(Err(err));
                }
            }
        }
    }

    /// 请求发出：在途数 +1，达到上限时打开节流开关
    fn record_dispatch(&self, state: &mut SchedulerState) {
        state.running += 1;
        if state.running >= self.inner.request_limit && !state.throttled {
            state.throttled = true;
            let scheduler = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(THROTTLE_COOLDOWN).await;
                scheduler.inner.state.lock().throttled = false;
                scheduler.pump();
            });
        }
    }

    /// 请求结束：在途数 -1，尝试调度下一个
    fn record_settlement(&self) {
        {
            let mut state = self.inner.state.lock();
            state.running = state.running.saturating_sub(1);
        }
        self.pump();
    }

    async fn execute(&self, mut entry: Entry) {
        let url = entry.request.url.clone();
        debug!(
            "发起请求: task={}, {} {}, 第 {} 次",
            entry.task_id,
            entry.request.endpoint,
            url,
            entry.attempt + 1
        );

        let result = tokio::select! {
            _ = entry.cancel.cancelled() => Err(UploadError::cancelled("请求已取消")),
            res = self.inner.transport.send(entry.request.clone()) => res,
        };
        // 取消之后返回的结果直接丢弃
        let result = if entry.cancel.is_cancelled() {
            Err(UploadError::cancelled("请求已取消"))
        } else {
            result
        };

        match result {
            Ok(response) => {
                self.inner.state.lock().failures.remove(&url);
                entry.respond(Ok(response));
            }
            Err(err) if err.is_cancel() => {
                entry.respond(Err(err));
            }
            Err(err) => {
                let failures = {
                    let mut state = self.inner.state.lock();
                    let count = state.failures.entry(url.clone()).or_insert(0);
                    *count += 1;
                    *count
                };

                if err.is_retriable() && entry.attempt < entry.max_retries {
                    entry.attempt += 1;
                    let delay = self.backoff_with_jitter(entry.attempt);
                    warn!(
                        "请求失败，{:?} 后重试 ({}/{}): task={}, url={}, 连续失败 {} 次, 错误: {}",
                        delay, entry.attempt, entry.max_retries, entry.task_id, url, failures, err
                    );
                    self.requeue_after(entry, delay);
                } else {
                    error!(
                        "请求失败: task={}, url={}, 已重试 {} 次, 错误: {}",
                        entry.task_id, url, entry.attempt, err
                    );
                    entry.respond(Err(err));
                }
            }
        }

        self.record_settlement();
    }

    fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let delay = calculate_backoff_delay(attempt, self.inner.retry_backoff);
        let max_jitter = delay.as_millis() as u64 / 10;
        if max_jitter == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter))
    }

    /// 重试请求插回本任务队首
    fn requeue_after(&self, entry: Entry, delay: Duration) {
        if delay.is_zero() {
            self.inner.state.lock().enqueue(entry, true);
            return;
        }

        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = entry.cancel.cancelled() => {
                    entry.respond(Err(UploadError::cancelled("请求已取消")));
                }
                _ = tokio::time::sleep(delay) => {
                    scheduler.inner.state.lock().enqueue(entry, true);
                    scheduler.pump();
                }
            }
        });
    }

    /// 取消某个任务的所有请求（排队中的直接结束，在途的收到取消信号）
    pub fn cancel_upload(&self, task_id: &str) -> usize {
        let (drained, token) = {
            let mut state = self.inner.state.lock();
            let drained = state.remove_task(task_id);
            let token = state.task_tokens.remove(task_id);
            (drained, token)
        };

        if let Some(token) = token {
            token.cancel();
        }
        let count = drained.len();
        for entry in drained {
            entry.respond(Err(UploadError::cancelled("上传任务已取消")));
        }
        if count > 0 {
            debug!("取消任务请求: task={}, 排队请求 {} 个", task_id, count);
        }
        count
    }

    /// 运行结束后释放归属 key 的令牌与残留请求
    pub fn release(&self, task_id: &str) {
        let leftover = self.cancel_upload(task_id);
        if leftover > 0 {
            warn!("释放任务时仍有 {} 个排队请求: task={}", leftover, task_id);
        }
    }

    /// 仍在跟踪的归属 key 数量
    pub fn tracked_tasks(&self) -> usize {
        self.inner.state.lock().task_tokens.len()
    }

    /// 暂停调度（在途请求不受影响）
    pub fn pause(&self) {
        self.inner.state.lock().paused = true;
    }

    /// 恢复调度
    pub fn resume(&self) {
        self.inner.state.lock().paused = false;
        self.pump();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().paused
    }

    /// 在途请求数
    pub fn running(&self) -> usize {
        self.inner.state.lock().running
    }

    /// 某任务排队中的请求数
    pub fn pending(&self, task_id: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(task_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// 某接口的连续失败次数
    pub fn failure_count(&self, url: &str) -> u32 {
        self.inner
            .state
            .lock()
            .failures
            .get(url)
            .copied()
            .unwrap_or(0)
    }
}
