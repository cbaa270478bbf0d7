// 并发限制队列
//
// 同时最多执行 parallelism 个任务，其余按先进先出排队；重试任务插到队首。
// 一个任务结束（包括 panic）后立即调度下一个。

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

use super::error::UploadError;

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct LimiterState {
    queue: VecDeque<Job>,
    running: usize,
    parallelism: usize,
}

/// 并发限制队列
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    name: Arc<str>,
    state: Arc<Mutex<LimiterState>>,
}

impl ConcurrencyLimiter {
    pub fn new(name: &str, parallelism: usize) -> Self {
        Self {
            name: Arc::from(name),
            state: Arc::new(Mutex::new(LimiterState {
                queue: VecDeque::new(),
                running: 0,
                parallelism: parallelism.max(1),
            })),
        }
    }

    /// 排到队尾
    pub fn submit<F, Fut, T>(&self, work: F) -> impl Future<Output = Result<T, UploadError>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, UploadError>> + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue(false, work)
    }

    /// 插到队首（重试的任务优先）
    pub fn submit_front<F, Fut, T>(&self, work: F) -> impl Future<Output = Result<T, UploadError>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, UploadError>> + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue(true, work)
    }

    fn enqueue<F, Fut, T>(&self, front: bool, work: F) -> impl Future<Output = Result<T, UploadError>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, UploadError>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            Box::pin(async move {
                let _ = tx.send(work().await);
            })
        });

        {
            let mut state = self.state.lock();
            if front {
                state.queue.push_front(job);
            } else {
                state.queue.push_back(job);
            }
        }
        self.pump();

        async move {
            // 队列被清空或任务 panic 时发送端被丢弃
            rx.await
                .unwrap_or_else(|_| Err(UploadError::cancelled("任务已从队列中移除")))
        }
    }

    /// 在并发未满时启动排队中的任务
    fn pump(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        loop {
            let job = {
                let mut state = self.state.lock();
                if state.running >= state.parallelism {
                    return;
                }
                match state.queue.pop_front() {
                    Some(job) => {
                        state.running += 1;
                        job
                    }
                    None => return,
                }
            };

            let guard = RunningGuard {
                limiter: self.clone(),
            };
            handle.spawn(async move {
                let _guard = guard;
                job().await;
            });
        }
    }

    /// 丢弃所有尚未开始的任务，它们的 future 以取消结束
    pub fn cancel_all(&self) -> usize {
        let dropped: Vec<Job> = self.state.lock().queue.drain(..).collect();
        let count = dropped.len();
        drop(dropped);
        if count > 0 {
            debug!("[{}] 清空排队任务: {} 个", self.name, count);
        }
        count
    }

    /// 调整并发数
    pub fn set_parallelism(&self, parallelism: usize) {
        self.state.lock().parallelism = parallelism.max(1);
        self.pump();
    }

    pub fn parallelism(&self) -> usize {
        self.state.lock().parallelism
    }

    /// 排队中的任务数
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// 执行中的任务数
    pub fn running(&self) -> usize {
        self.state.lock().running
    }
}

/// 任务结束时释放名额并调度下一个
struct RunningGuard {
    limiter: ConcurrencyLimiter,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        {
            let mut state = self.limiter.state.lock();
            state.running = state.running.saturating_sub(1);
        }
        self.limiter.pump();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_parallelism_bound() {
        let limiter = ConcurrencyLimiter::new("test", 2);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let futures: Vec<_> = (0..6)
            .map(|i| {
                let current = current.clone();
                let peak = peak.clone();
                limiter.submit(move || async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(i)
                })
            })
            .collect();

        let results = futures::future::join_all(futures).await;
        let values: Vec<usize> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(limiter.running(), 0);
    }

    #[tokio::test]
    async fn test_fifo_and_front_priority() {
        let limiter = ConcurrencyLimiter::new("test", 1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let blocker = {
            let order = order.clone();
            limiter.submit(move || async move {
                let _ = release_rx.await;
                order.lock().push("blocker");
                Ok(())
            })
        };

        let mut pending: Vec<BoxFuture<'static, Result<(), UploadError>>> = Vec::new();
        for name in ["a", "b"] {
            let order = order.clone();
            pending.push(
                limiter
                    .submit(move || async move {
                        order.lock().push(name);
                        Ok(())
                    })
                    .boxed(),
            );
        }
        {
            let order = order.clone();
            pending.push(
                limiter
                    .submit_front(move || async move {
                        order.lock().push("retry");
                        Ok(())
                    })
                    .boxed(),
            );
        }
        assert_eq!(limiter.pending(), 3);

        let _ = release_tx.send(());
        blocker.await.unwrap();
        for fut in pending {
            fut.await.unwrap();
        }
        assert_eq!(*order.lock(), vec!["blocker", "retry", "a", "b"]);
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let limiter = ConcurrencyLimiter::new("test", 1);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let blocker = limiter.submit(move || async move {
            let _ = release_rx.await;
            Ok("done")
        });
        let queued_a = limiter.submit(|| async { Ok("a") });
        let queued_b = limiter.submit(|| async { Ok("b") });

        assert_eq!(limiter.cancel_all(), 2);
        assert!(queued_a.await.unwrap_err().is_cancel());
        assert!(queued_b.await.unwrap_err().is_cancel());

        let _ = release_tx.send(());
        assert_eq!(blocker.await.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_panic_releases_slot() {
        let limiter = ConcurrencyLimiter::new("test", 1);
        let boom = limiter.submit(|| async {
            if true {
                panic!("boom");
            }
            Ok(())
        });
        let next = limiter.submit(|| async { Ok(42) });

        assert!(boom.await.is_err());
        assert_eq!(next.await.unwrap(), 42);
    }
}
