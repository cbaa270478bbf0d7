// 测试辅助：内存存储服务端、脚本化传输、慢速数据源

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::api::{ApiRequest, ApiResponse, Endpoint, RequestBody};
use super::chunk::UploadChunk;
use super::error::UploadError;
use super::hasher::HashingAccumulator;
use super::source::{FileSource, MemorySource};
use super::task::TaskContext;
use super::transport::UploadTransport;
use crate::config::{AppConfig, WorkerConfig};

/// 测试用配置：小分片、快速重试、不节流进度
pub fn test_config(chunk_size: u64) -> AppConfig {
    let mut config = AppConfig::default();
    config.upload.chunk_size = chunk_size;
    config.upload.max_retries = 2;
    config.upload.retry_backoff_ms = 1;
    config.upload.progress_interval_ms = 0;
    config.worker = WorkerConfig {
        thread: 2,
        pin_thread_count: true,
        ..Default::default()
    };
    config
}

pub fn test_context(transport: Arc<dyn UploadTransport>, chunk_size: u64) -> Arc<TaskContext> {
    Arc::new(TaskContext::new(&test_config(chunk_size), transport))
}

/// 在途计数，drop 时减一
struct InFlight<'a> {
    current: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(current: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { current }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

type Handler = Box<dyn Fn(&ApiRequest) -> Result<Value, UploadError> + Send + Sync>;

/// 按闭包应答的传输层，记录每次请求的 url
pub struct ScriptedTransport {
    handler: Handler,
    delay: Duration,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(
        delay: Duration,
        handler: impl Fn(&ApiRequest) -> Result<Value, UploadError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            delay,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UploadTransport for ScriptedTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, UploadError> {
        self.calls.lock().push(request.url.clone());
        let _in_flight = InFlight::enter(&self.in_flight, &self.peak);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.handler)(&request).map(|body| ApiResponse { status: 200, body })
    }
}

#[derive(Default)]
struct ServerState {
    /// 文件 hash -> 分片索引 -> (分片 hash, 数据)
    chunks: HashMap<String, BTreeMap<usize, (String, Bytes)>>,
    /// 文件 hash -> 合并后的数据
    merged: HashMap<String, Vec<u8>>,
    calls: Vec<Endpoint>,
    /// 收到的分片索引（按到达顺序）
    uploaded: Vec<usize>,
    delays: HashMap<Endpoint, Duration>,
    fail_always: HashSet<Endpoint>,
    fail_times: HashMap<Endpoint, u32>,
    offline: bool,
    drop_uploads: bool,
}

/// 内存存储服务端，实现 check / upload / merge 三个接口
#[derive(Default)]
pub struct MemoryServer {
    state: Mutex<ServerState>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MemoryServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self, endpoint: Endpoint) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|e| **e == endpoint)
            .count()
    }

    pub fn uploaded_indices(&self) -> Vec<usize> {
        self.state.lock().uploaded.clone()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn merged_file(&self, file_hash: &str) -> Option<Vec<u8>> {
        self.state.lock().merged.get(file_hash).cloned()
    }

    /// 预置一个已上传的分片
    pub fn seed(&self, file_hash: &str, chunk: &UploadChunk, data: &[u8]) {
        let bytes = Bytes::copy_from_slice(&data[chunk.range.start as usize..chunk.range.end as usize]);
        self.state
            .lock()
            .chunks
            .entry(file_hash.to_string())
            .or_default()
            .insert(chunk.index, (chunk.hash.clone(), bytes));
    }

    pub fn set_delay(&self, endpoint: Endpoint, delay: Duration) {
        self.state.lock().delays.insert(endpoint, delay);
    }

    pub fn fail_always(&self, endpoint: Endpoint) {
        self.state.lock().fail_always.insert(endpoint);
    }

    pub fn fail_times(&self, endpoint: Endpoint, times: u32) {
        self.state.lock().fail_times.insert(endpoint, times);
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// 上传接口返回成功但不保存分片
    pub fn set_drop_uploads(&self, drop_uploads: bool) {
        self.state.lock().drop_uploads = drop_uploads;
    }

    fn injected_failure(&self, endpoint: Endpoint) -> Option<UploadError> {
        let mut state = self.state.lock();
        if state.offline {
            return Some(UploadError::Network("网络不可用".into()));
        }
        if state.fail_always.contains(&endpoint) {
            return Some(UploadError::Http {
                status: 500,
                message: "internal error".into(),
            });
        }
        if let Some(times) = state.fail_times.get_mut(&endpoint) {
            if *times > 0 {
                *times -= 1;
                return Some(UploadError::Network("connection reset".into()));
            }
        }
        None
    }

    fn handle_check(&self, body: &Value) -> Value {
        let file_hash = body["fileHash"].as_str().unwrap_or_default();
        let state = self.state.lock();
        if state.merged.contains_key(file_hash) {
            return json!({ "success": true, "data": null });
        }
        let stored: Vec<Value> = state
            .chunks
            .get(file_hash)
            .map(|chunks| {
                chunks
                    .iter()
                    .map(|(index, (hash, _))| json!({ "chunk_hash": hash, "chunk_number": index }))
                    .collect()
            })
            .unwrap_or_default();
        json!({ "success": false, "data": stored })
    }

    async fn handle_upload(&self, request: &ApiRequest) -> Result<Value, UploadError> {
        let RequestBody::Multipart(body) = &request.body else {
            return Err(UploadError::Http {
                status: 400,
                message: "需要 multipart".into(),
            });
        };
        let field = |name: &str| {
            body.fields
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
                .unwrap_or_default()
        };
        let data = body.payload.load().await?;
        let chunk_hash = field("chunkHash");
        if HashingAccumulator::digest(&data) != chunk_hash {
            return Err(UploadError::Http {
                status: 400,
                message: "分片 hash 不匹配".into(),
            });
        }
        let index: usize = field("chunkNumber").parse().unwrap_or_default();

        let mut state = self.state.lock();
        state.uploaded.push(index);
        if !state.drop_uploads {
            state
                .chunks
                .entry(field("fileHash"))
                .or_default()
                .insert(index, (chunk_hash, data));
        }
        Ok(json!({ "success": true }))
    }

    fn handle_merge(&self, body: &Value) -> Value {
        let file_hash = body["md5"].as_str().unwrap_or_default().to_string();
        let total = body["total"].as_u64().unwrap_or_default() as usize;
        let name = body["fileName"].as_str().unwrap_or_default().to_string();

        let mut state = self.state.lock();
        let chunks = state.chunks.get(&file_hash).cloned().unwrap_or_default();
        if !state.merged.contains_key(&file_hash) {
            if (0..total).any(|i| !chunks.contains_key(&i)) {
                return json!({ "success": false, "message": "分片不完整" });
            }
            let mut merged = Vec::new();
            for (_, data) in chunks.values() {
                merged.extend_from_slice(data);
            }
            state.merged.insert(file_hash, merged);
        }
        json!({ "success": true, "data": format!("/files/{}", name) })
    }
}

#[async_trait]
impl UploadTransport for MemoryServer {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, UploadError> {
        let endpoint = request.endpoint;
        let delay = {
            let mut state = self.state.lock();
            state.calls.push(endpoint);
            state.delays.get(&endpoint).copied()
        };
        let _in_flight = InFlight::enter(&self.in_flight, &self.peak);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = self.injected_failure(endpoint) {
            return Err(err);
        }

        let body = match (&request.endpoint, &request.body) {
            (Endpoint::Check, RequestBody::Json(body)) => self.handle_check(body),
            (Endpoint::Merge, RequestBody::Json(body)) => self.handle_merge(body),
            (Endpoint::Upload, _) => self.handle_upload(&request).await?,
            _ => {
                return Err(UploadError::Http {
                    status: 400,
                    message: "bad request".into(),
                })
            }
        };
        Ok(ApiResponse { status: 200, body })
    }
}

/// 每次读取都会阻塞一段时间的数据源
#[derive(Debug)]
pub struct SlowSource {
    inner: MemorySource,
    delay: Duration,
}

impl SlowSource {
    pub fn new(data: Vec<u8>, delay: Duration) -> Self {
        Self {
            inner: MemorySource::new("slow.bin", data),
            delay,
        }
    }
}

impl FileSource for SlowSource {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn read_range(&self, range: Range<u64>) -> io::Result<Bytes> {
        std::thread::sleep(self.delay);
        self.inner.read_range(range)
    }
}
