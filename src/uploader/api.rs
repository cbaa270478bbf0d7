// check / upload / merge 三个接口的请求构造与响应解析
//
// 请求只描述"要发什么"，真正的发送交给 UploadTransport；请求可以重复发送（重试）

use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::chunk::UploadChunk;
use super::error::UploadError;
use super::source::ChunkPayload;
use super::types::UploadFile;
use crate::config::{ActionConfig, ActionsConfig, UploadConfig};

/// 防缓存参数的自增序号
static NONCE_SEQ: AtomicU64 = AtomicU64::new(1);

/// 接口类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Check,
    Upload,
    Merge,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Endpoint::Check => "check",
            Endpoint::Upload => "upload",
            Endpoint::Merge => "merge",
        };
        write!(f, "{}", name)
    }
}

/// multipart 请求体
#[derive(Debug, Clone)]
pub struct MultipartBody {
    /// 分片数据字段名
    pub file_field: String,
    /// 分片数据的文件名
    pub file_name: String,
    /// 分片数据（发送时读取）
    pub payload: ChunkPayload,
    /// 其他文本字段
    pub fields: Vec<(String, String)>,
}

/// 请求体
#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Multipart(MultipartBody),
}

/// 一次可重复发送的接口请求
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub endpoint: Endpoint,
    pub method: String,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
    pub timeout: Duration,
}

/// 接口响应
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

/// 交给调度器的请求（带重试上限）
#[derive(Debug, Clone)]
pub struct ScheduledRequest {
    pub request: ApiRequest,
    /// 最大重试次数，0 表示不重试
    pub retries: u32,
}

/// check 接口的结果
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    /// 全部分片都已在服务端
    pub success: bool,
    /// 还需要上传的分片
    pub residual: Vec<UploadChunk>,
    /// 服务端已有的分片
    pub uploaded: Vec<UploadChunk>,
}

/// 服务端返回的已上传分片，兼容两种字段命名
#[derive(Debug, Deserialize)]
struct StoredChunk {
    #[serde(alias = "chunk_hash")]
    hash: String,
    #[serde(alias = "chunk_number")]
    index: usize,
}

/// 拼接接口地址
///
/// 以 http(s) 开头的地址原样使用，否则拼到 base_url 后面
pub fn normalize_url(url: &str, base_url: Option<&str>) -> String {
    let absolute = url.starts_with("http://") || url.starts_with("https://");
    match base_url {
        Some(base) if !absolute && !base.is_empty() => {
            if url.is_empty() {
                base.to_string()
            } else {
                format!(
                    "{}/{}",
                    base.trim_end_matches('/'),
                    url.trim_start_matches('/')
                )
            }
        }
        _ => url.to_string(),
    }
}

/// 防缓存参数：毫秒时间戳 + 自增序号
fn cache_nonce() -> String {
    let now = chrono::Utc::now().timestamp_millis() as u64;
    (now + NONCE_SEQ.fetch_add(1, Ordering::Relaxed)).to_string()
}

fn response_message(body: &Value) -> String {
    body.get("message")
        .or_else(|| body.get("msg"))
        .and_then(Value::as_str)
        .unwrap_or("未知原因")
        .to_string()
}

fn response_success(body: &Value) -> Option<bool> {
    body.get("success").and_then(Value::as_bool)
}

/// 接口构造器
#[derive(Debug, Clone)]
pub struct UploadApi {
    actions: ActionsConfig,
    default_timeout: Duration,
    default_retries: u32,
}

impl UploadApi {
    pub fn new(actions: ActionsConfig, upload: &UploadConfig) -> Self {
        Self {
            actions,
            default_timeout: upload.timeout(),
            default_retries: upload.max_retries,
        }
    }

    fn build(&self, endpoint: Endpoint, action: &ActionConfig, query: Vec<(String, String)>, body: RequestBody) -> ScheduledRequest {
        ScheduledRequest {
            request: ApiRequest {
                endpoint,
                method: action.method.to_uppercase(),
                url: normalize_url(&action.action, self.actions.base_url.as_deref()),
                query,
                body,
                timeout: action
                    .timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(self.default_timeout),
            },
            retries: action.retries.unwrap_or(self.default_retries),
        }
    }

    /// check 请求：文件 hash 以及本地分片清单
    pub fn check(&self, file: &UploadFile, file_hash: &str, chunks: &[UploadChunk]) -> ScheduledRequest {
        let chunk_list: Vec<Value> = chunks
            .iter()
            .map(|c| json!({ "index": c.index, "hash": c.hash }))
            .collect();
        let body = json!({
            "fileHash": file_hash,
            "fileName": file.name,
            "total": file.total,
            "chunks": chunk_list,
        });
        self.build(Endpoint::Check, &self.actions.check, Vec::new(), RequestBody::Json(body))
    }

    /// 上传一个分片
    pub fn upload(&self, file: &UploadFile, file_hash: &str, chunk: &UploadChunk, payload: ChunkPayload) -> ScheduledRequest {
        let action = &self.actions.upload;
        let fields = vec![
            ("total".to_string(), file.total.to_string()),
            ("chunkNumber".to_string(), chunk.index.to_string()),
            ("chunkSize".to_string(), chunk.size().to_string()),
            ("fileName".to_string(), file.name.clone()),
            ("fileSize".to_string(), file.size.to_string()),
            ("fileHash".to_string(), file_hash.to_string()),
            ("chunkHash".to_string(), chunk.hash.clone()),
        ];
        let body = RequestBody::Multipart(MultipartBody {
            file_field: action
                .file_field
                .clone()
                .unwrap_or_else(|| "file".to_string()),
            file_name: file.name.clone(),
            payload,
            fields,
        });
        let query = vec![("_t".to_string(), cache_nonce())];
        self.build(Endpoint::Upload, action, query, body)
    }

    /// 合并请求
    pub fn merge(&self, file: &UploadFile, file_hash: &str) -> ScheduledRequest {
        let body = json!({
            "total": file.total,
            "md5": file_hash,
            "fileName": file.name,
        });
        self.build(Endpoint::Merge, &self.actions.merge, Vec::new(), RequestBody::Json(body))
    }
}

/// 解析 check 响应
///
/// success=true 表示文件已完整存在；否则 data 是服务端已有的分片，
/// 按（索引, hash）对比本地分片得到剩余分片
pub fn parse_check(response: &ApiResponse, chunks: &[UploadChunk]) -> Result<CheckOutcome, UploadError> {
    let body = &response.body;
    if !body.is_object() {
        return Err(UploadError::Protocol(format!(
            "check 响应不是 JSON 对象: {}",
            body
        )));
    }

    if response_success(body) == Some(true) {
        return Ok(CheckOutcome {
            success: true,
            residual: Vec::new(),
            uploaded: chunks.to_vec(),
        });
    }

    let stored: Vec<StoredChunk> = match body.get("data") {
        None | Some(Value::Null) => Vec::new(),
        Some(data) => serde_json::from_value(data.clone())
            .map_err(|e| UploadError::Protocol(format!("check 响应 data 格式错误: {}", e)))?,
    };
    let stored: HashSet<(usize, &str)> = stored.iter().map(|s| (s.index, s.hash.as_str())).collect();

    let (uploaded, residual): (Vec<UploadChunk>, Vec<UploadChunk>) = chunks
        .iter()
        .cloned()
        .partition(|c| stored.contains(&(c.index, c.hash.as_str())));

    Ok(CheckOutcome {
        success: residual.is_empty(),
        residual,
        uploaded,
    })
}

/// 解析 upload 响应，2xx 且没有明确 success=false 即成功
pub fn parse_upload(response: &ApiResponse) -> Result<(), UploadError> {
    if response_success(&response.body) == Some(false) {
        return Err(UploadError::Rejected(format!(
            "分片上传失败: {}",
            response_message(&response.body)
        )));
    }
    Ok(())
}

/// 解析 merge 响应，返回服务端文件路径
pub fn parse_merge(response: &ApiResponse) -> Result<Option<String>, UploadError> {
    let body = &response.body;
    match response_success(body) {
        Some(true) => Ok(body
            .get("data")
            .and_then(Value::as_str)
            .map(|s| s.to_string())),
        _ => Err(UploadError::Rejected(format!(
            "合并失败: {}",
            response_message(body)
        ))),
    }
}
