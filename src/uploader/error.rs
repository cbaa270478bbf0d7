// 上传错误类型

use std::time::Duration;
use thiserror::Error;

/// 上传引擎错误
///
/// 任务的完成 future 是共享的，错误需要可以 clone
#[derive(Debug, Clone, Error)]
pub enum UploadError {
    /// 主动取消（stop / remove / cancel_upload），永不重试
    #[error("上传已取消: {0}")]
    Cancelled(String),

    /// 网络层错误（连接失败、超时、断网）
    #[error("网络错误: {0}")]
    Network(String),

    /// 服务端返回非 2xx
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// 接口连续失败次数达到上限，请求未发送直接失败
    #[error("接口 {endpoint} 已连续失败 {failures} 次，请求被拒绝")]
    CircuitOpen { endpoint: String, failures: u32 },

    /// 协议不一致（响应格式错误、补传后仍有残余分片）
    #[error("协议错误: {0}")]
    Protocol(String),

    /// 服务端明确返回 success=false
    #[error("服务端拒绝: {0}")]
    Rejected(String),

    /// 切片 worker 出错
    #[error("切片失败: {0}")]
    Slice(String),

    /// 切片超时
    #[error("切片超时: {0:?}")]
    SliceTimeout(Duration),

    /// 本地文件读取错误
    #[error("IO 错误: {0}")]
    Io(String),

    /// 还没有完成切片就进入上传阶段
    #[error("文件尚未切片")]
    NotSliced,

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),
}

impl UploadError {
    pub fn cancelled(reason: impl Into<String>) -> Self {
        UploadError::Cancelled(reason.into())
    }

    /// 是否为取消
    pub fn is_cancel(&self) -> bool {
        matches!(self, UploadError::Cancelled(_))
    }

    /// 是否值得重试
    ///
    /// 网络错误与 5xx 重试；4xx 中只有 408 / 429 重试
    pub fn is_retriable(&self) -> bool {
        match self {
            UploadError::Network(_) => true,
            UploadError::Http { status, .. } => {
                !(400..500).contains(status) || *status == 408 || *status == 429
            }
            _ => false,
        }
    }
}

impl From<std::io::Error> for UploadError {
    fn from(err: std::io::Error) -> Self {
        UploadError::Io(err.to_string())
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            UploadError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            UploadError::Network(err.to_string())
        }
    }
}
