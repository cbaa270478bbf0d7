// 上传引擎模块
//
// - 多线程切片 + MD5（文件 hash 由各切片带的 hash 折叠得到）
// - 断点续传：check 接口返回已有分片，只补传缺失部分
// - 全局接口调度器（按任务 Round-Robin，限制在途请求数）
// - 切片队列 / 上传队列两级并发控制
// - 断网挂起，恢复联网后自动继续

pub mod api;
pub mod chunk;
pub mod error;
pub mod events;
pub mod hasher;
pub mod limiter;
pub mod queue;
pub mod scheduler;
pub mod slicer;
pub mod source;
pub mod task;
pub mod throttle;
pub mod transport;
pub mod types;

#[cfg(test)]
mod test_support;

pub use api::{ApiRequest, ApiResponse, CheckOutcome, Endpoint, UploadApi};
pub use chunk::{UploadChunk, UploadChunkManager};
pub use error::UploadError;
pub use events::{EventBus, ProgressEvent, UploadEvent};
pub use hasher::HashingAccumulator;
pub use limiter::ConcurrencyLimiter;
pub use queue::{UploadHandle, UploadQueue};
pub use scheduler::RequestScheduler;
pub use slicer::{SliceOutput, Slicer};
pub use source::{FileSource, MemorySource, PathSource};
pub use task::{Completion, StopReason, TaskContext, UploadOutcome, UploadTask};
pub use transport::{HttpTransport, UploadTransport};
pub use types::{FileId, UploadFile, UploadStatus};
