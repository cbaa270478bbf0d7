// 大文件分片上传库
// 切片 + MD5、断点续传、接口并发调度、断网续传

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use config::AppConfig;
pub use uploader::{
    FileId, UploadError, UploadEvent, UploadFile, UploadHandle, UploadOutcome, UploadQueue,
    UploadStatus, UploadTask,
};
