// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 默认分片大小: 1MB
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// 接口并发数上限（对齐浏览器同源连接数限制）
pub const MAX_REQUEST_LIMIT: usize = 6;

/// 文件并发上传数上限
pub const MAX_PARALLEL: usize = 3;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 切片 worker 配置
    #[serde(default)]
    pub worker: WorkerConfig,
    /// 三个接口（check / upload / merge）配置
    #[serde(default)]
    pub actions: ActionsConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 20MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    20 * 1024 * 1024
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// 分片大小（字节），默认 1MB
    pub chunk_size: u64,
    /// 全局接口并发数，范围 1-6
    pub request_limit: usize,
    /// 同时上传的文件数，范围 1-3
    pub parallel: usize,
    /// 单个请求最大重试次数
    pub max_retries: u32,
    /// 重试初始退避（毫秒），0 表示立即重试
    pub retry_backoff_ms: u64,
    /// 全局接口超时（毫秒）
    pub timeout_ms: u64,
    /// 是否携带 cookie
    pub with_credentials: bool,
    /// 全局请求头（可用来设置 token）
    pub headers: HashMap<String, String>,
    /// 进度事件最小间隔（毫秒）
    pub progress_interval_ms: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            request_limit: MAX_REQUEST_LIMIT,
            parallel: 2,
            max_retries: 3,
            retry_backoff_ms: 100,
            timeout_ms: 10 * 1000,
            with_credentials: false,
            headers: HashMap::new(),
            progress_interval_ms: 200,
        }
    }
}

impl UploadConfig {
    /// 校验配置取值
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            anyhow::bail!("分片大小必须大于 0");
        }
        if !(1..=MAX_REQUEST_LIMIT).contains(&self.request_limit) {
            anyhow::bail!(
                "接口并发数必须在 1-{} 之间，当前: {}",
                MAX_REQUEST_LIMIT,
                self.request_limit
            );
        }
        if !(1..=MAX_PARALLEL).contains(&self.parallel) {
            anyhow::bail!(
                "文件并发上传数必须在 1-{} 之间，当前: {}",
                MAX_PARALLEL,
                self.parallel
            );
        }
        Ok(())
    }

    /// 把越界的并发参数收敛到合法范围
    pub fn normalized(&self) -> Self {
        let mut config = self.clone();
        config.request_limit = config.request_limit.clamp(1, MAX_REQUEST_LIMIT);
        config.parallel = config.parallel.clamp(1, MAX_PARALLEL);
        if config.chunk_size == 0 {
            config.chunk_size = DEFAULT_CHUNK_SIZE;
        }
        config
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

/// 切片 worker 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// 单个文件允许的最大切片线程数
    pub thread: usize,
    /// 允许多少个文件同时切片（未设置时跟随 upload.parallel）
    pub parallel: Option<usize>,
    /// 切片超时（毫秒），超时后终止该文件的所有 worker，默认 5 分钟
    pub timeout_ms: u64,
    /// 固定线程数，不再受本机 CPU 核数限制
    ///
    /// 文件 hash 依赖分带数量，客户端之间需要得到一致 hash 时打开
    pub pin_thread_count: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            thread: 4,
            parallel: None,
            timeout_ms: 5 * 60 * 1000,
            pin_thread_count: false,
        }
    }
}

impl WorkerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// 单个接口配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    /// 接口路径（相对 base_url，或完整 http(s) 地址）
    pub action: String,
    /// 请求方式
    #[serde(default = "default_method")]
    pub method: String,
    /// 接口超时（毫秒），未设置时使用全局超时
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// 接口重试次数，0 表示不重试；未设置时使用全局 max_retries
    #[serde(default)]
    pub retries: Option<u32>,
    /// 分片上传的文件字段名（仅 upload 接口使用）
    #[serde(default)]
    pub file_field: Option<String>,
}

fn default_method() -> String {
    "POST".to_string()
}

impl ActionConfig {
    fn post(action: &str) -> Self {
        Self {
            action: action.to_string(),
            method: default_method(),
            timeout_ms: None,
            retries: None,
            file_field: None,
        }
    }
}

/// 三个接口配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionsConfig {
    /// 接口前缀
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_check_action")]
    pub check: ActionConfig,
    #[serde(default = "default_upload_action")]
    pub upload: ActionConfig,
    #[serde(default = "default_merge_action")]
    pub merge: ActionConfig,
}

fn default_check_action() -> ActionConfig {
    ActionConfig::post("/check")
}

fn default_upload_action() -> ActionConfig {
    ActionConfig::post("/upload")
}

fn default_merge_action() -> ActionConfig {
    ActionConfig::post("/merge")
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            check: default_check_action(),
            upload: default_upload_action(),
            merge: default_merge_action(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {}", path))?;

        let config: AppConfig = toml::from_str(&content).context("解析配置文件失败")?;

        config
            .upload
            .validate()
            .context("配置文件中的上传参数校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("序列化配置失败")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("创建配置目录失败")?;
            }
        }

        fs::write(path, content).await.context("写入配置文件失败")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_upload_config() {
        let config = UploadConfig::default();
        assert_eq!(config.chunk_size, 1024 * 1024);
        assert_eq!(config.request_limit, 6);
        assert_eq!(config.parallel, 2);
        assert_eq!(config.max_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let config = UploadConfig {
            request_limit: 8,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = UploadConfig {
            parallel: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_normalized_clamps() {
        let config = UploadConfig {
            request_limit: 10,
            parallel: 9,
            chunk_size: 0,
            ..Default::default()
        };
        let normalized = config.normalized();
        assert_eq!(normalized.request_limit, 6);
        assert_eq!(normalized.parallel, 3);
        assert_eq!(normalized.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_parse_partial_toml() {
        let content = r#"
            [upload]
            chunk_size = 2097152
            request_limit = 4

            [actions]
            base_url = "http://127.0.0.1:3000"

            [actions.upload]
            action = "/upload"
            file_field = "chunk"
            retries = 5
        "#;
        let config: AppConfig = toml::from_str(content).unwrap();
        assert_eq!(config.upload.chunk_size, 2 * 1024 * 1024);
        assert_eq!(config.upload.request_limit, 4);
        assert_eq!(config.upload.parallel, 2);
        assert_eq!(config.actions.upload.file_field.as_deref(), Some("chunk"));
        assert_eq!(config.actions.upload.retries, Some(5));
        assert_eq!(config.actions.upload.method, "POST");
        assert_eq!(config.actions.check.action, "/check");
        assert_eq!(config.worker.thread, 4);
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("app.toml");
        let path = path.to_str().unwrap();

        let mut config = AppConfig::default();
        config.upload.request_limit = 3;
        config.worker.pin_thread_count = true;
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.upload.request_limit, 3);
        assert!(loaded.worker.pin_thread_count);
    }
}
