//! 日志系统
//!
//! 控制台 + 文件双输出。日志文件按启动时间命名，超过大小后滚动，
//! 启动时清理超过保留天数的旧文件

use crate::config::LogConfig;
use chrono::{Local, NaiveDate};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀
const LOG_PREFIX: &str = "bigfile-upload.";
const LOG_SUFFIX: &str = ".log";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

struct RollingState {
    /// 启动时间戳（YYYY-MM-DD-HHMMSS）
    started: String,
    log_dir: PathBuf,
    file: Option<File>,
    /// 0 为首个文件，之后依次 _1、_2 ...
    index: u32,
    max_file_size: u64,
    written: u64,
}

impl RollingState {
    fn path_for(&self, index: u32) -> PathBuf {
        let name = match index {
            0 => format!("{}{}{}", LOG_PREFIX, self.started, LOG_SUFFIX),
            n => format!("{}{}_{}{}", LOG_PREFIX, self.started, n, LOG_SUFFIX),
        };
        self.log_dir.join(name)
    }

    fn open_current(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(self.index))?;
        self.file = Some(file);
        self.written = 0;
        Ok(())
    }

    fn write_buf(&mut self, buf: &[u8]) -> io::Result<usize> {
        // 空文件不滚动，避免单条超大日志导致无限滚动
        if self.written > 0 && self.written + buf.len() as u64 > self.max_file_size {
            if let Some(mut file) = self.file.take() {
                file.flush()?;
            }
            self.index += 1;
            self.open_current()?;
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "日志文件未打开"))?;
        let written = file.write(buf)?;
        self.written += written as u64;
        Ok(written)
    }
}

/// 按大小滚动的日志文件写入器
#[derive(Clone)]
pub struct RollingFileWriter {
    state: Arc<Mutex<RollingState>>,
}

impl RollingFileWriter {
    pub fn new(log_dir: impl Into<PathBuf>, max_file_size: u64) -> io::Result<Self> {
        let mut state = RollingState {
            started: Local::now().format("%Y-%m-%d-%H%M%S").to_string(),
            log_dir: log_dir.into(),
            file: None,
            index: 0,
            max_file_size: max_file_size.max(1),
            written: 0,
        };
        state.open_current()?;
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// 当前写入的文件
    pub fn current_path(&self) -> PathBuf {
        let state = self.state.lock();
        state.path_for(state.index)
    }
}

impl Write for RollingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.state.lock().write_buf(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.state.lock().file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// 日志守卫，drop 后文件写入线程退出
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// 已经初始化过（例如测试中重复调用）时只打印提示
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_ansi(true);

    let writer = if config.enabled {
        match fs::create_dir_all(&config.log_dir)
            .and_then(|_| RollingFileWriter::new(&config.log_dir, config.max_file_size))
        {
            Ok(writer) => Some(writer),
            Err(e) => {
                eprintln!("创建日志文件失败: {:?}, 错误: {}，仅输出到控制台", config.log_dir, e);
                None
            }
        }
    } else {
        None
    };

    let Some(writer) = writer else {
        if tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init()
            .is_err()
        {
            eprintln!("日志系统已初始化，忽略重复调用");
        }
        return LogGuard { _file_guard: None };
    };

    let (non_blocking, file_guard) = tracing_appender::non_blocking(writer);
    let file_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_ansi(false)
        .with_writer(non_blocking);

    if tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_err()
    {
        eprintln!("日志系统已初始化，忽略重复调用");
    }

    info!(
        "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}, 单文件最大={:.1}MB",
        config.log_dir,
        config.retention_days,
        config.level,
        config.max_file_size as f64 / 1024.0 / 1024.0
    );

    let removed = cleanup_old_logs(&config.log_dir, config.retention_days, Local::now().date_naive());
    if removed > 0 {
        info!("已清理 {} 个过期日志文件", removed);
    }

    LogGuard {
        _file_guard: Some(file_guard),
    }
}

/// 从文件名取日期：bigfile-upload.YYYY-MM-DD-HHMMSS[_N].log
fn log_file_date(filename: &str) -> Option<NaiveDate> {
    let stem = filename.strip_prefix(LOG_PREFIX)?.strip_suffix(LOG_SUFFIX)?;
    let date = stem.get(..10)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// 删除早于 today - retention_days 的日志，返回删除数量
fn cleanup_old_logs(log_dir: &Path, retention_days: u32, today: NaiveDate) -> usize {
    let retention = chrono::Duration::days(retention_days as i64);
    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(date) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(log_file_date)
        else {
            continue;
        };
        if today.signed_duration_since(date) <= retention {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                removed += 1;
                debug!("已删除过期日志文件: {:?}", path);
            }
            Err(e) => warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e),
        }
    }
    removed
}
