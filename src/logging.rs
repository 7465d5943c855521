//! 日志系统配置
//!
//! 控制台输出 + 可选的文件持久化。
//! 日志文件名为 `large-upload.<启动时间>.log`，超过大小上限后滚动为
//! `large-upload.<启动时间>_N.log`；启动时清理超过保留天数的旧文件。

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
const LOG_FILE_PREFIX: &str = "large-upload.";

/// 日志文件名后缀
const LOG_FILE_SUFFIX: &str = ".log";

/// 日志时间格式
const LOG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 生成日志文件名
///
/// # 参数
/// * `timestamp` - 启动时间（YYYY-MM-DD-HHMMSS）
/// * `index` - 滚动序号，0 表示第一个文件
fn log_file_name(timestamp: &str, index: u32) -> String {
    if index == 0 {
        format!("{}{}{}", LOG_FILE_PREFIX, timestamp, LOG_FILE_SUFFIX)
    } else {
        format!("{}{}_{}{}", LOG_FILE_PREFIX, timestamp, index, LOG_FILE_SUFFIX)
    }
}

/// 从日志文件名中解析日期
///
/// `large-upload.2024-05-01-083000_2.log` -> 2024-05-01
fn log_file_date(filename: &str) -> Option<NaiveDate> {
    let stamp = filename
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_suffix(LOG_FILE_SUFFIX)?;
    let date = stamp.get(..10)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// 按大小滚动的日志文件
struct RollingFile {
    log_dir: PathBuf,
    timestamp: String,
    index: u32,
    max_file_size: u64,
    written: u64,
    file: File,
}

impl RollingFile {
    fn open(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        let timestamp = Local::now().format("%Y-%m-%d-%H%M%S").to_string();
        let file = Self::open_index(&log_dir, &timestamp, 0)?;
        Ok(Self {
            log_dir,
            timestamp,
            index: 0,
            max_file_size,
            written: 0,
            file,
        })
    }

    fn open_index(log_dir: &Path, timestamp: &str, index: u32) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join(log_file_name(timestamp, index)))
    }

    fn write_record(&mut self, buf: &[u8]) -> io::Result<usize> {
        // 当前文件非空且写入后超过上限时滚动
        if self.written > 0 && self.written + buf.len() as u64 > self.max_file_size {
            self.file.flush()?;
            self.index += 1;
            self.file = Self::open_index(&self.log_dir, &self.timestamp, self.index)?;
            self.written = 0;
        }

        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }
}

/// 线程安全的日志文件写入器
#[derive(Clone)]
pub struct LogFileWriter {
    inner: Arc<Mutex<RollingFile>>,
}

impl LogFileWriter {
    /// 在指定目录下创建日志文件
    pub fn new(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(RollingFile::open(log_dir, max_file_size)?)),
        })
    }
}

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write_record(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().file.flush()
    }
}

/// 日志系统守卫
/// 必须保持存活，否则日志写入线程会终止
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// # 参数
/// * `config` - 日志配置
///
/// # 返回
/// 日志守卫，需要保持存活直到程序结束
pub fn init_logging(config: &LogConfig) -> LogGuard {
    // RUST_LOG 优先，否则使用配置中的级别
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(LOG_TIME_FORMAT.to_string()))
        .with_ansi(true);

    let file_writer = if config.enabled {
        open_file_writer(config)
    } else {
        None
    };

    let (file_layer, file_guard) = match file_writer {
        Some(writer) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(writer);
            let layer = fmt::layer()
                .with_target(true)
                .with_timer(ChronoLocal::new(LOG_TIME_FORMAT.to_string()))
                .with_ansi(false)
                .with_writer(non_blocking);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    let file_enabled = file_layer.is_some();

    if let Err(e) = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
    {
        eprintln!("日志系统已初始化，跳过: {}", e);
    }

    if file_enabled {
        info!(
            "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}, 单文件最大={:.1}MB",
            config.log_dir,
            config.retention_days,
            config.level,
            config.max_file_size as f64 / 1024.0 / 1024.0
        );
        cleanup_old_logs(&config.log_dir, config.retention_days);
    } else {
        info!("日志系统初始化完成（仅控制台输出）");
    }

    LogGuard {
        _file_guard: file_guard,
    }
}

/// 创建日志目录与文件，失败时回退到仅控制台输出
fn open_file_writer(config: &LogConfig) -> Option<LogFileWriter> {
    if let Err(e) = fs::create_dir_all(&config.log_dir) {
        eprintln!("创建日志目录失败: {:?}, 错误: {}", config.log_dir, e);
        return None;
    }

    match LogFileWriter::new(config.log_dir.clone(), config.max_file_size) {
        Ok(writer) => Some(writer),
        Err(e) => {
            eprintln!("创建日志文件失败: {}, 回退到仅控制台输出", e);
            None
        }
    }
}

/// 清理过期日志文件
///
/// 优先按文件名中的日期判断，解析失败时按修改时间判断
///
/// # 返回
/// 删除的文件数
fn cleanup_old_logs(log_dir: &Path, retention_days: u32) -> usize {
    let today = Local::now().date_naive();
    let retention = chrono::Duration::days(retention_days as i64);

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let mut deleted = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(filename) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if !path.is_file()
            || !filename.starts_with(LOG_FILE_PREFIX)
            || !filename.ends_with(LOG_FILE_SUFFIX)
        {
            continue;
        }

        let expired = match log_file_date(filename) {
            Some(date) => today.signed_duration_since(date) > retention,
            None => modified_before(&entry, retention),
        };

        if expired {
            match fs::remove_file(&path) {
                Ok(()) => {
                    deleted += 1;
                    debug!("已删除过期日志文件: {:?}", path);
                }
                Err(e) => warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e),
            }
        }
    }

    if deleted > 0 {
        info!("已清理 {} 个过期日志文件", deleted);
    }
    deleted
}

fn modified_before(entry: &fs::DirEntry, retention: chrono::Duration) -> bool {
    entry
        .metadata()
        .and_then(|m| m.modified())
        .map(|modified| {
            let modified: chrono::DateTime<chrono::Utc> = modified.into();
            chrono::Utc::now().signed_duration_since(modified) > retention
        })
        .unwrap_or(false)
}
