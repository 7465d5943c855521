//! 上传进度持久化
//!
//! 本地 key -> string 映射，key 为 `progress-<hash>`，value 为最近一次的进度百分比。
//! 每个分片成功后写入，会话完成后删除。
//!
//! ## 存储实现
//!
//! - [`MemoryProgressStore`]: 进程内存储（默认）
//! - [`FileProgressStore`]: JSON 文件存储，后台任务合并刷写，先写临时文件再原子重命名
//!
//! ```json
//! {
//!   "progress-9f86d0...": "42"
//! }
//! ```

use crate::config::PersistenceConfig;
use crate::error::{UploadError, UploadResult};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 进度 key 前缀
const PROGRESS_KEY_PREFIX: &str = "progress-";

/// 生成进度 key
pub fn progress_key(file_hash: &str) -> String {
    format!("{}{}", PROGRESS_KEY_PREFIX, file_hash)
}

/// 进度存储
pub trait ProgressStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> UploadResult<()>;
    fn remove(&self, key: &str) -> UploadResult<()>;

    /// 把尚未落盘的修改写出
    fn flush(&self) -> UploadResult<()> {
        Ok(())
    }
}

/// 进程内存储
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    entries: DashMap<String, String>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ProgressStore for MemoryProgressStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    fn set(&self, key: &str, value: &str) -> UploadResult<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> UploadResult<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// JSON 文件存储
///
/// 写入只更新内存并标记为脏，由后台任务按间隔刷写（合并多次写入），
/// 也可以调用 [`ProgressStore::flush`] 立即刷写；最后一个引用释放时补刷一次
#[derive(Debug)]
pub struct FileProgressStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
    dirty: AtomicBool,
    /// 串行化文件写入
    write_lock: Mutex<()>,
}

impl FileProgressStore {
    /// 打开存储文件（不存在时为空存储，解析失败时丢弃旧内容）
    pub fn open(path: impl Into<PathBuf>) -> UploadResult<Self> {
        let path = path.into();
        let entries = if path.exists() {
            match load_entries(&path) {
                Ok(entries) => {
                    debug!("已加载进度记录: {:?} ({} 条)", path, entries.len());
                    entries
                }
                Err(e) => {
                    warn!("进度文件损坏，重新开始: {:?}, 错误: {}", path, e);
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| UploadError::read(parent, e))?;
                debug!("已创建目录: {:?}", parent);
            }
        }

        Ok(Self {
            path,
            entries: Mutex::new(entries),
            dirty: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 是否有尚未刷写的修改
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// 启动后台刷写任务
    ///
    /// 任务只持有弱引用，存储被释放或 shutdown 触发后退出（退出前补刷一次）
    pub fn start_flush_task(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        let interval = interval.max(Duration::from_millis(10));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !flush_in_background(&store).await {
                            break;
                        }
                    }
                    _ = shutdown.cancelled() => {
                        flush_in_background(&store).await;
                        break;
                    }
                }
            }
            debug!("进度刷写任务已退出");
        })
    }

    /// 写回文件
    fn write_entries(&self) -> UploadResult<()> {
        let _guard = self.write_lock.lock();
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let entries = self.entries.lock().clone();

        if let Err(e) = self.write_file(&entries) {
            // 保留脏标记，下次再试
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    fn write_file(&self, entries: &BTreeMap<String, String>) -> UploadResult<()> {
        // 先写入临时文件，再原子重命名
        let temp_path = self.path.with_extension("json.tmp");

        let file = File::create(&temp_path).map_err(|e| UploadError::read(&temp_path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, entries)
            .map_err(|e| UploadError::read(&temp_path, e))?;
        writer.flush().map_err(|e| UploadError::read(&temp_path, e))?;
        drop(writer);

        fs::rename(&temp_path, &self.path).map_err(|e| UploadError::read(&self.path, e))?;
        Ok(())
    }
}

/// 在阻塞线程池中刷写一次
///
/// # 返回
/// 存储已被释放时返回 false
async fn flush_in_background(store: &Weak<FileProgressStore>) -> bool {
    let Some(store) = store.upgrade() else {
        return false;
    };
    if !store.is_dirty() {
        return true;
    }

    match tokio::task::spawn_blocking(move || store.write_entries()).await {
        Ok(Err(e)) => warn!("刷写进度文件失败: {}", e),
        Err(e) => warn!("进度刷写任务异常: {}", e),
        Ok(Ok(())) => {}
    }
    true
}

impl Drop for FileProgressStore {
    fn drop(&mut self) {
        if let Err(e) = self.write_entries() {
            warn!("释放时刷写进度文件失败: {}", e);
        }
    }
}

fn load_entries(path: &Path) -> std::io::Result<BTreeMap<String, String>> {
    let reader = BufReader::new(File::open(path)?);
    serde_json::from_reader(reader)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

impl ProgressStore for FileProgressStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> UploadResult<()> {
        let mut entries = self.entries.lock();
        if entries.get(key).map(String::as_str) == Some(value) {
            return Ok(());
        }
        entries.insert(key.to_string(), value.to_string());
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn remove(&self, key: &str) -> UploadResult<()> {
        let mut entries = self.entries.lock();
        if entries.remove(key).is_some() {
            self.dirty.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn flush(&self) -> UploadResult<()> {
        self.write_entries()
    }
}

/// 根据配置创建存储
///
/// 文件存储在 tokio 运行时内打开时会启动后台刷写任务
pub fn open_store(config: &PersistenceConfig) -> UploadResult<Arc<dyn ProgressStore>> {
    let Some(path) = config.progress_file.as_deref() else {
        return Ok(Arc::new(MemoryProgressStore::new()));
    };

    let store = Arc::new(FileProgressStore::open(path)?);
    if tokio::runtime::Handle::try_current().is_ok() {
        store.start_flush_task(
            Duration::from_millis(config.flush_interval_ms),
            CancellationToken::new(),
        );
    } else {
        debug!("不在 tokio 运行时中，进度文件只在 flush / 释放时写入");
    }
    Ok(store)
}
