// 上传批次
//
// 负责管理一批文件的上传：
// - 上传前同步校验（类型 / 数量），失败时不创建任何会话、不发出任何请求
// - 文件级调度器限制同时上传的文件数，分片级调度器限制全部文件的并发分片数
// - 按路径复用 pending / paused 会话，实现断点续传
// - 单文件暂停（只取消目标会话的令牌）与整体暂停（两个调度器同时刹车）
//
// 两个调度器、取消句柄表与进度存储都是批次自身的字段，通过 BatchContext 显式传给会话。

use crate::config::AppConfig;
use crate::error::{UploadError, UploadResult};
use crate::persistence::{open_store, ProgressStore};
use crate::protocol::{ReqwestTransport, Transport, UploadApiClient};
use crate::uploader::progress::{ProgressCallback, ProgressSnapshot};
use crate::uploader::scheduler::ConcurrencyScheduler;
use crate::uploader::session::{BatchContext, UploadSession};
use crate::uploader::task::{FileInfo, SourceFile, UploadStatus};
use crate::uploader::validate::validate_files;
use dashmap::DashMap;
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// 单个文件的上传结果
#[derive(Debug, Clone)]
pub struct FileOutcome {
    /// 本地路径
    pub path: PathBuf,
    /// 文件元数据
    pub file: FileInfo,
    /// 成功时为最终快照（done 或 paused），失败时为错误
    pub result: UploadResult<ProgressSnapshot>,
}

impl FileOutcome {
    /// 是否已完成上传
    pub fn is_done(&self) -> bool {
        matches!(&self.result, Ok(snapshot) if snapshot.status == UploadStatus::Done)
    }
}

/// 上传批次
pub struct UploadBatch {
    /// 批次 ID（日志用）
    id: String,
    /// 文件级调度器
    file_scheduler: ConcurrencyScheduler,
    /// 会话共享资源（包含分片级调度器）
    ctx: Arc<BatchContext>,
    /// 所有会话（本地路径 -> 会话）
    sessions: DashMap<PathBuf, Arc<UploadSession>>,
}

impl UploadBatch {
    /// 创建上传批次
    ///
    /// # 参数
    /// * `config` - 应用配置
    /// * `transport` - 传输实现
    /// * `store` - 进度存储
    pub fn new(
        config: &AppConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn ProgressStore>,
    ) -> UploadResult<Self> {
        config.upload.validate()?;

        let id = uuid::Uuid::new_v4().to_string();
        let client = UploadApiClient::new(transport, config.request.clone());
        let ctx = Arc::new(BatchContext::new(client, config.upload.clone(), store));

        info!(
            "创建上传批次 {}: 分片模式={}, 分片大小={} bytes, 文件并发={}, 分片并发={}, 最大重试={}",
            id,
            config.upload.large_file_mode,
            config.upload.chunk_size,
            config.upload.max_file_uploads,
            config.upload.max_chunk_uploads,
            config.upload.max_retries
        );

        Ok(Self {
            id,
            file_scheduler: ConcurrencyScheduler::new("files", config.upload.max_file_uploads),
            ctx,
            sessions: DashMap::new(),
        })
    }

    /// 使用 HTTP 传输和配置中的进度存储创建批次
    pub fn from_config(config: &AppConfig) -> UploadResult<Self> {
        let transport = Arc::new(ReqwestTransport::new(config.request.success_code)?);
        let store = open_store(&config.persistence)?;
        Self::new(config, transport, store)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// 上传本地文件
    ///
    /// 读取文件元数据后委托给 [`UploadBatch::start_upload_files`]
    pub async fn start_upload(
        &self,
        paths: &[PathBuf],
        callback: Option<ProgressCallback>,
    ) -> UploadResult<Vec<FileOutcome>> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            files.push(SourceFile::from_path(path).await?);
        }
        self.start_upload_files(files, callback).await
    }

    /// 上传一批文件
    ///
    /// 校验失败时立即返回 `Validation` 错误；否则等待所有会话到达 done / paused / error
    ///
    /// # 返回
    /// 与输入顺序一致的单文件结果
    pub async fn start_upload_files(
        &self,
        files: Vec<SourceFile>,
        callback: Option<ProgressCallback>,
    ) -> UploadResult<Vec<FileOutcome>> {
        validate_files(
            &files,
            &self.ctx.upload.accept,
            self.ctx.upload.multiple_num,
        )?;

        info!("[批次 {}] 开始上传 {} 个文件", self.id, files.len());

        let runs = files.into_iter().map(|file| {
            let path = file.path.clone();
            let info = file.info.clone();
            let session = self.session_for(file);
            let callback = callback.clone();
            let file_scheduler = self.file_scheduler.clone();

            async move {
                let result = match session.prepare_run() {
                    Some(token) => {
                        let run_session = session.clone();
                        let run_callback = callback.clone();
                        let run = file_scheduler.submit_with_token(
                            async move { run_session.start(run_callback).await },
                            Some(token),
                        );
                        match run.await {
                            // 在文件级调度器中被丢弃或跳过
                            Err(UploadError::Cancelled) => {
                                Ok(session.settle_discarded(callback.as_ref()))
                            }
                            other => other,
                        }
                    }
                    None => Err(UploadError::ProtocolViolation(format!(
                        "文件正在上传中: {} ({})",
                        info.name,
                        session.status()
                    ))),
                };
                FileOutcome {
                    path,
                    file: info,
                    result,
                }
            }
        });

        let outcomes = join_all(runs).await;

        let done = outcomes.iter().filter(|o| o.is_done()).count();
        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        info!(
            "[批次 {}] 本轮结束: 完成 {}, 失败 {}, 暂停 {}",
            self.id,
            done,
            failed,
            outcomes.len() - done - failed
        );

        Ok(outcomes)
    }

    /// 获取可复用的会话，或为文件创建新会话
    ///
    /// pending / paused 以及正在运行的会话按路径复用；done / error 的会话被替换
    fn session_for(&self, file: SourceFile) -> Arc<UploadSession> {
        let mut entry = self
            .sessions
            .entry(file.path.clone())
            .or_insert_with(|| Arc::new(UploadSession::new(file.clone(), self.ctx.clone())));

        if entry.status().is_terminal() {
            *entry = Arc::new(UploadSession::new(file, self.ctx.clone()));
        }
        entry.clone()
    }

    /// 暂停指定文件
    ///
    /// 只取消目标会话；返回时取消信号已发出
    ///
    /// # 返回
    /// 实际被暂停的会话数
    pub fn pause_upload(&self, paths: &[PathBuf]) -> usize {
        let mut paused = 0;
        for path in paths {
            match self.sessions.get(path) {
                Some(session) => {
                    if session.pause() {
                        paused += 1;
                    }
                }
                None => warn!("[批次 {}] 暂停失败，会话不存在: {:?}", self.id, path),
            }
        }
        paused
    }

    /// 按内容哈希暂停正在运行的会话
    pub fn pause_by_hash(&self, file_hash: &str) -> bool {
        let Some(session_id) = self
            .ctx
            .cancel_handles
            .get(file_hash)
            .map(|entry| entry.value().session_id.clone())
        else {
            return false;
        };

        self.sessions
            .iter()
            .find(|entry| entry.value().id() == session_id)
            .map(|entry| entry.value().clone())
            .is_some_and(|session| session.pause())
    }

    /// 整体暂停：两个调度器都拒绝新任务并丢弃排队任务
    ///
    /// 已经在运行的分片继续执行；受影响的会话最终以 paused 结束
    ///
    /// # 返回
    /// 被丢弃的排队任务数
    pub fn pause_all(&self) -> usize {
        let dropped = self.file_scheduler.pause() + self.ctx.chunk_scheduler.pause();
        info!("[批次 {}] ⏸ 整体暂停，丢弃 {} 个排队任务", self.id, dropped);
        dropped
    }

    /// 解除整体暂停
    ///
    /// 被丢弃的任务不会自动恢复，需要再次调用 start_upload
    pub fn resume_all(&self) {
        self.file_scheduler.resume();
        self.ctx.chunk_scheduler.resume();
        info!("[批次 {}] ▶ 解除整体暂停", self.id);
    }

    /// 动态调整最大同时上传文件数
    pub fn update_max_file_uploads(&self, new_max: usize) {
        self.file_scheduler.update_max(new_max);
    }

    /// 动态调整最大同时上传分片数
    pub fn update_max_chunk_uploads(&self, new_max: usize) {
        self.ctx.chunk_scheduler.update_max(new_max);
    }

    /// 查询会话
    pub fn session(&self, path: &Path) -> Option<Arc<UploadSession>> {
        self.sessions.get(path).map(|entry| entry.value().clone())
    }

    /// 所有会话的进度快照
    pub fn snapshots(&self) -> Vec<ProgressSnapshot> {
        self.sessions
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect()
    }

    /// 清除已完成的会话
    ///
    /// # 返回
    /// 被清除的会话数
    pub fn clear_completed(&self) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| session.status() != UploadStatus::Done);
        let removed = before - self.sessions.len();
        if removed > 0 {
            info!("[批次 {}] 清除 {} 个已完成的会话", self.id, removed);
        }
        removed
    }

    /// 立即写出尚未落盘的进度记录
    pub fn flush_progress(&self) -> UploadResult<()> {
        self.ctx.store.flush()
    }

    /// 文件级调度器
    pub fn file_scheduler(&self) -> &ConcurrencyScheduler {
        &self.file_scheduler
    }

    /// 分片级调度器
    pub fn chunk_scheduler(&self) -> &ConcurrencyScheduler {
        &self.ctx.chunk_scheduler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportErrorKind;
    use crate::persistence::MemoryProgressStore;
    use crate::protocol::transport::MockTransport;
    use crate::uploader::progress::ProgressEvent;
    use parking_lot::Mutex;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    fn write_files(dir: &TempDir, specs: &[(&str, usize)]) -> Vec<PathBuf> {
        specs
            .iter()
            .enumerate()
            .map(|(n, (name, size))| {
                let path = dir.path().join(name);
                let mut file = std::fs::File::create(&path).unwrap();
                // 内容互不相同，避免哈希相同
                let content: Vec<u8> = (0..*size).map(|i| ((i + n * 7) % 256) as u8).collect();
                file.write_all(&content).unwrap();
                file.write_all(name.as_bytes()).unwrap();
                path
            })
            .collect()
    }

    fn batch_with(mock: Arc<MockTransport>, tweak: impl FnOnce(&mut AppConfig)) -> UploadBatch {
        let mut config = AppConfig::default();
        config.upload.chunk_size = 4;
        config.upload.max_file_uploads = 2;
        config.upload.max_chunk_uploads = 2;
        config.upload.max_retries = 0;
        tweak(&mut config);
        UploadBatch::new(&config, mock, Arc::new(MemoryProgressStore::new())).unwrap()
    }

    #[tokio::test]
    async fn test_batch_uploads_all_files() {
        let dir = TempDir::new().unwrap();
        let paths = write_files(&dir, &[("a.bin", 10), ("b.bin", 20), ("c.bin", 0)]);
        let mock = Arc::new(MockTransport::new());
        let batch = batch_with(mock.clone(), |_| {});

        let outcomes = batch.start_upload(&paths, None).await.unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| o.is_done()));
        assert_eq!(outcomes[0].path, paths[0]);
        assert_eq!(mock.merges(), 3);
        assert!(mock.peak_in_flight() <= 2);
        assert!(batch.file_scheduler().peak() <= 2);
        assert!(batch.chunk_scheduler().peak() <= 2);
    }

    #[tokio::test]
    async fn test_validation_rejects_before_network() {
        let dir = TempDir::new().unwrap();
        let paths = write_files(&dir, &[("a.png", 4), ("b.exe", 4)]);
        let mock = Arc::new(MockTransport::new());
        let batch = batch_with(mock.clone(), |c| c.upload.accept = vec!["image/*".to_string()]);

        let err = batch.start_upload(&paths, None).await.unwrap_err();
        assert!(matches!(err, UploadError::Validation(ref m) if m.contains("b.exe")));
        assert!(mock.requests().is_empty());
        assert!(batch.snapshots().is_empty());
    }

    #[tokio::test]
    async fn test_file_count_limit() {
        let dir = TempDir::new().unwrap();
        let paths = write_files(&dir, &[("a.txt", 1), ("b.txt", 1)]);
        let mock = Arc::new(MockTransport::new());
        let batch = batch_with(mock.clone(), |c| c.upload.multiple_num = Some(1));

        assert!(matches!(
            batch.start_upload(&paths, None).await,
            Err(UploadError::Validation(_))
        ));
        assert!(mock.requests().is_empty());
    }

    #[tokio::test]
    async fn test_one_failure_does_not_abort_siblings() {
        let dir = TempDir::new().unwrap();
        // 分片 0 的第一次请求失败（不可重试），只影响先上传的文件
        let paths = write_files(&dir, &[("a.bin", 2), ("b.bin", 2)]);
        let mock = Arc::new(MockTransport::new().with_failing_chunk(
            0,
            TransportErrorKind::Forbidden,
            1,
        ));
        let batch = batch_with(mock.clone(), |c| c.upload.max_file_uploads = 1);

        let outcomes = batch.start_upload(&paths, None).await.unwrap();
        assert!(outcomes[0].result.is_err());
        assert!(outcomes[1].is_done());
        assert_eq!(mock.merges(), 1);

        // 失败的会话被新会话替换，再次上传可以完成
        let retry = batch.start_upload(&paths[..1], None).await.unwrap();
        assert!(retry[0].is_done());
    }

    #[tokio::test]
    async fn test_pause_upload_only_affects_target() {
        let dir = TempDir::new().unwrap();
        let paths = write_files(&dir, &[("slow.bin", 12), ("other.bin", 12)]);
        let mock = Arc::new(MockTransport::new().with_chunk_delay(Duration::from_millis(30)));
        let batch = Arc::new(batch_with(mock.clone(), |_| {}));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ProgressEvent>();
        let cb: ProgressCallback = Arc::new(move |event| {
            let _ = tx.send(event);
        });

        let runner = batch.clone();
        let run_paths = paths.clone();
        let handle = tokio::spawn(async move { runner.start_upload(&run_paths, Some(cb)).await });

        // 等到目标文件的第一个分片完成
        loop {
            let event = rx.recv().await.unwrap();
            if event.file().name == "slow.bin" && event.status() == UploadStatus::Uploading {
                break;
            }
        }
        assert_eq!(batch.pause_upload(&paths[..1]), 1);

        let outcomes = handle.await.unwrap().unwrap();
        let slow = outcomes[0].result.as_ref().unwrap();
        assert_eq!(slow.status, UploadStatus::Paused);
        assert!(outcomes[1].is_done());
        assert_eq!(mock.merges(), 1);

        // 再次上传复用暂停的会话
        let session_id = batch.session(&paths[0]).unwrap().id().to_string();
        let resumed = batch.start_upload(&paths[..1], None).await.unwrap();
        assert!(resumed[0].is_done());
        assert_eq!(batch.session(&paths[0]).unwrap().id(), session_id);
        assert_eq!(mock.merges(), 2);
    }

    #[tokio::test]
    async fn test_pause_all_settles_every_file() {
        let dir = TempDir::new().unwrap();
        let paths = write_files(&dir, &[("a.bin", 16), ("b.bin", 16), ("c.bin", 16)]);
        let mock = Arc::new(MockTransport::new().with_chunk_delay(Duration::from_millis(40)));
        let batch = Arc::new(batch_with(mock.clone(), |c| c.upload.max_file_uploads = 1));

        let events = Arc::new(Mutex::new(0usize));
        let counter = events.clone();
        let cb: ProgressCallback = Arc::new(move |_| *counter.lock() += 1);

        let runner = batch.clone();
        let run_paths = paths.clone();
        let handle = tokio::spawn(async move { runner.start_upload(&run_paths, Some(cb)).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(batch.pause_all() > 0);

        // 整体暂停后所有文件都会结束，不会永久等待
        let outcomes = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(outcomes.iter().all(|o| !o.is_done()));
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
        assert_eq!(mock.merges(), 0);

        batch.resume_all();
        let resumed = batch.start_upload(&paths, None).await.unwrap();
        assert!(resumed.iter().all(|o| o.is_done()));
        assert_eq!(mock.merges(), 3);
    }

    #[tokio::test]
    async fn test_pause_by_hash() {
        let dir = TempDir::new().unwrap();
        let paths = write_files(&dir, &[("a.bin", 16)]);
        let mock = Arc::new(MockTransport::new().with_chunk_delay(Duration::from_millis(30)));
        let batch = Arc::new(batch_with(mock.clone(), |_| {}));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ProgressEvent>();
        let cb: ProgressCallback = Arc::new(move |event| {
            let _ = tx.send(event);
        });

        let runner = batch.clone();
        let run_paths = paths.clone();
        let handle = tokio::spawn(async move { runner.start_upload(&run_paths, Some(cb)).await });

        let hash = loop {
            let event = rx.recv().await.unwrap();
            if let Some(hash) = event.file_hash() {
                break hash.to_string();
            }
        };
        assert!(batch.pause_by_hash(&hash));
        assert!(!batch.pause_by_hash("unknown"));

        let outcomes = handle.await.unwrap().unwrap();
        assert_eq!(outcomes[0].result.as_ref().unwrap().status, UploadStatus::Paused);
    }

    #[tokio::test]
    async fn test_direct_mode_batch() {
        let dir = TempDir::new().unwrap();
        let paths = write_files(&dir, &[("a.txt", 10), ("b.txt", 10)]);
        let mock = Arc::new(MockTransport::new());
        let batch = batch_with(mock.clone(), |c| c.upload.large_file_mode = false);

        let outcomes = batch.start_upload(&paths, None).await.unwrap();
        assert!(outcomes.iter().all(|o| o.is_done()));
        assert_eq!(mock.directs(), 2);
        assert_eq!(mock.chunk_attempts(), 0);
    }

    #[tokio::test]
    async fn test_clear_completed() {
        let dir = TempDir::new().unwrap();
        let paths = write_files(&dir, &[("a.bin", 3)]);
        let batch = batch_with(Arc::new(MockTransport::new()), |_| {});

        batch.start_upload(&paths, None).await.unwrap();
        assert_eq!(batch.snapshots().len(), 1);
        assert_eq!(batch.clear_completed(), 1);
        assert!(batch.session(&paths[0]).is_none());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = AppConfig::default();
        config.upload.max_file_uploads = 0;
        let result = UploadBatch::new(
            &config,
            Arc::new(MockTransport::new()),
            Arc::new(MemoryProgressStore::new()),
        );
        assert!(matches!(result, Err(UploadError::InvalidConfig(_))));
    }
}
