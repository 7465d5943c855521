// 上传会话
//
// 单个文件一轮上传的状态机：
// pending -> hashing -> checking -(秒传命中)-> done
// checking -(断点检查：已全部上传)-> merging -> done
// checking -(部分 / 未上传)-> uploading -> merging -> done
// uploading -(分片失败)-> error
// uploading -(暂停)-> paused -(再次 start)-> hashing/checking ...
//
// 并发模型：
// - 所有分片提交到批次共享的分片级调度器（按提交顺序 FIFO 派发）
// - 分片完成顺序不确定，结果统一由会话循环串行处理，已上传字节只做加法且按索引去重
// - 每轮运行持有独立的取消令牌：暂停时中止进行中的请求，并让排队中的分片被调度器跳过
// - 每轮运行带有递增的代号，旧一轮在收尾时不会改写新一轮的状态与取消句柄
// - 断点检查结果是唯一依据，本地记录的分片成功情况不跨轮次信任

use crate::config::UploadConfig;
use crate::error::{TransportErrorKind, UploadError, UploadResult};
use crate::persistence::{progress_key, ProgressStore};
use crate::protocol::{ApiEnvelope, UploadApiClient, UploadProgressFn};
use crate::uploader::chunk::{chunk_count, chunk_len, plan_chunks_async, ChunkDescriptor};
use crate::uploader::hash::hash_file;
use crate::uploader::progress::{
    percentage, ApiResult, ProgressCallback, ProgressEvent, ProgressSnapshot,
};
use crate::uploader::scheduler::ConcurrencyScheduler;
use crate::uploader::task::{FileInfo, SessionState, SourceFile, UploadStatus};
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =====================================================
// 重试配置
// =====================================================

/// 初始退避延迟（毫秒）
const INITIAL_BACKOFF_MS: u64 = 100;

/// 最大退避延迟（毫秒）
const MAX_BACKOFF_MS: u64 = 5000;

/// 限流时的额外等待时间（毫秒）
const RATE_LIMIT_BACKOFF_MS: u64 = 10000;

/// 计算指数退避延迟
///
/// # 延迟序列
/// - retry_count=0: 100ms
/// - retry_count=1: 200ms
/// - retry_count=2: 400ms
/// - retry_count=3: 800ms
/// - 最大: 5000ms
fn calculate_backoff_delay(retry_count: u32, error: &UploadError) -> u64 {
    let base_delay = INITIAL_BACKOFF_MS.saturating_mul(2u64.saturating_pow(retry_count));
    let delay = base_delay.min(MAX_BACKOFF_MS);

    // 限流时使用更长的等待时间
    if matches!(
        error,
        UploadError::Transport {
            kind: TransportErrorKind::RateLimited,
            ..
        }
    ) {
        delay.max(RATE_LIMIT_BACKOFF_MS)
    } else {
        delay
    }
}

/// 在取消令牌触发时提前结束
async fn cancellable<T>(
    token: &CancellationToken,
    fut: impl Future<Output = UploadResult<T>>,
) -> UploadResult<T> {
    tokio::select! {
        _ = token.cancelled() => Err(UploadError::Cancelled),
        result = fut => result,
    }
}

// =====================================================
// 批次共享上下文
// =====================================================

/// 批次内所有会话共享的资源
///
/// 由 UploadBatch 持有，显式传给每个会话
pub struct BatchContext {
    /// 协议客户端
    pub client: UploadApiClient,
    /// 分片级调度器（批次内所有文件共享）
    pub chunk_scheduler: ConcurrencyScheduler,
    /// 取消句柄表: content_hash -> 当前运行的取消句柄
    pub cancel_handles: DashMap<String, CancelHandle>,
    /// 进度存储
    pub store: Arc<dyn ProgressStore>,
    /// 上传配置
    pub upload: UploadConfig,
}

impl BatchContext {
    pub fn new(client: UploadApiClient, upload: UploadConfig, store: Arc<dyn ProgressStore>) -> Self {
        Self {
            client,
            chunk_scheduler: ConcurrencyScheduler::new("chunks", upload.max_chunk_uploads),
            cancel_handles: DashMap::new(),
            store,
            upload,
        }
    }
}

/// 正在运行的会话的取消句柄
#[derive(Debug, Clone)]
pub struct CancelHandle {
    pub session_id: String,
    pub generation: u64,
    pub token: CancellationToken,
}

// =====================================================
// 上传会话
// =====================================================

/// 一轮运行的标识
#[derive(Clone)]
struct RunSlot {
    generation: u64,
    token: CancellationToken,
}

/// 单文件上传会话
pub struct UploadSession {
    /// 会话 ID
    id: String,
    /// 源文件
    source: SourceFile,
    /// 可变状态
    state: Mutex<SessionState>,
    /// 当前运行（加锁顺序: state -> run）
    run: Mutex<RunSlot>,
    /// 批次共享资源
    ctx: Arc<BatchContext>,
}

impl std::fmt::Debug for UploadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("UploadSession")
            .field("id", &self.id)
            .field("file", &self.source.info.name)
            .field("status", &state.status)
            .field("uploaded_bytes", &state.uploaded_bytes)
            .finish()
    }
}

impl UploadSession {
    pub fn new(source: SourceFile, ctx: Arc<BatchContext>) -> Self {
        let total_size = source.size();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source,
            state: Mutex::new(SessionState::new(total_size)),
            run: Mutex::new(RunSlot {
                generation: 0,
                token: CancellationToken::new(),
            }),
            ctx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> &SourceFile {
        &self.source
    }

    pub fn status(&self) -> UploadStatus {
        self.state.lock().status
    }

    pub fn content_hash(&self) -> Option<String> {
        self.state.lock().content_hash.clone()
    }

    /// 当前状态副本
    pub fn state(&self) -> SessionState {
        self.state.lock().clone()
    }

    /// 当前进度快照
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot::from_state(&self.source.info, &self.state.lock())
    }

    /// 准备新一轮运行
    ///
    /// 只有 pending / paused 的会话可以启动；返回本轮的取消令牌
    pub fn prepare_run(&self) -> Option<CancellationToken> {
        let mut state = self.state.lock();
        if !state.status.can_start() {
            return None;
        }
        state.status = UploadStatus::Pending;
        state.error = None;

        let mut run = self.run.lock();
        run.generation += 1;
        run.token = CancellationToken::new();
        Some(run.token.clone())
    }

    /// 执行一轮上传
    ///
    /// # 返回
    /// - `Ok(snapshot)`: 本轮结束于 done 或 paused
    /// - `Err(e)`: 本轮失败，会话状态为 error
    pub async fn start(&self, callback: Option<ProgressCallback>) -> UploadResult<ProgressSnapshot> {
        let run = self.run.lock().clone();
        let callback = callback.as_ref();

        let result = if self.ctx.upload.large_file_mode {
            self.run_chunked(&run, callback).await
        } else {
            self.run_direct(&run, callback).await
        };

        let outcome = match result {
            Ok(snapshot) => Ok(snapshot),
            Err(UploadError::Cancelled) => Ok(self.settle_paused(&run, callback)),
            Err(e) => self.fail(e, &run, callback),
        };
        self.unregister(&run);
        outcome
    }

    /// 暂停会话
    ///
    /// 中止本会话进行中的请求，排队中的分片会被调度器跳过；不影响其它会话
    ///
    /// # 返回
    /// 会话处于可暂停状态时返回 true
    pub fn pause(&self) -> bool {
        let token = {
            let mut state = self.state.lock();
            match state.status {
                UploadStatus::Pending
                | UploadStatus::Hashing
                | UploadStatus::Checking
                | UploadStatus::Uploading => state.mark_paused(),
                _ => return false,
            }
            // 与 prepare_run 互斥，取到的一定是被暂停这一轮的令牌
            self.run.lock().token.clone()
        };
        token.cancel();
        let purged = self.ctx.chunk_scheduler.purge_cancelled();

        info!(
            "⏸ 暂停上传: {} (清理 {} 个排队分片)",
            self.source.name(),
            purged
        );
        true
    }

    /// 任务在文件级调度器中被丢弃时的收尾
    pub(crate) fn settle_discarded(&self, callback: Option<&ProgressCallback>) -> ProgressSnapshot {
        let run = self.run.lock().clone();
        self.settle_paused(&run, callback)
    }

    // =====================================================
    // 分片上传路径
    // =====================================================

    async fn run_chunked(
        &self,
        run: &RunSlot,
        callback: Option<&ProgressCallback>,
    ) -> UploadResult<ProgressSnapshot> {
        let token = &run.token;
        let hash = self.ensure_hash(run).await?;
        self.advance(run, |state| {
            state.mark_checking();
            self.register(&hash, run);
        })?;

        // 1. 秒传
        let dedup = cancellable(token, self.ctx.client.dedup_lookup(&hash)).await?;
        if dedup.exists {
            info!("⚡ 秒传成功: {} (hash={})", self.source.name(), hash);
            self.advance(run, |state| {
                state.resource = dedup.resource.clone();
                state.mark_done();
            })?;
            self.clear_progress(&hash);
            return Ok(self.emit(callback, ApiResult::from(&dedup.envelope)));
        }

        // 2. 断点检查（唯一依据）
        let remote = cancellable(token, self.ctx.client.check_uploaded(&hash)).await?;
        let chunk_size = self.ctx.upload.chunk_size;
        let total_size = self.source.size();
        let total_chunks = chunk_count(total_size, chunk_size);

        let excluded: HashSet<usize> = remote.into_iter().filter(|i| *i < total_chunks).collect();
        let remote_bytes: u64 = excluded
            .iter()
            .filter_map(|i| chunk_len(total_size, chunk_size, *i))
            .sum();

        self.advance(run, |state| {
            state.uploaded_chunks = excluded.iter().copied().collect();
            state.uploaded_bytes = remote_bytes;
        })?;

        info!(
            "断点检查完成: {} 已上传 {}/{} 个分片 ({} / {} bytes)",
            self.source.name(),
            excluded.len(),
            total_chunks,
            remote_bytes,
            total_size
        );

        // 3. 上传剩余分片
        if remote_bytes < total_size {
            self.advance(run, |state| state.mark_uploading())?;
            self.upload_remaining(&hash, excluded, total_chunks, run, callback)
                .await?;
        }

        // 4. 合并
        self.merge(&hash, run, callback).await
    }

    /// 计算内容哈希（每个会话只计算一次）
    async fn ensure_hash(&self, run: &RunSlot) -> UploadResult<String> {
        let cached = self.state.lock().content_hash.clone();
        if let Some(hash) = cached {
            return Ok(hash);
        }

        self.advance(run, |state| state.mark_hashing())?;
        let hash = cancellable(&run.token, hash_file(&self.source.path)).await?;
        debug!("文件哈希: {} -> {}", self.source.name(), hash);

        self.state.lock().content_hash = Some(hash.clone());
        Ok(hash)
    }

    /// 提交并等待剩余分片
    async fn upload_remaining(
        &self,
        hash: &str,
        excluded: HashSet<usize>,
        total_chunks: usize,
        run: &RunSlot,
        callback: Option<&ProgressCallback>,
    ) -> UploadResult<()> {
        let token = &run.token;
        let chunks =
            plan_chunks_async(self.source.size(), self.ctx.upload.chunk_size, excluded).await?;

        info!(
            "[分片上传] {} 提交 {} 个分片 (共 {} 个)",
            self.source.name(),
            chunks.len(),
            total_chunks
        );

        let mut pending: FuturesUnordered<_> = chunks
            .into_iter()
            .map(|chunk| {
                let job = ChunkJob {
                    client: self.ctx.client.clone(),
                    chunk,
                    path: self.source.path.clone(),
                    file_hash: hash.to_string(),
                    file: self.source.info.clone(),
                    total_chunks,
                    token: token.clone(),
                    max_retries: self.ctx.upload.max_retries,
                };
                self.ctx
                    .chunk_scheduler
                    .submit_with_token(upload_chunk_with_retry(job), Some(token.clone()))
            })
            .collect();

        let mut first_error: Option<UploadError> = None;
        let mut discarded = 0usize;

        while let Some(result) = pending.next().await {
            match result {
                Ok((chunk, envelope)) => self.record_chunk(hash, &chunk, &envelope, run, callback),
                Err(UploadError::Cancelled) => discarded += 1,
                Err(e) => {
                    if first_error.is_none() {
                        error!("[分片上传] {} 分片失败，停止该文件的其余分片: {}", self.source.name(), e);
                        token.cancel();
                        self.ctx.chunk_scheduler.purge_cancelled();
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if discarded > 0 || token.is_cancelled() {
            // 会话被暂停，或分片调度器整体暂停丢弃了排队分片
            return Err(UploadError::Cancelled);
        }
        Ok(())
    }

    /// 记录一个成功的分片
    fn record_chunk(
        &self,
        hash: &str,
        chunk: &ChunkDescriptor,
        envelope: &ApiEnvelope,
        run: &RunSlot,
        callback: Option<&ProgressCallback>,
    ) {
        let snapshot = {
            let mut state = self.state.lock();
            if !self.is_current(run) {
                return;
            }
            if state.uploaded_chunks.insert(chunk.index) {
                state.uploaded_bytes += chunk.size();
            }
            ProgressSnapshot::from_state(&self.source.info, &state)
        };

        debug!(
            "[分片#{}] ✓ {} 进度 {}% ({} / {} bytes)",
            chunk.index,
            self.source.name(),
            snapshot.percentage,
            snapshot.uploaded_bytes,
            self.source.size()
        );

        if let Err(e) = self
            .ctx
            .store
            .set(&progress_key(hash), &snapshot.percentage.to_string())
        {
            warn!("保存上传进度失败: {}", e);
        }

        if let Some(cb) = callback {
            cb(ProgressEvent::chunked(snapshot, ApiResult::from(envelope)));
        }
    }

    /// 合并分片（每轮最多一次）
    async fn merge(
        &self,
        hash: &str,
        run: &RunSlot,
        callback: Option<&ProgressCallback>,
    ) -> UploadResult<ProgressSnapshot> {
        {
            let mut state = self.state.lock();
            if state.status == UploadStatus::Paused || !self.is_current(run) {
                return Err(UploadError::Cancelled);
            }
            if state.uploaded_bytes < state.total_size {
                return Err(UploadError::ProtocolViolation(format!(
                    "字节未全部确认就请求合并: {} / {}",
                    state.uploaded_bytes, state.total_size
                )));
            }
            if state.merged {
                return Err(UploadError::ProtocolViolation("重复请求合并".to_string()));
            }
            state.merged = true;
            state.mark_merging();
        }

        let envelope = self.ctx.client.merge_chunks(hash, self.source.name()).await?;

        {
            let mut state = self.state.lock();
            state.resource = Some(envelope.data.clone());
            state.mark_done();
        }
        self.clear_progress(hash);

        info!("✓ 上传完成: {} (hash={})", self.source.name(), hash);
        Ok(self.emit(callback, ApiResult::from(&envelope)))
    }

    // =====================================================
    // 小文件直传路径
    // =====================================================

    async fn run_direct(
        &self,
        run: &RunSlot,
        callback: Option<&ProgressCallback>,
    ) -> UploadResult<ProgressSnapshot> {
        let hash = self.ensure_hash(run).await?;
        self.advance(run, |state| {
            state.mark_uploading();
            self.register(&hash, run);
        })?;
        self.emit(callback, ApiResult::empty());

        let on_progress: Option<UploadProgressFn> = callback.map(|cb| {
            let cb = cb.clone();
            let file = self.source.info.clone();
            let hash = hash.clone();
            let f: UploadProgressFn = Arc::new(move |sent: u64, total: u64| {
                cb(ProgressEvent::direct(
                    file.clone(),
                    Some(hash.clone()),
                    UploadStatus::Uploading,
                    percentage(sent, total, UploadStatus::Uploading),
                ));
            });
            f
        });

        let envelope = self
            .ctx
            .client
            .upload_direct(&self.source, &self.ctx.upload.accept, &run.token, on_progress)
            .await?;

        self.advance(run, |state| {
            state.resource = Some(envelope.data.clone());
            state.mark_done();
        })?;

        info!("✓ 直传完成: {}", self.source.name());
        Ok(self.emit(callback, ApiResult::from(&envelope)))
    }

    // =====================================================
    // 辅助方法
    // =====================================================

    /// 在未被暂停、且仍是当前一轮时推进状态
    fn advance(&self, run: &RunSlot, f: impl FnOnce(&mut SessionState)) -> UploadResult<()> {
        let mut state = self.state.lock();
        if state.status == UploadStatus::Paused || !self.is_current(run) {
            return Err(UploadError::Cancelled);
        }
        f(&mut state);
        Ok(())
    }

    /// 调用方需持有 state 锁，保证与 prepare_run 互斥
    fn is_current(&self, run: &RunSlot) -> bool {
        self.run.lock().generation == run.generation
    }

    /// 生成快照并发送进度事件
    fn emit(&self, callback: Option<&ProgressCallback>, api_res: ApiResult) -> ProgressSnapshot {
        let snapshot = self.snapshot();
        if let Some(cb) = callback {
            let event = if self.ctx.upload.large_file_mode {
                ProgressEvent::chunked(snapshot.clone(), api_res)
            } else {
                ProgressEvent::direct(
                    snapshot.file.clone(),
                    snapshot.hash.clone(),
                    snapshot.status,
                    snapshot.percentage,
                )
            };
            cb(event);
        }
        snapshot
    }

    /// 本轮以暂停结束
    ///
    /// 已被新一轮取代时不改动会话状态，也不发送事件，只返回一份 paused 快照
    fn settle_paused(&self, run: &RunSlot, callback: Option<&ProgressCallback>) -> ProgressSnapshot {
        {
            let mut state = self.state.lock();
            if !self.is_current(run) {
                debug!("上一轮运行已被取代: {}", self.source.name());
                let mut stale = state.clone();
                stale.status = UploadStatus::Paused;
                return ProgressSnapshot::from_state(&self.source.info, &stale);
            }
            if !state.status.is_terminal() {
                state.mark_paused();
            }
        }
        info!("上传已暂停: {}", self.source.name());
        self.emit(callback, ApiResult::empty())
    }

    fn fail(
        &self,
        error: UploadError,
        run: &RunSlot,
        callback: Option<&ProgressCallback>,
    ) -> UploadResult<ProgressSnapshot> {
        run.token.cancel();
        self.ctx.chunk_scheduler.purge_cancelled();

        {
            let mut state = self.state.lock();
            if !self.is_current(run) {
                drop(state);
                warn!("已暂停的上一轮运行出错: {}, 错误: {}", self.source.name(), error);
                return Ok(self.settle_paused(run, callback));
            }
            state.mark_failed(error.to_string());
        }

        error!("❌ 上传失败: {}, 错误: {}", self.source.name(), error);
        self.emit(callback, ApiResult::empty());
        Err(error)
    }

    fn register(&self, hash: &str, run: &RunSlot) {
        self.ctx.cancel_handles.insert(
            hash.to_string(),
            CancelHandle {
                session_id: self.id.clone(),
                generation: run.generation,
                token: run.token.clone(),
            },
        );
    }

    fn unregister(&self, run: &RunSlot) {
        if let Some(hash) = self.content_hash() {
            self.ctx.cancel_handles.remove_if(&hash, |_, handle| {
                handle.session_id == self.id && handle.generation == run.generation
            });
        }
    }

    fn clear_progress(&self, hash: &str) {
        if let Err(e) = self.ctx.store.remove(&progress_key(hash)) {
            warn!("清理上传进度失败: {}", e);
        }
    }
}

// =====================================================
// 独立的分片上传函数（在分片级调度器的槽位中运行）
// =====================================================

/// 分片任务参数
struct ChunkJob {
    client: UploadApiClient,
    chunk: ChunkDescriptor,
    path: PathBuf,
    file_hash: String,
    file: FileInfo,
    total_chunks: usize,
    token: CancellationToken,
    max_retries: u32,
}

/// 单分片上传（带重试）
///
/// # 返回
/// 分片描述与服务端响应
async fn upload_chunk_with_retry(job: ChunkJob) -> UploadResult<(ChunkDescriptor, ApiEnvelope)> {
    let ChunkJob {
        client,
        chunk,
        path,
        file_hash,
        file,
        total_chunks,
        token,
        max_retries,
    } = job;

    debug!(
        "[分片#{}] 开始上传 (范围: {}-{}, 大小: {} bytes)",
        chunk.index,
        chunk.start(),
        chunk.end(),
        chunk.size()
    );

    let data = chunk.read_payload(&path).await?;
    let mut last_error = None;

    for retry in 0..=max_retries {
        if token.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        match client
            .upload_chunk(&chunk, data.clone(), &file_hash, &file, total_chunks, &token)
            .await
        {
            Ok(envelope) => return Ok((chunk, envelope)),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) if !e.is_retriable() => {
                error!("[分片#{}] 上传失败（不可重试）: {}", chunk.index, e);
                return Err(e);
            }
            Err(e) => {
                if retry < max_retries {
                    let backoff_ms = calculate_backoff_delay(retry, &e);
                    warn!(
                        "[分片#{}] 上传失败，等待 {}ms 后重试 ({}/{}): {}",
                        chunk.index,
                        backoff_ms,
                        retry + 1,
                        max_retries,
                        e
                    );
                    tokio::select! {
                        _ = token.cancelled() => return Err(UploadError::Cancelled),
                        _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                    }
                }
                last_error = Some(e);
            }
        }
    }

    error!(
        "[分片#{}] 上传失败，已达最大重试次数 ({})",
        chunk.index, max_retries
    );
    Err(last_error.unwrap_or_else(|| UploadError::ProtocolViolation("分片未执行上传".to_string())))
}
