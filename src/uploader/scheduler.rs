// 有界并发调度器
//
// 功能：
// - FIFO 队列，先提交的任务先派发
// - 同时运行的任务数不超过 max
// - 任何任务结束（成功、失败或 panic）都会归还槽位并重新触发派发
// - pause(): 拒绝新提交，丢弃所有尚未派发的任务（已派发的任务继续运行）
// - resume(): 清除暂停标记并重新派发
//
// 被丢弃或被跳过的任务会以 Cancelled 结束，调用方不会永久等待。
// 同一个批次中存在两个独立实例：文件级（限制同时上传的文件数）和分片级（限制全部文件的并发分片数）。

use crate::error::{UploadError, UploadResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// 排队中的任务
struct QueuedTask {
    job: Job,
    /// 任务所属会话的取消令牌；已取消的任务到达队首时直接跳过
    token: Option<CancellationToken>,
}

/// 调度器内部状态
struct SchedulerState {
    /// 最大并发数
    max: usize,
    /// 当前运行中的任务数
    current: usize,
    /// 待派发队列
    queue: VecDeque<QueuedTask>,
    /// 是否已暂停
    is_paused: bool,
    /// 历史最大并发数（观测用）
    peak: usize,
}

/// 有界并发调度器
#[derive(Clone)]
pub struct ConcurrencyScheduler {
    /// 调度器名称（日志用）
    name: Arc<str>,
    state: Arc<Mutex<SchedulerState>>,
}

impl std::fmt::Debug for ConcurrencyScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConcurrencyScheduler")
            .field("name", &self.name)
            .field("max", &state.max)
            .field("current", &state.current)
            .field("queued", &state.queue.len())
            .field("is_paused", &state.is_paused)
            .finish()
    }
}

/// 运行槽位守卫，Drop 时归还槽位（包括任务 panic 的情况）
struct SlotGuard {
    scheduler: ConcurrencyScheduler,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.scheduler.release_slot();
    }
}

impl ConcurrencyScheduler {
    /// 创建调度器
    ///
    /// # 参数
    /// * `name` - 调度器名称（"files" / "chunks"）
    /// * `max` - 最大并发数（为 0 时按 1 处理）
    pub fn new(name: &str, max: usize) -> Self {
        if max == 0 {
            warn!("调度器 [{}] 最大并发数为 0，按 1 处理", name);
        }
        let max = max.max(1);
        info!("创建并发调度器 [{}]: 最大并发数={}", name, max);

        Self {
            name: Arc::from(name),
            state: Arc::new(Mutex::new(SchedulerState {
                max,
                current: 0,
                queue: VecDeque::new(),
                is_paused: false,
                peak: 0,
            })),
        }
    }

    /// 提交任务
    ///
    /// 任务在调用时立即入队（保证 FIFO 顺序），返回的 future 在任务结束时完成。
    /// 暂停期间提交会立即以 Cancelled 结束，任务不会入队也不会运行。
    pub fn submit<F, T>(&self, task: F) -> impl Future<Output = UploadResult<T>> + Send + 'static
    where
        F: Future<Output = UploadResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.submit_with_token(task, None)
    }

    /// 提交带取消令牌的任务
    ///
    /// 令牌在任务派发前被取消时，任务被跳过并以 Cancelled 结束
    pub fn submit_with_token<F, T>(
        &self,
        task: F,
        token: Option<CancellationToken>,
    ) -> impl Future<Output = UploadResult<T>> + Send + 'static
    where
        F: Future<Output = UploadResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<UploadResult<T>>();

        let accepted = {
            let mut state = self.state.lock();
            if state.is_paused {
                false
            } else {
                let job: Job = Box::pin(async move {
                    let result = task.await;
                    let _ = tx.send(result);
                });
                state.queue.push_back(QueuedTask { job, token });
                true
            }
        };

        if accepted {
            self.dispatch();
        } else {
            debug!("调度器 [{}] 已暂停，拒绝新任务", self.name);
        }

        // 发送端被丢弃（暂停丢弃 / 令牌跳过 / 拒绝）时统一视为取消
        async move { rx.await.unwrap_or(Err(UploadError::Cancelled)) }
    }

    /// 派发循环：在容量允许时依次启动队首任务
    fn dispatch(&self) {
        let mut ready = Vec::new();
        let mut skipped = 0usize;
        {
            let mut state = self.state.lock();
            while state.current < state.max && !state.is_paused {
                let Some(queued) = state.queue.pop_front() else {
                    break;
                };
                if queued.token.as_ref().is_some_and(|t| t.is_cancelled()) {
                    skipped += 1;
                    continue;
                }
                state.current += 1;
                state.peak = state.peak.max(state.current);
                ready.push(queued.job);
            }
        }

        if skipped > 0 {
            debug!("调度器 [{}] 跳过 {} 个已取消的任务", self.name, skipped);
        }

        for job in ready {
            let guard = SlotGuard {
                scheduler: self.clone(),
            };
            tokio::spawn(async move {
                let _guard = guard;
                job.await;
            });
        }
    }

    /// 归还槽位并继续派发
    fn release_slot(&self) {
        {
            let mut state = self.state.lock();
            state.current = state.current.saturating_sub(1);
        }
        self.dispatch();
    }

    /// 暂停：拒绝新提交并丢弃所有未派发任务
    ///
    /// # 返回
    /// 被丢弃的任务数
    pub fn pause(&self) -> usize {
        let dropped = {
            let mut state = self.state.lock();
            state.is_paused = true;
            std::mem::take(&mut state.queue)
        };
        let count = dropped.len();
        // 在锁外释放，唤醒等待方
        drop(dropped);

        info!("调度器 [{}] 已暂停，丢弃 {} 个排队任务", self.name, count);
        count
    }

    /// 恢复：清除暂停标记并重新派发
    ///
    /// 暂停时丢弃的任务不会恢复，需要上层重新提交
    pub fn resume(&self) {
        self.state.lock().is_paused = false;
        info!("调度器 [{}] 已恢复", self.name);
        self.dispatch();
    }

    /// 立即丢弃令牌已取消的排队任务
    ///
    /// # 返回
    /// 被丢弃的任务数
    pub fn purge_cancelled(&self) -> usize {
        let removed: Vec<QueuedTask> = {
            let mut state = self.state.lock();
            let (cancelled, kept): (VecDeque<_>, VecDeque<_>) =
                std::mem::take(&mut state.queue)
                    .into_iter()
                    .partition(|q| q.token.as_ref().is_some_and(|t| t.is_cancelled()));
            state.queue = kept;
            cancelled.into_iter().collect()
        };

        if !removed.is_empty() {
            debug!(
                "调度器 [{}] 清理 {} 个已取消的排队任务",
                self.name,
                removed.len()
            );
        }
        removed.len()
    }

    /// 动态调整最大并发数
    pub fn update_max(&self, new_max: usize) {
        let new_max = new_max.max(1);
        let old_max = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.max, new_max)
        };
        info!("🔧 调度器 [{}] 最大并发数: {} -> {}", self.name, old_max, new_max);
        self.dispatch();
    }

    /// 调度器名称
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 最大并发数
    pub fn max(&self) -> usize {
        self.state.lock().max
    }

    /// 当前运行中的任务数
    pub fn active(&self) -> usize {
        self.state.lock().current
    }

    /// 排队中的任务数
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// 是否已暂停
    pub fn is_paused(&self) -> bool {
        self.state.lock().is_paused
    }

    /// 历史最大并发数
    pub fn peak(&self) -> usize {
        self.state.lock().peak
    }
}
