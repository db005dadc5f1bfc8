// 上传分片调度器
//
// 功能：
// - 按给定顺序准入分片任务，同时在途数量不超过 max
// - 每个分片独立的重试计数，失败立即重试
// - 任一分片耗尽重试次数后立即取消其余在途分片（fail-fast）
// - 槽位池管理线程ID（日志追踪）
// - 按任务登记在途槽位，暂停时可一次性中止

use crate::uploader::TransportError;
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// =====================================================
// 重试配置
// =====================================================

/// 默认最大重试次数（首次之外）
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// 单个分片的剩余重试次数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    remaining: u32,
}

impl RetryBudget {
    pub fn new(retries: u32) -> Self {
        Self { remaining: retries }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// 消耗一次重试机会，已耗尽时返回 false
    pub fn try_consume(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

// =====================================================
// 分片线程槽位池
// =====================================================

/// 分片线程槽位池
///
/// 为每个正在上传的分片分配一个唯一的槽位ID（1, 2, 3...max_slots）
/// 分片完成后归还槽位，确保同一时刻每个槽位只有一个分片在使用
#[derive(Debug)]
struct ChunkSlotPool {
    available_slots: Mutex<Vec<usize>>,
    max_slots: usize,
}

impl ChunkSlotPool {
    fn new(max_slots: usize) -> Self {
        // 从大到小入栈，pop 时先得到小的
        let slots: Vec<usize> = (1..=max_slots).rev().collect();
        Self {
            available_slots: Mutex::new(slots),
            max_slots,
        }
    }

    /// 获取一个空闲槽位，如果没有则返回备用ID
    fn acquire(&self) -> usize {
        self.available_slots.lock().pop().unwrap_or(self.max_slots + 1)
    }

    /// 归还槽位
    fn release(&self, slot_id: usize) {
        if slot_id <= self.max_slots {
            let mut slots = self.available_slots.lock();
            if !slots.contains(&slot_id) {
                slots.push(slot_id);
            }
        }
    }
}

// =====================================================
// 分片任务与执行槽位
// =====================================================

type ChunkOperation = dyn Fn() -> BoxFuture<'static, Result<(), TransportError>> + Send + Sync;

/// 一个可重复执行的分片上传操作
#[derive(Clone)]
pub struct ChunkJob {
    /// 分片序号（仅用于日志和错误报告）
    pub chunk_index: usize,
    operation: Arc<ChunkOperation>,
}

impl ChunkJob {
    pub fn new<F, Fut>(chunk_index: usize, operation: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TransportError>> + Send + 'static,
    {
        Self {
            chunk_index,
            operation: Arc::new(move || Box::pin(operation()) as BoxFuture<'static, _>),
        }
    }

    fn call(&self) -> BoxFuture<'static, Result<(), TransportError>> {
        (self.operation)()
    }
}

impl std::fmt::Debug for ChunkJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkJob")
            .field("chunk_index", &self.chunk_index)
            .finish()
    }
}

/// 一个在途分片的登记信息
#[derive(Debug, Clone)]
pub struct ExecutionSlot {
    pub slot_id: usize,
    pub chunk_index: usize,
    /// 第几次尝试（从 1 开始）
    pub attempt: u32,
    pub started_at: Instant,
}

struct RegisteredSlot {
    info: ExecutionSlot,
    abort_handle: AbortHandle,
}

/// 单个任务的执行状态
struct TaskExecution {
    /// 区分同一任务的前后两次运行
    run_id: Uuid,
    token: CancellationToken,
    slots: HashMap<usize, RegisteredSlot>,
}

/// 调度失败原因
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// 任务被暂停或取消
    #[error("上传已取消")]
    Cancelled,
    /// 分片耗尽重试次数
    #[error("分片 #{chunk_index} 尝试 {attempts} 次后仍失败: {source}")]
    ChunkFailed {
        chunk_index: usize,
        attempts: u32,
        source: TransportError,
    },
    /// 分片任务异常退出（panic）
    #[error("分片任务异常退出: {0}")]
    Aborted(String),
}

impl SchedulerError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SchedulerError::Cancelled)
    }
}

/// 单次尝试的结果：(任务下标, 槽位ID, 尝试次数, 结果)
type AttemptOutcome = (usize, usize, u32, Result<(), TransportError>);

// =====================================================
// 上传分片调度器
// =====================================================

/// 上传分片调度器
///
/// 调度器本身无状态地驱动每次 `run`，只在 `executions` 中登记在途槽位，
/// 供 `cancel_all` 从其他线程同步中止
#[derive(Debug, Clone)]
pub struct UploadChunkScheduler {
    executions: Arc<DashMap<String, TaskExecution>>,
    max_retries: u32,
}

impl std::fmt::Debug for TaskExecution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecution")
            .field("run_id", &self.run_id)
            .field("slots", &self.slots.len())
            .finish()
    }
}

impl Default for UploadChunkScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

impl UploadChunkScheduler {
    pub fn new(max_retries: u32) -> Self {
        Self {
            executions: Arc::new(DashMap::new()),
            max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// 运行一组分片任务
    ///
    /// 所有任务成功后返回 Ok；任一任务耗尽重试次数时取消其余任务并返回错误；
    /// `parent_token` 被取消时中止全部在途任务并返回 `Cancelled`。
    /// 返回前会等待所有被中止的任务退出。
    pub async fn run(
        &self,
        task_id: &str,
        parent_token: &CancellationToken,
        jobs: Vec<ChunkJob>,
        max_concurrent: usize,
    ) -> Result<(), SchedulerError> {
        if jobs.is_empty() {
            debug!("上传任务 {} 无待上传分片", task_id);
            return Ok(());
        }
        if parent_token.is_cancelled() {
            return Err(SchedulerError::Cancelled);
        }

        let max = max_concurrent.max(1);
        let run_id = Uuid::new_v4();
        let token = parent_token.child_token();
        self.executions.insert(
            task_id.to_string(),
            TaskExecution {
                run_id,
                token: token.clone(),
                slots: HashMap::new(),
            },
        );

        info!(
            "上传任务 {} 开始调度: {} 个分片, 最大并发 {}, 重试次数 {}",
            task_id,
            jobs.len(),
            max,
            self.max_retries
        );

        let mut join_set = JoinSet::new();
        let result = self.drive(task_id, &token, &jobs, max, &mut join_set).await;

        if result.is_err() {
            token.cancel();
            join_set.abort_all();
        }
        // 等待被中止的任务真正退出，保证返回后没有残留连接
        while join_set.join_next().await.is_some() {}

        self.executions
            .remove_if(task_id, |_, execution| execution.run_id == run_id);

        result
    }

    async fn drive(
        &self,
        task_id: &str,
        token: &CancellationToken,
        jobs: &[ChunkJob],
        max: usize,
        join_set: &mut JoinSet<AttemptOutcome>,
    ) -> Result<(), SchedulerError> {
        let pool = ChunkSlotPool::new(max);
        let mut budgets = vec![RetryBudget::new(self.max_retries); jobs.len()];
        let mut next = 0;

        loop {
            self.admit(task_id, token, jobs, max, &pool, &mut next, join_set);

            let joined = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(SchedulerError::Cancelled),
                joined = join_set.join_next() => joined,
            };

            let Some(joined) = joined else {
                info!("上传任务 {} 所有分片上传完成", task_id);
                return Ok(());
            };

            let (job_idx, slot_id, attempt, outcome) = match joined {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => return Err(SchedulerError::Cancelled),
                Err(e) => return Err(SchedulerError::Aborted(e.to_string())),
            };
            let chunk_index = jobs[job_idx].chunk_index;

            match outcome {
                Ok(()) => {
                    self.release_slot(task_id, slot_id);
                    pool.release(slot_id);
                    debug!(
                        "[上传线程{}] ✓ 分片 #{} 上传成功 (第 {} 次尝试)",
                        slot_id, chunk_index, attempt
                    );
                }
                Err(e) if e.is_cancelled() => {
                    info!("[上传线程{}] 分片 #{} 因任务取消而中止", slot_id, chunk_index);
                    return Err(SchedulerError::Cancelled);
                }
                Err(_) if token.is_cancelled() => {
                    info!("[上传线程{}] 分片 #{} 失败时任务已取消，不再重试", slot_id, chunk_index);
                    return Err(SchedulerError::Cancelled);
                }
                Err(e) => {
                    if budgets[job_idx].try_consume() {
                        warn!(
                            "[上传线程{}] 分片 #{} 第 {} 次上传失败，立即重试 (剩余 {} 次): {}",
                            slot_id,
                            chunk_index,
                            attempt,
                            budgets[job_idx].remaining(),
                            e
                        );
                        // 沿用同一槽位
                        self.spawn_attempt(
                            task_id,
                            join_set,
                            &jobs[job_idx],
                            job_idx,
                            slot_id,
                            attempt + 1,
                        );
                    } else {
                        error!(
                            "[上传线程{}] 分片 #{} 重试次数耗尽，终止上传任务 {}: {}",
                            slot_id, chunk_index, task_id, e
                        );
                        return Err(SchedulerError::ChunkFailed {
                            chunk_index,
                            attempts: attempt,
                            source: e,
                        });
                    }
                }
            }
        }
    }

    /// 按顺序准入，直到占满并发上限；令牌已取消时不再准入
    fn admit(
        &self,
        task_id: &str,
        token: &CancellationToken,
        jobs: &[ChunkJob],
        max: usize,
        pool: &ChunkSlotPool,
        next: &mut usize,
        join_set: &mut JoinSet<AttemptOutcome>,
    ) -> usize {
        let mut admitted = 0;
        while join_set.len() < max && *next < jobs.len() && !token.is_cancelled() {
            let slot_id = pool.acquire();
            self.spawn_attempt(task_id, join_set, &jobs[*next], *next, slot_id, 1);
            *next += 1;
            admitted += 1;
        }
        admitted
    }

    fn spawn_attempt(
        &self,
        task_id: &str,
        join_set: &mut JoinSet<AttemptOutcome>,
        job: &ChunkJob,
        job_idx: usize,
        slot_id: usize,
        attempt: u32,
    ) {
        debug!(
            "[上传线程{}] 分片 #{} 获得线程资源，开始第 {} 次上传",
            slot_id, job.chunk_index, attempt
        );

        let future = job.call();
        let abort_handle = join_set.spawn(async move {
            let outcome = future.await;
            (job_idx, slot_id, attempt, outcome)
        });

        if let Some(mut execution) = self.executions.get_mut(task_id) {
            execution.slots.insert(
                slot_id,
                RegisteredSlot {
                    info: ExecutionSlot {
                        slot_id,
                        chunk_index: job.chunk_index,
                        attempt,
                        started_at: Instant::now(),
                    },
                    abort_handle,
                },
            );
        }
    }

    fn release_slot(&self, task_id: &str, slot_id: usize) {
        if let Some(mut execution) = self.executions.get_mut(task_id) {
            execution.slots.remove(&slot_id);
        }
    }

    /// 同步中止任务的全部在途分片，返回任务是否处于调度中
    pub fn cancel_all(&self, task_id: &str) -> bool {
        let Some((_, execution)) = self.executions.remove(task_id) else {
            return false;
        };

        execution.token.cancel();
        for slot in execution.slots.values() {
            slot.abort_handle.abort();
        }

        info!(
            "上传任务 {} 已取消，中止 {} 个在途分片",
            task_id,
            execution.slots.len()
        );
        true
    }

    /// 任务当前在途的槽位
    pub fn active_slots(&self, task_id: &str) -> Vec<ExecutionSlot> {
        let mut slots: Vec<ExecutionSlot> = self
            .executions
            .get(task_id)
            .map(|execution| {
                execution
                    .slots
                    .values()
                    .map(|slot| slot.info.clone())
                    .collect()
            })
            .unwrap_or_default();
        slots.sort_by_key(|slot| slot.slot_id);
        slots
    }

    /// 任务是否正在调度中
    pub fn is_running(&self, task_id: &str) -> bool {
        self.executions.contains_key(task_id)
    }
}
