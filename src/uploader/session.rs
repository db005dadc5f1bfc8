// 单文件上传会话
//
// 流程：指纹 → 检查（秒传/已存分片）→ 分片 → 调度上传 → 合并
//
// 并发约定：
// - 分片和任务进度只通过 apply_chunk_update 修改，由同一把锁串行化
// - run_lock 在整个流程期间持有，resume 必须等上一轮完全退出后才能开始
// - 暂停是主动挂起，不计入失败或重试

use crate::config::UploadConfig;
use crate::protocol::MergeRequest;
use crate::uploader::{
    ChunkJob, ChunkTransport, ChunkUploadRequest, ContentFingerprinter, FingerprintMode,
    ProgressFn, SchedulerError, TransportError, UploadChunk, UploadChunkManager,
    UploadChunkScheduler, UploadTask, UploadTaskStatus, DEFAULT_MAX_RETRIES,
    DEFAULT_UPLOAD_CHUNK_SIZE,
};
use parking_lot::Mutex;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 默认单任务最大并发分片数
pub const DEFAULT_MAX_CONCURRENT_CHUNKS: usize = 4;

/// 会话配置
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub chunk_size: u64,
    pub max_concurrent: usize,
    pub max_retries: u32,
    pub fingerprint_mode: FingerprintMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
            max_concurrent: DEFAULT_MAX_CONCURRENT_CHUNKS,
            max_retries: DEFAULT_MAX_RETRIES,
            fingerprint_mode: FingerprintMode::Sampled,
        }
    }
}

impl From<&UploadConfig> for SessionConfig {
    fn from(config: &UploadConfig) -> Self {
        Self {
            chunk_size: config.chunk_size(),
            max_concurrent: config.max_concurrent_chunks,
            max_retries: config.max_retries,
            fingerprint_mode: config.fingerprint_mode,
        }
    }
}

/// 会话事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    /// 进度上升
    Progress { task_id: String, percent: u8 },
    /// 状态变化
    StatusChanged {
        task_id: String,
        status: UploadTaskStatus,
        error: Option<String>,
    },
}

/// 会话错误
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// 被暂停（不会对外作为失败返回）
    #[error("上传已暂停")]
    Cancelled,
    #[error("无法读取本地文件: {0}")]
    LocalFile(String),
    #[error("计算文件指纹失败: {0}")]
    Fingerprint(String),
    #[error("检查请求失败: {0}")]
    Verify(#[source] TransportError),
    #[error("分片划分失败: {0}")]
    Chunking(String),
    #[error("分片上传失败: {0}")]
    Upload(#[source] SchedulerError),
    #[error("合并请求失败: {0}")]
    Merge(#[source] TransportError),
    /// 当前状态不允许该操作
    #[error("{0}")]
    InvalidState(String),
}

impl SessionError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SessionError::Cancelled)
    }
}

/// 分片状态更新
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkUpdate {
    /// 开始一次新的尝试，该分片进度归零
    Begin,
    /// 本次尝试已发送的字节数
    Acked(u64),
    /// 接收端确认
    Completed,
}

/// 受同一把锁保护的会话状态
struct SessionState {
    task: UploadTask,
    /// 首次分片后保留，跨暂停/恢复复用
    chunks: Option<UploadChunkManager>,
    /// 当前一轮的取消令牌
    token: CancellationToken,
}

/// 分片任务共享的部分
struct SessionShared {
    task_id: String,
    state: Mutex<SessionState>,
    events: Option<mpsc::UnboundedSender<UploadEvent>>,
}

impl SessionShared {
    fn emit(&self, event: UploadEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn emit_status(&self, task: &UploadTask) {
        self.emit(UploadEvent::StatusChanged {
            task_id: self.task_id.clone(),
            status: task.status,
            error: task.error.clone(),
        });
    }

    /// 唯一的进度更新入口
    ///
    /// 进度事件在持锁期间发送，多个工作线程上的分片不会乱序上报
    fn apply_chunk_update(&self, index: usize, update: ChunkUpdate) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(manager) = state.chunks.as_mut() else {
            return;
        };

        match update {
            ChunkUpdate::Begin => {
                let attempt = manager.begin_attempt(index);
                if attempt > 1 {
                    debug!("分片 #{} 第 {} 次尝试，进度归零", index, attempt);
                }
            }
            ChunkUpdate::Acked(bytes) => manager.set_acked(index, bytes),
            ChunkUpdate::Completed => manager.mark_completed(index),
        }

        let derived = manager.percent();
        if state.task.advance_percent(derived) {
            self.emit(UploadEvent::Progress {
                task_id: self.task_id.clone(),
                percent: state.task.percent,
            });
        }
    }
}

/// 单文件上传会话
pub struct UploadSession {
    shared: Arc<SessionShared>,
    transport: Arc<dyn ChunkTransport>,
    scheduler: UploadChunkScheduler,
    config: SessionConfig,
    run_lock: tokio::sync::Mutex<()>,
    started: AtomicBool,
}

impl UploadSession {
    /// 为本地文件创建会话，任务初始状态为 uploading、进度 0
    pub fn new(
        local_path: impl Into<PathBuf>,
        transport: Arc<dyn ChunkTransport>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let local_path = local_path.into();
        let metadata = std::fs::metadata(&local_path)
            .map_err(|e| SessionError::LocalFile(format!("{:?}: {}", local_path, e)))?;
        if !metadata.is_file() {
            return Err(SessionError::LocalFile(format!("{:?} 不是文件", local_path)));
        }

        let name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let task = UploadTask::new(local_path, name, metadata.len());

        info!(
            "创建上传任务: id={}, 文件={}, 大小={} bytes",
            task.id, task.name, task.total_size
        );

        Ok(Self {
            shared: Arc::new(SessionShared {
                task_id: task.id.clone(),
                state: Mutex::new(SessionState {
                    task,
                    chunks: None,
                    token: CancellationToken::new(),
                }),
                events: None,
            }),
            transport,
            scheduler: UploadChunkScheduler::new(config.max_retries),
            config,
            run_lock: tokio::sync::Mutex::new(()),
            started: AtomicBool::new(false),
        })
    }

    /// 订阅进度与状态事件（须在 start 之前调用）
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<UploadEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.events = Some(tx);
        } else {
            warn!("会话已开始运行，无法订阅事件: {}", self.shared.task_id);
        }
        rx
    }

    /// 共享调度器（多个会话使用同一调度器时）
    pub fn with_scheduler(mut self, scheduler: UploadChunkScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn task_id(&self) -> &str {
        &self.shared.task_id
    }

    /// 任务快照
    pub fn snapshot(&self) -> UploadTask {
        self.shared.state.lock().task.clone()
    }

    /// 分片快照（尚未分片时为空）
    pub fn chunk_snapshot(&self) -> Vec<UploadChunk> {
        self.shared
            .state
            .lock()
            .chunks
            .as_ref()
            .map(|m| m.chunks().to_vec())
            .unwrap_or_default()
    }

    /// 外部更新分片进度的入口
    pub fn apply_chunk_update(&self, index: usize, update: ChunkUpdate) {
        self.shared.apply_chunk_update(index, update);
    }

    /// 开始上传，返回本轮结束时的状态（done 或 paused）
    pub async fn start(&self) -> Result<UploadTaskStatus, SessionError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SessionError::InvalidState("任务已启动".to_string()));
        }

        let _run = self.run_lock.lock().await;
        let token = {
            let state = self.shared.state.lock();
            if state.task.status != UploadTaskStatus::Uploading {
                return Ok(state.task.status);
            }
            state.token.clone()
        };
        self.run_pipeline(token).await
    }

    /// 暂停：停止准入并中止所有在途分片
    ///
    /// 仅对上传中的任务生效，返回是否发生了状态变化
    pub fn pause(&self) -> bool {
        {
            let mut state = self.shared.state.lock();
            if state.task.status != UploadTaskStatus::Uploading {
                return false;
            }
            state.task.mark_paused();
            state.token.cancel();
            self.shared.emit_status(&state.task);
        }

        self.scheduler.cancel_all(&self.shared.task_id);
        info!("上传任务 {} 已暂停", self.shared.task_id);
        true
    }

    /// 恢复：等待上一轮退出后重新检查并只上传缺失的分片
    pub async fn resume(&self) -> Result<UploadTaskStatus, SessionError> {
        self.ensure_paused()?;

        let _run = self.run_lock.lock().await;
        let token = {
            let mut state = self.shared.state.lock();
            // 等待期间可能已被另一次 resume 抢先
            if state.task.status != UploadTaskStatus::Paused {
                return Err(SessionError::InvalidState(format!(
                    "任务状态为 {:?}，无法恢复",
                    state.task.status
                )));
            }
            state.task.mark_uploading();
            state.token = CancellationToken::new();
            self.shared.emit_status(&state.task);
            state.token.clone()
        };

        info!("上传任务 {} 恢复上传", self.shared.task_id);
        self.started.store(true, Ordering::SeqCst);
        self.run_pipeline(token).await
    }

    fn ensure_paused(&self) -> Result<(), SessionError> {
        let status = self.shared.state.lock().task.status;
        match status {
            UploadTaskStatus::Paused => Ok(()),
            UploadTaskStatus::Uploading => {
                Err(SessionError::InvalidState("任务正在上传中".to_string()))
            }
            _ => Err(SessionError::InvalidState(format!(
                "任务已结束 ({:?})，无法恢复",
                status
            ))),
        }
    }

    async fn run_pipeline(
        &self,
        token: CancellationToken,
    ) -> Result<UploadTaskStatus, SessionError> {
        match self.execute(&token).await {
            Ok(()) => Ok(UploadTaskStatus::Done),
            Err(e) if e.is_cancelled() || token.is_cancelled() => {
                info!("上传任务 {} 本轮已停止（暂停）", self.shared.task_id);
                Ok(UploadTaskStatus::Paused)
            }
            Err(e) => {
                error!("上传任务 {} 失败: {}", self.shared.task_id, e);
                let mut state = self.shared.state.lock();
                state.task.mark_error(e.to_string());
                self.shared.emit_status(&state.task);
                Err(e)
            }
        }
    }

    /// 在取消令牌触发时放弃等待
    async fn cancellable<T>(
        token: &CancellationToken,
        future: impl Future<Output = T>,
    ) -> Result<T, SessionError> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(SessionError::Cancelled),
            output = future => Ok(output),
        }
    }

    async fn execute(&self, token: &CancellationToken) -> Result<(), SessionError> {
        let task_id = self.shared.task_id.clone();
        let (local_path, name, total_size, existing) = {
            let state = self.shared.state.lock();
            (
                state.task.local_path.clone(),
                state.task.name.clone(),
                state.task.total_size,
                state.task.fingerprint.clone(),
            )
        };

        // 1. 指纹只计算一次
        let fingerprint = match existing {
            Some(fingerprint) => fingerprint,
            None => {
                let fingerprint = Self::cancellable(
                    token,
                    ContentFingerprinter::calculate(&local_path, self.config.fingerprint_mode),
                )
                .await?
                .map_err(|e| SessionError::Fingerprint(format!("{:#}", e)))?;
                self.shared
                    .state
                    .lock()
                    .task
                    .set_fingerprint(fingerprint.clone());
                fingerprint
            }
        };
        info!("上传任务 {} 文件指纹: {}", task_id, fingerprint);

        // 2. 检查
        let verify = Self::cancellable(token, self.transport.verify(&name, &fingerprint))
            .await?
            .map_err(SessionError::Verify)?;

        if !verify.should_upload {
            let mut state = self.shared.state.lock();
            state.task.mark_rapid_upload_success();
            self.shared.emit(UploadEvent::Progress {
                task_id: task_id.clone(),
                percent: 100,
            });
            self.shared.emit_status(&state.task);
            info!("🚀 上传任务 {} 秒传成功: {}", task_id, name);
            return Ok(());
        }

        // 3. 分片（跨恢复复用），跳过接收端已有的分片
        let pending = self.prepare_chunks(&fingerprint, total_size, &verify.uploaded)?;

        // 4. 调度上传
        let jobs = pending
            .into_iter()
            .map(|chunk| self.chunk_job(chunk, &local_path, &name, &fingerprint, token))
            .collect();

        self.scheduler
            .run(&task_id, token, jobs, self.config.max_concurrent)
            .await
            .map_err(|e| {
                if e.is_cancelled() {
                    SessionError::Cancelled
                } else {
                    SessionError::Upload(e)
                }
            })?;

        if token.is_cancelled() {
            return Err(SessionError::Cancelled);
        }

        // 5. 合并（单次请求，失败即报错）
        let request = MergeRequest {
            filename: name.clone(),
            filehash: fingerprint.clone(),
            size: self.config.chunk_size,
            file_size: Some(total_size),
        };
        self.transport
            .merge(&request)
            .await
            .map_err(SessionError::Merge)?;

        let mut state = self.shared.state.lock();
        let reached = state.task.percent < 100;
        state.task.mark_done();
        if reached {
            self.shared.emit(UploadEvent::Progress {
                task_id: task_id.clone(),
                percent: 100,
            });
        }
        self.shared.emit_status(&state.task);
        info!("✓ 上传任务 {} 完成: {}", task_id, name);
        Ok(())
    }

    /// 建立（或复用）分片管理器，返回仍需上传的分片
    fn prepare_chunks(
        &self,
        fingerprint: &str,
        total_size: u64,
        stored: &[String],
    ) -> Result<Vec<UploadChunk>, SessionError> {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;

        if state.chunks.is_none() {
            let manager = UploadChunkManager::new(fingerprint, total_size, self.config.chunk_size)
                .map_err(|e| SessionError::Chunking(format!("{:#}", e)))?;
            state.chunks = Some(manager);
        }
        let Some(manager) = state.chunks.as_mut() else {
            return Err(SessionError::Chunking("分片管理器未初始化".to_string()));
        };

        let marked = manager.mark_stored(stored);
        let pending = manager.pending();
        info!(
            "上传任务 {}: 共 {} 个分片, 接收端已有 {} 个, 待上传 {} 个",
            self.shared.task_id,
            manager.chunk_count(),
            marked,
            pending.len()
        );

        // 已存分片直接计入进度
        let derived = manager.percent();
        if state.task.advance_percent(derived) {
            self.shared.emit(UploadEvent::Progress {
                task_id: self.shared.task_id.clone(),
                percent: state.task.percent,
            });
        }
        Ok(pending)
    }

    fn chunk_job(
        &self,
        chunk: UploadChunk,
        local_path: &Path,
        name: &str,
        fingerprint: &str,
        token: &CancellationToken,
    ) -> ChunkJob {
        let shared = self.shared.clone();
        let transport = self.transport.clone();
        let local_path = local_path.to_path_buf();
        let name = name.to_string();
        let fingerprint = fingerprint.to_string();
        let token = token.clone();
        let index = chunk.index;

        ChunkJob::new(index, move || {
            let shared = shared.clone();
            let transport = transport.clone();
            let local_path = local_path.clone();
            let name = name.clone();
            let fingerprint = fingerprint.clone();
            let token = token.clone();
            let chunk = chunk.clone();

            async move {
                shared.apply_chunk_update(chunk.index, ChunkUpdate::Begin);

                let data = chunk
                    .read_data(&local_path)
                    .await
                    .map_err(|e| TransportError::Local(format!("{:#}", e)))?;

                let progress_shared = shared.clone();
                let progress: ProgressFn = Arc::new(move |sent| {
                    progress_shared.apply_chunk_update(index, ChunkUpdate::Acked(sent));
                });

                transport
                    .upload_chunk(
                        ChunkUploadRequest {
                            filename: name,
                            fingerprint,
                            identity: chunk.identity.clone(),
                            data,
                        },
                        progress,
                        token,
                    )
                    .await?;

                shared.apply_chunk_update(chunk.index, ChunkUpdate::Completed);
                Ok(())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::VerifyResponse;
    use crate::storage::{merge_chunks, ChunkStore};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;

    const CHUNK: u64 = 1024;

    /// 内存中的接收端，直接调用 ChunkStore
    struct StoreTransport {
        store: ChunkStore,
        uploaded: Mutex<Vec<String>>,
        started: Mutex<Vec<String>>,
        verifies: AtomicUsize,
        merges: AtomicUsize,
        /// identity -> 剩余失败次数
        failures: Mutex<HashMap<String, u32>>,
        /// 序号不小于该值的分片阻塞直到取消
        hold_from: Mutex<Option<usize>>,
        fail_verify: bool,
        fail_merge: bool,
    }

    impl StoreTransport {
        fn new(dir: &Path) -> Self {
            Self {
                store: ChunkStore::new(dir),
                uploaded: Mutex::new(Vec::new()),
                started: Mutex::new(Vec::new()),
                verifies: AtomicUsize::new(0),
                merges: AtomicUsize::new(0),
                failures: Mutex::new(HashMap::new()),
                hold_from: Mutex::new(None),
                fail_verify: false,
                fail_merge: false,
            }
        }

        fn uploaded_indices(&self) -> Vec<usize> {
            let mut indices: Vec<usize> = self
                .uploaded
                .lock()
                .iter()
                .filter_map(|id| id.rsplit_once('-').and_then(|(_, i)| i.parse().ok()))
                .collect();
            indices.sort_unstable();
            indices
        }
    }

    fn status_error() -> TransportError {
        TransportError::Status {
            status: 500,
            body: "boom".to_string(),
        }
    }

    #[async_trait]
    impl ChunkTransport for StoreTransport {
        async fn verify(
            &self,
            filename: &str,
            fingerprint: &str,
        ) -> Result<VerifyResponse, TransportError> {
            self.verifies.fetch_add(1, Ordering::SeqCst);
            if self.fail_verify {
                return Err(status_error());
            }
            self.store
                .verify(filename, fingerprint)
                .await
                .map_err(|e| TransportError::Decode(e.to_string()))
        }

        async fn upload_chunk(
            &self,
            request: ChunkUploadRequest,
            progress: ProgressFn,
            cancel: CancellationToken,
        ) -> Result<String, TransportError> {
            self.started.lock().push(request.identity.clone());

            let index: usize = request
                .identity
                .rsplit_once('-')
                .and_then(|(_, i)| i.parse().ok())
                .unwrap_or(0);
            let hold = *self.hold_from.lock();
            if hold.is_some_and(|from| index >= from) {
                cancel.cancelled().await;
                return Err(TransportError::Cancelled);
            }

            {
                let mut failures = self.failures.lock();
                if let Some(left) = failures.get_mut(&request.identity) {
                    if *left > 0 {
                        *left -= 1;
                        progress(request.data.len() as u64 / 2);
                        return Err(status_error());
                    }
                }
            }

            progress(request.data.len() as u64);
            self.store
                .store(&request.fingerprint, &request.identity, &request.data)
                .await
                .map_err(|e| TransportError::Decode(e.to_string()))?;
            self.uploaded.lock().push(request.identity);
            Ok(crate::protocol::CHUNK_RECEIVED_BODY.to_string())
        }

        async fn merge(&self, request: &MergeRequest) -> Result<(), TransportError> {
            self.merges.fetch_add(1, Ordering::SeqCst);
            if self.fail_merge {
                return Err(status_error());
            }
            merge_chunks(&self.store, request, 4)
                .await
                .map(|_| ())
                .map_err(|e| TransportError::Decode(e.to_string()))
        }
    }

    fn test_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 253) as u8).collect()
    }

    fn config(max_concurrent: usize) -> SessionConfig {
        SessionConfig {
            chunk_size: CHUNK,
            max_concurrent,
            max_retries: 3,
            fingerprint_mode: FingerprintMode::Sampled,
        }
    }

    fn write_source(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    async fn final_file(store_dir: &Path, path: &Path) -> Vec<u8> {
        let fp = ContentFingerprinter::calculate(path, FingerprintMode::Sampled)
            .await
            .unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        let final_path = ChunkStore::new(store_dir).final_path(name, &fp).unwrap();
        std::fs::read(final_path).unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_sizes() {
        for size in [0, 100, 4 * CHUNK as usize, 4 * CHUNK as usize + 17] {
            let src = TempDir::new().unwrap();
            let dst = TempDir::new().unwrap();
            let data = test_data(size);
            let path = write_source(&src, "movie.mp4", &data);

            let transport = Arc::new(StoreTransport::new(dst.path()));
            let session = UploadSession::new(&path, transport.clone(), config(3)).unwrap();
            assert_eq!(session.snapshot().status, UploadTaskStatus::Uploading);
            assert_eq!(session.snapshot().percent, 0);

            let status = session.start().await.unwrap();
            assert_eq!(status, UploadTaskStatus::Done);
            assert_eq!(session.snapshot().percent, 100);
            assert_eq!(transport.merges.load(Ordering::SeqCst), 1);
            assert_eq!(final_file(dst.path(), &path).await, data, "size {}", size);
        }
    }

    #[tokio::test]
    async fn test_progress_events_are_monotonic() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let path = write_source(&src, "a.bin", &test_data(8 * CHUNK as usize));

        let transport = Arc::new(StoreTransport::new(dst.path()));
        let mut session = UploadSession::new(&path, transport, config(4)).unwrap();
        let mut rx = session.subscribe();

        session.start().await.unwrap();
        drop(session);

        let mut percents = Vec::new();
        let mut statuses = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                UploadEvent::Progress { percent, .. } => percents.push(percent),
                UploadEvent::StatusChanged { status, .. } => statuses.push(status),
            }
        }

        assert!(!percents.is_empty());
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(percents.last(), Some(&100));
        assert_eq!(statuses.last(), Some(&UploadTaskStatus::Done));
    }

    /// 逐字节上报进度的接收端，不落盘
    struct TickingTransport;

    #[async_trait]
    impl ChunkTransport for TickingTransport {
        async fn verify(&self, _: &str, _: &str) -> Result<VerifyResponse, TransportError> {
            Ok(VerifyResponse::pending(Vec::new()))
        }

        async fn upload_chunk(
            &self,
            request: ChunkUploadRequest,
            progress: ProgressFn,
            _cancel: CancellationToken,
        ) -> Result<String, TransportError> {
            for sent in 1..=request.data.len() as u64 {
                progress(sent);
                if sent % 32 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            Ok(crate::protocol::CHUNK_RECEIVED_BODY.to_string())
        }

        async fn merge(&self, _: &MergeRequest) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_progress_never_decreases_across_worker_threads() {
        let src = TempDir::new().unwrap();
        let transport: Arc<dyn ChunkTransport> = Arc::new(TickingTransport);
        let session_config = SessionConfig {
            chunk_size: 256,
            ..config(16)
        };

        let mut handles = Vec::new();
        for i in 0..24 {
            let path = write_source(&src, &format!("f{}.bin", i), &test_data(200 * 256));
            let mut session =
                UploadSession::new(&path, transport.clone(), session_config.clone()).unwrap();
            let rx = session.subscribe();
            handles.push(tokio::spawn(async move {
                let status = session.start().await.unwrap();
                drop(session);
                (status, rx)
            }));
        }

        for handle in handles {
            let (status, mut rx) = handle.await.unwrap();
            assert_eq!(status, UploadTaskStatus::Done);

            let mut percents = Vec::new();
            while let Some(event) = rx.recv().await {
                if let UploadEvent::Progress { percent, .. } = event {
                    percents.push(percent);
                }
            }
            assert!(
                percents.windows(2).all(|w| w[0] < w[1]),
                "progress went backwards: {:?}",
                percents
            );
            assert_eq!(percents.last(), Some(&100));
        }
    }

    #[tokio::test]
    async fn test_resume_uploads_only_missing_chunks() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let data = test_data(4 * CHUNK as usize + 10);
        let path = write_source(&src, "a.bin", &data);

        // 接收端已有分片 0 和 2（乱序到达）
        let fp = ContentFingerprinter::calculate(&path, FingerprintMode::Sampled)
            .await
            .unwrap();
        let store = ChunkStore::new(dst.path());
        for index in [2usize, 0] {
            let start = index * CHUNK as usize;
            store
                .store(&fp, &format!("{}-{}", fp, index), &data[start..start + CHUNK as usize])
                .await
                .unwrap();
        }

        let transport = Arc::new(StoreTransport::new(dst.path()));
        let session = UploadSession::new(&path, transport.clone(), config(2)).unwrap();
        session.start().await.unwrap();

        assert_eq!(transport.uploaded_indices(), vec![1, 3, 4]);
        assert_eq!(final_file(dst.path(), &path).await, data);
    }

    #[tokio::test]
    async fn test_existing_file_skips_upload_and_merge() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let path = write_source(&src, "a.bin", &test_data(3 * CHUNK as usize));

        let first = Arc::new(StoreTransport::new(dst.path()));
        UploadSession::new(&path, first, config(2))
            .unwrap()
            .start()
            .await
            .unwrap();

        let second = Arc::new(StoreTransport::new(dst.path()));
        let session = UploadSession::new(&path, second.clone(), config(2)).unwrap();
        assert_eq!(session.start().await.unwrap(), UploadTaskStatus::Done);

        let task = session.snapshot();
        assert!(task.is_rapid_upload);
        assert_eq!(task.percent, 100);
        assert!(second.started.lock().is_empty());
        assert_eq!(second.merges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let data = test_data(3 * CHUNK as usize);
        let path = write_source(&src, "a.bin", &data);

        let fp = ContentFingerprinter::calculate(&path, FingerprintMode::Sampled)
            .await
            .unwrap();
        let transport = Arc::new(StoreTransport::new(dst.path()));
        transport.failures.lock().insert(format!("{}-1", fp), 2);

        let session = UploadSession::new(&path, transport.clone(), config(2)).unwrap();
        assert_eq!(session.start().await.unwrap(), UploadTaskStatus::Done);

        let chunks = session.chunk_snapshot();
        assert_eq!(chunks[1].attempts, 3);
        assert!(chunks.iter().all(|c| c.completed));
        assert_eq!(final_file(dst.path(), &path).await, data);
    }

    #[tokio::test]
    async fn test_exhausted_chunk_ends_in_error() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let path = write_source(&src, "a.bin", &test_data(3 * CHUNK as usize));

        let fp = ContentFingerprinter::calculate(&path, FingerprintMode::Sampled)
            .await
            .unwrap();
        let transport = Arc::new(StoreTransport::new(dst.path()));
        transport.failures.lock().insert(format!("{}-0", fp), u32::MAX);

        let session = UploadSession::new(&path, transport.clone(), config(1)).unwrap();
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, SessionError::Upload(SchedulerError::ChunkFailed { .. })));

        let task = session.snapshot();
        assert_eq!(task.status, UploadTaskStatus::Error);
        assert!(task.error.is_some());
        assert_eq!(transport.merges.load(Ordering::SeqCst), 0);
        // 失败后不再准入后续分片
        assert!(transport.uploaded.lock().is_empty());
    }

    #[tokio::test]
    async fn test_verify_failure_attempts_no_chunks() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let path = write_source(&src, "a.bin", &test_data(100));

        let mut transport = StoreTransport::new(dst.path());
        transport.fail_verify = true;
        let transport = Arc::new(transport);

        let session = UploadSession::new(&path, transport.clone(), config(2)).unwrap();
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, SessionError::Verify(_)));
        assert_eq!(session.snapshot().status, UploadTaskStatus::Error);
        assert!(transport.started.lock().is_empty());
    }

    #[tokio::test]
    async fn test_merge_failure_keeps_staging() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let path = write_source(&src, "a.bin", &test_data(2 * CHUNK as usize));

        let mut transport = StoreTransport::new(dst.path());
        transport.fail_merge = true;
        let transport = Arc::new(transport);

        let session = UploadSession::new(&path, transport.clone(), config(2)).unwrap();
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, SessionError::Merge(_)));
        assert_eq!(session.snapshot().status, UploadTaskStatus::Error);

        let fp = session.snapshot().fingerprint.unwrap();
        let stored = ChunkStore::new(dst.path()).list_chunks(&fp).await.unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn test_pause_then_resume() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let data = test_data(5 * CHUNK as usize);
        let path = write_source(&src, "a.bin", &data);

        let transport = Arc::new(StoreTransport::new(dst.path()));
        *transport.hold_from.lock() = Some(2);

        let session = Arc::new(UploadSession::new(&path, transport.clone(), config(1)).unwrap());
        let runner = session.clone();
        let handle = tokio::spawn(async move { runner.start().await });

        // 等待分片 2 进入阻塞
        tokio::time::timeout(Duration::from_secs(10), async {
            while transport.started.lock().len() < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // 上传中不能恢复
        assert!(session.resume().await.is_err());

        assert!(session.pause());
        assert!(!session.pause());
        assert_eq!(handle.await.unwrap().unwrap(), UploadTaskStatus::Paused);
        assert_eq!(session.snapshot().status, UploadTaskStatus::Paused);
        let paused_percent = session.snapshot().percent;
        assert_eq!(paused_percent, 40);

        *transport.hold_from.lock() = None;
        assert_eq!(session.resume().await.unwrap(), UploadTaskStatus::Done);
        assert!(session.resume().await.is_err());

        // 已确认的分片没有重新上传
        assert_eq!(transport.uploaded_indices(), vec![0, 1, 2, 3, 4]);
        let started = transport.started.lock().clone();
        let fp = session.snapshot().fingerprint.unwrap();
        assert_eq!(started.iter().filter(|id| **id == format!("{}-0", fp)).count(), 1);
        assert_eq!(started.iter().filter(|id| **id == format!("{}-1", fp)).count(), 1);
        assert_eq!(transport.verifies.load(Ordering::SeqCst), 2);

        assert_eq!(final_file(dst.path(), &path).await, data);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let path = write_source(&src, "a.bin", &test_data(10));

        let transport = Arc::new(StoreTransport::new(dst.path()));
        let session = UploadSession::new(&path, transport, config(1)).unwrap();
        session.start().await.unwrap();
        assert!(matches!(
            session.start().await,
            Err(SessionError::InvalidState(_))
        ));
    }

    #[test]
    fn test_missing_local_file() {
        let dst = TempDir::new().unwrap();
        let transport = Arc::new(StoreTransport::new(dst.path()));
        let result = UploadSession::new("/nonexistent/file.bin", transport, config(1));
        assert!(matches!(result, Err(SessionError::LocalFile(_))));
    }
}
