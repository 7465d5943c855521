// 上传引擎模块
//
// - hash:      内容哈希（断点续传 / 秒传 / 取消句柄的关联键）
// - chunk:     分片规划与分片数据读取
// - scheduler: 有界 FIFO 并发调度器（文件级、分片级各一个实例）
// - task:      会话状态与源文件元数据
// - session:   单文件上传状态机（含分片重试）
// - batch:     批次入口（start_upload / pause_upload）
// - progress:  进度快照与进度事件
// - validate:  上传前文件校验

pub mod batch;
pub mod chunk;
pub mod hash;
pub mod progress;
pub mod scheduler;
pub mod session;
pub mod task;
pub mod validate;

pub use batch::{FileOutcome, UploadBatch};
pub use chunk::{
    chunk_count, chunk_len, plan_chunks, plan_chunks_async, ChunkDescriptor,
    DEFAULT_UPLOAD_CHUNK_SIZE,
};
pub use hash::{hash_bytes, hash_file, hash_reader, hash_record};
pub use progress::{
    percentage, ApiResult, ChunkedFileInfo, ProgressCallback, ProgressEvent, ProgressSnapshot,
};
pub use scheduler::ConcurrencyScheduler;
pub use session::{BatchContext, CancelHandle, UploadSession};
pub use task::{FileInfo, SessionState, SourceFile, UploadStatus};
pub use validate::{matches_accept, validate_files};
