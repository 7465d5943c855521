// Large Upload Rust Library
// 可断点续传的分片上传核心库

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 日志系统
pub mod logging;

// 上传进度持久化
pub mod persistence;

// 远程上传协议模块
pub mod protocol;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use config::AppConfig;
pub use error::{TransportErrorKind, UploadError, UploadResult};
pub use persistence::{FileProgressStore, MemoryProgressStore, ProgressStore};
pub use protocol::{ApiEnvelope, ReqwestTransport, Transport, UploadApiClient};
pub use uploader::{
    FileOutcome, ProgressCallback, ProgressEvent, ProgressSnapshot, SourceFile, UploadBatch,
    UploadSession, UploadStatus,
};
