// 上传进度聚合
//
// 会话状态 -> 进度快照的纯函数，以及两种进度事件：
// - Chunked: 分片上传路径 {apiRes, fileInfo}
// - Direct:  小文件直传路径 {status, percentage, file, fileHash}
// 两种事件通过 mode 字段显式区分，调用方不需要按字段结构猜测类型

use crate::protocol::ApiEnvelope;
use crate::uploader::task::{FileInfo, SessionState, UploadStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// 进度回调
pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// 计算进度百分比
///
/// round(uploaded / size * 100)，上限 100；
/// 空文件在完成时为 100，否则为 0
pub fn percentage(uploaded_bytes: u64, total_size: u64, status: UploadStatus) -> u8 {
    if total_size == 0 {
        return if status == UploadStatus::Done { 100 } else { 0 };
    }
    let pct = (uploaded_bytes as f64 / total_size as f64 * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}

/// 进度快照
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub file: FileInfo,
    pub hash: Option<String>,
    pub status: UploadStatus,
    pub uploaded_bytes: u64,
    pub percentage: u8,
}

impl ProgressSnapshot {
    /// 从会话状态生成快照
    pub fn from_state(file: &FileInfo, state: &SessionState) -> Self {
        Self {
            file: file.clone(),
            hash: state.content_hash.clone(),
            status: state.status,
            uploaded_bytes: state.uploaded_bytes,
            percentage: percentage(state.uploaded_bytes, state.total_size, state.status),
        }
    }
}

/// 与进度一同下发的接口结果
///
/// 分片失败时为空结果（code = None）
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ApiResult {
    pub code: Option<i64>,
    pub data: serde_json::Value,
}

impl ApiResult {
    /// 空结果（失败或尚无响应）
    pub fn empty() -> Self {
        Self::default()
    }
}

impl From<&ApiEnvelope> for ApiResult {
    fn from(envelope: &ApiEnvelope) -> Self {
        Self {
            code: Some(envelope.code),
            data: envelope.data.clone(),
        }
    }
}

/// 分片路径的文件进度信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkedFileInfo {
    pub file: FileInfo,
    pub progress: u8,
    pub status: UploadStatus,
    pub file_hash: Option<String>,
}

/// 进度事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ProgressEvent {
    /// 分片上传
    #[serde(rename_all = "camelCase")]
    Chunked {
        api_res: ApiResult,
        file_info: ChunkedFileInfo,
    },
    /// 小文件直传
    #[serde(rename_all = "camelCase")]
    Direct {
        status: UploadStatus,
        percentage: u8,
        file: FileInfo,
        file_hash: Option<String>,
    },
}

impl ProgressEvent {
    /// 由快照构造分片路径事件
    pub fn chunked(snapshot: ProgressSnapshot, api_res: ApiResult) -> Self {
        ProgressEvent::Chunked {
            api_res,
            file_info: ChunkedFileInfo {
                file: snapshot.file,
                progress: snapshot.percentage,
                status: snapshot.status,
                file_hash: snapshot.hash,
            },
        }
    }

    /// 构造直传路径事件
    pub fn direct(file: FileInfo, file_hash: Option<String>, status: UploadStatus, percentage: u8) -> Self {
        ProgressEvent::Direct {
            status,
            percentage,
            file,
            file_hash,
        }
    }

    pub fn status(&self) -> UploadStatus {
        match self {
            ProgressEvent::Chunked { file_info, .. } => file_info.status,
            ProgressEvent::Direct { status, .. } => *status,
        }
    }

    pub fn percentage(&self) -> u8 {
        match self {
            ProgressEvent::Chunked { file_info, .. } => file_info.progress,
            ProgressEvent::Direct { percentage, .. } => *percentage,
        }
    }

    pub fn file(&self) -> &FileInfo {
        match self {
            ProgressEvent::Chunked { file_info, .. } => &file_info.file,
            ProgressEvent::Direct { file, .. } => file,
        }
    }

    pub fn file_hash(&self) -> Option<&str> {
        match self {
            ProgressEvent::Chunked { file_info, .. } => file_info.file_hash.as_deref(),
            ProgressEvent::Direct { file_hash, .. } => file_hash.as_deref(),
        }
    }
}
