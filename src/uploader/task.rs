// 上传会话数据定义
//
// 复用 UploadTask 的设计模式：状态 + mark_* 迁移方法

use crate::error::{UploadError, UploadResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// 会话状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// 等待中
    Pending,
    /// 计算哈希中
    Hashing,
    /// 秒传 / 断点检查中
    Checking,
    /// 上传中
    Uploading,
    /// 已暂停
    Paused,
    /// 合并中
    Merging,
    /// 已完成
    Done,
    /// 失败
    Error,
}

impl UploadStatus {
    /// 本轮运行是否已结束
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadStatus::Done | UploadStatus::Error)
    }

    /// 是否可以（重新）启动
    pub fn can_start(&self) -> bool {
        matches!(self, UploadStatus::Pending | UploadStatus::Paused)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Hashing => "hashing",
            UploadStatus::Checking => "checking",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Paused => "paused",
            UploadStatus::Merging => "merging",
            UploadStatus::Done => "done",
            UploadStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 文件元数据（进度事件中携带的可序列化部分）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    /// 文件名
    pub name: String,
    /// 文件大小
    pub size: u64,
    /// MIME 类型
    #[serde(rename = "type")]
    pub mime_type: String,
    /// 最后修改时间（Unix 毫秒）
    pub last_modified: Option<i64>,
}

/// 源文件句柄
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// 本地文件路径
    pub path: PathBuf,
    /// 元数据
    pub info: FileInfo,
}

impl SourceFile {
    /// 从本地路径读取元数据
    pub async fn from_path(path: impl AsRef<Path>) -> UploadResult<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| UploadError::read(&path, e))?;
        if !metadata.is_file() {
            return Err(UploadError::read(&path, "不是普通文件"));
        }

        let last_modified = metadata
            .modified()
            .ok()
            .map(|t| DateTime::<Utc>::from(t).timestamp_millis());

        Ok(Self::with_size(path, metadata.len(), last_modified))
    }

    /// 用已知大小构造（名称取文件名，MIME 按扩展名推断）
    pub fn with_size(path: PathBuf, size: u64, last_modified: Option<i64>) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mime_type = mime_guess::from_path(&path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        Self {
            path,
            info: FileInfo {
                name,
                size,
                mime_type,
                last_modified,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn size(&self) -> u64 {
        self.info.size
    }

    pub fn mime_type(&self) -> &str {
        &self.info.mime_type
    }
}

/// 会话可变状态
#[derive(Debug, Clone)]
pub struct SessionState {
    /// 状态
    pub status: UploadStatus,
    /// 内容哈希（计算一次后不再变化）
    pub content_hash: Option<String>,
    /// 已上传分片索引（以远程检查结果为准）
    pub uploaded_chunks: BTreeSet<usize>,
    /// 已上传字节数
    pub uploaded_bytes: u64,
    /// 文件总大小
    pub total_size: u64,
    /// 是否已请求合并（防止重复合并）
    pub merged: bool,
    /// 合并 / 秒传返回的资源描述
    pub resource: Option<serde_json::Value>,
    /// 错误信息
    pub error: Option<String>,
    /// 开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 完成时间 (Unix timestamp)
    pub completed_at: Option<i64>,
}

impl SessionState {
    pub fn new(total_size: u64) -> Self {
        Self {
            status: UploadStatus::Pending,
            content_hash: None,
            uploaded_chunks: BTreeSet::new(),
            uploaded_bytes: 0,
            total_size,
            merged: false,
            resource: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// 标记为计算哈希中
    pub fn mark_hashing(&mut self) {
        self.status = UploadStatus::Hashing;
        self.error = None;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now().timestamp());
        }
    }

    /// 标记为检查中
    pub fn mark_checking(&mut self) {
        self.status = UploadStatus::Checking;
    }

    /// 标记为上传中
    pub fn mark_uploading(&mut self) {
        self.status = UploadStatus::Uploading;
    }

    /// 标记为合并中
    pub fn mark_merging(&mut self) {
        self.status = UploadStatus::Merging;
    }

    /// 标记为暂停
    pub fn mark_paused(&mut self) {
        self.status = UploadStatus::Paused;
    }

    /// 标记为完成
    pub fn mark_done(&mut self) {
        self.status = UploadStatus::Done;
        self.uploaded_bytes = self.total_size;
        self.completed_at = Some(Utc::now().timestamp());
    }

    /// 标记为失败
    pub fn mark_failed(&mut self, error: String) {
        self.status = UploadStatus::Error;
        self.error = Some(error);
    }
}
