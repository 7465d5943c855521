// 上传引擎错误类型
//
// 错误分类：
// - Validation: 文件类型 / 数量校验失败（在任何会话启动前拒绝）
// - Read: 计算哈希或读取分片失败
// - Transport: 远程调用失败（由传输层做可重试分类）
// - Cancelled: 调度器暂停拒绝或会话被暂停
// - ProtocolViolation: 不变量被破坏（例如字节未对齐就请求合并）
// - InvalidConfig: 配置不合法（例如分片大小为 0）

use std::path::Path;
use thiserror::Error;

/// 传输层错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// 网络错误（可重试）
    Network,
    /// 超时（可重试）
    Timeout,
    /// 服务器错误（可重试）
    ServerError,
    /// 限流（可重试，需要更长等待时间）
    RateLimited,
    /// 资源不存在（不可重试）
    NotFound,
    /// 权限不足（不可重试）
    Forbidden,
    /// 参数错误（不可重试）
    BadRequest,
    /// 业务码非成功（不可重试）
    Business(i64),
    /// 响应解析失败（不可重试）
    Decode,
    /// 未知错误
    Unknown,
}

impl TransportErrorKind {
    /// 是否可重试
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            TransportErrorKind::Network
                | TransportErrorKind::Timeout
                | TransportErrorKind::ServerError
                | TransportErrorKind::RateLimited
        )
    }

    /// 从 HTTP 状态码转换
    pub fn from_status(status: u16) -> Self {
        match status {
            400 => TransportErrorKind::BadRequest,
            401 | 403 => TransportErrorKind::Forbidden,
            404 => TransportErrorKind::NotFound,
            408 | 504 => TransportErrorKind::Timeout,
            429 => TransportErrorKind::RateLimited,
            500..=599 => TransportErrorKind::ServerError,
            _ => TransportErrorKind::Unknown,
        }
    }
}

/// 上传引擎错误
#[derive(Debug, Clone, Error)]
pub enum UploadError {
    /// 文件校验失败
    #[error("文件校验失败: {0}")]
    Validation(String),

    /// 读取文件失败
    #[error("读取文件失败: {path}: {message}")]
    Read { path: String, message: String },

    /// 远程调用失败
    #[error("远程请求失败 ({kind:?}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    /// 已取消
    #[error("上传已取消")]
    Cancelled,

    /// 协议违例
    #[error("协议违例: {0}")]
    ProtocolViolation(String),

    /// 配置无效
    #[error("配置无效: {0}")]
    InvalidConfig(String),
}

impl UploadError {
    /// 构造读取错误
    pub fn read(path: &Path, err: impl std::fmt::Display) -> Self {
        UploadError::Read {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }

    /// 构造传输错误
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        UploadError::Transport {
            kind,
            message: message.into(),
        }
    }

    /// 是否可重试（只有部分传输错误可重试）
    pub fn is_retriable(&self) -> bool {
        match self {
            UploadError::Transport { kind, .. } => kind.is_retriable(),
            _ => false,
        }
    }

    /// 是否为取消
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UploadError::Cancelled)
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() || err.is_request() || err.is_body() {
            TransportErrorKind::Network
        } else if err.is_decode() {
            TransportErrorKind::Decode
        } else if let Some(status) = err.status() {
            TransportErrorKind::from_status(status.as_u16())
        } else {
            TransportErrorKind::Unknown
        };
        UploadError::Transport {
            kind,
            message: err.to_string(),
        }
    }
}

pub type UploadResult<T> = std::result::Result<T, UploadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_kinds() {
        assert!(TransportErrorKind::Network.is_retriable());
        assert!(TransportErrorKind::Timeout.is_retriable());
        assert!(TransportErrorKind::ServerError.is_retriable());
        assert!(TransportErrorKind::RateLimited.is_retriable());

        assert!(!TransportErrorKind::NotFound.is_retriable());
        assert!(!TransportErrorKind::Forbidden.is_retriable());
        assert!(!TransportErrorKind::BadRequest.is_retriable());
        assert!(!TransportErrorKind::Business(500).is_retriable());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(TransportErrorKind::from_status(400), TransportErrorKind::BadRequest);
        assert_eq!(TransportErrorKind::from_status(401), TransportErrorKind::Forbidden);
        assert_eq!(TransportErrorKind::from_status(404), TransportErrorKind::NotFound);
        assert_eq!(TransportErrorKind::from_status(408), TransportErrorKind::Timeout);
        assert_eq!(TransportErrorKind::from_status(429), TransportErrorKind::RateLimited);
        assert_eq!(TransportErrorKind::from_status(502), TransportErrorKind::ServerError);
        assert_eq!(TransportErrorKind::from_status(504), TransportErrorKind::Timeout);
        assert_eq!(TransportErrorKind::from_status(418), TransportErrorKind::Unknown);
    }

    #[test]
    fn test_error_retriable_only_for_transport() {
        assert!(UploadError::transport(TransportErrorKind::Network, "reset").is_retriable());
        assert!(!UploadError::Cancelled.is_retriable());
        assert!(!UploadError::Validation("x".into()).is_retriable());
        assert!(UploadError::Cancelled.is_cancelled());
    }
}
