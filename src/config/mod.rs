// 配置管理模块

use crate::error::{UploadError, UploadResult};
use crate::uploader::chunk::DEFAULT_UPLOAD_CHUNK_SIZE;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::fs;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 请求配置
    #[serde(default)]
    pub request: RequestConfig,
    /// 持久化配置
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// 分片大小（字节）
    pub chunk_size: u64,
    /// 最大同时上传文件数（文件级调度器容量）
    pub max_file_uploads: usize,
    /// 最大同时上传分片数（分片级调度器容量，批次内所有文件共享）
    pub max_chunk_uploads: usize,
    /// 单个分片最大重试次数（0 表示不重试）
    pub max_retries: u32,
    /// 大文件分片模式；关闭时走小文件直传
    pub large_file_mode: bool,
    /// 接受的文件类型（"image/*"、"video/mp4"、".zip"），为空时不限制
    pub accept: Vec<String>,
    /// 单批次最大文件数
    pub multiple_num: Option<usize>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
            max_file_uploads: 3,
            max_chunk_uploads: 6,
            max_retries: 3,
            large_file_mode: true,
            accept: Vec::new(),
            multiple_num: None,
        }
    }
}

impl UploadConfig {
    /// 校验上传配置
    pub fn validate(&self) -> UploadResult<()> {
        if self.chunk_size == 0 {
            return Err(UploadError::InvalidConfig("分片大小必须大于 0".to_string()));
        }
        if self.max_file_uploads == 0 {
            return Err(UploadError::InvalidConfig(
                "最大同时上传文件数必须大于 0".to_string(),
            ));
        }
        if self.max_chunk_uploads == 0 {
            return Err(UploadError::InvalidConfig(
                "最大同时上传分片数必须大于 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// 请求配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// 服务端地址
    pub base_url: String,
    /// 分片上传接口
    pub chunk_url: String,
    /// 断点检查接口
    pub check_url: String,
    /// 分片合并接口
    pub merge_url: String,
    /// 秒传查询接口
    pub dedup_url: String,
    /// 小文件直传接口
    pub direct_url: String,
    /// 单次请求超时（秒）
    pub timeout_secs: u64,
    /// 成功业务码
    pub success_code: i64,
    /// 额外请求头
    pub headers: HashMap<String, String>,
    /// 直传时附带的额外表单字段
    pub extra_fields: BTreeMap<String, serde_json::Value>,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3000".to_string(),
            chunk_url: "/upload/chunk".to_string(),
            check_url: "/upload/check".to_string(),
            merge_url: "/upload/merge".to_string(),
            dedup_url: "/upload/exists".to_string(),
            direct_url: "/upload".to_string(),
            timeout_secs: 15,
            success_code: 200,
            headers: HashMap::new(),
            extra_fields: BTreeMap::new(),
        }
    }
}

/// 持久化配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// 进度存储文件（JSON）；未设置时只保存在内存中
    #[serde(default)]
    pub progress_file: Option<PathBuf>,
    /// 进度文件刷写间隔（毫秒，默认 500）
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

fn default_flush_interval_ms() -> u64 {
    500
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            progress_file: None,
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .upload
            .validate()
            .context("配置文件中的上传参数验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.upload.validate().context("保存配置失败：上传参数无效")?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("创建配置目录失败: {:?}", parent))?;
            }
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        tracing::info!("✓ 配置已保存: {:?}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {:?}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 文件不存在时写出默认配置，已存在但解析失败时保留原文件
                if !path.exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {:#}", e);
                    }
                }

                default_config
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.upload.chunk_size, 5 * 1024 * 1024);
        assert_eq!(config.upload.max_file_uploads, 3);
        assert_eq!(config.upload.max_chunk_uploads, 6);
        assert!(config.upload.large_file_mode);
        assert_eq!(config.request.timeout_secs, 15);
        assert_eq!(config.request.success_code, 200);
        assert_eq!(config.request.chunk_url, "/upload/chunk");
        assert!(config.persistence.progress_file.is_none());
        assert_eq!(config.persistence.flush_interval_ms, 500);
        assert!(config.log.enabled);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();

        let mut config = AppConfig::default();
        config.upload.accept = vec!["image/*".to_string(), ".zip".to_string()];
        config.upload.multiple_num = Some(4);
        config
            .request
            .extra_fields
            .insert("bucket".to_string(), serde_json::json!("media"));
        config.save_to_file(temp_file.path()).await.unwrap();

        let loaded = AppConfig::load_from_file(temp_file.path()).await.unwrap();
        assert_eq!(loaded.upload.accept, config.upload.accept);
        assert_eq!(loaded.upload.multiple_num, Some(4));
        assert_eq!(loaded.request.extra_fields["bucket"], "media");
    }

    #[tokio::test]
    async fn test_partial_file_uses_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(
            temp_file.path(),
            "[upload]\nchunk_size = 1024\n\n[request]\nbase_url = \"http://example.com\"\n",
        )
        .unwrap();

        let loaded = AppConfig::load_from_file(temp_file.path()).await.unwrap();
        assert_eq!(loaded.upload.chunk_size, 1024);
        assert_eq!(loaded.upload.max_chunk_uploads, 6);
        assert_eq!(loaded.request.base_url, "http://example.com");
        assert_eq!(loaded.request.merge_url, "/upload/merge");
    }

    #[tokio::test]
    async fn test_zero_chunk_size_rejected() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), "[upload]\nchunk_size = 0\n").unwrap();
        assert!(AppConfig::load_from_file(temp_file.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_load_or_default_writes_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config").join("app.toml");

        let config = AppConfig::load_or_default(&path).await;
        assert_eq!(config.upload.max_file_uploads, 3);
        assert!(path.exists());
    }

    #[test]
    fn test_upload_config_validate() {
        let mut config = UploadConfig::default();
        assert!(config.validate().is_ok());

        config.max_chunk_uploads = 0;
        assert!(matches!(config.validate(), Err(UploadError::InvalidConfig(_))));

        config.max_chunk_uploads = 1;
        config.chunk_size = 0;
        assert!(matches!(config.validate(), Err(UploadError::InvalidConfig(_))));
    }
}
