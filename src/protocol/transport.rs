// HTTP 传输层
//
// 上传引擎只依赖 Transport trait：
// - 输入 {method, url, base_url, headers, body, timeout, cancel, on_progress}
// - 输出解析后的 {code, message, data} 信封
// - 失败时返回 Transport / Cancelled 错误，可重试分类在这里完成
//
// ReqwestTransport 是生产实现，测试使用 MockTransport

use crate::error::{TransportErrorKind, UploadError, UploadResult};
use crate::protocol::types::ApiEnvelope;
use async_trait::async_trait;
use reqwest::multipart;
use reqwest::{Client, Method};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 上传进度回调 (已发送字节, 总字节)
pub type UploadProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// multipart 文件流切片大小: 64KB
pub const UPLOAD_STREAM_SLICE: usize = 64 * 1024;

/// multipart 文件字段
#[derive(Debug, Clone)]
pub struct FilePart {
    /// 表单字段名
    pub field: String,
    /// 文件名
    pub file_name: String,
    /// MIME 类型
    pub mime: String,
    /// 文件数据
    pub data: Vec<u8>,
}

/// multipart 请求体
#[derive(Debug, Clone, Default)]
pub struct MultipartBody {
    /// 普通文本字段（保持插入顺序）
    pub fields: Vec<(String, String)>,
    /// 文件字段
    pub file: Option<FilePart>,
}

impl MultipartBody {
    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn file(mut self, part: FilePart) -> Self {
        self.file = Some(part);
        self
    }

    /// 查找文本字段
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// 请求体
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    /// GET 查询参数
    Query(Vec<(String, String)>),
    /// JSON 请求体
    Json(serde_json::Value),
    /// multipart 表单
    Multipart(MultipartBody),
}

/// 传输请求
#[derive(Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub base_url: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: RequestBody,
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    pub on_progress: Option<UploadProgressFn>,
}

impl std::fmt::Debug for TransportRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

impl TransportRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            base_url: None,
            headers: HashMap::new(),
            body: RequestBody::Empty,
            timeout: None,
            cancel: None,
            on_progress: None,
        }
    }

    /// 完整请求地址
    pub fn full_url(&self) -> String {
        resolve_url(self.base_url.as_deref(), &self.url)
    }
}

/// 拼接 base_url 与相对路径（绝对地址原样返回）
pub fn resolve_url(base_url: Option<&str>, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_string();
    }
    match base_url {
        Some(base) if !base.is_empty() => format!(
            "{}/{}",
            base.trim_end_matches('/'),
            url.trim_start_matches('/')
        ),
        _ => url.to_string(),
    }
}

/// 传输层抽象
#[async_trait]
pub trait Transport: Send + Sync {
    /// 发送请求并返回成功的响应信封
    async fn request(&self, request: TransportRequest) -> UploadResult<ApiEnvelope>;
}

/// 基于 reqwest 的传输实现
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
    /// 成功业务码
    success_code: i64,
}

impl ReqwestTransport {
    /// 创建传输实例
    ///
    /// # 参数
    /// * `success_code` - 成功业务码，其它业务码视为失败
    pub fn new(success_code: i64) -> UploadResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| UploadError::InvalidConfig(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self {
            client,
            success_code,
        })
    }

    /// 构建 multipart 表单
    ///
    /// 文件字段按 64KB 切片流式发送，每发出一片回调一次进度
    fn build_form(
        body: MultipartBody,
        on_progress: Option<UploadProgressFn>,
    ) -> UploadResult<multipart::Form> {
        let mut form = multipart::Form::new();
        for (name, value) in body.fields {
            form = form.text(name, value);
        }

        if let Some(file) = body.file {
            let total = file.data.len() as u64;
            let slices: Vec<Vec<u8>> = file
                .data
                .chunks(UPLOAD_STREAM_SLICE)
                .map(|s| s.to_vec())
                .collect();

            let mut sent = 0u64;
            let stream = futures::stream::iter(slices.into_iter().map(move |slice| {
                sent += slice.len() as u64;
                if let Some(cb) = &on_progress {
                    cb(sent, total);
                }
                Ok::<_, std::io::Error>(slice)
            }));

            let part = multipart::Part::stream_with_length(reqwest::Body::wrap_stream(stream), total)
                .file_name(file.file_name)
                .mime_str(&file.mime)
                .map_err(|e| UploadError::transport(TransportErrorKind::BadRequest, e.to_string()))?;
            form = form.part(file.field, part);
        }

        Ok(form)
    }

    async fn send(&self, request: TransportRequest) -> UploadResult<ApiEnvelope> {
        let url = request.full_url();
        let mut builder = self.client.request(request.method.clone(), &url);

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Query(pairs) => builder.query(&pairs),
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Multipart(body) => {
                builder.multipart(Self::build_form(body, request.on_progress.clone())?)
            }
        };

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;

        debug!("响应: {} {} status={}, body={}", request.method, url, status, text);

        if !status.is_success() {
            let kind = TransportErrorKind::from_status(status.as_u16());
            warn!("请求失败: {} {} status={} ({:?})", request.method, url, status, kind);
            return Err(UploadError::transport(
                kind,
                format!("HTTP {}: {}", status.as_u16(), text),
            ));
        }

        let envelope: ApiEnvelope = serde_json::from_str(&text).map_err(|e| {
            UploadError::transport(
                TransportErrorKind::Decode,
                format!("解析响应失败: {}, body={}", e, text),
            )
        })?;

        if envelope.code != self.success_code {
            warn!(
                "业务码失败: {} {} code={}, message={}",
                request.method, url, envelope.code, envelope.message
            );
            return Err(UploadError::transport(
                TransportErrorKind::Business(envelope.code),
                format!("业务码 {}: {}", envelope.code, envelope.message),
            ));
        }

        Ok(envelope)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn request(&self, request: TransportRequest) -> UploadResult<ApiEnvelope> {
        match request.cancel.clone() {
            Some(token) => {
                if token.is_cancelled() {
                    return Err(UploadError::Cancelled);
                }
                let desc = format!("{} {}", request.method, request.full_url());
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("请求被取消: {}", desc);
                        Err(UploadError::Cancelled)
                    }
                    result = self.send(request) => result,
                }
            }
            None => self.send(request).await,
        }
    }
}

#[cfg(test)]
pub use mock::{MockTransport, RecordedRequest};
