// 远程上传协议客户端
//
// 四个分片协议调用 + 一个小文件直传调用，全部委托给 Transport：
// - upload_chunk:   multipart POST，携带分片数据与 {chunkIndex, fileHash, fileName, totalChunksSize, fileType, totalChunksNum}
// - check_uploaded: POST {fileHash} -> 已上传分片索引
// - merge_chunks:   POST {fileHash, fileName} -> 最终资源描述
// - dedup_lookup:   GET ?fileHash= -> 是否已存在 + 资源引用
// - upload_direct:  multipart POST，字段 files + 额外字段

use crate::config::RequestConfig;
use crate::error::{UploadError, UploadResult};
use crate::protocol::transport::{
    FilePart, MultipartBody, RequestBody, Transport, TransportRequest, UploadProgressFn,
};
use crate::protocol::types::{parse_uploaded_chunks, ApiEnvelope, DedupResult};
use crate::uploader::chunk::ChunkDescriptor;
use crate::uploader::task::{FileInfo, SourceFile};
use reqwest::Method;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 上传协议客户端
#[derive(Clone)]
pub struct UploadApiClient {
    transport: Arc<dyn Transport>,
    config: RequestConfig,
}

impl std::fmt::Debug for UploadApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadApiClient")
            .field("base_url", &self.config.base_url)
            .finish()
    }
}

impl UploadApiClient {
    pub fn new(transport: Arc<dyn Transport>, config: RequestConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &RequestConfig {
        &self.config
    }

    /// 构造带公共配置（base_url / headers / timeout）的请求
    fn request(&self, method: Method, url: &str, body: RequestBody) -> TransportRequest {
        let mut request = TransportRequest::new(method, url);
        request.base_url = Some(self.config.base_url.clone());
        request.headers = self.config.headers.clone();
        request.timeout = Some(Duration::from_secs(self.config.timeout_secs));
        request.body = body;
        request
    }

    /// 上传单个分片
    ///
    /// # 参数
    /// * `chunk` - 分片描述
    /// * `data` - 分片数据
    /// * `file_hash` - 文件内容哈希
    /// * `file` - 文件元数据
    /// * `total_chunks` - 文件分片总数
    /// * `cancel` - 会话取消令牌
    pub async fn upload_chunk(
        &self,
        chunk: &ChunkDescriptor,
        data: Vec<u8>,
        file_hash: &str,
        file: &FileInfo,
        total_chunks: usize,
        cancel: &CancellationToken,
    ) -> UploadResult<ApiEnvelope> {
        debug!(
            "上传分片: hash={}, index={}, size={} bytes",
            file_hash,
            chunk.index,
            data.len()
        );

        let body = MultipartBody::default()
            .text("chunkIndex", chunk.index.to_string())
            .text("fileHash", file_hash)
            .text("fileName", file.name.as_str())
            .text("totalChunksSize", file.size.to_string())
            .text("fileType", file.mime_type.as_str())
            .text("totalChunksNum", total_chunks.to_string())
            .file(FilePart {
                field: "file".to_string(),
                file_name: format!("{}-{}", file_hash, chunk.index),
                mime: "application/octet-stream".to_string(),
                data,
            });

        let mut request = self.request(
            Method::POST,
            &self.config.chunk_url,
            RequestBody::Multipart(body),
        );
        request.cancel = Some(cancel.clone());

        self.transport.request(request).await
    }

    /// 查询服务端已持有的分片索引
    pub async fn check_uploaded(&self, file_hash: &str) -> UploadResult<Vec<usize>> {
        let request = self.request(
            Method::POST,
            &self.config.check_url,
            RequestBody::Json(json!({ "fileHash": file_hash })),
        );
        let envelope = self.transport.request(request).await?;
        let uploaded = parse_uploaded_chunks(&envelope.data)?;

        debug!("断点检查: hash={}, 已上传分片={:?}", file_hash, uploaded);
        Ok(uploaded)
    }

    /// 请求合并分片
    ///
    /// # 返回
    /// 响应信封，data 为最终资源描述
    pub async fn merge_chunks(&self, file_hash: &str, file_name: &str) -> UploadResult<ApiEnvelope> {
        info!("请求合并分片: hash={}, name={}", file_hash, file_name);

        let request = self.request(
            Method::POST,
            &self.config.merge_url,
            RequestBody::Json(json!({ "fileHash": file_hash, "fileName": file_name })),
        );
        self.transport.request(request).await
    }

    /// 秒传查询
    pub async fn dedup_lookup(&self, file_hash: &str) -> UploadResult<DedupResult> {
        let request = self.request(
            Method::GET,
            &self.config.dedup_url,
            RequestBody::Query(vec![("fileHash".to_string(), file_hash.to_string())]),
        );
        let envelope = self.transport.request(request).await?;
        let result = DedupResult::from_envelope(envelope);

        debug!("秒传查询: hash={}, exists={}", file_hash, result.exists);
        Ok(result)
    }

    /// 小文件直传
    ///
    /// # 参数
    /// * `file` - 源文件
    /// * `accept` - 接受的文件类型（作为 JSON 数组字段一并提交）
    /// * `cancel` - 取消令牌
    /// * `on_progress` - 上传进度回调 (已发送, 总数)
    pub async fn upload_direct(
        &self,
        file: &SourceFile,
        accept: &[String],
        cancel: &CancellationToken,
        on_progress: Option<UploadProgressFn>,
    ) -> UploadResult<ApiEnvelope> {
        let data = tokio::fs::read(&file.path)
            .await
            .map_err(|e| UploadError::read(&file.path, e))?;

        info!("直传文件: name={}, size={} bytes", file.name(), data.len());

        let mut body = MultipartBody::default();
        for (key, value) in &self.config.extra_fields {
            body = body.text(key.as_str(), form_value(value));
        }
        if !accept.is_empty() {
            body = body.text("accept", form_value(&json!(accept)));
        }
        body = body.file(FilePart {
            field: "files".to_string(),
            file_name: file.name().to_string(),
            mime: file.mime_type().to_string(),
            data,
        });

        let mut request = self.request(
            Method::POST,
            &self.config.direct_url,
            RequestBody::Multipart(body),
        );
        request.cancel = Some(cancel.clone());
        request.on_progress = on_progress;

        self.transport.request(request).await
    }
}

/// 表单字段取值：字符串原样发送，其它值发送 JSON 文本
fn form_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::transport::MockTransport;
    use std::collections::HashSet;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn client_with(mock: Arc<MockTransport>) -> UploadApiClient {
        let mut config = RequestConfig::default();
        config
            .extra_fields
            .insert("bucket".to_string(), json!("media"));
        config.extra_fields.insert("meta".to_string(), json!({"a": 1}));
        UploadApiClient::new(mock, config)
    }

    fn file_info() -> FileInfo {
        FileInfo {
            name: "movie.mp4".to_string(),
            size: 10,
            mime_type: "video/mp4".to_string(),
            last_modified: None,
        }
    }

    #[test]
    fn test_form_value() {
        assert_eq!(form_value(&json!("x")), "x");
        assert_eq!(form_value(&json!(3)), "3");
        assert_eq!(form_value(&json!(["a", "b"])), r#"["a","b"]"#);
    }

    #[tokio::test]
    async fn test_upload_chunk_fields() {
        let mock = Arc::new(MockTransport::new());
        let client = client_with(mock.clone());
        let chunk = crate::uploader::chunk::plan_chunks(10, 4, &HashSet::new()).unwrap()[2].clone();

        client
            .upload_chunk(&chunk, vec![8, 9], "hash", &file_info(), 3, &CancellationToken::new())
            .await
            .unwrap();

        let requests = mock.requests();
        let sent = &requests[0];
        assert_eq!(sent.method, Method::POST);
        let field = |name: &str| {
            sent.fields
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(field("chunkIndex").as_deref(), Some("2"));
        assert_eq!(field("fileHash").as_deref(), Some("hash"));
        assert_eq!(field("fileName").as_deref(), Some("movie.mp4"));
        assert_eq!(field("totalChunksSize").as_deref(), Some("10"));
        assert_eq!(field("fileType").as_deref(), Some("video/mp4"));
        assert_eq!(field("totalChunksNum").as_deref(), Some("3"));
        assert_eq!(sent.file_len, Some(2));
    }

    #[tokio::test]
    async fn test_check_merge_dedup() {
        let mock = Arc::new(MockTransport::new().with_remote_chunks([0, 2]));
        let client = client_with(mock.clone());

        assert_eq!(client.check_uploaded("h").await.unwrap(), vec![0, 2]);
        assert!(!client.dedup_lookup("h").await.unwrap().exists);
        let merged = client.merge_chunks("h", "movie.mp4").await.unwrap();
        assert_eq!(merged.data["url"], "/files/merged");

        let requests = mock.requests();
        assert_eq!(requests[0].json, Some(json!({"fileHash": "h"})));
        assert_eq!(requests[1].method, Method::GET);
        assert_eq!(requests[1].fields, vec![("fileHash".to_string(), "h".to_string())]);
        assert_eq!(
            requests[2].json,
            Some(json!({"fileHash": "h", "fileName": "movie.mp4"}))
        );
    }

    #[tokio::test]
    async fn test_upload_direct_fields_and_progress() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(&vec![7u8; 100_000]).unwrap();
        temp_file.flush().unwrap();
        let file = SourceFile::from_path(temp_file.path()).await.unwrap();

        let mock = Arc::new(MockTransport::new());
        let client = client_with(mock.clone());
        let reports = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = reports.clone();
        let on_progress: UploadProgressFn = Arc::new(move |sent, total| sink.lock().push((sent, total)));

        client
            .upload_direct(
                &file,
                &["image/*".to_string(), ".bin".to_string()],
                &CancellationToken::new(),
                Some(on_progress),
            )
            .await
            .unwrap();

        let requests = mock.requests();
        let sent = &requests[0];
        assert_eq!(sent.file_len, Some(100_000));
        assert!(sent.fields.contains(&("bucket".to_string(), "media".to_string())));
        assert!(sent.fields.contains(&("meta".to_string(), r#"{"a":1}"#.to_string())));
        assert!(sent
            .fields
            .contains(&("accept".to_string(), r#"["image/*",".bin"]"#.to_string())));

        let reports = reports.lock();
        assert_eq!(reports.len(), 2);
        assert_eq!(*reports.last().unwrap(), (100_000, 100_000));
    }
}
