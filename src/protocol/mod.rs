// 远程上传协议模块

pub mod client;
pub mod transport;
pub mod types;

pub use client::UploadApiClient;
pub use transport::{
    resolve_url, FilePart, MultipartBody, ReqwestTransport, RequestBody, Transport,
    TransportRequest, UploadProgressFn, UPLOAD_STREAM_SLICE,
};
pub use types::{parse_uploaded_chunks, ApiEnvelope, DedupResult};
