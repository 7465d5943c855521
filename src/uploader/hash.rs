// 文件内容标识计算
//
// 内容哈希是断点续传和秒传的唯一键：
// 1. 流式读取文件全部字节，计算 SHA-256
// 2. 编码为小写十六进制字符串
// 3. 与文件名、修改时间无关，只取决于字节内容

use crate::error::{UploadError, UploadResult};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// 读取缓冲区大小: 64KB
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// 计算文件内容哈希
///
/// 在阻塞线程池中执行，不阻塞调度器的派发循环
pub async fn hash_file(path: &Path) -> UploadResult<String> {
    let path = path.to_path_buf();
    let task_path = path.clone();

    tokio::task::spawn_blocking(move || hash_file_sync(&task_path))
        .await
        .map_err(|e| UploadError::read(&path, format!("计算哈希任务执行失败: {}", e)))?
}

/// 同步计算文件哈希（内部方法）
fn hash_file_sync(path: &Path) -> UploadResult<String> {
    let file = std::fs::File::open(path).map_err(|e| UploadError::read(path, e))?;
    let mut reader = std::io::BufReader::with_capacity(1024 * 1024, file);
    let hash = hash_reader(&mut reader).map_err(|e| UploadError::read(path, e))?;

    debug!("文件哈希计算完成: path={:?}, sha256={}", path, hash);
    Ok(hash)
}

/// 流式计算任意字节源的 SHA-256
pub fn hash_reader<R: Read>(reader: &mut R) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// 计算内存字节的 SHA-256
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// 计算非文件实体的标识
///
/// 先序列化为 JSON（serde_json::Value 的对象键按字典序排列），再对序列化结果求哈希。
/// 只用于非文件实体的一致性标识，不参与断点续传。
pub fn hash_record<T: Serialize + ?Sized>(record: &T) -> UploadResult<String> {
    let value = serde_json::to_value(record)
        .map_err(|e| UploadError::ProtocolViolation(format!("记录序列化失败: {}", e)))?;
    let canonical = serde_json::to_string(&value)
        .map_err(|e| UploadError::ProtocolViolation(format!("记录序列化失败: {}", e)))?;
    Ok(hash_bytes(canonical.as_bytes()))
}
