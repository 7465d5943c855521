// 上传分片规划
//
// 分片规则：
// - 从偏移 0 开始按固定 chunk_size 步进，索引从 0 顺序递增
// - 已上传的索引不出现在结果中，但游标照常前进（排除不改变编号）
// - 最后一个分片大小为 size % chunk_size（整除时为完整分片）
// - 文件大小为 0 时没有分片

use crate::error::{UploadError, UploadResult};
use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::Path;
use tracing::debug;

/// 默认上传分片大小: 5MB
pub const DEFAULT_UPLOAD_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// 分片描述
///
/// 派生数据，不做持久化；数据视图通过 `read_payload` 按需读取
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// 分片索引
    pub index: usize,
    /// 字节范围 [start, end)
    pub range: Range<u64>,
}

impl ChunkDescriptor {
    pub fn new(index: usize, range: Range<u64>) -> Self {
        Self { index, range }
    }

    /// 起始偏移
    pub fn start(&self) -> u64 {
        self.range.start
    }

    /// 结束偏移（不含）
    pub fn end(&self) -> u64 {
        self.range.end
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    /// 读取分片数据
    ///
    /// 在阻塞线程池中定位并读取 [start, end) 的字节
    pub async fn read_payload(&self, file_path: &Path) -> UploadResult<Vec<u8>> {
        let path = file_path.to_path_buf();
        let start = self.range.start;
        let size = self.size() as usize;
        let index = self.index;

        let join_path = path.clone();
        tokio::task::spawn_blocking(move || {
            let mut file = std::fs::File::open(&path).map_err(|e| UploadError::read(&path, e))?;
            file.seek(SeekFrom::Start(start))
                .map_err(|e| UploadError::read(&path, e))?;

            let mut buffer = vec![0u8; size];
            file.read_exact(&mut buffer)
                .map_err(|e| UploadError::read(&path, format!("读取分片 #{} 失败: {}", index, e)))?;

            debug!(
                "读取分片 #{}: bytes={}-{}, 大小={} bytes",
                index,
                start,
                start + size as u64,
                size
            );
            Ok(buffer)
        })
        .await
        .map_err(|e| UploadError::read(&join_path, format!("读取分片任务执行失败: {}", e)))?
    }
}

/// 计算分片总数
pub fn chunk_count(file_size: u64, chunk_size: u64) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    file_size.div_ceil(chunk_size) as usize
}

/// 计算指定索引分片的字节长度（索引越界返回 None）
pub fn chunk_len(file_size: u64, chunk_size: u64, index: usize) -> Option<u64> {
    if index >= chunk_count(file_size, chunk_size) {
        return None;
    }
    let start = index as u64 * chunk_size;
    Some(chunk_size.min(file_size - start))
}

/// 规划待上传分片
///
/// # 参数
/// * `file_size` - 文件大小
/// * `chunk_size` - 分片大小（必须大于 0）
/// * `excluded` - 已上传的分片索引
///
/// # 返回
/// 剩余分片，按索引升序；全部已上传时返回空列表
pub fn plan_chunks(
    file_size: u64,
    chunk_size: u64,
    excluded: &HashSet<usize>,
) -> UploadResult<Vec<ChunkDescriptor>> {
    if chunk_size == 0 {
        return Err(UploadError::InvalidConfig("分片大小必须大于 0".to_string()));
    }

    let mut chunks = Vec::new();
    let mut offset = 0u64;
    let mut index = 0usize;

    while offset < file_size {
        let end = std::cmp::min(offset + chunk_size, file_size);
        if !excluded.contains(&index) {
            chunks.push(ChunkDescriptor::new(index, offset..end));
        }
        offset = end;
        index += 1;
    }

    debug!(
        "分片规划完成: 文件大小={} bytes, 分片大小={} bytes, 总分片={}, 待上传={}",
        file_size,
        chunk_size,
        index,
        chunks.len()
    );
    Ok(chunks)
}

/// 在后台线程中规划分片
///
/// 结果与 `plan_chunks` 完全一致，只是不占用调用方的异步线程
pub async fn plan_chunks_async(
    file_size: u64,
    chunk_size: u64,
    excluded: HashSet<usize>,
) -> UploadResult<Vec<ChunkDescriptor>> {
    tokio::task::spawn_blocking(move || plan_chunks(file_size, chunk_size, &excluded))
        .await
        .map_err(|e| UploadError::ProtocolViolation(format!("分片规划任务执行失败: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn set(indices: &[usize]) -> HashSet<usize> {
        indices.iter().copied().collect()
    }

    #[test]
    fn test_chunk_descriptor() {
        let chunk = ChunkDescriptor::new(0, 0..1024);
        assert_eq!(chunk.index, 0);
        assert_eq!(chunk.start(), 0);
        assert_eq!(chunk.end(), 1024);
        assert_eq!(chunk.size(), 1024);
    }

    #[test]
    fn test_plan_without_exclusions() {
        let chunks = plan_chunks(10_000_000, 3_000_000, &HashSet::new()).unwrap();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].range, 0..3_000_000);
        assert_eq!(chunks[1].range, 3_000_000..6_000_000);
        assert_eq!(chunks[2].range, 6_000_000..9_000_000);
        assert_eq!(chunks[3].range, 9_000_000..10_000_000);
        assert_eq!(chunks[3].size(), 1_000_000);
    }

    #[test]
    fn test_plan_with_exclusions_keeps_numbering() {
        let chunks = plan_chunks(10_000_000, 3_000_000, &set(&[0, 2])).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], ChunkDescriptor::new(1, 3_000_000..6_000_000));
        assert_eq!(chunks[1], ChunkDescriptor::new(3, 9_000_000..10_000_000));
    }

    #[test]
    fn test_exact_multiple_has_full_last_chunk() {
        let chunks = plan_chunks(16 * 1024, 4 * 1024, &HashSet::new()).unwrap();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[3].range, (12 * 1024)..(16 * 1024));
        assert_eq!(chunks[3].size(), 4 * 1024);
    }

    #[test]
    fn test_fully_covered_returns_empty() {
        let chunks = plan_chunks(10, 3, &set(&[0, 1, 2, 3])).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_zero_size_file() {
        assert!(plan_chunks(0, 3, &HashSet::new()).unwrap().is_empty());
        assert_eq!(chunk_count(0, 3), 0);
    }

    #[test]
    fn test_zero_chunk_size_is_invalid_config() {
        let result = plan_chunks(100, 0, &HashSet::new());
        assert!(matches!(result, Err(UploadError::InvalidConfig(_))));
    }

    #[test]
    fn test_chunk_len() {
        assert_eq!(chunk_len(10, 3, 0), Some(3));
        assert_eq!(chunk_len(10, 3, 3), Some(1));
        assert_eq!(chunk_len(10, 3, 4), None);
        assert_eq!(chunk_len(9, 3, 2), Some(3));
    }

    #[tokio::test]
    async fn test_plan_async_matches_sync() {
        let excluded = set(&[1]);
        let sync = plan_chunks(1000, 128, &excluded).unwrap();
        let async_plan = plan_chunks_async(1000, 128, excluded).await.unwrap();
        assert_eq!(sync, async_plan);
    }

    #[tokio::test]
    async fn test_read_payload() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"0123456789").unwrap();
        temp_file.flush().unwrap();

        let chunks = plan_chunks(10, 4, &HashSet::new()).unwrap();
        assert_eq!(chunks[0].read_payload(temp_file.path()).await.unwrap(), b"0123");
        assert_eq!(chunks[1].read_payload(temp_file.path()).await.unwrap(), b"4567");
        assert_eq!(chunks[2].read_payload(temp_file.path()).await.unwrap(), b"89");
    }

    #[tokio::test]
    async fn test_read_payload_truncated_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"0123").unwrap();
        temp_file.flush().unwrap();

        // 文件比规划时短
        let chunk = ChunkDescriptor::new(1, 4..8);
        let result = chunk.read_payload(temp_file.path()).await;
        assert!(matches!(result, Err(UploadError::Read { .. })));
    }

    proptest! {
        #[test]
        fn prop_plan_is_strict_partition(file_size in 0u64..200_000, chunk_size in 1u64..20_000) {
            let chunks = plan_chunks(file_size, chunk_size, &HashSet::new()).unwrap();
            prop_assert_eq!(chunks.len(), chunk_count(file_size, chunk_size));

            let mut expected_start = 0u64;
            for (i, chunk) in chunks.iter().enumerate() {
                prop_assert_eq!(chunk.index, i);
                prop_assert_eq!(chunk.start(), expected_start);
                prop_assert!(chunk.size() > 0);
                prop_assert!(chunk.size() <= chunk_size);
                if i + 1 < chunks.len() {
                    prop_assert_eq!(chunk.size(), chunk_size);
                }
                expected_start = chunk.end();
            }
            prop_assert_eq!(expected_start, file_size);
        }

        #[test]
        fn prop_exclusion_removes_exactly_excluded(
            file_size in 1u64..100_000,
            chunk_size in 1u64..10_000,
            seed in proptest::collection::vec(any::<usize>(), 0..16),
        ) {
            let full = plan_chunks(file_size, chunk_size, &HashSet::new()).unwrap();
            let excluded: HashSet<usize> = seed.iter().map(|s| s % full.len()).collect();
            let remaining = plan_chunks(file_size, chunk_size, &excluded).unwrap();

            let expected: Vec<ChunkDescriptor> = full
                .into_iter()
                .filter(|c| !excluded.contains(&c.index))
                .collect();
            prop_assert_eq!(remaining, expected);
        }
    }
}
