// 上传分片规划
//
// 分片规则：
// - 默认分片大小 1MiB
// - 分片数量 = ceil(文件大小 / 分片大小)
// - 最后一个分片是余数，永远不会是空分片

use std::ops::Range;
use tracing::debug;

/// 默认上传分片大小: 1MiB
pub const DEFAULT_UPLOAD_CHUNK_SIZE: u64 = 1024 * 1024;

/// 上传分片信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadChunk {
    /// 分片索引
    pub index: usize,
    /// 字节范围
    pub range: Range<u64>,
}

impl UploadChunk {
    pub fn new(index: usize, range: Range<u64>) -> Self {
        Self { index, range }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }
}

/// 分片规划
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    /// 所有分片（按索引顺序）
    chunks: Vec<UploadChunk>,
    /// 文件总大小
    total_size: u64,
    /// 分片大小
    chunk_size: u64,
}

impl ChunkPlan {
    /// 创建分片规划
    ///
    /// # 参数
    /// * `total_size` - 文件总大小
    /// * `chunk_size` - 分片大小（为 0 时使用默认值）
    pub fn new(total_size: u64, chunk_size: u64) -> Self {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_UPLOAD_CHUNK_SIZE
        } else {
            chunk_size
        };
        let chunks = Self::calculate_chunks(total_size, chunk_size);

        debug!(
            "创建分片规划: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
            total_size,
            chunk_size,
            chunks.len()
        );

        Self {
            chunks,
            total_size,
            chunk_size,
        }
    }

    /// 使用默认分片大小创建
    pub fn with_default_chunk_size(total_size: u64) -> Self {
        Self::new(total_size, DEFAULT_UPLOAD_CHUNK_SIZE)
    }

    /// 计算分片
    fn calculate_chunks(total_size: u64, chunk_size: u64) -> Vec<UploadChunk> {
        let mut chunks = Vec::with_capacity(total_size.div_ceil(chunk_size) as usize);
        let mut offset = 0u64;
        let mut index = 0;

        while offset < total_size {
            let end = std::cmp::min(offset + chunk_size, total_size);
            chunks.push(UploadChunk::new(index, offset..end));
            offset = end;
            index += 1;
        }

        chunks
    }

    /// 获取所有分片
    pub fn chunks(&self) -> &[UploadChunk] {
        &self.chunks
    }

    /// 获取分片数量
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// 指定分片之前所有分片的字节数
    pub fn bytes_before(&self, index: usize) -> u64 {
        self.chunks
            .get(index)
            .map(|c| c.range.start)
            .unwrap_or(self.total_size)
    }
}
