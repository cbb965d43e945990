// 待上传文件
//
// 数据来源可以是内存或本地路径；路径来源按需读取分片，不会一次性载入整个文件

use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io;
use tracing::debug;

/// 默认 MIME 类型
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// 根据扩展名推断 MIME 类型
pub fn guess_mime_type(file_name: &str) -> &'static str {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        Some("tif") | Some("tiff") => "image/tiff",
        Some("pdf") => "application/pdf",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("csv") => "text/csv",
        Some("zip") => "application/zip",
        Some("mp4") => "video/mp4",
        Some("mp3") => "audio/mpeg",
        _ => DEFAULT_MIME_TYPE,
    }
}

/// 数据来源
#[derive(Debug, Clone)]
pub enum UploadSource {
    /// 内存数据
    Memory(Arc<Vec<u8>>),
    /// 本地文件
    Path(PathBuf),
}

/// 待上传文件
#[derive(Debug, Clone)]
pub struct UploadFile {
    /// 文件名
    pub name: String,
    /// MIME 类型
    pub mime_type: String,
    /// 文件大小
    pub size: u64,
    /// 数据来源
    pub source: UploadSource,
}

impl UploadFile {
    /// 从内存数据创建
    pub fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            size: data.len() as u64,
            source: UploadSource::Memory(Arc::new(data)),
        }
    }

    /// 从本地文件创建（只读取元数据）
    pub async fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("不是文件: {:?}", path),
            ));
        }

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        let mime_type = guess_mime_type(&name).to_string();

        Ok(Self {
            name,
            mime_type,
            size: metadata.len(),
            source: UploadSource::Path(path.to_path_buf()),
        })
    }

    /// 是否为图片
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    /// 读取指定字节范围
    pub async fn read_range(&self, range: Range<u64>) -> io::Result<Vec<u8>> {
        if range.end > self.size || range.start > range.end {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("读取范围越界: {:?}, 文件大小={}", range, self.size),
            ));
        }

        match &self.source {
            UploadSource::Memory(data) => {
                Ok(data[range.start as usize..range.end as usize].to_vec())
            }
            UploadSource::Path(path) => {
                let path = path.clone();
                let start = range.start;
                let size = (range.end - range.start) as usize;

                let buffer = tokio::task::spawn_blocking(move || -> io::Result<Vec<u8>> {
                    let mut file = std::fs::File::open(&path)?;
                    file.seek(SeekFrom::Start(start))?;
                    let mut buffer = vec![0u8; size];
                    file.read_exact(&mut buffer)?;
                    Ok(buffer)
                })
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

                debug!(
                    "读取文件分片: bytes={}-{}, 大小={} bytes",
                    range.start,
                    range.end,
                    buffer.len()
                );
                Ok(buffer)
            }
        }
    }

    /// 读取全部数据
    pub async fn read_all(&self) -> io::Result<Vec<u8>> {
        self.read_range(0..self.size).await
    }
}
