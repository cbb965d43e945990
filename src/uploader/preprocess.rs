// 图片预处理
//
// 上传前按目标尺寸缩放并重新编码，仅对图片生效

use crate::uploader::error::UploadError;
use crate::uploader::source::UploadFile;
use image::imageops::FilterType;
use image::{DynamicImage, ImageOutputFormat};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::Path;
use tracing::{debug, info};

/// 默认 JPEG 质量
pub const DEFAULT_JPEG_QUALITY: u8 = 85;

/// 缩放模式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FitMode {
    /// 按较大的缩放比例，覆盖目标区域
    Cover,
    /// 按较小的缩放比例，完整放入目标区域
    #[default]
    Contain,
    /// 强制拉伸到目标尺寸，忽略宽高比
    Fill,
}

/// 输出格式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Jpeg,
    Png,
}

impl OutputFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Png => "png",
        }
    }
}

/// 图片预处理选项
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageOptions {
    pub max_width: u32,
    pub max_height: u32,
    #[serde(default)]
    pub fit: FitMode,
    #[serde(default)]
    pub format: OutputFormat,
    /// JPEG 质量 (1-100)，PNG 忽略
    #[serde(default = "default_quality")]
    pub quality: u8,
}

fn default_quality() -> u8 {
    DEFAULT_JPEG_QUALITY
}

impl ImageOptions {
    pub fn new(max_width: u32, max_height: u32, fit: FitMode) -> Self {
        Self {
            max_width,
            max_height,
            fit,
            format: OutputFormat::Jpeg,
            quality: DEFAULT_JPEG_QUALITY,
        }
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality.clamp(1, 100);
        self
    }
}

/// 计算目标尺寸
///
/// 结果的每一边至少为 1 像素
pub fn compute_target_dimensions(
    src_width: u32,
    src_height: u32,
    target_width: u32,
    target_height: u32,
    fit: FitMode,
) -> (u32, u32) {
    if fit == FitMode::Fill {
        return (target_width.max(1), target_height.max(1));
    }
    if src_width == 0 || src_height == 0 {
        return (target_width.max(1), target_height.max(1));
    }

    let ratio_w = target_width as f64 / src_width as f64;
    let ratio_h = target_height as f64 / src_height as f64;
    let ratio = match fit {
        FitMode::Cover => ratio_w.max(ratio_h),
        _ => ratio_w.min(ratio_h),
    };

    let width = (src_width as f64 * ratio).round().max(1.0) as u32;
    let height = (src_height as f64 * ratio).round().max(1.0) as u32;
    (width, height)
}

fn encode(image: &DynamicImage, options: &ImageOptions) -> Result<Vec<u8>, UploadError> {
    let mut buffer = Cursor::new(Vec::new());
    match options.format {
        OutputFormat::Jpeg => {
            // JPEG 不支持透明通道
            let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
            rgb.write_to(&mut buffer, ImageOutputFormat::Jpeg(options.quality))?;
        }
        OutputFormat::Png => {
            image.write_to(&mut buffer, ImageOutputFormat::Png)?;
        }
    }
    Ok(buffer.into_inner())
}

fn renamed(file_name: &str, format: OutputFormat) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");
    format!("{}.{}", stem, format.extension())
}

/// 缩放并重新编码图片
///
/// 非图片文件原样返回；解码和编码在阻塞线程池中执行
pub async fn preprocess_image(
    file: UploadFile,
    options: &ImageOptions,
) -> Result<UploadFile, UploadError> {
    if !file.is_image() {
        return Ok(file);
    }

    let data = file.read_all().await?;
    let options = options.clone();
    let format = options.format;
    let name = file.name.clone();

    let (encoded, width, height) = tokio::task::spawn_blocking(
        move || -> Result<(Vec<u8>, u32, u32), UploadError> {
            let source = image::load_from_memory(&data)?;
            let (width, height) = compute_target_dimensions(
                source.width(),
                source.height(),
                options.max_width,
                options.max_height,
                options.fit,
            );
            debug!(
                "图片缩放: {}x{} -> {}x{} ({:?})",
                source.width(),
                source.height(),
                width,
                height,
                options.fit
            );

            let resized = source.resize_exact(width, height, FilterType::Lanczos3);
            let encoded = encode(&resized, &options)?;
            Ok((encoded, width, height))
        },
    )
    .await
    .map_err(|e| UploadError::Image(format!("图片处理任务异常: {}", e)))??;

    let new_name = renamed(&name, format);
    info!(
        "图片预处理完成: {} -> {} ({}x{}, {} bytes)",
        name,
        new_name,
        width,
        height,
        encoded.len()
    );

    Ok(UploadFile::from_bytes(
        new_name,
        format.mime_type(),
        encoded,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba([200, 10, 10, 128]));
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut buffer, ImageOutputFormat::Png)
            .unwrap();
        buffer.into_inner()
    }

    #[test]
    fn test_contain_dimensions() {
        assert_eq!(
            compute_target_dimensions(800, 600, 400, 400, FitMode::Contain),
            (400, 300)
        );
        assert_eq!(
            compute_target_dimensions(600, 800, 400, 400, FitMode::Contain),
            (300, 400)
        );
    }

    #[test]
    fn test_cover_dimensions() {
        assert_eq!(
            compute_target_dimensions(800, 600, 400, 400, FitMode::Cover),
            (533, 400)
        );
    }

    #[test]
    fn test_fill_dimensions() {
        assert_eq!(
            compute_target_dimensions(800, 600, 400, 400, FitMode::Fill),
            (400, 400)
        );
    }

    #[test]
    fn test_degenerate_dimensions() {
        assert_eq!(
            compute_target_dimensions(10_000, 1, 100, 100, FitMode::Contain),
            (100, 1)
        );
    }

    #[tokio::test]
    async fn test_preprocess_contain_to_jpeg() {
        let file = UploadFile::from_bytes("photo.png", "image/png", png_bytes(800, 600));
        let options = ImageOptions::new(400, 400, FitMode::Contain).with_quality(80);

        let output = preprocess_image(file, &options).await.unwrap();
        assert_eq!(output.name, "photo.jpg");
        assert_eq!(output.mime_type, "image/jpeg");

        let decoded = image::load_from_memory(&output.read_all().await.unwrap()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (400, 300));
    }

    #[tokio::test]
    async fn test_preprocess_png_output() {
        let file = UploadFile::from_bytes("a.png", "image/png", png_bytes(50, 20));
        let options = ImageOptions::new(10, 10, FitMode::Fill).with_format(OutputFormat::Png);

        let output = preprocess_image(file, &options).await.unwrap();
        assert_eq!(output.name, "a.png");
        assert_eq!(output.mime_type, "image/png");
        let decoded = image::load_from_memory(&output.read_all().await.unwrap()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (10, 10));
    }

    #[tokio::test]
    async fn test_non_image_passthrough() {
        let file = UploadFile::from_bytes("a.txt", "text/plain", b"hello".to_vec());
        let options = ImageOptions::new(10, 10, FitMode::Cover);
        let output = preprocess_image(file, &options).await.unwrap();
        assert_eq!(output.name, "a.txt");
        assert_eq!(output.size, 5);
    }

    #[tokio::test]
    async fn test_invalid_image_data() {
        let file = UploadFile::from_bytes("broken.png", "image/png", b"not a png".to_vec());
        let options = ImageOptions::new(10, 10, FitMode::Cover);
        assert!(matches!(
            preprocess_image(file, &options).await,
            Err(UploadError::Image(_))
        ));
    }
}
