use std::io::Cursor;

use image::{DynamicImage, ImageFormat, RgbImage};
use log::{debug, warn};

use crate::error::MatcherError;

/// 规范化后的输入图片
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    /// 按 EXIF 方向摆正、去除 alpha 后的 RGB 位图
    pub raster: RgbImage,
    /// 原始容器格式（png 或 jpeg）
    pub format: ImageFormat,
}

impl NormalizedImage {
    /// 落盘时使用的扩展名
    pub fn extension(&self) -> &'static str {
        match self.format {
            ImageFormat::Png => "png",
            _ => "jpg",
        }
    }
}

/// 校验并解码上传的图片字节
///
/// 依次执行：大小检查、格式检查、解码、EXIF 方向矫正、alpha 压到白底。
/// 分辨率保持不变。
pub fn normalize(
    bytes: &[u8],
    content_type: &str,
    max_bytes: usize,
) -> Result<NormalizedImage, MatcherError> {
    if bytes.len() > max_bytes {
        return Err(MatcherError::Oversize { size: bytes.len(), limit: max_bytes });
    }

    match content_type {
        "image/png" | "image/jpeg" | "image/jpg" => {}
        other => return Err(MatcherError::UnsupportedFormat(other.to_string())),
    }

    // 以实际容器为准，声明的 content type 只做白名单检查
    let format = image::guess_format(bytes)
        .map_err(|e| MatcherError::Undecodable(e.to_string()))?;
    if !matches!(format, ImageFormat::Png | ImageFormat::Jpeg) {
        return Err(MatcherError::UnsupportedFormat(format!("{format:?}")));
    }

    let img = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| MatcherError::Undecodable(e.to_string()))?;

    let img = apply_exif_orientation(img, bytes);
    let raster = flatten_to_rgb(img);
    debug!("图片解码完成: {}x{}, {:?}", raster.width(), raster.height(), format);

    Ok(NormalizedImage { raster, format })
}

/// 读取 EXIF 方向标签并据此旋转/翻转图片，使可见场景的上方位于第 0 行
fn apply_exif_orientation(img: DynamicImage, bytes: &[u8]) -> DynamicImage {
    let orientation = match exif::Reader::new().read_from_container(&mut Cursor::new(bytes)) {
        Ok(exif) => exif
            .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
            .and_then(|field| field.value.get_uint(0)),
        Err(_) => None,
    };

    let Some(orientation) = orientation else {
        return img;
    };

    // image crate 的 rotate90 为顺时针，EXIF 5/7/8 的逆时针旋转对应 rotate270
    match orientation {
        1 => img,
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.fliph().rotate270(),
        6 => img.rotate90(),
        7 => img.fliph().rotate90(),
        8 => img.rotate270(),
        other => {
            warn!("未知的 EXIF 方向值: {other}");
            img
        }
    }
}

/// 转换为 RGB；带 alpha 通道时压到不透明白底上
fn flatten_to_rgb(img: DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }

    let rgba = img.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        let a = a as u16;
        let blend = |c: u8| ((c as u16 * a + 255 * (255 - a)) / 255) as u8;
        out.put_pixel(x, y, image::Rgb([blend(r), blend(g), blend(b)]));
    }
    out
}
