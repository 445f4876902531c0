use image::{imageops, Rgb, RgbImage};

use crate::border::Border;

/// 按边框包围盒裁剪，并把形状外部的像素替换为不透明白色
///
/// 编码器输入与落盘展示用的裁剪图都来自这里，保证二者完全一致。
pub fn crop_and_mask(raster: &RgbImage, border: &Border) -> RgbImage {
    let (bx, by, bw, bh) = border.bounding_box(raster.width(), raster.height());
    if bw == 0 || bh == 0 {
        return raster.clone();
    }

    let mut cropped = imageops::crop_imm(raster, bx, by, bw, bh).to_image();
    for (x, y, pixel) in cropped.enumerate_pixels_mut() {
        // 用像素中心点做内外判定
        let ox = (bx + x) as f32 + 0.5;
        let oy = (by + y) as f32 + 0.5;
        if !border.contains(ox, oy) {
            *pixel = Rgb([255, 255, 255]);
        }
    }
    cropped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crop_dimensions_match_bounding_box() {
        let raster = RgbImage::from_pixel(100, 100, Rgb([10, 10, 10]));
        let border = Border::Circle { cx: 50.0, cy: 50.0, radius: 20.0, confidence: 1.0 };
        let cropped = crop_and_mask(&raster, &border);
        assert_eq!((cropped.width(), cropped.height()), (40, 40));
    }

    #[test]
    fn exterior_is_white_interior_kept() {
        let raster = RgbImage::from_pixel(100, 100, Rgb([10, 20, 30]));
        let border = Border::Circle { cx: 50.0, cy: 50.0, radius: 20.0, confidence: 1.0 };
        let cropped = crop_and_mask(&raster, &border);
        // 圆心保持原色
        assert_eq!(cropped.get_pixel(20, 20).0, [10, 20, 30]);
        // 包围盒角落在圆外，应为白色
        assert_eq!(cropped.get_pixel(0, 0).0, [255, 255, 255]);
        assert_eq!(cropped.get_pixel(39, 39).0, [255, 255, 255]);
    }

    #[test]
    fn bounding_box_clamped_at_image_edge() {
        let raster = RgbImage::from_pixel(50, 50, Rgb([0, 0, 0]));
        let border = Border::Circle { cx: 0.0, cy: 0.0, radius: 30.0, confidence: 1.0 };
        let cropped = crop_and_mask(&raster, &border);
        assert_eq!((cropped.width(), cropped.height()), (30, 30));
    }

    #[test]
    fn degenerate_border_returns_input() {
        let raster = RgbImage::from_pixel(10, 10, Rgb([1, 2, 3]));
        let border = Border::Circle { cx: -100.0, cy: -100.0, radius: 1.0, confidence: 1.0 };
        let cropped = crop_and_mask(&raster, &border);
        assert_eq!((cropped.width(), cropped.height()), (10, 10));
    }
}
