use std::f32::consts::PI;
use std::io::Cursor;

use anyhow::Result;
use image::{DynamicImage, ImageFormat, RgbImage};
use log::{debug, warn};
use opencv::core::{Mat, Point, Size, Vec4f, Vector};
use opencv::{imgcodecs, imgproc};

use crate::border::Border;
use crate::config::BorderOptions;

/// 两阶段飞盘轮廓检测器：先做霍夫圆检测，失败或置信度不足时回退到轮廓拟合椭圆
///
/// 检测是尽力而为的：任何内部失败都视为未检出，由调用方回退到整图。
pub struct BorderDetector {
    min_radius_ratio: f32,
    max_radius_ratio: f32,
    confidence_floor: f32,
}

impl BorderDetector {
    pub fn new(opts: &BorderOptions) -> Self {
        Self {
            min_radius_ratio: opts.min_radius_ratio,
            max_radius_ratio: opts.max_radius_ratio,
            confidence_floor: opts.border_confidence,
        }
    }

    pub fn detect(&self, raster: &RgbImage) -> Option<Border> {
        let gray = match to_gray_mat(raster) {
            Ok(mat) => mat,
            Err(e) => {
                warn!("图片转灰度失败: {e}");
                return None;
            }
        };
        let width = raster.width() as i32;
        let height = raster.height() as i32;

        let circle = self
            .detect_circle(&gray, width, height)
            .unwrap_or_else(|e| {
                warn!("圆检测失败: {e}");
                None
            });
        if let Some(border) = circle {
            if border.confidence() >= self.confidence_floor {
                return Some(border);
            }
            debug!("圆置信度 {:.2} 低于下限 {:.2}，尝试椭圆检测", border.confidence(), self.confidence_floor);
        }

        let ellipse = self
            .detect_ellipse(&gray, width, height)
            .unwrap_or_else(|e| {
                warn!("椭圆检测失败: {e}");
                None
            })?;
        (ellipse.confidence() >= self.confidence_floor).then_some(ellipse)
    }

    /// 梯度空间投票（霍夫变换）检测圆
    fn detect_circle(&self, gray: &Mat, width: i32, height: i32) -> Result<Option<Border>> {
        let min_dim = width.min(height) as f32;
        let r_min = ((self.min_radius_ratio * min_dim / 2.0) as i32).max(1);
        let r_max = ((self.max_radius_ratio * min_dim / 2.0) as i32).max(r_min);

        let mut blurred = Mat::default();
        imgproc::gaussian_blur_def(gray, &mut blurred, Size::new(9, 9), 2.0)?;

        // Vec4f 输出的第 4 个分量是累加器票数
        let mut circles = Vector::<Vec4f>::new();
        imgproc::hough_circles(
            &blurred,
            &mut circles,
            imgproc::HOUGH_GRADIENT,
            1.0,
            r_min as f64,
            150.0,
            30.0,
            r_min,
            r_max,
        )?;
        if circles.is_empty() {
            debug!("未检测到圆");
            return Ok(None);
        }

        let center_x = width as f32 / 2.0;
        let center_y = height as f32 / 2.0;
        let max_dist = (center_x * center_x + center_y * center_y).sqrt();
        let margin = 0.05 * min_dim;

        // 0.6 居中程度 + 0.4 半径大小；评分相同取较大半径
        let mut best: Option<(f32, Vec4f)> = None;
        for c in circles.iter() {
            let (x, y, r) = (c[0], c[1], c[2]);
            if x < -margin || y < -margin || x > width as f32 + margin || y > height as f32 + margin {
                continue;
            }
            if r < r_min as f32 || r > r_max as f32 {
                continue;
            }
            let dist = ((x - center_x).powi(2) + (y - center_y).powi(2)).sqrt();
            let score = 0.6 * (1.0 - dist / max_dist) + 0.4 * (r / width.max(height) as f32);
            let better = match &best {
                None => true,
                Some((s, b)) => score > *s || (score == *s && r > b[2]),
            };
            if better {
                best = Some((score, c));
            }
        }

        let Some((_, c)) = best else { return Ok(None) };
        // 置信度 = 票数占圆周长的比例
        let confidence = (c[3] / (2.0 * PI * c[2])).clamp(0.0, 1.0);
        debug!("圆检测: center=({:.0}, {:.0}), r={:.0}, conf={:.2}", c[0], c[1], c[2], confidence);
        Ok(Some(Border::Circle { cx: c[0], cy: c[1], radius: c[2], confidence }))
    }

    /// 轮廓拟合检测椭圆（圆检测失败时的回退路径）
    fn detect_ellipse(&self, gray: &Mat, width: i32, height: i32) -> Result<Option<Border>> {
        let min_dim = width.min(height) as f32;

        let mut blurred = Mat::default();
        imgproc::gaussian_blur_def(gray, &mut blurred, Size::new(5, 5), 0.0)?;

        let block = ((min_dim as i32 / 8) | 1).max(3);
        let mut binary = Mat::default();
        imgproc::adaptive_threshold(
            &blurred,
            &mut binary,
            255.0,
            imgproc::ADAPTIVE_THRESH_GAUSSIAN_C,
            imgproc::THRESH_BINARY_INV,
            block,
            2.0,
        )?;

        let mut contours = Vector::<Vector<Point>>::new();
        imgproc::find_contours(
            &binary,
            &mut contours,
            imgproc::RETR_EXTERNAL,
            imgproc::CHAIN_APPROX_SIMPLE,
            Point::new(0, 0),
        )?;
        if contours.is_empty() {
            debug!("未找到轮廓");
            return Ok(None);
        }

        let r_min = self.min_radius_ratio * min_dim / 2.0;
        let min_area = PI * r_min * r_min;
        let img_area = (width * height) as f32;
        let center_x = width as f32 / 2.0;
        let center_y = height as f32 / 2.0;
        let max_dist = (center_x * center_x + center_y * center_y).sqrt();

        let mut best: Option<(f32, f32, EllipseFit)> = None;
        for contour in contours.iter() {
            if contour.len() < 5 {
                continue;
            }
            let Ok(area) = imgproc::contour_area_def(&contour) else { continue };
            let area = area as f32;
            if area < min_area {
                continue;
            }

            // 凸性过滤：凹陷过多的轮廓不可能是飞盘
            let mut hull = Vector::<Point>::new();
            if imgproc::convex_hull(&contour, &mut hull, false, true).is_err() {
                continue;
            }
            let Ok(hull_area) = imgproc::contour_area_def(&hull) else { continue };
            if hull_area <= 0.0 || area / hull_area as f32 < 0.8 {
                continue;
            }

            let Some(fit) = fit_ellipse_moments(&contour) else { continue };
            if fit.minor / fit.major < 0.7 {
                // 过于狭长
                continue;
            }

            let dist = ((fit.cx - center_x).powi(2) + (fit.cy - center_y).powi(2)).sqrt();
            let position_score = 1.0 - dist / max_dist;
            let size_score = (PI * fit.major * fit.minor / img_area).min(1.0);
            let fit_score = (1.0 - fit_residual(&contour, &fit)).max(0.0);
            let score = 0.5 * position_score + 0.3 * size_score + 0.2 * fit_score;

            let better = match &best {
                None => true,
                Some((s, a, _)) => score > *s || (score == *s && area > *a),
            };
            if better {
                best = Some((score, area, fit));
            }
        }

        let Some((score, _, fit)) = best else {
            debug!("未找到符合条件的椭圆");
            return Ok(None);
        };
        let confidence = score.clamp(0.0, 1.0);
        debug!(
            "椭圆检测: center=({:.0}, {:.0}), axes=({:.0}, {:.0}), angle={:.1}, conf={:.2}",
            fit.cx, fit.cy, fit.major, fit.minor, fit.angle, confidence
        );
        Ok(Some(Border::Ellipse {
            cx: fit.cx,
            cy: fit.cy,
            major: fit.major,
            minor: fit.minor,
            angle: fit.angle,
            confidence,
        }))
    }
}

struct EllipseFit {
    cx: f32,
    cy: f32,
    /// 半长轴
    major: f32,
    /// 半短轴
    minor: f32,
    /// 长轴相对 x 轴的角度（度）
    angle: f32,
}

/// 由图像矩拟合椭圆：质心 + 二阶中心矩的特征分解
fn fit_ellipse_moments(contour: &Vector<Point>) -> Option<EllipseFit> {
    let m = imgproc::moments(contour, false).ok()?;
    if m.m00.abs() < 1e-6 {
        return None;
    }
    let cx = m.m10 / m.m00;
    let cy = m.m01 / m.m00;
    let mu20 = m.mu20 / m.m00;
    let mu02 = m.mu02 / m.m00;
    let mu11 = m.mu11 / m.m00;

    let common = ((mu20 - mu02).powi(2) + 4.0 * mu11 * mu11).sqrt();
    let l1 = (mu20 + mu02 + common) / 2.0;
    let l2 = (mu20 + mu02 - common) / 2.0;
    if l2 <= 0.0 {
        return None;
    }

    // 均匀椭圆的特征值与半轴满足 λ = a²/4
    let major = 2.0 * l1.sqrt();
    let minor = 2.0 * l2.sqrt();
    let angle = (0.5 * (2.0 * mu11).atan2(mu20 - mu02)).to_degrees();

    Some(EllipseFit {
        cx: cx as f32,
        cy: cy as f32,
        major: major as f32,
        minor: minor as f32,
        angle: angle as f32,
    })
}

/// 轮廓点相对拟合椭圆的平均代数残差
fn fit_residual(contour: &Vector<Point>, fit: &EllipseFit) -> f32 {
    let (sin, cos) = fit.angle.to_radians().sin_cos();
    let mut total = 0.0f32;
    let mut count = 0u32;
    for p in contour.iter() {
        let dx = p.x as f32 - fit.cx;
        let dy = p.y as f32 - fit.cy;
        let u = dx * cos + dy * sin;
        let v = -dx * sin + dy * cos;
        let value = (u / fit.major).powi(2) + (v / fit.minor).powi(2);
        total += (value - 1.0).abs();
        count += 1;
    }
    if count == 0 {
        return 1.0;
    }
    (total / count as f32).min(1.0)
}

fn to_gray_mat(raster: &RgbImage) -> Result<Mat> {
    let gray = DynamicImage::ImageRgb8(raster.clone()).to_luma8();
    let mut buf = Vec::new();
    DynamicImage::ImageLuma8(gray).write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    let encoded = Vector::<u8>::from(buf);
    Ok(imgcodecs::imdecode(&encoded, imgcodecs::IMREAD_GRAYSCALE)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BorderOptions;
    use image::Rgb;

    fn detector() -> BorderDetector {
        BorderDetector::new(&BorderOptions {
            no_border: false,
            border_confidence: 0.3,
            min_radius_ratio: 0.25,
            max_radius_ratio: 1.0,
        })
    }

    #[test]
    fn flat_image_yields_no_border() {
        let raster = RgbImage::from_pixel(200, 200, Rgb([128, 128, 128]));
        assert!(detector().detect(&raster).is_none());
    }

    #[test]
    fn solid_circle_detected_near_truth() {
        // 白底上一个实心深色圆
        let mut raster = RgbImage::from_pixel(200, 200, Rgb([255, 255, 255]));
        for (x, y, pixel) in raster.enumerate_pixels_mut() {
            let dx = x as f32 - 100.0;
            let dy = y as f32 - 100.0;
            if dx * dx + dy * dy <= 60.0 * 60.0 {
                *pixel = Rgb([40, 40, 40]);
            }
        }

        let border = detector().detect(&raster).expect("应检测到轮廓");
        match border {
            Border::Circle { cx, cy, radius, confidence } => {
                assert!((cx - 100.0).abs() <= 10.0, "cx = {cx}");
                assert!((cy - 100.0).abs() <= 10.0, "cy = {cy}");
                assert!((radius - 60.0).abs() <= 15.0, "radius = {radius}");
                assert!((0.0..=1.0).contains(&confidence));
            }
            Border::Ellipse { cx, cy, major, minor, .. } => {
                assert!((cx - 100.0).abs() <= 10.0, "cx = {cx}");
                assert!((cy - 100.0).abs() <= 10.0, "cy = {cy}");
                assert!((major - 60.0).abs() <= 15.0, "major = {major}");
                assert!((minor - 60.0).abs() <= 15.0, "minor = {minor}");
            }
        }
    }
}
