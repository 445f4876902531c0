mod detector;
mod processor;

pub use detector::BorderDetector;
pub use processor::crop_and_mask;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// 检测到的飞盘轮廓，坐标均为原图像素坐标系
///
/// 椭圆的 `major`/`minor` 为半轴且保证 major >= minor，
/// `angle` 为长轴相对图像 x 轴的角度（度）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Border {
    Circle { cx: f32, cy: f32, radius: f32, confidence: f32 },
    Ellipse { cx: f32, cy: f32, major: f32, minor: f32, angle: f32, confidence: f32 },
}

impl Border {
    pub fn confidence(&self) -> f32 {
        match self {
            Self::Circle { confidence, .. } | Self::Ellipse { confidence, .. } => *confidence,
        }
    }

    /// 轮廓的轴对齐包围盒，截断到图片边界内，返回 (x, y, 宽, 高)
    pub fn bounding_box(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let (cx, cy, half_w, half_h) = match *self {
            Self::Circle { cx, cy, radius, .. } => (cx, cy, radius, radius),
            Self::Ellipse { cx, cy, major, minor, angle, .. } => {
                // 旋转椭圆的包围盒半宽/半高
                let (sin, cos) = angle.to_radians().sin_cos();
                let half_w = ((major * cos).powi(2) + (minor * sin).powi(2)).sqrt();
                let half_h = ((major * sin).powi(2) + (minor * cos).powi(2)).sqrt();
                (cx, cy, half_w, half_h)
            }
        };

        let x0 = (cx - half_w).max(0.0).floor() as u32;
        let y0 = (cy - half_h).max(0.0).floor() as u32;
        let x1 = ((cx + half_w).ceil() as u32).min(width);
        let y1 = ((cy + half_h).ceil() as u32).min(height);
        (x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0))
    }

    /// 判断一个点是否位于轮廓内部
    pub fn contains(&self, x: f32, y: f32) -> bool {
        match *self {
            Self::Circle { cx, cy, radius, .. } => {
                (x - cx).powi(2) + (y - cy).powi(2) <= radius * radius
            }
            Self::Ellipse { cx, cy, major, minor, angle, .. } => {
                if major <= 0.0 || minor <= 0.0 {
                    return false;
                }
                let (sin, cos) = angle.to_radians().sin_cos();
                let dx = x - cx;
                let dy = y - cy;
                let u = dx * cos + dy * sin;
                let v = -dx * sin + dy * cos;
                (u / major).powi(2) + (v / minor).powi(2) <= 1.0
            }
        }
    }
}
