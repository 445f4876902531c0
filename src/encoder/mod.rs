mod clip;
mod dinov2;

pub use clip::ClipEncoder;
pub use dinov2::Dinov2Encoder;

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, Result};
use clap::ValueEnum;
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use log::info;

/// 向量存储的物理维度（D_max）
///
/// 原生维度不足的编码器在入库前右侧补零到该长度；
/// 余弦相似度对补零不变，因此同一编码器内的检索仍是精确的。
pub const EMBED_DIM: usize = 768;

/// 图片编码器：输入 RGB 位图，输出 L2 归一化的特征向量
///
/// `embed` 对相同输入必须是确定性的。后端自身不可重入时应
/// 在内部用互斥锁串行化推理。
pub trait ImageEncoder: Send + Sync {
    /// 稳定的短名称，随向量一起入库
    fn name(&self) -> &'static str;

    /// 原生输出维度
    fn dimension(&self) -> usize;

    /// 提取特征向量，长度等于 `dimension()`，已做 L2 归一化
    ///
    /// 零范数的退化输出会原样返回全零向量，由调用方拒绝入库。
    fn embed(&self, image: &RgbImage) -> Result<Vec<f32>>;
}

/// 可选的编码器后端
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderKind {
    Clip,
    Dinov2,
}

impl EncoderKind {
    pub fn create(self) -> Result<Arc<dyn ImageEncoder>> {
        info!("初始化 {self} 编码器");
        Ok(match self {
            Self::Clip => Arc::new(ClipEncoder::load()?),
            Self::Dinov2 => Arc::new(Dinov2Encoder::load()?),
        })
    }
}

impl fmt::Display for EncoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clip => write!(f, "clip"),
            Self::Dinov2 => write!(f, "dinov2"),
        }
    }
}

static ACTIVE: OnceLock<(EncoderKind, Arc<dyn ImageEncoder>)> = OnceLock::new();

/// 进程级的单活动编码器：首次使用时惰性构造并缓存到进程结束
///
/// 初始化之后再请求另一个后端属于配置错误。
pub fn global(kind: EncoderKind) -> Result<Arc<dyn ImageEncoder>> {
    if ACTIVE.get().is_none() {
        let encoder = kind.create()?;
        let _ = ACTIVE.set((kind, encoder));
    }
    let (active, encoder) = ACTIVE.get().expect("encoder registry initialized");
    if *active != kind {
        return Err(anyhow!("活动编码器已设为 {active}，无法再切换到 {kind}"));
    }
    Ok(encoder.clone())
}

/// 各后端共享的预处理：缩放短边到 `side`（Lanczos），中心裁剪为正方形，
/// 像素缩放到 [0, 1] 后按通道标准化，输出 NCHW 排布
pub(crate) fn preprocess(image: &RgbImage, side: u32, mean: [f32; 3], std: [f32; 3]) -> Vec<f32> {
    let resized = DynamicImage::ImageRgb8(image.clone())
        .resize_to_fill(side, side, FilterType::Lanczos3)
        .to_rgb8();

    let side = side as usize;
    let plane = side * side;
    let mut data = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in resized.enumerate_pixels() {
        let idx = y as usize * side + x as usize;
        for c in 0..3 {
            data[c * plane + idx] = (pixel.0[c] as f32 / 255.0 - mean[c]) / std[c];
        }
    }
    data
}

/// 原地 L2 归一化，返回归一化前的范数；零向量保持不变
pub fn l2_normalize(v: &mut [f32]) -> f32 {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    norm
}

/// 右侧补零到 [`EMBED_DIM`]
pub fn pad_embedding(mut v: Vec<f32>) -> Result<Vec<f32>> {
    if v.len() > EMBED_DIM {
        return Err(anyhow!("向量维度 {} 超过存储宽度 {EMBED_DIM}", v.len()));
    }
    v.resize(EMBED_DIM, 0.0);
    Ok(v)
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a > 0.0 && norm_b > 0.0 {
        dot / (norm_a * norm_b)
    } else {
        0.0
    }
}

/// 模型缓存目录
pub(crate) fn models_dir() -> Result<PathBuf> {
    let data_dir =
        dirs::data_local_dir().ok_or_else(|| anyhow!("无法确定本地数据目录"))?;
    let dir = data_dir.join("discsearch").join("models");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// 模型文件不存在时从远端下载
pub(crate) fn ensure_model(filename: &str, url: &str) -> Result<PathBuf> {
    let path = models_dir()?.join(filename);
    if !path.exists() {
        info!("下载模型 {filename} ...");
        let response = ureq::get(url)
            .call()
            .map_err(|e| anyhow!("模型下载失败: {e}"))?;
        let mut file = std::fs::File::create(&path)?;
        std::io::copy(&mut response.into_reader(), &mut file)?;
        info!("模型已保存到 {}", path.display());
    }
    Ok(path)
}
