use std::sync::Mutex;

use anyhow::{anyhow, Result};
use image::RgbImage;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;

use super::{ensure_model, l2_normalize, preprocess, ImageEncoder};

const INPUT_SIDE: u32 = 224;
const DIM: usize = 512;

// CLIP 官方的按通道归一化常数
const MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

/// CLIP ViT-B/32 图像塔编码器（ONNX 推理，默认 CPU）
///
/// ONNX Runtime 的 Session 推理需要独占访问，用互斥锁串行化；
/// 推理本身是延迟大头，排队是可接受的。
pub struct ClipEncoder {
    session: Mutex<Session>,
}

impl ClipEncoder {
    /// 加载模型，不存在时先下载
    pub fn load() -> Result<Self> {
        let model_path = ensure_model(
            "clip-vit-b32-vision.onnx",
            "https://huggingface.co/Qdrant/clip-ViT-B-32-vision/resolve/main/model.onnx",
        )?;
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(&model_path)?;
        Ok(Self { session: Mutex::new(session) })
    }
}

impl ImageEncoder for ClipEncoder {
    fn name(&self) -> &'static str {
        "clip"
    }

    fn dimension(&self) -> usize {
        DIM
    }

    fn embed(&self, image: &RgbImage) -> Result<Vec<f32>> {
        let input = preprocess(image, INPUT_SIDE, MEAN, STD);
        let side = INPUT_SIDE as usize;
        let tensor = Tensor::from_array(([1usize, 3, side, side], input.into_boxed_slice()))?;

        let mut session = self.session.lock().map_err(|e| anyhow!("模型锁中毒: {e}"))?;
        let outputs = session.run(ort::inputs!["pixel_values" => tensor])?;
        let output = outputs.iter().next().ok_or_else(|| anyhow!("模型没有输出"))?;
        let (_, data) = output.1.try_extract_tensor::<f32>()?;
        if data.len() < DIM {
            return Err(anyhow!("输出长度 {} 小于预期维度 {DIM}", data.len()));
        }

        let mut embedding = data[..DIM].to_vec();
        l2_normalize(&mut embedding);
        Ok(embedding)
    }
}
