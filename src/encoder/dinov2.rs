use std::sync::Mutex;

use anyhow::{anyhow, Result};
use image::RgbImage;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;

use super::{ensure_model, l2_normalize, preprocess, ImageEncoder};

const INPUT_SIDE: u32 = 224;
const DIM: usize = 768;

// ImageNet 归一化常数
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// DINOv2-base 自监督编码器，取 CLS token 作为图片特征
///
/// 原生维度 768，与存储宽度一致，无需补零。
pub struct Dinov2Encoder {
    session: Mutex<Session>,
}

impl Dinov2Encoder {
    pub fn load() -> Result<Self> {
        let model_path = ensure_model(
            "dinov2-base.onnx",
            "https://huggingface.co/Xenova/dinov2-base/resolve/main/onnx/model.onnx",
        )?;
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(&model_path)?;
        Ok(Self { session: Mutex::new(session) })
    }
}

impl ImageEncoder for Dinov2Encoder {
    fn name(&self) -> &'static str {
        "dinov2"
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

        // last_hidden_state 形状为 [1, tokens, 768]，CLS token 是第一行
        let mut embedding = data[..DIM].to_vec();
        l2_normalize(&mut embedding);
        Ok(embedding)
    }
}
