//! 外部模型的接入缝
//!
//! 人脸检测模型与深度推理引擎都在本 crate 之外实现，这里只定义契约。
//! 二者都应在进入并发阶段之前构造一次，再以 `Arc` 注入流水线。

use std::sync::Arc;

use image::{DynamicImage, GenericImageView};
use tracing::{debug, warn};

use crate::saliency::HeatMap;

/// 外部检测器给出的一个候选框（像素坐标，可能越界）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

/// 人脸定位后端
pub trait FaceLocator: Send + Sync {
    fn locate(&self, image: &DynamicImage) -> anyhow::Result<Vec<FaceBox>>;
}

/// 人脸检测结果。未找到人脸时 `region` 为原图。
#[derive(Debug, Clone)]
pub struct FaceDetection {
    pub region: DynamicImage,
    pub found: bool,
    pub confidence: f64,
}

impl FaceDetection {
    fn not_found(image: &DynamicImage) -> Self {
        Self { region: image.clone(), found: false, confidence: 0.0 }
    }
}

/// 取置信度最高的人脸并裁剪。后端缺失或出错时退回整图，从不报错。
#[derive(Clone, Default)]
pub struct FaceDetector {
    locator: Option<Arc<dyn FaceLocator>>,
}

impl FaceDetector {
    pub fn new(locator: Arc<dyn FaceLocator>) -> Self {
        Self { locator: Some(locator) }
    }

    pub fn unavailable() -> Self {
        Self { locator: None }
    }

    pub fn is_available(&self) -> bool {
        self.locator.is_some()
    }

    pub fn detect(&self, image: &DynamicImage) -> FaceDetection {
        let Some(locator) = &self.locator else {
            debug!("人脸检测不可用，使用整图");
            return FaceDetection::not_found(image);
        };

        let boxes = match locator.locate(image) {
            Ok(boxes) => boxes,
            Err(e) => {
                warn!(error = %e, "人脸检测失败");
                return FaceDetection::not_found(image);
            }
        };

        let Some(best) = boxes
            .iter()
            .filter(|b| b.confidence.is_finite())
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
        else {
            debug!("未检测到人脸");
            return FaceDetection::not_found(image);
        };

        let (w, h) = image.dimensions();
        let x1 = best.x1.max(0.0) as u32;
        let y1 = best.y1.max(0.0) as u32;
        let x2 = (best.x2.max(0.0) as u32).min(w);
        let y2 = (best.y2.max(0.0) as u32).min(h);
        if x2 <= x1 || y2 <= y1 {
            warn!(?best, "人脸框坐标无效");
            return FaceDetection::not_found(image);
        }

        let region = image.crop_imm(x1, y1, x2 - x1, y2 - y1);
        debug!(confidence = best.confidence, w = x2 - x1, h = y2 - y1, "检测到人脸");
        FaceDetection { region, found: true, confidence: f64::from(best.confidence) }
    }
}

/// 深度模型的类别概率输出
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prediction {
    pub available: bool,
    pub probs: Vec<f64>,
}

impl Prediction {
    pub fn unavailable() -> Self {
        Self::default()
    }

    /// 伪造类概率：单输出取 `probs[0]`，多输出按 [real, fake, ...] 取 `probs[1]`
    ///
    /// 旧版多输出时报的是 `1 - probs[1]`（即真实类概率），这里有意改为直接取伪造类。
    pub fn manipulation_score(&self) -> Option<f64> {
        if !self.available {
            return None;
        }
        match self.probs.as_slice() {
            [p] => Some(*p),
            [_, fake, ..] => Some(*fake),
            [] => None,
        }
    }
}

/// 深度推理引擎
pub trait InferenceEngine: Send + Sync {
    fn predict(&self, face: &DynamicImage) -> Prediction;

    /// Grad-CAM 之类的显著性图；不支持时返回 `None`
    fn saliency(&self, face: &DynamicImage) -> Option<HeatMap>;
}

/// 没有部署深度模型时的占位实现
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInference;

impl InferenceEngine for NoInference {
    fn predict(&self, _face: &DynamicImage) -> Prediction {
        Prediction::unavailable()
    }

    fn saliency(&self, _face: &DynamicImage) -> Option<HeatMap> {
        None
    }
}
