use tracing::{debug, warn};

use crate::features::FeatureVector;

/// 无法打分时的中性分
pub const NEUTRAL_SCORE: f64 = 0.5;

/// ELA 均值与拉普拉斯方差的归一化尺度
const ELA_SCALE: f64 = 50.0;
const LAP_SCALE: f64 = 200.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeuristicWeights {
    pub fft_weight: f64,
    pub ela_weight: f64,
    pub lap_weight: f64,
    pub jpeg_weight: f64,
    /// sigmoid 的偏置项
    pub threshold: f64,
    pub steepness: f64,
}

impl Default for HeuristicWeights {
    fn default() -> Self {
        Self {
            fft_weight: 0.9,
            ela_weight: 0.6,
            lap_weight: 0.2,
            jpeg_weight: 0.15,
            threshold: 0.7,
            steepness: 4.0,
        }
    }
}

/// 启发式伪造可能性打分器
#[derive(Debug, Clone)]
pub struct HeuristicScorer {
    weights: HeuristicWeights,
}

impl HeuristicScorer {
    pub fn new(weights: HeuristicWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &HeuristicWeights {
        &self.weights
    }

    /// 线性加权后过 sigmoid，结果钳到 [0, 1]。量化代理分取负权重。
    pub fn score(&self, features: &FeatureVector) -> f64 {
        let Some(core) = features.core() else {
            warn!("缺少核心特征，返回中性分");
            return NEUTRAL_SCORE;
        };

        let w = &self.weights;
        let x = w.fft_weight * core.fft_high_ratio
            + w.ela_weight * (core.ela_mean / ELA_SCALE)
            + w.lap_weight * (core.lap_var / LAP_SCALE)
            - w.jpeg_weight * core.jpeg_score;

        let s = 1.0 / (1.0 + (-w.steepness * (x - w.threshold)).exp());
        if s.is_nan() {
            warn!(x, "打分结果非数值，返回中性分");
            return NEUTRAL_SCORE;
        }

        let score = s.clamp(0.0, 1.0);
        debug!(score, "启发式打分");
        score
    }
}

impl Default for HeuristicScorer {
    fn default() -> Self {
        Self::new(HeuristicWeights::default())
    }
}
