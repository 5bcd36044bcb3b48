use std::path::PathBuf;

use image::RgbImage;
use serde::Serialize;

use crate::attribution::FamilyMatch;
use crate::features::FeatureVector;
use crate::fingerprint::ImageIdentity;
use crate::quality::QualityVerdict;
use crate::saliency::HeatMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceSummary {
    pub found: bool,
    pub confidence: f64,
    /// 实际参与分析的区域尺寸 [宽, 高]
    pub region_size: [u32; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualitySummary {
    pub accepted: bool,
    pub flags: QualityVerdict,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scores {
    pub heuristic_score: f64,
    pub deep_score: Option<f64>,
}

/// 单张图片的分析结果，交给外层 API 序列化
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub id: String,
    pub identity: ImageIdentity,
    pub face: FaceSummary,
    pub quality: QualitySummary,
    pub scores: Scores,
    pub features: FeatureVector,
    pub attribution_topk: Vec<FamilyMatch>,
    /// 热力图 / 叠加图的落盘路径；未配置输出目录时为空
    pub heatmap: Option<PathBuf>,
    pub overlay: Option<PathBuf>,
    pub notes: Vec<String>,
}

/// 报告 + 内存中的可视化结果
#[derive(Debug, Clone)]
pub struct Analysis {
    pub report: AnalysisReport,
    pub heatmap: HeatMap,
    pub overlay: RgbImage,
}
