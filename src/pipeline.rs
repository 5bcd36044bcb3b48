//! 单张图片分析流水线
//!
//! 人脸检测 -> 质量判定 -> 特征提取 -> 启发式打分 (+ 深度模型) -> 归因 -> 热力图 -> 报告。
//! 特征、打分、热力图、指纹库查询的失败都在本地降级，不会让整张图失败；
//! 只有解码失败和可视化落盘失败会作为该图的失败返回。

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{bail, Context};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use tracing::{info, warn};

use crate::attribution::{AttributionIndex, FamilyStats};
use crate::collaborators::{FaceDetector, FaceLocator, InferenceEngine, NoInference};
use crate::config::Config;
use crate::error::{ConfigError, IndexError};
use crate::fingerprint::image_identity;
use crate::quality::{accept_image, QualityPolicy};
use crate::report::{Analysis, AnalysisReport, FaceSummary, QualitySummary, Scores};
use crate::saliency::{self, SaliencySettings};
use crate::scorer::HeuristicScorer;
use crate::signals::{extract_features, ExtractorSettings};

/// 指纹库学习的结果
#[derive(Debug, Clone, PartialEq)]
pub enum LearnOutcome {
    Learned,
    /// 质量门未通过，附带诊断码
    Refused(Vec<String>),
}

pub struct Pipeline {
    quality: QualityPolicy,
    extractor: ExtractorSettings,
    saliency: SaliencySettings,
    scorer: HeuristicScorer,
    faces: FaceDetector,
    engine: Arc<dyn InferenceEngine>,
    /// 进程内读写锁：匹配走读锁，增量学习在写锁内完成整个改写 + 落盘
    index: Arc<RwLock<AttributionIndex>>,
    output_dir: Option<PathBuf>,
    analysis_min_side: u32,
    max_analysis_side: u32,
    top_k: usize,
}

impl Pipeline {
    /// 校验配置并打开指纹库。外部模型默认不可用，通过 `with_*` 注入。
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            quality: config.quality,
            extractor: config.extractor,
            saliency: config.saliency,
            scorer: HeuristicScorer::new(config.weights),
            faces: FaceDetector::unavailable(),
            engine: Arc::new(NoInference),
            index: Arc::new(RwLock::new(AttributionIndex::open(&config.fingerprints_path))),
            output_dir: config.output_dir.clone(),
            analysis_min_side: config.analysis_min_side,
            max_analysis_side: config.max_analysis_side,
            top_k: config.top_k,
        })
    }

    pub fn with_face_locator(mut self, locator: Arc<dyn FaceLocator>) -> Self {
        self.faces = FaceDetector::new(locator);
        self
    }

    pub fn with_inference_engine(mut self, engine: Arc<dyn InferenceEngine>) -> Self {
        self.engine = engine;
        self
    }

    /// 解码并分析。解码失败即该图失败。
    pub fn analyze_bytes(&self, id: &str, bytes: &[u8]) -> anyhow::Result<Analysis> {
        let image = image::load_from_memory(bytes).context("failed to decode image")?;
        self.analyze_decoded(id, bytes, image)
    }

    fn analyze_decoded(&self, id: &str, bytes: &[u8], image: DynamicImage) -> anyhow::Result<Analysis> {
        let (w, h) = image.dimensions();
        if w == 0 || h == 0 {
            bail!("image has no pixels ({w}x{h})");
        }

        let identity = image_identity(bytes, &image);
        let image = ensure_min_side(image, self.analysis_min_side, self.max_analysis_side)?;
        let mut notes = Vec::new();

        let face = self.faces.detect(&image);
        let (fw, fh) = face.region.dimensions();
        let verdict = accept_image(face.found, face.confidence, fw, fh, &self.quality);

        let extraction = extract_features(&face.region, &self.extractor);
        if extraction.degraded {
            notes.push("Features degraded to neutral defaults".to_string());
        }
        let heuristic_score = self.scorer.score(&extraction.features);

        let prediction = self.engine.predict(&face.region);
        let deep_score = prediction.manipulation_score();
        let model_note = if prediction.available { "Deep model used" } else { "Deep model unavailable" };
        notes.push(model_note.to_string());

        let attribution_topk = self
            .index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .match_features(&extraction.features, self.top_k);

        let external = if prediction.available { self.engine.saliency(&face.region) } else { None };
        let heatmap = match external {
            Some(map) => {
                notes.push("External saliency map".to_string());
                map
            }
            None => {
                notes.push("Forensic fallback heatmap".to_string());
                saliency::try_fallback_heatmap(&face.region, &self.saliency).unwrap_or_else(|e| {
                    warn!(id, error = %e, "兜底热力图生成失败，使用均匀图");
                    notes.push("Heatmap degraded to uniform".to_string());
                    saliency::uniform_heatmap(fw, fh)
                })
            }
        };

        let base = face.region.to_rgb8();
        let overlay = saliency::try_overlay(&base, &heatmap, self.saliency.overlay_alpha).unwrap_or_else(|e| {
            warn!(id, error = %e, "热力图叠加失败，返回原图");
            notes.push("Overlay unavailable, base image returned".to_string());
            base.clone()
        });

        let (heatmap_path, overlay_path) = match &self.output_dir {
            Some(dir) => {
                let (heat, over) = save_artifacts(dir, id, &heatmap, &overlay)?;
                (Some(heat), Some(over))
            }
            None => (None, None),
        };

        let report = AnalysisReport {
            id: id.to_string(),
            identity,
            face: FaceSummary { found: face.found, confidence: face.confidence, region_size: [fw, fh] },
            quality: QualitySummary { accepted: verdict.accepted, flags: verdict },
            scores: Scores { heuristic_score, deep_score },
            features: extraction.features,
            attribution_topk,
            heatmap: heatmap_path,
            overlay: overlay_path,
            notes,
        };

        info!(
            id,
            face = report.face.found,
            heuristic_score = report.scores.heuristic_score,
            deep_score = ?report.scores.deep_score,
            "分析完成"
        );
        Ok(Analysis { report, heatmap, overlay })
    }

    /// 外部打标确认家族后回灌指纹库；仅质量门通过的样本可以学习
    pub fn learn(&self, family: &str, report: &AnalysisReport) -> Result<LearnOutcome, IndexError> {
        if !report.quality.accepted {
            info!(id = %report.id, family, notes = ?report.quality.flags.notes, "样本未通过质量门，拒绝学习");
            return Ok(LearnOutcome::Refused(report.quality.flags.notes.clone()));
        }
        self.index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add_sample(family, &report.features)?;
        Ok(LearnOutcome::Learned)
    }

    pub fn family_stats(&self) -> FamilyStats {
        self.index.read().unwrap_or_else(PoisonError::into_inner).family_stats()
    }

    pub fn family_names(&self) -> Vec<String> {
        self.index.read().unwrap_or_else(PoisonError::into_inner).family_names()
    }
}

/// 短边不足 `min_side` 时等比放大。原图或放大后的长边超过 `max_side` 时报错。
pub fn ensure_min_side(image: DynamicImage, min_side: u32, max_side: u32) -> anyhow::Result<DynamicImage> {
    let (w, h) = image.dimensions();
    if w.max(h) > max_side {
        bail!("image {w}x{h} exceeds the maximum analysis side of {max_side}");
    }
    let short = w.min(h);
    if short >= min_side || short == 0 {
        return Ok(image);
    }
    let scale = f64::from(min_side) / f64::from(short);
    let nw = (f64::from(w) * scale).round();
    let nh = (f64::from(h) * scale).round();
    if nw.max(nh) > f64::from(max_side) {
        bail!("upscaling {w}x{h} to a short side of {min_side} exceeds the maximum analysis side of {max_side}");
    }
    Ok(image.resize(nw.max(1.0) as u32, nh.max(1.0) as u32, FilterType::Lanczos3))
}

fn save_artifacts(
    dir: &Path,
    id: &str,
    heatmap: &saliency::HeatMap,
    overlay: &image::RgbImage,
) -> anyhow::Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let heat_path = dir.join(format!("heat_{id}.png"));
    let overlay_path = dir.join(format!("overlay_{id}.png"));

    saliency::to_gray(heatmap)
        .save(&heat_path)
        .with_context(|| format!("failed to write {}", heat_path.display()))?;
    overlay
        .save(&overlay_path)
        .with_context(|| format!("failed to write {}", overlay_path.display()))?;
    Ok((heat_path, overlay_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{FaceBox, Prediction};
    use crate::saliency::HeatMap;
    use image::{ImageBuffer, ImageOutputFormat, Luma, Rgb};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn png_bytes(w: u32, h: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(ImageBuffer::from_fn(w, h, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x * y) % 256) as u8])
        }));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageOutputFormat::Png).unwrap();
        buf.into_inner()
    }

    fn config(dir: &TempDir, output: bool) -> Config {
        Config {
            fingerprints_path: dir.path().join("fingerprints.json"),
            output_dir: output.then(|| dir.path().join("out")),
            ..Config::default()
        }
    }

    struct WholeFace(f32);

    impl FaceLocator for WholeFace {
        fn locate(&self, image: &DynamicImage) -> anyhow::Result<Vec<FaceBox>> {
            let (w, h) = image.dimensions();
            Ok(vec![FaceBox { x1: 0.0, y1: 0.0, x2: w as f32, y2: h as f32, confidence: self.0 }])
        }
    }

    struct FakeModel;

    impl InferenceEngine for FakeModel {
        fn predict(&self, _face: &DynamicImage) -> Prediction {
            Prediction { available: true, probs: vec![0.1, 0.9] }
        }

        fn saliency(&self, _face: &DynamicImage) -> Option<HeatMap> {
            Some(ImageBuffer::from_pixel(7, 7, Luma([0.3])))
        }
    }

    #[test]
    fn analysis_without_models_uses_fallbacks() {
        let dir = TempDir::new().unwrap();
        let pipeline = Pipeline::new(&config(&dir, true)).unwrap();
        let analysis = pipeline.analyze_bytes("abc", &png_bytes(300, 300)).unwrap();
        let report = &analysis.report;

        assert!(!report.face.found);
        assert!(!report.quality.accepted);
        assert_eq!(report.scores.deep_score, None);
        assert!((0.0..=1.0).contains(&report.scores.heuristic_score));
        assert_eq!(report.attribution_topk.len(), 3);
        assert!(report.notes.contains(&"Deep model unavailable".to_string()));
        assert!(report.notes.contains(&"Forensic fallback heatmap".to_string()));
        assert!(report.heatmap.as_ref().unwrap().exists());
        assert!(report.overlay.as_ref().unwrap().exists());
        assert_eq!(analysis.overlay.dimensions(), (300, 300));
    }

    #[test]
    fn injected_models_are_used() {
        let dir = TempDir::new().unwrap();
        let pipeline = Pipeline::new(&config(&dir, false))
            .unwrap()
            .with_face_locator(Arc::new(WholeFace(0.99)))
            .with_inference_engine(Arc::new(FakeModel));

        let report = pipeline.analyze_bytes("m", &png_bytes(256, 256)).unwrap().report;
        assert!(report.face.found);
        assert!(report.quality.accepted);
        assert_eq!(report.scores.deep_score, Some(0.9));
        assert!(report.notes.contains(&"External saliency map".to_string()));
        assert_eq!(report.heatmap, None);
    }

    #[test]
    fn small_images_are_upscaled_before_analysis() {
        let dir = TempDir::new().unwrap();
        let pipeline = Pipeline::new(&config(&dir, false)).unwrap();
        let report = pipeline.analyze_bytes("s", &png_bytes(128, 64)).unwrap().report;
        assert_eq!(report.face.region_size, [512, 256]);
    }

    #[test]
    fn extreme_aspect_ratio_fails_instead_of_upscaling() {
        let dir = TempDir::new().unwrap();
        let pipeline = Pipeline::new(&config(&dir, false)).unwrap();
        let err = pipeline.analyze_bytes("thin", &png_bytes(4000, 2)).unwrap_err();
        assert!(err.to_string().contains("maximum analysis side"));

        let err = pipeline.analyze_bytes("huge", &png_bytes(5000, 300)).unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn upscale_bound_is_checked_before_resizing() {
        let thin = DynamicImage::ImageRgb8(ImageBuffer::new(1000, 10));
        assert!(ensure_min_side(thin.clone(), 256, 4096).is_err());
        let scaled = ensure_min_side(thin, 20, 4096).unwrap();
        assert_eq!(scaled.dimensions(), (2000, 20));
    }

    #[test]
    fn undecodable_bytes_fail() {
        let dir = TempDir::new().unwrap();
        let pipeline = Pipeline::new(&config(&dir, false)).unwrap();
        assert!(pipeline.analyze_bytes("x", b"definitely not an image").is_err());
    }

    #[test]
    fn learning_is_gated_by_quality() {
        let dir = TempDir::new().unwrap();
        let plain = Pipeline::new(&config(&dir, false)).unwrap();
        let rejected = plain.analyze_bytes("r", &png_bytes(256, 256)).unwrap().report;
        assert_eq!(
            plain.learn("faceswap_blend", &rejected).unwrap(),
            LearnOutcome::Refused(vec!["no_face_found".to_string()])
        );
        assert_eq!(plain.family_stats().total_samples, 0);

        let with_face = Pipeline::new(&config(&dir, false))
            .unwrap()
            .with_face_locator(Arc::new(WholeFace(0.95)));
        let accepted = with_face.analyze_bytes("a", &png_bytes(256, 256)).unwrap().report;
        assert_eq!(with_face.learn("new_family", &accepted).unwrap(), LearnOutcome::Learned);
        assert_eq!(with_face.family_stats().total_samples, 1);
        assert!(with_face.family_names().contains(&"new_family".to_string()));
    }

    #[test]
    fn invalid_config_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut bad = config(&dir, false);
        bad.top_k = 0;
        assert!(Pipeline::new(&bad).is_err());
    }
}
