use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::quality::QualityPolicy;
use crate::saliency::SaliencySettings;
use crate::scorer::HeuristicWeights;
use crate::signals::ExtractorSettings;

#[derive(Debug, Clone)]
pub struct Config {
    /// 指纹库 JSON 文件
    pub fingerprints_path: PathBuf,
    /// 热力图 / 叠加图输出目录，`None` 表示不落盘
    pub output_dir: Option<PathBuf>,
    /// 短边低于该值的图片在分析前等比放大
    pub analysis_min_side: u32,
    /// 分析尺寸的长边上限（含放大之后）
    pub max_analysis_side: u32,
    pub quality: QualityPolicy,
    pub weights: HeuristicWeights,
    pub extractor: ExtractorSettings,
    pub saliency: SaliencySettings,
    pub workers: usize,
    pub max_batch_size: usize,
    pub top_k: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fingerprints_path: PathBuf::from("data/fingerprints.json"),
            output_dir: Some(PathBuf::from("outputs")),
            analysis_min_side: 256,
            max_analysis_side: 4096,
            quality: QualityPolicy::default(),
            weights: HeuristicWeights::default(),
            extractor: ExtractorSettings::default(),
            saliency: SaliencySettings::default(),
            workers: 4,
            max_batch_size: 5,
            top_k: 3,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let output_dir = match env::var("OUTPUT_DIR") {
            Ok(dir) if dir.trim().is_empty() => None,
            Ok(dir) => Some(PathBuf::from(dir)),
            Err(_) => defaults.output_dir,
        };

        let config = Self {
            fingerprints_path: env::var("FINGERPRINTS_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.fingerprints_path),
            output_dir,
            analysis_min_side: var_or("ANALYSIS_MIN_SIDE", defaults.analysis_min_side)?,
            max_analysis_side: var_or("MAX_ANALYSIS_SIDE", defaults.max_analysis_side)?,
            quality: QualityPolicy {
                face_confidence_threshold: var_or(
                    "FACE_CONFIDENCE_THRESHOLD",
                    defaults.quality.face_confidence_threshold,
                )?,
                min_side: var_or("QUALITY_MIN_SIDE", defaults.quality.min_side)?,
            },
            weights: HeuristicWeights {
                fft_weight: var_or("HEURISTIC_FFT_WEIGHT", defaults.weights.fft_weight)?,
                ela_weight: var_or("HEURISTIC_ELA_WEIGHT", defaults.weights.ela_weight)?,
                lap_weight: var_or("HEURISTIC_LAP_WEIGHT", defaults.weights.lap_weight)?,
                jpeg_weight: var_or("HEURISTIC_JPEG_WEIGHT", defaults.weights.jpeg_weight)?,
                threshold: var_or("HEURISTIC_THRESHOLD", defaults.weights.threshold)?,
                steepness: var_or("HEURISTIC_STEEPNESS", defaults.weights.steepness)?,
            },
            extractor: ExtractorSettings {
                ela_quality: var_or("ELA_QUALITY", defaults.extractor.ela_quality)?,
                fft_low_fraction: var_or("FFT_LOW_FRACTION", defaults.extractor.fft_low_fraction)?,
                ..defaults.extractor
            },
            saliency: SaliencySettings {
                canny_low: var_or("CANNY_LOW", defaults.saliency.canny_low)?,
                canny_high: var_or("CANNY_HIGH", defaults.saliency.canny_high)?,
                overlay_alpha: var_or("OVERLAY_ALPHA", defaults.saliency.overlay_alpha)?,
            },
            workers: var_or("BATCH_WORKERS", defaults.workers)?,
            max_batch_size: var_or("BATCH_MAX_IMAGES", defaults.max_batch_size)?,
            top_k: var_or("ATTRIBUTION_TOP_K", defaults.top_k)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// 校验所有阈值与权重，收集全部问题后一次性返回。
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        let conf = self.quality.face_confidence_threshold;
        if !(0.0..=1.0).contains(&conf) {
            errors.push("FACE_CONFIDENCE_THRESHOLD must be between 0.0 and 1.0".to_string());
        }
        if self.quality.min_side == 0 {
            errors.push("QUALITY_MIN_SIDE must be positive".to_string());
        }
        if self.analysis_min_side == 0 {
            errors.push("ANALYSIS_MIN_SIDE must be positive".to_string());
        }
        if self.max_analysis_side < self.analysis_min_side {
            errors.push("MAX_ANALYSIS_SIDE must not be below ANALYSIS_MIN_SIDE".to_string());
        }

        let w = &self.weights;
        for (name, value) in [
            ("HEURISTIC_FFT_WEIGHT", w.fft_weight),
            ("HEURISTIC_ELA_WEIGHT", w.ela_weight),
            ("HEURISTIC_LAP_WEIGHT", w.lap_weight),
            ("HEURISTIC_JPEG_WEIGHT", w.jpeg_weight),
            ("HEURISTIC_THRESHOLD", w.threshold),
        ] {
            if !value.is_finite() {
                errors.push(format!("{name} must be a finite number"));
            }
        }
        if !(w.steepness.is_finite() && w.steepness > 0.0) {
            errors.push("HEURISTIC_STEEPNESS must be positive".to_string());
        }

        let e = &self.extractor;
        if !(1..=100).contains(&e.ela_quality) {
            errors.push("ELA_QUALITY must be between 1 and 100".to_string());
        }
        if !(e.fft_low_fraction > 0.0 && e.fft_low_fraction <= 1.0) {
            errors.push("FFT_LOW_FRACTION must be in (0, 1]".to_string());
        }

        let s = &self.saliency;
        if !(s.canny_low >= 0.0 && s.canny_low <= s.canny_high) {
            errors.push("CANNY_LOW must be non-negative and not above CANNY_HIGH".to_string());
        }
        if !(0.0..=1.0).contains(&s.overlay_alpha) {
            errors.push("OVERLAY_ALPHA must be between 0.0 and 1.0".to_string());
        }

        if self.workers == 0 {
            errors.push("BATCH_WORKERS must be positive".to_string());
        }
        if self.max_batch_size == 0 {
            errors.push("BATCH_MAX_IMAGES must be positive".to_string());
        }
        if self.top_k == 0 {
            errors.push("ATTRIBUTION_TOP_K must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors.join("; ")))
        }
    }
}

fn var_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Parse { key, value }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut config = Config::default();
        config.quality.face_confidence_threshold = 1.5;
        config.weights.steepness = 0.0;
        config.workers = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("FACE_CONFIDENCE_THRESHOLD"));
        assert!(err.contains("HEURISTIC_STEEPNESS"));
        assert!(err.contains("BATCH_WORKERS"));
    }

    #[test]
    fn rejects_max_side_below_min_side() {
        let mut config = Config::default();
        config.max_analysis_side = 128;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("MAX_ANALYSIS_SIDE"));
    }

    #[test]
    fn rejects_inverted_canny_thresholds() {
        let mut config = Config::default();
        config.saliency.canny_low = 250.0;
        assert!(config.validate().is_err());
    }
}
