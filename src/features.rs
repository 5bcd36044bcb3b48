use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// 约定的特征键（闭集）
pub const ELA_MEAN: &str = "ela_mean";
pub const FFT_HIGH_RATIO: &str = "fft_high_ratio";
pub const LAP_VAR: &str = "lap_var";
pub const JPEG_SCORE: &str = "jpeg_score";

pub const CONVENTIONAL_KEYS: [&str; 4] = [ELA_MEAN, FFT_HIGH_RATIO, LAP_VAR, JPEG_SCORE];

/// 特征向量：键 -> 数值。
///
/// 键集合是开放的（指纹库里可能存有旧版本写入的键），
/// 比较与求均值只在两侧共有的键上进行。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector(BTreeMap<String, f64>);

/// 打分器需要的四个核心特征，已确认存在且有限。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoreFeatures {
    pub ela_mean: f64,
    pub fft_high_ratio: f64,
    pub lap_var: f64,
    pub jpeg_score: f64,
}

impl FeatureVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: f64) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: f64) {
        self.0.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut f64> {
        self.0.get_mut(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// 双方都有、且两侧数值均有限的键上的 (self, other) 数值对
    pub fn shared_with<'a>(&'a self, other: &'a FeatureVector) -> impl Iterator<Item = (f64, f64)> + 'a {
        self.0.iter().filter_map(move |(key, &a)| {
            let b = other.get(key)?;
            (a.is_finite() && b.is_finite()).then_some((a, b))
        })
    }

    /// 提取器与打分器之间的边界校验。缺键或非有限值返回 `None`。
    pub fn core(&self) -> Option<CoreFeatures> {
        let finite = |key: &str| self.get(key).filter(|v| v.is_finite());
        Some(CoreFeatures {
            ela_mean: finite(ELA_MEAN)?,
            fft_high_ratio: finite(FFT_HIGH_RATIO)?,
            lap_var: finite(LAP_VAR)?,
            jpeg_score: finite(JPEG_SCORE)?,
        })
    }
}

impl From<CoreFeatures> for FeatureVector {
    fn from(core: CoreFeatures) -> Self {
        FeatureVector::new()
            .with(ELA_MEAN, core.ela_mean)
            .with(FFT_HIGH_RATIO, core.fft_high_ratio)
            .with(LAP_VAR, core.lap_var)
            .with(JPEG_SCORE, core.jpeg_score)
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for FeatureVector {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        FeatureVector(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_requires_every_conventional_key() {
        let partial = FeatureVector::new().with(ELA_MEAN, 1.0).with(LAP_VAR, 2.0);
        assert!(partial.core().is_none());

        let full = partial.with(FFT_HIGH_RATIO, 0.5).with(JPEG_SCORE, 0.4);
        let core = full.core().unwrap();
        assert_eq!(core.lap_var, 2.0);
    }

    #[test]
    fn core_rejects_non_finite_values() {
        let v = FeatureVector::from(CoreFeatures {
            ela_mean: f64::NAN,
            fft_high_ratio: 0.5,
            lap_var: 1.0,
            jpeg_score: 0.5,
        });
        assert!(v.core().is_none());
    }

    #[test]
    fn shared_keys_only() {
        let a = FeatureVector::new().with("x", 1.0).with("y", 2.0);
        let b = FeatureVector::new().with("y", 3.0).with("z", 4.0);
        let pairs: Vec<_> = a.shared_with(&b).collect();
        assert_eq!(pairs, vec![(2.0, 3.0)]);
    }

    #[test]
    fn serializes_as_plain_object() {
        let v = FeatureVector::new().with(ELA_MEAN, 1.5);
        assert_eq!(serde_json::to_string(&v).unwrap(), r#"{"ela_mean":1.5}"#);
    }
}
