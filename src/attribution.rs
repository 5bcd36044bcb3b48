//! 模块：归因指纹库 (Attribution Index)
//!
//! **职责**: 维护 "家族名 -> 运行均值特征指纹" 的映射，支持相似度查询与在线增量学习。
//!
//! - **相似度**: 只在查询向量与家族均值共有的键上做余弦相似度，没有共有键的家族直接跳过。
//! - **在线学习**: `mean_new = mean_old + (value - mean_old) / (n + 1)`，
//!   任意时刻的均值都等于该家族全部贡献样本的算术平均。
//! - **持久化**: 单个 JSON 文件，每次变更后整体重写（临时文件 + 原子 rename）。
//!   文件缺失或解析失败时回落到内置的三个种子家族，构造永不失败。

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

use crate::error::IndexError;
use crate::features::{FeatureVector, ELA_MEAN, FFT_HIGH_RATIO, JPEG_SCORE, LAP_VAR};

pub const DB_VERSION: u32 = 1;

const NORM_FLOOR: f64 = 1e-8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Family {
    pub name: String,
    pub features_mean: FeatureVector,
    #[serde(default)]
    pub sample_count: u64,
    #[serde(default)]
    pub last_updated: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionDatabase {
    pub version: u32,
    pub families: Vec<Family>,
}

impl AttributionDatabase {
    /// 种子库：三个已知家族的先验均值，样本数为 0
    pub fn seeded() -> Self {
        let seed = |name: &str, fft: f64, ela: f64, lap: f64, jpeg: f64| Family {
            name: name.to_string(),
            features_mean: FeatureVector::new()
                .with(FFT_HIGH_RATIO, fft)
                .with(ELA_MEAN, ela)
                .with(LAP_VAR, lap)
                .with(JPEG_SCORE, jpeg),
            sample_count: 0,
            last_updated: None,
        };

        Self {
            version: DB_VERSION,
            families: vec![
                seed("faceswap_blend", 0.62, 18.0, 120.0, 0.55),
                seed("diffusion_inpaint", 0.68, 12.0, 160.0, 0.35),
                seed("stylegan_family", 0.75, 9.5, 180.0, 0.4),
            ],
        }
    }

    /// 家族名必须唯一
    fn validate(&self) -> Result<(), IndexError> {
        let mut seen = HashSet::new();
        for family in &self.families {
            if !seen.insert(family.name.as_str()) {
                return Err(IndexError::DuplicateFamily(family.name.clone()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FamilyMatch {
    pub family: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FamilySummary {
    pub name: String,
    pub sample_count: u64,
    pub last_updated: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FamilyStats {
    pub total_families: usize,
    pub total_samples: u64,
    pub families: Vec<FamilySummary>,
}

pub struct AttributionIndex {
    path: PathBuf,
    db: AttributionDatabase,
}

impl AttributionIndex {
    /// 从 `path` 加载；缺失或损坏时写入种子库。
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            warn!(path = %path.display(), "指纹库文件不存在，创建种子库");
            return Self::reseed(path);
        }

        match Self::load(&path) {
            Ok(db) => {
                info!(families = db.families.len(), "已加载归因指纹库");
                Self { path, db }
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "指纹库无效，重建种子库");
                Self::reseed(path)
            }
        }
    }

    fn load(path: &Path) -> Result<AttributionDatabase, IndexError> {
        let bytes = fs::read(path)?;
        let db: AttributionDatabase = serde_json::from_slice(&bytes)?;
        db.validate()?;
        Ok(db)
    }

    fn reseed(path: PathBuf) -> Self {
        let index = Self { path, db: AttributionDatabase::seeded() };
        match index.save() {
            Ok(()) => info!("已创建默认指纹库"),
            Err(e) => error!(error = %e, "种子库写盘失败，仅在内存中使用"),
        }
        index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn database(&self) -> &AttributionDatabase {
        &self.db
    }

    /// 按存储顺序返回全部家族名
    pub fn family_names(&self) -> Vec<String> {
        self.db.families.iter().map(|f| f.name.clone()).collect()
    }

    /// 余弦相似度 top-k，降序；同分保持家族原始顺序
    pub fn match_features(&self, features: &FeatureVector, top_k: usize) -> Vec<FamilyMatch> {
        if features.is_empty() {
            warn!("查询特征为空，跳过归因匹配");
            return Vec::new();
        }

        let mut results: Vec<FamilyMatch> = self
            .db
            .families
            .iter()
            .filter_map(|family| {
                let similarity = cosine_similarity(features, &family.features_mean);
                if similarity.is_none() {
                    debug!(family = %family.name, "与该家族没有共有特征键");
                }
                Some(FamilyMatch { family: family.name.clone(), similarity: similarity? })
            })
            .collect();

        // sort_by 是稳定排序
        results.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(Ordering::Equal));
        results.truncate(top_k);

        debug!(top = ?results.first(), "归因匹配完成");
        results
    }

    /// 在线增量学习：新增或更新家族均值，然后整库写盘。
    ///
    /// 写盘失败时内存中的变更保留，错误返回给调用方。
    pub fn add_sample(&mut self, family_name: &str, features: &FeatureVector) -> Result<(), IndexError> {
        if family_name.is_empty() {
            return Err(IndexError::EmptyFamilyName);
        }
        // JSON 无法表示 NaN / inf，写进去下次加载就会整库重建
        if let Some((key, _)) = features.iter().find(|(_, v)| !v.is_finite()) {
            warn!(family = family_name, key, "样本含非有限特征值，拒绝学习");
            return Err(IndexError::NonFiniteFeature(key.to_string()));
        }
        let now = chrono::Utc::now().to_rfc3339();

        match self.db.families.iter_mut().find(|f| f.name == family_name) {
            None => {
                self.db.families.push(Family {
                    name: family_name.to_string(),
                    features_mean: features.clone(),
                    sample_count: 1,
                    last_updated: Some(now),
                });
                info!(family = family_name, "新建归因家族");
            }
            Some(family) => {
                let n = family.sample_count as f64;
                for (key, value) in features.iter() {
                    match family.features_mean.get_mut(key) {
                        Some(mean) => *mean += (value - *mean) / (n + 1.0),
                        None => family.features_mean.insert(key, value),
                    }
                }
                family.sample_count += 1;
                family.last_updated = Some(now);
                info!(family = family_name, samples = family.sample_count, "更新归因家族");
            }
        }

        self.save().map_err(|e| {
            error!(family = family_name, error = %e, "指纹库写盘失败");
            e
        })
    }

    pub fn family_stats(&self) -> FamilyStats {
        FamilyStats {
            total_families: self.db.families.len(),
            total_samples: self.db.families.iter().map(|f| f.sample_count).sum(),
            families: self
                .db
                .families
                .iter()
                .map(|f| FamilySummary {
                    name: f.name.clone(),
                    sample_count: f.sample_count,
                    last_updated: f.last_updated.clone(),
                })
                .collect(),
        }
    }

    /// 整库重写：同目录临时文件写完后原子替换
    pub fn save(&self) -> Result<(), IndexError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let payload = serde_json::to_vec_pretty(&self.db)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&payload)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        debug!(path = %self.path.display(), "指纹库已写盘");
        Ok(())
    }
}

/// 共有键上的余弦相似度；没有共有键时返回 `None`
pub fn cosine_similarity(a: &FeatureVector, b: &FeatureVector) -> Option<f64> {
    let (mut dot, mut na, mut nb, mut shared) = (0.0, 0.0, 0.0, 0usize);
    for (x, y) in a.shared_with(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
        shared += 1;
    }
    if shared == 0 {
        return None;
    }
    Some(dot / (na.sqrt().max(NORM_FLOOR) * nb.sqrt().max(NORM_FLOOR)))
}
