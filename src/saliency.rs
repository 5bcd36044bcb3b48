//! 显著性热力图：深度模型给不出显著性图时，用边缘 + 纹理信号兜底，并叠加到原图上。

use anyhow::bail;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, GrayImage, ImageBuffer, Luma, Rgb, RgbImage};
use imageproc::edges::canny;
use tracing::warn;

use crate::signals::{laplacian, to_luma601};

/// 取值 [0, 1] 的单通道热力图
pub type HeatMap = ImageBuffer<Luma<f32>, Vec<f32>>;

/// 兜底失败时的均匀中性值
pub const NEUTRAL_HEAT: f32 = 0.5;

const EDGE_WEIGHT: f32 = 0.7;
const TEXTURE_WEIGHT: f32 = 0.3;
const RANGE_FLOOR: f32 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SaliencySettings {
    pub canny_low: f32,
    pub canny_high: f32,
    pub overlay_alpha: f32,
}

impl Default for SaliencySettings {
    fn default() -> Self {
        Self { canny_low: 80.0, canny_high: 200.0, overlay_alpha: 0.45 }
    }
}

pub fn uniform_heatmap(width: u32, height: u32) -> HeatMap {
    ImageBuffer::from_pixel(width, height, Luma([NEUTRAL_HEAT]))
}

/// 边缘图与归一化 |拉普拉斯| 纹理图按 0.7 / 0.3 混合
pub fn try_fallback_heatmap(face: &DynamicImage, settings: &SaliencySettings) -> anyhow::Result<HeatMap> {
    let gray = to_luma601(face);
    let (w, h) = gray.dimensions();
    if w == 0 || h == 0 {
        bail!("cannot build heat map for empty image ({w}x{h})");
    }

    let edges = canny(&gray, settings.canny_low, settings.canny_high);

    let texture: Vec<f32> = laplacian(&gray).into_iter().map(|v| v.abs() as f32).collect();
    let peak = texture.iter().copied().fold(0.0f32, f32::max) + RANGE_FLOOR;

    let data: Vec<f32> = edges
        .as_raw()
        .iter()
        .zip(&texture)
        .map(|(&edge, &tex)| {
            let combined = EDGE_WEIGHT * f32::from(edge) + TEXTURE_WEIGHT * (tex / peak * 255.0);
            combined.clamp(0.0, 255.0) / 255.0
        })
        .collect();

    match ImageBuffer::from_raw(w, h, data) {
        Some(map) => Ok(map),
        None => bail!("heat map buffer size mismatch"),
    }
}

/// 兜底热力图；任何失败都返回全 0.5 的均匀图
pub fn fallback_heatmap(face: &DynamicImage, settings: &SaliencySettings) -> HeatMap {
    try_fallback_heatmap(face, settings).unwrap_or_else(|e| {
        warn!(error = %e, "兜底热力图生成失败，使用均匀图");
        uniform_heatmap(face.width(), face.height())
    })
}

/// 按自身 min/max 归一化到 [0, 1]
pub fn normalize(heat: &HeatMap) -> HeatMap {
    let (lo, hi) = heat
        .pixels()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])));
    let range = (hi - lo) + RANGE_FLOOR;
    ImageBuffer::from_fn(heat.width(), heat.height(), |x, y| {
        Luma([(heat.get_pixel(x, y)[0] - lo) / range])
    })
}

/// 归一化后的灰度图，用于热力图落盘
pub fn to_gray(heat: &HeatMap) -> GrayImage {
    let norm = normalize(heat);
    ImageBuffer::from_fn(norm.width(), norm.height(), |x, y| {
        Luma([(norm.get_pixel(x, y)[0] * 255.0) as u8])
    })
}

/// JET 色阶：蓝 -> 青 -> 黄 -> 红
pub fn jet(value: f32) -> Rgb<u8> {
    let v = value.clamp(0.0, 1.0);
    let channel = |offset: f32| ((1.5 - (4.0 * v - offset).abs()).clamp(0.0, 1.0) * 255.0) as u8;
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

/// 归一化 -> 色阶 -> 缩放到底图尺寸 -> 按 `alpha` 混合
pub fn try_overlay(base: &RgbImage, heat: &HeatMap, alpha: f32) -> anyhow::Result<RgbImage> {
    if heat.width() == 0 || heat.height() == 0 {
        bail!("empty heat map");
    }
    if base.width() == 0 || base.height() == 0 {
        bail!("empty base image");
    }

    let norm = normalize(heat);
    let mut colored: RgbImage = ImageBuffer::from_fn(norm.width(), norm.height(), |x, y| {
        jet(norm.get_pixel(x, y)[0])
    });
    if colored.dimensions() != base.dimensions() {
        colored = imageops::resize(&colored, base.width(), base.height(), FilterType::Triangle);
    }

    let blend = |h: u8, b: u8| (alpha * f32::from(h) + (1.0 - alpha) * f32::from(b)) as u8;
    Ok(ImageBuffer::from_fn(base.width(), base.height(), |x, y| {
        let h = colored.get_pixel(x, y);
        let b = base.get_pixel(x, y);
        Rgb([blend(h[0], b[0]), blend(h[1], b[1]), blend(h[2], b[2])])
    }))
}

/// 叠加失败时原样返回底图
pub fn overlay(base: &RgbImage, heat: &HeatMap, alpha: f32) -> RgbImage {
    try_overlay(base, heat, alpha).unwrap_or_else(|e| {
        warn!(error = %e, "热力图叠加失败，返回原图");
        base.clone()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_face(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(ImageBuffer::from_fn(w, h, |x, _| {
            if x < w / 2 { Rgb([0, 0, 0]) } else { Rgb([255, 255, 255]) }
        }))
    }

    #[test]
    fn fallback_map_is_in_unit_range_and_sized_like_face() {
        let map = fallback_heatmap(&split_face(64, 48), &SaliencySettings::default());
        assert_eq!(map.dimensions(), (64, 48));
        assert!(map.pixels().all(|p| (0.0..=1.0).contains(&p[0])));
        // 中线附近有响应
        assert!(map.pixels().any(|p| p[0] > 0.25));
    }

    #[test]
    fn empty_face_yields_error_and_uniform_fallback() {
        let empty = DynamicImage::ImageRgb8(RgbImage::new(0, 0));
        assert!(try_fallback_heatmap(&empty, &SaliencySettings::default()).is_err());
        assert_eq!(fallback_heatmap(&empty, &SaliencySettings::default()).dimensions(), (0, 0));
    }

    #[test]
    fn normalize_stretches_to_unit_range() {
        let mut heat: HeatMap = ImageBuffer::from_pixel(2, 1, Luma([0.2]));
        heat.put_pixel(1, 0, Luma([0.6]));
        let norm = normalize(&heat);
        assert_eq!(norm.get_pixel(0, 0)[0], 0.0);
        assert!((norm.get_pixel(1, 0)[0] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn jet_endpoints() {
        assert_eq!(jet(0.0), Rgb([0, 0, 127]));
        assert_eq!(jet(1.0), Rgb([127, 0, 0]));
    }

    #[test]
    fn overlay_resizes_heat_to_base() {
        let base: RgbImage = ImageBuffer::from_pixel(40, 20, Rgb([100, 100, 100]));
        let heat = uniform_heatmap(8, 4);
        let out = overlay(&base, &heat, 0.45);
        assert_eq!(out.dimensions(), (40, 20));
    }

    #[test]
    fn zero_alpha_keeps_base_and_failure_returns_base() {
        let base: RgbImage = ImageBuffer::from_pixel(4, 4, Rgb([9, 90, 200]));
        let out = overlay(&base, &uniform_heatmap(4, 4), 0.0);
        assert_eq!(out, base);

        let failed = overlay(&base, &uniform_heatmap(0, 0), 0.45);
        assert_eq!(failed, base);
    }
}
