//! 取证信号提取器
//!
//! 每个提取器都是单张图片的纯函数，只产出一个标量：
//! - ELA 均值：有损重编码后与原图的平均绝对差
//! - 高频能量比：2-D DFT 幅度谱中心低频窗口之外的能量占比
//! - 拉普拉斯方差：局部对比度，越低越模糊
//! - 量化代理分：高质量编码再低质量编码的体积比

use std::io::Cursor;

use anyhow::{bail, Context};
use image::{DynamicImage, GenericImageView, GrayImage, ImageBuffer, ImageOutputFormat, Luma, RgbImage};
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use tracing::{debug, warn};

use crate::features::{CoreFeatures, FeatureVector};

/// 提取整体失败时使用的中性特征
pub const NEUTRAL_FEATURES: CoreFeatures = CoreFeatures {
    ela_mean: 0.0,
    fft_high_ratio: 0.5,
    lap_var: 100.0,
    jpeg_score: 0.5,
};

const MAGNITUDE_FLOOR: f64 = 1e-8;

#[derive(Debug, Clone, Copy)]
pub struct ExtractorSettings {
    pub ela_quality: u8,
    pub fft_low_fraction: f64,
    pub jpeg_reference_quality: u8,
    pub jpeg_probe_quality: u8,
}

impl Default for ExtractorSettings {
    fn default() -> Self {
        Self {
            ela_quality: 90,
            fft_low_fraction: 0.25,
            jpeg_reference_quality: 95,
            jpeg_probe_quality: 75,
        }
    }
}

/// 一次提取的结果。`degraded` 为真表示已回落到 [`NEUTRAL_FEATURES`]。
#[derive(Debug, Clone)]
pub struct Extraction {
    pub features: FeatureVector,
    pub degraded: bool,
}

/// 提取全部四个特征。任何一个失败都整体回落为中性向量，调用方继续执行。
pub fn extract_features(image: &DynamicImage, settings: &ExtractorSettings) -> Extraction {
    match try_extract(image, settings) {
        Ok(core) => {
            debug!(?core, "特征提取完成");
            Extraction { features: core.into(), degraded: false }
        }
        Err(e) => {
            warn!(error = %e, "特征提取失败，使用中性默认值");
            Extraction { features: NEUTRAL_FEATURES.into(), degraded: true }
        }
    }
}

fn try_extract(image: &DynamicImage, settings: &ExtractorSettings) -> anyhow::Result<CoreFeatures> {
    Ok(CoreFeatures {
        ela_mean: ela_mean(image, settings.ela_quality).context("ela")?,
        fft_high_ratio: fft_high_ratio(image, settings.fft_low_fraction).context("fft")?,
        lap_var: laplacian_variance(image).context("laplacian")?,
        jpeg_score: jpeg_quant_score(
            image,
            settings.jpeg_reference_quality,
            settings.jpeg_probe_quality,
        )
        .context("jpeg")?,
    })
}

fn ensure_non_empty(image: &DynamicImage) -> anyhow::Result<()> {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        bail!("empty image ({w}x{h})");
    }
    Ok(())
}

/// 编码为 JPEG 字节（输入先转 RGB，不改动原图）
fn encode_jpeg(rgb: &RgbImage, quality: u8) -> anyhow::Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(rgb.clone()).write_to(&mut buf, ImageOutputFormat::Jpeg(quality))?;
    Ok(buf.into_inner())
}

/// 误差水平分析 (ELA)：按 `quality` 重编码，返回所有像素、所有通道的平均绝对差
pub fn ela_mean(image: &DynamicImage, quality: u8) -> anyhow::Result<f64> {
    ensure_non_empty(image)?;
    let original = image.to_rgb8();
    let encoded = encode_jpeg(&original, quality)?;
    let recompressed = image::load_from_memory(&encoded)?.to_rgb8();

    if recompressed.dimensions() != original.dimensions() {
        bail!("recompressed image changed dimensions");
    }

    let total: u64 = original
        .as_raw()
        .iter()
        .zip(recompressed.as_raw())
        .map(|(&a, &b)| u64::from(a.abs_diff(b)))
        .sum();
    Ok(total as f64 / original.as_raw().len() as f64)
}

/// 灰度化后做 2-D DFT，零频移到中心，返回中心低频窗口以外的幅度占比
pub fn fft_high_ratio(image: &DynamicImage, low_fraction: f64) -> anyhow::Result<f64> {
    ensure_non_empty(image)?;
    let gray = to_luma601(image);
    let (w, h) = (gray.width() as usize, gray.height() as usize);

    let mut spectrum: Vec<Complex<f64>> = gray
        .as_raw()
        .iter()
        .map(|&p| Complex::new(f64::from(p) / 255.0, 0.0))
        .collect();
    fft2d(&mut spectrum, w, h);

    // fftshift 之后中心位于 (h/2, w/2)，窗口半径按比例取整
    let (cy, cx) = (h / 2, w / 2);
    let ry = (h as f64 * low_fraction / 2.0) as usize;
    let rx = (w as f64 * low_fraction / 2.0) as usize;

    let mut total = 0.0;
    let mut low = 0.0;
    for sy in 0..h {
        // 移位后的行 sy 对应原始频率行 (sy + h - h/2) % h
        let row = (sy + h - cy) % h;
        let in_rows = sy + ry >= cy && sy < cy + ry;
        for sx in 0..w {
            let col = (sx + w - cx) % w;
            let mag = spectrum[row * w + col].norm();
            total += mag;
            if in_rows && sx + rx >= cx && sx < cx + rx {
                low += mag;
            }
        }
    }

    let total = total + MAGNITUDE_FLOOR;
    Ok(((total - low) / total).clamp(0.0, 1.0))
}

/// 行列分解的二维前向 DFT，原地计算
fn fft2d(data: &mut [Complex<f64>], w: usize, h: usize) {
    let mut planner = FftPlanner::<f64>::new();

    let row_fft = planner.plan_fft_forward(w);
    for row in data.chunks_exact_mut(w) {
        row_fft.process(row);
    }

    let col_fft = planner.plan_fft_forward(h);
    let mut column = vec![Complex::new(0.0, 0.0); h];
    for x in 0..w {
        for y in 0..h {
            column[y] = data[y * w + x];
        }
        col_fft.process(&mut column);
        for y in 0..h {
            data[y * w + x] = column[y];
        }
    }
}

/// Rec.601 加权灰度（0.299 / 0.587 / 0.114），alpha 丢弃。
///
/// 与 `to_luma8`（Rec.709）不同。
pub fn to_luma601(image: &DynamicImage) -> GrayImage {
    let rgb = image.to_rgb8();
    ImageBuffer::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        let l = u32::from(r) * 299 + u32::from(g) * 587 + u32::from(b) * 114;
        Luma([((l + 500) / 1000) as u8])
    })
}

/// 4-邻域离散拉普拉斯，边界按 reflect-101 处理
pub fn laplacian(gray: &GrayImage) -> Vec<f64> {
    let (w, h) = (gray.width() as i64, gray.height() as i64);
    let reflect = |i: i64, n: i64| -> i64 {
        if n == 1 {
            0
        } else if i < 0 {
            -i
        } else if i >= n {
            2 * n - 2 - i
        } else {
            i
        }
    };
    let px = |x: i64, y: i64| f64::from(gray.get_pixel(reflect(x, w) as u32, reflect(y, h) as u32)[0]);

    let mut out = Vec::with_capacity((w * h) as usize);
    for y in 0..h {
        for x in 0..w {
            let v = px(x - 1, y) + px(x + 1, y) + px(x, y - 1) + px(x, y + 1) - 4.0 * px(x, y);
            out.push(v);
        }
    }
    out
}

/// 拉普拉斯响应的方差
pub fn laplacian_variance(image: &DynamicImage) -> anyhow::Result<f64> {
    ensure_non_empty(image)?;
    let lap = laplacian(&to_luma601(image));
    let n = lap.len() as f64;
    let mean = lap.iter().sum::<f64>() / n;
    Ok(lap.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n)
}

/// 压缩历史的间接信号：高质量编码后再低质量编码，返回后者与前者的字节数之比
pub fn jpeg_quant_score(image: &DynamicImage, reference: u8, probe: u8) -> anyhow::Result<f64> {
    ensure_non_empty(image)?;
    let first = encode_jpeg(&image.to_rgb8(), reference)?;
    if first.is_empty() {
        return Ok(0.0);
    }
    let decoded = image::load_from_memory(&first)?.to_rgb8();
    let second = encode_jpeg(&decoded, probe)?;
    Ok(second.len() as f64 / first.len() as f64)
}
