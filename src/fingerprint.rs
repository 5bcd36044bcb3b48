use image::DynamicImage;
use img_hash::{HashAlg, HasherConfig}; // 感知哈希的配置器与算法枚举
use serde::Serialize;
use sha2::{Digest, Sha256};

/// 图片身份：同一张图被重新上传时可据此关联多份报告
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageIdentity {
    /// 提交字节的 SHA-256（小写十六进制）。改动任何一个字节都会雪崩式变化。
    pub sha256: String,
    /// 8x8 梯度感知哈希（Base64）。重压缩、轻微缩放后依然接近。
    pub phash: String,
}

pub fn image_identity(encoded: &[u8], image: &DynamicImage) -> ImageIdentity {
    let mut hasher = Sha256::new();
    hasher.update(encoded);
    let sha256 = hex::encode(hasher.finalize());

    // 梯度算法比均值算法对明暗变化更鲁棒
    let phash = HasherConfig::new()
        .hash_alg(HashAlg::Gradient)
        .hash_size(8, 8)
        .to_hasher()
        .hash_image(image)
        .to_base64();

    ImageIdentity { sha256, phash }
}
