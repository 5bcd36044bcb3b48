use serde::Serialize;
use tracing::debug;

/// 质量门限
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityPolicy {
    pub face_confidence_threshold: f64,
    pub min_side: u32,
}

impl Default for QualityPolicy {
    fn default() -> Self {
        Self { face_confidence_threshold: 0.90, min_side: 224 }
    }
}

/// 质量判定：是否可用于指纹库学习，外加完整诊断信息
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityVerdict {
    pub accepted: bool,
    pub face_found: bool,
    pub face_confidence: f64,
    pub width: u32,
    pub height: u32,
    pub min_side_ok: bool,
    /// 每个未满足的条件对应一条短诊断码
    pub notes: Vec<String>,
}

/// 纯函数：人脸检测结果 + 人脸区域尺寸 -> 判定
pub fn accept_image(
    face_found: bool,
    face_confidence: f64,
    width: u32,
    height: u32,
    policy: &QualityPolicy,
) -> QualityVerdict {
    let mut notes = Vec::new();
    let min_side_ok = width.min(height) >= policy.min_side;

    if !min_side_ok {
        notes.push(format!("min_side<{}", policy.min_side));
    }
    if !face_found {
        notes.push("no_face_found".to_string());
    }
    let confident = face_confidence >= policy.face_confidence_threshold;
    if face_found && !confident {
        notes.push(format!("low_face_conf<{}", policy.face_confidence_threshold));
    }

    let verdict = QualityVerdict {
        accepted: face_found && confident && min_side_ok,
        face_found,
        face_confidence,
        width,
        height,
        min_side_ok,
        notes,
    };
    debug!(?verdict, "质量判定");
    verdict
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(found: bool, conf: f64, w: u32, h: u32) -> QualityVerdict {
        accept_image(found, conf, w, h, &QualityPolicy::default())
    }

    #[test]
    fn confident_large_face_is_accepted() {
        let v = gate(true, 0.95, 512, 512);
        assert!(v.accepted);
        assert!(v.min_side_ok);
        assert!(v.notes.is_empty());
    }

    #[test]
    fn low_confidence_is_rejected() {
        let v = gate(true, 0.5, 512, 512);
        assert!(!v.accepted);
        assert_eq!(v.notes, vec!["low_face_conf<0.9"]);
    }

    #[test]
    fn missing_face_is_rejected() {
        let v = gate(false, 0.0, 512, 512);
        assert!(!v.accepted);
        assert_eq!(v.notes, vec!["no_face_found"]);
    }

    #[test]
    fn small_face_is_rejected() {
        let v = gate(true, 0.95, 100, 100);
        assert!(!v.accepted);
        assert!(!v.min_side_ok);
        assert_eq!(v.notes, vec!["min_side<224"]);
    }

    #[test]
    fn every_failed_criterion_is_reported() {
        let v = gate(false, 0.0, 10, 900);
        assert_eq!(v.notes, vec!["min_side<224", "no_face_found"]);
        assert_eq!((v.width, v.height), (10, 900));
    }

    #[test]
    fn threshold_is_inclusive() {
        let policy = QualityPolicy { face_confidence_threshold: 0.8, min_side: 224 };
        assert!(accept_image(true, 0.8, 224, 300, &policy).accepted);
    }
}
