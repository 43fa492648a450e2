//! Simulcast layer layout for the publisher.
//!
//! | Layer  | Bitrate                    | Scale |
//! |--------|----------------------------|-------|
//! | high   | configured max             | 1     |
//! | medium | min(300 kbps, max / 3)     | 2     |
//! | low    | 80 kbps                    | 4     |
//!
//! A layer is active iff its stage is at or below the applied quality.

use super::peer::EncodingParameters;
use common::types::QualitySetting;

const MEDIUM_LAYER_CAP_BPS: u32 = 300_000;
const LOW_LAYER_BITRATE_BPS: u32 = 80_000;

/// Layers from lowest to highest stage.
const LAYERS: [(QualitySetting, &str, f64); 3] = [
    (QualitySetting::Low, "low", 4.0),
    (QualitySetting::Medium, "medium", 2.0),
    (QualitySetting::High, "high", 1.0),
];

/// Bitrate of the layer carrying `stage`. `Off` has no layer.
#[must_use]
pub fn layer_bitrate(stage: QualitySetting, max_bitrate_bps: u32) -> Option<u32> {
    match stage {
        QualitySetting::Off => None,
        QualitySetting::Low => Some(LOW_LAYER_BITRATE_BPS),
        QualitySetting::Medium => Some(MEDIUM_LAYER_CAP_BPS.min(max_bitrate_bps / 3)),
        QualitySetting::High => Some(max_bitrate_bps),
    }
}

/// Encodings for `applied` quality, lowest layer first.
#[must_use]
pub fn encodings(applied: QualitySetting, max_bitrate_bps: u32) -> Vec<EncodingParameters> {
    LAYERS
        .iter()
        .filter_map(|&(stage, rid, scale)| {
            layer_bitrate(stage, max_bitrate_bps).map(|bitrate| EncodingParameters {
                rid: rid.to_string(),
                active: stage <= applied,
                max_bitrate_bps: bitrate,
                scale_resolution_down_by: scale,
            })
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn active(encodings: &[EncodingParameters]) -> Vec<&str> {
        encodings
            .iter()
            .filter(|e| e.active)
            .map(|e| e.rid.as_str())
            .collect()
    }

    #[test]
    fn test_bitrates_follow_max() {
        assert_eq!(layer_bitrate(QualitySetting::High, 1_200_000), Some(1_200_000));
        assert_eq!(layer_bitrate(QualitySetting::Medium, 1_200_000), Some(300_000));
        assert_eq!(layer_bitrate(QualitySetting::Medium, 600_000), Some(200_000));
        assert_eq!(layer_bitrate(QualitySetting::Low, 600_000), Some(80_000));
        assert_eq!(layer_bitrate(QualitySetting::Off, 600_000), None);
    }

    #[test]
    fn test_active_layers_track_quality() {
        assert_eq!(active(&encodings(QualitySetting::High, 1_200_000)), ["low", "medium", "high"]);
        assert_eq!(active(&encodings(QualitySetting::Medium, 1_200_000)), ["low", "medium"]);
        assert_eq!(active(&encodings(QualitySetting::Low, 1_200_000)), ["low"]);
        assert!(active(&encodings(QualitySetting::Off, 1_200_000)).is_empty());
    }

    #[test]
    fn test_scales() {
        let layers = encodings(QualitySetting::High, 1_200_000);
        for (layer, expected) in layers.iter().zip([4.0, 2.0, 1.0]) {
            assert!((layer.scale_resolution_down_by - expected).abs() < f64::EPSILON);
        }
    }
}
