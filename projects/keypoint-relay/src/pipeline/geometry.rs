use crate::pipeline::types::{Detection, Keypoint, NormalizedKeypoint, Roi};

/// Half-extent scale applied around the detection center.
pub const ROI_EXPANSION: f32 = 1.5;

/// Picks the highest-confidence detection of each group, then the best of
/// those. Ties keep the first-seen detection. Returns `None` when every
/// group is empty.
pub fn select_best_detection(groups: &[Vec<Detection>]) -> Option<Detection> {
    groups
        .iter()
        .filter_map(|group| first_max(group.iter().copied()))
        .fold(None, |best: Option<Detection>, candidate| match best {
            Some(b) if candidate.confidence <= b.confidence => Some(b),
            _ => Some(candidate),
        })
}

fn first_max(detections: impl Iterator<Item = Detection>) -> Option<Detection> {
    detections.fold(None, |best: Option<Detection>, d| match best {
        Some(b) if d.confidence <= b.confidence => Some(b),
        _ => Some(d),
    })
}

/// Expands a detection into a padded crop region centered on it, clamped to
/// `[0, width-1] x [0, height-1]`. Returns `None` for a degenerate result
/// (non-positive extent after clamping, or non-finite input).
pub fn expand_roi(det: &Detection, width: u32, height: u32) -> Option<Roi> {
    if width == 0 || height == 0 {
        return None;
    }
    let coords = [det.x0, det.y0, det.x1, det.y1];
    if coords.iter().any(|c| !c.is_finite()) {
        return None;
    }

    let half_w = (det.x1 - det.x0) * ROI_EXPANSION / 2.0;
    let half_h = (det.y1 - det.y0) * ROI_EXPANSION / 2.0;
    let cx = (det.x0 + det.x1) / 2.0;
    let cy = (det.y0 + det.y1) / 2.0;

    let max_x = (width - 1) as f32;
    let max_y = (height - 1) as f32;

    let roi = Roi {
        x0: (cx - half_w).clamp(0.0, max_x).round() as i32,
        y0: (cy - half_h).clamp(0.0, max_y).round() as i32,
        x1: (cx + half_w).clamp(0.0, max_x).round() as i32,
        y1: (cy + half_h).clamp(0.0, max_y).round() as i32,
    };

    if roi.width() <= 0 || roi.height() <= 0 {
        return None;
    }
    Some(roi)
}

/// Maps a normalized keypoint into absolute frame pixels within `roi`.
/// The float-to-int conversion truncates and saturates at the i16 range.
pub fn remap_keypoint(kp: &NormalizedKeypoint, roi: &Roi) -> Keypoint {
    let x = kp.x * roi.width() as f32 + roi.x0 as f32;
    let y = kp.y * roi.height() as f32 + roi.y0 as f32;
    Keypoint {
        x: x as i16,
        y: y as i16,
    }
}

pub fn remap_keypoints(keypoints: &[NormalizedKeypoint], roi: &Roi) -> Vec<Keypoint> {
    keypoints.iter().map(|kp| remap_keypoint(kp, roi)).collect()
}
