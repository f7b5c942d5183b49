use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, frame::Keypoint};

/// Axis aligned rectangle in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::InvalidRegion {
                width: self.width,
                height: self.height,
            });
        }
        Ok(())
    }

    /// Half-open containment: `x <= px < x + width`, likewise for `y`.
    pub fn contains(&self, px: f32, py: f32) -> bool {
        let (x, y) = (self.x as f32, self.y as f32);
        px >= x && px < x + self.width as f32 && py >= y && py < y + self.height as f32
    }
}

/// Keeps the keypoints inside `region`, in their original order.
pub fn retain_in_region(keypoints: &mut Vec<Keypoint>, region: &Region) {
    keypoints.retain(|kp| region.contains(kp.x, kp.y));
}

/// Caps `keypoints` at the `max` strongest responses.
///
/// Survivors keep their original relative order and ties go to the earlier
/// keypoint. Detectors that leave `response` at zero (Shi-Tomasi) can't be
/// ranked this way, so for them this keeps the first `max` keypoints.
pub fn limit_keypoints(keypoints: &mut Vec<Keypoint>, max: usize) {
    if keypoints.len() <= max {
        return;
    }

    let mut ranked: Vec<usize> = (0..keypoints.len()).collect();
    // sort_by is stable, equal responses stay in original order
    ranked.sort_by(|&a, &b| keypoints[b].response.total_cmp(&keypoints[a].response));

    let mut keep = vec![false; keypoints.len()];
    for &index in &ranked[..max] {
        keep[index] = true;
    }

    let mut flags = keep.into_iter();
    keypoints.retain(|_| flags.next().unwrap_or(false));
}
