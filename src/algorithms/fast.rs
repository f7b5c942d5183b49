use std::collections::HashMap;

use image::GrayImage;
use imageproc::corners::{corners_fast9, Corner};

use crate::{features::detector::KeypointDetector, frame::Keypoint};

/// FAST-9 corners with a 3x3 non-maximum suppression over the corner score.
pub fn fast_corners(image: &GrayImage, threshold: u8) -> Vec<Corner> {
    let corners = corners_fast9(image, threshold);

    let scores: HashMap<(u32, u32), f32> = corners.iter().map(|c| ((c.x, c.y), c.score)).collect();

    corners
        .into_iter()
        .filter(|corner| {
            (-1i64..=1).all(|dy| {
                (-1i64..=1).all(|dx| {
                    if dx == 0 && dy == 0 {
                        return true;
                    }
                    let neighbor = (corner.x as i64 + dx, corner.y as i64 + dy);
                    if neighbor.0 < 0 || neighbor.1 < 0 {
                        return true;
                    }
                    match scores.get(&(neighbor.0 as u32, neighbor.1 as u32)) {
                        // ties go to the corner that comes first in scan order
                        Some(&score) if score > corner.score => false,
                        Some(&score) if score == corner.score => (dy, dx) > (0, 0),
                        _ => true,
                    }
                })
            })
        })
        .collect()
}

/// Uses FAST (Features from Accelerated Segment Test)
/// as a keypoint detector for features like corners in a grayscale image
#[derive(Debug, Clone)]
pub struct FastDetector {
    pub threshold: u8,
}

impl Default for FastDetector {
    fn default() -> Self {
        Self { threshold: 30 }
    }
}

/// Neighborhood diameter of the 16 pixel Bresenham circle
pub const FAST_KEYPOINT_SIZE: f32 = 7.0;

impl KeypointDetector for FastDetector {
    fn detect(&self, image: &GrayImage) -> Vec<Keypoint> {
        fast_corners(image, self.threshold)
            .into_iter()
            .map(|Corner { x, y, score }| {
                Keypoint::new(x as f32, y as f32, FAST_KEYPOINT_SIZE).with_response(score)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;

    fn square() -> GrayImage {
        GrayImage::from_fn(48, 48, |x, y| {
            if (12..36).contains(&x) && (12..36).contains(&y) {
                Luma([230])
            } else {
                Luma([25])
            }
        })
    }

    #[test]
    fn suppression_leaves_isolated_corners() {
        let corners = fast_corners(&square(), 30);
        assert!(!corners.is_empty());

        for a in &corners {
            for b in &corners {
                if (a.x, a.y) != (b.x, b.y) {
                    let adjacent = a.x.abs_diff(b.x) <= 1 && a.y.abs_diff(b.y) <= 1;
                    assert!(!adjacent, "({},{}) and ({},{}) both survived", a.x, a.y, b.x, b.y);
                }
            }
        }
    }

    #[test]
    fn keypoints_carry_scores() {
        let keypoints = FastDetector::default().detect(&square());
        assert!(!keypoints.is_empty());
        assert!(keypoints.iter().all(|kp| kp.response > 0.0));
        assert!(keypoints.iter().all(|kp| kp.size == FAST_KEYPOINT_SIZE));
    }

    #[test]
    fn deterministic_for_the_same_image() {
        let detector = FastDetector::default();
        assert_eq!(detector.detect(&square()), detector.detect(&square()));
    }
}
