use image::GrayImage;

use super::{
    brief::{compute_descriptor, intensity, BRIEF256_SAMPLES, BRIEF_BYTES, PATCH_SIZE},
    fast::fast_corners,
    scale_space::gray_pyramid,
};
use crate::{
    error::Result,
    features::{descriptor::DescriptorComputer, detector::KeypointDetector},
    frame::{Descriptors, Keypoint},
};

/// Diameter of the patch used for orientation and description at level 0
const ORB_PATCH_SIZE: f32 = 31.0;

/// Orientation from the intensity centroid of a circular patch, in radians.
pub fn intensity_centroid_angle(image: &GrayImage, x: f32, y: f32, radius: i32) -> f32 {
    let (mut m01, mut m10) = (0f32, 0f32);
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy > radius * radius {
                continue;
            }
            let value = intensity(image, x + dx as f32, y + dy as f32) as f32;
            m10 += dx as f32 * value;
            m01 += dy as f32 * value;
        }
    }
    m01.atan2(m10)
}

/// Harris measure `det - k * trace^2` over a `block x block` window.
fn harris_score(image: &GrayImage, x: u32, y: u32, block: i32, k: f32) -> f32 {
    let half = block / 2;
    let at = |px: i32, py: i32| intensity(image, px as f32, py as f32) as f32;
    let (mut a, mut b, mut c) = (0f32, 0f32, 0f32);
    for dy in -half..=half {
        for dx in -half..=half {
            let (px, py) = (x as i32 + dx, y as i32 + dy);
            let gx = (at(px + 1, py - 1) + 2.0 * at(px + 1, py) + at(px + 1, py + 1))
                - (at(px - 1, py - 1) + 2.0 * at(px - 1, py) + at(px - 1, py + 1));
            let gy = (at(px - 1, py + 1) + 2.0 * at(px, py + 1) + at(px + 1, py + 1))
                - (at(px - 1, py - 1) + 2.0 * at(px, py - 1) + at(px + 1, py - 1));
            a += gx * gx;
            b += gx * gy;
            c += gy * gy;
        }
    }
    // same scale as a 3x3 sobel over 8 bit data
    let scale = 1.0 / (4.0 * block as f32 * 255.0);
    let (a, b, c) = (a * scale * scale, b * scale * scale, c * scale * scale);
    a * c - b * b - k * (a + c) * (a + c)
}

/// Oriented FAST keypoints over a scale pyramid, ranked by Harris score.
#[derive(Debug, Clone)]
pub struct OrbDetector {
    pub n_features: usize,
    pub scale_factor: f32,
    pub n_levels: usize,
    pub fast_threshold: u8,
    /// Keypoints closer than this to a level's border are dropped
    pub edge_threshold: u32,
}

impl Default for OrbDetector {
    fn default() -> Self {
        Self {
            n_features: 500,
            scale_factor: 1.2,
            n_levels: 8,
            fast_threshold: 20,
            edge_threshold: 16,
        }
    }
}

impl OrbDetector {
    /// Share of `n_features` a level gets; finer levels get more.
    fn level_quota(&self, level: usize) -> usize {
        let inverse = 1.0 / self.scale_factor;
        let first = self.n_features as f32 * (1.0 - inverse)
            / (1.0 - inverse.powi(self.n_levels as i32));
        (first * inverse.powi(level as i32)).round() as usize
    }
}

impl KeypointDetector for OrbDetector {
    fn detect(&self, image: &GrayImage) -> Vec<Keypoint> {
        let mut keypoints = Vec::new();

        for (level, (level_image, scale)) in gray_pyramid(image, self.n_levels, self.scale_factor)
            .into_iter()
            .enumerate()
        {
            let (width, height) = level_image.dimensions();
            let border = self.edge_threshold;

            let mut candidates: Vec<(f32, u32, u32)> = fast_corners(&level_image, self.fast_threshold)
                .into_iter()
                .filter(|c| c.x >= border && c.y >= border && c.x + border < width && c.y + border < height)
                .map(|c| (harris_score(&level_image, c.x, c.y, 7, 0.04), c.x, c.y))
                .collect();
            candidates.sort_by(|a, b| b.0.total_cmp(&a.0));
            candidates.truncate(self.level_quota(level));

            let radius = (ORB_PATCH_SIZE / 2.0) as i32;
            keypoints.extend(candidates.into_iter().map(|(response, x, y)| {
                let angle = intensity_centroid_angle(&level_image, x as f32, y as f32, radius);
                Keypoint::new(x as f32 * scale, y as f32 * scale, ORB_PATCH_SIZE * scale)
                    .with_response(response)
                    .with_angle(angle)
                    .with_octave(level as i32)
            }));
        }

        keypoints
    }
}

/// Steered BRIEF: the BRIEF test pattern rotated by the keypoint orientation.
/// Keypoints without an orientation get one from the intensity centroid.
#[derive(Debug, Clone)]
pub struct OrbExtractor {
    pub smoothing_sigma: f32,
}

impl Default for OrbExtractor {
    fn default() -> Self {
        Self {
            smoothing_sigma: 2.0,
        }
    }
}

impl DescriptorComputer for OrbExtractor {
    fn compute(&self, image: &GrayImage, keypoints: &[Keypoint]) -> Result<Descriptors> {
        let smoothed = imageproc::filter::gaussian_blur_f32(image, self.smoothing_sigma);

        let mut data = vec![0u8; keypoints.len() * BRIEF_BYTES];
        for (keypoint, row) in keypoints.iter().zip(data.chunks_exact_mut(BRIEF_BYTES)) {
            let scale = (keypoint.size / PATCH_SIZE).max(0.5);
            let angle = keypoint.angle.unwrap_or_else(|| {
                let radius = (keypoint.size / 2.0).clamp(3.0, ORB_PATCH_SIZE) as i32;
                intensity_centroid_angle(image, keypoint.x, keypoint.y, radius)
            });
            compute_descriptor(keypoint, &smoothed, &BRIEF256_SAMPLES, Some(angle), scale, row);
        }

        Ok(Descriptors::binary(BRIEF_BYTES, data))
    }
}
