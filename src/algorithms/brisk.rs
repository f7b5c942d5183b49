use image::GrayImage;
use once_cell::sync::Lazy;

use super::{
    fast::fast_corners,
    scale_space::{gray_pyramid, FloatImage},
};
use crate::{
    error::Result,
    features::{descriptor::DescriptorComputer, detector::KeypointDetector},
    frame::{Descriptors, Keypoint},
};

/// Bytes per BRISK descriptor (512 short-pair comparisons)
pub const BRISK_BYTES: usize = 64;

/// Keypoint diameter at the finest octave
const BRISK_BASE_SIZE: f32 = 12.0;

/// Multi-octave FAST with per-octave score suppression.
#[derive(Debug, Clone)]
pub struct BriskDetector {
    pub threshold: u8,
    pub octaves: usize,
}

impl Default for BriskDetector {
    fn default() -> Self {
        Self {
            threshold: 30,
            octaves: 4,
        }
    }
}

impl KeypointDetector for BriskDetector {
    fn detect(&self, image: &GrayImage) -> Vec<Keypoint> {
        let mut keypoints = Vec::new();
        for (octave, (level, scale)) in gray_pyramid(image, self.octaves, 2.0).into_iter().enumerate() {
            keypoints.extend(fast_corners(&level, self.threshold).into_iter().map(|corner| {
                Keypoint::new(
                    corner.x as f32 * scale,
                    corner.y as f32 * scale,
                    BRISK_BASE_SIZE * scale,
                )
                .with_response(corner.score)
                .with_octave(octave as i32)
            }));
        }
        keypoints
    }
}

/// Sampling points on concentric rings and the comparison pairs built from them.
struct BriskPattern {
    points: Vec<(f32, f32)>,
    /// Pairs compared to build the bit string
    short_pairs: Vec<(usize, usize)>,
    /// Pairs whose intensity differences estimate the orientation
    long_pairs: Vec<(usize, usize)>,
}

static BRISK_PATTERN: Lazy<BriskPattern> = Lazy::new(|| {
    // ring radii (in units of the keypoint scale) and points per ring
    const RINGS: [(f32, usize); 5] = [(0.0, 1), (2.9, 10), (4.9, 14), (7.4, 15), (10.8, 20)];
    const SCALE: f32 = 0.85;
    const LONG_PAIR_MIN: f32 = 8.2 * SCALE;

    let mut points = Vec::new();
    for (ring, &(radius, count)) in RINGS.iter().enumerate() {
        // odd rings are rotated by half a step so the points interleave
        let offset = if ring % 2 == 1 { std::f32::consts::PI / count as f32 } else { 0.0 };
        for k in 0..count {
            let theta = offset + std::f32::consts::TAU * k as f32 / count as f32;
            points.push((SCALE * radius * theta.cos(), SCALE * radius * theta.sin()));
        }
    }

    let mut pairs: Vec<(f32, usize, usize)> = Vec::new();
    for i in 0..points.len() {
        for j in 0..i {
            let (dx, dy) = (points[i].0 - points[j].0, points[i].1 - points[j].1);
            pairs.push(((dx * dx + dy * dy).sqrt(), i, j));
        }
    }
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

    let short_pairs = pairs.iter().take(BRISK_BYTES * 8).map(|&(_, i, j)| (i, j)).collect();
    let long_pairs = pairs
        .iter()
        .filter(|p| p.0 > LONG_PAIR_MIN)
        .map(|&(_, i, j)| (i, j))
        .collect();

    BriskPattern {
        points,
        short_pairs,
        long_pairs,
    }
});

/// BRISK descriptor: orientation from long pairs, bits from short pairs.
#[derive(Debug, Clone)]
pub struct BriskExtractor {
    pub smoothing_sigma: f32,
}

impl Default for BriskExtractor {
    fn default() -> Self {
        Self {
            smoothing_sigma: 1.0,
        }
    }
}

impl BriskExtractor {
    fn sample(image: &FloatImage, keypoint: &Keypoint, scale: f32, (sin, cos): (f32, f32)) -> Vec<f32> {
        BRISK_PATTERN
            .points
            .iter()
            .map(|&(px, py)| {
                let x = keypoint.x + scale * (cos * px - sin * py);
                let y = keypoint.y + scale * (sin * px + cos * py);
                image.sample(x, y)
            })
            .collect()
    }

    /// Local gradient from intensity differences over the long pairs
    fn orientation(values: &[f32], scale: f32) -> f32 {
        let points = &BRISK_PATTERN.points;
        let (mut gx, mut gy) = (0f32, 0f32);
        for &(i, j) in &BRISK_PATTERN.long_pairs {
            let (dx, dy) = (
                scale * (points[j].0 - points[i].0),
                scale * (points[j].1 - points[i].1),
            );
            let weight = (values[j] - values[i]) / (dx * dx + dy * dy);
            gx += weight * dx;
            gy += weight * dy;
        }
        gy.atan2(gx)
    }
}

impl DescriptorComputer for BriskExtractor {
    fn compute(&self, image: &GrayImage, keypoints: &[Keypoint]) -> Result<Descriptors> {
        let smoothed = FloatImage::from_gray(image).gaussian_blur(self.smoothing_sigma);

        let mut data = vec![0u8; keypoints.len() * BRISK_BYTES];
        for (keypoint, row) in keypoints.iter().zip(data.chunks_exact_mut(BRISK_BYTES)) {
            let scale = (keypoint.size / BRISK_BASE_SIZE).max(0.5);

            let upright = Self::sample(&smoothed, keypoint, scale, (0.0, 1.0));
            let angle = Self::orientation(&upright, scale);
            let values = Self::sample(&smoothed, keypoint, scale, angle.sin_cos());

            for (bit, &(i, j)) in BRISK_PATTERN.short_pairs.iter().enumerate() {
                if values[i] > values[j] {
                    row[bit / 8] |= 1 << (7 - bit % 8);
                }
            }
        }

        Ok(Descriptors::binary(BRISK_BYTES, data))
    }
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;

    #[test]
    fn pattern_has_sixty_points_and_enough_pairs() {
        assert_eq!(BRISK_PATTERN.points.len(), 60);
        assert_eq!(BRISK_PATTERN.short_pairs.len(), BRISK_BYTES * 8);
        assert!(!BRISK_PATTERN.long_pairs.is_empty());
    }

    #[test]
    fn octave_keypoints_scale_up() {
        let image = GrayImage::from_fn(128, 128, |x, y| {
            if (32..96).contains(&x) && (32..96).contains(&y) {
                Luma([220])
            } else {
                Luma([20])
            }
        });
        let keypoints = BriskDetector::default().detect(&image);
        assert!(!keypoints.is_empty());
        for kp in &keypoints {
            assert_eq!(kp.size, BRISK_BASE_SIZE * 2f32.powi(kp.octave));
        }

        let descriptors = BriskExtractor::default().compute(&image, &keypoints).unwrap();
        assert_eq!(descriptors.rows(), keypoints.len());
    }

    #[test]
    fn rotation_is_compensated() {
        // a bright disc offset from the keypoint, once to the right and once below
        let disc = |cx: f32, cy: f32| {
            GrayImage::from_fn(64, 64, move |x, y| {
                let (dx, dy) = (x as f32 - cx, y as f32 - cy);
                if dx * dx + dy * dy < 16.0 { Luma([240]) } else { Luma([10]) }
            })
        };
        let keypoint = [Keypoint::new(32.0, 32.0, BRISK_BASE_SIZE)];
        let extractor = BriskExtractor::default();
        let right = extractor.compute(&disc(38.0, 32.0), &keypoint).unwrap();
        let below = extractor.compute(&disc(32.0, 38.0), &keypoint).unwrap();

        let distance: u32 = right
            .binary_row(0)
            .unwrap()
            .iter()
            .zip(below.binary_row(0).unwrap())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum();
        assert!(distance < 128, "distance {distance}");
    }
}
