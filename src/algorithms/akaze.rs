//! AKAZE style blob detector and its M-LDB binary descriptor.
//!
//! The evolutions here come from a gaussian scale space rather than the FED
//! nonlinear diffusion of the reference implementation; detection
//! (scale-normalized Hessian determinant extrema) and description (M-LDB grid
//! comparisons) follow AKAZE.

use image::GrayImage;
use once_cell::sync::Lazy;

use super::scale_space::{dominant_orientation, FloatImage};
use crate::{
    error::{PipelineError, Result},
    features::{
        descriptor::{DescriptorComputer, DescriptorKind},
        detector::KeypointDetector,
    },
    frame::{Descriptors, Keypoint},
};

/// Bytes per M-LDB descriptor: 486 comparisons rounded up
pub const AKAZE_BYTES: usize = 61;

const BASE_SIGMA: f32 = 1.6;
const DERIVATIVE_FACTOR: f32 = 1.5;

/// One level of the scale space.
#[derive(Debug, Clone)]
pub struct Evolution {
    pub image: FloatImage,
    pub octave: usize,
    /// Scale in the pixels of this octave
    pub sigma: f32,
}

impl Evolution {
    /// Factor from this octave's pixels to full resolution pixels
    pub fn stride(&self) -> f32 {
        (1 << self.octave) as f32
    }
}

#[derive(Debug, Clone)]
pub struct ScaleSpace {
    pub octaves: usize,
    pub sublevels: usize,
}

impl Default for ScaleSpace {
    fn default() -> Self {
        Self {
            octaves: 4,
            sublevels: 4,
        }
    }
}

impl ScaleSpace {
    pub fn levels(&self) -> usize {
        self.octaves * self.sublevels
    }

    pub fn build(&self, image: &GrayImage) -> Vec<Evolution> {
        let mut evolutions = Vec::with_capacity(self.levels());
        let mut base = FloatImage::from_gray(image);

        for octave in 0..self.octaves {
            if octave > 0 {
                if base.width < 32 || base.height < 32 {
                    break;
                }
                base = base.gaussian_blur(1.0).downsample();
            }
            for sublevel in 0..self.sublevels {
                let sigma = BASE_SIGMA * 2f32.powf(sublevel as f32 / self.sublevels as f32);
                evolutions.push(Evolution {
                    image: base.gaussian_blur(sigma),
                    octave,
                    sigma,
                });
            }
        }

        evolutions
    }
}

/// `sigma^4 * (Lxx * Lyy - Lxy^2)`
fn hessian_response(evolution: &Evolution) -> FloatImage {
    let image = &evolution.image;
    let norm = evolution.sigma.powi(4);
    let mut response = FloatImage::new(image.width, image.height);

    for y in 0..image.height {
        for x in 0..image.width {
            let (xi, yi) = (x as isize, y as isize);
            let center = image.clamped(xi, yi);
            let lxx = image.clamped(xi + 1, yi) + image.clamped(xi - 1, yi) - 2.0 * center;
            let lyy = image.clamped(xi, yi + 1) + image.clamped(xi, yi - 1) - 2.0 * center;
            let lxy = 0.25
                * (image.clamped(xi + 1, yi + 1) + image.clamped(xi - 1, yi - 1)
                    - image.clamped(xi + 1, yi - 1)
                    - image.clamped(xi - 1, yi + 1));
            response.set(x, y, norm * (lxx * lyy - lxy * lxy));
        }
    }

    response
}

#[derive(Debug, Clone)]
pub struct AkazeDetector {
    pub scale_space: ScaleSpace,
    pub threshold: f32,
}

impl Default for AkazeDetector {
    fn default() -> Self {
        Self {
            scale_space: ScaleSpace::default(),
            threshold: 0.001,
        }
    }
}

impl KeypointDetector for AkazeDetector {
    fn detect(&self, image: &GrayImage) -> Vec<Keypoint> {
        let evolutions = self.scale_space.build(image);
        let responses: Vec<FloatImage> = evolutions.iter().map(hessian_response).collect();

        let mut keypoints = Vec::new();
        for (level, evolution) in evolutions.iter().enumerate() {
            let response = &responses[level];
            let (width, height) = (response.width, response.height);
            let border = (evolution.sigma * DERIVATIVE_FACTOR).ceil() as usize + 1;
            if width <= 2 * border || height <= 2 * border {
                continue;
            }

            // neighbouring sublevels of the same octave share a resolution
            let neighbours: Vec<&FloatImage> = [level.checked_sub(1), Some(level + 1)]
                .into_iter()
                .flatten()
                .filter(|&other| other < evolutions.len() && evolutions[other].octave == evolution.octave)
                .map(|other| &responses[other])
                .collect();

            for y in border..height - border {
                for x in border..width - border {
                    let value = response.at(x, y);
                    if value <= self.threshold {
                        continue;
                    }

                    let is_max = (-1isize..=1).all(|dy| {
                        (-1isize..=1).all(|dx| {
                            let (nx, ny) = ((x as isize + dx) as usize, (y as isize + dy) as usize);
                            let same = (dx == 0 && dy == 0) || response.at(nx, ny) < value;
                            same && neighbours.iter().all(|other| other.at(nx, ny) < value)
                        })
                    });
                    if !is_max {
                        continue;
                    }

                    let stride = evolution.stride();
                    let angle = dominant_orientation(&evolution.image, x as f32, y as f32, 2.5 * evolution.sigma);
                    keypoints.push(
                        Keypoint::new(
                            x as f32 * stride,
                            y as f32 * stride,
                            2.0 * DERIVATIVE_FACTOR * evolution.sigma * stride,
                        )
                        .with_response(value)
                        .with_angle(angle)
                        .with_octave(evolution.octave as i32)
                        .with_class_id(level as i32),
                    );
                }
            }
        }

        keypoints
    }
}

/// Cell pairs of the 2x2, 3x3 and 4x4 grids, as `(grid, cell_a, cell_b)`
static MLDB_PAIRS: Lazy<Vec<(usize, usize, usize)>> = Lazy::new(|| {
    let mut pairs = Vec::new();
    for grid in 2..=4usize {
        let cells = grid * grid;
        for a in 0..cells {
            for b in a + 1..cells {
                pairs.push((grid, a, b));
            }
        }
    }
    pairs
});

/// Modified Local Difference Binary descriptor on the keypoint's own evolution.
///
/// Needs keypoints from [`AkazeDetector`]: the evolution index is read from
/// `class_id`.
#[derive(Debug, Clone, Default)]
pub struct AkazeExtractor {
    pub scale_space: ScaleSpace,
}

impl AkazeExtractor {
    /// Mean intensity, dx and dy of every cell of a `grid x grid` split of the
    /// rotated patch.
    fn cell_means(evolution: &Evolution, x: f32, y: f32, angle: f32, grid: usize) -> Vec<[f32; 3]> {
        const SAMPLES_PER_SIDE: usize = 12;
        let image = &evolution.image;
        let patch = 10.0 * evolution.sigma;
        let step = 2.0 * patch / SAMPLES_PER_SIDE as f32;
        let (sin, cos) = angle.sin_cos();

        let mut sums = vec![[0f32; 3]; grid * grid];
        let mut counts = vec![0usize; grid * grid];
        for j in 0..SAMPLES_PER_SIDE {
            for i in 0..SAMPLES_PER_SIDE {
                let u = -patch + (i as f32 + 0.5) * step;
                let v = -patch + (j as f32 + 0.5) * step;
                let sx = x + cos * u - sin * v;
                let sy = y + sin * u + cos * v;

                let value = image.sample(sx, sy);
                let gx = 0.5 * (image.sample(sx + 1.0, sy) - image.sample(sx - 1.0, sy));
                let gy = 0.5 * (image.sample(sx, sy + 1.0) - image.sample(sx, sy - 1.0));
                // derivatives along the patch axes
                let du = cos * gx + sin * gy;
                let dv = -sin * gx + cos * gy;

                let cell = (j * grid / SAMPLES_PER_SIDE) * grid + i * grid / SAMPLES_PER_SIDE;
                sums[cell][0] += value;
                sums[cell][1] += du;
                sums[cell][2] += dv;
                counts[cell] += 1;
            }
        }

        sums.iter()
            .zip(counts)
            .map(|(sum, count)| {
                let n = count.max(1) as f32;
                [sum[0] / n, sum[1] / n, sum[2] / n]
            })
            .collect()
    }
}

impl DescriptorComputer for AkazeExtractor {
    fn compute(&self, image: &GrayImage, keypoints: &[Keypoint]) -> Result<Descriptors> {
        let levels = self.scale_space.levels() as i32;
        if let Some(index) = keypoints
            .iter()
            .position(|kp| kp.class_id < 0 || kp.class_id >= levels)
        {
            return Err(PipelineError::IncompatibleDetectorDescriptor {
                descriptor: DescriptorKind::Akaze,
                index,
            });
        }

        let evolutions = self.scale_space.build(image);

        let mut data = vec![0u8; keypoints.len() * AKAZE_BYTES];
        for (keypoint, row) in keypoints.iter().zip(data.chunks_exact_mut(AKAZE_BYTES)) {
            // small images may have fewer octaves than the keypoint claims
            let level = (keypoint.class_id as usize).min(evolutions.len().saturating_sub(1));
            let Some(evolution) = evolutions.get(level) else {
                continue;
            };
            let stride = evolution.stride();
            let (x, y) = (keypoint.x / stride, keypoint.y / stride);
            let angle = keypoint.angle.unwrap_or(0.0);

            let grids: Vec<Vec<[f32; 3]>> = (2..=4)
                .map(|grid| Self::cell_means(evolution, x, y, angle, grid))
                .collect();

            let mut bit = 0;
            for &(grid, a, b) in MLDB_PAIRS.iter() {
                let cells = &grids[grid - 2];
                for channel in 0..3 {
                    if cells[a][channel] > cells[b][channel] {
                        row[bit / 8] |= 1 << (7 - bit % 8);
                    }
                    bit += 1;
                }
            }
        }

        Ok(Descriptors::binary(AKAZE_BYTES, data))
    }
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;

    fn blob(cx: f32, cy: f32, radius: f32) -> GrayImage {
        GrayImage::from_fn(96, 96, |x, y| {
            let (dx, dy) = (x as f32 - cx, y as f32 - cy);
            if dx * dx + dy * dy < radius * radius {
                Luma([230])
            } else {
                Luma([20])
            }
        })
    }

    #[test]
    fn descriptor_bits_fit_the_row() {
        assert_eq!(MLDB_PAIRS.len() * 3, 486);
        assert!(486 <= AKAZE_BYTES * 8);
    }

    #[test]
    fn finds_a_blob_and_tags_its_level() {
        let keypoints = AkazeDetector::default().detect(&blob(48.0, 48.0, 5.0));
        assert!(!keypoints.is_empty());

        let strongest = keypoints
            .iter()
            .max_by(|a, b| a.response.total_cmp(&b.response))
            .unwrap();
        assert!((strongest.x - 48.0).abs() <= 4.0 && (strongest.y - 48.0).abs() <= 4.0);
        assert!(keypoints.iter().all(|kp| kp.class_id >= 0 && kp.angle.is_some()));
    }

    #[test]
    fn describes_its_own_keypoints() {
        let image = blob(48.0, 48.0, 5.0);
        let keypoints = AkazeDetector::default().detect(&image);
        let descriptors = AkazeExtractor::default().compute(&image, &keypoints).unwrap();
        assert_eq!(descriptors.rows(), keypoints.len());
        assert_eq!(descriptors.width(), AKAZE_BYTES);
    }

    #[test]
    fn rejects_keypoints_without_evolution() {
        let keypoints = [
            Keypoint::new(10.0, 10.0, 7.0).with_class_id(0),
            Keypoint::new(20.0, 20.0, 7.0),
        ];
        let result = AkazeExtractor::default().compute(&blob(48.0, 48.0, 5.0), &keypoints);
        assert!(matches!(
            result,
            Err(PipelineError::IncompatibleDetectorDescriptor { index: 1, .. })
        ));
    }
}
