//! Difference of gaussians detector and the 128 dimensional gradient histogram
//! descriptor.

use image::GrayImage;
use nalgebra::{Matrix2, Matrix3, Vector3};

use super::scale_space::{dominant_orientation, FloatImage};
use crate::{
    error::Result,
    features::{descriptor::DescriptorComputer, detector::KeypointDetector},
    frame::{Descriptors, Keypoint},
};

/// Floats per SIFT descriptor: 4x4 spatial cells of 8 orientation bins
pub const SIFT_DIMENSIONS: usize = 4 * 4 * 8;

const SIFT_BASE_SIGMA: f32 = 1.6;
/// Blur the camera is assumed to have applied already
const SIFT_INITIAL_SIGMA: f32 = 0.5;
const SIFT_MAX_REFINEMENTS: usize = 5;
const SIFT_IMAGE_BORDER: usize = 5;

/// Gaussian octaves, each with `intervals + 3` progressively blurred images.
#[derive(Debug, Clone)]
struct GaussianPyramid {
    intervals: usize,
    octaves: Vec<Vec<FloatImage>>,
}

impl GaussianPyramid {
    fn build(image: &GrayImage, max_octaves: usize, intervals: usize) -> Self {
        if image.width() == 0 || image.height() == 0 {
            return Self {
                intervals,
                octaves: Vec::new(),
            };
        }

        let presmooth = (SIFT_BASE_SIGMA.powi(2) - SIFT_INITIAL_SIGMA.powi(2)).sqrt();
        let mut base = FloatImage::from_gray(image).gaussian_blur(presmooth);

        // incremental blur taking level k-1 to level k
        let steps: Vec<f32> = (1..intervals + 3)
            .map(|k| {
                let previous = Self::level_sigma(k - 1, intervals);
                let current = Self::level_sigma(k, intervals);
                (current * current - previous * previous).sqrt()
            })
            .collect();

        let mut octaves = Vec::with_capacity(max_octaves);
        for octave in 0..max_octaves {
            if octave > 0 {
                // level `intervals` has twice the base blur
                let next = octaves
                    .last()
                    .and_then(|levels: &Vec<FloatImage>| levels.get(intervals))
                    .map(FloatImage::downsample);
                match next {
                    Some(next) if next.width >= 16 && next.height >= 16 => base = next,
                    _ => break,
                }
            }

            let mut levels = Vec::with_capacity(intervals + 3);
            levels.push(base.clone());
            for &step in &steps {
                let blurred = levels[levels.len() - 1].gaussian_blur(step);
                levels.push(blurred);
            }
            octaves.push(levels);
        }

        Self { intervals, octaves }
    }

    /// Blur of level `k` relative to its own octave
    fn level_sigma(k: usize, intervals: usize) -> f32 {
        SIFT_BASE_SIGMA * 2f32.powf(k as f32 / intervals as f32)
    }

    /// Octave and level whose blur best matches a full resolution `sigma`
    fn locate(&self, sigma: f32) -> (usize, usize) {
        let octaves = self.octaves.len().max(1);
        let exponent = (sigma / SIFT_BASE_SIGMA).max(1.0).log2();
        let octave = (exponent.floor() as usize).min(octaves - 1);
        let level = ((exponent - octave as f32) * self.intervals as f32).round() as usize;
        (octave, level.min(self.intervals + 2))
    }
}

#[derive(Debug, Clone)]
pub struct SiftDetector {
    pub octaves: usize,
    pub intervals: usize,
    pub contrast_threshold: f32,
    pub edge_ratio: f32,
}

impl Default for SiftDetector {
    fn default() -> Self {
        Self {
            octaves: 4,
            intervals: 3,
            contrast_threshold: 0.04,
            edge_ratio: 10.0,
        }
    }
}

/// `(x, y, level)` neighbourhood of a difference of gaussians sample
struct DogStack<'a>(&'a [FloatImage]);

impl DogStack<'_> {
    #[inline]
    fn at(&self, x: usize, y: usize, s: usize) -> f32 {
        self.0[s].at(x, y)
    }

    fn is_extremum(&self, x: usize, y: usize, s: usize) -> bool {
        let value = self.at(x, y, s);
        let mut is_max = true;
        let mut is_min = true;
        for ds in [s - 1, s, s + 1] {
            for ny in y - 1..=y + 1 {
                for nx in x - 1..=x + 1 {
                    if (nx, ny, ds) == (x, y, s) {
                        continue;
                    }
                    let other = self.at(nx, ny, ds);
                    is_max &= value > other;
                    is_min &= value < other;
                }
            }
        }
        is_max || is_min
    }

    fn gradient(&self, x: usize, y: usize, s: usize) -> Vector3<f32> {
        Vector3::new(
            0.5 * (self.at(x + 1, y, s) - self.at(x - 1, y, s)),
            0.5 * (self.at(x, y + 1, s) - self.at(x, y - 1, s)),
            0.5 * (self.at(x, y, s + 1) - self.at(x, y, s - 1)),
        )
    }

    fn hessian(&self, x: usize, y: usize, s: usize) -> Matrix3<f32> {
        let center = 2.0 * self.at(x, y, s);
        let dxx = self.at(x + 1, y, s) + self.at(x - 1, y, s) - center;
        let dyy = self.at(x, y + 1, s) + self.at(x, y - 1, s) - center;
        let dss = self.at(x, y, s + 1) + self.at(x, y, s - 1) - center;
        let dxy = 0.25
            * (self.at(x + 1, y + 1, s) - self.at(x - 1, y + 1, s) - self.at(x + 1, y - 1, s)
                + self.at(x - 1, y - 1, s));
        let dxs = 0.25
            * (self.at(x + 1, y, s + 1) - self.at(x - 1, y, s + 1) - self.at(x + 1, y, s - 1)
                + self.at(x - 1, y, s - 1));
        let dys = 0.25
            * (self.at(x, y + 1, s + 1) - self.at(x, y - 1, s + 1) - self.at(x, y + 1, s - 1)
                + self.at(x, y - 1, s - 1));

        Matrix3::new(dxx, dxy, dxs, dxy, dyy, dys, dxs, dys, dss)
    }
}

/// Sub-pixel, sub-level location of an extremum
struct Refined {
    x: f32,
    y: f32,
    level: f32,
    contrast: f32,
    /// Integer sample the fit converged on
    sample: (usize, usize, usize),
}

impl SiftDetector {
    /// Fits a quadratic around `(x, y, s)`, moving to the neighbouring sample
    /// while the offset leaves the unit cell. Rejects low contrast and edge
    /// responses.
    fn refine(&self, dog: &DogStack, mut x: usize, mut y: usize, mut s: usize) -> Option<Refined> {
        let (width, height) = (dog.0[0].width, dog.0[0].height);

        for _ in 0..SIFT_MAX_REFINEMENTS {
            let gradient = dog.gradient(x, y, s);
            let hessian = dog.hessian(x, y, s);
            let offset = hessian.lu().solve(&(-gradient))?;

            if offset.iter().all(|o| o.abs() < 0.5) {
                let contrast = dog.at(x, y, s) + 0.5 * gradient.dot(&offset);
                if contrast.abs() * (self.intervals as f32) < self.contrast_threshold {
                    return None;
                }

                let edge = Matrix2::new(hessian[(0, 0)], hessian[(0, 1)], hessian[(1, 0)], hessian[(1, 1)]);
                let (trace, det) = (edge.trace(), edge.determinant());
                let r = self.edge_ratio;
                if det <= 0.0 || trace * trace * r >= (r + 1.0).powi(2) * det {
                    return None;
                }

                return Some(Refined {
                    x: x as f32 + offset.x,
                    y: y as f32 + offset.y,
                    level: s as f32 + offset.z,
                    contrast,
                    sample: (x, y, s),
                });
            }

            let step = |value: usize, delta: f32| (value as f32 + delta.round()) as isize;
            let (nx, ny, ns) = (step(x, offset.x), step(y, offset.y), step(s, offset.z));
            if ns < 1
                || ns > self.intervals as isize
                || nx < SIFT_IMAGE_BORDER as isize
                || ny < SIFT_IMAGE_BORDER as isize
                || nx >= (width - SIFT_IMAGE_BORDER) as isize
                || ny >= (height - SIFT_IMAGE_BORDER) as isize
            {
                return None;
            }
            (x, y, s) = (nx as usize, ny as usize, ns as usize);
        }

        None
    }
}

impl KeypointDetector for SiftDetector {
    fn detect(&self, image: &GrayImage) -> Vec<Keypoint> {
        if image.width() == 0 || image.height() == 0 {
            return Vec::new();
        }
        let pyramid = GaussianPyramid::build(image, self.octaves, self.intervals);
        let prefilter = 0.5 * self.contrast_threshold / self.intervals as f32;

        let mut keypoints = Vec::new();
        for (octave, levels) in pyramid.octaves.iter().enumerate() {
            let dogs: Vec<FloatImage> = levels.windows(2).map(|pair| pair[1].difference(&pair[0])).collect();
            let dog = DogStack(&dogs);
            let (width, height) = (dogs[0].width, dogs[0].height);
            if width <= 2 * SIFT_IMAGE_BORDER || height <= 2 * SIFT_IMAGE_BORDER {
                continue;
            }
            let stride = (1 << octave) as f32;

            for s in 1..=self.intervals {
                for y in SIFT_IMAGE_BORDER..height - SIFT_IMAGE_BORDER {
                    for x in SIFT_IMAGE_BORDER..width - SIFT_IMAGE_BORDER {
                        if dog.at(x, y, s).abs() <= prefilter || !dog.is_extremum(x, y, s) {
                            continue;
                        }
                        let Some(refined) = self.refine(&dog, x, y, s) else {
                            continue;
                        };

                        let sigma = SIFT_BASE_SIGMA * 2f32.powf(refined.level / self.intervals as f32);
                        let (_, _, sample_level) = refined.sample;
                        let angle = dominant_orientation(&levels[sample_level], refined.x, refined.y, 1.5 * sigma);

                        keypoints.push(
                            Keypoint::new(refined.x * stride, refined.y * stride, 2.0 * sigma * stride)
                                .with_response(refined.contrast.abs())
                                .with_angle(angle)
                                .with_octave(octave as i32),
                        );
                    }
                }
            }
        }

        keypoints
    }
}

/// Gradient histograms over a 4x4 grid around each keypoint, rotated to the
/// keypoint orientation.
///
/// Works on keypoints from any detector: the pyramid level is picked from the
/// keypoint size and a missing angle is estimated from local gradients.
#[derive(Debug, Clone)]
pub struct SiftExtractor {
    pub octaves: usize,
    pub intervals: usize,
}

impl Default for SiftExtractor {
    fn default() -> Self {
        Self {
            octaves: 4,
            intervals: 3,
        }
    }
}

impl SiftExtractor {
    const GRID: usize = 4;
    const BINS: usize = 8;
    const MAGNITUDE_CLAMP: f32 = 0.2;

    fn describe(image: &FloatImage, x: f32, y: f32, sigma: f32, angle: f32, out: &mut [f32]) {
        let (grid, bins) = (Self::GRID as f32, Self::BINS as f32);
        let cell = 3.0 * sigma;
        let radius = (cell * std::f32::consts::SQRT_2 * (grid + 1.0) * 0.5)
            .round()
            .min((image.width.max(image.height)) as f32) as isize;
        let (sin, cos) = (-angle).sin_cos();
        let (cx, cy) = (x.round() as isize, y.round() as isize);
        let weight_scale = -1.0 / (0.5 * grid * grid);

        for dy in -radius..=radius {
            for dx in -radius..=radius {
                // position in cell units, rotated into the keypoint frame
                let col = (cos * dx as f32 - sin * dy as f32) / cell;
                let row = (sin * dx as f32 + cos * dy as f32) / cell;
                let (bin_col, bin_row) = (col + grid / 2.0 - 0.5, row + grid / 2.0 - 0.5);
                if bin_col <= -1.0 || bin_row <= -1.0 || bin_col >= grid || bin_row >= grid {
                    continue;
                }

                let (px, py) = (cx + dx, cy + dy);
                if px <= 0 || py <= 0 || px >= image.width as isize - 1 || py >= image.height as isize - 1 {
                    continue;
                }
                let (gx, gy) = image.gradient(px as usize, py as usize);
                let magnitude = (gx * gx + gy * gy).sqrt()
                    * ((col * col + row * row) * weight_scale).exp();
                let orientation = (gy.atan2(gx) - angle).rem_euclid(std::f32::consts::TAU);
                let bin_orientation = orientation / std::f32::consts::TAU * bins;

                // trilinear distribution over the neighbouring cells and bins
                let (r0, c0, o0) = (bin_row.floor(), bin_col.floor(), bin_orientation.floor());
                let (fr, fc, fo) = (bin_row - r0, bin_col - c0, bin_orientation - o0);
                for (ri, wr) in [(r0 as isize, 1.0 - fr), (r0 as isize + 1, fr)] {
                    if ri < 0 || ri >= Self::GRID as isize {
                        continue;
                    }
                    for (ci, wc) in [(c0 as isize, 1.0 - fc), (c0 as isize + 1, fc)] {
                        if ci < 0 || ci >= Self::GRID as isize {
                            continue;
                        }
                        for (oi, wo) in [(o0 as usize, 1.0 - fo), (o0 as usize + 1, fo)] {
                            let index = (ri as usize * Self::GRID + ci as usize) * Self::BINS + oi % Self::BINS;
                            out[index] += magnitude * wr * wc * wo;
                        }
                    }
                }
            }
        }

        Self::normalize(out);
    }

    /// Unit length, clamp large components, renormalize, scale to byte range
    fn normalize(out: &mut [f32]) {
        let norm = out.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm <= f32::EPSILON {
            return;
        }
        let clamp = Self::MAGNITUDE_CLAMP * norm;
        out.iter_mut().for_each(|v| *v = v.min(clamp));

        let norm = out.iter().map(|v| v * v).sum::<f32>().sqrt().max(f32::EPSILON);
        out.iter_mut().for_each(|v| *v = (*v * 512.0 / norm).min(255.0));
    }
}

impl DescriptorComputer for SiftExtractor {
    fn compute(&self, image: &GrayImage, keypoints: &[Keypoint]) -> Result<Descriptors> {
        let pyramid = GaussianPyramid::build(image, self.octaves, self.intervals);

        let mut data = vec![0f32; keypoints.len() * SIFT_DIMENSIONS];
        for (keypoint, row) in keypoints.iter().zip(data.chunks_exact_mut(SIFT_DIMENSIONS)) {
            let (octave, level) = pyramid.locate(keypoint.size / 2.0);
            let Some(smoothed) = pyramid.octaves.get(octave).and_then(|levels| levels.get(level)) else {
                continue;
            };
            let stride = (1 << octave) as f32;
            let (x, y) = (keypoint.x / stride, keypoint.y / stride);
            let sigma = GaussianPyramid::level_sigma(level, self.intervals);
            let angle = keypoint
                .angle
                .unwrap_or_else(|| dominant_orientation(smoothed, x, y, 1.5 * sigma));

            Self::describe(smoothed, x, y, sigma, angle, row);
        }

        Ok(Descriptors::real(SIFT_DIMENSIONS, data))
    }
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;

    fn blob(cx: f32, cy: f32, radius: f32) -> GrayImage {
        GrayImage::from_fn(96, 96, |x, y| {
            let (dx, dy) = (x as f32 - cx, y as f32 - cy);
            let value = 20.0 + 200.0 * (-(dx * dx + dy * dy) / (2.0 * radius * radius)).exp();
            Luma([value as u8])
        })
    }

    #[test]
    fn pyramid_has_intervals_plus_three_levels() {
        let pyramid = GaussianPyramid::build(&GrayImage::new(64, 64), 4, 3);
        assert_eq!(pyramid.octaves.len(), 3);
        assert!(pyramid.octaves.iter().all(|levels| levels.len() == 6));
        assert_eq!(pyramid.octaves[1][0].width, 32);
    }

    #[test]
    fn locate_picks_octave_from_scale() {
        let pyramid = GaussianPyramid::build(&GrayImage::new(128, 128), 4, 3);
        assert_eq!(pyramid.locate(1.0), (0, 0));
        assert_eq!(pyramid.locate(3.2), (1, 0));
        assert_eq!(pyramid.locate(1000.0).0, pyramid.octaves.len() - 1);
    }

    #[test]
    fn finds_a_gaussian_blob() {
        let keypoints = SiftDetector::default().detect(&blob(48.0, 48.0, 4.0));
        assert!(!keypoints.is_empty());
        assert!(keypoints
            .iter()
            .any(|kp| (kp.x - 48.0).abs() < 3.0 && (kp.y - 48.0).abs() < 3.0));
    }

    #[test]
    fn descriptors_are_clamped_and_scaled() {
        let image = blob(48.0, 48.0, 6.0);
        let keypoints = [
            Keypoint::new(44.0, 48.0, 8.0).with_angle(0.0),
            Keypoint::new(44.0, 48.0, 8.0).with_angle(0.0),
        ];
        let descriptors = SiftExtractor::default().compute(&image, &keypoints).unwrap();
        assert_eq!(descriptors.width(), SIFT_DIMENSIONS);

        let row = descriptors.real_row(0).unwrap();
        assert!(row.iter().all(|&v| (0.0..=255.0).contains(&v)));
        assert!(row.iter().any(|&v| v > 0.0));
        assert_eq!(descriptors.real_row(0), descriptors.real_row(1));
    }

    #[test]
    fn flat_patches_describe_as_zero() {
        let image = GrayImage::from_pixel(64, 64, Luma([90]));
        let descriptors = SiftExtractor::default()
            .compute(&image, &[Keypoint::new(32.0, 32.0, 7.0)])
            .unwrap();
        assert!(descriptors.real_row(0).unwrap().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn empty_image_has_no_keypoints() {
        let image = GrayImage::new(0, 0);
        assert!(SiftDetector::default().detect(&image).is_empty());
        assert!(GaussianPyramid::build(&image, 4, 3).octaves.is_empty());
        assert!(GaussianPyramid::build(&GrayImage::new(0, 12), 4, 3).octaves.is_empty());
    }
}
