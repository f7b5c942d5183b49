//! Floating point rasters and the scale-space helpers shared by the blob
//! detectors (SIFT, AKAZE) and the histogram descriptors.

use image::{imageops, GrayImage};

/// Row-major single channel `f32` raster, intensities normalized to `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct FloatImage {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
}

impl FloatImage {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width * height],
        }
    }

    pub fn from_gray(image: &GrayImage) -> Self {
        Self {
            width: image.width() as usize,
            height: image.height() as usize,
            data: image.as_raw().iter().map(|&p| p as f32 / 255.0).collect(),
        }
    }

    #[inline]
    pub fn at(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: f32) {
        self.data[y * self.width + x] = value;
    }

    /// Border-replicating access for possibly out of range coordinates
    #[inline]
    pub fn clamped(&self, x: isize, y: isize) -> f32 {
        let x = x.clamp(0, self.width as isize - 1) as usize;
        let y = y.clamp(0, self.height as isize - 1) as usize;
        self.at(x, y)
    }

    /// Bilinear interpolation with replicated borders
    pub fn sample(&self, x: f32, y: f32) -> f32 {
        let x0 = x.floor();
        let y0 = y.floor();
        let (fx, fy) = (x - x0, y - y0);
        let (x0, y0) = (x0 as isize, y0 as isize);

        let top = self.clamped(x0, y0) * (1.0 - fx) + self.clamped(x0 + 1, y0) * fx;
        let bottom = self.clamped(x0, y0 + 1) * (1.0 - fx) + self.clamped(x0 + 1, y0 + 1) * fx;
        top * (1.0 - fy) + bottom * fy
    }

    /// Central difference gradient `(dx, dy)`
    #[inline]
    pub fn gradient(&self, x: usize, y: usize) -> (f32, f32) {
        let (x, y) = (x as isize, y as isize);
        (
            0.5 * (self.clamped(x + 1, y) - self.clamped(x - 1, y)),
            0.5 * (self.clamped(x, y + 1) - self.clamped(x, y - 1)),
        )
    }

    pub fn max_value(&self) -> f32 {
        self.data.iter().copied().fold(f32::MIN, f32::max)
    }

    /// Separable gaussian blur with a kernel truncated at three sigmas
    pub fn gaussian_blur(&self, sigma: f32) -> Self {
        if sigma <= 0.0 || self.data.is_empty() {
            return self.clone();
        }

        let radius = (3.0 * sigma).ceil().max(1.0) as isize;
        let mut kernel: Vec<f32> = (-radius..=radius)
            .map(|i| (-(i * i) as f32 / (2.0 * sigma * sigma)).exp())
            .collect();
        let norm: f32 = kernel.iter().sum();
        kernel.iter_mut().for_each(|k| *k /= norm);

        let mut horizontal = Self::new(self.width, self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                let value = kernel.iter().enumerate().fold(0.0, |acc, (k, weight)| {
                    acc + weight * self.clamped(x as isize + k as isize - radius, y as isize)
                });
                horizontal.set(x, y, value);
            }
        }

        let mut blurred = Self::new(self.width, self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                let value = kernel.iter().enumerate().fold(0.0, |acc, (k, weight)| {
                    acc + weight * horizontal.clamped(x as isize, y as isize + k as isize - radius)
                });
                blurred.set(x, y, value);
            }
        }

        blurred
    }

    /// Keeps every second pixel in both directions
    pub fn downsample(&self) -> Self {
        let width = (self.width / 2).max(1);
        let height = (self.height / 2).max(1);
        let mut out = Self::new(width, height);
        for y in 0..height {
            for x in 0..width {
                out.set(x, y, self.clamped(2 * x as isize, 2 * y as isize));
            }
        }
        out
    }

    pub fn difference(&self, other: &Self) -> Self {
        Self {
            width: self.width,
            height: self.height,
            data: self.data.iter().zip(&other.data).map(|(a, b)| a - b).collect(),
        }
    }
}

/// Summed area table for constant time box means.
#[derive(Debug, Clone)]
pub struct IntegralImage {
    width: usize,
    height: usize,
    sums: Vec<f64>,
}

impl IntegralImage {
    pub fn new(image: &FloatImage) -> Self {
        let stride = image.width + 1;
        let mut sums = vec![0f64; stride * (image.height + 1)];
        for y in 0..image.height {
            let mut row = 0f64;
            for x in 0..image.width {
                row += image.at(x, y) as f64;
                sums[(y + 1) * stride + x + 1] = sums[y * stride + x + 1] + row;
            }
        }
        Self {
            width: image.width,
            height: image.height,
            sums,
        }
    }

    /// Mean over the square of half side `radius` centered at `(x, y)`,
    /// clipped to the image. Falls back to the nearest pixel when the square
    /// lies completely outside.
    pub fn box_mean(&self, x: f32, y: f32, radius: f32) -> f32 {
        let radius = radius.max(0.5);
        // pixels whose centers lie in [c - radius, c + radius], as a half-open range
        let span = |c: f32, len: usize| {
            let lo = ((c - radius).ceil().max(0.0) as usize).min(len - 1);
            let hi = ((c + radius).floor().max(0.0) as usize).min(len - 1).max(lo);
            (lo, hi + 1)
        };
        let (x0, x1) = span(x, self.width);
        let (y0, y1) = span(y, self.height);

        let stride = self.width + 1;
        let sum = self.sums[y1 * stride + x1] - self.sums[y0 * stride + x1] - self.sums[y1 * stride + x0]
            + self.sums[y0 * stride + x0];
        (sum / ((x1 - x0) * (y1 - y0)) as f64) as f32
    }
}

/// Dominant gradient orientation around `(x, y)` from a 36 bin histogram
/// weighted by a gaussian of `sigma`. Returns radians in `[0, 2π)`.
pub fn dominant_orientation(image: &FloatImage, x: f32, y: f32, sigma: f32) -> f32 {
    const BINS: usize = 36;
    let radius = (3.0 * sigma).round().max(1.0) as isize;
    let (cx, cy) = (x.round() as isize, y.round() as isize);

    let mut histogram = [0f32; BINS];
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let (px, py) = (cx + dx, cy + dy);
            if px <= 0 || py <= 0 || px >= image.width as isize - 1 || py >= image.height as isize - 1 {
                continue;
            }
            let (gx, gy) = image.gradient(px as usize, py as usize);
            let magnitude = (gx * gx + gy * gy).sqrt();
            let weight = (-((dx * dx + dy * dy) as f32) / (2.0 * sigma * sigma)).exp();
            let angle = gy.atan2(gx).rem_euclid(std::f32::consts::TAU);
            let bin = ((angle / std::f32::consts::TAU) * BINS as f32) as usize % BINS;
            histogram[bin] += weight * magnitude;
        }
    }

    // smooth the histogram once so a single noisy bin doesn't win
    let smoothed: Vec<f32> = (0..BINS)
        .map(|i| {
            0.25 * histogram[(i + BINS - 1) % BINS] + 0.5 * histogram[i] + 0.25 * histogram[(i + 1) % BINS]
        })
        .collect();

    let best = smoothed
        .iter()
        .enumerate()
        .fold((0, f32::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0;

    (best as f32 + 0.5) * std::f32::consts::TAU / BINS as f32
}

/// Image pyramid where level `i` is scaled by `1 / factor^i`.
pub fn gray_pyramid(image: &GrayImage, levels: usize, factor: f32) -> Vec<(GrayImage, f32)> {
    let mut pyramid = Vec::with_capacity(levels);
    pyramid.push((image.clone(), 1.0));

    for level in 1..levels {
        let scale = factor.powi(level as i32);
        let width = (image.width() as f32 / scale).round() as u32;
        let height = (image.height() as f32 / scale).round() as u32;
        if width < 16 || height < 16 {
            break;
        }
        pyramid.push((
            imageops::resize(image, width, height, imageops::FilterType::Triangle),
            scale,
        ));
    }

    pyramid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blur_preserves_constant_images() {
        let mut image = FloatImage::new(9, 7);
        image.data.iter_mut().for_each(|p| *p = 0.25);

        let blurred = image.gaussian_blur(1.6);
        assert!(blurred.data.iter().all(|p| (p - 0.25).abs() < 1e-5));
    }

    #[test]
    fn sample_interpolates_between_pixels() {
        let mut image = FloatImage::new(2, 1);
        image.set(1, 0, 1.0);
        assert!((image.sample(0.25, 0.0) - 0.25).abs() < 1e-6);
        assert_eq!(image.sample(5.0, 3.0), 1.0);
    }

    #[test]
    fn box_mean_matches_direct_average() {
        let mut image = FloatImage::new(5, 5);
        for (i, p) in image.data.iter_mut().enumerate() {
            *p = i as f32;
        }
        let integral = IntegralImage::new(&image);

        // 3x3 around the center: rows 1..=3, columns 1..=3
        assert!((integral.box_mean(2.0, 2.0, 1.0) - 12.0).abs() < 1e-5);
        assert!((integral.box_mean(0.0, 0.0, 0.5) - 0.0).abs() < 1e-5);
        // clipped at the border
        assert!((integral.box_mean(-10.0, -10.0, 1.0) - 0.0).abs() < 1e-5);
    }

    #[test]
    fn orientation_points_along_the_gradient() {
        // intensity grows to the right, gradient angle is ~0
        let mut image = FloatImage::new(21, 21);
        for y in 0..21 {
            for x in 0..21 {
                image.set(x, y, x as f32 / 20.0);
            }
        }

        let angle = dominant_orientation(&image, 10.0, 10.0, 2.0);
        assert!(angle < 0.2 || angle > std::f32::consts::TAU - 0.2, "angle {angle}");
    }

    #[test]
    fn pyramid_stops_at_small_levels() {
        let pyramid = gray_pyramid(&GrayImage::new(64, 64), 8, 2.0);
        assert_eq!(pyramid.len(), 3);
        assert_eq!(pyramid[2].0.dimensions(), (16, 16));
        assert_eq!(pyramid[2].1, 4.0);
    }
}
