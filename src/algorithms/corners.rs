use image::GrayImage;
use imageproc::gradients::{horizontal_sobel, vertical_sobel};

use crate::{features::detector::KeypointDetector, frame::Keypoint};

/// Windowed sums of gradient products, the second moment matrix
/// `[[xx, xy], [xy, yy]]` at every pixel.
struct StructureTensor {
    width: usize,
    height: usize,
    xx: Vec<f32>,
    xy: Vec<f32>,
    yy: Vec<f32>,
}

impl StructureTensor {
    fn new(image: &GrayImage, block_size: usize) -> Self {
        let (width, height) = (image.width() as usize, image.height() as usize);
        let gx = horizontal_sobel(image);
        let gy = vertical_sobel(image);

        // match the usual normalization of a 3x3 sobel aperture so that
        // thresholds don't depend on the block size
        let scale = 1.0 / (4.0 * block_size as f64 * 255.0);

        // integral images of the products, one extra row/column of zeros
        let stride = width + 1;
        let mut ixx = vec![0f64; stride * (height + 1)];
        let mut ixy = vec![0f64; stride * (height + 1)];
        let mut iyy = vec![0f64; stride * (height + 1)];
        for y in 0..height {
            for x in 0..width {
                let dx = gx.get_pixel(x as u32, y as u32).0[0] as f64 * scale;
                let dy = gy.get_pixel(x as u32, y as u32).0[0] as f64 * scale;
                let at = (y + 1) * stride + x + 1;
                ixx[at] = dx * dx + ixx[at - 1] + ixx[at - stride] - ixx[at - stride - 1];
                ixy[at] = dx * dy + ixy[at - 1] + ixy[at - stride] - ixy[at - stride - 1];
                iyy[at] = dy * dy + iyy[at - 1] + iyy[at - stride] - iyy[at - stride - 1];
            }
        }

        let window = |table: &[f64], x: usize, y: usize| -> f32 {
            let x0 = x.saturating_sub(block_size / 2);
            let y0 = y.saturating_sub(block_size / 2);
            let x1 = (x0 + block_size).min(width);
            let y1 = (y0 + block_size).min(height);
            (table[y1 * stride + x1] - table[y0 * stride + x1] - table[y1 * stride + x0]
                + table[y0 * stride + x0]) as f32
        };

        let mut tensor = Self {
            width,
            height,
            xx: Vec::with_capacity(width * height),
            xy: Vec::with_capacity(width * height),
            yy: Vec::with_capacity(width * height),
        };
        for y in 0..height {
            for x in 0..width {
                tensor.xx.push(window(&ixx, x, y));
                tensor.xy.push(window(&ixy, x, y));
                tensor.yy.push(window(&iyy, x, y));
            }
        }
        tensor
    }

    /// `det(M) - k * trace(M)^2`
    fn harris(&self, k: f32) -> Vec<f32> {
        (0..self.xx.len())
            .map(|i| {
                let (a, b, c) = (self.xx[i], self.xy[i], self.yy[i]);
                a * c - b * b - k * (a + c) * (a + c)
            })
            .collect()
    }

    /// Smaller eigenvalue of `M`
    fn min_eigenvalue(&self) -> Vec<f32> {
        (0..self.xx.len())
            .map(|i| {
                let (a, b, c) = (self.xx[i], self.xy[i], self.yy[i]);
                let half_trace = 0.5 * (a + c);
                let spread = (0.25 * (a - c) * (a - c) + b * b).sqrt();
                half_trace - spread
            })
            .collect()
    }

    fn is_local_max(&self, map: &[f32], x: usize, y: usize) -> bool {
        let value = map[y * self.width + x];
        for ny in y.saturating_sub(1)..=(y + 1).min(self.height - 1) {
            for nx in x.saturating_sub(1)..=(x + 1).min(self.width - 1) {
                if map[ny * self.width + nx] > value {
                    return false;
                }
            }
        }
        true
    }
}

/// Harris corner detector with overlap based non-maximum suppression.
#[derive(Debug, Clone)]
pub struct HarrisDetector {
    pub block_size: usize,
    pub aperture_size: usize,
    pub k: f32,
    /// Minimum response once the strongest corner is scaled to 255
    pub min_response: f32,
}

impl Default for HarrisDetector {
    fn default() -> Self {
        Self {
            block_size: 2,
            aperture_size: 3,
            k: 0.04,
            min_response: 100.0,
        }
    }
}

impl KeypointDetector for HarrisDetector {
    fn detect(&self, image: &GrayImage) -> Vec<Keypoint> {
        if image.width() < 3 || image.height() < 3 {
            return Vec::new();
        }

        let tensor = StructureTensor::new(image, self.block_size);
        let response = tensor.harris(self.k);

        // edges and flat areas respond with R <= 0, scale the corners so the strongest is 255
        let max = response.iter().copied().fold(0.0, f32::max);
        if max <= 0.0 {
            return Vec::new();
        }
        let normalize = 255.0 / max;
        let size = 2.0 * self.aperture_size as f32;

        let mut keypoints: Vec<Keypoint> = Vec::new();
        for y in 0..tensor.height {
            for x in 0..tensor.width {
                let score = response[y * tensor.width + x] * normalize;
                if score <= self.min_response {
                    continue;
                }

                let candidate = Keypoint::new(x as f32, y as f32, size).with_response(score);

                // circles of diameter `size` overlap once centers are closer than `size`
                let overlapping = keypoints.iter_mut().find(|kp| {
                    let (dx, dy) = (kp.x - candidate.x, kp.y - candidate.y);
                    dx * dx + dy * dy < size * size
                });

                match overlapping {
                    Some(existing) if candidate.response > existing.response => *existing = candidate,
                    Some(_) => {}
                    None => keypoints.push(candidate),
                }
            }
        }

        keypoints
    }
}

/// Shi-Tomasi "good features to track".
///
/// Corners come out sorted by decreasing quality, but the quality is not
/// kept as a response score; every keypoint has `response == 0`.
#[derive(Debug, Clone)]
pub struct ShiTomasiDetector {
    pub block_size: usize,
    pub quality_level: f32,
    pub min_distance: f32,
}

impl Default for ShiTomasiDetector {
    fn default() -> Self {
        Self {
            block_size: 4,
            quality_level: 0.01,
            min_distance: 4.0,
        }
    }
}

impl KeypointDetector for ShiTomasiDetector {
    fn detect(&self, image: &GrayImage) -> Vec<Keypoint> {
        if image.width() < 3 || image.height() < 3 {
            return Vec::new();
        }

        let tensor = StructureTensor::new(image, self.block_size);
        let quality = tensor.min_eigenvalue();
        let max_quality = quality.iter().copied().fold(0.0, f32::max);
        if max_quality <= 0.0 {
            return Vec::new();
        }
        let threshold = self.quality_level * max_quality;
        let max_corners =
            (tensor.width * tensor.height) as f32 / self.min_distance.max(1.0);

        let mut candidates = Vec::new();
        for y in 1..tensor.height - 1 {
            for x in 1..tensor.width - 1 {
                let value = quality[y * tensor.width + x];
                if value > threshold && tensor.is_local_max(&quality, x, y) {
                    candidates.push((value, x, y));
                }
            }
        }
        // strongest first, scan order on ties
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

        let min_distance_sq = self.min_distance * self.min_distance;
        let mut keypoints: Vec<Keypoint> = Vec::new();
        for (_, x, y) in candidates {
            if keypoints.len() as f32 >= max_corners {
                break;
            }
            let (x, y) = (x as f32, y as f32);
            let crowded = keypoints.iter().any(|kp| {
                let (dx, dy) = (kp.x - x, kp.y - y);
                dx * dx + dy * dy < min_distance_sq
            });
            if !crowded {
                keypoints.push(Keypoint::new(x, y, self.block_size as f32));
            }
        }

        keypoints
    }
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;

    /// Bright square on a dark background, corners at (10,10), (29,10), (10,29), (29,29)
    fn square() -> GrayImage {
        GrayImage::from_fn(40, 40, |x, y| {
            if (10..30).contains(&x) && (10..30).contains(&y) {
                Luma([220])
            } else {
                Luma([20])
            }
        })
    }

    fn near_a_corner(kp: &Keypoint) -> bool {
        [(10.0, 10.0), (29.0, 10.0), (10.0, 29.0), (29.0, 29.0)]
            .iter()
            .any(|(cx, cy)| (kp.x - cx).abs() <= 3.0 && (kp.y - cy).abs() <= 3.0)
    }

    #[test]
    fn harris_finds_square_corners() {
        let keypoints = HarrisDetector::default().detect(&square());
        assert!(!keypoints.is_empty());
        assert!(keypoints.iter().all(near_a_corner));
        assert!(keypoints.iter().all(|kp| kp.response > 100.0 && kp.size == 6.0));
    }

    #[test]
    fn shi_tomasi_has_no_response() {
        let keypoints = ShiTomasiDetector::default().detect(&square());
        assert!(keypoints.len() >= 4);
        assert!(keypoints.iter().all(|kp| kp.response == 0.0));
    }

    #[test]
    fn flat_images_have_no_corners() {
        let flat = GrayImage::from_pixel(32, 32, Luma([90]));
        assert!(HarrisDetector::default().detect(&flat).is_empty());
        assert!(ShiTomasiDetector::default().detect(&flat).is_empty());
    }
}
