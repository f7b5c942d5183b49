use image::GrayImage;
use once_cell::sync::Lazy;
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::{
    error::Result,
    features::descriptor::DescriptorComputer,
    frame::{Descriptors, Keypoint},
};

/// Bytes per BRIEF/ORB descriptor (256 intensity tests)
pub const BRIEF_BYTES: usize = 32;

/// Side of the square patch the intensity tests are drawn from
pub const PATCH_SIZE: f32 = 48.0;

/// Pairs of offsets `[x1, y1, x2, y2]` relative to the keypoint
pub type TestPattern = [[f32; 4]; BRIEF_BYTES * 8];

/// Precomputed samples for the BRIEF point pairs.
/// The values remain consistent accross frames, because we want to achieve a similar level of entropy
/// to best match our previous encounters with points.
pub static BRIEF256_SAMPLES: Lazy<TestPattern> = Lazy::new(|| {
    // use reproducible random numbers so that descriptors of separate runs compare
    let mut rng = StdRng::seed_from_u64(42);

    // isotropic gaussian with sigma = S/5, the G II sampling of the BRIEF paper
    let half = PATCH_SIZE / 2.0;
    let normal_dist: Normal<f32> = Normal::new(0.0, PATCH_SIZE / 5.0).unwrap();

    let mut samples = [[0.0; 4]; BRIEF_BYTES * 8];
    for sample in samples.iter_mut() {
        for offset in sample.iter_mut() {
            *offset = normal_dist.sample(&mut rng).round().clamp(-half + 1.0, half - 1.0);
        }
    }

    samples
});

/// Intensity at a possibly out of bounds location. Pixels outside of the
/// image read as `0`, so keypoints close to the border still get a full row.
#[inline]
pub fn intensity(image: &GrayImage, x: f32, y: f32) -> u8 {
    let (x, y) = (x.round(), y.round());
    if x < 0.0 || y < 0.0 {
        return 0;
    }
    image
        .get_pixel_checked(x as u32, y as u32)
        .map_or(0, |p| p.0[0])
}

/// Compute BRIEF (Binary Robust Independent Elementary Features) on a smoothed
/// grayscale image for the target keypoint. With an `angle` the test pattern is
/// rotated first (steered BRIEF, as ORB does), `scale` stretches it.
pub fn compute_descriptor(
    keypoint: &Keypoint,
    smoothed: &GrayImage,
    pattern: &TestPattern,
    angle: Option<f32>,
    scale: f32,
    out: &mut [u8],
) {
    let (sin, cos) = angle.unwrap_or(0.0).sin_cos();
    let steer = |dx: f32, dy: f32| {
        (
            keypoint.x + scale * (cos * dx - sin * dy),
            keypoint.y + scale * (sin * dx + cos * dy),
        )
    };

    out.iter_mut().for_each(|byte| *byte = 0);
    for (bit, [p1x, p1y, p2x, p2y]) in pattern.iter().enumerate().take(out.len() * 8) {
        let (x1, y1) = steer(*p1x, *p1y);
        let (x2, y2) = steer(*p2x, *p2y);

        if intensity(smoothed, x1, y1) < intensity(smoothed, x2, y2) {
            out[bit / 8] |= 1 << (7 - bit % 8);
        }
    }
}

/// Plain, unsteered BRIEF over a gaussian smoothed image.
#[derive(Debug, Clone)]
pub struct BriefExtractor {
    // using a kernel value of 2 indicated by reference:
    // https://medium.com/data-breach/introduction-to-brief-binary-robust-independent-elementary-features-436f4a31a0e6
    pub smoothing_sigma: f32,
}

impl Default for BriefExtractor {
    fn default() -> Self {
        Self {
            smoothing_sigma: 2.0,
        }
    }
}

impl DescriptorComputer for BriefExtractor {
    fn compute(&self, image: &GrayImage, keypoints: &[Keypoint]) -> Result<Descriptors> {
        // apply a guassion blur to the image for computing BRIEF descriptors,
        // that way the image is not overly sesnsitive to high frequency noise.
        let smoothed = imageproc::filter::gaussian_blur_f32(image, self.smoothing_sigma);

        let mut data = vec![0u8; keypoints.len() * BRIEF_BYTES];
        for (keypoint, row) in keypoints.iter().zip(data.chunks_exact_mut(BRIEF_BYTES)) {
            compute_descriptor(keypoint, &smoothed, &BRIEF256_SAMPLES, None, 1.0, row);
        }

        Ok(Descriptors::binary(BRIEF_BYTES, data))
    }
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;

    fn textured(shift: u32) -> GrayImage {
        GrayImage::from_fn(96, 96, |x, y| {
            let (x, y) = (x as i64 - shift as i64, y as i64);
            let ramp = (x * 7 + y * 13).rem_euclid(31) * 8;
            let checker = (x.div_euclid(5) + y.div_euclid(3)).rem_euclid(2) * 90;
            Luma([(ramp ^ checker) as u8])
        })
    }

    #[test]
    fn pattern_is_reproducible_and_inside_the_patch() {
        let half = PATCH_SIZE / 2.0;
        assert!(BRIEF256_SAMPLES
            .iter()
            .flatten()
            .all(|v| v.abs() < half && v.fract() == 0.0));
        assert!(BRIEF256_SAMPLES.iter().any(|s| s != &BRIEF256_SAMPLES[0]));
    }

    #[test]
    fn one_row_per_keypoint() {
        let keypoints = vec![
            Keypoint::new(40.0, 40.0, 7.0),
            Keypoint::new(50.0, 30.0, 7.0),
            Keypoint::new(1.0, 1.0, 7.0),
        ];
        let descriptors = BriefExtractor::default()
            .compute(&textured(0), &keypoints)
            .unwrap();
        assert_eq!(descriptors.rows(), 3);
        assert_eq!(descriptors.width(), BRIEF_BYTES);
    }

    #[test]
    fn translated_patches_describe_alike() {
        let extractor = BriefExtractor::default();
        let a = extractor
            .compute(&textured(0), &[Keypoint::new(45.0, 45.0, 7.0)])
            .unwrap();
        let b = extractor
            .compute(&textured(4), &[Keypoint::new(49.0, 45.0, 7.0)])
            .unwrap();
        assert_eq!(a.binary_row(0), b.binary_row(0));
    }

    #[test]
    fn flat_patches_set_no_bits() {
        let flat = GrayImage::from_pixel(64, 64, Luma([128]));
        let descriptors = BriefExtractor::default()
            .compute(&flat, &[Keypoint::new(32.0, 32.0, 7.0)])
            .unwrap();
        assert!(descriptors.binary_row(0).unwrap().iter().all(|&b| b == 0));
    }
}
