use image::GrayImage;
use once_cell::sync::Lazy;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use super::{
    orb::intensity_centroid_angle,
    scale_space::{FloatImage, IntegralImage},
};
use crate::{
    error::Result,
    features::descriptor::DescriptorComputer,
    frame::{Descriptors, Keypoint},
};

/// Bytes per FREAK descriptor (512 receptive field comparisons)
pub const FREAK_BYTES: usize = 64;

/// Keypoint diameter the pattern is laid out for
const FREAK_PATTERN_SIZE: f32 = 22.0;

/// A point of the retinal sampling grid with the radius of its receptive field.
#[derive(Debug, Clone, Copy)]
struct ReceptiveField {
    x: f32,
    y: f32,
    sigma: f32,
}

struct FreakPattern {
    fields: Vec<ReceptiveField>,
    pairs: Vec<(usize, usize)>,
}

/// 43 receptive fields: seven rings of six plus the center, denser and
/// smaller towards the middle like a retina.
static FREAK_PATTERN: Lazy<FreakPattern> = Lazy::new(|| {
    const BIG_R: f32 = 2.0 / 3.0;
    const SMALL_R: f32 = 2.0 / 24.0;
    const UNIT: f32 = (BIG_R - SMALL_R) / 21.0;
    let radii = [
        BIG_R,
        BIG_R - 6.0 * UNIT,
        BIG_R - 11.0 * UNIT,
        BIG_R - 15.0 * UNIT,
        BIG_R - 18.0 * UNIT,
        BIG_R - 20.0 * UNIT,
        SMALL_R,
    ];
    let sigmas = [
        radii[0] / 2.0,
        radii[1] / 2.0,
        radii[2] / 2.0,
        radii[3] / 2.0,
        radii[4] / 2.0,
        radii[5] / 2.0,
        radii[6] / 2.0,
    ];

    let mut fields = Vec::with_capacity(43);
    for (ring, (&radius, &sigma)) in radii.iter().zip(&sigmas).enumerate() {
        let offset = if ring % 2 == 1 { std::f32::consts::PI / 6.0 } else { 0.0 };
        for k in 0..6 {
            let theta = offset + std::f32::consts::TAU * k as f32 / 6.0;
            fields.push(ReceptiveField {
                x: radius * theta.cos() * FREAK_PATTERN_SIZE,
                y: radius * theta.sin() * FREAK_PATTERN_SIZE,
                sigma: sigma * FREAK_PATTERN_SIZE,
            });
        }
    }
    fields.push(ReceptiveField {
        x: 0.0,
        y: 0.0,
        sigma: sigmas[6] * FREAK_PATTERN_SIZE,
    });

    // keep a reproducible selection of 512 out of the 903 possible pairs,
    // always including the coarse-to-fine pairs between adjacent rings first
    let mut adjacent = Vec::new();
    let mut rest = Vec::new();
    for i in 0..fields.len() {
        for j in 0..i {
            if i / 6 == j / 6 + 1 {
                adjacent.push((i, j));
            } else {
                rest.push((i, j));
            }
        }
    }
    rest.shuffle(&mut StdRng::seed_from_u64(42));

    let pairs = adjacent
        .into_iter()
        .chain(rest)
        .take(FREAK_BYTES * 8)
        .collect();

    FreakPattern { fields, pairs }
});

/// Fast Retina Keypoint descriptor.
///
/// Each receptive field is the box mean around its point, sized by the field
/// radius. The pattern is rotated by the keypoint angle, or by the intensity
/// centroid orientation when the detector didn't provide one.
#[derive(Debug, Clone, Default)]
pub struct FreakExtractor;

impl DescriptorComputer for FreakExtractor {
    fn compute(&self, image: &GrayImage, keypoints: &[Keypoint]) -> Result<Descriptors> {
        let integral = IntegralImage::new(&FloatImage::from_gray(image));

        let mut data = vec![0u8; keypoints.len() * FREAK_BYTES];
        for (keypoint, row) in keypoints.iter().zip(data.chunks_exact_mut(FREAK_BYTES)) {
            let scale = (keypoint.size / FREAK_PATTERN_SIZE).max(0.5);
            let angle = keypoint.angle.unwrap_or_else(|| {
                let radius = (keypoint.size / 2.0).clamp(3.0, 15.0) as i32;
                intensity_centroid_angle(image, keypoint.x, keypoint.y, radius)
            });
            let (sin, cos) = angle.sin_cos();

            let values: Vec<f32> = FREAK_PATTERN
                .fields
                .iter()
                .map(|field| {
                    let x = keypoint.x + scale * (cos * field.x - sin * field.y);
                    let y = keypoint.y + scale * (sin * field.x + cos * field.y);
                    integral.box_mean(x, y, scale * field.sigma)
                })
                .collect();

            for (bit, &(i, j)) in FREAK_PATTERN.pairs.iter().enumerate() {
                if values[i] > values[j] {
                    row[bit / 8] |= 1 << (7 - bit % 8);
                }
            }
        }

        Ok(Descriptors::binary(FREAK_BYTES, data))
    }
}
