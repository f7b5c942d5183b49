use std::{
    fmt,
    str::FromStr,
    time::{Duration, Instant},
};

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::{
    algorithms::{
        akaze::AkazeExtractor, brief::BriefExtractor, brisk::BriskExtractor, freak::FreakExtractor,
        orb::OrbExtractor, sift::SiftExtractor,
    },
    config::DescriptorMetric,
    error::{ConfigError, PipelineError, Result},
    features::detector::DetectorKind,
    frame::{Descriptors, Keypoint},
};

/// Capability provider computing one descriptor row per keypoint.
///
/// Row `i` of the result must describe `keypoints[i]`. Providers that depend
/// on detector specific keypoint metadata report
/// [`PipelineError::IncompatibleDetectorDescriptor`] instead of guessing.
pub trait DescriptorComputer {
    fn compute(&self, image: &GrayImage, keypoints: &[Keypoint]) -> Result<Descriptors>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DescriptorKind {
    Brisk,
    Brief,
    Orb,
    Freak,
    Akaze,
    Sift,
}

impl DescriptorKind {
    pub const ALL: [Self; 6] = [
        Self::Brisk,
        Self::Brief,
        Self::Orb,
        Self::Freak,
        Self::Akaze,
        Self::Sift,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Brisk => "BRISK",
            Self::Brief => "BRIEF",
            Self::Orb => "ORB",
            Self::Freak => "FREAK",
            Self::Akaze => "AKAZE",
            Self::Sift => "SIFT",
        }
    }

    /// SIFT produces gradient histograms, everything else bit strings
    pub fn metric(&self) -> DescriptorMetric {
        match self {
            Self::Sift => DescriptorMetric::L2,
            _ => DescriptorMetric::Hamming,
        }
    }

    /// Detector/descriptor pairings known not to work.
    ///
    /// AKAZE descriptors read the scale-space level stored on AKAZE keypoints,
    /// so they need the AKAZE detector. ORB descriptors on SIFT keypoints are
    /// rejected as well: SIFT's small per-octave sizes collapse the ORB test
    /// pattern onto a few pixels.
    pub fn check_pairing(&self, detector: DetectorKind) -> Result<(), ConfigError> {
        let compatible = match (detector, self) {
            (DetectorKind::Akaze, _) => true,
            (_, Self::Akaze) => false,
            (DetectorKind::Sift, Self::Orb) => false,
            _ => true,
        };

        if compatible {
            Ok(())
        } else {
            Err(ConfigError::IncompatiblePairing {
                detector,
                descriptor: *self,
            })
        }
    }

    fn provider(&self) -> Box<dyn DescriptorComputer> {
        match self {
            Self::Brisk => Box::new(BriskExtractor::default()),
            Self::Brief => Box::new(BriefExtractor::default()),
            Self::Orb => Box::new(OrbExtractor::default()),
            Self::Freak => Box::new(FreakExtractor::default()),
            Self::Akaze => Box::new(AkazeExtractor::default()),
            Self::Sift => Box::new(SiftExtractor::default()),
        }
    }
}

impl FromStr for DescriptorKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == upper)
            .ok_or_else(|| ConfigError::UnknownDescriptor(s.to_string()))
    }
}

impl fmt::Display for DescriptorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<String> for DescriptorKind {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DescriptorKind> for String {
    fn from(value: DescriptorKind) -> Self {
        value.name().to_string()
    }
}

/// Descriptors of one frame and the time the provider took to compute them.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub descriptors: Descriptors,
    pub elapsed: Duration,
}

/// A descriptor variant bound to its provider, chosen once per run.
pub struct DescriptorExtractor {
    kind: DescriptorKind,
    provider: Box<dyn DescriptorComputer>,
}

impl DescriptorExtractor {
    pub fn new(kind: DescriptorKind) -> Self {
        Self {
            kind,
            provider: kind.provider(),
        }
    }

    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        Ok(Self::new(name.parse()?))
    }

    pub fn with_provider(kind: DescriptorKind, provider: Box<dyn DescriptorComputer>) -> Self {
        Self { kind, provider }
    }

    pub fn kind(&self) -> DescriptorKind {
        self.kind
    }

    pub fn extract(&self, image: &GrayImage, keypoints: &[Keypoint]) -> Result<Extraction> {
        let start = Instant::now();
        let descriptors = if keypoints.is_empty() {
            Descriptors::Empty
        } else {
            self.provider.compute(image, keypoints)?
        };
        let elapsed = start.elapsed();

        if descriptors.rows() != keypoints.len() {
            return Err(PipelineError::DescriptorRowMismatch {
                keypoints: keypoints.len(),
                rows: descriptors.rows(),
            });
        }
        Ok(Extraction {
            descriptors,
            elapsed,
        })
    }
}

impl fmt::Debug for DescriptorExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorExtractor").field("kind", &self.kind).finish()
    }
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;

    #[test]
    fn akaze_needs_akaze_keypoints() {
        for detector in DetectorKind::ALL {
            let result = DescriptorKind::Akaze.check_pairing(detector);
            assert_eq!(result.is_ok(), detector == DetectorKind::Akaze, "{detector}");
        }
        assert!(DescriptorKind::Orb.check_pairing(DetectorKind::Sift).is_err());
        assert!(DescriptorKind::Sift.check_pairing(DetectorKind::Fast).is_ok());
    }

    #[test]
    fn only_sift_is_real_valued() {
        for kind in DescriptorKind::ALL {
            let expected = if kind == DescriptorKind::Sift {
                DescriptorMetric::L2
            } else {
                DescriptorMetric::Hamming
            };
            assert_eq!(kind.metric(), expected);
        }
    }

    #[test]
    fn unknown_names_fail_fast() {
        assert_eq!(
            DescriptorExtractor::from_name("SURF").unwrap_err(),
            ConfigError::UnknownDescriptor("SURF".into())
        );
        assert_eq!("freak".parse::<DescriptorKind>(), Ok(DescriptorKind::Freak));
    }

    #[test]
    fn akaze_extraction_rejects_foreign_keypoints() {
        let image = GrayImage::from_pixel(64, 64, Luma([100]));
        let extractor = DescriptorExtractor::new(DescriptorKind::Akaze);

        let result = extractor.extract(&image, &[Keypoint::new(32.0, 32.0, 7.0)]);
        assert!(matches!(
            result,
            Err(PipelineError::IncompatibleDetectorDescriptor {
                descriptor: DescriptorKind::Akaze,
                index: 0
            })
        ));
    }

    #[test]
    fn every_extractor_keeps_row_alignment() {
        let image = GrayImage::from_fn(96, 96, |x, y| Luma([((x * 5 + y * 11) % 251) as u8]));
        let keypoints: Vec<Keypoint> = (0..6)
            .map(|i| {
                Keypoint::new(20.0 + 10.0 * i as f32, 48.0, 12.0)
                    .with_angle(0.3 * i as f32)
                    .with_class_id(1)
            })
            .collect();

        for kind in DescriptorKind::ALL {
            let extraction = DescriptorExtractor::new(kind).extract(&image, &keypoints).unwrap();
            assert_eq!(extraction.descriptors.rows(), keypoints.len(), "{kind}");
        }
    }

    /// Describes only the first keypoint it is given.
    struct FirstOnly;

    impl DescriptorComputer for FirstOnly {
        fn compute(&self, _image: &GrayImage, _keypoints: &[Keypoint]) -> Result<Descriptors> {
            Ok(Descriptors::binary(32, vec![0; 32]))
        }
    }

    #[test]
    fn short_provider_output_is_rejected() {
        let image = GrayImage::new(32, 32);
        let keypoints = [Keypoint::new(8.0, 8.0, 7.0), Keypoint::new(20.0, 20.0, 7.0)];
        let extractor = DescriptorExtractor::with_provider(DescriptorKind::Brief, Box::new(FirstOnly));

        assert!(matches!(
            extractor.extract(&image, &keypoints),
            Err(PipelineError::DescriptorRowMismatch { keypoints: 2, rows: 1 })
        ));
        assert_eq!(extractor.extract(&image, &keypoints[..1]).unwrap().descriptors.rows(), 1);
    }

    #[test]
    fn no_keypoints_no_descriptors() {
        let image = GrayImage::new(16, 16);
        let extraction = DescriptorExtractor::new(DescriptorKind::Brief)
            .extract(&image, &[])
            .unwrap();
        assert!(extraction.descriptors.is_empty());
    }
}
