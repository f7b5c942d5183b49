use std::{
    fmt,
    str::FromStr,
    time::{Duration, Instant},
};

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::{
    algorithms::{
        akaze::AkazeDetector,
        brisk::BriskDetector,
        corners::{HarrisDetector, ShiTomasiDetector},
        fast::FastDetector,
        orb::OrbDetector,
        sift::SiftDetector,
    },
    error::ConfigError,
    frame::Keypoint,
};

/// Capability provider turning a grayscale image into keypoints.
///
/// Implementations must be deterministic: the same image yields the same
/// keypoints in the same order.
pub trait KeypointDetector {
    fn detect(&self, image: &GrayImage) -> Vec<Keypoint>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DetectorKind {
    ShiTomasi,
    Harris,
    Fast,
    Brisk,
    Orb,
    Akaze,
    Sift,
}

impl DetectorKind {
    pub const ALL: [Self; 7] = [
        Self::ShiTomasi,
        Self::Harris,
        Self::Fast,
        Self::Brisk,
        Self::Orb,
        Self::Akaze,
        Self::Sift,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::ShiTomasi => "SHITOMASI",
            Self::Harris => "HARRIS",
            Self::Fast => "FAST",
            Self::Brisk => "BRISK",
            Self::Orb => "ORB",
            Self::Akaze => "AKAZE",
            Self::Sift => "SIFT",
        }
    }

    /// The built-in provider for this variant
    fn provider(&self) -> Box<dyn KeypointDetector> {
        match self {
            Self::ShiTomasi => Box::new(ShiTomasiDetector::default()),
            Self::Harris => Box::new(HarrisDetector::default()),
            Self::Fast => Box::new(FastDetector::default()),
            Self::Brisk => Box::new(BriskDetector::default()),
            Self::Orb => Box::new(OrbDetector::default()),
            Self::Akaze => Box::new(AkazeDetector::default()),
            Self::Sift => Box::new(SiftDetector::default()),
        }
    }
}

impl FromStr for DetectorKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == upper || (upper == "SHI-TOMASI" && *kind == Self::ShiTomasi))
            .ok_or_else(|| ConfigError::UnknownDetector(s.to_string()))
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<String> for DetectorKind {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DetectorKind> for String {
    fn from(value: DetectorKind) -> Self {
        value.name().to_string()
    }
}

/// Keypoints of one image and the time the provider took to find them.
#[derive(Debug, Clone)]
pub struct Detection {
    pub keypoints: Vec<Keypoint>,
    pub elapsed: Duration,
}

/// A detector variant bound to its provider, chosen once per run.
pub struct FeatureDetector {
    kind: DetectorKind,
    provider: Box<dyn KeypointDetector>,
}

impl FeatureDetector {
    pub fn new(kind: DetectorKind) -> Self {
        Self {
            kind,
            provider: kind.provider(),
        }
    }

    /// Looks the variant up by name, failing fast on unknown names.
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        Ok(Self::new(name.parse()?))
    }

    /// Replaces the built-in algorithm for `kind` with an external one.
    pub fn with_provider(kind: DetectorKind, provider: Box<dyn KeypointDetector>) -> Self {
        Self { kind, provider }
    }

    pub fn kind(&self) -> DetectorKind {
        self.kind
    }

    pub fn detect(&self, image: &GrayImage) -> Detection {
        let start = Instant::now();
        let keypoints = self.provider.detect(image);
        Detection {
            keypoints,
            elapsed: start.elapsed(),
        }
    }
}

impl fmt::Debug for FeatureDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureDetector").field("kind", &self.kind).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<Keypoint>);

    impl KeypointDetector for Fixed {
        fn detect(&self, _image: &GrayImage) -> Vec<Keypoint> {
            self.0.clone()
        }
    }

    #[test]
    fn names_round_trip() {
        for kind in DetectorKind::ALL {
            assert_eq!(kind.name().parse::<DetectorKind>(), Ok(kind));
            assert_eq!(kind.to_string().to_lowercase().parse::<DetectorKind>(), Ok(kind));
        }
    }

    #[test]
    fn unknown_names_fail_fast() {
        assert_eq!(
            FeatureDetector::from_name("SURF").unwrap_err(),
            ConfigError::UnknownDetector("SURF".into())
        );
    }

    #[test]
    fn custom_providers_are_invoked() {
        let keypoints = vec![Keypoint::new(3.0, 4.0, 7.0)];
        let detector = FeatureDetector::with_provider(DetectorKind::Fast, Box::new(Fixed(keypoints.clone())));

        let detection = detector.detect(&GrayImage::new(8, 8));
        assert_eq!(detection.keypoints, keypoints);
        assert_eq!(detector.kind(), DetectorKind::Fast);
    }
}
