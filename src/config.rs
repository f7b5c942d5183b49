use std::{fmt, fs::File, path::Path, str::FromStr};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    features::{descriptor::DescriptorKind, detector::DetectorKind, filter::Region},
};

/// How train descriptors are searched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MatcherFamily {
    /// Every query row against every train row
    #[default]
    BruteForce,
    /// Approximate index over the train rows (kd-forest or LSH)
    Indexed,
}

/// Distance used to compare two descriptor rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DescriptorMetric {
    /// Bit count of the XOR of two binary strings
    Hamming,
    /// Euclidean distance between real-valued histograms
    L2,
}

/// Which train candidates become matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SelectionStrategy {
    /// Best candidate, always
    NearestNeighbor,
    /// Best of two candidates, only when clearly better than the runner-up
    #[default]
    RatioTest,
}

impl FromStr for MatcherFamily {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MAT_BF" | "BF" | "BRUTE-FORCE" | "BRUTEFORCE" => Ok(Self::BruteForce),
            "MAT_FLANN" | "FLANN" | "INDEXED" => Ok(Self::Indexed),
            _ => Err(ConfigError::UnknownMatcher(s.to_string())),
        }
    }
}

impl FromStr for DescriptorMetric {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DES_BINARY" | "BINARY" | "HAMMING" => Ok(Self::Hamming),
            "DES_HOG" | "HOG" | "REAL" | "REAL-VALUED" | "L2" => Ok(Self::L2),
            _ => Err(ConfigError::UnknownMetric(s.to_string())),
        }
    }
}

impl FromStr for SelectionStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SEL_NN" | "NN" | "NEAREST-NEIGHBOR" => Ok(Self::NearestNeighbor),
            "SEL_KNN" | "KNN" | "RATIO-TEST" => Ok(Self::RatioTest),
            _ => Err(ConfigError::UnknownSelector(s.to_string())),
        }
    }
}

impl fmt::Display for MatcherFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BruteForce => "MAT_BF",
            Self::Indexed => "MAT_FLANN",
        })
    }
}

impl fmt::Display for DescriptorMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hamming => "DES_BINARY",
            Self::L2 => "DES_HOG",
        })
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NearestNeighbor => "SEL_NN",
            Self::RatioTest => "SEL_KNN",
        })
    }
}

/// Lets serde read the enums from the same names the CLI accepts
macro_rules! string_conversions {
    ($($kind:ty),*) => {$(
        impl TryFrom<String> for $kind {
            type Error = ConfigError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$kind> for String {
            fn from(value: $kind) -> Self {
                value.to_string()
            }
        }
    )*};
}

string_conversions!(MatcherFamily, DescriptorMetric, SelectionStrategy);

/// Lowe's threshold used by the original feature tracking setup
pub const DEFAULT_RATIO: f32 = 0.8;

/// Preceding vehicle in the KITTI sequence the defaults were tuned on
pub const DEFAULT_REGION: Region = Region {
    x: 535,
    y: 180,
    width: 180,
    height: 150,
};

pub const DEFAULT_KEYPOINT_CAP: usize = 50;

/// Every knob of a run. Missing fields fall back to [`PipelineConfig::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub detector: DetectorKind,
    pub descriptor: DescriptorKind,
    pub matcher: MatcherFamily,
    /// Overrides the metric implied by the descriptor
    pub metric: Option<DescriptorMetric>,
    pub selector: SelectionStrategy,
    pub ratio: f32,
    /// Keep only mutually best pairs (brute force, nearest neighbor only)
    pub cross_check: bool,
    /// `None` disables region filtering
    pub region: Option<Region>,
    /// `None` disables keypoint limiting
    pub keypoint_cap: Option<usize>,
    pub buffer_capacity: usize,
    /// Render matches between consecutive frames to the visualization sink
    pub visualize: bool,
    /// Render raw detections to the visualization sink
    pub visualize_detector: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            detector: DetectorKind::Akaze,
            descriptor: DescriptorKind::Orb,
            matcher: MatcherFamily::BruteForce,
            metric: None,
            selector: SelectionStrategy::RatioTest,
            ratio: DEFAULT_RATIO,
            cross_check: false,
            region: Some(DEFAULT_REGION),
            keypoint_cap: None,
            buffer_capacity: 2,
            visualize: false,
            visualize_detector: false,
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        let config: Self = serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse pipeline config {:?}", path))?;
        Ok(config)
    }

    /// The configured metric, or the one the descriptor calls for
    pub fn metric(&self) -> DescriptorMetric {
        self.metric.unwrap_or_else(|| self.descriptor.metric())
    }

    /// Rejects every configuration problem that would otherwise surface mid-run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.descriptor.check_pairing(self.detector)?;

        let metric = self.metric();
        if metric != self.descriptor.metric() {
            return Err(ConfigError::MetricMismatch {
                metric,
                descriptor: self.descriptor,
            });
        }

        if let Some(region) = &self.region {
            region.validate()?;
        }

        if self.keypoint_cap == Some(0) {
            return Err(ConfigError::InvalidKeypointCap);
        }

        if self.buffer_capacity < 2 {
            return Err(ConfigError::InvalidBufferCapacity(self.buffer_capacity));
        }

        if !(self.ratio > 0.0 && self.ratio <= 1.0) {
            return Err(ConfigError::InvalidRatio(self.ratio));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.metric(), DescriptorMetric::Hamming);
    }

    #[test]
    fn parses_original_names() {
        assert_eq!("MAT_FLANN".parse::<MatcherFamily>(), Ok(MatcherFamily::Indexed));
        assert_eq!("sel_nn".parse::<SelectionStrategy>(), Ok(SelectionStrategy::NearestNeighbor));
        assert_eq!("DES_HOG".parse::<DescriptorMetric>(), Ok(DescriptorMetric::L2));
        assert_eq!(
            "MAT_KD".parse::<MatcherFamily>(),
            Err(ConfigError::UnknownMatcher("MAT_KD".into()))
        );
    }

    #[test]
    fn metric_follows_descriptor_unless_overridden() {
        let config = PipelineConfig {
            detector: DetectorKind::Sift,
            descriptor: DescriptorKind::Sift,
            ..Default::default()
        };
        assert_eq!(config.metric(), DescriptorMetric::L2);
        assert_eq!(config.validate(), Ok(()));

        let mismatched = PipelineConfig {
            metric: Some(DescriptorMetric::Hamming),
            ..config
        };
        assert_eq!(
            mismatched.validate(),
            Err(ConfigError::MetricMismatch {
                metric: DescriptorMetric::Hamming,
                descriptor: DescriptorKind::Sift,
            })
        );
    }

    #[test]
    fn rejects_bad_values_eagerly() {
        let base = PipelineConfig::default();

        let akaze_on_fast = PipelineConfig {
            detector: DetectorKind::Fast,
            descriptor: DescriptorKind::Akaze,
            ..base.clone()
        };
        assert!(matches!(
            akaze_on_fast.validate(),
            Err(ConfigError::IncompatiblePairing { .. })
        ));

        let no_area = PipelineConfig {
            region: Some(Region::new(0, 0, 0, 10)),
            ..base.clone()
        };
        assert!(matches!(no_area.validate(), Err(ConfigError::InvalidRegion { .. })));

        let zero_cap = PipelineConfig {
            keypoint_cap: Some(0),
            ..base.clone()
        };
        assert_eq!(zero_cap.validate(), Err(ConfigError::InvalidKeypointCap));

        let tiny_buffer = PipelineConfig {
            buffer_capacity: 1,
            ..base.clone()
        };
        assert_eq!(tiny_buffer.validate(), Err(ConfigError::InvalidBufferCapacity(1)));

        let bad_ratio = PipelineConfig { ratio: 1.5, ..base };
        assert_eq!(bad_ratio.validate(), Err(ConfigError::InvalidRatio(1.5)));
    }

    #[test]
    fn reads_yaml_with_defaults() {
        let config: PipelineConfig = serde_yaml::from_str(
            "detector: FAST\ndescriptor: BRIEF\nmatcher: MAT_FLANN\nselector: SEL_NN\nregion: null\nkeypoint_cap: 50\n",
        )
        .unwrap();

        assert_eq!(config.detector, DetectorKind::Fast);
        assert_eq!(config.descriptor, DescriptorKind::Brief);
        assert_eq!(config.matcher, MatcherFamily::Indexed);
        assert_eq!(config.selector, SelectionStrategy::NearestNeighbor);
        assert_eq!(config.region, None);
        assert_eq!(config.keypoint_cap, Some(50));
        assert_eq!(config.buffer_capacity, 2);
        assert!((config.ratio - DEFAULT_RATIO).abs() < f32::EPSILON);

        assert!(serde_yaml::from_str::<PipelineConfig>("detector: SURF\n").is_err());
    }
}
