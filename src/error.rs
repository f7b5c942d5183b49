use std::path::PathBuf;

use thiserror::Error;

use crate::{config::DescriptorMetric, features::descriptor::DescriptorKind, features::detector::DetectorKind};

/// Problems with the run configuration. All of these are detected before the
/// first frame is processed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("unknown detector `{0}` (expected one of SHITOMASI, HARRIS, FAST, BRISK, ORB, AKAZE, SIFT)")]
    UnknownDetector(String),

    #[error("unknown descriptor `{0}` (expected one of BRISK, BRIEF, ORB, FREAK, AKAZE, SIFT)")]
    UnknownDescriptor(String),

    #[error("unknown matcher family `{0}` (expected MAT_BF or MAT_FLANN)")]
    UnknownMatcher(String),

    #[error("unknown selection strategy `{0}` (expected SEL_NN or SEL_KNN)")]
    UnknownSelector(String),

    #[error("unknown descriptor metric `{0}` (expected DES_BINARY or DES_HOG)")]
    UnknownMetric(String),

    #[error("{descriptor} descriptors cannot be computed on {detector} keypoints")]
    IncompatiblePairing {
        detector: DetectorKind,
        descriptor: DescriptorKind,
    },

    #[error("metric {metric} cannot compare {descriptor} descriptors")]
    MetricMismatch {
        metric: DescriptorMetric,
        descriptor: DescriptorKind,
    },

    #[error("region of interest must have a positive size, got {width}x{height}")]
    InvalidRegion { width: u32, height: u32 },

    #[error("keypoint cap must be at least 1")]
    InvalidKeypointCap,

    #[error("frame buffer capacity must be at least 2, got {0}")]
    InvalidBufferCapacity(usize),

    #[error("ratio test threshold must lie in (0, 1], got {0}")]
    InvalidRatio(f32),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to load image {index} from {path:?}: {source}")]
    ImageLoad {
        index: usize,
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("image index {index} is outside the sequence of {len} images")]
    ImageOutOfRange { index: usize, len: usize },

    #[error("requested {requested} frames but only {resident} are resident")]
    InsufficientHistory { requested: usize, resident: usize },

    #[error("keypoint {index} carries no {descriptor} metadata; it was not produced by a compatible detector")]
    IncompatibleDetectorDescriptor {
        descriptor: DescriptorKind,
        index: usize,
    },

    #[error("metric {metric} cannot compare {kind} descriptors")]
    MetricMismatch {
        metric: DescriptorMetric,
        kind: &'static str,
    },

    #[error("descriptor provider returned {rows} rows for {keypoints} keypoints")]
    DescriptorRowMismatch { keypoints: usize, rows: usize },

    #[error("descriptor widths differ between frames ({query} vs {train})")]
    DescriptorWidthMismatch { query: usize, train: usize },

    #[error("no frames were processed, nothing to summarize")]
    EmptyRun,

    #[error("visualization sink failed: {0}")]
    Visualization(String),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
