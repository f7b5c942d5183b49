use std::{fmt, time::Duration};

use serde::Serialize;

use crate::{
    error::{PipelineError, Result},
    features::{descriptor::DescriptorKind, detector::DetectorKind},
};

/// Per frame measurements of one run, in processing order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsAggregator {
    keypoint_counts: Vec<usize>,
    matched_counts: Vec<usize>,
    detector_times: Vec<Duration>,
    descriptor_times: Vec<Duration>,
    neighborhood_sizes: Vec<f32>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// `count` is the number of keypoints left after region filtering
    pub fn record_detection(&mut self, count: usize, elapsed: Duration) {
        self.keypoint_counts.push(count);
        self.detector_times.push(elapsed);
    }

    pub fn record_extraction(&mut self, elapsed: Duration) {
        self.descriptor_times.push(elapsed);
    }

    pub fn record_match(&mut self, count: usize) {
        self.matched_counts.push(count);
    }

    /// Keypoint diameters, one entry per keypoint
    pub fn record_neighborhood_sizes(&mut self, sizes: impl IntoIterator<Item = f32>) {
        self.neighborhood_sizes.extend(sizes);
    }

    /// Frames with a recorded detection
    pub fn frames(&self) -> usize {
        self.keypoint_counts.len()
    }

    pub fn keypoint_counts(&self) -> &[usize] {
        &self.keypoint_counts
    }

    pub fn matched_counts(&self) -> &[usize] {
        &self.matched_counts
    }

    /// `None` for a series without entries
    fn mean_ms(times: &[Duration]) -> Option<f64> {
        (!times.is_empty())
            .then(|| times.iter().map(|t| t.as_secs_f64() * 1000.0).sum::<f64>() / times.len() as f64)
    }

    pub fn summarize(&self, detector: DetectorKind, descriptor: DescriptorKind) -> Result<RunSummary> {
        if self.keypoint_counts.is_empty() {
            return Err(PipelineError::EmptyRun);
        }

        let mean_neighborhood_size = (!self.neighborhood_sizes.is_empty()).then(|| {
            self.neighborhood_sizes.iter().map(|&s| s as f64).sum::<f64>() / self.neighborhood_sizes.len() as f64
        });

        Ok(RunSummary {
            detector,
            descriptor,
            frames: self.frames(),
            total_keypoints_in_region: self.keypoint_counts.iter().sum(),
            total_matched_keypoints: self.matched_counts.iter().sum(),
            mean_detector_time_ms: Self::mean_ms(&self.detector_times),
            mean_descriptor_time_ms: Self::mean_ms(&self.descriptor_times),
            mean_neighborhood_size,
        })
    }
}

/// End of run report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub detector: DetectorKind,
    pub descriptor: DescriptorKind,
    pub frames: usize,
    pub total_keypoints_in_region: usize,
    pub total_matched_keypoints: usize,
    /// `None` when a series has no entries
    pub mean_detector_time_ms: Option<f64>,
    pub mean_descriptor_time_ms: Option<f64>,
    /// `None` when no keypoint survived the region filter
    pub mean_neighborhood_size: Option<f64>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Detector: {} Descriptor: {}\tNum keypoints in region: {}\tNum matched keypoints: {}",
            self.detector, self.descriptor, self.total_keypoints_in_region, self.total_matched_keypoints,
        )?;
        for (label, mean) in [
            ("detector", self.mean_detector_time_ms),
            ("descriptor", self.mean_descriptor_time_ms),
        ] {
            match mean {
                Some(ms) => write!(f, "\tAvg time {label}: {ms:.3} ms")?,
                None => write!(f, "\tAvg time {label}: no data")?,
            }
        }
        if let Some(size) = self.mean_neighborhood_size {
            write!(f, "\tAvg neighborhood size: {size:.2}")?;
        }
        Ok(())
    }
}
