use std::time::Duration;

use image::GrayImage;
use tracing::{debug, info, warn};

use crate::{
    config::PipelineConfig,
    error::{ConfigError, PipelineError, Result},
    features::{
        descriptor::DescriptorExtractor,
        detector::FeatureDetector,
        filter::{limit_keypoints, retain_in_region},
    },
    frame::Frame,
    frame_store::FrameStore,
    io::ImageSource,
    matcher::DescriptorMatcher,
    stats::{RunSummary, StatsAggregator},
    viz::{self, NullSink, VisualizationSink},
};

/// What happened to one ingested image.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    /// Position in the run, counting from zero
    pub index: usize,
    pub detected: usize,
    pub in_region: usize,
    /// Keypoints stored on the frame, after the optional cap
    pub kept: usize,
    /// `None` while there is no previous frame to match against
    pub matched: Option<usize>,
    pub detector_time: Duration,
    pub descriptor_time: Duration,
}

/// Drives images through detection, filtering, description and matching,
/// keeping the most recent frames and the run statistics.
#[derive(Debug)]
pub struct System {
    config: PipelineConfig,
    detector: FeatureDetector,
    extractor: DescriptorExtractor,
    matcher: DescriptorMatcher,
    frames: FrameStore,
    stats: StatsAggregator,
    processed: usize,
}

impl System {
    /// Validates the whole configuration up front, nothing is processed with a
    /// bad one.
    pub fn new(config: PipelineConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            detector: FeatureDetector::new(config.detector),
            extractor: DescriptorExtractor::new(config.descriptor),
            matcher: DescriptorMatcher::from_config(&config),
            frames: FrameStore::new(config.buffer_capacity)?,
            stats: StatsAggregator::new(),
            processed: 0,
            config,
        })
    }

    /// Replaces the built-in providers, e.g. with instrumented ones.
    pub fn with_providers(mut self, detector: FeatureDetector, extractor: DescriptorExtractor) -> Self {
        self.detector = detector;
        self.extractor = extractor;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn frames(&self) -> &FrameStore {
        &self.frames
    }

    pub fn stats(&self) -> &StatsAggregator {
        &self.stats
    }

    pub fn process_image(&mut self, image: GrayImage) -> Result<FrameReport> {
        self.process(image, &mut NullSink)
    }

    fn process(&mut self, image: GrayImage, sink: &mut dyn VisualizationSink) -> Result<FrameReport> {
        let index = self.processed;
        let mut frame = Frame::new(image);
        debug!(frame = index, width = frame.image().width(), height = frame.image().height(), "#1 : LOAD IMAGE");

        // detection
        let detection = self.detector.detect(frame.image());
        let detected = detection.keypoints.len();
        if self.config.visualize_detector {
            let title = format!("{} detections {}", self.detector.kind(), index);
            sink.show(&title, &viz::draw_keypoints(frame.image(), &detection.keypoints))?;
        }

        let mut keypoints = detection.keypoints;
        if let Some(region) = &self.config.region {
            retain_in_region(&mut keypoints, region);
        }
        let in_region = keypoints.len();
        self.stats.record_detection(in_region, detection.elapsed);
        self.stats.record_neighborhood_sizes(keypoints.iter().map(|kp| kp.size));

        if let Some(cap) = self.config.keypoint_cap {
            limit_keypoints(&mut keypoints, cap);
            if keypoints.len() < in_region {
                debug!(frame = index, cap, "keypoints have been limited");
            }
        }
        info!(
            frame = index,
            detector = %self.detector.kind(),
            detected,
            in_region,
            kept = keypoints.len(),
            ms = detection.elapsed.as_secs_f64() * 1000.0,
            "#2 : DETECT KEYPOINTS done"
        );

        // description
        let extraction = self.extractor.extract(frame.image(), &keypoints)?;
        self.stats.record_extraction(extraction.elapsed);
        info!(
            frame = index,
            descriptor = %self.extractor.kind(),
            rows = extraction.descriptors.rows(),
            ms = extraction.elapsed.as_secs_f64() * 1000.0,
            "#3 : EXTRACT DESCRIPTORS done"
        );

        frame.keypoints = keypoints;
        frame.descriptors = extraction.descriptors;
        let kept = frame.keypoints.len();
        if self.frames.push(frame).is_some() {
            debug!(frame = index, resident = self.frames.len(), "evicted oldest frame");
        }

        let matched = self.match_latest(index, sink)?;
        self.processed += 1;

        Ok(FrameReport {
            index,
            detected,
            in_region,
            kept,
            matched,
            detector_time: detection.elapsed,
            descriptor_time: extraction.elapsed,
        })
    }

    /// Matches the newest frame (query) against the one before it (train) and
    /// stores the result on the newest frame.
    fn match_latest(&mut self, index: usize, sink: &mut dyn VisualizationSink) -> Result<Option<usize>> {
        let matches = match self.frames.latest(2) {
            Ok(mut latest) => {
                let (Some(older), Some(newer)) = (latest.next(), latest.next()) else {
                    return Ok(None);
                };
                let matches = self.matcher.match_descriptors(&newer.descriptors, &older.descriptors)?;

                if self.config.visualize {
                    let canvas =
                        viz::draw_matches(older.image(), &older.keypoints, newer.image(), &newer.keypoints, &matches);
                    sink.show(&format!("matches {}-{}", index - 1, index), &canvas)?;
                }
                matches
            }
            Err(PipelineError::InsufficientHistory { resident, .. }) => {
                debug!(frame = index, resident, "no previous frame, skipping matching");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let count = matches.len();
        self.stats.record_match(count);
        if let Some(newest) = self.frames.newest_mut() {
            newest.matches = matches;
        }
        info!(frame = index, matched = count, "#4 : MATCH KEYPOINT DESCRIPTORS done");

        Ok(Some(count))
    }

    /// Processes every image of `source` in order and summarizes the run.
    ///
    /// A failing image load aborts the run and reports the image index.
    pub fn run(&mut self, source: &dyn ImageSource, sink: &mut dyn VisualizationSink) -> Result<RunSummary> {
        if source.is_empty() {
            warn!("image source is empty");
        }

        for index in 0..source.len() {
            let image = source.load(index)?;
            debug!(image = index, "#1 : LOAD IMAGE INTO BUFFER done");
            self.process(image, sink)?;
        }

        self.summary()
    }

    pub fn summary(&self) -> Result<RunSummary> {
        self.stats.summarize(self.detector.kind(), self.extractor.kind())
    }
}
