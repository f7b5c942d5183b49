use std::{fs::File, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kptrack::{
    config::{DescriptorMetric, MatcherFamily, PipelineConfig, SelectionStrategy},
    features::{descriptor::DescriptorKind, detector::DetectorKind},
    io::ImageSequence,
    stats::RunSummary,
    viz::{DirectorySink, NullSink, VisualizationSink},
    System,
};

/// Detect, describe and match keypoints across a numbered image sequence
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// YAML pipeline configuration, flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding the images
    #[arg(long)]
    images: Option<PathBuf>,

    /// File name part before the zero filled number
    #[arg(long)]
    prefix: Option<String>,

    /// File name extension including the dot
    #[arg(long)]
    extension: Option<String>,

    /// First image number
    #[arg(long)]
    start: Option<usize>,

    /// Last image number, inclusive
    #[arg(long)]
    end: Option<usize>,

    /// Digits of the zero filled image number
    #[arg(long)]
    fill_width: Option<usize>,

    /// SHITOMASI, HARRIS, FAST, BRISK, ORB, AKAZE or SIFT
    #[arg(long)]
    detector: Option<DetectorKind>,

    /// BRISK, BRIEF, ORB, FREAK, AKAZE or SIFT
    #[arg(long)]
    descriptor: Option<DescriptorKind>,

    /// MAT_BF or MAT_FLANN
    #[arg(long)]
    matcher: Option<MatcherFamily>,

    /// DES_BINARY or DES_HOG, derived from the descriptor when omitted
    #[arg(long)]
    metric: Option<DescriptorMetric>,

    /// SEL_NN or SEL_KNN
    #[arg(long)]
    selector: Option<SelectionStrategy>,

    /// Ratio test threshold
    #[arg(long)]
    ratio: Option<f32>,

    /// Keep at most this many keypoints per frame
    #[arg(long)]
    cap: Option<usize>,

    /// Keep keypoints anywhere in the image
    #[arg(long)]
    no_region: bool,

    /// Write detection and match renderings into this directory
    #[arg(long)]
    visualize_dir: Option<PathBuf>,

    /// Also render raw detections (needs --visualize-dir)
    #[arg(long)]
    visualize_detector: bool,

    /// Run every valid detector/descriptor pairing
    #[arg(long)]
    sweep: bool,

    /// Write the run summaries as YAML
    #[arg(long)]
    summary_out: Option<PathBuf>,
}

impl Args {
    fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_yaml_path(path)?,
            None => PipelineConfig::default(),
        };

        if let Some(detector) = self.detector {
            config.detector = detector;
        }
        if let Some(descriptor) = self.descriptor {
            config.descriptor = descriptor;
        }
        if let Some(matcher) = self.matcher {
            config.matcher = matcher;
        }
        if self.metric.is_some() {
            config.metric = self.metric;
        }
        if let Some(selector) = self.selector {
            config.selector = selector;
        }
        if let Some(ratio) = self.ratio {
            config.ratio = ratio;
        }
        if self.cap.is_some() {
            config.keypoint_cap = self.cap;
        }
        if self.no_region {
            config.region = None;
        }
        config.visualize |= self.visualize_dir.is_some();
        config.visualize_detector |= self.visualize_detector && self.visualize_dir.is_some();

        Ok(config)
    }

    fn sequence(&self) -> ImageSequence {
        let defaults = ImageSequence::default();
        ImageSequence {
            base: self.images.clone().unwrap_or(defaults.base),
            prefix: self.prefix.clone().unwrap_or(defaults.prefix),
            extension: self.extension.clone().unwrap_or(defaults.extension),
            start: self.start.unwrap_or(defaults.start),
            end: self.end.unwrap_or(defaults.end),
            fill_width: self.fill_width.unwrap_or(defaults.fill_width),
        }
    }

    fn sink(&self, label: &str) -> Result<Box<dyn VisualizationSink>> {
        Ok(match &self.visualize_dir {
            Some(directory) => Box::new(
                DirectorySink::new(directory.join(label))
                    .with_context(|| format!("Failed to prepare visualization directory {:?}", directory))?,
            ),
            None => Box::new(NullSink),
        })
    }
}

fn run_once(config: PipelineConfig, sequence: &ImageSequence, sink: &mut dyn VisualizationSink) -> Result<RunSummary> {
    let label = format!("{}/{}", config.detector, config.descriptor);
    let mut system = System::new(config).with_context(|| format!("Invalid configuration for {}", label))?;
    let summary = system
        .run(sequence, sink)
        .with_context(|| format!("Run {} failed", label))?;
    Ok(summary)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = args.pipeline_config()?;
    let sequence = args.sequence();
    info!(base = ?sequence.base, start = sequence.start, end = sequence.end, "image sequence");

    let mut summaries = Vec::new();
    if args.sweep {
        for detector in DetectorKind::ALL {
            for descriptor in DescriptorKind::ALL {
                if descriptor.check_pairing(detector).is_err() {
                    continue;
                }
                let config = PipelineConfig {
                    detector,
                    descriptor,
                    metric: None,
                    ..config.clone()
                };
                let mut sink = args.sink(&format!("{}_{}", detector, descriptor))?;
                match run_once(config, &sequence, sink.as_mut()) {
                    Ok(summary) => {
                        println!("{}", summary);
                        summaries.push(summary);
                    }
                    Err(e) => warn!("{:#}", e),
                }
            }
        }
    } else {
        let mut sink = args.sink(&format!("{}_{}", config.detector, config.descriptor))?;
        let summary = run_once(config, &sequence, sink.as_mut())?;
        println!("{}", summary);
        summaries.push(summary);
    }

    if let Some(path) = &args.summary_out {
        let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
        serde_yaml::to_writer(file, &summaries).with_context(|| format!("Failed to write summaries to {:?}", path))?;
        info!(path = ?path, runs = summaries.len(), "wrote run summaries");
    }

    Ok(())
}
