//! Frame by frame keypoint pipeline: detect keypoints on each image of a
//! sequence, keep the ones inside a region of interest, describe them and
//! match them against the previous frame while collecting run statistics.

pub mod algorithms;
pub mod config;
pub mod error;
pub mod features;
pub mod frame;
pub mod frame_store;
pub mod io;
pub mod matcher;
pub mod stats;
pub mod system;
pub mod viz;

pub use config::PipelineConfig;
pub use error::{ConfigError, PipelineError};
pub use system::System;
