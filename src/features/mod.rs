//! Per-frame feature stages: keypoint detection, keypoint filtering and
//! descriptor extraction. The concrete algorithms live in [`crate::algorithms`]
//! and are plugged in behind [`detector::KeypointDetector`] and
//! [`descriptor::DescriptorComputer`].

pub mod descriptor;
pub mod detector;
pub mod filter;
