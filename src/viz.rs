//! Debug renderings of detections and matches.

use std::{
    fs,
    path::{Path, PathBuf},
};

use image::{imageops, DynamicImage, GrayImage, Pixel, Rgb, RgbImage};
use imageproc::drawing;
use once_cell::sync::Lazy;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::debug;

use crate::{
    error::{PipelineError, Result},
    frame::{Keypoint, Match},
};

/// Receives rendered images, e.g. to show or store them.
pub trait VisualizationSink {
    fn show(&mut self, title: &str, image: &RgbImage) -> Result<()>;
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl VisualizationSink for NullSink {
    fn show(&mut self, _title: &str, _image: &RgbImage) -> Result<()> {
        Ok(())
    }
}

/// Writes each image as a numbered PNG into a directory.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    directory: PathBuf,
    written: usize,
}

impl DirectorySink {
    pub fn new(directory: impl AsRef<Path>) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)
            .map_err(|e| PipelineError::Visualization(format!("cannot create {:?}: {}", directory, e)))?;
        Ok(Self { directory, written: 0 })
    }

    pub fn written(&self) -> usize {
        self.written
    }
}

impl VisualizationSink for DirectorySink {
    fn show(&mut self, title: &str, image: &RgbImage) -> Result<()> {
        let slug: String = title
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect();
        let path = self.directory.join(format!("{:04}_{}.png", self.written, slug));

        image
            .save(&path)
            .map_err(|e| PipelineError::Visualization(format!("cannot write {:?}: {}", path, e)))?;
        debug!(?path, "wrote visualization");
        self.written += 1;
        Ok(())
    }
}

static GREEN: Lazy<Rgb<u8>> = Lazy::new(|| *Rgb::from_slice(&[0, 255, 0]));
static RED: Lazy<Rgb<u8>> = Lazy::new(|| *Rgb::from_slice(&[255, 0, 0]));

fn to_rgb(image: &GrayImage) -> RgbImage {
    DynamicImage::ImageLuma8(image.clone()).into_rgb8()
}

fn draw_keypoint(canvas: &mut RgbImage, keypoint: &Keypoint, offset: f32, color: Rgb<u8>) {
    let (x, y) = (keypoint.x + offset, keypoint.y);
    let radius = (keypoint.size / 2.0).max(1.0);
    drawing::draw_hollow_circle_mut(canvas, (x as i32, y as i32), radius as i32, color);

    if let Some(angle) = keypoint.angle {
        let tip = (x + radius * angle.cos(), y + radius * angle.sin());
        drawing::draw_line_segment_mut(canvas, (x, y), tip, color);
    }
}

/// Keypoints as circles of their neighborhood size, with a radius marking
/// the orientation when there is one.
pub fn draw_keypoints(image: &GrayImage, keypoints: &[Keypoint]) -> RgbImage {
    let mut canvas = to_rgb(image);
    for keypoint in keypoints {
        draw_keypoint(&mut canvas, keypoint, 0.0, *GREEN);
    }
    canvas
}

/// Older frame on the left, newer frame on the right, one randomly colored
/// line per match. Unmatched keypoints are drawn in red.
pub fn draw_matches(
    older: &GrayImage,
    older_keypoints: &[Keypoint],
    newer: &GrayImage,
    newer_keypoints: &[Keypoint],
    matches: &[Match],
) -> RgbImage {
    let offset = older.width();
    let mut canvas = RgbImage::new(offset + newer.width(), older.height().max(newer.height()));
    imageops::replace(&mut canvas, &to_rgb(older), 0, 0);
    imageops::replace(&mut canvas, &to_rgb(newer), offset as i64, 0);

    for keypoint in older_keypoints {
        draw_keypoint(&mut canvas, keypoint, 0.0, *RED);
    }
    for keypoint in newer_keypoints {
        draw_keypoint(&mut canvas, keypoint, offset as f32, *RED);
    }

    // fixed seed so repeated runs render identically
    let mut rng = StdRng::seed_from_u64(0);
    for m in matches {
        let color = Rgb(rng.gen::<[u8; 3]>());
        let (Some(train), Some(query)) = (older_keypoints.get(m.train_index), newer_keypoints.get(m.query_index))
        else {
            continue;
        };
        draw_keypoint(&mut canvas, train, 0.0, color);
        draw_keypoint(&mut canvas, query, offset as f32, color);
        drawing::draw_line_segment_mut(
            &mut canvas,
            (train.x, train.y),
            (query.x + offset as f32, query.y),
            color,
        );
    }

    canvas
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;

    #[test]
    fn match_canvas_places_frames_side_by_side() {
        let older = GrayImage::from_pixel(20, 10, Luma([0]));
        let newer = GrayImage::from_pixel(30, 12, Luma([0]));
        let keypoint = [Keypoint::new(5.0, 5.0, 4.0)];
        let matches = [Match {
            query_index: 0,
            train_index: 0,
            distance: 0.0,
        }];

        let canvas = draw_matches(&older, &keypoint, &newer, &keypoint, &matches);
        assert_eq!(canvas.dimensions(), (50, 12));
        // the connecting line crosses the seam between both frames
        assert_ne!(canvas.get_pixel(20, 5), &Rgb([0, 0, 0]));
    }

    #[test]
    fn keypoints_are_drawn_in_green() {
        let image = GrayImage::from_pixel(16, 16, Luma([0]));
        let canvas = draw_keypoints(&image, &[Keypoint::new(8.0, 8.0, 6.0)]);
        assert_eq!(canvas.get_pixel(11, 8), &*GREEN);
    }

    #[test]
    fn directory_sink_numbers_its_files() {
        let directory = std::env::temp_dir().join(format!("kptrack-viz-{}", std::process::id()));
        let mut sink = DirectorySink::new(&directory).unwrap();
        sink.show("Matches 0/1", &RgbImage::new(2, 2)).unwrap();
        sink.show("Matches 1/2", &RgbImage::new(2, 2)).unwrap();

        assert_eq!(sink.written(), 2);
        assert!(directory.join("0000_matches_0_1.png").exists());
        assert!(directory.join("0001_matches_1_2.png").exists());
        fs::remove_dir_all(&directory).unwrap();
    }
}
