//! Image sources feeding the pipeline.

use std::path::{Path, PathBuf};

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Indexed, finite sequence of grayscale images.
pub trait ImageSource {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Loads image `index`, counting from zero
    fn load(&self, index: usize) -> Result<GrayImage>;
}

/// Numbered image files such as `images/KITTI/2011_09_26/image_00/data/0000000003.png`,
/// named `{base}/{prefix}{number:0>fill}{extension}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImageSequence {
    pub base: PathBuf,
    pub prefix: String,
    /// Including the dot, e.g. `.png`
    pub extension: String,
    pub start: usize,
    /// Last number, inclusive
    pub end: usize,
    pub fill_width: usize,
}

impl Default for ImageSequence {
    fn default() -> Self {
        Self {
            base: PathBuf::from("images/KITTI/2011_09_26/image_00/data"),
            prefix: "000000".into(),
            extension: ".png".into(),
            start: 0,
            end: 9,
            fill_width: 4,
        }
    }
}

impl ImageSequence {
    pub fn new(base: impl AsRef<Path>, prefix: &str, extension: &str, start: usize, end: usize) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
            prefix: prefix.into(),
            extension: extension.into(),
            start,
            end,
            ..Default::default()
        }
    }

    pub fn with_fill_width(mut self, fill_width: usize) -> Self {
        self.fill_width = fill_width;
        self
    }

    pub fn path(&self, index: usize) -> PathBuf {
        let number = self.start + index;
        self.base.join(format!(
            "{}{:0>width$}{}",
            self.prefix,
            number,
            self.extension,
            width = self.fill_width
        ))
    }
}

impl ImageSource for ImageSequence {
    fn len(&self) -> usize {
        (self.end + 1).saturating_sub(self.start)
    }

    fn load(&self, index: usize) -> Result<GrayImage> {
        if index >= self.len() {
            return Err(PipelineError::ImageOutOfRange { index, len: self.len() });
        }

        let path = self.path(index);
        let image = image::open(&path).map_err(|source| PipelineError::ImageLoad {
            index,
            path: path.clone(),
            source,
        })?;
        Ok(image.into_luma8())
    }
}

/// Images kept in memory, mostly for tests and synthetic runs.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    images: Vec<GrayImage>,
}

impl InMemorySource {
    pub fn new(images: Vec<GrayImage>) -> Self {
        Self { images }
    }
}

impl ImageSource for InMemorySource {
    fn len(&self) -> usize {
        self.images.len()
    }

    fn load(&self, index: usize) -> Result<GrayImage> {
        self.images.get(index).cloned().ok_or(PipelineError::ImageOutOfRange {
            index,
            len: self.images.len(),
        })
    }
}
