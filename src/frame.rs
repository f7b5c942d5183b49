use image::GrayImage;

/// A localized, scale-aware interest point in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// Diameter of the meaningful neighborhood around the point
    pub size: f32,
    /// Orientation in radians, when the detector computes one
    pub angle: Option<f32>,
    /// Detector confidence. Zero for detectors that don't rank their output.
    pub response: f32,
    /// Pyramid level the point was found on
    pub octave: i32,
    /// Detector specific tag, `-1` when unused. AKAZE stores its scale-space evolution index here.
    pub class_id: i32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, size: f32) -> Self {
        Self {
            x,
            y,
            size,
            angle: None,
            response: 0.0,
            octave: 0,
            class_id: -1,
        }
    }

    pub fn with_response(mut self, response: f32) -> Self {
        self.response = response;
        self
    }

    pub fn with_angle(mut self, angle: f32) -> Self {
        self.angle = Some(angle);
        self
    }

    pub fn with_octave(mut self, octave: i32) -> Self {
        self.octave = octave;
        self
    }

    pub fn with_class_id(mut self, class_id: i32) -> Self {
        self.class_id = class_id;
        self
    }
}

/// Dense descriptor matrix with one row per keypoint, in keypoint order.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Descriptors {
    #[default]
    Empty,
    /// Packed bit strings compared with the Hamming distance
    Binary { width: usize, data: Vec<u8> },
    /// Histogram style vectors compared with the L2 distance
    Real { width: usize, data: Vec<f32> },
}

impl Descriptors {
    pub fn binary(width: usize, data: Vec<u8>) -> Self {
        debug_assert!(width > 0 && data.len() % width == 0);
        Self::Binary { width, data }
    }

    pub fn real(width: usize, data: Vec<f32>) -> Self {
        debug_assert!(width > 0 && data.len() % width == 0);
        Self::Real { width, data }
    }

    pub fn rows(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Binary { width, data } => data.len() / width,
            Self::Real { width, data } => data.len() / width,
        }
    }

    /// Row width in elements (bytes for binary, floats for real-valued)
    pub fn width(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Binary { width, .. } | Self::Real { width, .. } => *width,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows() == 0
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Binary { .. } => "binary",
            Self::Real { .. } => "real-valued",
        }
    }

    pub fn binary_row(&self, row: usize) -> Option<&[u8]> {
        match self {
            Self::Binary { width, data } => data.get(row * width..(row + 1) * width),
            _ => None,
        }
    }

    pub fn real_row(&self, row: usize) -> Option<&[f32]> {
        match self {
            Self::Real { width, data } => data.get(row * width..(row + 1) * width),
            _ => None,
        }
    }
}

/// Claimed correspondence between a keypoint of the newer (query) frame
/// and a keypoint of the older (train) frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match {
    pub query_index: usize,
    pub train_index: usize,
    pub distance: f32,
}

/// Everything the pipeline keeps about one ingested image.
#[derive(Debug, Clone)]
pub struct Frame {
    image: GrayImage,
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Descriptors,
    /// Matches against the previous frame, empty for the first frame of a run
    pub matches: Vec<Match>,
}

impl Frame {
    pub fn new(image: GrayImage) -> Self {
        Self {
            image,
            keypoints: Vec::new(),
            descriptors: Descriptors::Empty,
            matches: Vec::new(),
        }
    }

    pub fn image(&self) -> &GrayImage {
        &self.image
    }

    /// Checks that descriptor rows line up with keypoints
    pub fn is_consistent(&self) -> bool {
        self.descriptors.is_empty() || self.descriptors.rows() == self.keypoints.len()
    }
}
