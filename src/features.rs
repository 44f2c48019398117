//! Input images and visual features.
//!
//! Feature extraction (oriented FAST + rotated BRIEF) is an external
//! collaborator: the tracker consumes whatever a [`FeatureExtractor`]
//! produces and never touches pixels itself, except to hand the raw image
//! to the direct image aligner.

use nalgebra::Vector3;

/// A single-channel 8-bit image.
///
/// The `channels` field exists to surface contract violations at the API
/// boundary: every grab operation requires grayscale input.
#[derive(Debug, Clone)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub data: Vec<u8>,
}

impl Image {
    pub fn gray(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            channels: 1,
            data,
        }
    }

    /// An all-zero grayscale image, handy for tests and synthetic drivers.
    pub fn black(width: u32, height: u32) -> Self {
        Self::gray(width, height, vec![0; (width * height) as usize])
    }
}

/// A 32-bit float depth image, raw sensor units (see `DepthMapFactor`).
#[derive(Debug, Clone)]
pub struct DepthImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl DepthImage {
    pub fn new(width: u32, height: u32, data: Vec<f32>) -> Self {
        Self { width, height, data }
    }

    /// Depth at a pixel, or `None` outside the image.
    pub fn at(&self, u: u32, v: u32) -> Option<f32> {
        if u >= self.width || v >= self.height {
            return None;
        }
        Some(self.data[(v * self.width + u) as usize])
    }
}

/// A detected keypoint in pixel coordinates.
#[derive(Debug, Clone, Copy)]
pub struct KeyPoint {
    pub x: f32,
    pub y: f32,
    /// Pyramid level the keypoint was detected at.
    pub octave: i32,
    /// Dominant orientation in degrees, `[0, 360)`.
    pub angle: f32,
}

impl KeyPoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            octave: 0,
            angle: 0.0,
        }
    }
}

/// A 256-bit binary descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub [u8; 32]);

impl Descriptor {
    /// Hamming distance: number of differing bits.
    pub fn distance(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

/// Extractor output for one image.
#[derive(Debug, Clone)]
pub struct Features {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
    /// Scale ratio between consecutive pyramid levels.
    pub scale_factor: f64,
    /// Number of pyramid levels.
    pub n_levels: u32,
}

impl Features {
    pub fn empty() -> Self {
        Self {
            keypoints: Vec::new(),
            descriptors: Vec::new(),
            scale_factor: 2.0,
            n_levels: 5,
        }
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// External feature extractor contract: `frame <- extract(image)`.
pub trait FeatureExtractor: Send {
    fn extract(&self, image: &Image) -> Features;
}

/// One inertial measurement: specific force and angular rate, body frame.
#[derive(Debug, Clone, Copy)]
pub struct ImuSample {
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
}

impl ImuSample {
    pub fn new(accel: Vector3<f64>, gyro: Vector3<f64>) -> Self {
        Self { accel, gyro }
    }
}
