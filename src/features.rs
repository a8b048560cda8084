//! Frame payloads handed over by the tracking frontend: binary feature
//! descriptors, keypoints and raw image buffers.

use nalgebra::Vector2;

/// Byte length of a binary descriptor (256 bits).
pub const DESCRIPTOR_BYTES: usize = 32;

/// A 256-bit binary feature descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub [u8; DESCRIPTOR_BYTES]);

impl Descriptor {
    pub fn zeros() -> Self {
        Self([0; DESCRIPTOR_BYTES])
    }

    /// Hamming distance: number of differing bits.
    pub fn distance(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

/// A detected 2D feature point with its descriptor.
#[derive(Debug, Clone)]
pub struct Keypoint {
    /// Pixel position (u, v).
    pub position: Vector2<f64>,
    pub descriptor: Descriptor,
}

impl Keypoint {
    pub fn new(u: f64, v: f64, descriptor: Descriptor) -> Self {
        Self {
            position: Vector2::new(u, v),
            descriptor,
        }
    }
}

/// A row-major image buffer.
#[derive(Debug, Clone)]
pub struct ImageBuffer<T> {
    width: usize,
    height: usize,
    data: Vec<T>,
}

impl<T: Copy> ImageBuffer<T> {
    /// Panics if `data.len() != width * height`.
    pub fn new(width: usize, height: usize, data: Vec<T>) -> Self {
        assert_eq!(data.len(), width * height, "image buffer size mismatch");
        Self {
            width,
            height,
            data,
        }
    }

    pub fn filled(width: usize, height: usize, value: T) -> Self {
        Self {
            width,
            height,
            data: vec![value; width * height],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn get(&self, x: usize, y: usize) -> Option<T> {
        if x < self.width && y < self.height {
            Some(self.data[y * self.width + x])
        } else {
            None
        }
    }

    pub fn set(&mut self, x: usize, y: usize, value: T) {
        if x < self.width && y < self.height {
            self.data[y * self.width + x] = value;
        }
    }
}

/// RGB color image.
pub type ColorImage = ImageBuffer<[u8; 3]>;

/// Raw sensor depth image; values are scaled to meters by the camera's
/// `depth_scale`.
pub type DepthImage = ImageBuffer<u16>;
