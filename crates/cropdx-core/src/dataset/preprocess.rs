//! Image decoding, resizing and normalization.
//!
//! Every image goes through the same steps at training and inference time:
//! decode, convert to RGB, stretch to `S × S` (aspect ratio is not kept),
//! scale to `[0, 1]`, then normalize each channel with the mean/std the
//! feature extractor was pretrained with. Output layout is CHW.

use std::path::Path;

use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::error::{CropdxError, Result};

/// Per-channel normalization applied after scaling pixels to `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    /// Channel means [R, G, B]
    pub mean: [f32; 3],
    /// Channel standard deviations [R, G, B]
    pub std: [f32; 3],
}

impl Normalization {
    /// ImageNet statistics, used by timm-pretrained backbones.
    pub const IMAGENET: Self = Self {
        mean: [0.485, 0.456, 0.406],
        std: [0.229, 0.224, 0.225],
    };

    /// Maps `[0, 1]` to `[-1, 1]`.
    pub const SYMMETRIC: Self = Self {
        mean: [0.5, 0.5, 0.5],
        std: [0.5, 0.5, 0.5],
    };

    #[inline]
    fn apply(&self, channel: usize, value: u8) -> f32 {
        (f32::from(value) / 255.0 - self.mean[channel]) / self.std[channel]
    }
}

impl Default for Normalization {
    fn default() -> Self {
        Self::IMAGENET
    }
}

/// Turns image files into normalized CHW `f32` buffers of a fixed size.
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    image_size: u32,
    normalization: Normalization,
}

/// Converts an edge length to the `u32` the image crate works in.
pub fn image_edge(image_size: usize) -> Result<u32> {
    u32::try_from(image_size).map_err(|_| {
        CropdxError::Configuration(format!("image size {image_size} is too large"))
    })
}

impl ImagePreprocessor {
    pub fn new(image_size: usize, normalization: Normalization) -> Result<Self> {
        Ok(Self {
            image_size: image_edge(image_size)?,
            normalization,
        })
    }

    /// Edge length of the square output.
    pub fn image_size(&self) -> usize {
        self.image_size as usize
    }

    pub fn normalization(&self) -> Normalization {
        self.normalization
    }

    /// Number of `f32` values produced per image (`3 × S × S`).
    pub fn values_per_image(&self) -> usize {
        3 * self.image_size() * self.image_size()
    }

    /// Decodes and preprocesses one file.
    pub fn load(&self, path: &Path) -> Result<Vec<f32>> {
        let image = image::open(path).map_err(|e| CropdxError::ImageDecode {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Ok(self.preprocess(&image))
    }

    /// Resizes and normalizes an already decoded image.
    pub fn preprocess(&self, image: &DynamicImage) -> Vec<f32> {
        let size = self.image_size;
        let rgb = if image.width() == size && image.height() == size {
            image.to_rgb8()
        } else {
            image.resize_exact(size, size, FilterType::Triangle).to_rgb8()
        };

        let side = size as usize;
        let plane = side * side;
        let mut out = vec![0f32; 3 * plane];
        for (x, y, pixel) in rgb.enumerate_pixels() {
            let offset = y as usize * side + x as usize;
            for channel in 0..3 {
                out[channel * plane + offset] = self.normalization.apply(channel, pixel[channel]);
            }
        }
        out
    }

    /// Loads one file as a `[1, 3, S, S]` tensor, ready for inference.
    pub fn load_tensor(&self, path: &Path, device: &Device) -> Result<Tensor> {
        let side = self.image_size();
        let data = self.load(path)?;
        Ok(Tensor::from_vec(data, (1, 3, side, side), device)?)
    }
}
