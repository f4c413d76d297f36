//! Image loading and preprocessing
//!
//! Prediction needs two capabilities from the caller: a loader turning a path
//! into a decoded image and a transform turning that image into a CHW float
//! tensor. Plain closures implement both traits.

use std::path::Path;

use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use serde::{Deserialize, Serialize};

use crate::utils::error::{ClassifierError, Result};

/// ImageNet normalization constants (RGB)
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Default square input size of the backbones
pub const DEFAULT_IMAGE_SIZE: u32 = 224;

/// A preprocessed image as a flat CHW float buffer
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    pub data: Vec<f32>,
    /// [channels, height, width]
    pub shape: [usize; 3],
}

impl ImageTensor {
    /// Wrap a buffer, checking it matches the shape
    pub fn new(data: Vec<f32>, shape: [usize; 3]) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(ClassifierError::InvalidInput(format!(
                "image buffer has {} values, shape {:?} needs {}",
                data.len(),
                shape,
                expected
            )));
        }
        Ok(Self { data, shape })
    }

    pub fn channels(&self) -> usize {
        self.shape[0]
    }

    pub fn height(&self) -> usize {
        self.shape[1]
    }

    pub fn width(&self) -> usize {
        self.shape[2]
    }
}

/// Turns a file path into a decoded image
pub trait ImageLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<DynamicImage>;
}

impl<F> ImageLoader for F
where
    F: Fn(&Path) -> Result<DynamicImage> + Send + Sync,
{
    fn load(&self, path: &Path) -> Result<DynamicImage> {
        self(path)
    }
}

/// Decodes any format supported by `image`, guessing from the content
#[derive(Debug, Clone, Copy, Default)]
pub struct RgbImageLoader;

impl ImageLoader for RgbImageLoader {
    fn load(&self, path: &Path) -> Result<DynamicImage> {
        let image = ImageReader::open(path)
            .and_then(|reader| reader.with_guessed_format())
            .map_err(|e| ClassifierError::ImageLoad(path.to_path_buf(), e.to_string()))?
            .decode()
            .map_err(|e| ClassifierError::ImageLoad(path.to_path_buf(), e.to_string()))?;
        Ok(DynamicImage::ImageRgb8(image.to_rgb8()))
    }
}

/// Turns a decoded image into model input
pub trait Transform: Send + Sync {
    fn apply(&self, image: DynamicImage) -> Result<ImageTensor>;
}

impl<F> Transform for F
where
    F: Fn(DynamicImage) -> Result<ImageTensor> + Send + Sync,
{
    fn apply(&self, image: DynamicImage) -> Result<ImageTensor> {
        self(image)
    }
}

/// Resize to a square and normalize each channel: `(x / 255 - mean) / std`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResizeNormalize {
    pub size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl ResizeNormalize {
    /// Resize with ImageNet statistics
    pub fn imagenet(size: u32) -> Self {
        Self {
            size,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        }
    }

    /// Resize and scale to [0, 1] only
    pub fn unnormalized(size: u32) -> Self {
        Self {
            size,
            mean: [0.0; 3],
            std: [1.0; 3],
        }
    }
}

impl Default for ResizeNormalize {
    fn default() -> Self {
        Self::imagenet(DEFAULT_IMAGE_SIZE)
    }
}

impl Transform for ResizeNormalize {
    fn apply(&self, image: DynamicImage) -> Result<ImageTensor> {
        if self.size == 0 {
            return Err(ClassifierError::InvalidInput(
                "transform size must be positive".to_string(),
            ));
        }

        let img = image
            .resize_exact(self.size, self.size, FilterType::Triangle)
            .to_rgb8();

        let (width, height) = (self.size as usize, self.size as usize);
        let plane = height * width;
        let mut data = vec![0.0f32; 3 * plane];

        // HWC pixels to CHW planes
        for (x, y, pixel) in img.enumerate_pixels() {
            let offset = y as usize * width + x as usize;
            for c in 0..3 {
                data[c * plane + offset] =
                    (pixel[c] as f32 / 255.0 - self.mean[c]) / self.std[c];
            }
        }

        ImageTensor::new(data, [3, height, width])
    }
}
