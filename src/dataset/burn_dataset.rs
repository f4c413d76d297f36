//! Burn Dataset Integration
//!
//! Datasets and batchers feeding the classifier:
//! - `ImagePathDataset`: positional dataset over a list of paths (prediction)
//! - `LabeledImageDataset`: labeled samples from an image folder (fitting)
//! - `PredictBatcher` / `ClassificationBatcher`: stack items into tensors

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use tracing::warn;

use crate::dataset::folder::ImageSample;
use crate::dataset::transform::{ImageLoader, ImageTensor, Transform};
use crate::utils::error::{ClassifierError, Result};

/// A preprocessed image with its position in the dataset
#[derive(Debug, Clone)]
pub struct ImageItem {
    /// Position of the source path (0..len)
    pub index: usize,
    pub image: ImageTensor,
}

/// A preprocessed image with its class label
#[derive(Debug, Clone)]
pub struct LabeledImageItem {
    pub image: ImageTensor,
    pub label: usize,
}

/// Dataset over image paths, addressed by position
///
/// Images are decoded and transformed lazily on access.
#[derive(Clone)]
pub struct ImagePathDataset {
    paths: Vec<PathBuf>,
    loader: Arc<dyn ImageLoader>,
    transform: Arc<dyn Transform>,
}

impl ImagePathDataset {
    pub fn new(
        paths: Vec<PathBuf>,
        loader: Arc<dyn ImageLoader>,
        transform: Arc<dyn Transform>,
    ) -> Self {
        Self {
            paths,
            loader,
            transform,
        }
    }

    /// Path at a position
    pub fn path(&self, index: usize) -> Option<&Path> {
        self.paths.get(index).map(PathBuf::as_path)
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Decode and transform one image, reporting failures
    pub fn load(&self, index: usize) -> Result<ImageItem> {
        let path = self.paths.get(index).ok_or_else(|| {
            ClassifierError::InvalidInput(format!(
                "index {} out of range for {} images",
                index,
                self.paths.len()
            ))
        })?;

        let image = self.loader.load(path)?;
        let image = self.transform.apply(image)?;

        Ok(ImageItem { index, image })
    }
}

impl Dataset<ImageItem> for ImagePathDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        match self.load(index) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!("Skipping image {}: {}", index, e);
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.paths.len()
    }
}

impl fmt::Debug for ImagePathDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImagePathDataset")
            .field("len", &self.paths.len())
            .finish()
    }
}

/// Labeled samples loaded on demand
#[derive(Clone)]
pub struct LabeledImageDataset {
    samples: Vec<ImageSample>,
    loader: Arc<dyn ImageLoader>,
    transform: Arc<dyn Transform>,
}

impl LabeledImageDataset {
    pub fn new(
        samples: Vec<ImageSample>,
        loader: Arc<dyn ImageLoader>,
        transform: Arc<dyn Transform>,
    ) -> Self {
        Self {
            samples,
            loader,
            transform,
        }
    }

    pub fn samples(&self) -> &[ImageSample] {
        &self.samples
    }
}

impl Dataset<LabeledImageItem> for LabeledImageDataset {
    fn get(&self, index: usize) -> Option<LabeledImageItem> {
        let sample = self.samples.get(index)?;
        let image = self
            .loader
            .load(&sample.path)
            .and_then(|image| self.transform.apply(image));

        match image {
            Ok(image) => Some(LabeledImageItem {
                image,
                label: sample.label,
            }),
            Err(e) => {
                warn!("Skipping {:?}: {}", sample.path, e);
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

impl fmt::Debug for LabeledImageDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LabeledImageDataset")
            .field("len", &self.samples.len())
            .finish()
    }
}

/// Stack CHW images of one shape into a [batch, C, H, W] tensor
pub fn stack_images<B: Backend>(images: &[&ImageTensor], device: &B::Device) -> Tensor<B, 4> {
    let [channels, height, width] = images.first().map(|image| image.shape).unwrap_or([0; 3]);
    let data: Vec<f32> = images
        .iter()
        .flat_map(|image| image.data.iter().copied())
        .collect();

    Tensor::<B, 4>::from_floats(
        TensorData::new(data, [images.len(), channels, height, width]),
        device,
    )
}

/// A batch of images to classify
#[derive(Clone, Debug)]
pub struct PredictBatch<B: Backend> {
    /// Images with shape [batch_size, channels, height, width]
    pub images: Tensor<B, 4>,
    /// Dataset positions of the images
    pub indices: Vec<usize>,
}

/// Batcher for prediction batches
#[derive(Clone, Debug, Default)]
pub struct PredictBatcher;

impl<B: Backend> Batcher<B, ImageItem, PredictBatch<B>> for PredictBatcher {
    fn batch(&self, items: Vec<ImageItem>, device: &B::Device) -> PredictBatch<B> {
        let images: Vec<&ImageTensor> = items.iter().map(|item| &item.image).collect();

        PredictBatch {
            images: stack_images(&images, device),
            indices: items.iter().map(|item| item.index).collect(),
        }
    }
}

/// A batch of labeled images for fitting
#[derive(Clone, Debug)]
pub struct ClassificationBatch<B: Backend> {
    /// Images with shape [batch_size, channels, height, width]
    pub images: Tensor<B, 4>,
    /// Labels with shape [batch_size]
    pub targets: Tensor<B, 1, Int>,
}

/// Batcher for labeled batches
#[derive(Clone, Debug, Default)]
pub struct ClassificationBatcher;

impl<B: Backend> Batcher<B, LabeledImageItem, ClassificationBatch<B>> for ClassificationBatcher {
    fn batch(&self, items: Vec<LabeledImageItem>, device: &B::Device) -> ClassificationBatch<B> {
        let images: Vec<&ImageTensor> = items.iter().map(|item| &item.image).collect();
        let images = stack_images(&images, device);

        let targets_data: Vec<i64> = items.iter().map(|item| item.label as i64).collect();
        let targets = Tensor::<B, 1, Int>::from_data(
            TensorData::new(targets_data, [items.len()]),
            device,
        );

        ClassificationBatch { images, targets }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::transform::{ResizeNormalize, RgbImageLoader};
    use burn_ndarray::NdArray;
    use image::{ImageBuffer, Rgb};
    use tempfile::TempDir;

    type TestBackend = NdArray;

    fn write_images(dir: &Path, count: usize) -> Vec<PathBuf> {
        (0..count)
            .map(|i| {
                let path = dir.join(format!("img_{}.png", i));
                let shade = (i * 40) as u8;
                ImageBuffer::from_fn(12, 8, |_, _| Rgb([shade, 0, 0]))
                    .save(&path)
                    .unwrap();
                path
            })
            .collect()
    }

    fn dataset(paths: Vec<PathBuf>) -> ImagePathDataset {
        ImagePathDataset::new(
            paths,
            Arc::new(RgbImageLoader),
            Arc::new(ResizeNormalize::unnormalized(4)),
        )
    }

    #[test]
    fn test_path_dataset_is_positional() {
        let temp = TempDir::new().unwrap();
        let paths = write_images(temp.path(), 3);
        let dataset = dataset(paths.clone());

        assert_eq!(dataset.len(), 3);
        for i in 0..3 {
            let item = dataset.get(i).unwrap();
            assert_eq!(item.index, i);
            assert_eq!(item.image.shape, [3, 4, 4]);
            assert_eq!(dataset.path(i), Some(paths[i].as_path()));
        }
        assert!(dataset.get(3).is_none());
    }

    #[test]
    fn test_load_reports_decode_errors() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.png");
        std::fs::write(&path, b"garbage").unwrap();
        let dataset = dataset(vec![path]);

        assert!(matches!(dataset.load(0), Err(ClassifierError::ImageLoad(..))));
        assert!(dataset.get(0).is_none());
    }

    #[test]
    fn test_predict_batcher() {
        let temp = TempDir::new().unwrap();
        let dataset = dataset(write_images(temp.path(), 3));
        let device = Default::default();

        let items = vec![dataset.get(2).unwrap(), dataset.get(0).unwrap()];
        let batch: PredictBatch<TestBackend> = PredictBatcher.batch(items, &device);

        assert_eq!(batch.images.dims(), [2, 3, 4, 4]);
        assert_eq!(batch.indices, vec![2, 0]);
    }

    #[test]
    fn test_classification_batcher() {
        let device = Default::default();
        let items = vec![
            LabeledImageItem {
                image: ImageTensor::new(vec![0.0; 12], [3, 2, 2]).unwrap(),
                label: 1,
            },
            LabeledImageItem {
                image: ImageTensor::new(vec![1.0; 12], [3, 2, 2]).unwrap(),
                label: 4,
            },
        ];

        let batch: ClassificationBatch<TestBackend> = ClassificationBatcher.batch(items, &device);

        assert_eq!(batch.images.dims(), [2, 3, 2, 2]);
        let targets = batch.targets.into_data().to_vec::<i64>().unwrap();
        assert_eq!(targets, vec![1, 4]);
    }

    #[test]
    fn test_labeled_dataset() {
        let temp = TempDir::new().unwrap();
        let paths = write_images(temp.path(), 2);
        let samples = paths
            .into_iter()
            .enumerate()
            .map(|(label, path)| ImageSample { path, label })
            .collect();
        let dataset = LabeledImageDataset::new(
            samples,
            Arc::new(RgbImageLoader),
            Arc::new(ResizeNormalize::imagenet(4)),
        );

        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.get(1).unwrap().label, 1);
    }
}
