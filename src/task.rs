//! Image Classification Task
//!
//! Ties an assembled classifier to its hyper-parameters and exposes the
//! operations a caller needs: forward, freeze/unfreeze, fit, predict and
//! checkpointing.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::{
    module::{AutodiffModule, Module},
    record::CompactRecorder,
    tensor::{
        backend::{AutodiffBackend, Backend},
        Tensor,
    },
};
use tracing::info;

use crate::dataset::burn_dataset::LabeledImageDataset;
use crate::dataset::folder::ImageFolder;
use crate::dataset::transform::{ImageLoader, ResizeNormalize, RgbImageLoader, Transform};
use crate::inference::predictor::{predict, PredictConfig, PredictionTable};
use crate::inference::runner::{Evaluator, Runner};
use crate::model::{assemble, BackboneRegistry, ImageClassifier};
use crate::training::config::{FitConfig, TaskConfig};
use crate::training::trainer::{fit, FitReport};
use crate::utils::error::{ClassifierError, Result};

/// File stem of the saved model record
pub const MODEL_FILE: &str = "model";

/// File name of the saved task configuration
pub const TASK_CONFIG_FILE: &str = "task.json";

/// A classifier together with its task configuration
#[derive(Debug)]
pub struct ImageClassificationTask<B: Backend> {
    config: TaskConfig,
    model: ImageClassifier<B>,
    device: B::Device,
}

impl<B: Backend> ImageClassificationTask<B> {
    /// Validate the configuration and assemble the classifier
    pub fn new(config: TaskConfig, registry: &BackboneRegistry<B>, device: B::Device) -> Result<Self> {
        config.validate()?;
        let model = config.model.init(registry, &device)?;
        Ok(Self {
            config,
            model,
            device,
        })
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn model(&self) -> &ImageClassifier<B> {
        &self.model
    }

    pub fn into_model(self) -> ImageClassifier<B> {
        self.model
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Class logits for a batch of images
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.model.forward(images)
    }

    pub fn freeze(self) -> Self {
        Self {
            model: self.model.freeze(),
            ..self
        }
    }

    pub fn unfreeze(self) -> Self {
        Self {
            model: self.model.unfreeze(),
            ..self
        }
    }

    /// Predict with the default loader and the softmax evaluator
    pub fn predict(
        &self,
        image_paths: &[PathBuf],
        transform: Option<Arc<dyn Transform>>,
        config: &PredictConfig,
    ) -> Result<Vec<PredictionTable>> {
        let evaluator = Evaluator::<B>::new(self.device.clone())
            .with_class_names(self.config.class_names.clone())
            .with_progress(config.show_progress);

        self.predict_with(image_paths, Arc::new(RgbImageLoader), transform, config, &evaluator)
    }

    /// Predict with a caller-supplied loader and runner
    pub fn predict_with<R: Runner<B> + ?Sized>(
        &self,
        image_paths: &[PathBuf],
        loader: Arc<dyn ImageLoader>,
        transform: Option<Arc<dyn Transform>>,
        config: &PredictConfig,
        runner: &R,
    ) -> Result<Vec<PredictionTable>> {
        predict(&self.model, image_paths, loader, transform, config, runner)
    }

    /// Write `model.mpk` and `task.json` into `dir`
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        self.model
            .clone()
            .save_file(dir.join(MODEL_FILE), &CompactRecorder::new())?;
        self.config.save(dir.join(TASK_CONFIG_FILE))?;

        info!("Saved task to {:?}", dir);
        Ok(())
    }

    /// Rebuild a task saved with [`save`](Self::save)
    ///
    /// The architecture is assembled without pretrained weights and then
    /// overwritten by the saved record.
    pub fn load<P: AsRef<Path>>(
        dir: P,
        registry: &BackboneRegistry<B>,
        device: B::Device,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        let config = TaskConfig::load(dir.join(TASK_CONFIG_FILE))?;

        let record = dir.join(format!("{}.mpk", MODEL_FILE));
        if !record.exists() {
            return Err(ClassifierError::Checkpoint(format!(
                "model record not found at {}",
                record.display()
            )));
        }

        let model = assemble(
            config.model.num_classes,
            &config.model.backbone,
            false,
            registry,
            &device,
        )?
        .load_file(dir.join(MODEL_FILE), &CompactRecorder::new(), &device)?;

        info!("Loaded {} task from {:?}", config.model.backbone, dir);
        Ok(Self {
            config,
            model,
            device,
        })
    }
}

impl<B: AutodiffBackend> ImageClassificationTask<B> {
    /// Fit on prepared datasets
    pub fn fit(
        self,
        fit_config: &FitConfig,
        train: &LabeledImageDataset,
        valid: Option<&LabeledImageDataset>,
    ) -> Result<(Self, FitReport)> {
        let (model, report) = fit(self.model, &self.config, fit_config, train, valid, &self.device)?;
        Ok((
            Self {
                model,
                config: self.config,
                device: self.device,
            },
            report,
        ))
    }

    /// Split an image folder, fit on it and adopt its class names
    pub fn fit_folder(self, folder: &ImageFolder, fit_config: &FitConfig) -> Result<(Self, FitReport)> {
        if folder.num_classes() != self.config.model.num_classes {
            return Err(ClassifierError::Config(format!(
                "dataset has {} classes, task expects {}",
                folder.num_classes(),
                self.config.model.num_classes
            )));
        }

        let (train, valid) = folder.split(fit_config.validation_fraction, fit_config.seed)?;
        info!(
            "Split {} images into {} training / {} validation",
            folder.len(),
            train.len(),
            valid.len()
        );

        let loader: Arc<dyn ImageLoader> = Arc::new(RgbImageLoader);
        let transform: Arc<dyn Transform> = Arc::new(ResizeNormalize::imagenet(fit_config.image_size));
        let train = LabeledImageDataset::new(train, loader.clone(), transform.clone());
        let valid = LabeledImageDataset::new(valid, loader, transform);

        let mut task = self;
        task.config.class_names = Some(folder.class_names().to_vec());
        task.fit(fit_config, &train, Some(&valid))
    }

    /// The same task on the inner backend, without gradient tracking
    pub fn valid(&self) -> ImageClassificationTask<B::InnerBackend> {
        ImageClassificationTask {
            config: self.config.clone(),
            model: self.model.valid(),
            device: self.device.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ImageClassifierConfig, PretrainedWeights};
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use image::{ImageBuffer, Rgb};
    use tempfile::TempDir;

    type TestBackend = NdArray;
    type TestAutodiffBackend = Autodiff<NdArray>;

    fn config(num_classes: usize) -> TaskConfig {
        TaskConfig::new(
            ImageClassifierConfig::new(num_classes)
                .with_backbone("convnet-tiny".to_string())
                .with_pretrained(false),
        )
    }

    fn registry<B: Backend>() -> BackboneRegistry<B> {
        BackboneRegistry::new(PretrainedWeights::new("unused"))
    }

    fn write_image(path: &Path, color: [u8; 3]) {
        ImageBuffer::from_fn(10, 10, |_, _| Rgb(color)).save(path).unwrap();
    }

    fn fixed_logits<B: Backend>(task: &ImageClassificationTask<B>) -> Vec<f32> {
        let input = Tensor::<B, 4>::ones([1, 3, 16, 16], task.device());
        task.forward(input).into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn test_new_and_forward() {
        let device = Default::default();
        let task = ImageClassificationTask::<TestBackend>::new(config(5), &registry(), device).unwrap();

        let input = Tensor::<TestBackend, 4>::zeros([2, 3, 16, 16], task.device());
        assert_eq!(task.forward(input).dims(), [2, 5]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let device = Default::default();
        let config = config(2).with_learning_rate(-1.0);
        let result = ImageClassificationTask::<TestBackend>::new(config, &registry(), device);
        assert!(matches!(result, Err(ClassifierError::Config(_))));
    }

    #[test]
    fn test_unknown_backbone_surfaces() {
        let device = Default::default();
        let mut config = config(2);
        config.model.backbone = "mobilenet".to_string();
        let result = ImageClassificationTask::<TestBackend>::new(config, &registry(), device);
        assert!(matches!(
            result,
            Err(ClassifierError::UnsupportedBackbone { .. })
        ));
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let device = Default::default();
        let task = ImageClassificationTask::<TestBackend>::new(
            config(3).with_class_names(vec!["a".into(), "b".into(), "c".into()]),
            &registry(),
            device,
        )
        .unwrap();
        task.save(temp.path()).unwrap();

        assert!(temp.path().join("model.mpk").exists());
        assert!(temp.path().join(TASK_CONFIG_FILE).exists());

        let loaded =
            ImageClassificationTask::<TestBackend>::load(temp.path(), &registry(), Default::default())
                .unwrap();
        assert_eq!(loaded.config().class_names, task.config().class_names);

        let before = fixed_logits(&task);
        let after = fixed_logits(&loaded);
        assert_eq!(before.len(), after.len());
        for (a, b) in before.iter().zip(after.iter()) {
            assert!((a - b).abs() < 1e-2);
        }
    }

    #[test]
    fn test_load_without_record() {
        let temp = TempDir::new().unwrap();
        config(2).save(temp.path().join(TASK_CONFIG_FILE)).unwrap();

        let result =
            ImageClassificationTask::<TestBackend>::load(temp.path(), &registry(), Default::default());
        assert!(matches!(result, Err(ClassifierError::Checkpoint(_))));
    }

    #[test]
    fn test_predict_labels_with_class_names() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("leaf.png");
        write_image(&path, [0, 200, 0]);

        let device = Default::default();
        let task = ImageClassificationTask::<TestBackend>::new(
            config(2).with_class_names(vec!["healthy".into(), "sick".into()]),
            &registry(),
            device,
        )
        .unwrap();

        let tables = task
            .predict(
                &[path.clone()],
                Some(Arc::new(ResizeNormalize::imagenet(16))),
                &PredictConfig::default(),
            )
            .unwrap();

        let record = &tables[0].records[0];
        assert_eq!(record.id, path);
        let label = record.fields["label"].as_str().unwrap();
        assert!(label == "healthy" || label == "sick");
        assert!(record.fields.contains_key("scores_healthy"));
    }

    #[test]
    fn test_freeze_roundtrip_through_task() {
        let device = Default::default();
        let task =
            ImageClassificationTask::<TestAutodiffBackend>::new(config(2), &registry(), device)
                .unwrap();

        let task = task.freeze();
        assert!(task.model().is_trunk_frozen());
        let task = task.unfreeze();
        assert!(!task.model().is_trunk_frozen());
    }

    #[test]
    fn test_fit_folder() {
        let temp = TempDir::new().unwrap();
        for (class, color) in [("blue", [0, 0, 255]), ("red", [255, 0, 0])] {
            let dir = temp.path().join(class);
            std::fs::create_dir(&dir).unwrap();
            for i in 0..3 {
                write_image(&dir.join(format!("{}.png", i)), color);
            }
        }
        let folder = ImageFolder::new(temp.path()).unwrap();

        let device = Default::default();
        let task =
            ImageClassificationTask::<TestAutodiffBackend>::new(config(2), &registry(), device)
                .unwrap();
        let fit_config = FitConfig {
            epochs: 1,
            batch_size: 2,
            image_size: 16,
            validation_fraction: 0.3,
            ..FitConfig::default()
        };

        let (task, report) = task.fit_folder(&folder, &fit_config).unwrap();

        assert_eq!(report.epochs.len(), 1);
        assert_eq!(
            task.config().class_names,
            Some(vec!["blue".to_string(), "red".to_string()])
        );

        let inference = task.valid();
        let input = Tensor::<TestBackend, 4>::zeros([1, 3, 16, 16], inference.device());
        assert_eq!(inference.forward(input).dims(), [1, 2]);
    }

    #[test]
    fn test_fit_folder_class_mismatch() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("only");
        std::fs::create_dir(&dir).unwrap();
        write_image(&dir.join("0.png"), [1, 2, 3]);
        let folder = ImageFolder::new(temp.path()).unwrap();

        let device = Default::default();
        let task =
            ImageClassificationTask::<TestAutodiffBackend>::new(config(2), &registry(), device)
                .unwrap();

        let result = task.fit_folder(&folder, &FitConfig::default());
        assert!(matches!(result, Err(ClassifierError::Config(_))));
    }
}
