//! Evaluation Runner
//!
//! The runner owns batching, worker threads and the forward pass. It takes a
//! model and one or more data sources and returns, per source, an optional
//! list of prediction batches. Each prediction entry carries a positional
//! `id` plus whatever fields the runner chooses to emit.

use std::time::Instant;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::tensor::{activation::softmax, backend::Backend};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::dataset::burn_dataset::{ImageItem, ImagePathDataset, PredictBatch, PredictBatcher};
use crate::model::ImageClassifier;
use crate::utils::error::{ClassifierError, Result};

/// One per-sample prediction as emitted by a runner
pub type PredictionEntry = Map<String, Value>;

/// Entries of one batch, in runner order
pub type PredictionBatch = Vec<PredictionEntry>;

/// Result of evaluating one data source
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutput {
    /// Per-batch predictions; `None` when the runner produced none
    pub predictions: Option<Vec<PredictionBatch>>,
}

impl RunOutput {
    pub fn with_predictions(predictions: Vec<PredictionBatch>) -> Self {
        Self {
            predictions: Some(predictions),
        }
    }

    pub fn empty() -> Self {
        Self { predictions: None }
    }
}

/// A dataset together with its loading parameters
#[derive(Debug, Clone)]
pub struct DataSource {
    pub dataset: ImagePathDataset,
    pub batch_size: usize,
    /// Decoding threads; 0 decodes on the calling thread
    pub num_workers: usize,
}

/// Evaluation entry point
pub trait Runner<B: Backend> {
    /// Evaluate `model` on every source, returning one output per source in order
    fn test(&self, model: &ImageClassifier<B>, sources: &[DataSource]) -> Result<Vec<RunOutput>>;
}

/// Default runner: softmax scores, arg-max class and confidence per image
#[derive(Debug, Clone)]
pub struct Evaluator<B: Backend> {
    device: B::Device,
    class_names: Option<Vec<String>>,
    show_progress: bool,
}

impl<B: Backend> Evaluator<B> {
    pub fn new(device: B::Device) -> Self {
        Self {
            device,
            class_names: None,
            show_progress: false,
        }
    }

    /// Label predictions and key scores by class name
    pub fn with_class_names(mut self, class_names: Option<Vec<String>>) -> Self {
        self.class_names = class_names;
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    fn evaluate(&self, model: &ImageClassifier<B>, source: &DataSource) -> Result<RunOutput> {
        if source.batch_size == 0 {
            return Err(ClassifierError::InvalidInput(
                "batch size must be positive".to_string(),
            ));
        }

        let pool = if source.num_workers > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(source.num_workers)
                .build()
                .map_err(|e| ClassifierError::Inference(e.to_string()))?;
            Some(pool)
        } else {
            None
        };

        let total = source.dataset.len();
        let progress = self.progress_bar(total);
        let start = Instant::now();

        let mut batches = Vec::with_capacity(total.div_ceil(source.batch_size));
        for first in (0..total).step_by(source.batch_size) {
            let indices: Vec<usize> = (first..(first + source.batch_size).min(total)).collect();

            let items: Vec<ImageItem> = match &pool {
                Some(pool) => pool.install(|| {
                    indices
                        .par_iter()
                        .map(|&index| source.dataset.load(index))
                        .collect::<Result<Vec<_>>>()
                })?,
                None => indices
                    .iter()
                    .map(|&index| source.dataset.load(index))
                    .collect::<Result<Vec<_>>>()?,
            };

            batches.push(self.predict_batch(model, items)?);

            if let Some(pb) = &progress {
                pb.inc(indices.len() as u64);
            }
            debug!("Evaluated batch of {} starting at {}", indices.len(), first);
        }

        if let Some(pb) = progress {
            pb.finish_and_clear();
        }

        info!(
            "Evaluated {} images in {} batches ({:.2}s)",
            total,
            batches.len(),
            start.elapsed().as_secs_f64()
        );

        Ok(RunOutput::with_predictions(batches))
    }

    fn predict_batch(&self, model: &ImageClassifier<B>, items: Vec<ImageItem>) -> Result<PredictionBatch> {
        if let Some(first) = items.first() {
            if let Some(other) = items.iter().find(|item| item.image.shape != first.image.shape) {
                return Err(ClassifierError::Inference(format!(
                    "transform produced mixed shapes in one batch: {:?} and {:?}",
                    first.image.shape, other.image.shape
                )));
            }
        }

        let batch: PredictBatch<B> = PredictBatcher.batch(items, &self.device);
        let probabilities = softmax(model.forward(batch.images), 1);
        let [_, num_classes] = probabilities.dims();

        if let Some(names) = &self.class_names {
            if names.len() != num_classes {
                return Err(ClassifierError::InvalidInput(format!(
                    "{} class names for a model with {} outputs",
                    names.len(),
                    num_classes
                )));
            }
        }

        let values = probabilities
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| ClassifierError::Inference(format!("{:?}", e)))?;

        Ok(batch
            .indices
            .iter()
            .zip(values.chunks(num_classes))
            .map(|(&index, row)| self.entry(index, row))
            .collect())
    }

    fn entry(&self, index: usize, probabilities: &[f32]) -> PredictionEntry {
        let (predicted_class, confidence) = probabilities
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::MIN), |best, (i, p)| if p > best.1 { (i, p) } else { best });

        let scores: Map<String, Value> = probabilities
            .iter()
            .enumerate()
            .map(|(i, &p)| (self.class_key(i), json!(p)))
            .collect();

        let mut entry = Map::new();
        entry.insert("id".to_string(), json!(index));
        entry.insert("predicted_class".to_string(), json!(predicted_class));
        entry.insert("confidence".to_string(), json!(confidence));
        if let Some(names) = &self.class_names {
            entry.insert("label".to_string(), json!(names[predicted_class]));
        }
        entry.insert("scores".to_string(), Value::Object(scores));
        entry
    }

    fn class_key(&self, class: usize) -> String {
        match &self.class_names {
            Some(names) => names[class].clone(),
            None => class.to_string(),
        }
    }

    fn progress_bar(&self, total: usize) -> Option<ProgressBar> {
        if !self.show_progress {
            return None;
        }

        let pb = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("  {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        Some(pb)
    }
}

impl<B: Backend> Runner<B> for Evaluator<B> {
    fn test(&self, model: &ImageClassifier<B>, sources: &[DataSource]) -> Result<Vec<RunOutput>> {
        sources
            .iter()
            .map(|source| self.evaluate(model, source))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::transform::{ResizeNormalize, RgbImageLoader};
    use crate::model::{assemble, BackboneRegistry, PretrainedWeights};
    use burn_ndarray::NdArray;
    use image::{ImageBuffer, Rgb};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    fn model(num_classes: usize) -> ImageClassifier<TestBackend> {
        let registry = BackboneRegistry::new(PretrainedWeights::new("unused"));
        assemble(num_classes, "convnet-tiny", false, &registry, &Default::default()).unwrap()
    }

    fn source(dir: &std::path::Path, count: usize, batch_size: usize, num_workers: usize) -> DataSource {
        let paths: Vec<PathBuf> = (0..count)
            .map(|i| {
                let path = dir.join(format!("{}.png", i));
                ImageBuffer::from_fn(20, 20, |x, _| Rgb([(x * 10) as u8, 50, 200]))
                    .save(&path)
                    .unwrap();
                path
            })
            .collect();

        DataSource {
            dataset: ImagePathDataset::new(
                paths,
                Arc::new(RgbImageLoader),
                Arc::new(ResizeNormalize::imagenet(16)),
            ),
            batch_size,
            num_workers,
        }
    }

    fn ids(output: &RunOutput) -> Vec<Vec<u64>> {
        output
            .predictions
            .as_ref()
            .unwrap()
            .iter()
            .map(|batch| batch.iter().map(|e| e["id"].as_u64().unwrap()).collect())
            .collect()
    }

    #[test]
    fn test_batches_follow_dataset_order() {
        let temp = TempDir::new().unwrap();
        let source = source(temp.path(), 5, 2, 0);
        let evaluator = Evaluator::<TestBackend>::new(Default::default());

        let outputs = evaluator.test(&model(3), &[source]).unwrap();

        assert_eq!(outputs.len(), 1);
        assert_eq!(ids(&outputs[0]), vec![vec![0, 1], vec![2, 3], vec![4]]);
    }

    #[test]
    fn test_worker_pool_keeps_order() {
        let temp = TempDir::new().unwrap();
        let source = source(temp.path(), 4, 3, 2);
        let evaluator = Evaluator::<TestBackend>::new(Default::default());

        let outputs = evaluator.test(&model(2), &[source]).unwrap();
        assert_eq!(ids(&outputs[0]), vec![vec![0, 1, 2], vec![3]]);
    }

    #[test]
    fn test_entry_fields() {
        let temp = TempDir::new().unwrap();
        let source = source(temp.path(), 1, 1, 0);
        let evaluator = Evaluator::<TestBackend>::new(Default::default());

        let outputs = evaluator.test(&model(4), &[source]).unwrap();
        let entry = &outputs[0].predictions.as_ref().unwrap()[0][0];

        let scores = entry["scores"].as_object().unwrap();
        assert_eq!(scores.len(), 4);
        let total: f64 = scores.values().map(|v| v.as_f64().unwrap()).sum();
        assert!((total - 1.0).abs() < 1e-4);

        let predicted = entry["predicted_class"].as_u64().unwrap() as usize;
        assert!(predicted < 4);
        assert!(entry.get("label").is_none());
    }

    #[test]
    fn test_class_names_label_entries() {
        let temp = TempDir::new().unwrap();
        let source = source(temp.path(), 2, 2, 0);
        let names = vec!["cat".to_string(), "dog".to_string()];
        let evaluator =
            Evaluator::<TestBackend>::new(Default::default()).with_class_names(Some(names));

        let outputs = evaluator.test(&model(2), &[source]).unwrap();
        let entry = &outputs[0].predictions.as_ref().unwrap()[0][1];

        let label = entry["label"].as_str().unwrap();
        assert!(label == "cat" || label == "dog");
        assert!(entry["scores"].get("dog").is_some());
    }

    #[test]
    fn test_class_name_count_mismatch() {
        let temp = TempDir::new().unwrap();
        let source = source(temp.path(), 1, 1, 0);
        let evaluator = Evaluator::<TestBackend>::new(Default::default())
            .with_class_names(Some(vec!["only".to_string()]));

        let result = evaluator.test(&model(3), &[source]);
        assert!(matches!(result, Err(ClassifierError::InvalidInput(_))));
    }

    #[test]
    fn test_zero_batch_size() {
        let temp = TempDir::new().unwrap();
        let source = source(temp.path(), 1, 0, 0);
        let evaluator = Evaluator::<TestBackend>::new(Default::default());

        assert!(evaluator.test(&model(2), &[source]).is_err());
    }
}
