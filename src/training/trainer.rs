//! Training Loop
//!
//! Fits an [`ImageClassifier`] on labeled image datasets with Burn's autodiff
//! backend and optimizers: seeded per-epoch shuffles, cross-entropy loss,
//! gradient steps, then a validation pass on the inner backend.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use burn::{
    data::dataloader::batcher::Batcher,
    data::dataset::Dataset,
    module::{AutodiffModule, Module},
    nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig},
    optim::{
        decay::WeightDecayConfig, momentum::MomentumConfig, AdamConfig, AdamWConfig,
        GradientsParams, Optimizer, SgdConfig,
    },
    record::CompactRecorder,
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dataset::burn_dataset::{
    ClassificationBatch, ClassificationBatcher, LabeledImageDataset, LabeledImageItem,
};
use crate::model::ImageClassifier;
use crate::training::config::{FitConfig, LossKind, MetricKind, OptimizerKind, TaskConfig};
use crate::utils::error::{ClassifierError, Result};

/// File stem of the best record written to the artifact directory
pub const BEST_MODEL_FILE: &str = "model-best";

/// File name of the fit report written to the artifact directory
pub const FIT_REPORT_FILE: &str = "fit_report.json";

/// Metrics of one epoch, keyed by metric name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// 1-based epoch number
    pub epoch: usize,
    pub train: BTreeMap<String, f64>,
    /// Empty when no validation data was given
    pub valid: BTreeMap<String, f64>,
}

/// Summary of a fitting run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitReport {
    pub epochs: Vec<EpochMetrics>,
    /// Epoch with the best validation accuracy
    pub best_epoch: Option<usize>,
    pub best_valid_accuracy: Option<f64>,
    pub duration_secs: f64,
}

/// Running sums for the metrics of one pass
#[derive(Debug, Default)]
struct MetricAccumulator {
    loss_sum: f64,
    batches: usize,
    correct: usize,
    top_k_correct: BTreeMap<usize, usize>,
    total: usize,
}

impl MetricAccumulator {
    fn new(metrics: &[MetricKind]) -> Self {
        let top_k_correct = metrics
            .iter()
            .filter_map(|metric| match metric {
                MetricKind::TopKAccuracy { k } => Some((*k, 0)),
                _ => None,
            })
            .collect();

        Self {
            top_k_correct,
            ..Self::default()
        }
    }

    /// Record one batch given row-major logits and integer targets
    fn update(&mut self, loss: f64, logits: &[f32], targets: &[i64]) {
        self.loss_sum += loss;
        self.batches += 1;

        if targets.is_empty() {
            return;
        }
        let num_classes = logits.len() / targets.len();

        for (row, &target) in logits.chunks(num_classes).zip(targets) {
            let target = target as usize;
            let target_score = row[target];
            // Rank of the target among the scores (0 = best)
            let rank = row.iter().filter(|&&score| score > target_score).count();

            if rank == 0 {
                self.correct += 1;
            }
            for (k, correct) in self.top_k_correct.iter_mut() {
                if rank < *k {
                    *correct += 1;
                }
            }
        }
        self.total += targets.len();
    }

    fn accuracy(&self) -> f64 {
        self.correct as f64 / self.total.max(1) as f64
    }

    fn loss(&self) -> f64 {
        self.loss_sum / self.batches.max(1) as f64
    }

    /// Values of the requested metrics
    fn report(&self, metrics: &[MetricKind]) -> BTreeMap<String, f64> {
        metrics
            .iter()
            .map(|metric| {
                let value = match metric {
                    MetricKind::Accuracy => self.accuracy(),
                    MetricKind::Loss => self.loss(),
                    MetricKind::TopKAccuracy { k } => {
                        self.top_k_correct.get(k).copied().unwrap_or(0) as f64
                            / self.total.max(1) as f64
                    }
                };
                (metric.name(), value)
            })
            .collect()
    }
}

/// Fit `model` with the optimizer, loss and metrics of `task`
///
/// Returns the model after the last epoch together with the per-epoch report.
/// A frozen trunk stays untouched: only parameters tracking gradients are
/// updated.
pub fn fit<B: AutodiffBackend>(
    model: ImageClassifier<B>,
    task: &TaskConfig,
    config: &FitConfig,
    train: &LabeledImageDataset,
    valid: Option<&LabeledImageDataset>,
    device: &B::Device,
) -> Result<(ImageClassifier<B>, FitReport)> {
    task.validate()?;
    config.validate()?;

    if train.is_empty() {
        return Err(ClassifierError::Training(
            "training dataset is empty".to_string(),
        ));
    }

    let num_classes = model.num_classes();
    check_labels(train, num_classes)?;
    if let Some(valid) = valid {
        check_labels(valid, num_classes)?;
    }

    info!(
        "Fitting with {} (lr {}) for {} epochs",
        task.optimizer, task.learning_rate, config.epochs
    );

    match &task.optimizer {
        OptimizerKind::Sgd {
            momentum,
            weight_decay,
        } => {
            let optimizer = SgdConfig::new()
                .with_momentum(momentum.map(|m| {
                    MomentumConfig::new()
                        .with_momentum(m)
                        .with_dampening(0.0)
                }))
                .with_weight_decay(weight_decay.map(WeightDecayConfig::new))
                .init::<B, ImageClassifier<B>>();
            Trainer::new(model, optimizer, task, device.clone()).run(config, train, valid)
        }
        OptimizerKind::Adam { weight_decay } => {
            let optimizer = AdamConfig::new()
                .with_weight_decay(weight_decay.map(WeightDecayConfig::new))
                .init::<B, ImageClassifier<B>>();
            Trainer::new(model, optimizer, task, device.clone()).run(config, train, valid)
        }
        OptimizerKind::AdamW { weight_decay } => {
            let optimizer = AdamWConfig::new()
                .with_weight_decay(*weight_decay)
                .init::<B, ImageClassifier<B>>();
            Trainer::new(model, optimizer, task, device.clone()).run(config, train, valid)
        }
    }
}

/// Owns the model and optimizer state during a fitting run
pub struct Trainer<B: AutodiffBackend, O: Optimizer<ImageClassifier<B>, B>> {
    model: ImageClassifier<B>,
    optimizer: O,
    loss_config: CrossEntropyLossConfig,
    loss: CrossEntropyLoss<B>,
    learning_rate: f64,
    metrics: Vec<MetricKind>,
    device: B::Device,
}

impl<B, O> Trainer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<ImageClassifier<B>, B>,
{
    pub fn new(model: ImageClassifier<B>, optimizer: O, task: &TaskConfig, device: B::Device) -> Self {
        let LossKind::CrossEntropy { label_smoothing } = task.loss;
        let loss_config = CrossEntropyLossConfig::new().with_smoothing(label_smoothing);
        let loss = loss_config.init(&device);

        Self {
            model,
            optimizer,
            loss_config,
            loss,
            learning_rate: task.learning_rate,
            metrics: task.metrics.clone(),
            device,
        }
    }

    /// Run every epoch, saving the best record when an artifact directory is set
    pub fn run(
        mut self,
        config: &FitConfig,
        train: &LabeledImageDataset,
        valid: Option<&LabeledImageDataset>,
    ) -> Result<(ImageClassifier<B>, FitReport)> {
        let pool = worker_pool(config.num_workers)?;
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let mut report = FitReport::default();
        let start = Instant::now();

        if let Some(dir) = &config.artifact_dir {
            std::fs::create_dir_all(dir)?;
        }

        for epoch in 1..=config.epochs {
            let mut order: Vec<usize> = (0..train.len()).collect();
            order.shuffle(&mut rng);

            let train_metrics = self.train_epoch(train, &order, config.batch_size, pool.as_ref())?;

            let valid_metrics = match valid.filter(|dataset| !dataset.is_empty()) {
                Some(dataset) => Some(self.evaluate(dataset, config.batch_size, pool.as_ref())?),
                None => None,
            };

            info!(
                "Epoch {}/{}: train loss = {:.4}, train acc = {:.2}%{}",
                epoch,
                config.epochs,
                train_metrics.loss(),
                train_metrics.accuracy() * 100.0,
                valid_metrics
                    .as_ref()
                    .map(|m| format!(", val loss = {:.4}, val acc = {:.2}%", m.loss(), m.accuracy() * 100.0))
                    .unwrap_or_default()
            );

            if let Some(metrics) = &valid_metrics {
                let accuracy = metrics.accuracy();
                if report.best_valid_accuracy.map_or(true, |best| accuracy > best) {
                    report.best_valid_accuracy = Some(accuracy);
                    report.best_epoch = Some(epoch);
                    if let Some(dir) = &config.artifact_dir {
                        self.save_best(dir)?;
                    }
                }
            }

            report.epochs.push(EpochMetrics {
                epoch,
                train: train_metrics.report(&self.metrics),
                valid: valid_metrics
                    .map(|m| m.report(&self.metrics))
                    .unwrap_or_default(),
            });
        }

        report.duration_secs = start.elapsed().as_secs_f64();

        if let Some(dir) = &config.artifact_dir {
            let json = serde_json::to_string_pretty(&report)?;
            std::fs::write(dir.join(FIT_REPORT_FILE), json)?;
        }

        Ok((self.model, report))
    }

    /// One pass over `order`, stepping the optimizer after every batch
    fn train_epoch(
        &mut self,
        dataset: &LabeledImageDataset,
        order: &[usize],
        batch_size: usize,
        pool: Option<&ThreadPool>,
    ) -> Result<MetricAccumulator> {
        let mut metrics = MetricAccumulator::new(&self.metrics);

        for (batch_idx, indices) in order.chunks(batch_size).enumerate() {
            let items = load_items(dataset, indices, pool);
            if items.is_empty() {
                continue;
            }

            let batch: ClassificationBatch<B> = ClassificationBatcher.batch(items, &self.device);
            let output = self.model.forward(batch.images);
            let loss = self.loss.forward(output.clone(), batch.targets.clone());

            let loss_value: f64 = loss.clone().into_scalar().elem();
            metrics.update(loss_value, &logits_to_vec(output)?, &targets_to_vec(batch.targets)?);

            let grads = GradientsParams::from_grads(loss.backward(), &self.model);
            self.model = self
                .optimizer
                .step(self.learning_rate, self.model.clone(), grads);

            debug!("Batch {}: loss = {:.4}", batch_idx + 1, loss_value);
        }

        Ok(metrics)
    }

    /// Metrics of the current model on a dataset, without gradient tracking
    fn evaluate(
        &self,
        dataset: &LabeledImageDataset,
        batch_size: usize,
        pool: Option<&ThreadPool>,
    ) -> Result<MetricAccumulator> {
        let model = self.model.valid();
        let loss_fn = self.loss_config.init::<B::InnerBackend>(&self.device);
        let mut metrics = MetricAccumulator::new(&self.metrics);

        let order: Vec<usize> = (0..dataset.len()).collect();
        for indices in order.chunks(batch_size) {
            let items = load_items(dataset, indices, pool);
            if items.is_empty() {
                continue;
            }

            let batch: ClassificationBatch<B::InnerBackend> =
                ClassificationBatcher.batch(items, &self.device);
            let output = model.forward(batch.images);
            let loss = loss_fn.forward(output.clone(), batch.targets.clone());

            let loss_value: f64 = loss.into_scalar().elem();
            metrics.update(loss_value, &logits_to_vec(output)?, &targets_to_vec(batch.targets)?);
        }

        Ok(metrics)
    }

    fn save_best(&self, dir: &Path) -> Result<()> {
        let path = dir.join(BEST_MODEL_FILE);
        self.model
            .clone()
            .save_file(&path, &CompactRecorder::new())?;
        debug!("Saved best model to {:?}", path);
        Ok(())
    }
}

/// Every label must index one of the model outputs
fn check_labels(dataset: &LabeledImageDataset, num_classes: usize) -> Result<()> {
    match dataset
        .samples()
        .iter()
        .find(|sample| sample.label >= num_classes)
    {
        Some(sample) => Err(ClassifierError::Training(format!(
            "label {} of {:?} is out of range for {} classes",
            sample.label, sample.path, num_classes
        ))),
        None => Ok(()),
    }
}

/// Rayon pool for decoding; `None` decodes on the calling thread
pub(crate) fn worker_pool(num_workers: usize) -> Result<Option<ThreadPool>> {
    if num_workers == 0 {
        return Ok(None);
    }

    rayon::ThreadPoolBuilder::new()
        .num_threads(num_workers)
        .build()
        .map(Some)
        .map_err(|e| ClassifierError::Training(e.to_string()))
}

fn load_items(
    dataset: &LabeledImageDataset,
    indices: &[usize],
    pool: Option<&ThreadPool>,
) -> Vec<LabeledImageItem> {
    match pool {
        Some(pool) => pool.install(|| {
            indices
                .par_iter()
                .filter_map(|&index| dataset.get(index))
                .collect()
        }),
        None => indices
            .iter()
            .filter_map(|&index| dataset.get(index))
            .collect(),
    }
}

fn logits_to_vec<B: Backend>(logits: Tensor<B, 2>) -> Result<Vec<f32>> {
    logits
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| ClassifierError::Training(format!("{:?}", e)))
}

fn targets_to_vec<B: Backend>(targets: Tensor<B, 1, Int>) -> Result<Vec<i64>> {
    targets
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| ClassifierError::Training(format!("{:?}", e)))
}
