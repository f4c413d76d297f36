//! Task and Fitting Configuration
//!
//! Serializable hyper-parameters of a classification task (model, optimizer,
//! loss, metrics) and of a fitting run (epochs, batching, split, artifacts).

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::model::ImageClassifierConfig;
use crate::utils::error::{ClassifierError, Result};

/// Default learning rate of a task
pub const DEFAULT_LEARNING_RATE: f64 = 1e-3;

/// Optimizer used when fitting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OptimizerKind {
    /// Stochastic gradient descent
    Sgd {
        #[serde(default)]
        momentum: Option<f64>,
        #[serde(default)]
        weight_decay: Option<f32>,
    },
    Adam {
        #[serde(default)]
        weight_decay: Option<f32>,
    },
    AdamW { weight_decay: f32 },
}

impl Default for OptimizerKind {
    fn default() -> Self {
        OptimizerKind::Sgd {
            momentum: None,
            weight_decay: None,
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::Sgd { momentum, .. } => match momentum {
                Some(m) => write!(f, "SGD (momentum {})", m),
                None => write!(f, "SGD"),
            },
            OptimizerKind::Adam { .. } => write!(f, "Adam"),
            OptimizerKind::AdamW { weight_decay } => write!(f, "AdamW (decay {})", weight_decay),
        }
    }
}

/// Training objective
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LossKind {
    CrossEntropy {
        #[serde(default)]
        label_smoothing: Option<f32>,
    },
}

impl Default for LossKind {
    fn default() -> Self {
        LossKind::CrossEntropy {
            label_smoothing: None,
        }
    }
}

/// Metrics reported per epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricKind {
    Accuracy,
    TopKAccuracy { k: usize },
    Loss,
}

impl MetricKind {
    /// Key used in epoch reports
    pub fn name(&self) -> String {
        match self {
            MetricKind::Accuracy => "accuracy".to_string(),
            MetricKind::TopKAccuracy { k } => format!("top{}_accuracy", k),
            MetricKind::Loss => "loss".to_string(),
        }
    }
}

fn default_learning_rate() -> f64 {
    DEFAULT_LEARNING_RATE
}

fn default_metrics() -> Vec<MetricKind> {
    vec![MetricKind::Accuracy]
}

/// Hyper-parameters of an image classification task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub model: ImageClassifierConfig,

    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    #[serde(default)]
    pub optimizer: OptimizerKind,

    #[serde(default)]
    pub loss: LossKind,

    #[serde(default = "default_metrics")]
    pub metrics: Vec<MetricKind>,

    /// Class names indexed by label, when known
    #[serde(default)]
    pub class_names: Option<Vec<String>>,
}

impl TaskConfig {
    /// Task with default hyper-parameters around a model configuration
    pub fn new(model: ImageClassifierConfig) -> Self {
        Self {
            model,
            learning_rate: DEFAULT_LEARNING_RATE,
            optimizer: OptimizerKind::default(),
            loss: LossKind::default(),
            metrics: default_metrics(),
            class_names: None,
        }
    }

    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerKind) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_loss(mut self, loss: LossKind) -> Self {
        self.loss = loss;
        self
    }

    pub fn with_metrics(mut self, metrics: Vec<MetricKind>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_class_names(mut self, class_names: Vec<String>) -> Self {
        self.class_names = Some(class_names);
        self
    }

    /// Check the values are usable
    pub fn validate(&self) -> Result<()> {
        if self.model.num_classes == 0 {
            return Err(ClassifierError::Config(
                "num_classes must be positive".to_string(),
            ));
        }
        if self.model.backbone.trim().is_empty() {
            return Err(ClassifierError::Config("backbone name is empty".to_string()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ClassifierError::Config(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }

        match &self.optimizer {
            OptimizerKind::Sgd {
                momentum: Some(m), ..
            } if !(0.0..1.0).contains(m) => {
                return Err(ClassifierError::Config(format!(
                    "momentum must be in [0, 1), got {}",
                    m
                )));
            }
            _ => {}
        }

        let LossKind::CrossEntropy { label_smoothing } = &self.loss;
        if let Some(smoothing) = label_smoothing {
            if !(0.0..=1.0).contains(smoothing) {
                return Err(ClassifierError::Config(format!(
                    "label smoothing must be in [0, 1], got {}",
                    smoothing
                )));
            }
        }

        for metric in &self.metrics {
            if let MetricKind::TopKAccuracy { k } = metric {
                if *k == 0 || *k > self.model.num_classes {
                    return Err(ClassifierError::Config(format!(
                        "top-k accuracy needs 1 <= k <= {}, got {}",
                        self.model.num_classes, k
                    )));
                }
            }
        }

        if let Some(names) = &self.class_names {
            if names.len() != self.model.num_classes {
                return Err(ClassifierError::Config(format!(
                    "{} class names for {} classes",
                    names.len(),
                    self.model.num_classes
                )));
            }
        }

        Ok(())
    }

    /// Save as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from JSON and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}

/// Parameters of one fitting run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    pub epochs: usize,
    pub batch_size: usize,
    /// Decoding threads; 0 decodes on the calling thread
    pub num_workers: usize,
    /// Seed for the split and the per-epoch shuffles
    pub seed: u64,
    /// Share of images held out for validation
    pub validation_fraction: f64,
    /// Square input size fed to the backbone
    pub image_size: u32,
    /// Directory for the best record and the fit report
    pub artifact_dir: Option<PathBuf>,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 32,
            num_workers: 0,
            seed: 42,
            validation_fraction: 0.1,
            image_size: 224,
            artifact_dir: None,
        }
    }
}

impl FitConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(ClassifierError::Config("epochs must be positive".to_string()));
        }
        if self.batch_size == 0 {
            return Err(ClassifierError::Config(
                "batch size must be positive".to_string(),
            ));
        }
        if self.image_size == 0 {
            return Err(ClassifierError::Config(
                "image size must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.validation_fraction) {
            return Err(ClassifierError::Config(format!(
                "validation fraction must be in [0, 1), got {}",
                self.validation_fraction
            )));
        }
        Ok(())
    }
}
