//! Class-per-directory image datasets
//!
//! ```text
//! root/
//! ├── cat/
//! │   ├── 001.jpg
//! │   └── 002.jpg
//! └── dog/
//!     └── ...
//! ```
//!
//! Class directories are sorted by name; the position in that order is the label.

use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::dataset::IMAGE_EXTENSIONS;
use crate::utils::error::{ClassifierError, Result};

/// A labeled image on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSample {
    pub path: PathBuf,
    pub label: usize,
}

/// Labeled images discovered under a root directory
#[derive(Debug, Clone)]
pub struct ImageFolder {
    root: PathBuf,
    class_names: Vec<String>,
    samples: Vec<ImageSample>,
}

impl ImageFolder {
    /// Scan `root` for class directories and their images
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        info!("Loading image folder from: {:?}", root);

        if !root.is_dir() {
            return Err(ClassifierError::InvalidInput(format!(
                "dataset directory does not exist: {}",
                root.display()
            )));
        }

        let mut class_names: Vec<String> = Vec::new();
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    class_names.push(name.to_string());
                }
            }
        }
        class_names.sort();

        if class_names.is_empty() {
            return Err(ClassifierError::InvalidInput(format!(
                "no class directories found in {}",
                root.display()
            )));
        }

        let mut samples = Vec::new();
        for (label, class_name) in class_names.iter().enumerate() {
            let mut paths: Vec<PathBuf> = WalkDir::new(root.join(class_name))
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
                .map(|e| e.into_path())
                .filter(|path| is_image_file(path))
                .collect();
            paths.sort();

            debug!("Class '{}' (label {}): {} images", class_name, label, paths.len());
            samples.extend(paths.into_iter().map(|path| ImageSample { path, label }));
        }

        info!(
            "Found {} images in {} classes",
            samples.len(),
            class_names.len()
        );

        Ok(Self {
            root,
            class_names,
            samples,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    pub fn samples(&self) -> &[ImageSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Images per class, indexed by label
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.class_names.len()];
        for sample in &self.samples {
            counts[sample.label] += 1;
        }
        counts
    }

    /// Shuffle with a seed and split into (train, validation)
    ///
    /// A positive fraction keeps at least one validation sample when there
    /// is more than one image.
    pub fn split(
        &self,
        validation_fraction: f64,
        seed: u64,
    ) -> Result<(Vec<ImageSample>, Vec<ImageSample>)> {
        if !(0.0..1.0).contains(&validation_fraction) {
            return Err(ClassifierError::InvalidInput(format!(
                "validation fraction must be in [0, 1), got {}",
                validation_fraction
            )));
        }

        let mut samples = self.samples.clone();
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        samples.shuffle(&mut rng);

        let mut n_valid = (samples.len() as f64 * validation_fraction).round() as usize;
        if validation_fraction > 0.0 && n_valid == 0 && samples.len() > 1 {
            n_valid = 1;
        }

        let train = samples.split_off(n_valid);
        Ok((train, samples))
    }
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}
