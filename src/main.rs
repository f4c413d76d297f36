//! Backbone Classifier CLI
//!
//! List the registered backbones, inspect assembled classifiers, fit them on
//! a class-per-directory image folder and write prediction tables.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use burn::module::Module;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use tracing::info;
use walkdir::WalkDir;

use backbone_classifier::backend::{backend_name, default_device, DefaultBackend, TrainingBackend};
use backbone_classifier::dataset::{ResizeNormalize, IMAGE_EXTENSIONS};
use backbone_classifier::inference::{PredictConfig, PredictionTable};
use backbone_classifier::model::{assemble, BackboneRegistry, ImageClassifierConfig, DEFAULT_BACKBONE};
use backbone_classifier::training::{FitConfig, OptimizerKind, TaskConfig, DEFAULT_BATCH_SIZE, DEFAULT_EPOCHS};
use backbone_classifier::utils::logging::{init_logging, LogConfig};
use backbone_classifier::utils::{format_duration, format_number};
use backbone_classifier::ImageClassificationTask;

/// Image classification from registered CNN backbones
#[derive(Parser, Debug)]
#[command(name = "backbone_classifier")]
#[command(version)]
#[command(about = "Image classification from pretrained backbones with Burn", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List registered backbones and their feature widths
    Backbones,

    /// Assemble a classifier and print its structure
    Summary {
        /// Registered backbone name
        #[arg(short, long, default_value = DEFAULT_BACKBONE)]
        backbone: String,

        /// Number of target classes
        #[arg(short, long, default_value = "10")]
        num_classes: usize,

        /// Load pretrained backbone weights
        #[arg(long, default_value = "false")]
        pretrained: bool,
    },

    /// Fit a classifier on a class-per-directory image folder
    Train {
        /// Root directory with one subdirectory per class
        #[arg(short, long)]
        data_dir: PathBuf,

        /// Registered backbone name
        #[arg(short = 'B', long, default_value = DEFAULT_BACKBONE)]
        backbone: String,

        /// Start from randomly initialised backbone weights
        #[arg(long, default_value = "false")]
        no_pretrained: bool,

        /// Freeze the backbone trunk and fit the head only
        #[arg(long, default_value = "false")]
        freeze: bool,

        /// Number of training epochs
        #[arg(short, long, default_value_t = DEFAULT_EPOCHS)]
        epochs: usize,

        /// Batch size for training
        #[arg(short, long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,

        /// Learning rate
        #[arg(short, long, default_value = "0.001")]
        learning_rate: f64,

        /// Optimizer
        #[arg(long, value_enum, default_value = "sgd")]
        optimizer: OptimizerArg,

        /// Share of images held out for validation
        #[arg(long, default_value = "0.1")]
        validation_fraction: f64,

        /// Square input size
        #[arg(long, default_value = "224")]
        image_size: u32,

        /// Image decoding threads (0 decodes on the main thread)
        #[arg(long, default_value = "0")]
        num_workers: usize,

        /// Random seed for the split and shuffles
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Output directory for the task, checkpoints and fit report
        #[arg(short, long, default_value = "output/task")]
        output_dir: PathBuf,
    },

    /// Classify images with a saved task
    Predict {
        /// Directory written by `train`
        #[arg(short, long)]
        model_dir: PathBuf,

        /// Image files or directories of images
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Square input size
        #[arg(long, default_value = "224")]
        image_size: u32,

        /// Images per batch
        #[arg(short, long, default_value = "2")]
        batch_size: usize,

        /// Image decoding threads (0 decodes on the main thread)
        #[arg(long, default_value = "0")]
        num_workers: usize,

        /// Output file; prints to stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "csv")]
        format: OutputFormat,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OptimizerArg {
    Sgd,
    Adam,
    Adamw,
}

impl OptimizerArg {
    fn into_kind(self) -> OptimizerKind {
        match self {
            OptimizerArg::Sgd => OptimizerKind::default(),
            OptimizerArg::Adam => OptimizerKind::Adam { weight_decay: None },
            OptimizerArg::Adamw => OptimizerKind::AdamW { weight_decay: 1e-2 },
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OutputFormat {
    Csv,
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    };

    let _ = init_logging(&log_config);

    print_banner();

    match cli.command {
        Commands::Backbones => cmd_backbones()?,

        Commands::Summary {
            backbone,
            num_classes,
            pretrained,
        } => cmd_summary(&backbone, num_classes, pretrained)?,

        Commands::Train {
            data_dir,
            backbone,
            no_pretrained,
            freeze,
            epochs,
            batch_size,
            learning_rate,
            optimizer,
            validation_fraction,
            image_size,
            num_workers,
            seed,
            output_dir,
        } => {
            let model = ImageClassifierConfig::new(0)
                .with_backbone(backbone)
                .with_pretrained(!no_pretrained);
            let task = TaskConfig::new(model)
                .with_learning_rate(learning_rate)
                .with_optimizer(optimizer.into_kind());
            let fit = FitConfig {
                epochs,
                batch_size,
                num_workers,
                seed,
                validation_fraction,
                image_size,
                artifact_dir: Some(output_dir.clone()),
            };
            cmd_train(&data_dir, task, &fit, freeze, &output_dir)?;
        }

        Commands::Predict {
            model_dir,
            inputs,
            image_size,
            batch_size,
            num_workers,
            output,
            format,
        } => {
            let config = PredictConfig {
                batch_size,
                num_workers,
                show_progress: true,
            };
            cmd_predict(&model_dir, &inputs, image_size, &config, output.as_deref(), format)?;
        }
    }

    Ok(())
}

fn print_banner() {
    println!(
        "{}",
        format!(
            "\n  Backbone Classifier v{}  |  backend: {}\n",
            backbone_classifier::VERSION,
            backend_name()
        )
        .green()
        .bold()
    );
}

fn cmd_backbones() -> Result<()> {
    let registry = BackboneRegistry::<DefaultBackend>::default();
    let device = default_device();

    println!("{}", "Registered backbones".cyan().bold());
    for name in registry.names() {
        let provider = registry.lookup(&name)?;
        let network = provider.build(false, &device)?;
        println!(
            "  {:<14} {:>5} features",
            name.yellow(),
            provider.feature_width(&network)
        );
    }
    Ok(())
}

fn cmd_summary(backbone: &str, num_classes: usize, pretrained: bool) -> Result<()> {
    let registry = BackboneRegistry::<DefaultBackend>::default();
    let device = default_device();
    let model = assemble(num_classes, backbone, pretrained, &registry, &device)?;

    println!("{}", model);
    println!();
    println!("{:<16} {}", "Backbone:".cyan(), backbone);
    println!("{:<16} {}", "Feature width:".cyan(), model.feature_width());
    println!("{:<16} {}", "Classes:".cyan(), model.num_classes());
    println!(
        "{:<16} {}",
        "Parameters:".cyan(),
        format_number(model.num_params())
    );
    Ok(())
}

fn cmd_train(
    data_dir: &Path,
    mut task_config: TaskConfig,
    fit_config: &FitConfig,
    freeze: bool,
    output_dir: &Path,
) -> Result<()> {
    let folder = backbone_classifier::ImageFolder::new(data_dir)
        .with_context(|| format!("reading image folder {}", data_dir.display()))?;
    info!(
        "Found {} images in {} classes",
        folder.len(),
        folder.num_classes()
    );
    task_config.model.num_classes = folder.num_classes();

    let registry = BackboneRegistry::<TrainingBackend>::default();
    let mut task = ImageClassificationTask::new(task_config, &registry, default_device())?;
    if freeze {
        println!("{}", "Backbone trunk frozen, fitting the head only".yellow());
        task = task.freeze();
    }

    let (task, report) = task.fit_folder(&folder, fit_config)?;
    task.valid().save(output_dir)?;

    println!();
    println!("{}", "Training finished".green().bold());
    println!(
        "{:<22} {}",
        "Duration:".cyan(),
        format_duration(report.duration_secs)
    );
    if let (Some(epoch), Some(accuracy)) = (report.best_epoch, report.best_valid_accuracy) {
        println!(
            "{:<22} {:.2}% (epoch {})",
            "Best valid accuracy:".cyan(),
            accuracy * 100.0,
            epoch
        );
    }
    println!("{:<22} {}", "Saved to:".cyan(), output_dir.display());
    Ok(())
}

fn cmd_predict(
    model_dir: &Path,
    inputs: &[PathBuf],
    image_size: u32,
    config: &PredictConfig,
    output: Option<&Path>,
    format: OutputFormat,
) -> Result<()> {
    let registry = BackboneRegistry::<DefaultBackend>::default();
    let task = ImageClassificationTask::load(model_dir, &registry, default_device())?;

    let image_paths = collect_images(inputs);
    if image_paths.is_empty() {
        bail!("no images found in {:?}", inputs);
    }

    let tables = task.predict(
        &image_paths,
        Some(Arc::new(ResizeNormalize::imagenet(image_size))),
        config,
    )?;

    let Some(table) = tables.first() else {
        println!("{}", "The runner produced no predictions".yellow());
        return Ok(());
    };

    match output {
        Some(path) => {
            write_table(table, path, format)?;
            println!(
                "{} {} predictions to {}",
                "Wrote".green(),
                table.len(),
                path.display()
            );
        }
        None => match format {
            OutputFormat::Csv => print!("{}", table.to_csv()),
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&table.records)?),
        },
    }
    Ok(())
}

fn write_table(table: &PredictionTable, path: &Path, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Csv => table.write_csv(path)?,
        OutputFormat::Json => table.write_json(path)?,
    }
    Ok(())
}

/// Expand directories into their image files; files are passed through as given
fn collect_images(inputs: &[PathBuf]) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut found: Vec<PathBuf> = WalkDir::new(input)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .filter(|p| {
                    p.extension()
                        .and_then(|ext| ext.to_str())
                        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
                        .unwrap_or(false)
                })
                .collect();
            found.sort();
            paths.extend(found);
        } else {
            paths.push(input.clone());
        }
    }
    paths
}
