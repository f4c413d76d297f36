//! Prediction Driver
//!
//! Validates the inputs, builds a positional dataset over the image paths,
//! hands it to a [`Runner`] and turns the returned entries into tables keyed
//! by the original file paths.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::dataset::burn_dataset::ImagePathDataset;
use crate::dataset::transform::{ImageLoader, Transform};
use crate::inference::runner::{DataSource, PredictionEntry, RunOutput, Runner};
use crate::model::ImageClassifier;
use crate::utils::error::{ClassifierError, Result};

/// Separator joining nested field names
pub const FIELD_SEPARATOR: &str = "_";

/// Batching parameters of a prediction call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictConfig {
    pub batch_size: usize,
    /// Decoding threads; 0 decodes on the calling thread
    pub num_workers: usize,
    pub show_progress: bool,
}

impl Default for PredictConfig {
    fn default() -> Self {
        Self {
            batch_size: 2,
            num_workers: 0,
            show_progress: false,
        }
    }
}

/// One prediction row: the source path plus flattened fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub id: PathBuf,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Prediction rows of one data source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionTable {
    /// `id` followed by every field name, in first-seen order
    pub columns: Vec<String>,
    pub records: Vec<PredictionRecord>,
}

impl PredictionTable {
    fn from_records(records: Vec<PredictionRecord>) -> Self {
        let mut columns = vec!["id".to_string()];
        let mut seen = BTreeSet::new();
        for record in &records {
            for key in record.fields.keys() {
                if seen.insert(key.clone()) {
                    columns.push(key.clone());
                }
            }
        }
        Self { columns, records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Render as CSV with a header row; missing fields are empty cells
    pub fn to_csv(&self) -> String {
        let mut csv = self
            .columns
            .iter()
            .map(|c| csv_escape(c))
            .collect::<Vec<_>>()
            .join(",");
        csv.push('\n');

        for record in &self.records {
            let row: Vec<String> = self
                .columns
                .iter()
                .map(|column| {
                    if column == "id" {
                        csv_escape(&record.id.display().to_string())
                    } else {
                        record
                            .fields
                            .get(column)
                            .map(|value| csv_escape(&cell_text(value)))
                            .unwrap_or_default()
                    }
                })
                .collect();
            csv.push_str(&row.join(","));
            csv.push('\n');
        }

        csv
    }

    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_csv())?;
        Ok(())
    }

    /// Write the records as a JSON array
    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.records)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Classify images and return one table per evaluated source
///
/// Every path must exist and a transform must be given; both are checked
/// before anything is loaded. Returns an empty list when the runner produced
/// no predictions.
pub fn predict<B, R>(
    model: &ImageClassifier<B>,
    image_paths: &[PathBuf],
    loader: Arc<dyn ImageLoader>,
    transform: Option<Arc<dyn Transform>>,
    config: &PredictConfig,
    runner: &R,
) -> Result<Vec<PredictionTable>>
where
    B: Backend,
    R: Runner<B> + ?Sized,
{
    let missing: Vec<PathBuf> = image_paths
        .iter()
        .filter(|path| !path.exists())
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(ClassifierError::MissingFiles(missing));
    }

    let transform = transform.ok_or(ClassifierError::MissingTransform)?;

    if config.batch_size == 0 {
        return Err(ClassifierError::InvalidInput(
            "batch size must be positive".to_string(),
        ));
    }

    info!(
        "Predicting {} images (batch size {}, {} workers)",
        image_paths.len(),
        config.batch_size,
        config.num_workers
    );

    let source = DataSource {
        dataset: ImagePathDataset::new(image_paths.to_vec(), loader, transform),
        batch_size: config.batch_size,
        num_workers: config.num_workers,
    };

    let outputs = runner.test(model, &[source])?;
    assemble_tables(outputs, image_paths)
}

/// Remap positional ids to paths and flatten entries into tables
pub fn assemble_tables(
    outputs: Vec<RunOutput>,
    image_paths: &[PathBuf],
) -> Result<Vec<PredictionTable>> {
    if outputs.first().map_or(true, |output| output.predictions.is_none()) {
        warn!("Runner returned no predictions; returning an empty result");
        return Ok(Vec::new());
    }

    let mut tables = Vec::with_capacity(outputs.len());
    for (source, output) in outputs.into_iter().enumerate() {
        let Some(batches) = output.predictions else {
            warn!("Source {} produced no predictions, skipping it", source);
            continue;
        };

        let records = batches
            .into_iter()
            .flatten()
            .map(|entry| to_record(entry, image_paths))
            .collect::<Result<Vec<_>>>()?;

        debug!("Source {}: {} records", source, records.len());
        tables.push(PredictionTable::from_records(records));
    }

    Ok(tables)
}

fn to_record(mut entry: PredictionEntry, image_paths: &[PathBuf]) -> Result<PredictionRecord> {
    let id = entry
        .remove("id")
        .ok_or_else(|| ClassifierError::Inference("prediction entry has no id".to_string()))?;

    let index = id
        .as_u64()
        .ok_or_else(|| ClassifierError::Inference(format!("prediction id {} is not an index", id)))?
        as usize;

    let path = image_paths.get(index).ok_or_else(|| {
        ClassifierError::Inference(format!(
            "prediction id {} out of range for {} images",
            index,
            image_paths.len()
        ))
    })?;

    Ok(PredictionRecord {
        id: path.clone(),
        fields: flatten_entry(entry),
    })
}

/// Flatten nested objects, joining keys with `_`; arrays stay values
pub fn flatten_entry(entry: Map<String, Value>) -> Map<String, Value> {
    let mut flat = Map::new();
    for (key, value) in entry {
        flatten_into(&mut flat, key, value);
    }
    flat
}

fn flatten_into(flat: &mut Map<String, Value>, key: String, value: Value) {
    match value {
        Value::Object(children) if !children.is_empty() => {
            for (child, value) in children {
                flatten_into(flat, format!("{}{}{}", key, FIELD_SEPARATOR, child), value);
            }
        }
        other => {
            flat.insert(key, other);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::transform::{ImageTensor, ResizeNormalize, RgbImageLoader};
    use crate::inference::runner::Evaluator;
    use crate::model::{assemble, BackboneRegistry, PretrainedWeights};
    use burn_ndarray::NdArray;
    use image::{DynamicImage, ImageBuffer, Rgb};
    use serde_json::json;
    use std::cell::Cell;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    /// Replays canned outputs and counts invocations
    struct ScriptedRunner {
        outputs: Vec<RunOutput>,
        calls: Cell<usize>,
    }

    impl ScriptedRunner {
        fn new(outputs: Vec<RunOutput>) -> Self {
            Self {
                outputs,
                calls: Cell::new(0),
            }
        }
    }

    impl Runner<TestBackend> for ScriptedRunner {
        fn test(
            &self,
            _model: &ImageClassifier<TestBackend>,
            sources: &[DataSource],
        ) -> Result<Vec<RunOutput>> {
            assert_eq!(sources.len(), 1);
            self.calls.set(self.calls.get() + 1);
            Ok(self.outputs.clone())
        }
    }

    fn model() -> ImageClassifier<TestBackend> {
        let registry = BackboneRegistry::new(PretrainedWeights::new("unused"));
        assemble(3, "convnet-tiny", false, &registry, &Default::default()).unwrap()
    }

    fn write_images(dir: &Path, count: usize) -> Vec<PathBuf> {
        (0..count)
            .map(|i| {
                let path = dir.join(format!("p{}.png", i));
                ImageBuffer::from_fn(10, 10, |_, _| Rgb([255u8, 0, 0]))
                    .save(&path)
                    .unwrap();
                path
            })
            .collect()
    }

    fn entry(id: usize) -> PredictionEntry {
        let value = json!({ "id": id, "score": 0.5 });
        value.as_object().unwrap().clone()
    }

    fn transform() -> Option<Arc<dyn Transform>> {
        Some(Arc::new(ResizeNormalize::imagenet(16)))
    }

    #[test]
    fn test_missing_file_stops_before_runner() {
        let temp = TempDir::new().unwrap();
        let mut paths = write_images(temp.path(), 1);
        paths.push(temp.path().join("absent.png"));
        let runner = ScriptedRunner::new(vec![]);

        let result = predict(
            &model(),
            &paths,
            Arc::new(RgbImageLoader),
            transform(),
            &PredictConfig::default(),
            &runner,
        );

        match result {
            Err(ClassifierError::MissingFiles(missing)) => {
                assert_eq!(missing, vec![temp.path().join("absent.png")]);
            }
            other => panic!("expected MissingFiles, got {:?}", other),
        }
        assert_eq!(runner.calls.get(), 0);
    }

    #[test]
    fn test_missing_transform() {
        let temp = TempDir::new().unwrap();
        let paths = write_images(temp.path(), 1);
        let runner = ScriptedRunner::new(vec![]);

        let result = predict(
            &model(),
            &paths,
            Arc::new(RgbImageLoader),
            None,
            &PredictConfig::default(),
            &runner,
        );

        assert!(matches!(result, Err(ClassifierError::MissingTransform)));
        assert_eq!(runner.calls.get(), 0);
    }

    #[test]
    fn test_ids_are_remapped_in_runner_order() {
        let temp = TempDir::new().unwrap();
        let paths = write_images(temp.path(), 3);
        let runner = ScriptedRunner::new(vec![RunOutput::with_predictions(vec![
            vec![entry(2), entry(0)],
            vec![entry(1)],
        ])]);

        let tables = predict(
            &model(),
            &paths,
            Arc::new(RgbImageLoader),
            transform(),
            &PredictConfig::default(),
            &runner,
        )
        .unwrap();

        assert_eq!(tables.len(), 1);
        let ids: Vec<&PathBuf> = tables[0].records.iter().map(|r| &r.id).collect();
        assert_eq!(ids, vec![&paths[2], &paths[0], &paths[1]]);
        assert_eq!(tables[0].columns, vec!["id".to_string(), "score".to_string()]);
    }

    #[test]
    fn test_no_predictions_is_empty() {
        let temp = TempDir::new().unwrap();
        let paths = write_images(temp.path(), 2);
        let runner = ScriptedRunner::new(vec![RunOutput::empty()]);

        let tables = predict(
            &model(),
            &paths,
            Arc::new(RgbImageLoader),
            transform(),
            &PredictConfig::default(),
            &runner,
        )
        .unwrap();

        assert!(tables.is_empty());
        assert_eq!(runner.calls.get(), 1);
    }

    #[test]
    fn test_later_source_without_predictions_is_skipped() {
        let paths = vec![PathBuf::from("a.png"), PathBuf::from("b.png")];
        let outputs = vec![
            RunOutput::with_predictions(vec![vec![entry(1), entry(0)]]),
            RunOutput::empty(),
        ];

        let tables = assemble_tables(outputs, &paths).unwrap();

        assert_eq!(tables.len(), 1);
        let ids: Vec<&PathBuf> = tables[0].records.iter().map(|r| &r.id).collect();
        assert_eq!(ids, vec![&paths[1], &paths[0]]);
    }

    #[test]
    fn test_out_of_range_id() {
        let paths = vec![PathBuf::from("a.png")];
        let outputs = vec![RunOutput::with_predictions(vec![vec![entry(4)]])];

        let result = assemble_tables(outputs, &paths);
        assert!(matches!(result, Err(ClassifierError::Inference(_))));
    }

    #[test]
    fn test_flatten_nested_fields() {
        let value = json!({
            "scores": { "cat": 0.2, "dog": { "small": 0.5, "large": 0.3 } },
            "tags": [1, 2],
            "empty": {},
            "label": "dog"
        });
        let flat = flatten_entry(value.as_object().unwrap().clone());

        assert_eq!(flat["scores_cat"], json!(0.2));
        assert_eq!(flat["scores_dog_small"], json!(0.5));
        assert_eq!(flat["scores_dog_large"], json!(0.3));
        assert_eq!(flat["tags"], json!([1, 2]));
        assert_eq!(flat["empty"], json!({}));
        assert_eq!(flat["label"], json!("dog"));
        assert!(!flat.contains_key("scores"));
    }

    #[test]
    fn test_csv_export() {
        let mut first = Map::new();
        first.insert("label".to_string(), json!("a,b"));
        first.insert("score".to_string(), json!(0.25));
        let mut second = Map::new();
        second.insert("score".to_string(), json!(1));
        second.insert("note".to_string(), json!("say \"hi\""));

        let table = PredictionTable::from_records(vec![
            PredictionRecord {
                id: PathBuf::from("x.png"),
                fields: first,
            },
            PredictionRecord {
                id: PathBuf::from("y.png"),
                fields: second,
            },
        ]);

        let csv = table.to_csv();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "id,label,score,note");
        assert_eq!(lines[1], "x.png,\"a,b\",0.25,");
        assert_eq!(lines[2], "y.png,,1,\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_json_export() {
        let temp = TempDir::new().unwrap();
        let mut fields = Map::new();
        fields.insert("score".to_string(), json!(0.5));
        let table = PredictionTable::from_records(vec![PredictionRecord {
            id: PathBuf::from("x.png"),
            fields,
        }]);

        let path = temp.path().join("out.json");
        table.write_json(&path).unwrap();

        let value: Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(value, json!([{ "id": "x.png", "score": 0.5 }]));
    }

    #[test]
    fn test_end_to_end_with_evaluator() {
        let temp = TempDir::new().unwrap();
        let paths = write_images(temp.path(), 3);
        let evaluator = Evaluator::<TestBackend>::new(Default::default());
        let config = PredictConfig {
            batch_size: 2,
            num_workers: 1,
            show_progress: false,
        };

        let tables = predict(
            &model(),
            &paths,
            Arc::new(RgbImageLoader),
            transform(),
            &config,
            &evaluator,
        )
        .unwrap();

        assert_eq!(tables.len(), 1);
        let table = &tables[0];
        assert_eq!(table.len(), 3);
        for (record, path) in table.records.iter().zip(&paths) {
            assert_eq!(&record.id, path);
            assert!(record.fields.contains_key("predicted_class"));
            assert!(record.fields.contains_key("scores_0"));
            assert!(record.fields.contains_key("scores_2"));
        }
    }

    #[test]
    fn test_custom_loader_and_transform() {
        let temp = TempDir::new().unwrap();
        let paths = write_images(temp.path(), 2);
        let evaluator = Evaluator::<TestBackend>::new(Default::default());

        let loader = |_: &Path| -> Result<DynamicImage> {
            Ok(DynamicImage::ImageRgb8(ImageBuffer::from_fn(4, 4, |_, _| {
                Rgb([0u8, 255, 0])
            })))
        };
        let transform = |_: DynamicImage| ImageTensor::new(vec![0.0; 3 * 16 * 16], [3, 16, 16]);

        let tables = predict(
            &model(),
            &paths,
            Arc::new(loader),
            Some(Arc::new(transform)),
            &PredictConfig::default(),
            &evaluator,
        )
        .unwrap();

        assert_eq!(tables[0].len(), 2);
    }
}
