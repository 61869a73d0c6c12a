use crate::error::EvalError;
use crate::models::{
    ComparisonType, ExperimentMetadata, ItemRecord, LoopType, Rating, RatingRecord,
};
use crate::planner::{PlannedComparison, plan_item};
use crate::rater::Rater;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const METADATA_FILE: &str = "metadata.json";
pub const EVAL_DIR: &str = "eval";

/// What one evaluation run produced
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub exp_root: PathBuf,
    pub loop_type: LoopType,
    pub items: usize,
    pub records_by_type: BTreeMap<ComparisonType, usize>,
    pub valid_records: usize,
    /// Records holding the sentinel rating
    pub defaulted_records: usize,
    pub files_written: Vec<PathBuf>,
}

impl RunSummary {
    pub fn total_records(&self) -> usize {
        self.valid_records + self.defaulted_records
    }

    fn absorb(&mut self, records: &[RatingRecord]) {
        for record in records {
            *self.records_by_type.entry(record.comparison_type).or_default() += 1;
            if record.rating.is_unavailable() {
                self.defaulted_records += 1;
            } else {
                self.valid_records += 1;
            }
        }
    }
}

/// Runs the planner and rater over every item of an experiment
pub struct EvaluationEngine {
    exp_root: PathBuf,
    loop_type: LoopType,
    rater: Rater,
}

impl EvaluationEngine {
    pub fn new(exp_root: impl Into<PathBuf>, loop_type: LoopType, rater: Rater) -> Self {
        Self {
            exp_root: exp_root.into(),
            loop_type,
            rater,
        }
    }

    /// Read and parse `<exp_root>/metadata.json`
    pub fn load_metadata(&self) -> Result<ExperimentMetadata, EvalError> {
        if !self.exp_root.is_dir() {
            return Err(EvalError::InvalidExperimentRoot(self.exp_root.clone()));
        }

        let path = self.exp_root.join(METADATA_FILE);
        let content = std::fs::read_to_string(&path)
            .map_err(|_| EvalError::MetadataNotFound(self.exp_root.clone()))?;

        serde_json::from_str(&content).map_err(|e| EvalError::MalformedMetadata {
            path,
            reason: e.to_string(),
        })
    }

    /// Evaluate every item in metadata order.
    ///
    /// Items already written stay on disk if a later item fails.
    pub async fn run(&mut self) -> Result<RunSummary> {
        let metadata = self.load_metadata()?;
        info!(
            "Evaluating {} items under {} (loop type {})",
            metadata.len(),
            self.exp_root.display(),
            self.loop_type
        );

        let mut summary = RunSummary {
            exp_root: self.exp_root.clone(),
            loop_type: self.loop_type,
            items: metadata.len(),
            ..RunSummary::default()
        };

        let total_items = metadata.len();
        for (item_num, (item_id, record)) in metadata.iter().enumerate() {
            info!("Item {}/{}: {}", item_num + 1, total_items, item_id);
            let records = self
                .evaluate_item(item_id, record)
                .await
                .with_context(|| format!("Failed to evaluate item {item_id}"))?;
            summary.absorb(&records);
            let written = self.store_ratings(item_id, &records)?;
            summary.files_written.extend(written);
        }

        info!(
            "Recorded {} ratings ({} valid, {} unavailable)",
            summary.total_records(),
            summary.valid_records,
            summary.defaulted_records
        );
        Ok(summary)
    }

    /// Rate every planned comparison for one item, in plan order
    pub async fn evaluate_item(
        &mut self,
        item_id: &str,
        record: &ItemRecord,
    ) -> Result<Vec<RatingRecord>> {
        let plan = plan_item(self.loop_type, record).map_err(|reason| {
            EvalError::MalformedMetadata {
                path: self.exp_root.join(METADATA_FILE),
                reason: format!("item {item_id}: {reason}"),
            }
        })?;

        let item_dir = self.exp_root.join(item_id);
        let total = plan.len();
        let mut records = Vec::with_capacity(total);

        for (index, planned) in plan.into_iter().enumerate() {
            debug!(
                "  → {}/{} step {} {} vs {} ({})",
                index + 1,
                total,
                planned.step,
                planned.item_a,
                planned.item_b,
                planned.kind
            );
            let rating = self
                .rater
                .rate(
                    planned.kind,
                    &item_dir.join(&planned.item_a),
                    &item_dir.join(&planned.item_b),
                )
                .await?;
            records.push(package(item_id, planned, rating));
        }

        Ok(records)
    }

    /// Write one `ratings_<type>.json` per comparison type present and
    /// remove ratings files of types this run did not produce
    fn store_ratings(&self, item_id: &str, records: &[RatingRecord]) -> Result<Vec<PathBuf>> {
        let eval_dir = self.exp_root.join(item_id).join(EVAL_DIR);
        ensure_directory_exists(&eval_dir)?;

        let mut grouped: BTreeMap<ComparisonType, Vec<&RatingRecord>> = BTreeMap::new();
        for record in records {
            grouped.entry(record.comparison_type).or_default().push(record);
        }

        for kind in ComparisonType::ALL {
            let stale = eval_dir.join(kind.ratings_file_name());
            if !grouped.contains_key(&kind) && stale.exists() {
                std::fs::remove_file(&stale).with_context(|| {
                    format!("Failed to remove stale ratings: {}", stale.display())
                })?;
                debug!("Removed stale ratings file: {}", stale.display());
            }
        }

        let mut written = Vec::new();
        for (kind, group) in grouped {
            let path = eval_dir.join(kind.ratings_file_name());
            let json_content = serde_json::to_string_pretty(&group)
                .context("Failed to serialize ratings to JSON")?;
            std::fs::write(&path, json_content)
                .with_context(|| format!("Failed to write ratings to: {}", path.display()))?;
            debug!("Ratings stored to: {}", path.display());
            written.push(path);
        }
        Ok(written)
    }
}

fn package(item_id: &str, planned: PlannedComparison, rating: Rating) -> RatingRecord {
    RatingRecord {
        item_id: item_id.to_string(),
        step: planned.step,
        anchor: planned.anchor,
        comparison_type: planned.kind,
        direction: planned.direction,
        comparison_items: [basename(&planned.item_a), basename(&planned.item_b)],
        rating,
    }
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

fn ensure_directory_exists(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EvaluationConfig;
    use crate::llm::{ContentRequest, ModelClient};
    use crate::models::{Anchor, CRITERIA, Direction};
    use crate::rater::RaterBackend;
    use async_trait::async_trait;
    use serde_json::{Map, Value, json};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{TempDir, tempdir};

    /// Scores every criterion with the same value
    struct FixedScoreClient {
        score: f64,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ModelClient for FixedScoreClient {
        async fn generate_content(&self, _request: ContentRequest) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let body: Map<String, Value> = CRITERIA
                .iter()
                .map(|c| (c.to_string(), json!({"score": self.score, "reason": "same scene"})))
                .collect();
            Ok(Value::Object(body).to_string())
        }
    }

    fn write_image(path: &Path) {
        image::RgbImage::from_pixel(3, 3, image::Rgb([10, 120, 40]))
            .save(path)
            .unwrap();
    }

    /// Item "a" with an image input and `iterations` completed iterations
    fn image_experiment(iterations: u32) -> TempDir {
        let root = tempdir().unwrap();
        let item = root.path().join("a");
        std::fs::create_dir_all(&item).unwrap();
        write_image(&item.join("input.jpg"));

        let mut record = Map::new();
        record.insert("input".to_string(), json!("input.jpg"));
        for i in 1..=iterations {
            write_image(&item.join(format!("iter{i}.png")));
            std::fs::write(item.join(format!("iter{i}.txt")), format!("caption {i}")).unwrap();
            record.insert(format!("iter{i}_img"), json!(format!("iter{i}.png")));
            record.insert(format!("iter{i}_text"), json!(format!("iter{i}.txt")));
        }
        let metadata = json!({ "a": record });
        std::fs::write(root.path().join(METADATA_FILE), metadata.to_string()).unwrap();
        root
    }

    fn llm_engine(root: &Path, loop_type: LoopType, score: f64) -> (EvaluationEngine, Arc<FixedScoreClient>) {
        let client = Arc::new(FixedScoreClient {
            score,
            calls: AtomicUsize::new(0),
        });
        let rater = Rater::new(RaterBackend::Llm(client.clone()), &EvaluationConfig::default());
        (EvaluationEngine::new(root, loop_type, rater), client)
    }

    fn read_records(path: &Path) -> Vec<RatingRecord> {
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_two_iteration_image_loop_persists_by_type() {
        let root = image_experiment(2);
        let (mut engine, client) = llm_engine(root.path(), LoopType::ImageTextImage, 5.0);

        let summary = engine.run().await.unwrap();

        let eval_dir = root.path().join("a").join(EVAL_DIR);
        let image_image = read_records(&eval_dir.join("ratings_image-image.json"));
        let text_text = read_records(&eval_dir.join("ratings_text-text.json"));
        let image_text = read_records(&eval_dir.join("ratings_image-text.json"));
        assert_eq!(image_image.len(), 3);
        assert_eq!(text_text.len(), 1);
        assert_eq!(image_text.len(), 5);
        assert!(!eval_dir.join("ratings_text-image.json").exists());

        assert_eq!(client.calls.load(Ordering::SeqCst), 9);
        assert_eq!(summary.items, 1);
        assert_eq!(summary.valid_records, 9);
        assert_eq!(summary.defaulted_records, 0);
        assert_eq!(summary.files_written.len(), 3);
        assert_eq!(summary.records_by_type[&ComparisonType::ImageText], 5);

        for record in image_image.iter().chain(&text_text).chain(&image_text) {
            assert_eq!(record.item_id, "a");
            for criterion in CRITERIA {
                assert_eq!(record.rating.get(criterion).unwrap().score, 5.0);
            }
        }
    }

    #[tokio::test]
    async fn test_records_use_basenames_and_plan_order() {
        let root = image_experiment(2);
        let (mut engine, _) = llm_engine(root.path(), LoopType::ImageTextImage, 6.0);
        engine.run().await.unwrap();

        let image_text =
            read_records(&root.path().join("a").join(EVAL_DIR).join("ratings_image-text.json"));
        let shape: Vec<(u32, Anchor, Option<Direction>, [&str; 2])> = image_text
            .iter()
            .map(|r| {
                (
                    r.step,
                    r.anchor,
                    r.direction,
                    [r.comparison_items[0].as_str(), r.comparison_items[1].as_str()],
                )
            })
            .collect();

        assert_eq!(
            shape,
            vec![
                (1, Anchor::Original, Some(Direction::AnchorImage), ["input.jpg", "iter1.txt"]),
                (1, Anchor::SameStep, None, ["iter1.png", "iter1.txt"]),
                (2, Anchor::Original, Some(Direction::AnchorImage), ["input.jpg", "iter2.txt"]),
                (2, Anchor::Previous, Some(Direction::AnchorImage), ["iter1.png", "iter2.txt"]),
                (2, Anchor::SameStep, None, ["iter2.png", "iter2.txt"]),
            ]
        );
    }

    #[tokio::test]
    async fn test_rerun_removes_ratings_of_unplanned_types() {
        let root = image_experiment(1);
        let eval_dir = root.path().join("a").join(EVAL_DIR);

        let (mut engine, _) = llm_engine(root.path(), LoopType::Unknown, 5.0);
        engine.run().await.unwrap();
        assert!(eval_dir.join("ratings_text-text.json").exists());

        let (mut engine, _) = llm_engine(root.path(), LoopType::ImageTextImage, 5.0);
        let summary = engine.run().await.unwrap();

        let mut names: Vec<String> = std::fs::read_dir(&eval_dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        let mut expected: Vec<String> = summary
            .records_by_type
            .keys()
            .map(|kind| kind.ratings_file_name())
            .collect();
        expected.sort();
        assert_eq!(names, expected);
        assert!(!eval_dir.join("ratings_text-text.json").exists());

        let table = crate::aggregate::load_eval_dir(&eval_dir).unwrap();
        assert_eq!(
            crate::aggregate::detect_loop_type(&table.rows),
            LoopType::ImageTextImage
        );
    }

    #[tokio::test]
    async fn test_unavailable_rater_records_sentinels() {
        let root = image_experiment(1);
        let rater = Rater::new(RaterBackend::Unavailable, &EvaluationConfig::default());
        let mut engine = EvaluationEngine::new(root.path(), LoopType::ImageTextImage, rater);

        let summary = engine.run().await.unwrap();
        assert_eq!(summary.valid_records, 0);
        assert_eq!(summary.defaulted_records, 3);

        let records =
            read_records(&root.path().join("a").join(EVAL_DIR).join("ratings_image-image.json"));
        assert!(records[0].rating.is_unavailable());
    }

    #[tokio::test]
    async fn test_missing_metadata_is_fatal() {
        let root = tempdir().unwrap();
        let (mut engine, _) = llm_engine(root.path(), LoopType::Unknown, 5.0);

        let err = engine.run().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EvalError>(),
            Some(EvalError::MetadataNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_metadata_is_fatal() {
        let root = tempdir().unwrap();
        std::fs::write(root.path().join(METADATA_FILE), "{\"a\": [1, 2").unwrap();
        let (mut engine, _) = llm_engine(root.path(), LoopType::Unknown, 5.0);

        let err = engine.run().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EvalError>(),
            Some(EvalError::MalformedMetadata { .. })
        ));
    }

    #[tokio::test]
    async fn test_iteration_without_text_is_malformed() {
        let root = tempdir().unwrap();
        std::fs::write(
            root.path().join(METADATA_FILE),
            r#"{"a": {"input": "input.jpg", "iter1_img": "iter1.png"}}"#,
        )
        .unwrap();
        let (mut engine, client) = llm_engine(root.path(), LoopType::ImageTextImage, 5.0);

        let err = engine.run().await.unwrap_err();
        assert!(format!("{err:#}").contains("missing its text entry"));
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_experiment_root_must_be_directory() {
        let root = tempdir().unwrap();
        let file = root.path().join("not-a-dir");
        std::fs::write(&file, "x").unwrap();
        let (mut engine, _) = llm_engine(&file, LoopType::Unknown, 5.0);

        let err = engine.run().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EvalError>(),
            Some(EvalError::InvalidExperimentRoot(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_asset_aborts_run() {
        let root = image_experiment(1);
        std::fs::remove_file(root.path().join("a").join("iter1.png")).unwrap();
        let (mut engine, _) = llm_engine(root.path(), LoopType::ImageTextImage, 5.0);

        let err = engine.run().await.unwrap_err();
        let missing = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<EvalError>());
        assert!(matches!(missing, Some(EvalError::MissingAsset { .. })));
        assert!(!root.path().join("a").join(EVAL_DIR).exists());
    }

    #[test]
    fn test_basename_strips_directories() {
        assert_eq!(basename("nested/dir/iter3.png"), "iter3.png");
        assert_eq!(basename("input.txt"), "input.txt");
    }
}
