use crate::models::{Anchor, ComparisonType, Direction, LoopType, SENTINEL_SCORE};
use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Metric name given to records of the single-pair schema
pub const LEGACY_METRIC: &str = "overall";

const RECORD_FIELDS: [&str; 8] = [
    "item_id",
    "step",
    "anchor",
    "comparison_type",
    "direction",
    "comparison_items",
    "score",
    "reason",
];

/// One criterion of one record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TidyRow {
    pub item_id: String,
    pub step: u32,
    pub comparison_type: ComparisonType,
    pub anchor: Anchor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    pub metric: String,
    pub score: f64,
    pub reason: String,
    pub valid: bool,
}

/// Rows loaded from one eval folder, plus provenance
#[derive(Debug, Clone, Default)]
pub struct RatingsTable {
    pub eval_dir: PathBuf,
    pub rows: Vec<TidyRow>,
    pub files: Vec<PathBuf>,
    /// SHA-256 over the bytes of every file read, in file order
    pub input_hash: String,
    pub skipped_records: usize,
}

impl RatingsTable {
    /// Item id of the folder: first record's id, else the folder's parent name
    pub fn item_id(&self) -> String {
        self.rows
            .first()
            .map(|row| row.item_id.clone())
            .unwrap_or_else(|| fallback_item_id(&self.eval_dir))
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn fallback_item_id(eval_dir: &Path) -> String {
    eval_dir
        .parent()
        .and_then(|p| p.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "item".to_string())
}

/// Find eval folders for a path that is an eval folder, an item folder or an
/// experiment folder. Falls back to a recursive scan. Sorted, no duplicates.
pub fn discover_eval_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        bail!("Path not found: {}", root.display());
    }
    if !root.is_dir() {
        bail!("Not a directory: {}", root.display());
    }

    if root.file_name().is_some_and(|name| name == "eval") {
        return Ok(vec![root.to_path_buf()]);
    }

    let mut found = BTreeSet::new();
    let own = root.join("eval");
    if own.is_dir() {
        found.insert(own);
    }
    for entry in read_dir_sorted(root)? {
        let candidate = entry.join("eval");
        if candidate.is_dir() {
            found.insert(candidate);
        }
    }

    if found.is_empty() {
        scan_for_eval_dirs(root, &mut found)?;
    }

    Ok(found.into_iter().collect())
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list directory: {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect::<Vec<_>>();
    entries.sort();
    Ok(entries)
}

fn scan_for_eval_dirs(dir: &Path, found: &mut BTreeSet<PathBuf>) -> Result<()> {
    for path in read_dir_sorted(dir)? {
        if !path.is_dir() {
            continue;
        }
        if path.file_name().is_some_and(|name| name == "eval") {
            found.insert(path.clone());
        }
        scan_for_eval_dirs(&path, found)?;
    }
    Ok(())
}

/// `ratings*.json` files of an eval folder, sorted by name
pub fn ratings_files(eval_dir: &Path) -> Result<Vec<PathBuf>> {
    Ok(read_dir_sorted(eval_dir)?
        .into_iter()
        .filter(|path| {
            path.is_file()
                && path.file_name().and_then(|n| n.to_str()).is_some_and(|name| {
                    name.starts_with("ratings") && name.ends_with(".json")
                })
        })
        .collect())
}

/// Load every rating file of an eval folder into tidy rows.
///
/// Unreadable files and unusable records are logged and skipped.
pub fn load_eval_dir(eval_dir: &Path) -> Result<RatingsTable> {
    let files = ratings_files(eval_dir)?;
    let fallback_id = fallback_item_id(eval_dir);
    let mut hasher = Sha256::new();
    let mut table = RatingsTable {
        eval_dir: eval_dir.to_path_buf(),
        ..RatingsTable::default()
    };

    for path in files {
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to open {}: {}", path.display(), e);
                continue;
            }
        };
        hasher.update(&bytes);

        let parsed: Value = match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to decode JSON in {}: {}", path.display(), e);
                table.files.push(path);
                continue;
            }
        };

        let records = match parsed {
            Value::Array(items) => items,
            object @ Value::Object(_) => vec![object],
            _ => {
                warn!("Unexpected JSON structure in {}; skipping", path.display());
                table.files.push(path);
                continue;
            }
        };

        for record in &records {
            match flatten_record(record, &fallback_id) {
                Ok(rows) => table.rows.extend(rows),
                Err(reason) => {
                    warn!("Skipping record in {}: {}", path.display(), reason);
                    table.skipped_records += 1;
                }
            }
        }
        table.files.push(path);
    }

    table.input_hash = format!("{:x}", hasher.finalize());
    sort_rows(&mut table.rows);
    debug!(
        "Loaded {} rows from {} files in {} ({} records skipped)",
        table.rows.len(),
        table.files.len(),
        eval_dir.display(),
        table.skipped_records
    );
    Ok(table)
}

fn sort_rows(rows: &mut [TidyRow]) {
    rows.sort_by(|a, b| {
        (a.comparison_type, &a.metric, a.anchor, a.direction, &a.item_id, a.step).cmp(&(
            b.comparison_type,
            &b.metric,
            b.anchor,
            b.direction,
            &b.item_id,
            b.step,
        ))
    });
}

/// Turn one persisted record into one row per criterion
pub fn flatten_record(record: &Value, fallback_item_id: &str) -> Result<Vec<TidyRow>, String> {
    let object = record.as_object().ok_or("record is not an object")?;

    let item_id = object
        .get("item_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .unwrap_or(fallback_item_id)
        .to_string();
    let step = parse_step(object.get("step"))?;
    let comparison_type = object
        .get("comparison_type")
        .and_then(Value::as_str)
        .ok_or("missing comparison_type")?
        .parse::<ComparisonType>()?;
    let anchor: Anchor = object
        .get("anchor")
        .cloned()
        .ok_or("missing anchor")
        .and_then(|v| serde_json::from_value(v).map_err(|_| "unknown anchor"))?;
    let direction: Option<Direction> = object
        .get("direction")
        .and_then(|v| serde_json::from_value(v.clone()).ok());

    let row = |metric: &str, entry: &Value| -> TidyRow {
        let score = entry
            .get("score")
            .and_then(Value::as_f64)
            .unwrap_or(SENTINEL_SCORE);
        TidyRow {
            item_id: item_id.clone(),
            step,
            comparison_type,
            anchor,
            direction,
            metric: metric.to_string(),
            score,
            reason: entry
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            valid: score >= 0.0,
        }
    };

    let mut rows: Vec<TidyRow> = object
        .iter()
        .filter(|(key, value)| {
            !RECORD_FIELDS.contains(&key.as_str())
                && value.as_object().is_some_and(|v| v.contains_key("score"))
        })
        .map(|(metric, entry)| row(metric.as_str(), entry))
        .collect();

    if object.contains_key("score") {
        rows.push(row(LEGACY_METRIC, record));
    }

    if rows.is_empty() {
        return Err("record has no scored criteria".to_string());
    }
    Ok(rows)
}

fn parse_step(value: Option<&Value>) -> Result<u32, String> {
    match value {
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|s| u32::try_from(s).ok())
            .ok_or_else(|| format!("unparsable step {n}")),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map_err(|_| format!("unparsable step {s:?}")),
        Some(other) => Err(format!("unparsable step {other}")),
        None => Err("missing step".to_string()),
    }
}

/// Chart grouping: one chart per key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct GroupKey {
    pub comparison_type: ComparisonType,
    pub anchor: Anchor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
}

impl GroupKey {
    pub const fn new(
        comparison_type: ComparisonType,
        anchor: Anchor,
        direction: Option<Direction>,
    ) -> Self {
        Self {
            comparison_type,
            anchor,
            direction,
        }
    }

    pub fn of(row: &TidyRow) -> Self {
        Self::new(row.comparison_type, row.anchor, row.direction)
    }

    /// Rows without a direction match either direction
    pub fn matches(&self, row: &TidyRow) -> bool {
        self.comparison_type == row.comparison_type
            && self.anchor == row.anchor
            && (self.direction.is_none() || row.direction.is_none() || self.direction == row.direction)
    }

    pub fn label(&self) -> String {
        match self.direction {
            Some(direction) => format!("{} | {} | {}", self.comparison_type, self.anchor, direction),
            None => format!("{} | {}", self.comparison_type, self.anchor),
        }
    }
}

/// Infer the loop topology from which original-anchor groupings exist
pub fn detect_loop_type(rows: &[TidyRow]) -> LoopType {
    let has = |kind: ComparisonType| {
        rows.iter()
            .any(|r| r.comparison_type == kind && r.anchor == Anchor::Original)
    };
    match (has(ComparisonType::ImageImage), has(ComparisonType::TextText)) {
        (true, false) => LoopType::ImageTextImage,
        (false, true) => LoopType::TextImageText,
        _ => LoopType::Unknown,
    }
}

/// Groupings a complete run of the given loop type produces
pub fn expected_groups(loop_type: LoopType) -> Vec<GroupKey> {
    use Anchor::*;
    use ComparisonType::*;
    use Direction::*;

    let mut keys = Vec::new();
    match loop_type {
        LoopType::ImageTextImage => {
            keys.push(GroupKey::new(ImageImage, Original, None));
            keys.push(GroupKey::new(ImageText, Original, Some(AnchorImage)));
        }
        LoopType::TextImageText => {
            keys.push(GroupKey::new(TextText, Original, None));
            keys.push(GroupKey::new(ImageText, Original, Some(AnchorText)));
        }
        LoopType::Unknown => {
            keys.push(GroupKey::new(ImageImage, Original, None));
            keys.push(GroupKey::new(TextText, Original, None));
            keys.push(GroupKey::new(ImageText, Original, Some(AnchorImage)));
            keys.push(GroupKey::new(ImageText, Original, Some(AnchorText)));
        }
    }
    keys.push(GroupKey::new(ImageImage, Previous, None));
    keys.push(GroupKey::new(TextText, Previous, None));
    match loop_type {
        LoopType::ImageTextImage => keys.push(GroupKey::new(ImageText, Previous, Some(AnchorImage))),
        LoopType::TextImageText => keys.push(GroupKey::new(ImageText, Previous, Some(AnchorText))),
        LoopType::Unknown => {
            keys.push(GroupKey::new(ImageText, Previous, Some(AnchorImage)));
            keys.push(GroupKey::new(ImageText, Previous, Some(AnchorText)));
        }
    }
    keys.push(GroupKey::new(ImageText, SameStep, None));
    keys
}

/// Expected groupings without a single valid row
pub fn missing_groups(rows: &[TidyRow], loop_type: LoopType) -> Vec<GroupKey> {
    expected_groups(loop_type)
        .into_iter()
        .filter(|key| !rows.iter().any(|row| row.valid && key.matches(row)))
        .collect()
}

/// Detect the loop type and log every expected grouping without valid data
pub fn report_missing_groups(rows: &[TidyRow]) -> (LoopType, Vec<GroupKey>) {
    let loop_type = detect_loop_type(rows);
    let missing = missing_groups(rows, loop_type);
    if !missing.is_empty() {
        warn!("Loop type detected: {}", loop_type);
        for key in &missing {
            warn!("No valid data for grouping {}", key.label());
        }
    }
    (loop_type, missing)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeSummary {
    pub best_metric: String,
    pub best_mean: f64,
    pub most_volatile_metric: Option<String>,
    pub most_volatile_std: Option<f64>,
    pub top_anchor: Anchor,
    pub top_anchor_mean: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeltaRow {
    pub item_id: String,
    pub comparison_type: ComparisonType,
    pub metric: String,
    pub anchor: Anchor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    pub step: u32,
    pub prev_score: f64,
    pub score: f64,
    pub delta: f64,
    pub reason: String,
}

/// Mean and spread of valid scores across items at one step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StabilityRow {
    pub comparison_type: ComparisonType,
    pub metric: String,
    pub step: u32,
    pub mean: f64,
    /// Sample standard deviation; absent with fewer than two observations
    pub std: Option<f64>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AvailabilityRow {
    pub comparison_type: ComparisonType,
    pub metric: String,
    pub step: u32,
    pub valid: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnchorMetricRow {
    pub comparison_type: ComparisonType,
    pub metric: String,
    pub anchor: Anchor,
    pub mean: f64,
}

/// Everything the renderers need, derived from tidy rows only
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Aggregates {
    pub total_rows: usize,
    pub valid_rows: usize,
    pub coverage: f64,
    pub loop_type: LoopType,
    pub by_type: BTreeMap<ComparisonType, TypeSummary>,
    pub deltas: Vec<DeltaRow>,
    pub top_drops: Vec<DeltaRow>,
    pub stability: Vec<StabilityRow>,
    pub availability: Vec<AvailabilityRow>,
    pub anchor_vs_metric: Vec<AnchorMetricRow>,
    pub missing_groups: Vec<GroupKey>,
}

/// Compute every statistic over `rows`. Sentinel rows count toward coverage only.
pub fn aggregate(rows: &[TidyRow], top_n: usize) -> Aggregates {
    let valid: Vec<&TidyRow> = rows.iter().filter(|r| r.valid).collect();
    let coverage = if rows.is_empty() {
        0.0
    } else {
        valid.len() as f64 / rows.len() as f64
    };

    let (loop_type, missing) = report_missing_groups(rows);

    let deltas = compute_deltas(&valid);
    let top_drops = top_drops(&deltas, top_n);

    Aggregates {
        total_rows: rows.len(),
        valid_rows: valid.len(),
        coverage,
        loop_type,
        by_type: summarize_types(&valid),
        deltas,
        top_drops,
        stability: compute_stability(&valid),
        availability: compute_availability(rows),
        anchor_vs_metric: compute_anchor_vs_metric(&valid),
        missing_groups: missing,
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Sample standard deviation (n - 1)
fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let variance =
        values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(variance.sqrt())
}

/// Largest value; ties keep the first key in map order
fn argmax<K: Clone>(values: impl IntoIterator<Item = (K, f64)>) -> Option<(K, f64)> {
    let mut best: Option<(K, f64)> = None;
    for (key, value) in values {
        if best.as_ref().is_none_or(|(_, current)| value > *current) {
            best = Some((key, value));
        }
    }
    best
}

fn summarize_types(valid: &[&TidyRow]) -> BTreeMap<ComparisonType, TypeSummary> {
    let mut by_metric: BTreeMap<ComparisonType, BTreeMap<&str, Vec<f64>>> = BTreeMap::new();
    let mut by_anchor: BTreeMap<ComparisonType, BTreeMap<Anchor, Vec<f64>>> = BTreeMap::new();
    for row in valid {
        by_metric
            .entry(row.comparison_type)
            .or_default()
            .entry(row.metric.as_str())
            .or_default()
            .push(row.score);
        by_anchor
            .entry(row.comparison_type)
            .or_default()
            .entry(row.anchor)
            .or_default()
            .push(row.score);
    }

    let mut summaries = BTreeMap::new();
    for (kind, metrics) in &by_metric {
        let best = argmax(
            metrics
                .iter()
                .filter_map(|(metric, scores)| mean(scores).map(|m| (*metric, m))),
        );
        let volatile = argmax(
            metrics
                .iter()
                .filter_map(|(metric, scores)| sample_std(scores).map(|s| (*metric, s))),
        );
        let anchor = by_anchor.get(kind).and_then(|anchors| {
            argmax(
                anchors
                    .iter()
                    .filter_map(|(anchor, scores)| mean(scores).map(|m| (*anchor, m))),
            )
        });

        if let (Some((best_metric, best_mean)), Some((top_anchor, top_anchor_mean))) = (best, anchor) {
            summaries.insert(
                *kind,
                TypeSummary {
                    best_metric: best_metric.to_string(),
                    best_mean,
                    most_volatile_metric: volatile.map(|(metric, _)| metric.to_string()),
                    most_volatile_std: volatile.map(|(_, std)| std),
                    top_anchor,
                    top_anchor_mean,
                },
            );
        }
    }
    summaries
}

/// Step-to-step change per (item, type, metric, anchor, direction) series.
/// The first point of a series has delta 0.
pub fn compute_deltas(valid: &[&TidyRow]) -> Vec<DeltaRow> {
    type SeriesKey<'a> = (&'a str, ComparisonType, &'a str, Anchor, Option<Direction>);
    let mut series: BTreeMap<SeriesKey, Vec<&TidyRow>> = BTreeMap::new();
    for row in valid {
        series
            .entry((
                row.item_id.as_str(),
                row.comparison_type,
                row.metric.as_str(),
                row.anchor,
                row.direction,
            ))
            .or_default()
            .push(row);
    }

    let mut deltas = Vec::new();
    for (_, mut points) in series {
        points.sort_by_key(|row| row.step);
        let mut previous: Option<f64> = None;
        for row in points {
            let prev_score = previous.unwrap_or(row.score);
            deltas.push(DeltaRow {
                item_id: row.item_id.clone(),
                comparison_type: row.comparison_type,
                metric: row.metric.clone(),
                anchor: row.anchor,
                direction: row.direction,
                step: row.step,
                prev_score,
                score: row.score,
                delta: row.score - prev_score,
                reason: row.reason.clone(),
            });
            previous = Some(row.score);
        }
    }
    deltas
}

/// The `n` most negative deltas across the whole run
pub fn top_drops(deltas: &[DeltaRow], n: usize) -> Vec<DeltaRow> {
    let mut drops: Vec<DeltaRow> = deltas.iter().filter(|d| d.delta < 0.0).cloned().collect();
    drops.sort_by(|a, b| a.delta.total_cmp(&b.delta));
    drops.truncate(n);
    drops
}

fn compute_stability(valid: &[&TidyRow]) -> Vec<StabilityRow> {
    let mut groups: BTreeMap<(ComparisonType, &str, u32), Vec<f64>> = BTreeMap::new();
    for row in valid {
        groups
            .entry((row.comparison_type, row.metric.as_str(), row.step))
            .or_default()
            .push(row.score);
    }
    groups
        .into_iter()
        .filter_map(|((comparison_type, metric, step), scores)| {
            Some(StabilityRow {
                comparison_type,
                metric: metric.to_string(),
                step,
                mean: mean(&scores)?,
                std: sample_std(&scores),
                count: scores.len(),
            })
        })
        .collect()
}

/// Valid observation counts per step, including steps where every rating failed
fn compute_availability(rows: &[TidyRow]) -> Vec<AvailabilityRow> {
    let mut groups: BTreeMap<(ComparisonType, &str, u32), (usize, usize)> = BTreeMap::new();
    for row in rows {
        let counts = groups
            .entry((row.comparison_type, row.metric.as_str(), row.step))
            .or_default();
        counts.1 += 1;
        if row.valid {
            counts.0 += 1;
        }
    }
    groups
        .into_iter()
        .map(|((comparison_type, metric, step), (valid, total))| AvailabilityRow {
            comparison_type,
            metric: metric.to_string(),
            step,
            valid,
            total,
        })
        .collect()
}

fn compute_anchor_vs_metric(valid: &[&TidyRow]) -> Vec<AnchorMetricRow> {
    let mut groups: BTreeMap<(ComparisonType, &str, Anchor), Vec<f64>> = BTreeMap::new();
    for row in valid {
        groups
            .entry((row.comparison_type, row.metric.as_str(), row.anchor))
            .or_default()
            .push(row.score);
    }
    groups
        .into_iter()
        .filter_map(|((comparison_type, metric, anchor), scores)| {
            Some(AnchorMetricRow {
                comparison_type,
                metric: metric.to_string(),
                anchor,
                mean: mean(&scores)?,
            })
        })
        .collect()
}
