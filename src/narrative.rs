use crate::aggregate::{RatingsTable, TidyRow};
use crate::llm::{ContentPart, ContentRequest, ModelClient};
use crate::models::CRITERIA;
use anyhow::{Context, Result, bail};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use tracing::info;

pub const SUMMARY_FILE: &str = "qualitative_summary.txt";
pub const NO_DATA_TEXT: &str = "No evaluation data available.";

const SYSTEM_PROMPT: &str = "You are an analyst reviewing how generated content drifted over \
    repeated generation steps. From the numeric synopsis and the per-step reasons, write one \
    connected narrative covering what changed, why it changed, why it matters and what to try \
    next. Write prose, not lists or JSON. Only use numbers that already appear in the synopsis.";

/// Below this range a series counts as flat
const STABLE_RANGE: f64 = 0.2;

/// Shape of a per-step series
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    Stable,
    Monotonic,
    Oscillating,
    StepChange,
}

impl Pattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pattern::Stable => "stable",
            Pattern::Monotonic => "monotonic",
            Pattern::Oscillating => "oscillating",
            Pattern::StepChange => "step-change",
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magnitude {
    Small,
    Moderate,
    Large,
}

impl Magnitude {
    pub fn as_str(&self) -> &'static str {
        match self {
            Magnitude::Small => "small",
            Magnitude::Moderate => "moderate",
            Magnitude::Large => "large",
        }
    }
}

impl fmt::Display for Magnitude {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn classify_pattern(values: &[f64]) -> Pattern {
    let (min, max) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    if values.is_empty() || max - min < STABLE_RANGE {
        return Pattern::Stable;
    }

    let diffs: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
    if diffs.iter().all(|d| *d >= 0.0) || diffs.iter().all(|d| *d <= 0.0) {
        return Pattern::Monotonic;
    }

    let sign_changes = diffs.windows(2).filter(|w| w[0] * w[1] < 0.0).count();
    if sign_changes >= 2 {
        Pattern::Oscillating
    } else {
        Pattern::StepChange
    }
}

pub fn magnitude(delta: f64) -> Magnitude {
    let delta = delta.abs();
    if delta < 0.5 {
        Magnitude::Small
    } else if delta < 1.5 {
        Magnitude::Moderate
    } else {
        Magnitude::Large
    }
}

fn display_name(metric: &str) -> String {
    metric.replace('_', " ")
}

/// Canonical criteria first, then any other metric by name
fn metric_order(rows: &[TidyRow]) -> Vec<String> {
    let present: BTreeSet<&str> = rows.iter().map(|r| r.metric.as_str()).collect();
    let mut ordered: Vec<String> = CRITERIA
        .iter()
        .filter(|c| present.contains(*c))
        .map(|c| c.to_string())
        .collect();
    ordered.extend(
        present
            .into_iter()
            .filter(|m| !CRITERIA.contains(m))
            .map(str::to_string),
    );
    ordered
}

fn join_or_none<I: IntoIterator<Item = String>>(values: I) -> String {
    let joined = values.into_iter().collect::<Vec<_>>().join(", ");
    if joined.is_empty() { "none".to_string() } else { joined }
}

/// Header, numeric synopsis and per-step reasons for the narrative model
pub fn build_prompt(table: &RatingsTable) -> String {
    let rows = &table.rows;
    let run_id = table
        .eval_dir
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let steps: BTreeSet<u32> = rows.iter().map(|r| r.step).collect();
    let kinds: BTreeSet<String> = rows.iter().map(|r| r.comparison_type.to_string()).collect();
    let anchors: BTreeSet<String> = rows.iter().map(|r| r.anchor.to_string()).collect();

    let header = [
        format!("Run id: {run_id}"),
        format!("Steps: {}", join_or_none(steps.iter().map(u32::to_string))),
        format!("Comparison types: {}", join_or_none(kinds)),
        format!("Anchors: {}", join_or_none(anchors)),
    ]
    .join("\n");

    let mut synopsis = Vec::new();
    let mut reasons = Vec::new();
    for metric in metric_order(rows) {
        let mut per_step: BTreeMap<u32, (f64, usize)> = BTreeMap::new();
        let mut first_reason: BTreeMap<u32, &str> = BTreeMap::new();
        for row in rows.iter().filter(|r| r.valid && r.metric == metric) {
            let slot = per_step.entry(row.step).or_insert((0.0, 0));
            slot.0 += row.score;
            slot.1 += 1;
            let reason = row.reason.trim();
            if !reason.is_empty() {
                first_reason.entry(row.step).or_insert(reason);
            }
        }

        let means: Vec<f64> = per_step.values().map(|(sum, n)| sum / *n as f64).collect();
        if let (Some(start), Some(end)) = (means.first(), means.last()) {
            synopsis.push(format!(
                "* {}: {start:.1} → {end:.1} ({}), pattern: {}",
                display_name(&metric),
                magnitude(end - start),
                classify_pattern(&means)
            ));
        }

        if !first_reason.is_empty() {
            reasons.push(format!("{}:", display_name(&metric)));
            for (step, reason) in first_reason {
                reasons.push(format!("  step {step}: {reason}"));
            }
        }
    }

    let synopsis = if synopsis.is_empty() {
        "Numeric synopsis: none".to_string()
    } else {
        format!("Numeric synopsis:\n{}", synopsis.join("\n"))
    };
    let reasons = if reasons.is_empty() {
        "Reasons: none".to_string()
    } else {
        format!("Reasons:\n{}", reasons.join("\n"))
    };

    [header, synopsis, reasons].join("\n\n")
}

/// Write `qualitative_summary.txt` for one eval folder and return its text.
///
/// A folder without records gets a fixed notice and the model is not called.
/// Otherwise a client is required.
pub async fn write_summary(
    table: &RatingsTable,
    client: Option<&dyn ModelClient>,
) -> Result<(PathBuf, String)> {
    let summary = if table.is_empty() {
        NO_DATA_TEXT.to_string()
    } else {
        let Some(client) = client else {
            bail!("No API key available for the narrative model");
        };
        let request = ContentRequest {
            system: Some(SYSTEM_PROMPT.to_string()),
            parts: vec![ContentPart::text(build_prompt(table))],
            response_schema: None,
        };
        client
            .generate_content(request)
            .await
            .context("Narrative generation failed")?
            .trim()
            .to_string()
    };

    std::fs::create_dir_all(&table.eval_dir)
        .with_context(|| format!("Failed to create directory: {}", table.eval_dir.display()))?;
    let path = table.eval_dir.join(SUMMARY_FILE);
    std::fs::write(&path, &summary)
        .with_context(|| format!("Failed to write summary: {}", path.display()))?;

    info!("Qualitative summary written to {}", path.display());
    Ok((path, summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::load_eval_dir;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct RecordingClient {
        requests: Mutex<Vec<ContentRequest>>,
    }

    impl RecordingClient {
        fn new() -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ModelClient for RecordingClient {
        async fn generate_content(&self, request: ContentRequest) -> Result<String> {
            self.requests.lock().unwrap().push(request);
            Ok("  The fox slowly faded.  ".to_string())
        }
    }

    fn fox_table() -> (tempfile::TempDir, RatingsTable) {
        let root = tempdir().unwrap();
        let eval_dir = root.path().join("exp_025").join("eval");
        std::fs::create_dir_all(&eval_dir).unwrap();
        let record = |step: u32, score: i32, reason: &str| {
            json!({
                "item_id": "fox", "step": step, "anchor": "original", "comparison_type": "image-image",
                "comparison_items": ["a.png", "b.png"],
                "content_correspondence": {"score": score, "reason": reason}
            })
        };
        std::fs::write(
            eval_dir.join("ratings_image-image.json"),
            json!([
                record(1, 9, "fox intact"),
                record(2, 7, "fox smaller"),
                record(3, -1, "Rating unavailable"),
                record(4, 4, "fox gone")
            ])
            .to_string(),
        )
        .unwrap();
        let table = load_eval_dir(&eval_dir).unwrap();
        (root, table)
    }

    #[test]
    fn test_classify_pattern() {
        assert_eq!(classify_pattern(&[]), Pattern::Stable);
        assert_eq!(classify_pattern(&[5.0, 5.1, 5.05]), Pattern::Stable);
        assert_eq!(classify_pattern(&[9.0, 7.0, 7.0, 4.0]), Pattern::Monotonic);
        assert_eq!(classify_pattern(&[5.0, 8.0, 4.0, 9.0]), Pattern::Oscillating);
        assert_eq!(classify_pattern(&[5.0, 8.0, 4.0, 3.0]), Pattern::StepChange);
    }

    #[test]
    fn test_magnitude_buckets() {
        assert_eq!(magnitude(0.49), Magnitude::Small);
        assert_eq!(magnitude(-0.5), Magnitude::Moderate);
        assert_eq!(magnitude(1.49), Magnitude::Moderate);
        assert_eq!(magnitude(-5.0), Magnitude::Large);
    }

    #[test]
    fn test_build_prompt_synopsis_and_reasons() {
        let (_root, table) = fox_table();
        let prompt = build_prompt(&table);

        assert!(prompt.starts_with("Run id: exp_025\nSteps: 1, 2, 3, 4\n"));
        assert!(prompt.contains("Comparison types: image-image"));
        assert!(prompt.contains("Anchors: original"));
        assert!(prompt.contains("* content correspondence: 9.0 → 4.0 (large), pattern: monotonic"));
        assert!(prompt.contains("  step 2: fox smaller"));
        assert!(!prompt.contains("Rating unavailable"));
    }

    #[tokio::test]
    async fn test_write_summary_calls_model() {
        let (_root, table) = fox_table();
        let client = RecordingClient::new();

        let (path, text) = write_summary(&table, Some(&client as &dyn ModelClient)).await.unwrap();

        assert_eq!(text, "The fox slowly faded.");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), text);
        let requests = client.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].system.as_deref(), Some(SYSTEM_PROMPT));
    }

    #[tokio::test]
    async fn test_empty_folder_skips_model() {
        let root = tempdir().unwrap();
        let eval_dir = root.path().join("run").join("eval");
        std::fs::create_dir_all(&eval_dir).unwrap();
        let table = load_eval_dir(&eval_dir).unwrap();
        let client = RecordingClient::new();

        let (path, text) = write_summary(&table, Some(&client as &dyn ModelClient)).await.unwrap();

        assert_eq!(text, NO_DATA_TEXT);
        assert_eq!(std::fs::read_to_string(path).unwrap(), NO_DATA_TEXT);
        assert!(client.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_client_is_fatal_with_data() {
        let (_root, table) = fox_table();
        assert!(write_summary(&table, None).await.is_err());
        assert!(!table.eval_dir.join(SUMMARY_FILE).exists());
    }
}
