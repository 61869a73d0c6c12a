use crate::error::EvalError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Canonical criterion set of the five-criterion schema
pub const CRITERIA: [&str; 5] = [
    "content_correspondence",
    "compositional_alignment",
    "fidelity_completeness",
    "stylistic_congruence",
    "overall_semantic_intent",
];

/// Score marking a judgment that could not be obtained
pub const SENTINEL_SCORE: f64 = -1.0;

/// Reason attached to every sentinel criterion
pub const UNAVAILABLE_REASON: &str = "Rating unavailable";

/// Canonical criterion names as owned strings
pub fn default_criteria() -> Vec<String> {
    CRITERIA.iter().map(|c| c.to_string()).collect()
}

/// A single criterion judgment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub score: f64,
    pub reason: String,
}

impl Criterion {
    pub fn new(score: f64, reason: impl Into<String>) -> Self {
        Self {
            score,
            reason: reason.into(),
        }
    }

    pub fn unavailable() -> Self {
        Self::new(SENTINEL_SCORE, UNAVAILABLE_REASON)
    }

    /// Negative scores are sentinels and carry no data
    pub fn is_valid(&self) -> bool {
        self.score >= 0.0
    }
}

/// Criterion name to judgment. The criterion set is configuration, not type.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rating(BTreeMap<String, Criterion>);

impl Rating {
    pub fn new() -> Self {
        Self::default()
    }

    /// The sentinel rating: every criterion scored -1 with a fixed reason.
    pub fn unavailable<S: AsRef<str>>(criteria: &[S]) -> Self {
        Self(
            criteria
                .iter()
                .map(|c| (c.as_ref().to_string(), Criterion::unavailable()))
                .collect(),
        )
    }

    pub fn insert(&mut self, criterion: impl Into<String>, value: Criterion) {
        self.0.insert(criterion.into(), value);
    }

    pub fn get(&self, criterion: &str) -> Option<&Criterion> {
        self.0.get(criterion)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Criterion)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when no criterion holds a usable score
    pub fn is_unavailable(&self) -> bool {
        self.0.values().all(|c| !c.is_valid())
    }

    /// Cut every reason to at most `limit` characters
    pub fn truncate_reasons(mut self, limit: Option<usize>) -> Self {
        if let Some(limit) = limit {
            for criterion in self.0.values_mut() {
                if criterion.reason.chars().count() > limit {
                    criterion.reason = criterion.reason.chars().take(limit).collect();
                }
            }
        }
        self
    }
}

/// The sentinel rating over the canonical criterion set
pub fn default_rating() -> Rating {
    Rating::unavailable(&CRITERIA)
}

/// Modality pairing of a comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ComparisonType {
    #[serde(rename = "image-image")]
    ImageImage,
    #[serde(rename = "text-text")]
    TextText,
    #[serde(rename = "image-text")]
    ImageText,
    #[serde(rename = "text-image")]
    TextImage,
}

impl ComparisonType {
    pub const ALL: [ComparisonType; 4] = [
        ComparisonType::ImageImage,
        ComparisonType::TextText,
        ComparisonType::ImageText,
        ComparisonType::TextImage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonType::ImageImage => "image-image",
            ComparisonType::TextText => "text-text",
            ComparisonType::ImageText => "image-text",
            ComparisonType::TextImage => "text-image",
        }
    }

    /// Name of the file this comparison type is persisted to
    pub fn ratings_file_name(&self) -> String {
        format!("ratings_{}.json", self.as_str())
    }
}

impl fmt::Display for ComparisonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComparisonType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ComparisonType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown comparison type: {s}"))
    }
}

/// Reference point an iteration is compared against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Anchor {
    #[serde(rename = "original")]
    Original,
    #[serde(rename = "previous")]
    Previous,
    #[serde(rename = "same-step")]
    SameStep,
}

impl Anchor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Anchor::Original => "original",
            Anchor::Previous => "previous",
            Anchor::SameStep => "same-step",
        }
    }
}

impl fmt::Display for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of a cross-modal comparison is the anchor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    /// Anchor image against the current text
    #[serde(rename = "anchor-image")]
    AnchorImage,
    /// Current image against the anchor text
    #[serde(rename = "anchor-text")]
    AnchorText,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::AnchorImage => "anchor-image",
            Direction::AnchorText => "anchor-text",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generation cycle topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LoopType {
    /// image → text → image
    #[serde(rename = "I-T-I")]
    ImageTextImage,
    /// text → image → text
    #[serde(rename = "T-I-T")]
    TextImageText,
    /// No loop type configured; every branch is planned
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
}

impl LoopType {
    /// Interpret a configured loop type. `None` means unconfigured.
    pub fn parse(raw: Option<&str>) -> Result<Self, EvalError> {
        match raw.map(|s| s.trim().to_ascii_uppercase()) {
            None => Ok(LoopType::Unknown),
            Some(s) if s.is_empty() => Ok(LoopType::Unknown),
            Some(s) if s == "I-T-I" => Ok(LoopType::ImageTextImage),
            Some(s) if s == "T-I-T" => Ok(LoopType::TextImageText),
            Some(_) => Err(EvalError::UnsupportedLoopType(
                raw.unwrap_or_default().to_string(),
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoopType::ImageTextImage => "I-T-I",
            LoopType::TextImageText => "T-I-T",
            LoopType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for LoopType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persisted pairwise judgment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingRecord {
    pub item_id: String,
    pub step: u32,
    pub anchor: Anchor,
    pub comparison_type: ComparisonType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    /// Basenames of the two compared files
    pub comparison_items: [String; 2],
    #[serde(flatten)]
    pub rating: Rating,
}

/// One iteration's artifacts as named in metadata.json
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iteration {
    pub index: u32,
    pub image: String,
    pub text: String,
}

/// Metadata entry for a single item
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    /// `iter{N}_img` / `iter{N}_text` entries
    #[serde(flatten)]
    pub files: BTreeMap<String, String>,
}

impl ItemRecord {
    /// Completed iterations in ascending order.
    ///
    /// An iteration counts as completed once its image exists; its text entry
    /// must then be present too.
    pub fn iterations(&self) -> Result<Vec<Iteration>, String> {
        let mut indices: Vec<u32> = self
            .files
            .keys()
            .filter_map(|key| {
                key.strip_prefix("iter")
                    .and_then(|rest| rest.strip_suffix("_img"))
                    .and_then(|n| n.parse().ok())
            })
            .collect();
        indices.sort_unstable();
        indices.dedup();

        indices
            .into_iter()
            .map(|index| {
                let image = self.files.get(&format!("iter{index}_img")).cloned();
                let text = self.files.get(&format!("iter{index}_text")).cloned();
                match (image, text) {
                    (Some(image), Some(text)) => Ok(Iteration { index, image, text }),
                    _ => Err(format!("iteration {index} is missing its text entry")),
                }
            })
            .collect()
    }

    /// Whether the loop started from an image, judged by the input filename
    pub fn starts_with_image(&self) -> Option<bool> {
        self.input.as_deref().map(has_image_extension)
    }
}

/// Contents of an experiment's metadata.json
pub type ExperimentMetadata = BTreeMap<String, ItemRecord>;

/// Extension sniffing shared by the rater and the planner
pub fn has_image_extension(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    [".jpg", ".jpeg", ".png"]
        .iter()
        .any(|ext| lower.ends_with(ext))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(score: f64) -> RatingRecord {
        let mut rating = Rating::new();
        for criterion in CRITERIA {
            rating.insert(criterion, Criterion::new(score, "looks alike"));
        }
        RatingRecord {
            item_id: "a".to_string(),
            step: 2,
            anchor: Anchor::Previous,
            comparison_type: ComparisonType::ImageText,
            direction: Some(Direction::AnchorImage),
            comparison_items: ["image_iter1.jpg".to_string(), "text_iter2.txt".to_string()],
            rating,
        }
    }

    #[test]
    fn test_record_json_roundtrip() {
        let record = sample_record(7.5);
        let json = serde_json::to_string(&record).unwrap();
        let loaded: RatingRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_record_flattens_criteria() {
        let value = serde_json::to_value(sample_record(4.0)).unwrap();
        assert_eq!(value["comparison_type"], "image-text");
        assert_eq!(value["anchor"], "previous");
        assert_eq!(value["direction"], "anchor-image");
        assert_eq!(value["content_correspondence"]["score"], 4.0);
        assert!(value.get("rating").is_none());
    }

    #[test]
    fn test_sentinel_survives_roundtrip() {
        let mut record = sample_record(5.0);
        record.rating = default_rating();
        let json = serde_json::to_string(&record).unwrap();
        let loaded: RatingRecord = serde_json::from_str(&json).unwrap();
        let criterion = loaded.rating.get("overall_semantic_intent").unwrap();
        assert_eq!(criterion.score, -1.0);
        assert_eq!(criterion.reason, UNAVAILABLE_REASON);
        assert!(!criterion.is_valid());
        assert!(loaded.rating.is_unavailable());
    }

    #[test]
    fn test_direction_omitted_when_absent() {
        let mut record = sample_record(3.0);
        record.direction = None;
        record.anchor = Anchor::SameStep;
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("direction"));
        let loaded: RatingRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.direction, None);
    }

    #[test]
    fn test_default_rating_covers_canonical_criteria() {
        let rating = default_rating();
        assert_eq!(rating.len(), 5);
        for criterion in CRITERIA {
            assert_eq!(rating.get(criterion), Some(&Criterion::unavailable()));
        }
    }

    #[test]
    fn test_truncate_reasons_respects_char_boundaries() {
        let mut rating = Rating::new();
        rating.insert("overall_semantic_intent", Criterion::new(3.0, "ééééé"));
        let truncated = rating.clone().truncate_reasons(Some(3));
        assert_eq!(truncated.get("overall_semantic_intent").unwrap().reason, "ééé");
        let unbounded = rating.truncate_reasons(None);
        assert_eq!(unbounded.get("overall_semantic_intent").unwrap().reason, "ééééé");
    }

    #[test]
    fn test_loop_type_parse() {
        assert_eq!(LoopType::parse(Some("i-t-i")).unwrap(), LoopType::ImageTextImage);
        assert_eq!(LoopType::parse(Some(" T-I-T ")).unwrap(), LoopType::TextImageText);
        assert_eq!(LoopType::parse(None).unwrap(), LoopType::Unknown);
        assert_eq!(LoopType::parse(Some("")).unwrap(), LoopType::Unknown);
        assert!(matches!(
            LoopType::parse(Some("I-I-I")),
            Err(EvalError::UnsupportedLoopType(s)) if s == "I-I-I"
        ));
    }

    #[test]
    fn test_comparison_type_file_names() {
        assert_eq!(
            ComparisonType::ImageImage.ratings_file_name(),
            "ratings_image-image.json"
        );
        assert_eq!("text-image".parse(), Ok(ComparisonType::TextImage));
        assert!("image".parse::<ComparisonType>().is_err());
    }

    #[test]
    fn test_item_iterations_sorted_numerically() {
        let json = r#"{
            "input": "input.jpg",
            "iter10_img": "image_iter10.jpg", "iter10_text": "text_iter10.txt",
            "iter2_img": "image_iter2.jpg", "iter2_text": "text_iter2.txt",
            "iter1_img": "image_iter1.jpg", "iter1_text": "text_iter1.txt"
        }"#;
        let record: ItemRecord = serde_json::from_str(json).unwrap();
        let indices: Vec<u32> = record.iterations().unwrap().iter().map(|i| i.index).collect();
        assert_eq!(indices, vec![1, 2, 10]);
        assert_eq!(record.starts_with_image(), Some(true));
    }

    #[test]
    fn test_item_iteration_missing_text_is_error() {
        let json = r#"{"input": "input.txt", "iter1_img": "image_iter1.jpg"}"#;
        let record: ItemRecord = serde_json::from_str(json).unwrap();
        assert!(record.iterations().is_err());
        assert_eq!(record.starts_with_image(), Some(false));
    }
}
