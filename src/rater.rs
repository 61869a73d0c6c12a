use crate::config::{EvaluationConfig, RaterMode};
use crate::error::EvalError;
use crate::llm::{ContentPart, ContentRequest, ModelClient, OpenAiClient, ResponseSchema};
use crate::models::{ComparisonType, Criterion, Rating, has_image_extension};
use crate::retry::RetryPolicy;
use anyhow::{Context, Result, anyhow, bail};
use image::ImageFormat;
use serde_json::{Map, Value, json};
use std::collections::BTreeSet;
use std::io::{BufRead, Cursor, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Stands in for a text file that does not exist
pub const MISSING_TEXT_PLACEHOLDER: &str = "No text available";

const SYSTEM_PROMPT: &str = "You are an expert judge of semantic similarity between pieces of \
content. Compare item A with item B and rate each requested criterion from 0 (unrelated) to 10 \
(identical in meaning). Give every criterion a numeric score and a short reason. Respond with a \
single JSON object and nothing else.";

/// Short definition shown to the judge for each canonical criterion
fn criterion_hint(criterion: &str) -> &'static str {
    match criterion {
        "content_correspondence" => "are the same entities, objects and actions present?",
        "compositional_alignment" => "is the arrangement, layout or structure preserved?",
        "fidelity_completeness" => "are specific details kept without omissions or additions?",
        "stylistic_congruence" => "do tone, style, colour and mood match?",
        "overall_semantic_intent" => "overall, do both convey the same meaning?",
        _ => "how similar are A and B on this aspect?",
    }
}

/// Content ready to be judged by either backend
#[derive(Debug, Clone)]
pub struct PreparedComparison {
    pub kind: ComparisonType,
    pub parts: Vec<ContentPart>,
    /// Human-readable rendering: file paths and text bodies
    pub display: String,
}

/// Where ratings come from
pub enum RaterBackend {
    Llm(Arc<dyn ModelClient>),
    Human {
        input: Box<dyn BufRead + Send>,
        output: Box<dyn Write + Send>,
    },
    /// No client could be configured; every comparison gets the sentinel rating
    Unavailable,
}

pub struct Rater {
    backend: RaterBackend,
    criteria: Vec<String>,
    retry: RetryPolicy,
    reason_max_chars: Option<usize>,
}

impl Rater {
    pub fn new(backend: RaterBackend, settings: &EvaluationConfig) -> Self {
        Self {
            backend,
            criteria: settings.criteria.clone(),
            retry: settings.retry_policy(),
            reason_max_chars: settings.reason_max_chars,
        }
    }

    /// Build the backend the settings ask for.
    ///
    /// A missing API key degrades to [`RaterBackend::Unavailable`].
    pub fn from_config(settings: &EvaluationConfig) -> Result<Self> {
        let backend = match settings.mode {
            RaterMode::Human => RaterBackend::Human {
                input: Box::new(std::io::BufReader::new(std::io::stdin())),
                output: Box::new(std::io::stdout()),
            },
            RaterMode::Llm => match OpenAiClient::from_env(
                &settings.env_var_api_key,
                &settings.api_endpoint,
                &settings.model,
                settings.temperature,
                settings.request_timeout(),
            )? {
                Some(client) => RaterBackend::Llm(Arc::new(client)),
                None => {
                    warn!(
                        "{} is not set; all comparisons will be recorded as unavailable",
                        settings.env_var_api_key
                    );
                    RaterBackend::Unavailable
                }
            },
        };
        Ok(Self::new(backend, settings))
    }

    /// Rate one pair of files.
    ///
    /// Fails only on input errors ([`EvalError::MissingAsset`]) or a closed
    /// human console. Model failures end in the sentinel rating.
    pub async fn rate(&mut self, kind: ComparisonType, a: &Path, b: &Path) -> Result<Rating> {
        let prepared = prepare_contents(kind, a, b)?;

        let rating = match &mut self.backend {
            RaterBackend::Unavailable => Rating::unavailable(&self.criteria),
            RaterBackend::Human { input, output } => {
                prompt_human(input.as_mut(), output.as_mut(), &prepared, &self.criteria)?
            }
            RaterBackend::Llm(client) => {
                rate_with_model(client.as_ref(), &self.retry, &prepared, &self.criteria).await
            }
        };

        Ok(rating.truncate_reasons(self.reason_max_chars))
    }
}

async fn rate_with_model(
    client: &dyn ModelClient,
    retry: &RetryPolicy,
    prepared: &PreparedComparison,
    criteria: &[String],
) -> Rating {
    let request = build_request(prepared, criteria);

    let outcome = retry
        .run(
            |attempt| {
                let request = request.clone();
                async move {
                    debug!("rating {} (attempt {})", prepared.kind, attempt + 1);
                    let text = client.generate_content(request).await?;
                    parse_rating(&text, criteria)
                }
            },
            |_: &anyhow::Error| true,
        )
        .await;

    match outcome {
        Ok(rating) => rating,
        Err(exhausted) => {
            warn!(
                "{} rating unavailable after {} attempts: {:#}",
                prepared.kind, exhausted.attempts, exhausted.last_error
            );
            Rating::unavailable(criteria)
        }
    }
}

fn build_request(prepared: &PreparedComparison, criteria: &[String]) -> ContentRequest {
    let listing = criteria
        .iter()
        .map(|c| format!("- {}: {}", c, criterion_hint(c)))
        .collect::<Vec<_>>()
        .join("\n");

    let mut parts = vec![ContentPart::text(format!(
        "Comparison type: {}\nCriteria:\n{}",
        prepared.kind, listing
    ))];
    parts.extend(prepared.parts.iter().cloned());

    ContentRequest {
        system: Some(SYSTEM_PROMPT.to_string()),
        parts,
        response_schema: Some(ResponseSchema {
            name: "similarity_rating".to_string(),
            description: "Per-criterion similarity scores with reasons".to_string(),
            schema: rating_schema(criteria),
        }),
    }
}

/// Strict schema: one `{score, reason}` object per criterion, nothing else
pub fn rating_schema(criteria: &[String]) -> Value {
    let criterion = json!({
        "type": "object",
        "properties": {
            "score": {"type": "number"},
            "reason": {"type": "string"}
        },
        "required": ["score", "reason"],
        "additionalProperties": false
    });

    let properties: Map<String, Value> = criteria
        .iter()
        .map(|name| (name.clone(), criterion.clone()))
        .collect();

    json!({
        "type": "object",
        "properties": properties,
        "required": criteria,
        "additionalProperties": false
    })
}

/// Parse and validate a model response.
///
/// The object must hold exactly the expected criteria, each with a finite,
/// non-negative numeric `score` and a string `reason`.
pub fn parse_rating(response: &str, criteria: &[String]) -> Result<Rating> {
    let parsed = parse_json_response(response)?;
    let object = parsed
        .as_object()
        .ok_or_else(|| anyhow!("Rating response is not a JSON object"))?;

    let expected: BTreeSet<&str> = criteria.iter().map(String::as_str).collect();
    let received: BTreeSet<&str> = object.keys().map(String::as_str).collect();
    if expected != received {
        bail!(
            "Rating response criteria mismatch: expected {:?}, got {:?}",
            expected,
            received
        );
    }

    let mut rating = Rating::new();
    for name in criteria {
        let entry = &object[name.as_str()];
        let score = entry
            .get("score")
            .and_then(Value::as_f64)
            .ok_or_else(|| anyhow!("Criterion {name} has no numeric score"))?;
        if !score.is_finite() || score < 0.0 {
            bail!("Criterion {name} has out-of-range score {score}");
        }
        let reason = entry
            .get("reason")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("Criterion {name} has no string reason"))?;
        rating.insert(name.clone(), Criterion::new(score, reason));
    }
    Ok(rating)
}

/// Parse JSON from the response, handling JSON embedded in prose or fences
fn parse_json_response(response: &str) -> Result<Value> {
    match serde_json::from_str(response.trim()) {
        Ok(parsed) => Ok(parsed),
        Err(_) => {
            let start = response
                .find('{')
                .ok_or_else(|| anyhow!("No JSON found in response"))?;
            let end = response
                .rfind('}')
                .filter(|&end| end > start)
                .ok_or_else(|| anyhow!("Found opening brace but no closing brace in response"))?;
            serde_json::from_str(&response[start..=end]).context("Failed to parse extracted JSON")
        }
    }
}

/// Package two files for judgment according to the comparison kind.
///
/// Images must decode; they are normalized to RGB and re-encoded as PNG.
/// Absent text files become [`MISSING_TEXT_PLACEHOLDER`].
pub fn prepare_contents(
    kind: ComparisonType,
    a: &Path,
    b: &Path,
) -> Result<PreparedComparison, EvalError> {
    let (parts, display) = match kind {
        ComparisonType::ImageImage => {
            let image_a = load_image(a)?;
            let image_b = load_image(b)?;
            (
                vec![
                    ContentPart::text("Compare these two images. Image A:"),
                    image_a,
                    ContentPart::text("Image B:"),
                    image_b,
                ],
                format!("Image A: {}\nImage B: {}", a.display(), b.display()),
            )
        }
        ComparisonType::TextText => {
            let text_a = read_text(a);
            let text_b = read_text(b);
            let display = format!(
                "Text A ({}):\n{}\n\nText B ({}):\n{}",
                a.display(),
                text_a,
                b.display(),
                text_b
            );
            (
                vec![ContentPart::text(format!(
                    "Compare these two texts.\nText A: {text_a}\nText B: {text_b}"
                ))],
                display,
            )
        }
        ComparisonType::ImageText | ComparisonType::TextImage => {
            let (image_path, text_path) = if is_image_path(a) { (a, b) } else { (b, a) };
            let image = load_image(image_path)?;
            let text = read_text(text_path);
            let display = format!(
                "Image: {}\nText ({}):\n{}",
                image_path.display(),
                text_path.display(),
                text
            );
            (
                vec![
                    ContentPart::text("Compare this image to the following text."),
                    image,
                    ContentPart::text(format!("Text: {text}")),
                ],
                display,
            )
        }
    };

    Ok(PreparedComparison {
        kind,
        parts,
        display,
    })
}

fn is_image_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(has_image_extension)
}

fn load_image(path: &Path) -> Result<ContentPart, EvalError> {
    let decoded = image::open(path).map_err(|e| EvalError::missing_asset(path, e.to_string()))?;
    let rgb = image::DynamicImage::ImageRgb8(decoded.to_rgb8());

    let mut buffer = Cursor::new(Vec::new());
    rgb.write_to(&mut buffer, ImageFormat::Png)
        .map_err(|e| EvalError::missing_asset(path, format!("re-encoding failed: {e}")))?;

    Ok(ContentPart::Image {
        mime: "image/png".to_string(),
        bytes: buffer.into_inner(),
    })
}

fn read_text(path: &Path) -> String {
    match std::fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).trim().to_string(),
        Err(e) => {
            debug!("using placeholder for {}: {}", path.display(), e);
            MISSING_TEXT_PLACEHOLDER.to_string()
        }
    }
}

/// Ask an operator for one score and reason per criterion
fn prompt_human(
    input: &mut dyn BufRead,
    output: &mut dyn Write,
    prepared: &PreparedComparison,
    criteria: &[String],
) -> Result<Rating> {
    writeln!(output, "{}", "-".repeat(40))?;
    writeln!(output, "[{}]\n{}", prepared.kind, prepared.display)?;

    let mut rating = Rating::new();
    for name in criteria {
        let score = loop {
            write!(output, "{name} score (0-10, {})? ", criterion_hint(name))?;
            output.flush()?;
            let line = read_line(input)?;
            match line.trim().parse::<f64>() {
                Ok(score) if score.is_finite() && score >= 0.0 => break score,
                _ => writeln!(output, "Invalid score {:?}, try again.", line.trim())?,
            }
        };
        write!(output, "{name} reason? ")?;
        output.flush()?;
        let reason = read_line(input)?;
        rating.insert(name.clone(), Criterion::new(score, reason.trim()));
    }
    Ok(rating)
}

fn read_line(input: &mut dyn BufRead) -> Result<String> {
    let mut line = String::new();
    let read = input
        .read_line(&mut line)
        .context("Failed to read from console")?;
    if read == 0 {
        bail!("Console input closed before the rating was complete");
    }
    Ok(line)
}
