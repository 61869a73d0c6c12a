use crate::error::EvalError;
use crate::models::{LoopType, default_criteria};
use crate::retry::RetryPolicy;
use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Who produces the ratings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaterMode {
    #[default]
    Llm,
    Human,
}

/// Generation loop topology the ratings were produced by
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoopConfig {
    /// "I-T-I" or "T-I-T"; absent means every planner branch runs
    #[serde(rename = "type", default)]
    pub loop_type: Option<String>,
    #[serde(default)]
    pub num_iterations: Option<u32>,
}

impl LoopConfig {
    pub fn loop_type(&self) -> Result<LoopType, EvalError> {
        LoopType::parse(self.loop_type.as_deref())
    }
}

/// Rater backend settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EvaluationConfig {
    #[serde(default)]
    pub mode: RaterMode,
    /// OpenAI-compatible API endpoint
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,
    /// Environment variable name containing the API key
    #[serde(default = "default_env_var_api_key")]
    pub env_var_api_key: String,
    /// Model used for rating
    #[serde(default = "default_rater_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Attempts per comparison before the sentinel rating is recorded
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_secs: f64,
    /// Truncate reasons to this many characters; unbounded when absent
    #[serde(default)]
    pub reason_max_chars: Option<usize>,
    /// Criteria the rater must return, in prompt order
    #[serde(default = "default_criteria")]
    pub criteria: Vec<String>,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            mode: RaterMode::default(),
            api_endpoint: default_api_endpoint(),
            env_var_api_key: default_env_var_api_key(),
            model: default_rater_model(),
            temperature: default_temperature(),
            request_timeout_secs: default_request_timeout(),
            max_retries: default_max_retries(),
            retry_base_delay_secs: default_retry_base_delay(),
            reason_max_chars: None,
            criteria: default_criteria(),
        }
    }
}

impl EvaluationConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        let base_delay = Duration::try_from_secs_f64(self.retry_base_delay_secs)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_retry_base_delay()));
        RetryPolicy::new(self.max_retries, base_delay)
    }

    /// Reject settings that cannot become a retry delay
    pub fn validate(&self) -> Result<()> {
        Duration::try_from_secs_f64(self.retry_base_delay_secs).with_context(|| {
            format!(
                "retry_base_delay_secs must be a finite, non-negative number of seconds (got {})",
                self.retry_base_delay_secs
            )
        })?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Report and narrative settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportingConfig {
    /// Rows in the top-drops table
    #[serde(default = "default_top_drops")]
    pub top_drops: usize,
    #[serde(default = "default_narrative_model")]
    pub narrative_model: String,
    #[serde(default = "default_narrative_temperature")]
    pub narrative_temperature: f64,
    #[serde(default = "default_report_name")]
    pub report_name: String,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            top_drops: default_top_drops(),
            narrative_model: default_narrative_model(),
            narrative_temperature: default_narrative_temperature(),
            report_name: default_report_name(),
        }
    }
}

fn default_api_endpoint() -> String {
    "https://generativelanguage.googleapis.com/v1beta/openai".to_string()
}

fn default_env_var_api_key() -> String {
    "GOOGLE_API_KEY".to_string()
}

fn default_rater_model() -> String {
    "gemini-2.0-flash-lite".to_string()
}

fn default_temperature() -> f64 {
    0.0
}

fn default_request_timeout() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay() -> f64 {
    1.0
}

fn default_top_drops() -> usize {
    10
}

fn default_narrative_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_narrative_temperature() -> f64 {
    0.2
}

fn default_report_name() -> String {
    "report.html".to_string()
}

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(rename = "loop", default)]
    pub loop_config: LoopConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub reporting: ReportingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config: {}", path.display()))?;

        config
            .loop_config
            .loop_type()
            .with_context(|| format!("Invalid [loop] section in {}", path.display()))?;
        config
            .evaluation
            .validate()
            .with_context(|| format!("Invalid [evaluation] section in {}", path.display()))?;

        Ok(config)
    }
}
