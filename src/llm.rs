use anyhow::{Context, Result};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImageArgs,
        ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContentPart,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs, ImageDetail, ImageUrlArgs,
        ResponseFormat, ResponseFormatJsonSchema,
    },
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// One piece of multimodal input
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text(String),
    Image { mime: String, bytes: Vec<u8> },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    fn data_url(mime: &str, bytes: &[u8]) -> String {
        format!("data:{};base64,{}", mime, STANDARD.encode(bytes))
    }
}

/// Strict JSON schema the model output must follow
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseSchema {
    pub name: String,
    pub description: String,
    pub schema: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentRequest {
    pub system: Option<String>,
    pub parts: Vec<ContentPart>,
    pub response_schema: Option<ResponseSchema>,
}

/// A text-generating model the rater and narrative writer can call.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Returns the text of the first choice
    async fn generate_content(&self, request: ContentRequest) -> Result<String>;
}

/// Chat-completions client for any OpenAI-compatible endpoint.
///
/// Built once per run and shared by every comparison.
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: f32,
}

impl OpenAiClient {
    pub fn new(
        api_key: &str,
        api_base: &str,
        model: &str,
        temperature: f64,
        timeout: Duration,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        let openai_config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(api_base);

        Ok(Self {
            client: Client::with_config(openai_config).with_http_client(http_client),
            model: model.to_string(),
            temperature: temperature as f32,
        })
    }

    /// Build a client from the key in `env_var`, or `None` when it is unset or empty
    pub fn from_env(
        env_var: &str,
        api_base: &str,
        model: &str,
        temperature: f64,
        timeout: Duration,
    ) -> Result<Option<Self>> {
        match std::env::var(env_var) {
            Ok(key) if !key.trim().is_empty() => {
                Self::new(key.trim(), api_base, model, temperature, timeout).map(Some)
            }
            _ => Ok(None),
        }
    }

    fn build_request(&self, request: ContentRequest) -> Result<CreateChatCompletionRequest> {
        let mut messages: Vec<ChatCompletionRequestMessage> = Vec::new();

        if let Some(system) = request.system {
            messages.push(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system)
                    .build()
                    .context("Failed to build system message")?
                    .into(),
            );
        }

        let mut parts: Vec<ChatCompletionRequestUserMessageContentPart> = Vec::new();
        for part in request.parts {
            let part = match part {
                ContentPart::Text(text) => ChatCompletionRequestMessageContentPartTextArgs::default()
                    .text(text)
                    .build()
                    .context("Failed to build text part")?
                    .into(),
                ContentPart::Image { mime, bytes } => {
                    ChatCompletionRequestMessageContentPartImageArgs::default()
                        .image_url(
                            ImageUrlArgs::default()
                                .url(ContentPart::data_url(&mime, &bytes))
                                .detail(ImageDetail::High)
                                .build()
                                .context("Failed to build image url")?,
                        )
                        .build()
                        .context("Failed to build image part")?
                        .into()
                }
            };
            parts.push(part);
        }

        messages.push(
            ChatCompletionRequestUserMessageArgs::default()
                .content(parts)
                .build()
                .context("Failed to build user message")?
                .into(),
        );

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(&self.model)
            .messages(messages)
            .temperature(self.temperature);

        if let Some(schema) = request.response_schema {
            builder.response_format(ResponseFormat::JsonSchema {
                json_schema: ResponseFormatJsonSchema {
                    description: Some(schema.description),
                    name: schema.name,
                    schema: Some(schema.schema),
                    strict: Some(true),
                },
            });
        }

        builder
            .build()
            .context("Failed to build chat completion request")
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn generate_content(&self, request: ContentRequest) -> Result<String> {
        let request = self.build_request(request)?;
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .context("Failed to generate content")?;

        if let Some(usage) = &response.usage {
            debug!(
                "model {} used {} prompt / {} completion tokens",
                self.model, usage.prompt_tokens, usage.completion_tokens
            );
        }

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .context("Model returned no content")
    }
}
