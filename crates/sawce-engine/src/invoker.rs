use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client as HttpClient, Response as HttpResponse};
use sawce_contracts::error::AnalyzeError;
use sawce_contracts::modes::{Mode, PromptSpec, SchemaKind};
use serde_json::{json, Value};

use crate::config::InferenceConfig;
use crate::normalizer::EncodedImage;
use crate::truncate_text;

/// One call's worth of input for the multimodal model.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub mode: Mode,
    pub model: String,
    pub system_prompt: String,
    pub instruction: String,
    pub image: EncodedImage,
    pub expected: SchemaKind,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl InferenceRequest {
    pub fn new(spec: &PromptSpec, image: EncodedImage, config: &InferenceConfig) -> Self {
        Self {
            mode: spec.mode,
            model: config.model.clone(),
            system_prompt: spec.system_instructions.clone(),
            instruction: anchor_instruction(&spec.expected),
            image,
            expected: spec.expected.clone(),
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
        }
    }

    /// Body for the OpenAI Responses API: persona as `instructions`, the
    /// anchor text and image as user content.
    pub fn to_responses_payload(&self) -> Value {
        json!({
            "model": self.model,
            "instructions": self.system_prompt,
            "input": [{
                "role": "user",
                "content": [
                    {"type": "input_text", "text": self.instruction},
                    {"type": "input_image", "image_url": self.image.data_url},
                ],
            }],
            "temperature": self.temperature,
            "max_output_tokens": self.max_output_tokens,
        })
    }
}

fn anchor_instruction(expected: &SchemaKind) -> String {
    match expected {
        SchemaKind::FreeText { first_line } => format!(
            "Analyze this image and respond only with the required shape. Start with `{first_line}`."
        ),
        SchemaKind::StructuredJson { .. } => {
            "Analyze this image and respond only with the required JSON object.".to_string()
        }
    }
}

/// The remote model seam. Exactly one `invoke` per request, never retried.
#[async_trait]
pub trait InferenceInvoker: Send + Sync {
    fn name(&self) -> &str;
    async fn invoke(&self, request: &InferenceRequest) -> Result<String, AnalyzeError>;
}

pub struct OpenAiInvoker {
    api_base: String,
    api_key: String,
    http: HttpClient,
}

impl OpenAiInvoker {
    pub fn new(config: &InferenceConfig) -> anyhow::Result<Self> {
        let api_key = config.api_key.clone().ok_or_else(|| {
            anyhow!("OPENAI_API_KEY is not set; export it or run with --dry-run")
        })?;
        let http = HttpClient::builder()
            .timeout(config.timeout)
            .build()
            .context("failed to build inference HTTP client")?;
        Ok(Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key,
            http,
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}/responses", self.api_base)
    }
}

#[async_trait]
impl InferenceInvoker for OpenAiInvoker {
    fn name(&self) -> &str {
        "openai"
    }

    async fn invoke(&self, request: &InferenceRequest) -> Result<String, AnalyzeError> {
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .header(CONTENT_TYPE, "application/json")
            .json(&request.to_responses_payload())
            .send()
            .await
            .map_err(|err| AnalyzeError::Inference(transport_error_text(self.name(), &err)))?;
        let parsed = response_json_or_error(self.name(), response).await?;
        let text = extract_output_text(&parsed);
        if text.is_empty() {
            return Err(AnalyzeError::Inference(format!(
                "{} returned no output text",
                self.name()
            )));
        }
        Ok(text)
    }
}

/// Offline invoker that answers in the requested shape without a network call.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryrunInvoker;

#[async_trait]
impl InferenceInvoker for DryrunInvoker {
    fn name(&self) -> &str {
        "dryrun"
    }

    async fn invoke(&self, request: &InferenceRequest) -> Result<String, AnalyzeError> {
        match &request.expected {
            SchemaKind::FreeText { first_line } => Ok(format!(
                "{}\nWarning: dryrun answer for a {} byte image; no model was called.",
                first_line.replace("<0-10>", "7"),
                request.image.byte_len
            )),
            SchemaKind::StructuredJson { schema } => {
                let mut data = schema.clone();
                data.insert("type".to_string(), json!(request.mode.as_str()));
                let rendered = serde_json::to_string_pretty(&Value::Object(data))
                    .map_err(|err| AnalyzeError::Inference(err.to_string()))?;
                Ok(format!("```json\n{rendered}\n```"))
            }
        }
    }
}

async fn response_json_or_error(
    provider: &str,
    response: HttpResponse,
) -> Result<Value, AnalyzeError> {
    let status = response.status();
    let code = status.as_u16();
    let body = response.text().await.map_err(|err| {
        AnalyzeError::Inference(format!("{provider} response body read failed: {err}"))
    })?;
    if !status.is_success() {
        return Err(AnalyzeError::Inference(format!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        )));
    }
    serde_json::from_str(&body).map_err(|err| {
        AnalyzeError::Inference(format!("{provider} returned invalid JSON payload: {err}"))
    })
}

fn transport_error_text(provider: &str, err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("{provider} request timed out")
    } else if err.is_connect() {
        format!("{provider} connection failed: {err}")
    } else {
        format!("{provider} request failed: {err}")
    }
}

/// Pulls the answer text out of a Responses API payload. Chat Completions
/// shaped bodies from compatible gateways are accepted as well.
pub fn extract_output_text(response: &Value) -> String {
    if let Some(text) = non_blank(response.get("output_text")) {
        return text.to_string();
    }

    let items = response
        .get("output")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let parts: Vec<&str> = items.iter().flat_map(output_item_texts).collect();
    if !parts.is_empty() {
        return parts.join("\n");
    }

    non_blank(response.pointer("/choices/0/message/content"))
        .unwrap_or_default()
        .to_string()
}

/// Text of one `output[]` item: a bare text chunk, or the text chunks of a
/// `message`. Reasoning and tool items yield nothing.
fn output_item_texts(item: &Value) -> Vec<&str> {
    if is_text_chunk(item) {
        return non_blank(item.get("text")).into_iter().collect();
    }
    if item_type(item).is_some_and(|kind| kind != "message") {
        return Vec::new();
    }
    item.get("content")
        .and_then(Value::as_array)
        .map(|chunks| {
            chunks
                .iter()
                .filter(|chunk| is_text_chunk(chunk))
                .filter_map(|chunk| non_blank(chunk.get("text")))
                .collect()
        })
        .unwrap_or_default()
}

fn item_type(value: &Value) -> Option<&str> {
    value.get("type").and_then(Value::as_str)
}

fn is_text_chunk(value: &Value) -> bool {
    matches!(item_type(value), Some("output_text" | "text"))
}

fn non_blank(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
}
