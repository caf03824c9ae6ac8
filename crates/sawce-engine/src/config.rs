use std::env;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 700;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_IMAGE_DIM: u32 = 1024;

/// Process-wide inference settings. Built once at startup; requests never
/// change them, so every call for a given mode gets the same sampling setup.
#[derive(Clone)]
pub struct InferenceConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub timeout: Duration,
    pub max_image_dim: u32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: DEFAULT_API_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            timeout: DEFAULT_TIMEOUT,
            max_image_dim: DEFAULT_MAX_IMAGE_DIM,
        }
    }
}

impl InferenceConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: first_non_empty_env(&["OPENAI_API_KEY", "OPENAI_API_KEY_BACKUP"]),
            api_base: normalize_api_base(
                &first_non_empty_env(&["OPENAI_API_BASE", "OPENAI_BASE_URL"])
                    .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            ),
            model: first_non_empty_env(&["SAWCE_MODEL"])
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            ..Self::default()
        }
    }
}

impl fmt::Debug for InferenceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_base", &self.api_base)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_output_tokens", &self.max_output_tokens)
            .field("timeout", &self.timeout)
            .field("max_image_dim", &self.max_image_dim)
            .finish()
    }
}

pub fn first_non_empty_env(keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Ok(value) = env::var(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Trims trailing slashes and appends `/v1` to bare hosts.
pub fn normalize_api_base(raw: &str) -> String {
    let mut base = raw.trim().trim_end_matches('/').to_string();
    if base.is_empty() {
        return DEFAULT_API_BASE.to_string();
    }
    if let Ok(parsed) = reqwest::Url::parse(&base) {
        if parsed.path().trim().is_empty() || parsed.path() == "/" {
            base = format!("{base}/v1");
        }
    }
    base.trim_end_matches('/').to_string()
}
