use std::sync::Arc;
use std::time::Instant;

use sawce_contracts::envelope::{assemble, AnalysisEnvelope, Interpretation};
use sawce_contracts::error::AnalyzeError;
use sawce_contracts::modes::{ModeRegistry, PromptSpec};
use tracing::{debug, info, warn};

pub mod config;
pub mod interpret;
pub mod invoker;
pub mod normalizer;
pub mod upload;

pub use config::InferenceConfig;
pub use interpret::{interpret, unwrap_fenced};
pub use invoker::{DryrunInvoker, InferenceInvoker, InferenceRequest, OpenAiInvoker};
pub use normalizer::{normalize, EncodedImage};
pub use upload::{ImagePayload, SpooledUpload};

/// The image-analysis pipeline: resolve mode, normalize image, call the
/// model once, interpret the answer, assemble the envelope.
///
/// Cheap to clone; all shared state is immutable after construction.
#[derive(Clone)]
pub struct Analyzer {
    registry: Arc<ModeRegistry>,
    invoker: Arc<dyn InferenceInvoker>,
    config: Arc<InferenceConfig>,
}

impl Analyzer {
    pub fn new(
        registry: ModeRegistry,
        invoker: Arc<dyn InferenceInvoker>,
        config: InferenceConfig,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            invoker,
            config: Arc::new(config),
        }
    }

    pub fn registry(&self) -> &ModeRegistry {
        &self.registry
    }

    pub fn invoker_name(&self) -> &str {
        self.invoker.name()
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    pub async fn analyze(
        &self,
        requested_mode: Option<&str>,
        image: Option<ImagePayload>,
    ) -> AnalysisEnvelope {
        let selection = self.registry.resolve(requested_mode);
        if let Some(reason) = selection.fallback_reason.as_deref() {
            if selection.requested.is_some() {
                warn!(mode = %selection.mode(), "{reason}");
            } else {
                debug!(mode = %selection.mode(), "{reason}");
            }
        }

        let mode = selection.mode();
        let result = self.run(selection.spec, image).await;
        if let Err(err) = &result {
            warn!(mode = %mode, kind = err.kind(), error = %err, "analysis failed");
        }
        assemble(mode, result)
    }

    async fn run(
        &self,
        spec: &PromptSpec,
        image: Option<ImagePayload>,
    ) -> Result<Interpretation, AnalyzeError> {
        let mut image = image.ok_or(AnalyzeError::MissingImage)?;
        let raw = self.normalize_and_invoke(spec, &image).await;
        image.release();
        interpret(&raw?, &spec.expected)
    }

    async fn normalize_and_invoke(
        &self,
        spec: &PromptSpec,
        image: &ImagePayload,
    ) -> Result<String, AnalyzeError> {
        let bytes = image.load().await.map_err(|err| {
            AnalyzeError::ImageProcessing(format!("failed to read uploaded image: {err}"))
        })?;
        if bytes.is_empty() {
            return Err(AnalyzeError::MissingImage);
        }
        let max_dim = self.config.max_image_dim;
        let encoded = tokio::task::spawn_blocking(move || normalize(&bytes, max_dim))
            .await
            .map_err(|err| {
                AnalyzeError::ImageProcessing(format!("image normalization task failed: {err}"))
            })??;

        let request = InferenceRequest::new(spec, encoded, &self.config);
        info!(
            mode = %request.mode,
            model = %request.model,
            invoker = self.invoker.name(),
            declared_type = image.media_type().unwrap_or("unknown"),
            image_bytes = request.image.byte_len,
            "calling inference"
        );
        let started = Instant::now();
        let raw = self.invoker.invoke(&request).await?;
        info!(
            mode = %request.mode,
            elapsed_ms = started.elapsed().as_millis() as u64,
            output_chars = raw.chars().count(),
            "inference finished"
        );
        Ok(raw)
    }
}

/// Cuts `value` to `max_chars` characters, marking the cut with an ellipsis.
pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &value[..cut]),
        None => value.to_string(),
    }
}
