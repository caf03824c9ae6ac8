use thiserror::Error;

/// Everything that can end an analysis request early. Each variant maps to
/// one envelope `error` summary and one HTTP status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalyzeError {
    #[error("No image uploaded")]
    MissingImage,

    #[error("Invalid upload: {0}")]
    InvalidUpload(String),

    #[error("Upload too large: {0}")]
    UploadTooLarge(String),

    #[error("Image processing failed: {0}")]
    ImageProcessing(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Model returned malformed output: {0}")]
    MalformedModelOutput(String),
}

impl AnalyzeError {
    pub fn kind(&self) -> &'static str {
        match self {
            AnalyzeError::MissingImage => "missing_image",
            AnalyzeError::InvalidUpload(_) => "invalid_upload",
            AnalyzeError::UploadTooLarge(_) => "upload_too_large",
            AnalyzeError::ImageProcessing(_) => "image_processing",
            AnalyzeError::Inference(_) => "inference_error",
            AnalyzeError::MalformedModelOutput(_) => "malformed_model_output",
        }
    }

    pub fn summary(&self) -> &'static str {
        match self {
            AnalyzeError::MissingImage => "No image uploaded",
            AnalyzeError::InvalidUpload(_) => "Invalid upload",
            AnalyzeError::UploadTooLarge(_) => "Upload too large",
            AnalyzeError::ImageProcessing(_) => "Image processing failed",
            AnalyzeError::Inference(_) => "Inference failed",
            AnalyzeError::MalformedModelOutput(_) => "Model returned malformed output",
        }
    }

    pub fn details(&self) -> Option<&str> {
        match self {
            AnalyzeError::MissingImage => None,
            AnalyzeError::InvalidUpload(detail)
            | AnalyzeError::UploadTooLarge(detail)
            | AnalyzeError::ImageProcessing(detail)
            | AnalyzeError::Inference(detail)
            | AnalyzeError::MalformedModelOutput(detail) => Some(detail.as_str()),
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            AnalyzeError::MissingImage
                | AnalyzeError::InvalidUpload(_)
                | AnalyzeError::UploadTooLarge(_)
        )
    }

    pub fn status(&self) -> u16 {
        match self {
            AnalyzeError::UploadTooLarge(_) => 413,
            _ if self.is_client_error() => 400,
            _ => 500,
        }
    }
}
