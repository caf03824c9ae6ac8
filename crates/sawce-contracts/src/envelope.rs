use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::AnalyzeError;
use crate::modes::Mode;

/// Model output after interpretation, ready for the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Interpretation {
    Text(String),
    Structured(Map<String, Value>),
}

/// The caller-facing response body.
///
/// Free-text modes answer in `output`, structured modes in `data`; failures
/// carry `error` plus optional `details`. `status` is the matching HTTP status
/// and is not part of the body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisEnvelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip)]
    pub status: u16,
}

impl AnalysisEnvelope {
    pub fn success(mode: Mode, interpretation: Interpretation) -> Self {
        let (data, output) = match interpretation {
            Interpretation::Text(text) => (None, Some(text)),
            Interpretation::Structured(object) => (Some(object), None),
        };
        Self {
            success: true,
            mode: Some(mode),
            data,
            output,
            error: None,
            details: None,
            status: 200,
        }
    }

    pub fn failure(err: &AnalyzeError) -> Self {
        Self {
            success: false,
            mode: None,
            data: None,
            output: None,
            error: Some(err.summary().to_string()),
            details: err.details().map(str::to_string),
            status: err.status(),
        }
    }

    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

pub fn assemble(mode: Mode, result: Result<Interpretation, AnalyzeError>) -> AnalysisEnvelope {
    match result {
        Ok(interpretation) => AnalysisEnvelope::success(mode, interpretation),
        Err(err) => AnalysisEnvelope::failure(&err),
    }
}
