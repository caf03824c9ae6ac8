use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::multipart::{Field, MultipartError, MultipartRejection};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use sawce_contracts::envelope::AnalysisEnvelope;
use sawce_contracts::error::AnalyzeError;
use sawce_engine::{Analyzer, ImagePayload, SpooledUpload};
use tokio::net::TcpListener;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

/// Form field names accepted for the uploaded file.
const IMAGE_FIELDS: [&str; 3] = ["image", "photo", "file"];
const MODE_FIELD: &str = "mode";

#[derive(Clone)]
pub struct AppState {
    analyzer: Analyzer,
    upload_dir: Arc<PathBuf>,
    max_upload_bytes: usize,
}

impl AppState {
    pub fn new(analyzer: Analyzer, upload_dir: PathBuf, max_upload_bytes: usize) -> Self {
        Self {
            analyzer,
            upload_dir: Arc::new(upload_dir),
            max_upload_bytes,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route("/analyze", post(analyze))
        .layer(DefaultBodyLimit::max(state.max_upload_bytes))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, app: Router) -> Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

async fn liveness() -> &'static str {
    "Sawce Works analyzer is running"
}

async fn analyze(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let request_id = Uuid::new_v4();
    let span = info_span!("analyze", %request_id);
    async move {
        let started = Instant::now();
        let envelope = match multipart {
            Ok(multipart) => match read_form(multipart, &state).await {
                Ok(form) => {
                    state
                        .analyzer
                        .analyze(form.mode.as_deref(), form.image)
                        .await
                }
                Err(err) => {
                    warn!(kind = err.kind(), error = %err, "upload rejected");
                    AnalysisEnvelope::failure(&err)
                }
            },
            // A body that is not multipart carries no file.
            Err(rejection) => {
                debug!(reason = %rejection.body_text(), "request is not a multipart form");
                AnalysisEnvelope::failure(&AnalyzeError::MissingImage)
            }
        };
        info!(
            status = envelope.status,
            success = envelope.success,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request finished"
        );
        envelope_response(envelope)
    }
    .instrument(span)
    .await
}

#[derive(Debug, Default)]
struct AnalyzeForm {
    mode: Option<String>,
    image: Option<ImagePayload>,
}

async fn read_form(
    mut multipart: Multipart,
    state: &AppState,
) -> Result<AnalyzeForm, AnalyzeError> {
    let limit = state.max_upload_bytes;
    let mut form = AnalyzeForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| upload_error(err, limit))?
    {
        let name = field.name().unwrap_or_default().trim().to_string();
        if name == MODE_FIELD {
            let value = field.text().await.map_err(|err| upload_error(err, limit))?;
            if form.mode.is_none() {
                form.mode = Some(value);
            }
        } else if IMAGE_FIELDS.contains(&name.as_str()) {
            if form.image.is_some() {
                debug!(field = %name, "ignoring additional image field");
                continue;
            }
            form.image = spool_field(field, &state.upload_dir, limit).await?;
        } else {
            debug!(field = %name, "ignoring unknown form field");
        }
    }
    Ok(form)
}

/// Streams one file field to disk. Empty parts count as no image.
async fn spool_field(
    mut field: Field<'_>,
    upload_dir: &Path,
    limit: usize,
) -> Result<Option<ImagePayload>, AnalyzeError> {
    let media_type = field.content_type().map(str::to_string);
    let mut spool = SpooledUpload::create_in(upload_dir).await.map_err(|err| {
        AnalyzeError::ImageProcessing(format!("failed to create upload spool: {err}"))
    })?;
    while let Some(chunk) = field.chunk().await.map_err(|err| upload_error(err, limit))? {
        spool.append(&chunk).await.map_err(spool_write_failed)?;
    }
    spool.finish().await.map_err(spool_write_failed)?;
    if spool.is_empty() {
        return Ok(None);
    }
    debug!(
        bytes = spool.len(),
        media_type = media_type.as_deref().unwrap_or("unknown"),
        "spooled upload"
    );
    Ok(Some(ImagePayload::spooled(spool, media_type)))
}

/// Bodies cut off by the size limit surface here as stream errors.
fn upload_error(err: MultipartError, limit: usize) -> AnalyzeError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AnalyzeError::UploadTooLarge(format!("request body exceeds the {limit} byte limit"))
    } else {
        AnalyzeError::InvalidUpload(err.body_text())
    }
}

fn spool_write_failed(err: std::io::Error) -> AnalyzeError {
    AnalyzeError::ImageProcessing(format!("failed to write upload spool: {err}"))
}

fn envelope_response(envelope: AnalysisEnvelope) -> Response {
    let status =
        StatusCode::from_u16(envelope.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(envelope)).into_response()
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::net::SocketAddr;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
    use reqwest::multipart::{Form, Part};
    use sawce_contracts::error::AnalyzeError;
    use sawce_contracts::modes::ModeRegistry;
    use sawce_engine::{Analyzer, InferenceConfig, InferenceInvoker, InferenceRequest};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    use super::{router, AppState, DEFAULT_MAX_UPLOAD_BYTES};

    struct CountingInvoker {
        calls: AtomicUsize,
        reply: String,
    }

    #[async_trait]
    impl InferenceInvoker for CountingInvoker {
        fn name(&self) -> &str {
            "counting"
        }

        async fn invoke(&self, _request: &InferenceRequest) -> Result<String, AnalyzeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.clone())
        }
    }

    struct TestServer {
        addr: SocketAddr,
        invoker: Arc<CountingInvoker>,
        upload_dir: PathBuf,
        _temp: tempfile::TempDir,
    }

    impl TestServer {
        async fn start(reply: &str) -> anyhow::Result<Self> {
            Self::start_with_limit(reply, DEFAULT_MAX_UPLOAD_BYTES).await
        }

        async fn start_with_limit(reply: &str, max_upload_bytes: usize) -> anyhow::Result<Self> {
            let temp = tempfile::tempdir()?;
            let upload_dir = temp.path().join("uploads");
            std::fs::create_dir_all(&upload_dir)?;
            let invoker = Arc::new(CountingInvoker {
                calls: AtomicUsize::new(0),
                reply: reply.to_string(),
            });
            let analyzer = Analyzer::new(
                ModeRegistry::new(None)?,
                invoker.clone(),
                InferenceConfig::default(),
            );
            let app = router(AppState::new(
                analyzer,
                upload_dir.clone(),
                max_upload_bytes,
            ));
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let addr = listener.local_addr()?;
            tokio::spawn(async move {
                let _ = axum::serve(listener, app).await;
            });
            Ok(Self {
                addr,
                invoker,
                upload_dir,
                _temp: temp,
            })
        }

        fn url(&self, path: &str) -> String {
            format!("http://{}{path}", self.addr)
        }

        fn calls(&self) -> usize {
            self.invoker.calls.load(Ordering::SeqCst)
        }

        async fn post_form(&self, form: Form) -> anyhow::Result<(u16, Value)> {
            let response = reqwest::Client::new()
                .post(self.url("/analyze"))
                .multipart(form)
                .send()
                .await?;
            let status = response.status().as_u16();
            Ok((status, response.json().await?))
        }
    }

    fn photo_part() -> anyhow::Result<Part> {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(40, 30, Rgba([120, 80, 40, 200])))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        Ok(Part::bytes(bytes)
            .file_name("bench.png")
            .mime_str("image/png")?)
    }

    #[tokio::test]
    async fn safety_upload_returns_output_envelope() -> anyhow::Result<()> {
        let server = TestServer::start("Safety Score: 7/10\nWarning: loose joints").await?;
        let form = Form::new()
            .text("mode", "safety")
            .part("image", photo_part()?);
        let (status, body) = server.post_form(form).await?;

        assert_eq!(status, 200);
        assert_eq!(
            body,
            json!({
                "success": true,
                "mode": "safety",
                "output": "Safety Score: 7/10\nWarning: loose joints",
            })
        );
        assert_eq!(server.calls(), 1);
        assert_eq!(std::fs::read_dir(&server.upload_dir)?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn photo_alias_and_structured_mode() -> anyhow::Result<()> {
        let server = TestServer::start("```json\n{\"type\":\"supply\",\"items\":[]}\n```").await?;
        let form = Form::new()
            .part("photo", photo_part()?)
            .text("mode", " Supply ");
        let (status, body) = server.post_form(form).await?;

        assert_eq!(status, 200);
        assert_eq!(body["mode"], json!("supply"));
        assert_eq!(body["data"], json!({"type": "supply", "items": []}));
        assert!(body.get("output").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn missing_image_is_rejected_without_inference() -> anyhow::Result<()> {
        let server = TestServer::start("unused").await?;
        let (status, body) = server
            .post_form(Form::new().text("mode", "safety"))
            .await?;
        assert_eq!(status, 400);
        assert_eq!(body, json!({"success": false, "error": "No image uploaded"}));

        let empty = Form::new().part("image", Part::bytes(Vec::new()).file_name("empty.png"));
        let (status, _) = server.post_form(empty).await?;
        assert_eq!(status, 400);
        assert_eq!(server.calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn non_multipart_body_is_missing_image() -> anyhow::Result<()> {
        let server = TestServer::start("unused").await?;
        let response = reqwest::Client::new()
            .post(server.url("/analyze"))
            .json(&json!({"mode": "safety"}))
            .send()
            .await?;
        assert_eq!(response.status().as_u16(), 400);
        let body: Value = response.json().await?;
        assert_eq!(body, json!({"success": false, "error": "No image uploaded"}));
        assert_eq!(server.calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_structured_output_is_server_error() -> anyhow::Result<()> {
        let server = TestServer::start("not json at all").await?;
        let form = Form::new().text("mode", "dupe").part("file", photo_part()?);
        let (status, body) = server.post_form(form).await?;

        assert_eq!(status, 500);
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["error"], json!("Model returned malformed output"));
        assert!(body.get("data").is_none());
        assert_eq!(std::fs::read_dir(&server.upload_dir)?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn oversized_upload_is_payload_too_large() -> anyhow::Result<()> {
        let server = TestServer::start_with_limit("unused", 1024).await?;
        let oversized = Part::bytes(vec![0x42; 16 * 1024])
            .file_name("huge.png")
            .mime_str("image/png")?;
        let form = Form::new().text("mode", "safety").part("image", oversized);
        let (status, body) = server.post_form(form).await?;

        assert_eq!(status, 413);
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["error"], json!("Upload too large"));
        assert_eq!(
            body["details"],
            json!("request body exceeds the 1024 byte limit")
        );
        assert_eq!(server.calls(), 0);
        assert_eq!(std::fs::read_dir(&server.upload_dir)?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn liveness_probe_answers() -> anyhow::Result<()> {
        let server = TestServer::start("unused").await?;
        let response = reqwest::get(server.url("/")).await?;
        assert_eq!(response.status().as_u16(), 200);
        assert!(response.text().await?.contains("running"));
        Ok(())
    }
}
