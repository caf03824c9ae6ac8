use std::env;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use sawce_contracts::modes::ModeRegistry;
use sawce_engine::config::{
    first_non_empty_env, DEFAULT_MAX_IMAGE_DIM, DEFAULT_MAX_OUTPUT_TOKENS, DEFAULT_TEMPERATURE,
    DEFAULT_TIMEOUT,
};
use sawce_engine::{
    Analyzer, DryrunInvoker, ImagePayload, InferenceConfig, InferenceInvoker, OpenAiInvoker,
};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod server;

use server::{AppState, DEFAULT_MAX_UPLOAD_BYTES};

#[derive(Debug, Parser)]
#[command(name = "sawce", version, about = "Sawce Works image analyzer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve `POST /analyze` over HTTP.
    Serve(ServeArgs),
    /// Analyze one local image and print the envelope.
    Analyze(AnalyzeArgs),
    /// List the available analysis modes.
    Modes(ModesArgs),
}

#[derive(Debug, Args)]
struct InferenceArgs {
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    modes_file: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_TEMPERATURE)]
    temperature: f32,
    #[arg(long, default_value_t = DEFAULT_MAX_OUTPUT_TOKENS)]
    max_output_tokens: u32,
    #[arg(long, default_value_t = DEFAULT_TIMEOUT.as_secs())]
    timeout_secs: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_IMAGE_DIM)]
    max_image_dim: u32,
    /// Answer locally in each mode's shape instead of calling the model.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[arg(long, default_value = "0.0.0.0:3000")]
    bind: String,
    #[arg(long)]
    upload_dir: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
    max_upload_bytes: usize,
    #[command(flatten)]
    inference: InferenceArgs,
}

#[derive(Debug, Args)]
struct AnalyzeArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    mode: Option<String>,
    #[command(flatten)]
    inference: InferenceArgs,
}

#[derive(Debug, Args)]
struct ModesArgs {
    #[arg(long)]
    modes_file: Option<PathBuf>,
}

impl InferenceArgs {
    fn config(&self) -> InferenceConfig {
        let mut config = InferenceConfig::from_env();
        if let Some(model) = self
            .model
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            config.model = model.to_string();
        }
        config.temperature = self.temperature;
        config.max_output_tokens = self.max_output_tokens.max(1);
        config.timeout = Duration::from_secs(self.timeout_secs.max(1));
        config.max_image_dim = self.max_image_dim;
        config
    }

    fn invoker(&self, config: &InferenceConfig) -> Result<Arc<dyn InferenceInvoker>> {
        if self.dry_run {
            return Ok(Arc::new(DryrunInvoker));
        }
        Ok(Arc::new(OpenAiInvoker::new(config)?))
    }

    fn analyzer(&self) -> Result<Analyzer> {
        let registry = load_registry(self.modes_file.as_deref())?;
        let config = self.config();
        let invoker = self.invoker(&config)?;
        Ok(Analyzer::new(registry, invoker, config))
    }
}

fn load_registry(modes_file: Option<&Path>) -> Result<ModeRegistry> {
    let path = modes_file
        .map(Path::to_path_buf)
        .or_else(|| first_non_empty_env(&["SAWCE_MODES_FILE"]).map(PathBuf::from));
    match path {
        Some(path) => ModeRegistry::from_override_file(&path),
        None => ModeRegistry::new(None),
    }
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("sawce error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_tracing();
    match cli.command {
        Command::Serve(args) => block_on(run_serve(args)),
        Command::Analyze(args) => block_on(run_analyze(args)),
        Command::Modes(args) => run_modes(args),
    }
}

fn block_on(task: impl Future<Output = Result<i32>>) -> Result<i32> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?
        .block_on(task)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_serve(args: ServeArgs) -> Result<i32> {
    let analyzer = args.inference.analyzer()?;
    let upload_dir = args
        .upload_dir
        .clone()
        .unwrap_or_else(|| env::temp_dir().join("sawce-uploads"));
    tokio::fs::create_dir_all(&upload_dir)
        .await
        .with_context(|| format!("failed to create upload dir {}", upload_dir.display()))?;
    let listener = TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    info!(
        addr = %listener.local_addr()?,
        invoker = analyzer.invoker_name(),
        model = %analyzer.config().model,
        upload_dir = %upload_dir.display(),
        "sawce analyzer listening"
    );
    let app = server::router(AppState::new(analyzer, upload_dir, args.max_upload_bytes));
    server::serve(listener, app).await?;
    Ok(0)
}

async fn run_analyze(args: AnalyzeArgs) -> Result<i32> {
    let analyzer = args.inference.analyzer()?;
    let bytes = tokio::fs::read(&args.image)
        .await
        .with_context(|| format!("failed to read {}", args.image.display()))?;
    let payload = ImagePayload::from_bytes(bytes, media_type_for_path(&args.image));
    let envelope = analyzer.analyze(args.mode.as_deref(), Some(payload)).await;
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(if envelope.success { 0 } else { 1 })
}

fn run_modes(args: ModesArgs) -> Result<i32> {
    let registry = load_registry(args.modes_file.as_deref())?;
    for spec in registry.list() {
        println!(
            "{:<8} {:<16} {}",
            spec.mode.as_str(),
            spec.expected.name(),
            spec.label
        );
    }
    Ok(0)
}

fn media_type_for_path(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let media_type = match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "heic" => "image/heic",
        _ => return None,
    };
    Some(media_type.to_string())
}
