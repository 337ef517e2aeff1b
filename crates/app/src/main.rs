mod remote;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use figure_extract_core::config::{DEFAULT_ENGINE_JAR, DEFAULT_JAVA_OPTS, DEFAULT_PUBLIC_BASE_URL};
use figure_extract_core::{
    router, DocumentReference, EngineConfig, JobOrchestrator, Pdffigures2Engine, ServiceConfig,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "figure-extract", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory for published artifacts and job workspaces
    #[arg(long, env = "OUTPUT_FOLDER", default_value = "output")]
    output_dir: PathBuf,

    /// Public base URL that artifact URLs are rooted at
    #[arg(long, env = "RESOURCE_BASE_URL", default_value = DEFAULT_PUBLIC_BASE_URL)]
    public_base_url: String,

    /// Wall-clock limit for one engine run, in seconds
    #[arg(long, env = "ENGINE_TIMEOUT_SECS", default_value = "120")]
    engine_timeout_secs: u64,

    /// Limit for downloading a remote document, in seconds
    #[arg(long, env = "DOWNLOAD_TIMEOUT_SECS", default_value = "30")]
    download_timeout_secs: u64,

    /// Maximum number of jobs running at once
    #[arg(long, env = "MAX_CONCURRENT_JOBS", default_value = "4")]
    max_concurrent_jobs: usize,

    /// How long a job may wait for a free slot before being rejected (0 = reject at once)
    #[arg(long, env = "ADMISSION_TIMEOUT_SECS", default_value = "0")]
    admission_timeout_secs: u64,

    /// Largest accepted document, in MiB
    #[arg(long, env = "MAX_DOCUMENT_MB", default_value = "50")]
    max_document_mb: u64,

    /// pdffigures2 jar passed to `java -jar`
    #[arg(long, env = "PDFFIGURES_JAR_PATH", default_value = DEFAULT_ENGINE_JAR)]
    engine_jar: String,

    /// JVM options placed before `-jar`
    #[arg(long, env = "JAVA_OPTS", default_value = DEFAULT_JAVA_OPTS)]
    java_opts: String,

    /// Replace the java invocation with this command line (program and leading args)
    #[arg(long, env = "ENGINE_COMMAND")]
    engine_command: Option<String>,

    /// Working directory for the engine process
    #[arg(long, env = "PDFFIGURES_WORK_DIR")]
    engine_work_dir: Option<PathBuf>,

    /// Render resolution for figure images
    #[arg(long, env = "ENGINE_DPI", default_value = "300")]
    dpi: u32,

    /// The engine already reports 1-indexed pages
    #[arg(long, default_value_t = false)]
    one_based_pages: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the extraction API, the tool endpoint, and published artifacts.
    Serve {
        #[arg(long, env = "SERVER_HOST", default_value = "0.0.0.0")]
        host: String,
        #[arg(long, env = "SERVER_PORT", default_value = "5001")]
        port: u16,
    },
    /// Extract figures from a local PDF and print the result as JSON.
    Extract {
        /// Path to the input PDF.
        input: PathBuf,
        /// Write the JSON result here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Upload a local PDF to a running service and download the rendered figures.
    Fetch {
        /// Path to the input PDF.
        input: PathBuf,
        /// Base URL of the running service.
        #[arg(long, default_value = "http://localhost:5001")]
        service_url: String,
        /// Directory the figure images are downloaded into.
        #[arg(long = "output-dir", default_value = "output")]
        download_dir: PathBuf,
    },
}

impl Cli {
    fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        let mut engine = match &self.engine_command {
            Some(command_line) => {
                let mut parts = command_line.split_whitespace().map(str::to_string);
                let program = parts
                    .next()
                    .context("--engine-command must name a program")?;
                EngineConfig {
                    program,
                    args: parts.collect(),
                    ..EngineConfig::default()
                }
            }
            None => EngineConfig::pdffigures2(self.engine_jar.clone(), &self.java_opts),
        };

        engine.working_dir = self.engine_work_dir.clone();
        engine.dpi = self.dpi;
        engine.timeout = Duration::from_secs(self.engine_timeout_secs);
        engine.zero_based_pages = !self.one_based_pages;
        Ok(engine)
    }

    fn service_config(&self) -> anyhow::Result<ServiceConfig> {
        let mut config = ServiceConfig::default()
            .with_output_root(&self.output_dir)
            .with_public_base_url(&self.public_base_url)?;
        config.download_timeout = Duration::from_secs(self.download_timeout_secs);
        config.max_concurrent_jobs = self.max_concurrent_jobs;
        config.admission_timeout = Duration::from_secs(self.admission_timeout_secs);
        config.max_document_bytes = self.max_document_mb.saturating_mul(1024 * 1024);
        config.engine = self.engine_config()?;
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "figure-extract boot"
    );

    match &cli.command {
        Command::Serve { host, port } => {
            let config = Arc::new(cli.service_config()?);
            serve(config, host, *port).await
        }
        Command::Extract { input, output } => {
            let config = Arc::new(cli.service_config()?);
            extract(config, input, output.as_deref()).await
        }
        Command::Fetch {
            input,
            service_url,
            download_dir,
        } => {
            let result = remote::fetch(input, service_url, download_dir).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
    }
}

async fn serve(config: Arc<ServiceConfig>, host: &str, port: u16) -> anyhow::Result<()> {
    let engine = Pdffigures2Engine::new(config.engine.clone());
    let orchestrator = Arc::new(JobOrchestrator::new(config.clone(), engine)?);

    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .with_context(|| format!("cannot bind {host}:{port}"))?;
    info!(
        address = %listener.local_addr()?,
        output_root = %config.output_root.display(),
        public_base_url = %config.public_base_url,
        max_concurrent_jobs = config.max_concurrent_jobs,
        "listening"
    );

    axum::serve(listener, router(orchestrator))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(%error, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn extract(config: Arc<ServiceConfig>, input: &Path, output: Option<&Path>) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(input)
        .await
        .with_context(|| format!("cannot read {}", input.display()))?;
    let filename = input
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("document.pdf")
        .to_string();

    let engine = Pdffigures2Engine::new(config.engine.clone());
    let orchestrator = JobOrchestrator::new(config, engine)?;

    let result = orchestrator
        .run(DocumentReference::LocalUpload { bytes, filename })
        .await
        .map_err(|failure| {
            let body = serde_json::to_string(&failure.to_body()).unwrap_or_default();
            anyhow::Error::new(failure).context(body)
        })?;

    let rendered = serde_json::to_string_pretty(&result)?;
    match output {
        Some(path) => {
            tokio::fs::write(path, rendered)
                .await
                .with_context(|| format!("cannot write {}", path.display()))?;
            info!(path = %path.display(), regions = result.stats.total_regions, "result written");
        }
        None => println!("{rendered}"),
    }

    Ok(())
}
