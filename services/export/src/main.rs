//! Dataslice export CLI
//!
//! Exports one dataslice of the curation backend into a local folder.
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/export.toml, /etc/dataverse/export.toml)
//! 2. Environment variables (prefixed with EXPORT__)
//! 3. Command line flags, which override both
//!
//! See `config.rs` for detailed configuration options.

use clap::Parser;
use dataverse_export::{
    AnnotationSource, ConfigError, ExportConfig, ExportFormat, ExportJob, Exporter, HttpBackend,
    HttpFetcher, LocalSink, LoggingConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "export-dataslice", version, about = "Export a dataslice to a local folder")]
struct Args {
    #[arg(long)]
    dataslice_id: i64,

    /// Folder the export is written into, created if missing
    #[arg(long)]
    target_folder: PathBuf,

    /// visionai, coco, yolo or vlm
    #[arg(long, default_value = "visionai")]
    export_format: String,

    /// Annotation source: groundtruth or a model name
    #[arg(long, default_value = "groundtruth")]
    anno: String,

    /// Keep the frames of each sequence in one document
    #[arg(long)]
    sequential: bool,

    #[arg(long, env = "EXPORT__BACKEND__HOST")]
    host: Option<String>,

    #[arg(long, env = "EXPORT__BACKEND__SERVICE_ID")]
    service_id: Option<String>,

    #[arg(long, env = "EXPORT__BACKEND__ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (mut config, file_error) = load_config()?;
    if let Some(host) = &args.host {
        config.backend.host = host.clone();
    }
    if let Some(service_id) = &args.service_id {
        config.backend.service_id = service_id.clone();
    }
    if args.access_token.is_some() {
        config.backend.access_token = args.access_token.clone();
    }

    init_logging(&config.logging)?;
    if let Some(e) = file_error {
        warn!(error = %e, "Failed to load config from files, fell back to environment");
    }

    info!(
        service = "dataverse-export",
        version = env!("CARGO_PKG_VERSION"),
        dataslice_id = args.dataslice_id,
        "Starting dataslice export"
    );

    config.validate()?;

    // Unknown formats fail before any backend call
    let format: ExportFormat = args.export_format.parse()?;

    tokio::fs::create_dir_all(&args.target_folder).await?;
    let target_folder = args.target_folder.display().to_string();

    let exporter = Exporter::new(
        Arc::new(HttpBackend::new(&config.backend)?),
        Arc::new(HttpFetcher::new(config.request_timeout())?),
        Arc::new(LocalSink::new(&args.target_folder)),
        config,
    );
    let job = ExportJob {
        dataslice_id: args.dataslice_id,
        target_folder,
        format,
        source: AnnotationSource::from_name(&args.anno),
        is_sequential: args.sequential,
    };

    match exporter.run(&job).await {
        Ok(summary) => {
            info!(
                files_written = summary.files_written,
                media_dropped = summary.media_dropped,
                "Export completed successfully"
            );
            println!(
                "Exported {} files to {} ({} media files dropped)",
                summary.files_written, job.target_folder, summary.media_dropped
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Export failed");
            Err(e.into())
        }
    }
}

/// Load configuration, falling back to environment only.
///
/// Logging is not up yet, so the file error is handed back instead of logged.
fn load_config() -> anyhow::Result<(ExportConfig, Option<ConfigError>)> {
    load_with_fallback(ExportConfig::load, ExportConfig::from_env)
}

fn load_with_fallback<L, F>(
    load: L,
    fallback: F,
) -> anyhow::Result<(ExportConfig, Option<ConfigError>)>
where
    L: FnOnce() -> Result<ExportConfig, ConfigError>,
    F: FnOnce() -> Result<ExportConfig, ConfigError>,
{
    match load() {
        Ok(config) => Ok((config, None)),
        Err(e) => Ok((fallback()?, Some(e))),
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("dataverse_export={}", level).parse()?)
        .add_directive(format!("export_dataslice={}", level).parse()?)
        .add_directive("reqwest=warn".parse()?)
        .add_directive("hyper=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}
