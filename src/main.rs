//! schematic-symbols - detect electrical symbols on schematic pages
//!
//! Runs one page through the detection pipeline and prints the result as JSON.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use schematic_symbols::config::{load_config, save_config, AppConfig};
use schematic_symbols::detection::TemplateLibrary;
use schematic_symbols::jobs::events::ChannelEventSink;
use schematic_symbols::jobs::DetectionOrchestrator;
use schematic_symbols::ml::TensorRuntime;
use schematic_symbols::storage::{get_config_dir, DetectionRepository, MemoryRepository, SqliteRepository};
use schematic_symbols::SymbolDetectionPipeline;

/// Schematic symbol detection
#[derive(Parser, Debug)]
#[command(name = "schematic-symbols")]
#[command(about = "Detect electrical symbols on schematic page images")]
struct Args {
    /// Config file (defaults to <config dir>/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Detect symbols on one page image
    Detect {
        /// Page image (PNG, JPEG, ...)
        image: PathBuf,

        /// Page number recorded in the result
        #[arg(long, default_value = "1")]
        page: u32,

        /// Document id recorded in the result (defaults to the file name)
        #[arg(long)]
        document: Option<String>,

        /// Disable the neural ensemble
        #[arg(long)]
        no_ml: bool,

        /// Disable geometric pattern matching
        #[arg(long)]
        no_pattern: bool,

        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Minimum confidence for reported symbols
        #[arg(long)]
        threshold: Option<f64>,

        #[arg(long)]
        max_symbols: Option<usize>,

        /// SQLite database for results and the result cache
        #[arg(long)]
        db: Option<PathBuf>,

        /// Template library JSON (defaults to the built-in library)
        #[arg(long)]
        templates: Option<PathBuf>,

        /// Print progress events to stderr
        #[arg(long)]
        events: bool,
    },

    /// List the built-in templates, optionally exporting them as JSON
    Templates {
        #[arg(long)]
        export: Option<PathBuf>,
    },

    /// Write the default config file
    InitConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let config_path = match args.config {
        Some(path) => path,
        None => get_config_dir()?.join("config.toml"),
    };

    match args.command {
        Command::InitConfig => {
            save_config(&AppConfig::default(), &config_path)?;
            println!("Wrote default config to {}", config_path.display());
            Ok(())
        }
        Command::Templates { export } => {
            let library = TemplateLibrary::builtin();
            for template in library.templates() {
                println!(
                    "{:<28} {:<18} {:<8} variants={} keypoints={}",
                    template.id,
                    format!("{:?}", template.symbol_category),
                    format!("{:?}", template.priority),
                    template.variants.len(),
                    template.keypoints.len()
                );
            }
            if let Some(path) = export {
                library.save(&path)?;
                println!("Exported {} templates to {}", library.len(), path.display());
            }
            Ok(())
        }
        Command::Detect {
            image,
            page,
            document,
            no_ml,
            no_pattern,
            timeout_ms,
            threshold,
            max_symbols,
            db,
            templates,
            events,
        } => {
            let config = read_config(&config_path);
            let mut settings = config.detection.clone();
            settings.enable_ml_classification &= !no_ml;
            settings.enable_pattern_matching &= !no_pattern;
            if let Some(ms) = timeout_ms {
                settings.processing_timeout_ms = ms;
            }
            if let Some(t) = threshold {
                settings.confidence_threshold = t.clamp(0.0, 1.0);
            }
            if let Some(n) = max_symbols {
                settings.max_symbols_per_page = n;
            }

            let library = match templates {
                Some(path) => TemplateLibrary::load(&path)?,
                None => TemplateLibrary::builtin(),
            };
            let runtime = TensorRuntime::from_config(&config.ml);
            let shutdown = CancellationToken::new();
            let sweeper = runtime.spawn_sweeper(Duration::from_millis(config.ml.sweep_interval_ms), shutdown.clone());

            let pipeline = SymbolDetectionPipeline::from_config(&config, Arc::new(library), runtime)?;
            info!("ML backend: {}", pipeline.ml().classifier_name());

            let repository: Arc<dyn DetectionRepository> = match db.or_else(|| config.storage.database_path.clone()) {
                Some(path) => Arc::new(SqliteRepository::open(&path)?),
                None => Arc::new(MemoryRepository::new()),
            };

            let (sink, receiver) = ChannelEventSink::unbounded();
            let printer = events.then(|| {
                std::thread::spawn(move || {
                    for event in receiver {
                        if let Ok(line) = serde_json::to_string(&event) {
                            eprintln!("{}", line);
                        }
                    }
                })
            });

            let orchestrator = DetectionOrchestrator::new(Arc::new(pipeline), repository, Arc::new(sink), &config);
            let bytes = std::fs::read(&image).with_context(|| format!("Failed to read {}", image.display()))?;
            let document_id = document.unwrap_or_else(|| document_name(&image));

            let outcome = orchestrator.detect(document_id, None, page, bytes, settings).await;

            shutdown.cancel();
            let _ = sweeper.await;
            drop(orchestrator);
            if let Some(handle) = printer {
                let _ = handle.join();
            }

            let result = outcome?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
    }
}

fn read_config(path: &Path) -> AppConfig {
    if !path.exists() {
        return AppConfig::default();
    }
    match load_config(path) {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load config from {}: {}. Using defaults.", path.display(), e);
            AppConfig::default()
        }
    }
}

fn document_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string())
}
