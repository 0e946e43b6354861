use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

use sourcewatch::app::ports::TextGenerator;
use sourcewatch::config::Config;
use sourcewatch::constants::DEFAULT_STATE_DIR;
use sourcewatch::error::ConfigError;
use sourcewatch::infra::{OpenAiCompatibleGenerator, PopplerPdfExtractor, ReqwestHttp};
use sourcewatch::pipeline::storage::{DedupStore, SqliteStateStore};
use sourcewatch::pipeline::{compose, PipelineDeps, PipelineRunner, RunOptions};
use sourcewatch::{logging, metrics};

const EXIT_PIPELINE: u8 = 1;
const EXIT_CONFIG: u8 = 2;

#[derive(Parser)]
#[command(name = "sourcewatch")]
#[command(about = "Template-driven document monitoring pipeline")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline for a template
    Run {
        /// Template file (.toml or .json)
        template: PathBuf,
        /// Print a bounded preview of the final context
        #[arg(long)]
        dry_run: bool,
        /// Directory holding state.db
        #[arg(long, default_value = DEFAULT_STATE_DIR)]
        state_dir: PathBuf,
    },
    /// Load and validate a template without running it
    Validate { template: PathBuf },
    /// Print the stages a template composes to
    Stages { template: PathBuf },
    /// List the metrics this binary records
    Metrics,
}

fn load(path: &Path) -> Result<Config, ConfigError> {
    let config = Config::load(path)?;
    info!("Loaded template '{}' from {}", config.template_name, path.display());
    Ok(config)
}

fn config_failure(e: impl std::fmt::Display) -> ExitCode {
    error!("Configuration error: {}", e);
    println!("❌ Configuration error: {e}");
    ExitCode::from(EXIT_CONFIG)
}

async fn run(template: &Path, dry_run: bool, state_dir: &Path) -> ExitCode {
    let config = match load(template) {
        Ok(config) => Arc::new(config),
        Err(e) => return config_failure(e),
    };

    let http = match ReqwestHttp::new() {
        Ok(http) => Arc::new(http),
        Err(e) => {
            error!("Failed to build HTTP client: {}", e);
            return ExitCode::from(EXIT_PIPELINE);
        }
    };
    let store = match SqliteStateStore::open_at_root(state_dir) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to open state store in {}: {}", state_dir.display(), e);
            return ExitCode::from(EXIT_PIPELINE);
        }
    };
    let generator = match OpenAiCompatibleGenerator::from_env() {
        Ok(generator) => generator.map(|g| Arc::new(g) as Arc<dyn TextGenerator>),
        Err(e) => {
            warn!("Text generator unavailable: {:#}", e);
            None
        }
    };
    let ocr_lang = config
        .processing
        .as_ref()
        .map(|p| p.ocr_lang.clone())
        .unwrap_or_else(|| sourcewatch::constants::DEFAULT_OCR_LANG.to_string());

    let deps = PipelineDeps::new(http, store.clone())
        .with_pdf(Arc::new(PopplerPdfExtractor::new(ocr_lang)))
        .with_generator(generator);
    let runner = match PipelineRunner::new(config.clone(), deps) {
        Ok(runner) => runner,
        Err(e) => return config_failure(e),
    };

    println!("🚀 Running '{}': {}", config.template_name, runner.stage_names().join(" → "));
    match runner.run_with_options(RunOptions { dry_run }).await {
        Ok(summary) => {
            println!(
                "✅ Finished in {:.2}s with {} records",
                summary.duration.as_secs_f64(),
                summary.context.record_count()
            );
            if let Ok(total) = store.count().await {
                println!("   Known events: {total}");
            }
            if let Some(lines) = summary.preview {
                println!("\n📋 Dry-run preview (side effects were not suppressed):");
                for line in lines {
                    println!("   {line}");
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) if e.is_config() => config_failure(e),
        Err(e) => {
            error!("Pipeline failed: {}", e);
            println!("❌ Pipeline failed: {e}");
            ExitCode::from(EXIT_PIPELINE)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    logging::init_logging();
    metrics::init_metrics();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            template,
            dry_run,
            state_dir,
        } => run(&template, dry_run, &state_dir).await,
        Commands::Validate { template } => match load(&template) {
            Ok(config) => {
                println!("✅ Template '{}' is valid", config.template_name);
                ExitCode::SUCCESS
            }
            Err(e) => config_failure(e),
        },
        Commands::Stages { template } => match load(&template) {
            Ok(config) => {
                for (i, kind) in compose(&config).iter().enumerate() {
                    println!("{}. {}", i + 1, kind);
                }
                ExitCode::SUCCESS
            }
            Err(e) => config_failure(e),
        },
        Commands::Metrics => {
            for doc in metrics::registry::all_documentation() {
                println!("{} ({:?}) {}", doc.name, doc.metric_type, doc.help);
                if !doc.labels.is_empty() {
                    println!("    labels: {}", doc.labels.join(", "));
                }
            }
            ExitCode::SUCCESS
        }
    }
}
