//! ScreenText - extract text from photos
//!
//! Command-line front end: add images, run extraction, show the text.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use crossbeam_channel::Receiver;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use screentext::acquire::StdinPicker;
use screentext::config::{self, AppConfig};
use screentext::extract::ExtractEvent;
use screentext::vision::{self, ModelManager};
use screentext::{
    AcquisitionError, BatchExtractor, EngineMode, EngineStrategy, ExtractOptions, ExtractionResult,
    ImageCollection, ImageSource,
};

/// ScreenText - batch OCR over picked images
#[derive(Parser, Debug)]
#[command(name = "screentext", version)]
#[command(about = "Extract text from images with a shared OCR engine")]
struct Args {
    /// Config file (defaults to the per-user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract text from the given image files
    Extract {
        /// Image files, processed and reported in this order
        #[arg(required = true)]
        images: Vec<PathBuf>,

        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Add images one at a time from the terminal, then extract
    Pick {
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Manage trained model files
    Models {
        /// Model directory override
        #[arg(long)]
        model_dir: Option<PathBuf>,

        #[command(subcommand)]
        action: ModelsAction,
    },
    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args, Debug)]
struct EngineArgs {
    /// Directory with <lang>.traineddata files
    #[arg(long)]
    model_dir: Option<PathBuf>,

    /// Language code, e.g. rus or eng+rus
    #[arg(short, long)]
    lang: Option<String>,

    /// Recognition engine mode
    #[arg(long, value_enum)]
    mode: Option<EngineMode>,

    /// Worker threads (0 = all cores)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Engine sharing strategy
    #[arg(long, value_enum)]
    strategy: Option<EngineStrategy>,

    /// Output format
    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormat,
}

#[derive(Subcommand, Debug)]
enum ModelsAction {
    /// List installed languages
    List,
    /// Show size and checksum status of installed models
    Status,
    /// Download models for the given languages
    Fetch {
        #[arg(required = true)]
        languages: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let (config, config_source) = load_or_default_config(args.config.as_deref())?;
    init_logging(&config.logging.level, args.verbose)?;

    match &config_source {
        Some(path) => info!("Loaded configuration from {:?}", path),
        None => info!("Using default configuration"),
    }

    match args.command {
        Command::Extract { images, engine } => {
            let config = engine.apply(config);
            let images = images.into_iter().map(ImageSource::from_path).collect();
            run_extract(&config, images, engine.format)
        }
        Command::Pick { engine } => {
            let config = engine.apply(config);
            run_pick(&config, engine.format)
        }
        Command::Models { model_dir, action } => {
            let mut config = config;
            if model_dir.is_some() {
                config.recognition.model_dir = model_dir;
            }
            run_models(&config, action)
        }
        Command::Config { action } => run_config(&config, args.config.as_deref(), action),
    }
}

/// Initialize logging to stderr so stdout carries only results
fn init_logging(level: &str, verbose: u8) -> Result<()> {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Explicit path must load; the default path is optional
fn load_or_default_config(explicit: Option<&Path>) -> Result<(AppConfig, Option<PathBuf>)> {
    if let Some(path) = explicit {
        return Ok((config::load_config(path)?, Some(path.to_path_buf())));
    }

    if let Ok(path) = screentext::storage::default_config_path() {
        if path.exists() {
            return Ok((config::load_config(&path)?, Some(path)));
        }
    }

    Ok((AppConfig::default(), None))
}

impl EngineArgs {
    /// Overlay command-line flags on the file configuration
    fn apply(&self, mut config: AppConfig) -> AppConfig {
        if let Some(dir) = &self.model_dir {
            config.recognition.model_dir = Some(dir.clone());
        }
        if let Some(lang) = &self.lang {
            config.recognition.language = lang.clone();
        }
        if let Some(mode) = self.mode {
            config.recognition.mode = mode;
        }
        if let Some(workers) = self.workers {
            config.batch.workers = workers;
        }
        if let Some(strategy) = self.strategy {
            config.batch.strategy = strategy;
        }
        config
    }
}

fn run_extract(config: &AppConfig, images: Vec<ImageSource>, format: OutputFormat) -> Result<ExitCode> {
    config.validate()?;
    let spec = config.engine_spec()?;
    let loader = vision::default_loader()?;

    let (tx, rx) = crossbeam_channel::unbounded();
    let extractor = BatchExtractor::new(loader, ExtractOptions::from_config(config)).with_events(tx);
    cancel_on_ctrl_c(extractor.cancellation_token());

    let progress = std::thread::spawn(move || report_progress(rx));
    let result = extractor.run(&spec, &images);
    // Closes the event channel so the progress thread exits
    drop(extractor);
    let _ = progress.join();

    let result = result?;
    print_result(&result, format)?;

    Ok(if result.is_complete() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

fn run_pick(config: &AppConfig, format: OutputFormat) -> Result<ExitCode> {
    let mut picker = StdinPicker::new();
    let mut images = ImageCollection::new();

    loop {
        match images.add_from(&mut picker) {
            Ok(true) => continue,
            Ok(false) => break,
            Err(AcquisitionError::Unsupported) => {
                eprintln!("Image picking is not supported here: stdin is not a terminal.");
                eprintln!("Use `screentext extract <IMAGES>...` instead.");
                return Ok(ExitCode::FAILURE);
            }
            Err(e) => eprintln!("Could not add image: {}", e),
        }
    }

    if images.is_empty() {
        eprintln!("No images added.");
        return Ok(ExitCode::SUCCESS);
    }

    run_extract(config, images.as_slice().to_vec(), format)
}

fn run_models(config: &AppConfig, action: ModelsAction) -> Result<ExitCode> {
    let model_dir = config.model_dir()?;

    match action {
        ModelsAction::List => {
            let manager = ModelManager::open(&model_dir)?;
            for language in manager.available_languages()? {
                println!("{}", language);
            }
        }
        ModelsAction::Status => {
            let manager = ModelManager::open(&model_dir)?;
            println!("Models in {}", model_dir.display());
            for status in manager.model_status()? {
                let verified = match status.verified {
                    Some(true) => "verified",
                    Some(false) => "CHECKSUM MISMATCH",
                    None => "unrecorded",
                };
                println!("  {:<12} {:>10} bytes  {}", status.language, status.size_bytes, verified);
            }
        }
        ModelsAction::Fetch { languages } => {
            let manager = ModelManager::create(&model_dir)?;
            for language in languages {
                let paths = manager
                    .ensure_language(&language)
                    .with_context(|| format!("Failed to fetch model for '{}'", language))?;
                for path in paths {
                    println!("{}", path.display());
                }
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn run_config(config: &AppConfig, explicit: Option<&Path>, action: ConfigAction) -> Result<ExitCode> {
    match action {
        ConfigAction::Init { force } => {
            let path = match explicit {
                Some(path) => path.to_path_buf(),
                None => screentext::storage::default_config_path()?,
            };
            if path.exists() && !force {
                anyhow::bail!("{:?} already exists (use --force to overwrite)", path);
            }
            let mut fresh = AppConfig::default();
            fresh.recognition.model_dir = Some(screentext::storage::default_model_dir()?);
            config::save_config(&fresh, &path)?;
            println!("{}", path.display());
        }
        ConfigAction::Show => {
            print!("{}", toml::to_string_pretty(config)?);
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Cancel the batch between images on Ctrl-C
fn cancel_on_ctrl_c(token: CancellationToken) {
    std::thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(e) => {
                warn!("Ctrl-C handling unavailable: {}", e);
                return;
            }
        };
        rt.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, finishing in-flight images");
                token.cancel();
            }
        });
    });
}

fn report_progress(events: Receiver<ExtractEvent>) {
    let mut total = 0;
    let mut done = 0;
    for event in events {
        match event {
            ExtractEvent::BatchStarted { total: n, workers, .. } => {
                total = n;
                done = 0;
                info!("Processing {} images with {} workers", n, workers);
            }
            ExtractEvent::ImageFinished { path, error, .. } => {
                done += 1;
                match error {
                    None => info!("[{}/{}] {}", done, total, path.display()),
                    Some(kind) => warn!("[{}/{}] {} ({} error)", done, total, path.display(), kind),
                }
            }
            ExtractEvent::BatchFinished { status, succeeded, failed, .. } => {
                info!("Finished ({:?}): {} ok, {} failed", status, succeeded, failed);
            }
        }
    }
}

fn print_result(result: &ExtractionResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => println!("{}", result.to_display_string()),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(result)?),
    }
    Ok(())
}
