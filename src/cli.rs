use crate::{
    format_duration, parse_url_list, AnalysisKind, CatApiClient, Config, OutputFormat,
    PipelineManager, PrometheusExporter, SourceRef, StatsSnapshot,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::fs;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "image-pipeline")]
#[command(about = "Staged download, analysis and save pipeline for remote images")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, help = "Number of download workers")]
    pub download_workers: Option<usize>,

    #[arg(long, help = "Number of process workers (default: CPU cores)")]
    pub process_workers: Option<usize>,

    #[arg(long, help = "Number of save workers")]
    pub save_workers: Option<usize>,

    #[arg(short, long, help = "Output directory for saved artifacts")]
    pub output: Option<PathBuf>,

    #[arg(long, help = "Output format (png, jpeg)")]
    pub format: Option<String>,

    #[arg(long, help = "Analysis to run (edges, corners, circles)")]
    pub analysis: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fetch a listing from the cat API and run it through the pipeline
    Run {
        #[arg(short, long, default_value = "10", help = "Number of images to request")]
        limit: usize,

        #[arg(long, help = "Progress reporting interval in seconds")]
        progress_interval: Option<u64>,

        #[arg(long, help = "Write Prometheus metrics to this file when done")]
        metrics_out: Option<PathBuf>,
    },

    /// Run the pipeline over URLs from a file
    Batch {
        #[arg(short, long, help = "Input file containing URLs (one per line)")]
        input: PathBuf,

        #[arg(long, help = "Progress reporting interval in seconds")]
        progress_interval: Option<u64>,

        #[arg(long, help = "Write Prometheus metrics to this file when done")]
        metrics_out: Option<PathBuf>,
    },

    /// Validate configuration
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

impl Cli {
    /// Apply command-line overrides on top of a loaded configuration.
    pub fn apply_overrides(&self, config: &mut Config) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(download_workers) = self.download_workers {
            config.download_workers = download_workers;
        }

        if let Some(process_workers) = self.process_workers {
            config.process_workers = process_workers;
        }

        if let Some(save_workers) = self.save_workers {
            config.save_workers = save_workers;
        }

        if let Some(output) = &self.output {
            config.output_dir = output.clone();
        }

        if let Some(format) = &self.format {
            config.output_format = format.parse::<OutputFormat>()?;
        }

        if let Some(analysis) = &self.analysis {
            config.analysis = analysis.parse::<AnalysisKind>()?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub progress_interval: Option<u64>,
    pub metrics_out: Option<PathBuf>,
}

pub struct CliRunner {
    pub config: Config,
}

impl CliRunner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(&self, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
        match command {
            Commands::Run {
                limit,
                progress_interval,
                metrics_out,
            } => {
                self.run_listing(
                    limit,
                    RunOptions {
                        progress_interval,
                        metrics_out,
                    },
                )
                .await
            }
            Commands::Batch {
                input,
                progress_interval,
                metrics_out,
            } => {
                self.run_batch(
                    &input,
                    RunOptions {
                        progress_interval,
                        metrics_out,
                    },
                )
                .await
            }
            Commands::Validate { config } => self.validate_config(config).await,
        }
    }

    pub async fn run_listing(
        &self,
        limit: usize,
        options: RunOptions,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let client = CatApiClient::new(&self.config.api)?;
        let sources = client.fetch_listing(limit).await?;
        info!("Listing returned {} images", sources.len());

        self.run_pipeline(sources, options).await
    }

    pub async fn run_batch(
        &self,
        input: &Path,
        options: RunOptions,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let urls = read_urls_from_file(input).await?;
        info!("Loaded {} URLs from {}", urls.len(), input.display());

        self.run_pipeline(urls.into_iter().map(SourceRef::from), options)
            .await
    }

    pub async fn run_pipeline<I>(
        &self,
        sources: I,
        options: RunOptions,
    ) -> Result<(), Box<dyn std::error::Error>>
    where
        I: IntoIterator<Item = SourceRef>,
    {
        // The recorder has to exist before the pipeline registers its metric handles.
        let prometheus = match &options.metrics_out {
            Some(_) => Some(PrometheusExporter::install()?),
            None => None,
        };

        let manager = Arc::new(PipelineManager::from_config(self.config.clone())?);
        manager.initialize(sources).await?;
        manager.start().await?;

        let reporter = options
            .progress_interval
            .filter(|secs| *secs > 0)
            .map(|secs| ProgressReporter::new(&manager, Duration::from_secs(secs)).spawn());

        let snapshot = manager.wait_for_completion().await?;
        if let Some(reporter) = reporter {
            reporter.abort();
        }

        print_summary(&snapshot, &self.config.output_dir);
        debug!("Run summary: {}", serde_json::to_string(&snapshot)?);

        if let (Some(handle), Some(path)) = (prometheus, &options.metrics_out) {
            fs::write(path, handle.render()).await?;
            info!("Metrics written to {}", path.display());
        }

        if snapshot.saved == 0 {
            warn!("No images were saved");
        }
        Ok(())
    }

    pub async fn validate_config(
        &self,
        config_path: PathBuf,
    ) -> Result<(), Box<dyn std::error::Error>> {
        println!("Validating configuration: {}", config_path.display());

        let config_content = fs::read_to_string(&config_path).await?;
        let config: Config = serde_json::from_str(&config_content)?;
        config.validate()?;

        println!("Configuration is valid:");
        println!(
            "  Workers: {} download, {} process, {} save",
            config.download_workers, config.process_workers, config.save_workers
        );
        println!("  Output: {} ({:?})", config.output_dir.display(), config.output_format);
        println!("  Analysis: {:?}", config.analysis);
        println!("  Fetch timeout: {:?}", config.fetch_timeout);
        match config.queue_capacity {
            Some(capacity) => println!("  Queue capacity: {capacity}"),
            None => println!("  Queue capacity: unbounded"),
        }

        Ok(())
    }
}

pub async fn read_urls_from_file(path: &Path) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let content = fs::read_to_string(path).await?;
    Ok(parse_url_list(&content))
}

fn print_summary(snapshot: &StatsSnapshot, output_dir: &Path) {
    println!("Pipeline completed:");
    println!("  Images: {}", snapshot.total_images);
    println!("  Downloaded: {}", snapshot.downloaded);
    println!("  Processed: {}", snapshot.processed);
    println!("  Saved: {}", snapshot.saved);
    println!(
        "  Errors: {} (download {}, process {}, save {})",
        snapshot.errors, snapshot.download_errors, snapshot.process_errors, snapshot.save_errors
    );
    println!("  Elapsed: {}", format_duration(snapshot.elapsed));
    println!("  Throughput: {:.2} images/s", snapshot.throughput);
    println!("  Output: {}", output_dir.display());
}

/// Prints a progress line on a fixed interval until every image is settled.
///
/// Holds only a weak handle, so dropping the run still drops the manager and
/// stops its workers. The reporter ends on its next tick after that.
pub struct ProgressReporter {
    manager: Weak<PipelineManager>,
    interval: Duration,
}

impl ProgressReporter {
    pub fn new(manager: &Arc<PipelineManager>, interval: Duration) -> Self {
        Self {
            manager: Arc::downgrade(manager),
            interval,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            loop {
                interval.tick().await;
                let Some(manager) = self.manager.upgrade() else {
                    debug!("Pipeline gone, progress reporter exiting");
                    break;
                };
                let progress = manager.current_stats();
                drop(manager);
                println!(
                    "Progress: {}/{} ({:.1}%) - Downloaded: {}, Processed: {}, Saved: {}, Errors: {}, Queued: {}/{}/{}",
                    progress.saved + progress.errors,
                    progress.total,
                    progress.percent(),
                    progress.downloaded,
                    progress.processed,
                    progress.saved,
                    progress.errors,
                    progress.queue_depths.download,
                    progress.queue_depths.process,
                    progress.queue_depths.save
                );
                if progress.is_complete() {
                    break;
                }
            }
        })
    }
}

pub fn setup_logging(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_config_values() {
        let cli = Cli::parse_from([
            "image-pipeline",
            "--download-workers",
            "7",
            "--format",
            "png",
            "--analysis",
            "corners",
            "run",
            "--limit",
            "3",
        ]);

        let mut config = Config::default();
        cli.apply_overrides(&mut config).unwrap();
        assert_eq!(config.download_workers, 7);
        assert_eq!(config.output_format, OutputFormat::Png);
        assert_eq!(config.analysis, AnalysisKind::Corners);
        assert!(matches!(cli.command, Commands::Run { limit: 3, .. }));
    }

    #[test]
    fn bad_format_override_is_rejected() {
        let cli = Cli::parse_from(["image-pipeline", "--format", "gif", "validate", "-c", "x.json"]);
        assert!(cli.apply_overrides(&mut Config::default()).is_err());
    }

    #[tokio::test]
    async fn progress_reporter_does_not_keep_the_pipeline_alive() {
        let manager = Arc::new(PipelineManager::from_config(Config::default()).unwrap());
        manager.initialize(["https://example.com/cat.jpg"]).await.unwrap();

        let reporter = ProgressReporter::new(&manager, Duration::from_millis(10)).spawn();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(Arc::strong_count(&manager), 1);

        drop(manager);
        tokio::time::timeout(Duration::from_secs(1), reporter)
            .await
            .expect("reporter should exit once the pipeline is dropped")
            .unwrap();
    }

    #[tokio::test]
    async fn reads_url_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("urls.txt");
        tokio::fs::write(&path, "# header\nhttps://a/1.jpg\n\nhttps://a/2.jpg\n")
            .await
            .unwrap();

        let urls = read_urls_from_file(&path).await.unwrap();
        assert_eq!(urls.len(), 2);
    }
}
