use clap::Parser;
use image_pipeline::{setup_logging, Cli, CliRunner, Config};
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse CLI arguments
    let args = Cli::parse();

    setup_logging(args.verbose)?;

    info!("Starting image-pipeline v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args).await?;
    let cli_runner = CliRunner::new(config);

    let result = tokio::select! {
        result = cli_runner.run(args.command) => {
            info!("Application completed");
            result
        }
        _ = shutdown_signal() => {
            // Dropping the run drops the pipeline, which stops its workers.
            info!("Received shutdown signal");
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("Application error: {}", e);
        std::process::exit(1);
    }

    info!("image-pipeline stopped");
    Ok(())
}

async fn load_config(args: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = if let Some(config_path) = &args.config {
        let config_content = tokio::fs::read_to_string(config_path).await?;
        serde_json::from_str(&config_content)?
    } else {
        Config::default()
    };

    args.apply_overrides(&mut config)?;
    config.validate()?;

    info!("Configuration loaded successfully");
    info!(
        "Workers: {} download, {} process, {} save",
        config.download_workers, config.process_workers, config.save_workers
    );
    info!("Output directory: {}", config.output_dir.display());

    Ok(config)
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
