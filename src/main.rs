use anyhow::Result;
use clap::Parser;
use render_pool::{setup_logging, Cli, CliRunner, PoolOptions};
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    setup_logging(args.verbose)?;

    info!("starting render-pool v{}", env!("CARGO_PKG_VERSION"));

    let options = load_options(&args).await?;
    let runner = CliRunner::new(options, &args).await?;

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel(1);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx);

    let result = tokio::select! {
        result = runner.run(args.command) => result,
        _ = shutdown_rx.recv() => {
            info!("received shutdown signal");
            Ok(())
        }
    };

    runner.pool.shutdown().await;

    if let Err(e) = result {
        error!("{e:#}");
        std::process::exit(1);
    }

    let stats = runner.pool.stats();
    info!(
        "done: {} screenshot(s), {} page(s) opened",
        stats.screenshots_completed, stats.pages_opened
    );
    Ok(())
}

async fn load_options(args: &Cli) -> Result<PoolOptions> {
    let options = if let Some(config_path) = &args.config {
        let content = tokio::fs::read_to_string(config_path).await?;
        serde_json::from_str(&content)?
    } else {
        PoolOptions::default()
    };

    validate_options(&options)?;
    Ok(options)
}

fn validate_options(options: &PoolOptions) -> Result<()> {
    if options.worker_count == 0 {
        anyhow::bail!("worker count must be greater than 0");
    }
    if options.navigation_timeout.as_secs() == 0 {
        anyhow::bail!("navigation timeout must be greater than 0");
    }
    Ok(())
}

fn setup_shutdown_handler(
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("failed to create SIGINT handler");
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to create SIGTERM handler");

        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }

        let _ = shutdown_tx.send(());
    })
}
