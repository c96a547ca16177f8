use crate::{
    sanitize_filename, OutputFormat, PoolOptions, RenderPool, RenderRequest, ViewportOverride,
};
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "render-pool")]
#[command(about = "Headless-browser screenshot pool")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Number of browser workers")]
    pub workers: Option<usize>,

    #[arg(long, help = "Browser executable path")]
    pub executable: Option<PathBuf>,

    #[arg(long, help = "Directory for browser profiles")]
    pub data_dir: Option<PathBuf>,

    #[arg(long, help = "Navigation timeout in seconds")]
    pub timeout: Option<u64>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Render a single URL or local file
    Single {
        #[arg(short, long, help = "URL or local file path to render")]
        source: String,

        #[arg(short, long, help = "Output image path")]
        output: PathBuf,

        #[arg(long, help = "Output format (png, jpeg, webp)")]
        format: Option<String>,

        #[arg(long, help = "Compression quality 0-100 (ignored for png)")]
        quality: Option<u32>,

        #[arg(long, help = "Capture the full page")]
        full_page: bool,

        #[arg(long, help = "Viewport width")]
        width: Option<u32>,

        #[arg(long, help = "Viewport height")]
        height: Option<u32>,

        #[arg(long, help = "Device scale factor")]
        scale: Option<f64>,

        #[arg(long, help = "CSS selector to wait for (repeatable)")]
        wait_for: Vec<String>,

        #[arg(long, help = "Logical name used in logs")]
        name: Option<String>,
    },

    /// Render every source listed in a file, one per line
    Batch {
        #[arg(short, long, help = "Input file with one URL or path per line")]
        input: PathBuf,

        #[arg(short, long, help = "Output directory")]
        output: PathBuf,

        #[arg(long, help = "Output format (png, jpeg, webp)")]
        format: Option<String>,

        #[arg(long, help = "Compression quality 0-100 (ignored for png)")]
        quality: Option<u32>,

        #[arg(long, help = "Capture the full page")]
        full_page: bool,
    },
}

pub struct CliRunner {
    pub options: PoolOptions,
    pub pool: Arc<RenderPool>,
}

impl CliRunner {
    pub async fn new(mut options: PoolOptions, args: &Cli) -> Result<Self> {
        if let Some(workers) = args.workers {
            options.worker_count = workers;
        }
        if let Some(executable) = &args.executable {
            options.executable_path = Some(executable.clone());
        }
        if let Some(data_dir) = &args.data_dir {
            options.data_dir = data_dir.clone();
        }
        if let Some(timeout) = args.timeout {
            options.navigation_timeout = std::time::Duration::from_secs(timeout);
        }

        let pool = Arc::new(RenderPool::launch(options.clone()).await?);
        Ok(Self { options, pool })
    }

    pub async fn run(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Single {
                source,
                output,
                format,
                quality,
                full_page,
                width,
                height,
                scale,
                wait_for,
                name,
            } => {
                let mut request = base_request(format.as_deref(), quality, full_page)?;
                request.source = source;
                request.name = name;
                request.save_path = Some(output.clone());
                if width.is_some() || height.is_some() || scale.is_some() {
                    request.viewport = Some(ViewportOverride {
                        width,
                        height,
                        scale,
                    });
                }
                request.wait_for_selector = wait_for.into();

                self.run_single(request, &output).await
            }
            Commands::Batch {
                input,
                output,
                format,
                quality,
                full_page,
            } => {
                let template = base_request(format.as_deref(), quality, full_page)?;
                self.run_batch(input, output, template).await
            }
        }
    }

    async fn run_single(&self, request: RenderRequest, output: &PathBuf) -> Result<()> {
        info!("rendering {}", request.source);
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).await?;
        }

        let source = request.source.clone();
        let image = self
            .pool
            .render(request)
            .await
            .map_err(|e| anyhow!("render failed: {e}"))?;

        println!("Screenshot captured:");
        println!("  Source: {source}");
        println!("  Output: {}", output.display());
        println!("  Size: {}", crate::format_bytes(image.byte_len()));
        if image.page_count() > 1 {
            println!("  Pages: {}", image.page_count());
        }

        Ok(())
    }

    async fn run_batch(
        &self,
        input: PathBuf,
        output: PathBuf,
        template: RenderRequest,
    ) -> Result<()> {
        let sources = read_sources(&input).await?;
        info!("loaded {} source(s) from {}", sources.len(), input.display());
        fs::create_dir_all(&output).await?;

        let mut tasks = Vec::new();
        for source in sources {
            let pool = self.pool.clone();
            let mut request = template.clone();
            let file = output.join(batch_filename(&source, request.format));
            request.source = source.clone();
            request.save_path = Some(file.clone());

            tasks.push(tokio::spawn(async move {
                (source, file, pool.render(request).await)
            }));
        }

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        for task in tasks {
            let (source, file, outcome) = task.await.context("render task panicked")?;
            match outcome {
                Ok(image) => {
                    succeeded += 1;
                    info!(
                        "saved {} ({}) to {}",
                        source,
                        crate::format_bytes(image.byte_len()),
                        file.display()
                    );
                }
                Err(err) => {
                    failed += 1;
                    warn!("failed to render {source}: {err}");
                }
            }
        }

        info!("batch complete: {succeeded} succeeded, {failed} failed");
        if succeeded == 0 && failed > 0 {
            return Err(anyhow!("every render in the batch failed"));
        }
        Ok(())
    }
}

fn base_request(
    format: Option<&str>,
    quality: Option<u32>,
    full_page: bool,
) -> Result<RenderRequest> {
    let mut request = RenderRequest {
        full_page,
        ..Default::default()
    };
    if let Some(format) = format {
        request.format = parse_format(format)?;
    }
    if let Some(quality) = quality {
        request.quality = quality.min(100);
    }
    Ok(request)
}

fn parse_format(value: &str) -> Result<OutputFormat> {
    match value.to_ascii_lowercase().as_str() {
        "png" => Ok(OutputFormat::Png),
        "jpeg" | "jpg" => Ok(OutputFormat::Jpeg),
        "webp" => Ok(OutputFormat::Webp),
        other => Err(anyhow!("unsupported format: {other}")),
    }
}

async fn read_sources(path: &PathBuf) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

fn batch_filename(source: &str, format: OutputFormat) -> String {
    let stripped = source
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    format!(
        "{}.{}",
        sanitize_filename(stripped).replace('.', "_"),
        format.extension()
    )
}

pub fn setup_logging(verbose: bool) -> Result<()> {
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
    fn format_parsing() {
        assert_eq!(parse_format("png").unwrap(), OutputFormat::Png);
        assert_eq!(parse_format("JPEG").unwrap(), OutputFormat::Jpeg);
        assert_eq!(parse_format("jpg").unwrap(), OutputFormat::Jpeg);
        assert_eq!(parse_format("webp").unwrap(), OutputFormat::Webp);
        assert!(parse_format("tiff").is_err());
    }

    #[test]
    fn batch_filenames_are_safe() {
        let name = batch_filename("https://example.com/a/b?q=1", OutputFormat::Jpeg);
        assert!(name.ends_with(".jpg"));
        assert!(!name.contains('/'));
        assert!(!name.contains('?'));
    }

    #[test]
    fn quality_is_clamped() {
        let request = base_request(Some("jpeg"), Some(250), false).unwrap();
        assert_eq!(request.quality, 100);
    }
}
