//! Pool configuration and the render request/result data model.
//!
//! Everything a caller hands the pool lives here: the launch configuration
//! for the Chrome processes, the immutable [`RenderRequest`] describing one
//! capture, and the [`ImageData`] payload delivered back.

use crate::RenderError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Identifier correlating one dispatched job with its completion signal.
///
/// Generated by the scheduler per attempt, used as the completion-bus key and
/// as the worker's in-flight marker, and forgotten once the result is
/// delivered.
pub type JobId = Uuid;

/// Tagged outcome of one render job attempt.
pub type JobOutcome = Result<ImageData, RenderError>;

/// Launch configuration for the worker pool.
///
/// # Examples
///
/// ```rust
/// use render_pool::PoolOptions;
///
/// let options = PoolOptions {
///     worker_count: 2,
///     executable_path: Some("/usr/bin/chromium".into()),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Number of browser processes to launch (default: 1).
    ///
    /// Each worker is an independent Chrome process; jobs are spread across
    /// them round-robin. Crashed workers are evicted and not replaced.
    pub worker_count: usize,

    /// Extra command-line arguments appended to the browser invocation.
    pub args: Vec<String>,

    /// Run the browser without a visible window (default: true).
    pub headless: bool,

    /// Auto-open DevTools for every tab. Forces a headed browser.
    pub devtools: bool,

    /// Base remote-debugging port; worker `n` uses `port + n`.
    pub debugging_port: Option<u16>,

    /// Root directory for per-worker user-data directories.
    pub data_dir: PathBuf,

    /// Resolved path to a launchable browser executable.
    ///
    /// Provisioning the binary is the caller's concern; the pool refuses to
    /// start without one.
    pub executable_path: Option<PathBuf>,

    /// Upper bound on navigation (goto + load wait) per job.
    pub navigation_timeout: Duration,

    /// Upper bound on each individual wait condition.
    pub wait_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            worker_count: 1,
            args: Vec::new(),
            headless: true,
            devtools: false,
            debugging_port: None,
            data_dir: PathBuf::from("data"),
            executable_path: None,
            navigation_timeout: Duration::from_secs(30),
            wait_timeout: Duration::from_secs(10),
        }
    }
}

/// Output image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// PNG - lossless, quality setting does not apply
    Png,
    /// JPEG - lossy, honors the quality setting
    Jpeg,
    /// WebP - modern compression, honors the quality setting
    Webp,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Webp => "webp",
        }
    }
}

/// How the captured bytes are delivered to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Raw image bytes.
    Binary,
    /// Standard base64 string.
    Base64,
}

/// Explicit viewport override; unset fields fall back to the measured
/// content box and then to the hard defaults (1920x1080 at scale 2).
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ViewportOverride {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub scale: Option<f64>,
}

/// Lifecycle event navigation waits for before the job proceeds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitUntil {
    /// The frame fired its load event.
    #[default]
    Load,
    /// Navigation committed; do not wait for subresources.
    DomContentLoaded,
    /// Load finished and the network settled.
    NetworkIdle,
}

/// Passed-through navigation options.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GotoOptions {
    pub wait_until: WaitUntil,
    /// Overrides the pool-wide navigation timeout, in milliseconds.
    pub timeout_ms: Option<u64>,
}

/// A field that accepts either a single value or a list of values.
///
/// Wait conditions come in both shapes; an absent field is an empty list.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        match self {
            OneOrMany::One(value) => std::slice::from_ref(value).iter(),
            OneOrMany::Many(values) => values.iter(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            OneOrMany::One(_) => 1,
            OneOrMany::Many(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl<T> From<T> for OneOrMany<T> {
    fn from(value: T) -> Self {
        OneOrMany::One(value)
    }
}

impl<T> From<Vec<T>> for OneOrMany<T> {
    fn from(values: Vec<T>) -> Self {
        OneOrMany::Many(values)
    }
}

/// Immutable description of one capture job.
///
/// Built by the caller, never mutated after submission.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RenderRequest {
    /// URL or local file path to render. Empty is a validation failure.
    pub source: String,

    /// Logical label used in logs; defaults to `"render"`.
    pub name: Option<String>,

    /// Output image format (default: jpeg).
    pub format: OutputFormat,

    /// Compression quality 0-100 (default: 90). Ignored for png.
    pub quality: u32,

    /// Correlation hash sent as the `x-renderer-id` request header so
    /// downstream consumers can attribute pushed renders.
    pub hash: Option<String>,

    /// Capture the entire page instead of the viewport. Forces
    /// beyond-viewport capture.
    pub full_page: bool,

    /// Trade encoding quality for capture speed.
    pub optimize_for_speed: bool,

    /// Delivery encoding for the captured bytes (default: binary).
    pub encoding: Encoding,

    /// Also write the image(s) to this path after capture.
    pub save_path: Option<PathBuf>,

    /// Render without the default white background.
    pub omit_background: bool,

    /// Capture content outside the current viewport.
    pub capture_beyond_viewport: bool,

    /// Explicit viewport; unset means content-sized.
    pub viewport: Option<ViewportOverride>,

    /// Split the capture into vertical segments of this height and deliver
    /// an array of images.
    pub split_height: Option<u32>,

    /// Navigation options passed through to the page load.
    pub goto: GotoOptions,

    /// CSS selectors to wait for before capturing. Best-effort.
    pub wait_for_selector: OneOrMany<String>,

    /// JavaScript expressions polled until truthy. Best-effort.
    pub wait_for_function: OneOrMany<String>,

    /// URL fragments of requests to wait for. Best-effort.
    pub wait_for_request: OneOrMany<String>,

    /// URL fragments of responses to wait for. Best-effort.
    pub wait_for_response: OneOrMany<String>,
}

impl Default for RenderRequest {
    fn default() -> Self {
        Self {
            source: String::new(),
            name: None,
            format: OutputFormat::Jpeg,
            quality: 90,
            hash: None,
            full_page: false,
            optimize_for_speed: false,
            encoding: Encoding::Binary,
            save_path: None,
            omit_background: false,
            capture_beyond_viewport: false,
            viewport: None,
            split_height: None,
            goto: GotoOptions::default(),
            wait_for_selector: OneOrMany::default(),
            wait_for_function: OneOrMany::default(),
            wait_for_request: OneOrMany::default(),
            wait_for_response: OneOrMany::default(),
        }
    }
}

/// Captured image payload, shaped by the request's encoding and splitting.
#[derive(Debug, Clone)]
pub enum ImageData {
    Binary(Vec<u8>),
    Base64(String),
    BinaryPages(Vec<Vec<u8>>),
    Base64Pages(Vec<String>),
}

impl ImageData {
    /// Total payload size, for logging.
    pub fn byte_len(&self) -> usize {
        match self {
            ImageData::Binary(bytes) => bytes.len(),
            ImageData::Base64(text) => text.len(),
            ImageData::BinaryPages(pages) => pages.iter().map(Vec::len).sum(),
            ImageData::Base64Pages(pages) => pages.iter().map(String::len).sum(),
        }
    }

    /// Number of delivered images (1 unless the capture was split).
    pub fn page_count(&self) -> usize {
        match self {
            ImageData::Binary(_) | ImageData::Base64(_) => 1,
            ImageData::BinaryPages(pages) => pages.len(),
            ImageData::Base64Pages(pages) => pages.len(),
        }
    }
}

/// Command-line arguments for one worker's browser process.
///
/// Worker-specific bits (user-data directory, debugging port) are derived
/// from the worker id so concurrent processes never collide.
pub fn chrome_args(options: &PoolOptions, worker_id: usize) -> Vec<String> {
    let mut args = vec![
        "--no-sandbox".to_string(),
        "--disable-setuid-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--hide-scrollbars".to_string(),
        "--mute-audio".to_string(),
    ];

    if let Some(port) = options.debugging_port {
        args.push(format!(
            "--remote-debugging-port={}",
            port + worker_id as u16
        ));
    }

    if options.devtools {
        args.push("--auto-open-devtools-for-tabs".to_string());
    }

    args.extend(options.args.iter().cloned());
    args
}

/// Browser launch configuration for one worker.
pub fn browser_config(
    options: &PoolOptions,
    executable: &std::path::Path,
    worker_id: usize,
) -> Result<chromiumoxide::browser::BrowserConfig, RenderError> {
    use chromiumoxide::browser::BrowserConfig;

    let user_data_dir = options.data_dir.join("user-data").join(worker_id.to_string());
    std::fs::create_dir_all(&user_data_dir)?;

    let mut builder = BrowserConfig::builder()
        .chrome_executable(executable)
        .user_data_dir(&user_data_dir)
        .args(chrome_args(options, worker_id));

    // DevTools only exist on a headed browser.
    if !options.headless || options.devtools {
        builder = builder.with_head();
    }

    builder.build().map_err(RenderError::Configuration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults() {
        let request = RenderRequest::default();
        assert!(request.source.is_empty());
        assert!(request.name.is_none());
        assert_eq!(request.format, OutputFormat::Jpeg);
        assert_eq!(request.quality, 90);
        assert_eq!(request.encoding, Encoding::Binary);
        assert!(!request.full_page);
        assert!(request.wait_for_selector.is_empty());
    }

    #[test]
    fn pool_defaults() {
        let options = PoolOptions::default();
        assert_eq!(options.worker_count, 1);
        assert!(options.headless);
        assert!(options.executable_path.is_none());
        assert_eq!(options.navigation_timeout, Duration::from_secs(30));
    }

    #[test]
    fn one_or_many_accepts_both_shapes() {
        let single: RenderRequest =
            serde_json::from_str(r##"{"source":"https://example.com","wait_for_selector":"#app"}"##)
                .unwrap();
        assert_eq!(single.wait_for_selector.len(), 1);

        let list: RenderRequest = serde_json::from_str(
            r##"{"source":"https://example.com","wait_for_selector":["#app","#footer"]}"##,
        )
        .unwrap();
        assert_eq!(list.wait_for_selector.len(), 2);
        let collected: Vec<_> = list.wait_for_selector.iter().cloned().collect();
        assert_eq!(collected, vec!["#app".to_string(), "#footer".to_string()]);
    }

    #[test]
    fn chrome_args_per_worker_port() {
        let options = PoolOptions {
            debugging_port: Some(9222),
            ..Default::default()
        };
        let args = chrome_args(&options, 3);
        assert!(args.contains(&"--no-sandbox".to_string()));
        assert!(args.contains(&"--remote-debugging-port=9225".to_string()));
    }

    #[test]
    fn extra_args_are_appended() {
        let options = PoolOptions {
            args: vec!["--lang=en-US".to_string()],
            ..Default::default()
        };
        let args = chrome_args(&options, 0);
        assert_eq!(args.last().unwrap(), "--lang=en-US");
    }
}
