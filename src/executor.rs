//! Per-job capture protocol.
//!
//! One execution = one page on one worker's browser, driven through a fixed
//! sequence of phases: validate, open, identify, navigate, baseline wait,
//! best-effort waits, measure, size viewport, capture, deliver. The outcome
//! is published on the completion bus under the job id; no failure escapes
//! as a panic or an unhandled error.

use crate::{
    format_bytes, format_duration, source_to_url, CompletionBus, Encoding, GotoOptions, ImageData,
    JobId, JobOutcome, OutputFormat, RenderError, RenderRequest, RenderStats, ViewportOverride,
    WaitUntil,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::{
    self, EventRequestWillBeSent, EventResponseReceived, Headers, SetExtraHttpHeadersParams,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;

/// Label used when the request carries no logical name.
pub const FALLBACK_LABEL: &str = "render";

/// Header carrying the correlation hash for downstream render attribution.
const CORRELATION_HEADER: &str = "x-renderer-id";

/// Content container consulted before falling back to the document body.
const CONTENT_CONTAINER: &str = "#container";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub const DEFAULT_VIEWPORT_WIDTH: f64 = 1920.0;
pub const DEFAULT_VIEWPORT_HEIGHT: f64 = 1080.0;
pub const DEFAULT_SCALE: f64 = 2.0;

/// Per-phase time limits, taken from the pool options at dispatch.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub navigation: Duration,
    pub wait: Duration,
}

/// Run one capture attempt and publish its outcome under `job_id`.
///
/// The published payload is the caller-visible result; the return value is
/// the same outcome for the worker's bookkeeping. Every error path publishes
/// exactly once.
pub(crate) async fn run(
    browser: &Mutex<Browser>,
    bus: &CompletionBus,
    stats: &RenderStats,
    job_id: JobId,
    request: RenderRequest,
    timeouts: Timeouts,
) -> JobOutcome {
    let started = Instant::now();
    let label = request
        .name
        .clone()
        .unwrap_or_else(|| FALLBACK_LABEL.to_string());
    let key = job_id.to_string();

    if let Err(err) = validate(&request) {
        warn!("[render][{label}] rejected: {err}");
        bus.publish(&key, Err(err.clone()));
        return Err(err);
    }

    let page = {
        let browser = browser.lock().await;
        browser.new_page("about:blank").await
    };
    let page = match page {
        Ok(page) => page,
        Err(e) => {
            let err = RenderError::Page(e.to_string());
            warn!("[render][{label}] failed to open page: {err}");
            bus.publish(&key, Err(err.clone()));
            return Err(err);
        }
    };

    match capture_on_page(&page, &request, timeouts).await {
        Ok(image) => {
            // Unblock the waiting caller before any bookkeeping.
            bus.publish(&key, Ok(image.clone()));
            let total = stats.record_screenshot();
            info!(
                "[render][{label}][#{total}] {} in {}",
                format_bytes(image.byte_len()),
                format_duration(started.elapsed())
            );
            if let Err(e) = page.close().await {
                debug!("[render][{label}] page close failed: {e}");
            }
            Ok(image)
        }
        Err(err) => {
            warn!("[render][{label}] failed: {err}");
            bus.publish(&key, Err(err.clone()));
            let _ = page.close().await;
            Err(err)
        }
    }
}

/// A job without a source has nothing to render.
pub(crate) fn validate(request: &RenderRequest) -> Result<(), RenderError> {
    if request.source.is_empty() {
        return Err(RenderError::MissingSource);
    }
    Ok(())
}

/// Everything between opening the page and producing the final image.
async fn capture_on_page(
    page: &Page,
    request: &RenderRequest,
    timeouts: Timeouts,
) -> Result<ImageData, RenderError> {
    if let Some(hash) = &request.hash {
        set_correlation_header(page, hash).await?;
    }

    let target = source_to_url(&request.source)?;
    navigate(page, &target, &request.goto, timeouts.navigation).await?;

    wait_for_selector(page, "body", timeouts.wait).await?;

    // Optional waits are synchronization hints; their failures are discarded.
    for selector in request.wait_for_selector.iter() {
        let _ = wait_for_selector(page, selector, timeouts.wait).await;
    }
    for expression in request.wait_for_function.iter() {
        let _ = wait_for_function(page, expression, timeouts.wait).await;
    }
    for fragment in request.wait_for_request.iter() {
        let _ = wait_for_request(page, fragment, timeouts.wait).await;
    }
    for fragment in request.wait_for_response.iter() {
        let _ = wait_for_response(page, fragment, timeouts.wait).await;
    }

    let content = measure_content(page).await;
    let viewport = resolve_viewport(request.viewport.as_ref(), content);
    apply_viewport(page, viewport).await?;

    let options = CaptureOptions::assemble(request);
    let bytes = page
        .screenshot(options.to_params())
        .await
        .map_err(|e| RenderError::Capture(e.to_string()))?;
    if bytes.is_empty() {
        return Err(RenderError::EmptyImage);
    }

    finish_image(bytes, request, &options).await
}

/// Tag all page traffic with the caller's correlation hash.
async fn set_correlation_header(page: &Page, hash: &str) -> Result<(), RenderError> {
    let mut map = serde_json::Map::new();
    map.insert(
        CORRELATION_HEADER.to_string(),
        serde_json::Value::String(hash.to_string()),
    );
    let params = SetExtraHttpHeadersParams::builder()
        .headers(Headers::new(serde_json::Value::Object(map)))
        .build()
        .map_err(|e| RenderError::Page(e.to_string()))?;
    page.execute(params)
        .await
        .map_err(|e| RenderError::Page(e.to_string()))?;
    Ok(())
}

/// Load the source, honoring the caller's navigation options.
async fn navigate(
    page: &Page,
    url: &Url,
    options: &GotoOptions,
    default_limit: Duration,
) -> Result<(), RenderError> {
    let limit = options
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(default_limit);

    let load = async {
        page.goto(url.as_str())
            .await
            .map_err(|e| RenderError::Navigation(e.to_string()))?;
        if options.wait_until != WaitUntil::DomContentLoaded {
            page.wait_for_navigation()
                .await
                .map_err(|e| RenderError::Navigation(e.to_string()))?;
        }
        Ok(())
    };

    tokio::time::timeout(limit, load)
        .await
        .map_err(|_| RenderError::Timeout(limit))?
}

/// Wait until `selector` matches an element.
pub(crate) async fn wait_for_selector(
    page: &Page,
    selector: &str,
    limit: Duration,
) -> Result<(), RenderError> {
    let deadline = Instant::now() + limit;
    loop {
        if page.find_element(selector).await.is_ok() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(RenderError::Timeout(limit));
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Wait until `expression` evaluates truthy in the page.
pub(crate) async fn wait_for_function(
    page: &Page,
    expression: &str,
    limit: Duration,
) -> Result<(), RenderError> {
    let deadline = Instant::now() + limit;
    loop {
        if let Ok(result) = page.evaluate(expression).await {
            if result.value().map(is_truthy).unwrap_or(false) {
                return Ok(());
            }
        }
        if Instant::now() >= deadline {
            return Err(RenderError::Timeout(limit));
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Wait for an outgoing request whose URL contains `fragment`.
///
/// Only requests issued after the listener attaches are observed.
pub(crate) async fn wait_for_request(
    page: &Page,
    fragment: &str,
    limit: Duration,
) -> Result<(), RenderError> {
    let _ = page.execute(network::EnableParams::default()).await;
    let mut events = page
        .event_listener::<EventRequestWillBeSent>()
        .await
        .map_err(|e| RenderError::Page(e.to_string()))?;

    let matched = async {
        while let Some(event) = events.next().await {
            if event.request.url.contains(fragment) {
                return true;
            }
        }
        false
    };

    match tokio::time::timeout(limit, matched).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(RenderError::Page("request event stream ended".to_string())),
        Err(_) => Err(RenderError::Timeout(limit)),
    }
}

/// Wait for a response whose URL contains `fragment`.
pub(crate) async fn wait_for_response(
    page: &Page,
    fragment: &str,
    limit: Duration,
) -> Result<(), RenderError> {
    let _ = page.execute(network::EnableParams::default()).await;
    let mut events = page
        .event_listener::<EventResponseReceived>()
        .await
        .map_err(|e| RenderError::Page(e.to_string()))?;

    let matched = async {
        while let Some(event) = events.next().await {
            if event.response.url.contains(fragment) {
                return true;
            }
        }
        false
    };

    match tokio::time::timeout(limit, matched).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(RenderError::Page("response event stream ended".to_string())),
        Err(_) => Err(RenderError::Timeout(limit)),
    }
}

fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        serde_json::Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// Measured size of the content container (or body) in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContentBox {
    pub width: f64,
    pub height: f64,
}

/// Read the bounding box of `#container`, else the body.
///
/// Absence (no body yet, detached page, zero-sized box) is tolerated and
/// falls through to the viewport defaults.
async fn measure_content(page: &Page) -> Option<ContentBox> {
    let script = format!(
        r#"(() => {{
        const el = document.querySelector('{CONTENT_CONTAINER}') || document.body;
        if (!el) return null;
        const rect = el.getBoundingClientRect();
        return {{ width: rect.width, height: rect.height }};
    }})()"#
    );

    let evaluated = page.evaluate(script).await.ok()?;
    let value = evaluated.value()?;
    let width = value.get("width")?.as_f64()?;
    let height = value.get("height")?.as_f64()?;
    if width <= 0.0 || height <= 0.0 {
        return None;
    }
    Some(ContentBox { width, height })
}

/// Viewport actually applied to the page: positive integer dimensions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedViewport {
    pub width: u32,
    pub height: u32,
    pub scale: f64,
}

/// Explicit override, else measured content box, else defaults.
pub fn resolve_viewport(
    overrides: Option<&ViewportOverride>,
    content: Option<ContentBox>,
) -> ResolvedViewport {
    let width = overrides
        .and_then(|v| v.width)
        .map(f64::from)
        .or(content.map(|c| c.width))
        .unwrap_or(DEFAULT_VIEWPORT_WIDTH);
    let height = overrides
        .and_then(|v| v.height)
        .map(f64::from)
        .or(content.map(|c| c.height))
        .unwrap_or(DEFAULT_VIEWPORT_HEIGHT);
    let scale = overrides.and_then(|v| v.scale).unwrap_or(DEFAULT_SCALE);

    ResolvedViewport {
        width: width.round().max(1.0) as u32,
        height: height.round().max(1.0) as u32,
        scale: scale.round().max(1.0),
    }
}

async fn apply_viewport(page: &Page, viewport: ResolvedViewport) -> Result<(), RenderError> {
    let params = SetDeviceMetricsOverrideParams::builder()
        .width(viewport.width as i64)
        .height(viewport.height as i64)
        .device_scale_factor(viewport.scale)
        .mobile(false)
        .build()
        .map_err(|e| RenderError::Page(e.to_string()))?;
    page.execute(params)
        .await
        .map_err(|e| RenderError::Page(e.to_string()))?;
    Ok(())
}

/// The fully resolved capture options.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOptions {
    pub format: OutputFormat,
    pub quality: Option<u32>,
    pub full_page: bool,
    pub capture_beyond_viewport: bool,
    pub omit_background: bool,
    pub optimize_for_speed: bool,
    pub encoding: Encoding,
}

impl CaptureOptions {
    /// Pure assembly; no failure mode.
    ///
    /// Quality never applies to png. A full-page capture must see beyond the
    /// viewport, whatever the caller said.
    pub fn assemble(request: &RenderRequest) -> Self {
        Self {
            format: request.format,
            quality: match request.format {
                OutputFormat::Png => None,
                _ => Some(request.quality),
            },
            full_page: request.full_page,
            capture_beyond_viewport: request.capture_beyond_viewport || request.full_page,
            omit_background: request.omit_background,
            optimize_for_speed: request.optimize_for_speed,
            encoding: request.encoding,
        }
    }

    fn to_params(&self) -> ScreenshotParams {
        let mut builder = ScreenshotParams::builder()
            .format(match self.format {
                OutputFormat::Png => CaptureScreenshotFormat::Png,
                OutputFormat::Jpeg => CaptureScreenshotFormat::Jpeg,
                OutputFormat::Webp => CaptureScreenshotFormat::Webp,
            })
            .full_page(self.full_page)
            .omit_background(self.omit_background)
            .capture_beyond_viewport(self.capture_beyond_viewport);
        if let Some(quality) = self.quality {
            builder = builder.quality(i64::from(quality));
        }
        let mut params = builder.build();
        params.cdp_params.optimize_for_speed = Some(self.optimize_for_speed);
        params
    }
}

/// Split, persist and encode the captured bytes per the request.
async fn finish_image(
    bytes: Vec<u8>,
    request: &RenderRequest,
    options: &CaptureOptions,
) -> Result<ImageData, RenderError> {
    let pages = match request.split_height {
        Some(height) if height > 0 => Some(split_pages(&bytes, options.format, height)?),
        Some(_) => {
            debug!("ignoring zero split height");
            None
        }
        None => None,
    };

    if let Some(path) = &request.save_path {
        match &pages {
            Some(pages) => save_pages(path, pages).await?,
            None => tokio::fs::write(path, &bytes).await?,
        }
    }

    Ok(match (pages, options.encoding) {
        (Some(pages), Encoding::Base64) => {
            ImageData::Base64Pages(pages.iter().map(|p| STANDARD.encode(p)).collect())
        }
        (Some(pages), Encoding::Binary) => ImageData::BinaryPages(pages),
        (None, Encoding::Base64) => ImageData::Base64(STANDARD.encode(&bytes)),
        (None, Encoding::Binary) => ImageData::Binary(bytes),
    })
}

/// Cut the capture into vertical segments of `segment_height` pixels.
pub(crate) fn split_pages(
    bytes: &[u8],
    format: OutputFormat,
    segment_height: u32,
) -> Result<Vec<Vec<u8>>, RenderError> {
    let full = image::load_from_memory(bytes).map_err(|e| RenderError::Capture(e.to_string()))?;
    let (width, height) = (full.width(), full.height());

    let mut pages = Vec::new();
    let mut offset = 0;
    while offset < height {
        let slice_height = segment_height.min(height - offset);
        let segment = full.crop_imm(0, offset, width, slice_height);
        let mut buffer = Vec::new();
        segment
            .write_to(&mut std::io::Cursor::new(&mut buffer), image_format(format))
            .map_err(|e| RenderError::Capture(e.to_string()))?;
        pages.push(buffer);
        offset += slice_height;
    }
    Ok(pages)
}

fn image_format(format: OutputFormat) -> image::ImageFormat {
    match format {
        OutputFormat::Png => image::ImageFormat::Png,
        OutputFormat::Jpeg => image::ImageFormat::Jpeg,
        OutputFormat::Webp => image::ImageFormat::WebP,
    }
}

async fn save_pages(path: &std::path::Path, pages: &[Vec<u8>]) -> Result<(), RenderError> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("page");
    let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("png");
    let parent = path.parent().unwrap_or_else(|| std::path::Path::new("."));
    for (index, bytes) in pages.iter().enumerate() {
        let file = parent.join(format!("{stem}-{}.{extension}", index + 1));
        tokio::fs::write(file, bytes).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_source_is_rejected() {
        let request = RenderRequest::default();
        assert!(matches!(
            validate(&request),
            Err(RenderError::MissingSource)
        ));

        let request = RenderRequest {
            source: "https://example.com".to_string(),
            ..Default::default()
        };
        assert!(validate(&request).is_ok());
    }

    #[test]
    fn png_never_carries_quality() {
        let request = RenderRequest {
            source: "https://example.com".to_string(),
            format: OutputFormat::Png,
            quality: 80,
            ..Default::default()
        };
        let options = CaptureOptions::assemble(&request);
        assert_eq!(options.quality, None);

        let request = RenderRequest {
            format: OutputFormat::Jpeg,
            ..request
        };
        let options = CaptureOptions::assemble(&request);
        assert_eq!(options.quality, Some(80));
    }

    #[test]
    fn full_page_forces_beyond_viewport() {
        let request = RenderRequest {
            source: "https://example.com".to_string(),
            full_page: true,
            capture_beyond_viewport: false,
            ..Default::default()
        };
        let options = CaptureOptions::assemble(&request);
        assert!(options.capture_beyond_viewport);
        assert!(options.full_page);
    }

    #[test]
    fn viewport_defaults_apply_without_override_or_content() {
        let viewport = resolve_viewport(None, None);
        assert_eq!(viewport.width, 1920);
        assert_eq!(viewport.height, 1080);
        assert_eq!(viewport.scale, 2.0);
    }

    #[test]
    fn measured_content_box_wins_over_defaults() {
        let content = ContentBox {
            width: 640.4,
            height: 479.6,
        };
        let viewport = resolve_viewport(None, Some(content));
        assert_eq!(viewport.width, 640);
        assert_eq!(viewport.height, 480);
    }

    #[test]
    fn explicit_override_wins_over_content_box() {
        let overrides = ViewportOverride {
            width: Some(800),
            height: None,
            scale: Some(1.0),
        };
        let content = ContentBox {
            width: 300.0,
            height: 200.0,
        };
        let viewport = resolve_viewport(Some(&overrides), Some(content));
        assert_eq!(viewport.width, 800);
        assert_eq!(viewport.height, 200);
        assert_eq!(viewport.scale, 1.0);
    }

    #[test]
    fn viewport_dimensions_stay_positive() {
        let content = ContentBox {
            width: 0.2,
            height: 0.4,
        };
        // A sub-pixel box must not round down to a zero-sized viewport.
        let viewport = resolve_viewport(None, Some(content));
        assert!(viewport.width >= 1);
        assert!(viewport.height >= 1);
    }

    #[test]
    fn truthiness_matches_javascript() {
        use serde_json::json;
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!("ready")));
        assert!(is_truthy(&json!({"state": "done"})));
    }

    #[test]
    fn split_produces_segments_with_remainder() {
        let mut png = Vec::new();
        let img = image::RgbaImage::from_pixel(10, 25, image::Rgba([10, 20, 30, 255]));
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let pages = split_pages(&png, OutputFormat::Png, 10).unwrap();
        assert_eq!(pages.len(), 3);

        let heights: Vec<u32> = pages
            .iter()
            .map(|p| image::load_from_memory(p).unwrap().height())
            .collect();
        assert_eq!(heights, vec![10, 10, 5]);
    }
}
