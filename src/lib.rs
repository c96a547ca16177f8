//! # render-pool
//!
//! A pool of headless Chrome processes that turns URLs or local documents
//! into captured images, on demand, under concurrent load.
//!
//! The interesting part is not taking the screenshot but the orchestration
//! around it:
//!
//! - **Worker pool scheduling**: jobs are spread round-robin over a small set
//!   of expensive, crash-prone browser processes.
//! - **Crash handling**: a worker whose browser disconnects is evicted from
//!   the pool and every job in flight on it fails cleanly instead of hanging
//!   its caller.
//! - **Completion correlation**: workers finish jobs asynchronously; a
//!   name-keyed completion bus turns those signals back into futures the
//!   scheduler awaits.
//! - **One top-level retry**: a failed job is re-attempted exactly once,
//!   end to end, which absorbs transient faults like a crash that has not
//!   been evicted yet.
//!
//! Each capture runs a fixed multi-phase protocol: navigation, best-effort
//! wait conditions, content-driven viewport sizing, capture, and delivery.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use render_pool::{PoolOptions, RenderPool, RenderRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = PoolOptions {
//!         worker_count: 2,
//!         executable_path: Some("/usr/bin/chromium".into()),
//!         ..Default::default()
//!     };
//!     let pool = RenderPool::launch(options).await?;
//!
//!     let request = RenderRequest {
//!         source: "https://example.com".to_string(),
//!         ..Default::default()
//!     };
//!     let image = pool.render(request).await?;
//!     println!("captured {} bytes", image.byte_len());
//!
//!     pool.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! render-pool --executable /usr/bin/chromium single \
//!     --source https://example.com --output shot.jpg
//!
//! render-pool --executable /usr/bin/chromium --workers 4 batch \
//!     --input urls.txt --output shots/
//! ```

/// Pool configuration and the render request/result data model
pub mod config;

/// Error types and retry classification
pub mod error;

/// Completion bus correlating job results with waiting callers
pub mod bus;

/// Per-job multi-phase capture protocol
pub mod executor;

/// Worker pool scheduler: rotation, crash eviction, top-level retry
pub mod pool;

/// One managed browser process and its in-flight bookkeeping
pub mod worker;

/// Render counters for observability
pub mod metrics;

/// Command-line interface implementation
pub mod cli;

/// Utility functions and helpers
pub mod utils;


pub use bus::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use executor::{
    resolve_viewport, CaptureOptions, ContentBox, ResolvedViewport, Timeouts,
    DEFAULT_SCALE, DEFAULT_VIEWPORT_HEIGHT, DEFAULT_VIEWPORT_WIDTH, FALLBACK_LABEL,
};
pub use metrics::*;
pub use pool::*;
pub use utils::*;
pub use worker::*;
