//! Process-wide render counters.
//!
//! The counters are observability only; nothing in the scheduler reads them
//! to make control decisions. They live on an explicitly shared collector
//! rather than behind a global, and are mirrored to the `metrics` recorder
//! for any exporter the embedding application installs.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct RenderStats {
    screenshots_completed: AtomicU64,
    pages_opened: AtomicU64,
}

impl RenderStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one completed screenshot; returns the new cumulative total.
    pub fn record_screenshot(&self) -> u64 {
        metrics::counter!("render_pool_screenshots_total", 1);
        self.screenshots_completed.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Count one opened page; returns the new cumulative total.
    pub fn record_page_opened(&self) -> u64 {
        metrics::counter!("render_pool_pages_opened_total", 1);
        self.pages_opened.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn screenshots_completed(&self) -> u64 {
        self.screenshots_completed.load(Ordering::Relaxed)
    }

    pub fn pages_opened(&self) -> u64 {
        self.pages_opened.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            screenshots_completed: self.screenshots_completed(),
            pages_opened: self.pages_opened(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub screenshots_completed: u64,
    pub pages_opened: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_monotonic() {
        let stats = RenderStats::new();
        assert_eq!(stats.record_page_opened(), 1);
        assert_eq!(stats.record_page_opened(), 2);
        assert_eq!(stats.record_screenshot(), 1);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.pages_opened, 2);
        assert_eq!(snapshot.screenshots_completed, 1);
    }
}
