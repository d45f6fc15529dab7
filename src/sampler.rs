//! Activity sampling with per-signal result caches.
//!
//! Pointer position and foreground-window state are queried through an
//! [`ActivityProbe`]. Each signal lives in its own cache slot with its own
//! validity window, so a tick never hits the compositor more often than the
//! slot allows. A failed or slow query keeps the last known value.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;
use tracing::trace;

use crate::domain::Point;
use crate::domain::Rect;

/// Share of a monitor a foreground window must cover to count as fullscreen.
pub const FULLSCREEN_COVERAGE: f64 = 0.95;

/// Errors that can occur while querying activity.
#[derive(Error, Debug)]
pub enum SampleError {
    #[error("Activity source unavailable: {0}")]
    Unavailable(String),

    #[error("Activity query timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed reply: {0}")]
    Malformed(String),
}

/// Foreground window as reported by the compositor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForegroundWindow {
    /// Compositor-reported fullscreen state.
    pub fullscreen: bool,
    /// Window rectangle in layout coordinates, if known.
    pub rect: Option<Rect>,
}

/// Source of raw activity signals.
#[async_trait]
pub trait ActivityProbe: Send + Sync {
    /// Absolute pointer position.
    async fn cursor_position(&self) -> Result<Point, SampleError>;

    /// Currently focused window, or `None` when nothing has focus.
    async fn foreground_window(&self) -> Result<Option<ForegroundWindow>, SampleError>;
}

/// A value together with the moment it was read from the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observed<T> {
    pub value: T,
    pub sampled_at: Instant,
}

/// Merged snapshot of both cache slots.
///
/// A slot is `None` until its first successful query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActivitySample {
    pub cursor: Option<Observed<Point>>,
    pub window: Option<Observed<Option<ForegroundWindow>>>,
}

impl ActivitySample {
    pub fn cursor_position(&self) -> Option<Point> {
        self.cursor.map(|c| c.value)
    }

    pub fn foreground(&self) -> Option<ForegroundWindow> {
        self.window.and_then(|w| w.value)
    }
}

/// Best-effort fullscreen heuristic for one monitor.
///
/// With both rectangles known, a foreground window covering at least
/// [`FULLSCREEN_COVERAGE`] of the monitor counts, borderless or not. Without
/// geometry the compositor's fullscreen flag is trusted for every monitor.
/// False positives and negatives are accepted.
pub fn is_fullscreen_suppressed(sample: &ActivitySample, monitor: Option<&Rect>) -> bool {
    let Some(window) = sample.foreground() else {
        return false;
    };

    match (monitor, window.rect) {
        (Some(monitor), Some(rect)) => monitor.coverage_by(&rect) >= FULLSCREEN_COVERAGE,
        _ => window.fullscreen,
    }
}

#[derive(Debug)]
struct SlotState<T> {
    last: Option<Observed<T>>,
    checked_at: Option<Instant>,
}

/// Single-value cache with a validity window.
///
/// The lock is held across the refresh, so concurrent readers inside the
/// window all observe the value of a single query.
#[derive(Debug)]
pub(crate) struct CacheSlot<T> {
    name: &'static str,
    ttl: Duration,
    state: Mutex<SlotState<T>>,
}

impl<T: Clone> CacheSlot<T> {
    pub(crate) fn new(name: &'static str, ttl: Duration) -> Self {
        Self {
            name,
            ttl,
            state: Mutex::new(SlotState {
                last: None,
                checked_at: None,
            }),
        }
    }

    /// Return the cached value, refreshing it through `fetch` when stale.
    ///
    /// A failed refresh keeps the previous value and waits a full window
    /// before trying again.
    pub(crate) async fn get<F, Fut>(&self, timeout: Duration, fetch: F) -> Option<Observed<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SampleError>>,
    {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        if let Some(checked_at) = state.checked_at
            && now.duration_since(checked_at) < self.ttl
        {
            trace!("{} cache hit", self.name);
            return state.last.clone();
        }

        let result = match tokio::time::timeout(timeout, fetch()).await {
            Ok(result) => result,
            Err(_) => Err(SampleError::Timeout(timeout)),
        };

        state.checked_at = Some(now);
        match result {
            Ok(value) => {
                state.last = Some(Observed {
                    value,
                    sampled_at: now,
                });
            }
            Err(e) => {
                debug!("{} query failed, keeping last sample: {}", self.name, e);
            }
        }

        state.last.clone()
    }

    /// Force the next `get` to query.
    pub(crate) async fn invalidate(&self) {
        self.state.lock().await.checked_at = None;
    }
}

/// Cache-gated sampler over an [`ActivityProbe`].
pub struct ActivitySampler {
    probe: Arc<dyn ActivityProbe>,
    probe_timeout: Duration,
    cursor: CacheSlot<Point>,
    window: CacheSlot<Option<ForegroundWindow>>,
}

impl ActivitySampler {
    pub fn new(
        probe: Arc<dyn ActivityProbe>,
        cursor_ttl: Duration,
        window_ttl: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            probe,
            probe_timeout,
            cursor: CacheSlot::new("cursor", cursor_ttl),
            window: CacheSlot::new("window", window_ttl),
        }
    }

    /// Take a snapshot, querying only the slots whose window has elapsed.
    pub async fn sample(&self) -> ActivitySample {
        let cursor = self
            .cursor
            .get(self.probe_timeout, || self.probe.cursor_position())
            .await;
        let window = self
            .window
            .get(self.probe_timeout, || self.probe.foreground_window())
            .await;

        ActivitySample { cursor, window }
    }

    /// Drop both validity windows so the next sample is fresh.
    pub async fn invalidate(&self) {
        self.cursor.invalidate().await;
        self.window.invalidate().await;
    }
}
