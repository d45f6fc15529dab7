//! Dimming driver capabilities.
//!
//! The controller only talks to displays through [`HardwareDimmer`] and
//! [`OverlayDimmer`]. Every call may fail per device; callers bound each call
//! with [`bounded`] so one unresponsive display cannot stall a tick.

mod ddcutil;
mod dry_run;
mod overlay_command;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
pub use ddcutil::DdcutilDimmer;
pub use dry_run::DryRunDimmer;
pub use overlay_command::CommandOverlay;
pub use overlay_command::NoOverlay;
use thiserror::Error;

use crate::domain::Color;
use crate::domain::MonitorId;

/// Errors returned by dimming drivers.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Not supported on {0}")]
    Unsupported(String),

    #[error("Driver call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Driver command failed: {0}")]
    CommandFailed(String),

    #[error("Failed to run driver command: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed driver output: {0}")]
    Parse(String),
}

/// Everything a driver needs to address one physical display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayTarget {
    pub id: MonitorId,
    /// Compositor output name, e.g. "DP-1".
    pub name: Option<String>,
    /// ddcutil display number.
    pub ddc_display: u32,
}

/// Desired overlay state for one display.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayRequest {
    pub visible: bool,
    pub opacity: f64,
    pub color: Color,
}

impl OverlayRequest {
    pub fn hidden() -> Self {
        Self {
            visible: false,
            opacity: 0.0,
            color: Color::BLACK,
        }
    }

    pub fn shown(opacity: f64, color: Color) -> Self {
        Self {
            visible: true,
            opacity,
            color,
        }
    }

    /// Opacity actually on screen; hidden counts as fully transparent.
    pub fn effective_opacity(&self) -> f64 {
        if self.visible { self.opacity } else { 0.0 }
    }
}

/// Brightness levels to write, in order, to fade from `from` to `to`.
///
/// Always ends at `to`. Levels equal to the previous one are skipped.
pub fn brightness_ramp(from: u8, to: u8, steps: u32) -> Vec<u8> {
    let (start, end) = (i32::from(from), i32::from(to));
    let steps = i32::try_from(steps.max(1)).unwrap_or(1);

    let mut levels: Vec<u8> = Vec::new();
    let mut last = from;
    for i in 1..steps {
        let level = u8::try_from(start + (end - start) * i / steps).unwrap_or(to);
        if level != last {
            levels.push(level);
            last = level;
        }
    }
    levels.push(to);
    levels
}

/// Overlay states to apply, in order, to fade from `from` to `to`.
///
/// Always ends with `to` itself, so a fade out finishes hidden.
pub fn overlay_ramp(from: OverlayRequest, to: OverlayRequest, steps: u32) -> Vec<OverlayRequest> {
    let start = from.effective_opacity();
    let end = to.effective_opacity();
    if (end - start).abs() < 1e-6 {
        return vec![to];
    }

    let color = if to.visible { to.color } else { from.color };
    let steps = steps.max(1);
    let mut ramp: Vec<OverlayRequest> = (1..steps)
        .map(|i| {
            let t = f64::from(i) / f64::from(steps);
            OverlayRequest::shown(start + (end - start) * t, color)
        })
        .collect();
    ramp.push(to);
    ramp
}

/// Brightness control over DDC/CI (or anything equivalent).
#[async_trait]
pub trait HardwareDimmer: Send + Sync {
    /// Current brightness as a percentage.
    async fn brightness(&self, target: &DisplayTarget) -> Result<u8, DriverError>;

    /// Set brightness as a percentage.
    async fn set_brightness(&self, target: &DisplayTarget, percent: u8)
    -> Result<(), DriverError>;
}

/// Full-screen translucent surface per display.
#[async_trait]
pub trait OverlayDimmer: Send + Sync {
    async fn set_overlay(
        &self,
        target: &DisplayTarget,
        request: OverlayRequest,
    ) -> Result<(), DriverError>;
}

/// Run a driver call, turning an overrun into [`DriverError::Timeout`].
pub async fn bounded<T, F>(timeout: Duration, call: F) -> Result<T, DriverError>
where
    F: Future<Output = Result<T, DriverError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::Timeout(timeout)),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// A driver call seen by [`RecordingDimmer`].
    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Call {
        Brightness(MonitorId, u8),
        Overlay(MonitorId, OverlayRequest),
    }

    /// In-memory driver that records calls and can fail per monitor.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingDimmer {
        pub calls: Mutex<Vec<Call>>,
        pub levels: Mutex<HashMap<MonitorId, u8>>,
        pub failing: Mutex<HashSet<MonitorId>>,
        pub hanging: Mutex<HashSet<MonitorId>>,
    }

    impl RecordingDimmer {
        pub(crate) fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn calls_for(&self, id: MonitorId) -> Vec<Call> {
            self.calls()
                .into_iter()
                .filter(|call| match call {
                    Call::Brightness(m, _) | Call::Overlay(m, _) => *m == id,
                })
                .collect()
        }

        pub(crate) fn clear(&self) {
            self.calls.lock().unwrap().clear();
        }

        pub(crate) fn fail(&self, id: MonitorId, failing: bool) {
            let mut set = self.failing.lock().unwrap();
            if failing {
                set.insert(id);
            } else {
                set.remove(&id);
            }
        }

        async fn check(&self, id: MonitorId) -> Result<(), DriverError> {
            if self.hanging.lock().unwrap().contains(&id) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.failing.lock().unwrap().contains(&id) {
                return Err(DriverError::CommandFailed(format!("{id} unplugged")));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl HardwareDimmer for RecordingDimmer {
        async fn brightness(&self, target: &DisplayTarget) -> Result<u8, DriverError> {
            self.check(target.id).await?;
            Ok(*self.levels.lock().unwrap().get(&target.id).unwrap_or(&80))
        }

        async fn set_brightness(
            &self,
            target: &DisplayTarget,
            percent: u8,
        ) -> Result<(), DriverError> {
            self.check(target.id).await?;
            self.levels.lock().unwrap().insert(target.id, percent);
            self.calls
                .lock()
                .unwrap()
                .push(Call::Brightness(target.id, percent));
            Ok(())
        }
    }

    #[async_trait]
    impl OverlayDimmer for RecordingDimmer {
        async fn set_overlay(
            &self,
            target: &DisplayTarget,
            request: OverlayRequest,
        ) -> Result<(), DriverError> {
            self.check(target.id).await?;
            self.calls
                .lock()
                .unwrap()
                .push(Call::Overlay(target.id, request));
            Ok(())
        }
    }

    #[test]
    fn test_brightness_ramp_down() {
        assert_eq!(
            brightness_ramp(80, 30, 10),
            vec![75, 70, 65, 60, 55, 50, 45, 40, 35, 30]
        );
    }

    #[test]
    fn test_brightness_ramp_skips_repeats() {
        assert_eq!(brightness_ramp(30, 80, 3), vec![46, 63, 80]);
        assert_eq!(brightness_ramp(80, 79, 10), vec![79]);
        assert_eq!(brightness_ramp(50, 50, 10), vec![50]);
        assert_eq!(brightness_ramp(90, 10, 1), vec![10]);
    }

    #[test]
    fn test_overlay_ramp_in_and_out() {
        let shown = OverlayRequest::shown(0.5, Color::BLACK);

        let fade_in = overlay_ramp(OverlayRequest::hidden(), shown, 5);
        assert_eq!(fade_in.len(), 5);
        assert!(fade_in.iter().all(|r| r.visible));
        assert!((fade_in[0].opacity - 0.1).abs() < 1e-9);
        assert!(
            fade_in
                .windows(2)
                .all(|pair| pair[0].opacity < pair[1].opacity)
        );
        assert_eq!(fade_in.last(), Some(&shown));

        let fade_out = overlay_ramp(shown, OverlayRequest::hidden(), 3);
        assert_eq!(fade_out.len(), 3);
        assert!(fade_out[0].visible);
        assert!(fade_out[0].opacity < 0.5);
        assert_eq!(fade_out.last(), Some(&OverlayRequest::hidden()));
    }

    #[test]
    fn test_overlay_ramp_color_change_is_single_write() {
        let from = OverlayRequest::shown(0.5, Color::BLACK);
        let to = OverlayRequest::shown(0.5, Color::new(0x20, 0, 0));
        assert_eq!(overlay_ramp(from, to, 10), vec![to]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let result: Result<(), DriverError> = bounded(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(DriverError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_bounded_passes_through() {
        let result = bounded(Duration::from_secs(1), async { Ok::<_, DriverError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
