//! Dry-run driver: logs what would be sent to the displays.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use super::DisplayTarget;
use super::DriverError;
use super::HardwareDimmer;
use super::OverlayDimmer;
use super::OverlayRequest;
use crate::domain::MonitorId;

/// Brightness reported for displays that were never written.
const ASSUMED_BRIGHTNESS: u8 = 100;

/// Driver that never touches hardware.
#[derive(Debug, Default)]
pub struct DryRunDimmer {
    levels: Mutex<HashMap<MonitorId, u8>>,
}

impl DryRunDimmer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HardwareDimmer for DryRunDimmer {
    async fn brightness(&self, target: &DisplayTarget) -> Result<u8, DriverError> {
        let levels = self
            .levels
            .lock()
            .map_err(|_| DriverError::Unsupported("poisoned dry-run state".to_string()))?;
        Ok(levels.get(&target.id).copied().unwrap_or(ASSUMED_BRIGHTNESS))
    }

    async fn set_brightness(
        &self,
        target: &DisplayTarget,
        percent: u8,
    ) -> Result<(), DriverError> {
        info!(
            "[DRY RUN] Would set brightness of {} (ddc display {}) to {}%",
            target.id, target.ddc_display, percent
        );
        if let Ok(mut levels) = self.levels.lock() {
            levels.insert(target.id, percent);
        }
        Ok(())
    }
}

#[async_trait]
impl OverlayDimmer for DryRunDimmer {
    async fn set_overlay(
        &self,
        target: &DisplayTarget,
        request: OverlayRequest,
    ) -> Result<(), DriverError> {
        if request.visible {
            info!(
                "[DRY RUN] Would show overlay on {} (opacity {:.2}, color {})",
                target.id, request.opacity, request.color
            );
        } else {
            info!("[DRY RUN] Would hide overlay on {}", target.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> DisplayTarget {
        DisplayTarget {
            id: MonitorId::new(0),
            name: Some("DP-1".to_string()),
            ddc_display: 1,
        }
    }

    #[tokio::test]
    async fn test_remembers_brightness() {
        let dimmer = DryRunDimmer::new();
        assert_eq!(dimmer.brightness(&target()).await.unwrap(), 100);

        dimmer.set_brightness(&target(), 25).await.unwrap();
        assert_eq!(dimmer.brightness(&target()).await.unwrap(), 25);
    }

    #[tokio::test]
    async fn test_overlay_always_succeeds() {
        let dimmer = DryRunDimmer::new();
        assert!(
            dimmer
                .set_overlay(&target(), OverlayRequest::hidden())
                .await
                .is_ok()
        );
    }
}
