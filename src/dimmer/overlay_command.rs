//! Software overlay through a user-supplied helper program.
//!
//! The helper is invoked once per overlay change with placeholders expanded:
//! `{output}`, `{index}`, `{visible}` (`1`/`0`), `{opacity}` and `{color}`.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::trace;

use super::DisplayTarget;
use super::DriverError;
use super::OverlayDimmer;
use super::OverlayRequest;

/// Overlay driver that shells out to a helper.
#[derive(Debug, Clone)]
pub struct CommandOverlay {
    template: Vec<String>,
}

impl CommandOverlay {
    /// Create from a non-empty argv template.
    pub fn new(template: Vec<String>) -> Option<Self> {
        if template.is_empty() {
            None
        } else {
            Some(Self { template })
        }
    }

    fn build_argv(&self, target: &DisplayTarget, request: OverlayRequest) -> Vec<String> {
        let output = target.name.clone().unwrap_or_default();
        let index = target.id.index().to_string();
        let visible = if request.visible { "1" } else { "0" };
        let opacity = format!("{:.3}", request.opacity);
        let color = request.color.to_string();

        self.template
            .iter()
            .map(|arg| {
                arg.replace("{output}", &output)
                    .replace("{index}", &index)
                    .replace("{visible}", visible)
                    .replace("{opacity}", &opacity)
                    .replace("{color}", &color)
            })
            .collect()
    }
}

#[async_trait]
impl OverlayDimmer for CommandOverlay {
    async fn set_overlay(
        &self,
        target: &DisplayTarget,
        request: OverlayRequest,
    ) -> Result<(), DriverError> {
        let argv = self.build_argv(target, request);
        let Some((program, args)) = argv.split_first() else {
            return Err(DriverError::Unsupported("empty overlay command".to_string()));
        };
        trace!("Running overlay helper: {}", argv.join(" "));

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?
            .wait_with_output()
            .await?;

        if output.status.success() {
            Ok(())
        } else {
            Err(DriverError::CommandFailed(format!(
                "{program} exited with code {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

/// Placeholder used when no overlay helper is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOverlay;

#[async_trait]
impl OverlayDimmer for NoOverlay {
    async fn set_overlay(
        &self,
        target: &DisplayTarget,
        request: OverlayRequest,
    ) -> Result<(), DriverError> {
        if request.visible {
            Err(DriverError::Unsupported(format!(
                "{} (no overlay_command configured)",
                target.id
            )))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Color;
    use crate::domain::MonitorId;

    fn target() -> DisplayTarget {
        DisplayTarget {
            id: MonitorId::new(1),
            name: Some("HDMI-A-1".to_string()),
            ddc_display: 2,
        }
    }

    #[test]
    fn test_empty_template_rejected() {
        assert!(CommandOverlay::new(Vec::new()).is_none());
    }

    #[test]
    fn test_build_argv_expands_placeholders() {
        let overlay = CommandOverlay::new(vec![
            "nap-overlay".to_string(),
            "--output={output}".to_string(),
            "{index}".to_string(),
            "{visible}".to_string(),
            "{opacity}".to_string(),
            "{color}".to_string(),
        ])
        .unwrap();

        let argv = overlay.build_argv(&target(), OverlayRequest::shown(0.5, Color::new(255, 0, 16)));
        assert_eq!(
            argv,
            ["nap-overlay", "--output=HDMI-A-1", "1", "1", "0.500", "#ff0010"]
        );

        let argv = overlay.build_argv(&target(), OverlayRequest::hidden());
        assert_eq!(argv[3], "0");
    }

    #[tokio::test]
    async fn test_no_overlay_only_allows_hide() {
        assert!(
            NoOverlay
                .set_overlay(&target(), OverlayRequest::hidden())
                .await
                .is_ok()
        );
        assert!(matches!(
            NoOverlay
                .set_overlay(&target(), OverlayRequest::shown(0.5, Color::BLACK))
                .await,
            Err(DriverError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_program_is_io_error() {
        let overlay = CommandOverlay::new(vec!["/nonexistent/nap-overlay".to_string()]).unwrap();
        let result = overlay
            .set_overlay(&target(), OverlayRequest::hidden())
            .await;
        assert!(matches!(result, Err(DriverError::Io(_))));
    }
}
