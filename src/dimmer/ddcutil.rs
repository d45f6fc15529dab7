//! DDC/CI brightness control through `ddcutil`.
//!
//! Builds and spawns `ddcutil getvcp 10` / `setvcp 10` commands. Children are
//! killed when the caller's timeout drops the future.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::debug;
use tracing::info;
use tracing::trace;

use super::DisplayTarget;
use super::DriverError;
use super::HardwareDimmer;

/// VCP feature code for luminance.
const VCP_BRIGHTNESS: &str = "10";

static CURRENT_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"current value\s*=\s*(\d+),\s*max value\s*=\s*(\d+)")
        .expect("static regex is valid")
});

/// Raw VCP reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct VcpValue {
    current: u16,
    max: u16,
}

impl VcpValue {
    fn percent(self) -> u8 {
        if self.max == 0 {
            return 0;
        }
        let pct = (u32::from(self.current) * 100 + u32::from(self.max) / 2) / u32::from(self.max);
        u8::try_from(pct.min(100)).unwrap_or(100)
    }
}

/// Hardware dimmer backed by the ddcutil CLI.
#[derive(Debug)]
pub struct DdcutilDimmer {
    cli_path: PathBuf,
    sleep_multiplier: Option<f64>,
    /// Max VCP value per ddcutil display, learned from reads.
    max_values: Mutex<HashMap<u32, u16>>,
}

impl DdcutilDimmer {
    /// Create a dimmer, validating a configured binary path.
    pub fn new(configured_path: Option<&PathBuf>, sleep_multiplier: Option<f64>) -> Result<Self> {
        let cli_path = match configured_path {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Configured ddcutil path does not exist: {}", path.display());
                }
                path.clone()
            }
            None => PathBuf::from("ddcutil"),
        };
        info!("Using ddcutil: {}", cli_path.display());
        if let Some(multiplier) = sleep_multiplier {
            info!("ddcutil sleep multiplier: {}", multiplier);
        }

        Ok(Self {
            cli_path,
            sleep_multiplier,
            max_values: Mutex::new(HashMap::new()),
        })
    }

    fn max_value(&self, display: u32) -> u16 {
        self.max_values
            .lock()
            .map(|m| m.get(&display).copied().unwrap_or(100))
            .unwrap_or(100)
    }

    async fn run(&self, args: &[String]) -> Result<String, DriverError> {
        trace!("Running: {} {}", self.cli_path.display(), args.join(" "));

        let output = Command::new(&self.cli_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?
            .wait_with_output()
            .await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(DriverError::CommandFailed(format!(
                "ddcutil exited with code {:?}: {}",
                output.status.code(),
                stderr.trim()
            )))
        }
    }
}

#[async_trait]
impl HardwareDimmer for DdcutilDimmer {
    async fn brightness(&self, target: &DisplayTarget) -> Result<u8, DriverError> {
        let stdout = self
            .run(&getvcp_args(target.ddc_display, self.sleep_multiplier))
            .await?;
        let value = parse_getvcp(&stdout)?;

        if let Ok(mut max_values) = self.max_values.lock() {
            max_values.insert(target.ddc_display, value.max);
        }

        debug!(
            "ddcutil display {} brightness {}/{}",
            target.ddc_display, value.current, value.max
        );
        Ok(value.percent())
    }

    async fn set_brightness(
        &self,
        target: &DisplayTarget,
        percent: u8,
    ) -> Result<(), DriverError> {
        let max = self.max_value(target.ddc_display);
        let raw = (u32::from(percent.min(100)) * u32::from(max) + 50) / 100;
        self.run(&setvcp_args(target.ddc_display, self.sleep_multiplier, raw))
            .await?;
        Ok(())
    }
}

fn display_args(display: u32, sleep_multiplier: Option<f64>) -> Vec<String> {
    let mut args = vec!["--display".to_string(), display.to_string()];
    if let Some(multiplier) = sleep_multiplier {
        args.push("--sleep-multiplier".to_string());
        args.push(multiplier.to_string());
    }
    args
}

fn getvcp_args(display: u32, sleep_multiplier: Option<f64>) -> Vec<String> {
    let mut args = display_args(display, sleep_multiplier);
    args.extend(["getvcp".to_string(), VCP_BRIGHTNESS.to_string()]);
    args
}

fn setvcp_args(display: u32, sleep_multiplier: Option<f64>, raw: u32) -> Vec<String> {
    let mut args = display_args(display, sleep_multiplier);
    args.extend([
        "--noverify".to_string(),
        "setvcp".to_string(),
        VCP_BRIGHTNESS.to_string(),
        raw.to_string(),
    ]);
    args
}

/// Parse `VCP code 0x10 (Brightness): current value = 50, max value = 100`.
fn parse_getvcp(stdout: &str) -> Result<VcpValue, DriverError> {
    let caps = CURRENT_VALUE
        .captures(stdout)
        .ok_or_else(|| DriverError::Parse(stdout.trim().to_string()))?;

    let field = |i: usize| {
        caps[i]
            .parse::<u16>()
            .map_err(|e| DriverError::Parse(format!("{}: {e}", &caps[i])))
    };

    Ok(VcpValue {
        current: field(1)?,
        max: field(2)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_getvcp() {
        let out = "VCP code 0x10 (Brightness                    ): current value =    70, max value =   100\n";
        assert_eq!(
            parse_getvcp(out).unwrap(),
            VcpValue {
                current: 70,
                max: 100
            }
        );
    }

    #[test]
    fn test_parse_getvcp_garbage() {
        let out = "Display not found\n";
        assert!(matches!(parse_getvcp(out), Err(DriverError::Parse(_))));
    }

    #[test]
    fn test_percent_scales_max() {
        assert_eq!(VcpValue { current: 50, max: 100 }.percent(), 50);
        assert_eq!(VcpValue { current: 128, max: 255 }.percent(), 50);
        assert_eq!(VcpValue { current: 10, max: 0 }.percent(), 0);
    }

    #[test]
    fn test_build_args() {
        let args = setvcp_args(2, None, 30);
        assert_eq!(args, ["--display", "2", "--noverify", "setvcp", "10", "30"]);

        let args = getvcp_args(1, None);
        assert_eq!(args, ["--display", "1", "getvcp", "10"]);
    }

    #[test]
    fn test_build_args_with_sleep_multiplier() {
        let args = getvcp_args(1, Some(0.5));
        assert_eq!(
            args,
            ["--display", "1", "--sleep-multiplier", "0.5", "getvcp", "10"]
        );

        let args = setvcp_args(1, Some(2.0), 40);
        assert_eq!(
            args,
            [
                "--display",
                "1",
                "--sleep-multiplier",
                "2",
                "--noverify",
                "setvcp",
                "10",
                "40"
            ]
        );
    }

    #[test]
    fn test_configured_path_must_exist() {
        let missing = PathBuf::from("/nonexistent/ddcutil");
        assert!(DdcutilDimmer::new(Some(&missing), None).is_err());
        assert!(DdcutilDimmer::new(None, None).is_ok());
    }

    #[test]
    fn test_max_value_default() {
        let dimmer = DdcutilDimmer::new(None, None).unwrap();
        assert_eq!(dimmer.max_value(1), 100);
        dimmer.max_values.lock().unwrap().insert(1, 255);
        assert_eq!(dimmer.max_value(1), 255);
    }
}
