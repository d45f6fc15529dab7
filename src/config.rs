//! Configuration loading and defaults for monitornap.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::ensure;
use serde::Deserialize;
use serde::Serialize;

use crate::domain::Color;
use crate::domain::MonitorId;

/// Allowed range for inactivity thresholds, in seconds.
pub const INACTIVITY_RANGE: std::ops::RangeInclusive<u64> = 1..=3600;

/// Upper bound on intermediate writes per fade.
pub const MAX_FADE_STEPS: u32 = 100;

/// Waking fades run this many times faster than dimming ones.
const WAKE_FADE_DIVISOR: u32 = 20;

/// Waking fades use at most this many writes.
const WAKE_FADE_STEPS: u32 = 3;

/// How a change of brightness or overlay opacity is spread over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fade {
    pub duration: Duration,
    pub steps: u32,
}

impl Fade {
    /// Single write, no pause.
    pub const INSTANT: Self = Self {
        duration: Duration::ZERO,
        steps: 1,
    };

    /// Pause between two consecutive writes.
    pub fn interval(&self) -> Duration {
        self.duration / self.steps.max(1)
    }
}

/// Which monitors a pointer movement counts as activity for.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WakeScope {
    /// Any pointer movement wakes every monitor (default).
    #[default]
    All,
    /// Movement only counts for the monitor under the pointer.
    PointerMonitor,
}

/// Per-monitor configuration entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    /// Enumeration index this entry applies to.
    pub index: u32,

    /// Compositor output index used for geometry (defaults to `index`).
    pub display_index: Option<u32>,

    /// ddcutil display number (1-based, defaults to `index + 1`).
    pub ddc_display: Option<u32>,

    /// Output name the user mapped this entry to, e.g. "DP-1".
    /// A mismatch with the enumerated output is reported, never corrected.
    pub expected_name: Option<String>,

    /// Overrides the global `inactivity_seconds` for this monitor.
    pub inactivity_seconds: Option<u64>,

    /// Dim through DDC/CI brightness.
    pub hardware_dimming: bool,

    /// Brightness percentage applied while dimmed.
    pub hardware_brightness: u8,

    /// Dim through the software overlay.
    pub software_dimming: bool,

    /// Overlay opacity while dimmed (0.0 - 1.0).
    pub overlay_opacity: f64,

    /// Overlay tint.
    pub overlay_color: Color,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            index: 0,
            display_index: None,
            ddc_display: None,
            expected_name: None,
            inactivity_seconds: None,
            hardware_dimming: true,
            hardware_brightness: 30,
            software_dimming: true,
            overlay_opacity: 0.5,
            overlay_color: Color::BLACK,
        }
    }
}

/// Overlay appearance while dimmed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayStyle {
    pub opacity: f64,
    pub color: Color,
}

/// Resolved, immutable settings snapshot for one monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSettings {
    pub threshold: Duration,
    /// Target brightness while dimmed, when hardware dimming is enabled.
    pub hardware: Option<u8>,
    /// Overlay style while dimmed, when software dimming is enabled.
    pub overlay: Option<OverlayStyle>,
    pub display_index: u32,
    pub ddc_display: u32,
    pub expected_name: Option<String>,
}

/// Main configuration for monitornap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Controller tick period in milliseconds (default: 2000).
    pub tick_interval_ms: u64,

    /// Default inactivity threshold in seconds (default: 10).
    pub inactivity_seconds: u64,

    /// Validity window of the cursor sample (default: 500).
    pub cursor_cache_ms: u64,

    /// Validity window of the foreground-window sample (default: 1000).
    pub window_cache_ms: u64,

    /// How often the display layout is re-enumerated (default: 3000).
    pub layout_refresh_ms: u64,

    /// Cap on a single activity query (default: 100).
    pub probe_timeout_ms: u64,

    /// Cap on a single overlay call (default: 250).
    pub driver_timeout_ms: u64,

    /// Cap on a single DDC/CI brightness call (default: 2000).
    /// ddcutil re-detects displays and sleeps between I2C writes on every
    /// run, so it gets its own, longer budget.
    pub ddc_timeout_ms: u64,

    /// Passed to ddcutil as `--sleep-multiplier` when set.
    pub ddc_sleep_multiplier: Option<f64>,

    /// Length of the dimming fade in milliseconds; 0 switches at once (default: 500).
    pub fade_ms: u64,

    /// Intermediate writes per fade (default: 10).
    pub fade_steps: u32,

    /// Upper bound on restoring displays at exit (default: 2000).
    pub shutdown_timeout_ms: u64,

    /// Length of the identify flash (default: 1500).
    pub identify_duration_ms: u64,

    /// Overlay opacity of the identify flash (default: 0.6).
    pub identify_opacity: f64,

    /// Which monitors pointer movement wakes.
    pub wake_scope: WakeScope,

    /// Start with Awake Mode enabled.
    pub awake_mode: bool,

    /// Dry run mode: log driver calls instead of executing them.
    pub dry_run: bool,

    /// Path to the ddcutil binary. If unset, searches PATH.
    pub ddcutil_path: Option<PathBuf>,

    /// Overlay helper invocation. Placeholders: {output} {index} {visible} {opacity} {color}.
    /// If unset, software dimming is unavailable and overlay calls fail.
    pub overlay_command: Option<Vec<String>>,

    /// Per-monitor entries. Monitors without an entry use defaults.
    pub monitors: Vec<MonitorConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_interval_ms: 2000,
            inactivity_seconds: 10,
            cursor_cache_ms: 500,
            window_cache_ms: 1000,
            layout_refresh_ms: 3000,
            probe_timeout_ms: 100,
            driver_timeout_ms: 250,
            ddc_timeout_ms: 2000,
            ddc_sleep_multiplier: None,
            fade_ms: 500,
            fade_steps: 10,
            shutdown_timeout_ms: 2000,
            identify_duration_ms: 1500,
            identify_opacity: 0.6,
            wake_scope: WakeScope::default(),
            awake_mode: false,
            dry_run: false,
            ddcutil_path: None,
            overlay_command: None,
            monitors: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from the default path, or return defaults if not found.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(p) = path {
            return Self::load(p);
        }

        if let Some(default_path) = Self::default_path()
            && default_path.exists()
        {
            return Self::load(&default_path);
        }

        Ok(Self::default())
    }

    /// `$XDG_CONFIG_HOME/monitornap/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("monitornap").join("config.toml"))
    }

    /// Reject values the controller cannot honour.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.tick_interval_ms > 0, "tick_interval_ms must be positive");
        ensure!(self.probe_timeout_ms > 0, "probe_timeout_ms must be positive");
        ensure!(self.driver_timeout_ms > 0, "driver_timeout_ms must be positive");
        ensure!(self.ddc_timeout_ms > 0, "ddc_timeout_ms must be positive");
        ensure!(
            self.shutdown_timeout_ms > 0,
            "shutdown_timeout_ms must be positive"
        );
        ensure!(
            (1..=MAX_FADE_STEPS).contains(&self.fade_steps),
            "fade_steps must be within 1-{}, got {}",
            MAX_FADE_STEPS,
            self.fade_steps
        );
        if let Some(multiplier) = self.ddc_sleep_multiplier {
            ensure!(
                multiplier > 0.0 && multiplier <= 10.0,
                "ddc_sleep_multiplier must be within 0.0-10.0"
            );
        }
        ensure!(
            INACTIVITY_RANGE.contains(&self.inactivity_seconds),
            "inactivity_seconds must be within 1-3600, got {}",
            self.inactivity_seconds
        );
        ensure!(
            (0.0..=1.0).contains(&self.identify_opacity),
            "identify_opacity must be within 0.0-1.0"
        );
        if let Some(ref command) = self.overlay_command {
            ensure!(!command.is_empty(), "overlay_command must not be empty");
        }

        for (pos, monitor) in self.monitors.iter().enumerate() {
            if let Some(secs) = monitor.inactivity_seconds {
                ensure!(
                    INACTIVITY_RANGE.contains(&secs),
                    "monitor {}: inactivity_seconds must be within 1-3600, got {}",
                    monitor.index,
                    secs
                );
            }
            ensure!(
                monitor.hardware_brightness <= 100,
                "monitor {}: hardware_brightness must be a percentage",
                monitor.index
            );
            ensure!(
                (0.0..=1.0).contains(&monitor.overlay_opacity),
                "monitor {}: overlay_opacity must be within 0.0-1.0",
                monitor.index
            );
            ensure!(
                !self.monitors[..pos].iter().any(|m| m.index == monitor.index),
                "monitor {} is configured more than once",
                monitor.index
            );
        }

        Ok(())
    }

    /// Resolve the settings snapshot for a monitor, falling back to defaults.
    pub fn monitor_settings(&self, id: MonitorId) -> MonitorSettings {
        let fallback;
        let entry = match self.monitors.iter().find(|m| m.index == id.index()) {
            Some(entry) => entry,
            None => {
                fallback = MonitorConfig {
                    index: id.index(),
                    ..MonitorConfig::default()
                };
                &fallback
            }
        };

        let secs = entry
            .inactivity_seconds
            .unwrap_or(self.inactivity_seconds)
            .clamp(*INACTIVITY_RANGE.start(), *INACTIVITY_RANGE.end());

        MonitorSettings {
            threshold: Duration::from_secs(secs),
            hardware: entry
                .hardware_dimming
                .then_some(entry.hardware_brightness.min(100)),
            overlay: entry.software_dimming.then_some(OverlayStyle {
                opacity: entry.overlay_opacity.clamp(0.0, 1.0),
                color: entry.overlay_color,
            }),
            display_index: entry.display_index.unwrap_or(entry.index),
            ddc_display: entry.ddc_display.unwrap_or(entry.index + 1),
            expected_name: entry.expected_name.clone(),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn cursor_cache(&self) -> Duration {
        Duration::from_millis(self.cursor_cache_ms)
    }

    pub fn window_cache(&self) -> Duration {
        Duration::from_millis(self.window_cache_ms)
    }

    pub fn layout_refresh(&self) -> Duration {
        Duration::from_millis(self.layout_refresh_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn driver_timeout(&self) -> Duration {
        Duration::from_millis(self.driver_timeout_ms)
    }

    pub fn ddc_timeout(&self) -> Duration {
        Duration::from_millis(self.ddc_timeout_ms)
    }

    /// Fade used when dimming.
    pub fn dim_fade(&self) -> Fade {
        if self.fade_ms == 0 {
            return Fade::INSTANT;
        }
        Fade {
            duration: Duration::from_millis(self.fade_ms),
            steps: self.fade_steps.clamp(1, MAX_FADE_STEPS),
        }
    }

    /// Fade used when waking: a short, near-instant ramp.
    pub fn wake_fade(&self) -> Fade {
        if self.fade_ms == 0 {
            return Fade::INSTANT;
        }
        Fade {
            duration: (Duration::from_millis(self.fade_ms) / WAKE_FADE_DIVISOR)
                .max(Duration::from_millis(10)),
            steps: self.fade_steps.clamp(1, WAKE_FADE_STEPS),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn identify_duration(&self) -> Duration {
        Duration::from_millis(self.identify_duration_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.tick_interval_ms, 2000);
        assert_eq!(config.inactivity_seconds, 10);
        assert_eq!(config.cursor_cache_ms, 500);
        assert_eq!(config.window_cache_ms, 1000);
        assert_eq!(config.wake_scope, WakeScope::All);
        assert!(!config.dry_run);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_monitor_settings_defaults() {
        let config = Config::default();
        let settings = config.monitor_settings(MonitorId::new(1));

        assert_eq!(settings.threshold, Duration::from_secs(10));
        assert_eq!(settings.hardware, Some(30));
        assert_eq!(settings.display_index, 1);
        assert_eq!(settings.ddc_display, 2);
        let overlay = settings.overlay.unwrap();
        assert!((overlay.opacity - 0.5).abs() < f64::EPSILON);
        assert_eq!(overlay.color, Color::BLACK);
    }

    #[test]
    fn test_monitor_settings_override() {
        let config = Config {
            monitors: vec![MonitorConfig {
                index: 0,
                inactivity_seconds: Some(120),
                hardware_dimming: false,
                overlay_color: Color::new(0x20, 0, 0),
                ddc_display: Some(3),
                ..MonitorConfig::default()
            }],
            ..Config::default()
        };

        let settings = config.monitor_settings(MonitorId::new(0));
        assert_eq!(settings.threshold, Duration::from_secs(120));
        assert_eq!(settings.hardware, None);
        assert_eq!(settings.ddc_display, 3);
        assert_eq!(settings.overlay.unwrap().color, Color::new(0x20, 0, 0));
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let config = Config {
            inactivity_seconds: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            monitors: vec![MonitorConfig {
                inactivity_seconds: Some(3601),
                ..MonitorConfig::default()
            }],
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            monitors: vec![MonitorConfig {
                overlay_opacity: 1.5,
                ..MonitorConfig::default()
            }],
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            monitors: vec![MonitorConfig::default(), MonitorConfig::default()],
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        for config in [
            Config {
                probe_timeout_ms: 0,
                ..Config::default()
            },
            Config {
                driver_timeout_ms: 0,
                ..Config::default()
            },
            Config {
                ddc_timeout_ms: 0,
                ..Config::default()
            },
            Config {
                shutdown_timeout_ms: 0,
                ..Config::default()
            },
            Config {
                fade_steps: 0,
                ..Config::default()
            },
        ] {
            assert!(config.validate().is_err(), "accepted {config:?}");
        }
    }

    #[test]
    fn test_load_rejects_zero_driver_timeout() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "driver_timeout_ms = 0").unwrap();

        let err = Config::load(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("driver_timeout_ms"));
    }

    #[test]
    fn test_fades() {
        let config = Config::default();
        assert_eq!(
            config.dim_fade(),
            Fade {
                duration: Duration::from_millis(500),
                steps: 10
            }
        );
        assert_eq!(config.dim_fade().interval(), Duration::from_millis(50));

        let wake = config.wake_fade();
        assert_eq!(wake.steps, 3);
        assert_eq!(wake.duration, Duration::from_millis(25));

        let config = Config {
            fade_ms: 0,
            ..Config::default()
        };
        assert_eq!(config.dim_fade(), Fade::INSTANT);
        assert_eq!(config.wake_fade(), Fade::INSTANT);
    }

    #[test]
    fn test_hardware_timeout_separate_from_overlay() {
        let config = Config::default();
        assert_eq!(config.driver_timeout(), Duration::from_millis(250));
        assert_eq!(config.ddc_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r##"
            inactivity_seconds = 30
            wake_scope = "pointer_monitor"
            dry_run = true
            overlay_command = ["nap-overlay", "{output}", "{opacity}"]

            [[monitors]]
            index = 1
            expected_name = "DP-2"
            hardware_brightness = 10
            overlay_color = "#102030"
        "##;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.inactivity_seconds, 30);
        assert_eq!(config.wake_scope, WakeScope::PointerMonitor);
        assert!(config.dry_run);
        assert_eq!(config.monitors.len(), 1);
        assert_eq!(config.monitors[0].expected_name.as_deref(), Some("DP-2"));
        assert_eq!(config.monitors[0].overlay_color, Color::new(0x10, 0x20, 0x30));
        assert!(config.monitors[0].software_dimming);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml_bad_color() {
        let toml_str = r##"
            [[monitors]]
            index = 0
            overlay_color = "black"
        "##;
        assert!(toml::from_str::<Config>(toml_str).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "tick_interval_ms = 1000\ninactivity_seconds = 60").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.tick_interval(), Duration::from_secs(1));
        assert_eq!(config.inactivity_seconds, 60);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "inactivity_seconds = 7200").unwrap();

        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_load_or_default_explicit_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(Config::load_or_default(Some(&missing)).is_err());
    }
}
