//! Domain types shared by the sampler, the state machine and the controller.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

/// Stable identity of a managed display (its enumeration index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MonitorId(u32);

impl MonitorId {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MonitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "monitor-{}", self.0)
    }
}

/// Phase of a monitor's dimming state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Active,
    Dimmed,
    /// Awake Mode or a pause window is holding the monitor awake.
    ForcedAwake,
    /// Transient identify flash.
    Identifying,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Dimmed => "dimmed",
            Self::ForcedAwake => "forced_awake",
            Self::Identifying => "identifying",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Screen-space position of the pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned rectangle in layout coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    fn right(&self) -> i64 {
        i64::from(self.x) + i64::from(self.width)
    }

    fn bottom(&self) -> i64 {
        i64::from(self.y) + i64::from(self.height)
    }

    /// Half-open containment: the right and bottom edges belong to the neighbour.
    pub fn contains(&self, point: Point) -> bool {
        let (px, py) = (i64::from(point.x), i64::from(point.y));
        i64::from(self.x) <= px && px < self.right() && i64::from(self.y) <= py && py < self.bottom()
    }

    /// Fraction of `self` covered by `other`, in `0.0..=1.0`.
    #[allow(clippy::cast_precision_loss)]
    pub fn coverage_by(&self, other: &Rect) -> f64 {
        let left = i64::from(self.x).max(i64::from(other.x));
        let top = i64::from(self.y).max(i64::from(other.y));
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());

        let overlap = (right - left).max(0) * (bottom - top).max(0);
        let area = (i64::from(self.width) * i64::from(self.height)).max(1);
        overlap as f64 / area as f64
    }
}

/// Overlay tint color, written as `#rrggbb` in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const BLACK: Color = Color { r: 0, g: 0, b: 0 };

    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

impl Default for Color {
    fn default() -> Self {
        Self::BLACK
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Invalid color '{0}', expected #rrggbb")]
pub struct ParseColorError(String);

impl FromStr for Color {
    type Err = ParseColorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s
            .strip_prefix('#')
            .filter(|h| h.len() == 6 && h.chars().all(|c| c.is_ascii_hexdigit()))
            .ok_or_else(|| ParseColorError(s.to_string()))?;

        let channel = |range: std::ops::Range<usize>| {
            u8::from_str_radix(&hex[range], 16).map_err(|_| ParseColorError(s.to_string()))
        };

        Ok(Self::new(channel(0..2)?, channel(2..4)?, channel(4..6)?))
    }
}

impl TryFrom<String> for Color {
    type Error = ParseColorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Color> for String {
    fn from(color: Color) -> Self {
        color.to_string()
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// Supported "pause dimming" lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseDuration {
    Fifteen,
    Thirty,
    Sixty,
}

impl PauseDuration {
    pub fn minutes(self) -> u64 {
        match self {
            Self::Fifteen => 15,
            Self::Thirty => 30,
            Self::Sixty => 60,
        }
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_secs(self.minutes() * 60)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Unsupported pause length {0} minutes (expected 15, 30 or 60)")]
pub struct InvalidPauseDuration(pub u64);

impl TryFrom<u64> for PauseDuration {
    type Error = InvalidPauseDuration;

    fn try_from(minutes: u64) -> Result<Self, Self::Error> {
        match minutes {
            15 => Ok(Self::Fifteen),
            30 => Ok(Self::Thirty),
            60 => Ok(Self::Sixty),
            other => Err(InvalidPauseDuration(other)),
        }
    }
}

/// Process-wide overrides that suppress all dimming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GlobalModifiers {
    pub awake_mode: bool,
    pub paused_until: Option<Instant>,
}

impl GlobalModifiers {
    pub fn is_paused(&self, now: Instant) -> bool {
        self.paused_until.is_some_and(|until| now < until)
    }

    /// True when either modifier holds every monitor awake.
    pub fn forces_awake(&self, now: Instant) -> bool {
        self.awake_mode || self.is_paused(now)
    }

    pub fn pause_remaining(&self, now: Instant) -> Option<Duration> {
        self.paused_until
            .filter(|until| now < *until)
            .map(|until| until - now)
    }
}
