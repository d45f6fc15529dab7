//! Compositor backends.
//!
//! A backend provides raw activity signals (`ActivityProbe`) and the current
//! display layout ([`DisplaySource`]).

mod hyprland;

use async_trait::async_trait;
pub use hyprland::HyprlandSource;

use crate::domain::Rect;
use crate::sampler::SampleError;

/// One enumerated output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayOutput {
    /// Enumeration index (position in the compositor's list).
    pub index: u32,

    /// Connector name, e.g. "DP-1".
    pub name: String,

    /// Position and size in layout coordinates.
    pub rect: Rect,
}

/// Trait for display layout sources.
#[async_trait]
pub trait DisplaySource: Send + Sync {
    /// Enumerate the currently connected outputs.
    async fn displays(&self) -> Result<Vec<DisplayOutput>, SampleError>;
}
