//! Per-monitor dimming state machine.
//!
//! A [`MonitorState`] tracks one display's phase and what has actually been
//! applied to it. The transition function is pure over a [`TickInput`]; the
//! driver side is expressed as a [`DriverPlan`] the controller executes and
//! reports back, so a failed call leaves the intended phase in place and the
//! outstanding work is planned again on the next tick.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::backend::DisplayOutput;
use crate::config::MonitorSettings;
use crate::dimmer::DisplayTarget;
use crate::dimmer::OverlayRequest;
use crate::domain::Color;
use crate::domain::GlobalModifiers;
use crate::domain::MonitorId;
use crate::domain::Phase;
use crate::domain::Rect;

/// Why a phase changed. Carried on every telemetry event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    IdleThreshold,
    Activity,
    AwakeMode,
    Paused,
    ModifiersCleared,
    NapNow,
    ResumeNow,
    IdentifyStarted,
    IdentifyFinished,
}

impl TransitionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IdleThreshold => "idle_threshold",
            Self::Activity => "activity",
            Self::AwakeMode => "awake_mode",
            Self::Paused => "paused",
            Self::ModifiersCleared => "modifiers_cleared",
            Self::NapNow => "nap_now",
            Self::ResumeNow => "resume_now",
            Self::IdentifyStarted => "identify_started",
            Self::IdentifyFinished => "identify_finished",
        }
    }
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A visible phase change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub monitor: MonitorId,
    pub from: Phase,
    pub to: Phase,
    pub reason: TransitionReason,
}

/// Per-tick observations for one monitor.
#[derive(Debug, Clone, Copy)]
pub struct TickInput {
    pub now: Instant,
    /// Pointer movement or a fullscreen enter/exit counted for this monitor.
    pub activity: bool,
    /// A fullscreen window currently suppresses idling on this monitor.
    pub suppressed: bool,
    pub modifiers: GlobalModifiers,
}

/// Pure transition function over the logical phase (never `Identifying`).
pub fn next_phase(
    current: Phase,
    idle: Duration,
    threshold: Duration,
    input: &TickInput,
) -> Option<(Phase, TransitionReason)> {
    if input.modifiers.forces_awake(input.now) {
        let reason = if input.modifiers.awake_mode {
            TransitionReason::AwakeMode
        } else {
            TransitionReason::Paused
        };
        return (current != Phase::ForcedAwake).then_some((Phase::ForcedAwake, reason));
    }

    let idle_reached = idle >= threshold && !input.suppressed;

    match current {
        Phase::ForcedAwake => Some(if idle_reached {
            (Phase::Dimmed, TransitionReason::IdleThreshold)
        } else {
            (Phase::Active, TransitionReason::ModifiersCleared)
        }),
        Phase::Active | Phase::Identifying => {
            idle_reached.then_some((Phase::Dimmed, TransitionReason::IdleThreshold))
        }
        Phase::Dimmed => input
            .activity
            .then_some((Phase::Active, TransitionReason::Activity)),
    }
}

/// Brightness work for one display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareStep {
    /// Read the pre-dim brightness first, then dim to `min(level, read)`.
    CaptureThenDim { level: u8 },
    /// Pre-dim brightness is known; write the dim level.
    Dim { level: u8 },
    /// Write back the pre-dim brightness.
    Restore { to: u8 },
}

/// Driver calls needed to bring a display to its intended state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriverPlan {
    pub hardware: Option<HardwareStep>,
    pub overlay: Option<OverlayRequest>,
    /// What the display is known to show now. Fades start from here.
    pub current_brightness: Option<u8>,
    pub current_overlay: OverlayRequest,
}

impl DriverPlan {
    pub fn is_empty(&self) -> bool {
        self.hardware.is_none() && self.overlay.is_none()
    }
}

/// Runtime state of one managed display.
#[derive(Debug)]
pub struct MonitorState {
    id: MonitorId,
    settings: MonitorSettings,
    identify_opacity: f64,
    output: Option<DisplayOutput>,

    /// Logical phase; `Identifying` is layered on top via `identify_until`.
    phase: Phase,
    last_activity: Instant,
    identify_until: Option<Instant>,
    suppressed: bool,

    /// Last brightness known to be on the display.
    applied_brightness: Option<u8>,
    /// Brightness captured before dimming, pending restore.
    restore_brightness: Option<u8>,
    /// Last overlay state known to be on the display.
    applied_overlay: OverlayRequest,
}

impl MonitorState {
    /// Start managing a display: `Active`, with activity as of `now`.
    pub fn new(
        id: MonitorId,
        settings: MonitorSettings,
        identify_opacity: f64,
        output: Option<DisplayOutput>,
        now: Instant,
    ) -> Self {
        Self {
            id,
            settings,
            identify_opacity,
            output,
            phase: Phase::Active,
            last_activity: now,
            identify_until: None,
            suppressed: false,
            applied_brightness: None,
            restore_brightness: None,
            applied_overlay: OverlayRequest::hidden(),
        }
    }

    pub fn id(&self) -> MonitorId {
        self.id
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    pub fn output(&self) -> Option<&DisplayOutput> {
        self.output.as_ref()
    }

    pub fn rect(&self) -> Option<&Rect> {
        self.output.as_ref().map(|o| &o.rect)
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    /// Phase as seen from outside, including the identify flash.
    pub fn phase(&self) -> Phase {
        if self.identify_until.is_some() {
            Phase::Identifying
        } else {
            self.phase
        }
    }

    /// Phase the monitor returns to once an identify flash ends.
    pub fn logical_phase(&self) -> Phase {
        self.phase
    }

    pub fn identify_deadline(&self) -> Option<Instant> {
        self.identify_until
    }

    /// Driver address of this display.
    pub fn target(&self) -> DisplayTarget {
        DisplayTarget {
            id: self.id,
            name: self.output.as_ref().map(|o| o.name.clone()),
            ddc_display: self.settings.ddc_display,
        }
    }

    /// Name mismatch between the configured mapping and the enumerated output.
    pub fn identity_warning(&self) -> Option<String> {
        let expected = self.settings.expected_name.as_deref()?;
        match self.output.as_ref() {
            Some(output) if output.name != expected => Some(format!(
                "{} is configured as '{}' but enumerated as '{}'",
                self.id, expected, output.name
            )),
            _ => None,
        }
    }

    pub fn set_output(&mut self, output: Option<DisplayOutput>) {
        self.output = output;
    }

    /// Swap in a new settings snapshot. Takes effect on the next plan.
    pub fn update_settings(&mut self, settings: MonitorSettings, identify_opacity: f64) {
        self.settings = settings;
        self.identify_opacity = identify_opacity;
    }

    /// Apply one tick of observations and evaluate the transition function.
    pub fn tick(&mut self, input: &TickInput) -> Option<Transition> {
        let before = self.phase();

        if input.activity || input.suppressed {
            self.last_activity = input.now;
        }
        self.suppressed = input.suppressed;

        let mut reason = None;
        if let Some((to, why)) = next_phase(
            self.phase,
            self.idle(input.now),
            self.settings.threshold,
            input,
        ) {
            self.phase = to;
            reason = Some(why);
        }

        if self.identify_until.is_some_and(|until| input.now >= until) {
            self.identify_until = None;
            reason = reason.or(Some(TransitionReason::IdentifyFinished));
        }

        self.settle_restore();
        self.transition_from(before, reason)
    }

    /// End an identify flash whose deadline passed, without a full tick.
    pub fn finish_identify(&mut self, now: Instant) -> Option<Transition> {
        if !self.identify_until.is_some_and(|until| now >= until) {
            return None;
        }
        let before = self.phase();
        self.identify_until = None;
        self.transition_from(before, Some(TransitionReason::IdentifyFinished))
    }

    /// Manual "Nap Now": dim until the next activity.
    pub fn nap(&mut self, now: Instant) -> Option<Transition> {
        let before = self.phase();
        self.phase = Phase::Dimmed;
        self.last_activity = now;
        self.transition_from(before, Some(TransitionReason::NapNow))
    }

    /// Manual "Resume Now": wake and restart the idle timer.
    pub fn resume(&mut self, now: Instant) -> Option<Transition> {
        let before = self.phase();
        self.phase = Phase::Active;
        self.last_activity = now;
        self.settle_restore();
        self.transition_from(before, Some(TransitionReason::ResumeNow))
    }

    /// Start (or extend) the identify flash.
    pub fn identify(&mut self, now: Instant, duration: Duration) -> Option<Transition> {
        let before = self.phase();
        self.identify_until = Some(now + duration);
        self.transition_from(before, Some(TransitionReason::IdentifyStarted))
    }

    /// Drop a pending restore the display already matches.
    fn settle_restore(&mut self) {
        if self.phase != Phase::Dimmed && self.restore_brightness == self.applied_brightness {
            self.restore_brightness = None;
        }
    }

    fn transition_from(
        &self,
        before: Phase,
        reason: Option<TransitionReason>,
    ) -> Option<Transition> {
        let to = self.phase();
        match reason {
            Some(reason) if before != to => Some(Transition {
                monitor: self.id,
                from: before,
                to,
                reason,
            }),
            _ => None,
        }
    }

    fn overlay_color(&self) -> Color {
        self.settings
            .overlay
            .map_or(Color::BLACK, |style| style.color)
    }

    /// Overlay state the current phase calls for.
    pub fn desired_overlay(&self) -> OverlayRequest {
        if self.identify_until.is_some() {
            return OverlayRequest::shown(self.identify_opacity, self.overlay_color());
        }
        match (self.phase, self.settings.overlay) {
            (Phase::Dimmed, Some(style)) => OverlayRequest::shown(style.opacity, style.color),
            _ => OverlayRequest::hidden(),
        }
    }

    /// Brightness work the current phase calls for.
    pub fn desired_hardware(&self) -> Option<HardwareStep> {
        match (self.phase, self.settings.hardware, self.restore_brightness) {
            (Phase::Dimmed, Some(level), None) => Some(HardwareStep::CaptureThenDim { level }),
            (Phase::Dimmed, Some(level), Some(original)) => {
                let level = level.min(original);
                (self.applied_brightness != Some(level)).then_some(HardwareStep::Dim { level })
            }
            (_, _, Some(original)) => (self.applied_brightness != Some(original))
                .then_some(HardwareStep::Restore { to: original }),
            (_, _, None) => None,
        }
    }

    /// Driver calls still outstanding. Empty once the display matches.
    pub fn plan(&self) -> DriverPlan {
        let desired_overlay = self.desired_overlay();
        DriverPlan {
            hardware: self.desired_hardware(),
            overlay: (!overlays_match(&self.applied_overlay, &desired_overlay))
                .then_some(desired_overlay),
            current_brightness: self.applied_brightness,
            current_overlay: self.applied_overlay,
        }
    }

    /// Calls that undo any engaged dimming, regardless of phase.
    pub fn release_plan(&self) -> DriverPlan {
        DriverPlan {
            hardware: self
                .pending_restore()
                .map(|to| HardwareStep::Restore { to }),
            overlay: self
                .applied_overlay
                .visible
                .then_some(OverlayRequest::hidden()),
            current_brightness: self.applied_brightness,
            current_overlay: self.applied_overlay,
        }
    }

    /// Pre-dim brightness not yet known to be back on the display.
    pub fn pending_restore(&self) -> Option<u8> {
        self.restore_brightness
            .filter(|original| self.applied_brightness != Some(*original))
    }

    /// Carry over a restore owed from an earlier life of this display.
    ///
    /// What the panel shows is unknown, so the next plan writes the value
    /// back unless the display is dimmed again first.
    pub fn adopt_restore(&mut self, original: u8) {
        self.restore_brightness = Some(original);
        self.applied_brightness = None;
    }

    /// Record a successful brightness read taken before dimming.
    pub fn record_brightness_read(&mut self, percent: u8) {
        self.restore_brightness = Some(percent);
        self.applied_brightness = Some(percent);
    }

    /// Record a successful brightness write.
    pub fn record_brightness_written(&mut self, percent: u8) {
        self.applied_brightness = Some(percent);
        if self.phase != Phase::Dimmed && self.restore_brightness == Some(percent) {
            self.restore_brightness = None;
        }
    }

    /// Record a successful overlay call.
    pub fn record_overlay(&mut self, request: OverlayRequest) {
        self.applied_overlay = request;
    }

    pub fn overlay_visible(&self) -> bool {
        self.applied_overlay.visible
    }

    pub fn applied_brightness(&self) -> Option<u8> {
        self.applied_brightness
    }
}

/// Hidden overlays match regardless of style.
fn overlays_match(a: &OverlayRequest, b: &OverlayRequest) -> bool {
    match (a.visible, b.visible) {
        (false, false) => true,
        (true, true) => (a.opacity - b.opacity).abs() < 1e-6 && a.color == b.color,
        _ => false,
    }
}
