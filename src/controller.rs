//! Dimming controller.
//!
//! One task owns every [`MonitorState`]. It wakes on a fixed tick, on queued
//! commands, and when an identify flash is due to end. Commands from other
//! contexts only ever reach the state through [`ControllerHandle`], so the
//! global modifiers have a single mutation point and are never observed
//! half-updated by a tick.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::backend::DisplayOutput;
use crate::backend::DisplaySource;
use crate::config::Config;
use crate::config::Fade;
use crate::config::WakeScope;
use crate::dimmer::DisplayTarget;
use crate::dimmer::DriverError;
use crate::dimmer::HardwareDimmer;
use crate::dimmer::OverlayDimmer;
use crate::dimmer::OverlayRequest;
use crate::dimmer::bounded;
use crate::dimmer::brightness_ramp;
use crate::dimmer::overlay_ramp;
use crate::domain::GlobalModifiers;
use crate::domain::MonitorId;
use crate::domain::PauseDuration;
use crate::domain::Phase;
use crate::domain::Point;
use crate::domain::Rect;
use crate::monitor::DriverPlan;
use crate::monitor::HardwareStep;
use crate::monitor::MonitorState;
use crate::monitor::TickInput;
use crate::monitor::Transition;
use crate::sampler::ActivityProbe;
use crate::sampler::ActivitySampler;
use crate::sampler::CacheSlot;
use crate::sampler::is_fullscreen_suppressed;
use crate::throttle::FailureThrottle;
use crate::throttle::LogDecision;

/// User commands accepted by the controller.
#[derive(Debug)]
pub enum Command {
    ToggleAwakeMode,
    SetAwakeMode(bool),
    NapNow,
    ResumeNow,
    PauseFor(PauseDuration),
    Identify(MonitorId),
    UpdateConfig(Box<Config>),
    Status(oneshot::Sender<Status>),
}

/// Errors from talking to the controller task.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Controller is not running")]
    Closed,
}

/// Snapshot of one monitor for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorStatus {
    pub id: MonitorId,
    pub name: Option<String>,
    pub phase: Phase,
    pub idle_seconds: u64,
    pub brightness: Option<u8>,
    pub overlay_visible: bool,
    pub identity_warning: Option<String>,
}

/// Snapshot of the controller for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Status {
    pub awake_mode: bool,
    pub pause_remaining_seconds: Option<u64>,
    pub monitors: Vec<MonitorStatus>,
}

/// Cloneable sender side of the command queue.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ControllerHandle {
    /// Handle whose commands land in the returned receiver.
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, command: Command) -> Result<(), ControlError> {
        self.tx.send(command).map_err(|_| ControlError::Closed)
    }

    pub fn toggle_awake_mode(&self) -> Result<(), ControlError> {
        self.send(Command::ToggleAwakeMode)
    }

    pub fn set_awake_mode(&self, enabled: bool) -> Result<(), ControlError> {
        self.send(Command::SetAwakeMode(enabled))
    }

    pub fn nap_now(&self) -> Result<(), ControlError> {
        self.send(Command::NapNow)
    }

    pub fn resume_now(&self) -> Result<(), ControlError> {
        self.send(Command::ResumeNow)
    }

    pub fn pause_for(&self, duration: PauseDuration) -> Result<(), ControlError> {
        self.send(Command::PauseFor(duration))
    }

    pub fn identify(&self, monitor: MonitorId) -> Result<(), ControlError> {
        self.send(Command::Identify(monitor))
    }

    pub fn update_config(&self, config: Config) -> Result<(), ControlError> {
        self.send(Command::UpdateConfig(Box::new(config)))
    }

    pub async fn status(&self) -> Result<Status, ControlError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Status(tx))?;
        rx.await.map_err(|_| ControlError::Closed)
    }
}

/// Which driver a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum DriverKind {
    Hardware,
    Overlay,
}

impl DriverKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Hardware => "hardware",
            Self::Overlay => "overlay",
        }
    }
}

/// Per-call caps and fades used when executing plans.
#[derive(Debug, Clone, Copy)]
struct DriverBudget {
    hardware_timeout: Duration,
    overlay_timeout: Duration,
    dim_fade: Fade,
    wake_fade: Fade,
}

impl DriverBudget {
    fn from_config(config: &Config) -> Self {
        Self {
            hardware_timeout: config.ddc_timeout(),
            overlay_timeout: config.driver_timeout(),
            dim_fade: config.dim_fade(),
            wake_fade: config.wake_fade(),
        }
    }
}

/// Result of executing one monitor's [`DriverPlan`].
#[derive(Debug, Default)]
struct PlanOutcome {
    brightness_read: Option<u8>,
    brightness_written: Option<u8>,
    overlay_applied: Option<OverlayRequest>,
    hardware_error: Option<DriverError>,
    overlay_error: Option<DriverError>,
    hardware_attempted: bool,
}

/// Owner of all per-monitor state.
pub struct DimmingController {
    config: Config,
    probe: Arc<dyn ActivityProbe>,
    sampler: ActivitySampler,
    displays: Arc<dyn DisplaySource>,
    layout: CacheSlot<Vec<DisplayOutput>>,
    hardware: Arc<dyn HardwareDimmer>,
    overlay: Arc<dyn OverlayDimmer>,
    monitors: BTreeMap<MonitorId, MonitorState>,
    /// Pre-dim brightness owed to displays that dropped out while dimmed.
    parked_restores: HashMap<MonitorId, u8>,
    modifiers: GlobalModifiers,
    last_cursor: Option<Point>,
    failures: FailureThrottle<(MonitorId, DriverKind)>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl DimmingController {
    /// Create a controller and the handle used to command it.
    pub fn new(
        config: Config,
        probe: Arc<dyn ActivityProbe>,
        displays: Arc<dyn DisplaySource>,
        hardware: Arc<dyn HardwareDimmer>,
        overlay: Arc<dyn OverlayDimmer>,
    ) -> (Self, ControllerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sampler = build_sampler(&config, Arc::clone(&probe));

        let controller = Self {
            modifiers: GlobalModifiers {
                awake_mode: config.awake_mode,
                paused_until: None,
            },
            layout: CacheSlot::new("layout", config.layout_refresh()),
            config,
            probe,
            sampler,
            displays,
            hardware,
            overlay,
            monitors: BTreeMap::new(),
            parked_restores: HashMap::new(),
            last_cursor: None,
            failures: FailureThrottle::default(),
            commands: rx,
        };

        (controller, ControllerHandle { tx })
    }

    pub fn modifiers(&self) -> GlobalModifiers {
        self.modifiers
    }

    pub fn monitor(&self, id: MonitorId) -> Option<&MonitorState> {
        self.monitors.get(&id)
    }

    pub fn monitor_ids(&self) -> Vec<MonitorId> {
        self.monitors.keys().copied().collect()
    }

    /// Drive ticks and commands until `shutdown` fires, then release displays.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut tick_interval = self.config.tick_interval();
        let mut interval = new_interval(tick_interval);

        info!(
            "Controller started, ticking every {:?} (awake_mode={})",
            tick_interval, self.modifiers.awake_mode
        );

        loop {
            let identify_deadline = self.next_identify_deadline();

            tokio::select! {
                () = shutdown.cancelled() => break,

                _ = interval.tick() => self.tick().await,

                Some(command) = self.commands.recv() => {
                    self.apply(command).await;
                    if self.config.tick_interval() != tick_interval {
                        tick_interval = self.config.tick_interval();
                        interval = new_interval(tick_interval);
                        info!("Tick interval changed to {:?}", tick_interval);
                    }
                }

                () = sleep_until_opt(identify_deadline) => self.finish_identify().await,
            }
        }

        info!("Controller stopping, releasing displays");
        self.release().await;
    }

    /// One controller tick: sample, evaluate every monitor, dispatch.
    pub async fn tick(&mut self) {
        let now = Instant::now();
        self.expire_pause(now);
        self.refresh_layout(now).await;

        let sample = self.sampler.sample().await;
        let cursor = sample.cursor_position();
        let moved_to = match (self.last_cursor, cursor) {
            (Some(prev), Some(current)) if prev != current => Some(current),
            _ => None,
        };
        if cursor.is_some() {
            self.last_cursor = cursor;
        }

        let wake_scope = self.config.wake_scope;
        let modifiers = self.modifiers;
        for monitor in self.monitors.values_mut() {
            let suppressed = is_fullscreen_suppressed(&sample, monitor.rect());
            let fullscreen_changed = suppressed != monitor.is_suppressed();
            let moved_here = moved_to.is_some_and(|point| match wake_scope {
                WakeScope::All => true,
                WakeScope::PointerMonitor => monitor.rect().is_none_or(|r| r.contains(point)),
            });

            let input = TickInput {
                now,
                activity: moved_here || fullscreen_changed,
                suppressed,
                modifiers,
            };
            if let Some(transition) = monitor.tick(&input) {
                log_transition(&transition);
            }
        }

        self.dispatch().await;
    }

    /// Apply one command immediately, out of band from the tick.
    pub async fn apply(&mut self, command: Command) {
        let now = Instant::now();

        match command {
            Command::ToggleAwakeMode => {
                let forced = self.modifiers.forces_awake(now);
                if self.modifiers.paused_until.take().is_some() {
                    info!("Cleared pause due to awake mode toggle");
                }
                self.modifiers.awake_mode = !forced;
                info!("Awake mode {}", on_off(self.modifiers.awake_mode));
                self.tick().await;
            }
            Command::SetAwakeMode(enabled) => {
                if !enabled && self.modifiers.paused_until.take().is_some() {
                    info!("Cleared pause due to awake mode OFF");
                }
                self.modifiers.awake_mode = enabled;
                info!("Awake mode {}", on_off(enabled));
                self.tick().await;
            }
            Command::PauseFor(duration) => {
                self.modifiers.paused_until = Some(now + duration.as_duration());
                info!("Dimming paused for {} minutes", duration.minutes());
                self.tick().await;
            }
            Command::ResumeNow => {
                self.modifiers.awake_mode = false;
                if self.modifiers.paused_until.take().is_some() {
                    info!("Cleared pause due to manual resume");
                }
                info!("Resume now");
                for monitor in self.monitors.values_mut() {
                    if let Some(transition) = monitor.resume(now) {
                        log_transition(&transition);
                    }
                }
                self.reset_cursor_baseline().await;
                self.dispatch().await;
            }
            Command::NapNow => {
                if self.modifiers.forces_awake(now) {
                    info!("Ignoring nap request: awake mode or pause is active");
                    return;
                }
                info!("Nap now");
                for monitor in self.monitors.values_mut() {
                    if let Some(transition) = monitor.nap(now) {
                        log_transition(&transition);
                    }
                }
                self.reset_cursor_baseline().await;
                self.dispatch().await;
            }
            Command::Identify(id) => {
                let duration = self.config.identify_duration();
                match self.monitors.get_mut(&id) {
                    Some(monitor) => {
                        if let Some(transition) = monitor.identify(now, duration) {
                            log_transition(&transition);
                        }
                        self.dispatch().await;
                    }
                    None => warn!("Cannot identify {}: not managed", id),
                }
            }
            Command::UpdateConfig(config) => self.update_config(*config),
            Command::Status(reply) => {
                // Receiver may have gone away; nothing to do then.
                let _ = reply.send(self.status(now));
            }
        }
    }

    /// Current controller snapshot.
    pub fn status(&self, now: Instant) -> Status {
        Status {
            awake_mode: self.modifiers.awake_mode,
            pause_remaining_seconds: self
                .modifiers
                .pause_remaining(now)
                .map(|d| d.as_secs()),
            monitors: self
                .monitors
                .values()
                .map(|m| MonitorStatus {
                    id: m.id(),
                    name: m.output().map(|o| o.name.clone()),
                    phase: m.phase(),
                    idle_seconds: m.idle(now).as_secs(),
                    brightness: m.applied_brightness(),
                    overlay_visible: m.overlay_visible(),
                    identity_warning: m.identity_warning(),
                })
                .collect(),
        }
    }

    /// End identify flashes that are due and put the overlays back.
    pub async fn finish_identify(&mut self) {
        let now = Instant::now();
        for monitor in self.monitors.values_mut() {
            if let Some(transition) = monitor.finish_identify(now) {
                log_transition(&transition);
            }
        }
        self.dispatch().await;
    }

    /// Undo engaged dimming on every display, bounded by the shutdown timeout.
    pub async fn release(&mut self) {
        let plans: Vec<_> = self
            .monitors
            .values()
            .map(|m| (m.id(), m.target(), m.release_plan()))
            .filter(|(_, _, plan)| !plan.is_empty())
            .collect();

        if plans.is_empty() {
            return;
        }

        let timeout = self.config.shutdown_timeout();
        match tokio::time::timeout(timeout, self.execute_all(plans)).await {
            Ok(outcomes) => {
                self.record_outcomes(outcomes);
                info!("Displays restored");
            }
            Err(_) => warn!("Gave up restoring displays after {:?}", timeout),
        }
    }

    fn update_config(&mut self, config: Config) {
        let sampler_changed = config.cursor_cache_ms != self.config.cursor_cache_ms
            || config.window_cache_ms != self.config.window_cache_ms
            || config.probe_timeout_ms != self.config.probe_timeout_ms;
        let layout_changed = config.layout_refresh_ms != self.config.layout_refresh_ms;

        self.config = config;

        if sampler_changed {
            self.sampler = build_sampler(&self.config, Arc::clone(&self.probe));
        }
        if layout_changed {
            self.layout = CacheSlot::new("layout", self.config.layout_refresh());
        }

        for monitor in self.monitors.values_mut() {
            let settings = self.config.monitor_settings(monitor.id());
            monitor.update_settings(settings, self.config.identify_opacity);
        }
        info!("Configuration updated ({} monitors)", self.monitors.len());
    }

    fn expire_pause(&mut self, now: Instant) {
        if self
            .modifiers
            .paused_until
            .is_some_and(|until| now >= until)
        {
            self.modifiers.paused_until = None;
            info!("Pause expired, resuming normal dimming");
        }
    }

    /// Bring the managed set in line with the enumerated outputs.
    async fn refresh_layout(&mut self, now: Instant) {
        let displays = Arc::clone(&self.displays);
        let observed = self
            .layout
            .get(self.config.probe_timeout(), || async move {
                displays.displays().await
            })
            .await;

        let outputs = match observed {
            Some(observed) => observed.value,
            None if self.monitors.is_empty() => {
                // Layout never read: fall back to the configured monitors.
                self.config
                    .monitors
                    .iter()
                    .map(|m| DisplayOutput {
                        index: m.index,
                        name: m.expected_name.clone().unwrap_or_default(),
                        rect: Rect::default(),
                    })
                    .collect()
            }
            None => return,
        };

        let present: Vec<MonitorId> = outputs.iter().map(|o| MonitorId::new(o.index)).collect();

        let vanished: Vec<MonitorId> = self
            .monitors
            .keys()
            .filter(|id| !present.contains(id))
            .copied()
            .collect();
        let mut dropped = Vec::new();
        for id in vanished {
            if let Some(monitor) = self.monitors.remove(&id) {
                self.failures.forget(&(id, DriverKind::Hardware));
                self.failures.forget(&(id, DriverKind::Overlay));
                info!(monitor = %id, "Display no longer enumerated, dropping");
                dropped.push(monitor);
            }
        }
        if !dropped.is_empty() {
            self.release_dropped(dropped).await;
        }

        for id in present {
            let settings = self.config.monitor_settings(id);
            let output = outputs
                .iter()
                .find(|o| o.index == settings.display_index)
                .filter(|o| o.rect.width > 0 && o.rect.height > 0)
                .cloned();

            match self.monitors.get_mut(&id) {
                Some(monitor) => {
                    let had_warning = monitor.identity_warning().is_some();
                    monitor.set_output(output);
                    if !had_warning && let Some(warning) = monitor.identity_warning() {
                        warn!(monitor = %id, "Identity mismatch: {}", warning);
                    }
                }
                None => {
                    let mut monitor = MonitorState::new(
                        id,
                        settings,
                        self.config.identify_opacity,
                        output,
                        now,
                    );
                    if let Some(original) = self.parked_restores.remove(&id) {
                        info!(
                            monitor = %id,
                            "Display returned, restoring brightness {}%",
                            original
                        );
                        monitor.adopt_restore(original);
                    }
                    info!(
                        monitor = %id,
                        "Managing display {} (ddc display {})",
                        monitor.output().map_or("<unknown>", |o| o.name.as_str()),
                        monitor.settings().ddc_display
                    );
                    if let Some(warning) = monitor.identity_warning() {
                        warn!(monitor = %id, "Identity mismatch: {}", warning);
                    }
                    self.monitors.insert(id, monitor);
                }
            }
        }
    }

    /// Best-effort undo for displays that left the layout. Whatever could not
    /// be restored is parked until the display comes back.
    async fn release_dropped(&mut self, dropped: Vec<MonitorState>) {
        let plans: Vec<_> = dropped
            .iter()
            .map(|m| (m.id(), m.target(), m.release_plan()))
            .filter(|(_, _, plan)| !plan.is_empty())
            .collect();
        let outcomes = if plans.is_empty() {
            Vec::new()
        } else {
            self.execute_all(plans).await
        };

        for mut monitor in dropped {
            let id = monitor.id();
            if let Some(written) = outcomes
                .iter()
                .find(|(outcome_id, _)| *outcome_id == id)
                .and_then(|(_, outcome)| outcome.brightness_written)
            {
                monitor.record_brightness_written(written);
            }
            if let Some(original) = monitor.pending_restore() {
                debug!(
                    monitor = %id,
                    "Could not restore brightness {}%, keeping it for when the display returns",
                    original
                );
                self.parked_restores.insert(id, original);
            }
        }
    }

    /// Re-read the pointer so a manual command is not undone by the
    /// movement that issued it.
    async fn reset_cursor_baseline(&mut self) {
        self.sampler.invalidate().await;
        let sample = self.sampler.sample().await;
        if let Some(cursor) = sample.cursor_position() {
            self.last_cursor = Some(cursor);
        }
    }

    fn next_identify_deadline(&self) -> Option<Instant> {
        self.monitors
            .values()
            .filter_map(MonitorState::identify_deadline)
            .min()
    }

    /// Execute every outstanding plan, concurrently across monitors.
    async fn dispatch(&mut self) {
        let plans: Vec<_> = self
            .monitors
            .values()
            .map(|m| (m.id(), m.target(), m.plan()))
            .filter(|(_, _, plan)| !plan.is_empty())
            .collect();

        if plans.is_empty() {
            return;
        }

        let outcomes = self.execute_all(plans).await;
        self.record_outcomes(outcomes);
    }

    async fn execute_all(
        &self,
        plans: Vec<(MonitorId, DisplayTarget, DriverPlan)>,
    ) -> Vec<(MonitorId, PlanOutcome)> {
        let budget = DriverBudget::from_config(&self.config);
        join_all(plans.into_iter().map(|(id, target, plan)| {
            let hardware = Arc::clone(&self.hardware);
            let overlay = Arc::clone(&self.overlay);
            async move {
                let outcome =
                    execute_plan(hardware.as_ref(), overlay.as_ref(), budget, &target, plan).await;
                (id, outcome)
            }
        }))
        .await
    }

    fn record_outcomes(&mut self, outcomes: Vec<(MonitorId, PlanOutcome)>) {
        for (id, outcome) in outcomes {
            let Some(monitor) = self.monitors.get_mut(&id) else {
                continue;
            };
            let phase = monitor.phase();

            if let Some(percent) = outcome.brightness_read {
                monitor.record_brightness_read(percent);
            }
            if let Some(percent) = outcome.brightness_written {
                monitor.record_brightness_written(percent);
            }
            if let Some(request) = outcome.overlay_applied {
                monitor.record_overlay(request);
            }

            match outcome.hardware_error {
                Some(e) => self.log_failure(id, DriverKind::Hardware, phase, &e),
                None if outcome.hardware_attempted => self.log_recovery(id, DriverKind::Hardware),
                None => {}
            }
            match outcome.overlay_error {
                Some(e) => self.log_failure(id, DriverKind::Overlay, phase, &e),
                None if outcome.overlay_applied.is_some() => {
                    self.log_recovery(id, DriverKind::Overlay);
                }
                None => {}
            }
        }
    }

    fn log_failure(&mut self, id: MonitorId, kind: DriverKind, phase: Phase, error: &DriverError) {
        let (decision, streak) = self.failures.record_failure((id, kind));
        match decision {
            LogDecision::Warn => warn!(
                monitor = %id,
                driver = kind.as_str(),
                phase = %phase,
                streak,
                "Driver call failed, will retry next tick: {}",
                error
            ),
            LogDecision::Quiet => debug!(
                monitor = %id,
                driver = kind.as_str(),
                phase = %phase,
                streak,
                "Driver call failed, will retry next tick: {}",
                error
            ),
        }
    }

    fn log_recovery(&mut self, id: MonitorId, kind: DriverKind) {
        if let Some(streak) = self.failures.record_success(&(id, kind)) {
            info!(
                monitor = %id,
                driver = kind.as_str(),
                "Driver recovered after {} failed attempts",
                streak
            );
        }
    }
}

/// Run one monitor's plan. Hardware and overlay proceed independently.
///
/// Each change is faded through intermediate writes. The outcome reports the
/// last write that succeeded, so an interrupted fade resumes from there on
/// the next tick.
async fn execute_plan(
    hardware: &dyn HardwareDimmer,
    overlay: &dyn OverlayDimmer,
    budget: DriverBudget,
    target: &DisplayTarget,
    plan: DriverPlan,
) -> PlanOutcome {
    let hardware_step = async {
        let mut outcome = PlanOutcome::default();
        let Some(step) = plan.hardware else {
            return outcome;
        };
        outcome.hardware_attempted = true;
        let timeout = budget.hardware_timeout;

        let (from, level, fade) = match step {
            HardwareStep::CaptureThenDim { level } => {
                match bounded(timeout, hardware.brightness(target)).await {
                    Ok(current) => {
                        outcome.brightness_read = Some(current);
                        if current <= level {
                            return outcome;
                        }
                        (Some(current), level, budget.dim_fade)
                    }
                    Err(e) => {
                        outcome.hardware_error = Some(e);
                        return outcome;
                    }
                }
            }
            HardwareStep::Dim { level } => (plan.current_brightness, level, budget.dim_fade),
            HardwareStep::Restore { to } => (plan.current_brightness, to, budget.wake_fade),
        };

        let levels = match from {
            Some(from) => brightness_ramp(from, level, fade.steps),
            None => vec![level],
        };
        for (i, step_level) in levels.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(fade.interval()).await;
            }
            match bounded(timeout, hardware.set_brightness(target, step_level)).await {
                Ok(()) => outcome.brightness_written = Some(step_level),
                Err(e) => {
                    outcome.hardware_error = Some(e);
                    break;
                }
            }
        }
        outcome
    };

    let overlay_step = async {
        let request = plan.overlay?;
        let fade = if request.effective_opacity() > plan.current_overlay.effective_opacity() {
            budget.dim_fade
        } else {
            budget.wake_fade
        };

        let mut applied = None;
        for (i, step) in overlay_ramp(plan.current_overlay, request, fade.steps)
            .into_iter()
            .enumerate()
        {
            if i > 0 {
                tokio::time::sleep(fade.interval()).await;
            }
            if let Err(e) = bounded(budget.overlay_timeout, overlay.set_overlay(target, step)).await
            {
                return Some((applied, Some(e)));
            }
            applied = Some(step);
        }
        Some((applied, None))
    };

    let (mut outcome, overlay_result) = tokio::join!(hardware_step, overlay_step);
    if let Some((applied, error)) = overlay_result {
        outcome.overlay_applied = applied;
        outcome.overlay_error = error;
    }
    outcome
}

fn build_sampler(config: &Config, probe: Arc<dyn ActivityProbe>) -> ActivitySampler {
    ActivitySampler::new(
        probe,
        config.cursor_cache(),
        config.window_cache(),
        config.probe_timeout(),
    )
}

fn new_interval(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn log_transition(transition: &Transition) {
    info!(
        monitor = %transition.monitor,
        from = %transition.from,
        to = %transition.to,
        reason = %transition.reason,
        "Phase transition"
    );
}

fn on_off(enabled: bool) -> &'static str {
    if enabled { "ON" } else { "OFF" }
}
