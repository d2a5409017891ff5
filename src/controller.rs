use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::capture::{CapturedFrame, ScreenCapture, XcapCapture};
use crate::config::{validate_confidence, Config};
use crate::error::{ControlError, ValidationError};
use crate::input::{ActionDispatcher, EnigoDispatcher};
use crate::matcher::{self, ScaleRange};
use crate::messaging::{Command, CommandResult, Event, EventBus};
use crate::notify::{Notifier, SilentNotifier};
use crate::state::{RunStatus, StatusCell, StopReason};
use crate::templates::{SharedProfiles, TemplateRef};
use crate::timing::{format_hms, Clock, Cooldown, SystemClock, TimingTracker};

/// Capture and input devices used by one worker
pub struct Devices {
    pub capture: Box<dyn ScreenCapture>,
    pub dispatcher: Box<dyn ActionDispatcher>,
}

/// Opens [`Devices`] on the worker thread.
///
/// Platform capture and input handles are not always `Send`, so each worker
/// creates its own instead of receiving them from the operator thread.
pub trait DeviceFactory: Send + Sync {
    fn open(&self) -> Result<Devices>;
}

impl<F> DeviceFactory for F
where
    F: Fn() -> Result<Devices> + Send + Sync,
{
    fn open(&self) -> Result<Devices> {
        self()
    }
}

/// `xcap` capture plus `enigo` pointer input
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeDevices;

impl DeviceFactory for NativeDevices {
    fn open(&self) -> Result<Devices> {
        Ok(Devices {
            capture: Box::new(XcapCapture::new()),
            dispatcher: Box::new(EnigoDispatcher::new()?),
        })
    }
}

/// A loot template with its hit counter and cooldown
#[derive(Debug, Clone)]
struct LootProfile {
    id: u64,
    template: TemplateRef,
    hits: u32,
    cooldown: Cooldown,
}

/// State shared between a controller handle and its worker
struct Shared {
    group: String,
    status: StatusCell,
    stop_reason: Mutex<Option<StopReason>>,
    timing: Mutex<TimingTracker>,
    /// Replaced wholesale on every edit; the worker iterates a snapshot
    templates: RwLock<Arc<Vec<TemplateRef>>>,
    active_profile: RwLock<Option<String>>,
    loot: Mutex<Vec<LootProfile>>,
    next_loot_id: AtomicU64,
    /// Bumped on every start; a worker only acts for the run it was spawned for
    run_id: AtomicU64,
    loot_detected: AtomicBool,
    config: RwLock<Config>,
    default_confidence: f32,
    profiles: SharedProfiles,
    clock: Arc<dyn Clock>,
    bus: EventBus,
    notifier: Arc<dyn Notifier>,
}

impl Shared {
    fn templates_snapshot(&self) -> Arc<Vec<TemplateRef>> {
        Arc::clone(&self.templates.read())
    }

    fn publish_status(&self, old: RunStatus, new: RunStatus) {
        self.bus.publish(Event::StatusChanged {
            group: self.group.clone(),
            old,
            new,
        });
    }

    /// Move to Stopped unless someone else already did; returns whether this call stopped the run
    fn halt(&self, reason: StopReason) -> bool {
        let previous = self.status.stop();
        if previous.is_stopped() {
            return false;
        }

        self.timing.lock().finish(self.clock.now());
        *self.stop_reason.lock() = Some(reason.clone());

        match &reason {
            StopReason::Operator => info!("[{}] Automation stopped", self.group),
            StopReason::InactivityTimeout => warn!(
                "[{}] No detection for {}s, stopping",
                self.group,
                self.config.read().inactivity_timeout_secs
            ),
            StopReason::Fault(message) => {
                error!("[{}] Automation torn down: {}", self.group, message)
            }
        }

        self.publish_status(previous, RunStatus::Stopped);
        self.bus.publish(Event::Stopped {
            group: self.group.clone(),
            reason,
        });

        let end_sound = {
            let config = self.config.read();
            config
                .end_of_run_sound
                .as_deref()
                .map(|sound| config.resolve_sound(sound))
        };
        if let Some(sound) = end_sound {
            self.notifier.play(&sound);
        }
        true
    }
}

/// Builds independent automation groups sharing defaults and the profile registry
#[derive(Clone)]
pub struct ControllerFactory {
    config: Config,
    profiles: SharedProfiles,
    devices: Arc<dyn DeviceFactory>,
    clock: Arc<dyn Clock>,
    bus: EventBus,
    notifier: Arc<dyn Notifier>,
}

impl ControllerFactory {
    pub fn new(config: Config, profiles: SharedProfiles, devices: Arc<dyn DeviceFactory>) -> Self {
        Self {
            config,
            profiles,
            devices,
            clock: Arc::new(SystemClock),
            bus: EventBus::new(),
            notifier: Arc::new(SilentNotifier),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn profiles(&self) -> &SharedProfiles {
        &self.profiles
    }

    /// New group using the configured confidence threshold
    pub fn create(&self, group: impl Into<String>) -> AutomationController {
        self.build(group.into(), self.config.confidence_threshold)
    }

    /// New group with its own initial (and reset) confidence threshold
    pub fn create_with_confidence(
        &self,
        group: impl Into<String>,
        confidence: f32,
    ) -> Result<AutomationController, ValidationError> {
        let confidence = validate_confidence(confidence)?;
        Ok(self.build(group.into(), confidence))
    }

    fn build(&self, group: String, confidence: f32) -> AutomationController {
        let mut config = self.config.clone();
        config.confidence_threshold = confidence;

        let shared = Shared {
            group,
            status: StatusCell::new(),
            stop_reason: Mutex::new(None),
            timing: Mutex::new(TimingTracker::new()),
            templates: RwLock::new(Arc::new(Vec::new())),
            active_profile: RwLock::new(None),
            loot: Mutex::new(Vec::new()),
            next_loot_id: AtomicU64::new(0),
            run_id: AtomicU64::new(0),
            loot_detected: AtomicBool::new(false),
            config: RwLock::new(config),
            default_confidence: confidence,
            profiles: Arc::clone(&self.profiles),
            clock: Arc::clone(&self.clock),
            bus: self.bus.clone(),
            notifier: Arc::clone(&self.notifier),
        };

        AutomationController {
            inner: Arc::new(ControllerInner {
                shared: Arc::new(shared),
                devices: Arc::clone(&self.devices),
                worker: Mutex::new(None),
            }),
        }
    }
}

/// Operator handle for one automation group.
///
/// Cloning yields another handle to the same group. The worker thread is
/// stopped and joined when the last handle is dropped.
#[derive(Clone)]
pub struct AutomationController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    shared: Arc<Shared>,
    devices: Arc<dyn DeviceFactory>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ControllerInner {
    fn join_worker(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("[{}] Worker thread panicked", self.shared.group);
            }
        }
    }
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        self.shared.halt(StopReason::Operator);
        self.join_worker();
    }
}

impl AutomationController {
    fn shared(&self) -> &Shared {
        &self.inner.shared
    }

    pub fn group(&self) -> &str {
        &self.shared().group
    }

    pub fn status(&self) -> RunStatus {
        self.shared().status.get()
    }

    /// Why the last run ended; cleared on start
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.shared().stop_reason.lock().clone()
    }

    /// Run time net of pauses, frozen once stopped
    pub fn elapsed(&self) -> Duration {
        let shared = self.shared();
        shared.timing.lock().elapsed(shared.clock.now())
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.shared().config.read().confidence_threshold
    }

    /// Takes effect from the next match attempt
    pub fn set_confidence_threshold(&self, value: f32) -> Result<(), ValidationError> {
        let value = validate_confidence(value)?;
        self.shared().config.write().confidence_threshold = value;
        info!("[{}] Confidence threshold set to {:.2}", self.group(), value);
        Ok(())
    }

    /// Restore the group's initial confidence threshold
    pub fn reset_defaults(&self) {
        let shared = self.shared();
        shared.config.write().confidence_threshold = shared.default_confidence;
        info!(
            "[{}] Confidence threshold reset to {:.2}",
            shared.group, shared.default_confidence
        );
    }

    pub fn active_profile(&self) -> Option<String> {
        self.shared().active_profile.read().clone()
    }

    /// Snapshot of the click templates, in scan order
    pub fn templates(&self) -> Arc<Vec<TemplateRef>> {
        self.shared().templates_snapshot()
    }

    /// Replace the click templates with a stored profile; returns how many were loaded
    pub fn set_active_profile(&self, name: &str) -> Result<usize, ControlError> {
        let templates = self.shared().profiles.read().load_templates(name)?;
        let count = templates.len();
        self.replace_templates(templates)?;
        *self.shared().active_profile.write() = Some(name.to_string());
        info!("[{}] Active profile: {} ({} templates)", self.group(), name, count);
        Ok(count)
    }

    /// Replace the click templates; an active group never gets an empty list
    pub fn replace_templates(&self, templates: Vec<TemplateRef>) -> Result<(), ValidationError> {
        let shared = self.shared();
        let mut slot = shared.templates.write();
        if templates.is_empty() && shared.status.get().is_active() {
            return Err(ValidationError::EmptyProfile);
        }
        *slot = Arc::new(templates);
        Ok(())
    }

    pub fn add_template(&self, template: TemplateRef) {
        let shared = self.shared();
        let mut slot = shared.templates.write();
        let mut next = Vec::clone(&slot);
        info!("[{}] Added template {}", shared.group, template.name());
        next.push(template);
        *slot = Arc::new(next);
    }

    pub fn remove_template(&self, index: usize) -> Result<TemplateRef, ValidationError> {
        let shared = self.shared();
        let mut slot = shared.templates.write();
        if index >= slot.len() {
            return Err(ValidationError::TemplateIndexOutOfRange {
                index,
                len: slot.len(),
            });
        }
        if slot.len() == 1 && shared.status.get().is_active() {
            return Err(ValidationError::EmptyProfile);
        }

        let mut next = Vec::clone(&slot);
        let removed = next.remove(index);
        *slot = Arc::new(next);
        info!("[{}] Removed template {}", shared.group, removed.name());
        Ok(removed)
    }

    pub fn add_loot(&self, template: TemplateRef) {
        let shared = self.shared();
        let cooldown = Cooldown::new(shared.config.read().loot_cooldown());
        let id = shared.next_loot_id.fetch_add(1, Ordering::Relaxed);
        info!("[{}] Added loot template {}", shared.group, template.name());
        shared.loot.lock().push(LootProfile {
            id,
            template,
            hits: 0,
            cooldown,
        });
    }

    /// Remove a loot template together with its hit counter
    pub fn remove_loot(&self, index: usize) -> Result<TemplateRef, ValidationError> {
        let mut loot = self.shared().loot.lock();
        if index >= loot.len() {
            return Err(ValidationError::TemplateIndexOutOfRange {
                index,
                len: loot.len(),
            });
        }
        Ok(loot.remove(index).template)
    }

    /// Hit count per loot template, in insertion order
    pub fn loot_counts(&self) -> Vec<(String, u32)> {
        self.shared()
            .loot
            .lock()
            .iter()
            .map(|l| (l.template.name().to_string(), l.hits))
            .collect()
    }

    /// True once any loot template was counted during the current run
    pub fn loot_detected(&self) -> bool {
        self.shared().loot_detected.load(Ordering::Acquire)
    }

    /// Start a worker, optionally switching to a stored profile first
    pub fn start(&self, profile: Option<&str>) -> Result<(), ControlError> {
        if self.status().is_active() {
            return Err(ControlError::AlreadyRunning);
        }
        if let Some(name) = profile {
            self.set_active_profile(name)?;
        }

        // A worker that ended on its own (timeout, fault) is still joinable
        self.inner.join_worker();
        let run = self.prepare_start()?;

        let shared = Arc::clone(&self.inner.shared);
        let devices = Arc::clone(&self.inner.devices);
        let spawned = thread::Builder::new()
            .name(format!("automation-{}", self.group()))
            .spawn(move || run_worker(shared, devices, run));

        match spawned {
            Ok(handle) => {
                *self.inner.worker.lock() = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.shared().halt(StopReason::Fault(err.to_string()));
                Err(ControlError::ThreadSpawnFailed(err))
            }
        }
    }

    /// Validate, flip to Running and reset the run bookkeeping; returns the new run id
    fn prepare_start(&self) -> Result<u64, ControlError> {
        let shared = self.shared();
        let run = {
            // Held across the transition so the list cannot be emptied in between
            let templates = shared.templates.read();
            if templates.is_empty() {
                return Err(ValidationError::EmptyProfile.into());
            }
            shared.status.start()?;
            shared.run_id.fetch_add(1, Ordering::AcqRel) + 1
        };

        shared.timing.lock().reset(shared.clock.now());
        *shared.stop_reason.lock() = None;
        shared.loot_detected.store(false, Ordering::Release);
        shared.publish_status(RunStatus::Stopped, RunStatus::Running);
        info!(
            "[{}] Automation started with {} templates",
            shared.group,
            shared.templates.read().len()
        );
        Ok(run)
    }

    /// Stop the worker and wait for it to exit
    pub fn stop(&self) -> Result<(), ControlError> {
        let stopped = self.shared().halt(StopReason::Operator);
        self.inner.join_worker();
        if stopped {
            Ok(())
        } else {
            Err(ControlError::InvalidTransition {
                action: "stop",
                status: RunStatus::Stopped.description(),
            })
        }
    }

    pub fn pause(&self) -> Result<(), ControlError> {
        let shared = self.shared();
        shared.status.pause()?;
        shared.timing.lock().pause(shared.clock.now());
        shared.publish_status(RunStatus::Running, RunStatus::Paused);
        info!("[{}] Automation paused", shared.group);
        Ok(())
    }

    pub fn resume(&self) -> Result<(), ControlError> {
        let shared = self.shared();
        shared.status.resume()?;
        shared.timing.lock().resume(shared.clock.now());
        shared.publish_status(RunStatus::Paused, RunStatus::Running);
        info!("[{}] Automation resumed", shared.group);
        Ok(())
    }

    /// Pause when running, resume when paused; returns the new status
    pub fn toggle_pause(&self) -> Result<RunStatus, ControlError> {
        match self.status() {
            RunStatus::Running => self.pause().map(|_| RunStatus::Paused),
            RunStatus::Paused => self.resume().map(|_| RunStatus::Running),
            RunStatus::Stopped => Err(ControlError::InvalidTransition {
                action: "pause",
                status: RunStatus::Stopped.description(),
            }),
        }
    }

    /// One-line summary for the status display
    pub fn status_line(&self) -> String {
        let mut line = format!(
            "[{}] {} · {} · confidence {:.2}",
            self.group(),
            self.status().description(),
            format_hms(self.elapsed()),
            self.confidence_threshold()
        );
        if let Some(profile) = self.active_profile() {
            line.push_str(&format!(" · profile {}", profile));
        }
        let loot = self.loot_counts();
        if !loot.is_empty() {
            let counts: Vec<String> = loot
                .iter()
                .map(|(name, hits)| format!("{} x{}", name, hits))
                .collect();
            line.push_str(&format!(
                " · loot {} ({})",
                if self.loot_detected() { "detected" } else { "none" },
                counts.join(", ")
            ));
        }
        if let Some(reason) = self.stop_reason() {
            if self.status().is_stopped() {
                line.push_str(&format!(" · {}", reason.description()));
            }
        }
        line
    }

    /// Execute an operator command against this group
    pub fn execute(&self, command: Command) -> CommandResult {
        debug!("[{}] Executing command: {}", self.group(), command.description());

        let outcome: Result<Option<String>, String> = match command {
            Command::Start { profile } => self
                .start(profile.as_deref())
                .map(|_| None)
                .map_err(|e| e.to_string()),
            Command::Stop => self.stop().map(|_| None).map_err(|e| e.to_string()),
            Command::Pause => self.pause().map(|_| None).map_err(|e| e.to_string()),
            Command::Resume => self.resume().map(|_| None).map_err(|e| e.to_string()),
            Command::TogglePause => self
                .toggle_pause()
                .map(|status| Some(status.description().to_string()))
                .map_err(|e| e.to_string()),
            Command::SetConfidence(value) => self
                .set_confidence_threshold(value)
                .map(|_| None)
                .map_err(|e| e.to_string()),
            Command::ResetDefaults => {
                self.reset_defaults();
                Ok(Some(format!("Confidence {:.2}", self.confidence_threshold())))
            }
            Command::SetProfile(name) => self
                .set_active_profile(&name)
                .map(|count| Some(format!("{} templates loaded", count)))
                .map_err(|e| e.to_string()),
            Command::AddTemplate(path) => load_template(path).map(|template| {
                self.add_template(template);
                None
            }),
            Command::RemoveTemplate(index) => self
                .remove_template(index)
                .map(|t| Some(format!("Removed {}", t.name())))
                .map_err(|e| e.to_string()),
            Command::AddLoot(path) => load_template(path).map(|template| {
                self.add_loot(template);
                None
            }),
            Command::RemoveLoot(index) => self
                .remove_loot(index)
                .map(|t| Some(format!("Removed {}", t.name())))
                .map_err(|e| e.to_string()),
            Command::Status => Ok(Some(self.status_line())),
            Command::Quit => {
                if self.status().is_active() {
                    let _ = self.stop();
                }
                Ok(None)
            }
        };

        match outcome {
            Ok(None) => CommandResult::Success,
            Ok(Some(value)) => CommandResult::SuccessWithValue(value),
            Err(message) => CommandResult::Error(message),
        }
    }
}

fn load_template(path: PathBuf) -> Result<TemplateRef, String> {
    TemplateRef::try_from_path(&path).map_err(|e| format!("{e}: {}", error_source(&e)))
}

fn error_source(err: &dyn std::error::Error) -> String {
    err.source()
        .map(|source| source.to_string())
        .unwrap_or_default()
}

fn run_worker(shared: Arc<Shared>, devices: Arc<dyn DeviceFactory>, run: u64) {
    let devices = match devices.open() {
        Ok(devices) => devices,
        Err(err) => {
            if shared.run_id.load(Ordering::Acquire) == run {
                shared.halt(StopReason::Fault(format!("{err:#}")));
            }
            return;
        }
    };

    let mut runner = CycleRunner::new(shared, devices, run);
    while runner.step() {}
    debug!("[{}] Worker exited", runner.shared.group);
}

/// What a single cycle asks the loop to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleOutcome {
    /// Wait this long, then run another cycle
    Continue(Duration),
    /// Inactivity limit exceeded
    TimedOut,
    /// Status left Running mid-cycle
    Interrupted,
}

/// Drives the capture → match → act loop of one group
struct CycleRunner {
    shared: Arc<Shared>,
    devices: Devices,
    run: u64,
}

impl CycleRunner {
    fn new(shared: Arc<Shared>, devices: Devices, run: u64) -> Self {
        Self {
            shared,
            devices,
            run,
        }
    }

    /// False once the group was stopped and started again behind this worker
    fn is_current(&self) -> bool {
        self.shared.run_id.load(Ordering::Acquire) == self.run
    }

    fn is_running(&self) -> bool {
        self.is_current() && self.shared.status.get().is_running()
    }

    /// One loop iteration including its wait; false once the worker should exit
    fn step(&mut self) -> bool {
        if !self.is_current() {
            return false;
        }
        match self.shared.status.get() {
            RunStatus::Stopped => false,
            RunStatus::Paused => {
                let poll = self.shared.config.read().pause_poll();
                self.wait(poll, RunStatus::Paused);
                true
            }
            RunStatus::Running => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run_cycle()));
                match outcome {
                    Ok(CycleOutcome::Continue(delay)) => {
                        self.wait(delay, RunStatus::Running);
                        true
                    }
                    Ok(CycleOutcome::Interrupted) => true,
                    Ok(CycleOutcome::TimedOut) => {
                        if self.is_current() {
                            self.shared.halt(StopReason::InactivityTimeout);
                        }
                        false
                    }
                    Err(payload) => {
                        if self.is_current() {
                            let message = panic_message(payload.as_ref());
                            self.shared.halt(StopReason::Fault(message));
                        }
                        false
                    }
                }
            }
        }
    }

    fn run_cycle(&mut self) -> CycleOutcome {
        let config = self.shared.config.read().clone();
        let scales = config.scan.scale_range();
        let threshold = config.confidence_threshold;
        let templates = self.shared.templates_snapshot();

        let frames = match self.devices.capture.grab(config.capture_target) {
            Ok(frames) => frames,
            Err(err) => {
                warn!("[{}] Capture failed: {err}", self.shared.group);
                self.cycle_error(format!("Capture failed: {err}"));
                Vec::new()
            }
        };

        let mut clicked = false;
        for frame in &frames {
            match self.scan_click_templates(frame, &templates, &scales, threshold) {
                Some(true) => clicked = true,
                Some(false) => {}
                None => return CycleOutcome::Interrupted,
            }
        }

        self.scan_loot(&frames, &scales, threshold, &config);

        let now = self.shared.clock.now();
        if self
            .shared
            .timing
            .lock()
            .inactivity_exceeded(now, config.inactivity_timeout())
        {
            return CycleOutcome::TimedOut;
        }

        CycleOutcome::Continue(if clicked {
            config.click_delay()
        } else {
            config.cycle_delay()
        })
    }

    /// Click the first qualifying template on this monitor.
    ///
    /// Returns whether a click landed, or `None` if the run stopped or paused mid-scan.
    fn scan_click_templates(
        &mut self,
        frame: &CapturedFrame,
        templates: &[TemplateRef],
        scales: &ScaleRange,
        threshold: f32,
    ) -> Option<bool> {
        for template in templates {
            if !self.is_running() {
                return None;
            }

            let image = match template.image() {
                Ok(image) => image,
                Err(err) => {
                    debug!("[{}] Skipping template: {err}", self.shared.group);
                    continue;
                }
            };

            let Some(found) = matcher::locate(&frame.image, image, scales, threshold) else {
                continue;
            };

            let (x, y) = frame.to_desktop(found.x, found.y);
            return match self.devices.dispatcher.click(x, y) {
                Ok(()) => {
                    self.shared.timing.lock().record_detection(self.shared.clock.now());
                    info!(
                        "[{}] Clicked {} at ({}, {}) score {:.3} scale {:.2}",
                        self.shared.group,
                        template.name(),
                        x,
                        y,
                        found.score,
                        found.scale
                    );
                    self.shared.bus.publish(Event::TemplateMatched {
                        group: self.shared.group.clone(),
                        template: template.name().to_string(),
                        x,
                        y,
                        score: found.score,
                        scale: found.scale,
                    });
                    Some(true)
                }
                Err(err) => {
                    warn!("[{}] {err}: {}", self.shared.group, error_source(&err));
                    self.shared.bus.publish(Event::ClickFailed {
                        group: self.shared.group.clone(),
                        template: template.name().to_string(),
                        message: err.to_string(),
                    });
                    Some(false)
                }
            };
        }
        Some(false)
    }

    /// Count loot templates visible on any monitor, once per cooldown window
    fn scan_loot(
        &mut self,
        frames: &[CapturedFrame],
        scales: &ScaleRange,
        threshold: f32,
        config: &Config,
    ) {
        let candidates: Vec<(u64, TemplateRef)> = self
            .shared
            .loot
            .lock()
            .iter()
            .map(|l| (l.id, l.template.clone()))
            .collect();

        for (id, template) in candidates {
            if !self.is_running() {
                return;
            }
            let Ok(image) = template.image() else {
                continue;
            };
            let seen = frames
                .iter()
                .any(|frame| matcher::locate(&frame.image, image, scales, threshold).is_some());
            if !seen || !self.is_running() {
                continue;
            }

            let now = self.shared.clock.now();
            let hits = {
                let mut loot = self.shared.loot.lock();
                // Removed while we were matching
                let Some(entry) = loot.iter_mut().find(|l| l.id == id) else {
                    continue;
                };
                if !entry.cooldown.try_trigger(now) {
                    debug!("[{}] {} still cooling down", self.shared.group, template.name());
                    continue;
                }
                entry.hits += 1;
                entry.hits
            };

            self.shared.loot_detected.store(true, Ordering::Release);
            info!(
                "[{}] Loot detected: {} (x{})",
                self.shared.group,
                template.name(),
                hits
            );
            self.shared.bus.publish(Event::LootDetected {
                group: self.shared.group.clone(),
                template: template.name().to_string(),
                hits,
            });
            if let Some(sound) = config.loot_sound.as_deref() {
                self.shared.notifier.play(&config.resolve_sound(sound));
            }
        }
    }

    /// Sleep `total` in ticks, returning early once the status leaves `expected`
    fn wait(&self, total: Duration, expected: RunStatus) {
        let tick = self.shared.config.read().tick();
        let mut remaining = total;
        while !remaining.is_zero() && self.is_current() && self.shared.status.get() == expected {
            let slice = remaining.min(tick);
            self.shared.clock.sleep(slice);
            remaining -= slice;
        }
    }

    fn cycle_error(&self, message: String) {
        self.shared.bus.publish(Event::CycleError {
            group: self.shared.group.clone(),
            message,
        });
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panic: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panic: {message}")
    } else {
        "panic in automation cycle".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::MonitorInfo;
    use crate::error::{CaptureError, DispatchError};
    use crate::notify::RecordingNotifier;
    use crate::templates::ProfileRegistry;
    use crate::timing::ManualClock;
    use image::{imageops, GrayImage, Luma};

    fn textured(w: u32, h: u32, seed: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            let mut v = x.wrapping_mul(374_761_393) ^ y.wrapping_mul(668_265_263) ^ seed;
            v = (v ^ (v >> 13)).wrapping_mul(1_274_126_177);
            Luma([(v >> 24) as u8])
        })
    }

    fn screen_with(template: &GrayImage, x: i64, y: i64) -> GrayImage {
        let mut screen = GrayImage::new(40, 30);
        imageops::replace(&mut screen, template, x, y);
        screen
    }

    /// Replays screens in order, repeating the last one
    struct ScriptedCapture {
        screens: Vec<GrayImage>,
        calls: usize,
        fail: bool,
    }

    impl ScreenCapture for ScriptedCapture {
        fn monitors(&mut self) -> Result<Vec<MonitorInfo>, CaptureError> {
            Ok(vec![MonitorInfo {
                id: 1,
                name: "Test".into(),
                x: 100,
                y: 0,
                width: 40,
                height: 30,
                is_primary: true,
            }])
        }

        fn capture(&mut self, monitor: &MonitorInfo) -> Result<GrayImage, CaptureError> {
            if self.fail {
                return Err(CaptureError::MonitorGone(monitor.id));
            }
            let idx = self.calls.min(self.screens.len() - 1);
            self.calls += 1;
            Ok(self.screens[idx].clone())
        }
    }

    /// Two side-by-side monitors, the second one left of and below the first
    struct DualMonitorCapture {
        screens: [GrayImage; 2],
    }

    impl ScreenCapture for DualMonitorCapture {
        fn monitors(&mut self) -> Result<Vec<MonitorInfo>, CaptureError> {
            Ok(vec![
                MonitorInfo {
                    id: 1,
                    name: "Left".into(),
                    x: -40,
                    y: 200,
                    width: 40,
                    height: 30,
                    is_primary: false,
                },
                MonitorInfo {
                    id: 2,
                    name: "Main".into(),
                    x: 100,
                    y: 0,
                    width: 40,
                    height: 30,
                    is_primary: true,
                },
            ])
        }

        fn capture(&mut self, monitor: &MonitorInfo) -> Result<GrayImage, CaptureError> {
            Ok(self.screens[(monitor.id - 1) as usize].clone())
        }
    }

    /// Pauses the group the first time a sound is played
    #[derive(Default)]
    struct PauseOnPlay {
        target: Mutex<Option<AutomationController>>,
        played: Mutex<Vec<PathBuf>>,
    }

    impl Notifier for PauseOnPlay {
        fn play(&self, sound: &std::path::Path) {
            self.played.lock().push(sound.to_path_buf());
            if let Some(controller) = self.target.lock().take() {
                controller.pause().unwrap();
            }
        }
    }

    struct PanickingCapture;

    impl ScreenCapture for PanickingCapture {
        fn monitors(&mut self) -> Result<Vec<MonitorInfo>, CaptureError> {
            panic!("capture backend exploded");
        }

        fn capture(&mut self, _monitor: &MonitorInfo) -> Result<GrayImage, CaptureError> {
            unreachable!()
        }
    }

    #[derive(Default, Clone)]
    struct RecordingDispatcher {
        clicks: Arc<Mutex<Vec<(i32, i32)>>>,
        fail: bool,
    }

    impl ActionDispatcher for RecordingDispatcher {
        fn click(&mut self, x: i32, y: i32) -> Result<(), DispatchError> {
            if self.fail {
                return Err(DispatchError::ClickFailed {
                    x,
                    y,
                    source: "injection denied".into(),
                });
            }
            self.clicks.lock().push((x, y));
            Ok(())
        }
    }

    struct Harness {
        controller: AutomationController,
        clock: Arc<ManualClock>,
        notifier: Arc<RecordingNotifier>,
    }

    fn harness(config: Config) -> Harness {
        let clock = Arc::new(ManualClock::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let profiles = Arc::new(RwLock::new(ProfileRegistry::new("unused.json")));
        let factory = ControllerFactory::new(
            config,
            profiles,
            Arc::new(|| -> Result<Devices> { anyhow::bail!("devices are injected by the test") }),
        )
        .with_clock(clock.clone())
        .with_notifier(notifier.clone());

        Harness {
            controller: factory.create("test"),
            clock,
            notifier,
        }
    }

    fn test_config() -> Config {
        Config {
            scan: crate::config::ScanConfig {
                multi_scale: false,
                ..Default::default()
            },
            ..Config::default()
        }
    }

    fn runner(h: &Harness, capture: impl ScreenCapture + 'static, dispatcher: RecordingDispatcher) -> CycleRunner {
        let run = h.controller.prepare_start().unwrap();
        CycleRunner::new(
            Arc::clone(&h.controller.inner.shared),
            Devices {
                capture: Box::new(capture),
                dispatcher: Box::new(dispatcher),
            },
            run,
        )
    }

    #[test]
    fn test_start_with_empty_templates_is_rejected() {
        let h = harness(test_config());
        let err = h.controller.start(None).unwrap_err();
        assert!(matches!(
            err,
            ControlError::Validation(ValidationError::EmptyProfile)
        ));
        assert_eq!(h.controller.status(), RunStatus::Stopped);
    }

    #[test]
    fn test_confidence_bounds() {
        let h = harness(test_config());
        assert!(h.controller.set_confidence_threshold(0.95).is_ok());
        assert_eq!(h.controller.confidence_threshold(), 0.95);
        assert!(h.controller.set_confidence_threshold(0.3).is_err());
        assert!(h.controller.set_confidence_threshold(f32::NAN).is_err());
        assert_eq!(h.controller.confidence_threshold(), 0.95);

        h.controller.reset_defaults();
        assert_eq!(h.controller.confidence_threshold(), 0.8);
    }

    #[test]
    fn test_click_at_desktop_center_and_timeout_after_detection() {
        let h = harness(test_config());
        let button = textured(8, 8, 1);
        h.controller.add_template(TemplateRef::from_image("button", button.clone()));

        let dispatcher = RecordingDispatcher::default();
        let capture = ScriptedCapture {
            screens: vec![screen_with(&button, 10, 6), GrayImage::new(40, 30)],
            calls: 0,
            fail: false,
        };
        let mut runner = runner(&h, capture, dispatcher.clone());

        while runner.step() {}

        // Monitor origin is (100, 0); center is top-left plus half the template
        assert_eq!(*dispatcher.clicks.lock(), vec![(114, 10)]);
        assert_eq!(h.controller.status(), RunStatus::Stopped);
        assert_eq!(h.controller.stop_reason(), Some(StopReason::InactivityTimeout));

        let stopped_at = h.clock.elapsed();
        assert!(stopped_at > Duration::from_secs(300));
        assert!(stopped_at <= Duration::from_secs(302));
    }

    #[test]
    fn test_no_timeout_without_any_detection() {
        let h = harness(test_config());
        h.controller
            .add_template(TemplateRef::from_image("button", textured(8, 8, 1)));
        let capture = ScriptedCapture {
            screens: vec![GrayImage::new(40, 30)],
            calls: 0,
            fail: false,
        };
        let mut runner = runner(&h, capture, RecordingDispatcher::default());

        while h.clock.elapsed() < Duration::from_secs(400) {
            assert!(runner.step());
        }
        assert_eq!(h.controller.status(), RunStatus::Running);
        assert_eq!(h.controller.stop_reason(), None);
    }

    #[test]
    fn test_loot_cooldown_counts_once() {
        let mut config = test_config();
        config.cycle_delay_ms = 4000;
        config.loot_cooldown_ms = 4000;
        config.loot_sound = Some("/sounds/loot.mp3".into());
        let h = harness(config);

        let chest = textured(8, 8, 7);
        h.controller
            .add_template(TemplateRef::from_image("button", textured(8, 8, 1)));
        h.controller.add_loot(TemplateRef::from_image("chest", chest.clone()));

        let capture = ScriptedCapture {
            screens: vec![screen_with(&chest, 20, 10)],
            calls: 0,
            fail: false,
        };
        let mut runner = runner(&h, capture, RecordingDispatcher::default());

        // t = 0 and t = 4s: the second match falls inside the window
        assert!(runner.step());
        assert!(runner.step());
        assert_eq!(h.controller.loot_counts(), vec![("chest".to_string(), 1)]);
        assert!(h.controller.loot_detected());
        assert_eq!(h.notifier.played(), vec![PathBuf::from("/sounds/loot.mp3")]);

        // t = 8s is past the window
        assert!(runner.step());
        assert_eq!(h.controller.loot_counts(), vec![("chest".to_string(), 2)]);
    }

    #[test]
    fn test_all_monitors_clicks_once_per_monitor() {
        let mut config = test_config();
        config.capture_target = crate::capture::CaptureTarget::AllMonitors;
        let h = harness(config);

        let first = textured(8, 8, 1);
        let second = textured(8, 8, 2);
        h.controller.add_template(TemplateRef::from_image("first", first.clone()));
        h.controller.add_template(TemplateRef::from_image("second", second.clone()));

        // Both templates on the left monitor, only the second on the main one
        let mut left = screen_with(&first, 2, 3);
        imageops::replace(&mut left, &second, 25, 15);
        let main = screen_with(&second, 10, 6);

        let dispatcher = RecordingDispatcher::default();
        let capture = DualMonitorCapture {
            screens: [left, main],
        };
        let mut runner = runner(&h, capture, dispatcher.clone());

        assert!(runner.step());
        assert_eq!(*dispatcher.clicks.lock(), vec![(-34, 207), (114, 10)]);
    }

    #[test]
    fn test_loot_pass_halts_when_paused_mid_scan() {
        let mut config = test_config();
        config.loot_sound = Some("/sounds/loot.mp3".into());
        let clock = Arc::new(ManualClock::new());
        let notifier = Arc::new(PauseOnPlay::default());
        let profiles = Arc::new(RwLock::new(ProfileRegistry::new("unused.json")));
        let controller = ControllerFactory::new(
            config,
            profiles,
            Arc::new(|| -> Result<Devices> { anyhow::bail!("devices are injected by the test") }),
        )
        .with_clock(clock.clone())
        .with_notifier(notifier.clone())
        .create("test");
        *notifier.target.lock() = Some(controller.clone());

        let chest = textured(8, 8, 7);
        let gem = textured(8, 8, 9);
        controller.add_template(TemplateRef::from_image("button", textured(8, 8, 1)));
        controller.add_loot(TemplateRef::from_image("chest", chest.clone()));
        controller.add_loot(TemplateRef::from_image("gem", gem.clone()));

        let mut screen = screen_with(&chest, 2, 2);
        imageops::replace(&mut screen, &gem, 25, 15);

        let run = controller.prepare_start().unwrap();
        let mut runner = CycleRunner::new(
            Arc::clone(&controller.inner.shared),
            Devices {
                capture: Box::new(ScriptedCapture {
                    screens: vec![screen],
                    calls: 0,
                    fail: false,
                }),
                dispatcher: Box::new(RecordingDispatcher::default()),
            },
            run,
        );

        assert!(runner.step());
        assert_eq!(controller.status(), RunStatus::Paused);
        assert_eq!(
            controller.loot_counts(),
            vec![("chest".to_string(), 1), ("gem".to_string(), 0)]
        );
        assert_eq!(notifier.played.lock().len(), 1);
    }

    #[test]
    fn test_stale_worker_exits_after_restart() {
        let h = harness(test_config());
        let button = textured(8, 8, 1);
        h.controller.add_template(TemplateRef::from_image("button", button.clone()));

        let dispatcher = RecordingDispatcher::default();
        let capture = ScriptedCapture {
            screens: vec![screen_with(&button, 0, 0)],
            calls: 0,
            fail: false,
        };
        let mut stale = runner(&h, capture, dispatcher.clone());

        h.controller.stop().unwrap();
        h.controller.prepare_start().unwrap();

        assert!(!stale.step());
        assert!(dispatcher.clicks.lock().is_empty());
        assert_eq!(h.controller.status(), RunStatus::Running);
    }

    #[test]
    fn test_capture_error_is_not_fatal() {
        let h = harness(test_config());
        h.controller
            .add_template(TemplateRef::from_image("button", textured(8, 8, 1)));
        let (events, _id) = h.controller.shared().bus.subscribe();

        let capture = ScriptedCapture {
            screens: vec![GrayImage::new(40, 30)],
            calls: 0,
            fail: true,
        };
        let mut runner = runner(&h, capture, RecordingDispatcher::default());

        for _ in 0..3 {
            assert!(runner.step());
        }
        assert_eq!(h.controller.status(), RunStatus::Running);
        assert!(events
            .try_iter()
            .any(|e| matches!(e, Event::CycleError { .. })));
    }

    #[test]
    fn test_dispatch_failure_does_not_count_as_detection() {
        let h = harness(test_config());
        let button = textured(8, 8, 1);
        h.controller.add_template(TemplateRef::from_image("button", button.clone()));

        let capture = ScriptedCapture {
            screens: vec![screen_with(&button, 4, 4)],
            calls: 0,
            fail: false,
        };
        let dispatcher = RecordingDispatcher {
            fail: true,
            ..Default::default()
        };
        let mut runner = runner(&h, capture, dispatcher);

        assert!(runner.step());
        assert!(h.controller.shared().timing.lock().last_detection().is_none());
    }

    #[test]
    fn test_only_first_qualifying_template_is_clicked() {
        let h = harness(test_config());
        let first = textured(8, 8, 1);
        let second = textured(8, 8, 2);
        h.controller.add_template(TemplateRef::from_image("first", first.clone()));
        h.controller.add_template(TemplateRef::from_image("second", second.clone()));

        let mut screen = screen_with(&second, 2, 2);
        imageops::replace(&mut screen, &first, 25, 15);
        let dispatcher = RecordingDispatcher::default();
        let capture = ScriptedCapture {
            screens: vec![screen],
            calls: 0,
            fail: false,
        };
        let mut runner = runner(&h, capture, dispatcher.clone());

        assert!(runner.step());
        assert_eq!(*dispatcher.clicks.lock(), vec![(129, 19)]);
    }

    #[test]
    fn test_undecoded_template_is_skipped() {
        let h = harness(test_config());
        let button = textured(8, 8, 1);
        h.controller
            .add_template(TemplateRef::from_path("/nonexistent/missing.png"));
        h.controller.add_template(TemplateRef::from_image("button", button.clone()));

        let dispatcher = RecordingDispatcher::default();
        let capture = ScriptedCapture {
            screens: vec![screen_with(&button, 0, 0)],
            calls: 0,
            fail: false,
        };
        let mut runner = runner(&h, capture, dispatcher.clone());

        assert!(runner.step());
        assert_eq!(dispatcher.clicks.lock().len(), 1);
    }

    #[test]
    fn test_panic_in_cycle_forces_stopped() {
        let h = harness(test_config());
        h.controller
            .add_template(TemplateRef::from_image("button", textured(8, 8, 1)));
        let mut runner = runner(&h, PanickingCapture, RecordingDispatcher::default());

        assert!(!runner.step());
        assert_eq!(h.controller.status(), RunStatus::Stopped);
        assert!(matches!(
            h.controller.stop_reason(),
            Some(StopReason::Fault(message)) if message.contains("exploded")
        ));
    }

    #[test]
    fn test_paused_worker_does_not_capture() {
        let h = harness(test_config());
        h.controller
            .add_template(TemplateRef::from_image("button", textured(8, 8, 1)));
        let capture = ScriptedCapture {
            screens: vec![GrayImage::new(40, 30)],
            calls: 0,
            fail: true,
        };
        let (events, _id) = h.controller.shared().bus.subscribe();
        let mut runner = runner(&h, capture, RecordingDispatcher::default());

        h.controller.pause().unwrap();
        let before = h.clock.elapsed();
        assert!(runner.step());
        assert_eq!(h.clock.elapsed() - before, Duration::from_millis(500));
        assert!(!events.try_iter().any(|e| matches!(e, Event::CycleError { .. })));
    }

    #[test]
    fn test_remove_last_template_while_active_is_rejected() {
        let h = harness(test_config());
        h.controller
            .add_template(TemplateRef::from_image("button", textured(8, 8, 1)));
        h.controller.prepare_start().unwrap();

        assert_eq!(
            h.controller.remove_template(0).unwrap_err(),
            ValidationError::EmptyProfile
        );
        assert_eq!(
            h.controller.remove_template(3).unwrap_err(),
            ValidationError::TemplateIndexOutOfRange { index: 3, len: 1 }
        );
        assert!(h.controller.replace_templates(Vec::new()).is_err());
    }

    #[test]
    fn test_operator_stop_plays_end_sound_and_freezes_elapsed() {
        let mut config = test_config();
        config.end_of_run_sound = Some("/sounds/done.mp3".into());
        let h = harness(config);
        h.controller
            .add_template(TemplateRef::from_image("button", textured(8, 8, 1)));
        h.controller.prepare_start().unwrap();

        h.clock.advance(Duration::from_secs(10));
        h.controller.stop().unwrap();
        h.clock.advance(Duration::from_secs(10));

        assert_eq!(h.controller.elapsed(), Duration::from_secs(10));
        assert_eq!(h.controller.stop_reason(), Some(StopReason::Operator));
        assert_eq!(h.notifier.played(), vec![PathBuf::from("/sounds/done.mp3")]);
        assert!(h.controller.stop().is_err());
    }
}
