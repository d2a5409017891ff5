use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Source of time for the automation worker and its bookkeeping.
///
/// The worker never calls `Instant::now()` or `thread::sleep` directly, so a
/// [`ManualClock`] can drive whole runs in simulated time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by `Instant` and `thread::sleep`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Simulated clock: time only moves through `sleep` and `advance`.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, duration: Duration) {
        *self.offset.lock() += duration;
    }

    /// Simulated time elapsed since the clock was created
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Run timing with paused intervals excluded.
///
/// All instants are supplied by the caller so the tracker stays a plain value
/// that can live behind the controller's lock.
#[derive(Debug, Clone, Default)]
pub struct TimingTracker {
    start: Option<Instant>,
    stopped_at: Option<Instant>,
    paused_accum: Duration,
    pause_started: Option<Instant>,
    last_detection: Option<Instant>,
    /// Closed pauses since the last detection
    paused_since_detection: Duration,
}

impl TimingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh run at `now`, clearing pauses and detections
    pub fn reset(&mut self, now: Instant) {
        self.start = Some(now);
        self.stopped_at = None;
        self.paused_accum = Duration::ZERO;
        self.pause_started = None;
        self.last_detection = None;
        self.paused_since_detection = Duration::ZERO;
    }

    pub fn pause(&mut self, now: Instant) {
        if self.pause_started.is_none() {
            self.pause_started = Some(now);
        }
    }

    pub fn resume(&mut self, now: Instant) {
        if let Some(started) = self.pause_started.take() {
            let paused = now.saturating_duration_since(started);
            self.paused_accum += paused;
            if self.last_detection.is_some() {
                self.paused_since_detection += paused;
            }
        }
    }

    /// Freeze the clock at `now`; an open pause is folded into the total
    pub fn finish(&mut self, now: Instant) {
        self.resume(now);
        self.stopped_at.get_or_insert(now);
    }

    pub fn paused_total(&self, now: Instant) -> Duration {
        let open = self
            .pause_started
            .map(|started| now.saturating_duration_since(started))
            .unwrap_or_default();
        self.paused_accum + open
    }

    /// Run time net of pauses; zero before the first `reset`
    pub fn elapsed(&self, now: Instant) -> Duration {
        let Some(start) = self.start else {
            return Duration::ZERO;
        };
        let end = self.stopped_at.map_or(now, |stopped| stopped.min(now));
        end.saturating_duration_since(start)
            .saturating_sub(self.paused_total(end))
    }

    pub fn record_detection(&mut self, now: Instant) {
        self.last_detection = Some(now);
        self.paused_since_detection = Duration::ZERO;
    }

    pub fn last_detection(&self) -> Option<Instant> {
        self.last_detection
    }

    /// Time since the last qualifying detection, `None` if there never was one
    pub fn since_last_detection(&self, now: Instant) -> Option<Duration> {
        self.last_detection
            .map(|last| now.saturating_duration_since(last))
    }

    /// Running time since the last detection; paused intervals do not count
    pub fn idle(&self, now: Instant) -> Option<Duration> {
        let since = self.since_last_detection(now)?;
        let open_pause = match (self.pause_started, self.last_detection) {
            (Some(started), Some(last)) => now.saturating_duration_since(started.max(last)),
            _ => Duration::ZERO,
        };
        Some(
            since
                .saturating_sub(self.paused_since_detection)
                .saturating_sub(open_pause),
        )
    }

    /// True once a detection happened and nothing qualified for longer than `limit`
    pub fn inactivity_exceeded(&self, now: Instant, limit: Duration) -> bool {
        self.idle(now).map(|idle| idle > limit).unwrap_or(false)
    }
}

/// Suppresses repeated triggers inside a window.
///
/// A trigger exactly `window` after the previous accepted one is still
/// suppressed; the window has to be strictly exceeded.
#[derive(Debug, Clone)]
pub struct Cooldown {
    last_trigger: Option<Instant>,
    window: Duration,
}

impl Cooldown {
    pub fn new(window: Duration) -> Self {
        Self {
            last_trigger: None,
            window,
        }
    }

    /// Returns true and arms the window if the previous trigger is old enough
    pub fn try_trigger(&mut self, now: Instant) -> bool {
        match self.last_trigger {
            Some(last) if now.saturating_duration_since(last) <= self.window => false,
            _ => {
                self.last_trigger = Some(now);
                true
            }
        }
    }
}

/// Format a duration as `HH:MM:SS` for the elapsed-time display
pub fn format_hms(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, remainder) = (total / 3600, total % 3600);
    let (minutes, seconds) = (remainder / 60, remainder % 60);
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}
