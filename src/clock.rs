//! clock.rs
//!
//! The transport clock: the single time source that both the note scheduler and the
//! visualizer read from.
//!
//! A `HardwareClock` is whatever monotonic counter the sound backend runs on (for the
//! SoundFont backend, frames rendered by the audio callback). `TransportClock` sits on top
//! and answers "how many seconds of the current session have elapsed", with pause support.
//!
//! ### Pausing
//! Some hardware clocks stop counting while the backend is suspended (the sample clock
//! does), others keep running (a wall clock does). `TransportClock` keeps an explicit
//! accumulated-pause offset measured on the hardware clock itself: if the hardware halted,
//! the measured pause is zero and nothing is subtracted twice.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use crate::error::{PlayerError, Result};

/// A monotonic time source in seconds.
pub trait HardwareClock: Send + Sync {
    fn now(&self) -> f64;
}

pub type SharedClock = Arc<dyn HardwareClock>;

#[derive(Clone, Copy, Debug, PartialEq)]
enum Phase {
    Idle,
    Running,
    /// (hardware time at suspension, elapsed value frozen at suspension)
    Suspended { at: f64, frozen: f64 },
    Closed { last: f64 },
}

pub struct TransportClock {
    hw: SharedClock,
    origin: f64,
    paused_total: f64,
    phase: Phase,
}

impl TransportClock {
    pub fn new(hw: SharedClock) -> Self {
        Self { hw, origin: 0.0, paused_total: 0.0, phase: Phase::Idle }
    }

    /// Mark logical time zero at the current hardware time and return that timestamp.
    pub fn begin(&mut self) -> Result<f64> {
        if let Phase::Closed { .. } = self.phase {
            return Err(PlayerError::BackendUnavailable("transport clock already closed".into()));
        }
        self.origin = self.hw.now();
        self.paused_total = 0.0;
        self.phase = Phase::Running;
        Ok(self.origin)
    }

    /// Seconds since `begin()`, not counting time spent suspended. Not scaled by rate.
    pub fn elapsed(&self) -> f64 {
        match self.phase {
            Phase::Idle => 0.0,
            Phase::Running => (self.hw.now() - self.origin - self.paused_total).max(0.0),
            Phase::Suspended { frozen, .. } => frozen,
            Phase::Closed { last } => last,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.phase, Phase::Closed { .. })
    }

    /// Freeze `elapsed()` at its current value. No-op unless running.
    pub fn suspend(&mut self) {
        if self.phase == Phase::Running {
            let frozen = self.elapsed();
            self.phase = Phase::Suspended { at: self.hw.now(), frozen };
        }
    }

    /// Continue counting from the frozen value. No-op unless suspended.
    pub fn resume(&mut self) {
        if let Phase::Suspended { at, .. } = self.phase {
            self.paused_total += (self.hw.now() - at).max(0.0);
            self.phase = Phase::Running;
        }
    }

    /// Release the clock. Terminal: a new session needs a new clock.
    pub fn close(&mut self) {
        if !self.is_closed() {
            self.phase = Phase::Closed { last: self.elapsed() };
        }
    }
}

/// Wall clock based on `Instant`. Keeps running regardless of the backend.
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareClock for MonotonicClock {
    fn now(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Clone, Default)]
pub struct ManualClock {
    bits: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, t: f64) {
        self.bits.store(t.to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, dt: f64) {
        self.set(self.now() + dt);
    }
}

impl HardwareClock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

/// Counts frames written by an audio callback. Stops counting while `halted` is set,
/// so it freezes together with a suspended stream.
pub struct SampleClock {
    frames: AtomicU64,
    halted: AtomicBool,
    sample_rate: f64,
}

impl SampleClock {
    pub fn new(sample_rate: f64) -> Self {
        Self { frames: AtomicU64::new(0), halted: AtomicBool::new(false), sample_rate }
    }

    /// Called from the audio callback after rendering `frames` frames.
    pub fn tick(&self, frames: u64) {
        self.frames.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn set_halted(&self, halted: bool) {
        self.halted.store(halted, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }
}

impl HardwareClock for SampleClock {
    fn now(&self) -> f64 {
        self.frames.load(Ordering::Relaxed) as f64 / self.sample_rate
    }
}
