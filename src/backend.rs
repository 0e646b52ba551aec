//! The sound-producing side of playback, as seen by the scheduler and the transport.
//!
//! A backend is acquired fresh for every session (`BackendFactory::open`) and closed when
//! the session ends. Individual notes cannot be cancelled once handed over, so stopping
//! always means closing the whole backend.

use std::sync::{Arc, Mutex};

use crate::clock::{ManualClock, MonotonicClock, SharedClock};
use crate::error::Result;

/// One note handed to a backend. `at` is an absolute time on the backend's clock.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScheduledNote {
    pub pitch: i32,
    pub at: f64,
    pub duration: f64,
    pub gain: f32,
    pub track: usize,
}

pub trait SoundBackend {
    /// The clock notes are scheduled against.
    fn clock(&self) -> SharedClock;
    /// Fire-and-forget. Pitches outside 0–127 must be tolerated.
    fn play(&mut self, note: ScheduledNote);
    /// Stop producing sound and stop firing note-ons until resumed.
    fn suspend(&mut self) -> Result<()>;
    fn resume(&mut self) -> Result<()>;
    /// Silence everything and release the device. Terminal.
    fn close(&mut self);
}

/// Acquires a ready-to-play backend. Instrument loading happens here.
pub trait BackendFactory {
    fn open(&mut self) -> Result<Box<dyn SoundBackend>>;
}

/// What a recording backend saw, shared with whoever created it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BackendLog {
    pub notes: Vec<ScheduledNote>,
    pub suspends: usize,
    pub resumes: usize,
    pub closed: bool,
}

/// Keeps time on the wall clock and discards every note. Runs the visuals when there is
/// no SoundFont, without holding on to anything between sessions.
pub struct SilentBackend {
    clock: SharedClock,
}

impl SoundBackend for SilentBackend {
    fn clock(&self) -> SharedClock {
        self.clock.clone()
    }

    fn play(&mut self, _note: ScheduledNote) {}

    fn suspend(&mut self) -> Result<()> {
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) {}
}

/// Opens `SilentBackend`s that all share one wall clock.
pub struct SilentFactory {
    clock: SharedClock,
}

impl SilentFactory {
    pub fn new() -> Self {
        Self { clock: MonotonicClock::shared() }
    }
}

impl Default for SilentFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendFactory for SilentFactory {
    fn open(&mut self) -> Result<Box<dyn SoundBackend>> {
        Ok(Box::new(SilentBackend { clock: self.clock.clone() }))
    }
}

/// Records every call instead of making sound. Used by tests.
pub struct RecordingBackend {
    clock: SharedClock,
    log: Arc<Mutex<BackendLog>>,
}

impl RecordingBackend {
    pub fn new(clock: SharedClock) -> (Self, Arc<Mutex<BackendLog>>) {
        let log = Arc::new(Mutex::new(BackendLog::default()));
        (Self { clock, log: log.clone() }, log)
    }

    fn with_log(&self, f: impl FnOnce(&mut BackendLog)) {
        // A poisoned log only means a panicking test thread; keep recording anyway
        let mut guard = match self.log.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard);
    }
}

impl SoundBackend for RecordingBackend {
    fn clock(&self) -> SharedClock {
        self.clock.clone()
    }

    fn play(&mut self, note: ScheduledNote) {
        self.with_log(|l| l.notes.push(note));
    }

    fn suspend(&mut self) -> Result<()> {
        self.with_log(|l| l.suspends += 1);
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.with_log(|l| l.resumes += 1);
        Ok(())
    }

    fn close(&mut self) {
        self.with_log(|l| l.closed = true);
    }
}

/// Opens `RecordingBackend`s on one shared clock and keeps every session's log,
/// oldest first.
pub struct RecordingFactory {
    clock: SharedClock,
    pub sessions: Vec<Arc<Mutex<BackendLog>>>,
    /// When set, the next `open` fails with this message.
    pub fail_next: Option<String>,
}

impl RecordingFactory {
    pub fn new(clock: SharedClock) -> Self {
        Self { clock, sessions: Vec::new(), fail_next: None }
    }

    /// A factory on a fresh `ManualClock`, returned alongside for driving time.
    pub fn manual() -> (Self, ManualClock) {
        let clock = ManualClock::new();
        (Self::new(Arc::new(clock.clone())), clock)
    }

    pub fn last_log(&self) -> Option<BackendLog> {
        self.sessions.last().and_then(|l| l.lock().ok().map(|g| g.clone()))
    }
}

impl BackendFactory for RecordingFactory {
    fn open(&mut self) -> Result<Box<dyn SoundBackend>> {
        if let Some(msg) = self.fail_next.take() {
            return Err(crate::error::PlayerError::BackendUnavailable(msg));
        }
        let (backend, log) = RecordingBackend::new(self.clock.clone());
        self.sessions.push(log);
        Ok(Box::new(backend))
    }
}
