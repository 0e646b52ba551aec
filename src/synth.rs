//! synth.rs
//!
//! The SoundFont sound backend.
//!
//! - **FluidLite** is a lightweight software synthesizer that can load a General MIDI SoundFont
//!   and render raw PCM audio from note events.
//! - **CPAL** is a cross-platform audio library that gives us a stream to the system’s sound card.
//!
//! One `SoundFontBackend` lives for exactly one playback session:
//!  - `open` loads the SoundFont, opens the default output device and starts the stream
//!  - the scheduler hands over every note up front with `play`
//!  - a "conductor" thread holds those notes in a time-ordered queue and fires note-on and
//!    note-off into the synth when the audio clock reaches them
//!  - `close` silences the synth, stops the conductor and drops the stream
//!
//! ### The audio clock
//! Time is counted in frames actually rendered by the CPAL callback (`SampleClock`). When
//! the backend is suspended the callback writes silence and stops counting, so the clock
//! freezes, nothing new becomes due, and already-queued notes keep their place relative to
//! the music when playback resumes.
//!
//! All notes share one channel. Overlapping notes of the same pitch keep the key held
//! until the last of them ends, the same span the visualizer keeps it lit.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream};
use fluidlite::{Settings, Synth};

use crate::backend::{BackendFactory, ScheduledNote, SoundBackend};
use crate::clock::{HardwareClock, SampleClock, SharedClock};
use crate::error::{PlayerError, Result};

/// Every note plays on this channel with the SoundFont's first program (acoustic grand piano).
const CHANNEL: u32 = 0;

const MASTER_GAIN: f32 = 0.7;

/// How long the conductor waits for new notes before checking the clock again.
const CONDUCTOR_TICK: Duration = Duration::from_millis(1);

fn unavailable(what: &str, e: impl std::fmt::Display) -> PlayerError {
    PlayerError::BackendUnavailable(format!("{what}: {e}"))
}

/// Opens a fresh `SoundFontBackend` per session.
pub struct SoundFontFactory {
    soundfont: PathBuf,
}

impl SoundFontFactory {
    pub fn new(soundfont: impl Into<PathBuf>) -> Self {
        Self { soundfont: soundfont.into() }
    }
}

impl BackendFactory for SoundFontFactory {
    fn open(&mut self) -> Result<Box<dyn SoundBackend>> {
        Ok(Box::new(SoundFontBackend::open(&self.soundfont, MASTER_GAIN)?))
    }
}

enum Command {
    Play(ScheduledNote),
    Stop,
}

pub struct SoundFontBackend {
    synth: Arc<Mutex<Synth>>,
    stream: Option<Stream>,
    clock: Arc<SampleClock>,
    tx: Sender<Command>,
    conductor: Option<JoinHandle<()>>,
}

impl SoundFontBackend {
    /// Load the SoundFont, open the default output device and start the stream.
    pub fn open(soundfont: &Path, gain: f32) -> Result<Self> {
        // Build synth with default settings
        let settings = Settings::new().map_err(|e| unavailable("synth settings", e))?;
        let fl = Synth::new(settings).map_err(|e| unavailable("synth", e))?;
        fl.sfload(soundfont, true)
            .map_err(|e| unavailable(&format!("loading soundfont {}", soundfont.display()), e))?;

        // Some basic effects: master gain, reverb, chorus
        fl.set_gain(gain);
        fl.set_reverb_on(true);
        fl.set_reverb_params(0.7, 0.2, 0.9, 0.5);
        fl.set_chorus_on(true);
        fl.set_chorus_params(3, 1.2, 0.30, 8.0, Default::default());

        // Set up CPAL audio output
        let host = cpal::default_host();
        let dev = host
            .default_output_device()
            .ok_or_else(|| PlayerError::BackendUnavailable("no default output device".into()))?;
        let cfg = dev.default_output_config().map_err(|e| unavailable("default_output_config", e))?;
        let sample_rate = cfg.sample_rate().0 as f32;
        let channels = cfg.channels().max(1) as usize;

        fl.set_sample_rate(sample_rate);
        let _ = fl.program_change(CHANNEL, 0);
        let synth = Arc::new(Mutex::new(fl));
        let clock = Arc::new(SampleClock::new(sample_rate as f64));

        let err_fn = |e| log::warn!("stream error: {e}");
        let stream_cfg = cfg.config();

        // CPAL asks us to fill `out` with samples each buffer. We forward that to FluidLite
        // and count the frames; a halted clock means suspended, so we write silence instead.
        let stream = match cfg.sample_format() {
            SampleFormat::I16 => dev.build_output_stream(
                &stream_cfg,
                {
                    let synth = synth.clone();
                    let clock = clock.clone();
                    move |out: &mut [i16], _| {
                        if clock.is_halted() {
                            out.fill(0);
                            return;
                        }
                        match synth.lock() {
                            Ok(s) => {
                                if let Err(e) = s.write(&mut *out) {
                                    log::warn!("fluid write i16: {e}");
                                }
                            }
                            Err(_) => out.fill(0),
                        }
                        clock.tick((out.len() / channels) as u64);
                    }
                },
                err_fn,
                None,
            ),
            _ => dev.build_output_stream(
                &stream_cfg,
                {
                    let synth = synth.clone();
                    let clock = clock.clone();
                    move |out: &mut [f32], _| {
                        if clock.is_halted() {
                            out.fill(0.0);
                            return;
                        }
                        match synth.lock() {
                            Ok(s) => {
                                if let Err(e) = s.write(&mut *out) {
                                    log::warn!("fluid write f32: {e}");
                                }
                            }
                            Err(_) => out.fill(0.0),
                        }
                        clock.tick((out.len() / channels) as u64);
                    }
                },
                err_fn,
                None,
            ),
        }
        .map_err(|e| unavailable("build_output_stream", e))?;
        stream.play().map_err(|e| unavailable("starting audio stream", e))?;

        let (tx, rx) = mpsc::channel::<Command>();
        let conductor = {
            let synth = synth.clone();
            let clock = clock.clone();
            thread::spawn(move || conduct(rx, synth, clock))
        };

        log::info!("soundfont backend open at {sample_rate} Hz, {channels} channels");
        Ok(Self { synth, stream: Some(stream), clock, tx, conductor: Some(conductor) })
    }
}

impl SoundBackend for SoundFontBackend {
    fn clock(&self) -> SharedClock {
        self.clock.clone()
    }

    fn play(&mut self, note: ScheduledNote) {
        if !(0..=127).contains(&note.pitch) {
            log::debug!("pitch {} outside the synth's range, not played", note.pitch);
            return;
        }
        let _ = self.tx.send(Command::Play(note));
    }

    fn suspend(&mut self) -> Result<()> {
        self.clock.set_halted(true);
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.clock.set_halted(false);
        Ok(())
    }

    fn close(&mut self) {
        let _ = self.tx.send(Command::Stop);
        if let Some(handle) = self.conductor.take() {
            let _ = handle.join();
        }
        if let Ok(s) = self.synth.lock() {
            for ch in 0..16u32 {
                let _ = s.cc(ch, 123, 0); // All Notes Off
                let _ = s.cc(ch, 120, 0); // All Sound Off
            }
        }
        if let Some(stream) = self.stream.take() {
            let _ = stream.pause();
        }
    }
}

impl Drop for SoundFontBackend {
    fn drop(&mut self) {
        self.close();
    }
}

/// A note-on or note-off waiting for its time.
#[derive(Clone, Copy, Debug)]
struct Due {
    at: f64,
    seq: u64,
    key: u32,
    /// `None` for note-off
    vel: Option<u32>,
}

impl PartialEq for Due {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Due {}

impl PartialOrd for Due {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Due {
    // Reversed so the max-heap pops the earliest event first
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.at.total_cmp(&self.at).then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Split a scheduled note into its note-on and note-off.
fn due_pair(note: &ScheduledNote, seq: u64) -> [Due; 2] {
    let key = note.pitch as u32;
    let vel = ((note.gain.clamp(0.0, 1.0) * 127.0).round() as u32).max(1);
    [
        Due { at: note.at, seq, key, vel: Some(vel) },
        Due { at: note.at + note.duration, seq: seq + 1, key, vel: None },
    ]
}

/// How many notes are sounding on each key. Overlapping notes of the same pitch share one
/// synth key, so only the last of them to end may send the note-off.
#[derive(Debug)]
struct HeldKeys([u32; 128]);

impl HeldKeys {
    fn new() -> Self {
        Self([0; 128])
    }

    fn press(&mut self, key: u32) {
        if let Some(n) = self.0.get_mut(key as usize) {
            *n += 1;
        }
    }

    /// Whether `d` should reach the synth: every note-on does, a note-off only once no
    /// other note holds its key.
    fn admit(&mut self, d: &Due) -> bool {
        match d.vel {
            Some(_) => {
                self.press(d.key);
                true
            }
            None => self.release(d.key),
        }
    }

    /// True when no other note still holds `key`.
    fn release(&mut self, key: u32) -> bool {
        match self.0.get_mut(key as usize) {
            Some(n) if *n > 1 => {
                *n -= 1;
                false
            }
            Some(n) => {
                *n = 0;
                true
            }
            None => true,
        }
    }
}

/// The conductor thread: queue incoming notes, fire whatever the clock has reached.
fn conduct(rx: mpsc::Receiver<Command>, synth: Arc<Mutex<Synth>>, clock: Arc<SampleClock>) {
    let mut queue: BinaryHeap<Due> = BinaryHeap::new();
    let mut held = HeldKeys::new();
    let mut seq: u64 = 0;

    loop {
        match rx.recv_timeout(CONDUCTOR_TICK) {
            Ok(Command::Play(note)) => {
                queue.extend(due_pair(&note, seq));
                seq += 2;
            }
            Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let now = clock.now();
        while queue.peek().is_some_and(|d| d.at <= now) {
            let Some(d) = queue.pop() else { break };
            let Ok(s) = synth.lock() else {
                // If the lock is poisoned, bail out gracefully instead of panicking
                return;
            };
            if !held.admit(&d) {
                continue;
            }
            let _ = match d.vel {
                Some(vel) => s.note_on(CHANNEL, d.key, vel),
                None => s.note_off(CHANNEL, d.key),
            };
        }
    }
}
