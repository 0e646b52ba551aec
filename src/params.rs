//! User-adjustable playback parameters and the note transform they define.
//!
//! `PlaybackParameters::effective` is the one place where a note's start, duration and
//! pitch are rescaled. The scheduler and the visualizer both call it, so what is heard
//! and what is lit can never drift apart.

use crate::error::{PlayerError, Result};
use crate::midi::NoteEvent;

pub const MIN_RATE: f64 = 0.1;
pub const MAX_RATE: f64 = 4.0;
pub const RATE_STEP: f64 = 0.1;
pub const MAX_TRANSPOSITION: i32 = 24;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TempoStep {
    Slower,
    Faster,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlaybackParameters {
    transposition_semitones: i32,
    playback_rate: f64,
}

impl Default for PlaybackParameters {
    fn default() -> Self {
        Self { transposition_semitones: 0, playback_rate: 1.0 }
    }
}

impl PlaybackParameters {
    pub fn new(transposition_semitones: i32, playback_rate: f64) -> Result<Self> {
        Ok(Self {
            transposition_semitones: check_transposition(transposition_semitones)?,
            playback_rate: check_rate(playback_rate)?,
        })
    }

    pub fn transposition(&self) -> i32 {
        self.transposition_semitones
    }

    pub fn playback_rate(&self) -> f64 {
        self.playback_rate
    }

    pub fn with_transposition(self, semitones: i32) -> Result<Self> {
        Ok(Self { transposition_semitones: check_transposition(semitones)?, ..self })
    }

    pub fn with_playback_rate(self, rate: f64) -> Result<Self> {
        Ok(Self { playback_rate: check_rate(rate)?, ..self })
    }

    /// Next rate one step slower or faster, or `None` at the limit.
    ///
    /// Slowing down is allowed while above 0.2 and never goes below 0.1; speeding up
    /// while below 4.0. A rate on the 0.1 grid stays on it; any other rate moves by
    /// exactly one step.
    pub fn stepped_rate(&self, step: TempoStep) -> Option<f64> {
        let r = self.playback_rate;
        let next = match step {
            TempoStep::Slower if r > 0.2 + 1e-9 => (r - RATE_STEP).max(MIN_RATE),
            TempoStep::Faster if r < MAX_RATE - 1e-9 => (r + RATE_STEP).min(MAX_RATE),
            _ => return None,
        };
        let tenths = r * 10.0;
        if (tenths - tenths.round()).abs() < 1e-9 {
            // drop float drift so repeated steps land on exact tenths
            Some((next * 10.0).round() / 10.0)
        } else {
            Some(next)
        }
    }

    /// Seconds of (rate-scaled) playback after which the piece is over,
    /// including the release tail.
    pub fn playback_end(&self, total_duration: f64) -> f64 {
        total_duration / self.playback_rate + END_GRACE_SECONDS
    }

    /// Map a note onto the playback timeline.
    pub fn effective(&self, note: &NoteEvent) -> EffectiveNote {
        EffectiveNote {
            pitch: note.pitch as i32 + self.transposition_semitones,
            start: note.start_time / self.playback_rate,
            duration: note.duration / self.playback_rate,
            end: (note.start_time + note.duration) / self.playback_rate,
            gain: note.velocity,
            track: note.track,
        }
    }
}

/// Trailing window after the last note so its release can ring out.
pub const END_GRACE_SECONDS: f64 = 0.5;

/// A note after transposition and tempo scaling. Times are seconds from the clock origin.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EffectiveNote {
    /// Not clamped; may fall outside 0–127 after transposition
    pub pitch: i32,
    pub start: f64,
    pub duration: f64,
    pub end: f64,
    pub gain: f32,
    pub track: usize,
}

impl EffectiveNote {
    pub fn is_active_at(&self, t: f64) -> bool {
        t >= self.start && t < self.end
    }
}

fn check_rate(rate: f64) -> Result<f64> {
    if rate.is_finite() && (MIN_RATE - 1e-9..=MAX_RATE + 1e-9).contains(&rate) {
        Ok(rate.clamp(MIN_RATE, MAX_RATE))
    } else {
        Err(PlayerError::InvalidParameter(format!(
            "playback rate {rate} outside {MIN_RATE}..={MAX_RATE}"
        )))
    }
}

fn check_transposition(semitones: i32) -> Result<i32> {
    if (-MAX_TRANSPOSITION..=MAX_TRANSPOSITION).contains(&semitones) {
        Ok(semitones)
    } else {
        Err(PlayerError::InvalidParameter(format!(
            "transposition {semitones} outside ±{MAX_TRANSPOSITION} semitones"
        )))
    }
}
