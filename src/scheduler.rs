//! Hands every note of a piece to the sound backend, once, at session start.

use crate::backend::{ScheduledNote, SoundBackend};
use crate::midi::Piece;
use crate::params::PlaybackParameters;

/// Dispatch all notes of `piece` to `backend`, timed from `clock_origin` (hardware seconds).
/// Returns the number of notes dispatched.
pub fn schedule(
    piece: &Piece,
    params: &PlaybackParameters,
    clock_origin: f64,
    backend: &mut dyn SoundBackend,
) -> usize {
    let mut count = 0;
    for note in piece.notes() {
        backend.play(scheduled_note(params, clock_origin, note));
        count += 1;
    }
    count
}

pub fn scheduled_note(
    params: &PlaybackParameters,
    clock_origin: f64,
    note: &crate::midi::NoteEvent,
) -> ScheduledNote {
    let e = params.effective(note);
    ScheduledNote {
        pitch: e.pitch,
        at: clock_origin + e.start,
        duration: e.duration,
        gain: e.gain,
        track: e.track,
    }
}
