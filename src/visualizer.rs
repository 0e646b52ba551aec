//! visualizer.rs
//!
//! The per-frame loop that keeps the piano and fretboard highlight in step with the sound.
//!
//! Each frame:
//!  1. reads the transport clock of the session the driver is attached to
//!  2. ends the session once the clock passes the end of the piece plus the release tail
//!  3. otherwise re-scans every note for the ones sounding right now
//!  4. lights exactly those keys, and the solved fret position of each
//!
//! The scan is a full pass over the piece every frame. Pieces coming out of transcription
//! are short, so there is no interval index.

use std::collections::BTreeSet;

use crate::fretboard::{FretboardView, PianoView};
use crate::midi::Piece;
use crate::params::PlaybackParameters;
use crate::transport::{SessionId, Transport};

/// Transposed pitches sounding at `t` seconds of (rate-scaled) playback.
pub fn active_pitches(piece: &Piece, params: &PlaybackParameters, t: f64) -> BTreeSet<i32> {
    piece
        .notes()
        .map(|n| params.effective(n))
        .filter(|e| e.is_active_at(t))
        .map(|e| e.pitch)
        .collect()
}

#[derive(Clone, Debug, PartialEq)]
pub enum FrameOutcome {
    /// Not attached to any session.
    Idle,
    /// The attached session was stopped or replaced; highlights cleared, driver detached.
    Cancelled,
    /// The piece played out; the session was stopped and the driver detached.
    Finished,
    /// Highlights now show these pitches.
    Rendered { elapsed: f64, active: BTreeSet<i32> },
}

#[derive(Debug, Default)]
pub struct VisualizationDriver {
    session: Option<SessionId>,
    pub piano: PianoView,
    pub fretboard: FretboardView,
}

impl VisualizationDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the loop to a session. Any previous binding is dropped.
    pub fn attach(&mut self, id: SessionId) {
        if self.session != Some(id) {
            self.clear();
        }
        self.session = Some(id);
    }

    /// Stop the loop for good; the next frame is `Idle`.
    pub fn detach(&mut self) {
        self.clear();
        self.session = None;
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    fn clear(&mut self) {
        self.piano.clear();
        self.fretboard.clear();
    }

    /// Run one frame against `transport`.
    pub fn frame(&mut self, transport: &mut Transport) -> FrameOutcome {
        let Some(id) = self.session else {
            return FrameOutcome::Idle;
        };
        let Some(input) = transport.frame_input(id) else {
            self.detach();
            return FrameOutcome::Cancelled;
        };

        let now = input.elapsed;
        if now > input.params.playback_end(input.piece.total_duration()) {
            self.detach();
            transport.finish(id);
            return FrameOutcome::Finished;
        }

        let active = active_pitches(&input.piece, &input.params, now);
        self.piano.reconcile(&active);
        self.fretboard.reconcile(&active);
        FrameOutcome::Rendered { elapsed: now, active }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingFactory;
    use crate::fretboard::FretPosition;
    use crate::midi::tests::{note, piece_of};
    use crate::midi::NoteEvent;
    use crate::scheduler::scheduled_note;
    use crate::transport::TransportState;

    fn set(pitches: &[i32]) -> BTreeSet<i32> {
        pitches.iter().copied().collect()
    }

    #[test]
    fn active_set_uses_half_open_windows() {
        let piece = piece_of(vec![note(60, 0.0, 1.0), note(64, 1.0, 1.0), note(67, 0.5, 2.0)]);
        let p = PlaybackParameters::default();
        assert_eq!(active_pitches(&piece, &p, 0.0), set(&[60]));
        assert_eq!(active_pitches(&piece, &p, 0.99), set(&[60, 67]));
        assert_eq!(active_pitches(&piece, &p, 1.0), set(&[64, 67]));
        assert_eq!(active_pitches(&piece, &p, 2.5), set(&[]));
    }

    #[test]
    fn active_set_applies_rate_and_transposition() {
        let piece = piece_of(vec![note(60, 2.0, 2.0)]);
        let p = PlaybackParameters::new(2, 2.0).unwrap();
        assert!(active_pitches(&piece, &p, 0.99).is_empty());
        assert_eq!(active_pitches(&piece, &p, 1.0), set(&[62]));
        assert!(active_pitches(&piece, &p, 2.0).is_empty());
    }

    #[test]
    fn active_set_is_deterministic() {
        let mut rng = fastrand::Rng::with_seed(7);
        let notes: Vec<NoteEvent> = (0..200)
            .map(|_| note(rng.u8(30..90), rng.f64() * 20.0, 0.05 + rng.f64() * 2.0))
            .collect();
        let piece = piece_of(notes);
        let p = PlaybackParameters::new(-5, 1.3).unwrap();
        for _ in 0..50 {
            let t = rng.f64() * 20.0;
            assert_eq!(active_pitches(&piece, &p, t), active_pitches(&piece, &p, t));
        }
    }

    #[test]
    fn scheduler_and_visualizer_agree_on_every_transform() {
        let mut rng = fastrand::Rng::with_seed(42);
        for _ in 0..1000 {
            let n = NoteEvent {
                pitch: rng.u8(0..=127),
                start_time: rng.f64() * 120.0,
                duration: 0.001 + rng.f64() * 10.0,
                velocity: rng.f32(),
                track: 0,
            };
            let transpose = rng.i32(-24..=24);
            let rate = 0.1 + rng.f64() * 3.9;
            let params = PlaybackParameters::new(transpose, rate).unwrap();
            let origin = rng.f64() * 1000.0;

            let sent = scheduled_note(&params, origin, &n);
            let seen = params.effective(&n);
            assert_eq!(sent.pitch, seen.pitch);
            assert_eq!(sent.at, origin + seen.start, "start drifted");
            assert_eq!(sent.duration, seen.duration);

            // and the visualizer lights it at exactly that start
            let piece = piece_of(vec![n]);
            let lit = active_pitches(&piece, &params, seen.start);
            assert!(lit.contains(&(n.pitch as i32 + transpose)));
        }
    }

    #[test]
    fn frame_lights_piano_and_fretboard() {
        let (mut factory, clock) = RecordingFactory::manual();
        let mut t = Transport::default();
        t.load_piece(piece_of(vec![note(64, 0.0, 1.0), note(30, 0.0, 1.0), note(88, 0.0, 1.0)]));
        let id = t.start(&mut factory).unwrap();
        let mut driver = VisualizationDriver::new();
        driver.attach(id);

        clock.advance(0.5);
        let outcome = driver.frame(&mut t);
        assert_eq!(outcome, FrameOutcome::Rendered { elapsed: 0.5, active: set(&[30, 64, 88]) });
        assert_eq!(driver.piano.lit_keys(), [64].into_iter().collect());
        assert_eq!(
            driver.fretboard.lit_positions(),
            [FretPosition { string: 0, fret: 0 }, FretPosition { string: 0, fret: 24 }]
                .into_iter()
                .collect()
        );

        // same time, same highlights
        let again = driver.frame(&mut t);
        assert_eq!(again, outcome);
    }

    #[test]
    fn end_of_piece_waits_for_the_grace_window() {
        let (mut factory, clock) = RecordingFactory::manual();
        let mut t = Transport::default();
        t.load_piece(piece_of(vec![note(60, 0.0, 10.0)]));
        t.set_playback_rate(2.0).unwrap();
        let id = t.start(&mut factory).unwrap();
        let mut driver = VisualizationDriver::new();
        driver.attach(id);

        clock.set(5.5);
        assert!(matches!(driver.frame(&mut t), FrameOutcome::Rendered { .. }));
        assert_eq!(t.state(), TransportState::Playing);

        clock.set(5.5001);
        assert_eq!(driver.frame(&mut t), FrameOutcome::Finished);
        assert_eq!(t.state(), TransportState::Stopped);
        assert!(factory.last_log().unwrap().closed);
        assert!(driver.piano.lit_keys().is_empty());
        assert_eq!(driver.frame(&mut t), FrameOutcome::Idle);
    }

    #[test]
    fn paused_session_shows_a_frozen_highlight() {
        let (mut factory, clock) = RecordingFactory::manual();
        let mut t = Transport::default();
        t.load_piece(piece_of(vec![note(60, 0.0, 1.0), note(62, 1.0, 1.0)]));
        let id = t.start(&mut factory).unwrap();
        let mut driver = VisualizationDriver::new();
        driver.attach(id);

        clock.set(0.5);
        t.pause().unwrap();
        clock.set(1.5);
        let FrameOutcome::Rendered { active, elapsed } = driver.frame(&mut t) else {
            panic!("expected a rendered frame");
        };
        assert_eq!(active, set(&[60]));
        assert!((elapsed - 0.5).abs() < 1e-9);

        t.resume().unwrap();
        clock.set(2.2);
        let FrameOutcome::Rendered { active, .. } = driver.frame(&mut t) else {
            panic!("expected a rendered frame");
        };
        // 2.2 hardware - 1.0 paused = 1.2 elapsed
        assert_eq!(active, set(&[62]));
    }

    #[test]
    fn stop_cancels_the_next_frame() {
        let (mut factory, clock) = RecordingFactory::manual();
        let mut t = Transport::default();
        t.load_piece(piece_of(vec![note(60, 0.0, 5.0)]));
        let id = t.start(&mut factory).unwrap();
        let mut driver = VisualizationDriver::new();
        driver.attach(id);
        clock.set(1.0);
        driver.frame(&mut t);
        assert!(driver.piano.is_lit(60));

        t.stop();
        assert_eq!(driver.frame(&mut t), FrameOutcome::Cancelled);
        assert!(!driver.piano.is_lit(60));
        assert!(!driver.is_running());

        // a restarted session is not picked up by the old handle
        t.start(&mut factory).unwrap();
        assert_eq!(driver.frame(&mut t), FrameOutcome::Idle);
    }

    #[test]
    fn empty_piece_renders_nothing_then_finishes() {
        let (mut factory, clock) = RecordingFactory::manual();
        let mut t = Transport::default();
        t.load_piece(Piece::default());
        let id = t.start(&mut factory).unwrap();
        let mut driver = VisualizationDriver::new();
        driver.attach(id);
        clock.set(0.2);
        assert_eq!(driver.frame(&mut t), FrameOutcome::Rendered { elapsed: 0.2, active: set(&[]) });
        clock.set(0.6);
        assert_eq!(driver.frame(&mut t), FrameOutcome::Finished);
    }
}
