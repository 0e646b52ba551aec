//! transport.rs
//!
//! The stopped / playing / paused lifecycle.
//!
//! `Transport` owns the loaded piece, the playback parameters and at most one live
//! session. A session bundles the sound backend, the transport clock running on that
//! backend's hardware clock, and a snapshot of the piece and parameters it was started
//! with.
//!
//! ### Generations
//! Every session (and every pending start) gets a fresh `SessionId`. Anything that acts
//! later (the end of instrument warm-up, the visualizer's next frame) carries the id it was
//! issued with and is ignored once that id is no longer current. This is what keeps a
//! discarded session from touching the one that replaced it.
//!
//! ### Starting
//! Starting is split in two so instrument loading can happen outside the transport:
//!  - `request_start` takes the warm-up lock and hands out a `StartTicket`
//!  - `complete_start` takes the ticket and the opened backend (or the error)
//! While the lock is held the state is still `Stopped`; `is_loading()` reports it.

use std::sync::Arc;

use crate::backend::{BackendFactory, SoundBackend};
use crate::clock::TransportClock;
use crate::error::{PlayerError, Result};
use crate::midi::Piece;
use crate::params::{PlaybackParameters, TempoStep};
use crate::scheduler;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    Stopped,
    Playing,
    Paused,
}

/// Generation id of a session or pending start.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

/// Proof of a granted start request. Stale once any other session or piece takes over.
#[derive(Debug, PartialEq, Eq)]
pub struct StartTicket {
    id: SessionId,
}

impl StartTicket {
    pub fn id(&self) -> SessionId {
        self.id
    }
}

/// What `request_start` decided.
#[derive(Debug, PartialEq, Eq)]
pub enum StartRequest {
    /// Go ahead: open a backend and call `complete_start`.
    Granted(StartTicket),
    /// A session is already live; nothing to do.
    AlreadyActive(SessionId),
    /// Another start is warming up.
    Loading,
}

/// Everything the visualizer needs for one frame of a live session.
#[derive(Clone, Debug)]
pub struct FrameInput {
    pub elapsed: f64,
    pub piece: Arc<Piece>,
    pub params: PlaybackParameters,
    pub state: TransportState,
}

struct Session {
    id: SessionId,
    state: TransportState,
    clock: TransportClock,
    backend: Box<dyn SoundBackend>,
    piece: Arc<Piece>,
    params: PlaybackParameters,
}

impl Session {
    fn release(mut self) {
        self.clock.close();
        self.backend.close();
    }
}

pub struct Transport {
    piece: Option<Arc<Piece>>,
    params: PlaybackParameters,
    session: Option<Session>,
    loading: Option<SessionId>,
    next_id: u64,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new(PlaybackParameters::default())
    }
}

impl Transport {
    pub fn new(params: PlaybackParameters) -> Self {
        Self { piece: None, params, session: None, loading: None, next_id: 1 }
    }

    pub fn state(&self) -> TransportState {
        self.session.as_ref().map_or(TransportState::Stopped, |s| s.state)
    }

    /// True while a start is waiting for its backend.
    pub fn is_loading(&self) -> bool {
        self.loading.is_some()
    }

    pub fn piece(&self) -> Option<&Arc<Piece>> {
        self.piece.as_ref()
    }

    pub fn params(&self) -> PlaybackParameters {
        self.params
    }

    /// Id of the live session, if any.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    pub fn is_current(&self, id: SessionId) -> bool {
        self.session_id() == Some(id)
    }

    /// Seconds elapsed in the live session (0 when stopped).
    pub fn elapsed(&self) -> f64 {
        self.session.as_ref().map_or(0.0, |s| s.clock.elapsed())
    }

    /// Replace the piece. Any live session and any pending start are discarded.
    pub fn load_piece(&mut self, piece: impl Into<Arc<Piece>>) {
        self.stop();
        self.loading = None;
        self.piece = Some(piece.into());
    }

    fn fresh_id(&mut self) -> SessionId {
        let id = SessionId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn request_start(&mut self) -> Result<StartRequest> {
        if self.piece.is_none() {
            return Err(PlayerError::NoPiece);
        }
        if let Some(id) = self.session_id() {
            return Ok(StartRequest::AlreadyActive(id));
        }
        if self.loading.is_some() {
            return Ok(StartRequest::Loading);
        }
        let id = self.fresh_id();
        self.loading = Some(id);
        Ok(StartRequest::Granted(StartTicket { id }))
    }

    /// Finish a start with the backend that warm-up produced.
    ///
    /// A stale ticket closes the backend and reports `Ok(None)`. Any failure leaves the
    /// transport `Stopped` with nothing acquired.
    pub fn complete_start(
        &mut self,
        ticket: StartTicket,
        backend: Result<Box<dyn SoundBackend>>,
    ) -> Result<Option<SessionId>> {
        if self.loading != Some(ticket.id) || self.session.is_some() {
            log::debug!("discarding stale start {:?}", ticket.id);
            if let Ok(mut b) = backend {
                b.close();
            }
            return Ok(None);
        }
        self.loading = None;

        let mut backend = match backend {
            Ok(b) => b,
            Err(e) => {
                log::warn!("sound backend failed to open: {e}");
                return Err(e);
            }
        };
        let Some(piece) = self.piece.clone() else {
            backend.close();
            return Err(PlayerError::NoPiece);
        };

        let mut clock = TransportClock::new(backend.clock());
        let origin = match clock.begin() {
            Ok(t) => t,
            Err(e) => {
                backend.close();
                return Err(e);
            }
        };
        let params = self.params;
        let count = scheduler::schedule(&piece, &params, origin, backend.as_mut());
        log::info!(
            "session {:?} playing: {count} notes, rate {:.1}x, transpose {:+}",
            ticket.id,
            params.playback_rate(),
            params.transposition()
        );

        self.session = Some(Session {
            id: ticket.id,
            state: TransportState::Playing,
            clock,
            backend,
            piece,
            params,
        });
        Ok(Some(ticket.id))
    }

    /// Start playing now, opening a backend from `factory`. No-op if already live.
    pub fn start(&mut self, factory: &mut dyn BackendFactory) -> Result<SessionId> {
        match self.request_start()? {
            StartRequest::AlreadyActive(id) => Ok(id),
            StartRequest::Loading => Err(PlayerError::BackendUnavailable(
                "another start is still loading".into(),
            )),
            StartRequest::Granted(ticket) => {
                let backend = factory.open();
                self.complete_start(ticket, backend)?.ok_or_else(|| {
                    PlayerError::BackendUnavailable("start superseded".into())
                })
            }
        }
    }

    /// Discard whatever is live and start a new session.
    pub fn restart(&mut self, factory: &mut dyn BackendFactory) -> Result<SessionId> {
        self.stop();
        self.start(factory)
    }

    /// The play/pause button: start when stopped, pause when playing, resume when paused.
    pub fn toggle(&mut self, factory: &mut dyn BackendFactory) -> Result<TransportState> {
        match self.state() {
            TransportState::Stopped => {
                self.start(factory)?;
            }
            TransportState::Playing => self.pause()?,
            TransportState::Paused => self.resume()?,
        }
        Ok(self.state())
    }

    pub fn pause(&mut self) -> Result<()> {
        let Some(s) = self.session.as_mut() else { return Ok(()) };
        if s.state != TransportState::Playing {
            return Ok(());
        }
        s.backend.suspend()?;
        s.clock.suspend();
        s.state = TransportState::Paused;
        log::info!("session {:?} paused at {:.3}s", s.id, s.clock.elapsed());
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        let Some(s) = self.session.as_mut() else { return Ok(()) };
        if s.state != TransportState::Paused {
            return Ok(());
        }
        s.backend.resume()?;
        s.clock.resume();
        s.state = TransportState::Playing;
        log::info!("session {:?} resumed at {:.3}s", s.id, s.clock.elapsed());
        Ok(())
    }

    /// Stop and release everything. Idempotent.
    pub fn stop(&mut self) {
        if let Some(s) = self.session.take() {
            log::info!("session {:?} stopped", s.id);
            s.release();
        }
    }

    /// End-of-piece stop. Only acts if `id` is still the live session.
    pub fn finish(&mut self, id: SessionId) -> bool {
        if !self.is_current(id) {
            return false;
        }
        if let Some(s) = self.session.take() {
            log::info!("session {:?} finished", s.id);
            s.release();
        }
        true
    }

    pub fn frame_input(&self, id: SessionId) -> Option<FrameInput> {
        let s = self.session.as_ref().filter(|s| s.id == id)?;
        Some(FrameInput {
            elapsed: s.clock.elapsed(),
            piece: s.piece.clone(),
            params: s.params,
            state: s.state,
        })
    }

    /// Change transposition. Stops playback so the new value only applies to the next session.
    pub fn set_transposition(&mut self, semitones: i32) -> Result<()> {
        let params = self.params.with_transposition(semitones)?;
        self.stop();
        self.params = params;
        Ok(())
    }

    /// Change tempo. Stops playback so the new value only applies to the next session.
    pub fn set_playback_rate(&mut self, rate: f64) -> Result<()> {
        let params = self.params.with_playback_rate(rate)?;
        self.stop();
        self.params = params;
        Ok(())
    }

    /// One tempo step; returns the new rate, or `None` if already at the limit.
    pub fn step_tempo(&mut self, step: TempoStep) -> Result<Option<f64>> {
        match self.params.stepped_rate(step) {
            Some(rate) => {
                self.set_playback_rate(rate)?;
                Ok(Some(rate))
            }
            None => Ok(None),
        }
    }

    pub fn reset_params(&mut self) {
        self.stop();
        self.params = PlaybackParameters::default();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.stop();
    }
}
