//! midi.rs
//!
//! This module turns a Standard MIDI File (SMF) into a `Piece`: tracks of notes with
//! absolute start times and durations in seconds.
//!
//! The playback engine never looks at raw MIDI messages. It only needs to know, for every
//! note, *when* it starts, *how long* it lasts, *which* key it is and *how hard* it was hit.
//! So instead of keeping a stream of note-on/note-off messages we pair them up here, once,
//! at load time.
//!
//! ### Quick primer on MIDI timing
//! - Events inside a track carry a delta time in "ticks" since the previous event.
//! - The header says how many ticks make a quarter note (PPQ), or, for SMPTE files, how
//!   many ticks make a second.
//! - Tempo meta events say how many microseconds a quarter note lasts from that tick on.
//!   In multi-track (format 1) files they usually live in the first track but apply to
//!   all of them, so we build one tempo map for the whole file.
//!
//! This module takes care of:
//!  - Building the shared tempo map and converting ticks to seconds
//!  - Normalizing NoteOn with velocity=0 into NoteOff
//!  - Pairing each NoteOn with its NoteOff (first in, first out per channel and key)
//!  - Computing the piece's total duration

use std::collections::{HashMap, VecDeque};

use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};

use crate::error::{PlayerError, Result};

/// Default tempo: 500,000 µs per quarter note = 120 BPM
const DEFAULT_US_PER_QN: f64 = 500_000.0;

/// One sounding note, already resolved to seconds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NoteEvent {
    /// MIDI note number, 0–127
    pub pitch: u8,
    /// Seconds from the start of the piece, unscaled by playback rate
    pub start_time: f64,
    /// Seconds, always > 0
    pub duration: f64,
    /// 0.0–1.0 (MIDI velocity / 127)
    pub velocity: f32,
    /// Index of the track this note came from
    pub track: usize,
}

impl NoteEvent {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Track {
    pub index: usize,
    pub name: Option<String>,
    /// Ordered by start time
    pub notes: Vec<NoteEvent>,
}

/// A loaded piece. Read-only once built; replaced wholesale when a new file comes in.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Piece {
    tracks: Vec<Track>,
    total_duration: f64,
}

impl Piece {
    /// Decode a Standard MIDI File.
    ///
    /// Fails with `PlayerError::Parse` if the bytes are not a valid SMF. Nothing is
    /// retained on failure, so a caller holding a previous piece still has it.
    pub fn load(bytes: &[u8]) -> Result<Self> {
        let smf = Smf::parse(bytes)?;
        let tempo = TempoMap::from_smf(&smf)?;

        let mut tracks = Vec::with_capacity(smf.tracks.len());
        for (index, events) in smf.tracks.iter().enumerate() {
            tracks.push(read_track(index, events, &tempo));
        }

        let piece = Self::from_tracks(tracks);
        log::info!(
            "loaded piece: {} tracks, {} notes, {}",
            piece.tracks.len(),
            piece.note_count(),
            format_duration(piece.total_duration)
        );
        Ok(piece)
    }

    /// Build a piece from already-timed tracks. The total duration is the latest note end.
    pub fn from_tracks(tracks: Vec<Track>) -> Self {
        let total_duration = tracks
            .iter()
            .flat_map(|t| t.notes.iter())
            .map(NoteEvent::end_time)
            .fold(0.0, f64::max);
        Self { tracks, total_duration }
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// All notes of all tracks, track by track.
    pub fn notes(&self) -> impl Iterator<Item = &NoteEvent> + '_ {
        self.tracks.iter().flat_map(|t| t.notes.iter())
    }

    pub fn note_count(&self) -> usize {
        self.tracks.iter().map(|t| t.notes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.note_count() == 0
    }

    /// Authoritative length in seconds, used for end-of-playback detection.
    pub fn total_duration(&self) -> f64 {
        self.total_duration
    }
}

/// Piecewise-constant tempo: seconds at each tempo change plus seconds per tick after it.
#[derive(Debug)]
struct TempoMap {
    segments: Vec<TempoSegment>,
}

#[derive(Clone, Copy, Debug)]
struct TempoSegment {
    tick: u64,
    seconds: f64,
    secs_per_tick: f64,
}

impl TempoMap {
    fn from_smf(smf: &Smf<'_>) -> Result<Self> {
        let ppq = match smf.header.timing {
            Timing::Metrical(t) => t.as_int() as f64,
            Timing::Timecode(fps, subframes) => {
                let ticks_per_sec = fps.as_f32() as f64 * subframes as f64;
                if ticks_per_sec <= 0.0 {
                    return Err(PlayerError::Parse("zero SMPTE tick rate".into()));
                }
                // SMPTE timing ignores tempo events entirely
                return Ok(Self::constant(1.0 / ticks_per_sec));
            }
        };
        if ppq <= 0.0 {
            return Err(PlayerError::Parse("zero ticks per quarter note".into()));
        }

        // Gather tempo changes from every track at their absolute tick
        let mut changes: Vec<(u64, f64)> = Vec::new();
        for tr in &smf.tracks {
            let mut abs_ticks: u64 = 0;
            for ev in tr {
                abs_ticks += ev.delta.as_int() as u64;
                if let TrackEventKind::Meta(MetaMessage::Tempo(tp)) = ev.kind {
                    changes.push((abs_ticks, tp.as_int() as f64));
                }
            }
        }
        changes.sort_by_key(|&(tick, _)| tick);

        let mut map = Self::constant(DEFAULT_US_PER_QN / 1_000_000.0 / ppq);
        for (tick, us_per_qn) in changes {
            let secs_per_tick = us_per_qn / 1_000_000.0 / ppq;
            let Some(last) = map.segments.last_mut() else { break };
            if tick == last.tick {
                // Later change at the same tick wins
                last.secs_per_tick = secs_per_tick;
            } else {
                let seconds = last.seconds + (tick - last.tick) as f64 * last.secs_per_tick;
                map.segments.push(TempoSegment { tick, seconds, secs_per_tick });
            }
        }
        Ok(map)
    }

    fn constant(secs_per_tick: f64) -> Self {
        Self { segments: vec![TempoSegment { tick: 0, seconds: 0.0, secs_per_tick }] }
    }

    fn seconds_at(&self, tick: u64) -> f64 {
        let idx = self.segments.partition_point(|s| s.tick <= tick).saturating_sub(1);
        let seg = self.segments[idx];
        seg.seconds + (tick - seg.tick) as f64 * seg.secs_per_tick
    }
}

/// Walk one track, pairing note-ons with note-offs.
fn read_track(index: usize, events: &[midly::TrackEvent<'_>], tempo: &TempoMap) -> Track {
    let mut name = None;
    let mut notes = Vec::new();
    // (channel, key) -> queue of (start tick, velocity)
    let mut open: HashMap<(u8, u8), VecDeque<(u64, u8)>> = HashMap::new();
    let mut abs_ticks: u64 = 0;

    let close = |start_tick: u64, end_tick: u64, key: u8, vel: u8, notes: &mut Vec<NoteEvent>| {
        let start_time = tempo.seconds_at(start_tick);
        let duration = tempo.seconds_at(end_tick) - start_time;
        if duration <= 0.0 {
            log::debug!("track {index}: dropping zero-length note {key} at {start_time:.3}s");
            return;
        }
        notes.push(NoteEvent {
            pitch: key,
            start_time,
            duration,
            velocity: vel as f32 / 127.0,
            track: index,
        });
    };

    for ev in events {
        abs_ticks += ev.delta.as_int() as u64;

        match ev.kind {
            TrackEventKind::Meta(MetaMessage::TrackName(raw)) => {
                let s = String::from_utf8_lossy(raw).trim().to_string();
                if !s.is_empty() {
                    name = Some(s);
                }
            }
            TrackEventKind::Midi { channel, message } => {
                let ch = u8::from(channel);
                match message {
                    // NoteOn with velocity=0 is equivalent to NoteOff
                    MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                        open.entry((ch, key.as_int()))
                            .or_default()
                            .push_back((abs_ticks, vel.as_int()));
                    }
                    MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                        let k = key.as_int();
                        if let Some((start, vel)) = open.get_mut(&(ch, k)).and_then(|q| q.pop_front()) {
                            close(start, abs_ticks, k, vel, &mut notes);
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    // Anything still held closes at the end of the track
    for ((_, key), queue) in open {
        for (start, vel) in queue {
            close(start, abs_ticks, key, vel, &mut notes);
        }
    }

    notes.sort_by(|a, b| a.start_time.total_cmp(&b.start_time).then(a.pitch.cmp(&b.pitch)));
    Track { index, name, notes }
}

/// Format seconds as a MM:SS string for display.
pub fn format_duration(seconds: f64) -> String {
    let total_secs = seconds.max(0.0) as u64;
    let mins = total_secs / 60;
    let secs = total_secs % 60;
    format!("{:02}:{:02}", mins, secs)
}
