//! fretlight
//!
//! Plays a transcribed piece (a Standard MIDI File) and keeps a piano keyboard and a
//! guitar fretboard highlight locked to what is sounding.
//!
//! The pieces, bottom-up:
//!  - `midi` parses the file into timed notes
//!  - `params` holds transposition and tempo and is the one place notes get transformed
//!  - `clock` and `backend` are the time source and the sound output
//!  - `scheduler` hands every note to the backend at start
//!  - `transport` owns the stopped / playing / paused lifecycle
//!  - `visualizer` and `fretboard` work out what to light each frame
//!  - `service` and `app` wire in the transcription service and the score
//!  - `synth` and `tui` are the SoundFont output and the terminal surface

pub mod app;
pub mod backend;
pub mod clock;
pub mod error;
pub mod fretboard;
pub mod midi;
pub mod params;
pub mod scheduler;
pub mod service;
pub mod synth;
pub mod transport;
pub mod tui;
pub mod visualizer;

pub use error::{PlayerError, Result};
