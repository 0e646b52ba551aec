//! service.rs
//!
//! Contracts for the collaborators around the player: the transcription service that turns
//! audio into a score and a MIDI file, whatever fetches those resources, and the score
//! renderer that draws the markup.
//!
//! The service speaks JSON. The shapes below are what it returns:
//!
//! ```text
//! GET  /health          -> {"status": "ready"}            | {"status": "error"}
//! POST /process-audio   -> {"id", "xmlUrl", "midiUrl"}    | {"error": "..."}
//! POST /transpose       -> {"xmlUrl", "midiUrl"?}         | {"error": "..."}
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PlayerError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ready,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,
}

impl ServiceHealth {
    pub fn from_json(body: &str) -> Result<Self> {
        Ok(serde_json::from_str(body)?)
    }

    pub fn is_ready(&self) -> bool {
        self.status == HealthStatus::Ready
    }
}

/// Locations of the generated score markup and note-event file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionResult {
    pub id: String,
    pub xml_url: String,
    pub midi_url: String,
}

/// A server-side transposition. The MIDI location is only present when the service
/// re-rendered the note events too.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransposedResult {
    pub xml_url: String,
    #[serde(default)]
    pub midi_url: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Reply<T> {
    Failed { error: String },
    Ok(T),
}

fn decode<T: serde::de::DeserializeOwned>(body: &str) -> Result<T> {
    match serde_json::from_str::<Reply<T>>(body) {
        Ok(Reply::Ok(v)) => Ok(v),
        Ok(Reply::Failed { error }) => Err(PlayerError::Network(error)),
        // Re-parse as the expected type for a precise message
        Err(_) => Ok(serde_json::from_str::<T>(body)?),
    }
}

impl TranscriptionResult {
    pub fn from_json(body: &str) -> Result<Self> {
        decode(body)
    }
}

impl TransposedResult {
    pub fn from_json(body: &str) -> Result<Self> {
        decode(body)
    }
}

/// The remote transcription service.
pub trait TranscriptionService {
    fn health(&mut self) -> Result<ServiceHealth>;
    fn transcribe(&mut self, audio: &[u8], file_name: &str) -> Result<TranscriptionResult>;
    fn transpose(&mut self, id: &str, semitones: i32) -> Result<TransposedResult>;
}

/// Retrieves score and note-event resources by location.
pub trait ResourceFetcher {
    fn fetch(&mut self, location: &str) -> Result<Vec<u8>>;

    fn fetch_text(&mut self, location: &str) -> Result<String> {
        let bytes = self.fetch(location)?;
        String::from_utf8(bytes)
            .map_err(|e| PlayerError::Network(format!("{location} is not UTF-8 text: {e}")))
    }
}

/// Reads resources from the local filesystem. Accepts plain paths and `file://` URLs;
/// relative paths resolve against `root`.
pub struct LocalFetcher {
    root: PathBuf,
}

impl LocalFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, location: &str) -> PathBuf {
        let raw = location.strip_prefix("file://").unwrap_or(location);
        let path = Path::new(raw);
        if path.is_absolute() { path.to_path_buf() } else { self.root.join(path) }
    }
}

impl ResourceFetcher for LocalFetcher {
    fn fetch(&mut self, location: &str) -> Result<Vec<u8>> {
        let path = self.resolve(location);
        std::fs::read(&path).map_err(|e| PlayerError::Network(format!("reading {}: {e}", path.display())))
    }
}

/// One rendered page of the score.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedPage {
    pub number: u32,
    pub svg: String,
}

/// The external engraving toolkit: text in, drawn pages out.
pub trait ScoreRenderer {
    /// Semitones the renderer itself shifts the markup by. 0 for already-transposed markup.
    fn set_transpose(&mut self, semitones: i32);
    fn load(&mut self, markup: &str) -> Result<()>;
    fn render_page(&mut self, page: u32) -> Result<RenderedPage>;
    /// Raster image (PNG bytes) of the current rendering at `scale`.
    fn rasterize(&mut self, scale: f32) -> Result<Vec<u8>>;
}
