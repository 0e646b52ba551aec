//! error.rs
//!
//! One error type for the whole player. Every fallible library call returns
//! `Result<T, PlayerError>`; the binary wraps these in `anyhow` at the edges.

pub type Result<T> = std::result::Result<T, PlayerError>;

#[derive(thiserror::Error, Debug)]
pub enum PlayerError {
    /// The note-event payload could not be decoded into tracks and notes.
    #[error("could not parse note events: {0}")]
    Parse(String),
    /// The sound backend or its clock could not be acquired or driven.
    #[error("sound backend unavailable: {0}")]
    BackendUnavailable(String),
    /// A score or note-event resource (or the service itself) could not be reached.
    #[error("network error: {0}")]
    Network(String),
    /// A playback rate or transposition outside the accepted range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("no piece loaded")]
    NoPiece,
    #[error("no music rendered to export")]
    NothingRendered,
}

impl From<midly::Error> for PlayerError {
    fn from(e: midly::Error) -> Self {
        PlayerError::Parse(e.to_string())
    }
}

impl From<serde_json::Error> for PlayerError {
    fn from(e: serde_json::Error) -> Self {
        PlayerError::Network(format!("malformed service response: {e}"))
    }
}
