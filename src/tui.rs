//! tui.rs
//!
//! Terminal drawing of the piano row, the fretboard and a status line.
//!
//! The views are turned into plain text lines first (so they can be tested without a
//! terminal), then queued to the terminal with crossterm, lit cells in colour.

use std::io::Write;

use crossterm::{
    cursor::MoveTo,
    queue,
    style::{Print, PrintStyledContent, Stylize},
    terminal::{Clear, ClearType},
};

use crate::fretboard::{
    FRETS, FretPosition, FretboardView, INLAYS, PIANO_HIGH, PIANO_LOW, PianoView, STRING_NAMES,
    is_black_key,
};
use crate::midi::format_duration;
use crate::params::PlaybackParameters;
use crate::transport::TransportState;

const LIT: char = '█';
const NOTE: char = '●';

/// Which instrument(s) to draw.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum View {
    Piano,
    Guitar,
    #[default]
    Both,
}

impl View {
    pub fn next(self) -> Self {
        match self {
            View::Piano => View::Guitar,
            View::Guitar => View::Both,
            View::Both => View::Piano,
        }
    }

    fn piano(self) -> bool {
        matches!(self, View::Piano | View::Both)
    }

    fn guitar(self) -> bool {
        matches!(self, View::Guitar | View::Both)
    }
}

/// One character per key: lit, black or white.
pub fn piano_line(view: &PianoView) -> String {
    (PIANO_LOW..=PIANO_HIGH)
        .map(|k| match (view.is_lit(k), is_black_key(k)) {
            (true, _) => LIT,
            (false, true) => '▒',
            (false, false) => '░',
        })
        .collect()
}

/// Octave labels under the piano line, each starting at its C.
pub fn octave_ruler() -> String {
    let mut line = String::new();
    for k in PIANO_LOW..=PIANO_HIGH {
        if line.chars().count() > (k - PIANO_LOW) as usize {
            continue;
        }
        if k % 12 == 0 {
            line.push_str(&format!("C{}", k / 12 - 1));
        } else {
            line.push(' ');
        }
    }
    line
}

/// Fret numbers, then one line per string (high E first), then the inlay markers.
pub fn fretboard_lines(view: &FretboardView) -> Vec<String> {
    let mut header = String::from("    ");
    for f in 1..=FRETS {
        header.push_str(&format!("{f:^3}"));
    }

    let mut lines = vec![header];
    for (s, name) in STRING_NAMES.iter().enumerate() {
        let cell = |fret: u8| view.is_lit(FretPosition { string: s as u8, fret });
        let mut line = format!("{name} {}‖", if cell(0) { NOTE } else { ' ' });
        for f in 1..=FRETS {
            line.push('-');
            line.push(if cell(f) { NOTE } else { '-' });
            line.push('|');
        }
        lines.push(line);
    }

    let mut inlays = String::from("    ");
    for f in 1..=FRETS {
        let mark = match f {
            12 | 24 => ':',
            f if INLAYS.contains(&f) => '•',
            _ => ' ',
        };
        inlays.push_str(&format!(" {mark} "));
    }
    lines.push(inlays.trim_end().to_string());
    lines
}

/// Everything the status line shows.
#[derive(Clone, Copy, Debug)]
pub struct Status {
    pub state: TransportState,
    pub elapsed: f64,
    pub total: f64,
    pub params: PlaybackParameters,
    /// What the user asked for; may differ from `params` when the score was shifted upstream.
    pub transposition: i32,
}

pub fn status_line(s: &Status) -> String {
    let icon = match s.state {
        TransportState::Playing => "▶",
        TransportState::Paused => "‖",
        TransportState::Stopped => "■",
    };
    let rate = s.params.playback_rate();
    format!(
        "{icon} {} / {}  tempo {rate:.1}x  transpose {:+}",
        format_duration(s.elapsed),
        format_duration(s.total / rate),
        s.transposition
    )
}

pub const HELP: &str =
    "space play/pause  r restart  s stop  +/- transpose  [/] tempo  v view  esc quit";

/// Draws the whole screen from the top-left corner.
pub struct Screen {
    pub view: View,
    pub title: String,
    /// Last error or event worth showing, under the status line.
    pub notice: String,
}

impl Screen {
    pub fn new(title: impl Into<String>, view: View) -> Self {
        Self { view, title: title.into(), notice: String::new() }
    }

    pub fn draw(
        &self,
        out: &mut impl Write,
        piano: &PianoView,
        fretboard: &FretboardView,
        status: &Status,
    ) -> std::io::Result<()> {
        let mut lines: Vec<String> = vec![self.title.clone(), String::new()];
        if self.view.piano() {
            lines.push(piano_line(piano));
            lines.push(octave_ruler());
            lines.push(String::new());
        }
        if self.view.guitar() {
            lines.extend(fretboard_lines(fretboard));
            lines.push(String::new());
        }
        lines.push(status_line(status));
        lines.push(self.notice.clone());
        lines.push(HELP.to_string());

        queue!(out, Clear(ClearType::All))?;
        for (row, line) in lines.iter().enumerate() {
            queue!(out, MoveTo(0, row as u16))?;
            print_highlighted(out, line)?;
        }
        out.flush()
    }
}

/// Print `line`, colouring lit cells.
fn print_highlighted(out: &mut impl Write, line: &str) -> std::io::Result<()> {
    let mut plain = String::new();
    for c in line.chars() {
        if c == LIT || c == NOTE {
            if !plain.is_empty() {
                queue!(out, Print(std::mem::take(&mut plain)))?;
            }
            queue!(out, PrintStyledContent(c.yellow().bold()))?;
        } else {
            plain.push(c);
        }
    }
    if !plain.is_empty() {
        queue!(out, Print(plain))?;
    }
    Ok(())
}
