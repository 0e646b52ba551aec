use anyhow::{Context, Result};
use clap::Parser;
use std::collections::BTreeSet;
use std::io::{Write, stdout};
use std::path::{Path, PathBuf};
use std::{thread, time::Duration};

use crossterm::cursor::{Hide, Show};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode};

use fretlight::app::AppSession;
use fretlight::backend::{BackendFactory, SilentFactory};
use fretlight::midi::format_duration;
use fretlight::params::TempoStep;
use fretlight::service::LocalFetcher;
use fretlight::synth::SoundFontFactory;
use fretlight::transport::TransportState;
use fretlight::tui::{Screen, Status, View};
use fretlight::visualizer::{FrameOutcome, VisualizationDriver};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Opt {
    /// MIDI file to play
    midi: PathBuf,
    /// Path to GM SoundFont (.sf2); without one nothing is heard
    #[arg(long)]
    soundfont: Option<PathBuf>,
    /// Score markup (MusicXML) that goes with the MIDI file
    #[arg(long)]
    score: Option<PathBuf>,
    /// Semitones to shift playback by
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    transpose: i32,
    /// Tempo multiplier
    #[arg(long, default_value_t = 1.0)]
    rate: f64,
    #[arg(long, value_enum, default_value_t = View::Both)]
    view: View,
    /// Print the sounding pitches instead of drawing
    #[arg(long)]
    headless: bool,
}

/// Time between frames.
const FRAME: Duration = Duration::from_millis(16);

struct RawGuard;
impl RawGuard {
    fn enter() -> Result<Self> {
        enable_raw_mode()?;
        execute!(stdout(), EnterAlternateScreen, Hide)?;
        Ok(Self)
    }
}
impl Drop for RawGuard {
    fn drop(&mut self) {
        let _ = execute!(stdout(), Show, LeaveAlternateScreen);
        let _ = disable_raw_mode();
    }
}

fn location(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let opt = Opt::parse();

    let mut app = AppSession::new(Box::new(LocalFetcher::new(".")));
    let score = opt.score.as_deref().map(location);
    app.open(&location(&opt.midi), score.as_deref())
        .with_context(|| format!("loading {}", opt.midi.display()))?;
    app.set_transposition(opt.transpose).context("--transpose")?;
    app.set_playback_rate(opt.rate).context("--rate")?;

    if opt.headless {
        return headless(&mut app);
    }

    let mut factory: Box<dyn BackendFactory> = match &opt.soundfont {
        Some(sf) => Box::new(SoundFontFactory::new(sf)),
        None => Box::new(SilentFactory::new()),
    };

    let mut title = format!("{}", opt.midi.display());
    if let Some(s) = app.score_location() {
        title.push_str(&format!("  (score: {s})"));
    }
    if opt.soundfont.is_none() {
        title.push_str("  [no soundfont, silent]");
    }
    let mut screen = Screen::new(title, opt.view);
    interactive(&mut app, factory.as_mut(), &mut screen)
}

/// Play once through on the wall clock, printing each change of the sounding set.
fn headless(app: &mut AppSession) -> Result<()> {
    let mut factory = SilentFactory::new();
    let id = app.transport_mut().start(&mut factory)?;
    let mut driver = VisualizationDriver::new();
    driver.attach(id);

    let mut last: Option<BTreeSet<i32>> = None;
    loop {
        match driver.frame(app.transport_mut()) {
            FrameOutcome::Rendered { elapsed, active } => {
                if last.as_ref() != Some(&active) {
                    let pitches: Vec<String> = active.iter().map(|p| p.to_string()).collect();
                    println!("{} {:>7.3}  {}", format_duration(elapsed), elapsed, pitches.join(" "));
                    last = Some(active);
                }
            }
            FrameOutcome::Finished | FrameOutcome::Cancelled | FrameOutcome::Idle => break,
        }
        thread::sleep(FRAME);
    }
    println!("finished");
    Ok(())
}

fn interactive(
    app: &mut AppSession,
    factory: &mut dyn BackendFactory,
    screen: &mut Screen,
) -> Result<()> {
    let mut driver = VisualizationDriver::new();
    let _raw = RawGuard::enter()?;
    let mut out = stdout();

    loop {
        if driver.frame(app.transport_mut()) == FrameOutcome::Finished {
            screen.notice = "finished".into();
        }
        let status = Status {
            state: app.transport().state(),
            elapsed: app.transport().elapsed(),
            total: app.transport().piece().map_or(0.0, |p| p.total_duration()),
            params: app.transport().params(),
            transposition: app.display_transposition(),
        };
        screen.draw(&mut out, &driver.piano, &driver.fretboard, &status)?;

        // poll for key events; the timeout paces the frames
        if !event::poll(FRAME)? {
            continue;
        }
        let Event::Key(k) = event::read()? else { continue };
        if k.kind != KeyEventKind::Press {
            continue;
        }

        let result = match k.code {
            KeyCode::Esc => break,
            KeyCode::Char('c') if k.modifiers.contains(KeyModifiers::CONTROL) => break,
            KeyCode::Char(' ') => app.transport_mut().toggle(factory).map(|_| ()),
            KeyCode::Char('r') => app.transport_mut().restart(factory).map(|_| ()),
            KeyCode::Char('s') => {
                app.transport_mut().stop();
                Ok(())
            }
            KeyCode::Char('+') | KeyCode::Char('=') => app.transpose_by(1),
            KeyCode::Char('-') => app.transpose_by(-1),
            KeyCode::Char('[') => app.step_tempo(TempoStep::Slower).map(|_| ()),
            KeyCode::Char(']') => app.step_tempo(TempoStep::Faster).map(|_| ()),
            KeyCode::Char('v') => {
                screen.view = screen.view.next();
                Ok(())
            }
            _ => continue,
        };

        match result {
            Ok(()) => screen.notice.clear(),
            Err(e) => {
                log::warn!("{e}");
                screen.notice = e.to_string();
            }
        }
        // follow whatever session is live now; a stopped one cancels on the next frame
        if let Some(id) = app.transport().session_id() {
            if app.transport().state() == TransportState::Playing {
                driver.attach(id);
            }
        }
    }

    app.transport_mut().stop();
    out.flush()?;
    Ok(())
}
