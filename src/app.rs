//! The application session: everything the front end used to keep in loose globals
//! (current result id, resource locations, score markup, the user's transposition) in one
//! place, next to the transport it drives.
//!
//! ### Transposition has two owners
//! When the service re-renders a transposed score (and possibly MIDI), the returned
//! resources already carry the shift. Applying our own transposition on top would shift
//! twice, so:
//!  - score markup from the service is rendered with renderer transpose 0
//!  - MIDI from the service is played with playback transposition 0
//!  - MIDI we already had keeps playing with playback transposition = the user's value

use std::sync::Arc;

use crate::error::{PlayerError, Result};
use crate::midi::Piece;
use crate::params::{PlaybackParameters, TempoStep};
use crate::service::{ResourceFetcher, ScoreRenderer, TranscriptionService};
use crate::transport::Transport;

/// Export scale for the rendered score image.
pub const EXPORT_SCALE: f32 = 2.0;

/// Resource locations of the current result, for download links.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Resources {
    /// Service-side id; `None` for locally loaded files.
    pub id: Option<String>,
    pub score: Option<String>,
    pub midi: Option<String>,
}

pub struct AppSession {
    transport: Transport,
    fetcher: Box<dyn ResourceFetcher>,
    service: Option<Box<dyn TranscriptionService>>,
    renderer: Option<Box<dyn ScoreRenderer>>,
    resources: Resources,
    markup: Option<String>,
    rendered: bool,
    display_transposition: i32,
}

impl AppSession {
    pub fn new(fetcher: Box<dyn ResourceFetcher>) -> Self {
        Self {
            transport: Transport::default(),
            fetcher,
            service: None,
            renderer: None,
            resources: Resources::default(),
            markup: None,
            rendered: false,
            display_transposition: 0,
        }
    }

    pub fn with_service(mut self, service: Box<dyn TranscriptionService>) -> Self {
        self.service = Some(service);
        self
    }

    pub fn with_renderer(mut self, renderer: Box<dyn ScoreRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }

    pub fn resources(&self) -> &Resources {
        &self.resources
    }

    pub fn score_location(&self) -> Option<&str> {
        self.resources.score.as_deref()
    }

    pub fn midi_location(&self) -> Option<&str> {
        self.resources.midi.as_deref()
    }

    /// The transposition the user asked for, whoever ends up applying it.
    pub fn display_transposition(&self) -> i32 {
        self.display_transposition
    }

    /// Send audio to the service and load what comes back.
    ///
    /// Nothing changes unless every step succeeds; the previous piece and any session
    /// playing it are left alone on failure.
    pub fn upload(&mut self, audio: &[u8], file_name: &str) -> Result<()> {
        let service = self
            .service
            .as_mut()
            .ok_or_else(|| PlayerError::Network("no transcription service configured".into()))?;

        if !service.health()?.is_ready() {
            return Err(PlayerError::Network("model is not ready".into()));
        }
        let result = service.transcribe(audio, file_name)?;
        log::info!("transcription {} ready", result.id);

        let piece = Piece::load(&self.fetcher.fetch(&result.midi_url)?)?;
        let markup = self.fetcher.fetch_text(&result.xml_url)?;

        self.commit(
            piece,
            Some(markup),
            Resources { id: Some(result.id), score: Some(result.xml_url), midi: Some(result.midi_url) },
        )
    }

    /// Load a MIDI file (and optional score markup) without a service.
    pub fn load_local(&mut self, midi: &[u8], markup: Option<String>) -> Result<()> {
        let piece = Piece::load(midi)?;
        self.commit(piece, markup, Resources::default())
    }

    /// Fetch and load resources by location without a service.
    pub fn open(&mut self, midi_location: &str, score_location: Option<&str>) -> Result<()> {
        let piece = Piece::load(&self.fetcher.fetch(midi_location)?)?;
        let markup = score_location.map(|l| self.fetcher.fetch_text(l)).transpose()?;
        self.commit(
            piece,
            markup,
            Resources {
                id: None,
                score: score_location.map(str::to_string),
                midi: Some(midi_location.to_string()),
            },
        )
    }

    /// Render the score, then swap in the new piece: reset parameters and discard the old
    /// session. A score the renderer rejects leaves everything as it was.
    fn commit(&mut self, piece: Piece, markup: Option<String>, resources: Resources) -> Result<()> {
        let rendered = render(self.renderer.as_mut(), markup.as_deref(), 0)?;

        self.transport.reset_params();
        self.transport.load_piece(piece);
        self.display_transposition = 0;
        self.resources = resources;
        self.markup = markup;
        self.rendered = rendered;
        Ok(())
    }

    pub fn transpose_by(&mut self, delta: i32) -> Result<()> {
        self.set_transposition(self.display_transposition + delta)
    }

    /// Change transposition. Always stops playback; nothing else changes unless the new
    /// score is fetched and drawn.
    pub fn set_transposition(&mut self, semitones: i32) -> Result<()> {
        // validate before touching anything
        PlaybackParameters::default().with_transposition(semitones)?;
        self.transport.stop();

        let shifted = match (&self.resources.id, self.service.as_mut()) {
            (Some(id), Some(service)) => Some(service.transpose(id, semitones)?),
            _ => None,
        };

        match shifted {
            Some(shifted) => {
                let markup = self.fetcher.fetch_text(&shifted.xml_url)?;
                let piece = match &shifted.midi_url {
                    Some(url) => Some(Piece::load(&self.fetcher.fetch(url)?)?),
                    None => None,
                };

                let rendered = render(self.renderer.as_mut(), Some(markup.as_str()), 0)?;

                // everything fetched and drawn; commit
                match piece {
                    Some(piece) => {
                        self.transport.load_piece(Arc::new(piece));
                        self.transport.set_transposition(0)?;
                        self.resources.midi = shifted.midi_url;
                    }
                    None => self.transport.set_transposition(semitones)?,
                }
                self.resources.score = Some(shifted.xml_url);
                self.markup = Some(markup);
                self.rendered |= rendered;
            }
            None => {
                let rendered =
                    render(self.renderer.as_mut(), self.markup.as_deref(), semitones)?;
                self.transport.set_transposition(semitones)?;
                self.rendered |= rendered;
            }
        }
        self.display_transposition = semitones;
        Ok(())
    }

    pub fn set_playback_rate(&mut self, rate: f64) -> Result<()> {
        self.transport.set_playback_rate(rate)
    }

    pub fn step_tempo(&mut self, step: TempoStep) -> Result<Option<f64>> {
        self.transport.step_tempo(step)
    }

    /// PNG of the rendered score.
    pub fn export_score_image(&mut self) -> Result<Vec<u8>> {
        match self.renderer.as_mut() {
            Some(r) if self.rendered => r.rasterize(EXPORT_SCALE),
            _ => Err(PlayerError::NothingRendered),
        }
    }
}

/// Draw the first page of `markup`. `Ok(false)` when there is no renderer or no markup.
fn render(
    renderer: Option<&mut Box<dyn ScoreRenderer>>,
    markup: Option<&str>,
    semitones: i32,
) -> Result<bool> {
    let (Some(r), Some(m)) = (renderer, markup) else {
        return Ok(false);
    };
    r.set_transpose(semitones);
    r.load(m)?;
    r.render_page(1)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingFactory;
    use crate::midi::tests::one_note_file;
    use crate::service::{RenderedPage, ServiceHealth, TranscriptionResult, TransposedResult};
    use crate::transport::TransportState;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    #[derive(Default)]
    struct MapFetcher {
        files: HashMap<String, Vec<u8>>,
    }

    impl ResourceFetcher for MapFetcher {
        fn fetch(&mut self, location: &str) -> Result<Vec<u8>> {
            self.files
                .get(location)
                .cloned()
                .ok_or_else(|| PlayerError::Network(format!("404 {location}")))
        }
    }

    struct FakeService {
        ready: bool,
        transpose_midi: bool,
        calls: Rc<RefCell<Vec<String>>>,
    }

    impl TranscriptionService for FakeService {
        fn health(&mut self) -> Result<ServiceHealth> {
            let body = if self.ready { r#"{"status":"ready"}"# } else { r#"{"status":"error"}"# };
            ServiceHealth::from_json(body)
        }

        fn transcribe(&mut self, _audio: &[u8], name: &str) -> Result<TranscriptionResult> {
            self.calls.borrow_mut().push(format!("transcribe {name}"));
            TranscriptionResult::from_json(r#"{"id":"42","xmlUrl":"42.xml","midiUrl":"42.mid"}"#)
        }

        fn transpose(&mut self, id: &str, semitones: i32) -> Result<TransposedResult> {
            self.calls.borrow_mut().push(format!("transpose {id} {semitones}"));
            Ok(TransposedResult {
                xml_url: format!("{id}_trans{semitones}.xml"),
                midi_url: self.transpose_midi.then(|| format!("{id}_trans{semitones}.mid")),
            })
        }
    }

    #[derive(Default)]
    struct RendererLog {
        transposes: Vec<i32>,
        loaded: Vec<String>,
        reject: bool,
    }

    struct FakeRenderer(Rc<RefCell<RendererLog>>);

    impl ScoreRenderer for FakeRenderer {
        fn set_transpose(&mut self, semitones: i32) {
            self.0.borrow_mut().transposes.push(semitones);
        }
        fn load(&mut self, markup: &str) -> Result<()> {
            let mut log = self.0.borrow_mut();
            if log.reject {
                return Err(PlayerError::Parse(format!("cannot engrave {markup}")));
            }
            log.loaded.push(markup.to_string());
            Ok(())
        }
        fn render_page(&mut self, page: u32) -> Result<RenderedPage> {
            Ok(RenderedPage { number: page, svg: "<svg/>".into() })
        }
        fn rasterize(&mut self, _scale: f32) -> Result<Vec<u8>> {
            Ok(b"\x89PNG".to_vec())
        }
    }

    struct Fixture {
        app: AppSession,
        calls: Rc<RefCell<Vec<String>>>,
        renderer: Rc<RefCell<RendererLog>>,
    }

    fn fixture(ready: bool, transpose_midi: bool) -> Fixture {
        let mut fetcher = MapFetcher::default();
        fetcher.files.insert("42.mid".into(), one_note_file(60));
        fetcher.files.insert("42.xml".into(), b"<original/>".to_vec());
        for s in [-2, 2] {
            fetcher.files.insert(format!("42_trans{s}.mid"), one_note_file((60 + s) as u8));
            fetcher.files.insert(format!("42_trans{s}.xml"), format!("<shifted {s}/>").into_bytes());
        }
        let calls = Rc::new(RefCell::new(Vec::new()));
        let renderer = Rc::new(RefCell::new(RendererLog::default()));
        let app = AppSession::new(Box::new(fetcher))
            .with_service(Box::new(FakeService { ready, transpose_midi, calls: calls.clone() }))
            .with_renderer(Box::new(FakeRenderer(renderer.clone())));
        Fixture { app, calls, renderer }
    }

    fn first_pitch(app: &AppSession) -> u8 {
        app.transport().piece().unwrap().notes().next().unwrap().pitch
    }

    #[test]
    fn upload_loads_piece_score_and_links() {
        let mut fx = fixture(true, true);
        fx.app.upload(b"RIFF", "take1.wav").unwrap();
        assert_eq!(first_pitch(&fx.app), 60);
        assert_eq!(fx.app.score_location(), Some("42.xml"));
        assert_eq!(fx.app.midi_location(), Some("42.mid"));
        assert_eq!(fx.renderer.borrow().loaded, vec!["<original/>".to_string()]);
        assert_eq!(fx.calls.borrow()[0], "transcribe take1.wav");
    }

    #[test]
    fn upload_refuses_when_model_not_ready() {
        let mut fx = fixture(false, true);
        assert!(matches!(fx.app.upload(b"RIFF", "a.wav"), Err(PlayerError::Network(_))));
        assert!(fx.app.transport().piece().is_none());
        assert!(fx.calls.borrow().is_empty());
    }

    #[test]
    fn failed_upload_keeps_previous_piece_and_session() {
        let mut fx = fixture(true, true);
        fx.app.load_local(&one_note_file(50), None).unwrap();
        let (mut factory, _) = RecordingFactory::manual();
        fx.app.transport_mut().start(&mut factory).unwrap();

        fx.app.service = Some(Box::new(FakeService {
            ready: true,
            transpose_midi: true,
            calls: fx.calls.clone(),
        }));
        // a fetcher without the generated files
        fx.app.fetcher = Box::new(MapFetcher::default());
        assert!(fx.app.upload(b"RIFF", "b.wav").is_err());
        assert_eq!(first_pitch(&fx.app), 50);
        assert_eq!(fx.app.transport().state(), TransportState::Playing);
    }

    #[test]
    fn new_upload_resets_parameters() {
        let mut fx = fixture(true, true);
        fx.app.load_local(&one_note_file(50), None).unwrap();
        fx.app.set_transposition(5).unwrap();
        fx.app.set_playback_rate(2.0).unwrap();
        fx.app.upload(b"RIFF", "c.wav").unwrap();
        assert_eq!(fx.app.transport().params(), PlaybackParameters::default());
        assert_eq!(fx.app.display_transposition(), 0);
    }

    #[test]
    fn server_transposed_midi_is_not_shifted_again() {
        let mut fx = fixture(true, true);
        fx.app.upload(b"RIFF", "a.wav").unwrap();
        let (mut factory, _) = RecordingFactory::manual();
        fx.app.transport_mut().start(&mut factory).unwrap();

        fx.app.transpose_by(2).unwrap();
        assert_eq!(fx.app.transport().state(), TransportState::Stopped);
        assert_eq!(fx.app.display_transposition(), 2);
        assert_eq!(fx.app.transport().params().transposition(), 0);
        assert_eq!(first_pitch(&fx.app), 62);
        assert_eq!(fx.app.midi_location(), Some("42_trans2.mid"));
        assert_eq!(fx.app.score_location(), Some("42_trans2.xml"));
        assert_eq!(fx.renderer.borrow().transposes.last(), Some(&0));
        assert_eq!(fx.renderer.borrow().loaded.last().unwrap(), "<shifted 2/>");

        fx.app.transport_mut().start(&mut factory).unwrap();
        assert_eq!(factory.last_log().unwrap().notes[0].pitch, 62);
    }

    #[test]
    fn server_score_only_keeps_local_playback_shift() {
        let mut fx = fixture(true, false);
        fx.app.upload(b"RIFF", "a.wav").unwrap();
        fx.app.transpose_by(-2).unwrap();
        assert_eq!(fx.app.transport().params().transposition(), -2);
        assert_eq!(first_pitch(&fx.app), 60);
        assert_eq!(fx.app.midi_location(), Some("42.mid"));
        assert_eq!(fx.renderer.borrow().transposes.last(), Some(&0));

        let (mut factory, _) = RecordingFactory::manual();
        fx.app.transport_mut().start(&mut factory).unwrap();
        assert_eq!(factory.last_log().unwrap().notes[0].pitch, 58);
    }

    #[test]
    fn local_transposition_goes_to_renderer_and_playback() {
        let mut fx = fixture(true, true);
        fx.app.load_local(&one_note_file(60), Some("<local/>".into())).unwrap();
        fx.app.set_transposition(3).unwrap();
        assert_eq!(fx.app.transport().params().transposition(), 3);
        assert_eq!(fx.renderer.borrow().transposes.last(), Some(&3));
        assert_eq!(fx.renderer.borrow().loaded.last().unwrap(), "<local/>");
        assert!(fx.calls.borrow().is_empty());
    }

    #[test]
    fn failed_server_transposition_keeps_state() {
        let mut fx = fixture(true, true);
        fx.app.upload(b"RIFF", "a.wav").unwrap();
        // no file for +5
        assert!(fx.app.set_transposition(5).is_err());
        assert_eq!(fx.app.display_transposition(), 0);
        assert_eq!(fx.app.transport().params().transposition(), 0);
        assert_eq!(first_pitch(&fx.app), 60);
    }

    #[test]
    fn unrenderable_score_leaves_previous_piece_playing() {
        let mut fx = fixture(true, true);
        fx.app.load_local(&one_note_file(50), None).unwrap();
        fx.app.set_transposition(5).unwrap();
        let (mut factory, _) = RecordingFactory::manual();
        fx.app.transport_mut().start(&mut factory).unwrap();

        fx.renderer.borrow_mut().reject = true;
        assert!(matches!(fx.app.upload(b"RIFF", "a.wav"), Err(PlayerError::Parse(_))));
        assert_eq!(first_pitch(&fx.app), 50);
        assert_eq!(fx.app.transport().state(), TransportState::Playing);
        assert_eq!(fx.app.transport().params().transposition(), 5);
        assert_eq!(fx.app.display_transposition(), 5);
        assert_eq!(fx.app.resources(), &Resources::default());
        assert!(!factory.last_log().unwrap().closed);
    }

    #[test]
    fn failed_local_render_keeps_display_and_playback_in_step() {
        let mut fx = fixture(true, true);
        fx.app.load_local(&one_note_file(60), Some("<local/>".into())).unwrap();

        fx.renderer.borrow_mut().reject = true;
        assert!(fx.app.set_transposition(3).is_err());
        assert_eq!(fx.app.transport().params().transposition(), 0);
        assert_eq!(fx.app.display_transposition(), 0);

        fx.renderer.borrow_mut().reject = false;
        fx.app.transpose_by(1).unwrap();
        assert_eq!(fx.app.transport().params().transposition(), 1);
        assert_eq!(fx.app.display_transposition(), 1);
        assert_eq!(fx.renderer.borrow().transposes.last(), Some(&1));
    }

    #[test]
    fn failed_render_of_server_transposition_keeps_state() {
        let mut fx = fixture(true, true);
        fx.app.upload(b"RIFF", "a.wav").unwrap();

        fx.renderer.borrow_mut().reject = true;
        assert!(fx.app.transpose_by(2).is_err());
        assert_eq!(first_pitch(&fx.app), 60);
        assert_eq!(fx.app.midi_location(), Some("42.mid"));
        assert_eq!(fx.app.score_location(), Some("42.xml"));
        assert_eq!(fx.app.transport().params().transposition(), 0);
        assert_eq!(fx.app.display_transposition(), 0);

        fx.renderer.borrow_mut().reject = false;
        fx.app.transpose_by(2).unwrap();
        assert_eq!(first_pitch(&fx.app), 62);
        assert_eq!(fx.app.display_transposition(), 2);
    }

    #[test]
    fn out_of_range_transposition_is_rejected() {
        let mut fx = fixture(true, true);
        fx.app.load_local(&one_note_file(60), None).unwrap();
        assert!(matches!(fx.app.set_transposition(40), Err(PlayerError::InvalidParameter(_))));
    }

    #[test]
    fn export_needs_a_rendered_score() {
        let mut fx = fixture(true, true);
        fx.app.load_local(&one_note_file(60), None).unwrap();
        assert!(matches!(fx.app.export_score_image(), Err(PlayerError::NothingRendered)));
        fx.app.upload(b"RIFF", "a.wav").unwrap();
        assert_eq!(fx.app.export_score_image().unwrap(), b"\x89PNG");
    }

    #[test]
    fn open_reads_local_files_and_keeps_their_locations() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("song.mid"), one_note_file(67)).unwrap();
        std::fs::write(dir.path().join("song.xml"), "<score/>").unwrap();
        let log = Rc::new(RefCell::new(RendererLog::default()));
        let mut app = AppSession::new(Box::new(crate::service::LocalFetcher::new(dir.path())))
            .with_renderer(Box::new(FakeRenderer(log.clone())));

        app.open("song.mid", Some("song.xml")).unwrap();
        assert_eq!(first_pitch(&app), 67);
        assert_eq!(app.midi_location(), Some("song.mid"));
        assert_eq!(app.score_location(), Some("song.xml"));
        assert_eq!(app.resources().id, None);
        assert_eq!(log.borrow().loaded, vec!["<score/>".to_string()]);
        assert!(app.open("missing.mid", None).is_err());
        assert_eq!(first_pitch(&app), 67);
    }

    #[test]
    fn tempo_steps_go_through_the_transport() {
        let mut fx = fixture(true, true);
        fx.app.load_local(&one_note_file(60), None).unwrap();
        assert_eq!(fx.app.step_tempo(TempoStep::Faster).unwrap(), Some(1.1));
        assert_eq!(fx.app.transport().params().playback_rate(), 1.1);
    }
}
