//! The speech session: one utterance at a time and the statuses reported
//! for it.
//!
//! A [`SpeechSession`] owns the engine, the mute gate and the single status
//! listener. Commands (`speak`, `pause`, `resume`, `stop`, `destroy`) are
//! forwarded to the engine; the session's own [`SessionState`] only moves
//! when the engine confirms what happened through its event stream. The
//! session is meant to be driven from one task: the host selects over its
//! inbound commands and [`SpeechSession::next_event`] and feeds both back
//! in.

use anyhow::{anyhow, Result};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::bridge::BridgeCommand;
use crate::engine::{EngineEvent, SpeechEngine, Utterance};
use crate::mute_gate::MuteGate;
use crate::status::SpeakStatus;

pub const DEFAULT_SPEECH_RATE: f32 = 0.5;
pub const DEFAULT_PITCH: f32 = 1.0;
pub const DEFAULT_LOCALE: &str = "ko-KR";

/// One request to speak, as received from web content.
#[derive(Debug, Clone, PartialEq)]
pub struct UtteranceRequest {
    pub id: String,
    pub text: String,
    pub rate: f32,
    pub pitch: f32,
    pub callback: String,
}

impl UtteranceRequest {
    pub fn new(id: impl Into<String>, text: impl Into<String>, callback: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            rate: DEFAULT_SPEECH_RATE,
            pitch: DEFAULT_PITCH,
            callback: callback.into(),
        }
    }

    pub fn with_rate(mut self, rate: f32) -> Self {
        self.rate = rate;
        self
    }

    pub fn with_pitch(mut self, pitch: f32) -> Self {
        self.pitch = pitch;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Speaking,
    Paused,
}

/// Receives every status the session emits.
pub trait StatusListener: Send {
    fn on_speak_status(&mut self, utterance_id: &str, callback: &str, status: SpeakStatus);
}

impl<F> StatusListener for F
where
    F: FnMut(&str, &str, SpeakStatus) + Send,
{
    fn on_speak_status(&mut self, utterance_id: &str, callback: &str, status: SpeakStatus) {
        self(utterance_id, callback, status)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Voice locale applied to every utterance.
    pub locale: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            locale: DEFAULT_LOCALE.to_string(),
        }
    }
}

pub struct SpeechSession<E, G> {
    engine: E,
    gate: G,
    events: UnboundedReceiver<EngineEvent>,
    config: SessionConfig,
    state: SessionState,
    current: Option<UtteranceRequest>,
    /// Callback recorded by the last accepted speak; reported with
    /// `Start` and `Done`.
    complete_callback: String,
    /// Callback recorded by the last pause/resume/stop; reported with
    /// `Pause`, `Resume` and `Stop`.
    active_callback: String,
    /// The engine accepted an utterance but has not reported `Started`
    /// yet. Counts as busy.
    starting: bool,
    listener: Option<Box<dyn StatusListener>>,
}

impl<E, G> SpeechSession<E, G>
where
    E: SpeechEngine,
    G: MuteGate,
{
    /// Build a session around `engine`, subscribing to its event stream.
    /// Fails if someone else already took the stream.
    pub fn new(mut engine: E, gate: G, config: SessionConfig) -> Result<Self> {
        let events = engine
            .take_events()
            .ok_or_else(|| anyhow!("speech engine event stream was already taken"))?;
        Ok(Self {
            engine,
            gate,
            events,
            config,
            state: SessionState::Idle,
            current: None,
            complete_callback: String::new(),
            active_callback: String::new(),
            starting: false,
            listener: None,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn current_request(&self) -> Option<&UtteranceRequest> {
        self.current.as_ref()
    }

    pub fn set_status_listener(&mut self, listener: impl StatusListener + 'static) {
        self.listener = Some(Box::new(listener));
    }

    pub fn has_listener(&self) -> bool {
        self.listener.is_some()
    }

    /// Speak `request` unless output is muted or another utterance is in
    /// progress, in which case `Muted` or `Playing` is reported to
    /// `callback_name` and nothing else happens.
    pub async fn speak(&mut self, request: UtteranceRequest, callback_name: &str) {
        if self.gate.probe_silent_mode().await {
            log::info!("Output is muted; not speaking '{}'", request.id);
            self.emit(callback_name, SpeakStatus::Muted);
            return;
        }
        self.apply_pending_events();
        if self.state != SessionState::Idle || self.starting {
            log::debug!(
                "Rejecting '{}': session is {:?} (starting: {})",
                request.id,
                self.state,
                self.starting
            );
            self.emit(callback_name, SpeakStatus::Playing);
            return;
        }

        let utterance = Utterance {
            text: request.text.clone(),
            rate: request.rate,
            pitch: request.pitch,
            locale: self.config.locale.clone(),
        };
        log::debug!("Speaking '{}' ({} chars)", request.id, utterance.text.chars().count());
        self.current = Some(request);
        self.complete_callback = callback_name.to_string();
        match self.engine.speak(utterance).await {
            Ok(()) => self.starting = true,
            Err(e) => {
                log::error!("Speech engine refused the utterance: {e:#}");
                self.emit(callback_name, SpeakStatus::Error);
            }
        }
    }

    pub async fn pause(&mut self, callback_name: &str) {
        self.apply_pending_events();
        self.active_callback = callback_name.to_string();
        if let Err(e) = self.engine.pause().await {
            log::error!("Failed to pause speech: {e:#}");
        }
    }

    pub async fn resume(&mut self, callback_name: &str) {
        self.apply_pending_events();
        self.active_callback = callback_name.to_string();
        if let Err(e) = self.engine.resume().await {
            log::error!("Failed to resume speech: {e:#}");
        }
    }

    /// Ask the engine to stop. State is left alone until the engine
    /// reports the cancellation.
    pub async fn stop(&mut self, callback_name: &str) {
        self.apply_pending_events();
        self.active_callback = callback_name.to_string();
        if let Err(e) = self.engine.stop().await {
            log::error!("Failed to stop speech: {e:#}");
        }
    }

    /// Stop speaking, forget the current request and detach the listener.
    /// The session stays usable; a later `speak` starts from a clean slate.
    pub async fn destroy(&mut self) {
        self.stop("").await;
        self.current = None;
        self.state = SessionState::Idle;
        self.starting = false;
        self.listener = None;
    }

    pub async fn dispatch(&mut self, command: BridgeCommand) {
        match command {
            BridgeCommand::Speak(request) => {
                let callback = request.callback.clone();
                self.speak(request, &callback).await;
            }
            BridgeCommand::Pause { callback } => self.pause(&callback).await,
            BridgeCommand::Resume { callback } => self.resume(&callback).await,
            BridgeCommand::Stop { callback } => self.stop(&callback).await,
        }
    }

    /// Wait for the next engine event. `None` once the engine is gone.
    pub async fn next_event(&mut self) -> Option<EngineEvent> {
        self.events.recv().await
    }

    /// Apply every event the engine has already raised, so that commands
    /// see the state and callbacks those events belong to.
    fn apply_pending_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
        }
    }

    pub fn handle_event(&mut self, event: EngineEvent) {
        let (status, state, callback) = match event {
            EngineEvent::Started => (SpeakStatus::Start, SessionState::Speaking, &self.complete_callback),
            EngineEvent::Finished => (SpeakStatus::Done, SessionState::Idle, &self.complete_callback),
            EngineEvent::Paused => (SpeakStatus::Pause, SessionState::Paused, &self.active_callback),
            EngineEvent::Continued => (SpeakStatus::Resume, SessionState::Speaking, &self.active_callback),
            EngineEvent::Cancelled => (SpeakStatus::Stop, SessionState::Idle, &self.active_callback),
        };
        let callback = callback.clone();
        if matches!(
            event,
            EngineEvent::Started | EngineEvent::Finished | EngineEvent::Cancelled
        ) {
            self.starting = false;
        }
        log::debug!("Engine {:?}: {:?} -> {:?}", event, self.state, state);
        self.state = state;
        self.emit(&callback, status);
    }

    fn emit(&mut self, callback: &str, status: SpeakStatus) {
        let utterance_id = self.current.as_ref().map(|r| r.id.as_str()).unwrap_or("");
        match self.listener.as_mut() {
            Some(listener) => listener.on_speak_status(utterance_id, callback, status),
            None => log::debug!("No status listener; dropping {status} for '{utterance_id}'"),
        }
    }
}
