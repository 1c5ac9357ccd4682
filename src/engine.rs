//! The speech engine capability as seen by the session.
//!
//! An engine speaks one [`Utterance`] at a time and reports what happened
//! to it through a single‑consumer channel of [`EngineEvent`]s. The
//! session takes that channel once, when it is constructed, and decides
//! everything else from the events it receives rather than by querying
//! the engine.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;

/// Lifecycle events raised by the engine for the utterance in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    Started,
    Finished,
    Paused,
    Continued,
    Cancelled,
}

/// What the engine is asked to speak.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub text: String,
    /// Speaking rate on a `0.0..=1.0` scale where `0.5` is normal.
    pub rate: f32,
    /// Pitch multiplier on a `0.5..=2.0` scale where `1.0` is normal.
    pub pitch: f32,
    /// Voice locale such as `ko-KR`. Empty means the engine default.
    pub locale: String,
}

#[async_trait]
pub trait SpeechEngine: Send {
    /// Hand out the event stream. Only the first call returns `Some`.
    fn take_events(&mut self) -> Option<UnboundedReceiver<EngineEvent>>;

    /// Begin speaking. Completion is reported through the event stream.
    async fn speak(&mut self, utterance: Utterance) -> Result<()>;

    /// Pause immediately. Doing nothing when idle is fine.
    async fn pause(&mut self) -> Result<()>;

    async fn resume(&mut self) -> Result<()>;

    /// Stop immediately. The engine reports [`EngineEvent::Cancelled`] if
    /// something was actually stopped.
    async fn stop(&mut self) -> Result<()>;
}
