//! Bridge between web content and the platform text‑to‑speech engine.
//!
//! Web content posts JSON commands (see [`bridge`]); a [`SpeechSession`]
//! checks the [`MuteGate`], drives a [`SpeechEngine`] and reports every
//! lifecycle change back as a [`SpeakStatus`] to a single listener, which
//! in the host turns them into scripts for the page.

pub mod bridge;
pub mod config;
pub mod engine;
pub mod mute_gate;
pub mod session;
pub mod status;
pub mod tts_engine;

pub use bridge::{BridgeCommand, ScriptBridge};
pub use config::BridgeConfig;
pub use engine::{EngineEvent, SpeechEngine, Utterance};
pub use mute_gate::{MuteGate, NeverMuted, ToneProbe};
pub use session::{SessionConfig, SessionState, SpeechSession, StatusListener, UtteranceRequest};
pub use status::SpeakStatus;
pub use tts_engine::TtsEngine;
