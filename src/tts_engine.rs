//! [`SpeechEngine`] implementation built on top of the [`tts`] crate.
//!
//! The [`tts`] crate delegates synthesis to the underlying operating
//! system (Speech Dispatcher on Linux, SAPI on Windows, AVFoundation on
//! macOS). Its utterance begin/end/stop callbacks are turned into
//! [`EngineEvent`]s on the engine's event channel.
//!
//! None of the backends can pause in the middle of an utterance. A pause
//! therefore stops the backend while swallowing the stop callback and
//! keeps the utterance around; resuming speaks it again from the
//! beginning while swallowing the begin callback.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tts::{Tts, UtteranceId};

use crate::engine::{EngineEvent, SpeechEngine, Utterance};

/// Caller‑side speaking rate: `0.5` is the backend's normal rate.
const RATE_SCALE: Scale = Scale {
    min: 0.0,
    normal: 0.5,
    max: 1.0,
};

/// Caller‑side pitch multiplier: `1.0` is the backend's normal pitch.
const PITCH_SCALE: Scale = Scale {
    min: 0.5,
    normal: 1.0,
    max: 2.0,
};

/// A value range with a distinguished normal point. Values are mapped
/// between scales piecewise‑linearly so that normal always maps to normal,
/// whatever the backend's range looks like.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Scale {
    min: f32,
    normal: f32,
    max: f32,
}

impl Scale {
    fn map_onto(self, value: f32, target: Scale) -> f32 {
        if !value.is_finite() {
            return target.normal;
        }
        let value = value.clamp(self.min, self.max);
        if value <= self.normal {
            let span = self.normal - self.min;
            if span <= 0.0 {
                return target.normal;
            }
            target.min + (value - self.min) / span * (target.normal - target.min)
        } else {
            let span = self.max - self.normal;
            target.normal + (value - self.normal) / span * (target.max - target.normal)
        }
    }
}

/// Pick the voice whose language best matches `locale`: an exact tag match
/// (`ko-KR`) wins over a primary language match (`ko`).
fn best_locale_match(languages: &[String], locale: &str) -> Option<usize> {
    let target = locale.trim().to_lowercase().replace('_', "-");
    if target.is_empty() {
        return None;
    }
    let primary = target.split('-').next().unwrap_or_default();
    let normalised: Vec<String> = languages
        .iter()
        .map(|l| l.to_lowercase().replace('_', "-"))
        .collect();
    normalised
        .iter()
        .position(|l| *l == target)
        .or_else(|| {
            normalised
                .iter()
                .position(|l| l.split('-').next() == Some(primary))
        })
}

/// Bookkeeping shared with the backend callbacks, which may fire on a
/// thread owned by the platform. Every transition is a plain method that
/// reports the event to raise, if any; the engine only does the backend
/// calls around them.
#[derive(Debug, Default)]
struct Playback {
    /// Utterance currently handed to the backend.
    speaking: Option<Utterance>,
    /// Utterance held back by a pause.
    paused: Option<Utterance>,
    suppress_begin: bool,
    /// Stop callbacks still owed by pauses. The backend reports a stop
    /// some time after `tts.stop()`, possibly after a resume.
    suppressed_stops: u32,
}

/// What `stop` has to do once the bookkeeping is updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopAction {
    /// Nothing was speaking or paused.
    Ignore,
    /// A paused utterance was dropped; no backend call needed.
    Emit(EngineEvent),
    /// Stop the backend. Raise the event afterwards only when the backend
    /// will not report the stop itself.
    StopBackend(Option<EngineEvent>),
}

impl Playback {
    fn start(&mut self, utterance: Utterance) {
        self.paused = None;
        self.suppress_begin = false;
        self.speaking = Some(utterance);
    }

    /// The backend accepted the utterance. Without callbacks a fresh start
    /// has to be announced here; a resumed one is announced as `Continued`.
    fn accepted(&self, resumed: bool, callbacks: bool) -> Option<EngineEvent> {
        if resumed {
            Some(EngineEvent::Continued)
        } else if !callbacks {
            Some(EngineEvent::Started)
        } else {
            None
        }
    }

    /// The backend refused the utterance. A refused resume loses the
    /// paused utterance, so the session is told it was cancelled.
    fn rejected(&mut self, resumed: bool) -> Option<EngineEvent> {
        self.speaking = None;
        self.suppress_begin = false;
        resumed.then_some(EngineEvent::Cancelled)
    }

    /// `None` when nothing is speaking; otherwise the backend must be
    /// stopped and `Paused` raised.
    fn pause(&mut self, callbacks: bool) -> Option<EngineEvent> {
        let utterance = self.speaking.take()?;
        if callbacks {
            self.suppressed_stops += 1;
        }
        self.paused = Some(utterance);
        Some(EngineEvent::Paused)
    }

    /// The utterance to speak again, if one is paused.
    fn resume(&mut self, callbacks: bool) -> Option<Utterance> {
        let utterance = self.paused.take()?;
        self.suppress_begin = callbacks;
        self.speaking = Some(utterance.clone());
        Some(utterance)
    }

    fn stop(&mut self, callbacks: bool) -> StopAction {
        if self.paused.take().is_some() {
            return StopAction::Emit(EngineEvent::Cancelled);
        }
        if self.speaking.is_none() {
            return StopAction::Ignore;
        }
        if callbacks {
            StopAction::StopBackend(None)
        } else {
            self.speaking = None;
            StopAction::StopBackend(Some(EngineEvent::Cancelled))
        }
    }

    fn backend_began(&mut self) -> Option<EngineEvent> {
        if std::mem::take(&mut self.suppress_begin) {
            None
        } else {
            Some(EngineEvent::Started)
        }
    }

    fn backend_ended(&mut self) -> EngineEvent {
        self.speaking = None;
        EngineEvent::Finished
    }

    fn backend_stopped(&mut self) -> Option<EngineEvent> {
        if self.suppressed_stops > 0 {
            self.suppressed_stops -= 1;
            return None;
        }
        self.speaking = None;
        Some(EngineEvent::Cancelled)
    }
}

fn lock(playback: &Mutex<Playback>) -> MutexGuard<'_, Playback> {
    playback.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct TtsEngine {
    tts: Tts,
    events: Option<UnboundedReceiver<EngineEvent>>,
    sender: UnboundedSender<EngineEvent>,
    playback: Arc<Mutex<Playback>>,
    /// Whether the backend reports utterance begin/end/stop. Without them
    /// the engine raises `Started` and `Cancelled` itself.
    callbacks: bool,
    rate_supported: bool,
    pitch_supported: bool,
    voice_supported: bool,
    /// A voice was picked by name; locales no longer change it.
    fixed_voice: bool,
    /// Locale the current voice was selected for.
    voice_locale: Option<String>,
}

impl TtsEngine {
    /// Create a new TTS engine. Internally this initialises the system
    /// speech synthesis backend. If no backend is available on the host
    /// platform this will return an error. When `voice_name` is given the
    /// matching voice is used for every utterance regardless of locale.
    pub fn new(voice_name: Option<&str>) -> Result<Self> {
        let tts = Tts::default().context("failed to initialise text‑to‑speech engine")?;
        let features = tts.supported_features();
        let (sender, events) = mpsc::unbounded_channel();
        let playback = Arc::new(Mutex::new(Playback::default()));

        if features.utterance_callbacks {
            install_callbacks(&tts, &sender, &playback)?;
        } else {
            log::warn!("TTS backend has no utterance callbacks; speech completion will not be reported");
        }

        let mut engine = Self {
            tts,
            events: Some(events),
            sender,
            playback,
            callbacks: features.utterance_callbacks,
            rate_supported: features.rate,
            pitch_supported: features.pitch,
            voice_supported: features.voice,
            fixed_voice: false,
            voice_locale: None,
        };

        if let Some(name) = voice_name {
            match engine.set_voice_by_name(name) {
                Ok(_) => {
                    log::info!("Using voice: {}", name);
                    engine.fixed_voice = true;
                }
                Err(e) => log::warn!(
                    "Failed to set voice '{}': {e}. Falling back to locale selection.",
                    name
                ),
            }
        }
        Ok(engine)
    }

    /// Choose a voice by name. The supplied name is matched case
    /// insensitively against the available voices. If a matching voice
    /// cannot be found the previous voice remains active and an error is
    /// returned.
    pub fn set_voice_by_name(&mut self, name: &str) -> Result<()> {
        let available = self.tts.voices().context("failed to enumerate voices")?;
        let target = name.to_lowercase();
        for voice in available {
            if voice.name().to_lowercase().contains(&target) {
                self.tts
                    .set_voice(&voice)
                    .context("failed to set TTS voice")?;
                return Ok(());
            }
        }
        Err(anyhow!(format!("no voice matching '{name}' found")))
    }

    fn set_voice_by_locale(&mut self, locale: &str) -> Result<()> {
        let available = self.tts.voices().context("failed to enumerate voices")?;
        let languages: Vec<String> = available.iter().map(|v| v.language().to_string()).collect();
        let index = best_locale_match(&languages, locale)
            .ok_or_else(|| anyhow!(format!("no voice for locale '{locale}' found")))?;
        self.tts
            .set_voice(&available[index])
            .context("failed to set TTS voice")?;
        log::debug!("Voice '{}' selected for locale {}", available[index].name(), locale);
        Ok(())
    }

    /// Switch voices only when the locale changes, so the voice list is not
    /// enumerated for every utterance.
    fn apply_locale(&mut self, locale: &str) {
        if self.fixed_voice || !self.voice_supported || locale.is_empty() {
            return;
        }
        if self.voice_locale.as_deref() == Some(locale) {
            return;
        }
        if let Err(e) = self.set_voice_by_locale(locale) {
            log::warn!("{e}. Keeping the current voice.");
        }
        self.voice_locale = Some(locale.to_string());
    }

    fn backend_rate(&self, rate: f32) -> Option<f32> {
        self.rate_supported.then(|| {
            RATE_SCALE.map_onto(
                rate,
                Scale {
                    min: self.tts.min_rate(),
                    normal: self.tts.normal_rate(),
                    max: self.tts.max_rate(),
                },
            )
        })
    }

    fn backend_pitch(&self, pitch: f32) -> Option<f32> {
        self.pitch_supported.then(|| {
            PITCH_SCALE.map_onto(
                pitch,
                Scale {
                    min: self.tts.min_pitch(),
                    normal: self.tts.normal_pitch(),
                    max: self.tts.max_pitch(),
                },
            )
        })
    }

    /// Queue the utterance on the backend. The call to [`tts::Tts::speak`]
    /// blocks until the underlying OS has accepted the utterance, so it
    /// runs on a blocking thread to avoid stalling the Tokio executor.
    async fn start_backend(&mut self, utterance: Utterance) -> Result<()> {
        let rate = self.backend_rate(utterance.rate);
        let pitch = self.backend_pitch(utterance.pitch);
        let tts = self.tts.clone();
        let text = utterance.text;
        tokio::task::spawn_blocking(move || {
            let mut tts = tts;
            if let Some(rate) = rate {
                tts.set_rate(rate)
                    .map_err(|e| anyhow!(format!("Failed to set rate: {e:?}")))?;
            }
            if let Some(pitch) = pitch {
                tts.set_pitch(pitch)
                    .map_err(|e| anyhow!(format!("Failed to set pitch: {e:?}")))?;
            }
            tts.speak(&text, false)
                .map_err(|e| anyhow!(format!("TTS speak failed: {e:?}")))?;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .context("failed to join blocking TTS task")??;
        Ok(())
    }

    fn raise(&self, event: Option<EngineEvent>) {
        if let Some(event) = event {
            let _ = self.sender.send(event);
        }
    }

    fn stop_backend(&mut self) -> Result<()> {
        self.tts
            .stop()
            .map_err(|e| anyhow!(format!("Failed to stop TTS: {:?}", e)))?;
        Ok(())
    }
}

fn install_callbacks(
    tts: &Tts,
    sender: &UnboundedSender<EngineEvent>,
    playback: &Arc<Mutex<Playback>>,
) -> Result<()> {
    let (tx, shared) = (sender.clone(), Arc::clone(playback));
    tts.on_utterance_begin(Some(Box::new(move |_: UtteranceId| {
        if let Some(event) = lock(&shared).backend_began() {
            let _ = tx.send(event);
        }
    })))
    .map_err(|e| anyhow!(format!("failed to register utterance begin callback: {e:?}")))?;

    let (tx, shared) = (sender.clone(), Arc::clone(playback));
    tts.on_utterance_end(Some(Box::new(move |_: UtteranceId| {
        let event = lock(&shared).backend_ended();
        let _ = tx.send(event);
    })))
    .map_err(|e| anyhow!(format!("failed to register utterance end callback: {e:?}")))?;

    let (tx, shared) = (sender.clone(), Arc::clone(playback));
    tts.on_utterance_stop(Some(Box::new(move |_: UtteranceId| {
        if let Some(event) = lock(&shared).backend_stopped() {
            let _ = tx.send(event);
        }
    })))
    .map_err(|e| anyhow!(format!("failed to register utterance stop callback: {e:?}")))?;
    Ok(())
}

#[async_trait]
impl SpeechEngine for TtsEngine {
    fn take_events(&mut self) -> Option<UnboundedReceiver<EngineEvent>> {
        self.events.take()
    }

    async fn speak(&mut self, utterance: Utterance) -> Result<()> {
        self.apply_locale(&utterance.locale);
        lock(&self.playback).start(utterance.clone());
        if let Err(e) = self.start_backend(utterance).await {
            let event = lock(&self.playback).rejected(false);
            self.raise(event);
            return Err(e);
        }
        let event = lock(&self.playback).accepted(false, self.callbacks);
        self.raise(event);
        Ok(())
    }

    async fn pause(&mut self) -> Result<()> {
        let Some(event) = lock(&self.playback).pause(self.callbacks) else {
            log::debug!("Pause ignored: nothing is speaking");
            return Ok(());
        };
        self.stop_backend()?;
        self.raise(Some(event));
        Ok(())
    }

    async fn resume(&mut self) -> Result<()> {
        let Some(utterance) = lock(&self.playback).resume(self.callbacks) else {
            log::debug!("Resume ignored: nothing is paused");
            return Ok(());
        };
        if let Err(e) = self.start_backend(utterance).await {
            let event = lock(&self.playback).rejected(true);
            self.raise(event);
            return Err(e);
        }
        let event = lock(&self.playback).accepted(true, self.callbacks);
        self.raise(event);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        let action = lock(&self.playback).stop(self.callbacks);
        match action {
            StopAction::Ignore => log::debug!("Stop ignored: nothing is speaking"),
            StopAction::Emit(event) => self.raise(Some(event)),
            StopAction::StopBackend(event) => {
                self.stop_backend()?;
                self.raise(event);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BACKEND: Scale = Scale {
        min: 0.1,
        normal: 1.0,
        max: 10.0,
    };

    fn assert_close(actual: f32, expected: f32) {
        assert!((actual - expected).abs() < 1e-5, "got {actual}, expected {expected}");
    }

    #[test]
    fn normal_rate_maps_to_backend_normal() {
        assert_close(RATE_SCALE.map_onto(0.5, BACKEND), 1.0);
        assert_close(PITCH_SCALE.map_onto(1.0, BACKEND), 1.0);
    }

    #[test]
    fn extremes_map_to_backend_bounds() {
        assert_close(RATE_SCALE.map_onto(0.0, BACKEND), 0.1);
        assert_close(RATE_SCALE.map_onto(1.0, BACKEND), 10.0);
        assert_close(PITCH_SCALE.map_onto(0.5, BACKEND), 0.1);
        assert_close(PITCH_SCALE.map_onto(2.0, BACKEND), 10.0);
    }

    #[test]
    fn halves_are_mapped_independently() {
        assert_close(RATE_SCALE.map_onto(0.25, BACKEND), 0.55);
        assert_close(RATE_SCALE.map_onto(0.75, BACKEND), 5.5);
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        assert_close(RATE_SCALE.map_onto(-3.0, BACKEND), 0.1);
        assert_close(RATE_SCALE.map_onto(7.0, BACKEND), 10.0);
        assert_close(RATE_SCALE.map_onto(f32::NAN, BACKEND), 1.0);
    }

    #[test]
    fn exact_locale_beats_primary_language() {
        let languages = vec![
            "en-US".to_string(),
            "ko".to_string(),
            "ko-KR".to_string(),
        ];
        assert_eq!(best_locale_match(&languages, "ko-KR"), Some(2));
        assert_eq!(best_locale_match(&languages, "ko_kr"), Some(2));
    }

    #[test]
    fn primary_language_is_a_fallback() {
        let languages = vec!["en-US".to_string(), "ko-KR".to_string()];
        assert_eq!(best_locale_match(&languages, "ko"), Some(1));
        assert_eq!(best_locale_match(&languages, "en-GB"), Some(0));
        assert_eq!(best_locale_match(&languages, "ja-JP"), None);
        assert_eq!(best_locale_match(&languages, ""), None);
    }

    fn utterance(text: &str) -> Utterance {
        Utterance {
            text: text.to_string(),
            rate: 0.5,
            pitch: 1.0,
            locale: "ko-KR".to_string(),
        }
    }

    fn speaking(text: &str) -> Playback {
        let mut playback = Playback::default();
        playback.start(utterance(text));
        playback
    }

    #[test]
    fn fresh_start_is_announced_only_without_callbacks() {
        let playback = speaking("hello");
        assert_eq!(playback.accepted(false, true), None);
        assert_eq!(playback.accepted(false, false), Some(EngineEvent::Started));
    }

    #[test]
    fn resume_without_callbacks_reports_continued_not_started() {
        let mut playback = speaking("hello");
        assert_eq!(playback.pause(false), Some(EngineEvent::Paused));
        assert_eq!(playback.resume(false), Some(utterance("hello")));
        assert_eq!(playback.accepted(true, false), Some(EngineEvent::Continued));
    }

    #[test]
    fn pause_keeps_the_utterance_and_swallows_its_stop() {
        let mut playback = speaking("hello");
        assert_eq!(playback.pause(true), Some(EngineEvent::Paused));
        assert_eq!(playback.speaking, None);
        assert_eq!(playback.paused, Some(utterance("hello")));

        assert_eq!(playback.backend_stopped(), None);
        assert_eq!(playback.suppressed_stops, 0);
    }

    #[test]
    fn late_stop_after_quick_resume_is_still_swallowed() {
        let mut playback = speaking("hello");
        playback.pause(true);
        assert_eq!(playback.resume(true), Some(utterance("hello")));

        // The stop callback from the pause arrives after the resume.
        assert_eq!(playback.backend_stopped(), None);
        assert_eq!(playback.speaking, Some(utterance("hello")));
        // The re-spoken utterance's begin is hidden as well.
        assert_eq!(playback.backend_began(), None);
        assert_eq!(playback.backend_began(), Some(EngineEvent::Started));

        // A real stop afterwards is reported.
        assert_eq!(playback.stop(true), StopAction::StopBackend(None));
        assert_eq!(playback.backend_stopped(), Some(EngineEvent::Cancelled));
        assert_eq!(playback.speaking, None);
    }

    #[test]
    fn pause_and_resume_when_idle_do_nothing() {
        let mut playback = Playback::default();
        assert_eq!(playback.pause(true), None);
        assert_eq!(playback.resume(true), None);
        assert_eq!(playback.suppressed_stops, 0);
    }

    #[test]
    fn stop_while_paused_cancels_without_backend() {
        let mut playback = speaking("hello");
        playback.pause(true);
        assert_eq!(playback.stop(true), StopAction::Emit(EngineEvent::Cancelled));
        assert_eq!(playback.paused, None);
        assert_eq!(playback.resume(true), None);
    }

    #[test]
    fn stop_without_callbacks_raises_cancelled_itself() {
        let mut playback = speaking("hello");
        assert_eq!(
            playback.stop(false),
            StopAction::StopBackend(Some(EngineEvent::Cancelled))
        );
        assert_eq!(playback.speaking, None);
        assert_eq!(playback.stop(false), StopAction::Ignore);
    }

    #[test]
    fn finished_utterance_clears_speaking() {
        let mut playback = speaking("hello");
        assert_eq!(playback.backend_began(), Some(EngineEvent::Started));
        assert_eq!(playback.backend_ended(), EngineEvent::Finished);
        assert_eq!(playback.stop(true), StopAction::Ignore);
    }

    #[test]
    fn rejected_resume_is_reported_as_cancelled() {
        let mut playback = speaking("hello");
        playback.pause(true);
        playback.resume(true);
        assert_eq!(playback.rejected(true), Some(EngineEvent::Cancelled));
        assert_eq!(playback.speaking, None);
        assert!(!playback.suppress_begin);

        let mut playback = speaking("hello");
        assert_eq!(playback.rejected(false), None);
    }
}
