//! Runtime configuration read from environment variables.
//!
//! `.env` is loaded by `main` before this runs, so either source works:
//!
//!  * `SPEECH_LOCALE` (optional): voice locale for every utterance,
//!    `ko-KR` by default.
//!  * `VOICE_NAME` (optional): partial match for selecting a specific TTS
//!    voice. Takes precedence over the locale.
//!  * `MUTE_PROBE` (optional): `tone` (default) plays a reference tone and
//!    checks the output volume; `off` never reports muted.
//!  * `VOLUME_QUERY_TIMEOUT_MS` (optional): limit for the platform volume
//!    query, 2000 by default.
//!  * `REFERENCE_TONE_MS` (optional): length of the reference tone, 150 by
//!    default.

use std::env;
use std::time::Duration;

use crate::session::{SessionConfig, DEFAULT_LOCALE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuteProbeKind {
    Tone,
    Off,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub locale: String,
    pub voice_name: Option<String>,
    pub mute_probe: MuteProbeKind,
    pub volume_timeout: Duration,
    pub tone_duration: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            locale: DEFAULT_LOCALE.to_string(),
            voice_name: None,
            mute_probe: MuteProbeKind::Tone,
            volume_timeout: Duration::from_millis(2000),
            tone_duration: Duration::from_millis(150),
        }
    }
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    match lookup(key) {
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(ms) => Duration::from_millis(ms),
            Err(_) => {
                log::warn!("Ignoring {key}={raw}: expected milliseconds");
                default
            }
        },
        None => default,
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key/value source. Blank values count
    /// as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let mute_probe = match lookup("MUTE_PROBE").map(|v| v.trim().to_lowercase()) {
            None => defaults.mute_probe,
            Some(v) if v == "tone" => MuteProbeKind::Tone,
            Some(v) if v == "off" || v == "none" => MuteProbeKind::Off,
            Some(v) => {
                log::warn!("Unknown MUTE_PROBE '{v}', using the reference tone");
                defaults.mute_probe
            }
        };

        Self {
            locale: lookup("SPEECH_LOCALE")
                .map(|v| v.trim().to_string())
                .unwrap_or(defaults.locale),
            voice_name: lookup("VOICE_NAME"),
            mute_probe,
            volume_timeout: millis(&lookup, "VOLUME_QUERY_TIMEOUT_MS", defaults.volume_timeout),
            tone_duration: millis(&lookup, "REFERENCE_TONE_MS", defaults.tone_duration),
        }
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            locale: self.locale.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(pairs: &[(&str, &str)]) -> BridgeConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BridgeConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        assert_eq!(config(&[]), BridgeConfig::default());
        assert_eq!(BridgeConfig::default().session().locale, "ko-KR");
    }

    #[test]
    fn reads_every_setting() {
        let cfg = config(&[
            ("SPEECH_LOCALE", "en-US"),
            ("VOICE_NAME", "samantha"),
            ("MUTE_PROBE", "OFF"),
            ("VOLUME_QUERY_TIMEOUT_MS", "500"),
            ("REFERENCE_TONE_MS", "80"),
        ]);
        assert_eq!(cfg.locale, "en-US");
        assert_eq!(cfg.voice_name.as_deref(), Some("samantha"));
        assert_eq!(cfg.mute_probe, MuteProbeKind::Off);
        assert_eq!(cfg.volume_timeout, Duration::from_millis(500));
        assert_eq!(cfg.tone_duration, Duration::from_millis(80));
        assert_eq!(cfg.session().locale, "en-US");
    }

    #[test]
    fn bad_values_fall_back_to_defaults() {
        let cfg = config(&[
            ("MUTE_PROBE", "sonar"),
            ("VOLUME_QUERY_TIMEOUT_MS", "soon"),
            ("VOICE_NAME", "   "),
        ]);
        assert_eq!(cfg.mute_probe, MuteProbeKind::Tone);
        assert_eq!(cfg.volume_timeout, Duration::from_millis(2000));
        assert_eq!(cfg.voice_name, None);
    }
}
