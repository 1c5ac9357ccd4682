//! JSON plumbing between web content and the speech session.
//!
//! Inbound, web content posts one JSON object per message:
//!
//! ```text
//! { "request": "postSpeak", "action": "start", "callback": "onSpeak",
//!   "parameter": { "speakId": "a1", "speakText": "hello",
//!                  "speechRate": 0.5, "pitch": 1.0 } }
//! ```
//!
//! Fields are read leniently: anything missing or of the wrong type takes
//! its default. Only `postSpeak` requests are understood; everything else
//! is ignored.
//!
//! Outbound, each status becomes a script that calls the page's callback
//! with the JSON payload as a single‑quoted string argument.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use crate::session::{StatusListener, UtteranceRequest, DEFAULT_PITCH, DEFAULT_SPEECH_RATE};
use crate::status::SpeakStatus;

const SPEAK_REQUEST: &str = "postSpeak";

/// A message from web content the session knows how to handle.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeCommand {
    Speak(UtteranceRequest),
    Pause { callback: String },
    Resume { callback: String },
    Stop { callback: String },
}

fn str_field(value: Option<&Value>, key: &str) -> String {
    value
        .and_then(|v| v.get(key))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn float_field(value: Option<&Value>, key: &str, default: f32) -> f32 {
    value
        .and_then(|v| v.get(key))
        .and_then(|v| v.as_f64())
        .map(|v| v as f32)
        .unwrap_or(default)
}

/// Parse one message body. Malformed JSON is an error; a well‑formed
/// message the bridge does not understand is `Ok(None)`.
pub fn parse_message(body: &str) -> Result<Option<BridgeCommand>> {
    let json: Value = serde_json::from_str(body).context("malformed bridge message")?;
    if !json.is_object() {
        return Ok(None);
    }
    let message = Some(&json);
    if str_field(message, "request") != SPEAK_REQUEST {
        return Ok(None);
    }
    let callback = str_field(message, "callback");
    let params = json.get("parameter");

    let command = match str_field(message, "action").as_str() {
        "start" => {
            let request = UtteranceRequest::new(
                str_field(params, "speakId"),
                str_field(params, "speakText"),
                callback,
            )
            .with_rate(float_field(params, "speechRate", DEFAULT_SPEECH_RATE))
            .with_pitch(float_field(params, "pitch", DEFAULT_PITCH));
            BridgeCommand::Speak(request)
        }
        "pause" => BridgeCommand::Pause { callback },
        "resume" => BridgeCommand::Resume { callback },
        "stop" => BridgeCommand::Stop { callback },
        _ => return Ok(None),
    };
    Ok(Some(command))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusPayload<'a> {
    speak_id: &'a str,
    speak_status: SpeakStatus,
}

/// Escape text for use inside a single‑quoted JavaScript string literal.
fn escape_js_single_quoted(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            _ => out.push(ch),
        }
    }
    out
}

/// Script that hands `status` for `utterance_id` to the page function
/// named `callback`.
pub fn render_status_script(callback: &str, utterance_id: &str, status: SpeakStatus) -> Result<String> {
    let payload = serde_json::to_string(&StatusPayload {
        speak_id: utterance_id,
        speak_status: status,
    })
    .context("failed to encode speak status")?;
    Ok(format!(
        "(function(){{{}('{}');}})();",
        callback,
        escape_js_single_quoted(&payload)
    ))
}

/// Status listener that renders scripts and queues them for the host to
/// evaluate. Evaluation happens wherever the receiver is drained, which
/// keeps it on the host's own task.
pub struct ScriptBridge {
    scripts: UnboundedSender<String>,
}

impl ScriptBridge {
    pub fn new(scripts: UnboundedSender<String>) -> Self {
        Self { scripts }
    }
}

impl StatusListener for ScriptBridge {
    fn on_speak_status(&mut self, utterance_id: &str, callback: &str, status: SpeakStatus) {
        if callback.is_empty() {
            log::debug!("No callback for {status} on '{utterance_id}'; not notifying the page");
            return;
        }
        let script = match render_status_script(callback, utterance_id, status) {
            Ok(script) => script,
            Err(e) => {
                log::error!("Dropping status notification: {e:#}");
                return;
            }
        };
        if self.scripts.send(script).is_err() {
            log::warn!("Script channel closed; dropping {status} for '{utterance_id}'");
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    #[test]
    fn parses_start_with_parameters() {
        let body = r#"{"request":"postSpeak","action":"start","callback":"onSpeak",
            "parameter":{"speakId":"a1","speakText":"hello","speechRate":0.7,"pitch":1.5}}"#;
        let command = parse_message(body).unwrap();
        assert_eq!(
            command,
            Some(BridgeCommand::Speak(
                UtteranceRequest::new("a1", "hello", "onSpeak")
                    .with_rate(0.7)
                    .with_pitch(1.5)
            ))
        );
    }

    #[test]
    fn missing_or_mistyped_parameters_take_defaults() {
        let body = r#"{"request":"postSpeak","action":"start","callback":"cb",
            "parameter":{"speakId":42,"speechRate":"fast"}}"#;
        let Some(BridgeCommand::Speak(request)) = parse_message(body).unwrap() else {
            panic!("expected a speak command");
        };
        assert_eq!(request.id, "");
        assert_eq!(request.text, "");
        assert_eq!(request.rate, 0.5);
        assert_eq!(request.pitch, 1.0);

        let body = r#"{"request":"postSpeak","action":"start"}"#;
        assert_eq!(
            parse_message(body).unwrap(),
            Some(BridgeCommand::Speak(UtteranceRequest::new("", "", "")))
        );
    }

    #[test]
    fn parses_control_actions() {
        let control = |action: &str| {
            let body = format!(r#"{{"request":"postSpeak","action":"{action}","callback":"cb"}}"#);
            parse_message(&body).unwrap()
        };
        let callback = "cb".to_string();
        assert_eq!(control("pause"), Some(BridgeCommand::Pause { callback: callback.clone() }));
        assert_eq!(control("resume"), Some(BridgeCommand::Resume { callback: callback.clone() }));
        assert_eq!(control("stop"), Some(BridgeCommand::Stop { callback }));
    }

    #[test]
    fn unknown_requests_and_actions_are_ignored() {
        assert_eq!(parse_message(r#"{"request":"postVibrate","action":"start"}"#).unwrap(), None);
        assert_eq!(parse_message(r#"{"request":"postSpeak","action":"rewind"}"#).unwrap(), None);
        assert_eq!(parse_message(r#"["postSpeak"]"#).unwrap(), None);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(parse_message("{\"request\": ").is_err());
    }

    #[test]
    fn renders_callback_script() {
        let script = render_status_script("onSpeak", "a1", SpeakStatus::Start).unwrap();
        assert_eq!(
            script,
            r#"(function(){onSpeak('{\"speakId\":\"a1\",\"speakStatus\":1}');})();"#
        );
    }

    #[test]
    fn escapes_quotes_and_backslashes_in_ids() {
        let script = render_status_script("cb", "it's \"x\"", SpeakStatus::Muted).unwrap();
        assert_eq!(
            script,
            r#"(function(){cb('{\"speakId\":\"it\'s \\\"x\\\"\",\"speakStatus\":-200}');})();"#
        );
    }

    #[test]
    fn script_bridge_queues_rendered_scripts() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut bridge = ScriptBridge::new(tx);
        bridge.on_speak_status("a1", "onSpeak", SpeakStatus::Done);
        bridge.on_speak_status("a1", "", SpeakStatus::Stop);

        assert_eq!(
            rx.try_recv().unwrap(),
            r#"(function(){onSpeak('{\"speakId\":\"a1\",\"speakStatus\":5}');})();"#
        );
        assert!(rx.try_recv().is_err());
    }
}
