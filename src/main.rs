//! Host process for the speech bridge.
//!
//! Stands in for the web view: every line on stdin is one message body
//! posted by web content, and every line written to stdout is a script the
//! page should evaluate. Logs go to stderr (`RUST_LOG` controls the level).
//!
//! See [`speak_bridge::config`] for the environment variables understood.

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::signal;
use tokio::sync::mpsc;

use speak_bridge::bridge::{self, ScriptBridge};
use speak_bridge::config::{BridgeConfig, MuteProbeKind};
use speak_bridge::mute_gate::{MuteGate, NeverMuted, ToneProbe};
use speak_bridge::session::SpeechSession;
use speak_bridge::tts_engine::TtsEngine;

async fn evaluate(stdout: &mut Stdout, script: &str) {
    let line = format!("{script}\n");
    if let Err(e) = stdout.write_all(line.as_bytes()).await {
        log::error!("Failed to emit script: {e}");
        return;
    }
    stdout.flush().await.ok();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from `.env` if present.
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = BridgeConfig::from_env();
    log::debug!("Configuration: {:?}", config);

    let engine = TtsEngine::new(config.voice_name.as_deref())?;
    let gate: Box<dyn MuteGate> = match config.mute_probe {
        MuteProbeKind::Tone => Box::new(ToneProbe::new(config.tone_duration, config.volume_timeout)),
        MuteProbeKind::Off => Box::new(NeverMuted),
    };
    let mut session = SpeechSession::new(engine, gate, config.session())?;

    let (script_tx, mut scripts) = mpsc::unbounded_channel::<String>();
    session.set_status_listener(ScriptBridge::new(script_tx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    log::info!("Speech bridge ready (locale {}).", config.locale);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(body)) => {
                    let body = body.trim();
                    if body.is_empty() {
                        continue;
                    }
                    match bridge::parse_message(body) {
                        Ok(Some(command)) => session.dispatch(command).await,
                        Ok(None) => log::debug!("Ignoring bridge message: {}", body),
                        Err(e) => log::warn!("{e:#}: {}", body),
                    }
                }
                Ok(None) => {
                    log::info!("Bridge input closed, shutting down");
                    break;
                }
                Err(e) => {
                    log::error!("Failed to read bridge input: {e}");
                    break;
                }
            },
            Some(event) = session.next_event() => session.handle_event(event),
            Some(script) = scripts.recv() => evaluate(&mut stdout, &script).await,
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl-C, shutting down");
                break;
            }
        }
    }

    session.destroy().await;
    while let Ok(script) = scripts.try_recv() {
        evaluate(&mut stdout, &script).await;
    }
    Ok(())
}
