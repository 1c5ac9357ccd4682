//! Silent‑mode detection performed before every utterance.
//!
//! The default [`ToneProbe`] plays a short reference tone on the default
//! output device using [`cpal`]. Once the output callback has rendered the
//! whole tone it asks the platform mixer for the current output volume.
//! Output counts as silenced only when that volume is exactly zero (a
//! muted sink reports zero as well).
//!
//! This is a heuristic. Anything that goes wrong along the way is logged
//! and reported as "not muted" so speech is still attempted. The one case
//! that does not resolve is an output stream that never finishes the tone;
//! the probe then waits forever, and so does the `speak` that asked for it.

use std::f32::consts::TAU;
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample};
use wait_timeout::ChildExt;

#[async_trait]
pub trait MuteGate: Send + Sync {
    /// `true` when system audio output appears to be silenced.
    async fn probe_silent_mode(&self) -> bool;
}

#[async_trait]
impl MuteGate for Box<dyn MuteGate> {
    async fn probe_silent_mode(&self) -> bool {
        (**self).probe_silent_mode().await
    }
}

/// Gate for hosts without a usable output device: never muted.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverMuted;

#[async_trait]
impl MuteGate for NeverMuted {
    async fn probe_silent_mode(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy)]
struct Tone {
    frequency: f32,
    amplitude: f32,
    duration: Duration,
}

#[derive(Debug, Clone)]
pub struct ToneProbe {
    tone: Tone,
    volume_timeout: Duration,
}

impl ToneProbe {
    pub fn new(tone_duration: Duration, volume_timeout: Duration) -> Self {
        Self {
            tone: Tone {
                frequency: 880.0,
                amplitude: 0.05,
                duration: tone_duration,
            },
            volume_timeout,
        }
    }

    fn probe_blocking(&self) -> bool {
        if let Err(e) = play_reference_tone(self.tone) {
            log::warn!("Reference tone failed: {e:#}");
        }
        match read_output_volume(self.volume_timeout) {
            Ok(Some(volume)) => {
                log::debug!("Output volume after reference tone: {volume}");
                volume == 0.0
            }
            Ok(None) => {
                log::debug!("Output volume unavailable on this platform; assuming audible");
                false
            }
            Err(e) => {
                log::warn!("Failed to read output volume: {e:#}");
                false
            }
        }
    }
}

#[async_trait]
impl MuteGate for ToneProbe {
    async fn probe_silent_mode(&self) -> bool {
        // cpal streams are not `Send`, so the whole probe lives on one
        // blocking thread.
        let probe = self.clone();
        match tokio::task::spawn_blocking(move || probe.probe_blocking()).await {
            Ok(muted) => muted,
            Err(e) => {
                log::error!("Mute probe task failed: {e}");
                false
            }
        }
    }
}

/// Play `tone` on the default output device and return once the output
/// callback has rendered all of it.
fn play_reference_tone(tone: Tone) -> Result<()> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| anyhow!("No output audio device found"))?;
    let config = device
        .default_output_config()
        .with_context(|| "Failed to get default output configuration")?;

    let (done_tx, done_rx) = mpsc::channel::<()>();
    let sample_format = config.sample_format();
    let config: cpal::StreamConfig = config.into();
    let stream = match sample_format {
        SampleFormat::F32 => build_tone_stream::<f32>(&device, &config, tone, done_tx)?,
        SampleFormat::I16 => build_tone_stream::<i16>(&device, &config, tone, done_tx)?,
        SampleFormat::U16 => build_tone_stream::<u16>(&device, &config, tone, done_tx)?,
        other => {
            return Err(anyhow!(format!("Unsupported sample format: {:?}", other)));
        }
    };
    stream
        .play()
        .with_context(|| "Failed to start audio output stream")?;

    // The sender lives in the output callback; if it never reports
    // completion this waits indefinitely.
    if done_rx.recv().is_err() {
        log::debug!("Output stream dropped before the reference tone completed");
    }
    drop(stream);
    Ok(())
}

fn build_tone_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    tone: Tone,
    done: mpsc::Sender<()>,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let sample_rate = config.sample_rate.0 as f32;
    let channels = frame_channels(config.channels)?;
    let total_frames = (sample_rate * tone.duration.as_secs_f32()) as usize;
    let mut rendered = 0usize;
    let mut done = Some(done);

    let err_fn = |err| {
        log::error!("An error occurred on the output audio stream: {}", err);
    };

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            for frame in data.chunks_mut(channels) {
                let value = if rendered < total_frames {
                    let t = rendered as f32 / sample_rate;
                    (t * tone.frequency * TAU).sin() * tone.amplitude
                } else {
                    0.0
                };
                for sample in frame.iter_mut() {
                    *sample = T::from_sample(value);
                }
                rendered += 1;
            }
            if rendered >= total_frames {
                if let Some(done) = done.take() {
                    let _ = done.send(());
                }
            }
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}

/// Samples per interleaved frame. A device reporting no channels cannot be
/// rendered to.
fn frame_channels(channels: u16) -> Result<usize> {
    if channels == 0 {
        return Err(anyhow!("output device reports zero channels"));
    }
    Ok(usize::from(channels))
}

/// Current output volume in `0.0..=1.0`, or `None` when the platform offers
/// no way to query it.
fn read_output_volume(timeout: Duration) -> Result<Option<f32>> {
    if cfg!(target_os = "linux") {
        let mute = run_with_timeout("pactl", &["get-sink-mute", "@DEFAULT_SINK@"], timeout)?;
        if parse_pactl_mute(&mute) {
            return Ok(Some(0.0));
        }
        let volume = run_with_timeout("pactl", &["get-sink-volume", "@DEFAULT_SINK@"], timeout)?;
        parse_pactl_volume(&volume)
            .map(Some)
            .ok_or_else(|| anyhow!(format!("unrecognised pactl output: {}", volume.trim())))
    } else if cfg!(target_os = "macos") {
        let muted = run_with_timeout(
            "osascript",
            &["-e", "output muted of (get volume settings)"],
            timeout,
        )?;
        if muted.trim().eq_ignore_ascii_case("true") {
            return Ok(Some(0.0));
        }
        let volume = run_with_timeout(
            "osascript",
            &["-e", "output volume of (get volume settings)"],
            timeout,
        )?;
        parse_osascript_volume(&volume)
            .map(Some)
            .ok_or_else(|| anyhow!(format!("unrecognised osascript output: {}", volume.trim())))
    } else {
        Ok(None)
    }
}

/// Run a short platform query and return its stdout, killing it if it
/// does not exit within `timeout`.
fn run_with_timeout(program: &str, args: &[&str], timeout: Duration) -> Result<String> {
    let mut child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("failed to spawn {program}"))?;
    match child
        .wait_timeout(timeout)
        .with_context(|| format!("failed to wait on {program}"))?
    {
        Some(status) => {
            let mut stdout = String::new();
            if let Some(mut out) = child.stdout.take() {
                out.read_to_string(&mut stdout)
                    .with_context(|| format!("failed to read {program} output"))?;
            }
            if !status.success() {
                let code = status.code().unwrap_or(-1);
                return Err(anyhow!(format!("{program} exited with {code}")));
            }
            Ok(stdout)
        }
        None => {
            let _ = child.kill();
            let _ = child.wait();
            Err(anyhow!(format!(
                "{program} timed out after {} ms",
                timeout.as_millis()
            )))
        }
    }
}

/// `Mute: yes` / `Mute: no`.
fn parse_pactl_mute(output: &str) -> bool {
    output
        .trim()
        .strip_prefix("Mute:")
        .map(|v| v.trim().eq_ignore_ascii_case("yes"))
        .unwrap_or(false)
}

/// `Volume: front-left: 65536 / 100% / 0.00 dB,   front-right: ...`
///
/// The loudest channel wins; a sink is only silent when every channel is.
fn parse_pactl_volume(output: &str) -> Option<f32> {
    let line = output.lines().find(|l| l.trim_start().starts_with("Volume:"))?;
    line.split('/')
        .filter_map(|part| part.trim().strip_suffix('%'))
        .filter_map(|pct| pct.trim().parse::<f32>().ok())
        .map(|pct| pct / 100.0)
        .reduce(f32::max)
}

/// A bare integer from `0` to `100`. `missing value` means no output device.
fn parse_osascript_volume(output: &str) -> Option<f32> {
    output.trim().parse::<f32>().ok().map(|v| v / 100.0)
}
