//! CPAL-backed realtime renderer.
//!
//! `cpal::Stream` is not `Send`, so the stream lives on an `audio-output`
//! thread that owns it for its whole life and takes play/pause commands
//! over a channel. The device callback calls the player's pull callback
//! directly; it never blocks on anything but the callback mutex.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::AudioError;
use crate::renderer::{fill_period, AudioRenderer, Gain, PullCallback, RendererOptions};

enum Command {
    Play(Sender<Result<(), AudioError>>),
    Pause(Sender<Result<(), AudioError>>),
    Close,
}

/// Renderer on the system audio output.
pub struct CpalAudioRenderer {
    options: Option<RendererOptions>,
    callback: Arc<Mutex<Option<PullCallback>>>,
    gain: Gain,
    /// Device latency in frames, measured from callback timestamps.
    latency: Arc<AtomicUsize>,
    commands: Option<Sender<Command>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Default for CpalAudioRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl CpalAudioRenderer {
    pub fn new() -> Self {
        Self {
            options: None,
            callback: Arc::new(Mutex::new(None)),
            gain: Gain::default(),
            latency: Arc::new(AtomicUsize::new(0)),
            commands: None,
            thread: None,
        }
    }

    /// Names of the output devices on the default host.
    pub fn device_names() -> Vec<String> {
        let host = cpal::default_host();
        match host.output_devices() {
            Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
            Err(e) => {
                warn!(error = %e, "Cannot enumerate audio output devices");
                Vec::new()
            }
        }
    }

    fn command(&self, make: fn(Sender<Result<(), AudioError>>) -> Command) -> Result<(), AudioError> {
        let tx = self.commands.as_ref().ok_or(AudioError::NotOpen)?;
        let (reply_tx, reply_rx) = bounded(1);
        tx.send(make(reply_tx))
            .map_err(|_| AudioError::StreamControl("audio output thread exited".into()))?;
        reply_rx
            .recv()
            .map_err(|_| AudioError::StreamControl("audio output thread exited".into()))?
    }

    fn close(&mut self) {
        if let Some(tx) = self.commands.take() {
            let _ = tx.send(Command::Close);
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("Audio output thread panicked");
            }
        }
    }
}

fn find_device(device_id: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    match device_id {
        None => host
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceNotFound("default".into())),
        Some(id) => host
            .output_devices()
            .map_err(|e| AudioError::DeviceNotFound(format!("{id}: {e}")))?
            .find(|d| d.name().map(|n| n == id).unwrap_or(false))
            .ok_or_else(|| AudioError::DeviceNotFound(id.to_string())),
    }
}

fn output_main(
    device_id: Option<String>,
    options: RendererOptions,
    callback: Arc<Mutex<Option<PullCallback>>>,
    gain: Gain,
    latency: Arc<AtomicUsize>,
    ready: Sender<Result<(), AudioError>>,
    commands: Receiver<Command>,
) {
    let built = find_device(device_id.as_deref()).and_then(|device| {
        info!(
            device = device
                .name()
                .unwrap_or_else(|_| "unknown".to_string())
                .as_str(),
            "Using audio output device"
        );
        let config = StreamConfig {
            channels: options.channels,
            sample_rate: SampleRate(options.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(options.period_frames as u32),
        };
        let channels = options.channels as usize;
        let rate = options.sample_rate as f64;
        device
            .build_output_stream(
                &config,
                move |data: &mut [f32], info: &cpal::OutputCallbackInfo| {
                    let ts = info.timestamp();
                    let ahead = ts.playback.duration_since(&ts.callback).unwrap_or_default();
                    latency.store((ahead.as_secs_f64() * rate) as usize, Ordering::Relaxed);

                    let mut cb = callback.lock();
                    match cb.as_mut() {
                        Some(cb) => {
                            fill_period(cb, data, channels, Instant::now() + ahead, &gain);
                        }
                        None => data.fill(0.0),
                    }
                },
                move |err| {
                    error!(error = %err, "Audio output stream error");
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuild(format!("{e}")))
    });

    let stream = match built {
        Ok(stream) => {
            let _ = ready.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    debug!(
        sample_rate = options.sample_rate,
        channels = options.channels,
        "Audio output stream built"
    );

    for command in commands.iter() {
        match command {
            Command::Play(reply) => {
                let _ = reply.send(
                    stream
                        .play()
                        .map_err(|e| AudioError::StreamControl(format!("{e}"))),
                );
            }
            Command::Pause(reply) => {
                let _ = reply.send(
                    stream
                        .pause()
                        .map_err(|e| AudioError::StreamControl(format!("{e}"))),
                );
            }
            Command::Close => break,
        }
    }
    debug!("Audio output stream closed");
}

impl AudioRenderer for CpalAudioRenderer {
    fn open(
        &mut self,
        device_id: Option<&str>,
        options: &RendererOptions,
    ) -> Result<(), AudioError> {
        options.validate()?;
        self.close();

        let (cmd_tx, cmd_rx) = bounded(4);
        let (ready_tx, ready_rx) = bounded(1);
        let device_id = device_id.map(str::to_string);
        let opts = options.clone();
        let callback = Arc::clone(&self.callback);
        let gain = self.gain.clone();
        let latency = Arc::clone(&self.latency);
        let handle = thread::Builder::new()
            .name("audio-output".into())
            .spawn(move || {
                output_main(device_id, opts, callback, gain, latency, ready_tx, cmd_rx)
            })?;

        let opened = ready_rx
            .recv()
            .map_err(|_| AudioError::StreamBuild("audio output thread exited".into()))
            .and_then(|r| r);
        if let Err(e) = opened {
            let _ = handle.join();
            return Err(e);
        }
        self.commands = Some(cmd_tx);
        self.thread = Some(handle);
        self.options = Some(options.clone());
        Ok(())
    }

    fn options(&self) -> Option<RendererOptions> {
        self.options.clone()
    }

    fn set_callback(&mut self, callback: PullCallback) {
        *self.callback.lock() = Some(callback);
    }

    fn start(&mut self) -> Result<(), AudioError> {
        self.command(Command::Play)?;
        debug!("Audio output playing");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.command(Command::Pause)?;
        debug!("Audio output paused");
        Ok(())
    }

    fn reset(&mut self) {
        self.latency.store(0, Ordering::Relaxed);
    }

    fn volume(&self) -> f32 {
        self.gain.volume()
    }

    fn set_volume(&mut self, volume: f32) {
        self.gain.set_volume(volume);
    }

    fn mute(&self) -> bool {
        self.gain.muted()
    }

    fn set_mute(&mut self, mute: bool) {
        self.gain.set_muted(mute);
    }

    fn buffer_size(&self) -> usize {
        self.latency.load(Ordering::Relaxed)
    }
}

impl Drop for CpalAudioRenderer {
    fn drop(&mut self) {
        self.close();
    }
}

// Opening a stream needs a real device, so only the pieces that do not are
// covered here.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unopened_renderer_refuses_control() {
        let mut r = CpalAudioRenderer::new();
        assert!(matches!(r.start(), Err(AudioError::NotOpen)));
        assert!(matches!(r.stop(), Err(AudioError::NotOpen)));
        assert_eq!(r.buffer_size(), 0);
    }

    #[test]
    fn invalid_options_fail_before_touching_the_device() {
        let mut r = CpalAudioRenderer::new();
        let bad = RendererOptions {
            sample_rate: 0,
            ..RendererOptions::default()
        };
        assert!(matches!(r.open(None, &bad), Err(AudioError::InvalidConfig(_))));
    }
}
