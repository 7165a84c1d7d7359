//! Generator → dispatcher → encoder → Matroska file.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use capline_common::{Consumer, DeviceType, EncoderConfig, MediaKind, Options, PipelineConfig, Rational};
use capline_decoder::{GeneratorConfig, GeneratorSource};
use capline_encoder::{Encoder, EOF_ALL, EOF_VIDEO};
use capline_gpu_hal::{DeviceRegistry, StaticProbe};
use capline_pipeline::Dispatcher;

fn short_clip() -> GeneratorConfig {
    GeneratorConfig {
        width: 16,
        height: 8,
        frame_rate: Rational::new(10, 1),
        sample_rate: 8000,
        channels: 1,
        audio_block_sizes: vec![160],
        duration_ms: Some(500),
        ..GeneratorConfig::default()
    }
}

fn options(width: u32, height: u32) -> Options {
    [
        ("width", width.to_string()),
        ("height", height.to_string()),
        ("framerate", "10".to_string()),
        ("sample_rate", "8000".to_string()),
        ("channels", "1".to_string()),
        ("frame_size", "1024".to_string()),
        // generous so a slow machine never triggers stall repeats
        ("stall_timeout_ms", "10000".to_string()),
        ("title", "capline test".to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn temp_output(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("capline-{name}-{}.mkv", std::process::id()))
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn dispatcher_for(encoder: &Arc<Encoder>, config: PipelineConfig) -> Dispatcher {
    let mut dispatcher = Dispatcher::new(config);
    dispatcher
        .append(Arc::new(GeneratorSource::new(short_clip())))
        .unwrap();
    dispatcher
        .set_consumer(Arc::clone(encoder) as Arc<dyn Consumer>)
        .unwrap();
    dispatcher
}

#[test]
fn clip_is_encoded_to_completion() {
    let path = temp_output("e2e");
    let encoder = Arc::new(Encoder::new(EncoderConfig::default()));
    encoder
        .open(&path, Some("rawvideo"), Some("pcm_s16le"), true, &options(16, 8))
        .unwrap();

    let mut dispatcher = dispatcher_for(&encoder, PipelineConfig::default());
    dispatcher.start().unwrap();
    assert!(encoder.ready());
    wait_for("encoder eof", || encoder.eof());
    encoder.wait();

    let stats = encoder.stats();
    assert_eq!(stats.video_frames, 5);
    assert_eq!(stats.repeated_frames, 0);
    // 4000 samples in 160-sample blocks: three full 1024 blocks and a tail
    assert_eq!(stats.audio_samples, 4000);
    assert_eq!(stats.audio_blocks, 4);
    assert_eq!(stats.bytes_written, 5 * 16 * 8 * 4 + 4000 * 2);
    assert_eq!(encoder.eof_bits(), EOF_ALL);

    let mux = encoder.mux_stats().expect("trailer written");
    assert!(mux.duration_ms >= 490);
    dispatcher.stop();

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(&bytes[..4], &[0x1A, 0x45, 0xDF, 0xA3]);
    assert_eq!(bytes.len() as u64, mux.bytes_written);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn video_failure_leaves_audio_running() {
    let path = temp_output("isolation");
    let encoder = Arc::new(Encoder::new(EncoderConfig::default()));
    // the clip is 16x8, so every picture is rejected
    encoder
        .open(&path, Some("rawvideo"), Some("pcm_f32le"), true, &options(32, 32))
        .unwrap();

    let mut dispatcher = dispatcher_for(&encoder, PipelineConfig::default());
    dispatcher.start().unwrap();
    wait_for("encoder eof", || encoder.eof());
    encoder.wait();

    assert!(encoder.failed(MediaKind::Video));
    assert!(!encoder.failed(MediaKind::Audio));
    let stats = encoder.stats();
    assert_eq!(stats.video_frames, 0);
    assert_eq!(stats.audio_samples, 4000);
    dispatcher.stop();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn stop_mid_stream_still_writes_a_trailer() {
    let path = temp_output("stopped");
    let encoder = Arc::new(Encoder::new(EncoderConfig::default()));
    encoder
        .open(&path, None, Some("pcm_s16le"), true, &options(16, 8))
        .unwrap();
    assert_eq!(encoder.eof_bits(), EOF_VIDEO);

    let mut dispatcher = Dispatcher::new(PipelineConfig::default());
    dispatcher
        .append(Arc::new(GeneratorSource::new(GeneratorConfig {
            video: false,
            realtime: true,
            duration_ms: None,
            ..short_clip()
        })))
        .unwrap();
    dispatcher
        .set_consumer(Arc::clone(&encoder) as Arc<dyn Consumer>)
        .unwrap();
    dispatcher.start().unwrap();
    wait_for("some audio", || encoder.stats().audio_blocks > 0);

    dispatcher.stop();
    encoder.stop();
    assert!(!encoder.ready());
    assert!(encoder.mux_stats().is_some());
    let _ = std::fs::remove_file(&path);
}

#[test]
fn device_surfaces_bind_the_encoder() {
    let path = temp_output("hw");
    let registry = Arc::new(DeviceRegistry::new(StaticProbe::new([DeviceType::Vaapi])));
    let encoder = Arc::new(Encoder::new(EncoderConfig::default()));
    encoder.set_hardware(Arc::clone(&registry), DeviceType::Vaapi);
    encoder
        .open(&path, Some("rawvideo"), None, true, &options(16, 8))
        .unwrap();
    assert!(!encoder.hw_state().is_configured());

    let mut dispatcher = Dispatcher::new(PipelineConfig {
        hwaccel: Some(DeviceType::Vaapi),
        ..PipelineConfig::default()
    });
    dispatcher.set_registry(Arc::clone(&registry));
    dispatcher
        .append(Arc::new(GeneratorSource::new(GeneratorConfig {
            audio: false,
            ..short_clip()
        })))
        .unwrap();
    dispatcher
        .set_consumer(Arc::clone(&encoder) as Arc<dyn Consumer>)
        .unwrap();
    dispatcher.create_filter_graph("hwupload", "").unwrap();
    dispatcher.start().unwrap();
    wait_for("encoder eof", || encoder.eof());
    encoder.wait();

    let hw = encoder.hw_state();
    assert!(hw.is_configured());
    assert_eq!(hw.frames.unwrap().device, DeviceType::Vaapi);
    assert!(registry.frames_context(DeviceType::Vaapi).is_some());
    assert_eq!(encoder.stats().video_frames, 5);
    dispatcher.stop();
    let _ = std::fs::remove_file(&path);
}
