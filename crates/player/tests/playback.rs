//! Generator → player, with the headless renderers.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use capline_audio::NullAudioRenderer;
use capline_common::Rational;
use capline_decoder::{GeneratorConfig, GeneratorSource};
use capline_player::{NullVideoRenderer, Player, PlayerError, PlayerOptions, PlayerState, PresentLog};

fn clip(duration_ms: u64) -> GeneratorConfig {
    GeneratorConfig {
        width: 16,
        height: 8,
        frame_rate: Rational::new(25, 1),
        sample_rate: 8000,
        channels: 1,
        audio_block_sizes: vec![200],
        duration_ms: Some(duration_ms),
        ..GeneratorConfig::default()
    }
}

fn open(config: GeneratorConfig) -> (Player, PresentLog) {
    let video = NullVideoRenderer::new();
    let log = video.log();
    let player = Player::with_renderers(
        Arc::new(GeneratorSource::new(config)),
        PlayerOptions {
            period_frames: 256,
            ..PlayerOptions::default()
        },
        Box::new(NullAudioRenderer::clocked()),
        Box::new(video),
    )
    .unwrap();
    (player, log)
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Within two 25 fps frames of `target_us`. The clock anchors on whatever
/// frame the source lands on, which need not be exactly the target.
fn near(position_us: Option<i64>, target_us: i64) -> bool {
    position_us.is_some_and(|us| (us - target_us).abs() <= 80_000)
}

fn last_pts(log: &PresentLog) -> Option<i64> {
    log.pts().last().copied()
}

#[test]
fn completion_pauses_and_rewinds() {
    let (player, log) = open(clip(400));
    assert_eq!(player.state(), PlayerState::Idle);
    assert_eq!(player.duration_us(), Some(400_000));
    player.play().unwrap();
    wait_for("completion", || player.state() == PlayerState::Paused);
    // the rewind shows the first picture again
    wait_for("rewind preview", || log.len() == 11);

    let mut expected: Vec<i64> = (0..10).collect();
    expected.push(0);
    assert_eq!(log.pts(), expected);
    assert_eq!(player.timeline().get(), Some(0));
    assert_eq!(player.position_us(), Some(0));

    // the rewound source refills the queues but nothing else plays while paused
    thread::sleep(Duration::from_millis(100));
    assert_eq!(log.len(), 11);
    assert_eq!(player.position_us(), Some(0));
    player.stop();
}

#[test]
fn video_only_source_runs_on_wall_clock() {
    let (player, log) = open(GeneratorConfig {
        audio: false,
        ..clip(300)
    });
    let started = Instant::now();
    player.play().unwrap();
    wait_for("completion", || player.state() == PlayerState::Paused);
    wait_for("rewind preview", || log.len() == 9);

    assert_eq!(last_pts(&log), Some(0));
    // the last picture is due at 280 ms
    assert!(started.elapsed() >= Duration::from_millis(250));
    assert_eq!(player.position_us(), Some(0));
}

#[test]
fn last_seek_wins() {
    let (player, log) = open(clip(2000));
    player.play().unwrap();
    wait_for("first pictures", || log.len() >= 2);

    player.pause();
    player.seek(1_000_000, false).unwrap();
    player.seek(1_500_000, false).unwrap();
    assert!(near(player.position_us(), 1_500_000));

    // one preview picture from the later target, then nothing while paused
    wait_for("preview", || last_pts(&log).is_some_and(|pts| pts >= 37));
    let shown = log.len();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(log.len(), shown);
    assert!(near(player.position_us(), 1_500_000));

    player.seek(-250_000, true).unwrap();
    assert!(near(player.position_us(), 1_250_000));
    wait_for("relative preview", || {
        last_pts(&log).is_some_and(|pts| (30..=33).contains(&pts))
    });

    let before = log.len();
    player.resume();
    wait_for("pictures after resume", || log.len() > before + 2);
    // 1.25 s at 25 fps
    assert!(log.pts()[before..].iter().all(|pts| *pts >= 31));
    wait_for("clock to move", || {
        player.position_us().is_some_and(|us| us > 1_350_000)
    });
    player.stop();
    assert_eq!(player.state(), PlayerState::Stopped);
}

#[test]
fn speed_and_gain_controls() {
    let (player, _log) = open(clip(2000));
    player.set_speed(2.0).unwrap();
    assert_eq!(player.speed(), 2.0);
    assert!(matches!(player.set_speed(f64::NAN), Err(PlayerError::InvalidSpeed(_))));
    assert_eq!(player.speed(), 2.0);

    player.set_volume(0.5);
    player.set_mute(true);
    assert_eq!(player.volume(), 0.5);
    assert!(player.muted());
}

#[test]
fn live_source_plays_without_rewind() {
    let (player, log) = open(GeneratorConfig {
        live: true,
        realtime: true,
        duration_ms: None,
        ..clip(0)
    });
    assert!(player.is_live());
    assert_eq!(player.duration_us(), None);
    player.play().unwrap();
    wait_for("live pictures", || log.len() >= 3);
    assert!(matches!(player.seek(0, false), Err(PlayerError::LiveSeek)));
    assert_eq!(player.state(), PlayerState::Playing);
    player.stop();
}
