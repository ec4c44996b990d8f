use super::*;
use crate::backend::mock::{
    BackendCall, EncoderCall, MockCamera, MockCameraController, MockEncoder,
    MockEncoderController, RecordingSoundController, RecordingSoundPlayer,
};
use crate::backend::{FocusSignal, FramePool, PreviewSurface};
use crate::controllers::AfFlags;
use crate::sound::{SoundBank, SoundCue};
use crossbeam::channel;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const SHUTTER_RES: u32 = 101;
const BURST_RES: u32 = 102;
const REC_START_RES: u32 = 103;
const REC_STOP_RES: u32 = 104;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn surface() -> PreviewSurface {
    PreviewSurface {
        id: 7,
        size: (1920, 1080),
    }
}

struct Harness {
    orchestrator: CaptureOrchestrator,
    camera: MockCameraController,
    encoder: MockEncoderController,
    sounds: RecordingSoundController,
    pool: Arc<FramePool>,
}

impl Harness {
    fn with_config(config: EngineConfig) -> Self {
        let pool = FramePool::new(config.ui.frame_pool_capacity);
        let (camera_backend, camera) = MockCamera::with_pool(Some(Arc::clone(&pool)));
        let (encoder_backend, encoder) = MockEncoder::new();
        let (player, sounds) = RecordingSoundPlayer::new();

        let bank = SoundBank::new();
        bank.assign(SoundCue::Shutter, SHUTTER_RES);
        bank.assign(SoundCue::BurstLoop, BURST_RES);
        bank.assign(SoundCue::RecordStart, REC_START_RES);
        bank.assign(SoundCue::RecordStop, REC_STOP_RES);

        let orchestrator = CaptureOrchestrator::new(
            config,
            EngineBackends {
                camera: Box::new(camera_backend),
                encoder: Box::new(encoder_backend),
                sounds: Box::new(player),
            },
            bank,
            Arc::clone(&pool),
        )
        .unwrap();

        Self {
            orchestrator,
            camera,
            encoder,
            sounds,
            pool,
        }
    }

    fn new() -> Self {
        let mut config = EngineConfig::default();
        config.capture.pending_grace_ms = 200;
        config.capture.record_start_delay_ms = 30;
        Self::with_config(config)
    }

    /// Wait until every message queued so far — including the cascades it
    /// spawned — has been processed.
    fn settle(&self) {
        for _ in 0..8 {
            let (tx, rx) = channel::bounded(1);
            assert!(self.orchestrator.with_engine(move |_| {
                let _ = tx.send(());
            }));
            rx.recv_timeout(RECV_TIMEOUT).unwrap();
        }
    }

    fn photo_state(&self) -> CaptureState {
        let (tx, rx) = channel::bounded(1);
        assert!(self.orchestrator.with_engine(move |state| {
            let _ = tx.send(state.photo.state.get());
        }));
        rx.recv_timeout(RECV_TIMEOUT).unwrap()
    }

    fn video_state(&self) -> CaptureState {
        let (tx, rx) = channel::bounded(1);
        assert!(self.orchestrator.with_engine(move |state| {
            let _ = tx.send(state.video.state.get());
        }));
        rx.recv_timeout(RECV_TIMEOUT).unwrap()
    }

    fn media_type(&self) -> MediaKind {
        let (tx, rx) = channel::bounded(1);
        assert!(self.orchestrator.with_engine(move |state| {
            let _ = tx.send(state.media_type.get());
        }));
        rx.recv_timeout(RECV_TIMEOUT).unwrap()
    }

    fn open_with_preview(&self) {
        assert!(self.orchestrator.open_camera(0));
        assert!(self.orchestrator.start_preview(surface()));
        self.settle();
        assert_eq!(self.photo_state(), CaptureState::Ready);
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.orchestrator.shutdown();
    }
}

#[test]
fn end_to_end_single_photo_returns_to_ready() {
    let harness = Harness::new();
    harness.open_with_preview();

    let handle = harness
        .orchestrator
        .capture_photo(1, CaptureFlags::default())
        .unwrap();
    harness.settle();

    assert_eq!(harness.photo_state(), CaptureState::Ready);
    assert!(!handle.is_valid(), "natural completion closes the handle");
    assert_eq!(harness.camera.capture_calls(), 1);
    assert_eq!(harness.sounds.played(), vec![(SHUTTER_RES, false)]);
    assert!(harness.pool.pooled() >= 1, "frame buffer was recycled");
}

#[test]
fn unbounded_burst_stops_on_handle_close() {
    let harness = Harness::new();
    harness.open_with_preview();

    let handle = harness
        .orchestrator
        .capture_photo(-1, CaptureFlags::default())
        .unwrap();
    harness.settle();

    assert_eq!(harness.photo_state(), CaptureState::Capturing);
    assert_eq!(harness.sounds.active_loops(), 1, "burst loop cue running");
    assert_eq!(harness.sounds.played(), vec![(BURST_RES, true)]);

    // Normal close of the handle, not an error path: state returns to
    // Ready without waiting for further hardware frames.
    handle.close();
    harness.settle();

    assert_eq!(harness.photo_state(), CaptureState::Ready);
    assert_eq!(harness.sounds.active_loops(), 0, "loop cue stopped");
    assert!(harness.camera.calls().contains(&BackendCall::StopBurst));
}

#[test]
fn at_most_one_capture_in_flight_and_pending_replays_within_grace() {
    let harness = Harness::new();
    harness.open_with_preview();
    harness.camera.hold_completion(true);

    let first = harness
        .orchestrator
        .capture_photo(1, CaptureFlags::default())
        .unwrap();
    harness.settle();
    assert_eq!(harness.photo_state(), CaptureState::Capturing);

    let second = harness
        .orchestrator
        .capture_photo(1, CaptureFlags::default())
        .unwrap();
    harness.settle();

    assert_eq!(harness.camera.capture_calls(), 1, "second request queued");
    assert!(second.is_valid());
    let (tx, rx) = channel::bounded(1);
    assert!(harness.orchestrator.with_engine(move |state| {
        let _ = tx.send((state.photo.has_pending(), state.photo.active_frames()));
    }));
    let (has_pending, frames) = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(has_pending);
    assert_eq!(frames, 1, "the held capture already delivered its frame");

    // Complete the in-flight capture while the pending request is still
    // inside its grace window: it must replay immediately.
    harness.camera.finish_capture();
    harness.settle();

    assert_eq!(harness.camera.capture_calls(), 2);
    assert_eq!(harness.photo_state(), CaptureState::Capturing);
    assert!(!first.is_valid());

    harness.camera.finish_capture();
    harness.settle();
    assert_eq!(harness.photo_state(), CaptureState::Ready);
    assert!(!second.is_valid());
}

#[test]
fn pending_capture_outliving_the_grace_window_is_discarded() {
    let harness = Harness::new();
    harness.open_with_preview();
    harness.camera.hold_completion(true);

    let _first = harness
        .orchestrator
        .capture_photo(1, CaptureFlags::default())
        .unwrap();
    harness.settle();

    let second = harness
        .orchestrator
        .capture_photo(1, CaptureFlags::default())
        .unwrap();
    harness.settle();
    assert!(second.is_valid());

    // Grace window is 200 ms in this harness.
    thread::sleep(Duration::from_millis(350));
    harness.camera.finish_capture();
    harness.settle();

    assert_eq!(harness.camera.capture_calls(), 1, "no delayed surprise");
    assert_eq!(harness.photo_state(), CaptureState::Ready);
    assert!(!second.is_valid(), "discarded pending handle is closed");
}

#[test]
fn newer_pending_request_replaces_the_older_one() {
    let harness = Harness::new();
    harness.open_with_preview();
    harness.camera.hold_completion(true);

    let _active = harness
        .orchestrator
        .capture_photo(1, CaptureFlags::default())
        .unwrap();
    harness.settle();

    let first_pending = harness
        .orchestrator
        .capture_photo(1, CaptureFlags::default())
        .unwrap();
    let second_pending = harness
        .orchestrator
        .capture_photo(1, CaptureFlags::default())
        .unwrap();
    harness.settle();

    assert!(!first_pending.is_valid(), "replaced pending handle closed");
    assert!(second_pending.is_valid());
}

#[test]
fn capture_waits_for_focus_to_leave_scanning() {
    let harness = Harness::new();
    harness.open_with_preview();
    harness.camera.manual_focus(true);

    let af = harness
        .orchestrator
        .start_auto_focus(Vec::new(), AfFlags::SINGLE)
        .unwrap();
    harness.settle();

    let handle = harness
        .orchestrator
        .capture_photo(1, CaptureFlags::default())
        .unwrap();
    harness.settle();

    assert_eq!(
        harness.camera.capture_calls(),
        0,
        "no hardware capture while scanning"
    );
    assert_eq!(harness.photo_state(), CaptureState::Starting);

    harness.camera.emit(crate::backend::DeviceEvent::FocusMoved {
        signal: FocusSignal::Focused,
    });
    harness.settle();

    assert_eq!(harness.camera.capture_calls(), 1);
    assert_eq!(harness.photo_state(), CaptureState::Ready);
    assert!(!handle.is_valid());
    assert!(!af.is_valid(), "scan resolution closed the AF handle");

    // Single-AF: the lock was engaged before the trigger and released
    // after completion.
    let calls = harness.camera.calls();
    let lock_on = calls
        .iter()
        .position(|call| matches!(call, BackendCall::SetLock(crate::backend::LockKind::Focus, true)));
    let capture = calls
        .iter()
        .position(|call| matches!(call, BackendCall::Capture(_)));
    let lock_off = calls
        .iter()
        .position(|call| matches!(call, BackendCall::SetLock(crate::backend::LockKind::Focus, false)));
    assert!(lock_on.unwrap() < capture.unwrap());
    assert!(capture.unwrap() < lock_off.unwrap());
}

#[test]
fn stopping_preview_forces_preparing_and_restart_restores_ready_once() {
    let harness = Harness::new();
    harness.open_with_preview();

    let ready_entries = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ready_entries);
    assert!(harness.orchestrator.with_engine(move |state| {
        let _sub = state.photo.state.subscribe(move |change| {
            if change.new == CaptureState::Ready {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
    }));
    harness.settle();

    assert!(harness.orchestrator.stop_preview());
    harness.settle();
    assert_eq!(harness.photo_state(), CaptureState::Preparing);

    assert!(harness.orchestrator.start_preview(surface()));
    assert!(harness.orchestrator.start_preview(surface()));
    harness.settle();

    assert_eq!(harness.photo_state(), CaptureState::Ready);
    assert_eq!(
        ready_entries.load(Ordering::SeqCst),
        1,
        "repeated preview starts must not re-enter Ready"
    );
}

#[test]
fn blocking_stop_preview_confirms_within_the_bound() {
    let harness = Harness::new();
    harness.open_with_preview();

    harness.orchestrator.stop_preview_blocking().unwrap();
    assert_eq!(harness.photo_state(), CaptureState::Preparing);
}

#[test]
fn blocking_stop_preview_fails_once_the_engine_is_gone() {
    let harness = Harness::new();
    harness.open_with_preview();
    harness.orchestrator.shutdown();

    assert!(harness.orchestrator.stop_preview_blocking().is_err());
}

#[test]
fn capture_before_preview_is_rejected() {
    let harness = Harness::new();
    assert!(harness.orchestrator.open_camera(0));
    harness.settle();

    let handle = harness
        .orchestrator
        .capture_photo(1, CaptureFlags::default())
        .unwrap();
    harness.settle();

    assert!(!handle.is_valid());
    assert_eq!(harness.photo_state(), CaptureState::Preparing);
    assert_eq!(harness.camera.capture_calls(), 0);
}

#[test]
fn media_type_switch_is_rejected_mid_capture() {
    let harness = Harness::new();
    harness.open_with_preview();
    harness.camera.hold_completion(true);

    let _handle = harness
        .orchestrator
        .capture_photo(1, CaptureFlags::default())
        .unwrap();
    harness.settle();

    assert!(harness.orchestrator.set_media_type(MediaKind::Video));
    harness.settle();
    assert_eq!(harness.media_type(), MediaKind::Photo, "switch rejected");

    harness.camera.finish_capture();
    harness.settle();

    assert!(harness.orchestrator.set_media_type(MediaKind::Video));
    harness.settle();
    assert_eq!(harness.media_type(), MediaKind::Video);
    assert_eq!(harness.video_state(), CaptureState::Ready);
    assert_eq!(harness.photo_state(), CaptureState::Preparing);
}

#[test]
fn video_recording_runs_the_encoder_lifecycle_in_order() {
    let harness = Harness::new();
    harness.open_with_preview();
    assert!(harness.orchestrator.set_media_type(MediaKind::Video));
    harness.settle();

    let handle = harness.orchestrator.capture_video((1280, 720)).unwrap();
    harness.settle();
    assert_eq!(harness.video_state(), CaptureState::Starting);

    // The encoder starts after the record-cue delay (30 ms here).
    thread::sleep(Duration::from_millis(150));
    harness.settle();
    assert_eq!(harness.video_state(), CaptureState::Capturing);
    let (tx, rx) = channel::bounded(1);
    assert!(harness.orchestrator.with_engine(move |state| {
        let _ = tx.send(state.video.is_recording());
    }));
    assert!(rx.recv_timeout(RECV_TIMEOUT).unwrap());

    assert!(harness.orchestrator.pause_video());
    harness.settle();
    assert_eq!(harness.video_state(), CaptureState::Paused);

    assert!(harness.orchestrator.resume_video());
    harness.settle();
    assert_eq!(harness.video_state(), CaptureState::Capturing);

    handle.close();
    harness.settle();
    assert_eq!(harness.video_state(), CaptureState::Ready);
    assert!(!handle.is_valid());

    let calls = harness.encoder.calls();
    let names: Vec<&str> = calls
        .iter()
        .map(|call| match call {
            EncoderCall::Prepare(_) => "prepare",
            EncoderCall::Start => "start",
            EncoderCall::Pause => "pause",
            EncoderCall::Resume => "resume",
            EncoderCall::Stop => "stop",
            EncoderCall::Release => "release",
        })
        .collect();
    assert_eq!(
        names,
        vec!["prepare", "start", "pause", "resume", "stop", "release"]
    );

    let played = harness.sounds.played();
    assert!(played.contains(&(REC_START_RES, false)));
    assert!(played.contains(&(REC_STOP_RES, false)));
}

#[test]
fn second_video_request_while_recording_is_rejected() {
    let harness = Harness::new();
    harness.open_with_preview();
    assert!(harness.orchestrator.set_media_type(MediaKind::Video));
    harness.settle();

    let first = harness.orchestrator.capture_video((1280, 720)).unwrap();
    harness.settle();

    let second = harness.orchestrator.capture_video((1280, 720)).unwrap();
    harness.settle();
    assert!(!second.is_valid(), "only one recording at a time");
    assert!(first.is_valid());
}

#[test]
fn encoder_prepare_failure_unwinds_to_ready() {
    let harness = Harness::new();
    harness.open_with_preview();
    assert!(harness.orchestrator.set_media_type(MediaKind::Video));
    harness.settle();
    harness.encoder.fail_prepare(true);

    let handle = harness.orchestrator.capture_video((1280, 720)).unwrap();
    thread::sleep(Duration::from_millis(150));
    harness.settle();

    assert_eq!(harness.video_state(), CaptureState::Ready);
    assert!(!handle.is_valid());
}

#[test]
fn review_flag_parks_the_capture_until_completed() {
    let harness = Harness::new();
    harness.open_with_preview();

    let handle = harness
        .orchestrator
        .capture_photo(1, CaptureFlags { review: true })
        .unwrap();
    harness.settle();

    assert_eq!(harness.photo_state(), CaptureState::Reviewing);
    assert!(handle.is_valid(), "review keeps the handle open");

    assert!(harness.orchestrator.complete_capture(&handle));
    harness.settle();

    assert_eq!(harness.photo_state(), CaptureState::Ready);
    assert!(!handle.is_valid());
}

#[test]
fn preview_stop_mid_capture_tears_the_machines_down() {
    let harness = Harness::new();
    harness.open_with_preview();
    harness.camera.hold_completion(true);

    let handle = harness
        .orchestrator
        .capture_photo(1, CaptureFlags::default())
        .unwrap();
    harness.settle();
    assert_eq!(harness.photo_state(), CaptureState::Capturing);

    assert!(harness.orchestrator.stop_preview());
    harness.settle();

    assert_eq!(harness.photo_state(), CaptureState::Preparing);
    assert!(!handle.is_valid(), "in-flight capture was closed");

    // The held hardware completion is now stale and must be ignored.
    harness.camera.finish_capture();
    harness.settle();
    assert_eq!(harness.photo_state(), CaptureState::Preparing);
}

#[test]
fn zoom_lock_handles_gate_ratio_changes() {
    let harness = Harness::new();
    harness.open_with_preview();

    assert!(harness.orchestrator.set_zoom(2.0));
    harness.settle();

    let lock_a = harness.orchestrator.lock_zoom().unwrap();
    let lock_b = harness.orchestrator.lock_zoom().unwrap();
    harness.settle();

    assert!(harness.orchestrator.set_zoom(4.0));
    harness.settle();

    // Only the 0→1 lock edge reached the hardware, and the locked zoom
    // rejected the ratio change.
    let lock_calls: Vec<_> = harness
        .camera
        .calls()
        .into_iter()
        .filter(|call| matches!(call, BackendCall::SetLock(crate::backend::LockKind::Zoom, _)))
        .collect();
    assert_eq!(
        lock_calls,
        vec![BackendCall::SetLock(crate::backend::LockKind::Zoom, true)]
    );
    let zoom_values: Vec<_> = harness
        .camera
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            BackendCall::SetZoom(ratio) => Some(ratio),
            _ => None,
        })
        .collect();
    assert_eq!(zoom_values, vec![2.0]);

    lock_a.close();
    lock_b.close();
    harness.settle();

    let lock_calls: Vec<_> = harness
        .camera
        .calls()
        .into_iter()
        .filter(|call| matches!(call, BackendCall::SetLock(crate::backend::LockKind::Zoom, _)))
        .collect();
    assert_eq!(lock_calls.len(), 2, "1→0 edge released the hardware lock");

    assert!(harness.orchestrator.set_zoom(4.0));
    harness.settle();
}

#[test]
fn commands_after_shutdown_report_dropped() {
    let harness = Harness::new();
    harness.open_with_preview();
    assert!(harness.orchestrator.shutdown());

    assert!(!harness.orchestrator.open_camera(0));
    assert!(harness
        .orchestrator
        .capture_photo(1, CaptureFlags::default())
        .is_none());
    assert!(harness.orchestrator.capture_video((640, 480)).is_none());
}

#[test]
fn bounded_burst_plays_one_loop_cue_and_completes() {
    let harness = Harness::new();
    harness.open_with_preview();

    let handle = harness
        .orchestrator
        .capture_photo(3, CaptureFlags::default())
        .unwrap();
    harness.settle();

    assert_eq!(harness.photo_state(), CaptureState::Ready);
    assert!(!handle.is_valid());
    assert_eq!(harness.sounds.played(), vec![(BURST_RES, true)]);
    assert_eq!(harness.sounds.active_loops(), 0);
}
