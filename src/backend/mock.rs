//! Deterministic in-process stand-ins for the hardware seams, used by the
//! demo binary and the test suite. Behavior is scripted through a
//! controller handle so tests can hold completions open, fail opens, or
//! inject arbitrary device events.

use super::{
    AfMode, CameraBackend, CameraId, DeviceEvent, EncoderProfile, EventSink, FocusSignal,
    FramePool, LockKind, MediaEncoder, MeteringRegion, PictureFrame, PreviewSurface, SoundPlayer,
};
use crate::error::{CamrigError, Result};
use crate::handle::Handle;
use chrono::Utc;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Every backend entry point, recorded in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Open(CameraId),
    CreateSession(usize),
    SetRepeating(PreviewSurface),
    StopRepeating,
    Capture(i32),
    StopBurst,
    TriggerAutoFocus(AfMode),
    CancelAutoFocus,
    SetLock(LockKind, bool),
    SetZoom(f32),
    SetExposure(i32),
    Close,
}

struct MockCameraInner {
    sink: Option<EventSink>,
    calls: Vec<BackendCall>,
    pool: Option<Arc<FramePool>>,
    camera_id: CameraId,
    frame_counter: u32,
    // Scripting knobs
    fail_open: bool,
    fail_session: bool,
    hold_completion: bool,
    manual_focus: bool,
    unbounded_frames: u32,
    picture_len: usize,
    // In-flight sequence bookkeeping
    held_end: Option<u32>,
    burst_delivered: u32,
    burst_active: bool,
}

impl MockCameraInner {
    fn deliver(&self, event: DeviceEvent) {
        match &self.sink {
            Some(sink) => {
                if !sink.deliver(event) {
                    debug!("Mock camera event dropped; worker queue is gone");
                }
            }
            None => warn!("Mock camera produced an event before open"),
        }
    }

    fn deliver_frame(&mut self) {
        let index = self.frame_counter;
        self.frame_counter += 1;

        let data = match &self.pool {
            Some(pool) => {
                let mut buffer = pool.acquire(self.picture_len);
                buffer.fill(index as u8);
                buffer
            }
            None => vec![index as u8; self.picture_len],
        };

        self.deliver(DeviceEvent::Shutter { frame_index: index });
        self.deliver(DeviceEvent::PictureTaken(PictureFrame {
            camera_id: self.camera_id,
            frame_index: index,
            data,
            taken_at: Utc::now(),
        }));
    }
}

/// Scripting and inspection handle for a `MockCamera`. Clone freely; all
/// clones observe the same recorded calls.
#[derive(Clone)]
pub struct MockCameraController {
    inner: Arc<Mutex<MockCameraInner>>,
}

impl MockCameraController {
    pub fn calls(&self) -> Vec<BackendCall> {
        self.inner.lock().calls.clone()
    }

    pub fn capture_calls(&self) -> usize {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, BackendCall::Capture(_)))
            .count()
    }

    pub fn fail_open(&self, fail: bool) {
        self.inner.lock().fail_open = fail;
    }

    pub fn fail_session(&self, fail: bool) {
        self.inner.lock().fail_session = fail;
    }

    /// Withhold `CaptureSequenceEnded` until `finish_capture` is called.
    pub fn hold_completion(&self, hold: bool) {
        self.inner.lock().hold_completion = hold;
    }

    /// When set, auto-focus only reports `Scanning`; the test emits the
    /// terminal focus signal itself.
    pub fn manual_focus(&self, manual: bool) {
        self.inner.lock().manual_focus = manual;
    }

    /// Release a held capture sequence.
    pub fn finish_capture(&self) {
        let mut inner = self.inner.lock();
        if let Some(frames) = inner.held_end.take() {
            inner.deliver(DeviceEvent::CaptureSequenceEnded {
                frames_delivered: frames,
            });
        } else {
            warn!("finish_capture called with no held sequence");
        }
    }

    /// Inject an arbitrary device event, as if the hardware produced it.
    pub fn emit(&self, event: DeviceEvent) {
        self.inner.lock().deliver(event);
    }
}

/// Mock hardware camera. Opens, configures, and captures instantly,
/// delivering results through the sink as ordinary mailbox messages.
pub struct MockCamera {
    inner: Arc<Mutex<MockCameraInner>>,
}

impl MockCamera {
    pub fn new() -> (Self, MockCameraController) {
        Self::with_pool(None)
    }

    pub fn with_pool(pool: Option<Arc<FramePool>>) -> (Self, MockCameraController) {
        let inner = Arc::new(Mutex::new(MockCameraInner {
            sink: None,
            calls: Vec::new(),
            pool,
            camera_id: 0,
            frame_counter: 0,
            fail_open: false,
            fail_session: false,
            hold_completion: false,
            manual_focus: false,
            unbounded_frames: 2,
            picture_len: 1024,
            held_end: None,
            burst_delivered: 0,
            burst_active: false,
        }));
        let controller = MockCameraController {
            inner: Arc::clone(&inner),
        };
        (Self { inner }, controller)
    }
}

impl CameraBackend for MockCamera {
    fn open(&mut self, camera_id: CameraId, sink: EventSink) {
        let mut inner = self.inner.lock();
        inner.calls.push(BackendCall::Open(camera_id));
        inner.camera_id = camera_id;
        inner.sink = Some(sink);
        if inner.fail_open {
            inner.deliver(DeviceEvent::OpenFailed {
                camera_id,
                reason: "scripted open failure".to_string(),
            });
        } else {
            inner.deliver(DeviceEvent::Opened { camera_id });
        }
    }

    fn create_session(&mut self, surfaces: &[PreviewSurface]) {
        let mut inner = self.inner.lock();
        inner.calls.push(BackendCall::CreateSession(surfaces.len()));
        if inner.fail_session {
            inner.deliver(DeviceEvent::SessionConfigureFailed {
                reason: "scripted session failure".to_string(),
            });
        } else {
            inner.deliver(DeviceEvent::SessionConfigured);
        }
    }

    fn set_repeating(&mut self, surface: PreviewSurface) {
        let mut inner = self.inner.lock();
        inner.calls.push(BackendCall::SetRepeating(surface));
    }

    fn stop_repeating(&mut self) {
        let mut inner = self.inner.lock();
        inner.calls.push(BackendCall::StopRepeating);
    }

    fn capture(&mut self, frame_count: i32) {
        let mut inner = self.inner.lock();
        inner.calls.push(BackendCall::Capture(frame_count));

        if frame_count < 0 {
            // Unbounded burst: deliver a deterministic prefix of frames and
            // keep the sequence open until stop_burst.
            inner.burst_active = true;
            inner.burst_delivered = 0;
            let prefix = inner.unbounded_frames;
            for _ in 0..prefix {
                inner.deliver_frame();
                inner.burst_delivered += 1;
            }
            return;
        }

        let frames = frame_count.max(1) as u32;
        for _ in 0..frames {
            inner.deliver_frame();
        }
        if inner.hold_completion {
            inner.held_end = Some(frames);
        } else {
            inner.deliver(DeviceEvent::CaptureSequenceEnded {
                frames_delivered: frames,
            });
        }
    }

    fn stop_burst(&mut self) {
        let mut inner = self.inner.lock();
        inner.calls.push(BackendCall::StopBurst);
        if inner.burst_active {
            inner.burst_active = false;
            let frames = inner.burst_delivered;
            inner.deliver(DeviceEvent::CaptureSequenceEnded {
                frames_delivered: frames,
            });
        }
    }

    fn trigger_auto_focus(&mut self, _regions: &[MeteringRegion], mode: AfMode) {
        let mut inner = self.inner.lock();
        inner.calls.push(BackendCall::TriggerAutoFocus(mode));
        inner.deliver(DeviceEvent::FocusMoved {
            signal: FocusSignal::Scanning,
        });
        if !inner.manual_focus {
            inner.deliver(DeviceEvent::FocusMoved {
                signal: FocusSignal::Focused,
            });
        }
    }

    fn cancel_auto_focus(&mut self) {
        let mut inner = self.inner.lock();
        inner.calls.push(BackendCall::CancelAutoFocus);
        inner.deliver(DeviceEvent::FocusMoved {
            signal: FocusSignal::Idle,
        });
    }

    fn set_control_lock(&mut self, kind: LockKind, locked: bool) {
        let mut inner = self.inner.lock();
        inner.calls.push(BackendCall::SetLock(kind, locked));
        if locked {
            inner.deliver(DeviceEvent::LockAcquired { kind });
        }
    }

    fn set_zoom_ratio(&mut self, ratio: f32) {
        let mut inner = self.inner.lock();
        inner.calls.push(BackendCall::SetZoom(ratio));
    }

    fn set_exposure_compensation(&mut self, steps: i32) {
        let mut inner = self.inner.lock();
        inner.calls.push(BackendCall::SetExposure(steps));
    }

    fn close(&mut self) {
        let mut inner = self.inner.lock();
        inner.calls.push(BackendCall::Close);
        let camera_id = inner.camera_id;
        inner.deliver(DeviceEvent::Closed { camera_id });
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EncoderCall {
    Prepare(EncoderProfile),
    Start,
    Pause,
    Resume,
    Stop,
    Release,
}

struct MockEncoderInner {
    calls: Vec<EncoderCall>,
    fail_prepare: bool,
    fail_start: bool,
}

#[derive(Clone)]
pub struct MockEncoderController {
    inner: Arc<Mutex<MockEncoderInner>>,
}

impl MockEncoderController {
    pub fn calls(&self) -> Vec<EncoderCall> {
        self.inner.lock().calls.clone()
    }

    pub fn fail_prepare(&self, fail: bool) {
        self.inner.lock().fail_prepare = fail;
    }

    pub fn fail_start(&self, fail: bool) {
        self.inner.lock().fail_start = fail;
    }
}

/// Mock media encoder recording its lifecycle calls.
pub struct MockEncoder {
    inner: Arc<Mutex<MockEncoderInner>>,
}

impl MockEncoder {
    pub fn new() -> (Self, MockEncoderController) {
        let inner = Arc::new(Mutex::new(MockEncoderInner {
            calls: Vec::new(),
            fail_prepare: false,
            fail_start: false,
        }));
        let controller = MockEncoderController {
            inner: Arc::clone(&inner),
        };
        (Self { inner }, controller)
    }
}

impl MediaEncoder for MockEncoder {
    fn prepare(
        &mut self,
        profile: &EncoderProfile,
        _surface: PreviewSurface,
        _output: &Path,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(EncoderCall::Prepare(profile.clone()));
        if inner.fail_prepare {
            return Err(CamrigError::component(
                "encoder".to_string(),
                "scripted prepare failure".to_string(),
            ));
        }
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(EncoderCall::Start);
        if inner.fail_start {
            return Err(CamrigError::component(
                "encoder".to_string(),
                "scripted start failure".to_string(),
            ));
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.inner.lock().calls.push(EncoderCall::Pause);
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.inner.lock().calls.push(EncoderCall::Resume);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.inner.lock().calls.push(EncoderCall::Stop);
        Ok(())
    }

    fn release(&mut self) {
        self.inner.lock().calls.push(EncoderCall::Release);
    }
}

/// Sound player that discards everything. Used by the demo binary when no
/// audio surface exists.
pub struct NullSoundPlayer;

impl SoundPlayer for NullSoundPlayer {
    fn play(&mut self, _resource: u32) -> Handle {
        Handle::new()
    }

    fn play_loop(&mut self, _resource: u32) -> Handle {
        Handle::new()
    }
}

struct RecordingSoundInner {
    played: Vec<(u32, bool)>,
    active_loops: usize,
}

#[derive(Clone)]
pub struct RecordingSoundController {
    inner: Arc<Mutex<RecordingSoundInner>>,
}

impl RecordingSoundController {
    /// Played resources as (resource, looped) pairs, in play order.
    pub fn played(&self) -> Vec<(u32, bool)> {
        self.inner.lock().played.clone()
    }

    pub fn active_loops(&self) -> usize {
        self.inner.lock().active_loops
    }
}

/// Sound player that records cue playback and tracks loop lifetimes.
pub struct RecordingSoundPlayer {
    inner: Arc<Mutex<RecordingSoundInner>>,
}

impl RecordingSoundPlayer {
    pub fn new() -> (Self, RecordingSoundController) {
        let inner = Arc::new(Mutex::new(RecordingSoundInner {
            played: Vec::new(),
            active_loops: 0,
        }));
        let controller = RecordingSoundController {
            inner: Arc::clone(&inner),
        };
        (Self { inner }, controller)
    }
}

impl SoundPlayer for RecordingSoundPlayer {
    fn play(&mut self, resource: u32) -> Handle {
        self.inner.lock().played.push((resource, false));
        Handle::new()
    }

    fn play_loop(&mut self, resource: u32) -> Handle {
        let mut inner = self.inner.lock();
        inner.played.push((resource, true));
        inner.active_loops += 1;
        let inner_clone = Arc::clone(&self.inner);
        Handle::with_close(move || {
            let mut inner = inner_clone.lock();
            inner.active_loops = inner.active_loops.saturating_sub(1);
        })
    }
}
