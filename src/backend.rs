use crate::error::Result;
use crate::handle::Handle;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

pub mod mock;

pub type CameraId = u32;

/// Opaque frame destination handed to the backend for preview and
/// recording output. The engine never looks inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviewSurface {
    pub id: u64,
    pub size: (u32, u32),
}

/// One delivered still frame. The payload buffer is leased from a
/// `FramePool` and recycled once marshalling is done.
#[derive(Debug, Clone)]
pub struct PictureFrame {
    pub camera_id: CameraId,
    pub frame_index: u32,
    pub data: Vec<u8>,
    pub taken_at: DateTime<Utc>,
}

/// Focus transitions reported by the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusSignal {
    Idle,
    Scanning,
    Focused,
    Unfocused,
}

/// Hardware controls that support lock/unlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Focus,
    Exposure,
    Zoom,
}

/// Auto-focus trigger modes. Mutually exclusive by contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfMode {
    Single,
    Continuous,
}

/// Normalized metering rectangle for focus/exposure regions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeteringRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Asynchronous results from the hardware layer. Every variant arrives as
/// a message on the camera worker; the state machines are driven forward
/// by these, never by blocking waits.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Opened { camera_id: CameraId },
    OpenFailed { camera_id: CameraId, reason: String },
    Disconnected { camera_id: CameraId },
    SessionConfigured,
    SessionConfigureFailed { reason: String },
    Shutter { frame_index: u32 },
    PictureTaken(PictureFrame),
    CaptureFailed { reason: String },
    CaptureSequenceEnded { frames_delivered: u32 },
    LockAcquired { kind: LockKind },
    FocusMoved { signal: FocusSignal },
    Closed { camera_id: CameraId },
    Fault { reason: String },
}

/// Cross-thread funnel the backend uses to hand results back. `deliver`
/// returns false when the owning worker's queue is gone; the event is
/// dropped and the backend must not assume it arrived.
#[derive(Clone)]
pub struct EventSink {
    post: Arc<dyn Fn(DeviceEvent) -> bool + Send + Sync>,
}

impl EventSink {
    pub fn new<F: Fn(DeviceEvent) -> bool + Send + Sync + 'static>(post: F) -> Self {
        Self {
            post: Arc::new(post),
        }
    }

    pub fn deliver(&self, event: DeviceEvent) -> bool {
        trace!("Delivering device event: {:?}", event);
        (self.post)(event)
    }
}

/// The hardware capture API. Calls request work; results come back through
/// the `EventSink` given at `open`.
pub trait CameraBackend {
    fn open(&mut self, camera_id: CameraId, sink: EventSink);
    fn create_session(&mut self, surfaces: &[PreviewSurface]);
    fn set_repeating(&mut self, surface: PreviewSurface);
    fn stop_repeating(&mut self);
    /// `frame_count`: 1 single shot, >1 bounded burst, <0 unbounded burst
    /// until `stop_burst`.
    fn capture(&mut self, frame_count: i32);
    fn stop_burst(&mut self);
    fn trigger_auto_focus(&mut self, regions: &[MeteringRegion], mode: AfMode);
    fn cancel_auto_focus(&mut self);
    fn set_control_lock(&mut self, kind: LockKind, locked: bool);
    fn set_zoom_ratio(&mut self, ratio: f32);
    fn set_exposure_compensation(&mut self, steps: i32);
    fn close(&mut self);
}

/// Encoder profile derived from the requested recording resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderProfile {
    pub resolution: (u32, u32),
    pub bitrate: u32,
    pub fps: u32,
}

impl EncoderProfile {
    pub fn for_resolution(resolution: (u32, u32)) -> Self {
        // Rough H.264-ish rate: 3 bits per pixel-second at 30 fps.
        let bitrate = (resolution.0 * resolution.1 * 3).max(1_000_000);
        Self {
            resolution,
            bitrate,
            fps: 30,
        }
    }
}

/// Media encoder lifecycle, invoked synchronously at the video machine's
/// defined transition points.
pub trait MediaEncoder {
    fn prepare(&mut self, profile: &EncoderProfile, surface: PreviewSurface, output: &Path)
        -> Result<()>;
    fn start(&mut self) -> Result<()>;
    fn pause(&mut self) -> Result<()>;
    fn resume(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn release(&mut self);
}

/// Capture feedback sounds, played through whatever audio surface the
/// application provides. Playback is a cancellable operation: closing the
/// returned handle stops it (a finished one-shot close is a no-op).
pub trait SoundPlayer {
    fn play(&mut self, resource: u32) -> Handle;
    fn play_loop(&mut self, resource: u32) -> Handle;
}

/// Reusable picture-buffer pool shared between the backend (producer) and
/// the engine (recycler). One of the few cross-thread registries, so it
/// carries its own lock.
pub struct FramePool {
    buffers: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
}

impl FramePool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            buffers: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        })
    }

    pub fn acquire(&self, min_len: usize) -> Vec<u8> {
        let mut buffers = self.buffers.lock();
        match buffers.pop() {
            Some(mut buffer) => {
                buffer.clear();
                buffer.resize(min_len, 0);
                buffer
            }
            None => vec![0; min_len],
        }
    }

    pub fn recycle(&self, buffer: Vec<u8>) {
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.capacity {
            buffers.push(buffer);
        }
    }

    pub fn pooled(&self) -> usize {
        self.buffers.lock().len()
    }
}
