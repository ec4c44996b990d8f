pub mod backend;
pub mod camera;
pub mod config;
pub mod controllers;
pub mod error;
pub mod handle;
pub mod observe;
pub mod orchestrator;
pub mod sound;
pub mod ui;
pub mod worker;

pub use backend::{
    AfMode, CameraBackend, CameraId, DeviceEvent, EncoderProfile, EventSink, FocusSignal,
    FramePool, LockKind, MediaEncoder, MeteringRegion, PictureFrame, PreviewSurface, SoundPlayer,
};
pub use camera::{Camera, CameraState, PreviewState};
pub use config::EngineConfig;
pub use controllers::{AfFlags, ExposureController, FocusController, FocusState, ZoomController};
pub use error::{CamrigError, Result};
pub use handle::Handle;
pub use observe::{Change, EventChannel, Property, Subscription, ThreadGuard};
pub use orchestrator::{
    CaptureFlags, CaptureHandle, CaptureOrchestrator, CaptureState, EngineBackends, EngineState,
    MediaKind, PhotoMachine, VideoMachine,
};
pub use sound::{SoundBank, SoundCue};
pub use ui::{UiCaptureState, UiPicture, UiProxy, UiState};
pub use worker::{Mailbox, Worker, WorkerState};
