//! UI-facing proxy: a second worker that mirrors a whitelisted subset of
//! engine properties and events into its own property store, and layers a
//! UI-level capture/review policy on top of the engine's machines.
//!
//! Mirroring is one-way marshalling: engine-side callbacks clone the value
//! (deep enough for the UI to own it) and post it into the UI mailbox;
//! picture payload buffers go back to the shared pool once the copy is
//! made.

use crate::camera::{CameraState, PreviewState};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::observe::{EventChannel, Property};
use crate::orchestrator::{
    request_photo, CaptureFlags, CaptureHandle, CaptureOrchestrator, CaptureState, EngineState,
    MediaKind,
};
use crate::worker::{Mailbox, Worker};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// UI-side copy of a delivered frame. Owns its bytes outright.
#[derive(Debug, Clone)]
pub struct UiPicture {
    pub frame_index: u32,
    pub data: Vec<u8>,
    pub taken_at: DateTime<Utc>,
}

/// The UI's own capture lifecycle, layered on the engine's photo machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiCaptureState {
    Idle,
    Requested,
    Capturing,
    Reviewing,
}

/// State owned by the UI worker thread.
pub struct UiState {
    engine: Mailbox<EngineState>,
    review_enabled: bool,

    pub camera_state: Property<CameraState>,
    pub preview_state: Property<PreviewState>,
    pub photo_state: Property<CaptureState>,
    pub video_state: Property<CaptureState>,
    pub media_type: Property<MediaKind>,
    pub capture_state: Property<UiCaptureState>,
    pub shutter: EventChannel<u32>,
    pub picture: EventChannel<UiPicture>,
    pub fault: EventChannel<String>,

    pub pictures_received: u32,
    active: Option<CaptureHandle>,
    pending: Option<CaptureHandle>,
}

impl UiState {
    fn new(engine: Mailbox<EngineState>, review_enabled: bool) -> Self {
        Self {
            engine,
            review_enabled,
            camera_state: Property::read_only("ui.camera_state", CameraState::Closed),
            preview_state: Property::read_only("ui.preview_state", PreviewState::Stopped),
            photo_state: Property::read_only("ui.photo_state", CaptureState::Preparing),
            video_state: Property::read_only("ui.video_state", CaptureState::Preparing),
            media_type: Property::read_only("ui.media_type", MediaKind::Photo),
            capture_state: Property::read_only("ui.capture_state", UiCaptureState::Idle),
            shutter: EventChannel::new("ui.shutter"),
            picture: EventChannel::new("ui.picture"),
            fault: EventChannel::new("ui.fault"),
            pictures_received: 0,
            active: None,
            pending: None,
        }
    }

    pub fn has_pending_capture(&self) -> bool {
        self.pending.is_some()
    }

    /// UI capture request. If the UI already tracks an in-flight capture,
    /// the new request still goes to the engine (whose pending slot holds
    /// it) but the UI remembers it as its own pending handle so review
    /// policy can cancel it.
    fn request_capture(&mut self) {
        let flags = CaptureFlags {
            review: self.review_enabled,
        };
        let Some(handle) = request_photo(&self.engine, 1, flags) else {
            warn!("UI capture dropped; engine has no live message queue");
            return;
        };

        if self.active.is_none() {
            self.active = Some(handle);
            self.capture_state.set_internal(UiCaptureState::Requested);
        } else {
            debug!("UI capture queued behind the in-flight one");
            if let Some(replaced) = self.pending.replace(handle) {
                replaced.close();
            }
        }
    }

    /// Explicit review completion. UI policy: completing the review also
    /// cancels the queued follow-up capture.
    fn complete_review(&mut self) {
        if self.capture_state.get() != UiCaptureState::Reviewing {
            debug!("Review completion ignored outside review");
            return;
        }
        // Cancel the queued follow-up before the engine services its
        // pending slot, so the replay sees a closed handle.
        if let Some(pending) = self.pending.take() {
            debug!("Review completed; cancelling the queued capture");
            pending.close();
        }
        if let Some(active) = self.active.take() {
            let id = active.id();
            if !self
                .engine
                .post(move |state| state.complete_photo_capture(id))
            {
                warn!("Review completion dropped; engine is gone");
            }
        }
        self.capture_state.set_internal(UiCaptureState::Idle);
    }

    /// Cancel whatever capture the UI is tracking.
    fn cancel_capture(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.close();
        }
        if let Some(active) = self.active.take() {
            active.close();
        }
        self.capture_state.set_internal(UiCaptureState::Idle);
    }

    /// Mirrored photo-machine transition; drives the UI capture machine.
    fn on_photo_state(&mut self, new: CaptureState) {
        self.photo_state.set_internal(new);
        match new {
            CaptureState::Capturing => {
                if self.capture_state.get() == UiCaptureState::Requested {
                    self.capture_state.set_internal(UiCaptureState::Capturing);
                }
            }
            CaptureState::Reviewing => {
                self.capture_state.set_internal(UiCaptureState::Reviewing);
            }
            CaptureState::Ready | CaptureState::Preparing => {
                let finished = self
                    .active
                    .as_ref()
                    .map(|handle| !handle.is_valid())
                    .unwrap_or(false);
                if finished {
                    self.active = None;
                    self.capture_state.set_internal(UiCaptureState::Idle);
                    // The engine may already be replaying our queued
                    // request; promote it to the tracked capture if it
                    // survived.
                    if let Some(pending) = self.pending.take() {
                        if pending.is_valid() {
                            self.active = Some(pending);
                            self.capture_state.set_internal(UiCaptureState::Requested);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn on_picture(&mut self, picture: UiPicture) {
        self.pictures_received += 1;
        self.picture.raise(&picture);
    }
}

/// Handle to the UI worker. Commands post into the UI mailbox; the UI
/// forwards to the engine as needed.
pub struct UiProxy {
    worker: Worker<UiState>,
}

impl UiProxy {
    /// Spawn the UI worker and install the engine-side mirrors.
    pub fn attach(
        orchestrator: &CaptureOrchestrator,
        config: &EngineConfig,
        review_enabled: bool,
    ) -> Result<Self> {
        let engine = orchestrator.mailbox();
        let worker = Worker::new(&config.worker.ui_thread_name, move |_| {
            UiState::new(engine, review_enabled)
        });
        worker.start()?;

        let ui = worker.mailbox();
        orchestrator.with_engine(move |state| install_mirrors(state, ui));

        Ok(Self { worker })
    }

    pub fn mailbox(&self) -> Mailbox<UiState> {
        self.worker.mailbox()
    }

    /// Run a closure on the UI thread against the UI state.
    pub fn with_ui<F: FnOnce(&mut UiState) + Send + 'static>(&self, f: F) -> bool {
        self.mailbox().post(f)
    }

    pub fn capture_photo(&self) -> bool {
        self.mailbox().post(|ui| ui.request_capture())
    }

    pub fn complete_review(&self) -> bool {
        self.mailbox().post(|ui| ui.complete_review())
    }

    pub fn cancel_capture(&self) -> bool {
        self.mailbox().post(|ui| ui.cancel_capture())
    }

    pub fn release(&self) -> bool {
        self.worker.release();
        self.worker
            .join_timeout(std::time::Duration::from_secs(3))
    }
}

/// Install the one-way mirrors on the engine worker. Each callback clones
/// the value and posts it; a false return from `post` means the UI is
/// gone and the update is dropped.
fn install_mirrors(state: &mut EngineState, ui: Mailbox<UiState>) {
    let mirror = ui.clone();
    state.camera.state.subscribe(move |change| {
        let value = change.new;
        if !mirror.post(move |ui| {
            ui.camera_state.set_internal(value);
        }) {
            debug!("Camera-state mirror dropped");
        }
    });

    let mirror = ui.clone();
    state.camera.preview_state.subscribe(move |change| {
        let value = change.new;
        if !mirror.post(move |ui| {
            ui.preview_state.set_internal(value);
        }) {
            debug!("Preview-state mirror dropped");
        }
    });

    let mirror = ui.clone();
    state.photo.state.subscribe(move |change| {
        let value = change.new;
        if !mirror.post(move |ui| ui.on_photo_state(value)) {
            debug!("Photo-state mirror dropped");
        }
    });

    let mirror = ui.clone();
    state.video.state.subscribe(move |change| {
        let value = change.new;
        if !mirror.post(move |ui| {
            ui.video_state.set_internal(value);
        }) {
            debug!("Video-state mirror dropped");
        }
    });

    let mirror = ui.clone();
    state.media_type.subscribe(move |change| {
        let value = change.new;
        if !mirror.post(move |ui| {
            ui.media_type.set_internal(value);
        }) {
            debug!("Media-type mirror dropped");
        }
    });

    let mirror = ui.clone();
    state.camera.shutter.subscribe(move |frame_index| {
        let frame_index = *frame_index;
        if !mirror.post(move |ui| ui.shutter.raise(&frame_index)) {
            debug!("Shutter mirror dropped");
        }
    });

    // Deep copy: the UI owns its bytes; the original buffer is recycled
    // by the engine once dispatch finishes.
    let mirror = ui.clone();
    state.camera.picture.subscribe(move |frame| {
        let copy = UiPicture {
            frame_index: frame.frame_index,
            data: frame.data.clone(),
            taken_at: frame.taken_at,
        };
        if !mirror.post(move |ui| ui.on_picture(copy)) {
            debug!("Picture mirror dropped");
        }
    });

    let mirror = ui;
    state.camera.fault.subscribe(move |reason| {
        let reason = reason.clone();
        if !mirror.post(move |ui| ui.fault.raise(&reason)) {
            debug!("Fault mirror dropped");
        }
    });
}
