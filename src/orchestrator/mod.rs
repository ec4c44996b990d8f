//! The capture orchestration engine: one worker thread owning the camera,
//! the capture state machines, and the satellite controllers. The public
//! surface posts every command into the worker mailbox; asynchronous
//! hardware results re-enter the same mailbox, so the machines are driven
//! forward by message arrival and never by blocking waits.

mod photo;
mod video;

#[cfg(test)]
mod tests;

pub use photo::PhotoMachine;
pub use video::VideoMachine;

use crate::backend::{
    CameraBackend, CameraId, DeviceEvent, EventSink, FramePool, LockKind, MediaEncoder,
    MeteringRegion, PreviewSurface, SoundPlayer,
};
use crate::camera::{Camera, PreviewState};
use crate::config::EngineConfig;
use crate::controllers::{AfFlags, ExposureController, FocusController, ZoomController};
use crate::error::{CamrigError, Result};
use crate::handle::Handle;
use crate::observe::Property;
use crate::sound::{SoundBank, SoundCue};
use crate::worker::{Mailbox, Worker};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Photo,
    Video,
}

/// Capture machine lifecycle. Photo uses the first six states; video adds
/// the pause family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Preparing,
    Ready,
    Starting,
    Capturing,
    Stopping,
    Reviewing,
    Pausing,
    Paused,
    Resuming,
}

impl CaptureState {
    pub fn is_idle(self) -> bool {
        matches!(self, CaptureState::Preparing | CaptureState::Ready)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureFlags {
    /// Route the finished capture through `Reviewing` and wait for
    /// `complete_capture` instead of returning to `Ready` directly.
    pub review: bool,
}

/// Handle for one capture operation. Held by the requester (close to
/// cancel, or to stop an unbounded burst) and by the engine (closed on
/// natural completion); whichever side closes first wins.
#[derive(Clone)]
pub struct CaptureHandle {
    handle: Handle,
    kind: MediaKind,
    frame_count: i32,
    flags: CaptureFlags,
    requested_at: Instant,
}

impl CaptureHandle {
    fn new(kind: MediaKind, frame_count: i32, flags: CaptureFlags) -> Self {
        Self {
            handle: Handle::new(),
            kind,
            frame_count,
            flags,
            requested_at: Instant::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.handle.id()
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// 1 = single shot, >1 = bounded burst, <0 = unbounded burst.
    pub fn frame_count(&self) -> i32 {
        self.frame_count
    }

    pub fn flags(&self) -> CaptureFlags {
        self.flags
    }

    pub fn is_valid(&self) -> bool {
        self.handle.is_valid()
    }

    pub fn close(&self) {
        self.handle.close();
    }

    fn age(&self) -> Duration {
        self.requested_at.elapsed()
    }

    fn set_on_close<F: FnOnce() + Send + 'static>(&self, action: F) {
        self.handle.set_on_close(action);
    }
}

impl std::fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("id", &self.id())
            .field("kind", &self.kind)
            .field("frame_count", &self.frame_count)
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// The injected hardware seams.
pub struct EngineBackends {
    pub camera: Box<dyn CameraBackend + Send>,
    pub encoder: Box<dyn MediaEncoder + Send>,
    pub sounds: Box<dyn SoundPlayer + Send>,
}

/// Actor-side state of the engine. Everything in here is owned by the
/// camera worker thread and mutated only from mailbox messages.
pub struct EngineState {
    pub(crate) config: EngineConfig,
    pub(crate) mailbox: Mailbox<EngineState>,
    pub camera: Camera,
    pub focus: FocusController,
    pub exposure: ExposureController,
    pub zoom: ZoomController,
    pub media_type: Property<MediaKind>,
    pub photo: PhotoMachine,
    pub video: VideoMachine,
    pub(crate) sound_bank: Arc<SoundBank>,
    pub(crate) player: Box<dyn SoundPlayer + Send>,
    pub(crate) encoder: Box<dyn MediaEncoder + Send>,
    pub(crate) pool: Arc<FramePool>,
}

impl EngineState {
    fn new(
        config: EngineConfig,
        backends: EngineBackends,
        sound_bank: Arc<SoundBank>,
        pool: Arc<FramePool>,
        mailbox: Mailbox<EngineState>,
    ) -> Self {
        let sink_mailbox = mailbox.clone();
        let sink = EventSink::new(move |event| {
            sink_mailbox.post(move |state: &mut EngineState| state.handle_device_event(event))
        });

        Self {
            camera: Camera::new(backends.camera, sink),
            focus: FocusController::new(config.focus.max_regions),
            exposure: ExposureController::new(
                config.exposure.min_compensation,
                config.exposure.max_compensation,
            ),
            zoom: ZoomController::new(config.zoom.min_ratio, config.zoom.max_ratio),
            media_type: Property::read_only("engine.media_type", MediaKind::Photo),
            photo: PhotoMachine::new(),
            video: VideoMachine::new(),
            sound_bank,
            player: backends.sounds,
            encoder: backends.encoder,
            pool,
            config,
            mailbox,
        }
    }

    pub(crate) fn pending_grace(&self) -> Duration {
        Duration::from_millis(self.config.capture.pending_grace_ms)
    }

    /// Fold one asynchronous hardware result: first into the device
    /// wrapper, then into whichever machine or controller it concerns.
    fn handle_device_event(&mut self, event: DeviceEvent) {
        self.camera.handle_event(&event);

        match event {
            DeviceEvent::PictureTaken(frame) => {
                self.on_picture_delivered(frame);
            }
            DeviceEvent::CaptureSequenceEnded { frames_delivered } => {
                self.finish_photo_capture(frames_delivered);
            }
            DeviceEvent::CaptureFailed { reason } => {
                self.on_photo_capture_failed(&reason);
            }
            DeviceEvent::FocusMoved { signal } => {
                let outcome = self.focus.on_signal(self.camera.backend_mut(), signal);
                if outcome.left_scanning {
                    self.resume_parked_photo();
                }
            }
            DeviceEvent::LockAcquired { kind } => {
                if kind == LockKind::Focus {
                    self.on_focus_lock_acquired();
                }
            }
            DeviceEvent::Opened { .. }
            | DeviceEvent::OpenFailed { .. }
            | DeviceEvent::Disconnected { .. }
            | DeviceEvent::SessionConfigured
            | DeviceEvent::SessionConfigureFailed { .. }
            | DeviceEvent::Closed { .. } => {
                self.sync_capture_states_with_preview();
            }
            DeviceEvent::Shutter { .. } | DeviceEvent::Fault { .. } => {}
        }
    }

    pub(crate) fn play_cue(&mut self, cue: SoundCue) -> Option<Handle> {
        let resource = self.sound_bank.resource(cue)?;
        Some(self.player.play(resource))
    }

    pub(crate) fn play_loop_cue(&mut self, cue: SoundCue) -> Option<Handle> {
        let resource = self.sound_bank.resource(cue)?;
        Some(self.player.play_loop(resource))
    }

    pub(crate) fn ready_or_preparing(&self) -> CaptureState {
        if self.camera.preview_state.get() == PreviewState::Started {
            CaptureState::Ready
        } else {
            CaptureState::Preparing
        }
    }

    /// Couple the capture machines to the preview stream: a stopped
    /// preview forces both machines back to `Preparing` (tearing down
    /// anything in flight); a started preview promotes the active media
    /// type's machine from `Preparing` to `Ready`, exactly once.
    pub(crate) fn sync_capture_states_with_preview(&mut self) {
        let started = self.camera.preview_state.get() == PreviewState::Started;
        if !started {
            self.abort_photo_capture("preview stopped");
            self.abort_video_capture("preview stopped");
            self.photo.state.set_internal(CaptureState::Preparing);
            self.video.state.set_internal(CaptureState::Preparing);
            return;
        }

        let active = self.media_type.get();
        if active == MediaKind::Photo {
            if self.photo.state.get() == CaptureState::Preparing {
                self.photo.state.set_internal(CaptureState::Ready);
            }
            if self.video.state.get() == CaptureState::Ready {
                self.video.state.set_internal(CaptureState::Preparing);
            }
        } else {
            if self.video.state.get() == CaptureState::Preparing {
                self.video.state.set_internal(CaptureState::Ready);
            }
            if self.photo.state.get() == CaptureState::Ready {
                self.photo.state.set_internal(CaptureState::Preparing);
            }
        }
    }

    fn start_preview(&mut self, surface: PreviewSurface) {
        self.camera.start_preview(surface);
        self.sync_capture_states_with_preview();
    }

    /// Stop the preview stream. Returns once the machines settled back to
    /// `Preparing`.
    fn stop_preview(&mut self) -> bool {
        let stopped = self.camera.stop_preview();
        self.sync_capture_states_with_preview();
        stopped
    }

    fn close_camera(&mut self) {
        self.abort_photo_capture("camera closing");
        self.abort_video_capture("camera closing");
        self.camera.close();
        self.sync_capture_states_with_preview();
    }

    /// Media-type switch, legal only while both machines are idle.
    fn set_media_type(&mut self, kind: MediaKind) -> bool {
        if self.media_type.get() == kind {
            return true;
        }
        if !self.photo.state.get().is_idle() || !self.video.state.get().is_idle() {
            warn!(
                "Media type change to {:?} rejected: photo {:?}, video {:?}",
                kind,
                self.photo.state.get(),
                self.video.state.get()
            );
            return false;
        }
        info!("Media type changed to {:?}", kind);
        self.media_type.set_internal(kind);
        self.sync_capture_states_with_preview();
        true
    }

    fn capture_handle_closed(&mut self, kind: MediaKind, id: Uuid) {
        match kind {
            MediaKind::Photo => self.photo_handle_closed(id),
            MediaKind::Video => self.video_handle_closed(id),
        }
    }

    // Lock plumbing shared by the three controllers. Only the 0→1 edge
    // reaches the hardware; the matching 1→0 edge releases it.
    fn apply_lock(&mut self, kind: LockKind) {
        let first = match kind {
            LockKind::Focus => self.focus.acquire_lock(),
            LockKind::Exposure => self.exposure.acquire_lock(),
            LockKind::Zoom => self.zoom.acquire_lock(),
        };
        if first {
            self.camera.backend_mut().set_control_lock(kind, true);
        }
    }

    fn release_lock(&mut self, kind: LockKind) {
        let last = match kind {
            LockKind::Focus => self.focus.release_lock(),
            LockKind::Exposure => self.exposure.release_lock(),
            LockKind::Zoom => self.zoom.release_lock(),
        };
        if last {
            self.camera.backend_mut().set_control_lock(kind, false);
        }
    }

    /// Engine-internal focus lock used by the single-AF capture interlock.
    /// Returns the lock handle and whether the hardware acknowledgement is
    /// still outstanding.
    pub(crate) fn acquire_focus_lock_for_capture(&mut self) -> (Handle, bool) {
        let first = self.focus.acquire_lock();
        if first {
            self.camera
                .backend_mut()
                .set_control_lock(LockKind::Focus, true);
        }
        let mailbox = self.mailbox.clone();
        let handle = Handle::with_close(move || {
            if !mailbox.post(|state: &mut EngineState| state.release_lock(LockKind::Focus)) {
                debug!("Focus unlock dropped; engine is gone");
            }
        });
        (handle, first)
    }

    fn shutdown_cleanup(&mut self) {
        info!("Engine shutting down");
        self.abort_photo_capture("engine shutdown");
        self.abort_video_capture("engine shutdown");
        self.camera.close();
    }
}

/// Public command surface of the engine. Every method posts into the
/// camera worker; boolean/Option returns mean "accepted into the mailbox",
/// never "already done" — rejection on the worker side closes the handle
/// or logs.
pub struct CaptureOrchestrator {
    worker: Worker<EngineState>,
    config: EngineConfig,
}

impl CaptureOrchestrator {
    pub fn new(
        config: EngineConfig,
        backends: EngineBackends,
        sound_bank: Arc<SoundBank>,
        pool: Arc<FramePool>,
    ) -> Result<Self> {
        config.validate().map_err(CamrigError::Config)?;
        // Injected configuration is sealed before the worker starts.
        sound_bank.freeze();

        let init_config = config.clone();
        let worker = Worker::new(&config.worker.camera_thread_name, move |mailbox| {
            EngineState::new(init_config, backends, sound_bank, pool, mailbox.clone())
        });
        worker.start()?;

        Ok(Self { worker, config })
    }

    pub fn mailbox(&self) -> Mailbox<EngineState> {
        self.worker.mailbox()
    }

    /// Run a closure on the engine thread against the actor state. Used by
    /// the UI proxy to install its mirrors and by tests to inspect state.
    pub fn with_engine<F: FnOnce(&mut EngineState) + Send + 'static>(&self, f: F) -> bool {
        self.mailbox().post(f)
    }

    pub fn open_camera(&self, camera_id: CameraId) -> bool {
        self.mailbox().post(move |state| {
            state.camera.open(camera_id);
        })
    }

    pub fn close_camera(&self) -> bool {
        self.mailbox().post(|state| state.close_camera())
    }

    pub fn start_preview(&self, surface: PreviewSurface) -> bool {
        self.mailbox().post(move |state| state.start_preview(surface))
    }

    pub fn stop_preview(&self) -> bool {
        self.mailbox().post(|state| {
            state.stop_preview();
        })
    }

    /// Stop the preview and block until the engine confirms, bounded by
    /// the configured timeout. A timeout is a failure, not a retry.
    pub fn stop_preview_blocking(&self) -> Result<()> {
        let (tx, rx) = crossbeam::channel::bounded(1);
        let posted = self.mailbox().post(move |state| {
            let stopped = state.stop_preview();
            let _ = tx.send(stopped);
        });
        if !posted {
            return Err(CamrigError::rejected("engine has no live message queue"));
        }

        let timeout = Duration::from_millis(self.config.capture.sync_stop_timeout_ms);
        match rx.recv_timeout(timeout) {
            Ok(true) => Ok(()),
            Ok(false) => Err(CamrigError::system("preview did not stop")),
            Err(_) => Err(CamrigError::system(format!(
                "stop preview timed out after {:?}",
                timeout
            ))),
        }
    }

    pub fn set_media_type(&self, kind: MediaKind) -> bool {
        self.mailbox().post(move |state| {
            state.set_media_type(kind);
        })
    }

    /// Request a photo capture. `frame_count`: 1 single shot, >1 bounded
    /// burst, <0 unbounded burst until the handle is closed. Returns the
    /// handle when the request entered the mailbox; worker-side rejection
    /// closes the handle.
    pub fn capture_photo(&self, frame_count: i32, flags: CaptureFlags) -> Option<CaptureHandle> {
        request_photo(&self.mailbox(), frame_count, flags)
    }

    /// Request a video recording at `resolution`.
    pub fn capture_video(&self, resolution: (u32, u32)) -> Option<CaptureHandle> {
        let output = PathBuf::from(&self.config.demo.output_dir).join(format!(
            "video-{}.mp4",
            Utc::now().format("%Y%m%d-%H%M%S%3f")
        ));
        request_video(&self.mailbox(), resolution, output)
    }

    pub fn pause_video(&self) -> bool {
        self.mailbox().post(|state| state.pause_video())
    }

    pub fn resume_video(&self) -> bool {
        self.mailbox().post(|state| state.resume_video())
    }

    /// Finish a capture parked in `Reviewing`.
    pub fn complete_capture(&self, handle: &CaptureHandle) -> bool {
        let id = handle.id();
        self.mailbox()
            .post(move |state| state.complete_photo_capture(id))
    }

    /// Start an auto-focus scan. Flag validation happens eagerly on the
    /// calling thread; conflicting flags are a programming error.
    pub fn start_auto_focus(
        &self,
        regions: Vec<MeteringRegion>,
        flags: AfFlags,
    ) -> Option<Handle> {
        flags.validate();
        let handle = Handle::new();
        let request_handle = handle.clone();
        let posted = self.mailbox().post(move |state| {
            state
                .focus
                .start_auto_focus(state.camera.backend_mut(), request_handle, regions, flags);
        });
        if !posted {
            return None;
        }

        let mailbox = self.mailbox();
        let cancel_handle = handle.clone();
        handle.set_on_close(move || {
            let _ = mailbox.post(move |state| {
                state
                    .focus
                    .cancel_request(state.camera.backend_mut(), &cancel_handle);
            });
        });
        Some(handle)
    }

    pub fn lock_focus(&self) -> Option<Handle> {
        self.lock(LockKind::Focus)
    }

    pub fn lock_exposure(&self) -> Option<Handle> {
        self.lock(LockKind::Exposure)
    }

    pub fn lock_zoom(&self) -> Option<Handle> {
        self.lock(LockKind::Zoom)
    }

    fn lock(&self, kind: LockKind) -> Option<Handle> {
        if !self.mailbox().post(move |state| state.apply_lock(kind)) {
            return None;
        }
        let mailbox = self.mailbox();
        Some(Handle::with_close(move || {
            if !mailbox.post(move |state| state.release_lock(kind)) {
                debug!("Unlock for {:?} dropped; engine is gone", kind);
            }
        }))
    }

    pub fn set_zoom(&self, ratio: f32) -> bool {
        self.mailbox().post(move |state| {
            state.zoom.set_ratio(state.camera.backend_mut(), ratio);
        })
    }

    pub fn set_exposure_compensation(&self, steps: i32) -> bool {
        self.mailbox().post(move |state| {
            state
                .exposure
                .set_compensation(state.camera.backend_mut(), steps);
        })
    }

    /// Orderly shutdown: unwind captures, close the camera, then stop the
    /// worker and join it with the configured timeout.
    pub fn shutdown(&self) -> bool {
        self.with_engine(|state| state.shutdown_cleanup());
        self.worker.release();
        self.worker
            .join_timeout(Duration::from_millis(self.config.worker.release_join_ms))
    }
}

/// Build and submit a photo-capture request through `mailbox`. Shared by
/// the orchestrator surface and the UI proxy so both wire the handle's
/// close action identically.
pub fn request_photo(
    mailbox: &Mailbox<EngineState>,
    frame_count: i32,
    flags: CaptureFlags,
) -> Option<CaptureHandle> {
    let handle = CaptureHandle::new(MediaKind::Photo, frame_count, flags);
    wire_close(mailbox, &handle);

    let request = handle.clone();
    if mailbox.post(move |state| state.request_photo_capture(request)) {
        Some(handle)
    } else {
        warn!("Photo capture dropped; engine has no live message queue");
        handle.close();
        None
    }
}

fn request_video(
    mailbox: &Mailbox<EngineState>,
    resolution: (u32, u32),
    output: PathBuf,
) -> Option<CaptureHandle> {
    let handle = CaptureHandle::new(MediaKind::Video, 1, CaptureFlags::default());
    wire_close(mailbox, &handle);

    let request = handle.clone();
    if mailbox.post(move |state| state.request_video_capture(request, resolution, output)) {
        Some(handle)
    } else {
        warn!("Video capture dropped; engine has no live message queue");
        handle.close();
        None
    }
}

fn wire_close(mailbox: &Mailbox<EngineState>, handle: &CaptureHandle) {
    let mailbox = mailbox.clone();
    let kind = handle.kind();
    let id = handle.id();
    handle.set_on_close(move || {
        if !mailbox.post(move |state| state.capture_handle_closed(kind, id)) {
            debug!("Capture-handle close for {} dropped; engine is gone", id);
        }
    });
}
