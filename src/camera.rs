use crate::backend::{CameraBackend, CameraId, DeviceEvent, EventSink, PictureFrame, PreviewSurface};
use crate::observe::{EventChannel, Property};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraState {
    Closed,
    Opening,
    Opened,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

/// Wrapper around the one hardware camera the engine owns. Lives entirely
/// on the camera worker thread; the backend's asynchronous results arrive
/// back here through `handle_event` as ordinary mailbox messages.
pub struct Camera {
    backend: Box<dyn CameraBackend + Send>,
    sink: EventSink,
    id: Option<CameraId>,

    pub state: Property<CameraState>,
    pub preview_state: Property<PreviewState>,
    pub shutter: EventChannel<u32>,
    pub picture: EventChannel<PictureFrame>,
    pub capture_failed: EventChannel<String>,
    pub fault: EventChannel<String>,

    // Surface waiting for the capture session to configure
    pending_preview: Option<PreviewSurface>,
    active_surface: Option<PreviewSurface>,
    capturing: bool,
}

impl Camera {
    pub fn new(backend: Box<dyn CameraBackend + Send>, sink: EventSink) -> Self {
        Self {
            backend,
            sink,
            id: None,
            state: Property::read_only("camera.state", CameraState::Closed),
            preview_state: Property::read_only("camera.preview_state", PreviewState::Stopped),
            shutter: EventChannel::new("camera.shutter"),
            picture: EventChannel::new("camera.picture"),
            capture_failed: EventChannel::new("camera.capture_failed"),
            fault: EventChannel::new("camera.fault"),
            pending_preview: None,
            active_surface: None,
            capturing: false,
        }
    }

    pub fn id(&self) -> Option<CameraId> {
        self.id
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    pub fn active_surface(&self) -> Option<PreviewSurface> {
        self.active_surface
    }

    pub fn backend_mut(&mut self) -> &mut dyn CameraBackend {
        self.backend.as_mut()
    }

    /// Begin opening the device. Accepted only from `Closed`.
    pub fn open(&mut self, camera_id: CameraId) -> bool {
        match self.state.get() {
            CameraState::Closed => {
                info!("Opening camera {}", camera_id);
                self.id = Some(camera_id);
                self.state.set_internal(CameraState::Opening);
                self.backend.open(camera_id, self.sink.clone());
                true
            }
            state => {
                warn!("Open requested while camera is {:?}; ignored", state);
                false
            }
        }
    }

    /// Begin closing the device. No-op when already closed or closing.
    pub fn close(&mut self) -> bool {
        match self.state.get() {
            CameraState::Opened | CameraState::Opening => {
                info!("Closing camera {:?}", self.id);
                if self.preview_state.get() != PreviewState::Stopped {
                    self.stop_preview();
                }
                self.state.set_internal(CameraState::Closing);
                self.backend.close();
                true
            }
            state => {
                debug!("Close requested while camera is {:?}; no-op", state);
                false
            }
        }
    }

    /// Request the preview stream onto `surface`. Idempotent while already
    /// starting or started. While the device is still opening, the surface
    /// is parked and the session is created once the open completes.
    pub fn start_preview(&mut self, surface: PreviewSurface) -> bool {
        match self.preview_state.get() {
            PreviewState::Started | PreviewState::Starting => {
                debug!("Preview already running; start ignored");
                return true;
            }
            PreviewState::Stopped | PreviewState::Stopping => {}
        }

        match self.state.get() {
            CameraState::Opened => {
                self.preview_state.set_internal(PreviewState::Starting);
                self.pending_preview = Some(surface);
                self.backend.create_session(&[surface]);
                true
            }
            CameraState::Opening => {
                self.preview_state.set_internal(PreviewState::Starting);
                self.pending_preview = Some(surface);
                true
            }
            state => {
                warn!("Preview requested while camera is {:?}; rejected", state);
                false
            }
        }
    }

    /// Tear the preview stream down. The repeating request stops
    /// synchronously; there is no hardware acknowledgement to wait for.
    pub fn stop_preview(&mut self) -> bool {
        match self.preview_state.get() {
            PreviewState::Stopped | PreviewState::Stopping => {
                debug!("Preview already stopped; no-op");
                true
            }
            PreviewState::Starting | PreviewState::Started => {
                self.preview_state.set_internal(PreviewState::Stopping);
                self.backend.stop_repeating();
                self.pending_preview = None;
                self.active_surface = None;
                self.preview_state.set_internal(PreviewState::Stopped);
                true
            }
        }
    }

    /// Issue a hardware capture sequence. At most one sequence is in
    /// flight at a time.
    pub fn capture(&mut self, frame_count: i32) -> bool {
        if self.state.get() != CameraState::Opened {
            warn!("Capture requested while camera is not opened; rejected");
            return false;
        }
        if self.capturing {
            warn!("Capture requested while a sequence is in flight; rejected");
            return false;
        }
        self.capturing = true;
        self.backend.capture(frame_count);
        true
    }

    pub fn stop_burst(&mut self) {
        self.backend.stop_burst();
    }

    /// Fold one asynchronous hardware result into the device state. Called
    /// on the worker thread for every `DeviceEvent` the sink delivered.
    pub fn handle_event(&mut self, event: &DeviceEvent) {
        match event {
            DeviceEvent::Opened { camera_id } => match self.state.get() {
                CameraState::Opening => {
                    info!("Camera {} opened", camera_id);
                    self.state.set_internal(CameraState::Opened);
                    if let Some(surface) = self.pending_preview {
                        self.backend.create_session(&[surface]);
                    }
                }
                CameraState::Closing => {
                    // Close won the race; the open result is stale.
                    debug!("Stale open result for camera {}; closing", camera_id);
                    self.backend.close();
                }
                state => debug!("Ignoring open result in state {:?}", state),
            },
            DeviceEvent::OpenFailed { camera_id, reason } => {
                warn!("Camera {} failed to open: {}", camera_id, reason);
                self.state.set_internal(CameraState::Closed);
                self.preview_state.set_internal(PreviewState::Stopped);
                self.pending_preview = None;
                self.fault.raise(reason);
            }
            DeviceEvent::Disconnected { camera_id } => {
                warn!("Camera {} disconnected", camera_id);
                self.fault.raise(&format!("camera {} disconnected", camera_id));
                if self.state.get() != CameraState::Closed {
                    self.state.set_internal(CameraState::Closing);
                    self.backend.close();
                }
            }
            DeviceEvent::SessionConfigured => {
                if self.preview_state.get() == PreviewState::Starting {
                    match self.pending_preview.take() {
                        Some(surface) => {
                            self.backend.set_repeating(surface);
                            self.active_surface = Some(surface);
                            self.preview_state.set_internal(PreviewState::Started);
                        }
                        None => debug!("Session configured with no pending surface; stale"),
                    }
                } else {
                    debug!("Stale session configuration; ignored");
                }
            }
            DeviceEvent::SessionConfigureFailed { reason } => {
                warn!("Capture session failed to configure: {}", reason);
                self.pending_preview = None;
                self.preview_state.set_internal(PreviewState::Stopped);
                self.fault.raise(reason);
            }
            DeviceEvent::Shutter { frame_index } => {
                self.shutter.raise(frame_index);
            }
            DeviceEvent::PictureTaken(frame) => {
                self.picture.raise(frame);
            }
            DeviceEvent::CaptureFailed { reason } => {
                warn!("Capture failed: {}", reason);
                self.capturing = false;
                self.capture_failed.raise(reason);
            }
            DeviceEvent::CaptureSequenceEnded { frames_delivered } => {
                debug!("Capture sequence ended after {} frames", frames_delivered);
                self.capturing = false;
            }
            DeviceEvent::Closed { camera_id } => {
                info!("Camera {} closed", camera_id);
                self.state.set_internal(CameraState::Closed);
                self.preview_state.set_internal(PreviewState::Stopped);
                self.pending_preview = None;
                self.active_surface = None;
                self.capturing = false;
            }
            DeviceEvent::Fault { reason } => {
                warn!("Device fault: {}", reason);
                self.fault.raise(reason);
            }
            // Routed by the engine to the controllers; nothing to fold here.
            DeviceEvent::LockAcquired { .. } | DeviceEvent::FocusMoved { .. } => {}
        }
    }
}
