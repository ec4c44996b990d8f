//! Video capture machine: media-recorder lifecycle serialization plus the
//! pause/resume family. All methods run on the camera worker thread.

use super::{CaptureHandle, CaptureState, EngineState, MediaKind};
use crate::backend::EncoderProfile;
use crate::observe::{EventChannel, Property};
use crate::sound::SoundCue;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct VideoMachine {
    pub state: Property<CaptureState>,
    pub failed: EventChannel<String>,
    pub(crate) active: Option<ActiveVideo>,
}

pub(crate) struct ActiveVideo {
    pub(crate) handle: CaptureHandle,
    pub(crate) resolution: (u32, u32),
    pub(crate) output: PathBuf,
    pub(crate) recording: bool,
}

impl VideoMachine {
    pub fn new() -> Self {
        Self {
            state: Property::read_only("video.state", CaptureState::Preparing),
            failed: EventChannel::new("video.failed"),
            active: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.active
            .as_ref()
            .map(|active| active.recording)
            .unwrap_or(false)
    }
}

impl Default for VideoMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineState {
    /// Entry point for a recording request. Unlike photo, there is no
    /// pending slot: anything but `Ready` rejects.
    pub(crate) fn request_video_capture(
        &mut self,
        handle: CaptureHandle,
        resolution: (u32, u32),
        output: PathBuf,
    ) {
        if self.media_type.get() != MediaKind::Video {
            warn!("Video capture rejected: media type is photo");
            handle.close();
            return;
        }
        if self.video.state.get() != CaptureState::Ready {
            warn!(
                "Video capture rejected in state {:?}",
                self.video.state.get()
            );
            handle.close();
            return;
        }

        info!("Video capture {} starting -> {:?}", handle.id(), output);
        self.video.state.set_internal(CaptureState::Starting);
        self.play_cue(SoundCue::RecordStart);

        let id = handle.id();
        self.video.active = Some(ActiveVideo {
            handle,
            resolution,
            output,
            recording: false,
        });

        // The encoder starts after the record cue has had its moment.
        let delay = Duration::from_millis(self.config.capture.record_start_delay_ms);
        let mailbox = self.mailbox.clone();
        if !mailbox.post_delayed(delay, move |state| state.start_video_recorder(id)) {
            warn!("Recorder start for {} dropped; engine is stopping", id);
        }
    }

    /// Deferred encoder start. Re-validates that the request is still the
    /// active, un-cancelled one before touching the recorder.
    pub(crate) fn start_video_recorder(&mut self, id: Uuid) {
        let valid = self
            .video
            .active
            .as_ref()
            .map(|active| active.handle.id() == id && active.handle.is_valid())
            .unwrap_or(false);
        if !valid || self.video.state.get() != CaptureState::Starting {
            debug!("Recorder start for {} is stale; ignored", id);
            return;
        }

        let (resolution, output) = {
            let active = self.video.active.as_ref().expect("validated above");
            (active.resolution, active.output.clone())
        };
        let Some(surface) = self.camera.active_surface() else {
            self.video_failure("preview surface gone before recording");
            return;
        };

        let profile = EncoderProfile::for_resolution(resolution);
        if let Err(e) = self.encoder.prepare(&profile, surface, &output) {
            self.video_failure(&format!("encoder prepare failed: {}", e));
            return;
        }
        if let Err(e) = self.encoder.start() {
            self.encoder.release();
            self.video_failure(&format!("encoder start failed: {}", e));
            return;
        }

        if let Some(active) = &mut self.video.active {
            active.recording = true;
        }
        info!("Recording {} started", id);
        self.video.state.set_internal(CaptureState::Capturing);
    }

    pub(crate) fn pause_video(&mut self) {
        if self.video.state.get() != CaptureState::Capturing {
            debug!("Pause ignored in state {:?}", self.video.state.get());
            return;
        }
        self.video.state.set_internal(CaptureState::Pausing);
        if let Err(e) = self.encoder.pause() {
            self.video_failure(&format!("encoder pause failed: {}", e));
            return;
        }
        self.video.state.set_internal(CaptureState::Paused);
    }

    pub(crate) fn resume_video(&mut self) {
        if self.video.state.get() != CaptureState::Paused {
            debug!("Resume ignored in state {:?}", self.video.state.get());
            return;
        }
        self.video.state.set_internal(CaptureState::Resuming);
        if let Err(e) = self.encoder.resume() {
            self.video_failure(&format!("encoder resume failed: {}", e));
            return;
        }
        self.video.state.set_internal(CaptureState::Capturing);
    }

    /// The video `CaptureHandle` was closed: stop recording. Stale closes
    /// (not the active request) are ignored.
    pub(crate) fn video_handle_closed(&mut self, id: Uuid) {
        let is_active = self
            .video
            .active
            .as_ref()
            .map(|active| active.handle.id() == id)
            .unwrap_or(false);
        if !is_active {
            debug!("Close for {} does not name the active recording; ignored", id);
            return;
        }
        self.stop_video_recording();
    }

    /// `Stopping`: encoder stop, restore the plain preview request so the
    /// recorder surface is cleared, then release.
    pub(crate) fn stop_video_recording(&mut self) {
        let Some(mut active) = self.video.active.take() else {
            return;
        };

        self.video.state.set_internal(CaptureState::Stopping);
        if active.recording {
            active.recording = false;
            if let Err(e) = self.encoder.stop() {
                warn!("Encoder stop failed: {}", e);
            }
        }
        self.play_cue(SoundCue::RecordStop);

        if let Some(surface) = self.camera.active_surface() {
            self.camera.backend_mut().set_repeating(surface);
        }
        self.encoder.release();

        info!(
            "Recording {} stopped -> {:?}",
            active.handle.id(),
            active.output
        );
        active.handle.close();
        let next = self.ready_or_preparing();
        self.video.state.set_internal(next);
    }

    /// Encoder failure: unwind to the nearest stable state and surface the
    /// reason as an event.
    pub(crate) fn video_failure(&mut self, reason: &str) {
        warn!("Video capture failed: {}", reason);
        if let Some(mut active) = self.video.active.take() {
            if active.recording {
                active.recording = false;
                let _ = self.encoder.stop();
            }
            self.encoder.release();
            active.handle.close();
        }
        self.video.failed.raise(&reason.to_string());
        let next = self.ready_or_preparing();
        self.video.state.set_internal(next);
    }

    /// Tear down the recording without ceremony (preview stopped, engine
    /// shutting down). The caller moves the machine to `Preparing`.
    pub(crate) fn abort_video_capture(&mut self, reason: &str) {
        if let Some(mut active) = self.video.active.take() {
            debug!("Aborting recording {}: {}", active.handle.id(), reason);
            if active.recording {
                active.recording = false;
                let _ = self.encoder.stop();
            }
            self.encoder.release();
            active.handle.close();
        }
    }
}
