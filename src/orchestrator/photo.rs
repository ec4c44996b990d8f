//! Photo capture machine: focus interlock, burst handling, the pending
//! capture slot, and the review step. All methods run on the camera
//! worker thread.

use super::{CaptureHandle, CaptureState, EngineState, MediaKind};
use crate::backend::{AfMode, PictureFrame};
use crate::camera::PreviewState;
use crate::controllers::FocusState;
use crate::handle::Handle;
use crate::observe::Property;
use crate::sound::SoundCue;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

pub struct PhotoMachine {
    pub state: Property<CaptureState>,
    pub(crate) active: Option<ActivePhoto>,
    /// At most one deferred request, honored after the in-flight capture
    /// completes if it is still inside its grace window.
    pub(crate) pending: Option<CaptureHandle>,
    /// Request parked while focus is scanning.
    pub(crate) focus_wait: Option<CaptureHandle>,
    /// Request waiting for the single-AF focus lock acknowledgement.
    pub(crate) awaiting_lock: Option<AwaitingLock>,
}

pub(crate) struct ActivePhoto {
    pub(crate) handle: CaptureHandle,
    pub(crate) loop_sound: Option<Handle>,
    pub(crate) focus_lock: Option<Handle>,
    pub(crate) frames: u32,
}

pub(crate) struct AwaitingLock {
    pub(crate) handle: CaptureHandle,
    pub(crate) lock: Handle,
}

impl PhotoMachine {
    pub fn new() -> Self {
        Self {
            state: Property::read_only("photo.state", CaptureState::Preparing),
            active: None,
            pending: None,
            focus_wait: None,
            awaiting_lock: None,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn active_frames(&self) -> u32 {
        self.active.as_ref().map(|active| active.frames).unwrap_or(0)
    }
}

impl Default for PhotoMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineState {
    /// Entry point for a photo capture request.
    pub(crate) fn request_photo_capture(&mut self, handle: CaptureHandle) {
        if self.media_type.get() != MediaKind::Photo {
            warn!("Photo capture rejected: media type is video");
            handle.close();
            return;
        }
        let frame_count = handle.frame_count();
        if frame_count == 0 || frame_count > self.config.capture.max_burst_frames as i32 {
            warn!("Photo capture rejected: frame count {}", frame_count);
            handle.close();
            return;
        }

        match self.photo.state.get() {
            CaptureState::Ready => self.begin_photo_capture(handle),
            CaptureState::Starting
            | CaptureState::Capturing
            | CaptureState::Stopping
            | CaptureState::Reviewing => {
                debug!("Capture in flight; request {} queued as pending", handle.id());
                if let Some(replaced) = self.photo.pending.replace(handle) {
                    debug!("Pending capture {} replaced", replaced.id());
                    replaced.close();
                }
            }
            state => {
                warn!("Photo capture rejected in state {:?}", state);
                handle.close();
            }
        }
    }

    /// Move `Ready → Starting` and run the focus interlock before the
    /// hardware trigger.
    pub(crate) fn begin_photo_capture(&mut self, handle: CaptureHandle) {
        if !handle.is_valid() {
            debug!("Capture {} cancelled before start", handle.id());
            let next = self.ready_or_preparing();
            self.photo.state.set_internal(next);
            return;
        }

        self.photo.state.set_internal(CaptureState::Starting);

        match self.focus.state.get() {
            FocusState::Scanning => {
                debug!("Focus is scanning; capture {} parked", handle.id());
                if let Some(replaced) = self.photo.focus_wait.replace(handle) {
                    replaced.close();
                }
            }
            FocusState::Focused if self.focus.current_mode() == Some(AfMode::Single) => {
                let (lock, outstanding) = self.acquire_focus_lock_for_capture();
                if outstanding {
                    debug!("Deferring trigger until the focus lock completes");
                    self.photo.awaiting_lock = Some(AwaitingLock { handle, lock });
                } else {
                    // The lock was already engaged by another holder; no
                    // acknowledgement will arrive.
                    self.trigger_photo_capture(handle, Some(lock));
                }
            }
            _ => self.trigger_photo_capture(handle, None),
        }
    }

    /// Issue the hardware capture. `Starting → Capturing`.
    pub(crate) fn trigger_photo_capture(
        &mut self,
        handle: CaptureHandle,
        focus_lock: Option<Handle>,
    ) {
        if !handle.is_valid() {
            debug!("Capture {} cancelled before trigger", handle.id());
            if let Some(lock) = focus_lock {
                lock.close();
            }
            let next = self.ready_or_preparing();
            self.photo.state.set_internal(next);
            self.service_pending_photo();
            return;
        }
        if self.camera.preview_state.get() != PreviewState::Started {
            warn!("Preview gone before trigger; capture {} dropped", handle.id());
            if let Some(lock) = focus_lock {
                lock.close();
            }
            handle.close();
            self.photo.state.set_internal(CaptureState::Preparing);
            return;
        }

        let frame_count = handle.frame_count();
        // Burst suppresses the per-shot shutter cue in favor of one loop.
        let loop_sound = if frame_count == 1 {
            self.play_cue(SoundCue::Shutter);
            None
        } else {
            self.play_loop_cue(SoundCue::BurstLoop)
        };

        if !self.camera.capture(frame_count) {
            warn!("Hardware rejected capture {}", handle.id());
            if let Some(sound) = loop_sound {
                sound.close();
            }
            if let Some(lock) = focus_lock {
                lock.close();
            }
            handle.close();
            let next = self.ready_or_preparing();
            self.photo.state.set_internal(next);
            self.service_pending_photo();
            return;
        }

        info!("Photo capture {} started ({} frames)", handle.id(), frame_count);
        self.photo.state.set_internal(CaptureState::Capturing);
        self.photo.active = Some(ActivePhoto {
            handle,
            loop_sound,
            focus_lock,
            frames: 0,
        });
    }

    /// Focus left `Scanning`: resume the parked request, if any.
    pub(crate) fn resume_parked_photo(&mut self) {
        if let Some(handle) = self.photo.focus_wait.take() {
            debug!("Focus settled; resuming parked capture {}", handle.id());
            self.begin_photo_capture(handle);
        }
    }

    /// The single-AF focus lock acknowledged: run the deferred trigger.
    pub(crate) fn on_focus_lock_acquired(&mut self) {
        if let Some(AwaitingLock { handle, lock }) = self.photo.awaiting_lock.take() {
            self.trigger_photo_capture(handle, Some(lock));
        }
    }

    /// A frame arrived. Counted only while its capture is still the
    /// active, un-cancelled one; stale frames are dropped. Either way the
    /// payload buffer goes back to the pool once marshalling is done.
    pub(crate) fn on_picture_delivered(&mut self, frame: PictureFrame) {
        match &mut self.photo.active {
            Some(active) if active.handle.is_valid() => {
                active.frames += 1;
                trace!(
                    "Frame {} delivered for capture {}",
                    frame.frame_index,
                    active.handle.id()
                );
            }
            _ => debug!("Stale frame {} dropped", frame.frame_index),
        }
        self.pool.recycle(frame.data);
    }

    /// Hardware capture sequence ended. `Capturing/Stopping → Stopping →
    /// (Reviewing | Ready | Preparing)`, then the pending slot is
    /// serviced.
    pub(crate) fn finish_photo_capture(&mut self, frames_delivered: u32) {
        let Some(mut active) = self.photo.active.take() else {
            debug!("Capture sequence ended with no active capture; stale");
            return;
        };

        if let Some(loop_sound) = active.loop_sound.take() {
            loop_sound.close();
        }
        if let Some(focus_lock) = active.focus_lock.take() {
            focus_lock.close();
        }
        self.photo.state.set_internal(CaptureState::Stopping);

        if active.handle.flags().review && active.handle.is_valid() {
            info!("Capture {} finished; entering review", active.handle.id());
            self.photo.active = Some(active);
            self.photo.state.set_internal(CaptureState::Reviewing);
            return;
        }

        info!(
            "Photo capture {} completed after {} frames",
            active.handle.id(),
            frames_delivered
        );
        active.handle.close();
        let next = self.ready_or_preparing();
        self.photo.state.set_internal(next);
        self.service_pending_photo();
    }

    /// Honor the pending slot if the request is still inside its grace
    /// window; discard it otherwise.
    pub(crate) fn service_pending_photo(&mut self) {
        let Some(pending) = self.photo.pending.take() else {
            return;
        };
        if self.photo.state.get() != CaptureState::Ready {
            debug!("Pending capture {} discarded: not ready", pending.id());
            pending.close();
            return;
        }
        if !pending.is_valid() {
            debug!("Pending capture {} was already cancelled", pending.id());
            return;
        }
        if pending.age() <= self.pending_grace() {
            info!("Replaying pending capture {}", pending.id());
            self.begin_photo_capture(pending);
        } else {
            debug!(
                "Pending capture {} outlived its grace window; discarded",
                pending.id()
            );
            pending.close();
        }
    }

    /// A photo `CaptureHandle` was closed. Handlers re-validate that the
    /// handle still names the active (or queued) request before acting —
    /// closes racing a completion already queued behind them are echoes to
    /// ignore.
    pub(crate) fn photo_handle_closed(&mut self, id: Uuid) {
        if self
            .photo
            .pending
            .as_ref()
            .map(|pending| pending.id() == id)
            .unwrap_or(false)
        {
            debug!("Pending capture {} cancelled", id);
            self.photo.pending = None;
            return;
        }

        if self
            .photo
            .focus_wait
            .as_ref()
            .map(|parked| parked.id() == id)
            .unwrap_or(false)
        {
            debug!("Parked capture {} cancelled", id);
            self.photo.focus_wait = None;
            let next = self.ready_or_preparing();
            self.photo.state.set_internal(next);
            return;
        }

        if self
            .photo
            .awaiting_lock
            .as_ref()
            .map(|awaiting| awaiting.handle.id() == id)
            .unwrap_or(false)
        {
            debug!("Lock-deferred capture {} cancelled", id);
            let awaiting = self.photo.awaiting_lock.take().expect("checked above");
            awaiting.lock.close();
            let next = self.ready_or_preparing();
            self.photo.state.set_internal(next);
            return;
        }

        let is_active = self
            .photo
            .active
            .as_ref()
            .map(|active| active.handle.id() == id)
            .unwrap_or(false);
        if !is_active {
            debug!("Close for {} does not name the active capture; ignored", id);
            return;
        }

        // An explicit stop also invalidates whatever was queued behind it.
        if let Some(pending) = self.photo.pending.take() {
            debug!("Pending capture {} invalidated by the stop", pending.id());
            pending.close();
        }

        match self.photo.state.get() {
            CaptureState::Capturing => {
                let frame_count = self
                    .photo
                    .active
                    .as_ref()
                    .map(|active| active.handle.frame_count())
                    .unwrap_or(1);
                info!("Photo capture {} cancelled by its holder", id);
                self.photo.state.set_internal(CaptureState::Stopping);
                if let Some(active) = &mut self.photo.active {
                    if let Some(loop_sound) = active.loop_sound.take() {
                        loop_sound.close();
                    }
                }
                if frame_count != 1 {
                    // Normal end of a burst, not an error path: ask the
                    // hardware to stop; the sequence-ended event finishes
                    // the unwind.
                    self.camera.stop_burst();
                }
                // A single shot cannot be recalled; the sequence runs out
                // on its own and the stale frames are dropped.
            }
            CaptureState::Reviewing => {
                debug!("Review for {} dismissed by close", id);
                self.photo.active = None;
                let next = self.ready_or_preparing();
                self.photo.state.set_internal(next);
            }
            state => {
                debug!("Active capture {} closed in state {:?}", id, state);
            }
        }
    }

    /// `complete_capture` for a capture parked in `Reviewing`.
    pub(crate) fn complete_photo_capture(&mut self, id: Uuid) {
        if self.photo.state.get() != CaptureState::Reviewing {
            debug!("Complete-capture ignored outside review");
            return;
        }
        let is_active = self
            .photo
            .active
            .as_ref()
            .map(|active| active.handle.id() == id)
            .unwrap_or(false);
        if !is_active {
            debug!("Complete-capture for {} does not name the review; ignored", id);
            return;
        }

        let active = self.photo.active.take().expect("checked above");
        info!("Review for {} completed", id);
        active.handle.close();
        let next = self.ready_or_preparing();
        self.photo.state.set_internal(next);
        self.service_pending_photo();
    }

    /// Capture failed at the hardware: unwind to the nearest stable state
    /// and let the pending slot run its bounded replay.
    pub(crate) fn on_photo_capture_failed(&mut self, reason: &str) {
        let Some(mut active) = self.photo.active.take() else {
            return;
        };
        warn!("Photo capture {} failed: {}", active.handle.id(), reason);
        if let Some(loop_sound) = active.loop_sound.take() {
            loop_sound.close();
        }
        if let Some(focus_lock) = active.focus_lock.take() {
            focus_lock.close();
        }
        active.handle.close();
        self.photo.state.set_internal(CaptureState::Stopping);
        let next = self.ready_or_preparing();
        self.photo.state.set_internal(next);
        self.service_pending_photo();
    }

    /// Tear down every photo-side slot. The caller moves the machine to
    /// `Preparing` afterwards.
    pub(crate) fn abort_photo_capture(&mut self, reason: &str) {
        if let Some(mut active) = self.photo.active.take() {
            debug!("Aborting photo capture {}: {}", active.handle.id(), reason);
            if let Some(loop_sound) = active.loop_sound.take() {
                loop_sound.close();
            }
            if let Some(focus_lock) = active.focus_lock.take() {
                focus_lock.close();
            }
            if self.photo.state.get() == CaptureState::Capturing
                && active.handle.frame_count() != 1
            {
                self.camera.stop_burst();
            }
            active.handle.close();
        }
        if let Some(pending) = self.photo.pending.take() {
            pending.close();
        }
        if let Some(parked) = self.photo.focus_wait.take() {
            parked.close();
        }
        if let Some(awaiting) = self.photo.awaiting_lock.take() {
            awaiting.lock.close();
            awaiting.handle.close();
        }
    }
}
