use crate::backend::CameraBackend;
use crate::observe::Property;
use tracing::{debug, warn};

/// Zoom satellite. The ratio is clamped to the configured range; while any
/// lock handle is held, ratio changes are rejected.
pub struct ZoomController {
    pub ratio: Property<f32>,
    min_ratio: f32,
    max_ratio: f32,
    lock_count: u32,
}

impl ZoomController {
    pub fn new(min_ratio: f32, max_ratio: f32) -> Self {
        Self {
            ratio: Property::read_only("zoom.ratio", min_ratio),
            min_ratio,
            max_ratio,
            lock_count: 0,
        }
    }

    pub fn lock_count(&self) -> u32 {
        self.lock_count
    }

    pub fn is_locked(&self) -> bool {
        self.lock_count > 0
    }

    /// Apply a new zoom ratio. Rejected (false) while a zoom lock is held.
    pub fn set_ratio(&mut self, backend: &mut dyn CameraBackend, ratio: f32) -> bool {
        if self.is_locked() {
            warn!("Zoom change to {} rejected: zoom is locked", ratio);
            return false;
        }
        let clamped = ratio.clamp(self.min_ratio, self.max_ratio);
        if clamped != ratio {
            debug!("Zoom ratio {} clamped to {}", ratio, clamped);
        }
        backend.set_zoom_ratio(clamped);
        self.ratio.set_internal(clamped);
        true
    }

    pub fn acquire_lock(&mut self) -> bool {
        self.lock_count += 1;
        self.lock_count == 1
    }

    pub fn release_lock(&mut self) -> bool {
        if self.lock_count == 0 {
            warn!("Zoom lock released more times than acquired");
            return false;
        }
        self.lock_count -= 1;
        self.lock_count == 0
    }
}
