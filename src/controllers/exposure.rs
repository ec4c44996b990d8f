use crate::backend::CameraBackend;
use crate::observe::Property;
use tracing::debug;

/// Exposure satellite: compensation steps plus an AE lock with the same
/// count semantics as the other controllers.
pub struct ExposureController {
    pub compensation: Property<i32>,
    min_compensation: i32,
    max_compensation: i32,
    lock_count: u32,
}

impl ExposureController {
    pub fn new(min_compensation: i32, max_compensation: i32) -> Self {
        Self {
            compensation: Property::read_only("exposure.compensation", 0),
            min_compensation,
            max_compensation,
            lock_count: 0,
        }
    }

    pub fn lock_count(&self) -> u32 {
        self.lock_count
    }

    pub fn set_compensation(&mut self, backend: &mut dyn CameraBackend, steps: i32) -> bool {
        let clamped = steps.clamp(self.min_compensation, self.max_compensation);
        if clamped != steps {
            debug!("Exposure compensation {} clamped to {}", steps, clamped);
        }
        backend.set_exposure_compensation(clamped);
        self.compensation.set_internal(clamped)
    }

    pub fn acquire_lock(&mut self) -> bool {
        self.lock_count += 1;
        self.lock_count == 1
    }

    pub fn release_lock(&mut self) -> bool {
        if self.lock_count == 0 {
            return false;
        }
        self.lock_count -= 1;
        self.lock_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{BackendCall, MockCamera};

    #[test]
    fn compensation_is_clamped_and_observable() {
        let (mut backend, controller) = MockCamera::new();
        let mut exposure = ExposureController::new(-6, 6);

        assert!(exposure.set_compensation(&mut backend, 9));
        assert_eq!(exposure.compensation.get(), 6);
        assert!(controller.calls().contains(&BackendCall::SetExposure(6)));

        // Setting the same clamped value again changes nothing
        assert!(!exposure.set_compensation(&mut backend, 11));
    }

    #[test]
    fn lock_edges_mirror_the_other_controllers() {
        let mut exposure = ExposureController::new(-6, 6);
        assert!(exposure.acquire_lock());
        assert!(!exposure.acquire_lock());
        assert!(!exposure.release_lock());
        assert!(exposure.release_lock());
        assert!(!exposure.release_lock());
    }
}
