//! Satellite state machines that mutate device settings on behalf of the
//! engine. Each lives on the camera worker thread next to the device
//! wrapper; hardware mutation goes through the backend reference the
//! engine passes in at the call site.

mod exposure;
mod focus;
mod zoom;

pub use exposure::ExposureController;
pub use focus::{AfFlags, AfRequestOutcome, FocusController, FocusState};
pub use zoom::ZoomController;
