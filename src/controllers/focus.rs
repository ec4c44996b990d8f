use crate::backend::{AfMode, CameraBackend, FocusSignal, MeteringRegion};
use crate::handle::Handle;
use crate::observe::Property;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusState {
    Idle,
    Scanning,
    Focused,
    Unfocused,
}

impl FocusState {
    fn from_signal(signal: FocusSignal) -> Self {
        match signal {
            FocusSignal::Idle => FocusState::Idle,
            FocusSignal::Scanning => FocusState::Scanning,
            FocusSignal::Focused => FocusState::Focused,
            FocusSignal::Unfocused => FocusState::Unfocused,
        }
    }
}

/// Auto-focus request flags. Exactly one of the two modes must be set;
/// anything else is a programming error.
#[derive(Debug, Clone, Copy, Default)]
pub struct AfFlags {
    pub single: bool,
    pub continuous: bool,
}

impl AfFlags {
    pub const SINGLE: AfFlags = AfFlags {
        single: true,
        continuous: false,
    };
    pub const CONTINUOUS: AfFlags = AfFlags {
        single: false,
        continuous: true,
    };

    fn mode(self) -> AfMode {
        match (self.single, self.continuous) {
            (true, false) => AfMode::Single,
            (false, true) => AfMode::Continuous,
            (true, true) => panic!("SINGLE_AF and CONTINUOUS_AF are mutually exclusive"),
            (false, false) => panic!("an auto-focus request must carry exactly one AF mode"),
        }
    }

    /// Fail fast on the calling thread for conflicting flags.
    pub fn validate(self) {
        let _ = self.mode();
    }
}

/// What a focus-signal fold did, so the engine can react (resume a parked
/// capture, complete a deferred trigger).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AfRequestOutcome {
    pub left_scanning: bool,
}

struct AfRequest {
    handle: Handle,
    regions: Vec<MeteringRegion>,
    mode: AfMode,
}

/// Auto-focus satellite. Holds at most one scan in flight and a one-deep
/// queue of the next request; a newer unresolved request silently replaces
/// the older one. Lock handles use count semantics: only the 0→1 and 1→0
/// transitions reach the hardware.
pub struct FocusController {
    pub state: Property<FocusState>,
    max_regions: usize,
    lock_count: u32,
    last_mode: Option<AfMode>,
    active: Option<AfRequest>,
    pending: Option<AfRequest>,
}

impl FocusController {
    pub fn new(max_regions: usize) -> Self {
        Self {
            state: Property::read_only("focus.state", FocusState::Idle),
            max_regions,
            lock_count: 0,
            last_mode: None,
            active: None,
            pending: None,
        }
    }

    pub fn current_mode(&self) -> Option<AfMode> {
        self.last_mode
    }

    pub fn lock_count(&self) -> u32 {
        self.lock_count
    }

    /// Start (or queue) an auto-focus scan tracked by `handle`. The handle
    /// closes when the scan resolves, is replaced, or is cancelled.
    pub fn start_auto_focus(
        &mut self,
        backend: &mut dyn CameraBackend,
        handle: Handle,
        mut regions: Vec<MeteringRegion>,
        flags: AfFlags,
    ) {
        let mode = flags.mode();
        if regions.len() > self.max_regions {
            warn!(
                "Auto-focus request with {} regions truncated to {}",
                regions.len(),
                self.max_regions
            );
            regions.truncate(self.max_regions);
        }

        let request = AfRequest {
            handle,
            regions,
            mode,
        };
        self.last_mode = Some(mode);

        if self.active.is_some() {
            // A newer request replaces the unresolved one (depth-1 queue).
            if let Some(replaced) = self.pending.replace(request) {
                debug!("Replacing unresolved auto-focus request");
                replaced.handle.close();
            }
        } else {
            backend.trigger_auto_focus(&request.regions, request.mode);
            self.active = Some(request);
        }
    }

    /// Cancel whichever request (active or queued) owns `handle`.
    pub fn cancel_request(&mut self, backend: &mut dyn CameraBackend, handle: &Handle) {
        if self
            .pending
            .as_ref()
            .map(|request| request.handle == *handle)
            .unwrap_or(false)
        {
            self.pending = None;
            return;
        }
        if self
            .active
            .as_ref()
            .map(|request| request.handle == *handle)
            .unwrap_or(false)
        {
            self.active = None;
            backend.cancel_auto_focus();
        }
    }

    /// Fold a hardware focus signal. Leaving `Scanning` resolves exactly
    /// one request (the one that started the scan) and promotes the queued
    /// one, if any.
    pub fn on_signal(
        &mut self,
        backend: &mut dyn CameraBackend,
        signal: FocusSignal,
    ) -> AfRequestOutcome {
        let old = self.state.get();
        let new = FocusState::from_signal(signal);
        self.state.set_internal(new);

        let left_scanning = old == FocusState::Scanning && new != FocusState::Scanning;
        if left_scanning {
            if let Some(resolved) = self.active.take() {
                debug!("Auto-focus request resolved: {:?}", new);
                resolved.handle.close();
            }
            if let Some(next) = self.pending.take() {
                backend.trigger_auto_focus(&next.regions, next.mode);
                self.active = Some(next);
            }
        }

        AfRequestOutcome { left_scanning }
    }

    /// Count one more lock holder. Returns true when this is the 0→1
    /// transition and the hardware lock must actually be engaged.
    pub fn acquire_lock(&mut self) -> bool {
        self.lock_count += 1;
        self.lock_count == 1
    }

    /// Count one lock holder gone. Returns true when this was the 1→0
    /// transition and the hardware lock must be released.
    pub fn release_lock(&mut self) -> bool {
        if self.lock_count == 0 {
            warn!("Focus lock released more times than acquired");
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

    fn region() -> MeteringRegion {
        MeteringRegion {
            x: 0.4,
            y: 0.4,
            width: 0.2,
            height: 0.2,
        }
    }

    #[test]
    #[should_panic(expected = "mutually exclusive")]
    fn both_af_flags_panic() {
        AfFlags {
            single: true,
            continuous: true,
        }
        .mode();
    }

    #[test]
    fn newer_request_replaces_unresolved_one() {
        let (mut backend, controller) = MockCamera::new();
        controller.manual_focus(true);
        let mut focus = FocusController::new(4);

        let first = Handle::new();
        focus.start_auto_focus(&mut backend, first.clone(), vec![region()], AfFlags::SINGLE);
        focus.on_signal(&mut backend, FocusSignal::Scanning);

        // Two more requests while the scan is unresolved: only the newest
        // stays queued, the squeezed-out one is closed.
        let second = Handle::new();
        focus.start_auto_focus(&mut backend, second.clone(), vec![region()], AfFlags::SINGLE);
        let third = Handle::new();
        focus.start_auto_focus(&mut backend, third.clone(), vec![region()], AfFlags::SINGLE);
        assert!(first.is_valid(), "active scan is still unresolved");
        assert!(!second.is_valid(), "replaced request is closed");
        assert!(third.is_valid());

        // Scan resolves: first closes, third is promoted and triggers.
        let outcome = focus.on_signal(&mut backend, FocusSignal::Focused);
        assert!(outcome.left_scanning);
        assert!(!first.is_valid());
        assert!(third.is_valid(), "promoted request is now scanning");

        let triggers = controller
            .calls()
            .iter()
            .filter(|call| matches!(call, BackendCall::TriggerAutoFocus(_)))
            .count();
        assert_eq!(triggers, 2);
    }

    #[test]
    fn cancelling_the_active_request_cancels_hardware() {
        let (mut backend, controller) = MockCamera::new();
        controller.manual_focus(true);
        let mut focus = FocusController::new(4);

        let handle = Handle::new();
        focus.start_auto_focus(&mut backend, handle.clone(), vec![region()], AfFlags::CONTINUOUS);
        focus.cancel_request(&mut backend, &handle);

        assert!(controller.calls().contains(&BackendCall::CancelAutoFocus));
    }

    #[test]
    fn lock_count_reaches_hardware_only_on_edges() {
        let mut focus = FocusController::new(4);

        assert!(focus.acquire_lock(), "0→1 engages the hardware");
        assert!(!focus.acquire_lock(), "1→2 is a state no-op");
        assert!(!focus.acquire_lock());

        assert!(!focus.release_lock(), "3→2 is a state no-op");
        assert!(!focus.release_lock());
        assert!(focus.release_lock(), "1→0 releases the hardware");
        assert!(!focus.release_lock(), "over-release is tolerated");
    }

    #[test]
    fn regions_are_truncated_to_the_configured_limit() {
        let (mut backend, _controller) = MockCamera::new();
        let mut focus = FocusController::new(2);
        focus.start_auto_focus(
            &mut backend,
            Handle::new(),
            vec![region(); 5],
            AfFlags::CONTINUOUS,
        );
        // Still accepted; the active request carries at most 2 regions.
        assert_eq!(focus.current_mode(), Some(AfMode::Continuous));
    }
}
