use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Capture feedback cues the engine can ask to be played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SoundCue {
    Shutter,
    BurstLoop,
    RecordStart,
    RecordStop,
    FocusComplete,
}

struct SoundBankInner {
    resources: HashMap<SoundCue, u32>,
    frozen: bool,
}

/// Cue-to-resource table. Injected configuration: populated once before
/// the engine starts, then frozen — assigning afterwards is a programming
/// error and panics. Reads are lock-cheap and cross-thread safe.
pub struct SoundBank {
    inner: Mutex<SoundBankInner>,
}

impl SoundBank {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SoundBankInner {
                resources: HashMap::new(),
                frozen: false,
            }),
        })
    }

    pub fn assign(&self, cue: SoundCue, resource: u32) {
        let mut inner = self.inner.lock();
        if inner.frozen {
            panic!("sound bank mutated after engine start (cue {:?})", cue);
        }
        inner.resources.insert(cue, resource);
    }

    /// Called by the engine at startup; no further assignment is accepted.
    pub fn freeze(&self) {
        let mut inner = self.inner.lock();
        if !inner.frozen {
            inner.frozen = true;
            debug!("Sound bank frozen with {} cues", inner.resources.len());
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.lock().frozen
    }

    pub fn resource(&self, cue: SoundCue) -> Option<u32> {
        self.inner.lock().resources.get(&cue).copied()
    }
}
