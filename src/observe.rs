use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::thread::{self, ThreadId};
use tracing::{debug, trace};

/// Fatal cross-thread assertion for actor-owned state.
///
/// Captures the owning thread at construction; `check` panics when called
/// from any other thread. This is deliberately a panic and not an error:
/// touching actor state off its thread is a programming bug to surface
/// immediately, not a runtime condition to recover from.
#[derive(Debug)]
pub struct ThreadGuard {
    owner: ThreadId,
    name: &'static str,
}

impl ThreadGuard {
    pub fn new(name: &'static str) -> Self {
        Self {
            owner: thread::current().id(),
            name,
        }
    }

    pub fn check(&self) {
        let current = thread::current().id();
        if current != self.owner {
            panic!(
                "'{}' accessed from thread {:?} but is owned by thread {:?}; \
                 cross-thread callers must post to the owning worker",
                self.name, current, self.owner
            );
        }
    }
}

struct CallbackSlot<A> {
    callback: RefCell<Box<dyn FnMut(&A)>>,
}

type SlotList<A> = Rc<RefCell<Vec<Rc<CallbackSlot<A>>>>>;

/// Token for one registered callback. Cancellation takes effect for the
/// next notification; a snapshot already being iterated still runs the
/// callback one last time.
pub struct Subscription<A> {
    list: Weak<RefCell<Vec<Rc<CallbackSlot<A>>>>>,
    slot: Weak<CallbackSlot<A>>,
}

impl<A> Subscription<A> {
    pub fn cancel(&self) {
        if let (Some(list), Some(slot)) = (self.list.upgrade(), self.slot.upgrade()) {
            list.borrow_mut().retain(|s| !Rc::ptr_eq(s, &slot));
        }
    }
}

fn notify_slots<A>(list: &SlotList<A>, args: &A) {
    // Copy-on-write snapshot: callbacks added during this notification are
    // deferred to the next one, removed callbacks still run for this pass.
    let snapshot: Vec<Rc<CallbackSlot<A>>> = list.borrow().clone();
    for slot in snapshot {
        // A callback that reentrantly triggers itself is skipped for the
        // nested pass instead of aliasing its own mutable borrow.
        if let Ok(mut callback) = slot.callback.try_borrow_mut() {
            callback(args);
        }
    }
}

fn subscribe_slot<A>(list: &SlotList<A>, callback: Box<dyn FnMut(&A)>) -> Subscription<A> {
    let slot = Rc::new(CallbackSlot {
        callback: RefCell::new(callback),
    });
    list.borrow_mut().push(Rc::clone(&slot));
    Subscription {
        list: Rc::downgrade(list),
        slot: Rc::downgrade(&slot),
    }
}

/// The (old, new) pair delivered to property callbacks.
pub struct Change<T> {
    pub old: T,
    pub new: T,
}

/// Observable typed value owned by exactly one worker thread.
///
/// Change notification fires synchronously on the owning thread, in
/// registration order. A `set` that does not change the value raises
/// nothing. A nested `set` from inside a callback bumps the version and
/// short-circuits the stale outer iteration.
pub struct Property<T: Clone + PartialEq> {
    name: &'static str,
    guard: ThreadGuard,
    read_only: bool,
    value: RefCell<T>,
    version: Cell<u64>,
    list: SlotList<Change<T>>,
}

impl<T: Clone + PartialEq> Property<T> {
    pub fn new(name: &'static str, default: T) -> Self {
        Self {
            name,
            guard: ThreadGuard::new(name),
            read_only: false,
            value: RefCell::new(default),
            version: Cell::new(0),
            list: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// A property only the owning component may mutate, through
    /// `set_internal`.
    pub fn read_only(name: &'static str, default: T) -> Self {
        let mut property = Self::new(name, default);
        property.read_only = true;
        property
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn get(&self) -> T {
        self.guard.check();
        self.value.borrow().clone()
    }

    /// Set from outside the owning component. Mutating a read-only
    /// property is a programming error and panics.
    pub fn set(&self, value: T) -> bool {
        self.guard.check();
        if self.read_only {
            panic!("property '{}' is read-only to external callers", self.name);
        }
        self.apply(value)
    }

    /// Owner-side set that bypasses the read-only check.
    pub fn set_internal(&self, value: T) -> bool {
        self.guard.check();
        self.apply(value)
    }

    fn apply(&self, value: T) -> bool {
        if *self.value.borrow() == value {
            return false;
        }

        let old = self.value.replace(value.clone());
        let version = self.version.get().wrapping_add(1);
        self.version.set(version);
        trace!("Property '{}' changed (v{})", self.name, version);

        let change = Change { old, new: value };
        let snapshot: Vec<Rc<CallbackSlot<Change<T>>>> = self.list.borrow().clone();
        for slot in snapshot {
            if let Ok(mut callback) = slot.callback.try_borrow_mut() {
                callback(&change);
            }
            // A reentrant set already notified with fresher values; the
            // rest of this iteration is stale.
            if self.version.get() != version {
                debug!(
                    "Property '{}' notification superseded at v{}",
                    self.name, version
                );
                break;
            }
        }
        true
    }

    pub fn subscribe<F: FnMut(&Change<T>) + 'static>(&self, callback: F) -> Subscription<Change<T>> {
        self.guard.check();
        subscribe_slot(&self.list, Box::new(callback))
    }

    pub fn callback_count(&self) -> usize {
        self.guard.check();
        self.list.borrow().len()
    }
}

/// Typed fire-and-forget event dispatch with the same callback-list
/// semantics as `Property`.
pub struct EventChannel<A> {
    name: &'static str,
    guard: ThreadGuard,
    list: SlotList<A>,
}

impl<A> EventChannel<A> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            guard: ThreadGuard::new(name),
            list: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn raise(&self, args: &A) {
        self.guard.check();
        trace!("Event '{}' raised", self.name);
        notify_slots(&self.list, args);
    }

    pub fn subscribe<F: FnMut(&A) + 'static>(&self, callback: F) -> Subscription<A> {
        self.guard.check();
        subscribe_slot(&self.list, Box::new(callback))
    }

    pub fn callback_count(&self) -> usize {
        self.guard.check();
        self.list.borrow().len()
    }
}
