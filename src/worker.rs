use crate::error::{CamrigError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Worker lifecycle. Transitions run strictly forward; a stopped worker
/// never restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    New,
    Starting,
    Running,
    Stopping,
    Stopped,
}

type Runnable<S> = Box<dyn FnOnce(&mut S) + Send>;
type InitFn<S> = Box<dyn FnOnce(&Mailbox<S>) -> S + Send>;

enum Envelope<S> {
    Run {
        run: Runnable<S>,
        unique: Option<(String, u64)>,
    },
    Quit,
}

struct TimerEntry<S> {
    due: Instant,
    seq: u64,
    envelope: Envelope<S>,
}

impl<S> PartialEq for TimerEntry<S> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<S> Eq for TimerEntry<S> {}

impl<S> PartialOrd for TimerEntry<S> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<S> Ord for TimerEntry<S> {
    // Inverted so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct MailboxInner<S> {
    state: WorkerState,
    open: bool,
    queue: VecDeque<Envelope<S>>,
    timers: BinaryHeap<TimerEntry<S>>,
    unique_gens: HashMap<String, u64>,
    seq: u64,
}

struct Shared<S> {
    name: String,
    inner: Mutex<MailboxInner<S>>,
    cond: Condvar,
    thread_id: OnceLock<ThreadId>,
}

/// Cross-thread sender half of a worker. Cloneable; every mutation of the
/// worker-owned state goes through `post` and runs on the worker thread.
pub struct Mailbox<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for Mailbox<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S> Mailbox<S> {
    /// Enqueue a message. Returns false when the worker has no live queue
    /// (not yet started, or already torn down) — the operation is dropped
    /// and the caller must not assume delivery.
    pub fn post<F: FnOnce(&mut S) + Send + 'static>(&self, run: F) -> bool {
        self.enqueue(
            Envelope::Run {
                run: Box::new(run),
                unique: None,
            },
            None,
        )
    }

    /// Enqueue a message that fires after `delay`.
    pub fn post_delayed<F: FnOnce(&mut S) + Send + 'static>(
        &self,
        delay: Duration,
        run: F,
    ) -> bool {
        self.enqueue(
            Envelope::Run {
                run: Box::new(run),
                unique: None,
            },
            Some(delay),
        )
    }

    /// Enqueue a tagged message, invalidating any pending message with the
    /// same tag before it runs. Repeated posts coalesce to the newest one.
    pub fn post_unique<F: FnOnce(&mut S) + Send + 'static>(
        &self,
        tag: &str,
        delay: Option<Duration>,
        run: F,
    ) -> bool {
        let unique = {
            let mut inner = self.shared.inner.lock();
            if !inner.open {
                debug!(
                    "Worker '{}' has no live queue; dropping unique message '{}'",
                    self.shared.name, tag
                );
                return false;
            }
            let gen = inner
                .unique_gens
                .entry(tag.to_string())
                .and_modify(|g| *g += 1)
                .or_insert(1);
            Some((tag.to_string(), *gen))
        };
        self.enqueue(
            Envelope::Run {
                run: Box::new(run),
                unique,
            },
            delay,
        )
    }

    fn enqueue(&self, envelope: Envelope<S>, delay: Option<Duration>) -> bool {
        let mut inner = self.shared.inner.lock();
        if !inner.open {
            debug!(
                "Worker '{}' has no live queue; dropping message",
                self.shared.name
            );
            return false;
        }
        match delay {
            Some(delay) => {
                inner.seq += 1;
                let entry = TimerEntry {
                    due: Instant::now() + delay,
                    seq: inner.seq,
                    envelope,
                };
                inner.timers.push(entry);
            }
            None => inner.queue.push_back(envelope),
        }
        self.shared.cond.notify_one();
        true
    }

    /// Current lifecycle state of the worker behind this mailbox.
    pub fn state(&self) -> WorkerState {
        self.shared.inner.lock().state
    }

    /// Whether the calling thread is the worker thread.
    pub fn is_current(&self) -> bool {
        self.shared.thread_id.get().copied() == Some(thread::current().id())
    }

    /// Fatal assertion that the caller is on the worker thread.
    pub fn verify_access(&self) {
        let current = thread::current().id();
        if self.shared.thread_id.get().copied() != Some(current) {
            panic!(
                "worker '{}' state accessed from thread {:?}; \
                 cross-thread callers must post",
                self.shared.name, current
            );
        }
    }
}

/// A single OS thread draining a FIFO mailbox. All mutation of the state
/// `S` happens on this thread; `S` is built on the thread by the init
/// closure and never leaves it.
pub struct Worker<S> {
    shared: Arc<Shared<S>>,
    init: Mutex<Option<InitFn<S>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    exit_rx: crossbeam::channel::Receiver<()>,
    exit_tx: Mutex<Option<crossbeam::channel::Sender<()>>>,
}

impl<S: 'static> Worker<S> {
    pub fn new<F>(name: &str, init: F) -> Self
    where
        F: FnOnce(&Mailbox<S>) -> S + Send + 'static,
    {
        let (exit_tx, exit_rx) = crossbeam::channel::bounded(1);
        Self {
            shared: Arc::new(Shared {
                name: name.to_string(),
                inner: Mutex::new(MailboxInner {
                    state: WorkerState::New,
                    open: false,
                    queue: VecDeque::new(),
                    timers: BinaryHeap::new(),
                    unique_gens: HashMap::new(),
                    seq: 0,
                }),
                cond: Condvar::new(),
                thread_id: OnceLock::new(),
            }),
            init: Mutex::new(Some(Box::new(init))),
            thread: Mutex::new(None),
            exit_rx,
            exit_tx: Mutex::new(Some(exit_tx)),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn mailbox(&self) -> Mailbox<S> {
        Mailbox {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.shared.inner.lock().state
    }

    /// Spawn the worker thread. Starting twice is a programming error.
    pub fn start(&self) -> Result<()> {
        if !self.claim_start() {
            panic!(
                "worker '{}' started twice (state {:?})",
                self.shared.name,
                self.state()
            );
        }
        self.spawn_thread()
    }

    // Atomically claim the NEW -> STARTING transition.
    fn claim_start(&self) -> bool {
        let mut inner = self.shared.inner.lock();
        if inner.state != WorkerState::New {
            return false;
        }
        inner.state = WorkerState::Starting;
        inner.open = true;
        true
    }

    fn spawn_thread(&self) -> Result<()> {
        let init = self
            .init
            .lock()
            .take()
            .expect("worker init closure already consumed");
        let exit_tx = self
            .exit_tx
            .lock()
            .take()
            .expect("worker exit channel already consumed");
        let shared = Arc::clone(&self.shared);

        let handle = thread::Builder::new()
            .name(self.shared.name.clone())
            .spawn(move || {
                run_loop(shared, init);
                let _ = exit_tx.send(());
            })
            .map_err(|e| CamrigError::system(format!("failed to spawn worker thread: {}", e)))?;

        *self.thread.lock() = Some(handle);
        info!("Worker '{}' started", self.shared.name);
        Ok(())
    }

    /// Schedule shutdown. Idempotent. Messages already queued still run;
    /// messages posted after release are dropped. A worker that was never
    /// started is force-started first so its thread spins up and drains,
    /// rather than leaking a half-initialized mailbox.
    pub fn release(&self) {
        if self.claim_start() {
            debug!(
                "Worker '{}' released before start; force-starting to drain",
                self.shared.name
            );
            if self.spawn_thread().is_err() {
                let mut inner = self.shared.inner.lock();
                inner.state = WorkerState::Stopped;
                inner.open = false;
                return;
            }
        }

        let mut inner = self.shared.inner.lock();
        match inner.state {
            WorkerState::Starting | WorkerState::Running => {
                inner.state = WorkerState::Stopping;
                inner.open = false;
                inner.queue.push_back(Envelope::Quit);
                self.shared.cond.notify_one();
                info!("Worker '{}' release scheduled", self.shared.name);
            }
            WorkerState::Stopping | WorkerState::Stopped => {
                trace!("Worker '{}' already releasing", self.shared.name);
            }
            WorkerState::New => unreachable!("force-start above"),
        }
    }

    /// Wait for the worker thread to exit after `release`. Returns false
    /// on timeout; the thread is left running in that case.
    pub fn join_timeout(&self, timeout: Duration) -> bool {
        match self.exit_rx.recv_timeout(timeout) {
            Ok(()) => {
                if let Some(handle) = self.thread.lock().take() {
                    let _ = handle.join();
                }
                true
            }
            Err(_) => {
                warn!(
                    "Worker '{}' did not stop within {:?}",
                    self.shared.name, timeout
                );
                false
            }
        }
    }
}

fn run_loop<S>(shared: Arc<Shared<S>>, init: InitFn<S>) {
    shared
        .thread_id
        .set(thread::current().id())
        .expect("worker thread id set twice");

    {
        let mut inner = shared.inner.lock();
        if inner.state == WorkerState::Starting {
            inner.state = WorkerState::Running;
        }
    }

    let mailbox = Mailbox {
        shared: Arc::clone(&shared),
    };
    let mut state = init(&mailbox);
    debug!("Worker '{}' loop entered", shared.name);

    loop {
        let envelope = {
            let mut inner = shared.inner.lock();
            loop {
                let now = Instant::now();
                while inner
                    .timers
                    .peek()
                    .map(|entry| entry.due <= now)
                    .unwrap_or(false)
                {
                    let entry = inner.timers.pop().expect("peeked timer");
                    inner.queue.push_back(entry.envelope);
                }

                if let Some(envelope) = inner.queue.pop_front() {
                    break envelope;
                }

                match inner.timers.peek().map(|entry| entry.due) {
                    Some(due) => {
                        shared.cond.wait_until(&mut inner, due);
                    }
                    None => shared.cond.wait(&mut inner),
                }
            }
        };

        match envelope {
            Envelope::Quit => break,
            Envelope::Run { run, unique } => {
                if let Some((tag, gen)) = unique {
                    let current = shared.inner.lock().unique_gens.get(&tag).copied();
                    if current != Some(gen) {
                        trace!(
                            "Worker '{}' skipping superseded unique message '{}'",
                            shared.name,
                            tag
                        );
                        continue;
                    }
                }
                run(&mut state);
            }
        }
    }

    {
        let mut inner = shared.inner.lock();
        inner.state = WorkerState::Stopped;
        inner.open = false;
        inner.queue.clear();
        inner.timers.clear();
        inner.unique_gens.clear();
    }
    info!("Worker '{}' stopped", shared.name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;

    fn snapshot(mailbox: &Mailbox<Vec<u32>>) -> Vec<u32> {
        let (tx, rx) = channel::bounded(1);
        assert!(mailbox.post(move |state| {
            let _ = tx.send(state.clone());
        }));
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    fn spawn_vec_worker() -> Worker<Vec<u32>> {
        let worker = Worker::new("test-worker", |_| Vec::new());
        worker.start().unwrap();
        worker
    }

    #[test]
    fn messages_run_in_fifo_order() {
        let worker = spawn_vec_worker();
        let mailbox = worker.mailbox();

        for i in 1..=5u32 {
            assert!(mailbox.post(move |state| state.push(i)));
        }

        assert_eq!(snapshot(&mailbox), vec![1, 2, 3, 4, 5]);
        worker.release();
        assert!(worker.join_timeout(Duration::from_secs(5)));
    }

    #[test]
    fn delayed_messages_fire_after_immediate_ones() {
        let worker = spawn_vec_worker();
        let mailbox = worker.mailbox();

        assert!(mailbox.post_delayed(Duration::from_millis(50), |state| state.push(2)));
        assert!(mailbox.post(|state| state.push(1)));

        thread::sleep(Duration::from_millis(200));
        assert_eq!(snapshot(&mailbox), vec![1, 2]);
        worker.release();
        assert!(worker.join_timeout(Duration::from_secs(5)));
    }

    #[test]
    fn delayed_messages_fire_in_due_order() {
        let worker = spawn_vec_worker();
        let mailbox = worker.mailbox();

        assert!(mailbox.post_delayed(Duration::from_millis(80), |state| state.push(2)));
        assert!(mailbox.post_delayed(Duration::from_millis(20), |state| state.push(1)));

        thread::sleep(Duration::from_millis(300));
        assert_eq!(snapshot(&mailbox), vec![1, 2]);
        worker.release();
        assert!(worker.join_timeout(Duration::from_secs(5)));
    }

    #[test]
    fn unique_messages_coalesce_to_the_newest() {
        let worker = spawn_vec_worker();
        let mailbox = worker.mailbox();

        assert!(mailbox.post_unique("hide", Some(Duration::from_millis(40)), |state| {
            state.push(1)
        }));
        assert!(mailbox.post_unique("hide", Some(Duration::from_millis(40)), |state| {
            state.push(2)
        }));

        thread::sleep(Duration::from_millis(250));
        assert_eq!(snapshot(&mailbox), vec![2]);
        worker.release();
        assert!(worker.join_timeout(Duration::from_secs(5)));
    }

    #[test]
    fn post_before_start_is_dropped() {
        let worker: Worker<Vec<u32>> = Worker::new("unstarted", |_| Vec::new());
        assert!(!worker.mailbox().post(|state| state.push(1)));
        worker.release();
        assert!(worker.join_timeout(Duration::from_secs(5)));
    }

    #[test]
    fn post_after_release_is_dropped() {
        let worker = spawn_vec_worker();
        let mailbox = worker.mailbox();

        worker.release();
        assert!(!mailbox.post(|state| state.push(1)));
        assert!(worker.join_timeout(Duration::from_secs(5)));
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[test]
    fn release_is_idempotent() {
        let worker = spawn_vec_worker();
        worker.release();
        worker.release();
        worker.release();
        assert!(worker.join_timeout(Duration::from_secs(5)));
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[test]
    fn release_of_never_started_worker_joins_cleanly() {
        let worker: Worker<Vec<u32>> = Worker::new("never-started", |_| Vec::new());
        worker.release();
        assert!(worker.join_timeout(Duration::from_secs(5)));
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[test]
    fn queued_messages_run_before_quit() {
        let worker = spawn_vec_worker();
        let mailbox = worker.mailbox();
        let (tx, rx) = channel::bounded(1);

        assert!(mailbox.post(move |state| {
            state.push(1);
            let _ = tx.send(state.clone());
        }));
        worker.release();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), vec![1]);
        assert!(worker.join_timeout(Duration::from_secs(5)));
    }

    #[test]
    #[should_panic(expected = "started twice")]
    fn double_start_panics() {
        let worker: Worker<Vec<u32>> = Worker::new("double", |_| Vec::new());
        worker.start().unwrap();
        let _ = worker.start();
    }

    #[test]
    fn verify_access_accepts_worker_thread_and_rejects_others() {
        let worker = spawn_vec_worker();
        let mailbox = worker.mailbox();

        let (tx, rx) = channel::bounded(1);
        let mailbox_inner = mailbox.clone();
        assert!(mailbox.post(move |_| {
            mailbox_inner.verify_access();
            assert!(mailbox_inner.is_current());
            let _ = tx.send(());
        }));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let mailbox_foreign = mailbox.clone();
        let result = thread::spawn(move || mailbox_foreign.verify_access()).join();
        assert!(result.is_err());
        assert!(!mailbox.is_current());

        worker.release();
        assert!(worker.join_timeout(Duration::from_secs(5)));
    }
}
