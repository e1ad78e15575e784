//! Dumb/smart mode coordination for background index work.
//!
//! While rebuild tasks are pending or running, the process is in "dumb
//! mode": index reads are stale or disallowed. The coordinator owns the
//! task queue, the equivalence-dedup set and the per-task cancellation
//! map (the only process-wide mutable structures in the core) behind a
//! single coarse mutex, since task arrival and dequeue are rare relative
//! to read traffic.
//!
//! State machine:
//!
//! ```text
//! Smart -> Scheduled -> Running -> WaitingToFinish -> Smart
//!             ^                          |
//!             +--------------------------+   (new tasks while waiting)
//! ```
//!
//! A dedicated worker thread executes queued tasks one at a time; it hands
//! completion back by retaking the same mutex, so the switch back to smart
//! happens at a well-defined point without any UI-thread rendezvous.
//! Entering dumb mode fires exactly one event per `Smart -> Scheduled`
//! transition, leaving fires one event per return to `Smart`.

use crate::cancel::CancelToken;
use crate::error::{Result, StrataError};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error, trace};

/// Coordinator mode. Every value except `Smart` counts as dumb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Indexes are consistent and queryable
    Smart,

    /// Work is queued, background execution has not started yet
    Scheduled,

    /// The worker is executing queued tasks
    Running,

    /// The queue drained; waiting for the switch back to smart
    WaitingToFinish,
}

/// Mode transition notifications delivered to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeEvent {
    EnteredDumbMode,
    ExitedDumbMode,
}

/// A unit of background index work.
pub trait DumbTask: Send + 'static {
    /// Tasks with equal keys queued while an equal task is still pending
    /// are dropped, not executed twice.
    fn equivalence_key(&self) -> String;

    /// Execute. The token is this task's own; cancelling it does not
    /// affect the rest of the queue.
    fn run(&mut self, cancel: &CancelToken) -> Result<()>;
}

/// [`DumbTask`] built from a closure.
pub struct ClosureTask {
    key: String,
    body: Option<Box<dyn FnOnce(&CancelToken) -> Result<()> + Send>>,
}

impl ClosureTask {
    pub fn new(
        key: impl Into<String>,
        body: impl FnOnce(&CancelToken) -> Result<()> + Send + 'static,
    ) -> Self {
        ClosureTask {
            key: key.into(),
            body: Some(Box::new(body)),
        }
    }
}

impl DumbTask for ClosureTask {
    fn equivalence_key(&self) -> String {
        self.key.clone()
    }

    fn run(&mut self, cancel: &CancelToken) -> Result<()> {
        match self.body.take() {
            Some(body) => body(cancel),
            None => Ok(()),
        }
    }
}

/// Handle to a queued task; owns its cancellation token.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: u64,
    cancel: CancelToken,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cancel this task only; the queue keeps going.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

struct QueuedTask {
    id: u64,
    equivalence: String,
    task: Box<dyn DumbTask>,
    cancel: CancelToken,
}

struct CoordState {
    mode: Mode,
    queue: VecDeque<QueuedTask>,
    equivalences: HashSet<String>,
    progresses: HashMap<u64, CancelToken>,
    run_when_smart: VecDeque<Box<dyn FnOnce() + Send>>,
    subscribers: Vec<Sender<ModeEvent>>,
    disposed: bool,
    next_task_id: u64,
}

impl CoordState {
    fn fire(&mut self, event: ModeEvent) {
        trace!(?event, "Mode event");
        self.subscribers.retain(|s| s.send(event).is_ok());
    }
}

struct Shared {
    state: Mutex<CoordState>,
    work_available: Condvar,
    smart_reached: Condvar,
}

/// Serializes background index mutation against concurrent read access.
pub struct ModeCoordinator {
    shared: Arc<Shared>,
    worker_thread: ThreadId,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ModeCoordinator {
    /// Create the coordinator and start its worker thread.
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(CoordState {
                mode: Mode::Smart,
                queue: VecDeque::new(),
                equivalences: HashSet::new(),
                progresses: HashMap::new(),
                run_when_smart: VecDeque::new(),
                subscribers: Vec::new(),
                disposed: false,
                next_task_id: 1,
            }),
            work_available: Condvar::new(),
            smart_reached: Condvar::new(),
        });

        let worker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("strata-indexer".to_string())
            .spawn(move || worker_loop(worker_shared))
            .expect("failed to spawn indexing worker");
        let worker_thread = handle.thread().id();

        ModeCoordinator {
            shared,
            worker_thread,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Current mode.
    pub fn mode(&self) -> Mode {
        self.shared.state.lock().mode
    }

    /// Is any dumb state active?
    pub fn is_dumb(&self) -> bool {
        self.mode() != Mode::Smart
    }

    pub fn is_smart(&self) -> bool {
        !self.is_dumb()
    }

    /// Queue a background task.
    ///
    /// Returns `None` when an equal task (by equivalence key) is already
    /// pending. Entering dumb mode from `Smart` fires exactly one
    /// [`ModeEvent::EnteredDumbMode`].
    pub fn queue_task(&self, task: Box<dyn DumbTask>) -> Result<Option<TaskHandle>> {
        let mut state = self.shared.state.lock();
        if state.disposed {
            return Err(StrataError::Disposed);
        }

        let equivalence = task.equivalence_key();
        if !state.equivalences.insert(equivalence.clone()) {
            debug!(key = %equivalence, "Dropping duplicate task");
            return Ok(None);
        }

        let id = state.next_task_id;
        state.next_task_id += 1;
        let cancel = CancelToken::new();
        state.progresses.insert(id, cancel.clone());
        state.queue.push_back(QueuedTask {
            id,
            equivalence,
            task,
            cancel: cancel.clone(),
        });

        match state.mode {
            Mode::Smart => {
                state.mode = Mode::Scheduled;
                state.fire(ModeEvent::EnteredDumbMode);
            }
            Mode::WaitingToFinish => {
                state.mode = Mode::Scheduled;
            }
            Mode::Scheduled | Mode::Running => {}
        }

        self.shared.work_available.notify_one();
        Ok(Some(TaskHandle { id, cancel }))
    }

    /// Cancel one queued or running task by id.
    pub fn cancel_task(&self, id: u64) {
        if let Some(token) = self.shared.state.lock().progresses.get(&id) {
            token.cancel();
        }
    }

    /// Run `callback` once the coordinator is smart: immediately if it
    /// already is, otherwise queued FIFO behind the current dumb phase.
    pub fn run_when_smart(&self, callback: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.shared.state.lock();
            if state.disposed {
                return;
            }
            if state.mode != Mode::Smart {
                state.run_when_smart.push_back(Box::new(callback));
                return;
            }
        }
        callback();
    }

    /// Block until the coordinator reaches `Smart`.
    ///
    /// Must not be called from the worker thread (it would wait on its
    /// own completion).
    pub fn wait_for_smart(&self) -> Result<()> {
        assert!(
            thread::current().id() != self.worker_thread,
            "wait_for_smart called from the indexing worker"
        );
        let mut state = self.shared.state.lock();
        while state.mode != Mode::Smart && !state.disposed {
            self.shared.smart_reached.wait(&mut state);
        }
        if state.disposed {
            Err(StrataError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Subscribe to mode transitions.
    pub fn subscribe(&self) -> Receiver<ModeEvent> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        self.shared.state.lock().subscribers.push(sender);
        receiver
    }

    /// Tear down: pending tasks are dropped without running, in-flight
    /// work is cancelled, and the worker thread exits.
    pub fn dispose(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.queue.clear();
            state.equivalences.clear();
            state.run_when_smart.clear();
            for token in state.progresses.values() {
                token.cancel();
            }
            state.progresses.clear();
        }
        self.shared.work_available.notify_all();
        self.shared.smart_reached.notify_all();

        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Default for ModeCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ModeCoordinator {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        // Wait for scheduled work.
        {
            let mut state = shared.state.lock();
            loop {
                if state.disposed {
                    return;
                }
                if state.mode == Mode::Scheduled && !state.queue.is_empty() {
                    break;
                }
                shared.work_available.wait(&mut state);
            }
            state.mode = Mode::Running;
        }

        // Drain the queue, executing outside the lock.
        loop {
            let next = {
                let mut state = shared.state.lock();
                if state.disposed {
                    return;
                }
                match state.queue.pop_front() {
                    Some(queued) => {
                        state.equivalences.remove(&queued.equivalence);
                        Some(queued)
                    }
                    None => {
                        state.mode = Mode::WaitingToFinish;
                        None
                    }
                }
            };
            let Some(mut queued) = next else { break };

            if queued.cancel.is_cancelled() {
                trace!(id = queued.id, "Skipping cancelled task");
                shared.state.lock().progresses.remove(&queued.id);
                continue;
            }

            let cancel = queued.cancel.clone();
            let outcome = catch_unwind(AssertUnwindSafe(|| queued.task.run(&cancel)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {
                    debug!(id = queued.id, "Task cancelled");
                }
                Ok(Err(e)) => {
                    error!(id = queued.id, error = %e, "Dumb task failed");
                }
                Err(_) => {
                    error!(id = queued.id, "Dumb task panicked");
                }
            }
            shared.state.lock().progresses.remove(&queued.id);
        }

        // Try to flip back to smart; new arrivals loop us back instead.
        {
            let mut state = shared.state.lock();
            if state.disposed {
                return;
            }
            if !state.queue.is_empty() {
                // queue_task already moved us to Scheduled.
                continue;
            }
            state.mode = Mode::Smart;
            state.fire(ModeEvent::ExitedDumbMode);
        }
        shared.smart_reached.notify_all();

        // Drain run-when-smart callbacks in order, stopping if one of
        // them re-enters dumb mode.
        loop {
            let callback = {
                let mut state = shared.state.lock();
                if state.mode != Mode::Smart || state.disposed {
                    break;
                }
                state.run_when_smart.pop_front()
            };
            let Some(callback) = callback else { break };
            if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                error!("run_when_smart callback panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_task(
        key: &str,
        counter: Arc<AtomicUsize>,
    ) -> Box<ClosureTask> {
        Box::new(ClosureTask::new(key, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
    }

    /// A task that blocks until released (or cancelled), letting tests
    /// pin the worker.
    fn gated_task(key: &str, gate: Receiver<()>) -> Box<ClosureTask> {
        Box::new(ClosureTask::new(key, move |cancel| {
            for _ in 0..500 {
                if cancel.is_cancelled() || gate.recv_timeout(Duration::from_millis(10)).is_ok() {
                    break;
                }
            }
            Ok(())
        }))
    }

    #[test]
    fn test_enter_exit_events_are_balanced() {
        let coordinator = ModeCoordinator::new();
        let events = coordinator.subscribe();

        let counter = Arc::new(AtomicUsize::new(0));
        coordinator
            .queue_task(counting_task("t1", counter.clone()))
            .unwrap()
            .unwrap();
        coordinator.wait_for_smart().unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(
            events.recv_timeout(Duration::from_secs(1)).unwrap(),
            ModeEvent::EnteredDumbMode
        );
        assert_eq!(
            events.recv_timeout(Duration::from_secs(1)).unwrap(),
            ModeEvent::ExitedDumbMode
        );

        // A second round fires exactly one more pair.
        coordinator
            .queue_task(counting_task("t2", counter.clone()))
            .unwrap()
            .unwrap();
        coordinator.wait_for_smart().unwrap();
        assert_eq!(
            events.recv_timeout(Duration::from_secs(1)).unwrap(),
            ModeEvent::EnteredDumbMode
        );
        assert_eq!(
            events.recv_timeout(Duration::from_secs(1)).unwrap(),
            ModeEvent::ExitedDumbMode
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_duplicate_equivalence_runs_once() {
        let coordinator = ModeCoordinator::new();
        let (release, gate) = bounded(1);

        // Pin the worker so the duplicates stay queued.
        coordinator.queue_task(gated_task("gate", gate)).unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let first = coordinator
            .queue_task(counting_task("dup", counter.clone()))
            .unwrap();
        let second = coordinator
            .queue_task(counting_task("dup", counter.clone()))
            .unwrap();
        assert!(first.is_some());
        assert!(second.is_none());

        release.send(()).unwrap();
        coordinator.wait_for_smart().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancelling_one_task_spares_the_queue() {
        let coordinator = ModeCoordinator::new();
        let (release, gate) = bounded(1);
        coordinator.queue_task(gated_task("gate", gate)).unwrap();

        let cancelled = Arc::new(AtomicUsize::new(0));
        let survivor = Arc::new(AtomicUsize::new(0));
        let handle = coordinator
            .queue_task(counting_task("a", cancelled.clone()))
            .unwrap()
            .unwrap();
        coordinator
            .queue_task(counting_task("b", survivor.clone()))
            .unwrap()
            .unwrap();

        handle.cancel();
        release.send(()).unwrap();
        coordinator.wait_for_smart().unwrap();

        assert_eq!(cancelled.load(Ordering::SeqCst), 0);
        assert_eq!(survivor.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_run_when_smart_immediate_and_deferred() {
        let coordinator = ModeCoordinator::new();

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        coordinator.run_when_smart(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        let (release, gate) = bounded(1);
        coordinator.queue_task(gated_task("gate", gate)).unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second", "third"] {
            let order = order.clone();
            coordinator.run_when_smart(move || {
                order.lock().push(label);
            });
        }

        release.send(()).unwrap();
        coordinator.wait_for_smart().unwrap();
        // Callbacks drain right after the exit event; give the worker a
        // moment to get through them.
        for _ in 0..50 {
            if order.lock().len() == 3 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(&*order.lock(), &["first", "second", "third"]);
    }

    #[test]
    fn test_panicking_callback_does_not_block_the_rest() {
        let coordinator = ModeCoordinator::new();
        let (release, gate) = bounded(1);
        coordinator.queue_task(gated_task("gate", gate)).unwrap();

        let survived = Arc::new(AtomicUsize::new(0));
        coordinator.run_when_smart(|| panic!("callback exploded"));
        let survived_clone = survived.clone();
        coordinator.run_when_smart(move || {
            survived_clone.fetch_add(1, Ordering::SeqCst);
        });

        release.send(()).unwrap();
        coordinator.wait_for_smart().unwrap();
        for _ in 0..50 {
            if survived.load(Ordering::SeqCst) == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(survived.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_tasks_queued_while_running_join_the_same_phase() {
        let coordinator = ModeCoordinator::new();
        let events = coordinator.subscribe();
        let (release, gate) = bounded(1);

        coordinator.queue_task(gated_task("gate", gate)).unwrap();
        // Wait until the worker picks it up.
        for _ in 0..50 {
            if coordinator.mode() == Mode::Running {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        let counter = Arc::new(AtomicUsize::new(0));
        coordinator
            .queue_task(counting_task("late", counter.clone()))
            .unwrap()
            .unwrap();

        release.send(()).unwrap();
        coordinator.wait_for_smart().unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        // One enter, one exit: the late task did not re-fire the enter.
        assert_eq!(
            events.recv_timeout(Duration::from_secs(1)).unwrap(),
            ModeEvent::EnteredDumbMode
        );
        assert_eq!(
            events.recv_timeout(Duration::from_secs(1)).unwrap(),
            ModeEvent::ExitedDumbMode
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_dispose_drops_pending_tasks() {
        let coordinator = ModeCoordinator::new();
        let (_release, gate) = bounded(1);
        coordinator.queue_task(gated_task("gate", gate)).unwrap();

        let never_ran = Arc::new(AtomicUsize::new(0));
        coordinator
            .queue_task(counting_task("pending", never_ran.clone()))
            .unwrap()
            .unwrap();

        // Dispose cancels the in-flight gate task and drops the pending
        // one without running it.
        coordinator.dispose();

        assert_eq!(never_ran.load(Ordering::SeqCst), 0);
        assert!(matches!(
            coordinator.queue_task(counting_task("after", never_ran.clone())),
            Err(StrataError::Disposed)
        ));
        assert!(matches!(
            coordinator.wait_for_smart(),
            Err(StrataError::Disposed)
        ));
    }
}
