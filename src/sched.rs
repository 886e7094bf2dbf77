//! Scheduler surface and wait primitives.
//!
//! The driver subsystem does not own threads; it consumes them from the
//! kernel scheduler through the [`Scheduler`] trait. What the drivers need
//! is small: spawn a named task (optionally pinned to a CPU), identify the
//! current CPU, and park/wake with one-shot token semantics.
//!
//! On top of that surface this module provides the two blocking shapes the
//! drivers use everywhere: [`wait_until`] (predicate loop immune to
//! spurious wakeups) and [`Condvar`] (a waiter queue tied to a
//! `spin::Mutex`, in the classic wait-until style).

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Mutex, MutexGuard};

/// A schedulable task handle.
///
/// `wake` must set a one-shot token: a wake delivered while the task is
/// running causes its next [`Scheduler::park`] to return immediately.
/// Multiple wakes coalesce into one token.
pub trait Task: Send + Sync {
    /// Wake the task (idempotent, callable from interrupt context).
    fn wake(&self);
    /// Request cancellation of the task's blocking waits.
    fn interrupt(&self);
    /// True once `interrupt` has been called.
    fn interrupted(&self) -> bool;
}

/// Shared handle to a task.
pub type TaskRef = Arc<dyn Task>;

/// The thread/scheduling surface the drivers consume.
///
/// Implementations must return a *stable* handle from `current`: calling
/// it twice on the same task yields pointer-identical `Arc`s, so waiter
/// bookkeeping can use `Arc::ptr_eq`.
pub trait Scheduler: Send + Sync {
    /// Handle for the calling task.
    fn current(&self) -> TaskRef;
    /// Block the calling task until its wake token is set; consumes the
    /// token. Returns immediately if the token is already set.
    fn park(&self);
    /// Spawn a task, optionally pinned to the given CPU.
    fn spawn(&self, name: &str, cpu: Option<usize>, body: Box<dyn FnOnce() + Send>) -> TaskRef;
    /// The CPU the calling task is currently running on.
    fn cpu_id(&self) -> usize;
    /// Number of CPUs available for queue-pair placement.
    fn cpu_count(&self) -> usize;
}

/// Shared handle to the scheduler.
pub type SchedRef = Arc<dyn Scheduler>;

/// Block until `pred()` returns true.
///
/// The predicate is re-evaluated after every wake, so spurious wakeups are
/// harmless. Returns `false` if the task was interrupted before the
/// predicate held.
pub fn wait_until<F: FnMut() -> bool>(sched: &dyn Scheduler, mut pred: F) -> bool {
    let me = sched.current();
    loop {
        if pred() {
            return true;
        }
        if me.interrupted() {
            return false;
        }
        sched.park();
    }
}

/// A condition queue for use with `spin::Mutex`-protected state.
///
/// Waiters register themselves *before* releasing the mutex, so a signal
/// sent by a lock holder can never be lost between the predicate check and
/// the park.
pub struct Condvar {
    waiters: Mutex<Vec<TaskRef>>,
}

impl Condvar {
    pub const fn new() -> Self {
        Condvar {
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Wait until `pred` holds on the protected value.
    ///
    /// Takes the already-held guard, releases it around each park, and
    /// returns the re-acquired guard once the predicate holds. Returns
    /// `None` if the task was interrupted first.
    pub fn wait_until<'a, T, F>(
        &self,
        sched: &dyn Scheduler,
        mtx: &'a Mutex<T>,
        mut guard: MutexGuard<'a, T>,
        mut pred: F,
    ) -> Option<MutexGuard<'a, T>>
    where
        F: FnMut(&mut T) -> bool,
    {
        let me = sched.current();
        loop {
            if pred(&mut guard) {
                self.remove(&me);
                return Some(guard);
            }
            if me.interrupted() {
                self.remove(&me);
                return None;
            }
            self.add(&me);
            drop(guard);
            sched.park();
            guard = mtx.lock();
        }
    }

    /// Wake a single waiter.
    pub fn wake_one(&self) {
        let task = self.waiters.lock().pop();
        if let Some(task) = task {
            task.wake();
        }
    }

    /// Wake every waiter.
    pub fn wake_all(&self) {
        let drained: Vec<TaskRef> = {
            let mut waiters = self.waiters.lock();
            waiters.drain(..).collect()
        };
        for task in drained {
            task.wake();
        }
    }

    fn add(&self, task: &TaskRef) {
        let mut waiters = self.waiters.lock();
        if !waiters.iter().any(|w| Arc::ptr_eq(w, task)) {
            waiters.push(task.clone());
        }
    }

    fn remove(&self, task: &TaskRef) {
        self.waiters.lock().retain(|w| !Arc::ptr_eq(w, task));
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}
