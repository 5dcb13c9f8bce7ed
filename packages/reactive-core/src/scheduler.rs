//! Microtask/frame queues and batching.
//!
//! A plain dependency-graph write could walk its dependents with a DFS and recompute everything
//! inline, in the same call stack, before `set`/`update` returns. This crate's effects are
//! scheduled instead of run inline (only a computed's internal invalidator
//! still runs synchronously — see [`crate::memos`]), so something has to own the pending queue,
//! the dedup-by-identity bookkeeping, and the batch boundary. There is no real JS-style event loop
//! to hand tasks to, so "the next microtask turn" is modeled the way a single-threaded synchronous
//! library can actually guarantee it: a drain happens once, automatically, when the outermost
//! reactive call (a write, or scheduling a freshly-created effect) returns, and every write that
//! happens before that point — directly or via a cascade of other effects running during the
//! drain — is coalesced into that same pass. `run_frame_tasks` additionally exposes an explicit
//! hook for hosts with a real frame clock (e.g. a windowing event loop) to drive `schedule_frame`
//! work on their own cadence.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::{NodeId, Root};

/// Tunable limits for the scheduler's drain loops. See [`Scheduler::configure`].
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Maximum number of microtask drain iterations before giving up and logging. Guards against
    /// runaway effect chains (an effect that keeps scheduling more work every time it runs).
    pub max_microtask_iterations: u32,
    /// Maximum number of frame-queue drain iterations per [`run_frame_tasks`] call.
    pub max_raf_iterations: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_microtask_iterations: 1000,
            max_raf_iterations: 100,
        }
    }
}

pub(crate) struct Scheduler {
    microtasks: RefCell<Vec<NodeId>>,
    batch_queue: RefCell<Vec<NodeId>>,
    /// Generic (non-node) tasks queued via [`schedule_microtask`]/[`queue_in_batch`], e.g. a host
    /// collaborator's own callback rather than an effect node. Drained in the same pass as
    /// `microtasks`.
    tasks: RefCell<Vec<Rc<dyn Fn()>>>,
    batch_tasks: RefCell<Vec<Rc<dyn Fn()>>>,
    frame_tasks: RefCell<Vec<Box<dyn FnOnce()>>>,
    batch_depth: Cell<u32>,
    draining: Cell<bool>,
    config: Cell<SchedulerConfig>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            microtasks: RefCell::new(Vec::new()),
            batch_queue: RefCell::new(Vec::new()),
            tasks: RefCell::new(Vec::new()),
            batch_tasks: RefCell::new(Vec::new()),
            frame_tasks: RefCell::new(Vec::new()),
            batch_depth: Cell::new(0),
            draining: Cell::new(false),
            config: Cell::new(SchedulerConfig::default()),
        }
    }

    pub fn configure(&self, config: SchedulerConfig) {
        self.config.set(config);
    }

    pub fn is_batching(&self) -> bool {
        self.batch_depth.get() > 0
    }

    pub fn is_draining(&self) -> bool {
        self.draining.get()
    }

    /// Schedules an effect node to run, deduping against any pending run for the same node (the
    /// node's own `pending` flag is the dedup key, checked/set by the caller before this is
    /// invoked — see [`crate::root::Root::schedule_effect`]).
    pub fn schedule(&self, node: NodeId) {
        if self.is_batching() {
            self.batch_queue.borrow_mut().push(node);
        } else {
            self.microtasks.borrow_mut().push(node);
        }
    }

    pub fn schedule_frame(&self, task: impl FnOnce() + 'static) {
        self.frame_tasks.borrow_mut().push(Box::new(task));
    }

    /// Schedules a generic task for the next microtask drain, independent of `node`-based effect
    /// scheduling. No dedup: repeated calls with the same `Rc` run it repeatedly. See
    /// [`Self::queue_in_batch`] for the batch-aware, deduped variant.
    pub fn schedule_microtask(&self, task: Rc<dyn Fn()>) {
        self.tasks.borrow_mut().push(task);
    }

    /// If inside a batch, enqueues `task` into the batch queue, deduped by `Rc` pointer identity
    /// against anything already pending this batch; otherwise behaves like
    /// [`Self::schedule_microtask`] since there is no batch queue to join.
    pub fn queue_in_batch(&self, task: Rc<dyn Fn()>) {
        if self.is_batching() {
            let mut queue = self.batch_tasks.borrow_mut();
            if !queue.iter().any(|queued| Rc::ptr_eq(queued, &task)) {
                queue.push(task);
            }
        } else {
            self.tasks.borrow_mut().push(task);
        }
    }

    /// Removes a disposed node from any queue it might still be sitting in.
    pub fn forget(&self, node: NodeId) {
        self.microtasks.borrow_mut().retain(|&id| id != node);
        self.batch_queue.borrow_mut().retain(|&id| id != node);
    }

    pub fn start_batch(&self) {
        self.batch_depth.set(self.batch_depth.get() + 1);
    }

    /// Ends a batch. Only the outermost `end_batch` (depth reaching zero) moves the batch queues
    /// into the microtask queues and drains them.
    pub fn end_batch(&self, root: &'static Root) {
        let depth = self.batch_depth.get() - 1;
        self.batch_depth.set(depth);
        if depth == 0 {
            let pending = self.batch_queue.take();
            self.microtasks.borrow_mut().extend(pending);
            let pending_tasks = self.batch_tasks.take();
            self.tasks.borrow_mut().extend(pending_tasks);
            self.drain_if_idle(root);
        }
    }

    /// Drains the microtask queue if we're not already inside a drain and not batching. Called
    /// after every top-level notification; a no-op when called from inside a running effect (the
    /// enclosing drain loop's next iteration will pick up anything scheduled meanwhile).
    pub fn drain_if_idle(&self, root: &'static Root) {
        if self.is_batching() || self.is_draining() {
            return;
        }
        self.drain(root);
    }

    fn drain(&self, root: &'static Root) {
        self.draining.set(true);
        let max_iterations = self.config.get().max_microtask_iterations;
        let mut iterations = 0;
        loop {
            let nodes = self.microtasks.take();
            let tasks = self.tasks.take();
            if nodes.is_empty() && tasks.is_empty() {
                break;
            }
            iterations += 1;
            if iterations > max_iterations {
                #[cfg(feature = "trace")]
                tracing::warn!(
                    max_iterations,
                    "scheduler hit max_microtask_iterations; dropping remaining queue"
                );
                break;
            }
            for node in nodes {
                root.run_scheduled_effect(node);
            }
            for task in tasks {
                task();
            }
        }
        self.draining.set(false);
    }

    /// Drains up to `max_raf_iterations` frame-queue tasks. Hosts with a real frame clock (a
    /// windowing event loop, a `requestAnimationFrame` binding) call this once per frame; nothing
    /// in this crate calls it automatically.
    pub fn run_frame_tasks(&self) {
        let max_iterations = self.config.get().max_raf_iterations;
        let mut iterations = 0;
        loop {
            let batch = self.frame_tasks.take();
            if batch.is_empty() {
                break;
            }
            iterations += 1;
            if iterations > max_iterations {
                #[cfg(feature = "trace")]
                tracing::warn!(
                    max_iterations,
                    "scheduler hit max_raf_iterations; dropping remaining frame queue"
                );
                break;
            }
            for task in batch {
                task();
            }
        }
    }
}

/// Configures the scheduler's iteration caps. See [`SchedulerConfig`].
pub fn configure_scheduler(config: SchedulerConfig) {
    Root::global().scheduler.configure(config);
}

/// Returns `true` if called from inside a [`batch`](crate::batch) region.
pub fn is_batching() -> bool {
    Root::global().scheduler.is_batching()
}

/// Schedules a task onto the frame queue. See [`Scheduler::run_frame_tasks`].
pub fn schedule_frame(task: impl FnOnce() + 'static) {
    Root::global().scheduler.schedule_frame(task);
}

/// Runs every task currently in the frame queue (and any scheduled while draining it, up to the
/// configured cap). Call once per frame from a host event loop.
pub fn run_frame_tasks() {
    Root::global().scheduler.run_frame_tasks();
}

/// Schedules `task` to run on the next microtask drain. See the module docs for what "next
/// microtask turn" means here (there is no real event loop to hand it to).
pub fn schedule_microtask(task: Rc<dyn Fn()>) {
    Root::global().scheduler.schedule_microtask(task);
}

/// Enqueues `task` for the current batch if one is open, deduped by `Rc` pointer identity against
/// anything already pending in it; otherwise falls through to [`schedule_microtask`].
pub fn queue_in_batch(task: Rc<dyn Fn()>) {
    Root::global().scheduler.queue_in_batch(task);
}

/// Forces a microtask drain. Exposed only for tests: ordinary code never needs this since every
/// write/effect-schedule already drains automatically once it's not nested inside a batch or
/// another drain (see the module docs above) — by the time any of this crate's public functions
/// return, the microtask queue is already empty in non-batched use.
#[cfg(test)]
pub(crate) fn drain_microtasks_for_test() {
    let root = Root::global();
    root.scheduler.drain_if_idle(root);
}

/// A cooperative yield context handed to the callback passed to [`time_slice`].
pub struct TimeSliceContext<'a> {
    deadline: Instant,
    cancel_token: Option<&'a dyn Fn() -> bool>,
}

impl<'a> TimeSliceContext<'a> {
    /// Returns `true` once the time budget has elapsed or the cancel token has fired.
    pub fn should_yield(&self) -> bool {
        Instant::now() >= self.deadline || self.cancel_token.map(|f| f()).unwrap_or(false)
    }

    /// Cooperatively yields control back to the caller, via [`Scheduler::run_frame_tasks`]'s
    /// queue, then refreshes the deadline for the next slice. Intended to be called from inside a
    /// loop driven by [`time_slice`] once `should_yield` reports true.
    pub fn yield_now(&mut self, budget: Duration) {
        run_frame_tasks();
        self.deadline = Instant::now() + budget;
    }
}

/// Runs `f` with a [`TimeSliceContext`] exposing `should_yield`/`yield_now` bounded by `budget` and
/// an optional cancellation predicate. Useful for chunking expensive synchronous work (e.g. a
/// large list diff) without blocking the executor past `budget`.
pub fn time_slice<R>(
    budget: Duration,
    cancel_token: Option<&dyn Fn() -> bool>,
    f: impl FnOnce(&mut TimeSliceContext) -> R,
) -> R {
    let mut ctx = TimeSliceContext {
        deadline: Instant::now() + budget,
        cancel_token,
    };
    f(&mut ctx)
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use crate::*;

    #[test]
    fn schedule_microtask_runs_on_next_drain() {
        let _ = create_root(|| {
            let ran = create_signal(false);
            super::schedule_microtask(Rc::new(move || ran.set(true)));
            super::drain_microtasks_for_test();
            assert!(ran.get());
        });
    }

    #[test]
    fn queue_in_batch_dedups_by_identity_within_a_batch() {
        let _ = create_root(|| {
            let calls = create_signal(0);
            let task: Rc<dyn Fn()> = Rc::new(move || calls.update(|c| *c += 1));
            batch(|| {
                super::queue_in_batch(task.clone());
                super::queue_in_batch(task.clone());
                super::queue_in_batch(task.clone());
            });
            assert_eq!(calls.get(), 1);
        });
    }

    #[test]
    fn queue_in_batch_outside_a_batch_runs_every_call() {
        let _ = create_root(|| {
            let calls = create_signal(0);
            let task: Rc<dyn Fn()> = Rc::new(move || calls.update(|c| *c += 1));
            super::queue_in_batch(task.clone());
            super::queue_in_batch(task.clone());
            super::drain_microtasks_for_test();
            assert_eq!(calls.get(), 2);
        });
    }
}
