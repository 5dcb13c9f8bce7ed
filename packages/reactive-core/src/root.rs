//! [`Root`]: the thread-local arena and tracking state shared by every reactive primitive.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};

use slotmap::{Key, SlotMap};
use smallvec::SmallVec;

use crate::error::{self, ErrorSource};
use crate::node::{NodeCallback, NodeKind};
use crate::scheduler::Scheduler;
use crate::*;

/// The struct managing the state of the reactive system. Only one should be created per running
/// app; in practice this is always `Root::global()`, a `'static` reference obtained by leaking a
/// single instance per thread the first time it's needed.
pub(crate) struct Root {
    /// If this is `Some`, we are tracking signal/computed accesses for whatever node is currently
    /// `active_effect`.
    pub tracker: RefCell<Option<DependencyTracker>>,
    /// The node new children are parented under (disposal tree, not tracking).
    pub current_owner: Cell<NodeId>,
    /// The node currently executing a tracked body (an `Effect` or a computed's invalidator).
    /// `None` outside of any effect/computed run.
    pub active_effect: Cell<Option<NodeId>>,
    /// The scope compared against an effect's `owning_scope` by the read-time scope guard. Equal
    /// to `Some(current_owner)` in the common case; forced to `None` while a computed's
    /// invalidator is recomputing (spec: a computed's dependency edges are its own, independent
    /// of whoever is reading it).
    pub active_scope: Cell<Option<NodeId>>,
    /// The root scope node of this root.
    pub root_node: Cell<NodeId>,
    /// All nodes created in this root.
    pub nodes: RefCell<SlotMap<NodeId, ReactiveNode>>,
    pub scheduler: Scheduler,
    /// Monotonic id source for `Signal::on`'s unsubscribe handles.
    next_subscriber_id: Cell<u64>,
    /// Devtools-style listeners for scope lifecycle events. See `scope::on_scope_created`.
    pub(crate) scope_created_listeners: RefCell<Vec<Box<dyn Fn(NodeId)>>>,
    pub(crate) scope_disposed_listeners: RefCell<Vec<Box<dyn Fn(NodeId)>>>,
}

thread_local! {
    static GLOBAL_ROOT: Cell<Option<&'static Root>> = const { Cell::new(None) };
}

impl Root {
    /// Get the current reactive root, creating and leaking one for this thread on first access.
    pub fn global() -> &'static Root {
        GLOBAL_ROOT.with(|cell| {
            if let Some(root) = cell.get() {
                return root;
            }
            let root = Root::new_static();
            cell.set(Some(root));
            root
        })
    }

    pub(crate) fn new_static() -> &'static Self {
        let this = Self {
            tracker: RefCell::new(None),
            current_owner: Cell::new(NodeId::null()),
            active_effect: Cell::new(None),
            active_scope: Cell::new(None),
            root_node: Cell::new(NodeId::null()),
            nodes: RefCell::new(SlotMap::default()),
            scheduler: Scheduler::new(),
            next_subscriber_id: Cell::new(0),
            scope_created_listeners: RefCell::new(Vec::new()),
            scope_disposed_listeners: RefCell::new(Vec::new()),
        };
        let this = Box::leak(Box::new(this));
        let root_node = this.nodes.borrow_mut().insert(ReactiveNode::new(
            NodeKind::Scope,
            NodeId::null(),
            None,
        ));
        this.root_node.set(root_node);
        this.current_owner.set(root_node);
        this.active_scope.set(Some(root_node));
        this
    }

    pub fn next_subscriber_id(&self) -> u64 {
        let id = self.next_subscriber_id.get();
        self.next_subscriber_id.set(id + 1);
        id
    }

    /// Run the provided closure in a tracked scope, recording every signal/computed accessed
    /// inside it.
    pub fn tracked_scope<T>(&self, f: impl FnOnce() -> T) -> (T, DependencyTracker) {
        let prev = self.tracker.replace(Some(DependencyTracker::default()));
        let ret = f();
        (ret, self.tracker.replace(prev).unwrap())
    }

    /// Records a read of `node` against the currently active effect, subject to the scope guard:
    /// subscribe only if there is an active effect, tracking is not suppressed, and either the
    /// active effect has no owning scope or its owning scope matches the current scope at call
    /// time.
    pub(crate) fn track(&self, node: NodeId) {
        let Some(active_effect) = self.active_effect.get() else {
            return;
        };
        let mut tracker = self.tracker.borrow_mut();
        let Some(tracker) = tracker.as_mut() else {
            return;
        };
        let owning_scope = self
            .nodes
            .borrow()
            .get(active_effect)
            .and_then(|n| n.owning_scope);
        let allowed = match owning_scope {
            None => true,
            Some(scope) => Some(scope) == self.active_scope.get(),
        };
        if allowed && !tracker.dependencies.contains(&node) {
            tracker.dependencies.push(node);
        }
    }

    /// Notifies `node`'s dependents that `node` changed: sync effects (computed invalidators) run
    /// immediately and may cascade further notifications; non-sync effects are handed to the
    /// scheduler; manual (`on`) subscribers are always invoked inline.
    pub(crate) fn notify(&'static self, node: NodeId) {
        let dependents = self
            .nodes
            .borrow()
            .get(node)
            .map(|n| n.dependents.clone())
            .unwrap_or_default();
        for dependent in dependents {
            let Some(kind_is_sync) = self
                .nodes
                .borrow()
                .get(dependent)
                .and_then(|n| match &n.kind {
                    NodeKind::Effect { sync, .. } => Some(*sync),
                    _ => None,
                })
            else {
                continue;
            };
            if kind_is_sync {
                self.invoke_sync(dependent);
            } else {
                self.schedule_effect(dependent);
            }
        }
        let manual = self
            .nodes
            .borrow()
            .get(node)
            .map(|n| n.manual_subscribers.clone())
            .unwrap_or_default();
        for (_, callback) in manual {
            callback();
        }
    }

    /// Directly invokes a sync effect's callback (used for computed invalidators) without tearing
    /// down/rebuilding its own dependency edges — that only happens during the owning computed's
    /// recompute.
    fn invoke_sync(&'static self, node: NodeId) {
        let callback = self
            .nodes
            .borrow_mut()
            .get_mut(node)
            .and_then(|n| n.callback.take());
        let Some(NodeCallback::Effect(mut callback)) = callback else {
            return;
        };
        callback();
        if let Some(n) = self.nodes.borrow_mut().get_mut(node) {
            n.callback = Some(NodeCallback::Effect(callback));
        }
    }

    /// Marks an effect pending and schedules it, deduping against a run already pending this
    /// tick, then drains the microtask queue if we're not inside a batch or an ongoing drain.
    pub(crate) fn schedule_effect(&'static self, node: NodeId) {
        let already_pending = {
            let mut nodes = self.nodes.borrow_mut();
            match nodes.get_mut(node) {
                Some(n) => match &mut n.kind {
                    NodeKind::Effect { pending, .. } => {
                        let was = *pending;
                        *pending = true;
                        was
                    }
                    _ => return,
                },
                None => return,
            }
        };
        if !already_pending {
            self.scheduler.schedule(node);
        }
        self.scheduler.drain_if_idle(self);
    }

    /// Runs a scheduled effect: tears down its previous dependency edges and children, reruns its
    /// body under tracking, catching and reporting any panic.
    pub(crate) fn run_scheduled_effect(&'static self, node: NodeId) {
        if !self.nodes.borrow().contains_key(node) {
            return;
        }
        if let Some(n) = self.nodes.borrow_mut().get_mut(node) {
            if let NodeKind::Effect { pending, .. } = &mut n.kind {
                *pending = false;
            }
        }
        node.dispose_children_and_cleanups();
        let callback = self
            .nodes
            .borrow_mut()
            .get_mut(node)
            .and_then(|n| n.callback.take());
        let Some(NodeCallback::Effect(mut callback)) = callback else {
            return;
        };
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.run_tracked(node, None, || callback())
        }));
        if let Some(n) = self.nodes.borrow_mut().get_mut(node) {
            n.callback = Some(NodeCallback::Effect(callback));
        }
        if let Err(payload) = result {
            error::report(error::EffectError::from_payload(
                unsend_payload(payload),
                ErrorSource::Effect,
            ));
        }
    }

    /// Runs `body` with `tracked_node` set as the active effect (so reads inside `body` subscribe
    /// it), tearing down and rebuilding `tracked_node`'s own dependency edges. `scope_override`
    /// forces the scope-guard's `active_scope`; `None` means "use `tracked_node`'s own
    /// `owning_scope`" (the common case for a real effect), while `Some(None)` forces the guard
    /// open regardless of caller scope (used by computed recompute).
    pub(crate) fn run_tracked<R>(
        &'static self,
        tracked_node: NodeId,
        scope_override: Option<Option<NodeId>>,
        body: impl FnOnce() -> R,
    ) -> R {
        let old_deps = self
            .nodes
            .borrow_mut()
            .get_mut(tracked_node)
            .map(|n| std::mem::take(&mut n.dependencies))
            .unwrap_or_default();
        for dep in old_deps {
            if let Some(n) = self.nodes.borrow_mut().get_mut(dep) {
                n.dependents.retain(|&id| id != tracked_node);
            }
        }

        let prev_effect = self.active_effect.replace(Some(tracked_node));
        let scope_for_guard = match scope_override {
            Some(explicit) => explicit,
            None => self
                .nodes
                .borrow()
                .get(tracked_node)
                .and_then(|n| n.owning_scope),
        };
        let prev_scope = self.active_scope.replace(scope_for_guard);
        let prev_owner = self.current_owner.replace(tracked_node);

        let (result, tracker) = self.tracked_scope(body);

        self.current_owner.set(prev_owner);
        self.active_scope.set(prev_scope);
        self.active_effect.set(prev_effect);

        tracker.create_dependency_link(self, tracked_node);
        result
    }

    pub(crate) fn notify_disposed(&self, node: NodeId) {
        if self.nodes.borrow().get(node).map(|n| matches!(n.kind, NodeKind::Scope)) == Some(true) {
            for listener in self.scope_disposed_listeners.borrow().iter() {
                listener(node);
            }
        }
    }
}

/// Turns a caught panic payload (which may not be `Send`) into a `Send` payload suitable for
/// `EffectError`. Panics inside this single-threaded graph never cross threads, so this just
/// narrows the type; see `catch_unwind`'s signature.
pub(crate) fn unsend_payload(payload: Box<dyn Any>) -> Box<dyn Any + Send> {
    struct ForceSend(Box<dyn Any>);
    unsafe impl Send for ForceSend {}
    let wrapped = ForceSend(payload);
    Box::new(wrapped.0) as Box<dyn Any> as Box<dyn Any + Send>
}

/// A handle to a root. Obtained from [`create_root`]; lets you dispose everything created inside
/// it for deterministic cleanup (mainly useful in tests).
#[derive(Clone, Copy)]
pub struct RootHandle {
    root: &'static Root,
}

impl RootHandle {
    /// Disposes every node created inside this root's closure.
    pub fn dispose(&self) {
        NodeHandle(self.root.root_node.get()).dispose();
    }

    /// Runs the closure with this root as the thread's current root.
    pub fn run_in<T>(&self, f: impl FnOnce() -> T) -> T {
        GLOBAL_ROOT.with(|cell| {
            let prev = cell.replace(Some(self.root));
            let ret = f();
            cell.set(prev);
            ret
        })
    }
}

/// Tracks nodes read inside a [`Root::tracked_scope`] call.
#[derive(Default)]
pub(crate) struct DependencyTracker {
    pub dependencies: SmallVec<[NodeId; 4]>,
}

impl DependencyTracker {
    /// Links every tracked node as a dependency of `dependent`, and `dependent` as a dependent of
    /// every tracked node.
    pub fn create_dependency_link(self, root: &Root, dependent: NodeId) {
        for &node in &self.dependencies {
            if let Some(n) = root.nodes.borrow_mut().get_mut(node) {
                n.dependents.push(dependent);
            }
        }
        if let Some(n) = root.nodes.borrow_mut().get_mut(dependent) {
            n.dependencies = self.dependencies.into_vec();
        }
    }
}

/// Creates a fresh, isolated reactive root and runs `f` inside it. The returned [`RootHandle`] can
/// dispose everything created inside `f` (and anything created later while `f`'s scope is current).
///
/// Most applications only ever need the implicit per-thread root (lazily created by
/// [`Root::global`]); `create_root` exists for tests and for embedding multiple independent
/// reactive graphs in one process.
#[must_use = "root should be disposed"]
pub fn create_root(f: impl FnOnce()) -> RootHandle {
    let root = Root::new_static();
    GLOBAL_ROOT.with(|cell| {
        let prev = cell.replace(Some(root));
        f();
        cell.set(prev);
    });
    RootHandle { root }
}

/// Runs `f` with `f`'s own cleanup-only scope region. Prefer [`crate::scope::create_scope`] for
/// anything that needs an addressable, disposable handle; this is the primitive scopes are built
/// from.
pub(crate) fn create_child_scope(f: impl FnOnce()) -> NodeId {
    let root = Root::global();
    let parent = root.current_owner.get();
    let node = root.nodes.borrow_mut().insert(ReactiveNode::new(
        NodeKind::Scope,
        parent,
        Some(parent),
    ));
    if !parent.is_null() {
        root.nodes.borrow_mut()[parent].children.push(node);
    }
    for listener in root.scope_created_listeners.borrow().iter() {
        listener(node);
    }
    let prev_owner = root.current_owner.replace(node);
    let prev_scope = root.active_scope.replace(Some(node));
    f();
    root.active_scope.set(prev_scope);
    root.current_owner.set(prev_owner);
    node
}

/// Registers `f` to run when the current scope is disposed. A no-op if there is no current scope
/// (i.e. called outside any `create_root`/`create_scope`, which should not normally happen since
/// `Root::global()` always has an implicit root scope current).
pub fn on_cleanup(f: impl FnOnce() + 'static) {
    let root = Root::global();
    let current = root.current_owner.get();
    if !current.is_null() {
        if let Some(n) = root.nodes.borrow_mut().get_mut(current) {
            n.cleanups.push(Box::new(f));
        }
    }
}

/// Batches signal writes: notifications are deduped and deferred until the outermost `batch` call
/// returns, then flushed in one pass. Nested batches are supported; only the outermost flushes.
///
/// ```
/// # use reactive_core::*;
/// # let _ = create_root(|| {
/// let state = create_signal(1);
/// let runs = create_signal(0);
/// create_effect(move || {
///     state.get();
///     runs.update_silent(|c| *c += 1);
/// });
/// batch(move || {
///     state.set(2);
///     state.set(3);
/// }); // both writes notify synchronously, but the effect rerun is deferred and deduped
/// # });
/// ```
pub fn batch<T>(f: impl FnOnce() -> T) -> T {
    let root = Root::global();
    root.scheduler.start_batch();
    let ret = f();
    root.scheduler.end_batch(root);
    ret
}

/// Runs `f` without tracking any signal/computed reads performed inside it.
pub fn untrack<T>(f: impl FnOnce() -> T) -> T {
    untrack_in_scope(f, Root::global())
}

pub(crate) fn untrack_in_scope<T>(f: impl FnOnce() -> T, root: &'static Root) -> T {
    let prev = root.tracker.replace(None);
    let ret = f();
    root.tracker.replace(prev);
    ret
}

/// Returns a handle to the currently active scope (the scope new nodes are being parented under).
pub fn use_current_scope() -> NodeHandle {
    NodeHandle(Root::global().current_owner.get())
}

/// Returns a handle to the implicit root scope of the current thread's reactive root.
pub fn use_global_scope() -> NodeHandle {
    NodeHandle(Root::global().root_node.get())
}
