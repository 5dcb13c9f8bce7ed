//! Reactive nodes.
//!
//! Every piece of reactive state in this crate — a [`Signal`](crate::Signal), a
//! [`Computed`](crate::Computed), an [`Effect`](crate::effects::Effect), an
//! [`AsyncEffect`](crate::effects::AsyncEffect), a [`Scope`](crate::scope::Scope) — is backed by
//! one [`ReactiveNode`] living in the thread-local [`Root`]'s arena. Representing the cyclic
//! signal/effect membership as indices into a single arena (rather than `Rc`/`Weak` pointers
//! chasing each other) lets dispose remove both directions of an edge without untangling a
//! reference cycle.

use std::any::Any;
use std::rc::Rc;

use slotmap::new_key_type;

use crate::root::unsend_payload;
use crate::Root;

new_key_type! {
    pub struct NodeId;
}

/// What kind of reactive node this is. Every node shares the same arena slot shape (dependency
/// lists, cleanups, children); only the kind changes how reads, writes, and notifications behave.
pub(crate) enum NodeKind {
    /// A plain writable cell. Carries no callback; `value` is authoritative.
    Signal,
    /// A lazily-recomputed derivation. `callback` recomputes `value` from the node's current
    /// dependencies; `dirty` tracks whether `value` is stale. The node that actually subscribes
    /// to the computed's own dependencies is a separate invalidator effect, stored as this node's
    /// sole child (see [`crate::memos`]).
    Computed { dirty: bool },
    /// A scheduled side-effecting subscriber. `sync` effects (computed invalidators) run inline
    /// from `notify`; all others are handed to the [`crate::scheduler::Scheduler`].
    Effect { sync: bool, pending: bool },
    /// A pure lifetime container with no value of its own: a [`crate::scope::Scope`].
    Scope,
}

/// A reactive node inside the reactive graph.
/// The recompute/run callback stored on a node. Effects and computeds have different call
/// signatures (an effect runs for side effects only; a computed produces a new boxed value) so
/// this is a small tagged union rather than a single `dyn Fn` shape.
pub(crate) enum NodeCallback {
    Effect(Box<dyn FnMut()>),
    Compute(Box<dyn FnMut() -> Box<dyn Any>>),
}

pub(crate) struct ReactiveNode {
    pub kind: NodeKind,
    /// Value of the node, if any. Signals and computeds have one once initialized; effects and
    /// scopes never do.
    pub value: Option<Box<dyn Any>>,
    /// Recompute/run callback; see [`NodeCallback`].
    pub callback: Option<NodeCallback>,
    /// A stable, cloneable handle used by the scheduler to dedup pending effect runs by identity.
    /// Only ever `Some` for `Effect` nodes.
    pub runner: Option<Rc<dyn Fn()>>,
    /// Nodes owned by this node (disposed, in order, when this node is disposed).
    pub children: Vec<NodeId>,
    /// The node that owns this node, i.e. disposes it. The null key for the implicit root scope.
    pub parent: NodeId,
    /// The scope this node was *lexically* created under, used only by the signal-read
    /// scope-guard. `None` for computed invalidators, which are scope-independent by design.
    /// Distinct from `parent`, which is about disposal ordering, not dependency tracking.
    pub owning_scope: Option<NodeId>,
    /// Nodes that depend on this node's value (this node's subscribers).
    pub dependents: Vec<NodeId>,
    /// Nodes this node depends on (rebuilt on every run/recompute).
    pub dependencies: Vec<NodeId>,
    /// Manual, non-scheduler subscribers registered via `ReadSignal::on`. Invoked directly from
    /// the notification fan-out, keyed by a monotonic id for idempotent unsubscribe.
    pub manual_subscribers: Vec<(u64, Rc<dyn Fn()>)>,
    /// Callbacks called, in FIFO order, when this node is disposed.
    pub cleanups: Vec<Box<dyn FnOnce()>>,
    #[cfg(debug_assertions)]
    pub created_at: &'static std::panic::Location<'static>,
}

impl ReactiveNode {
    pub fn new(kind: NodeKind, parent: NodeId, owning_scope: Option<NodeId>) -> Self {
        Self {
            kind,
            value: None,
            callback: None,
            runner: None,
            children: Vec::new(),
            parent,
            owning_scope,
            dependents: Vec::new(),
            dependencies: Vec::new(),
            manual_subscribers: Vec::new(),
            cleanups: Vec::new(),
            #[cfg(debug_assertions)]
            created_at: std::panic::Location::caller(),
        }
    }
}

/// An owning handle to a node, usable to dispose it directly. Returned by `create_scope` and by
/// the `dispose` handles of `effect`/`effect_async`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle(pub(crate) NodeId);

impl NodeId {
    /// Disposes this node: runs its cleanups (FIFO), recursively disposes its children, tears down
    /// its dependency/dependent links, forgets any pending scheduler entry, and removes it from
    /// the arena. Idempotent — disposing an already-disposed or never-inserted id is a no-op.
    pub(crate) fn dispose(self) {
        let root = Root::global();
        if !root.nodes.borrow().contains_key(self) {
            return;
        }
        root.notify_disposed(self);
        self.dispose_children_and_cleanups();
        let (dependencies, dependents) = {
            let mut nodes = root.nodes.borrow_mut();
            let node = &mut nodes[self];
            (
                std::mem::take(&mut node.dependencies),
                std::mem::take(&mut node.dependents),
            )
        };
        for dep in dependencies {
            if let Some(node) = root.nodes.borrow_mut().get_mut(dep) {
                node.dependents.retain(|&id| id != self);
            }
        }
        for dependent in dependents {
            if let Some(node) = root.nodes.borrow_mut().get_mut(dependent) {
                node.dependencies.retain(|&id| id != self);
            }
        }
        root.scheduler.forget(self);
        root.nodes.borrow_mut().remove(self);
    }

    /// Runs cleanups and disposes children, but leaves `self` in the arena. Used both as the first
    /// step of [`dispose`](Self::dispose) and before rerunning an effect or computed invalidator
    /// (to tear down anything the previous run allocated).
    ///
    /// Each cleanup's panic is caught and isolated (spec.md §4.2/§7: "all cleanups run even if one
    /// throws"); every caught message is collected and surfaced in one aggregate report at the end,
    /// rather than per-cleanup, per spec.md §7's "collected per-scope and surfaced in aggregate".
    pub(crate) fn dispose_children_and_cleanups(self) {
        let root = Root::global();
        let (cleanups, children) = {
            let mut nodes = root.nodes.borrow_mut();
            let Some(node) = nodes.get_mut(self) else {
                return;
            };
            (
                std::mem::take(&mut node.cleanups),
                std::mem::take(&mut node.children),
            )
        };
        for child in children {
            child.dispose();
        }
        let mut errors = Vec::new();
        for cleanup in cleanups {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                crate::root::untrack_in_scope(cleanup, root)
            }));
            if let Err(payload) = result {
                errors.push(crate::error::payload_message(&*unsend_payload(payload)));
            }
        }
        crate::error::report_scope_cleanup_errors(&errors);
    }
}

impl NodeHandle {
    /// Disposes the node this handle refers to. See [`NodeId::dispose`].
    pub fn dispose(self) {
        self.0.dispose();
    }

    /// Returns `true` if the node this handle refers to has not yet been disposed.
    pub fn is_alive(self) -> bool {
        Root::global().nodes.borrow().contains_key(self.0)
    }
}
